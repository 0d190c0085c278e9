//! Bridge backend for desktop-file databases
//!
//! Descriptors naming a Jet/ACE provider are served by an external component
//! on hosts that have one. The host plugs it in as a [`BridgeProvider`]; the
//! Recordset then proxies every navigation call to the provider's
//! [`BridgeCursor`] and re-reads the current row on each stop.

use crate::config::BridgeMode;
use crate::core::Variant;
use crate::error::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    First,
    Last,
    Next,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    AddNew,
    Update,
    Delete,
    CancelUpdate,
}

/// Open options passed through to the external cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorOptions {
    pub cursor_type: i64,
    pub lock_type: i64,
    pub cursor_location: i64,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            cursor_type: 0,
            lock_type: 1,
            cursor_location: 2,
        }
    }
}

pub trait BridgeProvider: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, descriptor: &str) -> Result<Box<dyn BridgeConnection>>;
}

pub trait BridgeConnection: Send {
    /// Runs a statement; row-returning statements yield a cursor
    fn execute(&mut self, sql: &str) -> Result<Option<Box<dyn BridgeCursor>>>;

    fn open_cursor(&mut self, source: &str, options: CursorOptions) -> Result<Box<dyn BridgeCursor>>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// External cursor; every call goes to the component
pub trait BridgeCursor: Send {
    fn columns(&mut self) -> Result<Vec<String>>;

    fn value(&mut self, index: usize) -> Result<Variant>;

    fn set_value(&mut self, column: &str, value: Variant) -> Result<()>;

    fn eof(&mut self) -> Result<bool>;

    fn bof(&mut self) -> Result<bool>;

    fn record_count(&mut self) -> Result<i64>;

    fn move_to(&mut self, step: Step) -> Result<()>;

    fn edit(&mut self, op: EditOp) -> Result<()>;

    /// Native properties without a local equivalent (Sort, Filter, paging)
    fn property(&mut self, name: &str) -> Result<Variant>;

    fn set_property(&mut self, name: &str, value: Variant) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Shared handle to an open bridge connection
#[derive(Clone)]
pub struct BridgeSession(Arc<Mutex<Box<dyn BridgeConnection>>>);

impl BridgeSession {
    pub fn new(conn: Box<dyn BridgeConnection>) -> Self {
        Self(Arc::new(Mutex::new(conn)))
    }

    pub fn execute(&self, sql: &str) -> Result<Option<Box<dyn BridgeCursor>>> {
        self.0.lock().execute(sql)
    }

    pub fn open_cursor(&self, source: &str, options: CursorOptions) -> Result<Box<dyn BridgeCursor>> {
        self.0.lock().open_cursor(source, options)
    }

    pub fn begin(&self) -> Result<()> {
        self.0.lock().begin()
    }

    pub fn commit(&self) -> Result<()> {
        self.0.lock().commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.0.lock().rollback()
    }

    pub fn close(&self) -> Result<()> {
        self.0.lock().close()
    }
}

impl fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BridgeSession")
    }
}

/// Default desktop provider for this host
pub fn host_provider() -> &'static str {
    if cfg!(target_pointer_width = "32") {
        "Microsoft.Jet.OLEDB.4.0"
    } else {
        "Microsoft.ACE.OLEDB.12.0"
    }
}

/// In `Auto` mode, forces the `Provider=` key to the host's provider
/// (inserting it first when missing)
pub fn normalize_provider(descriptor: &str, mode: &BridgeMode) -> String {
    if descriptor.trim().is_empty() || *mode != BridgeMode::Auto {
        return descriptor.to_string();
    }
    let provider = format!("Provider={}", host_provider());
    let mut found = false;
    let mut parts: Vec<String> = descriptor
        .split(';')
        .map(|part| match part.split_once('=') {
            Some((key, _)) if key.trim().eq_ignore_ascii_case("provider") => {
                found = true;
                provider.clone()
            }
            _ => part.to_string(),
        })
        .collect();
    if !found {
        parts.insert(0, provider);
    }
    parts.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_replaces_provider() {
        let out = normalize_provider(
            "Provider=Microsoft.Jet.OLEDB.4.0;Data Source=c:\\db.mdb",
            &BridgeMode::Auto,
        );
        assert_eq!(out, format!("Provider={};Data Source=c:\\db.mdb", host_provider()));
    }

    #[test]
    fn test_normalize_inserts_provider() {
        let out = normalize_provider("Data Source=c:\\db.mdb", &BridgeMode::Auto);
        assert!(out.starts_with("Provider="));
        assert!(out.ends_with(";Data Source=c:\\db.mdb"));
    }

    #[test]
    fn test_keep_mode_leaves_descriptor() {
        let d = "Provider=Microsoft.Jet.OLEDB.4.0;Data Source=x.mdb";
        assert_eq!(normalize_provider(d, &BridgeMode::Keep), d);
    }
}
