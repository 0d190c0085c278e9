//! Wire drivers
//!
//! # Architecture
//!
//! - **Trait-Based Abstraction**: [`WireDriver`] opens a [`WireConnection`];
//!   every backend speaks the same small surface (query, exec, prepared
//!   statements, transaction verbs).
//! - **Static Driver Registry**: all drivers compiled in, looked up by
//!   [`DriverKind`].
//! - **Shared session**: a [`Session`] is a cloneable handle to one native
//!   connection. Connections, statements and transactions each hold a clone,
//!   so closing one object never invalidates another's handle.
//! - **One placeholder form**: callers write `?`; the session rewrites it to
//!   the backend syntax before the driver sees the SQL.

pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use crate::core::Variant;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Sqlite,
    Mysql,
    Postgres,
    Mssql,
}

impl DriverKind {
    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::Sqlite => "sqlite",
            DriverKind::Mysql => "mysql",
            DriverKind::Postgres => "postgres",
            DriverKind::Mssql => "mssql",
        }
    }

    /// Accepts the common aliases (`mariadb`, `postgresql`, `pgsql`,
    /// `sqlserver`, `sql server`, `sqlite3`)
    pub fn from_name(name: &str) -> Option<Self> {
        match normalize_driver_name(name).as_str() {
            "sqlite" => Some(DriverKind::Sqlite),
            "mysql" => Some(DriverKind::Mysql),
            "postgres" => Some(DriverKind::Postgres),
            "mssql" => Some(DriverKind::Mssql),
            _ => None,
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            DriverKind::Sqlite => None,
            DriverKind::Mysql => Some(3306),
            DriverKind::Postgres => Some(5432),
            DriverKind::Mssql => Some(1433),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn normalize_driver_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "mysql" | "mariadb" => "mysql".to_string(),
        "postgres" | "postgresql" | "pgsql" => "postgres".to_string(),
        "mssql" | "sqlserver" | "sql server" => "mssql".to_string(),
        "sqlite" | "sqlite3" => "sqlite".to_string(),
        _ => name,
    }
}

/// Column names plus rows of values in column order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Variant>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: i64,
    /// 0 when the backend does not report one
    pub last_insert_id: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub timeout: Option<Duration>,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

pub type StatementId = u64;

pub trait WireDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Opens a native connection from a backend DSN
    fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<Box<dyn WireConnection>>;
}

/// One native connection. SQL arrives already in the backend's placeholder
/// syntax.
pub trait WireConnection: Send {
    fn ping(&mut self) -> Result<()>;

    fn query(&mut self, sql: &str, params: &[Variant]) -> Result<RowSet>;

    fn exec(&mut self, sql: &str, params: &[Variant]) -> Result<ExecOutcome>;

    fn prepare(&mut self, sql: &str, timeout: Option<Duration>) -> Result<StatementId>;

    fn query_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<RowSet>;

    fn exec_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<ExecOutcome>;

    fn close_prepared(&mut self, id: StatementId) -> Result<()>;

    fn begin(&mut self, options: TxOptions) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

/// Registry of compiled-in wire drivers
pub struct DriverRegistry {
    drivers: HashMap<DriverKind, Arc<dyn WireDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            drivers: HashMap::new(),
        };
        registry.register(Arc::new(sqlite::SqliteDriver));
        registry.register(Arc::new(mysql::MysqlDriver));
        registry.register(Arc::new(postgres::PostgresDriver));
        registry.register(Arc::new(mssql::MssqlDriver));
        registry
    }

    /// Registers (or replaces) the driver for its kind
    pub fn register(&mut self, driver: Arc<dyn WireDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: DriverKind) -> Option<Arc<dyn WireDriver>> {
        self.drivers.get(&kind).cloned()
    }

    /// Opens a connection, pings it and wraps it in a [`Session`]
    pub fn connect(&self, kind: DriverKind, dsn: &str, options: &ConnectOptions) -> Result<Session> {
        let driver = self
            .get(kind)
            .ok_or_else(|| Error::Unsupported(format!("no driver registered for {kind}")))?;
        let mut conn = driver.connect(dsn, options)?;
        conn.ping()?;
        Ok(Session::new(kind, conn))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle to one native connection; operations are serialized by
/// the inner lock.
#[derive(Clone)]
pub struct Session {
    kind: DriverKind,
    conn: Arc<Mutex<Box<dyn WireConnection>>>,
}

impl Session {
    pub fn new(kind: DriverKind, conn: Box<dyn WireConnection>) -> Self {
        Self {
            kind,
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn query(&self, sql: &str, params: &[Variant]) -> Result<RowSet> {
        let sql = rewrite_placeholders(sql, self.kind);
        trace!(driver = %self.kind, sql = %sql, params = params.len(), "query");
        self.conn.lock().query(&sql, params)
    }

    pub fn exec(&self, sql: &str, params: &[Variant]) -> Result<ExecOutcome> {
        let sql = rewrite_placeholders(sql, self.kind);
        trace!(driver = %self.kind, sql = %sql, params = params.len(), "exec");
        self.conn.lock().exec(&sql, params)
    }

    pub fn prepare(&self, sql: &str, timeout: Option<Duration>) -> Result<StatementId> {
        let sql = rewrite_placeholders(sql, self.kind);
        trace!(driver = %self.kind, sql = %sql, "prepare");
        self.conn.lock().prepare(&sql, timeout)
    }

    pub fn query_prepared(&self, id: StatementId, params: &[Variant]) -> Result<RowSet> {
        self.conn.lock().query_prepared(id, params)
    }

    pub fn exec_prepared(&self, id: StatementId, params: &[Variant]) -> Result<ExecOutcome> {
        self.conn.lock().exec_prepared(id, params)
    }

    pub fn close_prepared(&self, id: StatementId) -> Result<()> {
        self.conn.lock().close_prepared(id)
    }

    pub fn begin(&self, options: TxOptions) -> Result<()> {
        trace!(driver = %self.kind, read_only = options.read_only, "begin");
        self.conn.lock().begin(options)
    }

    pub fn commit(&self) -> Result<()> {
        trace!(driver = %self.kind, "commit");
        self.conn.lock().commit()
    }

    pub fn rollback(&self) -> Result<()> {
        trace!(driver = %self.kind, "rollback");
        self.conn.lock().rollback()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("kind", &self.kind).finish()
    }
}

/// True for statements that produce rows
pub fn is_query_statement(sql: &str) -> bool {
    let trimmed = sql.trim_start().to_ascii_lowercase();
    [
        "select", "with", "show", "pragma", "describe", "exec", "execute", "call",
    ]
    .iter()
    .any(|prefix| trimmed.starts_with(prefix))
}

/// Rewrites `?` placeholders outside quoted text to `$n` (postgres) or `@Pn`
/// (SQL Server). Doubled quotes inside a quoted run are kept as escapes.
pub fn rewrite_placeholders(sql: &str, kind: DriverKind) -> String {
    let prefix = match kind {
        DriverKind::Postgres => "$",
        DriverKind::Mssql => "@P",
        DriverKind::Sqlite | DriverKind::Mysql => return sql.to_string(),
    };

    let mut out = String::with_capacity(sql.len() + 16);
    let mut chars = sql.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut index = 0;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double => {
                out.push(ch);
                if in_single && chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push('\'');
                } else {
                    in_single = !in_single;
                }
            }
            '"' if !in_single => {
                out.push(ch);
                if in_double && chars.peek() == Some(&'"') {
                    chars.next();
                    out.push('"');
                } else {
                    in_double = !in_double;
                }
            }
            '?' if !in_single && !in_double => {
                index += 1;
                out.push_str(prefix);
                out.push_str(&index.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}
