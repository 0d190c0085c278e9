//! `ADODB.Connection`
//!
//! One logical database link over either a wire [`Session`] or a
//! [`BridgeSession`]. The link is guarded by a read/write lock: property
//! reads and statement execution share it, open/close/transaction verbs take
//! it exclusively. Failures never escape to the script; they land in
//! [`Errors`] and the call returns Empty.

use super::bridge::{normalize_provider, BridgeSession};
use super::descriptor::{self, Descriptor, MEMORY_PATH};
use super::errors::Errors;
use super::recordset::{Recordset, WireLink};
use crate::core::dispatch::{arg, has_arg, Dispatch, DispatchResult, Member};
use crate::core::{ObjectRef, Variant};
use crate::drivers::{is_query_statement, ConnectOptions, DriverKind, Session, TxOptions};
use crate::error::{Error, Result};
use crate::runtime::context::Scope;
use crate::runtime::resources::ManagedResource;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// `adModeShareDenyNone | adModeReadWrite`
const DEFAULT_MODE: i64 = 3;

#[derive(Clone, Debug)]
pub(crate) enum Backend {
    Wire(Session),
    Bridge(BridgeSession),
}

struct ConnState {
    descriptor: String,
    mode: i64,
    backend: Option<Backend>,
    driver: &'static str,
    in_transaction: bool,
}

pub struct Connection {
    me: Weak<Connection>,
    scope: Scope,
    errors: Arc<Errors>,
    state: RwLock<ConnState>,
}

impl Connection {
    /// Creates a closed connection registered with the request
    pub fn new(scope: &Scope) -> Arc<Self> {
        let conn = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            scope: scope.clone(),
            errors: Arc::new(Errors::new()),
            state: RwLock::new(ConnState {
                descriptor: String::new(),
                mode: DEFAULT_MODE,
                backend: None,
                driver: "",
                in_transaction: false,
            }),
        });
        scope.register(conn.clone());
        conn
    }

    pub fn is_open(&self) -> bool {
        self.state.read().backend.is_some()
    }

    pub fn errors(&self) -> &Arc<Errors> {
        &self.errors
    }

    pub fn driver(&self) -> &'static str {
        self.state.read().driver
    }

    pub fn descriptor(&self) -> String {
        self.state.read().descriptor.clone()
    }

    pub(crate) fn backend(&self) -> Option<Backend> {
        self.state.read().backend.clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.state.read().in_transaction
    }

    /// Resolves the descriptor and opens the link. An unresolvable (but
    /// non-empty) descriptor falls back to an in-memory embedded database.
    pub fn open(&self, descriptor: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.backend.is_some() {
            return Err(Error::Execution(
                "operation is not allowed when the object is open".to_string(),
            ));
        }
        state.descriptor = descriptor.to_string();

        let (backend, driver) = self.connect(descriptor)?;
        info!(
            driver,
            request_id = self.scope.request_id(),
            "connection opened"
        );
        state.backend = Some(backend);
        state.driver = driver;
        state.in_transaction = false;
        Ok(())
    }

    fn connect(&self, descriptor: &str) -> Result<(Backend, &'static str)> {
        match descriptor::resolve(descriptor) {
            Ok(Descriptor::Embedded { path }) => self.open_embedded(&path),
            Ok(Descriptor::Wire { kind, dsn }) => {
                let session = self.scope.engine().drivers.connect(kind, &dsn, &self.connect_options())?;
                Ok((Backend::Wire(session), kind.name()))
            }
            Ok(Descriptor::Bridge { descriptor }) => self.open_bridge(&descriptor),
            Err(err) if descriptor.trim().is_empty() => Err(err),
            Err(err) => {
                warn!(error = %err, "unresolvable connection string; using an in-memory database");
                self.open_embedded(MEMORY_PATH)
            }
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            timeout: self.scope.config().ping_timeout,
        }
    }

    fn open_embedded(&self, path: &str) -> Result<(Backend, &'static str)> {
        let path = if path == MEMORY_PATH {
            MEMORY_PATH.to_string()
        } else {
            self.scope.map_path(path).to_string_lossy().into_owned()
        };
        let session =
            self.scope
                .engine()
                .drivers
                .connect(DriverKind::Sqlite, &path, &self.connect_options())?;
        Ok((Backend::Wire(session), DriverKind::Sqlite.name()))
    }

    fn open_bridge(&self, descriptor: &str) -> Result<(Backend, &'static str)> {
        let Some(provider) = self.scope.engine().bridge() else {
            if cfg!(windows) {
                warn!("no desktop database provider is registered with the engine");
            } else {
                warn!(
                    "direct desktop database support is only available on Windows; \
                     use a different database system for cross-platform compatibility"
                );
            }
            return Err(Error::Unsupported(
                "desktop database support is not available on this host".to_string(),
            ));
        };
        let descriptor = normalize_provider(descriptor, &self.scope.config().bridge_mode);
        debug!(provider = provider.name(), "opening desktop database");
        let conn = provider.open(&descriptor)?;
        Ok((Backend::Bridge(BridgeSession::new(conn)), "bridge"))
    }

    /// Closes the link, rolling back an open transaction. Safe to repeat.
    pub fn close(&self) {
        let mut state = self.state.write();
        let Some(backend) = state.backend.take() else {
            return;
        };
        let result = match &backend {
            Backend::Wire(session) if state.in_transaction => session.rollback(),
            Backend::Bridge(session) => {
                if state.in_transaction {
                    session.rollback().ok();
                }
                session.close()
            }
            Backend::Wire(_) => Ok(()),
        };
        if let Err(err) = result {
            debug!(error = %err, "error while closing connection");
        }
        state.in_transaction = false;
        info!(
            driver = state.driver,
            request_id = self.scope.request_id(),
            "connection closed"
        );
    }

    /// Row-returning statements yield a Recordset, others the affected count
    pub fn execute(&self, sql: &str, params: &[Variant]) -> Result<Variant> {
        let backend = self.backend().ok_or(Error::Closed("connection"))?;
        match backend {
            Backend::Wire(session) => {
                if !is_query_statement(sql) {
                    let outcome = session.exec(sql, params)?;
                    return Ok(Variant::Int(outcome.rows_affected));
                }
                let rows = session.query(sql, params)?;
                let link = WireLink {
                    session,
                    errors: self.errors.clone(),
                };
                let rs = Recordset::materialized(&self.scope, rows, sql, Some(link), self.me.clone());
                Ok(Variant::Object(ObjectRef::new(rs)))
            }
            Backend::Bridge(session) => match session.execute(sql)? {
                Some(cursor) => {
                    let rs = Recordset::bridged(&self.scope, cursor, sql, self.me.clone())?;
                    Ok(Variant::Object(ObjectRef::new(rs)))
                }
                None => Ok(Variant::Empty),
            },
        }
    }

    /// Returns the nesting level, always 1; a second call while active is a
    /// no-op
    pub fn begin_trans(&self) -> Result<i64> {
        let mut state = self.state.write();
        if state.in_transaction {
            return Ok(1);
        }
        match state.backend.as_ref().ok_or(Error::Closed("connection"))? {
            Backend::Wire(session) => session.begin(TxOptions {
                timeout: self.scope.config().statement_timeout,
                read_only: false,
            })?,
            Backend::Bridge(session) => session.begin()?,
        }
        state.in_transaction = true;
        Ok(1)
    }

    pub fn commit_trans(&self) -> Result<()> {
        self.end_transaction(true)
    }

    pub fn rollback_trans(&self) -> Result<()> {
        self.end_transaction(false)
    }

    fn end_transaction(&self, commit: bool) -> Result<()> {
        let mut state = self.state.write();
        if !state.in_transaction {
            return Ok(());
        }
        let backend = state.backend.as_ref().ok_or(Error::Closed("connection"))?;
        let rollback = || match backend {
            Backend::Wire(session) => session.rollback(),
            Backend::Bridge(session) => session.rollback(),
        };
        let result = if commit {
            let committed = match backend {
                Backend::Wire(session) => session.commit(),
                Backend::Bridge(session) => session.commit(),
            };
            // a refused COMMIT leaves the native transaction open
            if committed.is_err() {
                if let Err(err) = rollback() {
                    debug!(error = %err, "rollback after failed commit");
                }
            }
            committed
        } else {
            rollback()
        };
        state.in_transaction = false;
        result
    }

    fn collect<T>(&self, result: Result<T>) -> Option<T> {
        result.map_err(|err| self.errors.push(&err)).ok()
    }
}

impl Dispatch for Connection {
    fn class_name(&self) -> &'static str {
        "ADODB.Connection"
    }

    fn get_property(&self, name: &Member) -> Variant {
        match name.as_str() {
            "connectionstring" => Variant::from(self.descriptor()),
            "state" => Variant::Int(i64::from(self.is_open())),
            "mode" => Variant::Int(self.state.read().mode),
            "errors" => Variant::Object(ObjectRef::new(self.errors.clone())),
            "provider" => Variant::from(self.driver()),
            _ => Variant::Empty,
        }
    }

    fn set_property(&self, name: &Member, value: Variant) -> DispatchResult<()> {
        let mut state = self.state.write();
        match name.as_str() {
            "connectionstring" => state.descriptor = value.to_string(),
            "mode" => state.mode = value.to_int(),
            _ => {}
        }
        Ok(())
    }

    fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        let result = match name.as_str() {
            // Open([ConnectionString], [UserID], [Password], [Options])
            "open" => {
                let descriptor = if has_arg(args, 0) {
                    arg(args, 0).to_string()
                } else {
                    self.descriptor()
                };
                let descriptor = descriptor::fold_credentials(
                    &descriptor,
                    &arg(args, 1).to_string(),
                    &arg(args, 2).to_string(),
                );
                self.collect(self.open(&descriptor));
                Variant::Empty
            }
            "close" => {
                self.close();
                Variant::Empty
            }
            // Execute(CommandText, [Parameters])
            "execute" => {
                self.errors.clear();
                if !has_arg(args, 0) {
                    self.errors.push(&Error::Execution("invalid parameters".to_string()));
                    return Ok(Variant::Empty);
                }
                let params = match arg(args, 1) {
                    Variant::Array(values) => values.to_vec(),
                    _ => Vec::new(),
                };
                self.collect(self.execute(&arg(args, 0).to_string(), &params))
                    .unwrap_or_default()
            }
            "begintrans" => self
                .collect(self.begin_trans())
                .map(Variant::Int)
                .unwrap_or_default(),
            "committrans" => {
                self.collect(self.commit_trans());
                Variant::Empty
            }
            "rollbacktrans" => {
                self.collect(self.rollback_trans());
                Variant::Empty
            }
            _ => Variant::Empty,
        };
        Ok(result)
    }
}

impl ManagedResource for Connection {
    fn cleanup(&self) {
        self.close();
    }

    fn resource_kind(&self) -> &'static str {
        "connection"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::{Engine, RequestContext};

    fn request() -> RequestContext {
        RequestContext::new(Arc::new(Engine::default()))
    }

    fn open(ctx: &RequestContext, descriptor: &str) -> ObjectRef {
        let conn = ctx.create_object("ADODB.Connection").unwrap();
        conn.call("Open", &[Variant::from(descriptor)]).unwrap();
        conn
    }

    #[test]
    fn test_open_embedded_memory() {
        let ctx = request();
        let conn = open(&ctx, "embedded:");
        assert_eq!(conn.get("State"), Variant::Int(1));
        assert_eq!(conn.get("Provider"), Variant::from("sqlite"));
        assert_eq!(conn.get("mode"), Variant::Int(3));
    }

    #[test]
    fn test_unresolvable_descriptor_falls_back_to_memory() {
        let ctx = request();
        let conn = open(&ctx, "Driver={Unknown};Server=x");
        assert_eq!(conn.get("State"), Variant::Int(1));
        let affected = conn.call("Execute", &[Variant::from("CREATE TABLE t (a)")]).unwrap();
        assert_eq!(affected, Variant::Int(0));
    }

    #[test]
    fn test_empty_descriptor_is_collected() {
        let ctx = request();
        let conn = open(&ctx, "");
        assert_eq!(conn.get("State"), Variant::Int(0));
        let Variant::Object(errors) = conn.get("Errors") else {
            panic!("expected Errors object");
        };
        assert_eq!(errors.get("Count"), Variant::Int(1));
    }

    #[test]
    fn test_bridge_without_provider_stays_closed() {
        let ctx = request();
        let conn = open(&ctx, "Provider=Microsoft.ACE.OLEDB.12.0;Data Source=shop.accdb");
        assert_eq!(conn.get("State"), Variant::Int(0));
    }

    #[test]
    fn test_execute_clears_errors_and_reports_failures() {
        let ctx = request();
        let conn = open(&ctx, "embedded:");
        let Variant::Object(errors) = conn.get("Errors") else {
            panic!("expected Errors object");
        };
        conn.call("Execute", &[Variant::from("SELECT * FROM missing")]).unwrap();
        assert_eq!(errors.get("Count"), Variant::Int(1));
        conn.call("Execute", &[Variant::from("CREATE TABLE t (a)")]).unwrap();
        assert_eq!(errors.get("Count"), Variant::Int(0));
    }

    #[test]
    fn test_execute_with_parameters() {
        let ctx = request();
        let conn = open(&ctx, "embedded:");
        conn.call("Execute", &[Variant::from("CREATE TABLE t (a INTEGER, b TEXT)")])
            .unwrap();
        let params = crate::core::ArrayRef::from_values(vec![1.into(), "x".into()]);
        let affected = conn
            .call(
                "Execute",
                &[Variant::from("INSERT INTO t VALUES (?, ?)"), Variant::Array(params)],
            )
            .unwrap();
        assert_eq!(affected, Variant::Int(1));

        let Variant::Object(rs) = conn.call("Execute", &[Variant::from("select b from t")]).unwrap()
        else {
            panic!("expected recordset");
        };
        assert_eq!(rs.call_default(&[Variant::from("b")]).unwrap(), Variant::from("x"));
    }

    #[test]
    fn test_transactions() {
        let ctx = request();
        let conn = open(&ctx, "embedded:");
        conn.call("Execute", &[Variant::from("CREATE TABLE t (a)")]).unwrap();

        assert_eq!(conn.call("BeginTrans", &[]).unwrap(), Variant::Int(1));
        assert_eq!(conn.call("BeginTrans", &[]).unwrap(), Variant::Int(1));
        conn.call("Execute", &[Variant::from("INSERT INTO t VALUES (1)")]).unwrap();
        conn.call("RollbackTrans", &[]).unwrap();

        let Variant::Object(rs) = conn
            .call("Execute", &[Variant::from("SELECT COUNT(*) AS n FROM t")])
            .unwrap()
        else {
            panic!("expected recordset");
        };
        assert_eq!(rs.call_default(&[Variant::from("n")]).unwrap(), Variant::Int(0));

        conn.call("BeginTrans", &[]).unwrap();
        conn.call("Execute", &[Variant::from("INSERT INTO t VALUES (1)")]).unwrap();
        conn.call("CommitTrans", &[]).unwrap();
        rs.call("Requery", &[]).unwrap();
        assert_eq!(rs.call_default(&[Variant::from("n")]).unwrap(), Variant::Int(1));
    }

    #[test]
    fn test_open_twice_is_an_error() {
        let ctx = request();
        let conn = open(&ctx, "embedded:");
        conn.call("Open", &[Variant::from("embedded:")]).unwrap();
        let Variant::Object(errors) = conn.get("Errors") else {
            panic!("expected Errors object");
        };
        assert_eq!(errors.get("Count"), Variant::Int(1));
        assert_eq!(conn.get("State"), Variant::Int(1));
    }

    #[test]
    fn test_close_is_idempotent_and_cleanup_closes() {
        let ctx = request();
        let conn = open(&ctx, "embedded:");
        conn.call("Close", &[]).unwrap();
        conn.call("Close", &[]).unwrap();
        assert_eq!(conn.get("State"), Variant::Int(0));

        let other = open(&ctx, "embedded:");
        ctx.teardown();
        assert_eq!(other.get("State"), Variant::Int(0));
    }
}
