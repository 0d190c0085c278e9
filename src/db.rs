//! `G3DB`: direct database access without the ADO object model
//!
//! One [`Database`] owns one native session. Statements, transactions and
//! result sets borrow that session and register with the request on their
//! own, so each is released at teardown even if the script forgets it.
//! Failures are remembered as `LastError` and the call returns Nothing
//! (or `False` for the boolean verbs).

use crate::ado::descriptor::{pg_quote, MEMORY_PATH};
use crate::ado::errors::Errors;
use crate::ado::recordset::Recordset;
use crate::config::env_or;
use crate::core::dispatch::{arg, has_arg, Dispatch, DispatchResult, Member};
use crate::core::{ArrayRef, ObjectRef, Variant};
use crate::drivers::{
    normalize_driver_name, ConnectOptions, DriverKind, ExecOutcome, Session, StatementId, TxOptions,
};
use crate::error::{Error, Result};
use crate::runtime::context::Scope;
use crate::runtime::resources::ManagedResource;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `Query(sql, a, b)` and `Query(sql, Array(a, b))` bind the same parameters
fn call_params(args: &[Variant]) -> Vec<Variant> {
    match args {
        [Variant::Array(values)] => values.to_vec(),
        _ => args.to_vec(),
    }
}

fn seconds(value: &Variant) -> Option<Duration> {
    u64::try_from(value.to_int())
        .ok()
        .filter(|&n| n > 0)
        .map(Duration::from_secs)
}

fn object<T: Dispatch + 'static>(value: Arc<T>) -> Variant {
    Variant::Object(ObjectRef::new(value))
}

struct DbState {
    session: Option<Session>,
    driver: String,
    dsn: String,
}

pub struct Database {
    me: Weak<Database>,
    scope: Scope,
    errors: Arc<Errors>,
    state: RwLock<DbState>,
}

impl Database {
    pub fn new(scope: &Scope) -> Arc<Self> {
        let db = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            scope: scope.clone(),
            errors: Arc::new(Errors::new()),
            state: RwLock::new(DbState {
                session: None,
                driver: String::new(),
                dsn: String::new(),
            }),
        });
        scope.register(db.clone());
        db
    }

    pub fn is_open(&self) -> bool {
        self.state.read().session.is_some()
    }

    pub fn last_error(&self) -> String {
        self.errors.last_description().unwrap_or_default()
    }

    fn fail(&self, err: &Error) {
        self.errors.clear();
        self.errors.push(err);
    }

    /// Opens `dsn` with the named driver, closing any previous session
    pub fn open(&self, driver: &str, dsn: &str) -> Result<()> {
        let name = normalize_driver_name(driver);
        let kind = DriverKind::from_name(&name)
            .ok_or_else(|| Error::Unsupported(format!("unsupported driver: {driver}")))?;
        let dsn = match kind {
            DriverKind::Sqlite => self.embedded_path(dsn),
            _ => dsn.to_string(),
        };
        self.close();

        let options = ConnectOptions {
            timeout: self.scope.config().ping_timeout,
        };
        let session = self.scope.engine().drivers.connect(kind, &dsn, &options)?;
        info!(
            driver = kind.name(),
            request_id = self.scope.request_id(),
            "database opened"
        );
        let mut state = self.state.write();
        state.session = Some(session);
        state.driver = kind.name().to_string();
        state.dsn = dsn;
        Ok(())
    }

    fn embedded_path(&self, dsn: &str) -> String {
        let dsn = dsn.trim();
        if dsn == MEMORY_PATH {
            return dsn.to_string();
        }
        let path = if dsn.is_empty() {
            self.scope.config().embedded_default_path.to_string_lossy().into_owned()
        } else {
            dsn.to_string()
        };
        self.scope.map_path(&path).to_string_lossy().into_owned()
    }

    /// Builds the DSN from `<DRIVER>_HOST`, `_PORT`, `_USER`, `_PASS`,
    /// `_DATABASE` (plus `_SSLMODE` for postgres, `_PATH` for sqlite)
    pub fn open_from_env(&self, driver: &str) -> Result<()> {
        dotenv::dotenv().ok();
        let name = normalize_driver_name(driver);
        let kind = DriverKind::from_name(&name)
            .ok_or_else(|| Error::Unsupported(format!("unsupported driver: {driver}")))?;
        let prefix = name.to_ascii_uppercase();
        let var = |key: &str, default: &str| env_or(&prefix, key, default);
        let port = kind.default_port().map(|p| p.to_string()).unwrap_or_default();

        let dsn = match kind {
            DriverKind::Mysql => format!(
                "{}:{}@tcp({}:{})/{}?parseTime=true",
                var("USER", "root"),
                var("PASS", ""),
                var("HOST", "localhost"),
                var("PORT", &port),
                var("DATABASE", "test")
            ),
            DriverKind::Postgres => format!(
                "host={} port={} user={} password={} dbname={} sslmode={}",
                pg_quote(&var("HOST", "localhost")),
                var("PORT", &port),
                pg_quote(&var("USER", "postgres")),
                pg_quote(&var("PASS", "")),
                pg_quote(&var("DATABASE", "test")),
                var("SSLMODE", "disable")
            ),
            DriverKind::Mssql => format!(
                "server={};port={};user id={};password={};database={}",
                var("HOST", "localhost"),
                var("PORT", &port),
                var("USER", "sa"),
                var("PASS", ""),
                var("DATABASE", "test")
            ),
            DriverKind::Sqlite => {
                let default = self.scope.config().embedded_default_path.to_string_lossy().into_owned();
                var("PATH", &default)
            }
        };
        self.open(kind.name(), &dsn)
    }

    pub fn close(&self) {
        let mut state = self.state.write();
        if state.session.take().is_some() {
            info!(
                driver = %state.driver,
                request_id = self.scope.request_id(),
                "database closed"
            );
        }
    }

    fn session(&self) -> Result<Session> {
        self.state
            .read()
            .session
            .clone()
            .ok_or(Error::Closed("database"))
    }

    /// Forward-only result set over the whole query
    pub fn query(&self, sql: &str, params: &[Variant]) -> Result<Arc<Recordset>> {
        let rows = self.session()?.query(sql, params)?;
        Ok(Recordset::materialized(&self.scope, rows, sql, None, Weak::new()))
    }

    pub fn query_row(&self, sql: &str, params: &[Variant]) -> Result<Arc<Row>> {
        let rows = self.session()?.query(sql, params)?;
        Ok(Arc::new(Row::first_of(rows.columns, rows.rows)))
    }

    pub fn exec(&self, sql: &str, params: &[Variant]) -> Result<Arc<ExecResult>> {
        let outcome = self.session()?.exec(sql, params)?;
        Ok(Arc::new(ExecResult::from(outcome)))
    }

    pub fn prepare(&self, sql: &str, timeout: Option<Duration>) -> Result<Arc<Statement>> {
        let session = self.session()?;
        let id = session.prepare(sql, timeout)?;
        Ok(Statement::new(&self.scope, session, id, self.me.clone()))
    }

    pub fn begin(&self, options: TxOptions) -> Result<Arc<Transaction>> {
        let session = self.session()?;
        session.begin(options)?;
        Ok(Transaction::new(&self.scope, session, self.me.clone()))
    }

    fn default_tx_options(&self) -> TxOptions {
        TxOptions {
            timeout: self.scope.config().statement_timeout,
            read_only: false,
        }
    }

    /// Runs `f`, remembering a failure as LastError
    fn attempt<T>(&self, f: impl FnOnce() -> Result<T>) -> Option<T> {
        match f() {
            Ok(value) => Some(value),
            Err(err) => {
                self.fail(&err);
                None
            }
        }
    }
}

impl Dispatch for Database {
    fn class_name(&self) -> &'static str {
        "G3DB"
    }

    fn get_property(&self, name: &Member) -> Variant {
        match name.as_str() {
            "isopen" => Variant::Bool(self.is_open()),
            "driver" => Variant::from(self.state.read().driver.as_str()),
            "dsn" => Variant::from(self.state.read().dsn.as_str()),
            "lasterror" => Variant::from(self.last_error()),
            _ => Variant::Empty,
        }
    }

    fn set_property(&self, _name: &Member, _value: Variant) -> DispatchResult<()> {
        Ok(())
    }

    fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        let sql = arg(args, 0).to_string();
        let params = call_params(args.get(1..).unwrap_or_default());
        let result = match name.as_str() {
            "open" => {
                if args.len() < 2 {
                    self.fail(&Error::Execution("open requires driver and dsn parameters".into()));
                    return Ok(Variant::Bool(false));
                }
                let opened = self.attempt(|| self.open(&sql, &arg(args, 1).to_string()));
                Variant::Bool(opened.is_some())
            }
            "openfromenv" => {
                let driver = if has_arg(args, 0) { sql } else { "mysql".to_string() };
                Variant::Bool(self.attempt(|| self.open_from_env(&driver)).is_some())
            }
            "close" => {
                self.close();
                Variant::Bool(true)
            }
            "query" => self
                .attempt(|| self.query(&sql, &params))
                .map(object)
                .unwrap_or_default(),
            "queryrow" => self
                .attempt(|| self.query_row(&sql, &params))
                .map(object)
                .unwrap_or_default(),
            "exec" => self
                .attempt(|| self.exec(&sql, &params))
                .map(object)
                .unwrap_or_default(),
            "prepare" => self
                .attempt(|| self.prepare(&sql, None))
                .map(object)
                .unwrap_or_default(),
            // PrepareContext(timeoutSeconds, sql)
            "preparecontext" => {
                let sql = arg(args, 1).to_string();
                let timeout = seconds(&arg(args, 0));
                self.attempt(|| self.prepare(&sql, timeout))
                    .map(object)
                    .unwrap_or_default()
            }
            "begin" | "begintrans" | "begintransaction" => self
                .attempt(|| self.begin(self.default_tx_options()))
                .map(object)
                .unwrap_or_default(),
            // BeginTx([timeoutSeconds], [readOnly])
            "begintx" => {
                let options = TxOptions {
                    timeout: seconds(&arg(args, 0)).or(self.scope.config().statement_timeout),
                    read_only: arg(args, 1).to_bool(),
                };
                self.attempt(|| self.begin(options))
                    .map(object)
                    .unwrap_or_default()
            }
            "geterror" | "getlasterror" => Variant::from(self.last_error()),
            _ => Variant::Empty,
        };
        Ok(result)
    }
}

impl ManagedResource for Database {
    fn cleanup(&self) {
        self.close();
    }

    fn resource_kind(&self) -> &'static str {
        "database"
    }
}

fn report(owner: &Weak<Database>, err: &Error) {
    match owner.upgrade() {
        Some(db) => db.fail(err),
        None => debug!(error = %err, "database error after the database was released"),
    }
}

/// A single row; empty when the query matched nothing
pub struct Row {
    columns: Vec<String>,
    values: Option<Vec<Variant>>,
}

impl Row {
    fn first_of(columns: Vec<String>, rows: Vec<Vec<Variant>>) -> Self {
        Self {
            columns,
            values: rows.into_iter().next(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_none()
    }

    pub fn get(&self, key: &Variant) -> Variant {
        let Some(values) = &self.values else {
            return Variant::Empty;
        };
        let index = match key.resolve_default() {
            Variant::Int(_) | Variant::Float(_) => usize::try_from(key.to_int()).ok(),
            other => {
                let name = other.to_string();
                self.columns.iter().position(|c| c.eq_ignore_ascii_case(name.trim()))
            }
        };
        index.and_then(|i| values.get(i).cloned()).unwrap_or_default()
    }
}

impl Dispatch for Row {
    fn class_name(&self) -> &'static str {
        "G3DB.Row"
    }

    fn get_property(&self, name: &Member) -> Variant {
        match name.as_str() {
            "isempty" => Variant::Bool(self.is_empty()),
            "count" => Variant::from(self.columns.len()),
            field => self.get(&Variant::from(field)),
        }
    }

    fn set_property(&self, _name: &Member, _value: Variant) -> DispatchResult<()> {
        Ok(())
    }

    fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        Ok(match name.as_str() {
            "" | "item" | "get" => self.get(&arg(args, 0)),
            "columns" => Variant::Array(ArrayRef::from_values(
                self.columns.iter().map(|c| Variant::from(c.as_str())).collect(),
            )),
            "scan" => Variant::Array(ArrayRef::from_values(
                self.values.clone().unwrap_or_default(),
            )),
            other => self.get_property(&Member::new(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub last_insert_id: i64,
    pub rows_affected: i64,
}

impl From<ExecOutcome> for ExecResult {
    fn from(outcome: ExecOutcome) -> Self {
        Self {
            last_insert_id: outcome.last_insert_id,
            rows_affected: outcome.rows_affected,
        }
    }
}

impl Dispatch for ExecResult {
    fn class_name(&self) -> &'static str {
        "G3DB.Result"
    }

    fn get_property(&self, name: &Member) -> Variant {
        match name.as_str() {
            "lastinsertid" => Variant::Int(self.last_insert_id),
            "rowsaffected" | "" => Variant::Int(self.rows_affected),
            _ => Variant::Empty,
        }
    }

    fn set_property(&self, _name: &Member, _value: Variant) -> DispatchResult<()> {
        Ok(())
    }

    fn call_method(&self, name: &Member, _args: &[Variant]) -> DispatchResult<Variant> {
        Ok(self.get_property(name))
    }
}

/// Prepared statement bound to its database's session
pub struct Statement {
    scope: Scope,
    session: Session,
    id: StatementId,
    owner: Weak<Database>,
    closed: AtomicBool,
}

impl Statement {
    fn new(scope: &Scope, session: Session, id: StatementId, owner: Weak<Database>) -> Arc<Self> {
        let stmt = Arc::new(Self {
            scope: scope.clone(),
            session,
            id,
            owner,
            closed: AtomicBool::new(false),
        });
        scope.register(stmt.clone());
        stmt
    }

    fn open_session(&self) -> Result<&Session> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("statement"));
        }
        Ok(&self.session)
    }

    pub fn query(&self, params: &[Variant]) -> Result<Arc<Recordset>> {
        let rows = self.open_session()?.query_prepared(self.id, params)?;
        Ok(Recordset::materialized(&self.scope, rows, "", None, Weak::new()))
    }

    pub fn query_row(&self, params: &[Variant]) -> Result<Arc<Row>> {
        let rows = self.open_session()?.query_prepared(self.id, params)?;
        Ok(Arc::new(Row::first_of(rows.columns, rows.rows)))
    }

    pub fn exec(&self, params: &[Variant]) -> Result<Arc<ExecResult>> {
        let outcome = self.open_session()?.exec_prepared(self.id, params)?;
        Ok(Arc::new(ExecResult::from(outcome)))
    }

    /// Releases the native handle once; later calls are no-ops
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.session.close_prepared(self.id) {
            debug!(error = %err, statement = self.id, "close prepared statement failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn attempt<T>(&self, f: impl FnOnce() -> Result<T>) -> Option<T> {
        f().map_err(|err| report(&self.owner, &err)).ok()
    }
}

impl Dispatch for Statement {
    fn class_name(&self) -> &'static str {
        "G3DB.Statement"
    }

    fn get_property(&self, name: &Member) -> Variant {
        match name.as_str() {
            "closed" => Variant::Bool(self.is_closed()),
            _ => Variant::Empty,
        }
    }

    fn set_property(&self, _name: &Member, _value: Variant) -> DispatchResult<()> {
        Ok(())
    }

    fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        let params = call_params(args);
        Ok(match name.as_str() {
            "query" => self.attempt(|| self.query(&params)).map(object).unwrap_or_default(),
            "queryrow" => self
                .attempt(|| self.query_row(&params))
                .map(object)
                .unwrap_or_default(),
            "exec" => self.attempt(|| self.exec(&params)).map(object).unwrap_or_default(),
            "close" => {
                self.close();
                Variant::Bool(true)
            }
            _ => Variant::Empty,
        })
    }
}

impl ManagedResource for Statement {
    fn cleanup(&self) {
        self.close();
    }

    fn resource_kind(&self) -> &'static str {
        "statement"
    }
}

#[derive(Debug, Default)]
struct TxState {
    committed: bool,
    closed: bool,
}

/// Open transaction on the database session. One left open at request end
/// is rolled back.
pub struct Transaction {
    scope: Scope,
    session: Session,
    owner: Weak<Database>,
    state: Mutex<TxState>,
}

impl Transaction {
    fn new(scope: &Scope, session: Session, owner: Weak<Database>) -> Arc<Self> {
        let tx = Arc::new(Self {
            scope: scope.clone(),
            session,
            owner,
            state: Mutex::new(TxState::default()),
        });
        scope.register(tx.clone());
        tx
    }

    pub fn is_committed(&self) -> bool {
        self.state.lock().committed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// `false` when the transaction already ended or the commit failed
    pub fn commit(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(false);
        }
        if let Err(err) = self.session.commit() {
            // a refused COMMIT leaves the native transaction open
            if let Err(rollback) = self.session.rollback() {
                debug!(error = %rollback, "rollback after failed commit");
            }
            state.closed = true;
            return Err(err);
        }
        state.closed = true;
        state.committed = true;
        Ok(true)
    }

    pub fn rollback(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(false);
        }
        state.closed = true;
        self.session.rollback()?;
        Ok(true)
    }

    fn open_session(&self) -> Result<&Session> {
        if self.state.lock().closed {
            return Err(Error::Closed("transaction"));
        }
        Ok(&self.session)
    }

    pub fn query(&self, sql: &str, params: &[Variant]) -> Result<Arc<Recordset>> {
        let rows = self.open_session()?.query(sql, params)?;
        Ok(Recordset::materialized(&self.scope, rows, sql, None, Weak::new()))
    }

    pub fn query_row(&self, sql: &str, params: &[Variant]) -> Result<Arc<Row>> {
        let rows = self.open_session()?.query(sql, params)?;
        Ok(Arc::new(Row::first_of(rows.columns, rows.rows)))
    }

    pub fn exec(&self, sql: &str, params: &[Variant]) -> Result<Arc<ExecResult>> {
        let outcome = self.open_session()?.exec(sql, params)?;
        Ok(Arc::new(ExecResult::from(outcome)))
    }

    pub fn prepare(&self, sql: &str) -> Result<Arc<Statement>> {
        let session = self.open_session()?.clone();
        let id = session.prepare(sql, None)?;
        Ok(Statement::new(&self.scope, session, id, self.owner.clone()))
    }

    fn attempt<T>(&self, f: impl FnOnce() -> Result<T>) -> Option<T> {
        f().map_err(|err| report(&self.owner, &err)).ok()
    }
}

impl Dispatch for Transaction {
    fn class_name(&self) -> &'static str {
        "G3DB.Transaction"
    }

    fn get_property(&self, name: &Member) -> Variant {
        match name.as_str() {
            "committed" => Variant::Bool(self.is_committed()),
            "closed" => Variant::Bool(self.is_closed()),
            _ => Variant::Empty,
        }
    }

    fn set_property(&self, _name: &Member, _value: Variant) -> DispatchResult<()> {
        Ok(())
    }

    fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        let sql = arg(args, 0).to_string();
        let params = call_params(args.get(1..).unwrap_or_default());
        Ok(match name.as_str() {
            "commit" | "committrans" => Variant::Bool(self.attempt(|| self.commit()).unwrap_or(false)),
            "rollback" | "rollbacktrans" => {
                Variant::Bool(self.attempt(|| self.rollback()).unwrap_or(false))
            }
            "query" => self
                .attempt(|| self.query(&sql, &params))
                .map(object)
                .unwrap_or_default(),
            "queryrow" => self
                .attempt(|| self.query_row(&sql, &params))
                .map(object)
                .unwrap_or_default(),
            "exec" => self
                .attempt(|| self.exec(&sql, &params))
                .map(object)
                .unwrap_or_default(),
            "prepare" => self.attempt(|| self.prepare(&sql)).map(object).unwrap_or_default(),
            other => self.get_property(&Member::new(other)),
        })
    }
}

impl ManagedResource for Transaction {
    fn cleanup(&self) {
        if self.is_closed() {
            return;
        }
        warn!(
            request_id = self.scope.request_id(),
            "transaction still open at request end; rolling back"
        );
        if let Err(err) = self.rollback() {
            debug!(error = %err, "rollback during cleanup failed");
        }
    }

    fn resource_kind(&self) -> &'static str {
        "transaction"
    }
}
