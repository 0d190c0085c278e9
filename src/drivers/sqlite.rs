//! Embedded SQLite driver
//!
//! Implements the wire driver interface over rusqlite. `":memory:"` (or an
//! empty path) opens a private in-memory database.

use super::{
    ConnectOptions, DriverKind, ExecOutcome, RowSet, StatementId, TxOptions, WireConnection,
    WireDriver,
};
use crate::core::Variant;
use crate::error::{Error, Result};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug)]
pub struct SqliteDriver;

impl WireDriver for SqliteDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<Box<dyn WireConnection>> {
        let path = dsn.trim();
        let conn = if path.is_empty() || path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.busy_timeout(options.timeout)?;

        Ok(Box::new(SqliteConnection {
            conn,
            statements: HashMap::new(),
            next_id: 1,
            read_only_tx: false,
            default_timeout: options.timeout,
            tx_timeout: None,
        }))
    }
}

/// SQLite connection implementation
///
/// Prepared statements are kept as SQL text and re-prepared through the
/// connection's statement cache on execute, since `rusqlite::Statement`
/// borrows the connection. Statement and transaction timeouts only hold
/// the busy handler while they run; the connect timeout is restored after.
#[derive(Debug)]
struct SqliteConnection {
    conn: Connection,
    statements: HashMap<StatementId, Prepared>,
    next_id: StatementId,
    read_only_tx: bool,
    default_timeout: Duration,
    tx_timeout: Option<Duration>,
}

#[derive(Debug)]
struct Prepared {
    sql: String,
    timeout: Option<Duration>,
}

impl SqliteConnection {
    fn run_query(&self, sql: &str, params: &[Variant]) -> Result<RowSet> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql_value)))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(from_value_ref(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(RowSet { columns, rows: out })
    }

    fn run_exec(&self, sql: &str, params: &[Variant]) -> Result<ExecOutcome> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let affected = stmt.execute(params_from_iter(params.iter().map(to_sql_value)))?;
        Ok(ExecOutcome {
            rows_affected: affected as i64,
            last_insert_id: self.conn.last_insert_rowid(),
        })
    }

    fn statement(&self, id: StatementId) -> Result<(String, Option<Duration>)> {
        self.statements
            .get(&id)
            .map(|p| (p.sql.clone(), p.timeout))
            .ok_or(Error::Closed("statement"))
    }

    /// Busy timeout outside any statement: the open transaction's, else the
    /// connect timeout
    fn ambient_timeout(&self) -> Duration {
        self.tx_timeout.unwrap_or(self.default_timeout)
    }

    fn with_timeout<T>(
        &self,
        timeout: Option<Duration>,
        run: impl FnOnce(&Self) -> Result<T>,
    ) -> Result<T> {
        let Some(timeout) = timeout else {
            return run(self);
        };
        self.conn.busy_timeout(timeout)?;
        let result = run(self);
        self.conn.busy_timeout(self.ambient_timeout())?;
        result
    }

    fn end_transaction(&mut self, verb: &str) -> Result<()> {
        self.conn.execute_batch(verb)?;
        if self.read_only_tx {
            self.conn.execute_batch("PRAGMA query_only = 0")?;
            self.read_only_tx = false;
        }
        if self.tx_timeout.take().is_some() {
            self.conn.busy_timeout(self.default_timeout)?;
        }
        Ok(())
    }
}

impl WireConnection for SqliteConnection {
    fn ping(&mut self) -> Result<()> {
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn query(&mut self, sql: &str, params: &[Variant]) -> Result<RowSet> {
        self.run_query(sql, params)
    }

    fn exec(&mut self, sql: &str, params: &[Variant]) -> Result<ExecOutcome> {
        self.run_exec(sql, params)
    }

    fn prepare(&mut self, sql: &str, timeout: Option<Duration>) -> Result<StatementId> {
        // Validate syntax now so errors surface at Prepare time
        self.conn.prepare_cached(sql)?;
        let id = self.next_id;
        self.next_id += 1;
        self.statements.insert(
            id,
            Prepared {
                sql: sql.to_string(),
                timeout,
            },
        );
        Ok(id)
    }

    fn query_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<RowSet> {
        let (sql, timeout) = self.statement(id)?;
        self.with_timeout(timeout, |conn| conn.run_query(&sql, params))
    }

    fn exec_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<ExecOutcome> {
        let (sql, timeout) = self.statement(id)?;
        self.with_timeout(timeout, |conn| conn.run_exec(&sql, params))
    }

    fn close_prepared(&mut self, id: StatementId) -> Result<()> {
        self.statements.remove(&id);
        Ok(())
    }

    fn begin(&mut self, options: TxOptions) -> Result<()> {
        if let Some(timeout) = options.timeout {
            self.conn.busy_timeout(timeout)?;
        }
        if let Err(err) = self.conn.execute_batch("BEGIN TRANSACTION") {
            self.conn.busy_timeout(self.ambient_timeout())?;
            return Err(err.into());
        }
        self.tx_timeout = options.timeout;
        if options.read_only {
            self.conn.execute_batch("PRAGMA query_only = 1")?;
            self.read_only_tx = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.end_transaction("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.end_transaction("ROLLBACK")
    }
}

fn to_sql_value(value: &Variant) -> Value {
    match value {
        Variant::Empty | Variant::Null => Value::Null,
        Variant::Bool(b) => Value::Integer(i64::from(*b)),
        Variant::Int(i) => Value::Integer(*i),
        Variant::Float(f) => Value::Real(*f),
        Variant::String(s) => Value::Text(s.clone()),
        Variant::Bytes(b) => Value::Blob(b.clone()),
        Variant::Date(d) => Value::Text(d.format("%Y-%m-%d %H:%M:%S").to_string()),
        Variant::Array(_) | Variant::Object(_) => Value::Text(value.to_string()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Variant {
    match value {
        ValueRef::Null => Variant::Null,
        ValueRef::Integer(i) => Variant::Int(i),
        ValueRef::Real(f) => Variant::Float(f),
        ValueRef::Text(t) => Variant::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Variant::Bytes(b.to_vec()),
    }
}
