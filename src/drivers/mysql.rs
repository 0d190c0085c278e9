//! MySQL wire driver
//!
//! DSN format: `user:pass@tcp(host:port)/db?parseTime=true`

use super::{
    ConnectOptions, DriverKind, ExecOutcome, RowSet, StatementId, TxOptions, WireConnection,
    WireDriver,
};
use crate::core::Variant;
use crate::error::{Error, Result};
use ::mysql::prelude::Queryable;
use ::mysql::{Conn, OptsBuilder, Params, Statement, Value};
use chrono::{Datelike, NaiveDate, Timelike};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug)]
pub struct MysqlDriver;

/// Parts of a `user:pass@tcp(host:port)/db` DSN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlDsn {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl MysqlDsn {
    pub fn parse(dsn: &str) -> Result<Self> {
        let (credentials, rest) = dsn
            .rsplit_once('@')
            .ok_or_else(|| Error::Descriptor(format!("mysql dsn missing '@': {dsn}")))?;
        let (user, password) = credentials.split_once(':').unwrap_or((credentials, ""));

        let (address, path) = match rest.strip_prefix("tcp(") {
            Some(inner) => inner
                .split_once(')')
                .ok_or_else(|| Error::Descriptor("mysql dsn has an unclosed tcp(".to_string()))?,
            None => rest.split_once('/').map(|(a, _)| (a, &rest[a.len()..])).unwrap_or((rest, "")),
        };
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().unwrap_or(3306)),
            None => (address, 3306),
        };
        let database = path
            .trim_start_matches('/')
            .split('?')
            .next()
            .unwrap_or_default();

        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
            host: if host.is_empty() { "localhost" } else { host }.to_string(),
            port,
            database: database.to_string(),
        })
    }
}

impl WireDriver for MysqlDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Mysql
    }

    fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<Box<dyn WireConnection>> {
        let parsed = MysqlDsn::parse(dsn)?;
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(parsed.host))
            .tcp_port(parsed.port)
            .user(Some(parsed.user))
            .pass(Some(parsed.password))
            .db_name(Some(parsed.database).filter(|db| !db.is_empty()))
            .tcp_connect_timeout(Some(options.timeout));
        let conn = Conn::new(opts)?;

        Ok(Box::new(MysqlConnection {
            conn,
            statements: HashMap::new(),
            next_id: 1,
            tx_timeout: None,
        }))
    }
}

/// Statement and transaction timeouts set `max_execution_time` only while
/// they apply; the server default (0, unlimited) is restored after.
struct MysqlConnection {
    conn: Conn,
    statements: HashMap<StatementId, (Statement, Option<Duration>)>,
    next_id: StatementId,
    tx_timeout: Option<Duration>,
}

impl MysqlConnection {
    fn run_query(&mut self, stmt: &Statement, params: &[Variant]) -> Result<RowSet> {
        let mut result = self.conn.exec_iter(stmt, to_params(params))?;
        let columns: Vec<String> = result
            .columns()
            .as_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();

        let mut rows = Vec::new();
        for row in result.by_ref() {
            let row = row?;
            rows.push(row.unwrap().into_iter().map(from_mysql_value).collect());
        }
        Ok(RowSet { columns, rows })
    }

    fn run_exec(&mut self, stmt: &Statement, params: &[Variant]) -> Result<ExecOutcome> {
        self.conn.exec_drop(stmt, to_params(params))?;
        Ok(ExecOutcome {
            rows_affected: self.conn.affected_rows() as i64,
            last_insert_id: self.conn.last_insert_id() as i64,
        })
    }

    fn statement(&self, id: StatementId) -> Result<(Statement, Option<Duration>)> {
        self.statements.get(&id).cloned().ok_or(Error::Closed("statement"))
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.conn.query_drop(max_execution_time(timeout))?;
        Ok(())
    }

    fn with_timeout<T>(
        &mut self,
        timeout: Option<Duration>,
        run: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if timeout.is_none() {
            return run(self);
        }
        self.set_timeout(timeout)?;
        let result = run(self);
        self.set_timeout(self.tx_timeout)?;
        result
    }

    fn end_transaction(&mut self, verb: &str) -> Result<()> {
        self.conn.query_drop(verb)?;
        if self.tx_timeout.take().is_some() {
            self.set_timeout(None)?;
        }
        Ok(())
    }
}

fn max_execution_time(timeout: Option<Duration>) -> String {
    let ms = timeout.map_or(0, |t| t.as_millis());
    format!("SET SESSION max_execution_time = {ms}")
}

impl WireConnection for MysqlConnection {
    fn ping(&mut self) -> Result<()> {
        self.conn.query_drop("SELECT 1")?;
        Ok(())
    }

    fn query(&mut self, sql: &str, params: &[Variant]) -> Result<RowSet> {
        let stmt = self.conn.prep(sql)?;
        let result = self.run_query(&stmt, params);
        self.conn.close(stmt)?;
        result
    }

    fn exec(&mut self, sql: &str, params: &[Variant]) -> Result<ExecOutcome> {
        if params.is_empty() {
            self.conn.query_drop(sql)?;
            return Ok(ExecOutcome {
                rows_affected: self.conn.affected_rows() as i64,
                last_insert_id: self.conn.last_insert_id() as i64,
            });
        }
        let stmt = self.conn.prep(sql)?;
        let result = self.run_exec(&stmt, params);
        self.conn.close(stmt)?;
        result
    }

    fn prepare(&mut self, sql: &str, timeout: Option<Duration>) -> Result<StatementId> {
        let stmt = self.conn.prep(sql)?;
        let id = self.next_id;
        self.next_id += 1;
        self.statements.insert(id, (stmt, timeout));
        Ok(id)
    }

    fn query_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<RowSet> {
        let (stmt, timeout) = self.statement(id)?;
        self.with_timeout(timeout, |conn| conn.run_query(&stmt, params))
    }

    fn exec_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<ExecOutcome> {
        let (stmt, timeout) = self.statement(id)?;
        self.with_timeout(timeout, |conn| conn.run_exec(&stmt, params))
    }

    fn close_prepared(&mut self, id: StatementId) -> Result<()> {
        if let Some((stmt, _)) = self.statements.remove(&id) {
            self.conn.close(stmt)?;
        }
        Ok(())
    }

    fn begin(&mut self, options: TxOptions) -> Result<()> {
        if options.timeout.is_some() {
            self.set_timeout(options.timeout)?;
        }
        let started = self.conn.query_drop(if options.read_only {
            "START TRANSACTION READ ONLY"
        } else {
            "START TRANSACTION"
        });
        if let Err(err) = started {
            if options.timeout.is_some() {
                self.set_timeout(self.tx_timeout)?;
            }
            return Err(err.into());
        }
        self.tx_timeout = options.timeout;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.end_transaction("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.end_transaction("ROLLBACK")
    }
}

fn to_params(params: &[Variant]) -> Params {
    if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(params.iter().map(to_mysql_value).collect())
    }
}

fn to_mysql_value(value: &Variant) -> Value {
    match value {
        Variant::Empty | Variant::Null => Value::NULL,
        Variant::Bool(b) => Value::Int(i64::from(*b)),
        Variant::Int(i) => Value::Int(*i),
        Variant::Float(f) => Value::Double(*f),
        Variant::String(s) => Value::Bytes(s.as_bytes().to_vec()),
        Variant::Bytes(b) => Value::Bytes(b.clone()),
        Variant::Date(d) => Value::Date(
            d.year() as u16,
            d.month() as u8,
            d.day() as u8,
            d.hour() as u8,
            d.minute() as u8,
            d.second() as u8,
            d.nanosecond() / 1_000,
        ),
        Variant::Array(_) | Variant::Object(_) => Value::Bytes(value.to_string().into_bytes()),
    }
}

fn from_mysql_value(value: Value) -> Variant {
    match value {
        Value::NULL => Variant::Null,
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Variant::String(text),
            Err(err) => Variant::Bytes(err.into_bytes()),
        },
        Value::Int(i) => Variant::Int(i),
        Value::UInt(u) => i64::try_from(u)
            .map(Variant::Int)
            .unwrap_or(Variant::Float(u as f64)),
        Value::Float(f) => Variant::Float(f as f64),
        Value::Double(f) => Variant::Float(f),
        Value::Date(y, m, d, h, mi, s, us) => NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32)
            .and_then(|date| date.and_hms_micro_opt(h as u32, mi as u32, s as u32, us))
            .map(Variant::Date)
            .unwrap_or(Variant::Null),
        Value::Time(negative, days, h, m, s, _) => {
            let hours = days * 24 + h as u32;
            let sign = if negative { "-" } else { "" };
            Variant::String(format!("{sign}{hours:02}:{m:02}:{s:02}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_execution_time_statement() {
        assert_eq!(
            max_execution_time(Some(Duration::from_millis(1500))),
            "SET SESSION max_execution_time = 1500"
        );
        assert_eq!(max_execution_time(None), "SET SESSION max_execution_time = 0");
    }

    #[test]
    fn test_parse_dsn() {
        let dsn = MysqlDsn::parse("app:s3cret@tcp(db.local:3307)/shop?parseTime=true").unwrap();
        assert_eq!(
            dsn,
            MysqlDsn {
                user: "app".into(),
                password: "s3cret".into(),
                host: "db.local".into(),
                port: 3307,
                database: "shop".into(),
            }
        );
    }

    #[test]
    fn test_parse_dsn_defaults() {
        let dsn = MysqlDsn::parse("root:@tcp(:3306)/").unwrap();
        assert_eq!(dsn.host, "localhost");
        assert_eq!(dsn.password, "");
        assert_eq!(dsn.database, "");
        assert!(MysqlDsn::parse("no-at-sign").is_err());
    }

    #[test]
    fn test_password_with_at_sign() {
        let dsn = MysqlDsn::parse("u:p@ss@tcp(h:1)/d").unwrap();
        assert_eq!(dsn.password, "p@ss");
        assert_eq!(dsn.host, "h");
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(from_mysql_value(Value::Bytes(b"abc".to_vec())), Variant::from("abc"));
        assert_eq!(from_mysql_value(Value::UInt(5)), Variant::Int(5));
        assert_eq!(from_mysql_value(Value::NULL), Variant::Null);
        assert_eq!(
            from_mysql_value(Value::Time(false, 1, 2, 3, 4, 0)),
            Variant::from("26:03:04")
        );
        let date = from_mysql_value(Value::Date(2024, 2, 29, 8, 0, 0, 0));
        assert_eq!(date.to_string(), "2/29/2024 8:00:00 AM");
        assert_eq!(to_mysql_value(&Variant::Bool(true)), Value::Int(1));
        assert!(matches!(to_params(&[]), Params::Empty));
    }
}
