//! PostgreSQL wire driver
//!
//! DSN format: `user=.. password=.. host=.. port=.. dbname=.. sslmode=disable`.
//! Parameters are bound against the types the server inferred for the
//! prepared statement, so a script value such as `"42"` can feed an `int4`
//! column.

use super::{
    ConnectOptions, DriverKind, ExecOutcome, RowSet, StatementId, TxOptions, WireConnection,
    WireDriver,
};
use crate::core::Variant;
use crate::error::{Error, Result};
use ::postgres::types::{ToSql, Type};
use ::postgres::{Client, Config, NoTls, Row, Statement};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct PostgresDriver;

impl WireDriver for PostgresDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
    }

    fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<Box<dyn WireConnection>> {
        let mut config = Config::from_str(dsn)?;
        config.connect_timeout(options.timeout);
        let client = config.connect(NoTls)?;

        Ok(Box::new(PostgresConnection {
            client,
            statements: HashMap::new(),
            next_id: 1,
        }))
    }
}

struct PostgresConnection {
    client: Client,
    statements: HashMap<StatementId, Statement>,
    next_id: StatementId,
}

type BoxedParam = Box<dyn ToSql + Sync>;

impl PostgresConnection {
    fn run_query(&mut self, stmt: &Statement, params: &[Variant]) -> Result<RowSet> {
        let bound = bind_params(params, stmt.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p.as_ref()).collect();
        let rows = self.client.query(stmt, &refs)?;

        let columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = rows.iter().map(convert_row).collect();
        Ok(RowSet { columns, rows })
    }

    fn run_exec(&mut self, stmt: &Statement, params: &[Variant]) -> Result<ExecOutcome> {
        let bound = bind_params(params, stmt.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p.as_ref()).collect();
        let affected = self.client.execute(stmt, &refs)?;
        Ok(ExecOutcome {
            rows_affected: affected as i64,
            last_insert_id: 0,
        })
    }

    fn statement(&self, id: StatementId) -> Result<Statement> {
        self.statements.get(&id).cloned().ok_or(Error::Closed("statement"))
    }
}

impl WireConnection for PostgresConnection {
    fn ping(&mut self) -> Result<()> {
        self.client.batch_execute("SELECT 1")?;
        Ok(())
    }

    fn query(&mut self, sql: &str, params: &[Variant]) -> Result<RowSet> {
        let stmt = self.client.prepare(sql)?;
        self.run_query(&stmt, params)
    }

    fn exec(&mut self, sql: &str, params: &[Variant]) -> Result<ExecOutcome> {
        let stmt = self.client.prepare(sql)?;
        self.run_exec(&stmt, params)
    }

    fn prepare(&mut self, sql: &str, timeout: Option<Duration>) -> Result<StatementId> {
        if let Some(timeout) = timeout {
            self.client
                .batch_execute(&format!("SET statement_timeout = {}", timeout.as_millis()))?;
        }
        let stmt = self.client.prepare(sql)?;
        let id = self.next_id;
        self.next_id += 1;
        self.statements.insert(id, stmt);
        Ok(id)
    }

    fn query_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<RowSet> {
        let stmt = self.statement(id)?;
        self.run_query(&stmt, params)
    }

    fn exec_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<ExecOutcome> {
        let stmt = self.statement(id)?;
        self.run_exec(&stmt, params)
    }

    fn close_prepared(&mut self, id: StatementId) -> Result<()> {
        // Dropping the last handle deallocates it on the server
        self.statements.remove(&id);
        Ok(())
    }

    fn begin(&mut self, options: TxOptions) -> Result<()> {
        self.client.batch_execute(if options.read_only {
            "BEGIN READ ONLY"
        } else {
            "BEGIN"
        })?;
        if let Some(timeout) = options.timeout {
            self.client
                .batch_execute(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.client.batch_execute("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.client.batch_execute("ROLLBACK")?;
        Ok(())
    }
}

fn bind_params(params: &[Variant], types: &[Type]) -> Result<Vec<BoxedParam>> {
    params
        .iter()
        .enumerate()
        .map(|(i, value)| bind_param(value, types.get(i).unwrap_or(&Type::TEXT)))
        .collect()
}

/// Integer parameter narrowed to a smaller column type; out-of-range values
/// are refused rather than wrapped
fn narrow<T: TryFrom<i64>>(value: &Variant, ty: &Type) -> Result<T> {
    let wide = value.to_int();
    T::try_from(wide).map_err(|_| Error::Execution(format!("value {wide} out of range for {ty}")))
}

/// Converts one script value to the Rust type the server expects for `ty`
fn bind_param(value: &Variant, ty: &Type) -> Result<BoxedParam> {
    let value = value.resolve_default();
    let present = !value.is_nothing();
    let param: BoxedParam = match *ty {
        Type::BOOL => Box::new(present.then(|| value.to_bool())),
        Type::INT2 => Box::new(present.then(|| narrow::<i16>(&value, ty)).transpose()?),
        Type::INT4 => Box::new(present.then(|| narrow::<i32>(&value, ty)).transpose()?),
        Type::INT8 => Box::new(present.then(|| value.to_int())),
        Type::FLOAT4 => Box::new(present.then(|| value.to_float() as f32)),
        Type::FLOAT8 => Box::new(present.then(|| value.to_float())),
        Type::NUMERIC => Box::new(
            present
                .then(|| Decimal::from_str(&value.to_string()).ok())
                .flatten(),
        ),
        Type::BYTEA => Box::new(present.then(|| value.to_bytes())),
        Type::TIMESTAMP => Box::new(value.to_date()),
        Type::TIMESTAMPTZ => Box::new(value.to_date().map(|d| d.and_utc())),
        Type::DATE => Box::new(value.to_date().map(|d| d.date())),
        _ => Box::new(present.then(|| value.to_string())),
    };
    Ok(param)
}

fn convert_row(row: &Row) -> Vec<Variant> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| convert_cell(row, i, column.type_()))
        .collect()
}

fn convert_cell(row: &Row, i: usize, ty: &Type) -> Variant {
    fn get<'a, T: ::postgres::types::FromSql<'a>>(row: &'a Row, i: usize) -> Option<T> {
        row.try_get::<_, Option<T>>(i).ok().flatten()
    }

    match *ty {
        Type::BOOL => get::<bool>(row, i).into(),
        Type::INT2 => get::<i16>(row, i).map(|v| v as i64).into(),
        Type::INT4 => get::<i32>(row, i).map(|v| v as i64).into(),
        Type::INT8 => get::<i64>(row, i).into(),
        Type::OID => get::<u32>(row, i).map(|v| v as i64).into(),
        Type::FLOAT4 => get::<f32>(row, i).map(|v| v as f64).into(),
        Type::FLOAT8 => get::<f64>(row, i).into(),
        Type::NUMERIC => get::<Decimal>(row, i).and_then(|d| d.to_f64()).into(),
        Type::BYTEA => get::<Vec<u8>>(row, i).into(),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, i).into(),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, i).map(|d| d.naive_utc()).into(),
        Type::DATE => get::<NaiveDate>(row, i)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .into(),
        _ => get::<String>(row, i).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsn_parses_as_config() {
        let config =
            Config::from_str("user=app password=pw host=db port=5433 dbname=shop sslmode=disable")
                .unwrap();
        assert_eq!(config.get_user(), Some("app"));
        assert_eq!(config.get_dbname(), Some("shop"));
        assert_eq!(config.get_ports(), &[5433]);
    }

    #[test]
    fn test_bind_param_types() {
        let shown = |value: Variant, ty: Type| format!("{:?}", bind_param(&value, &ty).unwrap());
        assert_eq!(shown(Variant::from("42"), Type::INT4), "Some(42)");
        assert_eq!(shown(Variant::Int(1), Type::BOOL), "Some(true)");
        assert_eq!(shown(Variant::from("2.5"), Type::FLOAT8), "Some(2.5)");
        assert_eq!(shown(Variant::Null, Type::INT8), "None");
        assert_eq!(shown(Variant::Int(3), Type::TEXT), "Some(\"3\")");
        assert_eq!(shown(Variant::from("2024-01-02"), Type::DATE), "Some(2024-01-02)");
    }

    #[test]
    fn test_missing_types_bind_as_text() {
        let bound = bind_params(&[Variant::Int(1), Variant::Int(2)], &[Type::INT4]).unwrap();
        assert_eq!(format!("{:?}", bound[0]), "Some(1)");
        assert_eq!(format!("{:?}", bound[1]), "Some(\"2\")");
    }

    #[test]
    fn test_out_of_range_int_params_are_refused() {
        let err = bind_param(&Variant::Int(3_000_000_000), &Type::INT4).unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert!(bind_param(&Variant::Int(40_000), &Type::INT2).is_err());
        assert!(bind_param(&Variant::Int(i64::from(i32::MAX)), &Type::INT4).is_ok());
    }
}
