//! SQL Server wire driver
//!
//! Runs tiberius on a private current-thread tokio runtime and blocks on each
//! call, which keeps the driver surface synchronous like the others.
//!
//! DSN format: `server=..;user id=..;password=..;database=..;port=..`

use super::{
    ConnectOptions, DriverKind, ExecOutcome, RowSet, StatementId, TxOptions, WireConnection,
    WireDriver,
};
use crate::core::Variant;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, ToSql};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

type MssqlClient = Client<Compat<TcpStream>>;

#[derive(Debug)]
pub struct MssqlDriver;

/// Parsed `key=value;` SQL Server DSN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MssqlDsn {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub encrypt: bool,
}

impl MssqlDsn {
    pub fn parse(dsn: &str) -> Self {
        let mut parsed = MssqlDsn {
            host: "localhost".to_string(),
            port: 1433,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            encrypt: false,
        };
        for part in dsn.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "server" | "host" if !value.is_empty() => parsed.host = value.to_string(),
                "port" => parsed.port = value.parse().unwrap_or(1433),
                "user id" | "uid" | "user" => parsed.user = value.to_string(),
                "password" | "pwd" => parsed.password = value.to_string(),
                "database" => parsed.database = value.to_string(),
                "encrypt" => parsed.encrypt = matches!(value.to_ascii_lowercase().as_str(), "true" | "yes"),
                _ => {}
            }
        }
        parsed
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.authentication(AuthMethod::sql_server(&self.user, &self.password));
        if !self.database.is_empty() {
            config.database(&self.database);
        }
        config.encryption(if self.encrypt {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });
        config.trust_cert();
        config
    }
}

impl WireDriver for MssqlDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Mssql
    }

    fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<Box<dyn WireConnection>> {
        let config = MssqlDsn::parse(dsn).config();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let client = block_on(&runtime, Some(options.timeout), async {
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true).ok();
            Ok::<_, Error>(Client::connect(config, tcp.compat_write()).await?)
        })?;

        Ok(Box::new(MssqlConnection {
            runtime,
            client,
            statements: HashMap::new(),
            next_id: 1,
            timeout: None,
        }))
    }
}

struct MssqlConnection {
    runtime: Runtime,
    client: MssqlClient,
    statements: HashMap<StatementId, String>,
    next_id: StatementId,
    timeout: Option<Duration>,
}

fn block_on<T>(
    runtime: &Runtime,
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    runtime.block_on(async move {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(limit)),
            },
            None => fut.await,
        }
    })
}

impl MssqlConnection {
    fn run_query(&mut self, sql: &str, params: &[Variant]) -> Result<RowSet> {
        let Self {
            runtime,
            client,
            timeout,
            ..
        } = self;
        let bound = bind_params(params);
        let refs: Vec<&dyn ToSql> = bound.iter().map(|p| p.as_ref()).collect();

        block_on(runtime, *timeout, async {
            let stream = client.query(sql, &refs).await?;
            let rows = stream.into_first_result().await?;
            let columns: Vec<String> = rows
                .first()
                .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default();
            let rows = rows.iter().map(convert_row).collect();
            Ok::<_, Error>(RowSet { columns, rows })
        })
    }

    fn run_exec(&mut self, sql: &str, params: &[Variant]) -> Result<ExecOutcome> {
        let Self {
            runtime,
            client,
            timeout,
            ..
        } = self;
        let bound = bind_params(params);
        let refs: Vec<&dyn ToSql> = bound.iter().map(|p| p.as_ref()).collect();

        block_on(runtime, *timeout, async {
            let result = client.execute(sql, &refs).await?;
            Ok::<_, Error>(ExecOutcome {
                rows_affected: result.total() as i64,
                last_insert_id: 0,
            })
        })
    }

    fn simple(&mut self, sql: &str) -> Result<()> {
        let Self {
            runtime,
            client,
            timeout,
            ..
        } = self;
        block_on(runtime, *timeout, async {
            client.simple_query(sql).await?.into_results().await?;
            Ok::<_, Error>(())
        })
    }

    fn statement(&self, id: StatementId) -> Result<String> {
        self.statements.get(&id).cloned().ok_or(Error::Closed("statement"))
    }
}

impl WireConnection for MssqlConnection {
    fn ping(&mut self) -> Result<()> {
        self.simple("SELECT 1")
    }

    fn query(&mut self, sql: &str, params: &[Variant]) -> Result<RowSet> {
        self.run_query(sql, params)
    }

    fn exec(&mut self, sql: &str, params: &[Variant]) -> Result<ExecOutcome> {
        self.run_exec(sql, params)
    }

    fn prepare(&mut self, sql: &str, timeout: Option<Duration>) -> Result<StatementId> {
        // tiberius prepares per call (sp_executesql); keep the text
        if timeout.is_some() {
            self.timeout = timeout;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.statements.insert(id, sql.to_string());
        Ok(id)
    }

    fn query_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<RowSet> {
        let sql = self.statement(id)?;
        self.run_query(&sql, params)
    }

    fn exec_prepared(&mut self, id: StatementId, params: &[Variant]) -> Result<ExecOutcome> {
        let sql = self.statement(id)?;
        self.run_exec(&sql, params)
    }

    fn close_prepared(&mut self, id: StatementId) -> Result<()> {
        self.statements.remove(&id);
        Ok(())
    }

    fn begin(&mut self, options: TxOptions) -> Result<()> {
        if options.timeout.is_some() {
            self.timeout = options.timeout;
        }
        // SQL Server has no read-only transaction mode; snapshot reads are
        // the closest and need no extra verb here
        self.simple("BEGIN TRANSACTION")
    }

    fn commit(&mut self) -> Result<()> {
        self.simple("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.simple("ROLLBACK")
    }
}

fn bind_params(params: &[Variant]) -> Vec<Box<dyn ToSql>> {
    params.iter().map(bind_param).collect()
}

fn bind_param(value: &Variant) -> Box<dyn ToSql> {
    match value.resolve_default() {
        Variant::Empty | Variant::Null => Box::new(Option::<String>::None),
        Variant::Bool(b) => Box::new(b),
        Variant::Int(i) => Box::new(i),
        Variant::Float(f) => Box::new(f),
        Variant::Bytes(b) => Box::new(b),
        Variant::Date(d) => Box::new(d),
        other => Box::new(other.to_string()),
    }
}

fn convert_column_data(data: &ColumnData<'_>) -> Variant {
    match data {
        ColumnData::Bit(Some(b)) => Variant::Bool(*b),
        ColumnData::U8(Some(v)) => Variant::Int(*v as i64),
        ColumnData::I16(Some(v)) => Variant::Int(*v as i64),
        ColumnData::I32(Some(v)) => Variant::Int(*v as i64),
        ColumnData::I64(Some(v)) => Variant::Int(*v),
        ColumnData::F32(Some(v)) => Variant::Float(*v as f64),
        ColumnData::F64(Some(v)) => Variant::Float(*v),
        ColumnData::Numeric(Some(n)) => {
            Variant::Float(n.value() as f64 / 10f64.powi(n.scale() as i32))
        }
        ColumnData::String(Some(s)) => Variant::String(s.to_string()),
        ColumnData::Guid(Some(g)) => Variant::String(g.to_string()),
        ColumnData::Binary(Some(b)) => Variant::Bytes(b.to_vec()),
        ColumnData::Xml(Some(xml)) => Variant::String(xml.to_string()),
        _ => Variant::Null,
    }
}

fn convert_row(row: &tiberius::Row) -> Vec<Variant> {
    row.cells()
        .enumerate()
        .map(|(i, (_, data))| match data {
            ColumnData::DateTime(Some(_))
            | ColumnData::SmallDateTime(Some(_))
            | ColumnData::DateTime2(Some(_)) => row
                .try_get::<chrono::NaiveDateTime, _>(i)
                .ok()
                .flatten()
                .into(),
            ColumnData::DateTimeOffset(Some(_)) => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                .ok()
                .flatten()
                .map(|dt| dt.naive_utc())
                .into(),
            ColumnData::Date(Some(_)) => row
                .try_get::<chrono::NaiveDate, _>(i)
                .ok()
                .flatten()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .into(),
            ColumnData::Time(Some(_)) => row
                .try_get::<chrono::NaiveTime, _>(i)
                .ok()
                .flatten()
                .map(|t| Variant::String(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Variant::Null),
            _ => convert_column_data(data),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dsn() {
        let dsn = MssqlDsn::parse("server=sql01;user id=sa;password=Pa;ss;database=crm;port=1444");
        assert_eq!(dsn.host, "sql01");
        assert_eq!(dsn.user, "sa");
        assert_eq!(dsn.password, "Pa");
        assert_eq!(dsn.database, "crm");
        assert_eq!(dsn.port, 1444);
        assert!(!dsn.encrypt);
    }

    #[test]
    fn test_parse_dsn_defaults() {
        let dsn = MssqlDsn::parse("server=;port=abc");
        assert_eq!(dsn.host, "localhost");
        assert_eq!(dsn.port, 1433);
    }

    #[test]
    fn test_column_data_conversion() {
        assert_eq!(convert_column_data(&ColumnData::I32(Some(5))), Variant::Int(5));
        assert_eq!(convert_column_data(&ColumnData::I32(None)), Variant::Null);
        assert_eq!(convert_column_data(&ColumnData::Bit(Some(true))), Variant::Bool(true));
        assert_eq!(
            convert_column_data(&ColumnData::String(Some("x".into()))),
            Variant::from("x")
        );
    }
}
