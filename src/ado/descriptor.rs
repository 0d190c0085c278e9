//! Connection descriptor grammar
//!
//! Three families, tried in order:
//!
//! 1. `embedded:<path>` / `sqlite:<path>`: single-file database, empty path
//!    means in-memory.
//! 2. Anything naming a Jet/ACE provider: desktop file served by the bridge.
//! 3. ODBC `key=value;...` with a `Driver=` (or SQL Server `Provider=`) hint,
//!    mapped to the wire DSN of the selected backend.
//!
//! A descriptor that matches none of these resolves to an error; the
//! Connection decides what to do with it.

use crate::drivers::DriverKind;
use crate::error::{Error, Result};
use std::collections::HashMap;

pub const MEMORY_PATH: &str = ":memory:";

const EMBEDDED_PREFIXES: &[&str] = &["embedded:", "sqlite:"];
const DESKTOP_MARKERS: &[&str] = &["microsoft.jet.oledb", "microsoft.ace.oledb"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Embedded { path: String },
    Bridge { descriptor: String },
    Wire { kind: DriverKind, dsn: String },
}

impl Descriptor {
    pub fn driver_name(&self) -> &'static str {
        match self {
            Descriptor::Embedded { .. } => DriverKind::Sqlite.name(),
            Descriptor::Bridge { .. } => "bridge",
            Descriptor::Wire { kind, .. } => kind.name(),
        }
    }
}

pub fn resolve(descriptor: &str) -> Result<Descriptor> {
    let trimmed = descriptor.trim();
    if trimmed.is_empty() {
        return Err(Error::Descriptor("connection string is empty".to_string()));
    }

    if let Some(path) = strip_embedded_prefix(trimmed) {
        return Ok(Descriptor::Embedded {
            path: path_or_memory(path),
        });
    }

    if is_desktop_descriptor(trimmed) {
        return Ok(Descriptor::Bridge {
            descriptor: trimmed.to_string(),
        });
    }

    let params = OdbcParams::parse(trimmed);
    let driver = params.get("driver").to_ascii_lowercase();
    let provider = params.get("provider").to_ascii_lowercase();

    if driver.contains("sqlite") {
        let path = params.first_of(&["data source", "datasource", "database"]);
        return Ok(Descriptor::Embedded {
            path: path_or_memory(&path),
        });
    }
    if driver.contains("mysql") || driver.contains("mariadb") {
        return Ok(params.wire(DriverKind::Mysql));
    }
    if driver.contains("postgres") {
        return Ok(params.wire(DriverKind::Postgres));
    }
    if driver.contains("sql server")
        || driver.contains("mssql")
        || provider.contains("sqloledb")
        || provider.contains("sqlncli")
    {
        return Ok(params.wire(DriverKind::Mssql));
    }

    Err(Error::Descriptor(
        "unsupported or invalid connection string".to_string(),
    ))
}

pub fn is_desktop_descriptor(descriptor: &str) -> bool {
    let lower = descriptor.to_ascii_lowercase();
    DESKTOP_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn strip_embedded_prefix(descriptor: &str) -> Option<&str> {
    EMBEDDED_PREFIXES.iter().find_map(|prefix| {
        descriptor
            .get(..prefix.len())
            .filter(|head| head.eq_ignore_ascii_case(prefix))
            .map(|_| descriptor[prefix.len()..].trim())
    })
}

fn path_or_memory(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        MEMORY_PATH.to_string()
    } else {
        path.to_string()
    }
}

/// Adds `UID`/`PWD` from `Open`'s optional arguments when the descriptor does
/// not carry credentials already. Prefix descriptors are left alone.
pub fn fold_credentials(descriptor: &str, user: &str, password: &str) -> String {
    let trimmed = descriptor.trim();
    if strip_embedded_prefix(trimmed).is_some() {
        return trimmed.to_string();
    }
    let params = OdbcParams::parse(trimmed);
    let mut out = trimmed.trim_end_matches(';').to_string();
    if !user.is_empty() && params.first_of(USER_KEYS).is_empty() {
        out.push_str(&format!(";UID={user}"));
    }
    if !password.is_empty() && params.first_of(PASSWORD_KEYS).is_empty() {
        out.push_str(&format!(";PWD={password}"));
    }
    out
}

const SERVER_KEYS: &[&str] = &["server", "data source", "datasource", "host", "address", "addr"];
const DATABASE_KEYS: &[&str] = &["database", "initial catalog", "dbname", "data source name"];
const USER_KEYS: &[&str] = &["uid", "user id", "user", "username"];
const PASSWORD_KEYS: &[&str] = &["pwd", "password", "pass"];

/// Case-insensitive `key=value;` pairs with brace-stripped values
#[derive(Debug, Default)]
struct OdbcParams {
    values: HashMap<String, String>,
}

impl OdbcParams {
    fn parse(descriptor: &str) -> Self {
        let values = descriptor
            .split(';')
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                let key = key.trim().to_ascii_lowercase();
                if key.is_empty() {
                    return None;
                }
                let value = value.trim().trim_start_matches('{').trim_end_matches('}');
                Some((key, value.trim().to_string()))
            })
            .collect();
        Self { values }
    }

    fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    fn first_of(&self, keys: &[&str]) -> String {
        keys.iter()
            .map(|key| self.get(key))
            .find(|value| !value.is_empty())
            .unwrap_or("")
            .to_string()
    }

    fn port(&self, kind: DriverKind) -> String {
        match self.get("port") {
            "" => kind.default_port().map(|p| p.to_string()).unwrap_or_default(),
            port => port.to_string(),
        }
    }

    fn wire(&self, kind: DriverKind) -> Descriptor {
        let server = self.first_of(SERVER_KEYS);
        let database = self.first_of(DATABASE_KEYS);
        let user = self.first_of(USER_KEYS);
        let password = self.first_of(PASSWORD_KEYS);
        let port = self.port(kind);

        let dsn = match kind {
            DriverKind::Mysql => {
                format!("{user}:{password}@tcp({server}:{port})/{database}?parseTime=true")
            }
            DriverKind::Postgres => format!(
                "user={} password={} host={} port={} dbname={} sslmode=disable",
                pg_quote(&user),
                pg_quote(&password),
                pg_quote(&server),
                port,
                pg_quote(&database)
            ),
            DriverKind::Mssql => format!(
                "server={server};user id={user};password={password};database={database};port={port}"
            ),
            DriverKind::Sqlite => path_or_memory(&database),
        };
        Descriptor::Wire { kind, dsn }
    }
}

/// libpq key/value quoting for empty values and values with spaces or quotes
pub(crate) fn pg_quote(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsn(descriptor: &str) -> String {
        match resolve(descriptor).unwrap() {
            Descriptor::Wire { dsn, .. } => dsn,
            other => panic!("expected wire descriptor, got {other:?}"),
        }
    }

    #[test]
    fn test_embedded_prefixes() {
        assert_eq!(
            resolve("embedded:data/app.db").unwrap(),
            Descriptor::Embedded {
                path: "data/app.db".into()
            }
        );
        assert_eq!(
            resolve("SQLite:").unwrap(),
            Descriptor::Embedded {
                path: MEMORY_PATH.into()
            }
        );
    }

    #[test]
    fn test_desktop_marker_routes_to_bridge() {
        let d = "Provider=Microsoft.Jet.OLEDB.4.0;Data Source=C:\\data\\shop.mdb";
        assert_eq!(
            resolve(d).unwrap(),
            Descriptor::Bridge {
                descriptor: d.into()
            }
        );
    }

    #[test]
    fn test_mysql_mapping() {
        insta::assert_snapshot!(
            dsn("Driver={MySQL ODBC 8.0 Driver};Server=db1;Database=shop;UID=app;PWD=secret"),
            @"app:secret@tcp(db1:3306)/shop?parseTime=true"
        );
    }

    #[test]
    fn test_postgres_mapping() {
        insta::assert_snapshot!(
            dsn("driver={PostgreSQL Unicode};host=pg;port=6543;dbname=crm;user=ops;password=p w"),
            @"user=ops password='p w' host=pg port=6543 dbname=crm sslmode=disable"
        );
        insta::assert_snapshot!(
            dsn("Driver={PostgreSQL};Server=pg;Database=crm;UID=ops"),
            @"user=ops password='' host=pg port=5432 dbname=crm sslmode=disable"
        );
    }

    #[test]
    fn test_sql_server_mapping() {
        insta::assert_snapshot!(
            dsn("Provider=SQLOLEDB;Data Source=sql01;Initial Catalog=erp;User ID=sa;Password=x"),
            @"server=sql01;user id=sa;password=x;database=erp;port=1433"
        );
        assert_eq!(
            resolve("Driver={ODBC Driver 17 for SQL Server};Server=s").unwrap(),
            Descriptor::Wire {
                kind: DriverKind::Mssql,
                dsn: "server=s;user id=;password=;database=;port=1433".into()
            }
        );
    }

    #[test]
    fn test_odbc_sqlite() {
        assert_eq!(
            resolve("Driver={SQLite3 ODBC Driver};Database=site.db").unwrap(),
            Descriptor::Embedded {
                path: "site.db".into()
            }
        );
    }

    #[test]
    fn test_unresolvable_and_empty() {
        assert!(matches!(resolve("   "), Err(Error::Descriptor(_))));
        assert!(matches!(
            resolve("Driver={Oracle};Server=x"),
            Err(Error::Descriptor(_))
        ));
        assert!(matches!(resolve("nonsense"), Err(Error::Descriptor(_))));
    }

    #[test]
    fn test_fold_credentials() {
        assert_eq!(
            fold_credentials("Driver={MySQL};Server=h;", "u", "p"),
            "Driver={MySQL};Server=h;UID=u;PWD=p"
        );
        assert_eq!(
            fold_credentials("Driver={MySQL};User=a", "u", ""),
            "Driver={MySQL};User=a"
        );
        assert_eq!(fold_credentials("embedded:x.db", "u", "p"), "embedded:x.db");
    }
}
