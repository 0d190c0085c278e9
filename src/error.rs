//! Error types for the data-access layer
//!
//! Internal operations return [`Result`]. At the object boundary these errors
//! are never raised to the script: they are appended to a Connection's
//! `Errors` collection or turned into an empty result.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Open or ping failure
    #[error("connection failed: {0}")]
    Connection(String),

    /// Query or exec failure raised by this layer (not by a driver)
    #[error("execution failed: {0}")]
    Execution(String),

    /// Malformed or unresolvable connection descriptor
    #[error("invalid connection string: {0}")]
    Descriptor(String),

    /// Feature not available on this host or backend
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Use of a connection, statement or transaction after it was closed
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Error reported by a native driver
    #[error("{driver}: {message}")]
    Driver {
        driver: &'static str,
        message: String,
        sql_state: Option<String>,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Five character SQLSTATE when the driver reported one
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Driver { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Name of the component that raised the error, used as `Error.Source`
    pub fn source_name(&self) -> &'static str {
        match self {
            Error::Driver { driver, .. } => driver,
            Error::Descriptor(_) | Error::Connection(_) => "ADODB.Connection",
            _ => "classic-ado",
        }
    }

    pub(crate) fn driver(driver: &'static str, message: impl Into<String>) -> Self {
        Error::Driver {
            driver,
            message: message.into(),
            sql_state: None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::driver("sqlite", err.to_string())
    }
}

impl From<mysql::Error> for Error {
    fn from(err: mysql::Error) -> Self {
        let sql_state = match &err {
            mysql::Error::MySqlError(server) => Some(server.state.clone()),
            _ => None,
        };
        Error::Driver {
            driver: "mysql",
            message: err.to_string(),
            sql_state,
        }
    }
}

impl From<postgres::Error> for Error {
    fn from(err: postgres::Error) -> Self {
        Error::Driver {
            driver: "postgres",
            sql_state: err.code().map(|code| code.code().to_string()),
            message: err.to_string(),
        }
    }
}

impl From<tiberius::error::Error> for Error {
    fn from(err: tiberius::error::Error) -> Self {
        let sql_state = match &err {
            tiberius::error::Error::Server(token) => Some(format!("{:05}", token.code())),
            _ => None,
        };
        Error::Driver {
            driver: "mssql",
            message: err.to_string(),
            sql_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = Error::driver("sqlite", "no such table: people");
        assert_eq!(err.to_string(), "sqlite: no such table: people");
        assert_eq!(err.source_name(), "sqlite");
        assert!(err.sql_state().is_none());
    }

    #[test]
    fn test_closed_display() {
        assert_eq!(Error::Closed("transaction").to_string(), "transaction is closed");
    }

    #[test]
    fn test_rusqlite_conversion() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::Driver { driver: "sqlite", .. }));
    }
}
