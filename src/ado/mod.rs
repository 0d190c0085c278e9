//! ADO object model: Connection, Recordset, Fields and Errors

pub mod bridge;
pub mod connection;
pub mod criteria;
pub mod descriptor;
pub mod errors;
pub mod fields;
pub mod persist;
pub mod recordset;

pub use connection::Connection;
pub use errors::{AdoError, Errors};
pub use fields::{Field, Fields};
pub use recordset::Recordset;
