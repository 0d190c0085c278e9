//! Classic ADO style data access for request-scoped script hosts
//!
//! A host builds one [`Engine`] at startup and one [`RequestContext`] per
//! request. Scripts create `ADODB.Connection`, `ADODB.Recordset` and `G3DB`
//! objects through [`RequestContext::create_object`] and drive them through
//! the [`Dispatch`] protocol. Every native handle is released when the
//! request context is torn down.

pub mod ado;
pub mod config;
pub mod core;
pub mod db;
pub mod drivers;
pub mod error;
pub mod runtime;

pub use config::{BridgeMode, DataAccessConfig};
pub use self::core::{ArrayRef, Dispatch, DispatchError, Member, ObjectRef, Variant};
pub use error::{Error, Result};
pub use runtime::{Engine, EngineBuilder, RequestContext, Scope};
