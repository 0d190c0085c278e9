//! `ADODB.Error` and the `Errors` collection
//!
//! Connections collect failures here instead of raising them; the script
//! inspects `conn.Errors.Count` after the fact.

use crate::core::dispatch::{arg, Dispatch, DispatchResult, Member};
use crate::core::{ObjectRef, Variant};
use crate::error::Error;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

/// Number reported for every collected failure
pub const GENERIC_ERROR_NUMBER: i64 = -1;

#[derive(Debug, Clone, Default, PartialEq)]
struct ErrorRecord {
    number: i64,
    description: String,
    source: String,
    sql_state: String,
}

#[derive(Debug, Default)]
pub struct AdoError {
    record: RwLock<ErrorRecord>,
}

impl AdoError {
    pub fn new(number: i64, description: &str, source: &str, sql_state: &str) -> Self {
        Self {
            record: RwLock::new(ErrorRecord {
                number,
                description: description.to_string(),
                source: source.to_string(),
                sql_state: sql_state.to_string(),
            }),
        }
    }

    pub fn description(&self) -> String {
        self.record.read().description.clone()
    }

    pub fn number(&self) -> i64 {
        self.record.read().number
    }
}

impl Dispatch for AdoError {
    fn class_name(&self) -> &'static str {
        "ADODB.Error"
    }

    fn get_property(&self, name: &Member) -> Variant {
        let record = self.record.read();
        match name.as_str() {
            "number" => Variant::Int(record.number),
            "description" | "" => Variant::from(record.description.as_str()),
            "source" => Variant::from(record.source.as_str()),
            "sqlstate" => Variant::from(record.sql_state.as_str()),
            _ => Variant::Empty,
        }
    }

    fn set_property(&self, name: &Member, value: Variant) -> DispatchResult<()> {
        let mut record = self.record.write();
        match name.as_str() {
            "number" => record.number = value.to_int(),
            "description" => record.description = value.to_string(),
            "source" => record.source = value.to_string(),
            "sqlstate" => record.sql_state = value.to_string(),
            _ => {}
        }
        Ok(())
    }

    fn call_method(&self, name: &Member, _args: &[Variant]) -> DispatchResult<Variant> {
        Ok(self.get_property(name))
    }
}

/// Ordered error list owned by one Connection
#[derive(Debug, Default)]
pub struct Errors {
    items: Mutex<Vec<Arc<AdoError>>>,
}

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, number: i64, description: &str, source: &str, sql_state: &str) {
        debug!(number, source, sql_state, "{description}");
        self.items
            .lock()
            .push(Arc::new(AdoError::new(number, description, source, sql_state)));
    }

    /// Collects a crate error with its source and SQL state
    pub fn push(&self, err: &Error) {
        self.add(
            GENERIC_ERROR_NUMBER,
            &err.to_string(),
            err.source_name(),
            err.sql_state().unwrap_or(""),
        );
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Arc<AdoError>> {
        self.items.lock().get(index).cloned()
    }

    pub fn last_description(&self) -> Option<String> {
        self.items.lock().last().map(|e| e.description())
    }
}

impl Dispatch for Errors {
    fn class_name(&self) -> &'static str {
        "ADODB.Errors"
    }

    fn get_property(&self, name: &Member) -> Variant {
        match name.as_str() {
            "count" => Variant::from(self.len()),
            _ => Variant::Empty,
        }
    }

    fn set_property(&self, _name: &Member, _value: Variant) -> DispatchResult<()> {
        Ok(())
    }

    fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        Ok(match name.as_str() {
            "" | "item" => {
                let index = arg(args, 0).to_int();
                usize::try_from(index)
                    .ok()
                    .and_then(|i| self.get(i))
                    .map(|e| Variant::Object(ObjectRef::new(e)))
                    .unwrap_or_default()
            }
            "count" => Variant::from(self.len()),
            "clear" => {
                self.clear();
                Variant::Empty
            }
            _ => Variant::Empty,
        })
    }

    fn enumerate(&self) -> Option<Vec<Variant>> {
        Some(
            self.items
                .lock()
                .iter()
                .map(|e| Variant::Object(ObjectRef::new(e.clone())))
                .collect(),
        )
    }
}
