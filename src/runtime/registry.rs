use super::context::Scope;
use crate::ado::connection::Connection;
use crate::ado::recordset::Recordset;
use crate::core::ObjectRef;
use crate::db::Database;
use std::collections::HashMap;

/// Builds a fresh object bound to a request scope
pub type ClassFactory = fn(&Scope) -> ObjectRef;

/// ProgID registry for `CreateObject`
///
/// ProgIDs are stored as registered; lookups are case-insensitive.
pub struct ClassRegistry {
    classes: HashMap<String, ClassFactory>,
}

impl ClassRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    /// Registry with the built-in data-access classes
    pub fn with_builtin_classes() -> Self {
        let mut registry = Self::new();
        registry.register("ADODB.Connection", |scope| {
            ObjectRef::new(Connection::new(scope))
        });
        registry.register("ADODB.Recordset", |scope| ObjectRef::new(Recordset::new(scope)));
        registry.register("G3DB", |scope| ObjectRef::new(Database::new(scope)));
        registry
    }

    pub fn register(&mut self, progid: &str, factory: ClassFactory) {
        self.classes.insert(progid.to_string(), factory);
    }

    /// Get a factory by ProgID (case-insensitive lookup)
    pub fn get(&self, progid: &str) -> Option<ClassFactory> {
        let progid = progid.trim();
        // Try exact match first
        if let Some(&factory) = self.classes.get(progid) {
            return Some(factory);
        }

        self.classes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(progid))
            .map(|(_, &factory)| factory)
    }

    pub fn contains(&self, progid: &str) -> bool {
        self.get(progid).is_some()
    }

    /// Registered ProgIDs
    pub fn progids(&self) -> Vec<&str> {
        self.classes.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::with_builtin_classes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup_is_case_insensitive() {
        let registry = ClassRegistry::with_builtin_classes();
        assert!(registry.contains("ADODB.Connection"));
        assert!(registry.contains("adodb.recordset"));
        assert!(registry.contains(" g3db "));
        assert!(!registry.contains("Scripting.Dictionary"));
        assert_eq!(registry.progids().len(), 3);
    }
}
