//! `Field` / `Fields`: the ordered projection of the current row
//!
//! Both cursor backends feed [`Fields::project`] on every stop. When the column
//! list is unchanged the existing Field objects are updated in place, so a
//! script holding `Set f = rs("name")` keeps seeing the live value.

use crate::core::dispatch::{arg, Dispatch, DispatchResult, Member};
use crate::core::{ObjectRef, Variant};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Receiver of `Field.Value = x` assignments
pub trait FieldOwner: Send + Sync {
    fn assign_field(&self, name: &str, value: Variant) -> DispatchResult<()>;
}

pub struct Field {
    name: String,
    value: RwLock<Variant>,
    owner: Option<Weak<dyn FieldOwner>>,
}

impl Field {
    pub fn new(name: &str, value: Variant) -> Self {
        Self {
            name: name.to_string(),
            value: RwLock::new(value),
            owner: None,
        }
    }

    fn owned(name: &str, value: Variant, owner: Weak<dyn FieldOwner>) -> Self {
        Self {
            name: name.to_string(),
            value: RwLock::new(value),
            owner: Some(owner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Variant {
        self.value.read().clone()
    }

    fn store(&self, value: Variant) {
        *self.value.write() = value;
    }
}

impl Dispatch for Field {
    fn class_name(&self) -> &'static str {
        "ADODB.Field"
    }

    fn get_property(&self, name: &Member) -> Variant {
        match name.as_str() {
            "name" => Variant::from(self.name.as_str()),
            "value" | "" => self.value(),
            _ => Variant::Empty,
        }
    }

    fn set_property(&self, name: &Member, value: Variant) -> DispatchResult<()> {
        if !matches!(name.as_str(), "value" | "") {
            return Ok(());
        }
        match self.owner.as_ref().and_then(Weak::upgrade) {
            // the owner re-projects, which refreshes this field
            Some(owner) => owner.assign_field(&self.name, value),
            None => {
                self.store(value);
                Ok(())
            }
        }
    }

    fn call_method(&self, name: &Member, _args: &[Variant]) -> DispatchResult<Variant> {
        Ok(self.get_property(name))
    }
}

#[derive(Default)]
pub struct Fields {
    fields: RwLock<Vec<Arc<Field>>>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the projection. Values shorter than `columns` pad with Empty.
    pub fn project(&self, columns: &[String], values: Vec<Variant>, owner: Weak<dyn FieldOwner>) {
        let mut fields = self.fields.write();
        let same_shape = fields.len() == columns.len()
            && fields.iter().zip(columns).all(|(f, c)| f.name == *c);
        let mut values = values.into_iter();

        if same_shape {
            for field in fields.iter() {
                field.store(values.next().unwrap_or_default());
            }
            return;
        }

        *fields = columns
            .iter()
            .map(|column| {
                Arc::new(Field::owned(
                    column,
                    values.next().unwrap_or_default(),
                    owner.clone(),
                ))
            })
            .collect();
    }

    pub fn clear(&self) {
        self.fields.write().clear();
    }

    pub fn len(&self) -> usize {
        self.fields.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.read().iter().map(|f| f.name.clone()).collect()
    }

    /// Lookup by zero-based position (numeric key) or case-insensitive name
    pub fn item(&self, key: &Variant) -> Option<Arc<Field>> {
        let fields = self.fields.read();
        match key.resolve_default() {
            Variant::Int(_) | Variant::Float(_) => {
                let index = usize::try_from(key.to_int()).ok()?;
                fields.get(index).cloned()
            }
            other => {
                let name = other.to_string();
                let name = name.trim();
                fields
                    .iter()
                    .find(|f| f.name.eq_ignore_ascii_case(name))
                    .cloned()
            }
        }
    }

    pub fn value_of(&self, key: &Variant) -> Variant {
        self.item(key).map(|f| f.value()).unwrap_or_default()
    }

    pub fn values(&self) -> Vec<Variant> {
        self.fields.read().iter().map(|f| f.value()).collect()
    }
}

impl Dispatch for Fields {
    fn class_name(&self) -> &'static str {
        "ADODB.Fields"
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

    /// `Fields(key)` and `Fields.Item(key)` return the Field object itself
    fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        Ok(match name.as_str() {
            "" | "item" => self
                .item(&arg(args, 0))
                .map(|f| Variant::Object(ObjectRef::new(f)))
                .unwrap_or_default(),
            "count" => Variant::from(self.len()),
            _ => Variant::Empty,
        })
    }

    fn enumerate(&self) -> Option<Vec<Variant>> {
        Some(
            self.fields
                .read()
                .iter()
                .map(|f| Variant::Object(ObjectRef::new(f.clone())))
                .collect(),
        )
    }
}
