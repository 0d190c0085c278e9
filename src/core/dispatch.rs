//! Dynamic dispatch protocol
//!
//! Every scriptable object implements [`Dispatch`]: name-keyed property get,
//! property set and method call. Names are normalized once, at the boundary,
//! into a [`Member`] (trimmed, lower-cased), so `rs.EOF`, `rs.eof` and
//! `RS.Eof` reach the same arm. Unknown names never fail: gets return
//! `Empty`, sets are ignored and calls return `Empty`.
//!
//! An empty member name is the object's default member.

use super::variant::Variant;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A normalized member name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member(String);

impl Member {
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_ascii_lowercase())
    }

    pub fn default_member() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Member {
    fn from(name: &str) -> Self {
        Member::new(name)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fault a host may choose to surface; ordinary failures are collected on the
/// owning Connection instead.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{class}.{member}: {message}")]
pub struct DispatchError {
    pub class: &'static str,
    pub member: String,
    pub message: String,
}

impl DispatchError {
    pub fn new(class: &'static str, member: &Member, message: impl Into<String>) -> Self {
        Self {
            class,
            member: member.as_str().to_string(),
            message: message.into(),
        }
    }
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

#[doc(hidden)]
pub trait AsAnyArc {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Capability shared by every scriptable object
pub trait Dispatch: AsAnyArc + Send + Sync {
    /// ProgID-style class name, e.g. `ADODB.Recordset`
    fn class_name(&self) -> &'static str;

    fn get_property(&self, name: &Member) -> Variant;

    fn set_property(&self, name: &Member, value: Variant) -> DispatchResult<()>;

    fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant>;

    /// Items for `For Each`; `None` when the object is not a collection
    fn enumerate(&self) -> Option<Vec<Variant>> {
        None
    }
}

/// Shared, type-erased handle to a scriptable object
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn Dispatch>);

impl ObjectRef {
    pub fn new<T: Dispatch + 'static>(object: Arc<T>) -> Self {
        Self(object)
    }

    pub fn class_name(&self) -> &'static str {
        self.0.class_name()
    }

    pub fn get_property(&self, name: &Member) -> Variant {
        self.0.get_property(name)
    }

    pub fn set_property(&self, name: &Member, value: Variant) -> DispatchResult<()> {
        self.0.set_property(name, value)
    }

    pub fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        self.0.call_method(name, args)
    }

    /// `obj.Name`
    pub fn get(&self, name: &str) -> Variant {
        self.0.get_property(&Member::new(name))
    }

    /// `obj.Name = value`
    pub fn set(&self, name: &str, value: impl Into<Variant>) -> DispatchResult<()> {
        self.0.set_property(&Member::new(name), value.into())
    }

    /// `obj.Name(args...)`
    pub fn call(&self, name: &str, args: &[Variant]) -> DispatchResult<Variant> {
        self.0.call_method(&Member::new(name), args)
    }

    /// `obj(args...)`
    pub fn call_default(&self, args: &[Variant]) -> DispatchResult<Variant> {
        self.0.call_method(&Member::default_member(), args)
    }

    pub fn enumerate(&self) -> Option<Vec<Variant>> {
        self.0.enumerate()
    }

    pub fn downcast<T: Dispatch + 'static>(&self) -> Option<Arc<T>> {
        self.0.clone().as_any_arc().downcast::<T>().ok()
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[object {}]", self.class_name())
    }
}

/// Helpers for reading positional arguments quietly
pub(crate) fn arg(args: &[Variant], index: usize) -> Variant {
    args.get(index).cloned().unwrap_or_default()
}

/// Present and not Empty (a skipped optional argument arrives as Empty)
pub(crate) fn has_arg(args: &[Variant], index: usize) -> bool {
    args.get(index).is_some_and(|v| !v.is_empty())
}
