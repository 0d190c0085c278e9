//! Script arrays
//!
//! A multi-dimensional array is an outer array whose elements are themselves
//! arrays. `arr(i, j)` is two chained single-index lookups. Inner arrays are
//! shared handles, so a nested assignment mutates the existing inner array in
//! place instead of replacing the outer slot.

use super::variant::Variant;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// One dimension of values with a lower bound (0 unless created otherwise)
#[derive(Debug, Clone, Default)]
pub struct VbArray {
    lower: i64,
    values: Vec<Variant>,
}

impl VbArray {
    pub fn new(lower: i64, len: usize) -> Self {
        Self {
            lower,
            values: vec![Variant::Empty; len],
        }
    }

    pub fn from_values(values: Vec<Variant>) -> Self {
        Self { lower: 0, values }
    }

    pub fn lbound(&self) -> i64 {
        self.lower
    }

    /// Upper bound; `lbound - 1` for an empty array
    pub fn ubound(&self) -> i64 {
        self.lower + self.values.len() as i64 - 1
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn slot(&self, index: i64) -> Option<usize> {
        let offset = index.checked_sub(self.lower)?;
        usize::try_from(offset).ok().filter(|&i| i < self.values.len())
    }

    pub fn get(&self, index: i64) -> Option<&Variant> {
        self.slot(index).map(|i| &self.values[i])
    }

    /// Stores `value` at `index`; returns `false` when out of bounds
    pub fn set(&mut self, index: i64, value: Variant) -> bool {
        match self.slot(index) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, value: Variant) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[Variant] {
        &self.values
    }
}

/// Shared handle to a [`VbArray`]
#[derive(Clone, Default)]
pub struct ArrayRef(Arc<RwLock<VbArray>>);

impl ArrayRef {
    pub fn new(array: VbArray) -> Self {
        Self(Arc::new(RwLock::new(array)))
    }

    pub fn from_values(values: Vec<Variant>) -> Self {
        Self::new(VbArray::from_values(values))
    }

    /// `Dim arr(u0, u1, ...)`: each bound is an inclusive upper bound.
    /// Every nested level gets its own inner arrays.
    pub fn dims(upper_bounds: &[i64]) -> Self {
        match upper_bounds.split_first() {
            None => Self::default(),
            Some((&upper, rest)) => {
                let len = usize::try_from(upper.saturating_add(1)).unwrap_or(0);
                let mut outer = VbArray::new(0, len);
                if !rest.is_empty() {
                    for i in 0..len as i64 {
                        outer.set(i, Variant::Array(Self::dims(rest)));
                    }
                }
                Self::new(outer)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn get(&self, index: i64) -> Option<Variant> {
        self.0.read().get(index).cloned()
    }

    pub fn set(&self, index: i64, value: Variant) -> bool {
        self.0.write().set(index, value)
    }

    pub fn push(&self, value: Variant) {
        self.0.write().push(value);
    }

    /// Reads `arr(i, j, ...)`
    pub fn get_at(&self, indices: &[i64]) -> Option<Variant> {
        let (&first, rest) = indices.split_first()?;
        let value = self.get(first)?;
        if rest.is_empty() {
            return Some(value);
        }
        match value {
            Variant::Array(inner) => inner.get_at(rest),
            _ => None,
        }
    }

    /// Writes `arr(i, j, ...) = value` into the existing inner array.
    ///
    /// The outer lock is released before descending, so the inner array is
    /// mutated through its own handle and sibling slots are untouched.
    pub fn set_at(&self, indices: &[i64], value: Variant) -> bool {
        let Some((&first, rest)) = indices.split_first() else {
            return false;
        };
        if rest.is_empty() {
            return self.set(first, value);
        }
        let inner = match self.get(first) {
            Some(Variant::Array(inner)) => inner,
            _ => return false,
        };
        inner.set_at(rest, value)
    }

    /// `(LBound, UBound)` of a 1-based dimension
    pub fn bounds(&self, dimension: usize) -> Option<(i64, i64)> {
        if dimension == 0 {
            return None;
        }
        let guard = self.0.read();
        if dimension == 1 {
            return Some((guard.lbound(), guard.ubound()));
        }
        let first = guard.get(guard.lbound()).cloned();
        drop(guard);
        match first {
            Some(Variant::Array(inner)) => inner.bounds(dimension - 1),
            _ => None,
        }
    }

    pub fn to_vec(&self) -> Vec<Variant> {
        self.0.read().values().to_vec()
    }

    pub fn ptr_eq(&self, other: &ArrayRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.to_vec().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_assignment_keeps_siblings() {
        let arr = ArrayRef::dims(&[1, 3]);
        assert!(arr.set_at(&[0, 2], Variant::from("hello")));
        assert!(arr.set_at(&[1, 3], Variant::from("world")));
        assert_eq!(arr.get_at(&[0, 2]), Some(Variant::from("hello")));
        assert_eq!(arr.get_at(&[1, 3]), Some(Variant::from("world")));
        assert_eq!(arr.get_at(&[0, 3]), Some(Variant::Empty));
    }

    #[test]
    fn test_out_of_bounds() {
        let arr = ArrayRef::dims(&[2]);
        assert!(!arr.set(3, Variant::Int(1)));
        assert!(!arr.set(-1, Variant::Int(1)));
        assert_eq!(arr.get(5), None);
        assert!(!arr.set_at(&[0, 0], Variant::Int(1)));
    }

    #[test]
    fn test_bounds() {
        let arr = ArrayRef::dims(&[1, 4]);
        assert_eq!(arr.bounds(1), Some((0, 1)));
        assert_eq!(arr.bounds(2), Some((0, 4)));
        assert_eq!(arr.bounds(3), None);

        let based = ArrayRef::new(VbArray::new(1, 3));
        assert_eq!(based.bounds(1), Some((1, 3)));
        assert!(based.set(3, Variant::Int(9)));
        assert_eq!(based.get(3), Some(Variant::Int(9)));
    }

    #[test]
    fn test_empty_dims() {
        let arr = ArrayRef::dims(&[-1]);
        assert!(arr.is_empty());
        assert_eq!(arr.bounds(1), Some((0, -1)));
    }
}
