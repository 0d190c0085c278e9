//! Sort, Filter and Find expressions
//!
//! Grammar:
//!
//! ```text
//! sort    := key ("," key)*
//! key     := field ["ASC" | "DESC"]
//! filter  := clause (" AND " clause)*
//! clause  := field op value | field "LIKE" pattern
//! op      := "=" | "<>" | ">" | "<" | ">=" | "<="
//! ```
//!
//! Values may be quoted with `'`, `"` or `#`. LIKE is a case-insensitive
//! substring test: `%` and `*` wildcards are dropped from the pattern.

use crate::core::variant::{compare_for_sort, parse_numeric};
use crate::core::Variant;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Lower-cased column name
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortSpec {
    pub keys: Vec<SortKey>,
}

impl SortSpec {
    pub fn parse(text: &str) -> Self {
        let keys = text
            .split(',')
            .filter_map(|part| {
                let mut words = part.split_whitespace();
                let field = words.next()?.trim_matches(['[', ']']).to_ascii_lowercase();
                let descending = words
                    .next()
                    .is_some_and(|order| order.eq_ignore_ascii_case("desc"));
                Some(SortKey { field, descending })
            })
            .collect();
        Self { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Orders two rows given a column resolver
    pub fn compare<'a>(
        &self,
        a: impl Fn(&str) -> Option<&'a Variant>,
        b: impl Fn(&str) -> Option<&'a Variant>,
    ) -> Ordering {
        for key in &self.keys {
            let left = a(&key.field).cloned().unwrap_or_default();
            let right = b(&key.field).cloned().unwrap_or_default();
            let ordering = compare_for_sort(&left, &right);
            let ordering = if key.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    /// Lower-cased column name
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

impl Clause {
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(at) = find_keyword(text, " LIKE ") {
            let field = normalize_field(&text[..at]);
            let pattern = unquote(&text[at + " LIKE ".len()..]);
            if field.is_empty() {
                return None;
            }
            return Some(Clause {
                field,
                op: FilterOp::Like,
                value: pattern.replace(['%', '*'], ""),
            });
        }

        let at = text.find(['<', '>', '='])?;
        let rest = &text[at..];
        let (op, len) = if rest.starts_with(">=") {
            (FilterOp::Ge, 2)
        } else if rest.starts_with("<=") {
            (FilterOp::Le, 2)
        } else if rest.starts_with("<>") {
            (FilterOp::Ne, 2)
        } else if rest.starts_with('=') {
            (FilterOp::Eq, 1)
        } else if rest.starts_with('>') {
            (FilterOp::Gt, 1)
        } else {
            (FilterOp::Lt, 1)
        };
        let field = normalize_field(&text[..at]);
        if field.is_empty() {
            return None;
        }
        Some(Clause {
            field,
            op,
            value: unquote(&rest[len..]),
        })
    }

    pub fn matches(&self, value: &Variant) -> bool {
        let actual = value.to_string();
        if self.op == FilterOp::Like {
            return actual.to_lowercase().contains(&self.value.to_lowercase());
        }

        let ordering = match (parse_numeric(&actual), parse_numeric(&self.value)) {
            (Some(a), Some(b)) => a.to_float().partial_cmp(&b.to_float()),
            _ => match self.op {
                FilterOp::Eq | FilterOp::Ne => {
                    Some(actual.to_lowercase().cmp(&self.value.to_lowercase()))
                }
                _ => Some(actual.as_str().cmp(self.value.as_str())),
            },
        };
        let Some(ordering) = ordering else {
            return false;
        };
        match self.op {
            FilterOp::Eq => ordering == Ordering::Equal,
            FilterOp::Ne => ordering != Ordering::Equal,
            FilterOp::Gt => ordering == Ordering::Greater,
            FilterOp::Lt => ordering == Ordering::Less,
            FilterOp::Ge => ordering != Ordering::Less,
            FilterOp::Le => ordering != Ordering::Greater,
            FilterOp::Like => false,
        }
    }
}

/// Conjunction of clauses; also used by `Find`
#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpr {
    pub clauses: Vec<Clause>,
}

impl FilterExpr {
    /// `None` when any clause is malformed
    pub fn parse(text: &str) -> Option<Self> {
        let clauses = split_and(text)
            .into_iter()
            .map(Clause::parse)
            .collect::<Option<Vec<_>>>()?;
        if clauses.is_empty() {
            return None;
        }
        Some(Self { clauses })
    }

    /// A row matches when every clause's column exists and matches
    pub fn matches<'a>(&self, lookup: impl Fn(&str) -> Option<&'a Variant>) -> bool {
        self.clauses.iter().all(|clause| match lookup(&clause.field) {
            Some(value) => clause.matches(value),
            None => false,
        })
    }
}

fn normalize_field(text: &str) -> String {
    text.trim().trim_matches(['[', ']']).to_ascii_lowercase()
}

fn unquote(text: &str) -> String {
    let t = text.trim();
    for quote in ['\'', '"', '#'] {
        if t.len() >= 2 && t.starts_with(quote) && t.ends_with(quote) {
            return t[1..t.len() - 1].replace("''", "'");
        }
    }
    t.to_string()
}

/// Case-insensitive keyword search outside single quotes
fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    let upper = text.to_ascii_uppercase();
    let mut in_quote = false;
    for (i, ch) in upper.char_indices() {
        if ch == '\'' {
            in_quote = !in_quote;
        } else if !in_quote && upper[i..].starts_with(keyword) {
            return Some(i);
        }
    }
    None
}

fn split_and(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = text.trim();
    while let Some(at) = find_keyword(rest, " AND ") {
        parts.push(&rest[..at]);
        rest = &rest[at + " AND ".len()..];
    }
    if !rest.trim().is_empty() {
        parts.push(rest);
    }
    parts
}
