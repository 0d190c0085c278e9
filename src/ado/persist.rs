//! Write-through SQL for Recordset edits
//!
//! A Recordset opened from `SELECT ... FROM table ...` on a wire connection
//! pushes `AddNew`/`Update`/`Delete` back to that table. The statements use
//! `?` placeholders; the session rewrites them for the backend.

use crate::core::Variant;

/// Columns that receive a generated identifier after an INSERT
pub const IDENTITY_COLUMNS: &[&str] = &["id", "iid", "identity", "autoid"];

#[derive(Debug, Clone, PartialEq)]
pub struct WriteStatement {
    pub sql: String,
    pub params: Vec<Variant>,
}

/// First word after ` FROM `
pub fn extract_table_name(sql: &str) -> Option<String> {
    let upper = sql.to_ascii_uppercase();
    let at = upper.find(" FROM ")?;
    sql[at + " FROM ".len()..]
        .split_whitespace()
        .next()
        .map(|name| name.trim_end_matches([';', ')']).to_string())
        .filter(|name| !name.is_empty())
}

/// `WHERE ...` of the source query without trailing ORDER BY / LIMIT / OFFSET /
/// FETCH / FOR clauses
pub fn extract_where_clause(sql: &str) -> Option<String> {
    let upper = sql.to_ascii_uppercase();
    let at = upper.find(" WHERE ")?;
    let clause = &sql[at..];
    let clause_upper = &upper[at..];
    let end = [" ORDER BY ", " LIMIT ", " OFFSET ", " FETCH ", " FOR "]
        .iter()
        .filter_map(|token| clause_upper.find(token))
        .min()
        .unwrap_or(clause.len());
    let clause = clause[..end].trim().trim_end_matches(';').trim();
    (!clause.is_empty()).then(|| clause.to_string())
}

/// Identifies one row: by `id` when the row has one, otherwise by every
/// original column value.
pub fn row_where_clause(columns: &[String], original: &[Variant]) -> Option<(String, Vec<Variant>)> {
    if let Some(index) = columns.iter().position(|c| c.eq_ignore_ascii_case("id")) {
        let id = original.get(index).cloned().unwrap_or_default();
        if id.is_nothing() {
            return Some((format!("WHERE {} IS NULL", columns[index]), Vec::new()));
        }
        return Some((format!("WHERE {} = ?", columns[index]), vec![id]));
    }

    let mut clauses = Vec::with_capacity(columns.len());
    let mut params = Vec::new();
    for (column, value) in columns.iter().zip(original) {
        if value.is_nothing() {
            clauses.push(format!("{column} IS NULL"));
        } else {
            clauses.push(format!("{column} = ?"));
            params.push(value.clone());
        }
    }
    if clauses.is_empty() {
        return None;
    }
    Some((format!("WHERE {}", clauses.join(" AND ")), params))
}

/// The row's own identity (`id`, else every original value); the source
/// query's WHERE only when the row has no columns to match on
fn target_where(
    source: &str,
    columns: &[String],
    original: &[Variant],
) -> Option<(String, Vec<Variant>)> {
    row_where_clause(columns, original).or_else(|| {
        extract_where_clause(source)
            .filter(|clause| !clause.contains('?'))
            .map(|clause| (clause, Vec::new()))
    })
}

pub fn insert(table: &str, values: &[(String, Variant)]) -> Option<WriteStatement> {
    if values.is_empty() {
        return None;
    }
    let columns: Vec<&str> = values.iter().map(|(c, _)| c.as_str()).collect();
    let placeholders = vec!["?"; values.len()].join(", ");
    Some(WriteStatement {
        sql: format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            columns.join(", ")
        ),
        params: values.iter().map(|(_, v)| v.clone()).collect(),
    })
}

pub fn update(
    table: &str,
    source: &str,
    columns: &[String],
    values: &[Variant],
    original: &[Variant],
) -> Option<WriteStatement> {
    let changed: Vec<usize> = (0..columns.len())
        .filter(|&i| values.get(i) != original.get(i))
        .collect();
    if changed.is_empty() {
        return None;
    }
    let (clause, where_params) = target_where(source, columns, original)?;
    let sets: Vec<String> = changed.iter().map(|&i| format!("{} = ?", columns[i])).collect();
    let mut params: Vec<Variant> = changed
        .iter()
        .map(|&i| values.get(i).cloned().unwrap_or_default())
        .collect();
    params.extend(where_params);
    Some(WriteStatement {
        sql: format!("UPDATE {table} SET {} {clause}", sets.join(", ")),
        params,
    })
}

pub fn delete(table: &str, source: &str, columns: &[String], original: &[Variant]) -> Option<WriteStatement> {
    let (clause, params) = target_where(source, columns, original)?;
    Some(WriteStatement {
        sql: format!("DELETE FROM {table} {clause}"),
        params,
    })
}

/// Index of the column that receives a generated identifier
pub fn identity_column(columns: &[String]) -> Option<usize> {
    IDENTITY_COLUMNS
        .iter()
        .find_map(|id| columns.iter().position(|c| c.eq_ignore_ascii_case(id)))
}
