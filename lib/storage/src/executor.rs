//! Query executor boundary
//!
//! The training code never talks to a database directly. It issues SQL through
//! [`QueryExecutor`], whose only production implementation is
//! [`CachingExecutor`](crate::cache::CachingExecutor) wrapping a raw
//! [`SqlBackend`].

use reclink_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result row, column name to value
pub type Row = serde_json::Map<String, Value>;

/// A physical table plus a fingerprint of its contents
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub fingerprint: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

/// A raw SQL engine
pub trait SqlBackend: Send + Sync {
    /// Registered input tables, in registration order
    fn input_tables(&self) -> Vec<TableRef>;

    /// Column names of a table, in table order
    fn table_columns(&self, table: &str) -> Result<Vec<String>>;

    fn query(&self, sql: &str) -> Result<Vec<Row>>;

    fn create_table_as(&self, table: &str, sql: &str) -> Result<()>;

    /// Drop a table if it exists
    fn drop_table(&self, table: &str) -> Result<()>;
}

/// What the training code calls
pub trait QueryExecutor: Send + Sync {
    fn input_tables(&self) -> Vec<TableRef>;

    fn table_columns(&self, table: &str) -> Result<Vec<String>>;

    /// Run a query and collect every row
    fn execute(&self, sql: &str) -> Result<Vec<Row>>;

    /// Materialise `sql` as a table named after `template_name`. The result is
    /// identified by the SQL text and the fingerprints of `upstream`, so the
    /// same request returns the same table without re-running it.
    fn materialize(&self, sql: &str, template_name: &str, upstream: &[TableRef])
        -> Result<TableRef>;
}

/// Numeric cell as f64. Null and missing cells are `None`.
pub fn get_f64(row: &Row, column: &str) -> Result<Option<f64>> {
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| {
            Error::Execution(format!("column '{}' holds non-numeric value '{}'", column, s))
        }),
        Some(other) => Err(Error::Execution(format!(
            "column '{}' holds non-numeric value {}",
            column, other
        ))),
    }
}

/// Integral cell as i64. Null and missing cells are `None`.
pub fn get_i64(row: &Row, column: &str) -> Result<Option<i64>> {
    match row.get(column) {
        Some(Value::Number(n)) if n.is_i64() => Ok(n.as_i64()),
        _ => match get_f64(row, column)? {
            Some(v) if v.fract() == 0.0 => Ok(Some(v as i64)),
            Some(v) => Err(Error::Execution(format!(
                "column '{}' holds non-integral value {}",
                column, v
            ))),
            None => Ok(None),
        },
    }
}

/// Text cell. Numbers are rendered, null and missing cells are `None`.
pub fn get_string(row: &Row, column: &str) -> Option<String> {
    match row.get(column) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_cell_accessors() {
        let r = row(json!({"a": 3, "b": 0.25, "c": null, "d": "7", "e": "x", "f": 2.5}));
        assert_eq!(get_i64(&r, "a").unwrap(), Some(3));
        assert_eq!(get_f64(&r, "b").unwrap(), Some(0.25));
        assert_eq!(get_f64(&r, "c").unwrap(), None);
        assert_eq!(get_f64(&r, "missing").unwrap(), None);
        assert_eq!(get_i64(&r, "d").unwrap(), Some(7));
        assert!(get_f64(&r, "e").is_err());
        assert!(get_i64(&r, "f").is_err());
        assert_eq!(get_string(&r, "a").as_deref(), Some("3"));
        assert_eq!(get_string(&r, "c"), None);
    }
}
