use crate::functions;
use parking_lot::Mutex;
use reclink_core::{Error, Result};
use reclink_storage::{Row, SqlBackend, TableRef};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

fn sql_error(e: rusqlite::Error) -> Error {
    Error::Execution(e.to_string())
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // arrays and objects are stored as JSON text, readable through json_each
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}

/// In-process SQLite engine with the reclink scalar functions registered
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    inputs: Mutex<Vec<TableRef>>,
}

impl SqliteBackend {
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(sql_error)?)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path).map_err(sql_error)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        functions::register_all(&conn).map_err(sql_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
            inputs: Mutex::new(Vec::new()),
        })
    }

    /// Create (or replace) an input table from rows and register it for linkage.
    /// Columns are the union of the rows' keys, in sorted order.
    pub fn register_table(&self, name: &str, rows: &[Row]) -> Result<TableRef> {
        let columns: Vec<&str> = rows
            .iter()
            .flat_map(|r| r.keys().map(String::as_str))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if columns.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "input table {} has no columns",
                name
            )));
        }

        let table = quote_identifier(name);
        let column_list = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_error)?;
        tx.execute(&format!("DROP TABLE IF EXISTS {}", table), [])
            .map_err(sql_error)?;
        tx.execute(&format!("CREATE TABLE {} ({})", table, column_list), [])
            .map_err(sql_error)?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table, column_list, placeholders
                ))
                .map_err(sql_error)?;
            for row in rows {
                let values = columns
                    .iter()
                    .map(|c| row.get(*c).map_or(SqlValue::Null, to_sql_value));
                stmt.execute(params_from_iter(values)).map_err(sql_error)?;
            }
        }
        tx.commit().map_err(sql_error)?;
        drop(conn);

        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(serde_json::to_vec(rows)?);
        let table_ref = TableRef::new(name, format!("{:x}", hasher.finalize()));

        let mut inputs = self.inputs.lock();
        match inputs.iter_mut().find(|t| t.name == name) {
            Some(existing) => *existing = table_ref.clone(),
            None => inputs.push(table_ref.clone()),
        }
        info!("Registered input table {} ({} rows)", name, rows.len());
        Ok(table_ref)
    }
}

impl SqlBackend for SqliteBackend {
    fn input_tables(&self) -> Vec<TableRef> {
        self.inputs.lock().clone()
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))
            .map_err(sql_error)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(sql_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_error)?;
        if columns.is_empty() {
            return Err(Error::Execution(format!("no such table: {}", table)));
        }
        Ok(columns)
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(sql_error)?;
        let names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query([]).map_err(sql_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql_error)? {
            let mut record = Row::new();
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i).map_err(sql_error)?;
                record.insert(name.clone(), to_json_value(value));
            }
            out.push(record);
        }
        Ok(out)
    }

    fn create_table_as(&self, table: &str, sql: &str) -> Result<()> {
        debug!("CREATE TABLE {}", table);
        self.conn
            .lock()
            .execute(&format!("CREATE TABLE {} AS {}", quote_identifier(table), sql), [])
            .map_err(sql_error)?;
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(&format!("DROP TABLE IF EXISTS {}", quote_identifier(table)), [])
            .map_err(sql_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    }

    #[test]
    fn test_register_and_query() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let table = backend
            .register_table(
                "people",
                &rows(vec![
                    json!({"unique_id": 1, "name": "Amanda", "score": 0.5}),
                    json!({"unique_id": 2, "name": null, "tags": ["a", "b"]}),
                ]),
            )
            .unwrap();
        assert_eq!(backend.input_tables(), vec![table]);
        assert_eq!(
            backend.table_columns("people").unwrap(),
            vec!["name", "score", "tags", "unique_id"]
        );

        let out = backend
            .query("SELECT unique_id, name, score, tags FROM people ORDER BY unique_id")
            .unwrap();
        assert_eq!(out[0]["name"], json!("Amanda"));
        assert_eq!(out[0]["score"], json!(0.5));
        assert_eq!(out[1]["name"], Value::Null);
        assert_eq!(out[1]["tags"], json!("[\"a\",\"b\"]"));
        assert_eq!(out[1]["unique_id"], json!(2));
    }

    #[test]
    fn test_reregistering_changes_fingerprint() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let first = backend
            .register_table("t", &rows(vec![json!({"unique_id": 1})]))
            .unwrap();
        let second = backend
            .register_table("t", &rows(vec![json!({"unique_id": 2})]))
            .unwrap();
        assert_ne!(first.fingerprint, second.fingerprint);
        assert_eq!(backend.input_tables(), vec![second]);
    }

    #[test]
    fn test_create_and_drop_table() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.create_table_as("answer", "SELECT 42 AS x").unwrap();
        assert_eq!(backend.table_columns("answer").unwrap(), vec!["x"]);
        backend.drop_table("answer").unwrap();
        backend.drop_table("answer").unwrap();
        assert!(backend.table_columns("answer").is_err());
    }

    #[test]
    fn test_percentage_difference_on_integer_columns() {
        use reclink_core::{Predicate, SqliteDialect};

        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .register_table(
                "payments",
                &rows(vec![
                    json!({"unique_id": 1, "amount": 10}),
                    json!({"unique_id": 2, "amount": 100}),
                    json!({"unique_id": 3, "amount": 90}),
                ]),
            )
            .unwrap();
        let condition = Predicate::PercentageDifference {
            column: "amount".into(),
            threshold: 0.5,
        }
        .compile(&SqliteDialect)
        .unwrap();

        let hit = |left: i64, right: i64| {
            let out = backend
                .query(&format!(
                    "SELECT CASE WHEN {} THEN 1 ELSE 0 END AS hit \
                     FROM (SELECT l.amount AS amount_l, r.amount AS amount_r \
                     FROM payments AS l, payments AS r \
                     WHERE l.unique_id = {} AND r.unique_id = {})",
                    condition, left, right
                ))
                .unwrap();
            out[0]["hit"].clone()
        };
        // 10 against 100 differs by 90%
        assert_eq!(hit(1, 2), json!(0));
        // 100 against 90 differs by 10%
        assert_eq!(hit(2, 3), json!(1));
    }

    #[test]
    fn test_sql_errors_surface_as_execution() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(matches!(
            backend.query("SELECT * FROM missing"),
            Err(Error::Execution(_))
        ));
        assert!(matches!(
            backend.register_table("empty", &[]),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
