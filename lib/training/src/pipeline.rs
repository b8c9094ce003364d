//! Materialised stages shared by EM training and u estimation

use crate::sql;
use reclink_core::{BlockingRule, Error, Result, Settings, SOURCE_DATASET_COLUMN};
use reclink_storage::{get_i64, QueryExecutor, TableRef};
use tracing::debug;

/// The concatenated input table
#[derive(Debug, Clone)]
pub struct ConcatInput {
    pub table: TableRef,
    /// Columns of the concatenated table, `source_dataset` first
    pub columns: Vec<String>,
    pub inputs: Vec<TableRef>,
}

/// Check the registered inputs against the settings and stack them into one table
pub fn concat_inputs(settings: &Settings, executor: &dyn QueryExecutor) -> Result<ConcatInput> {
    let inputs = executor.input_tables();
    if inputs.is_empty() {
        return Err(Error::InvalidConfiguration(
            "no input tables are registered".to_string(),
        ));
    }
    if settings.link_type() == reclink_core::LinkType::DedupeOnly && inputs.len() > 1 {
        return Err(Error::InvalidConfiguration(format!(
            "dedupe_only takes a single input table, got {}",
            inputs.len()
        )));
    }

    let columns: Vec<String> = executor
        .table_columns(&inputs[0].name)?
        .into_iter()
        .filter(|c| c != SOURCE_DATASET_COLUMN)
        .collect();
    for other in &inputs[1..] {
        let mut theirs = executor.table_columns(&other.name)?;
        theirs.retain(|c| c != SOURCE_DATASET_COLUMN);
        theirs.sort();
        let mut ours = columns.clone();
        ours.sort();
        if theirs != ours {
            return Err(Error::InvalidConfiguration(format!(
                "input tables {} and {} have different columns",
                inputs[0].name, other.name
            )));
        }
    }

    let mut required = vec![settings.unique_id_column_name()];
    for comparison in settings.comparisons() {
        required.extend(comparison.input_columns());
    }
    if let Some(missing) = required.iter().find(|c| !columns.iter().any(|col| col == *c)) {
        return Err(Error::InvalidConfiguration(format!(
            "input column '{}' is not present in the input tables",
            missing
        )));
    }

    let names: Vec<&str> = inputs.iter().map(|t| t.name.as_str()).collect();
    let table = executor.materialize(
        &sql::concat_sql(settings.dialect(), &names, &columns),
        sql::CONCAT_TABLE,
        &inputs,
    )?;
    let columns = executor.table_columns(&table.name)?;
    debug!("Concatenated {} input tables into {}", inputs.len(), table.name);

    Ok(ConcatInput {
        table,
        columns,
        inputs,
    })
}

/// Blocked pairs and their comparison vectors over `source`
pub fn comparison_vectors(
    settings: &Settings,
    executor: &dyn QueryExecutor,
    source: &TableRef,
    rules: &[BlockingRule],
) -> Result<(TableRef, TableRef)> {
    let columns = executor.table_columns(&source.name)?;
    let blocked_sql = sql::blocked_sql(
        settings.dialect(),
        settings.link_type(),
        settings.unique_id_column_name(),
        &source.name,
        &columns,
        rules,
    );
    let blocked = executor.materialize(&blocked_sql, sql::BLOCKED_TABLE, std::slice::from_ref(source))?;

    let vectors_sql = sql::comparison_vectors_sql(settings, &blocked.name);
    let vectors = executor.materialize(
        &vectors_sql,
        sql::COMPARISON_VECTORS_TABLE,
        std::slice::from_ref(&blocked),
    )?;
    Ok((blocked, vectors))
}

/// Number of rows in a table
pub fn count_pairs(
    settings: &Settings,
    executor: &dyn QueryExecutor,
    table: &TableRef,
) -> Result<u64> {
    let rows = executor.execute(&sql::pair_count_sql(settings.dialect(), &table.name))?;
    let count = rows
        .first()
        .map(|row| get_i64(row, "pair_count"))
        .transpose()?
        .flatten()
        .unwrap_or(0);
    Ok(count.max(0) as u64)
}
