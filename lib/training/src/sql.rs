//! SQL text for every stage of the training pipeline
//!
//! Builders here are pure string functions. Executing them and caching the
//! resulting tables is the job of [`crate::pipeline`].

use reclink_core::dialect::{sql_number, sql_string_literal};
use reclink_core::{BlockingRule, Comparison, LinkType, Settings, SqlDialect, SOURCE_DATASET_COLUMN};

pub const CONCAT_TABLE: &str = "__splink__df_concat";
pub const CONCAT_SAMPLE_TABLE: &str = "__splink__df_concat_sample";
pub const BLOCKED_TABLE: &str = "__splink__df_blocked";
pub const COMPARISON_VECTORS_TABLE: &str = "__splink__df_comparison_vectors";
pub const MATCH_PROBABILITY_CTE: &str = "__splink__df_match_probability";

/// Stack every input table, tagging rows with the table they came from
pub fn concat_sql(dialect: &dyn SqlDialect, tables: &[&str], columns: &[String]) -> String {
    let select_list = columns.join(", ");
    tables
        .iter()
        .map(|t| {
            format!(
                "SELECT {} AS {}, {} FROM {}",
                sql_string_literal(t),
                SOURCE_DATASET_COLUMN,
                select_list,
                dialect.quote_identifier(t)
            )
        })
        .collect::<Vec<_>>()
        .join("\nUNION ALL\n")
}

/// Rows per source table
pub fn row_counts_sql(dialect: &dyn SqlDialect, concat_table: &str) -> String {
    format!(
        "SELECT {ds}, COUNT(*) AS row_count FROM {t} GROUP BY {ds}",
        ds = SOURCE_DATASET_COLUMN,
        t = dialect.quote_identifier(concat_table)
    )
}

/// Reproducible Bernoulli sample of the concatenated input
pub fn sample_sql(
    dialect: &dyn SqlDialect,
    concat_table: &str,
    proportion: f64,
    sample_size: u64,
    seed: u64,
    unique_id_column: &str,
) -> String {
    format!(
        "SELECT * FROM {}{}",
        dialect.quote_identifier(concat_table),
        dialect.random_sample(proportion, sample_size, seed, unique_id_column)
    )
}

/// Candidate pairs, one row per pair with `<col>_l` / `<col>_r` columns.
///
/// Each blocking rule contributes the pairs it matches that no earlier rule
/// matched. With no rules every pair allowed by the link type is generated.
pub fn blocked_sql(
    dialect: &dyn SqlDialect,
    link_type: LinkType,
    unique_id_column: &str,
    source_table: &str,
    columns: &[String],
    rules: &[BlockingRule],
) -> String {
    let select_list = columns
        .iter()
        .map(|c| format!("l.{c} AS {c}_l, r.{c} AS {c}_r", c = c))
        .collect::<Vec<_>>()
        .join(", ");
    let pair_filter = link_type.pair_filter(unique_id_column);
    let source_table = dialect.quote_identifier(source_table);

    let join = |on: &str, match_key: usize, exclusions: &str| {
        format!(
            "SELECT {select}, {key} AS match_key\nFROM {t} AS l\nINNER JOIN {t} AS r\nON ({on})\nWHERE ({filter}){exclusions}",
            select = select_list,
            key = match_key,
            t = source_table,
            on = on,
            filter = pair_filter,
            exclusions = exclusions
        )
    };

    if rules.is_empty() {
        return join("1=1", 0, "");
    }

    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let exclusions: String = rules[..i]
                .iter()
                .map(|earlier| format!(" AND NOT COALESCE(({}), FALSE)", earlier.sql))
                .collect();
            join(&rule.sql, i, &exclusions)
        })
        .collect::<Vec<_>>()
        .join("\nUNION ALL\n")
}

/// Gamma value per comparison for every candidate pair
pub fn comparison_vectors_sql(settings: &Settings, blocked_table: &str) -> String {
    let id = settings.unique_id_column_name();
    let mut select = vec![
        format!("{}_l", SOURCE_DATASET_COLUMN),
        format!("{}_r", SOURCE_DATASET_COLUMN),
        format!("{}_l", id),
        format!("{}_r", id),
        "match_key".to_string(),
    ];
    select.extend(
        settings
            .comparisons()
            .iter()
            .map(Comparison::gamma_sql_case_statement),
    );
    format!(
        "SELECT {}\nFROM {}",
        select.join(",\n"),
        settings.dialect().quote_identifier(blocked_table)
    )
}

/// CASE expression mapping a comparison's gamma column to a probability.
/// Null levels, and levels whose probability is unknown, contribute 1.
fn probability_case(comparison: &Comparison, m: bool) -> String {
    let values = if m {
        comparison.m_probabilities()
    } else {
        comparison.u_probabilities()
    };
    let branches: String = values
        .iter()
        .enumerate()
        .rev()
        .filter_map(|(g, p)| p.map(|p| format!(" WHEN {} THEN {}", g, sql_number(p))))
        .collect();
    format!(
        "(CASE {}{} ELSE 1 END)",
        comparison.gamma_column_name(),
        branches
    )
}

/// Expectation step as a CTE: posterior match probability for each pair
/// under the current parameters
pub fn expectation_cte(settings: &Settings, vectors_table: &str) -> String {
    let lambda = settings.proportion_of_matches().unwrap_or(0.0);
    let gamma_columns = settings
        .comparisons()
        .iter()
        .map(Comparison::gamma_column_name)
        .collect::<Vec<_>>()
        .join(", ");
    let m_product = settings
        .comparisons()
        .iter()
        .map(|c| probability_case(c, true))
        .collect::<Vec<_>>()
        .join(" * ");
    let u_product = settings
        .comparisons()
        .iter()
        .map(|c| probability_case(c, false))
        .collect::<Vec<_>>()
        .join(" * ");

    let numerator = format!("({} * m_product)", sql_number(lambda));
    let denominator = format!(
        "({} * m_product + {} * u_product)",
        sql_number(lambda),
        sql_number(1.0 - lambda)
    );
    format!(
        "WITH {cte} AS (\n\
         SELECT {gammas},\n\
         CASE WHEN {den} = 0 THEN NULL ELSE {num} / {den} END AS match_probability\n\
         FROM (SELECT {gammas}, {m} AS m_product, {u} AS u_product FROM {t}) AS products\n\
         )",
        cte = MATCH_PROBABILITY_CTE,
        gammas = gamma_columns,
        den = denominator,
        num = numerator,
        m = m_product,
        u = u_product,
        t = settings.dialect().quote_identifier(vectors_table)
    )
}

/// Maximisation step: new m and u per (comparison, gamma).
/// Pairs falling in a null level are left out of both numerator and denominator.
pub fn maximisation_sql(settings: &Settings, vectors_table: &str) -> String {
    let cte = MATCH_PROBABILITY_CTE;
    let parts = settings
        .comparisons()
        .iter()
        .map(|c| {
            let gamma = c.gamma_column_name();
            format!(
                "SELECT {name} AS comparison_name, {gamma} AS gamma_value,\n\
                 SUM(match_probability) / NULLIF((SELECT SUM(match_probability) FROM {cte} WHERE {gamma} != -1), 0) AS new_probability_match,\n\
                 SUM(1 - match_probability) / NULLIF((SELECT SUM(1 - match_probability) FROM {cte} WHERE {gamma} != -1), 0) AS new_probability_non_match\n\
                 FROM {cte}\n\
                 WHERE {gamma} != -1\n\
                 GROUP BY {gamma}",
                name = sql_string_literal(c.output_column_name()),
                gamma = gamma,
                cte = cte
            )
        })
        .collect::<Vec<_>>()
        .join("\nUNION ALL\n");
    format!("{}\n{}", expectation_cte(settings, vectors_table), parts)
}

/// Maximisation step for λ: mean posterior match probability
pub fn lambda_sql(settings: &Settings, vectors_table: &str) -> String {
    format!(
        "{}\nSELECT SUM(match_probability) / COUNT(match_probability) AS new_lambda FROM {}",
        expectation_cte(settings, vectors_table),
        MATCH_PROBABILITY_CTE
    )
}

pub fn pair_count_sql(dialect: &dyn SqlDialect, table: &str) -> String {
    format!(
        "SELECT COUNT(*) AS pair_count FROM {}",
        dialect.quote_identifier(table)
    )
}

/// Pairs per (comparison, gamma), null levels excluded
pub fn gamma_counts_sql(settings: &Settings, vectors_table: &str) -> String {
    let vectors_table = settings.dialect().quote_identifier(vectors_table);
    settings
        .comparisons()
        .iter()
        .map(|c| {
            let gamma = c.gamma_column_name();
            format!(
                "SELECT {name} AS comparison_name, {gamma} AS gamma_value, COUNT(*) AS gamma_count\n\
                 FROM {t}\n\
                 WHERE {gamma} != -1\n\
                 GROUP BY {gamma}",
                name = sql_string_literal(c.output_column_name()),
                gamma = gamma,
                t = vectors_table
            )
        })
        .collect::<Vec<_>>()
        .join("\nUNION ALL\n")
}
