//! SQL dialect adapters
//!
//! Maps abstract predicate parameters (distance function, regex, date unit,
//! array and geographic helpers) to concrete SQL fragments for one backend.
//! Adapters are stateless and never execute SQL.

use crate::error::{Error, Result};
use crate::settings::SOURCE_DATASET_COLUMN;
use serde::{Deserialize, Serialize};
use std::fmt;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Unit used by date-difference levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DateUnit {
    #[default]
    Day,
    Month,
    Year,
}

impl DateUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateUnit::Day => "day",
            DateUnit::Month => "month",
            DateUnit::Year => "year",
        }
    }
}

/// String distance or similarity function applied to the two sides of a pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DistanceFunction {
    Levenshtein,
    DamerauLevenshtein,
    Jaro,
    JaroWinkler,
    Jaccard,
    /// A backend function referenced by name, passed through verbatim
    Custom(String),
}

impl DistanceFunction {
    /// Generic name, used in chart labels and error messages
    pub fn name(&self) -> &str {
        match self {
            DistanceFunction::Levenshtein => "levenshtein",
            DistanceFunction::DamerauLevenshtein => "damerau_levenshtein",
            DistanceFunction::Jaro => "jaro",
            DistanceFunction::JaroWinkler => "jaro_winkler",
            DistanceFunction::Jaccard => "jaccard",
            DistanceFunction::Custom(name) => name,
        }
    }

    /// Whether larger values mean more similar strings.
    /// Unknown for custom functions.
    pub fn higher_is_more_similar(&self) -> Option<bool> {
        match self {
            DistanceFunction::Levenshtein | DistanceFunction::DamerauLevenshtein => Some(false),
            DistanceFunction::Jaro | DistanceFunction::JaroWinkler | DistanceFunction::Jaccard => {
                Some(true)
            }
            DistanceFunction::Custom(_) => None,
        }
    }
}

/// Capability interface implemented once per SQL backend
pub trait SqlDialect: fmt::Debug + Send + Sync {
    /// Backend identifier, used in error messages
    fn name(&self) -> &'static str;

    /// Table or column name quoted for this backend
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Expression extracting the first match of `pattern` from `column`
    fn regex_extract(&self, column: &str, pattern: &str) -> Result<String>;

    /// Full boolean condition: the two dates are within `threshold` units
    fn date_diff(
        &self,
        col_l: &str,
        col_r: &str,
        threshold: f64,
        unit: DateUnit,
        cast_strings: bool,
        date_format: Option<&str>,
    ) -> Result<String>;

    /// Expression giving the number of distinct shared array elements
    fn array_intersect_size(&self, col_l: &str, col_r: &str) -> Result<String>;

    /// Expression applying a string distance function to both sides
    fn distance_function(
        &self,
        function: &DistanceFunction,
        col_l: &str,
        col_r: &str,
    ) -> Result<String>;

    /// Expression giving the great-circle distance in kilometres
    fn great_circle_distance_km(
        &self,
        lat_l: &str,
        lat_r: &str,
        lon_l: &str,
        lon_r: &str,
    ) -> Result<String> {
        Ok(great_circle_distance_km_sql(lat_l, lat_r, lon_l, lon_r))
    }

    /// Clause appended after `FROM <table>` that keeps a reproducible random
    /// sample of rows. Empty when `proportion >= 1`.
    fn random_sample(
        &self,
        proportion: f64,
        sample_size: u64,
        seed: u64,
        unique_id_column: &str,
    ) -> String;
}

/// Identifier of a supported backend, as written in settings documents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialectKind {
    Spark,
    Duckdb,
    #[default]
    Sqlite,
}

static SPARK: SparkDialect = SparkDialect;
static DUCKDB: DuckDbDialect = DuckDbDialect;
static SQLITE: SqliteDialect = SqliteDialect;

impl SqlDialectKind {
    pub fn adapter(&self) -> &'static dyn SqlDialect {
        match self {
            SqlDialectKind::Spark => &SPARK,
            SqlDialectKind::Duckdb => &DUCKDB,
            SqlDialectKind::Sqlite => &SQLITE,
        }
    }
}

impl fmt::Display for SqlDialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.adapter().name())
    }
}

/// Quote a value as a SQL string literal
pub fn sql_string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a number for embedding in SQL text.
/// Integral values are written without a fractional part.
pub fn sql_number(value: f64) -> String {
    format!("{}", value)
}

fn great_circle_distance_km_sql(lat_l: &str, lat_r: &str, lon_l: &str, lon_r: &str) -> String {
    let partial = format!(
        "sin(radians({lat_l})) * sin(radians({lat_r})) + \
         cos(radians({lat_l})) * cos(radians({lat_r})) * cos(radians({lon_r} - {lon_l}))"
    );
    format!(
        "cast(acos(case when ({partial}) > 1 then 1 when ({partial}) < -1 then -1 \
         else ({partial}) end) * {} as float)",
        sql_number(EARTH_RADIUS_KM)
    )
}

/// Apache Spark SQL
#[derive(Debug, Clone, Copy, Default)]
pub struct SparkDialect;

impl SqlDialect for SparkDialect {
    fn name(&self) -> &'static str {
        "spark"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn regex_extract(&self, column: &str, pattern: &str) -> Result<String> {
        if pattern.contains('\\') {
            return Err(Error::unsupported(
                format!("regex_extract with backslash escapes ('{}')", pattern),
                self.name(),
            ));
        }
        Ok(format!(
            "regexp_extract({}, {}, 0)",
            column,
            sql_string_literal(pattern)
        ))
    }

    fn date_diff(
        &self,
        col_l: &str,
        col_r: &str,
        threshold: f64,
        unit: DateUnit,
        cast_strings: bool,
        date_format: Option<&str>,
    ) -> Result<String> {
        let (l, r) = if cast_strings {
            let format = sql_string_literal(date_format.unwrap_or("yyyy-MM-dd"));
            (
                format!("to_timestamp({}, {})", col_l, format),
                format!("to_timestamp({}, {})", col_r, format),
            )
        } else {
            (col_l.to_string(), col_r.to_string())
        };
        // Casting truncates partial months, native dates round them up
        let rounding = if cast_strings { "floor" } else { "ceil" };
        let expr = match unit {
            DateUnit::Day => format!("abs(datediff({}, {}))", l, r),
            DateUnit::Month => format!("{}(abs(months_between({}, {})))", rounding, l, r),
            DateUnit::Year => format!("{}(abs(months_between({}, {}) / 12))", rounding, l, r),
        };
        Ok(format!("{} <= {}", expr, sql_number(threshold)))
    }

    fn array_intersect_size(&self, col_l: &str, col_r: &str) -> Result<String> {
        Ok(format!("size(array_intersect({}, {}))", col_l, col_r))
    }

    fn distance_function(
        &self,
        function: &DistanceFunction,
        col_l: &str,
        col_r: &str,
    ) -> Result<String> {
        let name = match function {
            DistanceFunction::Levenshtein => "levenshtein",
            DistanceFunction::Jaro => "jaro_sim",
            DistanceFunction::JaroWinkler => "jaro_winkler_sim",
            DistanceFunction::Jaccard => "jaccard_sim",
            DistanceFunction::DamerauLevenshtein => {
                return Err(Error::unsupported(function.name(), self.name()))
            }
            DistanceFunction::Custom(name) => name.as_str(),
        };
        Ok(format!("{}({}, {})", name, col_l, col_r))
    }

    fn random_sample(
        &self,
        proportion: f64,
        sample_size: u64,
        seed: u64,
        _unique_id_column: &str,
    ) -> String {
        if proportion >= 1.0 {
            return String::new();
        }
        format!(" ORDER BY rand({}) LIMIT {}", seed, sample_size)
    }
}

/// DuckDB
#[derive(Debug, Clone, Copy, Default)]
pub struct DuckDbDialect;

impl SqlDialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn regex_extract(&self, column: &str, pattern: &str) -> Result<String> {
        Ok(format!("regexp_extract({}, {})", column, sql_string_literal(pattern)))
    }

    fn date_diff(
        &self,
        col_l: &str,
        col_r: &str,
        threshold: f64,
        unit: DateUnit,
        cast_strings: bool,
        date_format: Option<&str>,
    ) -> Result<String> {
        let unit = sql_string_literal(unit.as_str());
        let expr = if cast_strings {
            let format = sql_string_literal(date_format.unwrap_or("%Y-%m-%d"));
            format!(
                "abs(date_diff({}, strptime({}, {}), strptime({}, {})))",
                unit, col_l, format, col_r, format
            )
        } else {
            format!("abs(date_diff({}, {}, {}))", unit, col_l, col_r)
        };
        Ok(format!("{} <= {}", expr, sql_number(threshold)))
    }

    fn array_intersect_size(&self, col_l: &str, col_r: &str) -> Result<String> {
        Ok(format!("array_length(list_intersect({}, {}))", col_l, col_r))
    }

    fn distance_function(
        &self,
        function: &DistanceFunction,
        col_l: &str,
        col_r: &str,
    ) -> Result<String> {
        let name = match function {
            DistanceFunction::Levenshtein => "levenshtein",
            DistanceFunction::DamerauLevenshtein => "damerau_levenshtein",
            DistanceFunction::Jaro => "jaro_similarity",
            DistanceFunction::JaroWinkler => "jaro_winkler_similarity",
            DistanceFunction::Jaccard => "jaccard",
            DistanceFunction::Custom(name) => name.as_str(),
        };
        Ok(format!("{}({}, {})", name, col_l, col_r))
    }

    fn random_sample(
        &self,
        proportion: f64,
        _sample_size: u64,
        seed: u64,
        _unique_id_column: &str,
    ) -> String {
        if proportion >= 1.0 {
            return String::new();
        }
        format!(
            " USING SAMPLE bernoulli({}%) REPEATABLE({})",
            sql_number(proportion * 100.0),
            seed
        )
    }
}

/// SQLite with the similarity functions registered by `reclink-sqlite`
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn regex_extract(&self, column: &str, pattern: &str) -> Result<String> {
        Ok(format!(
            "regexp_extract({}, {}, 0)",
            column,
            sql_string_literal(pattern)
        ))
    }

    fn date_diff(
        &self,
        col_l: &str,
        col_r: &str,
        threshold: f64,
        unit: DateUnit,
        cast_strings: bool,
        date_format: Option<&str>,
    ) -> Result<String> {
        // julianday() only parses ISO-8601 text
        if cast_strings {
            if let Some(format) = date_format.filter(|f| *f != "%Y-%m-%d") {
                return Err(Error::unsupported(
                    format!("date_diff with date_format '{}'", format),
                    self.name(),
                ));
            }
        }
        let days = format!("abs(julianday({}) - julianday({}))", col_l, col_r);
        let expr = match unit {
            DateUnit::Day => days,
            DateUnit::Month => format!("{} / 30.4375", days),
            DateUnit::Year => format!("{} / 365.25", days),
        };
        Ok(format!("{} <= {}", expr, sql_number(threshold)))
    }

    fn array_intersect_size(&self, col_l: &str, col_r: &str) -> Result<String> {
        Ok(format!(
            "(SELECT COUNT(DISTINCT a.value) FROM json_each({}) AS a \
             WHERE a.value IN (SELECT b.value FROM json_each({}) AS b))",
            col_l, col_r
        ))
    }

    fn distance_function(
        &self,
        function: &DistanceFunction,
        col_l: &str,
        col_r: &str,
    ) -> Result<String> {
        Ok(format!("{}({}, {})", function.name(), col_l, col_r))
    }

    fn great_circle_distance_km(
        &self,
        lat_l: &str,
        lat_r: &str,
        lon_l: &str,
        lon_r: &str,
    ) -> Result<String> {
        Ok(format!(
            "great_circle_km({}, {}, {}, {})",
            lat_l, lat_r, lon_l, lon_r
        ))
    }

    fn random_sample(
        &self,
        proportion: f64,
        _sample_size: u64,
        seed: u64,
        unique_id_column: &str,
    ) -> String {
        if proportion >= 1.0 {
            return String::new();
        }
        format!(
            " WHERE seeded_uniform('{}', {}, {}) < {}",
            seed,
            SOURCE_DATASET_COLUMN,
            unique_id_column,
            sql_number(proportion)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_function_names_differ_by_backend() {
        let f = DistanceFunction::JaroWinkler;
        assert_eq!(
            SparkDialect.distance_function(&f, "name_l", "name_r").unwrap(),
            "jaro_winkler_sim(name_l, name_r)"
        );
        assert_eq!(
            DuckDbDialect.distance_function(&f, "name_l", "name_r").unwrap(),
            "jaro_winkler_similarity(name_l, name_r)"
        );
        assert_eq!(
            SqliteDialect.distance_function(&f, "name_l", "name_r").unwrap(),
            "jaro_winkler(name_l, name_r)"
        );
    }

    #[test]
    fn test_unsupported_function_names_function_and_backend() {
        let err = SparkDialect
            .distance_function(&DistanceFunction::DamerauLevenshtein, "a_l", "a_r")
            .unwrap_err();
        match err {
            Error::UnsupportedFunction { function, dialect } => {
                assert_eq!(function, "damerau_levenshtein");
                assert_eq!(dialect, "spark");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_custom_function_passes_through() {
        let f = DistanceFunction::Custom("my_udf".to_string());
        for kind in [SqlDialectKind::Spark, SqlDialectKind::Duckdb, SqlDialectKind::Sqlite] {
            assert_eq!(
                kind.adapter().distance_function(&f, "x_l", "x_r").unwrap(),
                "my_udf(x_l, x_r)"
            );
        }
    }

    #[test]
    fn test_spark_regex_rejects_backslash() {
        assert!(SparkDialect.regex_extract("name_l", "^[A-Z]{1,4}").is_ok());
        assert!(matches!(
            SparkDialect.regex_extract("name_l", "\\d+"),
            Err(Error::UnsupportedFunction { .. })
        ));
        assert_eq!(
            DuckDbDialect.regex_extract("name_l", "\\d+").unwrap(),
            "regexp_extract(name_l, '\\d+')"
        );
    }

    #[test]
    fn test_regex_pattern_quotes_are_escaped() {
        assert_eq!(
            SqliteDialect.regex_extract("c", "o'n").unwrap(),
            "regexp_extract(c, 'o''n', 0)"
        );
    }

    #[test]
    fn test_date_diff_spark() {
        assert_eq!(
            SparkDialect
                .date_diff("dob_l", "dob_r", 3.0, DateUnit::Day, false, None)
                .unwrap(),
            "abs(datediff(dob_l, dob_r)) <= 3"
        );
        assert_eq!(
            SparkDialect
                .date_diff("dob_l", "dob_r", 1.0, DateUnit::Year, true, None)
                .unwrap(),
            "floor(abs(months_between(to_timestamp(dob_l, 'yyyy-MM-dd'), \
             to_timestamp(dob_r, 'yyyy-MM-dd')) / 12)) <= 1"
        );
    }

    #[test]
    fn test_date_diff_duckdb_with_format() {
        assert_eq!(
            DuckDbDialect
                .date_diff("d_l", "d_r", 2.0, DateUnit::Month, true, Some("%d/%m/%Y"))
                .unwrap(),
            "abs(date_diff('month', strptime(d_l, '%d/%m/%Y'), strptime(d_r, '%d/%m/%Y'))) <= 2"
        );
    }

    #[test]
    fn test_date_diff_sqlite_rejects_custom_format() {
        assert!(SqliteDialect
            .date_diff("d_l", "d_r", 2.0, DateUnit::Day, true, Some("%Y-%m-%d"))
            .is_ok());
        assert!(matches!(
            SqliteDialect.date_diff("d_l", "d_r", 2.0, DateUnit::Day, true, Some("%d/%m/%Y")),
            Err(Error::UnsupportedFunction { .. })
        ));
    }

    #[test]
    fn test_array_intersect() {
        assert_eq!(
            SparkDialect.array_intersect_size("p_l", "p_r").unwrap(),
            "size(array_intersect(p_l, p_r))"
        );
        assert_eq!(
            DuckDbDialect.array_intersect_size("p_l", "p_r").unwrap(),
            "array_length(list_intersect(p_l, p_r))"
        );
    }

    #[test]
    fn test_great_circle_shared_formula() {
        let sql = DuckDbDialect
            .great_circle_distance_km("lat_l", "lat_r", "lon_l", "lon_r")
            .unwrap();
        assert!(sql.starts_with("cast(acos("));
        assert!(sql.contains("radians(lon_r - lon_l)"));
        assert!(sql.contains("* 6371 as float)"));
        assert_eq!(
            SqliteDialect
                .great_circle_distance_km("lat_l", "lat_r", "lon_l", "lon_r")
                .unwrap(),
            "great_circle_km(lat_l, lat_r, lon_l, lon_r)"
        );
    }

    #[test]
    fn test_random_sample_clauses() {
        assert_eq!(SqliteDialect.random_sample(1.0, 10, 1, "unique_id"), "");
        assert_eq!(
            SqliteDialect.random_sample(0.25, 10, 7, "unique_id"),
            " WHERE seeded_uniform('7', source_dataset, unique_id) < 0.25"
        );
        assert_eq!(
            DuckDbDialect.random_sample(0.25, 10, 7, "unique_id"),
            " USING SAMPLE bernoulli(25%) REPEATABLE(7)"
        );
        assert_eq!(
            SparkDialect.random_sample(0.25, 10, 7, "unique_id"),
            " ORDER BY rand(7) LIMIT 10"
        );
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(SqliteDialect.quote_identifier("people"), "\"people\"");
        assert_eq!(DuckDbDialect.quote_identifier("odd\"name"), "\"odd\"\"name\"");
        assert_eq!(SparkDialect.quote_identifier("people"), "`people`");
        assert_eq!(SparkDialect.quote_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn test_dialect_kind_serde() {
        let kind: SqlDialectKind = serde_json::from_str("\"duckdb\"").unwrap();
        assert_eq!(kind, SqlDialectKind::Duckdb);
        assert_eq!(kind.to_string(), "duckdb");
        let f: DistanceFunction = serde_json::from_str("\"jaro_winkler\"").unwrap();
        assert_eq!(f, DistanceFunction::JaroWinkler);
        let custom: DistanceFunction = serde_json::from_str("{\"custom\":\"f\"}").unwrap();
        assert_eq!(custom, DistanceFunction::Custom("f".into()));
    }
}
