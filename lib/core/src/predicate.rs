//! Abstract similarity predicates
//!
//! Each comparison level is described by one [`Predicate`]: a kind plus the
//! parameters for that kind. Predicates carry no SQL text of their own; they are
//! compiled through a [`SqlDialect`] when the owning settings are built.

use crate::dialect::{sql_number, DateUnit, DistanceFunction, SqlDialect};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Condition text used for the terminal catch-all level
pub const ELSE_CONDITION: &str = "ELSE";

/// Name of the left-hand copy of an input column in a pairwise table
pub fn column_l(column: &str) -> String {
    format!("{}_l", column)
}

/// Name of the right-hand copy of an input column in a pairwise table
pub fn column_r(column: &str) -> String {
    format!("{}_r", column)
}

fn default_min_intersection() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Either side is null, or fails to match `valid_string_regex`
    Null {
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        valid_string_regex: Option<String>,
    },
    ExactMatch {
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex_extract: Option<String>,
    },
    DistanceFunction {
        column: String,
        function: DistanceFunction,
        threshold: f64,
        /// Required for custom functions, derived from the function otherwise
        #[serde(default, skip_serializing_if = "Option::is_none")]
        higher_is_more_similar: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex_extract: Option<String>,
    },
    /// The two columns match each other with left and right swapped
    ColumnsReversed {
        column_1: String,
        column_2: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex_extract: Option<String>,
    },
    DistanceInKm {
        lat_column: String,
        lon_column: String,
        km_threshold: f64,
        #[serde(default)]
        not_null: bool,
    },
    /// |l - r| / max(l, r) below the threshold
    PercentageDifference { column: String, threshold: f64 },
    ArrayIntersect {
        column: String,
        #[serde(default = "default_min_intersection")]
        min_intersection: u32,
    },
    DateDiff {
        column: String,
        threshold: f64,
        #[serde(default)]
        unit: DateUnit,
        #[serde(default)]
        cast_strings: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date_format: Option<String>,
    },
    Else,
}

fn require_column(kind: &str, column: &str) -> Result<()> {
    if column.trim().is_empty() {
        return Err(Error::InvalidConfiguration(format!(
            "{} level requires a non-empty column name",
            kind
        )));
    }
    Ok(())
}

fn require_threshold(kind: &str, threshold: f64) -> Result<()> {
    if !threshold.is_finite() {
        return Err(Error::InvalidConfiguration(format!(
            "{} level threshold must be a finite number, got {}",
            kind, threshold
        )));
    }
    Ok(())
}

fn require_regex(kind: &str, regex: &Option<String>) -> Result<()> {
    if let Some(pattern) = regex {
        if pattern.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "{} level has an empty regex pattern",
                kind
            )));
        }
    }
    Ok(())
}

/// Left and right operands for a column, optionally wrapped in a regex extract
fn operands(
    dialect: &dyn SqlDialect,
    column: &str,
    regex: &Option<String>,
) -> Result<(String, String)> {
    let (l, r) = (column_l(column), column_r(column));
    match regex {
        Some(pattern) => Ok((
            dialect.regex_extract(&l, pattern)?,
            dialect.regex_extract(&r, pattern)?,
        )),
        None => Ok((l, r)),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl Predicate {
    pub fn kind(&self) -> &'static str {
        match self {
            Predicate::Null { .. } => "null",
            Predicate::ExactMatch { .. } => "exact_match",
            Predicate::DistanceFunction { .. } => "distance_function",
            Predicate::ColumnsReversed { .. } => "columns_reversed",
            Predicate::DistanceInKm { .. } => "distance_in_km",
            Predicate::PercentageDifference { .. } => "percentage_difference",
            Predicate::ArrayIntersect { .. } => "array_intersect",
            Predicate::DateDiff { .. } => "date_diff",
            Predicate::Else => "else",
        }
    }

    pub fn is_else(&self) -> bool {
        matches!(self, Predicate::Else)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Predicate::Null { .. })
    }

    /// Check parameters without compiling
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        match self {
            Predicate::Null {
                column,
                valid_string_regex,
            } => {
                require_column(kind, column)?;
                require_regex(kind, valid_string_regex)
            }
            Predicate::ExactMatch {
                column,
                regex_extract,
            } => {
                require_column(kind, column)?;
                require_regex(kind, regex_extract)
            }
            Predicate::DistanceFunction {
                column,
                function,
                threshold,
                higher_is_more_similar,
                regex_extract,
            } => {
                require_column(kind, column)?;
                require_threshold(kind, *threshold)?;
                require_regex(kind, regex_extract)?;
                if let DistanceFunction::Custom(name) = function {
                    require_column(kind, name)?;
                    if higher_is_more_similar.is_none() {
                        return Err(Error::InvalidConfiguration(format!(
                            "custom distance function '{}' needs higher_is_more_similar",
                            name
                        )));
                    }
                }
                Ok(())
            }
            Predicate::ColumnsReversed {
                column_1,
                column_2,
                regex_extract,
            } => {
                require_column(kind, column_1)?;
                require_column(kind, column_2)?;
                require_regex(kind, regex_extract)
            }
            Predicate::DistanceInKm {
                lat_column,
                lon_column,
                km_threshold,
                ..
            } => {
                require_column(kind, lat_column)?;
                require_column(kind, lon_column)?;
                require_threshold(kind, *km_threshold)?;
                if *km_threshold < 0.0 {
                    return Err(Error::InvalidConfiguration(format!(
                        "km threshold must not be negative, got {}",
                        km_threshold
                    )));
                }
                Ok(())
            }
            Predicate::PercentageDifference { column, threshold } => {
                require_column(kind, column)?;
                require_threshold(kind, *threshold)?;
                if *threshold < 0.0 {
                    return Err(Error::InvalidConfiguration(format!(
                        "percentage difference threshold must not be negative, got {}",
                        threshold
                    )));
                }
                Ok(())
            }
            Predicate::ArrayIntersect { column, .. } => require_column(kind, column),
            Predicate::DateDiff {
                column, threshold, ..
            } => {
                require_column(kind, column)?;
                require_threshold(kind, *threshold)
            }
            Predicate::Else => Ok(()),
        }
    }

    /// Compile to a boolean SQL condition over `<col>_l` / `<col>_r` columns
    pub fn compile(&self, dialect: &dyn SqlDialect) -> Result<String> {
        self.validate()?;
        let sql = match self {
            Predicate::Null {
                column,
                valid_string_regex,
            } => match valid_string_regex {
                Some(_) => {
                    let (l, r) = operands(dialect, column, valid_string_regex)?;
                    format!(
                        "{l} IS NULL OR {r} IS NULL OR {l} = '' OR {r} = ''",
                        l = l,
                        r = r
                    )
                }
                None => format!("{} IS NULL OR {} IS NULL", column_l(column), column_r(column)),
            },
            Predicate::ExactMatch {
                column,
                regex_extract,
            } => {
                let (l, r) = operands(dialect, column, regex_extract)?;
                format!("{} = {}", l, r)
            }
            Predicate::DistanceFunction {
                column,
                function,
                threshold,
                regex_extract,
                ..
            } => {
                let (l, r) = operands(dialect, column, regex_extract)?;
                format!(
                    "{} {} {}",
                    dialect.distance_function(function, &l, &r)?,
                    self.comparison_operator(),
                    sql_number(*threshold)
                )
            }
            Predicate::ColumnsReversed {
                column_1,
                column_2,
                regex_extract,
            } => {
                let (c1_l, c1_r) = operands(dialect, column_1, regex_extract)?;
                let (c2_l, c2_r) = operands(dialect, column_2, regex_extract)?;
                format!("{} = {} AND {} = {}", c1_l, c2_r, c1_r, c2_l)
            }
            Predicate::DistanceInKm {
                lat_column,
                lon_column,
                km_threshold,
                not_null,
            } => {
                let (lat_l, lat_r) = (column_l(lat_column), column_r(lat_column));
                let (lon_l, lon_r) = (column_l(lon_column), column_r(lon_column));
                let distance = format!(
                    "{} <= {}",
                    dialect.great_circle_distance_km(&lat_l, &lat_r, &lon_l, &lon_r)?,
                    sql_number(*km_threshold)
                );
                if *not_null {
                    let checks = [&lat_r, &lat_l, &lon_l, &lon_r]
                        .iter()
                        .map(|c| format!("{} IS NOT NULL", c))
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    format!("({}) AND {}", checks, distance)
                } else {
                    distance
                }
            }
            Predicate::PercentageDifference { column, threshold } => {
                let (l, r) = (column_l(column), column_r(column));
                // `* 1.0` keeps integer columns out of integer division
                format!(
                    "(abs({l} - {r}) * 1.0 / (CASE WHEN {r} > {l} THEN {r} ELSE {l} END)) < {t}",
                    l = l,
                    r = r,
                    t = sql_number(*threshold)
                )
            }
            Predicate::ArrayIntersect {
                column,
                min_intersection,
            } => format!(
                "{} >= {}",
                dialect.array_intersect_size(&column_l(column), &column_r(column))?,
                min_intersection
            ),
            Predicate::DateDiff {
                column,
                threshold,
                unit,
                cast_strings,
                date_format,
            } => dialect.date_diff(
                &column_l(column),
                &column_r(column),
                *threshold,
                *unit,
                *cast_strings,
                date_format.as_deref(),
            )?,
            Predicate::Else => ELSE_CONDITION.to_string(),
        };
        Ok(sql)
    }

    fn comparison_operator(&self) -> &'static str {
        match self {
            Predicate::DistanceFunction {
                function,
                higher_is_more_similar,
                ..
            } => {
                let higher = higher_is_more_similar
                    .or_else(|| function.higher_is_more_similar())
                    .unwrap_or(false);
                if higher {
                    ">="
                } else {
                    "<="
                }
            }
            _ => "=",
        }
    }

    /// Label used when the level configuration does not provide one
    pub fn default_label(&self) -> String {
        match self {
            Predicate::Null { .. } => "Null".to_string(),
            Predicate::ExactMatch { .. } => "Exact match".to_string(),
            Predicate::DistanceFunction {
                function,
                threshold,
                ..
            } => format!(
                "{} {} {}",
                capitalize(function.name()),
                self.comparison_operator(),
                sql_number(*threshold)
            ),
            Predicate::ColumnsReversed { .. } => "Exact match on reversed cols".to_string(),
            Predicate::DistanceInKm { km_threshold, .. } => {
                format!("Distance less than {}km", sql_number(*km_threshold))
            }
            Predicate::PercentageDifference { threshold, .. } => {
                format!("< {:.2}% diff", threshold * 100.0)
            }
            Predicate::ArrayIntersect {
                min_intersection, ..
            } => {
                if *min_intersection == 1 {
                    "Arrays intersect".to_string()
                } else {
                    format!("Arrays intersect size >= {}", min_intersection)
                }
            }
            Predicate::DateDiff {
                threshold, unit, ..
            } => {
                let plural = if *threshold > 1.0 { "s" } else { "" };
                format!("Within {} {}{}", sql_number(*threshold), unit.as_str(), plural)
            }
            Predicate::Else => "All other comparisons".to_string(),
        }
    }

    /// Input columns referenced on each side of the pair
    pub fn input_columns(&self) -> Vec<&str> {
        match self {
            Predicate::Null { column, .. }
            | Predicate::ExactMatch { column, .. }
            | Predicate::DistanceFunction { column, .. }
            | Predicate::PercentageDifference { column, .. }
            | Predicate::ArrayIntersect { column, .. }
            | Predicate::DateDiff { column, .. } => vec![column.as_str()],
            Predicate::ColumnsReversed {
                column_1, column_2, ..
            } => vec![column_1.as_str(), column_2.as_str()],
            Predicate::DistanceInKm {
                lat_column,
                lon_column,
                ..
            } => vec![lat_column.as_str(), lon_column.as_str()],
            Predicate::Else => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{DuckDbDialect, SparkDialect, SqliteDialect};

    fn levenshtein(threshold: f64) -> Predicate {
        Predicate::DistanceFunction {
            column: "name".into(),
            function: DistanceFunction::Levenshtein,
            threshold,
            higher_is_more_similar: None,
            regex_extract: None,
        }
    }

    #[test]
    fn test_exact_match_with_and_without_regex() {
        let plain = Predicate::ExactMatch {
            column: "postcode".into(),
            regex_extract: None,
        };
        assert_eq!(plain.compile(&SqliteDialect).unwrap(), "postcode_l = postcode_r");

        let extracted = Predicate::ExactMatch {
            column: "postcode".into(),
            regex_extract: Some("^[A-Z]{1,2}".into()),
        };
        assert_eq!(
            extracted.compile(&SparkDialect).unwrap(),
            "regexp_extract(postcode_l, '^[A-Z]{1,2}', 0) = regexp_extract(postcode_r, '^[A-Z]{1,2}', 0)"
        );
    }

    #[test]
    fn test_distance_operator_follows_function() {
        assert_eq!(
            levenshtein(2.0).compile(&DuckDbDialect).unwrap(),
            "levenshtein(name_l, name_r) <= 2"
        );
        let jw = Predicate::DistanceFunction {
            column: "name".into(),
            function: DistanceFunction::JaroWinkler,
            threshold: 0.9,
            higher_is_more_similar: None,
            regex_extract: None,
        };
        assert_eq!(
            jw.compile(&DuckDbDialect).unwrap(),
            "jaro_winkler_similarity(name_l, name_r) >= 0.9"
        );
        assert_eq!(jw.default_label(), "Jaro_winkler >= 0.9");
        assert_eq!(levenshtein(2.0).default_label(), "Levenshtein <= 2");
    }

    #[test]
    fn test_custom_function_requires_direction() {
        let p = Predicate::DistanceFunction {
            column: "name".into(),
            function: DistanceFunction::Custom("cosine_distance".into()),
            threshold: 0.2,
            higher_is_more_similar: None,
            regex_extract: None,
        };
        assert!(matches!(p.validate(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_non_finite_threshold_rejected() {
        assert!(matches!(
            levenshtein(f64::NAN).compile(&SqliteDialect),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_null_level_with_valid_string_regex() {
        let p = Predicate::Null {
            column: "name".into(),
            valid_string_regex: Some("^[A-Z]{1,7}$".into()),
        };
        let sql = p.compile(&DuckDbDialect).unwrap();
        assert!(sql.starts_with("regexp_extract(name_l, '^[A-Z]{1,7}$') IS NULL OR"));
        assert!(sql.ends_with("regexp_extract(name_r, '^[A-Z]{1,7}$') = ''"));

        let plain = Predicate::Null {
            column: "name".into(),
            valid_string_regex: None,
        };
        assert_eq!(
            plain.compile(&DuckDbDialect).unwrap(),
            "name_l IS NULL OR name_r IS NULL"
        );
    }

    #[test]
    fn test_columns_reversed() {
        let p = Predicate::ColumnsReversed {
            column_1: "first_name".into(),
            column_2: "surname".into(),
            regex_extract: None,
        };
        assert_eq!(
            p.compile(&SqliteDialect).unwrap(),
            "first_name_l = surname_r AND first_name_r = surname_l"
        );
        assert_eq!(p.input_columns(), vec!["first_name", "surname"]);
    }

    #[test]
    fn test_distance_in_km_not_null() {
        let p = Predicate::DistanceInKm {
            lat_column: "lat".into(),
            lon_column: "lon".into(),
            km_threshold: 5.0,
            not_null: true,
        };
        let sql = p.compile(&SqliteDialect).unwrap();
        assert_eq!(
            sql,
            "(lat_r IS NOT NULL AND lat_l IS NOT NULL AND lon_l IS NOT NULL AND lon_r IS NOT NULL) \
             AND great_circle_km(lat_l, lat_r, lon_l, lon_r) <= 5"
        );
        assert_eq!(p.default_label(), "Distance less than 5km");
    }

    #[test]
    fn test_percentage_difference() {
        let p = Predicate::PercentageDifference {
            column: "amount".into(),
            threshold: 0.5,
        };
        assert_eq!(
            p.compile(&SqliteDialect).unwrap(),
            "(abs(amount_l - amount_r) * 1.0 / (CASE WHEN amount_r > amount_l THEN amount_r ELSE amount_l END)) < 0.5"
        );
        assert_eq!(p.default_label(), "< 50.00% diff");
    }

    #[test]
    fn test_array_intersect_and_date_labels() {
        let arrays = Predicate::ArrayIntersect {
            column: "postcodes".into(),
            min_intersection: 2,
        };
        assert_eq!(
            arrays.compile(&SparkDialect).unwrap(),
            "size(array_intersect(postcodes_l, postcodes_r)) >= 2"
        );
        assert_eq!(arrays.default_label(), "Arrays intersect size >= 2");

        let dates = Predicate::DateDiff {
            column: "dob".into(),
            threshold: 5.0,
            unit: DateUnit::Year,
            cast_strings: false,
            date_format: None,
        };
        assert_eq!(dates.default_label(), "Within 5 years");
    }

    #[test]
    fn test_else_compiles_to_keyword() {
        assert_eq!(Predicate::Else.compile(&SparkDialect).unwrap(), ELSE_CONDITION);
        assert!(Predicate::Else.input_columns().is_empty());
    }

    #[test]
    fn test_predicate_serde_tagging() {
        let json = serde_json::json!({
            "kind": "distance_function",
            "column": "name",
            "function": "levenshtein",
            "threshold": 1
        });
        let p: Predicate = serde_json::from_value(json).unwrap();
        assert_eq!(p, levenshtein(1.0));

        let else_json = serde_json::to_value(&Predicate::Else).unwrap();
        assert_eq!(else_json, serde_json::json!({"kind": "else"}));
    }
}
