//! Comparison levels
//!
//! A level is one mutually-exclusive outcome of comparing a field across a
//! record pair. [`LevelConfig`] is the serialisable configuration,
//! [`ComparisonLevel`] the validated, compiled level owned by a comparison.

use crate::dialect::{DateUnit, DistanceFunction, SqlDialect};
use crate::error::{Error, Result};
use crate::predicate::{Predicate, ELSE_CONDITION};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// True when `value` is a finite number in [0, 1]
pub fn is_valid_probability(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// Accept only numeric probabilities. A string here is almost always a column
/// name passed in the wrong position, so say so.
pub(crate) fn deserialize_probability<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("probability {} is not a float", n))),
        Some(Value::String(s)) => Err(D::Error::custom(format!(
            "probability must be numeric but got the string '{}'; perhaps a column name \
             was passed where a probability belongs",
            s
        ))),
        Some(other) => Err(D::Error::custom(format!(
            "probability must be numeric, got {}",
            other
        ))),
    }
}

/// Serialisable configuration of one comparison level
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LevelConfig {
    /// Abstract predicate, compiled through the settings' dialect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Predicate>,

    /// Pre-compiled backend condition; takes precedence over `predicate`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_for_charts: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_probability"
    )]
    pub m_probability: Option<f64>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_probability"
    )]
    pub u_probability: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_null_level: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf_adjustment_column: Option<String>,
}

impl LevelConfig {
    pub fn from_predicate(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Default::default()
        }
    }

    /// A level defined directly by backend SQL
    pub fn sql(condition: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            sql_condition: Some(condition.into()),
            label_for_charts: Some(label.into()),
            ..Default::default()
        }
    }

    pub fn null_level(column: impl Into<String>) -> Self {
        Self::from_predicate(Predicate::Null {
            column: column.into(),
            valid_string_regex: None,
        })
    }

    pub fn exact_match(column: impl Into<String>) -> Self {
        Self::from_predicate(Predicate::ExactMatch {
            column: column.into(),
            regex_extract: None,
        })
    }

    pub fn distance_function(
        column: impl Into<String>,
        function: DistanceFunction,
        threshold: f64,
    ) -> Self {
        Self::from_predicate(Predicate::DistanceFunction {
            column: column.into(),
            function,
            threshold,
            higher_is_more_similar: None,
            regex_extract: None,
        })
    }

    pub fn levenshtein(column: impl Into<String>, threshold: f64) -> Self {
        Self::distance_function(column, DistanceFunction::Levenshtein, threshold)
    }

    pub fn jaro_winkler(column: impl Into<String>, threshold: f64) -> Self {
        Self::distance_function(column, DistanceFunction::JaroWinkler, threshold)
    }

    pub fn columns_reversed(column_1: impl Into<String>, column_2: impl Into<String>) -> Self {
        Self::from_predicate(Predicate::ColumnsReversed {
            column_1: column_1.into(),
            column_2: column_2.into(),
            regex_extract: None,
        })
    }

    pub fn distance_in_km(
        lat_column: impl Into<String>,
        lon_column: impl Into<String>,
        km_threshold: f64,
    ) -> Self {
        Self::from_predicate(Predicate::DistanceInKm {
            lat_column: lat_column.into(),
            lon_column: lon_column.into(),
            km_threshold,
            not_null: false,
        })
    }

    pub fn percentage_difference(column: impl Into<String>, threshold: f64) -> Self {
        Self::from_predicate(Predicate::PercentageDifference {
            column: column.into(),
            threshold,
        })
    }

    pub fn array_intersect(column: impl Into<String>, min_intersection: u32) -> Self {
        Self::from_predicate(Predicate::ArrayIntersect {
            column: column.into(),
            min_intersection,
        })
    }

    pub fn datediff(column: impl Into<String>, threshold: f64, unit: DateUnit) -> Self {
        Self::from_predicate(Predicate::DateDiff {
            column: column.into(),
            threshold,
            unit,
            cast_strings: false,
            date_format: None,
        })
    }

    pub fn else_level() -> Self {
        Self::from_predicate(Predicate::Else)
    }

    pub fn with_m_probability(mut self, m: f64) -> Self {
        self.m_probability = Some(m);
        self
    }

    pub fn with_u_probability(mut self, u: f64) -> Self {
        self.u_probability = Some(u);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label_for_charts = Some(label.into());
        self
    }

    pub fn with_tf_adjustment(mut self, column: impl Into<String>) -> Self {
        self.tf_adjustment_column = Some(column.into());
        self
    }
}

/// A validated comparison level with its compiled condition and probabilities
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonLevel {
    predicate: Option<Predicate>,
    sql_condition: String,
    label_for_charts: String,
    is_null_level: bool,
    tf_adjustment_column: Option<String>,
    gamma_value: i32,
    m_probability: Option<f64>,
    u_probability: Option<f64>,
}

fn config_probability(name: &str, value: Option<f64>) -> Result<Option<f64>> {
    match value {
        Some(p) if !is_valid_probability(p) => Err(Error::InvalidConfiguration(format!(
            "{} must be within [0, 1], got {}",
            name, p
        ))),
        other => Ok(other),
    }
}

impl ComparisonLevel {
    /// Build a level from its configuration, compiling the predicate if needed.
    /// The gamma value is assigned by the owning comparison.
    pub fn from_config(config: &LevelConfig, dialect: &dyn SqlDialect) -> Result<Self> {
        let sql_condition = match (&config.sql_condition, &config.predicate) {
            (Some(sql), predicate) => {
                if let Some(p) = predicate {
                    p.validate()?;
                }
                if sql.trim().is_empty() {
                    return Err(Error::InvalidConfiguration(
                        "sql_condition must not be empty".to_string(),
                    ));
                }
                sql.trim().to_string()
            }
            (None, Some(p)) => p.compile(dialect)?,
            (None, None) => {
                return Err(Error::InvalidConfiguration(
                    "a comparison level needs either a predicate or a sql_condition".to_string(),
                ))
            }
        };

        let is_else = sql_condition.eq_ignore_ascii_case(ELSE_CONDITION);
        let predicate_is_null = config.predicate.as_ref().map_or(false, Predicate::is_null);
        let is_null_level = match config.is_null_level {
            Some(false) if predicate_is_null => {
                return Err(Error::InvalidConfiguration(
                    "a null predicate cannot be marked is_null_level = false".to_string(),
                ))
            }
            Some(flag) => flag,
            None => predicate_is_null,
        };

        if is_else && (is_null_level || config.tf_adjustment_column.is_some()) {
            return Err(Error::InvalidConfiguration(
                "the else level takes no column-specific parameters".to_string(),
            ));
        }
        if is_null_level && (config.m_probability.is_some() || config.u_probability.is_some()) {
            return Err(Error::InvalidConfiguration(
                "a null level carries no m or u probability".to_string(),
            ));
        }

        let label_for_charts = match (&config.label_for_charts, &config.predicate) {
            (Some(label), _) => label.clone(),
            (None, Some(p)) => p.default_label(),
            (None, None) if is_else => Predicate::Else.default_label(),
            (None, None) => sql_condition.clone(),
        };

        Ok(Self {
            predicate: config.predicate.clone(),
            sql_condition: if is_else {
                ELSE_CONDITION.to_string()
            } else {
                sql_condition
            },
            label_for_charts,
            is_null_level,
            tf_adjustment_column: config.tf_adjustment_column.clone(),
            gamma_value: 0,
            m_probability: config_probability("m_probability", config.m_probability)?,
            u_probability: config_probability("u_probability", config.u_probability)?,
        })
    }

    /// Build from a predicate alone
    pub fn new(predicate: Predicate, dialect: &dyn SqlDialect) -> Result<Self> {
        Self::from_config(&LevelConfig::from_predicate(predicate), dialect)
    }

    pub(crate) fn assign_gamma(&mut self, gamma_value: i32) {
        self.gamma_value = gamma_value;
    }

    /// The gamma value assigned to pairs falling in this level
    pub fn gamma_value(&self) -> i32 {
        self.gamma_value
    }

    pub fn sql_condition(&self) -> &str {
        &self.sql_condition
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub fn label_for_charts(&self) -> &str {
        &self.label_for_charts
    }

    pub fn is_null_level(&self) -> bool {
        self.is_null_level
    }

    pub fn is_else_level(&self) -> bool {
        self.sql_condition == ELSE_CONDITION
    }

    pub fn tf_adjustment_column(&self) -> Option<&str> {
        self.tf_adjustment_column.as_deref()
    }

    pub fn m_probability(&self) -> Option<f64> {
        self.m_probability
    }

    pub fn u_probability(&self) -> Option<f64> {
        self.u_probability
    }

    /// Set both probabilities. Values outside [0, 1] are a model state error.
    pub fn set_probabilities(&mut self, m: f64, u: f64) -> Result<()> {
        self.set_m_probability(m)?;
        self.set_u_probability(u)
    }

    pub fn set_m_probability(&mut self, m: f64) -> Result<()> {
        self.m_probability = Some(self.checked("m", m)?);
        Ok(())
    }

    pub fn set_u_probability(&mut self, u: f64) -> Result<()> {
        self.u_probability = Some(self.checked("u", u)?);
        Ok(())
    }

    fn checked(&self, which: &str, value: f64) -> Result<f64> {
        if self.is_null_level {
            return Err(Error::ModelState(format!(
                "null level '{}' cannot hold a {} probability",
                self.label_for_charts, which
            )));
        }
        if !is_valid_probability(value) {
            return Err(Error::ModelState(format!(
                "{} probability {} for level '{}' is outside [0, 1]",
                which, value, self.label_for_charts
            )));
        }
        Ok(value)
    }

    /// Clear both probabilities back to unknown
    pub fn reset(&mut self) {
        self.m_probability = None;
        self.u_probability = None;
    }

    /// m / u, or `None` while either probability is unknown
    pub fn bayes_factor(&self) -> Option<f64> {
        if self.is_null_level {
            return Some(1.0);
        }
        match (self.m_probability, self.u_probability) {
            (Some(m), Some(u)) => Some(if u == 0.0 { f64::INFINITY } else { m / u }),
            _ => None,
        }
    }

    /// log2 of the Bayes factor
    pub fn match_weight(&self) -> Option<f64> {
        self.bayes_factor().map(f64::log2)
    }

    pub fn to_config(&self) -> LevelConfig {
        LevelConfig {
            predicate: self.predicate.clone(),
            sql_condition: Some(self.sql_condition.clone()),
            label_for_charts: Some(self.label_for_charts.clone()),
            m_probability: self.m_probability,
            u_probability: self.u_probability,
            is_null_level: if self.is_null_level { Some(true) } else { None },
            tf_adjustment_column: self.tf_adjustment_column.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;

    #[test]
    fn test_string_probability_is_invalid_configuration() {
        let json = serde_json::json!({
            "sql_condition": "ELSE",
            "m_probability": "first_name"
        });
        let err = serde_json::from_value::<LevelConfig>(json).unwrap_err();
        assert!(err.to_string().contains("column name"));
    }

    #[test]
    fn test_probability_out_of_range_rejected_at_construction() {
        let config = LevelConfig::exact_match("name").with_m_probability(1.2);
        assert!(matches!(
            ComparisonLevel::from_config(&config, &SqliteDialect),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_else_level_rejects_column_parameters() {
        let config = LevelConfig::else_level().with_tf_adjustment("name");
        assert!(matches!(
            ComparisonLevel::from_config(&config, &SqliteDialect),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_level_needs_predicate_or_sql() {
        assert!(matches!(
            ComparisonLevel::from_config(&LevelConfig::default(), &SqliteDialect),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_raw_sql_else_is_recognised() {
        let level = ComparisonLevel::from_config(
            &LevelConfig {
                sql_condition: Some("else".into()),
                ..Default::default()
            },
            &SqliteDialect,
        )
        .unwrap();
        assert!(level.is_else_level());
        assert_eq!(level.sql_condition(), "ELSE");
        assert_eq!(level.label_for_charts(), "All other comparisons");
    }

    #[test]
    fn test_null_level_flags() {
        let level = ComparisonLevel::from_config(&LevelConfig::null_level("dob"), &SqliteDialect)
            .unwrap();
        assert!(level.is_null_level());
        assert_eq!(level.bayes_factor(), Some(1.0));

        let bad = LevelConfig::null_level("dob").with_m_probability(0.1);
        assert!(ComparisonLevel::from_config(&bad, &SqliteDialect).is_err());
    }

    #[test]
    fn test_set_and_reset_probabilities() {
        let mut level = ComparisonLevel::new(
            Predicate::ExactMatch {
                column: "name".into(),
                regex_extract: None,
            },
            &SqliteDialect,
        )
        .unwrap();
        assert_eq!(level.bayes_factor(), None);

        level.set_probabilities(0.8, 0.1).unwrap();
        assert!((level.bayes_factor().unwrap() - 8.0).abs() < 1e-12);
        assert!((level.match_weight().unwrap() - 3.0).abs() < 1e-12);

        assert!(matches!(
            level.set_u_probability(1.5),
            Err(Error::ModelState(_))
        ));
        assert_eq!(level.u_probability(), Some(0.1));

        level.reset();
        assert_eq!(level.m_probability(), None);
        assert_eq!(level.u_probability(), None);
    }

    #[test]
    fn test_to_config_rebuilds_identical_level() {
        let config = LevelConfig::levenshtein("name", 2.0)
            .with_m_probability(0.3)
            .with_tf_adjustment("name");
        let level = ComparisonLevel::from_config(&config, &SqliteDialect).unwrap();
        let rebuilt = ComparisonLevel::from_config(&level.to_config(), &SqliteDialect).unwrap();
        assert_eq!(level, rebuilt);
    }
}
