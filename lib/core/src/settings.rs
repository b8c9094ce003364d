//! Model settings
//!
//! [`SettingsConfig`] is the serde document users write (and the trained-state
//! file stores). [`Settings`] is the validated model built from it: compiled
//! comparisons, blocking rules and the current λ.

use crate::comparison::{Comparison, ComparisonConfig};
use crate::dialect::{SqlDialect, SqlDialectKind};
use crate::error::{Error, Result};
use crate::level::{deserialize_probability, is_valid_probability};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Column added to every input row naming the table it came from
pub const SOURCE_DATASET_COLUMN: &str = "source_dataset";

pub const DEFAULT_UNIQUE_ID_COLUMN: &str = "unique_id";
pub const DEFAULT_PROPORTION_OF_MATCHES: f64 = 0.3;
pub const DEFAULT_EM_CONVERGENCE: f64 = 1e-4;
pub const DEFAULT_MAX_ITERATIONS: u32 = 25;

/// Which record pairs are candidates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Pairs within a single table
    #[default]
    DedupeOnly,
    /// Pairs across tables only
    LinkOnly,
    /// Pairs within and across tables
    LinkAndDedupe,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::DedupeOnly => "dedupe_only",
            LinkType::LinkOnly => "link_only",
            LinkType::LinkAndDedupe => "link_and_dedupe",
        }
    }

    /// Condition over aliases `l` and `r` that keeps each unordered pair once
    pub fn pair_filter(&self, unique_id_column: &str) -> String {
        let ds = SOURCE_DATASET_COLUMN;
        let id = unique_id_column;
        match self {
            LinkType::DedupeOnly => format!("l.{id} < r.{id}"),
            LinkType::LinkOnly => format!("l.{ds} < r.{ds}"),
            LinkType::LinkAndDedupe => format!(
                "(l.{ds} < r.{ds}) OR (l.{ds} = r.{ds} AND l.{id} < r.{id})"
            ),
        }
    }

    /// Number of candidate pairs given the row count of each input table
    pub fn pair_population(&self, table_row_counts: &[u64]) -> u128 {
        let total: u128 = table_row_counts.iter().map(|&n| n as u128).sum();
        match self {
            LinkType::DedupeOnly | LinkType::LinkAndDedupe => {
                total * total.saturating_sub(1) / 2
            }
            LinkType::LinkOnly => {
                let mut population = 0u128;
                for (i, &a) in table_row_counts.iter().enumerate() {
                    for &b in &table_row_counts[i + 1..] {
                        population += a as u128 * b as u128;
                    }
                }
                population
            }
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
enum BlockingRuleDocument {
    Sql(String),
    Detailed {
        blocking_rule: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_selectivity: Option<f64>,
    },
}

/// SQL predicate over `l.` / `r.` restricting candidate pairs.
/// Serialised as a bare string unless it carries metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "BlockingRuleDocument", into = "BlockingRuleDocument")]
pub struct BlockingRule {
    pub sql: String,
    pub estimated_selectivity: Option<f64>,
}

impl From<BlockingRuleDocument> for BlockingRule {
    fn from(doc: BlockingRuleDocument) -> Self {
        match doc {
            BlockingRuleDocument::Sql(sql) => BlockingRule {
                sql,
                estimated_selectivity: None,
            },
            BlockingRuleDocument::Detailed {
                blocking_rule,
                estimated_selectivity,
            } => BlockingRule {
                sql: blocking_rule,
                estimated_selectivity,
            },
        }
    }
}

impl From<BlockingRule> for BlockingRuleDocument {
    fn from(rule: BlockingRule) -> Self {
        match rule.estimated_selectivity {
            None => BlockingRuleDocument::Sql(rule.sql),
            Some(s) => BlockingRuleDocument::Detailed {
                blocking_rule: rule.sql,
                estimated_selectivity: Some(s),
            },
        }
    }
}

impl BlockingRule {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            estimated_selectivity: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sql.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "blocking rule must not be empty".to_string(),
            ));
        }
        if let Some(s) = self.estimated_selectivity {
            if !(s.is_finite() && s > 0.0 && s <= 1.0) {
                return Err(Error::InvalidConfiguration(format!(
                    "estimated_selectivity must be within (0, 1], got {}",
                    s
                )));
            }
        }
        Ok(())
    }
}

/// Settings document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SettingsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<LinkType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_dialect: Option<SqlDialectKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id_column_name: Option<String>,

    #[serde(default)]
    pub comparisons: Vec<ComparisonConfig>,

    #[serde(default)]
    pub blocking_rules_to_generate_predictions: Vec<BlockingRule>,

    /// λ, the prior probability that a candidate pair is a match
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_probability"
    )]
    pub proportion_of_matches: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub em_convergence: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl SettingsConfig {
    pub fn new(link_type: LinkType, comparisons: Vec<ComparisonConfig>) -> Self {
        Self {
            link_type: Some(link_type),
            comparisons,
            ..Default::default()
        }
    }

    pub fn with_dialect(mut self, dialect: SqlDialectKind) -> Self {
        self.sql_dialect = Some(dialect);
        self
    }

    pub fn with_unique_id_column(mut self, column: impl Into<String>) -> Self {
        self.unique_id_column_name = Some(column.into());
        self
    }

    pub fn with_blocking_rule(mut self, rule: impl Into<String>) -> Self {
        self.blocking_rules_to_generate_predictions
            .push(BlockingRule::new(rule));
        self
    }

    pub fn with_proportion_of_matches(mut self, lambda: f64) -> Self {
        self.proportion_of_matches = Some(lambda);
        self
    }

    pub fn with_em_convergence(mut self, epsilon: f64) -> Self {
        self.em_convergence = Some(epsilon);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }
}

/// Validated model settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    link_type: LinkType,
    sql_dialect: SqlDialectKind,
    unique_id_column_name: String,
    comparisons: Vec<Comparison>,
    blocking_rules: Vec<BlockingRule>,
    proportion_of_matches: Option<f64>,
    em_convergence: f64,
    max_iterations: u32,
}

impl Settings {
    pub fn from_config(config: &SettingsConfig) -> Result<Self> {
        let sql_dialect = config.sql_dialect.unwrap_or_default();
        let dialect = sql_dialect.adapter();

        let unique_id_column_name = config
            .unique_id_column_name
            .clone()
            .unwrap_or_else(|| DEFAULT_UNIQUE_ID_COLUMN.to_string());
        if unique_id_column_name.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "unique_id_column_name must not be empty".to_string(),
            ));
        }

        if config.comparisons.is_empty() {
            return Err(Error::InvalidConfiguration(
                "settings need at least one comparison".to_string(),
            ));
        }
        let comparisons = config
            .comparisons
            .iter()
            .map(|c| Comparison::from_config(c, dialect))
            .collect::<Result<Vec<_>>>()?;

        let mut seen = AHashSet::new();
        for c in &comparisons {
            if !seen.insert(c.output_column_name()) {
                return Err(Error::InvalidConfiguration(format!(
                    "duplicate comparison output_column_name '{}'",
                    c.output_column_name()
                )));
            }
        }

        for rule in &config.blocking_rules_to_generate_predictions {
            rule.validate()?;
        }

        if let Some(lambda) = config.proportion_of_matches {
            if !is_valid_probability(lambda) {
                return Err(Error::InvalidConfiguration(format!(
                    "proportion_of_matches must be within [0, 1], got {}",
                    lambda
                )));
            }
        }

        let em_convergence = config.em_convergence.unwrap_or(DEFAULT_EM_CONVERGENCE);
        if !(em_convergence.is_finite() && em_convergence > 0.0) {
            return Err(Error::InvalidConfiguration(format!(
                "em_convergence must be a positive number, got {}",
                em_convergence
            )));
        }

        let max_iterations = config.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        if max_iterations == 0 {
            return Err(Error::InvalidConfiguration(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            link_type: config.link_type.unwrap_or_default(),
            sql_dialect,
            unique_id_column_name,
            comparisons,
            blocking_rules: config.blocking_rules_to_generate_predictions.clone(),
            proportion_of_matches: config.proportion_of_matches,
            em_convergence,
            max_iterations,
        })
    }

    /// Parse and validate a JSON settings document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SettingsConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        Self::from_config(&config)
    }

    pub fn to_config(&self) -> SettingsConfig {
        SettingsConfig {
            link_type: Some(self.link_type),
            sql_dialect: Some(self.sql_dialect),
            unique_id_column_name: Some(self.unique_id_column_name.clone()),
            comparisons: self.comparisons.iter().map(Comparison::to_config).collect(),
            blocking_rules_to_generate_predictions: self.blocking_rules.clone(),
            proportion_of_matches: self.proportion_of_matches,
            em_convergence: Some(self.em_convergence),
            max_iterations: Some(self.max_iterations),
        }
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn sql_dialect(&self) -> SqlDialectKind {
        self.sql_dialect
    }

    pub fn dialect(&self) -> &'static dyn SqlDialect {
        self.sql_dialect.adapter()
    }

    pub fn unique_id_column_name(&self) -> &str {
        &self.unique_id_column_name
    }

    pub fn comparisons(&self) -> &[Comparison] {
        &self.comparisons
    }

    pub fn comparison(&self, name: &str) -> Option<&Comparison> {
        self.comparisons
            .iter()
            .find(|c| c.output_column_name() == name)
    }

    pub fn comparison_mut(&mut self, name: &str) -> Option<&mut Comparison> {
        self.comparisons
            .iter_mut()
            .find(|c| c.output_column_name() == name)
    }

    pub fn blocking_rules(&self) -> &[BlockingRule] {
        &self.blocking_rules
    }

    pub fn proportion_of_matches(&self) -> Option<f64> {
        self.proportion_of_matches
    }

    pub fn set_proportion_of_matches(&mut self, lambda: f64) -> Result<()> {
        if !is_valid_probability(lambda) {
            return Err(Error::ModelState(format!(
                "proportion_of_matches {} is outside [0, 1]",
                lambda
            )));
        }
        self.proportion_of_matches = Some(lambda);
        Ok(())
    }

    pub fn em_convergence(&self) -> f64 {
        self.em_convergence
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Fill λ and every unset m/u probability with defaults
    pub fn complete_defaults(&mut self) {
        if self.proportion_of_matches.is_none() {
            debug!("proportion_of_matches unset, using {}", DEFAULT_PROPORTION_OF_MATCHES);
            self.proportion_of_matches = Some(DEFAULT_PROPORTION_OF_MATCHES);
        }
        self.comparisons
            .iter_mut()
            .for_each(Comparison::complete_defaults);
    }

    /// True when λ and every non-null level's probabilities are set
    pub fn is_complete(&self) -> bool {
        self.proportion_of_matches.is_some()
            && self.comparisons.iter().all(|c| {
                c.m_probabilities().iter().all(Option::is_some)
                    && c.u_probabilities().iter().all(Option::is_some)
            })
    }

    /// Fellegi-Sunter posterior for one pair, given its gamma value per comparison
    pub fn match_probability(&self, gammas: &[i32]) -> Result<f64> {
        if gammas.len() != self.comparisons.len() {
            return Err(Error::InvalidConfiguration(format!(
                "expected {} gamma values, got {}",
                self.comparisons.len(),
                gammas.len()
            )));
        }
        let lambda = self
            .proportion_of_matches
            .ok_or_else(|| Error::ModelState("proportion_of_matches is unset".to_string()))?;

        let mut m_product = 1.0;
        let mut u_product = 1.0;
        for (comparison, &gamma) in self.comparisons.iter().zip(gammas) {
            if gamma == -1 {
                continue;
            }
            let level = comparison.level_by_gamma(gamma).ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "comparison '{}' has no level with gamma {}",
                    comparison.output_column_name(),
                    gamma
                ))
            })?;
            match (level.m_probability(), level.u_probability()) {
                (Some(m), Some(u)) => {
                    m_product *= m;
                    u_product *= u;
                }
                _ => {
                    return Err(Error::ModelState(format!(
                        "probabilities for '{}' gamma {} are unset",
                        comparison.output_column_name(),
                        gamma
                    )))
                }
            }
        }

        let numerator = lambda * m_product;
        let denominator = numerator + (1.0 - lambda) * u_product;
        if denominator == 0.0 {
            return Err(Error::ModelState(
                "match probability is undefined: both likelihoods are zero".to_string(),
            ));
        }
        Ok(numerator / denominator)
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proportion_of_matches {
            Some(lambda) => writeln!(f, "λ (proportion of matches) = {}", lambda)?,
            None => writeln!(f, "λ (proportion of matches) = unset")?,
        }
        for comparison in &self.comparisons {
            write!(f, "{}", comparison)?;
        }
        Ok(())
    }
}
