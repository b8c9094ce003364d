//! Comparisons: ordered, first-match-wins sets of levels on one output column

use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::level::{ComparisonLevel, LevelConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of the column holding a comparison's gamma values
pub const GAMMA_PREFIX: &str = "gamma_";

/// Serialisable configuration of one comparison
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ComparisonConfig {
    pub output_column_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_description: Option<String>,

    pub comparison_levels: Vec<LevelConfig>,

    /// Never let training overwrite the m probabilities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_m_probabilities: Option<bool>,

    /// Never let training overwrite the u probabilities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_u_probabilities: Option<bool>,
}

impl ComparisonConfig {
    pub fn new(output_column_name: impl Into<String>, comparison_levels: Vec<LevelConfig>) -> Self {
        Self {
            output_column_name: output_column_name.into(),
            comparison_description: None,
            comparison_levels,
            fix_m_probabilities: None,
            fix_u_probabilities: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.comparison_description = Some(description.into());
        self
    }

    pub fn with_fixed_m(mut self) -> Self {
        self.fix_m_probabilities = Some(true);
        self
    }

    pub fn with_fixed_u(mut self) -> Self {
        self.fix_u_probabilities = Some(true);
        self
    }
}

/// Default m probabilities for `k` non-null levels, indexed by gamma
pub fn default_m_values(k: usize) -> Vec<f64> {
    match k {
        1 => vec![1.0],
        2 => vec![0.1, 0.9],
        3 => vec![0.1, 0.2, 0.7],
        4 => vec![0.1, 0.1, 0.1, 0.7],
        5 => vec![0.1, 0.1, 0.1, 0.2, 0.5],
        6 => vec![0.1, 0.1, 0.1, 0.1, 0.2, 0.4],
        _ => geometric(k, true),
    }
}

/// Default u probabilities for `k` non-null levels, indexed by gamma
pub fn default_u_values(k: usize) -> Vec<f64> {
    match k {
        1 => vec![1.0],
        2 => vec![0.9, 0.1],
        3 => vec![0.7, 0.2, 0.1],
        4 => vec![0.7, 0.1, 0.1, 0.1],
        5 => vec![0.5, 0.2, 0.1, 0.1, 0.1],
        6 => vec![0.4, 0.2, 0.1, 0.1, 0.1, 0.1],
        _ => geometric(k, false),
    }
}

// Weights doubling towards the most specific level (m) or towards the else level (u)
fn geometric(k: usize, increasing: bool) -> Vec<f64> {
    let weights: Vec<f64> = (0..k)
        .map(|g| {
            let exponent = if increasing { g } else { k - 1 - g };
            2f64.powi(exponent as i32)
        })
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// A validated comparison with gamma values assigned to its levels
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    output_column_name: String,
    description: Option<String>,
    levels: Vec<ComparisonLevel>,
    fix_m_probabilities: Option<bool>,
    fix_u_probabilities: Option<bool>,
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

impl Comparison {
    pub fn from_config(config: &ComparisonConfig, dialect: &dyn SqlDialect) -> Result<Self> {
        let name = &config.output_column_name;
        if !is_identifier(name) {
            return Err(Error::InvalidConfiguration(format!(
                "output_column_name '{}' must be a non-empty SQL identifier",
                name
            )));
        }

        let mut levels = config
            .comparison_levels
            .iter()
            .map(|level| ComparisonLevel::from_config(level, dialect))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| match e {
                Error::InvalidConfiguration(msg) => {
                    Error::InvalidConfiguration(format!("comparison '{}': {}", name, msg))
                }
                other => other,
            })?;

        let else_positions: Vec<usize> = levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_else_level())
            .map(|(i, _)| i)
            .collect();
        if else_positions.len() != 1 || else_positions[0] + 1 != levels.len() {
            return Err(Error::InvalidConfiguration(format!(
                "comparison '{}' must have exactly one else level, declared last",
                name
            )));
        }

        let k = levels.iter().filter(|l| !l.is_null_level()).count();
        if k < 2 {
            return Err(Error::InvalidConfiguration(format!(
                "comparison '{}' needs at least one level besides the else level",
                name
            )));
        }

        let mut next = k as i32;
        for level in levels.iter_mut() {
            if level.is_null_level() {
                level.assign_gamma(-1);
            } else {
                next -= 1;
                level.assign_gamma(next);
            }
        }

        Ok(Self {
            output_column_name: name.clone(),
            description: config.comparison_description.clone(),
            levels,
            fix_m_probabilities: config.fix_m_probabilities,
            fix_u_probabilities: config.fix_u_probabilities,
        })
    }

    pub fn output_column_name(&self) -> &str {
        &self.output_column_name
    }

    pub fn gamma_column_name(&self) -> String {
        format!("{}{}", GAMMA_PREFIX, self.output_column_name)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn levels(&self) -> &[ComparisonLevel] {
        &self.levels
    }

    /// Levels in gamma order (index == gamma value), null levels excluded
    pub fn non_null_levels(&self) -> Vec<&ComparisonLevel> {
        let mut levels: Vec<&ComparisonLevel> =
            self.levels.iter().filter(|l| !l.is_null_level()).collect();
        levels.sort_by_key(|l| l.gamma_value());
        levels
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Number of levels holding probabilities, the length of the m and u vectors
    pub fn num_non_null_levels(&self) -> usize {
        self.levels.iter().filter(|l| !l.is_null_level()).count()
    }

    pub fn level_by_gamma(&self, gamma: i32) -> Option<&ComparisonLevel> {
        self.levels.iter().find(|l| l.gamma_value() == gamma)
    }

    fn level_by_gamma_mut(&mut self, gamma: i32) -> Option<&mut ComparisonLevel> {
        self.levels
            .iter_mut()
            .find(|l| l.gamma_value() == gamma && !l.is_null_level())
    }

    pub fn m_probabilities(&self) -> Vec<Option<f64>> {
        self.non_null_levels()
            .iter()
            .map(|l| l.m_probability())
            .collect()
    }

    pub fn u_probabilities(&self) -> Vec<Option<f64>> {
        self.non_null_levels()
            .iter()
            .map(|l| l.u_probability())
            .collect()
    }

    pub fn is_m_fixed(&self) -> bool {
        self.fix_m_probabilities.unwrap_or(false)
    }

    pub fn is_u_fixed(&self) -> bool {
        self.fix_u_probabilities.unwrap_or(false)
    }

    /// Overwrite the m vector (indexed by gamma). `None` entries keep the prior value.
    pub fn set_m_probabilities(&mut self, values: &[Option<f64>]) -> Result<()> {
        self.check_vector_len("m", values.len())?;
        for (gamma, value) in values.iter().enumerate() {
            if let (Some(v), Some(level)) = (value, self.level_by_gamma_mut(gamma as i32)) {
                level.set_m_probability(*v)?;
            }
        }
        Ok(())
    }

    /// Overwrite the u vector (indexed by gamma). `None` entries keep the prior value.
    pub fn set_u_probabilities(&mut self, values: &[Option<f64>]) -> Result<()> {
        self.check_vector_len("u", values.len())?;
        for (gamma, value) in values.iter().enumerate() {
            if let (Some(v), Some(level)) = (value, self.level_by_gamma_mut(gamma as i32)) {
                level.set_u_probability(*v)?;
            }
        }
        Ok(())
    }

    fn check_vector_len(&self, which: &str, len: usize) -> Result<()> {
        let k = self.num_non_null_levels();
        if len != k {
            return Err(Error::ModelState(format!(
                "comparison '{}' has {} non-null levels but {} {} probabilities were given",
                self.output_column_name, k, len, which
            )));
        }
        Ok(())
    }

    /// Fill unset probabilities from the default tables
    pub fn complete_defaults(&mut self) {
        let k = self.num_non_null_levels();
        let m_defaults = default_m_values(k);
        let u_defaults = default_u_values(k);
        for level in self.levels.iter_mut().filter(|l| !l.is_null_level()) {
            let gamma = level.gamma_value() as usize;
            // defaults are valid probabilities, so these cannot fail
            if level.m_probability().is_none() {
                let _ = level.set_m_probability(m_defaults[gamma]);
            }
            if level.u_probability().is_none() {
                let _ = level.set_u_probability(u_defaults[gamma]);
            }
        }
    }

    /// Clear every probability
    pub fn reset(&mut self) {
        self.levels.iter_mut().for_each(ComparisonLevel::reset);
    }

    /// `CASE WHEN ... END AS gamma_<name>`, conditions in declaration order
    pub fn gamma_sql_case_statement(&self) -> String {
        let mut sql = String::from("CASE");
        for level in &self.levels {
            if level.is_else_level() {
                sql.push_str(&format!(" ELSE {}", level.gamma_value()));
            } else {
                sql.push_str(&format!(
                    " WHEN {} THEN {}",
                    level.sql_condition(),
                    level.gamma_value()
                ));
            }
        }
        sql.push_str(&format!(" END AS {}", self.gamma_column_name()));
        sql
    }

    /// Evaluate first-match-wins in process. `matches` answers whether a
    /// level's condition holds for the pair; the else level always matches.
    pub fn gamma_for<F>(&self, mut matches: F) -> i32
    where
        F: FnMut(&ComparisonLevel) -> bool,
    {
        for level in &self.levels {
            if level.is_else_level() || matches(level) {
                return level.gamma_value();
            }
        }
        0
    }

    /// Columns the comparison reads on each side of a pair
    pub fn input_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = Vec::new();
        for level in &self.levels {
            if let Some(p) = level.predicate() {
                for c in p.input_columns() {
                    if !columns.contains(&c) {
                        columns.push(c);
                    }
                }
            }
        }
        columns
    }

    pub fn to_config(&self) -> ComparisonConfig {
        ComparisonConfig {
            output_column_name: self.output_column_name.clone(),
            comparison_description: self.description.clone(),
            comparison_levels: self.levels.iter().map(ComparisonLevel::to_config).collect(),
            fix_m_probabilities: self.fix_m_probabilities,
            fix_u_probabilities: self.fix_u_probabilities,
        }
    }
}

fn percent(p: Option<f64>) -> String {
    match p {
        Some(v) => format!("{:.2}%", v * 100.0),
        None => "unset".to_string(),
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------------------------------------")?;
        writeln!(f, "Comparison of {}", self.output_column_name)?;
        if let Some(d) = &self.description {
            writeln!(f, "{}", d)?;
        }
        writeln!(f)?;
        for level in self.levels.iter().filter(|l| !l.is_null_level()) {
            writeln!(
                f,
                "gamma {}: {}",
                level.gamma_value(),
                level.label_for_charts()
            )?;
            writeln!(f, "   Prob amongst matches:     {}", percent(level.m_probability()))?;
            writeln!(f, "   Prob amongst non-matches: {}", percent(level.u_probability()))?;
            match level.bayes_factor() {
                Some(bf) => writeln!(f, "   Bayes factor:             {:.3}", bf)?,
                None => writeln!(f, "   Bayes factor:             unknown")?,
            }
        }
        Ok(())
    }
}
