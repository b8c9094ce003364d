//! Parameter snapshots and the maximisation merge
//!
//! Training never mutates a snapshot. Each maximisation step produces a
//! [`ParamUpdates`] set which [`merge`] folds into the previous snapshot:
//! cells missing from the update keep their prior value.

use crate::error::{Error, Result};
use crate::level::is_valid_probability;
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::fmt;

/// m and u vectors of one comparison, indexed by gamma value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonParams {
    pub output_column_name: String,
    pub m_probabilities: Vec<Option<f64>>,
    pub u_probabilities: Vec<Option<f64>>,
}

/// Immutable record of the model parameters after one iteration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamSnapshot {
    pub iteration: u32,
    pub proportion_of_matches: Option<f64>,
    pub comparisons: Vec<ComparisonParams>,
}

impl ParamSnapshot {
    pub fn capture(settings: &Settings, iteration: u32) -> Self {
        Self {
            iteration,
            proportion_of_matches: settings.proportion_of_matches(),
            comparisons: settings
                .comparisons()
                .iter()
                .map(|c| ComparisonParams {
                    output_column_name: c.output_column_name().to_string(),
                    m_probabilities: c.m_probabilities(),
                    u_probabilities: c.u_probabilities(),
                })
                .collect(),
        }
    }

    pub fn comparison(&self, name: &str) -> Option<&ComparisonParams> {
        self.comparisons
            .iter()
            .find(|c| c.output_column_name == name)
    }

    /// Write the snapshot's values into `settings`. The shape and every value
    /// are checked before anything is written.
    pub fn apply_to(&self, settings: &mut Settings) -> Result<()> {
        if let Some(lambda) = self.proportion_of_matches {
            check_probability("proportion_of_matches", lambda)?;
        }
        for params in &self.comparisons {
            let comparison = settings
                .comparison(&params.output_column_name)
                .ok_or_else(|| {
                    Error::ModelState(format!(
                        "snapshot names unknown comparison '{}'",
                        params.output_column_name
                    ))
                })?;
            let k = comparison.num_non_null_levels();
            if params.m_probabilities.len() != k || params.u_probabilities.len() != k {
                return Err(Error::ModelState(format!(
                    "snapshot for '{}' does not have {} levels",
                    params.output_column_name, k
                )));
            }
            for value in params
                .m_probabilities
                .iter()
                .chain(&params.u_probabilities)
                .flatten()
            {
                check_probability(&params.output_column_name, *value)?;
            }
        }

        if let Some(lambda) = self.proportion_of_matches {
            settings.set_proportion_of_matches(lambda)?;
        }
        for params in &self.comparisons {
            if let Some(comparison) = settings.comparison_mut(&params.output_column_name) {
                comparison.set_m_probabilities(&params.m_probabilities)?;
                comparison.set_u_probabilities(&params.u_probabilities)?;
            }
        }
        Ok(())
    }
}

fn check_probability(what: &str, value: f64) -> Result<()> {
    if is_valid_probability(value) {
        Ok(())
    } else {
        Err(Error::ModelState(format!(
            "{} received probability {}, outside [0, 1]",
            what, value
        )))
    }
}

/// New values for one (comparison, gamma) cell. `None` keeps the prior value.
#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    pub comparison: String,
    pub gamma_value: i32,
    pub m_probability: Option<f64>,
    pub u_probability: Option<f64>,
}

/// Output of a maximisation step or u estimation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamUpdates {
    pub proportion_of_matches: Option<f64>,
    pub cells: Vec<CellUpdate>,
}

impl ParamUpdates {
    /// Drop values for vectors the settings mark as fixed
    pub fn respecting_fixed(mut self, settings: &Settings) -> Self {
        for cell in &mut self.cells {
            if let Some(c) = settings.comparison(&cell.comparison) {
                if c.is_m_fixed() {
                    cell.m_probability = None;
                }
                if c.is_u_fixed() {
                    cell.u_probability = None;
                }
            }
        }
        self
    }
}

/// Fold `updates` into `old`, producing the next snapshot.
///
/// Fails with [`Error::ModelState`] if any new value is outside [0, 1] or
/// non-finite, or names a cell the model does not have. Nothing is returned
/// in that case, so callers holding `old` are unaffected.
pub fn merge(old: &ParamSnapshot, updates: &ParamUpdates) -> Result<ParamSnapshot> {
    let mut next = old.clone();
    next.iteration = old.iteration + 1;

    if let Some(lambda) = updates.proportion_of_matches {
        check_probability("proportion_of_matches", lambda)?;
        next.proportion_of_matches = Some(lambda);
    }

    for cell in &updates.cells {
        // null levels carry no parameters
        if cell.gamma_value == -1 {
            continue;
        }
        let params = next
            .comparisons
            .iter_mut()
            .find(|c| c.output_column_name == cell.comparison)
            .ok_or_else(|| {
                Error::ModelState(format!("update names unknown comparison '{}'", cell.comparison))
            })?;
        let k = params.m_probabilities.len();
        if cell.gamma_value < 0 || cell.gamma_value as usize >= k {
            return Err(Error::ModelState(format!(
                "update for '{}' has gamma {} but the comparison has {} levels",
                cell.comparison, cell.gamma_value, k
            )));
        }
        let g = cell.gamma_value as usize;
        if let Some(m) = cell.m_probability {
            check_probability(&format!("m of '{}' gamma {}", cell.comparison, g), m)?;
            params.m_probabilities[g] = Some(m);
        }
        if let Some(u) = cell.u_probability {
            check_probability(&format!("u of '{}' gamma {}", cell.comparison, g), u)?;
            params.u_probabilities[g] = Some(u);
        }
    }
    Ok(next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbabilityKind {
    M,
    U,
}

/// Identifies a single trained parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ChangedParameter {
    Lambda,
    Level {
        comparison: String,
        gamma_value: i32,
        probability: ProbabilityKind,
    },
}

impl fmt::Display for ChangedParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangedParameter::Lambda => f.write_str("proportion_of_matches"),
            ChangedParameter::Level {
                comparison,
                gamma_value,
                probability,
            } => {
                let which = match probability {
                    ProbabilityKind::M => "m",
                    ProbabilityKind::U => "u",
                };
                write!(f, "{} of {}, level {}", which, comparison, gamma_value)
            }
        }
    }
}

/// Largest absolute change between two consecutive snapshots
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceReport {
    pub max_change: f64,
    pub parameter: Option<ChangedParameter>,
}

impl ConvergenceReport {
    pub fn is_converged(&self, epsilon: f64) -> bool {
        self.max_change < epsilon
    }
}

fn change(a: Option<f64>, b: Option<f64>) -> f64 {
    match (a, b) {
        (Some(x), Some(y)) => (x - y).abs(),
        (None, None) => 0.0,
        _ => f64::INFINITY,
    }
}

/// Compare λ and every (comparison, gamma, m|u) cell
pub fn max_change(previous: &ParamSnapshot, latest: &ParamSnapshot) -> ConvergenceReport {
    let mut report = ConvergenceReport {
        max_change: change(previous.proportion_of_matches, latest.proportion_of_matches),
        parameter: Some(ChangedParameter::Lambda),
    };

    for new in &latest.comparisons {
        let Some(old) = previous.comparison(&new.output_column_name) else {
            report.max_change = f64::INFINITY;
            report.parameter = None;
            continue;
        };
        let cells = [
            (ProbabilityKind::M, &old.m_probabilities, &new.m_probabilities),
            (ProbabilityKind::U, &old.u_probabilities, &new.u_probabilities),
        ];
        for (kind, old_values, new_values) in cells {
            for (g, (a, b)) in old_values.iter().zip(new_values).enumerate() {
                let diff = change(*a, *b);
                if diff > report.max_change {
                    report.max_change = diff;
                    report.parameter = Some(ChangedParameter::Level {
                        comparison: new.output_column_name.clone(),
                        gamma_value: g as i32,
                        probability: kind,
                    });
                }
            }
        }
    }
    report
}

/// λ at one point in the training history
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LambdaRow {
    #[serde(rename = "λ")]
    pub lambda: Option<f64>,
    pub iteration: u32,
}

/// One level's parameters at one point in the training history
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LevelRow {
    pub column: String,
    pub gamma_value: i32,
    pub label_for_charts: String,
    pub m_probability: Option<f64>,
    pub u_probability: Option<f64>,
    pub bayes_factor: Option<f64>,
    pub iteration: u32,
    #[serde(rename = "final")]
    pub is_final: bool,
}

pub fn lambda_history_as_rows(history: &[ParamSnapshot]) -> Vec<LambdaRow> {
    history
        .iter()
        .map(|s| LambdaRow {
            lambda: s.proportion_of_matches,
            iteration: s.iteration,
        })
        .collect()
}

/// Flatten the history to one row per (snapshot, comparison, level).
/// Labels are taken from `settings`.
pub fn m_u_history_as_rows(history: &[ParamSnapshot], settings: &Settings) -> Vec<LevelRow> {
    let last = history.last().map(|s| s.iteration);
    let mut rows = Vec::new();
    for snapshot in history {
        for params in &snapshot.comparisons {
            let comparison = settings.comparison(&params.output_column_name);
            for (g, (m, u)) in params
                .m_probabilities
                .iter()
                .zip(&params.u_probabilities)
                .enumerate()
            {
                let label = comparison
                    .and_then(|c| c.level_by_gamma(g as i32))
                    .map(|l| l.label_for_charts().to_string())
                    .unwrap_or_else(|| format!("level {}", g));
                let bayes_factor = match (m, u) {
                    (Some(m), Some(u)) if *u > 0.0 => Some(m / u),
                    (Some(_), Some(_)) => Some(f64::INFINITY),
                    _ => None,
                };
                rows.push(LevelRow {
                    column: params.output_column_name.clone(),
                    gamma_value: g as i32,
                    label_for_charts: label,
                    m_probability: *m,
                    u_probability: *u,
                    bayes_factor,
                    iteration: snapshot.iteration,
                    is_final: Some(snapshot.iteration) == last,
                });
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparison::ComparisonConfig;
    use crate::level::LevelConfig;
    use crate::settings::{LinkType, SettingsConfig};

    fn settings() -> Settings {
        let config = SettingsConfig::new(
            LinkType::DedupeOnly,
            vec![ComparisonConfig::new(
                "name",
                vec![
                    LevelConfig::null_level("name"),
                    LevelConfig::exact_match("name"),
                    LevelConfig::levenshtein("name", 2.0),
                    LevelConfig::else_level(),
                ],
            )],
        );
        let mut s = Settings::from_config(&config).unwrap();
        s.complete_defaults();
        s
    }

    fn cell(gamma: i32, m: Option<f64>, u: Option<f64>) -> CellUpdate {
        CellUpdate {
            comparison: "name".into(),
            gamma_value: gamma,
            m_probability: m,
            u_probability: u,
        }
    }

    #[test]
    fn test_merge_keeps_prior_when_absent() {
        let old = ParamSnapshot::capture(&settings(), 0);
        let updates = ParamUpdates {
            proportion_of_matches: None,
            cells: vec![cell(2, Some(0.8), None), cell(-1, Some(0.5), Some(0.5))],
        };
        let next = merge(&old, &updates).unwrap();
        assert_eq!(next.iteration, 1);
        assert_eq!(next.proportion_of_matches, Some(0.3));
        let params = next.comparison("name").unwrap();
        assert_eq!(params.m_probabilities, vec![Some(0.1), Some(0.2), Some(0.8)]);
        assert_eq!(params.u_probabilities, vec![Some(0.7), Some(0.2), Some(0.1)]);
    }

    #[test]
    fn test_merge_rejects_out_of_range_values() {
        let old = ParamSnapshot::capture(&settings(), 0);
        let updates = ParamUpdates {
            proportion_of_matches: Some(0.4),
            cells: vec![cell(1, None, Some(1.5))],
        };
        assert!(matches!(merge(&old, &updates), Err(Error::ModelState(_))));

        let nan = ParamUpdates {
            proportion_of_matches: Some(f64::NAN),
            cells: vec![],
        };
        assert!(matches!(merge(&old, &nan), Err(Error::ModelState(_))));
    }

    #[test]
    fn test_merge_rejects_unknown_cells() {
        let old = ParamSnapshot::capture(&settings(), 0);
        let wrong_gamma = ParamUpdates {
            proportion_of_matches: None,
            cells: vec![cell(3, Some(0.1), None)],
        };
        assert!(merge(&old, &wrong_gamma).is_err());

        let mut wrong_name = cell(1, Some(0.1), None);
        wrong_name.comparison = "dob".into();
        let updates = ParamUpdates {
            proportion_of_matches: None,
            cells: vec![wrong_name],
        };
        assert!(merge(&old, &updates).is_err());
    }

    #[test]
    fn test_respecting_fixed_drops_values() {
        let config = SettingsConfig::new(
            LinkType::DedupeOnly,
            vec![ComparisonConfig::new(
                "name",
                vec![LevelConfig::exact_match("name"), LevelConfig::else_level()],
            )
            .with_fixed_u()],
        );
        let s = Settings::from_config(&config).unwrap();
        let updates = ParamUpdates {
            proportion_of_matches: None,
            cells: vec![cell(1, Some(0.9), Some(0.2))],
        }
        .respecting_fixed(&s);
        assert_eq!(updates.cells[0].m_probability, Some(0.9));
        assert_eq!(updates.cells[0].u_probability, None);
    }

    #[test]
    fn test_max_change_names_the_parameter() {
        let old = ParamSnapshot::capture(&settings(), 0);
        let updates = ParamUpdates {
            proportion_of_matches: Some(0.31),
            cells: vec![cell(0, None, Some(0.5))],
        };
        let next = merge(&old, &updates).unwrap();
        let report = max_change(&old, &next);
        assert!((report.max_change - 0.2).abs() < 1e-12);
        assert_eq!(
            report.parameter,
            Some(ChangedParameter::Level {
                comparison: "name".into(),
                gamma_value: 0,
                probability: ProbabilityKind::U,
            })
        );
        assert!(!report.is_converged(1e-4));
        assert!(max_change(&next, &next).is_converged(1e-4));
        assert_eq!(report.parameter.unwrap().to_string(), "u of name, level 0");
    }

    #[test]
    fn test_apply_to_validates_before_writing() {
        let mut s = settings();
        let mut snapshot = ParamSnapshot::capture(&s, 0);
        snapshot.proportion_of_matches = Some(0.9);
        snapshot.comparisons[0].u_probabilities[1] = Some(2.0);
        assert!(snapshot.apply_to(&mut s).is_err());
        assert_eq!(s.proportion_of_matches(), Some(0.3));

        snapshot.comparisons[0].u_probabilities[1] = Some(0.25);
        snapshot.apply_to(&mut s).unwrap();
        assert_eq!(s.proportion_of_matches(), Some(0.9));
        assert_eq!(s.comparisons()[0].u_probabilities()[1], Some(0.25));
    }

    #[test]
    fn test_history_rows() {
        let s = settings();
        let first = ParamSnapshot::capture(&s, 0);
        let second = merge(
            &first,
            &ParamUpdates {
                proportion_of_matches: Some(0.2),
                cells: vec![],
            },
        )
        .unwrap();
        let history = vec![first, second];

        let lambdas = lambda_history_as_rows(&history);
        assert_eq!(lambdas[1].lambda, Some(0.2));
        assert_eq!(
            serde_json::to_value(&lambdas[0]).unwrap(),
            serde_json::json!({"λ": 0.3, "iteration": 0})
        );

        let rows = m_u_history_as_rows(&history, &s);
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[2].label_for_charts, "Exact match");
        assert!(!rows[0].is_final);
        assert!(rows[5].is_final);
        assert!((rows[2].bayes_factor.unwrap() - 7.0).abs() < 1e-9);
    }
}
