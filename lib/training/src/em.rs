//! Expectation-maximisation training
//!
//! Each iteration is one blocking round trip: the expectation and
//! maximisation steps run as SQL over the cached comparison-vector table, and
//! the returned aggregates are folded into a new parameter snapshot.

use crate::pipeline;
use crate::sql;
use reclink_core::params::{self, LambdaRow, LevelRow};
use reclink_core::{
    merge, CellUpdate, ConvergenceReport, Error, ParamSnapshot, ParamUpdates, Result, Settings,
    SettingsConfig,
};
use reclink_storage::{get_f64, get_i64, get_string, QueryExecutor, Row, TableRef, TrainedState};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
    Initialized,
    Iterating,
    Converged,
    IterationCapReached,
    /// Stopped by an [`AbortHandle`]; the last completed snapshot is the result
    Aborted,
}

impl TrainerState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TrainerState::Converged | TrainerState::IterationCapReached | TrainerState::Aborted
        )
    }
}

/// Cloneable flag stopping training between iterations
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct EmTrainer<'a> {
    executor: &'a dyn QueryExecutor,
    settings: Settings,
    settings_original: SettingsConfig,
    history: Vec<ParamSnapshot>,
    state: TrainerState,
    max_iterations: u32,
    convergence_epsilon: f64,
    abort: AbortHandle,
    vectors: Option<TableRef>,
    last_report: Option<ConvergenceReport>,
}

impl<'a> EmTrainer<'a> {
    /// Start from `settings`; unset parameters are completed with defaults
    pub fn new(settings: Settings, executor: &'a dyn QueryExecutor) -> Self {
        let settings_original = settings.to_config();
        Self::start(settings, settings_original, executor)
    }

    /// Start from a settings document, kept verbatim as `settings_original`
    pub fn from_config(config: &SettingsConfig, executor: &'a dyn QueryExecutor) -> Result<Self> {
        let settings = Settings::from_config(config)?;
        Ok(Self::start(settings, config.clone(), executor))
    }

    fn start(
        mut settings: Settings,
        settings_original: SettingsConfig,
        executor: &'a dyn QueryExecutor,
    ) -> Self {
        settings.complete_defaults();
        let history = vec![ParamSnapshot::capture(&settings, 0)];
        Self {
            executor,
            max_iterations: settings.max_iterations(),
            convergence_epsilon: settings.em_convergence(),
            settings,
            settings_original,
            history,
            state: TrainerState::Initialized,
            abort: AbortHandle::new(),
            vectors: None,
            last_report: None,
        }
    }

    /// Resume from a trained-state document
    pub fn from_trained_state(state: TrainedState, executor: &'a dyn QueryExecutor) -> Result<Self> {
        let settings = Settings::from_config(&state.current_params)?;
        let mut trainer = Self::start(settings, state.settings_original, executor);
        if !state.historical_params.is_empty() {
            let last = state.historical_params.last().map(|s| s.iteration);
            if last != Some(state.iteration) {
                return Err(Error::CorruptedState(format!(
                    "iteration {} does not match the last snapshot ({:?})",
                    state.iteration, last
                )));
            }
            trainer.history = state.historical_params;
        }
        Ok(trainer)
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_convergence_epsilon(mut self, epsilon: f64) -> Self {
        self.convergence_epsilon = epsilon;
        self
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }

    pub fn history(&self) -> &[ParamSnapshot] {
        &self.history
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Iteration number of the latest snapshot
    pub fn iteration(&self) -> u32 {
        self.history.last().map_or(0, |s| s.iteration)
    }

    pub fn last_report(&self) -> Option<&ConvergenceReport> {
        self.last_report.as_ref()
    }

    pub fn lambda_history_as_rows(&self) -> Vec<LambdaRow> {
        params::lambda_history_as_rows(&self.history)
    }

    pub fn m_u_history_as_rows(&self) -> Vec<LevelRow> {
        params::m_u_history_as_rows(&self.history, &self.settings)
    }

    pub fn to_trained_state(&self) -> TrainedState {
        TrainedState {
            current_params: self.settings.to_config(),
            historical_params: self.history.clone(),
            settings_original: self.settings_original.clone(),
            iteration: self.iteration(),
        }
    }

    fn comparison_vectors(&mut self) -> Result<TableRef> {
        if let Some(vectors) = &self.vectors {
            return Ok(vectors.clone());
        }
        let concat = pipeline::concat_inputs(&self.settings, self.executor)?;
        let (_, vectors) = pipeline::comparison_vectors(
            &self.settings,
            self.executor,
            &concat.table,
            self.settings.blocking_rules(),
        )?;
        let pairs = pipeline::count_pairs(&self.settings, self.executor, &vectors)?;
        if pairs == 0 {
            return Err(Error::ModelState(
                "blocking produced no candidate pairs to train on".to_string(),
            ));
        }
        info!("Training on {} candidate pairs", pairs);
        self.vectors = Some(vectors.clone());
        Ok(vectors)
    }

    /// Run one expectation and maximisation round and append the new snapshot.
    ///
    /// On error the history and settings are left as they were.
    pub fn iterate_once(&mut self) -> Result<ConvergenceReport> {
        if self.state.is_finished() {
            return Err(Error::ModelState(format!(
                "training has already finished ({:?})",
                self.state
            )));
        }
        let vectors = self.comparison_vectors()?;
        self.state = TrainerState::Iterating;

        let rows = self
            .executor
            .execute(&sql::maximisation_sql(&self.settings, &vectors.name))?;
        let lambda_rows = self
            .executor
            .execute(&sql::lambda_sql(&self.settings, &vectors.name))?;

        let updates = ParamUpdates {
            proportion_of_matches: match lambda_rows.first() {
                Some(row) => get_f64(row, "new_lambda")?,
                None => None,
            },
            cells: rows.iter().map(cell_update).collect::<Result<Vec<_>>>()?,
        }
        .respecting_fixed(&self.settings);

        let previous = self
            .history
            .last()
            .ok_or_else(|| Error::ModelState("parameter history is empty".to_string()))?;
        let next = merge(previous, &updates)?;
        next.apply_to(&mut self.settings)?;

        let report = params::max_change(previous, &next);
        match &report.parameter {
            Some(p) => info!(
                "Iteration {}: largest change in params was {:.6} in {}",
                next.iteration, report.max_change, p
            ),
            None => info!(
                "Iteration {}: largest change in params was {:.6}",
                next.iteration, report.max_change
            ),
        }
        self.history.push(next);
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Iterate until convergence, the iteration cap or an abort
    pub fn train(&mut self) -> Result<TrainerState> {
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfiguration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.convergence_epsilon.is_finite() && self.convergence_epsilon > 0.0) {
            return Err(Error::InvalidConfiguration(format!(
                "convergence epsilon must be a positive number, got {}",
                self.convergence_epsilon
            )));
        }

        let mut iterations = 0;
        while iterations < self.max_iterations {
            if self.abort.is_aborted() {
                info!("Training aborted after {} iterations", iterations);
                self.state = TrainerState::Aborted;
                return Ok(self.state);
            }
            let report = self.iterate_once()?;
            iterations += 1;
            if report.is_converged(self.convergence_epsilon) {
                info!("EM algorithm has converged after {} iterations", iterations);
                self.state = TrainerState::Converged;
                return Ok(self.state);
            }
        }

        info!(
            "Maximum number of iterations ({}) reached without convergence",
            self.max_iterations
        );
        self.state = TrainerState::IterationCapReached;
        Ok(self.state)
    }
}

fn cell_update(row: &Row) -> Result<CellUpdate> {
    let comparison = get_string(row, "comparison_name")
        .ok_or_else(|| Error::Execution("maximisation row without comparison_name".to_string()))?;
    let gamma_value = get_i64(row, "gamma_value")?
        .ok_or_else(|| Error::Execution("maximisation row without gamma_value".to_string()))?;
    let gamma_value = i32::try_from(gamma_value).map_err(|_| {
        Error::Execution(format!(
            "gamma_value {} for {} is out of range",
            gamma_value, comparison
        ))
    })?;
    debug!("Maximisation row {:?}", row);
    Ok(CellUpdate {
        comparison,
        gamma_value,
        m_probability: get_f64(row, "new_probability_match")?,
        u_probability: get_f64(row, "new_probability_non_match")?,
    })
}

/// Result of [`train`]
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub settings: Settings,
    pub history: Vec<ParamSnapshot>,
    pub state: TrainerState,
    pub iterations: u32,
}

/// Train a copy of `settings` by EM. Reaching `max_iterations` is reported
/// through [`TrainingOutcome::state`], not as an error.
pub fn train(
    settings: &Settings,
    executor: &dyn QueryExecutor,
    max_iterations: u32,
    convergence_epsilon: f64,
) -> Result<TrainingOutcome> {
    let mut trainer = EmTrainer::new(settings.clone(), executor)
        .with_max_iterations(max_iterations)
        .with_convergence_epsilon(convergence_epsilon);
    let state = trainer.train()?;
    let iterations = trainer.iteration();
    Ok(TrainingOutcome {
        history: trainer.history.clone(),
        settings: trainer.into_settings(),
        state,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use reclink_core::{library, LinkType};
    use serde_json::{json, Value};

    /// Answers pipeline queries from a script
    struct ScriptedExecutor {
        maximisation: Vec<Value>,
        lambda: Value,
        pairs: i64,
        executed: Mutex<Vec<String>>,
        materialized: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(maximisation: Vec<Value>, lambda: Value) -> Self {
            Self {
                maximisation,
                lambda,
                pairs: 15,
                executed: Mutex::new(Vec::new()),
                materialized: Mutex::new(Vec::new()),
            }
        }
    }

    fn to_row(value: &Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    impl QueryExecutor for ScriptedExecutor {
        fn input_tables(&self) -> Vec<TableRef> {
            vec![TableRef::new("people", "fp")]
        }

        fn table_columns(&self, _table: &str) -> Result<Vec<String>> {
            Ok(vec!["unique_id".into(), "name".into()])
        }

        fn execute(&self, sql: &str) -> Result<Vec<Row>> {
            self.executed.lock().push(sql.to_string());
            if sql.contains("new_probability_match") {
                Ok(self.maximisation.iter().map(to_row).collect())
            } else if sql.contains("new_lambda") {
                Ok(vec![to_row(&json!({ "new_lambda": self.lambda }))])
            } else if sql.contains("pair_count") {
                Ok(vec![to_row(&json!({ "pair_count": self.pairs }))])
            } else {
                Ok(Vec::new())
            }
        }

        fn materialize(
            &self,
            _sql: &str,
            template_name: &str,
            _upstream: &[TableRef],
        ) -> Result<TableRef> {
            self.materialized.lock().push(template_name.to_string());
            Ok(TableRef::new(format!("{}_0", template_name), template_name))
        }
    }

    fn settings() -> Settings {
        Settings::from_config(
            &SettingsConfig::new(
                LinkType::DedupeOnly,
                vec![library::levenshtein_at_thresholds("name", &[2.0])],
            )
            .with_proportion_of_matches(0.4),
        )
        .unwrap()
    }

    fn row(gamma: i64, m: f64, u: f64) -> Value {
        json!({
            "comparison_name": "name",
            "gamma_value": gamma,
            "new_probability_match": m,
            "new_probability_non_match": u,
        })
    }

    #[test]
    fn test_initial_snapshot_is_completed_settings() {
        let executor = ScriptedExecutor::new(vec![], json!(0.4));
        let trainer = EmTrainer::new(settings(), &executor);
        assert_eq!(trainer.state(), TrainerState::Initialized);
        assert_eq!(trainer.history().len(), 1);
        assert_eq!(trainer.history()[0].proportion_of_matches, Some(0.4));
        assert_eq!(
            trainer.history()[0].comparisons[0].m_probabilities,
            vec![Some(0.1), Some(0.2), Some(0.7)]
        );
    }

    #[test]
    fn test_iteration_applies_maximisation_output() {
        let executor = ScriptedExecutor::new(
            vec![row(2, 0.8, 0.05), row(0, 0.1, 0.9)],
            json!(0.25),
        );
        let mut trainer = EmTrainer::new(settings(), &executor);
        let report = trainer.iterate_once().unwrap();

        assert_eq!(trainer.history().len(), 2);
        assert_eq!(trainer.state(), TrainerState::Iterating);
        let comparison = &trainer.settings().comparisons()[0];
        // gamma 1 was absent from the response and keeps its prior value
        assert_eq!(comparison.m_probabilities(), vec![Some(0.1), Some(0.2), Some(0.8)]);
        assert_eq!(comparison.u_probabilities(), vec![Some(0.9), Some(0.2), Some(0.05)]);
        assert_eq!(trainer.settings().proportion_of_matches(), Some(0.25));
        assert!((report.max_change - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_probability_leaves_history_untouched() {
        let executor = ScriptedExecutor::new(vec![row(1, 0.3, 1.5)], json!(0.25));
        let mut trainer = EmTrainer::new(settings(), &executor);
        let before = trainer.settings().clone();

        assert!(matches!(trainer.iterate_once(), Err(Error::ModelState(_))));
        assert_eq!(trainer.history().len(), 1);
        assert_eq!(trainer.settings(), &before);
    }

    #[test]
    fn test_oversized_gamma_value_is_an_execution_error() {
        let huge = to_row(&row(i64::from(i32::MAX) + 1, 0.5, 0.5));
        assert!(matches!(cell_update(&huge), Err(Error::Execution(_))));
        let negative = to_row(&row(i64::from(i32::MIN) - 1, 0.5, 0.5));
        assert!(matches!(cell_update(&negative), Err(Error::Execution(_))));

        let executor = ScriptedExecutor::new(vec![row(1i64 << 32, 0.5, 0.5)], json!(0.25));
        let mut trainer = EmTrainer::new(settings(), &executor);
        assert!(matches!(trainer.iterate_once(), Err(Error::Execution(_))));
        assert_eq!(trainer.history().len(), 1);
    }

    #[test]
    fn test_null_values_keep_prior() {
        let executor = ScriptedExecutor::new(
            vec![json!({"comparison_name": "name", "gamma_value": 2,
                        "new_probability_match": null, "new_probability_non_match": 0.01})],
            Value::Null,
        );
        let mut trainer = EmTrainer::new(settings(), &executor);
        trainer.iterate_once().unwrap();
        let comparison = &trainer.settings().comparisons()[0];
        assert_eq!(comparison.m_probabilities()[2], Some(0.7));
        assert_eq!(comparison.u_probabilities()[2], Some(0.01));
        assert_eq!(trainer.settings().proportion_of_matches(), Some(0.4));
    }

    #[test]
    fn test_comparison_vectors_materialised_once() {
        let executor = ScriptedExecutor::new(vec![row(2, 0.8, 0.05)], json!(0.3));
        let mut trainer = EmTrainer::new(settings(), &executor).with_max_iterations(3);
        trainer.train().unwrap();
        let materialized = executor.materialized.lock();
        assert_eq!(
            materialized
                .iter()
                .filter(|t| t.as_str() == sql::COMPARISON_VECTORS_TABLE)
                .count(),
            1
        );
    }

    #[test]
    fn test_converges_when_parameters_stop_moving() {
        // the scripted response is constant, so the second iteration changes nothing
        let executor = ScriptedExecutor::new(
            vec![row(2, 0.8, 0.05), row(1, 0.15, 0.15), row(0, 0.05, 0.8)],
            json!(0.3),
        );
        let outcome = train(&settings(), &executor, 10, 1e-6).unwrap();
        assert_eq!(outcome.state, TrainerState::Converged);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.history.len(), 3);
    }

    #[test]
    fn test_iteration_cap_is_reported() {
        let executor = ScriptedExecutor::new(vec![row(2, 0.8, 0.05)], json!(0.3));
        let mut trainer = EmTrainer::new(settings(), &executor)
            .with_max_iterations(1)
            .with_convergence_epsilon(1e-9);
        assert_eq!(trainer.train().unwrap(), TrainerState::IterationCapReached);
        assert!(trainer.iterate_once().is_err());
    }

    #[test]
    fn test_abort_between_iterations() {
        let executor = ScriptedExecutor::new(vec![row(2, 0.8, 0.05)], json!(0.3));
        let mut trainer = EmTrainer::new(settings(), &executor);
        let handle = trainer.abort_handle();
        handle.abort();
        assert_eq!(trainer.train().unwrap(), TrainerState::Aborted);
        assert_eq!(trainer.history().len(), 1);
        assert!(executor.executed.lock().is_empty());
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let executor = ScriptedExecutor::new(vec![], json!(0.3));
        assert!(matches!(
            train(&settings(), &executor, 0, 1e-4),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            train(&settings(), &executor, 5, 0.0),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_no_candidate_pairs_is_an_error() {
        let mut executor = ScriptedExecutor::new(vec![], json!(0.3));
        executor.pairs = 0;
        let mut trainer = EmTrainer::new(settings(), &executor);
        assert!(matches!(trainer.iterate_once(), Err(Error::ModelState(_))));
    }

    #[test]
    fn test_trained_state_round_trip() {
        let executor = ScriptedExecutor::new(vec![row(2, 0.8, 0.05)], json!(0.3));
        let mut trainer = EmTrainer::new(settings(), &executor);
        trainer.iterate_once().unwrap();

        let state = trainer.to_trained_state();
        assert_eq!(state.iteration, 1);
        assert_eq!(state.historical_params.len(), 2);
        assert_eq!(state.settings_original.proportion_of_matches, Some(0.4));

        let resumed = EmTrainer::from_trained_state(state.clone(), &executor).unwrap();
        assert_eq!(resumed.history(), trainer.history());
        assert_eq!(resumed.settings(), trainer.settings());

        let mut corrupted = state;
        corrupted.iteration = 7;
        assert!(matches!(
            EmTrainer::from_trained_state(corrupted, &executor),
            Err(Error::CorruptedState(_))
        ));
    }

    #[test]
    fn test_history_rows_from_trainer() {
        let executor = ScriptedExecutor::new(vec![row(2, 0.8, 0.05)], json!(0.3));
        let mut trainer = EmTrainer::new(settings(), &executor);
        trainer.iterate_once().unwrap();
        let lambdas = trainer.lambda_history_as_rows();
        assert_eq!(lambdas.len(), 2);
        assert_eq!(lambdas[1].lambda, Some(0.3));
        assert_eq!(trainer.m_u_history_as_rows().len(), 6);
    }
}
