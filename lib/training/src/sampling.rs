//! u estimation by random sampling
//!
//! Amongst randomly chosen record pairs almost all are non-matches, so the
//! share of sampled pairs falling in each comparison level estimates its u
//! probability. Blocking rules are ignored here: they would bias the sample
//! towards matches.

use crate::pipeline;
use crate::sql;
use ahash::AHashMap;
use reclink_core::{
    merge, CellUpdate, Error, ParamSnapshot, ParamUpdates, Result, Settings,
};
use reclink_storage::{get_i64, get_string, QueryExecutor, TableRef};
use serde::Serialize;
use tracing::{info, warn};

/// What a u estimation run did
#[derive(Debug, Clone, Serialize)]
pub struct UEstimationReport {
    /// Row count per input table, in registration order
    pub table_row_counts: Vec<(String, u64)>,
    /// Candidate pairs before sampling
    pub population: u128,
    /// Fraction of rows kept; 1.0 when every pair is compared
    pub proportion: f64,
    pub sampled_pairs: u64,
    pub seed: u64,
    /// Candidate pairs the estimate was computed on
    pub blocked_table: TableRef,
}

pub struct UEstimator<'a> {
    executor: &'a dyn QueryExecutor,
    max_pairs: u64,
    seed: Option<u64>,
}

impl<'a> UEstimator<'a> {
    pub fn new(executor: &'a dyn QueryExecutor, max_pairs: u64) -> Self {
        Self {
            executor,
            max_pairs,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Estimate u for every comparison, returning updated settings and a report.
    /// `settings` itself is not modified.
    pub fn run(&self, settings: &Settings) -> Result<(Settings, UEstimationReport)> {
        if self.max_pairs == 0 {
            return Err(Error::InvalidConfiguration(
                "max_pairs must be greater than zero".to_string(),
            ));
        }
        let executor = self.executor;
        let concat = pipeline::concat_inputs(settings, executor)?;

        let mut counts_by_table: AHashMap<String, u64> = AHashMap::new();
        for row in executor.execute(&sql::row_counts_sql(settings.dialect(), &concat.table.name))? {
            if let Some(table) = get_string(&row, reclink_core::SOURCE_DATASET_COLUMN) {
                let n = get_i64(&row, "row_count")?.unwrap_or(0).max(0) as u64;
                counts_by_table.insert(table, n);
            }
        }
        let table_row_counts: Vec<(String, u64)> = concat
            .inputs
            .iter()
            .map(|t| (t.name.clone(), counts_by_table.get(&t.name).copied().unwrap_or(0)))
            .collect();
        let counts: Vec<u64> = table_row_counts.iter().map(|(_, n)| *n).collect();
        let total_rows: u64 = counts.iter().sum();

        let population = settings.link_type().pair_population(&counts);
        if population == 0 {
            return Err(Error::SamplingInfeasible(format!(
                "{} over tables with {:?} rows has no candidate pairs",
                settings.link_type(),
                counts
            )));
        }

        let seed = self.seed.unwrap_or_else(|| u64::from(rand::random::<u32>()));
        let (source, proportion) = if self.max_pairs as u128 >= population {
            info!(
                "max_pairs {} covers all {} candidate pairs, comparing exhaustively",
                self.max_pairs, population
            );
            (concat.table.clone(), 1.0)
        } else {
            let proportion = (self.max_pairs as f64 / population as f64).sqrt();
            let sample_size = (proportion * total_rows as f64).ceil() as u64;
            info!(
                "Sampling {:.4} of {} rows (seed {}) to compare about {} of {} pairs",
                proportion, total_rows, seed, self.max_pairs, population
            );
            let sample_sql = sql::sample_sql(
                settings.dialect(),
                &concat.table.name,
                proportion,
                sample_size,
                seed,
                settings.unique_id_column_name(),
            );
            let sample = executor.materialize(
                &sample_sql,
                sql::CONCAT_SAMPLE_TABLE,
                std::slice::from_ref(&concat.table),
            )?;
            (sample, proportion)
        };

        let (blocked, vectors) = pipeline::comparison_vectors(settings, executor, &source, &[])?;
        let sampled_pairs = pipeline::count_pairs(settings, executor, &vectors)?;
        if sampled_pairs == 0 {
            return Err(Error::SamplingInfeasible(
                "the sample produced no record pairs; increase max_pairs".to_string(),
            ));
        }

        let mut gamma_counts: AHashMap<(String, i64), u64> = AHashMap::new();
        for row in executor.execute(&sql::gamma_counts_sql(settings, &vectors.name))? {
            let (Some(name), Some(gamma)) =
                (get_string(&row, "comparison_name"), get_i64(&row, "gamma_value")?)
            else {
                continue;
            };
            let n = get_i64(&row, "gamma_count")?.unwrap_or(0).max(0) as u64;
            gamma_counts.insert((name, gamma), n);
        }

        let mut cells = Vec::new();
        for comparison in settings.comparisons() {
            let name = comparison.output_column_name();
            let k = comparison.num_non_null_levels() as i64;
            let total: u64 = (0..k)
                .filter_map(|g| gamma_counts.get(&(name.to_string(), g)))
                .sum();
            if total == 0 {
                warn!(
                    "No sampled pairs with non-null values for '{}', u probabilities unchanged",
                    name
                );
                continue;
            }
            for g in 0..k {
                match gamma_counts.get(&(name.to_string(), g)) {
                    Some(&n) => cells.push(CellUpdate {
                        comparison: name.to_string(),
                        gamma_value: g as i32,
                        m_probability: None,
                        u_probability: Some(n as f64 / total as f64),
                    }),
                    None => warn!(
                        "Level gamma {} of '{}' was not observed in the sample, keeping its prior u",
                        g, name
                    ),
                }
            }
        }

        let updates = ParamUpdates {
            proportion_of_matches: None,
            cells,
        }
        .respecting_fixed(settings);
        let next = merge(&ParamSnapshot::capture(settings, 0), &updates)?;
        let mut estimated = settings.clone();
        next.apply_to(&mut estimated)?;
        info!("Estimated u probabilities from {} sampled pairs", sampled_pairs);

        Ok((
            estimated,
            UEstimationReport {
                table_row_counts,
                population,
                proportion,
                sampled_pairs,
                seed,
                blocked_table: blocked,
            },
        ))
    }
}

/// Estimate u probabilities on a random sample of about `max_pairs` pairs.
/// Returns an updated copy of `settings`.
pub fn estimate_u(
    settings: &Settings,
    executor: &dyn QueryExecutor,
    max_pairs: u64,
    seed: Option<u64>,
) -> Result<Settings> {
    let mut estimator = UEstimator::new(executor, max_pairs);
    if let Some(seed) = seed {
        estimator = estimator.with_seed(seed);
    }
    estimator.run(settings).map(|(settings, _)| settings)
}
