//! # reclink
//!
//! Probabilistic record linkage: Fellegi-Sunter models whose parameters are
//! trained by expectation-maximisation over SQL backends.
//!
//! Given one or more tables of records, reclink scores candidate record pairs
//! column by column (exact match, string distance, date windows, geographic
//! distance, ...), then estimates how likely each outcome is amongst matches
//! (m) and non-matches (u).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reclink::prelude::*;
//! use serde_json::json;
//!
//! let backend = SqliteBackend::open_in_memory()?;
//! let rows: Vec<Row> = vec![
//!     json!({"unique_id": 1, "name": "Amanda"}),
//!     json!({"unique_id": 2, "name": "Amanda"}),
//!     json!({"unique_id": 3, "name": "Robin"}),
//! ]
//! .into_iter()
//! .filter_map(|v| v.as_object().cloned())
//! .collect();
//! backend.register_table("people", &rows)?;
//! let executor = CachingExecutor::new(backend);
//!
//! let settings = Settings::from_config(&SettingsConfig::new(
//!     LinkType::DedupeOnly,
//!     vec![library::levenshtein_at_thresholds("name", &[2.0])],
//! ))?;
//! let settings = estimate_u(&settings, &executor, 1_000_000, Some(42))?;
//! let outcome = train(&settings, &executor, 25, 1e-4)?;
//! println!("{}", outcome.settings);
//! # Ok::<(), reclink::Error>(())
//! ```
//!
//! ## Crate Structure
//!
//! - `reclink-core` - Comparisons, predicates, dialect adapters, settings, parameter snapshots
//! - `reclink-storage` - Executor boundary, SQL-keyed table cache, trained-state files
//! - `reclink-training` - EM training and random-sampling u estimation
//! - `reclink-sqlite` - Reference SQLite backend

pub use reclink_core::{
    library, BlockingRule, Comparison, ComparisonConfig, ComparisonLevel, DateUnit,
    DistanceFunction, Error, LevelConfig, LinkType, ParamSnapshot, Predicate, Result, Settings,
    SettingsConfig, SqlDialect, SqlDialectKind,
};

pub use reclink_storage::{CachingExecutor, QueryExecutor, Row, SqlBackend, TableRef, TrainedState};

pub use reclink_training::{
    estimate_u, train, AbortHandle, EmTrainer, TrainerState, TrainingOutcome, UEstimationReport,
    UEstimator,
};

pub use reclink_sqlite::SqliteBackend;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        estimate_u, library, train, CachingExecutor, ComparisonConfig, EmTrainer, Error,
        LevelConfig, LinkType, QueryExecutor, Result, Row, Settings, SettingsConfig,
        SqliteBackend, TrainedState, TrainerState, UEstimator,
    };
}
