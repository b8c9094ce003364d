//! # reclink Core
//!
//! Core model for the reclink record linkage library.
//!
//! This crate knows nothing about executing SQL. It provides:
//!
//! - [`Predicate`] - Abstract similarity predicates (exact match, string distance, dates, ...)
//! - [`SqlDialect`] - Per-backend compilation of predicates into SQL conditions
//! - [`ComparisonLevel`] / [`Comparison`] - Ordered, first-match-wins gamma assignment
//! - [`Settings`] - A validated Fellegi-Sunter model definition
//! - [`ParamSnapshot`] / [`merge`] - Immutable parameter history and the maximisation merge
//!
//! ## Example
//!
//! ```rust
//! use reclink_core::{library, LinkType, Settings, SettingsConfig};
//!
//! let config = SettingsConfig::new(
//!     LinkType::DedupeOnly,
//!     vec![library::levenshtein_at_thresholds("surname", &[2.0])],
//! );
//! let mut settings = Settings::from_config(&config).unwrap();
//! settings.complete_defaults();
//!
//! let case = settings.comparisons()[0].gamma_sql_case_statement();
//! assert!(case.ends_with("END AS gamma_surname"));
//! ```

pub mod comparison;
pub mod dialect;
pub mod error;
pub mod level;
pub mod library;
pub mod params;
pub mod predicate;
pub mod settings;

pub use comparison::{Comparison, ComparisonConfig};
pub use dialect::{
    DateUnit, DistanceFunction, DuckDbDialect, SparkDialect, SqlDialect, SqlDialectKind,
    SqliteDialect,
};
pub use error::{Error, Result};
pub use level::{ComparisonLevel, LevelConfig};
pub use params::{
    merge, CellUpdate, ChangedParameter, ComparisonParams, ConvergenceReport, ParamSnapshot,
    ParamUpdates, ProbabilityKind,
};
pub use predicate::Predicate;
pub use settings::{BlockingRule, LinkType, Settings, SettingsConfig, SOURCE_DATASET_COLUMN};
