//! # reclink Training
//!
//! Parameter estimation for Fellegi-Sunter models over any [`QueryExecutor`]:
//!
//! - [`estimate_u`] / [`UEstimator`] - u probabilities from a random sample of record pairs
//! - [`train`] / [`EmTrainer`] - expectation-maximisation of λ, m and u
//!
//! All SQL is generated by [`sql`] in the settings' dialect and run through the executor.
//!
//! [`QueryExecutor`]: reclink_storage::QueryExecutor

pub mod em;
pub mod pipeline;
pub mod sampling;
pub mod sql;

pub use em::{train, AbortHandle, EmTrainer, TrainerState, TrainingOutcome};
pub use sampling::{estimate_u, UEstimationReport, UEstimator};
