//! # reclink Storage
//!
//! Everything between the training code and a SQL engine:
//!
//! - [`QueryExecutor`] / [`SqlBackend`] - the executor boundary
//! - [`CachingExecutor`] - materialised tables keyed by SQL text and upstream fingerprints
//! - [`TrainedState`] - the trained-state JSON file

pub mod cache;
pub mod executor;
pub mod state;

pub use cache::{CacheStats, CachingExecutor};
pub use executor::{get_f64, get_i64, get_string, QueryExecutor, Row, SqlBackend, TableRef};
pub use state::TrainedState;
