//! # reclink SQLite
//!
//! Reference [`SqlBackend`](reclink_storage::SqlBackend) running on an
//! in-process SQLite database. Registers the scalar functions the
//! [`SqliteDialect`](reclink_core::SqliteDialect) emits: string distances,
//! `regexp_extract`, `seeded_uniform` for reproducible sampling and
//! `great_circle_km`.

pub mod backend;
pub mod functions;

pub use backend::SqliteBackend;
