//! Storage backends for the simulado engine.
//!
//! [`MemoryStore`] keeps everything in process and supports fault
//! injection for tests. [`PgStore`] (feature `postgres`) persists to
//! PostgreSQL via sqlx and ships its schema as migrations.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::PgStore;
