//! Storage layer
//!
//! SQLite-backed implementation of [`LocalStore`](crate::store::LocalStore).
//!
//! ## Tables
//!
//! - `records` - latest local version of every record, payload as JSON
//! - `schema_info` - schema version tracking
//!
//! Each commit reads the current version, applies the mutation and writes
//! the result inside one transaction, so a crash never leaves a half-applied
//! revision behind.

pub mod records;
pub mod schema;

pub use records::SqliteStore;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
