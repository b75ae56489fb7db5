//! Storage Layer
//!
//! SQLite persistence with schema migrations and a trigger-maintained
//! FTS5 index.

pub mod migrations;
mod sqlite;

pub use migrations::{MIGRATIONS, Migration, apply_migrations, get_current_version};
pub use sqlite::{Store, sanitize_fts_query};
