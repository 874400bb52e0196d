//! Persistence layer — libSQL-backed storage for the email table.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{EmailRecord, InsertOutcome, MergeFilter, MessageStore, NewEmail, Role};
