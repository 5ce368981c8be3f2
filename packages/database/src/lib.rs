#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Database access for the geopull sync pipeline.
//!
//! Uses `switchy_database` for parameterized raw SQL against `PostgreSQL`.
//! Each worker owns a [`gateway::DbGateway`] holding a single connection
//! that is re-established on demand; all statements of one pull run inside
//! a single transaction obtained from the gateway.

pub mod gateway;
pub mod introspect;
pub mod sql;

pub use gateway::DbGateway;
pub use introspect::{TargetField, create_temp_table, table_fields};

/// Errors surfaced by the database layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Connecting or re-connecting to the database failed.
    #[error("Database connection error: {0}")]
    Connect(String),

    /// A query or statement failed.
    #[error("Database error: {0}")]
    Query(#[from] switchy_database::DatabaseError),

    /// The database answered with something the caller cannot interpret.
    #[error("Database protocol error: {message}")]
    Protocol {
        /// Description of the unexpected answer.
        message: String,
    },
}
