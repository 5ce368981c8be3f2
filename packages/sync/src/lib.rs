#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Layer synchronization: the worker loop and the pull protocol.
//!
//! A [`worker::Worker`] pops jobs from the shared queue, ensures database
//! connectivity, and drives [`pull::pull_layer`], which reconciles a
//! streamed OGR source layer against its target table inside a single
//! transaction.

pub mod pull;
pub mod worker;

pub use pull::pull_layer;
pub use worker::Worker;

use geopull_database::DbError;
use geopull_source::SourceError;

/// Errors that can fail a pull.
#[derive(Debug, thiserror::Error)]
pub enum PullError {
    /// Reading the OGR source failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A database operation failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// No transaction could be started on the target database.
    #[error("Could not start a database transaction")]
    NoTransaction,

    /// The target table has more than one geometry column.
    #[error("Layer \"{layer}\" has multiple geometry columns, only one is supported")]
    MultipleGeometryColumns {
        /// Configured layer name.
        layer: String,
    },

    /// The target table has no primary key.
    #[error("Got no primary key for layer \"{layer}\"")]
    NoPrimaryKey {
        /// Configured layer name.
        layer: String,
    },

    /// The source lacks fields required by the target's primary key.
    #[error(
        "The source for layer \"{layer}\" is missing the following fields \
         required by the primary key: {}",
        .fields.join(", ")
    )]
    MissingPrimaryKeyFields {
        /// Configured layer name.
        layer: String,
        /// The primary-key columns absent from the source.
        fields: Vec<String>,
    },

    /// A source column carries an OGR type the pipeline cannot render.
    #[error("Unsupported OGR field type {type_code} for column \"{column}\"")]
    UnsupportedFieldType {
        /// The affected column.
        column: String,
        /// The raw OGR type code.
        type_code: u32,
    },
}
