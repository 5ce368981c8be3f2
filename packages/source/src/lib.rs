#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! OGR source reading for layer synchronization.
//!
//! A [`reader::LayerSource`] opens any OGR-compatible vector dataset
//! (shapefile, `PG:` connection, WFS, ...), selects a layer, optionally
//! applies an attribute filter, and streams its features. GDAL is a
//! blocking C library, so all OGR calls run on a dedicated blocking task;
//! features arrive as batches through a bounded channel so the consumer can
//! stage them incrementally rather than buffering the whole dataset.

pub mod reader;

pub use reader::{
    FeatureRecord, FieldValue, LayerSource, OgrFieldKind, SourceField, SourceRequest, open,
};

/// Registers all GDAL/OGR drivers. Called once at startup, before the
/// first source is opened.
pub fn register_drivers() {
    gdal::DriverManager::register_all();
}

/// Errors that can occur while reading an OGR source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The OGR driver could not open the dataset.
    #[error("Could not open dataset for layer \"{layer}\": {reason}")]
    Open {
        /// Configured layer name.
        layer: String,
        /// Driver error message.
        reason: String,
    },

    /// The requested layer does not exist inside the dataset.
    #[error("source_layer \"{source_layer}\" in dataset for layer \"{layer}\" not found")]
    LayerNotFound {
        /// Configured layer name.
        layer: String,
        /// The missing source layer.
        source_layer: String,
    },

    /// The attribute filter was rejected by the driver.
    #[error(
        "The attribute filter for layer \"{layer}\" is invalid: {reason}. \
         The applied filter was [ {filter} ]"
    )]
    FilterInvalid {
        /// Configured layer name.
        layer: String,
        /// The filter expression as submitted.
        filter: String,
        /// Driver error message.
        reason: String,
    },

    /// The source layer does not have exactly one geometry field.
    #[error(
        "The source for layer \"{layer}\" provides {count} geometry fields, \
         exactly one is supported"
    )]
    GeometryFieldCount {
        /// Configured layer name.
        layer: String,
        /// Number of geometry fields the layer declares.
        count: usize,
    },

    /// Exporting a feature geometry to WKB failed.
    #[error("Could not export the geometry of feature #{feature}: {reason}")]
    GeometryExport {
        /// Zero-based index of the feature in the stream.
        feature: u64,
        /// Driver error message.
        reason: String,
    },

    /// Any other OGR-level failure while reading fields or features.
    #[error("OGR error: {0}")]
    Ogr(#[from] gdal::errors::GdalError),

    /// The background reader terminated without delivering a result.
    #[error("The source reader stopped unexpectedly")]
    ReaderStopped,
}
