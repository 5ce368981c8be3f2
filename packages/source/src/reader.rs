//! Streaming OGR layer reader.
//!
//! The reader runs in two phases on a [`tokio::task::spawn_blocking`] task:
//!
//! 1. Open the dataset, select the layer, check the geometry-field count,
//!    apply the attribute filter, and describe the attribute schema. The
//!    schema (or the first error) is delivered through a oneshot channel,
//!    so a broken source or filter fails a pull before the target database
//!    is touched.
//! 2. Stream features in driver order as batches through a bounded channel,
//!    one page at a time, the same shape the staging inserter consumes on
//!    the other end.

use std::path::Path;

use gdal::Dataset;
use gdal::vector::{Feature, LayerAccess, OGRFieldType};
use tokio::sync::{mpsc, oneshot};

use crate::SourceError;

/// Number of features per streamed batch.
const FEATURE_BATCH_SIZE: usize = 512;

/// Batches buffered between the blocking reader and the consumer.
const BATCH_CHANNEL_BUFFER: usize = 2;

/// OGR field type tag, reduced to the types the sync pipeline renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OgrFieldKind {
    /// `OFTString`
    String,
    /// `OFTInteger` (32 bit)
    Integer,
    /// `OFTInteger64`
    Integer64,
    /// `OFTReal` (double precision)
    Real,
    /// Any other OGR field type, carrying the raw type code. Using such a
    /// field in a pull fails loudly instead of silently stringifying.
    Unsupported(OGRFieldType::Type),
}

impl OgrFieldKind {
    const fn from_ogr(field_type: OGRFieldType::Type) -> Self {
        match field_type {
            OGRFieldType::OFTString => Self::String,
            OGRFieldType::OFTInteger => Self::Integer,
            OGRFieldType::OFTInteger64 => Self::Integer64,
            OGRFieldType::OFTReal => Self::Real,
            other => Self::Unsupported(other),
        }
    }
}

/// One attribute field of the source layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceField {
    /// Field name, lowercased from the source's casing so it can be matched
    /// against `PostgreSQL` column names.
    pub name: String,
    /// Ordinal of the field in the OGR feature.
    pub index: usize,
    /// The field's type tag.
    pub kind: OgrFieldKind,
}

/// One extracted attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// The field is unset.
    Null,
    /// `OFTString` value.
    String(String),
    /// `OFTInteger` value.
    Integer(i32),
    /// `OFTInteger64` value.
    Integer64(i64),
    /// `OFTReal` value.
    Real(f64),
}

/// One source feature: attribute values in field order plus the geometry
/// as hex-encoded little-endian WKB.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    /// Values indexed by [`SourceField::index`].
    pub values: Vec<FieldValue>,
    /// Hex-encoded WKB geometry, `None` when the feature has no geometry.
    pub geometry_wkb_hex: Option<String>,
}

/// What to open: the configured layer plus the per-job attribute filter.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    /// Configured layer name, used in error messages.
    pub layer_name: String,
    /// OGR connection string of the dataset.
    pub source: String,
    /// Layer name inside the dataset.
    pub source_layer: String,
    /// Optional OGR attribute filter expression.
    pub filter: Option<String>,
}

/// An opened source layer: its attribute schema and the stream of feature
/// batches. The stream is finite and not restartable.
pub struct LayerSource {
    fields: Vec<SourceField>,
    batches: mpsc::Receiver<Result<Vec<FeatureRecord>, SourceError>>,
}

impl LayerSource {
    /// The layer's attribute schema. The geometry field is not enumerated
    /// here.
    #[must_use]
    pub fn fields(&self) -> &[SourceField] {
        &self.fields
    }

    /// Waits for the next batch of features.
    ///
    /// Returns `None` once the source is exhausted. An `Err` batch ends the
    /// stream; no further batches follow it.
    pub async fn next_batch(&mut self) -> Option<Result<Vec<FeatureRecord>, SourceError>> {
        self.batches.recv().await
    }
}

/// Opens a source layer and starts streaming its features in the
/// background.
///
/// # Errors
///
/// Returns [`SourceError`] if the dataset cannot be opened, the layer is
/// missing, the layer does not have exactly one geometry field, or the
/// attribute filter is rejected by the driver.
pub async fn open(request: SourceRequest) -> Result<LayerSource, SourceError> {
    let (schema_tx, schema_rx) = oneshot::channel();
    let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_BUFFER);

    tokio::task::spawn_blocking(move || read_layer(&request, schema_tx, &batch_tx));

    match schema_rx.await {
        Ok(Ok(fields)) => Ok(LayerSource {
            fields,
            batches: batch_rx,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SourceError::ReaderStopped),
    }
}

/// Blocking body of the reader task.
fn read_layer(
    request: &SourceRequest,
    schema_tx: oneshot::Sender<Result<Vec<SourceField>, SourceError>>,
    batch_tx: &mpsc::Sender<Result<Vec<FeatureRecord>, SourceError>>,
) {
    let dataset = match Dataset::open(Path::new(&request.source)) {
        Ok(dataset) => dataset,
        Err(e) => {
            let _ = schema_tx.send(Err(SourceError::Open {
                layer: request.layer_name.clone(),
                reason: e.to_string(),
            }));
            return;
        }
    };

    let Ok(mut layer) = dataset.layer_by_name(&request.source_layer) else {
        let _ = schema_tx.send(Err(SourceError::LayerNotFound {
            layer: request.layer_name.clone(),
            source_layer: request.source_layer.clone(),
        }));
        return;
    };

    let geometry_field_count = layer.defn().geom_fields().count();
    if geometry_field_count != 1 {
        let _ = schema_tx.send(Err(SourceError::GeometryFieldCount {
            layer: request.layer_name.clone(),
            count: geometry_field_count,
        }));
        return;
    }

    if let Some(filter) = &request.filter
        && let Err(e) = layer.set_attribute_filter(filter)
    {
        let _ = schema_tx.send(Err(SourceError::FilterInvalid {
            layer: request.layer_name.clone(),
            filter: filter.clone(),
            reason: e.to_string(),
        }));
        return;
    }

    layer.reset_feature_reading();

    let fields: Vec<SourceField> = layer
        .defn()
        .fields()
        .enumerate()
        .map(|(index, field)| SourceField {
            name: field.name().to_lowercase(),
            index,
            kind: OgrFieldKind::from_ogr(field.field_type()),
        })
        .collect();

    log::debug!(
        "Layer \"{}\" provides {} attribute fields",
        request.layer_name,
        fields.len()
    );

    if schema_tx.send(Ok(fields.clone())).is_err() {
        return;
    }

    let mut batch: Vec<FeatureRecord> = Vec::with_capacity(FEATURE_BATCH_SIZE);
    let mut feature_index: u64 = 0;

    for feature in layer.features() {
        match read_feature(&feature, &fields, feature_index) {
            Ok(record) => batch.push(record),
            Err(e) => {
                let _ = batch_tx.blocking_send(Err(e));
                return;
            }
        }
        feature_index += 1;

        if batch.len() >= FEATURE_BATCH_SIZE {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(FEATURE_BATCH_SIZE));
            if batch_tx.blocking_send(Ok(full)).is_err() {
                // consumer went away, e.g. the pull already failed
                return;
            }
        }
    }

    if !batch.is_empty() {
        let _ = batch_tx.blocking_send(Ok(batch));
    }
}

/// Extracts the attribute values and geometry of one feature.
fn read_feature(
    feature: &Feature<'_>,
    fields: &[SourceField],
    feature_index: u64,
) -> Result<FeatureRecord, SourceError> {
    let mut values = Vec::with_capacity(fields.len());

    for field in fields {
        let value = match field.kind {
            OgrFieldKind::String => feature
                .field_as_string(field.index)?
                .map_or(FieldValue::Null, FieldValue::String),
            OgrFieldKind::Integer => feature
                .field_as_integer(field.index)?
                .map_or(FieldValue::Null, FieldValue::Integer),
            OgrFieldKind::Integer64 => feature
                .field_as_integer64(field.index)?
                .map_or(FieldValue::Null, FieldValue::Integer64),
            OgrFieldKind::Real => feature
                .field_as_double(field.index)?
                .map_or(FieldValue::Null, FieldValue::Real),
            // never staged: the pull plan rejects unsupported fields before
            // the stream starts
            OgrFieldKind::Unsupported(_) => FieldValue::Null,
        };
        values.push(value);
    }

    let geometry_wkb_hex = match feature.geometry() {
        Some(geometry) => {
            let wkb = geometry.wkb().map_err(|e| SourceError::GeometryExport {
                feature: feature_index,
                reason: e.to_string(),
            })?;
            Some(hex::encode(wkb))
        }
        None => None,
    };

    Ok(FeatureRecord {
        values,
        geometry_wkb_hex,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_supported_ogr_types() {
        assert_eq!(
            OgrFieldKind::from_ogr(OGRFieldType::OFTString),
            OgrFieldKind::String
        );
        assert_eq!(
            OgrFieldKind::from_ogr(OGRFieldType::OFTInteger),
            OgrFieldKind::Integer
        );
        assert_eq!(
            OgrFieldKind::from_ogr(OGRFieldType::OFTInteger64),
            OgrFieldKind::Integer64
        );
        assert_eq!(
            OgrFieldKind::from_ogr(OGRFieldType::OFTReal),
            OgrFieldKind::Real
        );
    }

    #[test]
    fn keeps_the_raw_code_of_unsupported_types() {
        assert_eq!(
            OgrFieldKind::from_ogr(OGRFieldType::OFTBinary),
            OgrFieldKind::Unsupported(OGRFieldType::OFTBinary)
        );
        assert_eq!(
            OgrFieldKind::from_ogr(OGRFieldType::OFTDateTime),
            OgrFieldKind::Unsupported(OGRFieldType::OFTDateTime)
        );
    }
}
