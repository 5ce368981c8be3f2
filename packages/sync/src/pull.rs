//! The pull protocol: reconcile a streamed OGR layer against its target
//! table inside a single transaction.
//!
//! Every source feature is staged into a transaction-scoped temp table,
//! then the staging table is merged into the target in three fixed steps:
//! update changed rows, insert missing rows, delete vanished rows. Updates
//! run first so freshly inserted rows are never touched by the change
//! predicate, and deletes run last so the target is never empty mid-sync.
//! Any failure rolls the transaction back, leaving the target exactly in
//! its pre-pull state.

use std::collections::BTreeMap;

use switchy_database::{DatabaseTransaction, DatabaseValue};

use geopull_config::LayerConfig;
use geopull_database::sql::{column_list, qualified_table, quote_ident};
use geopull_database::{DbError, DbGateway, TargetField, create_temp_table, table_fields};
use geopull_jobs::{Job, JobStatistics};
use geopull_source::{FeatureRecord, FieldValue, LayerSource, OgrFieldKind, SourceField};

use crate::PullError;

/// Prefix of the per-job staging table; the job id is appended.
const TEMP_TABLE_PREFIX: &str = "geopull_";

/// Where one parameter of the staging insert comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamSource {
    /// The feature geometry, delivered as hex-encoded WKB.
    Geometry,
    /// A source attribute, by its index in the feature values.
    Field(usize),
}

/// One column of the staging insert.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InsertColumn {
    name: String,
    pg_type_name: String,
    source: ParamSource,
}

/// The column classification driving one pull.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PullPlan {
    primary_key_columns: Vec<String>,
    update_columns: Vec<String>,
    insert_columns: Vec<InsertColumn>,
}

impl PullPlan {
    fn insert_column_names(&self) -> Vec<String> {
        self.insert_columns
            .iter()
            .map(|column| column.name.clone())
            .collect()
    }
}

/// Executes the pull protocol for one job.
///
/// Opens the source, obtains a transaction from the gateway, stages the
/// feature stream, merges staging into the target, and commits. On any
/// error the transaction is rolled back and the target table is untouched.
///
/// # Errors
///
/// Returns [`PullError`] describing the first failure encountered.
pub async fn pull_layer(
    gateway: &mut DbGateway,
    layer: &LayerConfig,
    job: &Job,
) -> Result<JobStatistics, PullError> {
    if let Some(filter) = job.filter() {
        log::info!("Pulling layer \"{}\" using filter \"{filter}\"", layer.name);
    } else {
        log::info!("Pulling layer \"{}\"", layer.name);
    }

    let mut source = geopull_source::open(geopull_source::SourceRequest {
        layer_name: layer.name.clone(),
        source: layer.source.clone(),
        source_layer: layer.source_layer.clone(),
        filter: job.filter().map(ToString::to_string),
    })
    .await?;

    let Some(tx) = gateway.begin_transaction().await else {
        return Err(PullError::NoTransaction);
    };

    match stage_and_merge(tx.as_ref(), layer, job, &mut source).await {
        Ok(statistics) => {
            tx.commit().await.map_err(DbError::Query)?;
            Ok(statistics)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                log::warn!("Rollback after failed pull also failed: {rollback_err}");
            }
            Err(e)
        }
    }
}

/// Runs steps 3–7 of the protocol inside the given transaction.
async fn stage_and_merge(
    tx: &dyn DatabaseTransaction,
    layer: &LayerConfig,
    job: &Job,
    source: &mut LayerSource,
) -> Result<JobStatistics, PullError> {
    let target_fields = table_fields(
        tx,
        &layer.target_table_schema,
        &layer.target_table_name,
    )
    .await?;
    let plan = build_plan(&layer.name, &target_fields, source.fields())?;

    let temp_table = format!("{TEMP_TABLE_PREFIX}{}", job.id());
    create_temp_table(
        tx,
        &layer.target_table_schema,
        &layer.target_table_name,
        &temp_table,
    )
    .await?;

    let insert_sql = staging_insert_sql(&temp_table, &plan.insert_columns);
    log::debug!("{insert_sql}");

    let mut statistics = JobStatistics::default();

    while let Some(batch) = source.next_batch().await {
        let batch = batch?;
        for record in &batch {
            let params = feature_params(&plan, record);
            tx.exec_raw_params(&insert_sql, &params)
                .await
                .map_err(DbError::Query)?;
            statistics.pulled += 1;
        }
        job.set_statistics(statistics);
    }

    // update only rows that actually differ, to keep triggers quiet
    if plan.update_columns.is_empty() {
        log::debug!(
            "Layer \"{}\": every target column is part of the primary key, nothing to update",
            layer.name
        );
    } else {
        let sql = update_changed_sql(
            &layer.target_table_schema,
            &layer.target_table_name,
            &temp_table,
            &plan,
        );
        statistics.updated = tx
            .exec_raw_params(&sql, &[])
            .await
            .map_err(DbError::Query)?;
    }

    let sql = insert_missing_sql(
        &layer.target_table_schema,
        &layer.target_table_name,
        &temp_table,
        &plan,
    );
    statistics.created = tx
        .exec_raw_params(&sql, &[])
        .await
        .map_err(DbError::Query)?;

    if job.filter().is_some() {
        log::info!(
            "Layer \"{}\": keeping rows missing from the source because the job uses a filter",
            layer.name
        );
    } else if layer.delete_missing {
        let sql = delete_vanished_sql(
            &layer.target_table_schema,
            &layer.target_table_name,
            &temp_table,
            &plan,
        );
        statistics.deleted = tx
            .exec_raw_params(&sql, &[])
            .await
            .map_err(DbError::Query)?;
    } else {
        log::info!(
            "Layer \"{}\": deletion of rows missing from the source is disabled",
            layer.name
        );
    }

    job.set_statistics(statistics);
    Ok(statistics)
}

/// Classifies the target columns against the source schema.
///
/// `insert_columns` is the geometry column plus every target column whose
/// name appears among the source fields; columns present only in the
/// target are left to the database's defaults. Primary-key columns must
/// all be present in the source.
fn build_plan(
    layer_name: &str,
    target_fields: &[TargetField],
    source_fields: &[SourceField],
) -> Result<PullPlan, PullError> {
    let by_name: BTreeMap<&str, &SourceField> = source_fields
        .iter()
        .map(|field| (field.name.as_str(), field))
        .collect();

    let mut primary_key_columns = Vec::new();
    let mut update_columns = Vec::new();
    let mut insert_columns = Vec::new();
    let mut geometry_column: Option<&str> = None;

    for field in target_fields {
        if field.is_primary_key {
            primary_key_columns.push(field.name.clone());
        } else {
            update_columns.push(field.name.clone());
        }

        if field.pg_type_name == "geometry" {
            if geometry_column.is_some() {
                return Err(PullError::MultipleGeometryColumns {
                    layer: layer_name.to_string(),
                });
            }
            geometry_column = Some(&field.name);
            insert_columns.push(InsertColumn {
                name: field.name.clone(),
                pg_type_name: field.pg_type_name.clone(),
                source: ParamSource::Geometry,
            });
        } else if let Some(source_field) = by_name.get(field.name.as_str()) {
            if let OgrFieldKind::Unsupported(type_code) = source_field.kind {
                return Err(PullError::UnsupportedFieldType {
                    column: field.name.clone(),
                    type_code,
                });
            }
            insert_columns.push(InsertColumn {
                name: field.name.clone(),
                pg_type_name: field.pg_type_name.clone(),
                source: ParamSource::Field(source_field.index),
            });
        }
    }

    if primary_key_columns.is_empty() {
        return Err(PullError::NoPrimaryKey {
            layer: layer_name.to_string(),
        });
    }

    let missing: Vec<String> = primary_key_columns
        .iter()
        .filter(|column| !by_name.contains_key(column.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(PullError::MissingPrimaryKeyFields {
            layer: layer_name.to_string(),
            fields: missing,
        });
    }

    Ok(PullPlan {
        primary_key_columns,
        update_columns,
        insert_columns,
    })
}

/// `INSERT INTO <temp> (cols…) VALUES ($1::t1, …)` — one positional
/// parameter per insert column, each with an explicit cast to the target
/// column's type.
fn staging_insert_sql(temp_table: &str, insert_columns: &[InsertColumn]) -> String {
    let columns = insert_columns
        .iter()
        .map(|column| quote_ident(&column.name))
        .collect::<Vec<_>>()
        .join(", ");
    let values = insert_columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("${}::{}", i + 1, column.pg_type_name))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({columns}) VALUES ({values})",
        quote_ident(temp_table)
    )
}

/// `UPDATE target SET … FROM temp WHERE <pk matches> AND <any column
/// differs>`. Primary keys are compared with `IS NOT DISTINCT FROM` so a
/// NULL key matches a NULL key.
fn update_changed_sql(schema: &str, table: &str, temp_table: &str, plan: &PullPlan) -> String {
    let target = qualified_table(schema, table);
    let t = quote_ident(table);
    let tmp = quote_ident(temp_table);

    let assignments = plan
        .update_columns
        .iter()
        .map(|column| {
            let col = quote_ident(column);
            format!("{col} = {tmp}.{col}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    let pk_match = plan
        .primary_key_columns
        .iter()
        .map(|column| {
            let col = quote_ident(column);
            format!("{t}.{col} IS NOT DISTINCT FROM {tmp}.{col}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    let any_differs = plan
        .update_columns
        .iter()
        .map(|column| {
            let col = quote_ident(column);
            format!("({t}.{col} IS DISTINCT FROM {tmp}.{col})")
        })
        .collect::<Vec<_>>()
        .join(" OR ");

    format!(
        "UPDATE {target} SET {assignments} FROM {tmp} WHERE ({pk_match}) AND ({any_differs})"
    )
}

/// `INSERT INTO target (cols…) SELECT cols… FROM temp WHERE (pk) NOT IN
/// (SELECT pk FROM target)`.
fn insert_missing_sql(schema: &str, table: &str, temp_table: &str, plan: &PullPlan) -> String {
    let target = qualified_table(schema, table);
    let tmp = quote_ident(temp_table);
    let columns = column_list(&plan.insert_column_names());
    let pk = column_list(&plan.primary_key_columns);

    format!(
        "INSERT INTO {target} ({columns}) SELECT {columns} FROM {tmp} \
         WHERE ({pk}) NOT IN (SELECT {pk} FROM {target})"
    )
}

/// `DELETE FROM target WHERE (pk) NOT IN (SELECT pk FROM temp)`.
fn delete_vanished_sql(schema: &str, table: &str, temp_table: &str, plan: &PullPlan) -> String {
    let target = qualified_table(schema, table);
    let tmp = quote_ident(temp_table);
    let pk = column_list(&plan.primary_key_columns);

    format!("DELETE FROM {target} WHERE ({pk}) NOT IN (SELECT {pk} FROM {tmp})")
}

/// Builds the staging-insert parameter vector for one feature, in insert
/// column order.
fn feature_params(plan: &PullPlan, record: &FeatureRecord) -> Vec<DatabaseValue> {
    plan.insert_columns
        .iter()
        .map(|column| match column.source {
            ParamSource::Geometry => record
                .geometry_wkb_hex
                .clone()
                .map_or(DatabaseValue::Null, DatabaseValue::String),
            ParamSource::Field(index) => match record.values.get(index) {
                None | Some(FieldValue::Null) => DatabaseValue::Null,
                Some(FieldValue::String(value)) => DatabaseValue::String(value.clone()),
                Some(FieldValue::Integer(value)) => DatabaseValue::Int32(*value),
                Some(FieldValue::Integer64(value)) => DatabaseValue::Int64(*value),
                Some(FieldValue::Real(value)) => DatabaseValue::Real64(*value),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, pg_type_name: &str, is_primary_key: bool) -> TargetField {
        TargetField {
            name: name.to_string(),
            pg_type_name: pg_type_name.to_string(),
            is_primary_key,
        }
    }

    fn source(name: &str, index: usize, kind: OgrFieldKind) -> SourceField {
        SourceField {
            name: name.to_string(),
            index,
            kind,
        }
    }

    fn parcels_plan() -> PullPlan {
        let target_fields = vec![
            target("pk", "int4", true),
            target("owner", "text", false),
            target("geom", "geometry", false),
        ];
        let source_fields = vec![
            source("pk", 0, OgrFieldKind::Integer),
            source("owner", 1, OgrFieldKind::String),
        ];
        build_plan("parcels", &target_fields, &source_fields).unwrap()
    }

    #[test]
    fn classifies_target_columns() {
        let plan = parcels_plan();
        assert_eq!(plan.primary_key_columns, ["pk"]);
        assert_eq!(plan.update_columns, ["owner", "geom"]);
        assert_eq!(plan.insert_column_names(), ["pk", "owner", "geom"]);
    }

    #[test]
    fn insert_columns_follow_target_ordinal_order() {
        // pk comes first in the target, so it leads the insert columns
        let plan = parcels_plan();
        assert_eq!(plan.insert_columns[0].source, ParamSource::Field(0));
        assert_eq!(plan.insert_columns[1].source, ParamSource::Field(1));
        assert_eq!(plan.insert_columns[2].source, ParamSource::Geometry);
    }

    #[test]
    fn columns_only_in_target_are_left_to_defaults() {
        let target_fields = vec![
            target("pk", "int4", true),
            target("updated_by", "text", false),
        ];
        let source_fields = vec![source("pk", 0, OgrFieldKind::Integer)];

        let plan = build_plan("parcels", &target_fields, &source_fields).unwrap();
        assert_eq!(plan.insert_column_names(), ["pk"]);
        assert_eq!(plan.update_columns, ["updated_by"]);
    }

    #[test]
    fn rejects_targets_without_primary_key() {
        let target_fields = vec![target("owner", "text", false)];
        let source_fields = vec![source("owner", 0, OgrFieldKind::String)];

        let err = build_plan("parcels", &target_fields, &source_fields).unwrap_err();
        assert!(matches!(err, PullError::NoPrimaryKey { .. }));
    }

    #[test]
    fn rejects_targets_with_two_geometry_columns() {
        let target_fields = vec![
            target("pk", "int4", true),
            target("geom", "geometry", false),
            target("centroid", "geometry", false),
        ];
        let source_fields = vec![source("pk", 0, OgrFieldKind::Integer)];

        let err = build_plan("parcels", &target_fields, &source_fields).unwrap_err();
        assert!(matches!(err, PullError::MultipleGeometryColumns { .. }));
    }

    #[test]
    fn lists_primary_key_fields_missing_from_the_source() {
        let target_fields = vec![
            target("id", "int4", true),
            target("region", "text", true),
            target("owner", "text", false),
        ];
        let source_fields = vec![source("owner", 0, OgrFieldKind::String)];

        let err = build_plan("parcels", &target_fields, &source_fields).unwrap_err();
        match err {
            PullError::MissingPrimaryKeyFields { fields, .. } => {
                assert_eq!(fields, ["id", "region"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        let message = build_plan("parcels", &target_fields, &source_fields)
            .unwrap_err()
            .to_string();
        assert!(message.contains("id, region"));
    }

    #[test]
    fn rejects_unsupported_source_field_types() {
        let target_fields = vec![target("pk", "int4", true), target("tags", "text", false)];
        let source_fields = vec![
            source("pk", 0, OgrFieldKind::Integer),
            source("tags", 1, OgrFieldKind::Unsupported(8)),
        ];

        let err = build_plan("parcels", &target_fields, &source_fields).unwrap_err();
        match err {
            PullError::UnsupportedFieldType { column, type_code } => {
                assert_eq!(column, "tags");
                assert_eq!(type_code, 8);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unsupported_types_outside_the_target_are_ignored() {
        let target_fields = vec![target("pk", "int4", true)];
        let source_fields = vec![
            source("pk", 0, OgrFieldKind::Integer),
            source("blob", 1, OgrFieldKind::Unsupported(8)),
        ];

        assert!(build_plan("parcels", &target_fields, &source_fields).is_ok());
    }

    #[test]
    fn staging_insert_casts_every_parameter() {
        let plan = parcels_plan();
        let sql = staging_insert_sql("geopull_abc123", &plan.insert_columns);
        assert_eq!(
            sql,
            "INSERT INTO \"geopull_abc123\" (\"pk\", \"owner\", \"geom\") \
             VALUES ($1::int4, $2::text, $3::geometry)"
        );
    }

    #[test]
    fn update_matches_null_primary_keys_and_skips_unchanged_rows() {
        let plan = parcels_plan();
        let sql = update_changed_sql("public", "parcels", "geopull_abc123", &plan);
        assert_eq!(
            sql,
            "UPDATE \"public\".\"parcels\" SET \
             \"owner\" = \"geopull_abc123\".\"owner\", \
             \"geom\" = \"geopull_abc123\".\"geom\" \
             FROM \"geopull_abc123\" WHERE \
             (\"parcels\".\"pk\" IS NOT DISTINCT FROM \"geopull_abc123\".\"pk\") AND \
             ((\"parcels\".\"owner\" IS DISTINCT FROM \"geopull_abc123\".\"owner\") OR \
             (\"parcels\".\"geom\" IS DISTINCT FROM \"geopull_abc123\".\"geom\"))"
        );
    }

    #[test]
    fn insert_missing_targets_absent_primary_key_tuples() {
        let plan = parcels_plan();
        let sql = insert_missing_sql("public", "parcels", "geopull_abc123", &plan);
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"parcels\" (\"pk\", \"owner\", \"geom\") \
             SELECT \"pk\", \"owner\", \"geom\" FROM \"geopull_abc123\" \
             WHERE (\"pk\") NOT IN (SELECT \"pk\" FROM \"public\".\"parcels\")"
        );
    }

    #[test]
    fn delete_targets_vanished_primary_key_tuples() {
        let plan = parcels_plan();
        let sql = delete_vanished_sql("public", "parcels", "geopull_abc123", &plan);
        assert_eq!(
            sql,
            "DELETE FROM \"public\".\"parcels\" WHERE (\"pk\") NOT IN \
             (SELECT \"pk\" FROM \"geopull_abc123\")"
        );
    }

    #[test]
    fn composite_primary_keys_use_tuple_comparison() {
        let target_fields = vec![
            target("id", "int4", true),
            target("region", "text", true),
            target("owner", "text", false),
        ];
        let source_fields = vec![
            source("id", 0, OgrFieldKind::Integer),
            source("region", 1, OgrFieldKind::String),
            source("owner", 2, OgrFieldKind::String),
        ];
        let plan = build_plan("parcels", &target_fields, &source_fields).unwrap();

        let sql = delete_vanished_sql("public", "parcels", "geopull_x", &plan);
        assert!(sql.contains("(\"id\", \"region\") NOT IN (SELECT \"id\", \"region\""));

        let sql = update_changed_sql("public", "parcels", "geopull_x", &plan);
        assert!(sql.contains(
            "(\"parcels\".\"id\" IS NOT DISTINCT FROM \"geopull_x\".\"id\" AND \
             \"parcels\".\"region\" IS NOT DISTINCT FROM \"geopull_x\".\"region\")"
        ));
    }

    #[test]
    fn builds_typed_parameters_in_insert_column_order() {
        let plan = parcels_plan();
        let record = FeatureRecord {
            values: vec![
                FieldValue::Integer(7),
                FieldValue::String("Ada".to_string()),
            ],
            geometry_wkb_hex: Some("0101000000".to_string()),
        };

        let params = feature_params(&plan, &record);
        assert_eq!(
            params,
            vec![
                DatabaseValue::Int32(7),
                DatabaseValue::String("Ada".to_string()),
                DatabaseValue::String("0101000000".to_string()),
            ]
        );
    }

    #[test]
    fn missing_values_and_geometry_become_null() {
        let plan = parcels_plan();
        let record = FeatureRecord {
            values: vec![FieldValue::Integer(7), FieldValue::Null],
            geometry_wkb_hex: None,
        };

        let params = feature_params(&plan, &record);
        assert_eq!(
            params,
            vec![
                DatabaseValue::Int32(7),
                DatabaseValue::Null,
                DatabaseValue::Null,
            ]
        );
    }
}
