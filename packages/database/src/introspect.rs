//! Target-table schema introspection and staging-table creation.

use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{DatabaseTransaction, DatabaseValue};

use crate::DbError;
use crate::sql::{qualified_table, quote_ident};

/// One column of a synchronization target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetField {
    /// Column name as stored in the catalog.
    pub name: String,
    /// `PostgreSQL` type name, e.g. `"int4"`, `"text"`, `"geometry"`.
    pub pg_type_name: String,
    /// Whether the column participates in the table's primary key.
    pub is_primary_key: bool,
}

/// Catalog query returning every column of a table in ordinal order,
/// together with its type name and primary-key membership.
const TABLE_FIELDS_SQL: &str = "SELECT a.attname AS column_name,
            t.typname AS type_name,
            COALESCE(i.indisprimary, FALSE) AS is_primary_key
     FROM pg_catalog.pg_attribute a
     JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
     JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
     JOIN pg_catalog.pg_type t ON t.oid = a.atttypid
     LEFT JOIN pg_catalog.pg_index i
       ON i.indrelid = c.oid AND a.attnum = ANY(i.indkey) AND i.indisprimary
     WHERE n.nspname = $1
       AND c.relname = $2
       AND a.attnum > 0
       AND NOT a.attisdropped
     ORDER BY a.attnum";

/// Fetches the column metadata of the target table, ordered by column
/// ordinal.
///
/// # Errors
///
/// Returns [`DbError::Query`] if the catalog query fails and
/// [`DbError::Protocol`] if the table does not exist or a row cannot be
/// decoded.
pub async fn table_fields(
    tx: &dyn DatabaseTransaction,
    schema: &str,
    table: &str,
) -> Result<Vec<TargetField>, DbError> {
    let rows = tx
        .query_raw_params(
            TABLE_FIELDS_SQL,
            &[
                DatabaseValue::String(schema.to_string()),
                DatabaseValue::String(table.to_string()),
            ],
        )
        .await?;

    if rows.is_empty() {
        return Err(DbError::Protocol {
            message: format!("Table {schema}.{table} does not exist or has no columns"),
        });
    }

    rows.iter()
        .map(|row| {
            let name: String = row.to_value("column_name").map_err(decode_error)?;
            let pg_type_name: String = row.to_value("type_name").map_err(decode_error)?;
            let is_primary_key: bool = row.to_value("is_primary_key").map_err(decode_error)?;
            Ok(TargetField {
                name,
                pg_type_name,
                is_primary_key,
            })
        })
        .collect()
}

/// Creates a transaction-scoped staging table with the column definitions
/// of the target table but none of its constraints. The table disappears
/// when the transaction commits or rolls back.
///
/// # Errors
///
/// Returns [`DbError::Query`] if the statement fails.
pub async fn create_temp_table(
    tx: &dyn DatabaseTransaction,
    schema: &str,
    table: &str,
    temp_name: &str,
) -> Result<(), DbError> {
    let sql = format!(
        "CREATE TEMPORARY TABLE {} ON COMMIT DROP AS SELECT * FROM {} LIMIT 0",
        quote_ident(temp_name),
        qualified_table(schema, table),
    );
    log::debug!("{sql}");
    tx.exec_raw(&sql).await?;
    Ok(())
}

fn decode_error(e: impl std::fmt::Display) -> DbError {
    DbError::Protocol {
        message: format!("Failed to decode column metadata: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_query_orders_by_ordinal() {
        assert!(TABLE_FIELDS_SQL.contains("ORDER BY a.attnum"));
        assert!(TABLE_FIELDS_SQL.contains("NOT a.attisdropped"));
    }
}
