//! SQL string assembly helpers.
//!
//! Every identifier flowing into generated SQL passes through
//! [`quote_ident`]. Only configured schema/table names and introspected
//! column names ever reach these helpers; client-supplied values are
//! delivered exclusively through statement parameters.

/// Quotes a SQL identifier with double quotes, doubling any embedded
/// quote character.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Returns the quoted, schema-qualified form `"schema"."table"`.
#[must_use]
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Joins identifiers into a quoted, comma-separated column list.
#[must_use]
pub fn column_list(names: &[String]) -> String {
    names
        .iter()
        .map(|name| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ")
}
