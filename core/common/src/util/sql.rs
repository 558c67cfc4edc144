//! Quoting for names and values that are spliced into SQL text. Only DDL and
//! administrative statements are built this way; row data always travels as
//! bind parameters.

/// Quotes `name` as a Postgres identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes `value` as a Postgres string literal, doubling embedded single
/// quotes. Values containing a backslash use the `E''` form.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// `"schema"."table"` for a table name that is already in its final SQL form
/// (quoted or not).
pub fn qualified(schema: &str, table_sql: &str) -> String {
    format!("{}.{}", quote_ident(schema), table_sql)
}
