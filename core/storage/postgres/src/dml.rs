//! Data access for indexer tables.
//!
//! Every statement references tables and columns through the identifiers the
//! schema declared them with, so quoted mixed-case names keep working. Row
//! data never enters the SQL text: the whole payload is bound as one `jsonb`
//! parameter and expanded with `jsonb_populate_record(set)` against the
//! table's row type, leaving type conversion to Postgres.
use crate::connection::PgExecutor;
use crate::error::StoreError;
use indexer_common::util::sql::{qualified, quote_literal};
use indexer_schema::{SchemaDefinition, TableDefinition};
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub struct DmlQuery {
    pub sql: String,
    pub param: Value,
}

/// Equality filter split into scalar values, matched with `=`, and array
/// values, matched with `IN`.
struct Filter {
    eq: Map<String, Value>,
    any: Map<String, Value>,
}

struct TableSql<'a> {
    table: &'a TableDefinition,
    relation: String,
}

impl<'a> TableSql<'a> {
    fn new(schema_name: &str, table: &'a TableDefinition) -> Self {
        TableSql {
            table,
            relation: qualified(schema_name, &table.original_name),
        }
    }

    fn column(&self, name: &str) -> Result<&'a str, StoreError> {
        self.table
            .column(name)
            .map(|column| column.original_name.as_str())
            .ok_or_else(|| StoreError::UnknownColumn {
                table: self.table.name.clone(),
                column: name.to_string(),
            })
    }

    fn columns(&self, names: &[String]) -> Result<Vec<&'a str>, StoreError> {
        names.iter().map(|name| self.column(name)).collect()
    }

    fn populate_record(&self, param: &str) -> String {
        format!("jsonb_populate_record(NULL::{}, {})", self.relation, param)
    }

    fn populate_recordset(&self, param: &str) -> String {
        format!("jsonb_populate_recordset(NULL::{}, {})", self.relation, param)
    }

    fn filter(&self, value: Value) -> Result<Filter, StoreError> {
        let object = into_object(value, "filter")?;
        let mut filter = Filter {
            eq: Map::new(),
            any: Map::new(),
        };
        for (name, value) in object {
            self.column(&name)?;
            match value {
                Value::Array(_) => filter.any.insert(name, value),
                _ => filter.eq.insert(name, value),
            };
        }
        Ok(filter)
    }

    /// `FROM` items and `WHERE` conditions matching rows aliased `t` against
    /// the filter stored under `$1->'eq'` and `$1->'any'`.
    fn where_clause(&self, filter: &Filter) -> Result<(Vec<String>, Vec<String>), StoreError> {
        let mut from = Vec::new();
        let mut conditions = Vec::new();
        if !filter.eq.is_empty() {
            from.push(format!("{} AS f", self.populate_record("$1->'eq'")));
            for name in filter.eq.keys() {
                let column = self.column(name)?;
                conditions.push(format!("t.{c} = f.{c}", c = column));
            }
        }
        for name in filter.any.keys() {
            let column = self.column(name)?;
            let key = quote_literal(name);
            conditions.push(format!(
                "t.{c} IN (SELECT ({record}).{c} FROM jsonb_array_elements($1->'any'->{key}) AS e)",
                c = column,
                record = self.populate_record(&format!("jsonb_build_object({}, e)", key)),
                key = key,
            ));
        }
        Ok((from, conditions))
    }

    fn rows(&self, value: Value) -> Result<(Vec<Value>, Vec<String>), StoreError> {
        let rows = match value {
            Value::Array(rows) => rows,
            row @ Value::Object(_) => vec![row],
            other => {
                return Err(StoreError::InvalidInput(format!(
                    "expected an object or an array of objects, got {}",
                    other
                )))
            }
        };
        let mut names: Vec<String> = Vec::new();
        for row in &rows {
            let object = row.as_object().ok_or_else(|| {
                StoreError::InvalidInput(format!("expected an object, got {}", row))
            })?;
            for name in object.keys() {
                self.column(name)?;
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        Ok((rows, names))
    }

    fn insert_prefix(&self, names: &[String]) -> Result<String, StoreError> {
        let columns = self.columns(names)?.join(", ");
        Ok(format!(
            "INSERT INTO {} AS t ({c}) SELECT {c} FROM {}",
            self.relation,
            self.populate_recordset("$1->'rows'"),
            c = columns
        ))
    }
}

fn into_object(value: Value, what: &str) -> Result<Map<String, Value>, StoreError> {
    match value {
        Value::Object(object) => Ok(object),
        Value::Null => Ok(Map::new()),
        other => Err(StoreError::InvalidInput(format!(
            "{} must be an object, got {}",
            what, other
        ))),
    }
}

fn filter_param(filter: Filter) -> Map<String, Value> {
    let mut param = Map::new();
    param.insert("eq".to_string(), Value::Object(filter.eq));
    param.insert("any".to_string(), Value::Object(filter.any));
    param
}

const RETURNING: &str = "RETURNING to_jsonb(t) AS data";

impl DmlQuery {
    /// `None` when there is nothing to insert.
    pub fn insert(schema_name: &str, table: &TableDefinition, rows: Value) -> Result<Option<Self>, StoreError> {
        let sql = TableSql::new(schema_name, table);
        let (rows, names) = sql.rows(rows)?;
        if rows.is_empty() || names.is_empty() {
            return Ok(None);
        }
        Ok(Some(DmlQuery {
            sql: format!("{} {}", sql.insert_prefix(&names)?, RETURNING),
            param: json!({ "rows": rows }),
        }))
    }

    pub fn select(
        schema_name: &str,
        table: &TableDefinition,
        filter: Value,
        limit: Option<u64>,
    ) -> Result<Self, StoreError> {
        let sql = TableSql::new(schema_name, table);
        let filter = sql.filter(filter)?;
        let (from, conditions) = sql.where_clause(&filter)?;
        let mut text = format!("SELECT to_jsonb(t) AS data FROM {} AS t", sql.relation);
        for item in from {
            text.push_str(", ");
            text.push_str(&item);
        }
        if !conditions.is_empty() {
            text.push_str(" WHERE ");
            text.push_str(&conditions.join(" AND "));
        }
        if let Some(limit) = limit {
            text.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(DmlQuery {
            sql: text,
            param: Value::Object(filter_param(filter)),
        })
    }

    pub fn update(
        schema_name: &str,
        table: &TableDefinition,
        filter: Value,
        values: Value,
    ) -> Result<Self, StoreError> {
        let sql = TableSql::new(schema_name, table);
        let filter = sql.filter(filter)?;
        if filter.eq.is_empty() && filter.any.is_empty() {
            return Err(StoreError::EmptyFilter("update"));
        }
        let values = into_object(values, "update values")?;
        if values.is_empty() {
            return Err(StoreError::InvalidInput("update requires at least one column to set".to_string()));
        }
        let assignments = values
            .keys()
            .map(|name| sql.column(name).map(|c| format!("{c} = s.{c}", c = c)))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        let (mut from, conditions) = sql.where_clause(&filter)?;
        from.insert(0, format!("{} AS s", sql.populate_record("$1->'set'")));
        let mut param = filter_param(filter);
        param.insert("set".to_string(), Value::Object(values));
        Ok(DmlQuery {
            sql: format!(
                "UPDATE {} AS t SET {} FROM {} WHERE {} {}",
                sql.relation,
                assignments,
                from.join(", "),
                conditions.join(" AND "),
                RETURNING
            ),
            param: Value::Object(param),
        })
    }

    /// `None` when there is nothing to insert. Without update columns a
    /// conflicting row is left untouched.
    pub fn upsert(
        schema_name: &str,
        table: &TableDefinition,
        rows: Value,
        conflict_columns: &[String],
        update_columns: &[String],
    ) -> Result<Option<Self>, StoreError> {
        let sql = TableSql::new(schema_name, table);
        let (rows, names) = sql.rows(rows)?;
        if rows.is_empty() || names.is_empty() {
            return Ok(None);
        }
        if conflict_columns.is_empty() {
            return Err(StoreError::InvalidInput("upsert requires conflict columns".to_string()));
        }
        let conflict = sql.columns(conflict_columns)?.join(", ");
        let action = if update_columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let assignments = sql
                .columns(update_columns)?
                .into_iter()
                .map(|c| format!("{c} = excluded.{c}", c = c))
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {}", assignments)
        };
        Ok(Some(DmlQuery {
            sql: format!(
                "{} ON CONFLICT ({}) {} {}",
                sql.insert_prefix(&names)?,
                conflict,
                action,
                RETURNING
            ),
            param: json!({ "rows": rows }),
        }))
    }

    pub fn delete(schema_name: &str, table: &TableDefinition, filter: Value) -> Result<Self, StoreError> {
        let sql = TableSql::new(schema_name, table);
        let filter = sql.filter(filter)?;
        if filter.eq.is_empty() && filter.any.is_empty() {
            return Err(StoreError::EmptyFilter("delete"));
        }
        let (from, conditions) = sql.where_clause(&filter)?;
        let using = if from.is_empty() {
            String::new()
        } else {
            format!(" USING {}", from.join(", "))
        };
        Ok(DmlQuery {
            sql: format!(
                "DELETE FROM {} AS t{} WHERE {} {}",
                sql.relation,
                using,
                conditions.join(" AND "),
                RETURNING
            ),
            param: Value::Object(filter_param(filter)),
        })
    }
}

/// Runs data access statements against the tables of one tenant schema.
#[derive(Clone)]
pub struct DmlHandler {
    schema_name: String,
    definition: Arc<SchemaDefinition>,
    executor: Arc<dyn PgExecutor>,
}

impl DmlHandler {
    pub fn new(
        schema_name: impl Into<String>,
        definition: Arc<SchemaDefinition>,
        executor: Arc<dyn PgExecutor>,
    ) -> Self {
        DmlHandler {
            schema_name: schema_name.into(),
            definition,
            executor,
        }
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    fn table(&self, table_name: &str) -> Result<&TableDefinition, StoreError> {
        self.definition
            .table(table_name)
            .ok_or_else(|| StoreError::UnknownTable(table_name.to_string()))
    }

    fn run(&self, query: Option<DmlQuery>) -> Result<Vec<Value>, StoreError> {
        match query {
            Some(query) => {
                log::debug!("{}", query.sql);
                self.executor.query(&query.sql, &query.param)
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn insert(&self, table_name: &str, rows: Value) -> Result<Vec<Value>, StoreError> {
        let table = self.table(table_name)?;
        self.run(DmlQuery::insert(&self.schema_name, table, rows)?)
    }

    pub fn select(
        &self,
        table_name: &str,
        filter: Value,
        limit: Option<u64>,
    ) -> Result<Vec<Value>, StoreError> {
        let table = self.table(table_name)?;
        self.run(Some(DmlQuery::select(&self.schema_name, table, filter, limit)?))
    }

    pub fn update(&self, table_name: &str, filter: Value, values: Value) -> Result<Vec<Value>, StoreError> {
        let table = self.table(table_name)?;
        self.run(Some(DmlQuery::update(&self.schema_name, table, filter, values)?))
    }

    pub fn upsert(
        &self,
        table_name: &str,
        rows: Value,
        conflict_columns: &[String],
        update_columns: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        let table = self.table(table_name)?;
        self.run(DmlQuery::upsert(
            &self.schema_name,
            table,
            rows,
            conflict_columns,
            update_columns,
        )?)
    }

    pub fn delete(&self, table_name: &str, filter: Value) -> Result<Vec<Value>, StoreError> {
        let table = self.table(table_name)?;
        self.run(Some(DmlQuery::delete(&self.schema_name, table, filter)?))
    }
}
