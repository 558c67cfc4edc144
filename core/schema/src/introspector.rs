use crate::definition::{sanitize_accessor_name, ColumnDefinition, ColumnType, TableDefinition, TableDefinitionNames};
use sqlparser::ast::{
    AlterTableOperation, ColumnDef, ColumnOption, Ident, ObjectName, Statement, TableConstraint,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("Failed to parse schema: {0}")]
    Parse(String),
    #[error("Schema does not have any tables. There should be at least one table.")]
    NoTables,
    #[error("Table {0} already exists in schema. Table names must be unique. Quotes are not allowed as a differentiator between table names.")]
    DuplicateTable(String),
    #[error("Column {column} is defined twice in table {table}")]
    DuplicateColumn { table: String, column: String },
    #[error("Table {0} is not defined in schema")]
    UnknownTable(String),
    #[error("Column {column} does not exist in table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("Tables {0} map to the same accessor name {1}")]
    AccessorCollision(String, String),
}

/// Name as Postgres stores it: unquoted identifiers fold to lower case.
fn canonical(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

fn table_ident(name: &ObjectName) -> Option<&Ident> {
    name.0.last()
}

/// Tables and columns declared by an indexer schema, in declaration order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemaDefinition {
    tables: Vec<TableDefinition>,
}

impl SchemaDefinition {
    /// Parses the CREATE TABLE and ALTER TABLE statements of `sql`. Any other
    /// statement is skipped.
    pub fn parse(sql: &str) -> Result<Self, SchemaError> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|err| SchemaError::Parse(err.to_string()))?;
        let mut schema = SchemaDefinition::default();
        for statement in statements {
            match statement {
                Statement::CreateTable {
                    name,
                    columns,
                    constraints,
                    ..
                } => schema.create_table(&name, &columns, &constraints)?,
                Statement::AlterTable {
                    name, operations, ..
                } => {
                    for operation in &operations {
                        schema.alter_table(&name, operation)?;
                    }
                }
                _ => {}
            }
        }
        if schema.tables.is_empty() {
            return Err(SchemaError::NoTables);
        }
        Ok(schema)
    }

    pub fn tables(&self) -> &[TableDefinition] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|table| table.name == name)
    }

    fn table_mut(&mut self, name: &ObjectName) -> Result<&mut TableDefinition, SchemaError> {
        let canonical_name = table_ident(name).map(canonical).unwrap_or_default();
        self.tables
            .iter_mut()
            .find(|table| table.name == canonical_name)
            .ok_or(SchemaError::UnknownTable(canonical_name))
    }

    pub fn table_definition_names(&self) -> HashMap<String, TableDefinitionNames> {
        self.tables
            .iter()
            .map(|table| (table.name.clone(), table.names()))
            .collect()
    }

    /// Fails when two tables end up under the same accessor name, which
    /// would make one of them unreachable from indexer code.
    pub fn check_accessor_names(&self) -> Result<(), SchemaError> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for table in &self.tables {
            if let Some(other) = seen.insert(&table.accessor_name, &table.name) {
                return Err(SchemaError::AccessorCollision(
                    format!("{}, {}", other, table.name),
                    table.accessor_name.clone(),
                ));
            }
        }
        Ok(())
    }

    pub fn column_types(&self) -> BTreeMap<String, BTreeMap<String, ColumnType>> {
        self.tables
            .iter()
            .map(|table| {
                let columns = table
                    .columns
                    .iter()
                    .map(|column| (column.name.clone(), ColumnType::from(column)))
                    .collect();
                (table.name.clone(), columns)
            })
            .collect()
    }

    fn create_table(
        &mut self,
        name: &ObjectName,
        columns: &[ColumnDef],
        constraints: &[TableConstraint],
    ) -> Result<(), SchemaError> {
        let ident = match table_ident(name) {
            Some(ident) => ident,
            None => return Err(SchemaError::Parse(format!("table without name: {}", name))),
        };
        let table_name = canonical(ident);
        if self.table(&table_name).is_some() {
            return Err(SchemaError::DuplicateTable(table_name));
        }
        let mut table = TableDefinition {
            name: table_name,
            original_name: ident.to_string(),
            accessor_name: sanitize_accessor_name(&ident.value),
            columns: Vec::with_capacity(columns.len()),
        };
        for column in columns {
            add_column(&mut table, column)?;
        }
        for constraint in constraints {
            add_constraint(&mut table, constraint)?;
        }
        self.tables.push(table);
        Ok(())
    }

    fn alter_table(
        &mut self,
        name: &ObjectName,
        operation: &AlterTableOperation,
    ) -> Result<(), SchemaError> {
        match operation {
            AlterTableOperation::AddColumn { column_def, .. } => {
                add_column(self.table_mut(name)?, column_def)
            }
            AlterTableOperation::AddConstraint(constraint) => {
                add_constraint(self.table_mut(name)?, constraint)
            }
            AlterTableOperation::DropColumn { column_name, .. } => {
                let table = self.table_mut(name)?;
                let column = canonical(column_name);
                let before = table.columns.len();
                table.columns.retain(|c| c.name != column);
                if table.columns.len() == before {
                    return Err(SchemaError::UnknownColumn {
                        table: table.name.clone(),
                        column,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn add_column(table: &mut TableDefinition, column: &ColumnDef) -> Result<(), SchemaError> {
    let name = canonical(&column.name);
    if table.column(&name).is_some() {
        return Err(SchemaError::DuplicateColumn {
            table: table.name.clone(),
            column: name,
        });
    }
    let mut definition = ColumnDefinition {
        name,
        original_name: column.name.to_string(),
        data_type: column.data_type.to_string(),
        not_null: false,
        primary_key: false,
        has_default: false,
    };
    for option in &column.options {
        match &option.option {
            ColumnOption::Null => definition.not_null = false,
            ColumnOption::NotNull => definition.not_null = true,
            ColumnOption::Unique { is_primary } if *is_primary => definition.primary_key = true,
            ColumnOption::Default(_) | ColumnOption::Generated { .. } => {
                definition.has_default = true
            }
            _ => {}
        }
    }
    table.columns.push(definition);
    Ok(())
}

fn add_constraint(table: &mut TableDefinition, constraint: &TableConstraint) -> Result<(), SchemaError> {
    if let TableConstraint::Unique {
        columns,
        is_primary: true,
        ..
    } = constraint
    {
        for ident in columns {
            let name = canonical(ident);
            let table_name = table.name.clone();
            let column = table
                .column_mut(&name)
                .ok_or(SchemaError::UnknownColumn {
                    table: table_name,
                    column: name,
                })?;
            column.primary_key = true;
        }
    }
    Ok(())
}

/// Checks only what is needed to decide whether the schema can back an
/// indexer, without keeping the parsed result.
pub fn validate_schema(sql: &str) -> Result<(), SchemaError> {
    SchemaDefinition::parse(sql).map(|_| ())
}

/// Table names of `sql` as Postgres will store them.
pub fn table_names(sql: &str) -> Result<HashSet<String>, SchemaError> {
    Ok(SchemaDefinition::parse(sql)?
        .tables
        .into_iter()
        .map(|table| table.name)
        .collect())
}
