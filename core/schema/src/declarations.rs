//! TypeScript-like declarations of the `context` object for editor tooling.
use crate::definition::TableDefinition;
use crate::introspector::SchemaDefinition;
use std::fmt::Write;

fn field_name(name: &str) -> String {
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
    {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\\\""))
    }
}

fn write_table(out: &mut String, table: &TableDefinition) -> std::fmt::Result {
    let accessor = &table.accessor_name;

    writeln!(out, "declare interface {}Query {{", accessor)?;
    for column in &table.columns {
        let ts_type = column.ts_type();
        writeln!(out, "  {}?: {} | {}[];", field_name(&column.name), ts_type, ts_type)?;
    }
    writeln!(out, "}}\n")?;

    writeln!(out, "declare interface {}Item {{", accessor)?;
    for column in &table.columns {
        let nullable = if column.nullable() { " | null" } else { "" };
        writeln!(out, "  {}?: {}{};", field_name(&column.name), column.ts_type(), nullable)?;
    }
    writeln!(out, "}}\n")?;

    writeln!(out, "declare interface {}Input {{", accessor)?;
    for column in &table.columns {
        let optional = if column.required() { "" } else { "?" };
        let nullable = if column.nullable() { " | null" } else { "" };
        writeln!(
            out,
            "  {}{}: {}{};",
            field_name(&column.name),
            optional,
            column.ts_type(),
            nullable
        )?;
    }
    writeln!(out, "}}\n")?;

    writeln!(
        out,
        "type {a}Fields = keyof {a}Item;\n",
        a = accessor
    )
}

fn write_db_entry(out: &mut String, table: &TableDefinition) -> std::fmt::Result {
    writeln!(
        out,
        "    {a}: {{
      insert: (objectsToInsert: {a}Input | {a}Input[]) => Promise<{a}Item[]>;
      select: (filterObj: {a}Query, limit?: number) => Promise<{a}Item[]>;
      update: (filterObj: {a}Query, updateObj: {a}Item) => Promise<{a}Item[]>;
      upsert: (objectsToInsert: {a}Input | {a}Input[], conflictColumns: {a}Fields[], updateColumns: {a}Fields[]) => Promise<{a}Item[]>;
      delete: (filterObj: {a}Query) => Promise<{a}Item[]>;
    }};",
        a = table.accessor_name
    )
}

/// Declarations for every table plus the `context` constant exposing them.
pub fn generate_declarations(schema: &SchemaDefinition) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_declarations(&mut out, schema);
    out
}

fn write_declarations(out: &mut String, schema: &SchemaDefinition) -> std::fmt::Result {
    for table in schema.tables() {
        write_table(out, table)?;
    }
    writeln!(out, "declare const context: {{")?;
    writeln!(
        out,
        "  graphql: (operation: string, variables?: Record<string, any>) => Promise<any>;"
    )?;
    writeln!(out, "  log: (...log: any[]) => Promise<void>;")?;
    writeln!(
        out,
        "  fetchFromSocialApi: (path: string, options?: any) => Promise<any>;"
    )?;
    writeln!(out, "  db: {{")?;
    for table in schema.tables() {
        write_db_entry(out, table)?;
    }
    writeln!(out, "  }};")?;
    writeln!(out, "}};")
}
