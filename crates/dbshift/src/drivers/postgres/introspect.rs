//! PostgreSQL schema introspection.
//!
//! Reconstructs the normalized catalog for one database from the system
//! catalogs, inside a single read transaction.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tokio_postgres::Transaction;

use crate::catalog::{
    ColumnSchema, ConstraintSchema, ExtensionSchema, IndexSchema, TableSchema, ViewSchema,
};
use crate::error::{DriverError, Result};

use super::keywords::quote_identifier;

/// Collect all tables of the current database, with columns and constraints
/// attached.
pub(super) async fn get_tables(txn: &Transaction<'_>) -> Result<Vec<TableSchema>> {
    let mut constraints = get_table_constraints(txn).await?;

    let query = "SELECT tbl.schemaname, tbl.tablename, tbl.tableowner, \
                 pg_table_size(c.oid), pg_indexes_size(c.oid) \
                 FROM pg_catalog.pg_tables tbl \
                 JOIN pg_catalog.pg_class c \
                 ON tbl.schemaname = c.relnamespace::regnamespace::text AND tbl.tablename = c.relname \
                 WHERE tbl.schemaname NOT IN ('pg_catalog', 'information_schema')";
    let rows = txn.query(query, &[]).await?;

    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        let mut table = TableSchema {
            schema: row.get(0),
            name: row.get(1),
            owner: row.get(2),
            data_size: row.get(3),
            index_size: row.get(4),
            ..Default::default()
        };
        table.constraints = constraints.remove(&table.qualified_name()).unwrap_or_default();
        tables.push(table);
    }

    for table in &mut tables {
        let qualified = format!(
            "{}.{}",
            quote_identifier(&table.schema),
            quote_identifier(&table.name)
        );

        let count_row = txn
            .query_one(&format!("SELECT COUNT(1) FROM {qualified}"), &[])
            .await?;
        table.row_count = count_row.get(0);

        let comment_row = txn
            .query_one(
                &format!("SELECT obj_description('{qualified}'::regclass)"),
                &[],
            )
            .await?;
        table.comment = comment_row.get::<_, Option<String>>(0).unwrap_or_default();

        table.columns = get_table_columns(txn, &table.schema, &table.name).await?;
    }

    Ok(tables)
}

/// Columns of one table, with user-defined and array types expanded.
async fn get_table_columns(
    txn: &Transaction<'_>,
    schema: &str,
    table: &str,
) -> Result<Vec<ColumnSchema>> {
    let query = "\
        SELECT
            cols.column_name::text,
            cols.data_type::text,
            cols.ordinal_position::int4,
            cols.character_maximum_length::text,
            cols.column_default::text,
            cols.is_nullable::text,
            cols.collation_name::text,
            cols.udt_schema::text,
            cols.udt_name::text,
            pg_catalog.col_description(
                (quote_ident(cols.table_schema) || '.' || quote_ident(cols.table_name))::regclass,
                cols.ordinal_position::int
            ) AS column_comment
        FROM information_schema.columns AS cols
        WHERE cols.table_schema = $1 AND cols.table_name = $2";
    let rows = txn.query(query, &[&schema, &table]).await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let data_type: String = row.get(1);
        let udt_schema: Option<String> = row.get(7);
        let udt_name: Option<String> = row.get(8);
        let is_nullable: String = row.get(5);

        let data_type = match data_type.as_str() {
            "USER-DEFINED" => format!(
                "{}.{}",
                udt_schema.unwrap_or_default(),
                udt_name.unwrap_or_default()
            ),
            "ARRAY" => udt_name.unwrap_or_default(),
            _ => data_type,
        };

        columns.push(ColumnSchema {
            name: row.get(0),
            position: row.get(2),
            data_type,
            character_max_length: row.get::<_, Option<String>>(3).unwrap_or_default(),
            default: row.get::<_, Option<String>>(4).unwrap_or_default(),
            nullable: parse_yes_no(&is_nullable)?,
            collation: row.get::<_, Option<String>>(6).unwrap_or_default(),
            comment: row.get::<_, Option<String>>(9).unwrap_or_default(),
        });
    }
    Ok(columns)
}

fn parse_yes_no(s: &str) -> Result<bool> {
    match s {
        "YES" => Ok(true),
        "NO" => Ok(false),
        other => Err(DriverError::Internal(format!(
            "unrecognized is_nullable value {other:?}"
        ))),
    }
}

/// All table constraints of the current database, keyed by the owning table's
/// qualified name.
async fn get_table_constraints(
    txn: &Transaction<'_>,
) -> Result<HashMap<String, Vec<ConstraintSchema>>> {
    let query = "SELECT n.nspname, conrelid::regclass::text, conname, pg_get_constraintdef(c.oid) \
                 FROM pg_constraint c \
                 JOIN pg_namespace n ON n.oid = c.connamespace \
                 WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')";
    let rows = txn.query(query, &[]).await?;

    let mut map: HashMap<String, Vec<ConstraintSchema>> = HashMap::new();
    for row in rows {
        let schema: String = row.get(0);
        let mut table: String = row.get(1);
        // regclass renders non-search-path tables as schema.table.
        if let Some(idx) = table.find('.') {
            table = table[idx + 1..].to_string();
        }
        let constraint = ConstraintSchema {
            schema,
            table: table.trim_matches('"').to_string(),
            name: row.get(2),
            definition: row.get(3),
        };
        map.entry(constraint.table_key()).or_default().push(constraint);
    }
    Ok(map)
}

/// All views of the current database.
pub(super) async fn get_views(txn: &Transaction<'_>) -> Result<Vec<ViewSchema>> {
    let query = "SELECT table_schema::text, table_name::text, view_definition::text \
                 FROM information_schema.views \
                 WHERE table_schema NOT IN ('pg_catalog', 'information_schema')";
    let rows = txn.query(query, &[]).await?;

    let mut views = Vec::with_capacity(rows.len());
    for row in rows {
        let schema: String = row.get(0);
        let name: String = row.get(1);
        let definition: Option<String> = row.get(2);
        // A NULL definition means the connected role lacks privileges on the
        // view; surfacing that beats syncing an empty definition.
        let definition = definition.ok_or_else(|| {
            DriverError::Internal(format!(
                "schema {schema:?} view {name:?} has an empty definition; \
                 check that proper privileges have been granted"
            ))
        })?;
        views.push(ViewSchema {
            schema,
            name,
            definition,
            comment: String::new(),
        });
    }

    for view in &mut views {
        let comment_row = txn
            .query_one(
                &format!(
                    "SELECT obj_description('{}.{}'::regclass)",
                    quote_identifier(&view.schema),
                    quote_identifier(&view.name)
                ),
                &[],
            )
            .await?;
        view.comment = comment_row.get::<_, Option<String>>(0).unwrap_or_default();
    }
    Ok(views)
}

/// Installed extensions of the current database.
pub(super) async fn get_extensions(txn: &Transaction<'_>) -> Result<Vec<ExtensionSchema>> {
    let query = "SELECT e.extname, e.extversion, n.nspname, c.description \
                 FROM pg_catalog.pg_extension e \
                 LEFT JOIN pg_catalog.pg_namespace n ON n.oid = e.extnamespace \
                 LEFT JOIN pg_catalog.pg_description c \
                 ON c.objoid = e.oid AND c.classoid = 'pg_catalog.pg_extension'::pg_catalog.regclass \
                 WHERE n.nspname != 'pg_catalog'";
    let rows = txn.query(query, &[]).await?;

    Ok(rows
        .into_iter()
        .map(|row| ExtensionSchema {
            name: row.get(0),
            version: row.get(1),
            schema: row.get::<_, Option<String>>(2).unwrap_or_default(),
            description: row.get::<_, Option<String>>(3).unwrap_or_default(),
        })
        .collect())
}

/// All indices of the current database, with their DDL parsed.
pub(super) async fn get_indices(txn: &Transaction<'_>) -> Result<Vec<IndexSchema>> {
    let query = "SELECT schemaname, tablename, indexname, indexdef \
                 FROM pg_indexes \
                 WHERE schemaname NOT IN ('pg_catalog', 'information_schema')";
    let rows = txn.query(query, &[]).await?;

    let mut indices = Vec::with_capacity(rows.len());
    for row in rows {
        let statement: String = row.get(3);
        let index = IndexSchema {
            schema: row.get(0),
            table: row.get(1),
            name: row.get(2),
            unique: statement.contains(" UNIQUE INDEX "),
            method: index_method(&statement),
            column_expressions: index_column_expressions(&statement)?,
            statement,
            comment: String::new(),
        };
        indices.push(index);
    }

    for index in &mut indices {
        let comment_row = txn
            .query_one(
                &format!(
                    "SELECT obj_description('{}.{}'::regclass)",
                    quote_identifier(&index.schema),
                    quote_identifier(&index.name)
                ),
                &[],
            )
            .await?;
        index.comment = comment_row.get::<_, Option<String>>(0).unwrap_or_default();
    }
    Ok(indices)
}

static USING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"USING (\w+) ").unwrap());

/// Access method of an index, recovered from its DDL.
pub(super) fn index_method(statement: &str) -> String {
    USING_RE
        .captures(statement)
        .map(|c| c[1].to_string())
        .unwrap_or_default()
}

/// Ordered column expressions of an index, recovered from the trailing
/// parenthesized group of its DDL.
///
/// Expression columns arrive as `((expr))` and are taken as one balanced
/// token; bare columns split at the first top-level comma.
pub(super) fn index_column_expressions(statement: &str) -> Result<Vec<String>> {
    let open = statement.find('(');
    let close = statement.rfind(')');
    let (open, close) = match (open, close) {
        (Some(o), Some(c)) if o < c => (o, c),
        _ => {
            return Err(DriverError::Internal(format!(
                "invalid index statement {statement:?}"
            )))
        }
    };
    let mut rest = statement[open + 1..close].trim();

    let mut expressions = Vec::new();
    while !rest.is_empty() {
        let token = if rest.starts_with("((") {
            balanced_prefix(rest).ok_or_else(|| {
                DriverError::Internal(format!("invalid index statement {statement:?}"))
            })?
        } else {
            match rest.find(',') {
                Some(i) => &rest[..i],
                None => rest,
            }
        };
        if token.is_empty() {
            return Err(DriverError::Internal(format!(
                "invalid index statement {statement:?}"
            )));
        }
        expressions.push(token.trim().to_string());

        rest = rest[token.len()..].trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }
    Ok(expressions)
}

/// The shortest prefix of `s` whose parentheses balance out.
fn balanced_prefix(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&s[..i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_is_recovered_from_ddl() {
        assert_eq!(
            index_method("CREATE INDEX idx_a ON public.t USING btree (a)"),
            "btree"
        );
        assert_eq!(
            index_method("CREATE INDEX idx_g ON public.t USING gin (payload)"),
            "gin"
        );
        assert_eq!(index_method("CREATE INDEX idx ON t (a)"), "");
    }

    #[test]
    fn bare_columns_split_on_commas() {
        let cols =
            index_column_expressions("CREATE INDEX idx ON public.t USING btree (a, b, c)").unwrap();
        assert_eq!(cols, vec!["a", "b", "c"]);
    }

    #[test]
    fn expression_column_is_one_balanced_token() {
        let cols = index_column_expressions(
            "CREATE INDEX idx ON public.t USING btree (((price * qty)), name)",
        )
        .unwrap();
        assert_eq!(cols, vec!["((price * qty))", "name"]);
    }

    #[test]
    fn function_call_column_keeps_inner_commas_out_of_bare_split() {
        let cols = index_column_expressions(
            "CREATE UNIQUE INDEX idx ON public.t USING btree (((lower(name))))",
        )
        .unwrap();
        assert_eq!(cols, vec!["((lower(name)))"]);
    }

    #[test]
    fn missing_group_is_an_error() {
        assert!(index_column_expressions("CREATE INDEX idx ON t").is_err());
    }
}
