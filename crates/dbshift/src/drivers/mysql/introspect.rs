//! MySQL schema introspection over `information_schema`.

use mysql_async::prelude::*;
use mysql_async::Conn;

use crate::catalog::{
    ColumnSchema, ConstraintSchema, IndexSchema, InstanceUser, TableSchema, ViewSchema,
};
use crate::error::{DriverError, Result};

/// Quote a MySQL identifier with backticks.
fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// All databases of the instance as (name, character set, collation).
pub(super) async fn get_databases(conn: &mut Conn) -> Result<Vec<(String, String, String)>> {
    let rows: Vec<(String, String, String)> = conn
        .query(
            "SELECT SCHEMA_NAME, DEFAULT_CHARACTER_SET_NAME, DEFAULT_COLLATION_NAME \
             FROM information_schema.SCHEMATA",
        )
        .await?;
    Ok(rows)
}

/// Instance logins with a role-attribute projection mirroring the PostgreSQL
/// driver's output.
pub(super) async fn get_user_list(conn: &mut Conn) -> Result<Vec<InstanceUser>> {
    let rows: Vec<(String, String, String, String)> = conn
        .query(
            "SELECT User, Host, Super_priv, Create_priv FROM mysql.user \
             WHERE User NOT LIKE 'mysql.%' ORDER BY User, Host",
        )
        .await?;

    Ok(rows
        .into_iter()
        .map(|(user, host, super_priv, create_priv)| {
            let grant = match (super_priv.as_str(), create_priv.as_str()) {
                ("Y", "Y") => "superuser, create database",
                ("Y", _) => "superuser",
                (_, "Y") => "create database",
                _ => "",
            };
            InstanceUser {
                name: format!("'{user}'@'{host}'"),
                grant: grant.to_string(),
            }
        })
        .collect())
}

/// Tables of one database with columns, constraints and indices attached.
pub(super) async fn get_tables(conn: &mut Conn, database: &str) -> Result<Vec<TableSchema>> {
    let rows: Vec<(String, Option<u64>, Option<u64>, Option<u64>, Option<String>)> = conn
        .exec(
            "SELECT TABLE_NAME, TABLE_ROWS, DATA_LENGTH, INDEX_LENGTH, TABLE_COMMENT \
             FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'",
            (database,),
        )
        .await?;

    let mut tables = Vec::with_capacity(rows.len());
    for (name, row_count, data_size, index_size, comment) in rows {
        let mut table = TableSchema {
            schema: database.to_string(),
            name,
            owner: String::new(),
            comment: comment.unwrap_or_default(),
            row_count: row_count.unwrap_or(0) as i64,
            data_size: data_size.unwrap_or(0) as i64,
            index_size: index_size.unwrap_or(0) as i64,
            ..Default::default()
        };
        table.columns = get_table_columns(conn, database, &table.name).await?;
        table.constraints = get_table_constraints(conn, database, &table.name).await?;
        table.indices = get_table_indices(conn, database, &table.name).await?;
        tables.push(table);
    }
    Ok(tables)
}

async fn get_table_columns(
    conn: &mut Conn,
    database: &str,
    table: &str,
) -> Result<Vec<ColumnSchema>> {
    let rows: Vec<(
        String,
        u32,
        String,
        Option<u64>,
        Option<String>,
        String,
        Option<String>,
        Option<String>,
    )> = conn
        .exec(
            "SELECT COLUMN_NAME, ORDINAL_POSITION, COLUMN_TYPE, CHARACTER_MAXIMUM_LENGTH, \
             COLUMN_DEFAULT, IS_NULLABLE, COLLATION_NAME, COLUMN_COMMENT \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .await?;

    Ok(rows
        .into_iter()
        .map(
            |(name, position, data_type, max_length, default, nullable, collation, comment)| {
                ColumnSchema {
                    name,
                    position: position as i32,
                    data_type,
                    character_max_length: max_length.map(|l| l.to_string()).unwrap_or_default(),
                    default: default.unwrap_or_default(),
                    nullable: nullable == "YES",
                    collation: collation.unwrap_or_default(),
                    comment: comment.unwrap_or_default(),
                }
            },
        )
        .collect())
}

async fn get_table_constraints(
    conn: &mut Conn,
    database: &str,
    table: &str,
) -> Result<Vec<ConstraintSchema>> {
    let rows: Vec<(String, String)> = conn
        .exec(
            "SELECT CONSTRAINT_NAME, CONSTRAINT_TYPE \
             FROM information_schema.TABLE_CONSTRAINTS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
            (database, table),
        )
        .await?;

    Ok(rows
        .into_iter()
        .map(|(name, definition)| ConstraintSchema {
            schema: database.to_string(),
            table: table.to_string(),
            name,
            definition,
        })
        .collect())
}

async fn get_table_indices(
    conn: &mut Conn,
    database: &str,
    table: &str,
) -> Result<Vec<IndexSchema>> {
    let rows: Vec<(String, u32, u32, String, String, Option<String>)> = conn
        .exec(
            "SELECT INDEX_NAME, NON_UNIQUE, SEQ_IN_INDEX, COLUMN_NAME, INDEX_TYPE, INDEX_COMMENT \
             FROM information_schema.STATISTICS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
            (database, table),
        )
        .await?;

    let mut indices: Vec<IndexSchema> = Vec::new();
    for (name, non_unique, _seq, column, index_type, comment) in rows {
        match indices.last_mut() {
            Some(last) if last.name == name => {
                last.column_expressions.push(column);
            }
            _ => {
                indices.push(IndexSchema {
                    schema: database.to_string(),
                    name,
                    table: table.to_string(),
                    statement: String::new(),
                    unique: non_unique == 0,
                    method: index_type.to_lowercase(),
                    column_expressions: vec![column],
                    comment: comment.unwrap_or_default(),
                });
            }
        }
    }

    for index in &mut indices {
        index.statement = format!(
            "CREATE {}INDEX {} ON {}.{} USING {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            quote_ident(&index.name),
            quote_ident(database),
            quote_ident(table),
            index.method,
            index.column_expressions.join(", "),
        );
    }
    Ok(indices)
}

/// Views of one database.
pub(super) async fn get_views(conn: &mut Conn, database: &str) -> Result<Vec<ViewSchema>> {
    let rows: Vec<(String, Option<String>)> = conn
        .exec(
            "SELECT TABLE_NAME, VIEW_DEFINITION FROM information_schema.VIEWS \
             WHERE TABLE_SCHEMA = ?",
            (database,),
        )
        .await?;

    rows.into_iter()
        .map(|(name, definition)| {
            let definition = definition.ok_or_else(|| {
                DriverError::Internal(format!(
                    "database {database:?} view {name:?} has an empty definition; \
                     check that proper privileges have been granted"
                ))
            })?;
            Ok(ViewSchema {
                schema: database.to_string(),
                name,
                definition,
                comment: String::new(),
            })
        })
        .collect()
}

/// Render one database as a SQL dump.
///
/// Objects are emitted in deterministic name order; with `schema_only` off,
/// table rows follow each table's DDL as `INSERT` statements.
pub(super) async fn dump_database_text(
    conn: &mut Conn,
    database: &str,
    schema_only: bool,
    include_use_directive: bool,
) -> Result<String> {
    let mut out = String::new();
    if include_use_directive {
        out.push_str(&format!("USE {};\n\n", quote_ident(database)));
    }

    let mut table_names: Vec<String> = conn
        .exec(
            "SELECT TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'",
            (database,),
        )
        .await?;
    table_names.sort();

    for table in &table_names {
        let row: Option<mysql_async::Row> = conn
            .query_first(format!(
                "SHOW CREATE TABLE {}.{}",
                quote_ident(database),
                quote_ident(table)
            ))
            .await?;
        let ddl: String = row
            .and_then(|r| r.get(1))
            .ok_or_else(|| DriverError::Internal(format!("no DDL for table {table:?}")))?;
        out.push_str(&format!(
            "--\n-- Table structure for {}\n--\n{};\n\n",
            quote_ident(table),
            ddl
        ));

        if !schema_only {
            dump_table_rows(conn, database, table, &mut out).await?;
        }
    }

    let mut view_names: Vec<String> = conn
        .exec(
            "SELECT TABLE_NAME FROM information_schema.VIEWS WHERE TABLE_SCHEMA = ?",
            (database,),
        )
        .await?;
    view_names.sort();

    for view in &view_names {
        let row: Option<mysql_async::Row> = conn
            .query_first(format!(
                "SHOW CREATE VIEW {}.{}",
                quote_ident(database),
                quote_ident(view)
            ))
            .await?;
        let ddl: String = row
            .and_then(|r| r.get(1))
            .ok_or_else(|| DriverError::Internal(format!("no DDL for view {view:?}")))?;
        out.push_str(&format!(
            "--\n-- View structure for {}\n--\n{};\n\n",
            quote_ident(view),
            ddl
        ));
    }

    Ok(out)
}

async fn dump_table_rows(
    conn: &mut Conn,
    database: &str,
    table: &str,
    out: &mut String,
) -> Result<()> {
    let rows: Vec<mysql_async::Row> = conn
        .query(format!(
            "SELECT * FROM {}.{}",
            quote_ident(database),
            quote_ident(table)
        ))
        .await?;
    if rows.is_empty() {
        return Ok(());
    }

    for row in rows {
        let values: Vec<String> = row
            .unwrap()
            .into_iter()
            .map(|value| value.as_sql(false))
            .collect();
        out.push_str(&format!(
            "INSERT INTO {} VALUES ({});\n",
            quote_ident(table),
            values.join(", ")
        ));
    }
    out.push('\n');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backtick_quoting_doubles_embedded_backticks() {
        assert_eq!(quote_ident("plain"), "`plain`");
        assert_eq!(quote_ident("odd`name"), "`odd``name`");
    }
}
