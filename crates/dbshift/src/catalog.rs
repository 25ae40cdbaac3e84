//! Normalized schema catalog model.
//!
//! Pure data, materialized on every sync and discarded afterwards. Constraints
//! are keyed on schema-qualified table names and resolved by lookup so the
//! catalog stays an acyclic value.

use serde::{Deserialize, Serialize};

/// An engine login with its human-readable role attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUser {
    pub name: String,
    /// e.g. `"superuser, create database"`.
    pub grant: String,
}

/// One database of an instance, with its contained objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub name: String,
    pub character_set: String,
    pub collation: String,
    pub tables: Vec<TableSchema>,
    pub views: Vec<ViewSchema>,
    pub extensions: Vec<ExtensionSchema>,
}

/// A table with its columns, constraints and indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Schema namespace inside the database (e.g. `public`).
    pub schema: String,
    pub name: String,
    pub owner: String,
    pub comment: String,
    pub row_count: i64,
    /// On-disk size of the table in bytes.
    pub data_size: i64,
    /// On-disk size of the table's indices in bytes.
    pub index_size: i64,
    /// Columns in ordinal order.
    pub columns: Vec<ColumnSchema>,
    pub constraints: Vec<ConstraintSchema>,
    pub indices: Vec<IndexSchema>,
}

impl TableSchema {
    /// Schema-qualified name, the catalog-wide lookup key.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// A single table column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// 1-based ordinal position.
    pub position: i32,
    /// Engine data type, with user-defined types expanded to
    /// `<udt_schema>.<udt_name>` and arrays to their element type.
    pub data_type: String,
    pub character_max_length: String,
    pub default: String,
    pub nullable: bool,
    pub collation: String,
    pub comment: String,
}

impl ColumnSchema {
    /// Render the column as a DDL fragment.
    pub fn statement(&self) -> String {
        let mut s = format!("{} {}", self.name, self.data_type);
        if !self.character_max_length.is_empty() {
            s.push_str(&format!("({})", self.character_max_length));
        }
        if !self.nullable {
            s.push_str(" NOT NULL");
        }
        if !self.default.is_empty() {
            s.push_str(&format!(" DEFAULT {}", self.default));
        }
        s
    }
}

/// A table constraint, keyed by its owning table's qualified name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSchema {
    pub schema: String,
    pub table: String,
    pub name: String,
    /// Engine-rendered constraint definition.
    pub definition: String,
}

impl ConstraintSchema {
    /// Qualified name of the table this constraint belongs to.
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Render the constraint as an `ALTER TABLE` statement.
    pub fn statement(&self) -> String {
        format!(
            "ALTER TABLE ONLY {}.{}\n    ADD CONSTRAINT {} {};\n",
            self.schema, self.table, self.name, self.definition
        )
    }
}

/// An index with its parsed definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub schema: String,
    pub name: String,
    pub table: String,
    /// The original DDL statement.
    pub statement: String,
    pub unique: bool,
    /// Access method, e.g. `btree`.
    pub method: String,
    /// Ordered column expressions recovered from the DDL.
    pub column_expressions: Vec<String>,
    pub comment: String,
}

impl IndexSchema {
    /// Render the index DDL for a dump.
    pub fn dump_statement(&self) -> String {
        format!(
            "--\n-- Index structure for {}.{}\n--\n{};\n\n",
            self.schema, self.name, self.statement
        )
    }
}

/// A view with its definition text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewSchema {
    pub schema: String,
    pub name: String,
    pub definition: String,
    pub comment: String,
}

impl ViewSchema {
    /// Render the view as a `CREATE VIEW` statement for a dump.
    pub fn dump_statement(&self) -> String {
        format!(
            "--\n-- View structure for {}.{}\n--\nCREATE VIEW {}.{} AS\n{}\n\n",
            self.schema, self.name, self.schema, self.name, self.definition
        )
    }
}

/// An installed engine extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionSchema {
    pub name: String,
    pub version: String,
    pub schema: String,
    pub description: String,
}

impl DatabaseSchema {
    /// Sort every contained list into the deterministic dump order.
    ///
    /// Tables by (schema, name); columns by ordinal position; constraints and
    /// indices by name; views by (schema, name); extensions by name.
    pub fn normalize(&mut self) {
        self.tables
            .sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));
        for table in &mut self.tables {
            table.columns.sort_by_key(|c| c.position);
            table.constraints.sort_by(|a, b| a.name.cmp(&b.name));
            table.indices.sort_by(|a, b| a.name.cmp(&b.name));
        }
        self.views
            .sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));
        self.extensions.sort_by(|a, b| a.name.cmp(&b.name));
    }
}
