//! Statement text for the mirror table in each supported dialect.

use crate::error::{Result, StoreError};
use crate::model::{FieldKind, Schema};

pub(crate) const ID_COLUMN: &str = "id";
pub(crate) const CREATED_AT_COLUMN: &str = "CreatedAt";
const DEFAULT_TABLE: &str = "sheet_data";
const MAX_IDENTIFIER: usize = 64;

/// Database flavour, derived from the connection URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        match scheme.as_str() {
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "sqlite" => Ok(Dialect::Sqlite),
            _ => Err(StoreError::Validation(format!(
                "unsupported database URL scheme '{scheme}'"
            ))),
        }
    }

    fn column_type(self, kind: FieldKind) -> &'static str {
        match (self, kind) {
            (Dialect::MySql, FieldKind::Date) => "DATE",
            (Dialect::MySql, FieldKind::Text) => "VARCHAR(255)",
            (Dialect::Sqlite, FieldKind::Date | FieldKind::Text) => "TEXT",
            (_, FieldKind::Integer) => "BIGINT",
        }
    }

    fn id_definition(self) -> &'static str {
        match self {
            Dialect::MySql => "BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    fn created_at_definition(self) -> &'static str {
        match self {
            Dialect::MySql => "TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
            Dialect::Sqlite => "TEXT DEFAULT CURRENT_TIMESTAMP",
        }
    }

    /// Quotes a text literal for a dump file.
    pub(crate) fn literal(self, text: &str) -> String {
        let escaped = match self {
            Dialect::MySql => text.replace('\\', "\\\\").replace('\'', "''"),
            Dialect::Sqlite => text.replace('\'', "''"),
        };
        format!("'{escaped}'")
    }
}

/// Keeps letters, digits and `_`; an empty result becomes `sheet_data` and
/// long names are cut to 64 characters.
pub fn sanitize_table_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(MAX_IDENTIFIER)
        .collect();
    if cleaned.is_empty() {
        DEFAULT_TABLE.to_string()
    } else {
        cleaned
    }
}

/// Checks that every schema field can be used as a column name as is.
pub(crate) fn validate_columns(schema: &Schema) -> Result<()> {
    if schema.is_empty() {
        return Err(StoreError::Validation("schema has no fields".into()));
    }
    for name in schema.names() {
        let valid = !name.is_empty()
            && name.len() <= MAX_IDENTIFIER
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(StoreError::Validation(format!(
                "field '{name}' is not a valid column name"
            )));
        }
        if name.eq_ignore_ascii_case(ID_COLUMN) || name.eq_ignore_ascii_case(CREATED_AT_COLUMN) {
            return Err(StoreError::Validation(format!(
                "field '{name}' collides with a reserved column"
            )));
        }
    }
    Ok(())
}

pub(crate) fn quote(identifier: &str) -> String {
    format!("`{identifier}`")
}

pub(crate) fn create_table(dialect: Dialect, table: &str, schema: &Schema) -> String {
    let mut columns = vec![format!("{} {}", quote(ID_COLUMN), dialect.id_definition())];
    columns.extend(
        schema
            .fields()
            .iter()
            .map(|field| format!("{} {}", quote(&field.name), dialect.column_type(field.kind))),
    );
    columns.push(format!(
        "{} {}",
        quote(CREATED_AT_COLUMN),
        dialect.created_at_definition()
    ));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(table),
        columns.join(", ")
    )
}

pub(crate) fn insert(table: &str, schema: &Schema) -> String {
    let columns: Vec<String> = schema.names().map(quote).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        quote(table),
        columns.join(", ")
    )
}

pub(crate) fn update(table: &str, schema: &Schema) -> String {
    let assignments: Vec<String> = schema
        .names()
        .map(|name| format!("{} = ?", quote(name)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote(table),
        assignments.join(", "),
        quote(ID_COLUMN)
    )
}

pub(crate) fn delete(table: &str) -> String {
    format!("DELETE FROM {} WHERE {} = ?", quote(table), quote(ID_COLUMN))
}

pub(crate) fn count(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote(table))
}

/// Selects the id followed by every field, dates rendered as `YYYY-MM-DD` text.
pub(crate) fn select_all(dialect: Dialect, table: &str, schema: &Schema) -> String {
    let mut columns = vec![quote(ID_COLUMN)];
    columns.extend(schema.fields().iter().map(|field| {
        match (dialect, field.kind) {
            (Dialect::MySql, FieldKind::Date) => format!(
                "CAST(DATE_FORMAT({}, '%Y-%m-%d') AS CHAR) AS {}",
                quote(&field.name),
                quote(&field.name)
            ),
            _ => quote(&field.name),
        }
    }));
    format!(
        "SELECT {} FROM {} ORDER BY {} ASC",
        columns.join(", "),
        quote(table),
        quote(ID_COLUMN)
    )
}

/// Empties the table. MySQL also resets the auto-increment counter.
pub(crate) fn clear_table(dialect: Dialect, table: &str) -> String {
    match dialect {
        Dialect::MySql => format!("TRUNCATE TABLE {}", quote(table)),
        Dialect::Sqlite => format!("DELETE FROM {}", quote(table)),
    }
}

/// Server version and current database name, in that order.
pub(crate) fn server_info(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::MySql => "SELECT VERSION(), DATABASE()",
        Dialect::Sqlite => "SELECT sqlite_version(), 'main'",
    }
}

/// Leading text shared by every row statement a dump of `table` contains.
pub(crate) fn insert_prefix(table: &str) -> String {
    format!("INSERT INTO {} ", quote(table))
}

pub(crate) fn create_database(name: &str) -> String {
    format!(
        "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
        quote(name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Field;

    fn date_qty() -> Schema {
        Schema::new(vec![
            Field::new("Date", FieldKind::Date),
            Field::new("Qty", FieldKind::Integer),
        ])
    }

    #[test]
    fn dialect_follows_the_url_scheme() {
        assert_eq!(Dialect::from_url("mysql://root@localhost/db").unwrap(), Dialect::MySql);
        assert_eq!(Dialect::from_url("sqlite://mirror.db").unwrap(), Dialect::Sqlite);
        assert_eq!(Dialect::from_url("sqlite::memory:").unwrap(), Dialect::Sqlite);
        assert!(Dialect::from_url("postgres://localhost").is_err());
        assert!(Dialect::from_url("no scheme").is_err());
    }

    #[test]
    fn table_names_are_sanitised() {
        assert_eq!(sanitize_table_name("Data 1"), "Data1");
        assert_eq!(sanitize_table_name("prod-entries_2024"), "prodentries_2024");
        assert_eq!(sanitize_table_name("!!!"), "sheet_data");
        assert_eq!(sanitize_table_name(&"x".repeat(80)).len(), 64);
    }

    #[test]
    fn column_types_depend_on_dialect() {
        let mysql = create_table(Dialect::MySql, "t", &date_qty());
        assert!(mysql.contains("`Date` DATE"));
        assert!(mysql.contains("`Qty` BIGINT"));
        assert!(mysql.contains("AUTO_INCREMENT"));

        let sqlite = create_table(Dialect::Sqlite, "t", &date_qty());
        assert!(sqlite.contains("`Date` TEXT"));
        assert!(sqlite.contains("AUTOINCREMENT"));
    }

    #[test]
    fn statements_bind_in_schema_order() {
        assert_eq!(
            insert("t", &date_qty()),
            "INSERT INTO `t` (`Date`, `Qty`) VALUES (?, ?)"
        );
        assert_eq!(
            update("t", &date_qty()),
            "UPDATE `t` SET `Date` = ?, `Qty` = ? WHERE `id` = ?"
        );
    }

    #[test]
    fn reserved_or_odd_field_names_are_rejected() {
        let odd = Schema::new(vec![Field::new("Qty; DROP", FieldKind::Integer)]);
        assert!(validate_columns(&odd).is_err());
        let reserved = Schema::new(vec![Field::new("ID", FieldKind::Integer)]);
        assert!(validate_columns(&reserved).is_err());
        assert!(validate_columns(&Schema::production_entry()).is_ok());
    }

    #[test]
    fn literals_escape_quotes() {
        assert_eq!(Dialect::Sqlite.literal("it's"), "'it''s'");
        assert_eq!(Dialect::MySql.literal(r"a\b'c"), r"'a\\b''c'");
    }

    #[test]
    fn clearing_depends_on_dialect() {
        assert_eq!(clear_table(Dialect::MySql, "t"), "TRUNCATE TABLE `t`");
        assert_eq!(clear_table(Dialect::Sqlite, "t"), "DELETE FROM `t`");
    }
}
