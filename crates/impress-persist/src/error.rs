//! Error types for impress-persist

use thiserror::Error;

use crate::value::ValueType;

/// Result type alias for persistence operations
pub type Result<T> = std::result::Result<T, PersistError>;

/// Main error type returned by adapters and the typed layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    /// The schema is malformed (raised while building it)
    #[error("Schema validation error: {0}")]
    Schema(#[from] SchemaError),

    /// A mutation broke a key, uniqueness or reference constraint
    #[error("Constraint violation: {0}")]
    Constraint(#[from] ConstraintViolation),

    /// A strict-mode update or delete matched no rows
    #[error("Not found: {0}")]
    NotFound(String),

    /// A value does not conform to its column's declared type
    #[error("Type mismatch on {table}.{column}: expected {expected}, got {found}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: ValueType,
        found: &'static str,
    },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column {table}.{column}")]
    UnknownColumn { table: String, column: String },

    /// The backend could not be reached, initialized, or was closed
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// A row could not be converted to or from its model type
    #[error("Row codec error for table {table}: {message}")]
    Codec { table: String, message: String },
}

/// Schema construction errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Empty name for {0}")]
    EmptyName(&'static str),

    #[error("Duplicate table name: {0}")]
    DuplicateTable(String),

    #[error("Duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    #[error("Table '{0}' has no primary key column")]
    MissingPrimaryKey(String),

    #[error("Table '{table}' declares more than one primary key: {columns:?}")]
    MultiplePrimaryKeys { table: String, columns: Vec<String> },

    #[error("Invalid primary key {table}.{column}: {reason}")]
    InvalidPrimaryKey {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Default for {table}.{column} must be {expected}, got {found}")]
    InvalidDefault {
        table: String,
        column: String,
        expected: ValueType,
        found: &'static str,
    },

    #[error("{table}.{column} references missing {target_table}.{target_column}")]
    DanglingReference {
        table: String,
        column: String,
        target_table: String,
        target_column: String,
    },

    #[error("{table}.{column} ({found}) references {target_table}.{target_column} ({expected})")]
    ReferenceTypeMismatch {
        table: String,
        column: String,
        target_table: String,
        target_column: String,
        expected: ValueType,
        found: ValueType,
    },

    #[error("{table}.{column} references {target_table}.{target_column}, which is neither primary key nor unique")]
    ReferenceNotUnique {
        table: String,
        column: String,
        target_table: String,
        target_column: String,
    },

    #[error("Foreign key cycle: {}", .0.join(" -> "))]
    ReferenceCycle(Vec<String>),
}

/// Constraint violations raised by a backend while committing a mutation.
/// The offending mutation is never partially applied.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintViolation {
    #[error("Duplicate primary key {key} in table '{table}'")]
    DuplicatePrimaryKey { table: String, key: String },

    #[error("Unique constraint on {table}.{column} violated by {value}")]
    Unique {
        table: String,
        column: String,
        value: String,
    },

    #[error("{table}.{column} = {value} has no matching {target_table}.{target_column}")]
    ForeignKey {
        table: String,
        column: String,
        value: String,
        target_table: String,
        target_column: String,
    },

    #[error("{table}.{column} is not nullable")]
    NotNull { table: String, column: String },

    #[error("Primary key {table}.{column} cannot be changed")]
    PrimaryKeyImmutable { table: String, column: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PersistError::from(ConstraintViolation::DuplicatePrimaryKey {
            table: "users".into(),
            key: "\"u1\"".into(),
        });
        assert!(err.to_string().contains("Duplicate primary key"));

        let err = PersistError::from(SchemaError::ReferenceCycle(vec![
            "a".into(),
            "b".into(),
            "a".into(),
        ]));
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn type_mismatch_names_column() {
        let err = PersistError::TypeMismatch {
            table: "users".into(),
            column: "name".into(),
            expected: ValueType::String,
            found: "number",
        };
        let msg = err.to_string();
        assert!(msg.contains("users.name"));
        assert!(msg.contains("expected string"));
    }
}
