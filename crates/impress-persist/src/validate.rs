//! Schema checks applied by the typed layer before anything reaches a backend.

use crate::error::{ConstraintViolation, PersistError, Result};
use crate::query::{JoinSpec, Patch, Predicate, SortDescriptor};
use crate::schema::{ColumnDef, Schema, TableDef};
use crate::value::{Row, Value};

fn unknown_column(table: &TableDef, column: &str) -> PersistError {
    PersistError::UnknownColumn {
        table: table.name().to_string(),
        column: column.to_string(),
    }
}

fn lookup<'a>(table: &'a TableDef, column: &str) -> Result<&'a ColumnDef> {
    table.column(column).ok_or_else(|| unknown_column(table, column))
}

/// Check one value against its column: type, or nullability for null.
pub fn check_value(table: &TableDef, column: &ColumnDef, value: &Value) -> Result<()> {
    if value.is_null() {
        if column.nullable {
            return Ok(());
        }
        return Err(ConstraintViolation::NotNull {
            table: table.name().to_string(),
            column: column.name.clone(),
        }
        .into());
    }
    if value.conforms_to(column.value_type) {
        Ok(())
    } else {
        Err(PersistError::TypeMismatch {
            table: table.name().to_string(),
            column: column.name.clone(),
            expected: column.value_type,
            found: value.type_name(),
        })
    }
}

/// Validate a row for insertion and complete it: omitted columns take their
/// default, or null when nullable.
pub fn prepare_insert(table: &TableDef, mut row: Row) -> Result<Row> {
    for (name, _) in row.iter() {
        lookup(table, name)?;
    }
    for column in table.columns() {
        match row.get(&column.name) {
            Some(value) => check_value(table, column, value)?,
            None => {
                if let Some(default) = &column.default {
                    row.insert(column.name.clone(), default.clone());
                } else if column.nullable {
                    row.insert(column.name.clone(), Value::Null);
                } else {
                    return Err(ConstraintViolation::NotNull {
                        table: table.name().to_string(),
                        column: column.name.clone(),
                    }
                    .into());
                }
            }
        }
    }
    Ok(row)
}

/// Validate a patch. The primary key is immutable once inserted.
pub fn check_patch(table: &TableDef, patch: &Patch) -> Result<()> {
    for (name, value) in patch.iter() {
        let column = lookup(table, name)?;
        if column.primary_key {
            return Err(ConstraintViolation::PrimaryKeyImmutable {
                table: table.name().to_string(),
                column: name.clone(),
            }
            .into());
        }
        check_value(table, column, value)?;
    }
    Ok(())
}

/// Every literal must match its column's type; null literals are only
/// allowed against nullable columns.
pub fn check_predicate(table: &TableDef, pred: &Predicate) -> Result<()> {
    match pred {
        Predicate::Eq(col, lit)
        | Predicate::Neq(col, lit)
        | Predicate::Lt(col, lit)
        | Predicate::Lte(col, lit)
        | Predicate::Gt(col, lit)
        | Predicate::Gte(col, lit) => check_literal(table, col, lit),
        Predicate::In(col, lits) => lits.iter().try_for_each(|lit| check_literal(table, col, lit)),
        Predicate::And(preds) | Predicate::Or(preds) => {
            preds.iter().try_for_each(|p| check_predicate(table, p))
        }
        Predicate::Not(inner) => check_predicate(table, inner),
    }
}

fn check_literal(table: &TableDef, column: &str, literal: &Value) -> Result<()> {
    let def = lookup(table, column)?;
    let fits = if literal.is_null() {
        def.nullable
    } else {
        literal.conforms_to(def.value_type)
    };
    if fits {
        Ok(())
    } else {
        Err(PersistError::TypeMismatch {
            table: table.name().to_string(),
            column: column.to_string(),
            expected: def.value_type,
            found: literal.type_name(),
        })
    }
}

pub fn check_sort(table: &TableDef, sort: &[SortDescriptor]) -> Result<()> {
    sort.iter()
        .try_for_each(|key| lookup(table, &key.column).map(|_| ()))
}

/// Resolve a join's target table and check both columns share a type.
pub fn check_join<'a>(schema: &'a Schema, table: &TableDef, join: &JoinSpec) -> Result<&'a TableDef> {
    let target = schema
        .table(&join.table)
        .ok_or_else(|| PersistError::UnknownTable(join.table.clone()))?;
    let local = lookup(table, &join.local_column)?;
    let foreign = lookup(target, &join.foreign_column)?;
    if local.value_type != foreign.value_type {
        return Err(PersistError::TypeMismatch {
            table: target.name().to_string(),
            column: foreign.name.clone(),
            expected: local.value_type,
            found: foreign.value_type.name(),
        });
    }
    Ok(target)
}
