//! In-process evaluation of predicates, sort keys and pagination.
//!
//! The memory adapter is built on these functions; other backends can use
//! them to post-process rows they cannot filter natively.

use std::cmp::Ordering;

use crate::query::{Patch, Predicate, SortDescriptor};
use crate::value::{Row, Value};

/// Evaluate a predicate against a row. `And`/`Or` short-circuit left to right.
pub fn matches(pred: &Predicate, row: &Row) -> bool {
    match pred {
        Predicate::Eq(col, lit) => row.get(col).is_some_and(|v| v.same_as(lit)),
        Predicate::Neq(col, lit) => row.get(col).is_some_and(|v| !v.same_as(lit)),
        Predicate::Lt(col, lit) => ordering(row, col, lit).is_some_and(Ordering::is_lt),
        Predicate::Lte(col, lit) => ordering(row, col, lit).is_some_and(Ordering::is_le),
        Predicate::Gt(col, lit) => ordering(row, col, lit).is_some_and(Ordering::is_gt),
        Predicate::Gte(col, lit) => ordering(row, col, lit).is_some_and(Ordering::is_ge),
        Predicate::In(col, lits) => row
            .get(col)
            .is_some_and(|v| lits.iter().any(|lit| v.same_as(lit))),
        Predicate::And(preds) => preds.iter().all(|p| matches(p, row)),
        Predicate::Or(preds) => preds.iter().any(|p| matches(p, row)),
        Predicate::Not(inner) => !matches(inner, row),
    }
}

/// A missing filter matches everything.
pub fn matches_filter(filter: Option<&Predicate>, row: &Row) -> bool {
    filter.map_or(true, |p| matches(p, row))
}

fn ordering(row: &Row, column: &str, literal: &Value) -> Option<Ordering> {
    row.get(column)?.compare(literal)
}

/// Lexicographic comparison over `sort`, then ascending by primary key.
pub fn compare_rows(a: &Row, b: &Row, sort: &[SortDescriptor], primary_key: &str) -> Ordering {
    for key in sort {
        let ord = cell(a, &key.column).total_cmp(cell(b, &key.column));
        let ord = if key.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    cell(a, primary_key).total_cmp(cell(b, primary_key))
}

fn cell<'a>(row: &'a Row, column: &str) -> &'a Value {
    const NULL: &Value = &Value::Null;
    row.get(column).unwrap_or(NULL)
}

pub fn sort_rows(rows: &mut [Row], sort: &[SortDescriptor], primary_key: &str) {
    rows.sort_by(|a, b| compare_rows(a, b, sort, primary_key));
}

/// Skip `offset` rows, then keep at most `limit`.
pub fn paginate<T>(rows: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    rows.into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// The row that results from applying `patch`.
pub fn apply_patch(row: &Row, patch: &Patch) -> Row {
    let mut next = row.clone();
    for (column, value) in patch.iter() {
        next.insert(column.clone(), value.clone());
    }
    next
}
