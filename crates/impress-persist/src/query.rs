use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::Col;
use crate::schema::ColumnValue;
use crate::value::Value;

/// Filter predicate over a table's columns.
///
/// An empty `And` matches every row; an empty `Or` matches none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    // Column comparisons
    Eq(String, Value),
    Neq(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),

    // Logical
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Matches every row.
    pub fn all() -> Self {
        Predicate::And(Vec::new())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut preds) => {
                preds.push(other);
                Predicate::And(preds)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut preds) => {
                preds.push(other);
                Predicate::Or(preds)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    /// Column names referenced anywhere in the tree.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Eq(c, _)
            | Predicate::Neq(c, _)
            | Predicate::Lt(c, _)
            | Predicate::Lte(c, _)
            | Predicate::Gt(c, _)
            | Predicate::Gte(c, _)
            | Predicate::In(c, _) => out.push(c),
            Predicate::And(preds) | Predicate::Or(preds) => {
                preds.iter().for_each(|p| p.collect_columns(out))
            }
            Predicate::Not(inner) => inner.collect_columns(out),
        }
    }
}

impl std::ops::Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

/// Sort key for query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub column: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Inner join: driving rows without a match are dropped.
    Required,
    /// Left join: driving rows without a match are kept with the slot absent.
    Optional,
}

/// Attach rows of `table` whose `foreign_column` equals the driving row's
/// `local_column`, under `alias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub alias: String,
    pub table: String,
    pub local_column: String,
    pub foreign_column: String,
    pub kind: JoinKind,
}

impl JoinSpec {
    pub fn required(
        alias: impl Into<String>,
        table: impl Into<String>,
        local_column: impl Into<String>,
        foreign_column: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            table: table.into(),
            local_column: local_column.into(),
            foreign_column: foreign_column.into(),
            kind: JoinKind::Required,
        }
    }

    pub fn optional(
        alias: impl Into<String>,
        table: impl Into<String>,
        local_column: impl Into<String>,
        foreign_column: impl Into<String>,
    ) -> Self {
        Self {
            kind: JoinKind::Optional,
            ..Self::required(alias, table, local_column, foreign_column)
        }
    }
}

/// A query against one table: filter, joins, sort, then offset/limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filter: Option<Predicate>,
    pub sort: Vec<SortDescriptor>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub joins: Vec<JoinSpec>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter; combined with any existing filter by `and`.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn sort_by(mut self, sort: SortDescriptor) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }
}

/// Partial row applied by `update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(BTreeMap<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: ColumnValue>(mut self, column: &Col<T>, value: impl Into<T>) -> Self {
        self.0
            .insert(column.name().to_string(), value.into().into_value());
        self
    }

    pub fn set_value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_query_is_empty() {
        let q = Query::default();
        assert!(q.filter.is_none());
        assert!(q.sort.is_empty());
        assert!(q.limit.is_none());
        assert!(q.offset.is_none());
        assert!(q.joins.is_empty());
    }

    #[test]
    fn query_serde_round_trip() {
        let q = Query::new()
            .filter(Predicate::Eq("conversation_id".into(), Value::from("c1")))
            .filter(Predicate::Or(vec![
                Predicate::Gt("sent_at".into(), Value::from(10)),
                !Predicate::Eq("deleted".into(), Value::from(true)),
            ]))
            .sort_by(SortDescriptor::desc("sent_at"))
            .join(JoinSpec::optional("author", "members", "author_id", "id"))
            .limit(50)
            .offset(0);
        let json = serde_json::to_string_pretty(&q).unwrap();
        let back: Query = serde_json::from_str(&json).unwrap();
        assert_eq!(q, back);
        assert!(matches!(back.filter, Some(Predicate::And(ref p)) if p.len() == 2));
    }

    #[test]
    fn predicate_columns() {
        let pred = Predicate::And(vec![
            Predicate::Not(Box::new(Predicate::Eq("a".into(), Value::Null))),
            Predicate::Or(vec![
                Predicate::In("b".into(), vec![]),
                Predicate::Lte("c".into(), Value::from(1)),
            ]),
        ]);
        assert_eq!(pred.columns(), vec!["a", "b", "c"]);
    }

    #[test]
    fn patch_from_typed_columns() {
        const NAME: Col<String> = Col::new("name");
        let bio: Col<Option<String>> = Col::named("bio");
        let patch = Patch::new().set(&NAME, "Bob").set(&bio, None::<String>);
        assert_eq!(patch.get("name"), Some(&Value::from("Bob")));
        assert_eq!(patch.get("bio"), Some(&Value::Null));
    }
}
