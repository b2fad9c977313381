//! Declarative table and column definitions.
//!
//! Columns are declared with typed constructors (`string`, `number`, ...)
//! whose type parameter is the Rust value type of the column, so nullability
//! and literal types are tracked by the compiler:
//!
//! ```
//! use impress_persist::schema::{number, schema, string, table, Column, InferColumnType};
//!
//! let id = string("id").primary_key();
//! let bio = string("bio").nullable();
//! let _: InferColumnType<Column<Option<String>>> = Some(String::from("hi"));
//!
//! let users = table("users", [id.into(), bio.into(), number("age").default(0.0).into()]).unwrap();
//! let schema = schema([users]).unwrap();
//! assert!(schema.table("users").is_some());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::SchemaError;
use crate::model::Col;
use crate::value::{Value, ValueType};

/// Maps a Rust type to the column type that stores it.
pub trait ColumnValue: Sized + Send + Sync + 'static {
    const TYPE: ValueType;
    const NULLABLE: bool = false;

    fn into_value(self) -> Value;
}

impl ColumnValue for String {
    const TYPE: ValueType = ValueType::String;

    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl ColumnValue for f64 {
    const TYPE: ValueType = ValueType::Number;

    fn into_value(self) -> Value {
        Value::Number(self)
    }
}

impl ColumnValue for bool {
    const TYPE: ValueType = ValueType::Boolean;

    fn into_value(self) -> Value {
        Value::Boolean(self)
    }
}

impl ColumnValue for Vec<u8> {
    const TYPE: ValueType = ValueType::Bytes;

    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
}

impl ColumnValue for DateTime<Utc> {
    const TYPE: ValueType = ValueType::Timestamp;

    fn into_value(self) -> Value {
        Value::Timestamp(self)
    }
}

impl ColumnValue for serde_json::Value {
    const TYPE: ValueType = ValueType::Json;

    fn into_value(self) -> Value {
        Value::Json(self)
    }
}

impl<T: ColumnValue> ColumnValue for Option<T> {
    const TYPE: ValueType = T::TYPE;
    const NULLABLE: bool = true;

    fn into_value(self) -> Value {
        self.map(ColumnValue::into_value).unwrap_or(Value::Null)
    }
}

/// Anything carrying a statically known column value type.
pub trait TypedColumn {
    type Value: ColumnValue;
}

/// The Rust value type of a column descriptor, including nullability.
pub type InferColumnType<C> = <C as TypedColumn>::Value;

/// Foreign-key target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

/// Runtime description of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub value_type: ValueType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub default: Option<Value>,
    pub references: Option<ForeignKey>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            nullable: false,
            primary_key: false,
            unique: false,
            default: None,
            references: None,
        }
    }
}

/// Typed column builder. `T` is the Rust type of the column's values.
#[derive(Debug)]
pub struct Column<T> {
    def: ColumnDef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Column<T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: ColumnValue> Column<T> {
    fn new(name: impl Into<String>) -> Self {
        let mut def = ColumnDef::new(name, T::TYPE);
        def.nullable = T::NULLABLE;
        Self {
            def,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &ColumnDef {
        &self.def
    }

    /// Allow null. The column's value type becomes `Option<T>`.
    pub fn nullable(self) -> Column<Option<T>> {
        let mut def = self.def;
        def.nullable = true;
        Column {
            def,
            _marker: PhantomData,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.def.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.def.unique = true;
        self
    }

    /// Value stored when an inserted row omits this column.
    pub fn default(mut self, value: T) -> Self {
        self.def.default = Some(value.into_value());
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.def.references = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    /// A typed handle for building predicates, sort keys and patches.
    pub fn col(&self) -> Col<T> {
        Col::named(self.def.name.clone())
    }
}

impl<T: ColumnValue> TypedColumn for Column<T> {
    type Value = T;
}

impl<T> From<Column<T>> for ColumnDef {
    fn from(column: Column<T>) -> Self {
        column.def
    }
}

pub fn string(name: impl Into<String>) -> Column<String> {
    Column::new(name)
}

pub fn number(name: impl Into<String>) -> Column<f64> {
    Column::new(name)
}

pub fn boolean(name: impl Into<String>) -> Column<bool> {
    Column::new(name)
}

pub fn bytes(name: impl Into<String>) -> Column<Vec<u8>> {
    Column::new(name)
}

pub fn timestamp(name: impl Into<String>) -> Column<DateTime<Utc>> {
    Column::new(name)
}

pub fn json(name: impl Into<String>) -> Column<serde_json::Value> {
    Column::new(name)
}

/// A validated table: name, ordered columns, exactly one primary key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDef {
    name: String,
    columns: Vec<ColumnDef>,
    #[serde(skip)]
    primary_key: usize,
}

impl TableDef {
    pub fn builder(name: impl Into<String>) -> TableBuilder {
        TableBuilder {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> &ColumnDef {
        &self.columns[self.primary_key]
    }
}

/// Incremental form of [`table`].
#[derive(Debug, Clone)]
pub struct TableBuilder {
    name: String,
    columns: Vec<ColumnDef>,
}

impl TableBuilder {
    pub fn column(mut self, column: impl Into<ColumnDef>) -> Self {
        self.columns.push(column.into());
        self
    }

    pub fn build(self) -> Result<TableDef, SchemaError> {
        table(self.name, self.columns)
    }
}

/// Build a table descriptor.
///
/// Fails if no column (or more than one) is the primary key, if a column
/// name repeats, if a default does not fit its column, or if a reference to
/// this same table names a missing column. References to other tables are
/// resolved by [`schema`].
pub fn table(
    name: impl Into<String>,
    columns: impl IntoIterator<Item = ColumnDef>,
) -> Result<TableDef, SchemaError> {
    let name = name.into();
    if name.is_empty() {
        return Err(SchemaError::EmptyName("table"));
    }
    let columns: Vec<ColumnDef> = columns.into_iter().collect();

    let mut seen = HashSet::new();
    for column in &columns {
        if column.name.is_empty() {
            return Err(SchemaError::EmptyName("column"));
        }
        if !seen.insert(column.name.as_str()) {
            return Err(SchemaError::DuplicateColumn {
                table: name.clone(),
                column: column.name.clone(),
            });
        }
        if let Some(default) = &column.default {
            let fits = if default.is_null() {
                column.nullable
            } else {
                default.conforms_to(column.value_type)
            };
            if !fits {
                return Err(SchemaError::InvalidDefault {
                    table: name.clone(),
                    column: column.name.clone(),
                    expected: column.value_type,
                    found: default.type_name(),
                });
            }
        }
    }

    let keys: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.primary_key)
        .map(|(i, _)| i)
        .collect();
    let primary_key = match keys.as_slice() {
        [] => return Err(SchemaError::MissingPrimaryKey(name)),
        [only] => *only,
        many => {
            return Err(SchemaError::MultiplePrimaryKeys {
                table: name,
                columns: many.iter().map(|i| columns[*i].name.clone()).collect(),
            })
        }
    };
    let pk = &columns[primary_key];
    if pk.nullable {
        return Err(SchemaError::InvalidPrimaryKey {
            table: name,
            column: pk.name.clone(),
            reason: "primary key cannot be nullable".into(),
        });
    }
    if pk.value_type == ValueType::Json {
        return Err(SchemaError::InvalidPrimaryKey {
            table: name,
            column: pk.name.clone(),
            reason: "json columns cannot be primary keys".into(),
        });
    }

    for column in &columns {
        if let Some(fk) = &column.references {
            if fk.table == name && !seen.contains(fk.column.as_str()) {
                return Err(SchemaError::DanglingReference {
                    table: name,
                    column: column.name.clone(),
                    target_table: fk.table.clone(),
                    target_column: fk.column.clone(),
                });
            }
        }
    }

    Ok(TableDef {
        name,
        columns,
        primary_key,
    })
}

/// An immutable set of tables keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    tables: BTreeMap<String, Arc<TableDef>>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&Arc<TableDef>> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableDef>> {
        self.tables.values()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Aggregate tables into a schema.
///
/// Fails on duplicate table names, references to missing tables or columns,
/// references whose type differs from the target, references to a column
/// that is neither primary key nor unique, and reference cycles (a column
/// referencing its own table counts as a cycle).
pub fn schema(tables: impl IntoIterator<Item = TableDef>) -> Result<Schema, SchemaError> {
    let mut by_name = BTreeMap::new();
    for table in tables {
        if by_name.contains_key(&table.name) {
            return Err(SchemaError::DuplicateTable(table.name));
        }
        by_name.insert(table.name.clone(), Arc::new(table));
    }

    for table in by_name.values() {
        for column in &table.columns {
            let Some(fk) = &column.references else {
                continue;
            };
            let dangling = || SchemaError::DanglingReference {
                table: table.name.clone(),
                column: column.name.clone(),
                target_table: fk.table.clone(),
                target_column: fk.column.clone(),
            };
            let target = by_name
                .get(&fk.table)
                .and_then(|t| t.column(&fk.column))
                .ok_or_else(dangling)?;
            if target.value_type != column.value_type {
                return Err(SchemaError::ReferenceTypeMismatch {
                    table: table.name.clone(),
                    column: column.name.clone(),
                    target_table: fk.table.clone(),
                    target_column: fk.column.clone(),
                    expected: target.value_type,
                    found: column.value_type,
                });
            }
            if !target.primary_key && !target.unique {
                return Err(SchemaError::ReferenceNotUnique {
                    table: table.name.clone(),
                    column: column.name.clone(),
                    target_table: fk.table.clone(),
                    target_column: fk.column.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_reference_cycle(&by_name) {
        return Err(SchemaError::ReferenceCycle(cycle));
    }

    Ok(Schema { tables: by_name })
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search over table → referenced-table edges.
fn find_reference_cycle(tables: &BTreeMap<String, Arc<TableDef>>) -> Option<Vec<String>> {
    fn visit(
        name: &str,
        tables: &BTreeMap<String, Arc<TableDef>>,
        marks: &mut BTreeMap<String, Mark>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|t| t == name).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(name.to_string(), Mark::Visiting);
        path.push(name.to_string());
        if let Some(table) = tables.get(name) {
            for fk in table.columns.iter().filter_map(|c| c.references.as_ref()) {
                if let Some(cycle) = visit(&fk.table, tables, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(name.to_string(), Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for name in tables.keys() {
        let mut path = Vec::new();
        if let Some(cycle) = visit(name, tables, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDef {
        table(
            "users",
            [
                string("id").primary_key().into(),
                string("name").into(),
                string("email").unique().nullable().into(),
            ],
        )
        .unwrap()
    }

    fn messages() -> TableDef {
        TableDef::builder("messages")
            .column(string("id").primary_key())
            .column(string("author_id").references("users", "id"))
            .column(string("body"))
            .column(timestamp("sent_at"))
            .column(boolean("read").default(false))
            .build()
            .unwrap()
    }

    #[test]
    fn column_modifiers_are_recorded() {
        let def = ColumnDef::from(number("score").nullable().unique().default(Some(1.0)));
        assert_eq!(def.value_type, ValueType::Number);
        assert!(def.nullable);
        assert!(def.unique);
        assert_eq!(def.default, Some(Value::Number(1.0)));
        assert!(!def.primary_key);
    }

    #[test]
    fn inferred_column_types() {
        fn value_of<C: TypedColumn>(_: &C, v: InferColumnType<C>) -> Value {
            v.into_value()
        }
        let bio = string("bio").nullable();
        assert_eq!(value_of(&bio, None), Value::Null);
        let raw = bytes("blob");
        assert_eq!(value_of(&raw, vec![1, 2]), Value::Bytes(vec![1, 2]));
        let meta = json("meta");
        assert!(matches!(
            value_of(&meta, serde_json::json!({"a": 1})),
            Value::Json(_)
        ));
    }

    #[test]
    fn table_requires_primary_key() {
        let err = table("t", [string("a").into()]).unwrap_err();
        assert!(matches!(err, SchemaError::MissingPrimaryKey(_)));

        let err = table(
            "t",
            [string("a").primary_key().into(), string("b").primary_key().into()],
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::MultiplePrimaryKeys { .. }));
    }

    #[test]
    fn table_rejects_duplicate_columns() {
        let err = table(
            "t",
            [string("id").primary_key().into(), number("id").into()],
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateColumn { .. }));
    }

    #[test]
    fn table_rejects_bad_defaults() {
        let mut col = ColumnDef::new("n", ValueType::Number);
        col.default = Some(Value::from("seven"));
        let err = table("t", [string("id").primary_key().into(), col]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDefault { .. }));

        let mut col = ColumnDef::new("n", ValueType::Number);
        col.default = Some(Value::Null);
        let err = table("t", [string("id").primary_key().into(), col]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDefault { .. }));
    }

    #[test]
    fn table_rejects_invalid_primary_keys() {
        let err = table("t", [string("id").primary_key().nullable().into()]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidPrimaryKey { .. }));
        let err = table("t", [json("id").primary_key().into()]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidPrimaryKey { .. }));
    }

    #[test]
    fn table_rejects_self_reference_to_missing_column() {
        let err = table(
            "t",
            [
                string("id").primary_key().into(),
                string("parent").references("t", "nope").into(),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::DanglingReference { .. }));
    }

    #[test]
    fn schema_resolves_references() {
        let s = schema([users(), messages()]).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.table("messages").unwrap().primary_key().name, "id");
        assert_eq!(s.table_names().collect::<Vec<_>>(), vec!["messages", "users"]);
    }

    #[test]
    fn schema_rejects_duplicate_tables() {
        let err = schema([users(), users()]).unwrap_err();
        assert_eq!(err, SchemaError::DuplicateTable("users".into()));
    }

    #[test]
    fn schema_rejects_dangling_reference() {
        let err = schema([messages()]).unwrap_err();
        assert!(matches!(err, SchemaError::DanglingReference { .. }));
    }

    #[test]
    fn schema_rejects_reference_type_mismatch() {
        let t = table(
            "likes",
            [
                string("id").primary_key().into(),
                number("user").references("users", "id").into(),
            ],
        )
        .unwrap();
        let err = schema([users(), t]).unwrap_err();
        assert!(matches!(err, SchemaError::ReferenceTypeMismatch { .. }));
    }

    #[test]
    fn schema_rejects_reference_to_non_unique_column() {
        let t = table(
            "likes",
            [
                string("id").primary_key().into(),
                string("user_name").references("users", "name").into(),
            ],
        )
        .unwrap();
        let err = schema([users(), t]).unwrap_err();
        assert!(matches!(err, SchemaError::ReferenceNotUnique { .. }));
    }

    #[test]
    fn schema_rejects_reference_cycles() {
        let a = table(
            "a",
            [
                string("id").primary_key().into(),
                string("b_id").references("b", "id").into(),
            ],
        )
        .unwrap();
        let b = table(
            "b",
            [
                string("id").primary_key().into(),
                string("a_id").references("a", "id").into(),
            ],
        )
        .unwrap();
        let err = schema([a, b]).unwrap_err();
        assert_eq!(
            err,
            SchemaError::ReferenceCycle(vec!["a".into(), "b".into(), "a".into()])
        );

        let selfish = table(
            "nodes",
            [
                string("id").primary_key().into(),
                string("parent").nullable().references("nodes", "id").into(),
            ],
        )
        .unwrap();
        let err = schema([selfish]).unwrap_err();
        assert!(matches!(err, SchemaError::ReferenceCycle(_)));
    }

    #[test]
    fn schema_serializes_for_inspection() {
        let s = schema([users(), messages()]).unwrap();
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["tables"]["users"]["columns"][0]["name"], "id");
        assert_eq!(
            json["tables"]["messages"]["columns"][1]["references"]["table"],
            "users"
        );
    }
}
