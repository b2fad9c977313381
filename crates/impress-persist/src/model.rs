//! Compile-time row shapes.
//!
//! A row struct implementing [`Model`] names the table it belongs to; the
//! typed adapter checks it against the schema and converts it to and from
//! [`Row`]s through serde.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::marker::PhantomData;

use crate::error::{PersistError, Result};
use crate::query::{Predicate, SortDescriptor};
use crate::schema::{ColumnValue, TableDef, TypedColumn};
use crate::value::{Row, Value};

/// A typed row of a declared table.
///
/// ```
/// use impress_persist::Model;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct User {
///     id: String,
///     name: String,
/// }
///
/// impl Model for User {
///     const TABLE: &'static str = "users";
/// }
/// ```
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;
}

/// Conversion between a caller-facing row type and a stored [`Row`].
pub trait RowCodec: Sized + Send + Sync + 'static {
    fn encode(&self, table: &TableDef) -> Result<Row>;
    fn decode(row: Row, table: &TableDef) -> Result<Self>;
}

impl<M: Model> RowCodec for M {
    fn encode(&self, table: &TableDef) -> Result<Row> {
        to_row(self, table)
    }

    fn decode(row: Row, table: &TableDef) -> Result<Self> {
        from_row(row).map_err(|message| PersistError::Codec {
            table: table.name().to_string(),
            message,
        })
    }
}

impl RowCodec for Row {
    fn encode(&self, _table: &TableDef) -> Result<Row> {
        Ok(self.clone())
    }

    fn decode(row: Row, _table: &TableDef) -> Result<Self> {
        Ok(row)
    }
}

/// Serialize a struct into a row, converting each field to its column's type.
pub fn to_row<T: Serialize>(value: &T, table: &TableDef) -> Result<Row> {
    let codec_err = |message: String| PersistError::Codec {
        table: table.name().to_string(),
        message,
    };
    let json = serde_json::to_value(value).map_err(|e| codec_err(e.to_string()))?;
    let serde_json::Value::Object(fields) = json else {
        return Err(codec_err("row must serialize to an object".into()));
    };

    let mut row = Row::new();
    for (name, field) in fields {
        let column = table
            .column(&name)
            .ok_or_else(|| PersistError::UnknownColumn {
                table: table.name().to_string(),
                column: name.clone(),
            })?;
        let value = Value::from_json(field, column.value_type).map_err(|found| {
            PersistError::TypeMismatch {
                table: table.name().to_string(),
                column: name.clone(),
                expected: column.value_type,
                found,
            }
        })?;
        row.insert(name, value);
    }
    Ok(row)
}

/// Deserialize a row into any serde type.
pub fn from_row<T: DeserializeOwned>(row: Row) -> std::result::Result<T, String> {
    let fields: serde_json::Map<String, serde_json::Value> = row
        .into_iter()
        .map(|(name, value)| (name, value.to_json()))
        .collect();
    serde_json::from_value(serde_json::Value::Object(fields)).map_err(|e| e.to_string())
}

/// Typed column handle used to build predicates, sort keys and patches
/// whose literal types are checked by the compiler.
///
/// ```
/// use impress_persist::Col;
///
/// const NAME: Col<String> = Col::new("name");
/// const AGE: Col<f64> = Col::new("age");
///
/// let adults_named_bob = NAME.eq("Bob").and(AGE.gte(18));
/// ```
#[derive(Debug)]
pub struct Col<T> {
    name: Cow<'static, str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Col<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Col<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _marker: PhantomData,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn asc(&self) -> SortDescriptor {
        SortDescriptor::asc(self.name())
    }

    pub fn desc(&self) -> SortDescriptor {
        SortDescriptor::desc(self.name())
    }
}

impl<T: ColumnValue> Col<T> {
    pub fn eq(&self, value: impl Into<T>) -> Predicate {
        Predicate::Eq(self.name().to_string(), value.into().into_value())
    }

    pub fn neq(&self, value: impl Into<T>) -> Predicate {
        Predicate::Neq(self.name().to_string(), value.into().into_value())
    }

    pub fn lt(&self, value: impl Into<T>) -> Predicate {
        Predicate::Lt(self.name().to_string(), value.into().into_value())
    }

    pub fn lte(&self, value: impl Into<T>) -> Predicate {
        Predicate::Lte(self.name().to_string(), value.into().into_value())
    }

    pub fn gt(&self, value: impl Into<T>) -> Predicate {
        Predicate::Gt(self.name().to_string(), value.into().into_value())
    }

    pub fn gte(&self, value: impl Into<T>) -> Predicate {
        Predicate::Gte(self.name().to_string(), value.into().into_value())
    }

    pub fn is_in<V: Into<T>>(&self, values: impl IntoIterator<Item = V>) -> Predicate {
        Predicate::In(
            self.name().to_string(),
            values.into_iter().map(|v| v.into().into_value()).collect(),
        )
    }
}

impl<T: ColumnValue> Col<Option<T>> {
    pub fn is_null(&self) -> Predicate {
        Predicate::Eq(self.name().to_string(), Value::Null)
    }

    pub fn is_not_null(&self) -> Predicate {
        Predicate::Neq(self.name().to_string(), Value::Null)
    }
}

impl<T: ColumnValue> TypedColumn for Col<T> {
    type Value = T;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{bytes, number, string, table, timestamp};
    use chrono::{TimeZone, Utc};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Member {
        id: String,
        rank: i64,
        avatar: Option<Vec<u8>>,
        joined: chrono::DateTime<Utc>,
    }

    impl Model for Member {
        const TABLE: &'static str = "members";
    }

    fn members() -> TableDef {
        table(
            "members",
            [
                string("id").primary_key().into(),
                number("rank").into(),
                bytes("avatar").nullable().into(),
                timestamp("joined").into(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn model_row_round_trip() {
        let member = Member {
            id: "m1".into(),
            rank: 3,
            avatar: Some(vec![9, 8]),
            joined: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        };
        let row = member.encode(&members()).unwrap();
        assert_eq!(row.get("rank"), Some(&Value::Number(3.0)));
        assert_eq!(row.get("avatar"), Some(&Value::Bytes(vec![9, 8])));
        assert!(matches!(row.get("joined"), Some(Value::Timestamp(_))));

        let back = Member::decode(row, &members()).unwrap();
        assert_eq!(back, member);
    }

    #[test]
    fn encode_rejects_unknown_fields() {
        #[derive(Serialize)]
        struct Stray {
            id: String,
            nickname: String,
        }
        let err = to_row(
            &Stray {
                id: "x".into(),
                nickname: "y".into(),
            },
            &members(),
        )
        .unwrap_err();
        assert!(matches!(err, PersistError::UnknownColumn { .. }));
    }

    #[test]
    fn encode_reports_type_mismatch() {
        #[derive(Serialize)]
        struct Wrong {
            id: String,
            rank: String,
        }
        let err = to_row(
            &Wrong {
                id: "x".into(),
                rank: "high".into(),
            },
            &members(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PersistError::TypeMismatch { found: "string", .. }
        ));
    }

    #[test]
    fn typed_predicates() {
        const RANK: Col<f64> = Col::new("rank");
        let avatar: Col<Option<Vec<u8>>> = Col::named("avatar");

        assert_eq!(RANK.gt(2), Predicate::Gt("rank".into(), Value::Number(2.0)));
        assert_eq!(
            RANK.is_in([1, 2]),
            Predicate::In("rank".into(), vec![Value::Number(1.0), Value::Number(2.0)])
        );
        assert_eq!(avatar.is_null(), Predicate::Eq("avatar".into(), Value::Null));
        assert_eq!(RANK.desc(), SortDescriptor::desc("rank"));
    }
}
