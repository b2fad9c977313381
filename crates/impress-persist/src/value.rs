use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Bytes,
    Timestamp,
    Json,
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Bytes => "bytes",
            ValueType::Timestamp => "timestamp",
            ValueType::Json => "json",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dynamic value held by a row cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    String(String),
    Number(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column type this value belongs to; `None` for null.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(ValueType::String),
            Value::Number(_) => Some(ValueType::Number),
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::Bytes(_) => Some(ValueType::Bytes),
            Value::Timestamp(_) => Some(ValueType::Timestamp),
            Value::Json(_) => Some(ValueType::Json),
        }
    }

    /// Human-readable name for a Value variant.
    pub fn type_name(&self) -> &'static str {
        self.value_type().map_or("null", |t| t.name())
    }

    /// Check a non-null value against a declared column type.
    /// NaN is rejected so that number ordering stays total.
    pub fn conforms_to(&self, expected: ValueType) -> bool {
        match (expected, self) {
            (ValueType::Number, Value::Number(n)) => !n.is_nan(),
            (ValueType::Json, Value::Json(_)) => true,
            (expected, value) => value.value_type() == Some(expected),
        }
    }

    /// Equality used by `eq`, `neq` and `in`. Values of different types are never equal.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            _ => self.value_type().is_some() && self == other,
        }
    }

    /// Ordering used by `lt`/`lte`/`gt`/`gte`: numeric for numbers, chronological
    /// for timestamps, lexicographic for strings and bytes. Null, JSON and mixed
    /// types have no ordering.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used for sorting and keys. Null sorts first; values of
    /// different types are ordered by type. `0.0` and `-0.0` are equal, as
    /// they are under `==`.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) if *a == 0.0 && *b == 0.0 => Ordering::Equal,
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            _ => self
                .compare(other)
                .unwrap_or_else(|| self.rank().cmp(&other.rank())),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
            Value::Timestamp(_) => 5,
            Value::Json(_) => 6,
        }
    }

    /// Convert a JSON value produced by serializing a model field into a
    /// value of the declared column type.
    pub fn from_json(json: serde_json::Value, expected: ValueType) -> Result<Value, &'static str> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        match expected {
            ValueType::Json => Ok(Value::Json(json)),
            ValueType::String => match json {
                serde_json::Value::String(s) => Ok(Value::String(s)),
                other => Err(json_type_name(&other)),
            },
            ValueType::Number => match json.as_f64() {
                Some(n) => Ok(Value::Number(n)),
                None => Err(json_type_name(&json)),
            },
            ValueType::Boolean => match json {
                serde_json::Value::Bool(b) => Ok(Value::Boolean(b)),
                other => Err(json_type_name(&other)),
            },
            ValueType::Bytes => {
                let name = json_type_name(&json);
                serde_json::from_value::<Vec<u8>>(json)
                    .map(Value::Bytes)
                    .map_err(|_| name)
            }
            ValueType::Timestamp => {
                let name = json_type_name(&json);
                serde_json::from_value::<DateTime<Utc>>(json)
                    .map(Value::Timestamp)
                    .map_err(|_| name)
            }
        }
    }

    /// Inverse of [`Value::from_json`]. Whole numbers become JSON integers so
    /// that integer model fields decode.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Bytes(bytes) => serde_json::Value::from(bytes.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(
                ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            ),
            Value::Json(json) => json.clone(),
        }
    }
}

fn json_type_name(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Number(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Json(json) => write!(f, "{}", json),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::Json(json)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A value wrapped with a total order, used as a primary key and as a join
/// lookup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(pub Value);

impl Key {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! key_from {
    ($($t:ty),* $(,)?) => {
        $(impl From<$t> for Key {
            fn from(v: $t) -> Self {
                Key(v.into())
            }
        })*
    };
}

key_from!(Value, &str, String, f64, i32, i64, bool, Vec<u8>, DateTime<Utc>);

/// A stored row: column name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(column.into(), value.into())
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.0.remove(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl From<BTreeMap<String, Value>> for Row {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Row(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Row(iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect())
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Build a [`Row`] from `column => value` pairs.
///
/// ```
/// use impress_persist::row;
/// let r = row! { "id" => "u1", "age" => 42 };
/// assert_eq!(r.len(), 2);
/// ```
#[macro_export]
macro_rules! row {
    () => { $crate::Row::new() };
    ($($column:expr => $value:expr),+ $(,)?) => {{
        let mut row = $crate::Row::new();
        $( row.insert($column, $crate::Value::from($value)); )+
        row
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn value_serde_round_trip() {
        let values = vec![
            Value::Null,
            Value::Boolean(true),
            Value::Number(42.5),
            Value::String("hello".into()),
            Value::Bytes(vec![0, 1, 255]),
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            Value::Json(serde_json::json!({"k": [1, 2]})),
        ];
        for v in &values {
            let json = serde_json::to_string(v).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(*v, back);
        }
    }

    #[test]
    fn compare_is_type_appropriate() {
        assert_eq!(
            Value::from(2).compare(&Value::from(10)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::from("2").compare(&Value::from("10")),
            Some(Ordering::Greater)
        );
        let early = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            Value::from(early).compare(&Value::from(late)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::from(1).compare(&Value::from("1")), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn same_as_distinguishes_types() {
        assert!(Value::Null.same_as(&Value::Null));
        assert!(!Value::Null.same_as(&Value::from("")));
        assert!(!Value::from(1).same_as(&Value::from("1")));
        assert!(Value::from(1).same_as(&Value::from(1.0)));
    }

    #[test]
    fn null_sorts_first() {
        let mut keys = vec![Key::from(3), Key::from(Value::Null), Key::from(1)];
        keys.sort();
        assert_eq!(keys[0], Key(Value::Null));
        assert_eq!(keys[1], Key::from(1));
    }

    #[test]
    fn json_conversion_respects_column_type() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let json = serde_json::to_value(ts).unwrap();
        assert_eq!(
            Value::from_json(json, ValueType::Timestamp).unwrap(),
            Value::Timestamp(ts)
        );

        let json = serde_json::to_value(vec![1u8, 2, 3]).unwrap();
        assert_eq!(
            Value::from_json(json.clone(), ValueType::Bytes).unwrap(),
            Value::Bytes(vec![1, 2, 3])
        );
        assert!(matches!(
            Value::from_json(json.clone(), ValueType::Json).unwrap(),
            Value::Json(_)
        ));
        assert_eq!(Value::from_json(json, ValueType::String), Err("array"));
    }

    #[test]
    fn whole_numbers_serialize_as_integers() {
        assert_eq!(Value::Number(7.0).to_json(), serde_json::json!(7));
        assert_eq!(Value::Number(7.5).to_json(), serde_json::json!(7.5));
    }

    #[test]
    fn row_macro_builds_row() {
        let r = row! { "id" => "u1", "score" => 3, "bio" => Value::Null };
        assert_eq!(r.get("id"), Some(&Value::from("u1")));
        assert_eq!(r.get("score"), Some(&Value::Number(3.0)));
        assert!(r.get("bio").unwrap().is_null());
    }

    #[test]
    fn signed_zero_is_one_key() {
        assert_eq!(Key::from(0.0), Key::from(-0.0));
        assert_eq!(Value::Number(-0.0).total_cmp(&Value::Number(0.0)), Ordering::Equal);
        let mut keys = BTreeMap::new();
        keys.insert(Key::from(0.0), "positive");
        keys.insert(Key::from(-0.0), "negative");
        assert_eq!(keys.len(), 1);
        assert!(Key::from(-1.0) < Key::from(-0.0));
    }
}
