use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize};

/// Sql is a trusted fragment of SQL text which the codec substitutes
/// verbatim, without quoting or escaping. It's used for identifiers and
/// sub-expressions assembled by this workspace, and never for user input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sql(String);

impl Sql {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Sql {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arguments of a query template, keyed on placeholder name.
/// Order is preserved, which matters for the NAMES / VALUES macros.
pub type Arguments = IndexMap<String, Value>;

/// Value is a typed application value which may be encoded into a SQL
/// literal, or which was decoded from the wire text of a result column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact ratio, which is narrowed to a float when encoded.
    Rational { numer: i64, denom: i64 },
    Text(String),
    Timestamp(DateTime<FixedOffset>),
    /// Closed interval, which encodes as a `BETWEEN lower AND upper` fragment.
    Between(Box<Value>, Box<Value>),
    Map(IndexMap<String, Value>),
    List(Vec<Value>),
    Sql(Sql),
}

impl Value {
    pub fn between(lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Value::Between(Box::new(lower.into()), Box::new(upper.into()))
    }
    pub fn sql(sql: impl Into<String>) -> Self {
        Value::Sql(Sql::new(sql))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Rational { numer, denom } => Some(*numer as f64 / *denom as f64),
            _ => None,
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(ts.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Plain textual rendering of the value, without SQL quoting.
    /// Null renders as the empty string.
    pub fn to_plain_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Rational { .. } => self.as_f64().unwrap_or_default().to_string(),
            Value::Text(s) => s.clone(),
            Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
            Value::Sql(sql) => sql.to_string(),
            Value::Between(..) | Value::Map(_) | Value::List(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Rational { .. } => serializer.serialize_f64(self.as_f64().unwrap_or_default()),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Timestamp(ts) => {
                serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Value::Between(lower, upper) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BETWEEN_KEY, &[lower.as_ref(), upper.as_ref()])?;
                map.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Sql(sql) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(SQL_KEY, sql.as_str())?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(Into::into)
    }
}

const SQL_KEY: &str = "$sql";
const BETWEEN_KEY: &str = "$between";

impl From<serde_json::Value> for Value {
    fn from(doc: serde_json::Value) -> Self {
        use serde_json::Value as J;

        match doc {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            J::String(s) => Value::Text(s),
            J::Array(items) => Value::List(items.into_iter().map(Into::into).collect()),
            J::Object(mut fields) if fields.len() == 1 => {
                match (fields.remove(SQL_KEY), fields.remove(BETWEEN_KEY)) {
                    (Some(J::String(sql)), _) => Value::Sql(Sql(sql)),
                    (_, Some(J::Array(bounds))) if bounds.len() == 2 => {
                        let mut bounds = bounds.into_iter().map(Value::from);
                        let lower = bounds.next().unwrap_or(Value::Null);
                        let upper = bounds.next().unwrap_or(Value::Null);
                        Value::between(lower, upper)
                    }
                    (sql, between) => {
                        // Not one of our tagged forms. Put it back as it was.
                        let entry = sql
                            .map(|v| (SQL_KEY, v))
                            .or(between.map(|v| (BETWEEN_KEY, v)));
                        let fields = entry
                            .map(|(k, v)| (k.to_string(), v))
                            .into_iter()
                            .chain(fields)
                            .map(|(k, v)| (k, Value::from(v)))
                            .collect();
                        Value::Map(fields)
                    }
                }
            }
            J::Object(fields) => {
                Value::Map(fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<Sql> for Value {
    fn from(sql: Sql) -> Self {
        Value::Sql(sql)
    }
}
impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts.into())
    }
}
impl From<DateTime<FixedOffset>> for Value {
    fn from(ts: DateTime<FixedOffset>) -> Self {
        Value::Timestamp(ts)
    }
}
impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Value::Map(map)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}
impl<T: Into<Value>> From<std::ops::Range<T>> for Value {
    fn from(r: std::ops::Range<T>) -> Self {
        Value::between(r.start, r.end)
    }
}
impl<T: Into<Value>> From<std::ops::RangeInclusive<T>> for Value {
    fn from(r: std::ops::RangeInclusive<T>) -> Self {
        let (start, end) = r.into_inner();
        Value::between(start, end)
    }
}
