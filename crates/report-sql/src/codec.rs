use super::{Error, Escape, Result, Value};
use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone};
use std::collections::HashMap;

const NULL: &str = "NULL";
const TRUE: &str = "'t'::boolean";
const FALSE: &str = "'f'::boolean";

/// Encode `value` as SQL text, using `esc` to quote strings.
///
/// Most values encode as a literal. Two are exceptions which callers must
/// not place where a quoted literal is expected:
///  - `Value::Sql` is substituted verbatim.
///  - `Value::Between` expands to a `BETWEEN lower AND upper` fragment.
///
/// Lists of numbers (and nulls) encode as an ARRAY constructor. Empty or
/// heterogeneous lists can't be expressed as a native array, and are
/// instead encoded as a JSON string literal, as are maps.
pub fn encode<E: Escape + ?Sized>(value: &Value, esc: &E) -> Result<String> {
    let out = match value {
        Value::Sql(sql) => sql.to_string(),
        Value::Null => NULL.to_string(),
        Value::Bool(true) => TRUE.to_string(),
        Value::Bool(false) => FALSE.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => encode_float(*f)?,
        Value::Rational { numer, denom } => {
            if *denom == 0 {
                return Err(Error::Escape {
                    value: format!("{numer}/{denom}"),
                    reason: "rational has a zero denominator",
                });
            }
            encode_float(*numer as f64 / *denom as f64)?
        }
        Value::Text(s) => quote(s, esc)?,
        Value::Timestamp(ts) => format!(
            "{}::timestamptz",
            quote(&ts.to_rfc3339_opts(SecondsFormat::Micros, true), esc)?
        ),
        Value::Between(lower, upper) => {
            format!("BETWEEN {} AND {}", encode(lower, esc)?, encode(upper, esc)?)
        }
        Value::Map(_) => quote(&serde_json::to_string(value)?, esc)?,
        Value::List(items) if is_numeric_array(items) => {
            let items = items
                .iter()
                .map(|item| encode(item, esc))
                .collect::<Result<Vec<_>>>()?;
            format!("ARRAY[{}]", items.join(", "))
        }
        Value::List(_) => quote(&serde_json::to_string(value)?, esc)?,
    };
    Ok(out)
}

fn encode_float(f: f64) -> Result<String> {
    if f.is_finite() {
        Ok(f.to_string())
    } else {
        Err(Error::Escape {
            value: f.to_string(),
            reason: "float is not finite",
        })
    }
}

fn quote<E: Escape + ?Sized>(s: &str, esc: &E) -> Result<String> {
    if s.contains('\0') {
        return Err(Error::Escape {
            value: format!("{s:?}"),
            reason: "text contains a NUL character",
        });
    }
    Ok(esc.escape_string(s))
}

// A list is a native array if it's all numbers, optionally mixed with nulls,
// and has at least one non-null. Postgres widens a mix of integers and
// floats to a numeric array.
fn is_numeric_array(items: &[Value]) -> bool {
    items.iter().any(|v| !matches!(v, Value::Null))
        && items.iter().all(|v| {
            matches!(
                v,
                Value::Null | Value::Int(_) | Value::Float(_) | Value::Rational { .. }
            )
        })
}

/// Decoder of the wire text of a single type.
pub type DecodeFn = Box<dyn Fn(&str) -> Result<Value> + Send + Sync>;

/// Codec decodes the textual wire format of result columns into Values,
/// dispatching on the column's type name.
#[derive(Default)]
pub struct Codec {
    overrides: HashMap<String, DecodeFn>,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, PartialEq)]
enum Family<'t> {
    Bool,
    Int,
    Float,
    Timestamp,
    Array(&'t str),
    Text,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `decode` for columns having exactly `type_name`, in preference
    /// to the built-in decoding.
    pub fn with_override<F>(mut self, type_name: impl Into<String>, decode: F) -> Self
    where
        F: Fn(&str) -> Result<Value> + Send + Sync + 'static,
    {
        self.overrides.insert(type_name.into(), Box::new(decode));
        self
    }

    /// Decode wire `text` of a column having `type_name`.
    /// SQL NULL (`None`), as well as the literal text `NULL`, decode to
    /// `Value::Null`. Text of an unrecognized type is returned unchanged.
    pub fn decode(&self, text: Option<&str>, type_name: &str) -> Result<Value> {
        let text = match text {
            None | Some(NULL) => return Ok(Value::Null),
            Some(text) => text,
        };
        if let Some(decode) = self.overrides.get(type_name) {
            return decode(text);
        }
        let fail = || Error::Decode {
            text: text.to_string(),
            type_name: type_name.to_string(),
        };

        match family(type_name) {
            Family::Bool => match text.chars().next() {
                Some('t' | 'T') => Ok(Value::Bool(true)),
                Some('f' | 'F') => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            Family::Int => text.trim().parse().map(Value::Int).map_err(|_| fail()),
            Family::Float => text.trim().parse().map(Value::Float).map_err(|_| fail()),
            Family::Timestamp => parse_timestamp(text)
                .map(Value::Timestamp)
                .ok_or_else(fail),
            Family::Array(element_type) => self.decode_array(text, element_type, type_name),
            Family::Text => Ok(Value::Text(text.to_string())),
        }
    }

    fn decode_array(&self, text: &str, element_type: &str, type_name: &str) -> Result<Value> {
        let body = text
            .trim()
            .strip_prefix('{')
            .and_then(|t| t.strip_suffix('}'))
            .ok_or_else(|| Error::Decode {
                text: text.to_string(),
                type_name: type_name.to_string(),
            })?;

        let mut items = Vec::new();
        for element in split_array_body(body) {
            let item = match element {
                ArrayElement::Null => Value::Null,
                ArrayElement::Nested(nested) => self.decode_array(&nested, element_type, type_name)?,
                ArrayElement::Quoted(text) => match family(element_type) {
                    // Quoted text is never the NULL token.
                    Family::Text if !self.overrides.contains_key(element_type) => {
                        Value::Text(text)
                    }
                    _ => self.decode(Some(&text), element_type)?,
                },
                ArrayElement::Bare(text) => self.decode(Some(&text), element_type)?,
            };
            items.push(item);
        }
        Ok(Value::List(items))
    }
}

fn family(type_name: &str) -> Family<'_> {
    let type_name = type_name.trim();
    if let Some(element) = type_name.strip_suffix("[]") {
        return Family::Array(element);
    }
    let lower = type_name.to_ascii_lowercase();
    let starts = |prefix: &str| lower.starts_with(prefix);

    if starts("bool") {
        Family::Bool
    } else if INTEGER_TYPES.contains(&lower.as_str()) {
        Family::Int
    } else if FLOAT_PREFIXES.iter().any(|p| starts(p)) {
        Family::Float
    } else if starts("timestamp") {
        Family::Timestamp
    } else {
        Family::Text
    }
}

// `tid` is absent: its wire form is a `(block,offset)` pair, kept as text.
const INTEGER_TYPES: &[&str] = &[
    "int", "int2", "int4", "int8", "integer", "smallint", "bigint", "serial", "smallserial",
    "bigserial", "oid", "xid", "xid8", "cid",
];
const FLOAT_PREFIXES: &[&str] = &["float", "real", "double precision", "numeric", "decimal"];

#[derive(Debug, PartialEq)]
enum ArrayElement {
    Null,
    Bare(String),
    Quoted(String),
    Nested(String),
}

// Split the body of a Postgres array literal (without its outer braces)
// into its elements, honoring double-quoting and nested sub-arrays.
fn split_array_body(body: &str) -> Vec<ArrayElement> {
    let mut out = Vec::new();
    if body.trim().is_empty() {
        return out;
    }
    let (mut cur, mut quoted, mut in_quotes, mut depth) = (String::new(), false, false, 0usize);
    let mut chars = body.chars();

    let mut finish = |cur: &mut String, quoted: &mut bool| {
        let text = std::mem::take(cur);
        out.push(if std::mem::take(quoted) {
            ArrayElement::Quoted(text)
        } else if text.starts_with('{') {
            ArrayElement::Nested(text)
        } else if text.trim() == NULL {
            ArrayElement::Null
        } else {
            ArrayElement::Bare(text.trim().to_string())
        });
    };

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => cur.extend(chars.next()),
            '"' if depth == 0 => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            '{' if !in_quotes => {
                depth += 1;
                cur.push(c);
            }
            '}' if !in_quotes => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            ',' if !in_quotes && depth == 0 => finish(&mut cur, &mut quoted),
            _ => cur.push(c),
        }
    }
    finish(&mut cur, &mut quoted);
    out
}

// Parse Postgres `timestamp` / `timestamptz` output, or ISO-8601.
// Timestamps without an offset are taken to be UTC.
fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    let text = text.trim().replacen(' ', "T", 1);
    let (local, offset) = split_offset(&text)?;

    let naive = NaiveDateTime::parse_from_str(local, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    FixedOffset::east_opt(offset)?
        .from_local_datetime(&naive)
        .single()
}

// Split a trailing UTC offset from `text`, returning its value in seconds.
fn split_offset(text: &str) -> Option<(&str, i32)> {
    if let Some(local) = text.strip_suffix('Z') {
        return Some((local, 0));
    }
    let time = text.find('T')?;

    let Some(ind) = text[time..].rfind(|c| c == '+' || c == '-') else {
        return Some((text, 0));
    };
    let (local, offset) = text.split_at(time + ind);
    let sign = if offset.starts_with('-') { -1 } else { 1 };

    let digits: String = offset[1..].chars().filter(|c| *c != ':').collect();
    if digits.len() % 2 != 0 || digits.len() > 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut secs = 0;
    for (part, scale) in digits.as_bytes().chunks(2).zip([3600, 60, 1]) {
        let part: i32 = std::str::from_utf8(part).ok()?.parse().ok()?;
        secs += part * scale;
    }
    Some((local, sign * secs))
}
