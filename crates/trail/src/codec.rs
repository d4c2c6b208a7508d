//! Attribute codec
//!
//! Maps live typed attribute values to a storage-safe JSON form and back.
//! Decoding sniffs the stored shape instead of relying on a format version,
//! so snapshots written by older encoders keep decoding:
//! - arrays stored as bracketed text (`{1,2,3}`) decode like JSON arrays
//! - structured columns stored as coder text decode like plain documents
//! - enum columns stored as ordinals decode to their labels
//! - timestamps in the `YYYY-MM-DD HH:MM:SS UTC` form decode like RFC 3339
//!
//! Nothing here fails: a value that cannot be decoded for its column passes
//! through in its raw form.

use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::schema::{
    self, ColumnType, Schema, DATE_FORMAT, TIME_FORMAT, TIMESTAMP_FORMAT,
};
use crate::value::{AttributeValue, Attributes};

/// Storage-safe mapping as it appears inside `object` and `object_changes`
pub type StoredObject = Map<String, Value>;

/// Per-model codec, typed by the model's schema
#[derive(Debug, Clone, Copy)]
pub struct AttributeCodec<'a> {
    schema: &'a Schema,
}

impl<'a> AttributeCodec<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Encode every attribute into its storage-safe form
    pub fn serialize(&self, attributes: &Attributes) -> StoredObject {
        attributes
            .iter()
            .map(|(name, value)| (name.to_string(), self.serialize_value(name, value)))
            .collect()
    }

    /// Decode a stored mapping back into typed values
    pub fn deserialize(&self, stored: &StoredObject) -> Attributes {
        stored
            .iter()
            .map(|(name, raw)| (name.clone(), self.deserialize_value(name, raw)))
            .collect()
    }

    pub fn serialize_value(&self, name: &str, value: &AttributeValue) -> Value {
        match self.schema.column_type(name) {
            Some(column_type) => encode(column_type, value),
            None => plain_json(value),
        }
    }

    pub fn deserialize_value(&self, name: &str, raw: &Value) -> AttributeValue {
        let Some(column_type) = self.schema.column_type(name) else {
            return AttributeValue::from_json(raw);
        };
        match decode(column_type, raw) {
            Some(value) => value,
            None => {
                warn!(
                    "Attribute {} holds an unrecognized {} encoding, passing raw value through",
                    name, column_type
                );
                AttributeValue::from_json(raw)
            }
        }
    }
}

/// Natural JSON form of a value, independent of any column type
pub(crate) fn plain_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Null => Value::Null,
        AttributeValue::Boolean(b) => Value::Bool(*b),
        AttributeValue::Integer(i) => Value::from(*i),
        AttributeValue::Float(f) => encode_float(*f),
        AttributeValue::Decimal(s) | AttributeValue::String(s) => Value::String(s.clone()),
        AttributeValue::Timestamp(t) => Value::String(t.format(TIMESTAMP_FORMAT).to_string()),
        AttributeValue::Date(d) => Value::String(d.format(DATE_FORMAT).to_string()),
        AttributeValue::Time(t) => Value::String(t.format(TIME_FORMAT).to_string()),
        AttributeValue::Json(j) => j.clone(),
        AttributeValue::Array(items) => Value::Array(items.iter().map(plain_json).collect()),
    }
}

fn encode_float(f: f64) -> Value {
    match Number::from_f64(f) {
        Some(n) => Value::Number(n),
        None if f.is_nan() => Value::String("NaN".to_string()),
        None if f > 0.0 => Value::String("Infinity".to_string()),
        None => Value::String("-Infinity".to_string()),
    }
}

fn encode(column_type: &ColumnType, value: &AttributeValue) -> Value {
    match (column_type, value) {
        // Element types drive nested encoding
        (ColumnType::Array(element), AttributeValue::Array(items)) => {
            Value::Array(items.iter().map(|item| encode(element, item)).collect())
        }
        // Ordinals are stored as their label
        (ColumnType::Enum(labels), AttributeValue::Integer(i)) => usize::try_from(*i)
            .ok()
            .and_then(|index| labels.get(index))
            .map(|label| Value::String(label.clone()))
            .unwrap_or_else(|| Value::from(*i)),
        // The column coder would produce text; keep the plain document so the
        // outer serializer does not encode it twice
        (ColumnType::Json, AttributeValue::String(s)) => match serde_json::from_str(s) {
            Ok(doc @ (Value::Object(_) | Value::Array(_))) => doc,
            _ => Value::String(s.clone()),
        },
        _ => plain_json(value),
    }
}

fn decode(column_type: &ColumnType, raw: &Value) -> Option<AttributeValue> {
    use AttributeValue as V;

    if raw.is_null() {
        return Some(V::Null);
    }

    match column_type {
        ColumnType::Boolean => match raw {
            Value::Bool(b) => Some(V::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(V::Boolean(false)),
                Some(1) => Some(V::Boolean(true)),
                _ => None,
            },
            Value::String(s) => schema::parse_boolean(s).map(V::Boolean),
            _ => None,
        },
        ColumnType::Integer => match raw {
            Value::Number(n) => n.as_i64().map(V::Integer),
            Value::String(s) => s.trim().parse().ok().map(V::Integer),
            _ => None,
        },
        ColumnType::Float => match raw {
            Value::Number(n) => n.as_f64().map(V::Float),
            Value::String(s) => schema::parse_float(s).map(V::Float),
            _ => None,
        },
        ColumnType::Decimal => match raw {
            Value::String(s) if schema::is_decimal(s.trim()) => Some(V::Decimal(s.trim().to_string())),
            Value::Number(n) => Some(V::Decimal(n.to_string())),
            _ => None,
        },
        ColumnType::String => match raw {
            Value::String(s) => Some(V::String(s.clone())),
            _ => None,
        },
        ColumnType::Timestamp => match raw {
            Value::String(s) => schema::parse_timestamp(s).map(V::Timestamp),
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                .map(V::Timestamp),
            _ => None,
        },
        ColumnType::Date => match raw {
            Value::String(s) => schema::parse_date(s).map(V::Date),
            _ => None,
        },
        ColumnType::Time => match raw {
            Value::String(s) => schema::parse_time(s).map(V::Time),
            _ => None,
        },
        ColumnType::Json => match raw {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(doc @ (Value::Object(_) | Value::Array(_))) => Some(V::Json(doc)),
                // Text that is not a document was held as a plain string
                _ => Some(V::String(s.clone())),
            },
            other => Some(V::Json(other.clone())),
        },
        ColumnType::Array(element) => match raw {
            Value::Array(items) => items
                .iter()
                .map(|item| decode(element, item))
                .collect::<Option<Vec<_>>>()
                .map(V::Array),
            Value::String(s) => {
                let items = parse_array_literal(s)?;
                items
                    .into_iter()
                    .map(|item| match item {
                        None => Some(V::Null),
                        Some(text) => decode(element, &Value::String(text)),
                    })
                    .collect::<Option<Vec<_>>>()
                    .map(V::Array)
            }
            _ => None,
        },
        ColumnType::Enum(labels) => match raw {
            Value::String(s) if labels.contains(s) => Some(V::String(s.clone())),
            Value::Number(n) => n
                .as_u64()
                .and_then(|i| labels.get(i as usize))
                .map(|label| V::String(label.clone())),
            _ => None,
        },
    }
}

/// Parse a one-dimensional bracketed array literal such as `{1,2,3}` or
/// `{"a b",NULL,"c\"d"}`. Unquoted `NULL` yields `None`.
fn parse_array_literal(text: &str) -> Option<Vec<Option<String>>> {
    let inner = text.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut items = Vec::new();
    if inner.trim().is_empty() {
        return Some(items);
    }

    let mut chars = inner.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        if chars.peek() == Some(&'"') {
            chars.next();
            let mut item = String::new();
            loop {
                match chars.next()? {
                    '\\' => item.push(chars.next()?),
                    '"' => break,
                    c => item.push(c),
                }
            }
            items.push(Some(item));
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
        } else {
            let mut item = String::new();
            while let Some(c) = chars.next_if(|c| *c != ',') {
                if c == '{' || c == '}' || c == '"' {
                    return None;
                }
                item.push(c);
            }
            let item = item.trim();
            if item.is_empty() {
                return None;
            }
            items.push(if item.eq_ignore_ascii_case("NULL") {
                None
            } else {
                Some(item.to_string())
            });
        }

        match chars.next() {
            Some(',') => continue,
            None => return Some(items),
            Some(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .column("id", ColumnType::Integer)
            .column("name", ColumnType::String)
            .column("price", ColumnType::Decimal)
            .column("ratio", ColumnType::Float)
            .column("active", ColumnType::Boolean)
            .column("published_at", ColumnType::Timestamp)
            .column("due_on", ColumnType::Date)
            .column("opens_at", ColumnType::Time)
            .column("settings", ColumnType::Json)
            .column("post_ids", ColumnType::array_of(ColumnType::Integer))
            .column("tags", ColumnType::array_of(ColumnType::String))
            .column("status", ColumnType::enumeration(["draft", "published"]))
    }

    #[test]
    fn test_round_trip_all_supported_types() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        let attrs = Attributes::new()
            .with("id", 7)
            .with("name", "Widget")
            .with("price", AttributeValue::Decimal("12.5000".into()))
            .with("ratio", 0.25)
            .with("active", true)
            .with(
                "published_at",
                Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
            )
            .with("due_on", NaiveDate::from_ymd_opt(2024, 12, 31).unwrap())
            .with("opens_at", NaiveTime::from_hms_opt(9, 30, 0).unwrap())
            .with("settings", AttributeValue::Json(json!({"theme": "dark", "n": [1, 2]})))
            .with("post_ids", vec![1, 2, 3])
            .with("tags", vec!["a", "b"])
            .with("status", "published")
            .with("nickname", AttributeValue::Null);

        let stored = codec.serialize(&attrs);
        assert_eq!(codec.deserialize(&stored), attrs);
    }

    #[test]
    fn test_serialize_keeps_attribute_order() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        let attrs = Attributes::new().with("status", "draft").with("id", 1).with("name", "x");
        let stored = codec.serialize(&attrs);
        let keys: Vec<&String> = stored.keys().collect();
        assert_eq!(keys, vec!["status", "id", "name"]);
    }

    #[test]
    fn test_legacy_array_literal_decodes_like_json_array() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);

        let mut legacy = StoredObject::new();
        legacy.insert("post_ids".into(), json!("{1,2,3}"));
        let mut current = StoredObject::new();
        current.insert("post_ids".into(), json!([1, 2, 3]));

        let expected = Attributes::new().with("post_ids", vec![1, 2, 3]);
        assert_eq!(codec.deserialize(&legacy), expected);
        assert_eq!(codec.deserialize(&current), expected);
    }

    #[test]
    fn test_legacy_quoted_array_literal() {
        assert_eq!(
            parse_array_literal(r#"{"a b",NULL,"c\"d", plain}"#),
            Some(vec![
                Some("a b".to_string()),
                None,
                Some("c\"d".to_string()),
                Some("plain".to_string()),
            ])
        );
        assert_eq!(parse_array_literal("{}"), Some(vec![]));
        assert_eq!(parse_array_literal("{1,,2}"), None);
        assert_eq!(parse_array_literal("[1,2]"), None);
    }

    #[test]
    fn test_structured_column_is_not_double_encoded() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);

        // Coder text handed in as a string is stored as the plain document
        let value = codec.serialize_value("settings", &AttributeValue::from(r#"{"theme":"dark"}"#));
        assert_eq!(value, json!({"theme": "dark"}));

        // Older snapshots that stored the coder text still decode
        let decoded = codec.deserialize_value("settings", &json!(r#"{"theme":"dark"}"#));
        assert_eq!(decoded, AttributeValue::Json(json!({"theme": "dark"})));
    }

    #[test]
    fn test_structured_column_keeps_plain_text() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);

        for text in ["42", "hello", "true"] {
            let attrs = Attributes::new().with("settings", text);
            let stored = codec.serialize(&attrs);
            assert_eq!(stored["settings"], json!(text));
            assert_eq!(codec.deserialize(&stored), attrs);
        }

        let number = Attributes::new().with("settings", AttributeValue::Json(json!(42)));
        assert_eq!(codec.deserialize(&codec.serialize(&number)), number);
    }

    #[test]
    fn test_timestamps_keep_nanoseconds() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        let published_at = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let opens_at = NaiveTime::from_hms_nano_opt(9, 30, 0, 987_654_321).unwrap();
        let attrs = Attributes::new()
            .with("published_at", published_at)
            .with("opens_at", opens_at);

        let stored = codec.serialize(&attrs);
        assert_eq!(stored["published_at"], json!("2023-11-14T22:13:20.123456789Z"));
        assert_eq!(codec.deserialize(&stored), attrs);
    }

    #[test]
    fn test_enum_ordinal_and_label_forms() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        assert_eq!(codec.serialize_value("status", &AttributeValue::Integer(0)), json!("draft"));
        assert_eq!(
            codec.deserialize_value("status", &json!(1)),
            AttributeValue::String("published".into())
        );
    }

    #[test]
    fn test_legacy_timestamp_forms() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        let expected = AttributeValue::Timestamp(Utc.with_ymd_and_hms(2015, 1, 2, 3, 4, 5).unwrap());
        assert_eq!(
            codec.deserialize_value("published_at", &json!("2015-01-02 03:04:05 UTC")),
            expected
        );
        assert_eq!(codec.deserialize_value("published_at", &json!(1420167845)), expected);
    }

    #[test]
    fn test_non_finite_floats_are_storage_safe() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        let stored = codec.serialize_value("ratio", &AttributeValue::Float(f64::INFINITY));
        assert_eq!(stored, json!("Infinity"));
        assert_eq!(
            codec.deserialize_value("ratio", &stored),
            AttributeValue::Float(f64::INFINITY)
        );
    }

    #[test]
    fn test_corrupt_values_pass_through_raw() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        assert_eq!(
            codec.deserialize_value("post_ids", &json!("{1,{2}")),
            AttributeValue::String("{1,{2}".into())
        );
        assert_eq!(
            codec.deserialize_value("id", &json!("not a number")),
            AttributeValue::String("not a number".into())
        );
        assert_eq!(
            codec.deserialize_value("active", &json!([true])),
            AttributeValue::Array(vec![AttributeValue::Boolean(true)])
        );
    }

    #[test]
    fn test_unknown_columns_use_raw_form() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        assert_eq!(
            codec.deserialize_value("legacy_flag", &json!(true)),
            AttributeValue::Boolean(true)
        );
    }
}
