//! Converts the raw textual column values the decoder produces into
//! semantic Rust values, by the relation column's Postgres type.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Classification of a column's Postgres type, keyed by OID, covering the
/// scalar types (including time, timetz, bytea) and the array convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgType {
    Bool,
    Bytea,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Numeric,
    Money,
    Text,
    Varchar,
    Bpchar,
    Uuid,
    Json,
    Jsonb,
    Date,
    Time,
    Timetz,
    Timestamp,
    Timestamptz,
    /// Array of the given element type, per the `_`-prefixed name convention.
    Array(Box<PgType>),
    Other,
}

impl PgType {
    /// Classify by the catalog OID recorded on the `Relation` message's
    /// column. The `Relation` message only carries `type_oid`, never the
    /// type name, so built-in array OIDs (Postgres assigns one per element
    /// type) are enumerated here too — this is the only way this crate's
    /// decoder can ever detect an array column. Falls back to `Other`
    /// (pass-through) for anything else; [`PgType::from_type_name`] remains
    /// the authoritative classifier for the rarer case where a type name is
    /// available (e.g. resolved from a decoded `Type` message).
    pub fn from_oid(oid: u32) -> Self {
        match oid {
            16 => PgType::Bool,
            17 => PgType::Bytea,
            20 => PgType::Int8,
            21 => PgType::Int2,
            23 => PgType::Int4,
            26 => PgType::Oid,
            25 => PgType::Text,
            114 => PgType::Json,
            700 => PgType::Float4,
            701 => PgType::Float8,
            790 => PgType::Money,
            1042 => PgType::Bpchar,
            1043 => PgType::Varchar,
            1082 => PgType::Date,
            1083 => PgType::Time,
            1114 => PgType::Timestamp,
            1184 => PgType::Timestamptz,
            1266 => PgType::Timetz,
            1700 => PgType::Numeric,
            2950 => PgType::Uuid,
            3802 => PgType::Jsonb,
            1000 => PgType::Array(Box::new(PgType::Bool)),
            1001 => PgType::Array(Box::new(PgType::Bytea)),
            1005 => PgType::Array(Box::new(PgType::Int2)),
            1007 => PgType::Array(Box::new(PgType::Int4)),
            1016 => PgType::Array(Box::new(PgType::Int8)),
            1028 => PgType::Array(Box::new(PgType::Oid)),
            1009 => PgType::Array(Box::new(PgType::Text)),
            199 => PgType::Array(Box::new(PgType::Json)),
            1021 => PgType::Array(Box::new(PgType::Float4)),
            1022 => PgType::Array(Box::new(PgType::Float8)),
            791 => PgType::Array(Box::new(PgType::Money)),
            1014 => PgType::Array(Box::new(PgType::Bpchar)),
            1015 => PgType::Array(Box::new(PgType::Varchar)),
            1182 => PgType::Array(Box::new(PgType::Date)),
            1183 => PgType::Array(Box::new(PgType::Time)),
            1115 => PgType::Array(Box::new(PgType::Timestamp)),
            1185 => PgType::Array(Box::new(PgType::Timestamptz)),
            1270 => PgType::Array(Box::new(PgType::Timetz)),
            1231 => PgType::Array(Box::new(PgType::Numeric)),
            2951 => PgType::Array(Box::new(PgType::Uuid)),
            3807 => PgType::Array(Box::new(PgType::Jsonb)),
            _ => PgType::Other,
        }
    }

    /// Classify by the catalog type *name*, which is how array-ness is
    /// actually signaled (`_text`, `_int4`, ...).
    pub fn from_type_name(name: &str) -> Self {
        if let Some(element_name) = name.strip_prefix('_') {
            return PgType::Array(Box::new(PgType::from_type_name(element_name)));
        }
        match name {
            "bool" => PgType::Bool,
            "bytea" => PgType::Bytea,
            "int2" | "smallint" => PgType::Int2,
            "int4" | "integer" | "int" => PgType::Int4,
            "int8" | "bigint" => PgType::Int8,
            "oid" => PgType::Oid,
            "float4" | "real" => PgType::Float4,
            "float8" | "double precision" => PgType::Float8,
            "numeric" | "decimal" => PgType::Numeric,
            "money" => PgType::Money,
            "text" => PgType::Text,
            "varchar" | "character varying" => PgType::Varchar,
            "bpchar" | "character" => PgType::Bpchar,
            "uuid" => PgType::Uuid,
            "json" => PgType::Json,
            "jsonb" => PgType::Jsonb,
            "date" => PgType::Date,
            "time" => PgType::Time,
            "timetz" => PgType::Timetz,
            "timestamp" => PgType::Timestamp,
            "timestamptz" => PgType::Timestamptz,
            _ => PgType::Other,
        }
    }
}

/// A cast value, the output of [`cast`]. `Raw` is the pass-through used both
/// for genuinely untyped columns and for values that failed to parse under
/// their declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CastValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision numeric/money, kept as normalized text: the
    /// corpus has no bignum decimal crate, and a lossy `f64` would violate
    /// the "arbitrary-precision" requirement.
    Decimal(String),
    Text(String),
    Bytea(Vec<u8>),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(Uuid),
    Json(serde_json::Value),
    Array(Vec<CastValue>),
    Raw(String),
}

/// Cast `raw` (the decoder's text-form column value) against `pg_type`.
/// Never fails: a parse error degrades to `CastValue::Raw(raw)` and is
/// logged, per the "cast failure never aborts the transaction" rule.
pub fn cast(pg_type: &PgType, raw: &str) -> CastValue {
    match pg_type {
        PgType::Bool => match raw {
            "t" => CastValue::Bool(true),
            "f" => CastValue::Bool(false),
            _ => fallback("bool", raw, "expected 't' or 'f'"),
        },
        PgType::Int2 | PgType::Int4 | PgType::Int8 | PgType::Oid => match raw.parse::<i64>() {
            Ok(v) => CastValue::Int(v),
            Err(e) => fallback("int", raw, &e.to_string()),
        },
        PgType::Float4 | PgType::Float8 => match raw.parse::<f64>() {
            Ok(v) => CastValue::Float(v),
            Err(e) => fallback("float", raw, &e.to_string()),
        },
        PgType::Numeric | PgType::Money => match validate_decimal_text(raw) {
            Ok(normalized) => CastValue::Decimal(normalized),
            Err(reason) => fallback("numeric", raw, &reason),
        },
        PgType::Bytea => match decode_bytea(raw) {
            Ok(bytes) => CastValue::Bytea(bytes),
            Err(reason) => fallback("bytea", raw, &reason),
        },
        PgType::Timestamp => match parse_timestamp(raw) {
            Ok(v) => CastValue::Timestamp(v),
            Err(reason) => fallback("timestamp", raw, &reason),
        },
        PgType::Timestamptz => match parse_timestamptz(raw) {
            Ok(v) => CastValue::TimestampTz(v),
            Err(reason) => fallback("timestamptz", raw, &reason),
        },
        PgType::Date => match NaiveDate::from_str(raw) {
            Ok(v) => CastValue::Date(v),
            Err(e) => fallback("date", raw, &e.to_string()),
        },
        PgType::Time | PgType::Timetz => match parse_time(raw) {
            Ok(v) => CastValue::Time(v),
            Err(reason) => fallback("time", raw, &reason),
        },
        PgType::Uuid => match Uuid::try_parse(raw) {
            Ok(v) => CastValue::Uuid(v),
            Err(e) => fallback("uuid", raw, &e.to_string()),
        },
        PgType::Json | PgType::Jsonb => match serde_json::Value::from_str(raw) {
            Ok(v) => CastValue::Json(v),
            Err(e) => fallback("json", raw, &e.to_string()),
        },
        PgType::Array(element) => CastValue::Array(cast_array(element, raw)),
        PgType::Text | PgType::Varchar | PgType::Bpchar | PgType::Other => {
            CastValue::Text(raw.to_string())
        }
    }
}

fn fallback(type_name: &str, raw: &str, reason: &str) -> CastValue {
    warn!(pg_type = type_name, raw, reason, "cast failed, forwarding raw text");
    CastValue::Raw(raw.to_string())
}

fn validate_decimal_text(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let body = body.strip_prefix('$').unwrap_or(body);
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return Err(format!("not a decimal literal: {raw}"));
    }
    Ok(trimmed.to_string())
}

/// Postgres' own textual `timestamp` output is space-separated
/// (`2024-03-01 16:11:32.272722`), not the ISO `T`-separated form
/// `NaiveDateTime`'s `FromStr` expects.
fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| e.to_string())
}

fn parse_timestamptz(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|dt| dt.to_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.to_utc()))
        .map_err(|e| e.to_string())
}

fn parse_time(raw: &str) -> Result<NaiveTime, String> {
    let without_tz = raw
        .split_once(['+', '-'])
        .map(|(t, _)| t)
        .unwrap_or(raw);
    NaiveTime::parse_from_str(without_tz, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(without_tz, "%H:%M:%S"))
        .map_err(|e| e.to_string())
}

/// Postgres hex (`\x...`) or legacy escape bytea text form.
fn decode_bytea(raw: &str) -> Result<Vec<u8>, String> {
    if let Some(hex) = raw.strip_prefix("\\x") {
        if hex.len() % 2 != 0 {
            return Err("odd-length hex bytea".to_string());
        }
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        let chars: Vec<char> = hex.chars().collect();
        for pair in chars.chunks(2) {
            let byte_str: String = pair.iter().collect();
            let byte = u8::from_str_radix(&byte_str, 16).map_err(|e| e.to_string())?;
            bytes.push(byte);
        }
        return Ok(bytes);
    }

    let mut bytes = Vec::new();
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' {
            if chars.get(i + 1) == Some(&'\\') {
                bytes.push(b'\\');
                i += 2;
            } else if chars.get(i + 1..i + 4).map(|s| s.iter().collect::<String>())
                .as_deref()
                .is_some_and(|s| s.chars().all(|c| c.is_digit(8)))
            {
                let octal: String = chars[i + 1..i + 4].iter().collect();
                let byte = u8::from_str_radix(&octal, 8).map_err(|e| e.to_string())?;
                bytes.push(byte);
                i += 4;
            } else {
                return Err(format!("invalid escape at byte {i}"));
            }
        } else {
            bytes.push(chars[i] as u8);
            i += 1;
        }
    }
    Ok(bytes)
}

/// Split a `{e1,e2,...}` array payload on unquoted commas, stripping
/// surrounding double quotes and unescaping `\"`/`\\`, then cast each
/// element recursively.
fn cast_array(element_type: &PgType, raw: &str) -> Vec<CastValue> {
    let inner = raw.trim();
    let inner = inner
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(inner);

    split_array_elements(inner)
        .into_iter()
        .map(|element| {
            if element.eq_ignore_ascii_case("null") {
                CastValue::Null
            } else {
                cast(element_type, &element)
            }
        })
        .collect()
}

fn split_array_elements(body: &str) -> Vec<String> {
    if body.is_empty() {
        return Vec::new();
    }
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if !in_quotes => in_quotes = true,
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(&next) = chars.peek() {
                    if next == '"' || next == '\\' {
                        current.push(next);
                        chars.next();
                        continue;
                    }
                }
                current.push(c);
            }
            ',' if !in_quotes => {
                elements.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    elements.push(current);
    elements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts_bool() {
        assert_eq!(cast(&PgType::Bool, "t"), CastValue::Bool(true));
        assert_eq!(cast(&PgType::Bool, "f"), CastValue::Bool(false));
    }

    #[test]
    fn casts_int_overflow_falls_back_to_raw() {
        let huge = "99999999999999999999999999";
        assert_eq!(cast(&PgType::Int4, huge), CastValue::Raw(huge.to_string()));
    }

    #[test]
    fn array_cast_splits_on_unquoted_commas_and_unescapes() {
        let element = PgType::from_type_name("text");
        let values = cast_array(&element, r#"{"royal,interest",plain}"#);
        assert_eq!(
            values,
            vec![
                CastValue::Text("royal,interest".to_string()),
                CastValue::Text("plain".to_string()),
            ]
        );
    }

    #[test]
    fn array_oid_detection_for_builtin_text_array() {
        match PgType::from_oid(1009) {
            PgType::Array(inner) => assert_eq!(*inner, PgType::Text),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn array_type_name_detection() {
        match PgType::from_type_name("_text") {
            PgType::Array(inner) => assert_eq!(*inner, PgType::Text),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn decodes_hex_bytea() {
        assert_eq!(
            decode_bytea("\\x68656c6c6f").unwrap(),
            b"hello".to_vec()
        );
    }

    #[test]
    fn casts_space_separated_timestamp_text() {
        match cast(&PgType::Timestamp, "2024-03-01 16:11:32.272722") {
            CastValue::Timestamp(v) => {
                assert_eq!(v.to_string(), "2024-03-01 16:11:32.272722");
            }
            other => panic!("expected Timestamp, got {other:?}"),
        }
    }

    #[test]
    fn casts_timestamp_without_fractional_seconds() {
        match cast(&PgType::Timestamp, "2024-03-01 16:11:32") {
            CastValue::Timestamp(_) => {}
            other => panic!("expected Timestamp, got {other:?}"),
        }
    }
}
