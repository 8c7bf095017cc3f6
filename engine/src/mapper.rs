//! Entity mapping between local rows and external-store records.
//!
//! Each entity kind has a [`KindMapping`] describing how its local fields
//! correspond to external properties and how values are coerced on the way
//! in. Mapping is pure and deterministic.
//!
//! # Schema drift
//!
//! - Unknown external properties are kept in an extras bucket and written
//!   back on the next push.
//! - Missing or null properties take the field's documented default.
//! - Unrecognized select options become [`UNKNOWN_OPTION`]; the raw value is
//!   kept in extras so it survives the next push.
//!
//! Values of the wrong shape are corrupt and fail with [`Error::Mapping`].

use crate::{error::Result, EntityKind, Error, Fields, SchemaVersion};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Sentinel for select values outside the whitelist.
pub const UNKNOWN_OPTION: &str = "unknown";

/// Suffix of the extras key holding a raw unrecognized select value.
const RAW_SUFFIX: &str = "#raw";

/// How a field's values are coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Number,
    Bool,
    /// Canonical UTC RFC 3339 instant with millisecond precision
    Timestamp,
    /// String from a whitelist
    Select,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Text => write!(f, "Text"),
            FieldType::Integer => write!(f, "Integer"),
            FieldType::Number => write!(f, "Number"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Select => write!(f, "Select"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Mapping of one local field to one external property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Local column name
    pub local: String,
    /// External property name
    pub external: String,
    pub field_type: FieldType,
    /// Value used when the external property is missing or null
    #[serde(default)]
    pub default: Value,
    /// Whitelist for [`FieldType::Select`]
    #[serde(default)]
    pub options: Vec<String>,
}

impl FieldDef {
    /// A field whose local and external names differ.
    pub fn new(
        local: impl Into<String>,
        external: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        Self {
            local: local.into(),
            external: external.into(),
            field_type,
            default: Value::Null,
            options: Vec::new(),
        }
    }

    /// A field with the same name on both sides.
    pub fn same(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self::new(name.clone(), name, field_type)
    }

    /// A select field with its whitelist.
    pub fn select<I, S>(local: impl Into<String>, external: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut def = Self::new(local, external, FieldType::Select);
        def.options = options.into_iter().map(Into::into).collect();
        def
    }

    /// Set the default used for missing values.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    fn raw_key(&self) -> String {
        format!("{}{}", self.external, RAW_SUFFIX)
    }

    /// Coerce an external value into its canonical local form.
    fn coerce_in(&self, kind: &str, value: &Value) -> Result<Value> {
        let mismatch = |expected: &str| Error::Mapping {
            kind: kind.to_string(),
            field: self.external.clone(),
            reason: format!("expected {expected}, got {}", json_type_name(value)),
        };

        match (self.field_type, value) {
            (_, Value::Null) => Ok(self.default.clone()),
            (FieldType::Text, Value::String(_)) => Ok(value.clone()),
            (FieldType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(value.clone())
            }
            (FieldType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch("integer")),
            (FieldType::Number, Value::Number(_)) => Ok(value.clone()),
            (FieldType::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch("number")),
            (FieldType::Bool, Value::Bool(_)) => Ok(value.clone()),
            (FieldType::Bool, Value::String(s)) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch("bool")),
            },
            (FieldType::Timestamp, Value::String(s)) => parse_instant(s)
                .map(|at| Value::String(canonical_instant(&at)))
                .ok_or_else(|| mismatch("RFC 3339 timestamp")),
            (FieldType::Timestamp, Value::Number(n)) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .map(|at| Value::String(canonical_instant(&at)))
                .ok_or_else(|| mismatch("epoch milliseconds")),
            (FieldType::Select, Value::String(s)) => {
                if self.options.iter().any(|o| o == s) {
                    Ok(value.clone())
                } else {
                    Ok(Value::String(UNKNOWN_OPTION.to_string()))
                }
            }
            (FieldType::Json, _) => Ok(value.clone()),
            (FieldType::Text, _) => Err(mismatch("string")),
            (FieldType::Integer, _) => Err(mismatch("integer")),
            (FieldType::Number, _) => Err(mismatch("number")),
            (FieldType::Bool, _) => Err(mismatch("bool")),
            (FieldType::Timestamp, _) => Err(mismatch("timestamp")),
            (FieldType::Select, _) => Err(mismatch("string")),
        }
    }

    /// Check a local value before it leaves for the external store.
    fn coerce_out(&self, kind: &str, value: &Value, extras: &Fields) -> Result<Value> {
        let mismatch = |expected: &str| Error::Mapping {
            kind: kind.to_string(),
            field: self.local.clone(),
            reason: format!("expected {expected}, got {}", json_type_name(value)),
        };

        let valid = match (self.field_type, value) {
            (_, Value::Null) => true,
            (FieldType::Text, v) => v.is_string(),
            (FieldType::Integer, v) => v.is_i64() || v.is_u64(),
            (FieldType::Number, v) => v.is_number(),
            (FieldType::Bool, v) => v.is_boolean(),
            (FieldType::Timestamp, Value::String(s)) => {
                if parse_instant(s).is_none() {
                    return Err(mismatch("RFC 3339 timestamp"));
                }
                true
            }
            (FieldType::Timestamp, _) => false,
            (FieldType::Select, Value::String(s)) if s == UNKNOWN_OPTION => {
                if let Some(raw) = extras.get(&self.raw_key()) {
                    return Ok(raw.clone());
                }
                true
            }
            (FieldType::Select, v) => v.is_string(),
            (FieldType::Json, _) => true,
        };

        if valid {
            Ok(value.clone())
        } else {
            Err(mismatch(&self.field_type.to_string()))
        }
    }
}

/// Mapping for one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindMapping {
    pub kind: EntityKind,
    /// Bumped whenever the field list changes
    pub schema_version: SchemaVersion,
    pub fields: Vec<FieldDef>,
}

impl KindMapping {
    pub fn new(kind: impl Into<EntityKind>, schema_version: SchemaVersion, fields: Vec<FieldDef>) -> Self {
        Self {
            kind: kind.into(),
            schema_version,
            fields,
        }
    }

    fn is_known_external(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.external == name)
    }

    /// Local field name for an external property.
    pub fn local_name(&self, external: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.external == external)
            .map(|f| f.local.as_str())
    }
}

/// Local side of a mapped record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFields {
    pub fields: Fields,
    /// Unknown external properties, kept for forward compatibility
    pub extras: Fields,
}

/// Registry of mappings keyed by entity kind.
#[derive(Debug, Clone, Default)]
pub struct EntityMapper {
    mappings: HashMap<EntityKind, KindMapping>,
}

impl EntityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapping, replacing any previous one for the kind.
    pub fn register(&mut self, mapping: KindMapping) -> &mut Self {
        self.mappings.insert(mapping.kind.clone(), mapping);
        self
    }

    /// Builder-style registration.
    pub fn with_kind(mut self, mapping: KindMapping) -> Self {
        self.register(mapping);
        self
    }

    pub fn mapping(&self, kind: &str) -> Result<&KindMapping> {
        self.mappings
            .get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &EntityKind> {
        self.mappings.keys()
    }

    /// Translate local fields into external properties.
    pub fn to_external(&self, kind: &str, fields: &Fields, extras: &Fields) -> Result<Fields> {
        let mapping = self.mapping(kind)?;
        let mut properties = Fields::new();

        for (key, value) in extras {
            if !key.ends_with(RAW_SUFFIX) && !mapping.is_known_external(key) {
                properties.insert(key.clone(), value.clone());
            }
        }

        for def in &mapping.fields {
            let value = fields.get(&def.local).unwrap_or(&Value::Null);
            properties.insert(def.external.clone(), def.coerce_out(kind, value, extras)?);
        }

        Ok(properties)
    }

    /// Translate an external payload into local fields plus extras.
    pub fn to_local(&self, kind: &str, payload: &Value) -> Result<LocalFields> {
        let mapping = self.mapping(kind)?;
        let properties = payload.as_object().ok_or_else(|| Error::CorruptPayload {
            kind: kind.to_string(),
            reason: format!("expected object, got {}", json_type_name(payload)),
        })?;

        let mut local = LocalFields::default();

        for def in &mapping.fields {
            let raw = properties.get(&def.external).unwrap_or(&Value::Null);
            let value = def.coerce_in(kind, raw)?;
            if def.field_type == FieldType::Select
                && value.as_str() == Some(UNKNOWN_OPTION)
                && raw.as_str() != Some(UNKNOWN_OPTION)
            {
                local.extras.insert(def.raw_key(), raw.clone());
            }
            local.fields.insert(def.local.clone(), value);
        }

        for (key, value) in properties {
            if !mapping.is_known_external(key) {
                local.extras.insert(key.clone(), value.clone());
            }
        }

        Ok(local)
    }
}

/// Parse the instant formats the external store is known to emit.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Canonical textual form of an instant.
pub fn canonical_instant(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
