//! Schema datatype and pure validator for primitive inputs and outputs.
//!
//! Descriptors declare what they accept and produce with [`Schema`], a sum
//! of constraints that serializes like a JSON Schema fragment. Validation
//! is synchronous and performs no I/O; failures come back as a list of
//! [`Violation`]s suitable for the `data.violations` field of an
//! `invalid params` error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON value classes a schema can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl SchemaType {
    /// Wire name of the type, used in violation reports.
    pub fn name(self) -> &'static str {
        match self {
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Array => "array",
            SchemaType::Object => "object",
            SchemaType::Null => "null",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Array => value.is_array(),
            SchemaType::Object => value.is_object(),
            SchemaType::Null => value.is_null(),
        }
    }
}

/// Declarative constraints over a JSON value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Accepted literal values. Checked after the type constraint.
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Regular expression the whole string must match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Element schema, when `schema_type` is `array`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    /// Property schemas, when `schema_type` is `object`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Schema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    /// Whether object keys outside `properties` are accepted. Defaults to
    /// true, mirroring JSON Schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

/// A single validation failure, addressed by a dotted/indexed path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

impl Schema {
    fn of(schema_type: SchemaType) -> Self {
        Schema {
            schema_type,
            description: None,
            enum_values: None,
            minimum: None,
            maximum: None,
            min_length: None,
            max_length: None,
            pattern: None,
            items: None,
            properties: None,
            required: None,
            additional_properties: None,
        }
    }

    pub fn string() -> Self {
        Self::of(SchemaType::String)
    }

    pub fn number() -> Self {
        Self::of(SchemaType::Number)
    }

    pub fn integer() -> Self {
        Self::of(SchemaType::Integer)
    }

    pub fn boolean() -> Self {
        Self::of(SchemaType::Boolean)
    }

    pub fn null() -> Self {
        Self::of(SchemaType::Null)
    }

    pub fn array(items: Schema) -> Self {
        let mut s = Self::of(SchemaType::Array);
        s.items = Some(Box::new(items));
        s
    }

    /// Object schema; every listed property is also marked required.
    pub fn object<I>(properties: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, Schema)>,
    {
        let props: BTreeMap<String, Schema> = properties
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        let mut s = Self::of(SchemaType::Object);
        s.required = Some(props.keys().cloned().collect());
        s.properties = Some(props);
        s
    }

    /// Object schema with an explicit required set.
    pub fn object_with_required<I>(properties: I, required: &[&str]) -> Self
    where
        I: IntoIterator<Item = (&'static str, Schema)>,
    {
        let mut s = Self::object(properties);
        s.required = Some(required.iter().map(|r| (*r).to_owned()).collect());
        s
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn with_range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn closed(mut self) -> Self {
        self.additional_properties = Some(false);
        self
    }

    /// Verify the schema itself is well formed: every `pattern` anywhere in
    /// the tree must compile. Called once at registration time so that
    /// [`Schema::validate`] never trips over a bad schema at call time.
    pub fn check(&self) -> Result<(), String> {
        if let Some(pattern) = &self.pattern {
            Regex::new(pattern).map_err(|e| format!("invalid pattern `{pattern}`: {e}"))?;
        }
        if let Some(items) = &self.items {
            items.check()?;
        }
        if let Some(props) = &self.properties {
            for schema in props.values() {
                schema.check()?;
            }
        }
        Ok(())
    }

    /// Validate `value`, collecting every violation instead of stopping at
    /// the first.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();
        self.validate_at("", value, &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn validate_at(&self, path: &str, value: &Value, out: &mut Vec<Violation>) {
        if !self.schema_type.matches(value) {
            out.push(Violation {
                path: path.to_owned(),
                expected: self.schema_type.name().to_owned(),
                actual: type_name_of(value).to_owned(),
            });
            return;
        }

        if let Some(allowed) = &self.enum_values {
            if !allowed.contains(value) {
                out.push(Violation {
                    path: path.to_owned(),
                    expected: format!("one of {}", serde_json::to_string(allowed).unwrap_or_default()),
                    actual: value.to_string(),
                });
                return;
            }
        }

        match self.schema_type {
            SchemaType::String => self.validate_string(path, value, out),
            SchemaType::Number | SchemaType::Integer => self.validate_number(path, value, out),
            SchemaType::Array => self.validate_array(path, value, out),
            SchemaType::Object => self.validate_object(path, value, out),
            SchemaType::Boolean | SchemaType::Null => {}
        }
    }

    fn validate_string(&self, path: &str, value: &Value, out: &mut Vec<Violation>) {
        let s = value.as_str().unwrap_or_default();
        let len = s.chars().count();
        if let Some(min) = self.min_length {
            if len < min {
                out.push(Violation {
                    path: path.to_owned(),
                    expected: format!("length >= {min}"),
                    actual: format!("length {len}"),
                });
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                out.push(Violation {
                    path: path.to_owned(),
                    expected: format!("length <= {max}"),
                    actual: format!("length {len}"),
                });
            }
        }
        if let Some(pattern) = &self.pattern {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(s) => {}
                Ok(_) => out.push(Violation {
                    path: path.to_owned(),
                    expected: format!("match of /{pattern}/"),
                    actual: value.to_string(),
                }),
                // `check()` rejects bad patterns at registration; a miss here
                // means the schema bypassed the registry.
                Err(_) => out.push(Violation {
                    path: path.to_owned(),
                    expected: "valid pattern".to_owned(),
                    actual: format!("unparseable pattern /{pattern}/"),
                }),
            }
        }
    }

    fn validate_number(&self, path: &str, value: &Value, out: &mut Vec<Violation>) {
        let n = value.as_f64().unwrap_or_default();
        if let Some(min) = self.minimum {
            if n < min {
                out.push(Violation {
                    path: path.to_owned(),
                    expected: format!(">= {min}"),
                    actual: n.to_string(),
                });
            }
        }
        if let Some(max) = self.maximum {
            if n > max {
                out.push(Violation {
                    path: path.to_owned(),
                    expected: format!("<= {max}"),
                    actual: n.to_string(),
                });
            }
        }
    }

    fn validate_array(&self, path: &str, value: &Value, out: &mut Vec<Violation>) {
        let elements = value.as_array().map(Vec::as_slice).unwrap_or_default();
        if let Some(items) = &self.items {
            for (i, element) in elements.iter().enumerate() {
                items.validate_at(&format!("{path}[{i}]"), element, out);
            }
        }
    }

    fn validate_object(&self, path: &str, value: &Value, out: &mut Vec<Violation>) {
        let Some(map) = value.as_object() else {
            return;
        };

        if let Some(required) = &self.required {
            for key in required {
                if !map.contains_key(key) {
                    let expected = self
                        .properties
                        .as_ref()
                        .and_then(|p| p.get(key))
                        .map(|s| s.schema_type.name().to_owned())
                        .unwrap_or_else(|| "present".to_owned());
                    out.push(Violation {
                        path: join_path(path, key),
                        expected,
                        actual: "missing".to_owned(),
                    });
                }
            }
        }

        if let Some(props) = &self.properties {
            for (key, schema) in props {
                if let Some(nested) = map.get(key) {
                    schema.validate_at(&join_path(path, key), nested, out);
                }
            }
        }

        if self.additional_properties == Some(false) {
            for key in map.keys() {
                let declared = self
                    .properties
                    .as_ref()
                    .is_some_and(|props| props.contains_key(key));
                if !declared {
                    out.push(Violation {
                        path: join_path(path, key),
                        expected: "no additional properties".to_owned(),
                        actual: "present".to_owned(),
                    });
                }
            }
        }
    }
}

fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_owned()
    } else {
        format!("{base}.{key}")
    }
}

fn type_name_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
