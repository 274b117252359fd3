use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::Arguments;

pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParamType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }

    fn json_name(&self) -> Option<&'static str> {
        match self {
            ParamType::String => Some("string"),
            ParamType::Integer => Some("integer"),
            ParamType::Number => Some("number"),
            ParamType::Boolean => Some("boolean"),
            ParamType::Object => Some("object"),
            ParamType::Array => Some("array"),
            ParamType::Any => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// Declared parameters of a tool, checked before every dispatch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
    /// Accept arguments that are not declared
    #[serde(default)]
    pub allow_extra: bool,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, ty: ParamType, description: &str) -> Self {
        self.params.insert(
            name.to_string(),
            ParamSpec {
                ty,
                required: true,
                description: description.to_string(),
            },
        );
        self
    }

    pub fn optional(mut self, name: &str, ty: ParamType, description: &str) -> Self {
        self.params.insert(
            name.to_string(),
            ParamSpec {
                ty,
                required: false,
                description: description.to_string(),
            },
        );
        self
    }

    pub fn open(mut self) -> Self {
        self.allow_extra = true;
        self
    }

    /// Check the schema itself is usable
    pub fn validate_definition(&self) -> Result<(), String> {
        for name in self.params.keys() {
            if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
                return Err(format!("invalid parameter name '{}'", name));
            }
        }
        Ok(())
    }

    /// Check call arguments against the declared parameters.
    pub fn check(&self, args: &Arguments) -> Result<(), String> {
        for (name, spec) in &self.params {
            match args.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required parameter '{}'", name));
                }
                Some(Value::Null) | None => {}
                Some(v) if !spec.ty.matches(v) => {
                    return Err(format!(
                        "parameter '{}' must be of type {:?}",
                        name, spec.ty
                    ));
                }
                Some(_) => {}
            }
        }
        if !self.allow_extra {
            if let Some(extra) = args.keys().find(|k| !self.params.contains_key(*k)) {
                return Err(format!("unknown parameter '{}'", extra));
            }
        }
        Ok(())
    }

    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for (name, spec) in &self.params {
            let mut prop = serde_json::Map::new();
            if let Some(t) = spec.ty.json_name() {
                prop.insert("type".into(), Value::from(t));
            }
            if !spec.description.is_empty() {
                prop.insert("description".into(), Value::from(spec.description.clone()));
            }
            properties.insert(name.clone(), Value::Object(prop));
        }
        let required: Vec<&String> = self
            .params
            .iter()
            .filter(|(_, s)| s.required)
            .map(|(n, _)| n)
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_extra,
        })
    }
}

/// Tool names: 1-64 chars of ASCII letters, digits, `_`, `-` or `.`
pub fn validate_tool_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(format!(
            "tool name must be 1-{} characters, got {}",
            MAX_NAME_LEN,
            name.len()
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(format!("tool name '{}' contains invalid characters", name));
    }
    Ok(())
}

/// Versions are one to three dot-separated numbers, e.g. `1.2.0`
pub fn validate_version(version: &str) -> Result<(), String> {
    let parts: Vec<&str> = version.split('.').collect();
    let ok = (1..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if ok {
        Ok(())
    } else {
        Err(format!("invalid version '{}'", version))
    }
}
