//! Typed descriptors for provider settings.
//!
//! Each provider declares its settings as a list of descriptors, so forms and
//! validation can be generated without per-provider code.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Number,
    String,
    Boolean,
    Select,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: PropertyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl PropertyDescriptor {
    fn new(name: &str, label: &str, kind: PropertyKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind,
            default: None,
            required: false,
            min: None,
            max: None,
            options: Vec::new(),
        }
    }

    pub fn string(name: &str, label: &str) -> Self {
        Self::new(name, label, PropertyKind::String)
    }

    pub fn number(name: &str, label: &str) -> Self {
        Self::new(name, label, PropertyKind::Number)
    }

    pub fn boolean(name: &str, label: &str) -> Self {
        Self::new(name, label, PropertyKind::Boolean)
    }

    pub fn select(name: &str, label: &str, options: &[&str]) -> Self {
        let mut descriptor = Self::new(name, label, PropertyKind::Select);
        descriptor.options = options.iter().map(|o| o.to_string()).collect();
        descriptor
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        match self.kind {
            PropertyKind::Number => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| format!("{} must be a number", self.name))?;
                if let Some(min) = self.min {
                    if n < min {
                        return Err(format!("{} must be at least {}", self.name, min));
                    }
                }
                if let Some(max) = self.max {
                    if n > max {
                        return Err(format!("{} must be at most {}", self.name, max));
                    }
                }
            }
            PropertyKind::String => {
                value
                    .as_str()
                    .ok_or_else(|| format!("{} must be a string", self.name))?;
            }
            PropertyKind::Boolean => {
                value
                    .as_bool()
                    .ok_or_else(|| format!("{} must be true or false", self.name))?;
            }
            PropertyKind::Select => {
                let s = value
                    .as_str()
                    .ok_or_else(|| format!("{} must be a string", self.name))?;
                if !self.options.iter().any(|o| o == s) {
                    return Err(format!(
                        "{} must be one of: {}",
                        self.name,
                        self.options.join(", ")
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Validate a config object against descriptors and fill in defaults.
///
/// Unknown keys are kept as-is. Returns every problem found, not just the first.
pub fn validate_config(
    descriptors: &[PropertyDescriptor],
    config: &Value,
) -> Result<Map<String, Value>, Vec<String>> {
    let mut resolved = match config {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return Err(vec!["configuration must be an object".to_string()]),
    };
    let mut problems = Vec::new();

    for descriptor in descriptors {
        match resolved.get(&descriptor.name) {
            Some(Value::Null) | None => {
                if let Some(default) = &descriptor.default {
                    resolved.insert(descriptor.name.clone(), default.clone());
                } else if descriptor.required {
                    problems.push(format!("{} is required", descriptor.name));
                }
            }
            Some(value) => {
                if let Err(problem) = descriptor.check(value) {
                    problems.push(problem);
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(resolved)
    } else {
        Err(problems)
    }
}
