//! Typed provider settings.
//!
//! A provider declares a [`SettingsSchema`]; raw values coming from the
//! configuration store are validated against it into [`ProviderSettings`]
//! before a provider instance is ever created.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    String,
    Number,
    Boolean,
}

impl fmt::Display for SettingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SettingType::String => "string",
            SettingType::Number => "number",
            SettingType::Boolean => "boolean",
        })
    }
}

/// A raw or validated setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl SettingValue {
    pub fn setting_type(&self) -> SettingType {
        match self {
            SettingValue::Boolean(_) => SettingType::Boolean,
            SettingValue::Number(_) => SettingType::Number,
            SettingValue::String(_) => SettingType::String,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::String(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::String(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Boolean(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Number(value)
    }
}

/// Raw settings as supplied by the configuration collaborator.
pub type RawSettings = BTreeMap<String, SettingValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingField {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: SettingType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub secret: bool,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<SettingValue>,
}

impl SettingField {
    pub fn new(key: &str, kind: SettingType, display_name: &str) -> Self {
        Self {
            key: key.to_string(),
            kind,
            required: false,
            secret: false,
            display_name: display_name.to_string(),
            description: String::new(),
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn default_value(mut self, value: impl Into<SettingValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Convenience for the ubiquitous API key field.
    pub fn api_key() -> Self {
        SettingField::new("api_key", SettingType::String, "API key")
            .required()
            .secret()
            .describe("Key issued by the provider's developer portal")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsSchema {
    fields: Vec<SettingField>,
}

impl SettingsSchema {
    pub fn new(fields: Vec<SettingField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[SettingField] {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&SettingField> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Replace defaults of existing fields. Unknown keys are reported.
    pub fn with_defaults(mut self, defaults: &RawSettings) -> Result<Self, Vec<String>> {
        let mut problems = Vec::new();
        for (key, value) in defaults {
            match self.fields.iter_mut().find(|f| &f.key == key) {
                Some(field) if field.kind == value.setting_type() => {
                    field.default = Some(value.clone());
                }
                Some(field) => problems.push(format!(
                    "default for '{key}' must be a {}, got a {}",
                    field.kind,
                    value.setting_type()
                )),
                None => problems.push(format!("default given for unknown setting '{key}'")),
            }
        }
        if problems.is_empty() { Ok(self) } else { Err(problems) }
    }

    /// Validate raw settings, applying defaults. Every problem is collected
    /// rather than stopping at the first one.
    pub fn validate(&self, raw: &RawSettings) -> Result<ProviderSettings, Vec<String>> {
        let mut problems = Vec::new();
        let mut values = BTreeMap::new();

        for field in &self.fields {
            match raw.get(&field.key).or(field.default.as_ref()) {
                Some(value) if value.setting_type() != field.kind => problems.push(format!(
                    "'{}' must be a {}, got a {}",
                    field.key,
                    field.kind,
                    value.setting_type()
                )),
                Some(SettingValue::String(s)) if field.required && s.trim().is_empty() => {
                    problems.push(format!("required setting '{}' is empty", field.key));
                }
                Some(value) => {
                    values.insert(field.key.clone(), value.clone());
                }
                None if field.required => {
                    problems.push(format!("missing required setting '{}'", field.key));
                }
                None => {}
            }
        }

        for key in raw.keys() {
            if self.field(key).is_none() {
                problems.push(format!("unknown setting '{key}'"));
            }
        }

        if !problems.is_empty() {
            return Err(problems);
        }

        let secrets = self
            .fields
            .iter()
            .filter(|f| f.secret)
            .map(|f| f.key.clone())
            .collect();

        Ok(ProviderSettings { values, secrets })
    }
}

/// Settings that passed schema validation.
#[derive(Clone, Default, PartialEq)]
pub struct ProviderSettings {
    values: BTreeMap<String, SettingValue>,
    secrets: Vec<String>,
}

impl ProviderSettings {
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(SettingValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(SettingValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn boolean(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(SettingValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn is_secret(&self, key: &str) -> bool {
        self.secrets.iter().any(|s| s == key)
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.values {
            if self.is_secret(key) {
                map.entry(key, &"<redacted>");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}
