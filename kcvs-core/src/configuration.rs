use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque, string-keyed configuration handed through to scan jobs and
/// backend transactions without interpretation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    values: BTreeMap<String, Value>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Typed lookup. Returns `None` when the key is missing or the stored value
    /// does not deserialize into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Copies every entry of `other` over this configuration.
    pub fn merge(&mut self, other: &Configuration) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Settings used to open the transaction that backs a scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub read_only: bool,
    /// Backend-specific options, passed through verbatim.
    #[serde(default)]
    pub custom_options: Configuration,
}

impl TransactionConfig {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            custom_options: Configuration::new(),
        }
    }

    pub fn with_custom_options(mut self, options: Configuration) -> Self {
        self.custom_options = options;
        self
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self::read_only()
    }
}
