//! Flat string property maps.
//!
//! Pipeline, rate limiter and consistency-check settings are all passed
//! as `key = value` strings and parsed at construction time.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Ordered string key/value properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    /// Creates an empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds properties from key/value pairs.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Sets a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parses the value for `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the value does not parse.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Value for a required key.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the key is absent.
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Returns `true` if no properties are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates properties in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Renders as `key=value,key=value` in key order, the form status
/// reports use for algorithm properties.
impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// Describes a configuration key for discovery and documentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigKeySpec {
    /// Property key.
    pub key: &'static str,
    /// What the key controls.
    pub description: &'static str,
    /// Whether the key must be set.
    pub required: bool,
    /// Default value, if optional.
    pub default: Option<&'static str>,
}

impl ConfigKeySpec {
    /// A required key.
    #[must_use]
    pub const fn required(key: &'static str, description: &'static str) -> Self {
        Self {
            key,
            description,
            required: true,
            default: None,
        }
    }

    /// An optional key with a default.
    #[must_use]
    pub const fn optional(
        key: &'static str,
        description: &'static str,
        default: &'static str,
    ) -> Self {
        Self {
            key,
            description,
            required: false,
            default: Some(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_parsed() {
        let props = Properties::from_pairs([("batch", " 500 "), ("bad", "x")]);
        assert_eq!(props.get_parsed::<usize>("batch").unwrap(), Some(500));
        assert_eq!(props.get_parsed::<usize>("missing").unwrap(), None);
        assert!(matches!(
            props.get_parsed::<usize>("bad"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_require() {
        let props = Properties::from_pairs([("a", "1")]);
        assert_eq!(props.require("a").unwrap(), "1");
        assert!(matches!(props.require("b"), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_display_and_serde() {
        let mut props = Properties::new();
        props.set("chunk-size", "1000");
        props.set("a", "b");
        assert_eq!(props.to_string(), "a=b,chunk-size=1000");
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json, serde_json::json!({"a": "b", "chunk-size": "1000"}));
    }
}
