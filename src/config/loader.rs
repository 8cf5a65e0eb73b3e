// file: src/config/loader.rs
// version: 2.0.0
// guid: d4e5f6a7-b8c9-0123-4567-890123defabc

//! Configuration file loading, environment variable substitution and
//! `DCI_CONFIG_*` overrides

use super::{ImageConfig, ToolConfig};
use crate::error::CloudImagesError;
use crate::Result;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Prefix of environment variables overriding configuration keys
pub const OVERRIDE_PREFIX: &str = "DCI_CONFIG_";

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
    env_vars: HashMap<String, String>,
}

impl ConfigLoader {
    /// Create a loader over the process environment
    pub fn new() -> Self {
        Self {
            env_vars: std::env::vars().collect(),
        }
    }

    /// Create a loader over an explicit environment
    pub fn with_env(env_vars: HashMap<String, String>) -> Self {
        Self { env_vars }
    }

    /// Set environment variable for substitution
    pub fn set_env_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env_vars.insert(key.into(), value.into());
    }

    /// Load the tool configuration, from `path` if given
    pub fn load_tool_config(&self, path: Option<&Path>) -> Result<ToolConfig> {
        self.load(path, &ToolConfig::default())
    }

    /// Load the image catalog from `path`, or the built-in one
    pub fn load_image_config(&self, path: Option<&Path>) -> Result<ImageConfig> {
        match path {
            Some(path) => {
                let config: ImageConfig = self.load(Some(path), &ImageConfig::default())?;
                config.validate()?;
                Ok(config)
            }
            None => ImageConfig::builtin(),
        }
    }

    fn load<T: Serialize + DeserializeOwned>(&self, path: Option<&Path>, defaults: &T) -> Result<T> {
        let mut tree = serde_yaml::to_value(defaults)?;

        if let Some(path) = path {
            let content = fs::read_to_string(path).map_err(|e| {
                CloudImagesError::config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let expanded = self.expand_env_vars(&content)?;
            let file_tree: Value = serde_yaml::from_str(&expanded)?;
            if !file_tree.is_null() {
                merge(&mut tree, file_tree);
            }
            debug!("Loaded configuration from {}", path.display());
        }

        self.apply_overrides(&mut tree)?;
        Ok(serde_yaml::from_value(tree)?)
    }

    /// Expand `${VAR}` placeholders in configuration content
    fn expand_env_vars(&self, content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| CloudImagesError::config(format!("Invalid regex pattern: {}", e)))?;

        let mut missing_vars = Vec::new();
        let result = re.replace_all(content, |cap: &regex::Captures<'_>| {
            match self.env_vars.get(&cap[1]) {
                Some(value) => value.clone(),
                None => {
                    missing_vars.push(cap[1].to_string());
                    String::new()
                }
            }
        });

        if !missing_vars.is_empty() {
            return Err(CloudImagesError::config(format!(
                "Missing environment variables: {}",
                missing_vars.join(", ")
            )));
        }

        Ok(result.into_owned())
    }

    /// Apply `DCI_CONFIG_A_B_C=value` as `a.b.c = value`
    fn apply_overrides(&self, tree: &mut Value) -> Result<()> {
        let mut overrides: Vec<(&String, &String)> = self
            .env_vars
            .iter()
            .filter(|(key, _)| key.starts_with(OVERRIDE_PREFIX))
            .collect();
        overrides.sort();

        for (key, value) in overrides {
            let segments: Vec<String> = key[OVERRIDE_PREFIX.len()..]
                .split('_')
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .collect();
            if segments.is_empty() {
                continue;
            }
            debug!("Applying configuration override {}", key);
            set_path(tree, &segments, override_value(value))?;
        }
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Lists are given in YAML flow syntax, everything else stays a string
fn override_value(raw: &str) -> Value {
    if raw.trim_start().starts_with('[') {
        if let Ok(value) = serde_yaml::from_str::<Value>(raw) {
            return value;
        }
    }
    Value::String(raw.to_string())
}

/// Set a value below `tree`, joining segments greedily to match existing keys
fn set_path(tree: &mut Value, segments: &[String], value: Value) -> Result<()> {
    if !tree.is_mapping() {
        *tree = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = tree else {
        return Err(CloudImagesError::config("Configuration root is not a mapping"));
    };

    let take = (1..=segments.len())
        .rev()
        .find(|&n| map.contains_key(Value::String(segments[..n].join("_"))))
        .unwrap_or(1);
    let key = Value::String(segments[..take].join("_"));

    if take == segments.len() {
        map.insert(key, value);
        return Ok(());
    }

    let child = map.entry(key).or_insert(Value::Null);
    set_path(child, &segments[take..], value)
}

/// Recursively overlay `overlay` onto `base`
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
