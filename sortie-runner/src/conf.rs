// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine boot configuration: user data attached to tests, and the rendered configs that are
//! handed to machines.
//!
//! Rendered configs are Ignition-style JSON documents. Sortie never interprets them beyond
//! merging, appending systemd units and measuring their size.

use crate::errors::ConfigRenderError;
use serde_json::{Map, Value, json};
use tracing::warn;

/// The config spec version emitted for empty and translated user data.
pub const IGNITION_VERSION: &str = "3.4.0";

/// User data attached to a test.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum UserData {
    /// No user data: machines boot with an empty config.
    #[default]
    Empty,

    /// A JSON Ignition config.
    Ignition(String),

    /// A YAML Butane config.
    Butane(String),
}

/// What to do with warnings produced while rendering user data.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WarningsAction {
    /// Treat warnings as errors.
    #[default]
    Fail,

    /// Log warnings and continue.
    Ignore,
}

impl UserData {
    /// Returns true if there is no user data.
    pub fn is_empty(&self) -> bool {
        matches!(self, UserData::Empty)
    }

    /// Renders this user data into a config.
    ///
    /// Butane configs are translated structurally: the `variant` and `version` keys are replaced
    /// with an `ignition.version`, and the remaining sections are carried over as-is.
    pub fn render(&self, warnings: WarningsAction) -> Result<Config, ConfigRenderError> {
        let (value, found) = match self {
            UserData::Empty => return Ok(Config::empty()),
            UserData::Ignition(text) => {
                let value: Value =
                    serde_json::from_str(text).map_err(ConfigRenderError::InvalidJson)?;
                let mut found = Vec::new();
                if value.pointer("/ignition/version").is_none() {
                    found.push("config is missing ignition.version".to_owned());
                }
                (value, found)
            }
            UserData::Butane(text) => {
                let value: Value =
                    serde_yaml::from_str(text).map_err(ConfigRenderError::InvalidYaml)?;
                translate_butane(value)?
            }
        };

        let Value::Object(map) = value else {
            return Err(ConfigRenderError::NotAnObject);
        };
        let mut config = Config { root: map };
        if found.is_empty() {
            return Ok(config);
        }

        match warnings {
            WarningsAction::Fail => Err(ConfigRenderError::Warnings { warnings: found }),
            WarningsAction::Ignore => {
                for w in &found {
                    warn!("user data: {w}");
                }
                config.ensure_version();
                Ok(config)
            }
        }
    }
}

fn translate_butane(value: Value) -> Result<(Value, Vec<String>), ConfigRenderError> {
    let Value::Object(mut map) = value else {
        return Err(ConfigRenderError::NotAnObject);
    };
    let mut found = Vec::new();
    match map.remove("variant") {
        Some(Value::String(_)) => {}
        Some(_) => found.push("butane variant is not a string".to_owned()),
        None => found.push("butane config is missing variant".to_owned()),
    }
    if map.remove("version").is_none() {
        found.push("butane config is missing version".to_owned());
    }
    map.insert("ignition".to_owned(), json!({ "version": IGNITION_VERSION }));
    Ok((Value::Object(map), found))
}

/// A rendered machine config.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    root: Map<String, Value>,
}

impl Config {
    /// Returns a config with nothing but a version.
    pub fn empty() -> Self {
        let mut root = Map::new();
        root.insert(
            "ignition".to_owned(),
            json!({ "version": IGNITION_VERSION }),
        );
        Self { root }
    }

    /// Merges several configs into one.
    ///
    /// Objects are merged key by key, arrays are concatenated in order, and for scalars the
    /// later config wins.
    pub fn merge_all<'a>(configs: impl IntoIterator<Item = &'a Config>) -> Config {
        let mut merged = Config::empty();
        for config in configs {
            merge_map(&mut merged.root, &config.root);
        }
        merged
    }

    /// Appends a systemd unit to this config.
    pub fn add_systemd_unit(&mut self, name: &str, contents: &str, enabled: bool) {
        let unit = json!({
            "name": name,
            "contents": contents,
            "enabled": enabled,
        });
        let mut addition = Map::new();
        addition.insert("systemd".to_owned(), json!({ "units": [unit] }));
        merge_map(&mut self.root, &addition);
    }

    /// Returns the names of the systemd units in this config.
    pub fn systemd_unit_names(&self) -> Vec<&str> {
        self.root
            .get("systemd")
            .and_then(|systemd| systemd.get("units"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|unit| unit.get("name").and_then(Value::as_str))
            .collect()
    }

    /// Returns the top-level section `key`, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Serializes this config to a compact JSON string.
    pub fn to_json_string(&self) -> String {
        Value::Object(self.root.clone()).to_string()
    }

    /// Returns the length of the serialized config in bytes.
    pub fn serialized_len(&self) -> usize {
        self.to_json_string().len()
    }

    fn ensure_version(&mut self) {
        let mut addition = Map::new();
        addition.insert("ignition".to_owned(), json!({}));
        merge_map(&mut self.root, &addition);
        if let Some(Value::Object(ignition)) = self.root.get_mut("ignition") {
            ignition
                .entry("version")
                .or_insert_with(|| Value::String(IGNITION_VERSION.to_owned()));
        }
    }
}

fn merge_map(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        match into.get_mut(key) {
            Some(existing) => merge_value(existing, value),
            None => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_value(into: &mut Value, from: &Value) {
    match (into, from) {
        (Value::Object(into), Value::Object(from)) => merge_map(into, from),
        (Value::Array(into), Value::Array(from)) => into.extend(from.iter().cloned()),
        (into, from) => *into = from.clone(),
    }
}
