use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::warn;

use crate::converters::ConvertOptions;
use crate::sanity::SanityError;

/// Where converted files are stored relative to their sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationFolder {
    #[default]
    Mingled,
    Separate,
    Custom,
}

/// Whether `.webp` is appended to the source file name or replaces its
/// extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationExtension {
    #[default]
    Append,
    Set,
}

/// One entry of the configured converter stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConverterEntry {
    pub converter: String,
    pub options: Map<String, Value>,
    pub deactivated: bool,
}

impl ConverterEntry {
    fn named(id: &str) -> Self {
        Self {
            converter: id.to_string(),
            ..Self::default()
        }
    }

    fn default_stack() -> Vec<Self> {
        vec![
            Self::named("cwebp"),
            Self::named("vips"),
            Self::named("imagemagick"),
        ]
    }
}

/// Service configuration, stored as JSON under the content dir. Validated
/// and fixed up once at load time so the rest of the code never has to
/// probe for missing keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub destination_folder: DestinationFolder,
    pub destination_extension: DestinationExtension,
    pub quality: u8,
    pub method: u8,
    pub metadata: String,
    pub converters: Vec<ConverterEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            destination_folder: DestinationFolder::default(),
            destination_extension: DestinationExtension::default(),
            quality: 75,
            method: 6,
            metadata: "none".to_string(),
            converters: ConverterEntry::default_stack(),
        }
    }
}

impl Config {
    /// Loads the config file and fixes up anything out of range. Never
    /// fails outward: a missing or corrupt file yields the defaults.
    pub fn load_and_fix(path: &Path) -> Self {
        let config = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!("config file {} is corrupt ({}), using defaults", path.display(), e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        };
        config.fix()
    }

    fn fix(mut self) -> Self {
        self.quality = self.quality.min(100);
        self.method = self.method.min(6);
        if self.converters.is_empty() {
            self.converters = ConverterEntry::default_stack();
        }
        self
    }

    /// Shallow-merges a JSON object over the config; override keys win,
    /// unknown keys are dropped.
    pub fn with_overrides(&self, overrides: &Map<String, Value>) -> Result<Self, SanityError> {
        let mut merged = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => return Err(SanityError::BadOverrides),
        };
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
        let config: Config =
            serde_json::from_value(Value::Object(merged)).map_err(|_| SanityError::BadOverrides)?;
        Ok(config.fix())
    }

    /// Generates the general option map handed to the conversion delegate.
    /// Carries the active converter stack under the `converters` key; a
    /// single-converter invocation strips that key again.
    pub fn conversion_options(&self) -> Result<ConvertOptions, SanityError> {
        let active: Vec<&ConverterEntry> =
            self.converters.iter().filter(|c| !c.deactivated).collect();
        if active.is_empty() {
            return Err(SanityError::MissingOptions);
        }

        let mut options = Map::new();
        options.insert("quality".to_string(), json!(self.quality));
        options.insert("method".to_string(), json!(self.method));
        options.insert("metadata".to_string(), json!(self.metadata));
        options.insert(
            "converters".to_string(),
            serde_json::to_value(&active).map_err(|_| SanityError::MissingOptions)?,
        );
        Ok(options)
    }

    /// Looks a converter up in the configured stack.
    pub fn converter_by_id(&self, id: &str) -> Option<&ConverterEntry> {
        self.converters.iter().find(|c| c.converter == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_and_fix(&dir.path().join("config.json"));
        assert_eq!(config.destination_folder, DestinationFolder::Mingled);
        assert_eq!(config.quality, 75);
        assert_eq!(config.converters.len(), 3);
    }

    #[test]
    fn corrupt_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();

        let config = Config::load_and_fix(&path);
        assert_eq!(config.quality, 75);
    }

    #[test]
    fn partial_config_is_filled_in_and_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"destination-folder": "separate", "quality": 250, "converters": []}"#,
        )
        .unwrap();

        let config = Config::load_and_fix(&path);
        assert_eq!(config.destination_folder, DestinationFolder::Separate);
        assert_eq!(config.destination_extension, DestinationExtension::Append);
        assert_eq!(config.quality, 100);
        assert!(!config.converters.is_empty());
    }

    #[test]
    fn overrides_win_and_unknown_keys_are_dropped() {
        let base = Config::default();
        let overrides = serde_json::from_str::<Map<String, Value>>(
            r#"{"quality": 92, "destination-extension": "set", "no-such-key": true}"#,
        )
        .unwrap();

        let merged = base.with_overrides(&overrides).unwrap();
        assert_eq!(merged.quality, 92);
        assert_eq!(merged.destination_extension, DestinationExtension::Set);
        assert_eq!(merged.destination_folder, base.destination_folder);
    }

    #[test]
    fn mistyped_overrides_are_rejected() {
        let overrides =
            serde_json::from_str::<Map<String, Value>>(r#"{"quality": "very high"}"#).unwrap();
        assert!(matches!(
            Config::default().with_overrides(&overrides),
            Err(SanityError::BadOverrides)
        ));
    }

    #[test]
    fn conversion_options_carry_the_active_stack() {
        let mut config = Config::default();
        config.converters[1].deactivated = true;

        let options = config.conversion_options().unwrap();
        assert_eq!(options["quality"], json!(75));
        assert_eq!(options["metadata"], json!("none"));

        let stack = options["converters"].as_array().unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[0]["converter"], json!("cwebp"));
        assert_eq!(stack[1]["converter"], json!("imagemagick"));
    }

    #[test]
    fn conversion_options_fail_without_active_converters() {
        let mut config = Config::default();
        for entry in &mut config.converters {
            entry.deactivated = true;
        }
        assert!(matches!(
            config.conversion_options(),
            Err(SanityError::MissingOptions)
        ));
    }

    #[test]
    fn converter_lookup_by_id() {
        let config = Config::default();
        assert_eq!(config.converter_by_id("vips").unwrap().converter, "vips");
        assert!(config.converter_by_id("gd").is_none());
    }
}
