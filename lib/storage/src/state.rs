//! Trained-state file
//!
//! A JSON document with exactly four keys: `current_params`,
//! `historical_params`, `settings_original` and `iteration`. Anything else is
//! treated as corrupted.

use atomicwrites::{AtomicFile, OverwriteBehavior};
use reclink_core::{Error, ParamSnapshot, Result, SettingsConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tracing::info;

const EXPECTED_KEYS: [&str; 4] = [
    "current_params",
    "historical_params",
    "settings_original",
    "iteration",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TrainedState {
    /// Settings document holding the latest parameters
    pub current_params: SettingsConfig,
    /// Parameter snapshots, oldest first
    pub historical_params: Vec<ParamSnapshot>,
    /// Settings as supplied, before completion and training
    pub settings_original: SettingsConfig,
    pub iteration: u32,
}

impl TrainedState {
    /// Serialise with 4-space indentation
    pub fn to_json_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)?;
        String::from_utf8(buf).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| Error::CorruptedState(format!("not valid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = &value else {
            return Err(Error::CorruptedState(
                "trained state must be a JSON object".to_string(),
            ));
        };

        let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
        keys.sort_unstable();
        let mut expected = EXPECTED_KEYS.to_vec();
        expected.sort_unstable();
        if keys != expected {
            return Err(Error::CorruptedState(format!(
                "expected keys {:?}, found {:?}",
                EXPECTED_KEYS, keys
            )));
        }

        serde_json::from_value(value).map_err(|e| Error::CorruptedState(e.to_string()))
    }

    /// Write atomically. An existing file is only replaced when `overwrite` is set.
    pub fn save<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!(
                    "the path {} already exists, pass overwrite to replace it",
                    path.display()
                ),
            )));
        }

        let json = self.to_json_string()?;
        let file = AtomicFile::new(path, OverwriteBehavior::AllowOverwrite);
        file.write(|f| f.write_all(json.as_bytes()))
            .map_err(|e| match e {
                atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => Error::Io(e),
            })?;

        info!(
            "Saved trained state ({} snapshots) to {}",
            self.historical_params.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclink_core::{library, LinkType, Settings};
    use tempfile::tempdir;

    fn state() -> TrainedState {
        let original = SettingsConfig::new(
            LinkType::DedupeOnly,
            vec![library::exact_match("surname", false)],
        );
        let mut settings = Settings::from_config(&original).unwrap();
        settings.complete_defaults();
        TrainedState {
            current_params: settings.to_config(),
            historical_params: vec![ParamSnapshot::capture(&settings, 0)],
            settings_original: original,
            iteration: 0,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");

        let state = state();
        state.save(&path, false).unwrap();
        let loaded = TrainedState::load(&path).unwrap();
        assert_eq!(loaded, state);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n    \"current_params\""));
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        let state = state();
        state.save(&path, false).unwrap();

        assert!(matches!(state.save(&path, false), Err(Error::Io(_))));
        state.save(&path, true).unwrap();
    }

    #[test]
    fn test_key_set_must_match() {
        let mut value = serde_json::to_value(state()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("extra".into(), Value::Null);
        assert!(matches!(
            TrainedState::from_value(value.clone()),
            Err(Error::CorruptedState(_))
        ));

        let obj = value.as_object_mut().unwrap();
        obj.remove("extra");
        obj.remove("iteration");
        assert!(matches!(
            TrainedState::from_value(value),
            Err(Error::CorruptedState(_))
        ));
    }

    #[test]
    fn test_garbage_is_corrupted() {
        assert!(matches!(
            TrainedState::from_json_str("not json"),
            Err(Error::CorruptedState(_))
        ));
        assert!(matches!(
            TrainedState::from_json_str("[1, 2]"),
            Err(Error::CorruptedState(_))
        ));
        let bad_types = r#"{"current_params": 1, "historical_params": [],
                            "settings_original": {}, "iteration": 0}"#;
        assert!(matches!(
            TrainedState::from_json_str(bad_types),
            Err(Error::CorruptedState(_))
        ));
    }
}
