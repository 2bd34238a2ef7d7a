use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::assets::{read_to_string_result, AssetsRoot};
use crate::error::EngineError;

/// Schema version understood by this build for `recorder.json`.
pub const RECORDER_JSON_VERSION: u32 = 1;

/// How strictly to interpret/validate config files.
///
/// - `Lenient` is forward-compatible: unknown fields are ignored and missing optional
///   keys fall back to defaults.
/// - `Strict` is fail-fast: unknown fields and unexpected versions become errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMode {
    Lenient,
    Strict,
}

/// A JSON file loaded from disk (path + raw text + parsed `serde_json::Value`).
///
/// Kept untyped on purpose: the engine owns reading and parsing, the recorder crate
/// deserializes into its own structs.
#[derive(Debug, Clone)]
pub struct LoadedJson {
    pub path: PathBuf,
    pub src: String,
    pub value: Value,
}

impl LoadedJson {
    /// Declared `version` field, defaulting to 1 when omitted.
    pub fn version(&self) -> u32 {
        self.value
            .get("version")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(1)
    }
}

/// Load any JSON file as `LoadedJson`.
pub fn load_json_file(path: &Path) -> Result<LoadedJson, EngineError> {
    let src = read_to_string_result(path)?;
    let value: Value = serde_json::from_str(&src).map_err(|e| EngineError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(LoadedJson {
        path: path.to_path_buf(),
        src,
        value,
    })
}

/// Deserialize a previously-loaded JSON file into a typed struct.
pub fn parse_loaded_json<T: serde::de::DeserializeOwned>(
    loaded: &LoadedJson,
) -> Result<T, EngineError> {
    serde_json::from_value::<T>(loaded.value.clone()).map_err(|e| EngineError::Schema {
        path: loaded.path.clone(),
        source: e,
    })
}

fn validate_top_level_object(kind: &str, loaded: &LoadedJson) -> Result<(), EngineError> {
    if !loaded.value.is_object() {
        return Err(EngineError::InvalidConfig {
            path: loaded.path.clone(),
            msg: format!("{kind} must be a JSON object"),
        });
    }
    Ok(())
}

/// Engine-owned loader for `recorder(.<os>).json`.
///
/// A missing file is not an error: the recorder runs on defaults, so `Ok(None)` is returned.
pub fn load_recorder_json(
    assets: &AssetsRoot,
    mode: ConfigMode,
) -> Result<Option<LoadedJson>, EngineError> {
    let path = assets.pick_platform_json("recorder");
    if !path.exists() {
        return Ok(None);
    }
    let loaded = load_json_file(&path)?;
    validate_top_level_object("recorder.json", &loaded)?;

    if mode == ConfigMode::Strict && loaded.version() != RECORDER_JSON_VERSION {
        return Err(EngineError::UnsupportedVersion {
            path,
            found: loaded.version(),
            expected: RECORDER_JSON_VERSION,
        });
    }
    Ok(Some(loaded))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assets_with(body: &str) -> (tempfile::TempDir, AssetsRoot) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("recorder.json"), body).unwrap();
        let root = AssetsRoot::at(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn missing_recorder_json_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = AssetsRoot::at(dir.path()).unwrap();
        assert!(load_recorder_json(&root, ConfigMode::Strict).unwrap().is_none());
    }

    #[test]
    fn non_object_is_rejected() {
        let (_dir, root) = assets_with("[1, 2]");
        let err = load_recorder_json(&root, ConfigMode::Lenient).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }

    #[test]
    fn strict_mode_checks_version() {
        let (_dir, root) = assets_with(r#"{ "version": 7 }"#);
        assert!(load_recorder_json(&root, ConfigMode::Lenient).unwrap().is_some());
        let err = load_recorder_json(&root, ConfigMode::Strict).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedVersion { found: 7, .. }));
    }

    #[test]
    fn broken_json_reports_path() {
        let (dir, root) = assets_with("{ nope");
        let err = load_recorder_json(&root, ConfigMode::Lenient).unwrap_err();
        assert_eq!(err.path(), dir.path().join("recorder.json"));
    }
}
