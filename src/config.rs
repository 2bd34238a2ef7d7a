//! Typed recorder configuration (`assets/recorder.json`).
//!
//! The engine crate finds and parses the file; this module owns the schema and the defaults.
//! Every field is optional in JSON.

use std::path::PathBuf;
use std::time::Duration;

use roadcam_engine::assets::resolve_assets_path;
use roadcam_engine::config::{load_recorder_json, parse_loaded_json};
use roadcam_engine::{AssetsRoot, ConfigMode, EngineError};
use serde::Deserialize;

use crate::validate::{self, IssueLevel, ValidationIssue};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub version: u32,

    pub camera_id: String,
    /// Suffix used in segment file names (`front`, `rear`, ...).
    pub camera_position: String,

    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u32,
    /// Seconds between key frames. Segment cuts happen on key frames.
    pub i_frame_interval_secs: u32,
    pub segment_duration_ms: u64,

    pub watermark: bool,
    pub preview: bool,

    /// Relative paths are resolved against the assets directory.
    pub output_dir: PathBuf,
    pub ffmpeg_path: String,
    /// H.264 encoders to try in order; empty means the per-OS defaults.
    pub encoders: Vec<String>,

    pub frame_pool_size: usize,
    pub prepare_timeout_ms: u64,
    pub debug_log: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            version: 1,
            camera_id: "0".to_string(),
            camera_position: "front".to_string(),
            width: 1280,
            height: 720,
            frame_rate: 30,
            bit_rate: 3_000_000,
            i_frame_interval_secs: 1,
            segment_duration_ms: 60_000,
            watermark: false,
            preview: true,
            output_dir: PathBuf::from("recordings"),
            ffmpeg_path: "ffmpeg".to_string(),
            encoders: Vec::new(),
            frame_pool_size: 10,
            prepare_timeout_ms: 5_000,
            debug_log: false,
        }
    }
}

impl RecorderConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms.max(1))
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms.max(1))
    }

    /// Worst-case encoded frame size used for ring slots: one uncompressed 4:2:0 frame.
    pub fn frame_capacity(&self) -> usize {
        self.width as usize * self.height as usize * 3 / 2
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.frame_rate.max(1) as u64)
    }

    /// Encoder candidates in preference order (hardware first, `libx264` last).
    pub fn encoder_candidates(&self) -> Vec<String> {
        let mut out: Vec<String> = if self.encoders.is_empty() {
            default_hw_encoders().iter().map(|s| s.to_string()).collect()
        } else {
            self.encoders.clone()
        };
        if !out.iter().any(|e| e == "libx264") {
            out.push("libx264".to_string());
        }
        out
    }
}

fn default_hw_encoders() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &["h264_videotoolbox"]
    } else if cfg!(target_os = "windows") {
        &["h264_nvenc", "h264_qsv", "h264_amf"]
    } else {
        &["h264_nvenc"]
    }
}

/// Config plus the validation issues found while loading it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: RecorderConfig,
    pub source: Option<PathBuf>,
    pub issues: Vec<ValidationIssue>,
}

/// Load `recorder(.<os>).json` from `assets`.
///
/// Lenient mode reports unknown keys and out-of-range values but keeps going; strict mode turns
/// any error-level issue (unknown keys included) into `EngineError::InvalidConfig`. A value of the
/// wrong JSON type is an error in both modes.
pub fn load(assets: &AssetsRoot, mode: ConfigMode) -> Result<LoadedConfig, EngineError> {
    let Some(loaded) = load_recorder_json(assets, mode)? else {
        return Ok(LoadedConfig {
            config: RecorderConfig::default(),
            source: None,
            issues: Vec::new(),
        });
    };

    let issues = validate::validate_recorder_json(&loaded.value, mode);
    if mode == ConfigMode::Strict {
        if let Some(first) = issues.iter().find(|i| i.level == IssueLevel::Error) {
            return Err(EngineError::InvalidConfig {
                path: loaded.path.clone(),
                msg: format!("{}: {}", first.path, first.message),
            });
        }
    }

    let mut config: RecorderConfig = parse_loaded_json(&loaded)?;
    config.output_dir = resolve_assets_path(assets.path(), &config.output_dir.to_string_lossy());

    Ok(LoadedConfig {
        config,
        source: Some(loaded.path),
        issues,
    })
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
    fn defaults_match_dashcam_profile() {
        let c = RecorderConfig::default();
        assert_eq!((c.width, c.height, c.frame_rate), (1280, 720, 30));
        assert_eq!(c.segment_duration(), Duration::from_secs(60));
        assert_eq!(c.frame_pool_size, 10);
        assert_eq!(c.frame_capacity(), 1280 * 720 * 3 / 2);
        assert_eq!(c.encoder_candidates().last().map(String::as_str), Some("libx264"));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let root = AssetsRoot::at(dir.path()).unwrap();
        let loaded = load(&root, ConfigMode::Strict).unwrap();
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config, RecorderConfig::default());
    }

    #[test]
    fn partial_file_overrides_some_fields() {
        let (dir, root) = assets_with(
            r#"{ "version": 1, "frame_rate": 25, "segment_duration_ms": 30000, "watermark": true }"#,
        );
        let loaded = load(&root, ConfigMode::Strict).unwrap();
        let c = loaded.config;
        assert_eq!(c.frame_rate, 25);
        assert_eq!(c.segment_duration_ms, 30_000);
        assert!(c.watermark);
        assert_eq!(c.width, 1280);
        assert_eq!(c.output_dir, dir.path().join("recordings"));
    }

    #[test]
    fn unknown_key_is_a_warning_in_lenient_and_an_error_in_strict() {
        let (_dir, root) = assets_with(r#"{ "frame_rat": 25 }"#);
        let lenient = load(&root, ConfigMode::Lenient).unwrap();
        assert!(lenient
            .issues
            .iter()
            .any(|i| i.level == IssueLevel::Warn && i.message.contains("frame_rat")));
        assert_eq!(lenient.config.frame_rate, 30);

        let err = load(&root, ConfigMode::Strict).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }

    #[test]
    fn explicit_encoders_still_end_with_software_fallback() {
        let c = RecorderConfig {
            encoders: vec!["h264_qsv".into()],
            ..RecorderConfig::default()
        };
        assert_eq!(c.encoder_candidates(), vec!["h264_qsv", "libx264"]);
    }
}
