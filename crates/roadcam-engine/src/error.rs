use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Everything that can go wrong while locating or reading recorder configuration.
#[derive(Debug)]
pub enum EngineError {
    /// No `assets/` folder above the start directory (and no usable `ROADCAM_ASSETS`).
    AssetsNotFound { start_dir: PathBuf },
    /// Reading a config file failed.
    Io { path: PathBuf, source: std::io::Error },
    /// The file is not valid JSON.
    Json { path: PathBuf, source: serde_json::Error },
    /// The JSON parsed but does not match the typed schema.
    Schema { path: PathBuf, source: serde_json::Error },
    /// The file declares a schema version this build does not understand.
    UnsupportedVersion { path: PathBuf, found: u32, expected: u32 },
    /// Structurally valid but semantically unusable.
    InvalidConfig { path: PathBuf, msg: String },
}

impl EngineError {
    /// The file (or start directory) the error refers to.
    pub fn path(&self) -> &Path {
        match self {
            EngineError::AssetsNotFound { start_dir } => start_dir,
            EngineError::Io { path, .. }
            | EngineError::Json { path, .. }
            | EngineError::Schema { path, .. }
            | EngineError::UnsupportedVersion { path, .. }
            | EngineError::InvalidConfig { path, .. } => path,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::AssetsNotFound { start_dir } => {
                write!(f, "no assets/ directory found above {}", start_dir.display())
            }
            EngineError::Io { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
            EngineError::Json { path, source } => {
                write!(f, "{} is not valid JSON: {}", path.display(), source)
            }
            EngineError::Schema { path, source } => {
                write!(f, "{} does not match the recorder schema: {}", path.display(), source)
            }
            EngineError::UnsupportedVersion { path, found, expected } => {
                write!(
                    f,
                    "{} has version {found}, this build understands version {expected}",
                    path.display()
                )
            }
            EngineError::InvalidConfig { path, msg } => {
                write!(f, "invalid config {}: {}", path.display(), msg)
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io { source, .. } => Some(source),
            EngineError::Json { source, .. } | EngineError::Schema { source, .. } => Some(source),
            _ => None,
        }
    }
}
