use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Environment variable that overrides `assets/` discovery.
pub const ASSETS_ENV: &str = "ROADCAM_ASSETS";

/// A validated root directory containing roadcam runtime assets (recorder JSON).
///
/// This is the canonical way to pass asset locations around, keeping path resolution
/// consistent between the demo binary, tests and embedding hosts.
#[derive(Debug, Clone)]
pub struct AssetsRoot {
    path: PathBuf,
}

impl AssetsRoot {
    /// Locate the `assets/` directory.
    ///
    /// Resolution order:
    /// 1) `ROADCAM_ASSETS` env var (if set and existing)
    /// 2) Search upward from `start_dir` for a folder named `assets`
    pub fn discover(start_dir: &Path) -> Result<Self, EngineError> {
        if let Ok(p) = std::env::var(ASSETS_ENV) {
            let pb = PathBuf::from(p);
            if pb.is_dir() {
                return Ok(Self { path: pb });
            }
        }

        let mut cur = start_dir.to_path_buf();
        loop {
            let cand = cur.join("assets");
            if cand.is_dir() {
                return Ok(Self { path: cand });
            }
            if !cur.pop() {
                break;
            }
        }

        Err(EngineError::AssetsNotFound {
            start_dir: start_dir.to_path_buf(),
        })
    }

    /// Use `path` as the assets root without searching.
    pub fn at(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        if !path.is_dir() {
            return Err(EngineError::AssetsNotFound { start_dir: path });
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.path.join(rel)
    }

    /// Choose OS-specific JSON config if present, otherwise fall back to `<stem>.json`.
    ///
    /// Example: `recorder.linux.json` overrides `recorder.json` on Linux.
    pub fn pick_platform_json(&self, stem: &str) -> PathBuf {
        pick_platform_json(&self.path, stem)
    }
}

pub fn platform_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "other"
    }
}

/// Choose OS-specific JSON config if present, otherwise fall back to `<stem>.json`.
pub fn pick_platform_json(assets: &Path, stem: &str) -> PathBuf {
    let platform = assets.join(format!("{stem}.{}.json", platform_name()));
    if platform.exists() {
        platform
    } else {
        assets.join(format!("{stem}.json"))
    }
}

/// Resolve a JSON-provided path relative to the assets directory unless it is already absolute.
pub fn resolve_assets_path(assets_dir: &Path, s: &str) -> PathBuf {
    let p = PathBuf::from(s);
    if p.is_absolute() {
        p
    } else {
        assets_dir.join(p)
    }
}

/// Read a UTF-8 file into a String (Result-based).
pub fn read_to_string_result(path: &Path) -> Result<String, EngineError> {
    std::fs::read_to_string(path).map_err(|e| EngineError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Deserialize JSON from a file (Result-based).
pub fn load_json_result<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, EngineError> {
    let s = read_to_string_result(path)?;
    serde_json::from_str(&s).map_err(|e| EngineError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_walks_up_to_assets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("assets")).unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let root = AssetsRoot::discover(&nested).unwrap();
        assert_eq!(root.path(), dir.path().join("assets"));
    }

    #[test]
    fn platform_json_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("recorder.json"), "{}").unwrap();
        assert_eq!(
            pick_platform_json(dir.path(), "recorder"),
            dir.path().join("recorder.json")
        );

        let os_file = dir.path().join(format!("recorder.{}.json", platform_name()));
        std::fs::write(&os_file, "{}").unwrap();
        assert_eq!(pick_platform_json(dir.path(), "recorder"), os_file);
    }

    #[test]
    fn relative_paths_resolve_against_assets() {
        let base = Path::new("/srv/assets");
        assert_eq!(resolve_assets_path(base, "out"), PathBuf::from("/srv/assets/out"));
        assert_eq!(resolve_assets_path(base, "/tmp/x"), PathBuf::from("/tmp/x"));
    }
}
