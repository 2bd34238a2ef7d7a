//! Hot-reload watcher for `assets/`
//!
//! We watch the **directory**, not the file: editors often save by writing a temp file and
//! renaming it over the original, which a file watch misses.
//!
//! The watcher only sends signals. Re-reading and applying the config happens on the receiver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotEvent {
    /// `recorder.json` or its per-OS override changed.
    RecorderConfigChanged(PathBuf),
    /// Anything else under the watched directory.
    Other,
}

pub struct HotReload {
    _watcher: RecommendedWatcher,
    rx: Receiver<HotEvent>,
}

impl HotReload {
    pub fn rx(&self) -> &Receiver<HotEvent> {
        &self.rx
    }

    pub fn new(assets_dir: &Path) -> anyhow::Result<Self> {
        let (tx, rx) = unbounded::<HotEvent>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(ev) = res {
                    for p in ev.paths {
                        let _ = tx.send(classify(&p));
                    }
                }
            },
            // notify 6 has no debounce; a slower poll keeps the poll backend quiet
            Config::default().with_poll_interval(Duration::from_millis(250)),
        )?;

        watcher.watch(assets_dir, RecursiveMode::NonRecursive)?;

        Ok(Self { _watcher: watcher, rx })
    }
}

/// Map a changed path to the event the app cares about.
pub fn classify(path: &Path) -> HotEvent {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
    let is_json = path.extension().and_then(|s| s.to_str()) == Some("json");
    if is_json && (name == "recorder.json" || name.starts_with("recorder.")) {
        HotEvent::RecorderConfigChanged(path.to_path_buf())
    } else {
        HotEvent::Other
    }
}
