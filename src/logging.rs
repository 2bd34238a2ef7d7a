//! Centralized timestamped logging
//!
//! All logs go through `logi!`, `logw!`, `loge!` or `logd!` so they share one shape:
//!   <timestamp> [TAG][thread] message
//!
//! - stderr is always a sink; an append-only file sink is optional.
//! - `logd!` lines are dropped unless debug output was enabled (config `debug_log`
//!   or `ROADCAM_DEBUG=1`).
//! - Child-process output (ffmpeg) can be piped into the same format.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

static LOG_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();
static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);
static DEBUG: AtomicBool = AtomicBool::new(false);

/// Initialize logging. Call once at startup, before spawning threads.
///
/// The local UTC offset is captured here: `time` refuses to query it once the process is
/// multi-threaded, so everything later formats against the cached value.
///
/// Returns the generated run id.
pub fn init(log_file: Option<PathBuf>) -> String {
    let _ = LOCAL_OFFSET.get_or_init(|| UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC));

    if std::env::var("ROADCAM_DEBUG").is_ok_and(|v| v == "1") {
        set_debug(true);
    }

    let rid = RUN_ID
        .get_or_init(|| {
            let now = OffsetDateTime::now_utc().unix_timestamp_nanos() as u64;
            format!("{:08x}", now ^ (std::process::id() as u64))
        })
        .clone();

    let sink = LOG_FILE.get_or_init(|| Mutex::new(None));
    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                if let Ok(mut guard) = sink.lock() {
                    *guard = Some(f);
                }
            }
            Err(e) => log_line("WARN", "LOG", &format!("cannot open log file {}: {e}", path.display())),
        }
    }

    rid
}

/// Current run id (empty if `init()` wasn't called).
pub fn run_id() -> &'static str {
    RUN_ID.get().map(|s| s.as_str()).unwrap_or("")
}

pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Wall clock in the local offset captured by `init()` (UTC if `init()` never ran).
pub fn local_now() -> OffsetDateTime {
    let offset = LOCAL_OFFSET.get().copied().unwrap_or(UtcOffset::UTC);
    OffsetDateTime::now_utc().to_offset(offset)
}

/// Make a short session id for correlating operations (e.g. one recording).
pub fn make_session_id(prefix: &str) -> String {
    let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]T[hour][minute][second]Z"))
        .unwrap_or_default();
    format!("{prefix}_{stamp}_{n:04}")
}

/// Pipe a Read stream (child stdout/stderr) into the logger on its own thread.
pub fn spawn_pipe_thread<R: Read + Send + 'static>(
    thread_name: &str,
    tag: &str,
    reader: R,
    as_warn: bool,
) {
    let tag = tag.to_string();
    let _ = std::thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            let br = BufReader::new(reader);
            for line in br.lines().map_while(Result::ok) {
                log_line(if as_warn { "WARN" } else { "INFO" }, &tag, &line);
            }
        });
}

/// Timestamp used in logs: `YYYY-MM-DD HH:MM:SS.mmm` (local offset).
pub fn log_timestamp() -> String {
    local_now()
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .unwrap_or_else(|_| "<time-format-error>".to_string())
}

pub fn log_thread_name() -> String {
    std::thread::current().name().unwrap_or("thread").to_string()
}

/// Write one fully formatted line to stderr + optional file sink.
///
/// Public so the exported macros can reach it from the binary crate too.
pub fn log_line(level: &str, tag: &str, msg: &str) {
    if level == "DEBUG" && !debug_enabled() {
        return;
    }
    let line = format!("{} [{}][{}] {}", log_timestamp(), tag, log_thread_name(), msg);

    eprintln!("{line}");

    if let Some(m) = LOG_FILE.get() {
        if let Ok(mut guard) = m.lock() {
            if let Some(f) = guard.as_mut() {
                let _ = writeln!(f, "{line}");
                let _ = f.flush();
            }
        }
    }
}

/// Info log
#[macro_export]
macro_rules! logi {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::log_line("INFO", $tag, &format!($($arg)*));
    }};
}

/// Warning log
#[macro_export]
macro_rules! logw {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::log_line("WARN", $tag, &format!($($arg)*));
    }};
}

/// Error log
#[macro_export]
macro_rules! loge {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::log_line("ERROR", $tag, &format!($($arg)*));
    }};
}

/// Debug log; formatting is skipped entirely when debug output is off.
#[macro_export]
macro_rules! logd {
    ($tag:expr, $($arg:tt)*) => {{
        if $crate::logging::debug_enabled() {
            $crate::logging::log_line("DEBUG", $tag, &format!($($arg)*));
        }
    }};
}
