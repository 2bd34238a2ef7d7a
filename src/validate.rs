//! Recorder config validation (friendly errors)
//!
//! Each issue says *what* is wrong, *where* (JSON pointer into recorder.json) and, when there is
//! an obvious fix, *what to do*. Lenient loading only logs these; strict loading refuses to start
//! on any error-level issue.

use std::collections::BTreeSet;

use roadcam_engine::ConfigMode;
use serde_json::Value;


const KNOWN_KEYS: &[&str] = &[
    "version",
    "camera_id",
    "camera_position",
    "width",
    "height",
    "frame_rate",
    "bit_rate",
    "i_frame_interval_secs",
    "segment_duration_ms",
    "watermark",
    "preview",
    "output_dir",
    "ffmpeg_path",
    "encoders",
    "frame_pool_size",
    "prepare_timeout_ms",
    "debug_log",
];

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub level: IssueLevel,
    pub path: String,
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    Warn,
    Error,
}

impl ValidationIssue {
    pub fn warn(path: impl Into<String>, message: impl Into<String>, hint: Option<String>) -> Self {
        Self { level: IssueLevel::Warn, path: path.into(), message: message.into(), hint }
    }
    pub fn error(path: impl Into<String>, message: impl Into<String>, hint: Option<String>) -> Self {
        Self { level: IssueLevel::Error, path: path.into(), message: message.into(), hint }
    }
}

pub fn emit_issues(tag: &str, issues: &[ValidationIssue]) {
    for it in issues {
        let hint = it.hint.as_deref().map(|h| format!(" (hint: {h})")).unwrap_or_default();
        match it.level {
            IssueLevel::Warn => logw!(tag, "{}: {}{}", it.path, it.message, hint),
            IssueLevel::Error => loge!(tag, "{}: {}{}", it.path, it.message, hint),
        }
    }
}

/// One summary line even when there are zero issues, so the log shows validation ran.
pub fn emit_summary(tag: &str, label: &str, issues: &[ValidationIssue]) {
    let warns = issues.iter().filter(|i| i.level == IssueLevel::Warn).count();
    let errs = issues.iter().filter(|i| i.level == IssueLevel::Error).count();
    if errs == 0 && warns == 0 {
        logi!(tag, "validation: {label} OK (0 issues)");
    } else {
        logw!(tag, "validation: {label} issues found (errors={errs} warnings={warns})");
    }
}

/// Check a parsed recorder.json for unknown keys and unusable values.
pub fn validate_recorder_json(v: &Value, mode: ConfigMode) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let Some(obj) = v.as_object() else {
        issues.push(ValidationIssue::error(
            "recorder.json:/",
            "top level must be an object",
            Some("expected: { \"frame_rate\": 30, \"segment_duration_ms\": 60000, ... }".into()),
        ));
        return issues;
    };

    let known: BTreeSet<&str> = KNOWN_KEYS.iter().copied().collect();
    for key in obj.keys() {
        if known.contains(key.as_str()) {
            continue;
        }
        let path = format!("recorder.json:/{}", escape_ptr(key));
        let msg = format!("unknown key '{key}'");
        let hint = closest_key(key).map(|k| format!("did you mean '{k}'?"));
        issues.push(match mode {
            ConfigMode::Strict => ValidationIssue::error(path, msg, hint),
            ConfigMode::Lenient => ValidationIssue::warn(path, msg, hint),
        });
    }

    let uint = |key: &str| obj.get(key).and_then(Value::as_u64);

    for key in ["width", "height"] {
        if let Some(n) = uint(key) {
            if n == 0 || n % 2 != 0 {
                issues.push(ValidationIssue::error(
                    format!("recorder.json:/{key}"),
                    format!("{key} must be a positive even number (got {n})"),
                    Some("4:2:0 encoders need even dimensions, e.g. 1280x720".into()),
                ));
            }
        }
    }

    if let Some(fps) = uint("frame_rate") {
        if !(1..=120).contains(&fps) {
            issues.push(ValidationIssue::error(
                "recorder.json:/frame_rate",
                format!("frame_rate {fps} is out of range"),
                Some("use 1..=120; dashcams typically record at 25 or 30".into()),
            ));
        }
    }

    if let Some(br) = uint("bit_rate") {
        if br < 100_000 {
            issues.push(ValidationIssue::warn(
                "recorder.json:/bit_rate",
                format!("bit_rate {br} bps is very low"),
                Some("bit_rate is in bits per second, e.g. 3000000 for 720p".into()),
            ));
        }
    }

    if let Some(ms) = uint("segment_duration_ms") {
        if ms < 1_000 {
            issues.push(ValidationIssue::warn(
                "recorder.json:/segment_duration_ms",
                format!("segments of {ms} ms will produce a very large number of files"),
                None,
            ));
        }
        if let (Some(gop), true) = (uint("i_frame_interval_secs"), ms > 0) {
            if gop * 1_000 > ms {
                issues.push(ValidationIssue::warn(
                    "recorder.json:/i_frame_interval_secs",
                    "key-frame interval is longer than a segment",
                    Some("segments are cut on key frames, so they will run longer than configured".into()),
                ));
            }
        }
    }

    if let Some(n) = uint("frame_pool_size") {
        if n < 2 {
            issues.push(ValidationIssue::warn(
                "recorder.json:/frame_pool_size",
                format!("frame_pool_size {n} leaves no queueing room"),
                Some("most frames will be written on the render thread; 10 is a good default".into()),
            ));
        }
    }

    match obj.get("encoders") {
        None => {}
        Some(Value::Array(arr)) => {
            for (i, e) in arr.iter().enumerate() {
                if !e.is_string() {
                    issues.push(ValidationIssue::error(
                        format!("recorder.json:/encoders/{i}"),
                        "encoder names must be strings",
                        Some("e.g. [\"h264_nvenc\", \"libx264\"]".into()),
                    ));
                }
            }
        }
        Some(_) => issues.push(ValidationIssue::error(
            "recorder.json:/encoders",
            "encoders must be an array of ffmpeg encoder names",
            Some("e.g. [\"h264_videotoolbox\"]".into()),
        )),
    }

    issues
}

fn closest_key(key: &str) -> Option<&'static str> {
    KNOWN_KEYS
        .iter()
        .copied()
        .map(|k| (edit_distance(k, key), k))
        .filter(|(d, _)| *d <= 2)
        .min_by_key(|(d, _)| *d)
        .map(|(_, k)| k)
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut cur = vec![i + 1];
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != *cb);
            cur.push(sub.min(prev[j + 1] + 1).min(cur[j] + 1));
        }
        prev = cur;
    }
    prev[b.len()]
}

// JSON Pointer escaping for friendly paths
fn escape_ptr(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_config_has_no_issues() {
        let v = json!({ "version": 1, "width": 1920, "height": 1080, "frame_rate": 30 });
        assert!(validate_recorder_json(&v, ConfigMode::Strict).is_empty());
    }

    #[test]
    fn typo_gets_a_suggestion() {
        let v = json!({ "segment_duraton_ms": 1000 });
        let issues = validate_recorder_json(&v, ConfigMode::Lenient);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, IssueLevel::Warn);
        assert_eq!(issues[0].hint.as_deref(), Some("did you mean 'segment_duration_ms'?"));
    }

    #[test]
    fn odd_dimensions_are_errors() {
        let v = json!({ "width": 1279, "height": 0 });
        let issues = validate_recorder_json(&v, ConfigMode::Lenient);
        assert_eq!(issues.iter().filter(|i| i.level == IssueLevel::Error).count(), 2);
    }

    #[test]
    fn long_gop_warns() {
        let v = json!({ "segment_duration_ms": 2000, "i_frame_interval_secs": 5 });
        let issues = validate_recorder_json(&v, ConfigMode::Strict);
        assert!(issues.iter().any(|i| i.path.ends_with("i_frame_interval_secs")));
    }

    #[test]
    fn encoders_must_be_string_array() {
        let v = json!({ "encoders": "h264_nvenc" });
        let issues = validate_recorder_json(&v, ConfigMode::Lenient);
        assert_eq!(issues[0].level, IssueLevel::Error);
    }
}
