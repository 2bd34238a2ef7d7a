//! MP4 segment muxer: one `mp4::Mp4Writer` per segment file.
//!
//! Samples arrive as Annex B access units and are stored length-prefixed. Timestamps are made
//! relative to the first sample of the segment, so every file starts at 0. A sample's duration
//! is only known when the next one arrives, so one sample is always held back; the last sample
//! of a segment gets one nominal frame duration.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use mp4::{AvcConfig, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer, TrackConfig, TrackType};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::encoder::annexb;
use crate::encoder::StreamFormat;

const TAG: &str = "MUX";
/// Track timescale (90 kHz, the usual video clock).
pub const TIMESCALE: u32 = 90_000;
const TRACK_ID: u32 = 1;

struct PendingSample {
    start: u64,
    is_sync: bool,
    bytes: Bytes,
}

/// What a finished segment looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub index: u32,
    pub path: PathBuf,
    pub samples: u32,
    /// False when the segment had no samples and its file was removed.
    pub kept: bool,
}

pub struct SegmentMuxer {
    index: u32,
    path: PathBuf,
    writer: Mp4Writer<BufWriter<File>>,
    track_id: u32,
    frame_rate: u32,
    started: bool,
    base_pts_us: Option<i64>,
    last_pts_us: i64,
    pending: Option<PendingSample>,
    samples: u32,
    scratch: Vec<u8>,
}

impl std::fmt::Debug for SegmentMuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentMuxer")
            .field("index", &self.index)
            .field("path", &self.path)
            .field("started", &self.started)
            .field("samples", &self.samples)
            .finish()
    }
}

impl SegmentMuxer {
    /// Create the file and write the header. The track is added by `start`.
    pub fn create(index: u32, path: PathBuf, frame_rate: u32) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create segment dir {}", dir.display()))?;
        }
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        let config = Mp4Config {
            major_brand: "isom".parse()?,
            minor_version: 512,
            compatible_brands: vec![
                "isom".parse()?,
                "iso2".parse()?,
                "avc1".parse()?,
                "mp41".parse()?,
            ],
            timescale: 1000,
        };
        let writer = Mp4Writer::write_start(BufWriter::new(file), &config)
            .with_context(|| format!("write mp4 header to {}", path.display()))?;
        logd!(TAG, "segment {index} created: {}", path.display());
        Ok(Self {
            index,
            path,
            writer,
            track_id: TRACK_ID,
            frame_rate: frame_rate.max(1),
            started: false,
            base_pts_us: None,
            last_pts_us: 0,
            pending: None,
            samples: 0,
            scratch: Vec::new(),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn samples(&self) -> u32 {
        self.samples + u32::from(self.pending.is_some())
    }

    /// Add the video track described by `format`. Idempotent.
    pub fn start(&mut self, format: &StreamFormat) -> Result<()> {
        if self.started {
            return Ok(());
        }
        // AvcC copies profile/level out of sps[1..4].
        if format.sps.len() < 4 || format.pps.is_empty() {
            return Err(anyhow!("incomplete parameter sets (sps {} bytes)", format.sps.len()));
        }
        let width = u16::try_from(format.width).context("width does not fit an mp4 track")?;
        let height = u16::try_from(format.height).context("height does not fit an mp4 track")?;
        self.writer.add_track(&TrackConfig {
            track_type: TrackType::Video,
            timescale: TIMESCALE,
            language: "und".to_string(),
            media_conf: MediaConfig::AvcConfig(AvcConfig {
                width,
                height,
                seq_param_set: format.sps.clone(),
                pic_param_set: format.pps.clone(),
            }),
        })?;
        self.started = true;
        Ok(())
    }

    /// Queue one Annex B access unit.
    ///
    /// Fails if the track was not started. A pts earlier than the previous one is clamped so
    /// the track never runs backwards.
    pub fn write_sample(&mut self, annexb_au: &[u8], pts_us: i64, is_key: bool) -> Result<()> {
        if !self.started {
            return Err(anyhow!("segment {} has no track yet", self.index));
        }
        annexb::to_avcc(annexb_au, &mut self.scratch);
        if self.scratch.is_empty() {
            // Parameter sets only; already in the sample description.
            return Ok(());
        }

        let base = *self.base_pts_us.get_or_insert(pts_us);
        let mut rel = pts_us - base;
        if rel < self.last_pts_us {
            logw!(TAG, "segment {}: pts went back {} us; clamping", self.index, self.last_pts_us - rel);
            rel = self.last_pts_us;
        }
        self.last_pts_us = rel;
        let start = us_to_ticks(rel);

        // The new sample is held before the previous one is flushed, so a failed flush costs
        // only the previous sample.
        let held = self.pending.replace(PendingSample {
            start,
            is_sync: is_key,
            bytes: Bytes::copy_from_slice(&self.scratch),
        });
        if let Some(prev) = held {
            let duration = start.saturating_sub(prev.start).max(1);
            self.flush_pending(prev, duration)?;
        }
        Ok(())
    }

    fn flush_pending(&mut self, sample: PendingSample, duration: u64) -> Result<()> {
        let duration = u32::try_from(duration).unwrap_or(u32::MAX);
        self.writer.write_sample(
            self.track_id,
            &Mp4Sample {
                start_time: sample.start,
                duration,
                rendering_offset: 0,
                is_sync: sample.is_sync,
                bytes: sample.bytes,
            },
        )?;
        self.samples += 1;
        Ok(())
    }

    /// Write the last sample and the index, then close the file. A segment without samples is
    /// deleted.
    pub fn finish(mut self) -> Result<SegmentSummary> {
        if let Some(last) = self.pending.take() {
            let nominal = u64::from(TIMESCALE / self.frame_rate);
            self.flush_pending(last, nominal)?;
        }

        if self.samples == 0 {
            drop(self.writer);
            let _ = std::fs::remove_file(&self.path);
            logd!(TAG, "segment {} empty; removed {}", self.index, self.path.display());
            return Ok(SegmentSummary {
                index: self.index,
                path: self.path,
                samples: 0,
                kept: false,
            });
        }

        self.writer.write_end()?;
        let mut out = self.writer.into_writer();
        out.flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        Ok(SegmentSummary {
            index: self.index,
            path: self.path,
            samples: self.samples,
            kept: true,
        })
    }
}

fn us_to_ticks(us: i64) -> u64 {
    (us.max(0) as u64) * u64::from(TIMESCALE) / 1_000_000
}

/// `yyyyMMdd_HHmmss` for segment names.
pub fn segment_stamp(at: OffsetDateTime) -> String {
    at.format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| "00000000_000000".to_string())
}

/// `<stamp>_<position>.mp4` in `dir`; on a name collision `-<index>` is added to the stamp
/// (then `-<index>-<n>`).
pub fn segment_path(dir: &Path, stamp: &str, position: &str, index: u32) -> PathBuf {
    let first = dir.join(format!("{stamp}_{position}.mp4"));
    if !first.exists() {
        return first;
    }
    let second = dir.join(format!("{stamp}-{index}_{position}.mp4"));
    if !second.exists() {
        return second;
    }
    (1u32..)
        .map(|n| dir.join(format!("{stamp}-{index}-{n}_{position}.mp4")))
        .find(|p| !p.exists())
        .unwrap_or(second)
}

/// Camera position encoded in a segment path: the stem's suffix after the last `_` when the
/// file is an `.mp4`, `unknown` otherwise.
pub fn camera_position_from_path(path: &Path) -> String {
    let is_mp4 = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("mp4"));
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    match (is_mp4, stem.rsplit_once('_')) {
        (true, Some((_, pos))) if !pos.is_empty() => pos.to_string(),
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    const SPS: [u8; 8] = [0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x01, 0x40, 0x16];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn format() -> StreamFormat {
        StreamFormat { width: 64, height: 48, sps: SPS.to_vec(), pps: PPS.to_vec() }
    }

    fn idr() -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1, 0x09, 0xF0, 0, 0, 0, 1];
        v.extend_from_slice(&SPS);
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(&PPS);
        v.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x80, 0x40]);
        v
    }

    fn delta() -> Vec<u8> {
        vec![0, 0, 0, 1, 0x09, 0xF0, 0, 0, 0, 1, 0x41, 0x9A, 0x10]
    }

    fn read_back(path: &Path) -> Vec<Mp4Sample> {
        let f = File::open(path).unwrap();
        let size = f.metadata().unwrap().len();
        let mut r = mp4::Mp4Reader::read_header(BufReader::new(f), size).unwrap();
        let n = r.sample_count(TRACK_ID).unwrap();
        (1..=n).map(|i| r.read_sample(TRACK_ID, i).unwrap().unwrap()).collect()
    }

    #[test]
    fn writes_playable_segment_starting_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20240101_000000_front.mp4");
        let mut m = SegmentMuxer::create(0, path.clone(), 30).unwrap();
        m.start(&format()).unwrap();
        m.write_sample(&idr(), 5_000_000, true).unwrap();
        m.write_sample(&delta(), 5_033_333, false).unwrap();
        m.write_sample(&delta(), 5_066_666, false).unwrap();
        let summary = m.finish().unwrap();
        assert!(summary.kept);
        assert_eq!(summary.samples, 3);

        let samples = read_back(&path);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].start_time, 0);
        assert!(samples[0].is_sync);
        assert!(!samples[1].is_sync);
        assert!(samples.windows(2).all(|w| w[0].start_time <= w[1].start_time));
        // last sample gets one frame at 30 fps
        assert_eq!(samples[2].duration, 3000);
        // AUD/SPS/PPS stripped: 4-byte length + 4-byte IDR NAL
        assert_eq!(samples[0].bytes.len(), 8);
    }

    #[test]
    fn failed_write_loses_only_the_flushed_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f_front.mp4");
        let mut m = SegmentMuxer::create(0, path.clone(), 30).unwrap();
        m.start(&format()).unwrap();
        m.write_sample(&idr(), 0, true).unwrap();

        // Writer rejects the next flush (unknown track).
        m.track_id = TRACK_ID + 1;
        assert!(m.write_sample(&delta(), 33_333, false).is_err());
        assert_eq!(m.samples(), 1, "the sample that triggered the flush is still held");

        m.track_id = TRACK_ID;
        m.write_sample(&delta(), 66_666, false).unwrap();
        let summary = m.finish().unwrap();
        assert_eq!(summary.samples, 2);
        assert_eq!(read_back(&path).len(), 2);
    }

    #[test]
    fn pts_regression_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_front.mp4");
        let mut m = SegmentMuxer::create(0, path.clone(), 30).unwrap();
        m.start(&format()).unwrap();
        m.write_sample(&idr(), 1_000, true).unwrap();
        m.write_sample(&delta(), 100_000, false).unwrap();
        m.write_sample(&delta(), 50_000, false).unwrap();
        m.finish().unwrap();

        let samples = read_back(&path);
        assert!(samples.windows(2).all(|w| w[0].start_time <= w[1].start_time));
    }

    #[test]
    fn empty_segment_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b_rear.mp4");
        let mut m = SegmentMuxer::create(3, path.clone(), 30).unwrap();
        m.start(&format()).unwrap();
        let summary = m.finish().unwrap();
        assert!(!summary.kept);
        assert!(!path.exists());
    }

    #[test]
    fn writing_before_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = SegmentMuxer::create(0, dir.path().join("c_front.mp4"), 30).unwrap();
        assert!(m.write_sample(&idr(), 0, true).is_err());
        assert!(m.start(&StreamFormat { sps: vec![0x67], ..format() }).is_err());
    }

    #[test]
    fn segment_names_and_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let p0 = segment_path(dir.path(), "20240102_030405", "front", 0);
        assert_eq!(p0.file_name().unwrap(), "20240102_030405_front.mp4");
        std::fs::write(&p0, b"").unwrap();

        let p1 = segment_path(dir.path(), "20240102_030405", "front", 1);
        assert_eq!(p1.file_name().unwrap(), "20240102_030405-1_front.mp4");
        std::fs::write(&p1, b"").unwrap();

        let p1b = segment_path(dir.path(), "20240102_030405", "front", 1);
        assert_eq!(p1b.file_name().unwrap(), "20240102_030405-1-1_front.mp4");
    }

    #[test]
    fn stamp_format() {
        let t = time::macros::datetime!(2024-03-09 07:05:01 UTC);
        assert_eq!(segment_stamp(t), "20240309_070501");
    }

    #[test]
    fn camera_position_parsing() {
        let cases = [
            ("/x/20240101_120000_front.mp4", "front"),
            ("20240101_120000-2_rear.MP4", "rear"),
            ("clip.mp4", "unknown"),
            ("20240101_120000_front.mov", "unknown"),
            ("trailing_.mp4", "unknown"),
        ];
        for (p, want) in cases {
            assert_eq!(camera_position_from_path(Path::new(p)), want, "{p}");
        }
    }
}
