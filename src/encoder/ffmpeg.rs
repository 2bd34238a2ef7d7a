//! H.264 encoding through an `ffmpeg` child process.
//!
//! Raw RGBA frames go in on stdin, an Annex B elementary stream comes back on stdout. Hardware
//! encoders are preferred: each candidate must survive a one-frame test encode and the first
//! that works is used, `libx264` being the last resort.
//!
//! Threads:
//! - `ffmpeg-feed`: writes frames to stdin; closing stdin is end-of-stream.
//! - `ffmpeg-read`: splits stdout into access units (AUD-delimited) and hands them over.
//! - stderr is piped into the logger.
//!
//! `-bf 0` keeps output in input order, so pts are matched to access units through a FIFO.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::annexb::{self, AccessUnitSplitter};
use super::{EncoderPoll, EncoderSettings, InputSurface, OutputBuffer, StreamFormat, VideoEncoder};
use crate::frame_ring::FrameFlags;

const TAG: &str = "FFMPEG";
/// Frames allowed in flight between the render thread and ffmpeg's stdin.
const FEED_DEPTH: usize = 3;
const FEED_TIMEOUT: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 64 * 1024;
const SPARE_UNITS: usize = 16;

enum FeedMsg {
    Frame(Vec<u8>),
    EndOfStream,
}

enum ReadMsg {
    Unit(Vec<u8>),
    Eof,
}

/// Names of the encoders this ffmpeg build lists (`ffmpeg -encoders`).
pub fn list_encoders(ffmpeg: &str) -> Result<Vec<String>> {
    let out = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .with_context(|| format!("cannot run {ffmpeg}"))?;
    Ok(parse_encoder_list(&String::from_utf8_lossy(&out.stdout)))
}

/// Parse the table printed by `ffmpeg -encoders` (` V....D h264_nvenc  NVIDIA ...`).
pub fn parse_encoder_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let flags = cols.next()?;
            let name = cols.next()?;
            let is_row = flags.len() == 6 && flags.starts_with('V') && !name.starts_with('=');
            is_row.then(|| name.to_string())
        })
        .collect()
}

/// One-frame test encode; listed hardware encoders often have no device behind them.
fn test_encode(ffmpeg: &str, codec: &str) -> bool {
    Command::new(ffmpeg)
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            "color=c=black:s=256x256:r=30",
            "-frames:v",
            "1",
            "-c:v",
            codec,
            "-f",
            "null",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// First candidate that is both listed and actually encodes.
pub fn pick_encoder(ffmpeg: &str, candidates: &[String]) -> Result<String> {
    let listed = list_encoders(ffmpeg)?;
    for c in candidates {
        if !listed.iter().any(|l| l == c) {
            logd!(TAG, "encoder {c} not built into {ffmpeg}");
            continue;
        }
        // Software x264 needs no device, so it is taken as listed.
        if c == "libx264" || test_encode(ffmpeg, c) {
            return Ok(c.clone());
        }
        logd!(TAG, "encoder {c} listed but failed a test encode");
    }
    Err(anyhow!(
        "no usable H.264 encoder among [{}] in {ffmpeg}",
        candidates.join(", ")
    ))
}

/// The encoder `pick_encoder` settled on, keyed by the ffmpeg binary and candidate list it was
/// picked from. Failures are not cached.
#[derive(Debug, Default)]
pub struct CodecCache {
    chosen: Mutex<Option<(String, Vec<String>, String)>>,
}

impl CodecCache {
    pub fn pick(&self, ffmpeg: &str, candidates: &[String]) -> Result<String> {
        self.pick_with(ffmpeg, candidates, pick_encoder)
    }

    fn pick_with(
        &self,
        ffmpeg: &str,
        candidates: &[String],
        select: impl FnOnce(&str, &[String]) -> Result<String>,
    ) -> Result<String> {
        let mut chosen = self.chosen.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((bin, list, codec)) = chosen.as_ref() {
            if bin == ffmpeg && list.as_slice() == candidates {
                return Ok(codec.clone());
            }
        }
        let codec = select(ffmpeg, candidates)?;
        logi!(TAG, "using encoder {codec}");
        *chosen = Some((ffmpeg.to_string(), candidates.to_vec(), codec.clone()));
        Ok(codec)
    }
}

/// ffmpeg arguments for one encoder lifetime.
pub fn build_args(s: &EncoderSettings, codec: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-nostats",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgba",
        "-video_size",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{}x{}", s.width, s.height));
    args.extend(["-r".to_string(), s.frame_rate.to_string()]);
    args.extend(["-i", "pipe:0", "-vf", "vflip", "-an", "-c:v"].map(String::from));
    args.push(codec.to_string());

    if codec == "libx264" {
        args.extend(
            ["-preset", "veryfast", "-tune", "zerolatency", "-profile:v", "baseline"]
                .map(String::from),
        );
    }
    args.extend(["-b:v".to_string(), s.bit_rate.to_string()]);
    args.extend(["-g".to_string(), s.gop().to_string()]);
    args.extend(
        [
            "-bf",
            "0",
            "-pix_fmt",
            "yuv420p",
            "-bsf:v",
            "h264_metadata=aud=insert",
            "-flush_packets",
            "1",
            "-f",
            "h264",
            "pipe:1",
        ]
        .map(String::from),
    );
    args
}

pub struct FfmpegEncoder {
    settings: EncoderSettings,
    codec: String,
    child: Option<Child>,
    feed_tx: Option<Sender<FeedMsg>>,
    feed_rx: Option<Receiver<FeedMsg>>,
    recycle_rx: Receiver<Vec<u8>>,
    pts_tx: Sender<i64>,
    pts_rx: Receiver<i64>,
    out_rx: Receiver<ReadMsg>,
    spare_tx: Sender<Vec<u8>>,
    feeder: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
    format_sent: bool,
    pending: Option<Vec<u8>>,
    next_index: usize,
    last_pts_us: i64,
    eos: bool,
}

impl FfmpegEncoder {
    /// Spawn ffmpeg with an encoder chosen by `pick_encoder` (usually through `CodecCache`).
    pub fn spawn_with(settings: &EncoderSettings, codec: &str) -> Result<Self> {
        let args = build_args(settings, codec);
        logi!(TAG, "spawning {} with {codec} ({}x{}@{} {} bps)",
            settings.ffmpeg_path, settings.width, settings.height, settings.frame_rate, settings.bit_rate);
        logd!(TAG, "args: {}", args.join(" "));

        let mut child = Command::new(&settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", settings.ffmpeg_path))?;

        if let Some(err) = child.stderr.take() {
            crate::logging::spawn_pipe_thread("ffmpeg-err", TAG, err, true);
        }
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("ffmpeg stdin not piped"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("ffmpeg stdout not piped"))?;

        let (feed_tx, feed_rx) = bounded::<FeedMsg>(FEED_DEPTH);
        let (recycle_tx, recycle_rx) = unbounded::<Vec<u8>>();
        let (pts_tx, pts_rx) = unbounded::<i64>();
        let (out_tx, out_rx) = unbounded::<ReadMsg>();
        let (spare_tx, spare_rx) = bounded::<Vec<u8>>(SPARE_UNITS);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let feeder_rx = feed_rx.clone();
        let feeder_recycle = recycle_tx.clone();
        let feeder_stop = stop_flag.clone();
        let feeder = std::thread::Builder::new()
            .name("ffmpeg-feed".into())
            .spawn(move || feed_thread(stdin, feeder_rx, feeder_recycle, feeder_stop))
            .context("spawn ffmpeg-feed")?;

        let reader = std::thread::Builder::new()
            .name("ffmpeg-read".into())
            .spawn(move || read_thread(stdout, out_tx, spare_rx))
            .context("spawn ffmpeg-read")?;

        // Preallocate the frame buffers the input surface cycles through.
        let frame_bytes = settings.width as usize * settings.height as usize * 4;
        for _ in 0..FEED_DEPTH + 1 {
            let _ = recycle_tx.send(vec![0u8; frame_bytes]);
        }

        Ok(Self {
            settings: settings.clone(),
            codec: codec.to_string(),
            child: Some(child),
            feed_tx: Some(feed_tx),
            feed_rx: Some(feed_rx),
            recycle_rx,
            pts_tx,
            pts_rx,
            out_rx,
            spare_tx,
            feeder: Some(feeder),
            reader: Some(reader),
            stop_flag,
            format_sent: false,
            pending: None,
            next_index: 0,
            last_pts_us: 0,
            eos: false,
        })
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    fn frame_duration_us(&self) -> i64 {
        1_000_000 / self.settings.frame_rate.max(1) as i64
    }

    fn to_output(&mut self, data: Vec<u8>) -> OutputBuffer {
        let pts_us = match self.pts_rx.try_recv() {
            Ok(p) => p,
            Err(_) => {
                logw!(TAG, "access unit without a queued pts; extrapolating");
                self.last_pts_us + self.frame_duration_us()
            }
        };
        self.last_pts_us = pts_us;
        let flags = if annexb::contains_idr(&data) {
            FrameFlags::KEY_FRAME
        } else {
            FrameFlags::NONE
        };
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        OutputBuffer { index, data, pts_us, flags }
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn create_input_surface(&mut self) -> Result<Box<dyn InputSurface>> {
        // The receiver is only held until the single input surface exists.
        if self.feed_rx.take().is_none() {
            return Err(anyhow!("input surface already created"));
        }
        let tx = self
            .feed_tx
            .clone()
            .ok_or_else(|| anyhow!("encoder already shut down"))?;
        Ok(Box::new(FfmpegInput {
            width: self.settings.width,
            height: self.settings.height,
            feed_tx: tx,
            recycle_rx: self.recycle_rx.clone(),
            pts_tx: self.pts_tx.clone(),
        }))
    }

    fn poll_output(&mut self) -> Result<EncoderPoll> {
        if let Some(data) = self.pending.take() {
            return Ok(EncoderPoll::Output(self.to_output(data)));
        }
        if self.eos {
            return Ok(EncoderPoll::EndOfStream);
        }
        match self.out_rx.try_recv() {
            Ok(ReadMsg::Unit(data)) => {
                if !self.format_sent {
                    let Some((sps, pps)) = annexb::parameter_sets(&data) else {
                        logw!(TAG, "dropping access unit received before SPS/PPS");
                        let _ = self.spare_tx.try_send(data);
                        return Ok(EncoderPoll::TryAgainLater);
                    };
                    let format = StreamFormat {
                        width: self.settings.width,
                        height: self.settings.height,
                        sps: sps.to_vec(),
                        pps: pps.to_vec(),
                    };
                    self.format_sent = true;
                    self.pending = Some(data);
                    return Ok(EncoderPoll::FormatChanged(format));
                }
                Ok(EncoderPoll::Output(self.to_output(data)))
            }
            Ok(ReadMsg::Eof) | Err(TryRecvError::Disconnected) => {
                self.eos = true;
                Ok(EncoderPoll::EndOfStream)
            }
            Err(TryRecvError::Empty) => Ok(EncoderPoll::TryAgainLater),
        }
    }

    fn release_output(&mut self, buffer: OutputBuffer) {
        let _ = self.spare_tx.try_send(buffer.data);
    }

    fn signal_end_of_stream(&mut self) -> Result<()> {
        let tx = self
            .feed_tx
            .as_ref()
            .ok_or_else(|| anyhow!("encoder already shut down"))?;
        tx.send_timeout(FeedMsg::EndOfStream, FEED_TIMEOUT)
            .map_err(|_| anyhow!("ffmpeg feed stalled at end of stream"))
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.feed_tx.take() {
            let _ = tx.send_timeout(FeedMsg::EndOfStream, FEED_TIMEOUT);
        }
        self.feed_rx.take();
        if let Some(mut child) = self.child.take() {
            // Give ffmpeg a moment to exit on its own after stdin closes.
            let deadline = Instant::now() + Duration::from_millis(500);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    _ => {
                        logw!(TAG, "ffmpeg did not exit after end of stream; killing it");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(h) = self.feeder.take() {
            let _ = h.join();
        }
        // stdout hits EOF once the child is gone.
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct FfmpegInput {
    width: u32,
    height: u32,
    feed_tx: Sender<FeedMsg>,
    recycle_rx: Receiver<Vec<u8>>,
    pts_tx: Sender<i64>,
}

impl InputSurface for FfmpegInput {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn queue_frame(&mut self, pts_us: i64, rgba: &[u8]) -> Result<()> {
        let mut buf = self.recycle_rx.try_recv().unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(rgba);
        // pts first: the reader may see the access unit before this call returns.
        let _ = self.pts_tx.send(pts_us);
        self.feed_tx
            .send_timeout(FeedMsg::Frame(buf), FEED_TIMEOUT)
            .map_err(|_| anyhow!("ffmpeg is not accepting frames"))
    }
}

fn feed_thread(
    mut stdin: ChildStdin,
    rx: Receiver<FeedMsg>,
    recycle: Sender<Vec<u8>>,
    stop_flag: Arc<AtomicBool>,
) {
    while !stop_flag.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(FeedMsg::Frame(buf)) => {
                if let Err(e) = stdin.write_all(&buf) {
                    logw!(TAG, "stdin write failed: {e}");
                    break;
                }
                let _ = recycle.send(buf);
            }
            Ok(FeedMsg::EndOfStream) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // Closing stdin makes ffmpeg flush and exit.
    drop(stdin);
}

fn read_thread(mut stdout: ChildStdout, tx: Sender<ReadMsg>, spare: Receiver<Vec<u8>>) {
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut splitter = AccessUnitSplitter::new();
    let mut unit = Vec::new();
    let forward = |unit: &mut Vec<u8>| {
        let mut out = spare.try_recv().unwrap_or_default();
        std::mem::swap(&mut out, unit);
        tx.send(ReadMsg::Unit(out)).is_ok()
    };
    loop {
        match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                splitter.push(&chunk[..n]);
                while splitter.next_unit(&mut unit) {
                    if !forward(&mut unit) {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                logw!(TAG, "stdout read failed: {e}");
                break;
            }
        }
    }
    if splitter.finish(&mut unit) {
        forward(&mut unit);
    }
    let _ = tx.send(ReadMsg::Eof);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_is_selected_once_per_candidate_list() {
        let cache = CodecCache::default();
        let hw = vec!["h264_vaapi".to_string(), "libx264".to_string()];
        let mut selections = 0;
        let mut pick = |list: &[String]| {
            cache.pick_with("ffmpeg", list, |_, c| {
                selections += 1;
                Ok(c[0].clone())
            })
        };
        assert_eq!(pick(&hw).unwrap(), "h264_vaapi");
        assert_eq!(pick(&hw).unwrap(), "h264_vaapi");
        assert_eq!(pick(&hw[1..]).unwrap(), "libx264");
        drop(pick);
        assert_eq!(selections, 2);
    }

    #[test]
    fn failed_selection_is_not_cached() {
        let cache = CodecCache::default();
        let list = vec!["libx264".to_string()];
        assert!(cache.pick_with("ffmpeg", &list, |_, _| Err(anyhow!("no ffmpeg"))).is_err());
        assert_eq!(cache.pick_with("ffmpeg", &list, |_, c| Ok(c[0].clone())).unwrap(), "libx264");
    }

    #[test]
    fn parses_encoder_table() {
        let text = "Encoders:\n V..... = Video\n A..... = Audio\n ------\n \
                    V....D libx264              libx264 H.264 / AVC\n \
                    V....D h264_nvenc           NVIDIA NVENC H.264 encoder\n \
                    A....D aac                  AAC (Advanced Audio Coding)\n";
        assert_eq!(parse_encoder_list(text), vec!["libx264", "h264_nvenc"]);
    }

    #[test]
    fn args_request_aud_and_no_b_frames() {
        let s = EncoderSettings {
            width: 640,
            height: 360,
            frame_rate: 30,
            bit_rate: 2_000_000,
            i_frame_interval_secs: 2,
            ffmpeg_path: "ffmpeg".into(),
            candidates: vec!["libx264".into()],
        };
        let args = build_args(&s, "libx264");
        let joined = args.join(" ");
        assert!(joined.contains("-video_size 640x360"));
        assert!(joined.contains("-g 60"));
        assert!(joined.contains("-bf 0"));
        assert!(joined.contains("h264_metadata=aud=insert"));
        assert!(joined.contains("-tune zerolatency"));
        assert!(joined.ends_with("-f h264 pipe:1"));

        let hw = build_args(&s, "h264_nvenc").join(" ");
        assert!(!hw.contains("zerolatency"));
    }
}
