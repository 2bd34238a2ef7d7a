//! Hardware encoder adapter.
//!
//! Frames reach the encoder implicitly: the compositor presents into the `InputSurface` it was
//! given. Output is drained explicitly and non-blockingly with `poll_output`, the same
//! submit-implicitly/drain-explicitly shape a platform codec has.

pub mod annexb;
pub mod ffmpeg;

use crate::config::RecorderConfig;
use crate::frame_ring::FrameFlags;

/// Everything needed to configure an encoder instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u32,
    pub i_frame_interval_secs: u32,
    pub ffmpeg_path: String,
    pub candidates: Vec<String>,
}

impl EncoderSettings {
    pub fn from_config(cfg: &RecorderConfig) -> Self {
        Self {
            width: cfg.width,
            height: cfg.height,
            frame_rate: cfg.frame_rate.max(1),
            bit_rate: cfg.bit_rate,
            i_frame_interval_secs: cfg.i_frame_interval_secs.max(1),
            ffmpeg_path: cfg.ffmpeg_path.clone(),
            candidates: cfg.encoder_candidates(),
        }
    }

    /// Frames between key frames.
    pub fn gop(&self) -> u32 {
        self.frame_rate * self.i_frame_interval_secs
    }
}

/// Output format, reported once per encoder lifetime before the first output unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    /// Sequence parameter set without start code.
    pub sps: Vec<u8>,
    /// Picture parameter set without start code.
    pub pps: Vec<u8>,
}

/// One encoded access unit in Annex B form. Hand it back with `release_output` so its buffer
/// can be reused.
#[derive(Debug)]
pub struct OutputBuffer {
    pub index: usize,
    pub data: Vec<u8>,
    pub pts_us: i64,
    pub flags: FrameFlags,
}

#[derive(Debug)]
pub enum EncoderPoll {
    /// Nothing ready yet.
    TryAgainLater,
    FormatChanged(StreamFormat),
    Output(OutputBuffer),
    /// End of stream was signalled and everything has been drained.
    EndOfStream,
}

/// The surface the compositor presents finished frames into.
pub trait InputSurface: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Submit one bottom-up RGBA frame (GL readback order) stamped with `pts_us`.
    fn queue_frame(&mut self, pts_us: i64, rgba: &[u8]) -> anyhow::Result<()>;
}

pub trait VideoEncoder: Send {
    /// The single input surface of this encoder instance.
    fn create_input_surface(&mut self) -> anyhow::Result<Box<dyn InputSurface>>;
    fn poll_output(&mut self) -> anyhow::Result<EncoderPoll>;
    fn release_output(&mut self, buffer: OutputBuffer);
    fn signal_end_of_stream(&mut self) -> anyhow::Result<()>;
    /// Stop and free everything. Idempotent.
    fn shutdown(&mut self);
}
