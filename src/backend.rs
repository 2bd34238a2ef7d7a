//! Seams between the recorder and the platform: where encoders and renderers come from.
//!
//! The recorder only talks to `MediaBackend`, `VideoEncoder` and `FrameRenderer`, so the whole
//! pipeline runs against fakes in tests. `DesktopBackend` is the real thing: an ffmpeg encoder
//! and a GL compositor.

use anyhow::Result;

use std::sync::Arc;

use crate::camera::{CameraSurface, PtsClock};
use crate::compositor::gl::{GlBackend, SendDisplay};
use crate::compositor::{Compositor, PreviewTarget};
use crate::encoder::ffmpeg::{CodecCache, FfmpegEncoder};
use crate::encoder::{EncoderSettings, InputSurface, VideoEncoder};

/// Renders camera frames into an encoder input. Lives on the render thread only.
pub trait FrameRenderer {
    /// Set up GPU state and bind the encoder target. Returns the camera texture name.
    fn initialize(&mut self, input: Box<dyn InputSurface>) -> Result<u32>;
    fn attach_encoder_input(&mut self, input: Box<dyn InputSurface>) -> Result<()>;
    fn set_preview_target(&mut self, target: Option<PreviewTarget>);
    fn set_watermark_enabled(&mut self, enabled: bool);
    /// Latch the newest camera frame and present it to the encoder, stamped by `clock` from the
    /// latched frame's own timestamp. Returns that pts, or `None` when no new frame was pending.
    fn draw_frame(&mut self, clock: &mut PtsClock) -> Result<Option<i64>>;
    /// Latch the newest camera frame without encoding it.
    fn consume_frame(&mut self) -> Result<()>;
    fn flush_encoder_input(&mut self) -> Result<()>;
    fn release(&mut self);
}

pub trait MediaBackend: Send + Sync {
    fn create_encoder(&self, settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>>;
    /// Called on the render thread.
    fn create_renderer(&self, camera: &CameraSurface) -> Result<Box<dyn FrameRenderer>>;
}

#[derive(Debug, Clone)]
pub struct DesktopBackend {
    display: SendDisplay,
    /// The codec is selected once; re-arms after a stop reuse the choice.
    codecs: Arc<CodecCache>,
}

impl DesktopBackend {
    pub fn new(display: raw_window_handle::RawDisplayHandle) -> Self {
        Self {
            display: SendDisplay(display),
            codecs: Arc::default(),
        }
    }
}

impl MediaBackend for DesktopBackend {
    fn create_encoder(&self, settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>> {
        let codec = self.codecs.pick(&settings.ffmpeg_path, &settings.candidates)?;
        Ok(Box::new(FfmpegEncoder::spawn_with(settings, &codec)?))
    }

    fn create_renderer(&self, camera: &CameraSurface) -> Result<Box<dyn FrameRenderer>> {
        let gpu = GlBackend::new(self.display);
        Ok(Box::new(Compositor::new(gpu, camera.clone())))
    }
}
