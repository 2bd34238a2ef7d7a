//! GPU compositor: camera texture (+ watermark) into the encoder input, optionally mirrored into
//! a preview surface.
//!
//! `Compositor` owns the per-frame orchestration and the recovery rules; the actual GPU work is
//! behind `GpuBackend`. `gl::GlBackend` is the glow/glutin implementation.

pub mod gl;

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use image::RgbaImage;
use raw_window_handle::RawWindowHandle;

use crate::backend::FrameRenderer;
use crate::camera::{CameraSurface, PtsClock, Transform, FLIP_Y};
use crate::encoder::InputSurface;
use crate::watermark::Watermark;

const TAG: &str = "GPU";

/// Watermark quad in clip space: left, bottom, width, height.
pub const WATERMARK_QUAD: [f32; 4] = [-0.95, 0.85, 0.5, 0.08];

/// A window the compositor may mirror frames into.
///
/// `owner` keeps whatever backs `handle` alive for as long as the compositor uses it (usually
/// the `winit` window).
#[derive(Clone)]
pub struct PreviewTarget {
    pub handle: RawWindowHandle,
    pub width: u32,
    pub height: u32,
    pub owner: Option<Arc<dyn Any + Send + Sync>>,
}

// SAFETY: the raw handle is only dereferenced by the render thread's GL context; `owner`
// guarantees the native window outlives every use.
unsafe impl Send for PreviewTarget {}

impl std::fmt::Debug for PreviewTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewTarget")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Encoder,
    Preview,
}

/// Teardown stages, run in this order by `Compositor::release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Programs,
    Textures,
    Watermark,
    Targets,
    Context,
    Display,
}

pub const TEARDOWN_ORDER: [Teardown; 6] = [
    Teardown::Programs,
    Teardown::Textures,
    Teardown::Watermark,
    Teardown::Targets,
    Teardown::Context,
    Teardown::Display,
];

/// The GPU operations the compositor sequences. Implementations are used from one thread only.
pub trait GpuBackend {
    type Preview;

    /// Create the context, programs, vertex buffers and camera texture; bind the encoder
    /// target to `input`. Returns the camera texture name.
    fn init(&mut self, input: Box<dyn InputSurface>, camera_w: u32, camera_h: u32) -> Result<u32>;
    /// Replace the encoder input (a new encoder instance after stop).
    fn attach_encoder_input(&mut self, input: Box<dyn InputSurface>) -> Result<()>;
    fn upload_camera(&mut self, rgba: &[u8]) -> Result<()>;
    fn bind(&mut self, target: Target) -> Result<()>;
    fn draw_camera(&mut self, transform: &Transform) -> Result<()>;
    fn create_watermark(&mut self) -> Result<()>;
    fn upload_watermark(&mut self, raster: &RgbaImage) -> Result<()>;
    fn draw_watermark(&mut self) -> Result<()>;
    /// Stamp `pts_us` and hand the encoder target to the encoder.
    fn present_encoder(&mut self, pts_us: i64) -> Result<()>;
    /// Push frames still in flight on the GPU into the encoder.
    fn flush_encoder(&mut self) -> Result<()>;
    /// Swap the preview surface; the previous one is destroyed.
    fn set_preview(&mut self, preview: Option<Self::Preview>) -> Result<()>;
    fn present_preview(&mut self) -> Result<()>;
    /// Free one class of resources. Must tolerate resources that were never created.
    fn release(&mut self, stage: Teardown);
}

pub struct Compositor<B: GpuBackend> {
    backend: B,
    camera: CameraSurface,
    staging: Vec<u8>,
    transform: Transform,
    initialized: bool,
    released: bool,
    preview_active: bool,
    pending_preview: Option<B::Preview>,
    watermark_enabled: bool,
    watermark: Option<Watermark>,
}

impl<B: GpuBackend> Compositor<B> {
    pub fn new(backend: B, camera: CameraSurface) -> Self {
        Self {
            backend,
            camera,
            staging: Vec::new(),
            transform: FLIP_Y,
            initialized: false,
            released: false,
            preview_active: false,
            pending_preview: None,
            watermark_enabled: false,
            watermark: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn preview_active(&self) -> bool {
        self.preview_active
    }

    pub fn watermark_enabled(&self) -> bool {
        self.watermark_enabled
    }

    /// Any failure tears down whatever was created and is returned.
    pub fn initialize(&mut self, input: Box<dyn InputSurface>) -> Result<u32> {
        if self.released {
            return Err(anyhow!("compositor already released"));
        }
        if self.initialized {
            return Err(anyhow!("compositor already initialized"));
        }
        let (w, h) = (self.camera.width(), self.camera.height());
        let texture = match self.backend.init(input, w, h) {
            Ok(t) => t,
            Err(e) => {
                self.release();
                return Err(e.context("compositor init"));
            }
        };
        self.initialized = true;
        logi!(TAG, "compositor ready: camera {w}x{h}, texture {texture}");

        if let Some(p) = self.pending_preview.take() {
            self.set_preview_target(Some(p));
        }
        if self.watermark_enabled {
            self.ensure_watermark();
        }
        Ok(texture)
    }

    pub fn attach_encoder_input(&mut self, input: Box<dyn InputSurface>) -> Result<()> {
        if !self.initialized {
            return Err(anyhow!("compositor not initialized"));
        }
        self.backend.attach_encoder_input(input)
    }

    /// Never fails: a preview that cannot be bound is simply turned off.
    pub fn set_preview_target(&mut self, target: Option<B::Preview>) {
        if !self.initialized {
            self.pending_preview = target;
            return;
        }
        let enable = target.is_some();
        match self.backend.set_preview(target) {
            Ok(()) => {
                self.preview_active = enable;
                logi!(TAG, "preview {}", if enable { "attached" } else { "detached" });
            }
            Err(e) => self.disable_preview(&e),
        }
    }

    pub fn set_watermark_enabled(&mut self, enabled: bool) {
        self.watermark_enabled = enabled;
        if enabled && self.initialized {
            self.ensure_watermark();
        }
    }

    /// Latch the newest camera frame and present it to the encoder. The pts comes from the
    /// latched frame's timestamp; `None` means no new frame was pending and nothing was drawn.
    pub fn draw_frame(&mut self, clock: &mut PtsClock) -> Result<Option<i64>> {
        if !self.initialized {
            return Err(anyhow!("draw before initialize"));
        }
        let Some(timestamp_ns) = self.latch()? else {
            return Ok(None);
        };
        let pts_us = clock.pts_us(timestamp_ns);

        self.backend.bind(Target::Encoder)?;
        self.backend.draw_camera(&self.transform)?;
        if self.watermark_enabled {
            self.draw_watermark();
        }
        self.backend.present_encoder(pts_us)?;

        if self.preview_active {
            self.draw_preview();
        }
        Ok(Some(pts_us))
    }

    /// Latch the newest camera image without producing an encoder frame.
    pub fn consume_frame(&mut self) -> Result<()> {
        if !self.initialized {
            self.camera.discard();
            return Ok(());
        }
        self.latch()?;
        if self.preview_active {
            self.draw_preview();
        }
        Ok(())
    }

    pub fn flush_encoder_input(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.backend.flush_encoder()
    }

    /// Idempotent; safe after a failed or partial `initialize`.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.initialized = false;
        self.preview_active = false;
        self.pending_preview = None;
        for stage in TEARDOWN_ORDER {
            self.backend.release(stage);
        }
        self.watermark = None;
        logi!(TAG, "compositor released");
    }

    /// Returns the timestamp of the frame latched, if a new one was pending.
    fn latch(&mut self) -> Result<Option<i64>> {
        let Some(frame) = self.camera.latch(&mut self.staging) else {
            return Ok(None);
        };
        self.transform = frame.transform;
        self.backend.upload_camera(&self.staging)?;
        Ok(Some(frame.timestamp_ns))
    }

    fn draw_preview(&mut self) {
        let res = self
            .backend
            .bind(Target::Preview)
            .and_then(|()| self.backend.draw_camera(&self.transform))
            .and_then(|()| self.backend.present_preview());
        if let Err(e) = res {
            self.disable_preview(&e);
        }
    }

    fn disable_preview(&mut self, err: &anyhow::Error) {
        logw!(TAG, "preview disabled: {err:#}");
        self.preview_active = false;
        if let Err(e) = self.backend.set_preview(None) {
            logw!(TAG, "preview teardown failed: {e:#}");
        }
    }

    /// Allocate watermark resources once. On failure the watermark is switched off.
    fn ensure_watermark(&mut self) -> bool {
        if self.watermark.is_some() {
            return true;
        }
        match self.backend.create_watermark() {
            Ok(()) => {
                self.watermark = Some(Watermark::new());
                true
            }
            Err(e) => {
                logw!(TAG, "watermark disabled: {e:#}");
                self.watermark_enabled = false;
                false
            }
        }
    }

    fn draw_watermark(&mut self) {
        if !self.ensure_watermark() {
            return;
        }
        let Some(wm) = self.watermark.as_mut() else {
            return;
        };
        let mut res = Ok(());
        if let Some(raster) = wm.refresh(Instant::now()) {
            res = self.backend.upload_watermark(raster);
        }
        if let Err(e) = res.and_then(|()| self.backend.draw_watermark()) {
            logw!(TAG, "watermark disabled: {e:#}");
            self.watermark_enabled = false;
        }
    }

    #[cfg(test)]
    fn with_watermark(mut self, wm: Watermark) -> Self {
        self.watermark = Some(wm);
        self
    }
}

impl<B: GpuBackend> Drop for Compositor<B> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<B> FrameRenderer for Compositor<B>
where
    B: GpuBackend<Preview = PreviewTarget>,
{
    fn initialize(&mut self, input: Box<dyn InputSurface>) -> Result<u32> {
        Compositor::initialize(self, input)
    }

    fn attach_encoder_input(&mut self, input: Box<dyn InputSurface>) -> Result<()> {
        Compositor::attach_encoder_input(self, input)
    }

    fn set_preview_target(&mut self, target: Option<PreviewTarget>) {
        Compositor::set_preview_target(self, target)
    }

    fn set_watermark_enabled(&mut self, enabled: bool) {
        Compositor::set_watermark_enabled(self, enabled)
    }

    fn draw_frame(&mut self, clock: &mut PtsClock) -> Result<Option<i64>> {
        Compositor::draw_frame(self, clock)
    }

    fn consume_frame(&mut self) -> Result<()> {
        Compositor::consume_frame(self)
    }

    fn flush_encoder_input(&mut self) -> Result<()> {
        Compositor::flush_encoder_input(self)
    }

    fn release(&mut self) {
        Compositor::release(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Init,
        Upload,
        Bind(Target),
        DrawCamera,
        CreateWatermark,
        UploadWatermark,
        DrawWatermark,
        Present(i64),
        SetPreview(bool),
        PresentPreview,
        Flush,
        Release(Teardown),
    }

    #[derive(Default)]
    struct FakeGpu {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_init: bool,
        fail_preview_present: bool,
        fail_preview_bind: bool,
        fail_watermark: bool,
    }

    impl FakeGpu {
        fn log(&self, c: Call) {
            self.calls.lock().unwrap().push(c);
        }
    }

    impl GpuBackend for FakeGpu {
        type Preview = &'static str;

        fn init(&mut self, _input: Box<dyn InputSurface>, _w: u32, _h: u32) -> Result<u32> {
            self.log(Call::Init);
            if self.fail_init {
                return Err(anyhow!("no context"));
            }
            Ok(7)
        }
        fn attach_encoder_input(&mut self, _input: Box<dyn InputSurface>) -> Result<()> {
            Ok(())
        }
        fn upload_camera(&mut self, _rgba: &[u8]) -> Result<()> {
            self.log(Call::Upload);
            Ok(())
        }
        fn bind(&mut self, target: Target) -> Result<()> {
            self.log(Call::Bind(target));
            if target == Target::Preview && self.fail_preview_bind {
                return Err(anyhow!("surface lost"));
            }
            Ok(())
        }
        fn draw_camera(&mut self, _t: &Transform) -> Result<()> {
            self.log(Call::DrawCamera);
            Ok(())
        }
        fn create_watermark(&mut self) -> Result<()> {
            self.log(Call::CreateWatermark);
            if self.fail_watermark {
                return Err(anyhow!("out of memory"));
            }
            Ok(())
        }
        fn upload_watermark(&mut self, _r: &RgbaImage) -> Result<()> {
            self.log(Call::UploadWatermark);
            Ok(())
        }
        fn draw_watermark(&mut self) -> Result<()> {
            self.log(Call::DrawWatermark);
            Ok(())
        }
        fn present_encoder(&mut self, pts_us: i64) -> Result<()> {
            self.log(Call::Present(pts_us));
            Ok(())
        }
        fn flush_encoder(&mut self) -> Result<()> {
            self.log(Call::Flush);
            Ok(())
        }
        fn set_preview(&mut self, p: Option<&'static str>) -> Result<()> {
            self.log(Call::SetPreview(p.is_some()));
            Ok(())
        }
        fn present_preview(&mut self) -> Result<()> {
            self.log(Call::PresentPreview);
            if self.fail_preview_present {
                return Err(anyhow!("swap failed"));
            }
            Ok(())
        }
        fn release(&mut self, stage: Teardown) {
            self.log(Call::Release(stage));
        }
    }

    struct NullInput;

    impl InputSurface for NullInput {
        fn width(&self) -> u32 {
            16
        }
        fn height(&self) -> u32 {
            16
        }
        fn queue_frame(&mut self, _pts_us: i64, _rgba: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn setup(gpu: FakeGpu) -> (Compositor<FakeGpu>, CameraSurface, Arc<Mutex<Vec<Call>>>) {
        let calls = gpu.calls.clone();
        let cam = CameraSurface::new(4, 4);
        let mut c = Compositor::new(gpu, cam.clone());
        c.initialize(Box::new(NullInput)).unwrap();
        calls.lock().unwrap().clear();
        (c, cam, calls)
    }

    fn take(calls: &Arc<Mutex<Vec<Call>>>) -> Vec<Call> {
        std::mem::take(&mut *calls.lock().unwrap())
    }

    /// Submit a frame stamped `pts_us` after zero and draw it.
    fn draw(c: &mut Compositor<FakeGpu>, cam: &CameraSurface, pts_us: i64) {
        cam.submit_frame(&[0u8; 64], pts_us * 1000);
        let mut clock = PtsClock::with_base(0);
        assert_eq!(c.draw_frame(&mut clock).unwrap(), Some(pts_us));
    }

    #[test]
    fn draw_renders_encoder_then_preview_without_watermark_on_preview() {
        let (mut c, cam, calls) = setup(FakeGpu::default());
        c.set_preview_target(Some("window"));
        c.set_watermark_enabled(true);
        take(&calls);

        draw(&mut c, &cam, 1000);
        assert_eq!(
            take(&calls),
            vec![
                Call::Upload,
                Call::Bind(Target::Encoder),
                Call::DrawCamera,
                Call::UploadWatermark,
                Call::DrawWatermark,
                Call::Present(1000),
                Call::Bind(Target::Preview),
                Call::DrawCamera,
                Call::PresentPreview,
            ]
        );
    }

    #[test]
    fn preview_failure_disables_preview_and_keeps_encoder_running() {
        let gpu = FakeGpu { fail_preview_present: true, ..Default::default() };
        let (mut c, cam, calls) = setup(gpu);
        c.set_preview_target(Some("window"));
        assert!(c.preview_active());

        draw(&mut c, &cam, 1);
        assert!(!c.preview_active());
        let first = take(&calls);
        assert!(first.contains(&Call::Present(1)));
        assert!(first.contains(&Call::SetPreview(false)));

        draw(&mut c, &cam, 2);
        let second = take(&calls);
        assert!(second.contains(&Call::Present(2)));
        assert!(!second.contains(&Call::Bind(Target::Preview)));
    }

    #[test]
    fn consume_frame_only_feeds_preview() {
        let gpu = FakeGpu { fail_preview_bind: true, ..Default::default() };
        let (mut c, cam, calls) = setup(gpu);
        c.consume_frame().unwrap();
        assert!(take(&calls).is_empty());

        c.set_preview_target(Some("window"));
        cam.submit_frame(&[0u8; 64], 5);
        c.consume_frame().unwrap();
        let got = take(&calls);
        assert!(got.iter().all(|c| !matches!(c, Call::Present(_))));
        assert!(got.contains(&Call::Upload));
        // bind failed: preview off, but consume still succeeds
        assert!(!c.preview_active());
    }

    #[test]
    fn watermark_is_allocated_once_and_failure_turns_it_off() {
        let (mut c, _cam, calls) = setup(FakeGpu::default());
        c.set_watermark_enabled(true);
        c.set_watermark_enabled(false);
        c.set_watermark_enabled(true);
        let creates = take(&calls).iter().filter(|c| **c == Call::CreateWatermark).count();
        assert_eq!(creates, 1);

        let gpu = FakeGpu { fail_watermark: true, ..Default::default() };
        let (mut c, cam, calls) = setup(gpu);
        c.set_watermark_enabled(true);
        assert!(!c.watermark_enabled());
        draw(&mut c, &cam, 3);
        assert!(!take(&calls).contains(&Call::DrawWatermark));
    }

    #[test]
    fn unchanged_watermark_text_is_not_reuploaded() {
        let gpu = FakeGpu::default();
        let calls = gpu.calls.clone();
        let cam = CameraSurface::new(4, 4);
        let mut c = Compositor::new(gpu, cam.clone())
            .with_watermark(Watermark::with_clock(|| "2024-01-01 00:00:00".to_string()));
        c.initialize(Box::new(NullInput)).unwrap();
        c.set_watermark_enabled(true);
        for pts in 0..5 {
            draw(&mut c, &cam, pts);
        }
        let got = take(&calls);
        assert_eq!(got.iter().filter(|c| **c == Call::UploadWatermark).count(), 1);
        assert_eq!(got.iter().filter(|c| **c == Call::DrawWatermark).count(), 5);
    }

    #[test]
    fn preview_set_before_init_is_applied_on_init() {
        let gpu = FakeGpu::default();
        let calls = gpu.calls.clone();
        let mut c = Compositor::new(gpu, CameraSurface::new(4, 4));
        c.set_preview_target(Some("window"));
        assert!(calls.lock().unwrap().is_empty());
        c.initialize(Box::new(NullInput)).unwrap();
        assert!(c.preview_active());
        assert_eq!(take(&calls), vec![Call::Init, Call::SetPreview(true)]);
    }

    #[test]
    fn failed_init_releases_in_order_and_release_is_idempotent() {
        let gpu = FakeGpu { fail_init: true, ..Default::default() };
        let calls = gpu.calls.clone();
        let mut c = Compositor::new(gpu, CameraSurface::new(4, 4));
        assert!(c.initialize(Box::new(NullInput)).is_err());
        c.release();
        drop(c);

        let mut want = vec![Call::Init];
        want.extend(TEARDOWN_ORDER.iter().map(|s| Call::Release(*s)));
        assert_eq!(take(&calls), want);
    }

    #[test]
    fn pts_comes_from_the_frame_actually_latched() {
        let (mut c, cam, calls) = setup(FakeGpu::default());
        let mut clock = PtsClock::default();
        cam.submit_frame(&[0u8; 64], 2_000_000);
        assert_eq!(c.draw_frame(&mut clock).unwrap(), Some(0));

        // Two frames arrive before the next draw: the newer one is drawn with its own time.
        cam.submit_frame(&[0u8; 64], 2_040_000);
        cam.submit_frame(&[0u8; 64], 2_080_000);
        assert_eq!(c.draw_frame(&mut clock).unwrap(), Some(80));
        take(&calls);

        assert_eq!(c.draw_frame(&mut clock).unwrap(), None);
        assert!(take(&calls).is_empty());
    }

    #[test]
    fn flush_forwards_to_backend() {
        let (mut c, _cam, calls) = setup(FakeGpu::default());
        c.flush_encoder_input().unwrap();
        assert_eq!(take(&calls), vec![Call::Flush]);
    }
}
