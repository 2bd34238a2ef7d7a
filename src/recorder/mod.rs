//! Recording controller.
//!
//! `Recorder` is driven from one caller thread. `prepare` spawns two workers per camera:
//!
//! - `render-<camera>` owns the renderer and the encoder. It draws camera frames, drains encoded
//!   units into the frame ring (or writes them directly when the ring cannot take them) and cuts
//!   segments on a timer.
//! - `writer-<camera>` moves queued units from the ring into the active segment file.
//!
//! The only state shared with the caller is the atomic `StateCell`; everything else travels over
//! channels.

mod render;
mod writer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::backend::MediaBackend;
use crate::camera::CameraSurface;
use crate::compositor::PreviewTarget;
use crate::config::RecorderConfig;
use crate::encoder::EncoderSettings;
use crate::error::RecorderError;
use crate::events::{NoopCallback, RecordCallback};
use crate::frame_ring::FrameRing;
use crate::logging::{local_now, make_session_id};
use crate::muxer::{camera_position_from_path, segment_path, segment_stamp};
use crate::state::{Event, State, StateCell};

use render::{RenderMsg, RenderSetup};
use writer::{lock_slot, SegmentSlot, WriterHandle, WriterMsg};

const TAG: &str = "REC";
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const START_TIMEOUT: Duration = Duration::from_secs(2);
// Key-frame wait (1 s) + EOS drain (2 s) + writer flush (1 s) + re-arm.
const STOP_TIMEOUT: Duration = Duration::from_secs(6);

/// Snapshot of the pipeline counters since the last `start_recording`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub frames_rendered: u64,
    /// Units handed to the writer through the ring.
    pub units_queued: u64,
    /// Units written on the render thread (ring full or unit too large).
    pub units_direct: u64,
    /// Units that did not fit a ring slot.
    pub oversized: u64,
    /// Samples lost to muxer errors.
    pub samples_dropped: u64,
    pub segments_completed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    frames_rendered: AtomicU64,
    units_queued: AtomicU64,
    units_direct: AtomicU64,
    oversized: AtomicU64,
    samples_dropped: AtomicU64,
    segments_completed: AtomicU64,
}

impl Counters {
    fn bump(c: &AtomicU64) {
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rendered(&self) {
        Self::bump(&self.frames_rendered);
    }
    pub fn queued(&self) {
        Self::bump(&self.units_queued);
    }
    pub fn direct(&self) {
        Self::bump(&self.units_direct);
    }
    pub fn oversized(&self) {
        Self::bump(&self.oversized);
    }
    pub fn dropped(&self) {
        Self::bump(&self.samples_dropped);
    }
    pub fn segment_completed(&self) {
        Self::bump(&self.segments_completed);
    }

    pub fn reset(&self) {
        for c in [
            &self.frames_rendered,
            &self.units_queued,
            &self.units_direct,
            &self.oversized,
            &self.samples_dropped,
            &self.segments_completed,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RecorderStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RecorderStats {
            frames_rendered: get(&self.frames_rendered),
            units_queued: get(&self.units_queued),
            units_direct: get(&self.units_direct),
            oversized: get(&self.oversized),
            samples_dropped: get(&self.samples_dropped),
            segments_completed: get(&self.segments_completed),
        }
    }
}

/// A worker thread with a bounded join.
struct Worker {
    name: &'static str,
    join: JoinHandle<()>,
    exited: Receiver<()>,
}

impl Worker {
    fn join_within(self, timeout: Duration) {
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if self.join.join().is_err() {
                    logw!(TAG, "{} thread panicked", self.name);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                logw!(TAG, "{} thread did not exit within {timeout:?}; detaching", self.name);
            }
        }
    }
}

/// Threads and shared buffers of one prepared camera.
struct Pipeline {
    camera: CameraSurface,
    slot: Arc<Mutex<SegmentSlot>>,
    render_tx: Sender<RenderMsg>,
    render: Option<Worker>,
    writer_tx: Sender<WriterMsg>,
    writer: Option<Worker>,
}

pub struct Recorder {
    config: RecorderConfig,
    backend: Arc<dyn MediaBackend>,
    callback: Arc<dyn RecordCallback>,
    state: Arc<StateCell>,
    counters: Arc<Counters>,
    pipeline: Option<Pipeline>,
    /// Session id of the recording in progress.
    session: Option<String>,
    watermark: bool,
    preview: Option<PreviewTarget>,
}

impl Recorder {
    pub fn new(config: RecorderConfig, backend: Arc<dyn MediaBackend>) -> Self {
        if config.debug_log {
            crate::logging::set_debug(true);
        }
        Self {
            watermark: config.watermark,
            config,
            backend,
            callback: Arc::new(NoopCallback),
            state: Arc::new(StateCell::new()),
            counters: Arc::new(Counters::default()),
            pipeline: None,
            session: None,
            preview: None,
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn RecordCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn stats(&self) -> RecorderStats {
        self.counters.snapshot()
    }

    pub fn is_recording(&self) -> bool {
        self.state.get() == State::Recording
    }

    /// The segment file that is open for writing. Set from `prepare` until the recording stops,
    /// and follows each rotation.
    pub fn current_file_path(&self) -> Option<PathBuf> {
        let p = self.pipeline.as_ref()?;
        let slot = lock_slot(&p.slot);
        slot.muxer.as_ref().map(|m| m.path().to_path_buf())
    }

    /// Session id of the recording in progress.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn camera_surface(&self) -> Option<CameraSurface> {
        self.pipeline.as_ref().map(|p| p.camera.clone())
    }

    /// A fresh `<stamp>_<position>.mp4` path in the configured output directory.
    pub fn next_output_path(&self) -> PathBuf {
        let stamp = segment_stamp(local_now());
        segment_path(&self.config.output_dir, &stamp, &self.config.camera_position, 0)
    }

    /// Spawn the pipeline and wait for it to come up. The first segment is written to `path`;
    /// later ones go next to it.
    ///
    /// On failure the recorder is left in `Error` with everything torn down.
    pub fn prepare(&mut self, path: &Path) -> Result<CameraSurface, RecorderError> {
        self.state
            .transition(Event::Prepare)
            .map_err(|e| RecorderError::from_transition("prepare", e))?;
        match self.launch(path) {
            Ok(camera) => {
                self.state
                    .transition(Event::Prepared)
                    .map_err(|e| RecorderError::from_transition("prepare", e))?;
                Ok(camera)
            }
            Err(e) => {
                logw!(TAG, "prepare failed: {e}");
                let _ = self.state.transition(Event::Fail);
                self.teardown();
                Err(e)
            }
        }
    }

    fn launch(&mut self, path: &Path) -> Result<CameraSurface, RecorderError> {
        let cfg = &self.config;
        let camera = CameraSurface::new(cfg.width, cfg.height);
        let ring = Arc::new(FrameRing::new(cfg.frame_pool_size, cfg.frame_capacity()));
        let slot: Arc<Mutex<SegmentSlot>> = Arc::default();
        let output_dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let position = camera_position_from_path(path);
        let (render_tx, render_rx) = crossbeam_channel::unbounded();

        let WriterHandle { tx: writer_tx, join, exited } = writer::spawn(
            format!("writer-{}", cfg.camera_id),
            ring.clone(),
            slot.clone(),
            self.counters.clone(),
        )
        .map_err(RecorderError::Spawn)?;
        self.pipeline = Some(Pipeline {
            camera: camera.clone(),
            slot: slot.clone(),
            render_tx: render_tx.clone(),
            render: None,
            writer_tx: writer_tx.clone(),
            writer: Some(Worker { name: "writer", join, exited }),
        });

        let frame_tx = render_tx.clone();
        camera.set_frame_listener(move || {
            let _ = frame_tx.send(RenderMsg::FrameAvailable);
        });

        let setup = RenderSetup {
            backend: self.backend.clone(),
            callback: self.callback.clone(),
            state: self.state.clone(),
            counters: self.counters.clone(),
            camera: camera.clone(),
            ring,
            slot,
            writer_tx,
            encoder_settings: EncoderSettings::from_config(cfg),
            first_segment: path.to_path_buf(),
            output_dir,
            position,
            segment_duration: cfg.segment_duration(),
            watermark: self.watermark,
            preview: self.preview.clone(),
        };
        let (init_tx, init_rx) = crossbeam_channel::bounded(1);
        let (exit_tx, exited) = crossbeam_channel::bounded::<()>(0);
        let join = thread::Builder::new()
            .name(format!("render-{}", cfg.camera_id))
            .spawn(move || {
                let _exit = exit_tx;
                render::render_thread(setup, render_rx, init_tx);
            })
            .map_err(RecorderError::Spawn)?;
        if let Some(p) = self.pipeline.as_mut() {
            p.render = Some(Worker { name: "render", join, exited });
        }

        let timeout = cfg.prepare_timeout();
        match init_rx.recv_timeout(timeout) {
            Ok(Ok(())) => {
                logi!(TAG, "prepared camera {} -> {}", cfg.camera_id, path.display());
                Ok(camera)
            }
            Ok(Err(e)) => Err(RecorderError::Init(e)),
            Err(RecvTimeoutError::Timeout) => Err(RecorderError::InitTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(RecorderError::WorkerGone("render")),
        }
    }

    /// Start writing segments. Returns the session id passed to the callbacks.
    pub fn start_recording(&mut self) -> Result<String, RecorderError> {
        self.state
            .transition(Event::Start)
            .map_err(|e| RecorderError::from_transition("start_recording", e))?;
        let session = make_session_id("rec");
        let msg_session = session.clone();
        match self.request(|reply| RenderMsg::Start { session: msg_session, reply }, START_TIMEOUT) {
            Ok(()) => {
                self.session = Some(session.clone());
                self.callback.on_record_start(&session);
                Ok(session)
            }
            Err(e) => {
                let _ = self.state.transition(Event::Fail);
                Err(e)
            }
        }
    }

    /// Finish the current segment and go back to `Ready`. Legal from `Recording` and `Ready`.
    pub fn stop_recording(&mut self) -> Result<(), RecorderError> {
        let (prev, _) = self
            .state
            .transition(Event::Stop)
            .map_err(|e| RecorderError::from_transition("stop_recording", e))?;
        let res = self.request(|reply| RenderMsg::Stop { reply }, STOP_TIMEOUT);
        match &res {
            Ok(()) => {
                let _ = self.state.transition(Event::Stopped);
            }
            Err(e) => {
                logw!(TAG, "stop failed: {e}");
                let _ = self.state.transition(Event::Fail);
            }
        }
        if prev == State::Recording {
            self.emit_stop();
        }
        res
    }

    /// Tear everything down and return to `Idle`. Legal from any state; repeated calls are
    /// no-ops.
    pub fn release(&mut self) {
        let was_recording = matches!(self.state.get(), State::Recording | State::Stopping);
        self.teardown();
        let _ = self.state.transition(Event::Release);
        if was_recording {
            self.emit_stop();
        }
    }

    /// Takes effect immediately when prepared, otherwise at the next `prepare`.
    pub fn set_preview_target(&mut self, target: Option<PreviewTarget>) {
        self.preview = target.clone();
        if let Some(p) = self.pipeline.as_ref() {
            let _ = p.render_tx.send(RenderMsg::SetPreview(target));
        }
    }

    pub fn set_watermark_enabled(&mut self, enabled: bool) {
        self.watermark = enabled;
        if let Some(p) = self.pipeline.as_ref() {
            let _ = p.render_tx.send(RenderMsg::SetWatermark(enabled));
        }
    }

    pub fn watermark_enabled(&self) -> bool {
        self.watermark
    }

    fn emit_stop(&mut self) {
        if let Some(session) = self.session.take() {
            self.callback.on_record_stop(&session);
        }
    }

    fn request(
        &self,
        make: impl FnOnce(render::Reply) -> RenderMsg,
        timeout: Duration,
    ) -> Result<(), RecorderError> {
        let p = self
            .pipeline
            .as_ref()
            .ok_or(RecorderError::WorkerGone("render"))?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        p.render_tx
            .send(make(tx))
            .map_err(|_| RecorderError::WorkerGone("render"))?;
        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RecorderError::Pipeline(e)),
            Err(RecvTimeoutError::Timeout) => Err(RecorderError::Pipeline(anyhow!(
                "render thread did not answer within {timeout:?}"
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(RecorderError::WorkerGone("render")),
        }
    }

    fn teardown(&mut self) {
        let Some(mut p) = self.pipeline.take() else {
            return;
        };
        p.camera.clear_frame_listener();

        let _ = p.render_tx.send(RenderMsg::Quit);
        if let Some(w) = p.render.take() {
            w.join_within(JOIN_TIMEOUT);
        }
        let _ = p.writer_tx.send(WriterMsg::Quit);
        if let Some(w) = p.writer.take() {
            w.join_within(JOIN_TIMEOUT);
        }

        // Normally the render thread closed it; this covers a render thread that never
        // initialized or did not exit in time.
        if let Ok(mut slot) = p.slot.try_lock() {
            slot.finish(&self.counters);
        }
        logd!(TAG, "pipeline torn down");
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.release();
    }
}
