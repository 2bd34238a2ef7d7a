//! Render thread: owns the renderer and the encoder, turns camera frames into encoded units and
//! cuts segments.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::writer::{self, finish_muxer, lock_slot, SharedSlot, WriterMsg};
use super::Counters;
use crate::backend::{FrameRenderer, MediaBackend};
use crate::camera::{CameraSurface, PtsClock};
use crate::compositor::PreviewTarget;
use crate::encoder::{EncoderPoll, EncoderSettings, OutputBuffer, StreamFormat, VideoEncoder};
use crate::events::RecordCallback;
use crate::frame_ring::FrameRing;
use crate::muxer::{segment_path, segment_stamp, SegmentMuxer};
use crate::state::{Event, State, StateCell};

const TAG: &str = "RENDER";
const EOS_TIMEOUT: Duration = Duration::from_secs(2);
const QUIT_EOS_TIMEOUT: Duration = Duration::from_millis(300);
const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(1);
const EOS_POLL: Duration = Duration::from_millis(5);
/// Longest a stop waits for the key frame that completes a due rotation.
const STOP_ROTATION_WAIT: Duration = Duration::from_secs(1);

pub(crate) type Reply = Sender<Result<()>>;

pub(crate) enum RenderMsg {
    FrameAvailable,
    Start { session: String, reply: Reply },
    Stop { reply: Reply },
    SetPreview(Option<PreviewTarget>),
    SetWatermark(bool),
    Quit,
}

/// Everything the render thread needs, moved onto it at spawn.
pub(crate) struct RenderSetup {
    pub backend: Arc<dyn MediaBackend>,
    pub callback: Arc<dyn RecordCallback>,
    pub state: Arc<StateCell>,
    pub counters: Arc<Counters>,
    pub camera: CameraSurface,
    pub ring: Arc<FrameRing>,
    pub slot: SharedSlot,
    pub writer_tx: Sender<WriterMsg>,
    pub encoder_settings: EncoderSettings,
    pub first_segment: PathBuf,
    pub output_dir: PathBuf,
    pub position: String,
    pub segment_duration: Duration,
    pub watermark: bool,
    pub preview: Option<PreviewTarget>,
}

struct Recording {
    session: String,
    clock: PtsClock,
    next_rotation: Instant,
    /// The timer fired; cut at the next key frame.
    rotate_pending: bool,
}

struct RenderLoop {
    setup: RenderSetup,
    renderer: Box<dyn FrameRenderer>,
    encoder: Box<dyn VideoEncoder>,
    format: Option<StreamFormat>,
    recording: Option<Recording>,
    segment_index: u32,
    eos: bool,
}

pub(crate) fn render_thread(setup: RenderSetup, rx: Receiver<RenderMsg>, init_tx: Sender<Result<()>>) {
    let mut this = match RenderLoop::init(setup) {
        Ok(l) => l,
        Err(e) => {
            loge!(TAG, "init failed: {e:#}");
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    let _ = init_tx.send(Ok(()));
    this.run(&rx);
    this.shutdown();
}

impl RenderLoop {
    fn init(setup: RenderSetup) -> Result<Self> {
        let fps = setup.encoder_settings.frame_rate;
        let mut encoder = setup
            .backend
            .create_encoder(&setup.encoder_settings)
            .context("create encoder")?;
        let input = match encoder.create_input_surface() {
            Ok(i) => i,
            Err(e) => {
                encoder.shutdown();
                return Err(e.context("create encoder input surface"));
            }
        };
        let mut renderer = match setup.backend.create_renderer(&setup.camera) {
            Ok(r) => r,
            Err(e) => {
                encoder.shutdown();
                return Err(e.context("create renderer"));
            }
        };
        if let Err(e) = renderer.initialize(input) {
            renderer.release();
            encoder.shutdown();
            return Err(e);
        }
        renderer.set_watermark_enabled(setup.watermark);
        renderer.set_preview_target(setup.preview.clone());

        match SegmentMuxer::create(0, setup.first_segment.clone(), fps) {
            Ok(m) => lock_slot(&setup.slot).muxer = Some(m),
            Err(e) => {
                renderer.release();
                encoder.shutdown();
                return Err(e.context("create first segment"));
            }
        }
        logi!(
            TAG,
            "ready: {}x{} @ {} fps, segments of {:?} in {}",
            setup.encoder_settings.width,
            setup.encoder_settings.height,
            fps,
            setup.segment_duration,
            setup.output_dir.display()
        );

        Ok(Self {
            setup,
            renderer,
            encoder,
            format: None,
            recording: None,
            segment_index: 0,
            eos: false,
        })
    }

    fn run(&mut self, rx: &Receiver<RenderMsg>) {
        loop {
            let deadline = self
                .recording
                .as_ref()
                .filter(|r| !r.rotate_pending)
                .map(|r| r.next_rotation);
            let msg = match deadline {
                Some(d) => rx.recv_deadline(d),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match msg {
                Ok(RenderMsg::FrameAvailable) => self.on_frame(),
                Ok(RenderMsg::Start { session, reply }) => {
                    let _ = reply.send(self.start(session));
                }
                Ok(RenderMsg::Stop { reply }) => {
                    let _ = reply.send(self.stop());
                }
                Ok(RenderMsg::SetPreview(p)) => self.renderer.set_preview_target(p),
                Ok(RenderMsg::SetWatermark(on)) => self.renderer.set_watermark_enabled(on),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(r) = self.recording.as_mut() {
                        logd!(TAG, "rotation due; waiting for key frame");
                        r.rotate_pending = true;
                    }
                    self.drain_or_fail();
                }
                Ok(RenderMsg::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn on_frame(&mut self) {
        self.setup.camera.ack_notification();
        let Some(rec) = self.recording.as_mut() else {
            if let Err(e) = self.renderer.consume_frame() {
                logw!(TAG, "consume failed: {e:#}");
            }
            return;
        };
        match self.renderer.draw_frame(&mut rec.clock) {
            Ok(Some(_)) => {
                self.setup.counters.rendered();
                self.drain_or_fail();
            }
            Ok(None) => {}
            Err(e) => self.fail(e.context("draw")),
        }
    }

    fn drain_or_fail(&mut self) {
        if let Err(e) = self.drain_encoder() {
            self.fail(e.context("encoder"));
        }
    }

    /// Pull everything the encoder has ready. Never blocks.
    fn drain_encoder(&mut self) -> Result<()> {
        while !self.eos {
            match self.encoder.poll_output()? {
                EncoderPoll::TryAgainLater => break,
                EncoderPoll::FormatChanged(f) => self.on_format(f),
                EncoderPoll::Output(buf) => {
                    self.on_output(&buf);
                    self.encoder.release_output(buf);
                }
                EncoderPoll::EndOfStream => {
                    logd!(TAG, "encoder reached end of stream");
                    self.eos = true;
                }
            }
        }
        Ok(())
    }

    fn on_format(&mut self, format: StreamFormat) {
        if self.format.is_some() {
            logw!(TAG, "ignoring repeated format change");
            return;
        }
        logi!(TAG, "encoder format: {}x{} (sps {} bytes)", format.width, format.height, format.sps.len());
        if let Some(m) = lock_slot(&self.setup.slot).muxer.as_mut() {
            if let Err(e) = m.start(&format) {
                loge!(TAG, "segment {} could not start: {e:#}", m.index());
            }
        }
        self.format = Some(format);
    }

    fn on_output(&mut self, buf: &OutputBuffer) {
        let key = buf.flags.is_key();
        if key && self.recording.as_ref().is_some_and(|r| r.rotate_pending) {
            self.rotate();
        }

        let s = &self.setup;
        if let Some(mut slot) = s.ring.try_reserve() {
            if slot
                .frame_mut()
                .fill(&buf.data, buf.pts_us, buf.flags, buf.index, self.segment_index)
            {
                slot.commit();
                s.counters.queued();
                return;
            }
            // Dropping the reservation hands the slot back unused.
            s.counters.oversized();
            logd!(TAG, "unit of {} bytes exceeds slot capacity {}", buf.data.len(), s.ring.slot_capacity());
        }
        // Ring full or unit too large: write here, after whatever is still queued.
        let mut seg = lock_slot(&s.slot);
        seg.drain(&s.ring, &s.counters);
        seg.write(&buf.data, buf.pts_us, key, &s.counters);
        s.counters.direct();
    }

    /// Close the current segment at this key frame and continue in a new file.
    fn rotate(&mut self) {
        let new_index = self.segment_index + 1;
        let fps = self.setup.encoder_settings.frame_rate;
        let s = &self.setup;

        let old = {
            let mut seg = lock_slot(&s.slot);
            seg.drain(&s.ring, &s.counters);
            let stamp = segment_stamp(crate::logging::local_now());
            let path = segment_path(&s.output_dir, &stamp, &s.position, new_index);
            let mut next = match SegmentMuxer::create(new_index, path, fps) {
                Ok(m) => m,
                Err(e) => {
                    loge!(TAG, "segment {new_index} could not be created; extending current one: {e:#}");
                    drop(seg);
                    self.reschedule();
                    return;
                }
            };
            if let Some(f) = self.format.as_ref() {
                if let Err(e) = next.start(f) {
                    loge!(TAG, "segment {new_index} could not start: {e:#}");
                }
            }
            seg.muxer.replace(next)
        };
        self.segment_index = new_index;
        self.reschedule();

        // Finalizing outside the lock keeps the writer moving.
        let Some(summary) = old.and_then(|m| finish_muxer(m, &self.setup.counters)) else {
            return;
        };
        if summary.kept {
            if let Some(r) = self.recording.as_ref() {
                self.setup
                    .callback
                    .on_segment_switch(&r.session, new_index, &summary.path);
            }
        }
    }

    fn reschedule(&mut self) {
        let dur = self.setup.segment_duration;
        if let Some(r) = self.recording.as_mut() {
            r.rotate_pending = false;
            let now = Instant::now();
            r.next_rotation += dur;
            // A late key frame must not produce a burst of tiny segments.
            while r.next_rotation <= now {
                r.next_rotation += dur;
            }
        }
    }

    fn start(&mut self, session: String) -> Result<()> {
        if self.recording.is_some() {
            return Err(anyhow!("already recording"));
        }
        self.setup.counters.reset();
        {
            let mut seg = lock_slot(&self.setup.slot);
            match seg.muxer.as_ref() {
                Some(m) => self.segment_index = m.index(),
                None => {
                    let stamp = segment_stamp(crate::logging::local_now());
                    let path = segment_path(&self.setup.output_dir, &stamp, &self.setup.position, 0);
                    let mut m = SegmentMuxer::create(0, path, self.setup.encoder_settings.frame_rate)?;
                    if let Some(f) = self.format.as_ref() {
                        m.start(f)?;
                    }
                    seg.muxer = Some(m);
                    self.segment_index = 0;
                }
            }
        }
        self.setup
            .writer_tx
            .send(WriterMsg::Start)
            .map_err(|_| anyhow!("writer thread is gone"))?;
        logi!(TAG, "recording {session}");
        self.recording = Some(Recording {
            session,
            clock: PtsClock::default(),
            next_rotation: Instant::now() + self.setup.segment_duration,
            rotate_pending: false,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.recording.is_none() {
            return Ok(());
        }
        self.complete_due_rotation();
        if self.recording.is_none() {
            return Err(anyhow!("pipeline failed while stopping"));
        }
        self.finalize_recording(EOS_TIMEOUT);
        self.rearm_encoder()
    }

    /// A rotation whose time has come when stop arrives is still taken: keep rendering until the
    /// next key frame opens the new segment, so it holds at least that frame.
    fn complete_due_rotation(&mut self) {
        let Some(rec) = self.recording.as_mut() else {
            return;
        };
        if !rec.rotate_pending && rec.next_rotation > Instant::now() {
            return;
        }
        rec.rotate_pending = true;
        let index = self.segment_index;
        let wait = STOP_ROTATION_WAIT.min(self.setup.segment_duration);
        let deadline = Instant::now() + wait;
        logd!(TAG, "rotation due at stop; waiting for key frame");
        while self.segment_index == index && self.recording.is_some() {
            if Instant::now() >= deadline {
                logw!(TAG, "no key frame within {wait:?}; stopping in segment {index}");
                return;
            }
            if self.setup.camera.pending_timestamp_ns().is_some() {
                self.on_frame();
            } else {
                self.drain_or_fail();
                std::thread::sleep(EOS_POLL);
            }
        }
    }

    /// Push the tail of the stream through the encoder and close the segment.
    fn finalize_recording(&mut self, eos_timeout: Duration) {
        let Some(rec) = self.recording.take() else {
            return;
        };
        if let Err(e) = self.renderer.flush_encoder_input() {
            logw!(TAG, "flush of in-flight frames failed: {e:#}");
        }
        match self.encoder.signal_end_of_stream() {
            Ok(()) => self.drain_until_eos(eos_timeout),
            Err(e) => {
                logw!(TAG, "end of stream not signalled: {e:#}");
                if let Err(e) = self.drain_encoder() {
                    logw!(TAG, "final drain failed: {e:#}");
                }
            }
        }

        writer::stop_and_wait(&self.setup.writer_tx, WRITER_STOP_TIMEOUT);
        let s = &self.setup;
        let summary = {
            let mut seg = lock_slot(&s.slot);
            seg.drain(&s.ring, &s.counters);
            seg.finish(&s.counters)
        };
        logi!(
            TAG,
            "recording {} stopped after segment {} ({} samples)",
            rec.session,
            self.segment_index,
            summary.map(|sum| sum.samples).unwrap_or(0)
        );
    }

    fn drain_until_eos(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if let Err(e) = self.drain_encoder() {
                logw!(TAG, "drain after end of stream failed: {e:#}");
                return;
            }
            if self.eos {
                return;
            }
            if Instant::now() >= deadline {
                logw!(TAG, "encoder did not reach end of stream within {timeout:?}");
                return;
            }
            std::thread::sleep(EOS_POLL);
        }
    }

    /// Each encoder instance runs one stream; a later start needs a fresh one.
    fn rearm_encoder(&mut self) -> Result<()> {
        self.encoder.shutdown();
        let mut encoder = self
            .setup
            .backend
            .create_encoder(&self.setup.encoder_settings)
            .context("re-create encoder")?;
        let input = encoder.create_input_surface()?;
        self.renderer.attach_encoder_input(input)?;
        self.encoder = encoder;
        self.format = None;
        self.eos = false;
        logd!(TAG, "encoder re-armed");
        Ok(())
    }

    fn fail(&mut self, err: anyhow::Error) {
        loge!(TAG, "pipeline failed: {err:#}");
        let prev = match self.setup.state.transition(Event::Fail) {
            Ok((prev, _)) => Some(prev),
            Err(e) => {
                logd!(TAG, "fail transition rejected: {e}");
                None
            }
        };
        let Some(session) = self.recording.as_ref().map(|r| r.session.clone()) else {
            return;
        };
        self.finalize_recording(QUIT_EOS_TIMEOUT);
        // A stop already in progress reports the end itself.
        if prev == Some(State::Recording) {
            self.setup.callback.on_record_stop(&session);
        }
    }

    fn shutdown(&mut self) {
        if self.recording.is_some() {
            self.finalize_recording(QUIT_EOS_TIMEOUT);
        }
        {
            let s = &self.setup;
            let mut seg = lock_slot(&s.slot);
            seg.drain(&s.ring, &s.counters);
            seg.finish(&s.counters);
        }
        self.renderer.release();
        self.encoder.shutdown();
        logd!(TAG, "render thread done");
    }
}
