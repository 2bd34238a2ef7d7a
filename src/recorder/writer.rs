//! Write thread: moves encoded frames from the ring into the active segment.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::Counters;
use crate::frame_ring::FrameRing;
use crate::muxer::{SegmentMuxer, SegmentSummary};

const TAG: &str = "WRITE";
const READY_WAIT: Duration = Duration::from_millis(10);

/// The segment currently being written, shared by the writer, the direct-write path and
/// rotation. Always lock this before touching the ring.
#[derive(Debug, Default)]
pub(crate) struct SegmentSlot {
    pub muxer: Option<SegmentMuxer>,
}

pub(crate) type SharedSlot = Arc<Mutex<SegmentSlot>>;

pub(crate) fn lock_slot(slot: &Mutex<SegmentSlot>) -> MutexGuard<'_, SegmentSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SegmentSlot {
    /// Write one access unit. A muxer error costs that sample only.
    pub fn write(&mut self, data: &[u8], pts_us: i64, is_key: bool, counters: &Counters) {
        let Some(muxer) = self.muxer.as_mut() else {
            counters.dropped();
            logw!(TAG, "no active segment; sample at {pts_us} us dropped");
            return;
        };
        if let Err(e) = muxer.write_sample(data, pts_us, is_key) {
            counters.dropped();
            logw!(TAG, "segment {}: sample at {pts_us} us dropped: {e:#}", muxer.index());
        }
    }

    /// Pop everything queued in `ring` into the active segment. Returns how many were written.
    pub fn drain(&mut self, ring: &FrameRing, counters: &Counters) -> usize {
        let mut n = 0;
        while let Some(frame) = ring.try_pop() {
            self.write(frame.data(), frame.pts_us, frame.flags.is_key(), counters);
            n += 1;
        }
        n
    }

    /// Finalize the active segment, if any.
    pub fn finish(&mut self, counters: &Counters) -> Option<SegmentSummary> {
        finish_muxer(self.muxer.take()?, counters)
    }
}

pub(crate) fn finish_muxer(muxer: SegmentMuxer, counters: &Counters) -> Option<SegmentSummary> {
    let index = muxer.index();
    match muxer.finish() {
        Ok(summary) => {
            if summary.kept {
                counters.segment_completed();
                logi!(TAG, "segment {} closed: {} ({} samples)", index, summary.path.display(), summary.samples);
            }
            Some(summary)
        }
        Err(e) => {
            loge!(TAG, "segment {index} could not be finalized: {e:#}");
            None
        }
    }
}

pub(crate) enum WriterMsg {
    /// Begin consuming the ring.
    Start,
    /// Finish consuming: ack once the ring is empty.
    Stop { ack: Sender<()> },
    Quit,
}

pub(crate) struct WriterHandle {
    pub tx: Sender<WriterMsg>,
    pub join: JoinHandle<()>,
    /// Disconnects when the thread has exited.
    pub exited: Receiver<()>,
}

pub(crate) fn spawn(
    name: String,
    ring: Arc<FrameRing>,
    slot: SharedSlot,
    counters: Arc<Counters>,
) -> std::io::Result<WriterHandle> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let (exit_tx, exited) = crossbeam_channel::bounded::<()>(0);
    let join = thread::Builder::new().name(name).spawn(move || {
        let _exit = exit_tx;
        writer_thread(rx, &ring, &slot, &counters);
    })?;
    Ok(WriterHandle { tx, join, exited })
}

fn writer_thread(rx: Receiver<WriterMsg>, ring: &FrameRing, slot: &Mutex<SegmentSlot>, counters: &Counters) {
    let mut active = false;
    let mut stop_ack: Option<Sender<()>> = None;
    let mut quit = false;

    while !quit {
        if !active {
            // Idle until started; nothing is queued while not recording.
            match rx.recv() {
                Ok(WriterMsg::Start) => {
                    active = true;
                    logd!(TAG, "consume loop started");
                }
                Ok(WriterMsg::Stop { ack }) => {
                    let _ = ack.send(());
                }
                Ok(WriterMsg::Quit) | Err(_) => quit = true,
            }
            continue;
        }

        loop {
            match rx.try_recv() {
                Ok(WriterMsg::Start) => {}
                Ok(WriterMsg::Stop { ack }) => stop_ack = Some(ack),
                Ok(WriterMsg::Quit) | Err(TryRecvError::Disconnected) => {
                    quit = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        if ring.wait_ready(READY_WAIT) {
            write_one(ring, slot, counters);
        }

        if stop_ack.is_some() || quit {
            // Stop only once everything queued has reached the segment.
            let written = lock_slot(slot).drain(ring, counters);
            if written > 0 {
                logd!(TAG, "flushed {written} queued frames");
            }
            if let Some(ack) = stop_ack.take() {
                let _ = ack.send(());
            }
            active = false;
            logd!(TAG, "consume loop stopped");
        }
    }
    logd!(TAG, "writer exiting");
}

fn write_one(ring: &FrameRing, slot: &Mutex<SegmentSlot>, counters: &Counters) {
    let mut guard = lock_slot(slot);
    let Some(frame) = ring.try_pop() else {
        return;
    };
    if let Some(m) = guard.muxer.as_ref() {
        if m.index() != frame.segment {
            logd!(TAG, "frame tagged for segment {} written to {}", frame.segment, m.index());
        }
    }
    guard.write(frame.data(), frame.pts_us, frame.flags.is_key(), counters);
}

/// Wait for the writer to confirm it has emptied the ring.
pub(crate) fn stop_and_wait(tx: &Sender<WriterMsg>, timeout: Duration) -> bool {
    let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
    if tx.send(WriterMsg::Stop { ack: ack_tx }).is_err() {
        return false;
    }
    match ack_rx.recv_timeout(timeout) {
        Ok(()) => true,
        Err(RecvTimeoutError::Timeout) => {
            logw!(TAG, "writer did not acknowledge stop within {timeout:?}");
            false
        }
        Err(RecvTimeoutError::Disconnected) => false,
    }
}
