//! Camera surface: the attach point handed back by `Recorder::prepare`.
//!
//! A camera producer (any thread) submits RGBA frames; the render thread latches the newest one
//! into the camera texture. Only the latest frame is kept. Frame-available notifications are
//! coalesced so at most one is in flight to the render thread at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Column-major 4x4 matrix applied to texture coordinates.
pub type Transform = [f32; 16];

/// Flip V: image rows arrive top-first, GL textures start at the bottom.
pub const FLIP_Y: Transform = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, -1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 1.0, 0.0, 1.0,
];

type Listener = Box<dyn Fn() + Send + Sync>;

struct Slot {
    rgba: Vec<u8>,
    timestamp_ns: i64,
    transform: Transform,
    fresh: bool,
}

struct Shared {
    width: u32,
    height: u32,
    slot: Mutex<Slot>,
    notified: AtomicBool,
    listener: Mutex<Option<Listener>>,
    submitted: AtomicU64,
}

/// Turns camera timestamps into presentation times relative to the first frame seen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PtsClock {
    base_ns: Option<i64>,
}

impl PtsClock {
    pub fn with_base(base_ns: i64) -> Self {
        Self { base_ns: Some(base_ns) }
    }

    pub fn pts_us(&mut self, timestamp_ns: i64) -> i64 {
        let base = *self.base_ns.get_or_insert(timestamp_ns);
        (timestamp_ns - base).max(0) / 1000
    }
}

/// What `latch` copied out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatchedFrame {
    pub timestamp_ns: i64,
    pub transform: Transform,
}

#[derive(Clone)]
pub struct CameraSurface {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for CameraSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSurface")
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CameraSurface {
    pub fn new(width: u32, height: u32) -> Self {
        let bytes = width as usize * height as usize * 4;
        Self {
            inner: Arc::new(Shared {
                width,
                height,
                slot: Mutex::new(Slot {
                    rgba: vec![0u8; bytes],
                    timestamp_ns: 0,
                    transform: FLIP_Y,
                    fresh: false,
                }),
                notified: AtomicBool::new(false),
                listener: Mutex::new(None),
                submitted: AtomicU64::new(0),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn frame_bytes(&self) -> usize {
        self.inner.width as usize * self.inner.height as usize * 4
    }

    /// Submit one tightly packed RGBA frame. `timestamp_ns` is on the producer's clock; only
    /// differences matter. Returns false if the frame has the wrong size.
    pub fn submit_frame(&self, rgba: &[u8], timestamp_ns: i64) -> bool {
        if rgba.len() != self.frame_bytes() {
            return false;
        }
        {
            let mut slot = lock(&self.inner.slot);
            slot.rgba.copy_from_slice(rgba);
            slot.timestamp_ns = timestamp_ns;
            slot.fresh = true;
        }
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);

        if !self.inner.notified.swap(true, Ordering::AcqRel) {
            if let Some(l) = lock(&self.inner.listener).as_ref() {
                l();
            }
        }
        true
    }

    /// Set the texture transform applied to subsequent frames.
    pub fn set_transform(&self, transform: Transform) {
        lock(&self.inner.slot).transform = transform;
    }

    pub fn frames_submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    /// Timestamp of the newest unlatched frame, if any.
    pub fn pending_timestamp_ns(&self) -> Option<i64> {
        let slot = lock(&self.inner.slot);
        slot.fresh.then_some(slot.timestamp_ns)
    }

    /// Swap the newest frame into `dst` (resized to the frame size once). Returns `None` when no
    /// new frame arrived since the last latch.
    pub fn latch(&self, dst: &mut Vec<u8>) -> Option<LatchedFrame> {
        let mut slot = lock(&self.inner.slot);
        if !slot.fresh {
            return None;
        }
        if dst.len() != slot.rgba.len() {
            dst.resize(slot.rgba.len(), 0);
        }
        std::mem::swap(dst, &mut slot.rgba);
        slot.fresh = false;
        Some(LatchedFrame {
            timestamp_ns: slot.timestamp_ns,
            transform: slot.transform,
        })
    }

    /// Drop the newest frame without copying it.
    pub fn discard(&self) -> Option<i64> {
        let mut slot = lock(&self.inner.slot);
        let fresh = std::mem::take(&mut slot.fresh);
        fresh.then_some(slot.timestamp_ns)
    }

    /// Re-arm notifications. The render thread calls this before handling a frame-available
    /// message so a frame submitted meanwhile posts a new one.
    pub(crate) fn ack_notification(&self) {
        self.inner.notified.store(false, Ordering::Release);
    }

    pub(crate) fn set_frame_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        *lock(&self.inner.listener) = Some(Box::new(listener));
        self.inner.notified.store(false, Ordering::Release);
    }

    pub(crate) fn clear_frame_listener(&self) {
        lock(&self.inner.listener).take();
    }
}
