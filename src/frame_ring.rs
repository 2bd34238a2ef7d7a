//! Bounded ring of preallocated encoded-frame buffers.
//!
//! Connects the render thread (single producer) to the writer thread (single consumer).
//! Every slot owns one `EncodedFrame` whose buffer is allocated once, at construction; in steady
//! state nothing is allocated per frame.
//!
//! Slot lifecycle: `Free` → `Reserved` (producer filling) → `Queued` → `Writing` (consumer holds a
//! `FrameLease`) → `Free`. At most N slots are ever queued or being written.

use std::ops::Deref;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Per-frame flags carried from the encoder to the muxer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u32);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    pub const KEY_FRAME: FrameFlags = FrameFlags(1);
    pub const CODEC_CONFIG: FrameFlags = FrameFlags(2);
    pub const END_OF_STREAM: FrameFlags = FrameFlags(4);

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_key(self) -> bool {
        self.contains(FrameFlags::KEY_FRAME)
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;
    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// One encoded access unit copied out of the encoder.
#[derive(Debug)]
pub struct EncodedFrame {
    data: Vec<u8>,
    pub pts_us: i64,
    pub flags: FrameFlags,
    /// Index of the encoder output buffer the payload came from.
    pub buffer_index: usize,
    /// Segment the frame was produced for.
    pub segment: u32,
}

impl EncodedFrame {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            pts_us: 0,
            flags: FrameFlags::NONE,
            buffer_index: 0,
            segment: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copy `payload` + metadata in. Returns false (frame untouched) if the payload does not fit,
    /// so the buffer never grows past its preallocated capacity.
    pub fn fill(
        &mut self,
        payload: &[u8],
        pts_us: i64,
        flags: FrameFlags,
        buffer_index: usize,
        segment: u32,
    ) -> bool {
        if payload.len() > self.data.capacity() {
            return false;
        }
        self.data.clear();
        self.data.extend_from_slice(payload);
        self.pts_us = pts_us;
        self.flags = flags;
        self.buffer_index = buffer_index;
        self.segment = segment;
        true
    }

    fn clear(&mut self) {
        self.data.clear();
        self.pts_us = 0;
        self.flags = FrameFlags::NONE;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Reserved,
    Queued,
    Writing,
}

struct Inner {
    frames: Vec<Option<EncodedFrame>>,
    states: Vec<SlotState>,
    head: usize,
    queued: usize,
}

impl Inner {
    fn tail(&self) -> usize {
        (self.head + self.queued) % self.frames.len()
    }
}

/// Occupancy counters, for tests and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingOccupancy {
    pub queued: usize,
    pub reserved: usize,
    pub writing: usize,
}

pub struct FrameRing {
    inner: Mutex<Inner>,
    ready: Condvar,
    slot_capacity: usize,
}

impl FrameRing {
    /// `slots` buffers of `slot_capacity` bytes each. Zero slots is allowed: every reservation
    /// then fails and producers always take their fallback path.
    pub fn new(slots: usize, slot_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: (0..slots)
                    .map(|_| Some(EncodedFrame::with_capacity(slot_capacity)))
                    .collect(),
                states: vec![SlotState::Free; slots],
                head: 0,
                queued: 0,
            }),
            ready: Condvar::new(),
            slot_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slots(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    /// Non-blocking: claim the next tail slot for filling.
    ///
    /// Fails when every slot is queued or being written (ring full), or when the tail slot is
    /// still held by the consumer.
    pub fn try_reserve(&self) -> Option<FrameReservation<'_>> {
        let mut inner = self.lock();
        let n = inner.frames.len();
        if n == 0 || inner.queued == n {
            return None;
        }
        let idx = inner.tail();
        if inner.states[idx] != SlotState::Free {
            return None;
        }
        let frame = inner.frames[idx].take()?;
        inner.states[idx] = SlotState::Reserved;
        Some(FrameReservation {
            ring: self,
            index: idx,
            frame,
            committed: false,
        })
    }

    /// Non-blocking: take the oldest queued frame.
    pub fn try_pop(&self) -> Option<FrameLease<'_>> {
        let mut inner = self.lock();
        if inner.queued == 0 {
            return None;
        }
        let idx = inner.head;
        let frame = inner.frames[idx].take()?;
        inner.states[idx] = SlotState::Writing;
        inner.head = (inner.head + 1) % inner.frames.len();
        inner.queued -= 1;
        Some(FrameLease {
            ring: self,
            index: idx,
            frame,
        })
    }

    /// Wait until at least one frame is queued or `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let (inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |i| i.queued == 0)
            .unwrap_or_else(PoisonError::into_inner);
        inner.queued > 0
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queued == 0
    }

    pub fn occupancy(&self) -> RingOccupancy {
        let inner = self.lock();
        let count = |s: SlotState| inner.states.iter().filter(|&&x| x == s).count();
        RingOccupancy {
            queued: inner.queued,
            reserved: count(SlotState::Reserved),
            writing: count(SlotState::Writing),
        }
    }

    /// Drop every queued frame (returns them to `Free`). Slots currently reserved or leased are
    /// left alone; their guards return them.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.queued;
        while inner.queued > 0 {
            let idx = inner.head;
            if let Some(f) = inner.frames[idx].as_mut() {
                f.clear();
            }
            inner.states[idx] = SlotState::Free;
            inner.head = (inner.head + 1) % inner.frames.len();
            inner.queued -= 1;
        }
        dropped
    }

    /// Wake any waiter (used when asking the consumer to stop).
    pub fn wake(&self) {
        self.ready.notify_all();
    }

    fn put_back(&self, index: usize, mut frame: EncodedFrame, commit: bool) {
        let mut inner = self.lock();
        if commit {
            inner.states[index] = SlotState::Queued;
            inner.frames[index] = Some(frame);
            inner.queued += 1;
            drop(inner);
            self.ready.notify_one();
        } else {
            frame.clear();
            inner.states[index] = SlotState::Free;
            inner.frames[index] = Some(frame);
        }
    }
}

/// A tail slot claimed by the producer. Commit it to queue the frame; dropping it hands the slot
/// back unused.
pub struct FrameReservation<'a> {
    ring: &'a FrameRing,
    index: usize,
    frame: EncodedFrame,
    committed: bool,
}

impl FrameReservation<'_> {
    pub fn frame_mut(&mut self) -> &mut EncodedFrame {
        &mut self.frame
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for FrameReservation<'_> {
    fn drop(&mut self) {
        // An empty Vec does not allocate; the real buffer goes back into the slot.
        let frame = std::mem::replace(&mut self.frame, EncodedFrame::with_capacity(0));
        self.ring.put_back(self.index, frame, self.committed);
    }
}

/// A frame being written by the consumer; dropping the lease returns it to its slot.
pub struct FrameLease<'a> {
    ring: &'a FrameRing,
    index: usize,
    frame: EncodedFrame,
}

impl Deref for FrameLease<'_> {
    type Target = EncodedFrame;
    fn deref(&self) -> &EncodedFrame {
        &self.frame
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        let frame = std::mem::replace(&mut self.frame, EncodedFrame::with_capacity(0));
        self.ring.put_back(self.index, frame, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn push(ring: &FrameRing, payload: &[u8], pts: i64) -> bool {
        match ring.try_reserve() {
            Some(mut r) => {
                if !r.frame_mut().fill(payload, pts, FrameFlags::NONE, 0, 0) {
                    return false;
                }
                r.commit();
                true
            }
            None => false,
        }
    }

    #[test]
    fn fifo_order_and_capacity_bound() {
        let ring = FrameRing::new(3, 16);
        assert!(push(&ring, b"a", 1));
        assert!(push(&ring, b"b", 2));
        assert!(push(&ring, b"c", 3));
        assert!(!push(&ring, b"d", 4), "ring of 3 must refuse a fourth frame");

        let pts: Vec<i64> = std::iter::from_fn(|| ring.try_pop().map(|l| l.pts_us)).collect();
        assert_eq!(pts, vec![1, 2, 3]);
        assert!(ring.is_empty());
    }

    #[test]
    fn leased_slot_is_not_reused_until_returned() {
        let ring = FrameRing::new(2, 16);
        assert!(push(&ring, b"a", 1));
        let lease = ring.try_pop().unwrap();
        assert!(push(&ring, b"b", 2));
        // Tail wrapped onto the leased slot.
        assert!(ring.try_reserve().is_none());
        let occ = ring.occupancy();
        assert_eq!(occ.queued + occ.writing, 2);

        drop(lease);
        assert!(push(&ring, b"c", 3));
        assert_eq!(ring.occupancy().queued, 2);
    }

    #[test]
    fn oversized_payload_is_refused_and_slot_returned() {
        let ring = FrameRing::new(1, 4);
        let mut r = ring.try_reserve().unwrap();
        assert!(!r.frame_mut().fill(&[0u8; 5], 0, FrameFlags::NONE, 0, 0));
        drop(r);
        assert_eq!(ring.occupancy(), RingOccupancy { queued: 0, reserved: 0, writing: 0 });
        assert!(push(&ring, &[1, 2, 3, 4], 9));
    }

    #[test]
    fn buffers_keep_their_capacity() {
        let ring = FrameRing::new(2, 64);
        for i in 0..10 {
            assert!(push(&ring, &[7u8; 40], i));
            let lease = ring.try_pop().unwrap();
            assert_eq!(lease.capacity(), 64);
            assert_eq!(lease.data().len(), 40);
        }
    }

    #[test]
    fn zero_slots_always_refuses() {
        let ring = FrameRing::new(0, 64);
        assert!(ring.try_reserve().is_none());
        assert!(ring.try_pop().is_none());
        assert!(!ring.wait_ready(Duration::from_millis(1)));
    }

    #[test]
    fn clear_returns_queued_frames() {
        let ring = FrameRing::new(4, 8);
        for i in 0..3 {
            assert!(push(&ring, b"x", i));
        }
        assert_eq!(ring.clear(), 3);
        assert!(ring.is_empty());
        for i in 0..4 {
            assert!(push(&ring, b"y", i));
        }
    }

    #[test]
    fn producer_consumer_threads_never_exceed_capacity() {
        const N: usize = 4;
        let ring = Arc::new(FrameRing::new(N, 32));
        let consumer_ring = ring.clone();

        let consumer = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < 500 {
                if consumer_ring.wait_ready(Duration::from_millis(10)) {
                    while let Some(lease) = consumer_ring.try_pop() {
                        let occ = consumer_ring.occupancy();
                        assert!(occ.queued + occ.writing + occ.reserved <= N);
                        seen.push(lease.pts_us);
                    }
                }
            }
            seen
        });

        let mut sent = 0i64;
        while sent < 500 {
            if push(&ring, &sent.to_le_bytes(), sent) {
                sent += 1;
            } else {
                std::thread::yield_now();
            }
        }

        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..500).collect::<Vec<i64>>());
    }
}
