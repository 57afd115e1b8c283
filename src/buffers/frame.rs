//! Bounded frame queue with drop-oldest overflow policy.
//!
//! An owned-payload queue: every write copies the payload into a freshly
//! allocated `Vec<u8>`-backed descriptor, and capacity overflow pops and
//! frees the oldest descriptor rather than failing the write.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One queued frame. `payload` is heap-owned; dropping a `FrameDescriptor`
/// frees it exactly once (ordinary `Vec<u8>` drop semantics — there is no
/// manual free path left to double-call).
#[derive(Clone)]
pub struct FrameDescriptor {
    pub source_client_id: u32,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

/// Encodes a decoded RGB frame as `{width:u32, height:u32, rgb...}` for
/// storage in a [`FrameBuffer`], so the outbound compositor can recover the
/// source dimensions without threading them through separately.
pub fn encode_stored_frame(width: u32, height: u32, rgb: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + rgb.len());
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(rgb);
    out
}

/// Reverses [`encode_stored_frame`].
pub fn decode_stored_frame(payload: &[u8]) -> Option<(u32, u32, &[u8])> {
    if payload.len() < 8 {
        return None;
    }
    let width = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let height = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    Some((width, height, &payload[8..]))
}

struct Inner {
    queue: VecDeque<FrameDescriptor>,
    capacity: usize,
}

/// A bounded, drop-oldest frame queue. One instance per session per media
/// kind (video frame buffer, audio batch buffer).
pub struct FrameBuffer {
    inner: Mutex<Inner>,
    next_sequence: AtomicU64,
    writes_succeeded: AtomicU64,
    drops: AtomicU64,
    reads: AtomicU64,
    destroyed: AtomicBool,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
            }),
            next_sequence: AtomicU64::new(0),
            writes_succeeded: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    fn assert_alive(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            crate::error::CoreError::internal("use of destroyed FrameBuffer").abort_on_internal();
        }
    }

    /// Copies `payload`, assigns the next monotonic sequence number, and
    /// pushes it; if full, pops and frees the oldest descriptor first.
    pub fn write(&self, source_client_id: u32, timestamp_ms: u64, payload: &[u8]) -> u64 {
        self.assert_alive();
        let seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let descriptor = FrameDescriptor {
            source_client_id,
            sequence: seq,
            timestamp_ms,
            payload: payload.to_vec(),
        };
        let mut guard = self.inner.lock();
        if guard.queue.len() >= guard.capacity {
            guard.queue.pop_front(); // freed here, when it is dropped
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
        guard.queue.push_back(descriptor);
        self.writes_succeeded.fetch_add(1, Ordering::Relaxed);
        seq
    }

    /// Pops and returns the oldest descriptor, transferring payload
    /// ownership to the caller.
    pub fn read(&self) -> Option<FrameDescriptor> {
        self.assert_alive();
        let mut guard = self.inner.lock();
        let d = guard.queue.pop_front();
        if d.is_some() {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        d
    }

    /// Returns a *copy* of the newest descriptor's payload without
    /// consuming it. The caller owns the copy.
    pub fn peek_latest(&self) -> Option<FrameDescriptor> {
        self.assert_alive();
        let guard = self.inner.lock();
        guard.queue.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frees every queued descriptor's payload exactly once.
    pub fn clear(&self) {
        self.assert_alive();
        let mut guard = self.inner.lock();
        guard.queue.clear();
    }

    /// Frees all remaining descriptors and poisons the handle so a second
    /// call is detected as an `InternalError` rather than silently
    /// succeeding.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            crate::error::CoreError::internal("double-destroy of FrameBuffer").abort_on_internal();
        }
        self.inner.lock().queue.clear();
    }

    /// `writes_succeeded <= reads + drops + current_size`.
    pub fn writes_succeeded(&self) -> u64 {
        self.writes_succeeded.load(Ordering::Relaxed)
    }
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.inner.lock().queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_under_overload() {
        // Concrete scenario #3: 100 writes into a 5-slot buffer -> exactly
        // 5 remain, sequences [96..100], 95 freed.
        let fb = FrameBuffer::new(5);
        for i in 0..100u32 {
            fb.write(1, i as u64, &i.to_le_bytes());
        }
        assert_eq!(fb.len(), 5);
        assert_eq!(fb.drops(), 95);
        let remaining: Vec<u64> = {
            let mut v = vec![];
            while let Some(d) = fb.read() {
                v.push(d.sequence);
            }
            v
        };
        assert_eq!(remaining, vec![95, 96, 97, 98, 99]);
    }

    #[test]
    fn conservation_invariant() {
        let fb = FrameBuffer::new(3);
        for i in 0..10u32 {
            fb.write(1, i as u64, b"x");
        }
        let _ = fb.read();
        let _ = fb.read();
        assert!(fb.writes_succeeded() <= fb.reads() + fb.drops() + fb.len() as u64);
    }

    #[test]
    fn peek_latest_does_not_consume() {
        let fb = FrameBuffer::new(4);
        fb.write(1, 0, b"a");
        fb.write(1, 1, b"b");
        let peeked = fb.peek_latest().unwrap();
        assert_eq!(peeked.payload, b"b");
        assert_eq!(fb.len(), 2);
    }

    #[test]
    #[should_panic]
    fn double_destroy_aborts() {
        let fb = FrameBuffer::new(2);
        fb.destroy();
        fb.destroy();
    }
}
