//! Lock-free single-producer single-consumer ring buffer.
//!
//! `RingBuffer<T>` is the building block for the per-source audio sample
//! queues. It is *not* safe for concurrent writers or concurrent readers —
//! only one producer and one consumer may call `try_write`/`try_read`
//! respectively at a time.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct RingBuffer<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: AtomicUsize, // next slot to write, monotonic
    tail: AtomicUsize, // next slot to read, monotonic
    size: AtomicUsize,
}

// SAFETY: access to `buf` is gated by the head/tail/size protocol below,
// which guarantees a slot is touched by at most one side at a time as long
// as callers respect the SPSC contract.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Capacity is rounded up to the next power of two (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let mut v = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            v.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self {
            buf: v.into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Producer-only. Returns `false` (and drops nothing) if full.
    pub fn try_write(&self, value: T) -> bool {
        if self.size.load(Ordering::Acquire) >= self.capacity() {
            return false;
        }
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.buf[head & self.mask];
        // SAFETY: single producer; this slot was vacated by the consumer
        // (or never used) because size < capacity.
        unsafe {
            (*slot.get()).write(value);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        self.size.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Consumer-only. Returns `None` if empty.
    pub fn try_read(&self) -> Option<T> {
        if self.size.load(Ordering::Acquire) == 0 {
            return None;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        let slot = &self.buf[tail & self.mask];
        // SAFETY: single consumer; this slot was filled by the producer
        // because size > 0.
        let value = unsafe { (*slot.get()).assume_init_read() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        self.size.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    /// Drop every currently-queued element.
    pub fn clear(&self) {
        while self.try_read().is_some() {}
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl RingBuffer<f32> {
    /// Read up to `out.len()` samples, consuming them. Returns the number
    /// actually read (may be less than requested if the buffer underruns).
    pub fn read_samples(&self, out: &mut [f32]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.try_read() {
                Some(s) => {
                    out[n] = s;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Write as many samples as fit; returns the number written (the rest
    /// are *not* dropped here — audio ring buffers never block and never
    /// silently drop within this call, callers decide drop policy).
    pub fn write_samples(&self, samples: &[f32]) -> usize {
        let mut n = 0;
        for &s in samples {
            if !self.try_write(s) {
                break;
            }
            n += 1;
        }
        n
    }

    /// Writes `samples`, discarding the oldest queued samples first if
    /// there isn't room for the whole batch, so the newest audio always
    /// wins. `samples` must not exceed `capacity()`.
    pub fn write_dropping_oldest(&self, samples: &[f32]) {
        let needed = samples.len().min(self.capacity());
        let available = self.capacity() - self.len();
        if available < needed {
            for _ in 0..(needed - available) {
                if self.try_read().is_none() {
                    break;
                }
            }
        }
        self.write_samples(&samples[samples.len() - needed..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let rb: RingBuffer<u8> = RingBuffer::new(5);
        assert_eq!(rb.capacity(), 8);
    }

    #[test]
    fn size_monotonicity_under_interleaved_ops() {
        // I-RINGBUF-SIZE: 0 <= size <= capacity, size == writes - reads.
        let rb: RingBuffer<u32> = RingBuffer::new(4);
        let mut writes = 0usize;
        let mut reads = 0usize;
        for i in 0..20u32 {
            if rb.try_write(i) {
                writes += 1;
            }
            assert!(rb.len() <= rb.capacity());
            if i % 3 == 0 {
                if rb.try_read().is_some() {
                    reads += 1;
                }
            }
            assert_eq!(rb.len(), writes - reads);
        }
    }

    #[test]
    fn full_buffer_rejects_write_empty_rejects_read() {
        let rb: RingBuffer<u8> = RingBuffer::new(2);
        assert!(rb.try_write(1));
        assert!(rb.try_write(2));
        assert!(!rb.try_write(3));
        assert_eq!(rb.try_read(), Some(1));
        assert_eq!(rb.try_read(), Some(2));
        assert_eq!(rb.try_read(), None);
    }

    #[test]
    fn write_dropping_oldest_keeps_newest_samples() {
        let rb: RingBuffer<f32> = RingBuffer::new(4);
        rb.write_samples(&[1.0, 2.0, 3.0, 4.0]);
        rb.write_dropping_oldest(&[5.0, 6.0]);
        let mut out = [0f32; 4];
        assert_eq!(rb.read_samples(&mut out), 4);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn drop_runs_destructors_for_remaining_elements() {
        use std::sync::Arc;
        let counter = Arc::new(());
        let rb: RingBuffer<Arc<()>> = RingBuffer::new(4);
        rb.try_write(counter.clone());
        rb.try_write(counter.clone());
        assert_eq!(Arc::strong_count(&counter), 3);
        drop(rb);
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
