//! Lock-free single-producer single-consumer byte ring buffer.
//!
//! This is the only data structure shared between the strobe service context
//! and the main loop.  The producer (strobe service) writes `head` and only
//! `head`; the consumer (drain loop) writes `tail` and only `tail`.  Both
//! indices are monotonically increasing wrapping counters, so fullness is
//! `head - tail == N` with no reserved slot and no shared `count` field to
//! tear.
//!
//! The producer must never block, lock or allocate - `write()` is a handful
//! of atomic operations and one byte store.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::cell::UnsafeCell;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

/// Fixed-capacity SPSC byte queue with sticky overflow detection.
///
/// `N` is the capacity in bytes.  The buffer is const-constructible so it
/// can live in a `static` and be shared with the capture context without a
/// lock.
///
/// Context rules:
/// - `write`/`write_bytes` may only be called from the single producer
///   context.
/// - `read`/`peek`/`read_bytes`/`clear`/`clear_overflow` may only be called
///   from the single consumer context.
/// - The queries (`available`, `free`, `is_empty`, `is_full`, `capacity`,
///   `utilization`, `has_overflow`) are safe from either context.
pub struct RingBuffer<const N: usize> {
    buf: UnsafeCell<[u8; N]>,

    /// Total bytes ever written (wrapping).  Written by the producer only.
    head: AtomicUsize,

    /// Total bytes ever read (wrapping).  Written by the consumer only.
    tail: AtomicUsize,

    /// Sticky overflow flag.  Set by the producer on a refused write,
    /// cleared by the consumer.
    overflow: AtomicBool,
}

// SAFETY: the byte array is only written through `write`/`write_bytes`
// (producer context, slots at indices >= tail + N never aliased by the
// consumer) and only read through `read`/`peek`/`read_bytes` (consumer
// context, slots below head).  The head/tail handoff uses Release stores
// paired with Acquire loads, so the byte written at `head % N` is visible
// before the consumer can observe the advanced head.
unsafe impl<const N: usize> Sync for RingBuffer<N> {}

impl<const N: usize> RingBuffer<N> {
    /// Create an empty buffer.  Const so it can initialize a `static`.
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
        }
    }

    /// Write a single byte.  Producer context only.
    ///
    /// Returns false and sets the sticky overflow flag if the buffer is
    /// full; the byte is dropped, not retried - there is no backpressure
    /// beyond BUSY at the electrical layer.
    #[inline(always)]
    pub fn write(&self, data: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= N {
            self.overflow.store(true, Ordering::Release);
            return false;
        }

        // SAFETY: this slot is beyond the consumer's reach until the head
        // store below publishes it (see the Sync rationale).
        unsafe {
            (*self.buf.get())[head % N] = data;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Read a single byte into `data`.  Consumer context only.
    ///
    /// Returns false if the buffer is empty.
    #[inline(always)]
    pub fn read(&self, data: &mut u8) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return false;
        }

        // SAFETY: head > tail, so this slot holds a published byte the
        // producer will not touch again until tail advances past it.
        unsafe {
            *data = (*self.buf.get())[tail % N];
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Read the next byte without consuming it.  Consumer context only.
    pub fn peek(&self, data: &mut u8) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return false;
        }

        // SAFETY: as for read(); tail is not advanced.
        unsafe {
            *data = (*self.buf.get())[tail % N];
        }
        true
    }

    /// Bulk write.  Producer context only.  Returns the number of bytes
    /// actually stored; a short count sets the overflow flag.
    pub fn write_bytes(&self, src: &[u8]) -> usize {
        let mut written = 0;
        for &byte in src {
            if !self.write(byte) {
                break;
            }
            written += 1;
        }
        written
    }

    /// Bulk read.  Consumer context only.  Returns the number of bytes
    /// actually copied into `dest`.
    pub fn read_bytes(&self, dest: &mut [u8]) -> usize {
        let mut count = 0;
        for slot in dest.iter_mut() {
            if !self.read(slot) {
                break;
            }
            count += 1;
        }
        count
    }

    /// Number of bytes waiting to be read.
    pub fn available(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Number of bytes of free space.
    pub fn free(&self) -> usize {
        N - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.available() >= N
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Fill level as an integer percentage, 0-100.
    pub fn utilization(&self) -> u8 {
        (self.available() * 100 / N) as u8
    }

    /// Reset to empty and clear the overflow flag.  Consumer context only.
    ///
    /// This is the one operation that mutates more than one field from the
    /// consumer side, so it runs in a critical section to suppress the
    /// producer for its duration (on target the strobe interrupt source is
    /// masked; on the host it is a no-op lock).
    pub fn clear(&self) {
        critical_section::with(|_| {
            let head = self.head.load(Ordering::Relaxed);
            self.tail.store(head, Ordering::Release);
            self.overflow.store(false, Ordering::Release);
        });
    }

    /// Whether a write has been refused since the flag was last cleared.
    pub fn has_overflow(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Clear the sticky overflow flag.  Consumer context only.
    pub fn clear_overflow(&self) {
        self.overflow.store(false, Ordering::Release);
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let rb = RingBuffer::<16>::new();
        assert!(rb.is_empty());
        assert!(!rb.is_full());
        assert_eq!(rb.available(), 0);
        assert_eq!(rb.free(), 16);
        assert_eq!(rb.capacity(), 16);
        assert!(!rb.has_overflow());
        assert_eq!(rb.utilization(), 0);
    }

    #[test]
    fn single_byte_round_trip() {
        let rb = RingBuffer::<16>::new();
        assert!(rb.write(0x42));
        assert_eq!(rb.available(), 1);
        assert_eq!(rb.free(), 15);

        let mut data = 0;
        assert!(rb.read(&mut data));
        assert_eq!(data, 0x42);
        assert!(rb.is_empty());
        assert!(!rb.read(&mut data));
    }

    #[test]
    fn fifo_order_preserved() {
        let rb = RingBuffer::<16>::new();
        for i in 0..10u8 {
            assert!(rb.write(i));
        }
        let mut data = 0;
        for i in 0..10u8 {
            assert!(rb.read(&mut data));
            assert_eq!(data, i);
        }
        assert!(rb.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let rb = RingBuffer::<16>::new();
        assert!(rb.write(0xAB));
        let mut data = 0;
        assert!(rb.peek(&mut data));
        assert_eq!(data, 0xAB);
        assert_eq!(rb.available(), 1);
        assert!(rb.read(&mut data));
        assert_eq!(data, 0xAB);
        assert!(!rb.peek(&mut data));
    }

    #[test]
    fn fill_to_capacity_then_overflow() {
        let rb = RingBuffer::<16>::new();
        for i in 0..16u8 {
            assert!(rb.write(i));
        }
        assert!(rb.is_full());
        assert_eq!(rb.available(), 16);
        assert_eq!(rb.free(), 0);
        assert_eq!(rb.utilization(), 100);
        assert!(!rb.has_overflow());

        // One more write must be refused and latch the flag.
        assert!(!rb.write(0xFF));
        assert!(rb.has_overflow());
        assert_eq!(rb.available(), 16);

        rb.clear_overflow();
        assert!(!rb.has_overflow());
    }

    // Scenario from the capture acceptance tests: capacity 16, write 20
    // bytes, expect exactly 16 stored, overflow latched, and the first 16
    // values read back in order.
    #[test]
    fn capacity_overflow_scenario() {
        let rb = RingBuffer::<16>::new();
        let mut accepted = 0;
        for i in 0..20u8 {
            if rb.write(i) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 16);
        assert!(rb.has_overflow());

        let mut data = 0;
        for i in 0..16u8 {
            assert!(rb.read(&mut data));
            assert_eq!(data, i);
        }
        assert!(rb.is_empty());
        // Overflow is sticky until explicitly cleared.
        assert!(rb.has_overflow());
    }

    // Wraparound: write 0..15, read 8, write 8 more - FIFO order must hold
    // across the wrap boundary.
    #[test]
    fn wraparound_preserves_order() {
        let rb = RingBuffer::<16>::new();
        for i in 0..16u8 {
            assert!(rb.write(i));
        }
        let mut data = 0;
        for i in 0..8u8 {
            assert!(rb.read(&mut data));
            assert_eq!(data, i);
        }
        for i in 0..8u8 {
            assert!(rb.write(0x80 + i));
        }
        assert!(rb.is_full());

        for i in 8..16u8 {
            assert!(rb.read(&mut data));
            assert_eq!(data, i);
        }
        for i in 0..8u8 {
            assert!(rb.read(&mut data));
            assert_eq!(data, 0x80 + i);
        }
        assert!(rb.is_empty());
    }

    #[test]
    fn bulk_variants() {
        let rb = RingBuffer::<16>::new();
        let src: [u8; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert_eq!(rb.write_bytes(&src), 10);

        let mut dest = [0u8; 6];
        assert_eq!(rb.read_bytes(&mut dest), 6);
        assert_eq!(dest, [1, 2, 3, 4, 5, 6]);
        assert_eq!(rb.available(), 4);

        // Bulk write beyond free space reports the short count and latches
        // overflow.
        let big = [0xEEu8; 16];
        assert_eq!(rb.write_bytes(&big), 12);
        assert!(rb.has_overflow());
        assert!(rb.is_full());
    }

    #[test]
    fn clear_resets_state() {
        let rb = RingBuffer::<16>::new();
        for i in 0..16u8 {
            assert!(rb.write(i));
        }
        assert!(!rb.write(0xFF));
        assert!(rb.has_overflow());

        rb.clear();
        assert!(rb.is_empty());
        assert!(!rb.has_overflow());
        assert_eq!(rb.free(), 16);

        // Still usable after clear, including across the old wrap point.
        assert!(rb.write(0x5A));
        let mut data = 0;
        assert!(rb.read(&mut data));
        assert_eq!(data, 0x5A);
    }

    #[test]
    fn utilization_truncates() {
        let rb = RingBuffer::<16>::new();
        for i in 0..5u8 {
            assert!(rb.write(i));
        }
        // 5 * 100 / 16 = 31.25, integer truncation.
        assert_eq!(rb.utilization(), 31);
    }
}
