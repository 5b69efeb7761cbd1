//! Single-reader/single-writer ring buffer for meter telemetry
//!
//! The audio thread is the only writer, one metering consumer is the only
//! reader. Unlike a classic SPSC queue the writer never waits for the reader:
//! when the buffer is full the oldest unread values are overwritten, so the
//! reader always sees the most recent data (last value wins).
//!
//! Slots are float atomics, so a reader racing a lapping writer can lose or
//! skip values but never observes undefined memory.

use std::sync::Arc;
use std::sync::atomic::fence;

use portable_atomic::{AtomicF32, AtomicF64, AtomicUsize, Ordering};

use crate::{AudioError, AudioResult};

/// Scalar types that can be stored in a [`RingBuffer`] slot
pub trait RingSample: Copy + Default + Send + Sync + 'static {
    type Slot: Send + Sync;

    fn new_slot() -> Self::Slot;
    fn load(slot: &Self::Slot) -> Self;
    fn store(slot: &Self::Slot, value: Self);
}

impl RingSample for f32 {
    type Slot = AtomicF32;

    #[inline]
    fn new_slot() -> AtomicF32 {
        AtomicF32::new(0.0)
    }

    #[inline]
    fn load(slot: &AtomicF32) -> f32 {
        slot.load(Ordering::Relaxed)
    }

    #[inline]
    fn store(slot: &AtomicF32, value: f32) {
        slot.store(value, Ordering::Relaxed);
    }
}

impl RingSample for f64 {
    type Slot = AtomicF64;

    #[inline]
    fn new_slot() -> AtomicF64 {
        AtomicF64::new(0.0)
    }

    #[inline]
    fn load(slot: &AtomicF64) -> f64 {
        slot.load(Ordering::Relaxed)
    }

    #[inline]
    fn store(slot: &AtomicF64, value: f64) {
        slot.store(value, Ordering::Relaxed);
    }
}

struct Shared<T: RingSample> {
    slots: Box<[T::Slot]>,
    /// Total number of values ever published (monotonic, wraps at usize::MAX)
    write_index: AtomicUsize,
}

impl<T: RingSample> Shared<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, index: usize) -> &T::Slot {
        &self.slots[index % self.slots.len()]
    }
}

/// Constructor namespace for the writer/reader pair
pub struct RingBuffer<T>(std::marker::PhantomData<T>);

impl<T: RingSample> RingBuffer<T> {
    /// Allocate a ring with `capacity` slots and split it into its two ends
    pub fn with_capacity(capacity: usize) -> AudioResult<(RingWriter<T>, RingReader<T>)> {
        if capacity == 0 {
            return Err(AudioError::InvalidCapacity(capacity));
        }

        let slots: Box<[T::Slot]> = (0..capacity).map(|_| T::new_slot()).collect();
        let shared = Arc::new(Shared {
            slots,
            write_index: AtomicUsize::new(0),
        });

        Ok((
            RingWriter {
                shared: Arc::clone(&shared),
                position: 0,
            },
            RingReader {
                shared,
                position: 0,
            },
        ))
    }
}

/// Writing end (audio thread). Never blocks, never allocates.
pub struct RingWriter<T: RingSample> {
    shared: Arc<Shared<T>>,
    position: usize,
}

impl<T: RingSample> RingWriter<T> {
    /// Write one value and publish it
    #[inline]
    pub fn push(&mut self, value: T) {
        T::store(self.shared.slot(self.position), value);
        self.position = self.position.wrapping_add(1);
        self.shared
            .write_index
            .store(self.position, Ordering::Release);
    }

    /// Write a group of values and publish them together
    ///
    /// The reader never sees a partially written group, so fixed-size frames
    /// pushed this way stay aligned as long as the capacity is a multiple of
    /// the frame size.
    #[inline]
    pub fn push_slice(&mut self, values: &[T]) {
        for (i, &value) in values.iter().enumerate() {
            T::store(self.shared.slot(self.position.wrapping_add(i)), value);
        }
        self.position = self.position.wrapping_add(values.len());
        self.shared
            .write_index
            .store(self.position, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

/// Reading end (metering or control thread)
pub struct RingReader<T: RingSample> {
    shared: Arc<Shared<T>>,
    position: usize,
}

impl<T: RingSample> RingReader<T> {
    /// Number of unread values, capped at capacity
    pub fn available(&self) -> usize {
        let written = self.shared.write_index.load(Ordering::Acquire);
        written
            .wrapping_sub(self.position)
            .min(self.shared.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Read one value, if any
    pub fn pop(&mut self) -> Option<T> {
        let mut value = [T::default()];
        (self.pop_into(&mut value) == 1).then_some(value[0])
    }

    /// Drain up to `out.len()` values in write order, oldest first
    ///
    /// Returns the number of values written to the front of `out`. Values the
    /// writer overwrote before or during the copy are dropped.
    pub fn pop_into(&mut self, out: &mut [T]) -> usize {
        let capacity = self.shared.capacity();
        let written = self.shared.write_index.load(Ordering::Acquire);

        let mut start = self.position;
        if written.wrapping_sub(start) > capacity {
            start = written.wrapping_sub(capacity);
        }

        let count = written.wrapping_sub(start).min(out.len());
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = T::load(self.shared.slot(start.wrapping_add(i)));
        }

        // Anything the writer lapped while we were copying is stale
        fence(Ordering::Acquire);
        let written_after = self.shared.write_index.load(Ordering::Relaxed);
        let lapped = written_after
            .wrapping_sub(start)
            .saturating_sub(capacity)
            .min(count);
        if lapped > 0 {
            out.copy_within(lapped..count, 0);
        }

        self.position = start.wrapping_add(count);
        count - lapped
    }
}
