//! Single-producer/single-consumer rings for the audio path.
//!
//! The lock-free queue itself is `rtrb`; these wrappers add the pieces the
//! audio side reports on: overrun and underrun counters, a fill level, and
//! the convention that a ring of `capacity` slots holds `capacity - 1`
//! values.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
struct Counters {
    underruns: AtomicU32,
    overruns: AtomicU32,
}

impl Counters {
    fn reset(&self) {
        self.underruns.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
    }
}

pub struct RingBuffer;

impl RingBuffer {
    /// Creates a ring with `capacity` slots, `capacity - 1` of them usable.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two or is smaller than 2.
    pub fn with_capacity<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "ring buffer capacity must be a power of two, got {capacity}"
        );
        let (inner_tx, inner_rx) = rtrb::RingBuffer::new(capacity - 1);
        let counters = Arc::new(Counters::default());
        (
            Producer {
                inner: inner_tx,
                counters: Arc::clone(&counters),
                capacity,
            },
            Consumer {
                inner: inner_rx,
                counters,
                capacity,
            },
        )
    }
}

fn fill_percent(available: usize, capacity: usize) -> f32 {
    available as f32 * 100.0 / (capacity - 1) as f32
}

pub struct Producer<T> {
    inner: rtrb::Producer<T>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl<T> Producer<T> {
    /// Pushes one element. A full ring rejects it, counts an overrun and
    /// hands the value back.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        match self.inner.push(value) {
            Ok(()) => Ok(()),
            Err(rtrb::PushError::Full(value)) => {
                self.counters.overruns.fetch_add(1, Ordering::Relaxed);
                Err(value)
            }
        }
    }

    /// Like [`Producer::push`], dropping the value when the ring is full.
    pub fn write(&mut self, value: T) -> bool {
        self.push(value).is_ok()
    }

    pub fn space(&self) -> usize {
        self.inner.slots()
    }

    pub fn available(&self) -> usize {
        self.capacity - 1 - self.inner.slots()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fill_percent(&self) -> f32 {
        fill_percent(self.available(), self.capacity)
    }

    pub fn overruns(&self) -> u32 {
        self.counters.overruns.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u32 {
        self.counters.underruns.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }
}

impl<T: Copy> Producer<T> {
    /// Writes as many leading elements of `values` as fit and returns how
    /// many were written. A partial write is not an overrun.
    pub fn write_slice(&mut self, values: &[T]) -> usize {
        let count = values.len().min(self.inner.slots());
        match self.inner.write_chunk_uninit(count) {
            Ok(chunk) => chunk.fill_from_iter(values[..count].iter().copied()),
            Err(_) => 0,
        }
    }
}

pub struct Consumer<T> {
    inner: rtrb::Consumer<T>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl<T> Consumer<T> {
    /// Pops the oldest element. An empty ring counts an underrun.
    pub fn pop(&mut self) -> Option<T> {
        match self.inner.pop() {
            Ok(value) => Some(value),
            Err(_) => {
                self.counters.underruns.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn peek(&self) -> Option<&T> {
        self.inner.peek().ok()
    }

    /// Drops everything currently queued.
    pub fn clear(&mut self) {
        let queued = self.inner.slots();
        if let Ok(chunk) = self.inner.read_chunk(queued) {
            chunk.commit_all();
        }
    }

    pub fn space(&self) -> usize {
        self.capacity - 1 - self.inner.slots()
    }

    pub fn available(&self) -> usize {
        self.inner.slots()
    }

    pub fn is_full(&self) -> bool {
        self.space() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fill_percent(&self) -> f32 {
        fill_percent(self.available(), self.capacity)
    }

    pub fn overruns(&self) -> u32 {
        self.counters.overruns.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u32 {
        self.counters.underruns.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }
}

impl<T: Copy> Consumer<T> {
    /// Reads up to `out.len()` elements and returns how many were read. A
    /// short read is not an underrun.
    pub fn read_slice(&mut self, out: &mut [T]) -> usize {
        let count = out.len().min(self.inner.slots());
        let Ok(chunk) = self.inner.read_chunk(count) else {
            return 0;
        };
        let (first, second) = chunk.as_slices();
        out[..first.len()].copy_from_slice(first);
        out[first.len()..count].copy_from_slice(second);
        chunk.commit_all();
        count
    }
}
