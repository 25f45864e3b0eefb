//! Streamed 8-bit DAC relay.
//!
//! A player on the main thread writes unsigned 8-bit samples as its command
//! stream dictates; the audio side plays them back at the output rate,
//! holding the last sample across an underrun instead of dropping to zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use log::{debug, info};

use crate::mixer::{AudioStream, BlockPool, StereoBlock};
use crate::ring_buffer::{Consumer, Producer, RingBuffer};

pub const DEFAULT_DAC_CAPACITY: usize = 8192;
pub const DEFAULT_DAC_PREFILL: usize = 512;

/// Both outputs on.
pub const OUTPUT_CENTER: u8 = 0xC0;
pub const OUTPUT_LEFT: u8 = 0x80;
pub const OUTPUT_RIGHT: u8 = 0x40;

/// Zeros queued when the DAC is switched off, so playback ramps into
/// silence rather than holding the last level.
const DISABLE_SILENCE_SAMPLES: usize = 64;

/// Unsigned 8-bit DAC value to signed 16-bit PCM, centered on `0x80`.
pub fn convert_sample(sample: u8) -> i16 {
    (sample as i16 - 128) * 256
}

struct DacShared {
    enabled: AtomicBool,
    dac_enabled: AtomicBool,
    output_control: AtomicU8,
    reset_epoch: AtomicU32,
}

/// Buffer state as seen from the writer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DacDiagnostics {
    pub level: usize,
    pub fill_percent: f32,
    pub underruns: u32,
    pub overruns: u32,
}

pub struct DacRelay;

impl DacRelay {
    /// Builds the writer and stream halves. The relay starts disabled with
    /// `prefill` samples of silence already queued.
    pub fn new(capacity: usize, prefill: usize) -> (DacWriter, DacStream) {
        let (producer, consumer) = RingBuffer::with_capacity(capacity);
        let shared = Arc::new(DacShared {
            enabled: AtomicBool::new(false),
            dac_enabled: AtomicBool::new(true),
            output_control: AtomicU8::new(OUTPUT_CENTER),
            reset_epoch: AtomicU32::new(0),
        });
        let mut writer = DacWriter {
            samples: producer,
            shared: Arc::clone(&shared),
        };
        writer.prefill_silence(prefill);
        let stream = DacStream {
            samples: consumer,
            shared,
            held: 0,
            reset_seen: 0,
        };
        (writer, stream)
    }
}

/// Main-thread side: register writes from the player land here.
pub struct DacWriter {
    samples: Producer<i16>,
    shared: Arc<DacShared>,
}

impl DacWriter {
    /// Queues one 8-bit sample. Dropped while the relay is disabled or the
    /// buffer is full; the latter counts an overrun.
    pub fn write_sample(&mut self, sample: u8) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.samples.write(convert_sample(sample))
    }

    /// Master switch. While off, writes are dropped and the output is silent.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
        debug!("DAC relay {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// The chip's own DAC enable bit. Turning it off queues a short run of
    /// silence behind whatever is already buffered.
    pub fn set_dac_enabled(&mut self, enabled: bool) {
        self.shared.dac_enabled.store(enabled, Ordering::Release);
        if !enabled {
            let zeros = [0i16; DISABLE_SILENCE_SAMPLES];
            self.samples.write_slice(&zeros);
        }
    }

    pub fn is_dac_enabled(&self) -> bool {
        self.shared.dac_enabled.load(Ordering::Acquire)
    }

    /// Bit 7 routes to the left output, bit 6 to the right.
    pub fn set_output_control(&self, value: u8) {
        self.shared.output_control.store(value, Ordering::Release);
    }

    pub fn output_control(&self) -> u8 {
        self.shared.output_control.load(Ordering::Acquire)
    }

    /// Queues up to `samples` zeros, clamped to the usable capacity.
    pub fn prefill_silence(&mut self, samples: usize) -> usize {
        let samples = samples.min(self.samples.capacity() - 1);
        let mut written = 0;
        let zeros = [0i16; 256];
        while written < samples {
            let chunk = (samples - written).min(zeros.len());
            let count = self.samples.write_slice(&zeros[..chunk]);
            written += count;
            if count < chunk {
                break;
            }
        }
        debug!("DAC relay prefilled {written} silence samples");
        written
    }

    /// Empties the buffer and restores power-up DAC state. The audio side
    /// drops queued samples and the held level on its next block, so samples
    /// written before that block are discarded too.
    pub fn reset(&mut self) {
        self.shared.reset_epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.dac_enabled.store(true, Ordering::Release);
        self.shared.output_control.store(OUTPUT_CENTER, Ordering::Release);
        self.samples.reset_counters();
        info!("DAC relay reset");
    }

    pub fn reset_counters(&self) {
        self.samples.reset_counters();
    }

    pub fn diagnostics(&self) -> DacDiagnostics {
        DacDiagnostics {
            level: self.samples.available(),
            fill_percent: self.samples.fill_percent(),
            underruns: self.samples.underruns(),
            overruns: self.samples.overruns(),
        }
    }
}

/// Audio-side half, connected to the audio graph.
pub struct DacStream {
    samples: Consumer<i16>,
    shared: Arc<DacShared>,
    held: i16,
    reset_seen: u32,
}

impl DacStream {
    /// Fills `left` and `right` with the next samples. Consumes nothing while
    /// the relay is disabled.
    pub fn fill(&mut self, left: &mut [i16], right: &mut [i16]) {
        let epoch = self.shared.reset_epoch.load(Ordering::Acquire);
        if epoch != self.reset_seen {
            self.reset_seen = epoch;
            self.samples.clear();
            self.held = 0;
        }

        if !self.shared.enabled.load(Ordering::Acquire) {
            left.fill(0);
            right.fill(0);
            return;
        }

        let dac_enabled = self.shared.dac_enabled.load(Ordering::Acquire);
        let control = self.shared.output_control.load(Ordering::Acquire);
        let to_left = dac_enabled && control & OUTPUT_LEFT != 0;
        let to_right = dac_enabled && control & OUTPUT_RIGHT != 0;

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            // An empty buffer counts an underrun and repeats the held level.
            if let Some(sample) = self.samples.pop() {
                self.held = sample;
            }
            *l = if to_left { self.held } else { 0 };
            *r = if to_right { self.held } else { 0 };
        }
    }

    pub fn held_sample(&self) -> i16 {
        self.held
    }
}

impl AudioStream for DacStream {
    fn update(&mut self, pool: &mut BlockPool) -> Option<StereoBlock> {
        let mut block = pool.allocate_stereo()?;
        self.fill(&mut block.left[..], &mut block.right[..]);
        Some(block)
    }
}
