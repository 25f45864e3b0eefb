//! Splits the sound chip across execution contexts.
//!
//! [`ApuEngine`] stays on the main thread: it decodes register writes,
//! queues them, and owns the 240 Hz frame timer. [`ApuStream`] owns the
//! [`Apu`] itself and lives in the audio graph. Timer ticks are replayed on
//! the audio clock, one every `sample_rate / 240` rendered samples, and each
//! queued write carries the tick count it was made at so it lands between
//! the same two ticks on the audio side. The two halves share nothing but a
//! command ring and a handful of single-writer atomics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::apu::{Apu, Register};
use crate::config::{PlayerConfig, RuntimeFlags};
use crate::mixer::{AudioStream, BlockPool, StereoBlock};
use crate::ring_buffer::{Consumer, Producer, RingBuffer};
use crate::timer::PeriodicTimer;

/// 240 Hz.
pub const FRAME_PERIOD: Duration = Duration::from_micros(4167);
pub const FRAME_RATE_HZ: f32 = 240.0;
/// Longer than one frame period and one audio block, so nothing is still
/// inside a callback once it has elapsed.
pub const QUIESCENCE_DELAY: Duration = Duration::from_millis(5);
/// Above this backlog ticks are replayed at twice the normal rate.
const CATCH_UP_BACKLOG: u32 = 24;
/// One second of ticks. Older ticks are dropped after a long stall.
const MAX_FRAME_TICK_BACKLOG: u32 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Write { register: Register, value: u8 },
    Reset,
}

/// A command plus the number of frame ticks issued before it was queued.
#[derive(Debug, Clone, Copy)]
struct QueuedCommand {
    tick: u32,
    command: Command,
}

#[derive(Default)]
struct EngineShared {
    stopping: AtomicBool,
    // Written by the frame timer only.
    frame_ticks: AtomicU32,
    // Written by the audio side only.
    register_writes: AtomicU64,
    non_silent_samples: AtomicU64,
    blocks_rendered: AtomicU64,
    blocks_skipped: AtomicU64,
    frame_ticks_applied: AtomicU64,
    frame_ticks_dropped: AtomicU64,
    frame_ticks_pending: AtomicU32,
}

/// Snapshot of the engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineDiagnostics {
    pub register_writes: u64,
    pub non_silent_samples: u64,
    pub blocks_rendered: u64,
    pub blocks_skipped: u64,
    pub frame_ticks_issued: u32,
    pub frame_ticks_applied: u64,
    pub frame_ticks_dropped: u64,
    pub frame_ticks_pending: u32,
    pub commands_dropped: u64,
    pub command_queue_fill: f32,
}

/// Replays timer ticks on the audio clock.
///
/// Ticks the timer has issued wait in a backlog and are released one per
/// `sample_rate / 240` rendered samples, so a large callback spreads them
/// through its blocks instead of firing them all at its start. A backlog
/// over [`CATCH_UP_BACKLOG`] drains at double rate; one over
/// [`MAX_FRAME_TICK_BACKLOG`] loses its oldest ticks.
#[derive(Debug, Clone)]
struct FramePacer {
    samples_per_tick: f32,
    // Samples rendered since the last released tick. Held one short of a
    // full interval while idle so the next tick fires on the next sample.
    phase: f32,
    seen: u32,
    pending: u32,
    // Ticks released or dropped. Command stamps compare against this.
    consumed: u32,
    applied: u64,
    dropped: u64,
}

impl FramePacer {
    fn new(sample_rate: u32) -> Self {
        let samples_per_tick = sample_rate.max(1) as f32 / FRAME_RATE_HZ;
        Self {
            samples_per_tick,
            phase: samples_per_tick - 1.0,
            seen: 0,
            pending: 0,
            consumed: 0,
            applied: 0,
            dropped: 0,
        }
    }

    fn retune(&mut self, sample_rate: u32) {
        self.samples_per_tick = sample_rate.max(1) as f32 / FRAME_RATE_HZ;
    }

    /// Takes in everything the timer has issued up to `issued`.
    fn observe(&mut self, issued: u32) {
        let fresh = issued.wrapping_sub(self.seen);
        self.seen = issued;
        self.pending = self.pending.saturating_add(fresh);
        if self.pending > MAX_FRAME_TICK_BACKLOG {
            let excess = self.pending - MAX_FRAME_TICK_BACKLOG;
            self.pending = MAX_FRAME_TICK_BACKLOG;
            self.consumed = self.consumed.wrapping_add(excess);
            self.dropped += excess as u64;
        }
    }

    /// Moves forward one sample. Returns whether a tick is due before it.
    fn advance(&mut self) -> bool {
        self.phase += 1.0;
        if self.pending == 0 {
            // Idle time must not bank ticks that would later fire in a burst.
            self.phase = self.phase.min(self.samples_per_tick - 1.0);
            return false;
        }
        let interval = if self.pending > CATCH_UP_BACKLOG {
            self.samples_per_tick * 0.5
        } else {
            self.samples_per_tick
        };
        if self.phase < interval {
            return false;
        }
        self.phase = (self.phase - interval).min(1.0);
        self.pending -= 1;
        self.consumed = self.consumed.wrapping_add(1);
        self.applied += 1;
        true
    }

    /// Whether every tick issued before `stamp` has been released.
    fn has_reached(&self, stamp: u32) -> bool {
        (stamp.wrapping_sub(self.consumed) as i32) <= 0
    }
}

/// Main-thread handle to a running chip.
pub struct ApuEngine {
    commands: Producer<QueuedCommand>,
    shared: Arc<EngineShared>,
    timer: PeriodicTimer,
    commands_dropped: u64,
}

/// Audio-side half. Connect it to the audio graph.
pub struct ApuStream {
    apu: Apu,
    commands: Consumer<QueuedCommand>,
    shared: Arc<EngineShared>,
    flags: Arc<RuntimeFlags>,
    pacer: FramePacer,
}

impl ApuEngine {
    /// Builds both halves. The frame timer is not started.
    pub fn new(config: &PlayerConfig, flags: Arc<RuntimeFlags>) -> (Self, ApuStream) {
        let (commands, queue) = RingBuffer::with_capacity(config.command_queue_capacity);
        let shared = Arc::new(EngineShared::default());
        let engine = Self {
            commands,
            shared: Arc::clone(&shared),
            timer: PeriodicTimer::new(),
            commands_dropped: 0,
        };
        let apu = Apu::new(config.sample_rate);
        let pacer = FramePacer::new(apu.sample_rate());
        let stream = ApuStream {
            apu,
            commands: queue,
            shared,
            flags,
            pacer,
        };
        (engine, stream)
    }

    /// Queues a write to the register at `address`. Unknown addresses and
    /// writes that find the queue full are dropped; returns whether the
    /// write was queued.
    pub fn write_register(&mut self, address: u8, value: u8) -> bool {
        let Some(register) = Register::decode(address) else {
            #[cfg(debug_assertions)]
            debug!("ignoring write to unknown register {address:#04x}");
            return false;
        };
        self.push(Command::Write { register, value })
    }

    /// Queues a reset to power-up state. Leaves the frame timer alone.
    pub fn reset(&mut self) -> bool {
        self.push(Command::Reset)
    }

    fn push(&mut self, command: Command) -> bool {
        let tick = self.shared.frame_ticks.load(Ordering::Acquire);
        if self.commands.write(QueuedCommand { tick, command }) {
            return true;
        }
        self.commands_dropped += 1;
        if self.commands_dropped.is_power_of_two() {
            let what = match command {
                Command::Write { register, .. } => register.name(),
                Command::Reset => "reset",
            };
            warn!(
                "register command queue full, dropped {what} ({} dropped so far)",
                self.commands_dropped
            );
        }
        false
    }

    /// Starts frame sequencing and lets the stream render again after a
    /// previous stop.
    pub fn start_frame_timer(&mut self) -> Result<()> {
        if self.timer.is_running() {
            self.stop_frame_timer();
        }
        self.shared.stopping.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        self.timer
            .begin(FRAME_PERIOD, move || {
                if !shared.stopping.load(Ordering::Acquire) {
                    shared.frame_ticks.fetch_add(1, Ordering::Release);
                }
            })
            .context("failed to start frame sequencer timer")?;
        info!("frame sequencer running");
        Ok(())
    }

    /// Stops playback: raise the stopping flag, disarm the timer, wait out
    /// any in-flight callback, then stop the timer thread. The stream stays
    /// silent until the timer is started again.
    pub fn stop_frame_timer(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.timer.disarm();
        thread::sleep(QUIESCENCE_DELAY);
        self.timer.end();
        info!("frame sequencer stopped");
    }

    /// Stops the timer and releases the main-side handle. The stream must be
    /// disconnected from the audio graph and dropped on this thread to free
    /// the chip itself.
    pub fn shutdown(mut self) {
        self.stop_frame_timer();
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    pub fn is_timer_running(&self) -> bool {
        self.timer.is_running()
    }

    pub fn diagnostics(&self) -> EngineDiagnostics {
        EngineDiagnostics {
            register_writes: self.shared.register_writes.load(Ordering::Relaxed),
            non_silent_samples: self.shared.non_silent_samples.load(Ordering::Relaxed),
            blocks_rendered: self.shared.blocks_rendered.load(Ordering::Relaxed),
            blocks_skipped: self.shared.blocks_skipped.load(Ordering::Relaxed),
            frame_ticks_issued: self.shared.frame_ticks.load(Ordering::Relaxed),
            frame_ticks_applied: self.shared.frame_ticks_applied.load(Ordering::Relaxed),
            frame_ticks_dropped: self.shared.frame_ticks_dropped.load(Ordering::Relaxed),
            frame_ticks_pending: self.shared.frame_ticks_pending.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped,
            command_queue_fill: self.commands.fill_percent(),
        }
    }
}

impl Drop for ApuEngine {
    fn drop(&mut self) {
        if self.timer.is_running() {
            self.stop_frame_timer();
        }
    }
}

impl ApuStream {
    /// Direct access for out-of-band setup such as loading DPCM samples.
    /// Only reachable while the stream is not connected.
    pub fn apu_mut(&mut self) -> &mut Apu {
        &mut self.apu
    }

    pub fn apu(&self) -> &Apu {
        &self.apu
    }

    pub fn load_dpcm(&mut self, data: &[u8]) -> usize {
        self.load_dpcm_at(data, 0)
    }

    pub fn load_dpcm_at(&mut self, data: &[u8], offset: usize) -> usize {
        let stored = self.apu.load_dpcm_at(data, offset);
        if stored < data.len() {
            warn!(
                "DPCM load at offset {offset}: kept {stored} of {} bytes",
                data.len()
            );
        } else {
            debug!("DPCM load at offset {offset}: {stored} bytes");
        }
        stored
    }

    fn publish(&self) {
        self.shared
            .register_writes
            .store(self.apu.register_writes(), Ordering::Relaxed);
        self.shared
            .non_silent_samples
            .store(self.apu.non_silent_samples(), Ordering::Relaxed);
        self.shared
            .frame_ticks_applied
            .store(self.pacer.applied, Ordering::Relaxed);
        self.shared
            .frame_ticks_dropped
            .store(self.pacer.dropped, Ordering::Relaxed);
        self.shared
            .frame_ticks_pending
            .store(self.pacer.pending, Ordering::Relaxed);
        self.shared.blocks_rendered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Applies queued commands whose frame tick has been replayed. A write made
/// after tick N waits for tick N and runs before tick N + 1.
fn apply_due_commands(apu: &mut Apu, commands: &mut Consumer<QueuedCommand>, pacer: &FramePacer) {
    while let Some(&queued) = commands.peek() {
        if !pacer.has_reached(queued.tick) {
            break;
        }
        commands.pop();
        match queued.command {
            Command::Write { register, value } => apu.write(register, value),
            Command::Reset => apu.reset(),
        }
    }
}

impl AudioStream for ApuStream {
    fn update(&mut self, pool: &mut BlockPool) -> Option<StereoBlock> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return None;
        }

        let Some(mut block) = pool.allocate_stereo() else {
            self.shared.blocks_skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        self.pacer.retune(self.apu.sample_rate());
        self.pacer
            .observe(self.shared.frame_ticks.load(Ordering::Acquire));

        let stereo = self.flags.stereo();
        let filters = self.flags.filters();
        let Self {
            apu,
            commands,
            pacer,
            ..
        } = self;
        apu.render_block_with(
            &mut block.left[..],
            &mut block.right[..],
            stereo,
            filters,
            |apu| {
                apply_due_commands(apu, commands, pacer);
                if pacer.advance() {
                    apu.frame_tick();
                    apply_due_commands(apu, commands, pacer);
                }
            },
        );
        self.publish();
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AUDIO_BLOCK_SAMPLES;
    use crate::mixer::{AudioBlock, audio_graph};

    fn engine_pair() -> (ApuEngine, ApuStream) {
        let config = PlayerConfig {
            command_queue_capacity: 16,
            ..PlayerConfig::default()
        };
        let flags = Arc::new(RuntimeFlags::new(false, false));
        ApuEngine::new(&config, flags)
    }

    fn play_pulse(engine: &mut ApuEngine) {
        assert!(engine.write_register(0x15, 0x01));
        assert!(engine.write_register(0x00, 0xBF));
        assert!(engine.write_register(0x02, 0xFD));
        assert!(engine.write_register(0x03, 0x00));
    }

    fn render(stream: &mut ApuStream, pool: &mut BlockPool, blocks: usize) {
        for _ in 0..blocks {
            let block = stream.update(pool).expect("block rendered");
            pool.release_stereo(block);
        }
    }

    #[test]
    fn queued_writes_apply_on_next_block() {
        let (mut engine, mut stream) = engine_pair();
        let mut pool = BlockPool::new(4);
        play_pulse(&mut engine);
        assert_eq!(stream.apu().register_writes(), 0);

        let block = stream.update(&mut pool).expect("block rendered");
        assert_eq!(stream.apu().register(0x00), Some(0xBF));
        assert!(block.left.iter().any(|&s| s != 0));
        assert_eq!(block.left[..], block.right[..]);
        pool.release_stereo(block);

        let diag = engine.diagnostics();
        assert_eq!(diag.register_writes, 4);
        assert_eq!(diag.blocks_rendered, 1);
        assert!(diag.non_silent_samples > 0);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn unknown_register_is_not_queued() {
        let (mut engine, _stream) = engine_pair();
        assert!(!engine.write_register(0x40, 0x00));
        assert_eq!(engine.diagnostics().command_queue_fill, 0.0);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (mut engine, _stream) = engine_pair();
        for _ in 0..15 {
            assert!(engine.write_register(0x11, 0x10));
        }
        assert!(!engine.write_register(0x11, 0x10));
        assert_eq!(engine.diagnostics().commands_dropped, 1);
    }

    #[test]
    fn stopping_flag_skips_rendering() {
        let (engine, mut stream) = engine_pair();
        let mut pool = BlockPool::new(4);
        engine.shared.stopping.store(true, Ordering::Release);
        assert!(stream.update(&mut pool).is_none());
        assert_eq!(pool.available(), 4);
        assert_eq!(engine.diagnostics().blocks_rendered, 0);
    }

    #[test]
    fn exhausted_pool_skips_block_without_advancing() {
        let (mut engine, mut stream) = engine_pair();
        let mut pool = BlockPool::new(1);
        play_pulse(&mut engine);
        assert!(stream.update(&mut pool).is_none());
        assert_eq!(stream.apu().register_writes(), 0);
        assert_eq!(engine.diagnostics().blocks_skipped, 1);
    }

    #[test]
    fn frame_ticks_are_spaced_on_the_audio_clock() {
        let (mut engine, mut stream) = engine_pair();
        let mut pool = BlockPool::new(2);
        engine.write_register(0x15, 0x01);
        engine.write_register(0x03, 0x08);
        render(&mut stream, &mut pool, 1);
        assert_eq!(stream.apu().pulse1().length_counter(), 254);

        // Two ticks: step 0 does nothing, step 1 clocks lengths. At 44.1 kHz
        // they sit about 184 samples apart, so the second lands a block later.
        engine.shared.frame_ticks.fetch_add(2, Ordering::Release);
        render(&mut stream, &mut pool, 1);
        assert_eq!(engine.diagnostics().frame_ticks_applied, 1);
        assert_eq!(engine.diagnostics().frame_ticks_pending, 1);
        assert_eq!(stream.apu().pulse1().length_counter(), 254);

        render(&mut stream, &mut pool, 1);
        assert_eq!(engine.diagnostics().frame_ticks_applied, 2);
        assert_eq!(stream.apu().pulse1().length_counter(), 253);
    }

    #[test]
    fn large_callbacks_apply_every_tick_without_bunching() {
        let (_engine, stream) = engine_pair();
        let shared = Arc::clone(&stream.shared);
        let (mut manager, mut mixer) = audio_graph(16);
        manager.connect(Box::new(stream)).expect("connect");

        let mut left: AudioBlock = [0; AUDIO_BLOCK_SAMPLES];
        let mut right: AudioBlock = [0; AUDIO_BLOCK_SAMPLES];
        // A 2048-frame callback every ~46 ms, with the timer issuing the
        // matching eleven ticks between callbacks.
        for _ in 0..22 {
            shared.frame_ticks.fetch_add(11, Ordering::Release);
            for _ in 0..16 {
                let before = shared.frame_ticks_applied.load(Ordering::Relaxed);
                mixer.next_block(&mut left, &mut right);
                let after = shared.frame_ticks_applied.load(Ordering::Relaxed);
                assert!(after - before <= 1, "ticks bunched into one block");
            }
        }

        assert_eq!(shared.frame_ticks.load(Ordering::Relaxed), 242);
        assert_eq!(shared.frame_ticks_applied.load(Ordering::Relaxed), 242);
        assert_eq!(shared.frame_ticks_dropped.load(Ordering::Relaxed), 0);
        assert_eq!(shared.frame_ticks_pending.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn frame_tick_backlog_is_kept_and_drained() {
        let (engine, mut stream) = engine_pair();
        let mut pool = BlockPool::new(2);
        engine.shared.frame_ticks.fetch_add(100, Ordering::Release);
        render(&mut stream, &mut pool, 1);
        // Catching up runs at twice the frame rate, still spread out.
        assert_eq!(engine.diagnostics().frame_ticks_applied, 2);
        assert_eq!(engine.diagnostics().frame_ticks_pending, 98);

        render(&mut stream, &mut pool, 120);
        let diag = engine.diagnostics();
        assert_eq!(diag.frame_ticks_applied, 100);
        assert_eq!(diag.frame_ticks_pending, 0);
        assert_eq!(diag.frame_ticks_dropped, 0);
    }

    #[test]
    fn stalled_backlog_drops_oldest_ticks() {
        let (engine, mut stream) = engine_pair();
        let mut pool = BlockPool::new(2);
        engine.shared.frame_ticks.fetch_add(1000, Ordering::Release);
        render(&mut stream, &mut pool, 1);
        let diag = engine.diagnostics();
        assert_eq!(diag.frame_ticks_dropped, 760);
        assert_eq!(diag.frame_ticks_applied + diag.frame_ticks_pending as u64, 240);

        render(&mut stream, &mut pool, 250);
        assert_eq!(engine.diagnostics().frame_ticks_applied, 240);
    }

    #[test]
    fn writes_stay_behind_the_ticks_issued_before_them() {
        let (mut engine, mut stream) = engine_pair();
        let mut pool = BlockPool::new(2);
        engine.write_register(0x15, 0x01);
        engine.write_register(0x03, 0x08);
        render(&mut stream, &mut pool, 1);
        assert_eq!(stream.apu().pulse1().length_counter(), 254);

        // Two ticks, then a length reload to 2. The half-frame clock on the
        // second tick must hit the old length, not the reloaded one.
        engine.shared.frame_ticks.fetch_add(2, Ordering::Release);
        engine.write_register(0x03, 0x18);
        render(&mut stream, &mut pool, 1);
        assert_eq!(stream.apu().register(0x03), Some(0x08));
        assert_eq!(stream.apu().pulse1().length_counter(), 254);

        render(&mut stream, &mut pool, 1);
        assert_eq!(stream.apu().register(0x03), Some(0x18));
        assert_eq!(stream.apu().pulse1().length_counter(), 2);
    }

    #[test]
    fn pacer_releases_one_tick_per_frame_interval() {
        let mut pacer = FramePacer::new(48_000);
        pacer.observe(3);
        let due: Vec<usize> = (0..600).filter(|_| pacer.advance()).collect();
        assert_eq!(due, vec![0, 200, 400]);
        assert!(pacer.has_reached(3));
        assert!(!pacer.has_reached(4));
    }

    #[test]
    fn reset_command_restores_power_up_state() {
        let (mut engine, mut stream) = engine_pair();
        let mut pool = BlockPool::new(2);
        play_pulse(&mut engine);
        engine.reset();
        let block = stream.update(&mut pool).expect("block");
        assert_eq!(stream.apu().pulse1().length_counter(), 0);
        assert_eq!(stream.apu().register(0x00), Some(0));
        // The DMC rests at mid level, so a reset chip holds a constant offset.
        assert_eq!(stream.apu().dmc().output(), 0x40);
        assert!(block.left.iter().all(|&s| s == block.left[0]));
        pool.release_stereo(block);
    }

    #[test]
    fn timer_drives_frame_ticks_until_stopped() {
        let (mut engine, _stream) = engine_pair();
        engine.start_frame_timer().expect("timer starts");
        thread::sleep(Duration::from_millis(30));
        engine.stop_frame_timer();
        assert!(engine.is_stopping());
        assert!(!engine.is_timer_running());

        let issued = engine.diagnostics().frame_ticks_issued;
        assert!(issued > 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(engine.diagnostics().frame_ticks_issued, issued);
    }

    #[test]
    fn dpcm_load_before_connect_is_clamped() {
        let (_engine, mut stream) = engine_pair();
        let data = vec![0xAA; 64];
        assert_eq!(stream.load_dpcm(&data), 64);
        assert_eq!(stream.load_dpcm_at(&data, crate::apu::DPCM_CAPACITY - 10), 10);
        assert_eq!(stream.load_dpcm_at(&data, crate::apu::DPCM_CAPACITY), 0);
    }

    #[test]
    fn block_length_matches_audio_block() {
        let (_engine, mut stream) = engine_pair();
        let mut pool = BlockPool::new(2);
        let block = stream.update(&mut pool).expect("block");
        assert_eq!(block.left.len(), AUDIO_BLOCK_SAMPLES);
        pool.release_stereo(block);
    }
}
