//! Audio graph glue: a fixed pool of sample blocks, the stream trait that
//! sources implement, the audio-side mixer and the main-side connection
//! manager that changes it.
//!
//! Sources are boxed on the main thread, moved to the audio side through a
//! command ring and moved back through a return ring when disconnected, so
//! neither allocation nor deallocation ever happens in the audio callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use log::{debug, info, warn};

use crate::AUDIO_BLOCK_SAMPLES;
use crate::ring_buffer::{Consumer, Producer, RingBuffer};

pub type AudioBlock = [i16; AUDIO_BLOCK_SAMPLES];

pub const MAX_CONNECTIONS: usize = 8;
/// Long enough for an in-flight audio callback to finish after muting.
pub const AUDIO_ISR_SAFETY_DELAY: Duration = Duration::from_millis(10);
/// Long enough for the audio side to pick up a structural change.
pub const DELETION_SAFETY_DELAY: Duration = Duration::from_millis(5);

const COMMAND_QUEUE_LEN: usize = 16;
const RETURN_QUEUE_LEN: usize = 32;

/// Pre-allocated pool of blocks handed out to sources each cycle.
pub struct BlockPool {
    free: Vec<Box<AudioBlock>>,
    capacity: usize,
    allocation_failures: u64,
}

/// A left/right pair of blocks from the pool.
pub struct StereoBlock {
    pub left: Box<AudioBlock>,
    pub right: Box<AudioBlock>,
}

impl BlockPool {
    pub fn new(blocks: usize) -> Self {
        let free = (0..blocks)
            .map(|_| Box::new([0i16; AUDIO_BLOCK_SAMPLES]))
            .collect::<Vec<_>>();
        Self {
            free,
            capacity: blocks,
            allocation_failures: 0,
        }
    }

    /// Takes a block out of the pool. Contents are whatever the last user
    /// left behind.
    pub fn allocate(&mut self) -> Option<Box<AudioBlock>> {
        let block = self.free.pop();
        if block.is_none() {
            self.allocation_failures += 1;
        }
        block
    }

    /// Both blocks or neither.
    pub fn allocate_stereo(&mut self) -> Option<StereoBlock> {
        let left = self.allocate()?;
        match self.allocate() {
            Some(right) => Some(StereoBlock { left, right }),
            None => {
                self.release(left);
                None
            }
        }
    }

    pub fn release(&mut self, block: Box<AudioBlock>) {
        // Never grows past the pre-allocated size, so this push cannot reallocate.
        if self.free.len() < self.capacity {
            self.free.push(block);
        }
    }

    pub fn release_stereo(&mut self, block: StereoBlock) {
        self.release(block.left);
        self.release(block.right);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocation_failures(&self) -> u64 {
        self.allocation_failures
    }
}

/// A source in the audio graph, driven once per block from the audio
/// callback. Implementations must not block, allocate, free or log.
pub trait AudioStream: Send {
    /// Produces the next block, or `None` to contribute nothing this cycle.
    fn update(&mut self, pool: &mut BlockPool) -> Option<StereoBlock>;
}

pub type ConnectionId = u32;

enum MixerCommand {
    Connect {
        id: ConnectionId,
        source: Box<dyn AudioStream>,
    },
    Disconnect(ConnectionId),
    DisconnectAll,
}

/// A source handed back from the audio side.
pub struct Released {
    pub id: ConnectionId,
    pub source: Box<dyn AudioStream>,
}

#[derive(Default)]
struct MixerShared {
    muted: AtomicBool,
    cycles: AtomicU64,
    skipped_sources: AtomicU64,
}

/// Diagnostics published by the mixer after every cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixerStats {
    pub cycles: u64,
    pub skipped_sources: u64,
    pub muted: bool,
}

/// Audio-side half: owns the connected sources and sums them.
pub struct Mixer {
    slots: Vec<Option<(ConnectionId, Box<dyn AudioStream>)>>,
    pool: BlockPool,
    commands: Consumer<MixerCommand>,
    released: Producer<Released>,
    shared: Arc<MixerShared>,
    sum_left: [i32; AUDIO_BLOCK_SAMPLES],
    sum_right: [i32; AUDIO_BLOCK_SAMPLES],
}

/// Creates the two halves of the audio graph. `pool_blocks` is the number of
/// sample blocks shared by all sources.
pub fn audio_graph(pool_blocks: usize) -> (ConnectionManager, Mixer) {
    let (command_tx, command_rx) = RingBuffer::with_capacity(COMMAND_QUEUE_LEN);
    let (released_tx, released_rx) = RingBuffer::with_capacity(RETURN_QUEUE_LEN);
    let shared = Arc::new(MixerShared::default());

    let manager = ConnectionManager {
        commands: command_tx,
        released: released_rx,
        shared: Arc::clone(&shared),
        live: Vec::with_capacity(MAX_CONNECTIONS),
        next_id: 1,
    };
    let mixer = Mixer {
        slots: (0..MAX_CONNECTIONS).map(|_| None).collect(),
        pool: BlockPool::new(pool_blocks),
        commands: command_rx,
        released: released_tx,
        shared,
        sum_left: [0; AUDIO_BLOCK_SAMPLES],
        sum_right: [0; AUDIO_BLOCK_SAMPLES],
    };
    (manager, mixer)
}

impl Mixer {
    fn apply_commands(&mut self) {
        while !self.commands.is_empty() {
            let Some(command) = self.commands.pop() else {
                break;
            };
            match command {
                MixerCommand::Connect { id, source } => {
                    match self.slots.iter().position(Option::is_none) {
                        Some(index) => self.slots[index] = Some((id, source)),
                        // No room; bounce it straight back.
                        None => self.release(id, source),
                    }
                }
                MixerCommand::Disconnect(id) => {
                    let found = self
                        .slots
                        .iter()
                        .position(|slot| matches!(slot, Some((slot_id, _)) if *slot_id == id));
                    if let Some((id, source)) = found.and_then(|index| self.slots[index].take()) {
                        self.release(id, source);
                    }
                }
                MixerCommand::DisconnectAll => {
                    for index in 0..self.slots.len() {
                        if let Some((id, source)) = self.slots[index].take() {
                            self.release(id, source);
                        }
                    }
                }
            }
        }
    }

    fn release(&mut self, id: ConnectionId, source: Box<dyn AudioStream>) {
        // The return ring is larger than the number of sources that can
        // exist at once, so this does not fail in practice.
        if let Err(released) = self.released.push(Released { id, source }) {
            std::mem::forget(released);
        }
    }

    /// Runs one audio cycle: applies pending graph changes, updates every
    /// source and writes the saturated sum.
    pub fn next_block(&mut self, left: &mut AudioBlock, right: &mut AudioBlock) {
        self.apply_commands();

        self.sum_left.fill(0);
        self.sum_right.fill(0);
        let mut skipped = 0u64;
        for (_, source) in self.slots.iter_mut().flatten() {
            match source.update(&mut self.pool) {
                Some(block) => {
                    for (acc, &sample) in self.sum_left.iter_mut().zip(block.left.iter()) {
                        *acc += sample as i32;
                    }
                    for (acc, &sample) in self.sum_right.iter_mut().zip(block.right.iter()) {
                        *acc += sample as i32;
                    }
                    self.pool.release_stereo(block);
                }
                None => skipped += 1,
            }
        }

        if self.shared.muted.load(Ordering::Acquire) {
            left.fill(0);
            right.fill(0);
        } else {
            for (out, &acc) in left.iter_mut().zip(self.sum_left.iter()) {
                *out = acc.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
            for (out, &acc) in right.iter_mut().zip(self.sum_right.iter()) {
                *out = acc.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
        }

        if skipped > 0 {
            self.shared.skipped_sources.fetch_add(skipped, Ordering::Relaxed);
        }
        self.shared.cycles.fetch_add(1, Ordering::Release);
    }

    pub fn connection_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }
}

/// Main-side half: every structural change goes through here.
pub struct ConnectionManager {
    commands: Producer<MixerCommand>,
    released: Consumer<Released>,
    shared: Arc<MixerShared>,
    live: Vec<ConnectionId>,
    next_id: ConnectionId,
}

impl ConnectionManager {
    /// Hands `source` to the audio side. It starts playing on the next cycle.
    pub fn connect(&mut self, source: Box<dyn AudioStream>) -> Result<ConnectionId> {
        if self.live.len() >= MAX_CONNECTIONS {
            bail!("audio graph already has {MAX_CONNECTIONS} connections");
        }
        let id = self.next_id;
        if self
            .commands
            .push(MixerCommand::Connect { id, source })
            .is_err()
        {
            bail!("audio graph command queue is full");
        }
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.live.push(id);
        info!("audio connection {id} added");
        Ok(id)
    }

    /// Removes one connection: unlink, wait, collect the source, wait again.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<Vec<Released>> {
        if !self.live.contains(&id) {
            bail!("no audio connection with id {id}");
        }
        self.send_and_settle(MixerCommand::Disconnect(id))?;
        self.live.retain(|&live| live != id);
        info!("audio connection {id} removed");
        Ok(self.reclaim())
    }

    /// Removes every connection without muting first.
    pub fn disconnect_all(&mut self) -> Result<Vec<Released>> {
        if self.live.is_empty() {
            return Ok(self.reclaim());
        }
        self.send_and_settle(MixerCommand::DisconnectAll)?;
        self.live.clear();
        info!("all audio connections removed");
        Ok(self.reclaim())
    }

    /// Silences the output, waits for the audio side to finish its current
    /// cycle, tears the graph down and waits again. The output stays muted
    /// until [`ConnectionManager::unmute`].
    pub fn mute_and_disconnect(&mut self) -> Result<Vec<Released>> {
        if self.live.is_empty() {
            return Ok(self.reclaim());
        }
        self.shared.muted.store(true, Ordering::Release);
        thread::sleep(AUDIO_ISR_SAFETY_DELAY);
        if self.commands.push(MixerCommand::DisconnectAll).is_err() {
            bail!("audio graph command queue is full");
        }
        thread::sleep(DELETION_SAFETY_DELAY);
        self.live.clear();
        info!("audio output muted and all connections removed");
        Ok(self.reclaim())
    }

    fn send_and_settle(&mut self, command: MixerCommand) -> Result<()> {
        thread::sleep(AUDIO_ISR_SAFETY_DELAY);
        if self.commands.push(command).is_err() {
            bail!("audio graph command queue is full");
        }
        thread::sleep(DELETION_SAFETY_DELAY);
        Ok(())
    }

    /// Collects sources the audio side has handed back so far. Dropping them
    /// here frees them on the main thread.
    pub fn reclaim(&mut self) -> Vec<Released> {
        let mut released = Vec::new();
        while !self.released.is_empty() {
            match self.released.pop() {
                Some(item) => {
                    if !self.live.contains(&item.id) {
                        debug!("reclaimed audio source {}", item.id);
                    } else {
                        warn!("audio graph was full, connection {} rejected", item.id);
                        self.live.retain(|&live| live != item.id);
                    }
                    released.push(item);
                }
                None => break,
            }
        }
        released
    }

    pub fn unmute(&self) {
        self.shared.muted.store(false, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.live.len()
    }

    pub fn stats(&self) -> MixerStats {
        MixerStats {
            cycles: self.shared.cycles.load(Ordering::Acquire),
            skipped_sources: self.shared.skipped_sources.load(Ordering::Relaxed),
            muted: self.is_muted(),
        }
    }
}
