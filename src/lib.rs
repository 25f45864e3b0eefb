pub mod apu;
pub mod audio;
pub mod config;
pub mod dac;
pub mod engine;
pub mod mixer;
pub mod ring_buffer;
pub mod timer;

/// Frames per audio graph cycle.
pub const AUDIO_BLOCK_SAMPLES: usize = 128;
