use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};

use crate::apu::DEFAULT_SAMPLE_RATE;

/// Persisted player settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub sample_rate: u32,
    /// Pan pulse and noise channels instead of mixing to mono.
    pub stereo: bool,
    /// Emulate the console's analog output filters.
    pub filters: bool,
    /// Register writes that can be queued ahead of the audio callback.
    pub command_queue_capacity: usize,
    pub dac_buffer_capacity: usize,
    /// Silence queued when a DAC stream starts, to ride out the first blocks.
    pub dac_prefill_samples: usize,
    /// Sample blocks shared by all sources in the audio graph.
    pub audio_memory_blocks: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            stereo: true,
            filters: false,
            command_queue_capacity: 1024,
            dac_buffer_capacity: 8192,
            dac_prefill_samples: 512,
            audio_memory_blocks: 16,
        }
    }
}

impl PlayerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config = Self::from_json(&text)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!("loaded player config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, text)
            .with_context(|| format!("failed to write config: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate < 8_000 {
            bail!("sample_rate must be at least 8000 Hz, got {}", self.sample_rate);
        }
        for (name, capacity) in [
            ("command_queue_capacity", self.command_queue_capacity),
            ("dac_buffer_capacity", self.dac_buffer_capacity),
        ] {
            if capacity < 2 || !capacity.is_power_of_two() {
                bail!("{name} must be a power of two of at least 2, got {capacity}");
            }
        }
        if self.dac_prefill_samples >= self.dac_buffer_capacity {
            bail!(
                "dac_prefill_samples ({}) must be smaller than dac_buffer_capacity ({})",
                self.dac_prefill_samples,
                self.dac_buffer_capacity
            );
        }
        if self.audio_memory_blocks < 2 {
            bail!("audio_memory_blocks must be at least 2, got {}", self.audio_memory_blocks);
        }
        Ok(())
    }
}

/// Settings that can change while audio is running. Written from the main
/// thread, read by the audio callback once per block.
#[derive(Debug, Default)]
pub struct RuntimeFlags {
    stereo: AtomicBool,
    filters: AtomicBool,
}

impl RuntimeFlags {
    pub fn new(stereo: bool, filters: bool) -> Self {
        Self {
            stereo: AtomicBool::new(stereo),
            filters: AtomicBool::new(filters),
        }
    }

    pub fn from_config(config: &PlayerConfig) -> Self {
        Self::new(config.stereo, config.filters)
    }

    pub fn stereo(&self) -> bool {
        self.stereo.load(Ordering::Relaxed)
    }

    pub fn set_stereo(&self, enabled: bool) {
        self.stereo.store(enabled, Ordering::Relaxed);
    }

    pub fn filters(&self) -> bool {
        self.filters.load(Ordering::Relaxed)
    }

    pub fn set_filters(&self, enabled: bool) {
        self.filters.store(enabled, Ordering::Relaxed);
    }
}
