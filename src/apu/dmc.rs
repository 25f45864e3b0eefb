use super::tables::DMC_RATE_TABLE;

/// Sample memory covers $C000-$FFFF.
pub const DPCM_CAPACITY: usize = 0x4000;
pub const DPCM_BASE_ADDRESS: u16 = 0xC000;
const DPCM_FILL: u8 = 0x55;

#[derive(Debug, Clone)]
pub struct DmcChannel {
    pub(crate) enabled: bool,
    pub(crate) irq_enabled: bool,
    pub(crate) loop_flag: bool,
    pub(crate) rate_index: u8,
    pub(crate) timer_counter: f32,
    pub(crate) output_level: u8,

    pub(crate) start_address: u16,
    pub(crate) configured_length: u16,

    pub(crate) read_offset: u16,
    pub(crate) bytes_remaining: u16,
    pub(crate) shift_byte: u8,
    pub(crate) bits_remaining: u8,
    pub(crate) silence: bool,

    samples: Box<[u8]>,
    has_samples: bool,
}

impl DmcChannel {
    pub fn new() -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            loop_flag: false,
            rate_index: 0,
            timer_counter: 0.0,
            output_level: 0x40,
            start_address: 0,
            configured_length: 0,
            read_offset: 0,
            bytes_remaining: 0,
            shift_byte: 0,
            bits_remaining: 0,
            silence: true,
            samples: vec![DPCM_FILL; DPCM_CAPACITY].into_boxed_slice(),
            has_samples: false,
        }
    }

    /// Power-up state. The sample buffer keeps its allocation but is wiped.
    pub(crate) fn reset(&mut self) {
        self.enabled = false;
        self.irq_enabled = false;
        self.loop_flag = false;
        self.rate_index = 0;
        self.timer_counter = 0.0;
        // Center of the DAC range avoids a DC pop on the first sample.
        self.output_level = 0x40;
        self.start_address = 0;
        self.configured_length = 0;
        self.read_offset = 0;
        self.bytes_remaining = 0;
        self.shift_byte = 0;
        self.bits_remaining = 0;
        self.silence = true;
        self.samples.fill(DPCM_FILL);
        self.has_samples = false;
    }

    /// Copies `data` into sample memory at `offset`, dropping whatever does
    /// not fit. Returns the number of bytes stored.
    pub(crate) fn load_samples(&mut self, data: &[u8], offset: usize) -> usize {
        if data.is_empty() || offset >= self.samples.len() {
            return 0;
        }
        let len = data.len().min(self.samples.len() - offset);
        self.samples[offset..offset + len].copy_from_slice(&data[..len]);
        self.has_samples = true;
        len
    }

    pub(crate) fn write_control(&mut self, value: u8) {
        self.irq_enabled = (value & 0x80) != 0;
        self.loop_flag = (value & 0x40) != 0;
        self.rate_index = value & 0x0F;
    }

    pub(crate) fn write_output_level(&mut self, value: u8) {
        self.output_level = value & 0x7F;
    }

    pub(crate) fn write_sample_address(&mut self, value: u8) {
        self.start_address = DPCM_BASE_ADDRESS + (value as u16) * 64;
    }

    pub(crate) fn write_sample_length(&mut self, value: u8) {
        self.configured_length = (value as u16) * 16 + 1;
        if self.enabled && self.silence {
            self.start_sample(self.start_address, self.configured_length);
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled {
            if self.silence
                && self.has_samples
                && self.start_address >= DPCM_BASE_ADDRESS
                && self.configured_length > 0
            {
                self.start_sample(self.start_address, self.configured_length);
            }
        } else {
            // Output level and configuration survive for the next restart.
            self.silence = true;
        }
    }

    fn start_sample(&mut self, address: u16, length: u16) {
        if address < DPCM_BASE_ADDRESS || !self.has_samples {
            return;
        }
        let offset = address - DPCM_BASE_ADDRESS;
        let capacity = self.samples.len() as u16;
        if offset >= capacity || length == 0 {
            return;
        }
        self.read_offset = offset;
        self.bytes_remaining = length.min(capacity - offset);
        self.silence = false;
        self.bits_remaining = 0;
    }

    pub(crate) fn clock_timer(&mut self) {
        if self.silence {
            return;
        }
        self.timer_counter -= 1.0;
        if self.timer_counter <= 0.0 {
            self.timer_counter += DMC_RATE_TABLE[self.rate_index as usize] as f32;
            self.process_next_bit();
        }
    }

    fn process_next_bit(&mut self) {
        if self.bits_remaining == 0 {
            // End of sample only once the last byte's bits are all out.
            if self.bytes_remaining == 0 {
                if !self.loop_flag {
                    self.silence = true;
                    return;
                }
                self.start_sample(self.start_address, self.configured_length);
                if self.silence || self.bytes_remaining == 0 {
                    return;
                }
            }

            match self.samples.get(self.read_offset as usize) {
                Some(&byte) => {
                    self.shift_byte = byte;
                    self.read_offset += 1;
                    self.bytes_remaining -= 1;
                    self.bits_remaining = 8;
                }
                None => {
                    self.bytes_remaining = 0;
                    self.silence = true;
                    return;
                }
            }
        }

        if self.shift_byte & 0x01 != 0 {
            if self.output_level <= 125 {
                self.output_level += 2;
            }
        } else if self.output_level >= 2 {
            self.output_level -= 2;
        }
        self.shift_byte >>= 1;
        self.bits_remaining -= 1;
    }

    pub fn output(&self) -> u8 {
        self.output_level & 0x7F
    }

    pub fn is_silent(&self) -> bool {
        self.silence
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn start_address(&self) -> u16 {
        self.start_address
    }

    pub fn configured_length(&self) -> u16 {
        self.configured_length
    }

    pub fn bytes_remaining(&self) -> u16 {
        self.bytes_remaining
    }

    /// Latched from `$4010` bit 7. No interrupt line is driven.
    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    pub fn is_looping(&self) -> bool {
        self.loop_flag
    }

    pub fn sample_memory(&self) -> &[u8] {
        &self.samples
    }
}

impl Default for DmcChannel {
    fn default() -> Self {
        Self::new()
    }
}
