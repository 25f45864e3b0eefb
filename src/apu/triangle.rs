use super::tables::{LENGTH_TABLE, TRI_TABLE};

#[derive(Debug, Clone, Copy)]
pub struct TriangleChannel {
    pub(crate) enabled: bool,
    /// Linear counter control; the same bit halts the length counter.
    pub(crate) control_flag: bool,
    pub(crate) linear_reload_value: u8,
    pub(crate) linear_reload_flag: bool,
    pub(crate) linear_counter: u8,

    pub(crate) timer_period: u16,
    pub(crate) timer_counter: f32,
    pub(crate) period_too_low: bool,
    pub(crate) length_counter: u8,
    pub(crate) sequence_step: u8,
}

impl TriangleChannel {
    pub fn new() -> Self {
        Self {
            enabled: false,
            control_flag: false,
            linear_reload_value: 0,
            linear_reload_flag: false,
            linear_counter: 0,
            timer_period: 0,
            timer_counter: 0.0,
            period_too_low: false,
            length_counter: 0,
            sequence_step: 0,
        }
    }

    pub(crate) fn write_linear(&mut self, value: u8) {
        self.control_flag = (value & 0x80) != 0;
        self.linear_reload_value = value & 0x7F;
    }

    pub(crate) fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x0700) | value as u16;
        self.period_too_low = self.timer_period < 2;
    }

    pub(crate) fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        self.period_too_low = self.timer_period < 2;
        self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        self.linear_reload_flag = true;
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    pub(crate) fn clock_timer(&mut self) {
        self.timer_counter -= 1.0;
        if self.timer_counter <= 0.0 {
            self.timer_counter += (self.timer_period + 1) as f32;
            if self.length_counter > 0 && self.linear_counter > 0 {
                self.sequence_step = (self.sequence_step + 1) & 0x1F;
            }
        }
    }

    pub(crate) fn clock_linear_counter(&mut self) {
        if self.linear_reload_flag {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }

        if !self.control_flag {
            self.linear_reload_flag = false;
        }
    }

    pub(crate) fn clock_length(&mut self) {
        if !self.control_flag && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    /// The sequencer stops instead of dropping to zero when a counter runs out,
    /// so the output holds its last level.
    pub fn output(&self) -> u8 {
        if !self.enabled || self.period_too_low {
            0
        } else {
            TRI_TABLE[self.sequence_step as usize]
        }
    }

    pub fn length_counter(&self) -> u8 {
        self.length_counter
    }

    pub fn linear_counter(&self) -> u8 {
        self.linear_counter
    }

    pub fn sequence_step(&self) -> u8 {
        self.sequence_step
    }
}

impl Default for TriangleChannel {
    fn default() -> Self {
        Self::new()
    }
}
