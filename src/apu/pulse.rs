use super::envelope::Envelope;
use super::tables::{DUTY_TABLE, LENGTH_TABLE};

#[derive(Debug, Clone, Copy)]
pub struct PulseChannel {
    pub(crate) enabled: bool,
    /// Pulse 1 negates with ones' complement (subtracts `delta + 1`).
    pub(crate) ones_complement: bool,
    pub(crate) duty: u8,
    pub(crate) duty_position: u8,

    pub(crate) timer_period: u16,
    pub(crate) timer_counter: f32,
    pub(crate) length_counter: u8,
    pub(crate) length_halt: bool,
    pub(crate) envelope: Envelope,

    pub(crate) sweep_enabled: bool,
    pub(crate) sweep_period: u8,
    pub(crate) sweep_negate: bool,
    pub(crate) sweep_shift: u8,
    pub(crate) sweep_reload: bool,
    pub(crate) sweep_divider: u8,

    pub(crate) period_too_low: bool,
    pub(crate) sweep_muting: bool,
}

impl PulseChannel {
    pub fn new(ones_complement: bool) -> Self {
        Self {
            enabled: false,
            ones_complement,
            duty: 0,
            duty_position: 0,
            timer_period: 0,
            timer_counter: 1.0,
            length_counter: 0,
            length_halt: false,
            envelope: Envelope::new(),
            sweep_enabled: false,
            sweep_period: 0,
            sweep_negate: false,
            sweep_shift: 0,
            sweep_reload: false,
            sweep_divider: 0,
            period_too_low: false,
            sweep_muting: false,
        }
    }

    pub(crate) fn write_control(&mut self, value: u8) {
        self.duty = (value >> 6) & 0x03;
        self.length_halt = (value & 0x20) != 0;
        self.envelope.write_control(value);
    }

    pub(crate) fn write_sweep(&mut self, value: u8) {
        self.sweep_enabled = (value & 0x80) != 0;
        self.sweep_period = (value >> 4) & 0x07;
        self.sweep_negate = (value & 0x08) != 0;
        self.sweep_shift = value & 0x07;
        self.sweep_reload = true;
        self.update_sweep_muting();
    }

    pub(crate) fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x0700) | value as u16;
        self.update_sweep_muting();
    }

    pub(crate) fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        self.update_sweep_muting();

        // Phase reset; the timer divider itself keeps running.
        self.duty_position = 0;
        if self.timer_counter <= 0.0 {
            self.timer_counter = (self.timer_period + 1) as f32;
        }

        self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        self.envelope.start = true;
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
            if self.timer_period > 0 {
                self.duty_position = self.duty_position.wrapping_sub(1) & 0x07;
            }
        }
    }

    pub(crate) fn clock_envelope(&mut self) {
        self.envelope.clock();
    }

    pub(crate) fn clock_length(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    pub(crate) fn clock_sweep(&mut self) {
        if self.sweep_reload {
            self.sweep_divider = self.sweep_period;
            self.sweep_reload = false;
            return;
        }

        if self.sweep_divider > 0 {
            self.sweep_divider -= 1;
            return;
        }

        self.sweep_divider = self.sweep_period;
        if self.sweep_enabled && self.sweep_shift > 0 && !self.sweep_muting {
            let target = self.sweep_target_period();
            if (8..=0x07FF).contains(&target) {
                self.timer_period = target;
                self.update_sweep_muting();
            }
        }
    }

    pub fn sweep_target_period(&self) -> u16 {
        let delta = self.timer_period >> self.sweep_shift;
        if self.sweep_negate {
            let change = if self.ones_complement { delta + 1 } else { delta };
            // Underflow lands on 0, which the mute check treats as too low.
            self.timer_period.saturating_sub(change)
        } else {
            self.timer_period.saturating_add(delta)
        }
    }

    fn update_sweep_muting(&mut self) {
        self.period_too_low = self.timer_period < 8;
        self.sweep_muting = self.sweep_shift > 0 && self.sweep_target_period() > 0x07FF;
    }

    /// Current duty-table bit (0 or 1) after all silencing conditions.
    pub fn raw_waveform(&self) -> u8 {
        if !self.enabled
            || self.length_counter == 0
            || self.period_too_low
            || self.sweep_muting
            || self.timer_period == 0
        {
            return 0;
        }
        DUTY_TABLE[self.duty as usize][self.duty_position as usize]
    }

    pub fn output(&self) -> u8 {
        if self.raw_waveform() == 0 {
            0
        } else {
            self.envelope.volume()
        }
    }

    pub fn duty_position(&self) -> u8 {
        self.duty_position
    }

    pub fn length_counter(&self) -> u8 {
        self.length_counter
    }

    pub fn timer_period(&self) -> u16 {
        self.timer_period
    }

    pub fn envelope_start(&self) -> bool {
        self.envelope.start
    }

    pub fn envelope_decay(&self) -> u8 {
        self.envelope.decay
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
