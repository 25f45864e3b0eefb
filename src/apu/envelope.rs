/// Volume generator shared by the pulse and noise channels.
///
/// `period` doubles as the constant volume when `constant_volume` is set, and
/// `loop_flag` is the same register bit as the owning channel's length halt.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub constant_volume: bool,
    pub loop_flag: bool,
    pub start: bool,
    pub period: u8,
    pub divider: u8,
    pub decay: u8,
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            constant_volume: true,
            loop_flag: false,
            start: false,
            period: 0,
            divider: 0,
            decay: 0,
        }
    }

    pub fn write_control(&mut self, value: u8) {
        self.loop_flag = (value & 0x20) != 0;
        self.constant_volume = (value & 0x10) != 0;
        self.period = value & 0x0F;
    }

    pub fn clock(&mut self) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = self.period;
            return;
        }

        if self.divider > 0 {
            self.divider -= 1;
            return;
        }

        self.divider = self.period;
        if self.decay > 0 {
            self.decay -= 1;
        } else if self.loop_flag {
            self.decay = 15;
        }
    }

    pub fn volume(&self) -> u8 {
        if self.constant_volume {
            self.period & 0x0F
        } else {
            self.decay & 0x0F
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_flag_restarts_decay_at_fifteen() {
        let mut env = Envelope::new();
        env.write_control(0x03);
        env.decay = 4;
        env.start = true;

        env.clock();
        assert!(!env.start);
        assert_eq!(env.decay, 15);
        assert_eq!(env.divider, 3);
    }

    #[test]
    fn decay_holds_at_zero_without_loop() {
        let mut env = Envelope::new();
        env.write_control(0x00);
        env.start = true;
        env.clock();

        for _ in 0..40 {
            env.clock();
        }
        assert_eq!(env.decay, 0);
        assert_eq!(env.volume(), 0);
    }

    #[test]
    fn decay_wraps_to_fifteen_with_loop() {
        let mut env = Envelope::new();
        env.write_control(0x20);
        env.start = true;
        env.clock();

        // Period 0 divides by one, so 15 more clocks reach zero and the next wraps.
        for _ in 0..15 {
            env.clock();
        }
        assert_eq!(env.decay, 0);
        env.clock();
        assert_eq!(env.decay, 15);
    }

    #[test]
    fn constant_volume_ignores_decay() {
        let mut env = Envelope::new();
        env.write_control(0x1A);
        env.decay = 3;
        assert_eq!(env.volume(), 10);
    }
}
