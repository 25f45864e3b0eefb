mod dmc;
mod envelope;
pub mod mixer;
mod noise;
mod pulse;
mod registers;
mod tables;
mod triangle;

pub use dmc::{DPCM_BASE_ADDRESS, DPCM_CAPACITY, DmcChannel};
pub use envelope::Envelope;
pub use mixer::{ChannelLevels, FilterChain, FilterCoefficients};
pub use noise::NoiseChannel;
pub use pulse::PulseChannel;
pub use registers::{PulseId, REGISTER_FILE_LEN, Register};
pub use tables::{CPU_CLOCK_HZ, DUTY_TABLE, LENGTH_TABLE};
pub use triangle::TriangleChannel;

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Frame sequencer events for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameEvents {
    envelope: bool,
    half_frame: bool,
}

const NONE: FrameEvents = FrameEvents {
    envelope: false,
    half_frame: false,
};
const ENVELOPE: FrameEvents = FrameEvents {
    envelope: true,
    half_frame: false,
};
const FULL: FrameEvents = FrameEvents {
    envelope: true,
    half_frame: true,
};

const FOUR_STEP: [FrameEvents; 4] = [NONE, FULL, ENVELOPE, FULL];
const FIVE_STEP: [FrameEvents; 5] = [NONE, FULL, ENVELOPE, NONE, FULL];

/// The five-channel sound chip. Everything here is plain single-owner state;
/// the engine decides which execution context drives which entry point.
pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DmcChannel,

    frame_step: u8,
    frame_mode_5_step: bool,
    frame_irq_inhibit: bool,

    registers: [u8; REGISTER_FILE_LEN],

    sample_rate: u32,
    cycles_per_sample: f32,
    clock_accumulator: f32,
    cpu_cycle_even: bool,

    filter_coeffs: FilterCoefficients,
    mono_filter: FilterChain,
    left_filter: FilterChain,
    right_filter: FilterChain,

    register_writes: u64,
    non_silent_samples: u64,
}

impl Apu {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        Self {
            pulse1: PulseChannel::new(true),
            pulse2: PulseChannel::new(false),
            triangle: TriangleChannel::new(),
            noise: NoiseChannel::new(),
            dmc: DmcChannel::new(),
            frame_step: 0,
            frame_mode_5_step: false,
            frame_irq_inhibit: true,
            registers: [0; REGISTER_FILE_LEN],
            sample_rate,
            cycles_per_sample: CPU_CLOCK_HZ / sample_rate as f32,
            clock_accumulator: 0.0,
            cpu_cycle_even: false,
            filter_coeffs: FilterCoefficients::new(sample_rate),
            mono_filter: FilterChain::default(),
            left_filter: FilterChain::default(),
            right_filter: FilterChain::default(),
            register_writes: 0,
            non_silent_samples: 0,
        }
    }

    /// Back to power-up state. Channels stay disabled until a status write.
    /// Does not allocate; the DPCM buffer is wiped in place.
    pub fn reset(&mut self) {
        self.pulse1 = PulseChannel::new(true);
        self.pulse2 = PulseChannel::new(false);
        self.triangle = TriangleChannel::new();
        self.noise = NoiseChannel::new();
        self.dmc.reset();
        self.frame_step = 0;
        self.frame_mode_5_step = false;
        self.frame_irq_inhibit = true;
        self.registers = [0; REGISTER_FILE_LEN];
        self.clock_accumulator = 0.0;
        self.cpu_cycle_even = false;
        self.mono_filter.reset();
        self.left_filter.reset();
        self.right_filter.reset();
        self.register_writes = 0;
        self.non_silent_samples = 0;
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        self.cycles_per_sample = CPU_CLOCK_HZ / self.sample_rate as f32;
        self.filter_coeffs = FilterCoefficients::new(self.sample_rate);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decodes and applies a raw register write. Returns `false` for addresses
    /// outside the register block, which are otherwise ignored.
    pub fn write_register(&mut self, address: u8, value: u8) -> bool {
        match Register::decode(address) {
            Some(register) => {
                self.write(register, value);
                true
            }
            None => false,
        }
    }

    pub fn write(&mut self, register: Register, value: u8) {
        self.register_writes = self.register_writes.wrapping_add(1);
        if let Some(index) = register.shadow_index() {
            self.registers[index] = value;
        }

        match register {
            Register::PulseControl(id) => self.pulse_mut(id).write_control(value),
            Register::PulseSweep(id) => self.pulse_mut(id).write_sweep(value),
            Register::PulseTimerLow(id) => self.pulse_mut(id).write_timer_low(value),
            Register::PulseTimerHigh(id) => self.pulse_mut(id).write_timer_high(value),

            Register::TriangleLinear => self.triangle.write_linear(value),
            Register::TriangleTimerLow => self.triangle.write_timer_low(value),
            Register::TriangleTimerHigh => self.triangle.write_timer_high(value),

            Register::NoiseControl => self.noise.write_control(value),
            Register::NoisePeriod => self.noise.write_period(value),
            Register::NoiseLength => self.noise.write_length(value),

            Register::DmcControl => self.dmc.write_control(value),
            Register::DmcDirectLoad => self.dmc.write_output_level(value),
            Register::DmcSampleAddress => self.dmc.write_sample_address(value),
            Register::DmcSampleLength => self.dmc.write_sample_length(value),

            Register::Status => self.write_status(value),
            Register::FrameCounter => self.write_frame_counter(value),

            Register::Unused(_) | Register::Expansion => {}
        }
    }

    fn pulse_mut(&mut self, id: PulseId) -> &mut PulseChannel {
        match id {
            PulseId::One => &mut self.pulse1,
            PulseId::Two => &mut self.pulse2,
        }
    }

    fn write_status(&mut self, value: u8) {
        self.pulse1.set_enabled((value & 0x01) != 0);
        self.pulse2.set_enabled((value & 0x02) != 0);
        self.triangle.set_enabled((value & 0x04) != 0);
        self.noise.set_enabled((value & 0x08) != 0);
        self.dmc.set_enabled((value & 0x10) != 0);
    }

    fn write_frame_counter(&mut self, value: u8) {
        self.frame_mode_5_step = (value & 0x80) != 0;
        self.frame_irq_inhibit = (value & 0x40) != 0;
        self.frame_step = 0;

        if self.frame_mode_5_step {
            self.triangle.clock_linear_counter();
            self.clock_envelopes();
            self.clock_half_frame();
        }
    }

    /// Length counters and DMC activity, in `$4015` read layout. Reading
    /// has no side effects here since there is no frame IRQ to acknowledge.
    pub fn status(&self) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length_counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length_counter > 0 {
            status |= 0x02;
        }
        if self.triangle.length_counter > 0 {
            status |= 0x04;
        }
        if self.noise.length_counter > 0 {
            status |= 0x08;
        }
        if !self.dmc.is_silent() {
            status |= 0x10;
        }
        status
    }

    /// Copies DPCM sample bytes to the start of sample memory. Returns the
    /// number of bytes kept after clamping to capacity.
    pub fn load_dpcm(&mut self, data: &[u8]) -> usize {
        self.dmc.load_samples(data, 0)
    }

    pub fn load_dpcm_at(&mut self, data: &[u8], offset: usize) -> usize {
        self.dmc.load_samples(data, offset)
    }

    /// One 240 Hz frame sequencer tick.
    pub fn frame_tick(&mut self) {
        self.triangle.clock_linear_counter();

        let events = if self.frame_mode_5_step {
            FIVE_STEP[self.frame_step as usize % FIVE_STEP.len()]
        } else {
            FOUR_STEP[self.frame_step as usize % FOUR_STEP.len()]
        };
        if events.half_frame {
            self.clock_half_frame();
        }
        if events.envelope {
            self.clock_envelopes();
        }

        let steps = if self.frame_mode_5_step {
            FIVE_STEP.len()
        } else {
            FOUR_STEP.len()
        } as u8;
        self.frame_step = (self.frame_step + 1) % steps;
    }

    fn clock_envelopes(&mut self) {
        self.pulse1.clock_envelope();
        self.pulse2.clock_envelope();
        self.noise.clock_envelope();
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.clock_length();
        self.pulse2.clock_length();
        self.triangle.clock_length();
        self.noise.clock_length();
        self.pulse1.clock_sweep();
        self.pulse2.clock_sweep();
    }

    /// One base clock. Pulse and noise run at half rate.
    pub fn clock(&mut self) {
        self.triangle.clock_timer();
        self.dmc.clock_timer();
        if self.cpu_cycle_even {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();
        }
        self.cpu_cycle_even = !self.cpu_cycle_even;
    }

    pub fn levels(&self) -> ChannelLevels {
        ChannelLevels {
            pulse1: self.pulse1.output(),
            pulse2: self.pulse2.output(),
            triangle: self.triangle.output(),
            noise: self.noise.output(),
            dmc: self.dmc.output(),
            noise_period: self.noise.period_index(),
        }
    }

    /// Advances the emulation by one output sample and returns the mixed,
    /// converted left/right pair.
    pub fn next_sample(&mut self, stereo: bool, filters: bool) -> (i16, i16) {
        self.clock_accumulator += self.cycles_per_sample;
        while self.clock_accumulator >= 1.0 {
            self.clock();
            self.clock_accumulator -= 1.0;
        }

        let levels = self.levels();
        let (left, right) = if stereo {
            let (mut left, mut right) = mixer::mix_stereo(&levels);
            if filters {
                left = self.left_filter.process(&self.filter_coeffs, left);
                right = self.right_filter.process(&self.filter_coeffs, right);
            }
            (left, right)
        } else {
            let mut mixed = mixer::mix_mono(&levels);
            if filters {
                mixed = self.mono_filter.process(&self.filter_coeffs, mixed);
            }
            (mixed, mixed)
        };

        let left = mixer::to_pcm(left);
        let right = mixer::to_pcm(right);
        if left != 0 || right != 0 {
            self.non_silent_samples = self.non_silent_samples.wrapping_add(1);
        }
        (left, right)
    }

    /// Fills two equal-length output buffers.
    pub fn render_block(&mut self, left: &mut [i16], right: &mut [i16], stereo: bool, filters: bool) {
        self.render_block_with(left, right, stereo, filters, |_| {});
    }

    /// Like [`Apu::render_block`], but calls `before_sample` ahead of every
    /// sample so register writes and frame ticks can land mid-block.
    pub fn render_block_with<F>(
        &mut self,
        left: &mut [i16],
        right: &mut [i16],
        stereo: bool,
        filters: bool,
        mut before_sample: F,
    ) where
        F: FnMut(&mut Apu),
    {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            before_sample(self);
            let (sample_left, sample_right) = self.next_sample(stereo, filters);
            *l = sample_left;
            *r = sample_right;
        }
    }

    pub fn pulse1(&self) -> &PulseChannel {
        &self.pulse1
    }

    pub fn pulse2(&self) -> &PulseChannel {
        &self.pulse2
    }

    pub fn triangle(&self) -> &TriangleChannel {
        &self.triangle
    }

    pub fn noise(&self) -> &NoiseChannel {
        &self.noise
    }

    pub fn dmc(&self) -> &DmcChannel {
        &self.dmc
    }

    /// Last value written to `$4000 + offset`, for offsets below `0x18`.
    pub fn register(&self, offset: u8) -> Option<u8> {
        self.registers.get(offset as usize).copied()
    }

    pub fn frame_step(&self) -> u8 {
        self.frame_step
    }

    pub fn is_five_step_mode(&self) -> bool {
        self.frame_mode_5_step
    }

    pub fn frame_irq_inhibit(&self) -> bool {
        self.frame_irq_inhibit
    }

    pub fn register_writes(&self) -> u64 {
        self.register_writes
    }

    pub fn non_silent_samples(&self) -> u64 {
        self.non_silent_samples
    }
}

impl Default for Apu {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enable_all_with_length(apu: &mut Apu, index: u8) {
        apu.write_register(0x15, 0x0F);
        apu.write_register(0x03, index << 3);
        apu.write_register(0x07, index << 3);
        apu.write_register(0x0B, index << 3);
        apu.write_register(0x0F, index << 3);
    }

    fn lengths(apu: &Apu) -> [u8; 4] {
        [
            apu.pulse1().length_counter(),
            apu.pulse2().length_counter(),
            apu.triangle().length_counter(),
            apu.noise().length_counter(),
        ]
    }

    #[test]
    fn length_index_loads_table_value_on_every_channel() {
        assert_eq!(LENGTH_TABLE[0], 10);
        assert_eq!(LENGTH_TABLE[1], 254);
        assert_eq!(LENGTH_TABLE[31], 30);

        let mut apu = Apu::default();
        for index in 0..32u8 {
            enable_all_with_length(&mut apu, index);
            let expected = LENGTH_TABLE[index as usize];
            assert_eq!(lengths(&apu), [expected; 4], "index {index}");
        }
    }

    #[test]
    fn pulse_timer_high_resets_duty_and_starts_envelope() {
        let mut apu = Apu::default();
        apu.write_register(0x15, 0x01);
        apu.write_register(0x00, 0x8A);
        apu.write_register(0x02, 0x10);
        apu.write_register(0x03, 0x00);
        for _ in 0..4_000 {
            apu.clock();
        }
        apu.frame_tick();
        apu.frame_tick();
        assert!(!apu.pulse1().envelope_start());

        apu.write_register(0x03, 0x08);
        assert_eq!(apu.pulse1().duty_position(), 0);
        assert!(apu.pulse1().envelope_start());
    }

    #[test]
    fn control_write_does_not_start_envelope() {
        let mut apu = Apu::default();
        apu.write_register(0x00, 0x05);
        assert!(!apu.pulse1().envelope_start());
    }

    #[test]
    fn five_step_write_clocks_quarter_and_half_frame() {
        let mut apu = Apu::default();
        enable_all_with_length(&mut apu, 1);
        apu.write_register(0x08, 0x05);
        assert_eq!(lengths(&apu), [254; 4]);

        apu.write_register(0x17, 0x80);
        assert_eq!(lengths(&apu), [253; 4]);
        assert_eq!(apu.triangle().linear_counter(), 5);
        assert!(!apu.pulse1().envelope_start());
        assert_eq!(apu.frame_step(), 0);
        assert!(apu.is_five_step_mode());
    }

    #[test]
    fn four_step_write_only_resets_sequence() {
        let mut apu = Apu::default();
        enable_all_with_length(&mut apu, 1);
        apu.frame_tick();
        apu.write_register(0x17, 0x40);
        assert_eq!(lengths(&apu), [254; 4]);
        assert_eq!(apu.frame_step(), 0);
        assert!(apu.frame_irq_inhibit());
    }

    #[test]
    fn four_step_sequence_clocks_length_on_steps_one_and_three() {
        let mut apu = Apu::default();
        enable_all_with_length(&mut apu, 1);

        let mut seen = Vec::new();
        for _ in 0..8 {
            apu.frame_tick();
            seen.push(apu.pulse1().length_counter());
        }
        assert_eq!(seen, vec![254, 253, 253, 252, 252, 251, 251, 250]);
    }

    #[test]
    fn five_step_sequence_clocks_length_on_steps_one_and_four() {
        let mut apu = Apu::default();
        enable_all_with_length(&mut apu, 1);
        apu.write_register(0x17, 0x80);

        let mut seen = Vec::new();
        for _ in 0..5 {
            apu.frame_tick();
            seen.push(apu.noise().length_counter());
        }
        assert_eq!(seen, vec![253, 252, 252, 252, 251]);
    }

    #[test]
    fn disabling_channel_zeroes_length_immediately() {
        let mut apu = Apu::default();
        enable_all_with_length(&mut apu, 3);
        apu.write_register(0x15, 0x05);
        assert_eq!(lengths(&apu), [2, 0, 2, 0]);
        assert_eq!(apu.status() & 0x0F, 0x05);
    }

    #[test]
    fn status_write_restarts_dmc_with_loaded_samples() {
        let mut apu = Apu::default();
        assert_eq!(apu.load_dpcm(&[0xFF; 32]), 32);
        apu.write_register(0x12, 0x00);
        apu.write_register(0x13, 0x01);
        assert!(apu.dmc().is_silent());

        apu.write_register(0x15, 0x10);
        assert!(!apu.dmc().is_silent());
        assert_eq!(apu.dmc().bytes_remaining(), 17);
        assert_eq!(apu.status() & 0x10, 0x10);

        apu.write_register(0x15, 0x00);
        assert!(apu.dmc().is_silent());
        assert_eq!(apu.dmc().configured_length(), 17);
    }

    #[test]
    fn unknown_addresses_are_ignored() {
        let mut apu = Apu::default();
        assert!(!apu.write_register(0x20, 0xFF));
        assert!(!apu.write_register(0xFF, 0xFF));
        assert_eq!(apu.register_writes(), 0);

        assert!(apu.write_register(0x3F, 0xAA));
        assert!(apu.write_register(0x09, 0x12));
        assert_eq!(apu.register_writes(), 2);
        assert_eq!(apu.register(0x09), Some(0x12));
    }

    #[test]
    fn reset_restores_power_up_state() {
        let mut apu = Apu::default();
        enable_all_with_length(&mut apu, 1);
        apu.write_register(0x0E, 0x00);
        for _ in 0..2_000 {
            apu.clock();
        }
        apu.load_dpcm(&[0x00; 8]);
        apu.write_register(0x17, 0x80);

        apu.reset();
        assert_eq!(lengths(&apu), [0; 4]);
        assert_eq!(apu.noise().shift_register(), 1);
        assert_eq!(apu.dmc().output(), 0x40);
        assert!(!apu.is_five_step_mode());
        assert_eq!(apu.register_writes(), 0);
        assert_eq!(apu.register(0x15), Some(0));
    }

    #[test]
    fn pulse_waveform_reads_duty_table_backwards() {
        let mut apu = Apu::new(44_100);
        apu.reset();
        apu.write_register(0x15, 0x01);
        apu.write_register(0x00, 0x9A);
        apu.write_register(0x02, 100);
        apu.write_register(0x03, 0x00);

        let mut positions = vec![apu.pulse1().duty_position()];
        let mut waveform = vec![apu.pulse1().raw_waveform()];
        // One frame: 29830 base clocks with four sequencer ticks spread across it.
        for cycle in 0..29_830u32 {
            apu.clock();
            if cycle % 7_457 == 7_456 {
                apu.frame_tick();
            }

            let pulse = apu.pulse1();
            let raw = pulse.raw_waveform();
            assert_eq!(raw, DUTY_TABLE[2][pulse.duty_position() as usize]);
            assert_eq!(pulse.output(), if raw == 1 { 10 } else { 0 });
            if pulse.duty_position() != *positions.last().unwrap_or(&0xFF) {
                positions.push(pulse.duty_position());
                waveform.push(raw);
            }
        }

        assert_eq!(&positions[..9], &[0, 7, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(&waveform[..8], &[0, 1, 1, 1, 1, 0, 0, 0]);
        assert!(apu.pulse1().length_counter() > 0);
    }

    #[test]
    fn rendering_counts_non_silent_samples() {
        let mut apu = Apu::new(44_100);
        apu.write_register(0x15, 0x01);
        apu.write_register(0x00, 0xBF);
        apu.write_register(0x02, 0xFD);
        apu.write_register(0x03, 0x00);

        let mut left = [0i16; 128];
        let mut right = [0i16; 128];
        apu.render_block(&mut left, &mut right, false, false);
        assert!(apu.non_silent_samples() > 0);
        assert_eq!(left, right);

        apu.render_block(&mut left, &mut right, true, true);
        assert!(left.iter().any(|&s| s != 0));
    }

    #[test]
    fn silent_chip_renders_zeros_without_filters() {
        let mut apu = Apu::new(48_000);
        apu.write_register(0x11, 0x00);
        let mut left = [1i16; 64];
        let mut right = [1i16; 64];
        apu.render_block(&mut left, &mut right, false, false);
        assert!(left.iter().chain(right.iter()).all(|&s| s == 0));
        assert_eq!(apu.non_silent_samples(), 0);
    }
}
