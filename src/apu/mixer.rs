use std::f32::consts::PI;

/// Keeps stereo output as loud as mono after the 70/30 split.
const STEREO_PULSE_BOOST: f32 = 1.4;
const PAN_MAJOR: f32 = 0.7;
const PAN_MINOR: f32 = 0.3;

/// Instantaneous channel outputs, as read after clocking.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelLevels {
    pub pulse1: u8,
    pub pulse2: u8,
    pub triangle: u8,
    pub noise: u8,
    pub dmc: u8,
    /// Noise period index; drives the noise pan position in stereo.
    pub noise_period: u8,
}

fn pulse_out(sum: f32) -> f32 {
    if sum > 0.0 {
        95.52 / (8128.0 / sum + 100.0)
    } else {
        0.0
    }
}

fn tnd_out(index: f32) -> f32 {
    if index > 0.0 {
        163.67 / (24329.0 / index + 100.0)
    } else {
        0.0
    }
}

pub fn mix_mono(levels: &ChannelLevels) -> f32 {
    let pulse_sum = levels.pulse1 as f32 + levels.pulse2 as f32;
    let tnd_index =
        3.0 * levels.triangle as f32 + 2.0 * levels.noise as f32 + levels.dmc as f32;
    pulse_out(pulse_sum) + tnd_out(tnd_index)
}

/// Pulse 1 leans left, pulse 2 leans right, noise pans from left (high pitch)
/// to right (low pitch). Triangle and DMC stay centered.
pub fn mix_stereo(levels: &ChannelLevels) -> (f32, f32) {
    let p1 = levels.pulse1 as f32 * STEREO_PULSE_BOOST;
    let p2 = levels.pulse2 as f32 * STEREO_PULSE_BOOST;

    let pan = (levels.noise_period & 0x0F) as f32 / 15.0 * 0.4;
    let noise_left = levels.noise as f32 * (PAN_MAJOR - pan);
    let noise_right = levels.noise as f32 * (PAN_MINOR + pan);

    let centered = 3.0 * levels.triangle as f32 + levels.dmc as f32;

    let left = pulse_out(p1 * PAN_MAJOR + p2 * PAN_MINOR) + tnd_out(centered + 2.0 * noise_left);
    let right =
        pulse_out(p1 * PAN_MINOR + p2 * PAN_MAJOR) + tnd_out(centered + 2.0 * noise_right);
    (left, right)
}

/// Clamps to [-1, 1] and scales to signed 16-bit.
pub fn to_pcm(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Coefficients for the console's analog output path, derived once per
/// sample rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterCoefficients {
    hp90_a: f32,
    hp440_a: f32,
    lp14k_a: f32,
}

impl FilterCoefficients {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1) as f32;
        Self {
            hp90_a: high_pass_alpha(90.0, sample_rate),
            hp440_a: high_pass_alpha(440.0, sample_rate),
            lp14k_a: low_pass_alpha(14_000.0, sample_rate),
        }
    }
}

fn high_pass_alpha(cutoff_hz: f32, sample_rate: f32) -> f32 {
    (-2.0 * PI * cutoff_hz / sample_rate).exp()
}

fn low_pass_alpha(cutoff_hz: f32, sample_rate: f32) -> f32 {
    1.0 - (-2.0 * PI * cutoff_hz / sample_rate).exp()
}

/// One output's worth of filter state: 90 Hz HPF, 440 Hz HPF, 14 kHz LPF.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilterChain {
    hp90_prev_in: f32,
    hp90_prev_out: f32,
    hp440_prev_in: f32,
    hp440_prev_out: f32,
    lp14k_prev_out: f32,
}

impl FilterChain {
    pub fn process(&mut self, coeffs: &FilterCoefficients, sample: f32) -> f32 {
        let hp90 = sample - self.hp90_prev_in + coeffs.hp90_a * self.hp90_prev_out;
        self.hp90_prev_in = sample;
        self.hp90_prev_out = hp90;

        let hp440 = hp90 - self.hp440_prev_in + coeffs.hp440_a * self.hp440_prev_out;
        self.hp440_prev_in = hp90;
        self.hp440_prev_out = hp440;

        self.lp14k_prev_out += coeffs.lp14k_a * (hp440 - self.lp14k_prev_out);
        self.lp14k_prev_out
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
