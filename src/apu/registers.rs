/// Size of the shadow register file (`$4000-$4017`).
pub const REGISTER_FILE_LEN: usize = 0x18;

/// One entry of the memory-mapped register block, decoded from the 8-bit
/// offset a command stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    PulseControl(PulseId),
    PulseSweep(PulseId),
    PulseTimerLow(PulseId),
    PulseTimerHigh(PulseId),
    TriangleLinear,
    TriangleTimerLow,
    TriangleTimerHigh,
    NoiseControl,
    NoisePeriod,
    NoiseLength,
    DmcControl,
    DmcDirectLoad,
    DmcSampleAddress,
    DmcSampleLength,
    Status,
    FrameCounter,
    /// Unassigned slots inside the block. Accepted and shadowed, no effect.
    Unused(u8),
    /// `$4023`, reachable only through the `0x3F` alias.
    Expansion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseId {
    One,
    Two,
}

impl Register {
    pub fn decode(address: u8) -> Option<Self> {
        let register = match address {
            0x00 => Register::PulseControl(PulseId::One),
            0x01 => Register::PulseSweep(PulseId::One),
            0x02 => Register::PulseTimerLow(PulseId::One),
            0x03 => Register::PulseTimerHigh(PulseId::One),
            0x04 => Register::PulseControl(PulseId::Two),
            0x05 => Register::PulseSweep(PulseId::Two),
            0x06 => Register::PulseTimerLow(PulseId::Two),
            0x07 => Register::PulseTimerHigh(PulseId::Two),
            0x08 => Register::TriangleLinear,
            0x0A => Register::TriangleTimerLow,
            0x0B => Register::TriangleTimerHigh,
            0x0C => Register::NoiseControl,
            0x0E => Register::NoisePeriod,
            0x0F => Register::NoiseLength,
            0x10 => Register::DmcControl,
            0x11 => Register::DmcDirectLoad,
            0x12 => Register::DmcSampleAddress,
            0x13 => Register::DmcSampleLength,
            0x15 => Register::Status,
            0x17 => Register::FrameCounter,
            0x09 | 0x0D | 0x14 | 0x16 | 0x18..=0x1F => Register::Unused(address),
            0x3F => Register::Expansion,
            _ => return None,
        };
        Some(register)
    }

    /// Offset from `$4000`.
    pub fn offset(self) -> u8 {
        match self {
            Register::PulseControl(id) => id.base(),
            Register::PulseSweep(id) => id.base() + 1,
            Register::PulseTimerLow(id) => id.base() + 2,
            Register::PulseTimerHigh(id) => id.base() + 3,
            Register::TriangleLinear => 0x08,
            Register::TriangleTimerLow => 0x0A,
            Register::TriangleTimerHigh => 0x0B,
            Register::NoiseControl => 0x0C,
            Register::NoisePeriod => 0x0E,
            Register::NoiseLength => 0x0F,
            Register::DmcControl => 0x10,
            Register::DmcDirectLoad => 0x11,
            Register::DmcSampleAddress => 0x12,
            Register::DmcSampleLength => 0x13,
            Register::Status => 0x15,
            Register::FrameCounter => 0x17,
            Register::Unused(offset) => offset,
            Register::Expansion => 0x23,
        }
    }

    /// Index into the shadow register file, if this register is shadowed.
    pub fn shadow_index(self) -> Option<usize> {
        let offset = self.offset() as usize;
        (offset < REGISTER_FILE_LEN).then_some(offset)
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::PulseControl(PulseId::One) => "Pulse1_Duty",
            Register::PulseSweep(PulseId::One) => "Pulse1_Sweep",
            Register::PulseTimerLow(PulseId::One) => "Pulse1_TimerLo",
            Register::PulseTimerHigh(PulseId::One) => "Pulse1_Length",
            Register::PulseControl(PulseId::Two) => "Pulse2_Duty",
            Register::PulseSweep(PulseId::Two) => "Pulse2_Sweep",
            Register::PulseTimerLow(PulseId::Two) => "Pulse2_TimerLo",
            Register::PulseTimerHigh(PulseId::Two) => "Pulse2_Length",
            Register::TriangleLinear => "Triangle_Linear",
            Register::TriangleTimerLow => "Triangle_TimerLo",
            Register::TriangleTimerHigh => "Triangle_Length",
            Register::NoiseControl => "Noise_Envelope",
            Register::NoisePeriod => "Noise_Period",
            Register::NoiseLength => "Noise_Length",
            Register::DmcControl => "DMC_Flags",
            Register::DmcDirectLoad => "DMC_DirectLoad",
            Register::DmcSampleAddress => "DMC_SampleAddr",
            Register::DmcSampleLength => "DMC_SampleLen",
            Register::Status => "Status",
            Register::FrameCounter => "FrameCounter",
            Register::Unused(_) => "Unused",
            Register::Expansion => "Expansion",
        }
    }
}

impl PulseId {
    fn base(self) -> u8 {
        match self {
            PulseId::One => 0x00,
            PulseId::Two => 0x04,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_range_round_trips_through_offset() {
        for address in 0x00..=0x1F {
            let register = Register::decode(address).expect("primary range decodes");
            assert_eq!(register.offset(), address);
        }
    }

    #[test]
    fn alias_maps_to_expansion_register() {
        let register = Register::decode(0x3F);
        assert_eq!(register, Some(Register::Expansion));
        assert_eq!(Register::Expansion.offset(), 0x23);
        assert_eq!(Register::Expansion.shadow_index(), None);
    }

    #[test]
    fn out_of_range_addresses_are_rejected() {
        for address in [0x20, 0x23, 0x3E, 0x40, 0x80, 0xFF] {
            assert_eq!(Register::decode(address), None, "address {address:#04x}");
        }
    }

    #[test]
    fn only_first_twenty_four_are_shadowed() {
        assert_eq!(Register::decode(0x17).and_then(Register::shadow_index), Some(0x17));
        assert_eq!(Register::decode(0x18).and_then(Register::shadow_index), None);
    }

    #[test]
    fn pulse_registers_carry_their_channel() {
        assert_eq!(
            Register::decode(0x07),
            Some(Register::PulseTimerHigh(PulseId::Two))
        );
        assert_eq!(Register::decode(0x03).map(Register::name), Some("Pulse1_Length"));
    }
}
