//! Description of the board in terms of what the calibration engine needs: how many tunable
//! units there are, whether they are channels or channel groups, and the ADC code range.

use std::fmt;

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardFamily {
    X724,
    X721,
    X731,
    X720,
    X740,
    X751,
    X742,
    X780,
    X761,
    X743,
    X730,
    X790,
    X781,
    X725,
}

impl BoardFamily {
    pub const ALL: [BoardFamily; 14] = [
        Self::X724, Self::X721, Self::X731, Self::X720, Self::X740, Self::X751, Self::X742,
        Self::X780, Self::X761, Self::X743, Self::X730, Self::X790, Self::X781, Self::X725,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|family| family.code() == code)
    }

    pub fn code(self) -> u8 {
        match self {
            Self::X724 => 0,
            Self::X721 => 1,
            Self::X731 => 2,
            Self::X720 => 3,
            Self::X740 => 4,
            Self::X751 => 5,
            Self::X742 => 6,
            Self::X780 => 7,
            Self::X761 => 8,
            Self::X743 => 9,
            Self::X730 => 11,
            Self::X790 => 12,
            Self::X781 => 13,
            Self::X725 => 14,
        }
    }

    pub fn adc_bits(self) -> u8 {
        match self {
            Self::X721 | Self::X731 => 8,
            Self::X751 | Self::X761 => 10,
            Self::X720 | Self::X740 | Self::X742 | Self::X743 => 12,
            Self::X724 | Self::X730 | Self::X725 |
            Self::X780 | Self::X781 | Self::X790 => 14,
        }
    }

    pub fn unit_kind(self) -> UnitKind {
        match self {
            Self::X740 => UnitKind::Group,
            _ => UnitKind::Channel,
        }
    }

    pub fn has_decimation(self) -> bool {
        matches!(self, Self::X740 | Self::X724)
    }

    /// x742 boards have no usable DC offset/threshold loop and are never calibrated.
    pub fn supports_dc_calibration(self) -> bool {
        self != Self::X742
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Channel,
    Group,
}

impl UnitKind {
    pub const GROUP_SIZE: usize = 8;

    pub fn channels(self) -> usize {
        match self {
            Self::Channel => 1,
            Self::Group => Self::GROUP_SIZE,
        }
    }
}

/// A channel or channel group that owns one DC offset DAC and one trigger threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunableUnit {
    pub index: usize,
    pub kind: UnitKind,
}

impl TunableUnit {
    /// The channel whose samples stand for this unit in a decoded event.
    pub fn representative_channel(self) -> usize {
        self.index * self.kind.channels()
    }
}

impl fmt::Display for TunableUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            UnitKind::Channel => write!(f, "channel {}", self.index),
            UnitKind::Group => write!(f, "group {}", self.index),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnitMask: u32 {
        const _ = !0;
    }
}

impl UnitMask {
    /// Mask of the single unit `index`; empty if the index is beyond the mask.
    pub fn unit(index: usize) -> Self {
        Self::from_bits_retain(u32::try_from(index).ok()
            .and_then(|index| 1u32.checked_shl(index))
            .unwrap_or(0))
    }

    pub fn first(count: usize) -> Self {
        if count >= 32 {
            Self::from_bits_retain(!0)
        } else {
            Self::from_bits_retain((1 << count) - 1)
        }
    }

    pub fn has_unit(self, index: usize) -> bool {
        index < 32 && self.bits() & (1 << index) != 0
    }

    pub fn units(self) -> impl Iterator<Item = usize> {
        (0..32).filter(move |&index| self.has_unit(index))
    }
}

impl FromIterator<usize> for UnitMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |mask, index| mask | Self::unit(index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardInfo {
    pub family: BoardFamily,
    pub units: usize,
    pub adc_bits: u8,
}

impl BoardInfo {
    pub fn new(family: BoardFamily, units: usize) -> Self {
        BoardInfo { family, units, adc_bits: family.adc_bits() }
    }

    /// Number of distinct ADC codes, `2^bits`.
    pub fn code_range(&self) -> u32 {
        1 << self.adc_bits
    }

    pub fn unit(&self, index: usize) -> TunableUnit {
        debug_assert!(index < self.units);
        TunableUnit { index, kind: self.family.unit_kind() }
    }

    pub fn units(&self) -> impl Iterator<Item = TunableUnit> + '_ {
        (0..self.units).map(|index| self.unit(index))
    }

    pub fn unit_mask(&self) -> UnitMask {
        UnitMask::first(self.units)
    }

    /// Channels in one event, counting every channel of every group.
    pub fn event_channels(&self) -> usize {
        self.units * self.family.unit_kind().channels()
    }
}

/// Raw code of the 16-bit DC offset DAC.
///
/// The DAC is inverted with respect to the baseline: code 0 puts the baseline at the top of the
/// ADC range and code 65535 at the bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DacCode(u16);

impl Default for DacCode {
    fn default() -> Self {
        DacCode::MID
    }
}

impl DacCode {
    pub const MIN: DacCode = DacCode(0);
    pub const MID: DacCode = DacCode(0x7fff);
    pub const MAX: DacCode = DacCode(0xffff);

    /// DAC codes per percent of full range.
    pub const CODES_PER_PERCENT: f64 = 655.35;

    pub fn from_code(code: u16) -> Self {
        DacCode(code)
    }

    /// Converts a percentage of full DAC range to the nearest code, clamping to the DAC range.
    pub fn from_percent(percent: f64) -> Self {
        let code = (percent * Self::CODES_PER_PERCENT).round();
        // NaN saturates to 0 through the cast.
        DacCode(code.clamp(0.0, u16::MAX as f64) as u16)
    }

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn percent(self) -> f64 {
        self.0 as f64 / Self::CODES_PER_PERCENT
    }

    /// Baseline the DAC would produce on an ideal front end, in ADC counts.
    pub fn nominal_baseline(self, code_range: u32) -> f64 {
        code_range as f64 * (1.0 - self.0 as f64 / u16::MAX as f64)
    }
}
