//! High-level configuration of the digitizer in terms of what the operator asks for.

use crate::params::{DacCode, UnitMask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    Positive,
    Negative,
}

impl Polarity {
    pub(crate) fn register_code(self) -> u32 {
        match self {
            Self::Positive => 0,
            Self::Negative => 1,
        }
    }

    pub(crate) fn from_register_code(code: u32) -> Self {
        if code & 1 == 0 { Self::Positive } else { Self::Negative }
    }

    /// Moves `level` away from `baseline` in the direction a pulse of this polarity travels.
    pub fn offset(self, baseline: i64, amount: i64) -> i64 {
        match self {
            Self::Positive => baseline + amount,
            Self::Negative => baseline - amount,
        }
    }
}

/// What a trigger source does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    Disabled,
    ExtOutOnly,
    #[default]
    AcqOnly,
    AcqAndExtOut,
}

impl TriggerMode {
    pub(crate) fn from_flags(acquire: bool, propagate: bool) -> Self {
        match (acquire, propagate) {
            (false, false) => Self::Disabled,
            (false, true)  => Self::ExtOutOnly,
            (true,  false) => Self::AcqOnly,
            (true,  true)  => Self::AcqAndExtOut,
        }
    }

    pub(crate) fn acquires(self) -> bool {
        matches!(self, Self::AcqOnly | Self::AcqAndExtOut)
    }

    pub(crate) fn propagates(self) -> bool {
        matches!(self, Self::ExtOutOnly | Self::AcqAndExtOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionMode {
    #[default]
    SoftwareControlled,
    SInControlled,
    FirstTriggerControlled,
}

impl AcquisitionMode {
    pub(crate) fn register_code(self) -> u32 {
        match self {
            Self::SoftwareControlled     => 0b00,
            Self::SInControlled          => 0b01,
            Self::FirstTriggerControlled => 0b10,
        }
    }

    pub(crate) fn from_register_code(code: u32) -> Self {
        match code & 0b11 {
            0b01 => Self::SInControlled,
            0b10 => Self::FirstTriggerControlled,
            _    => Self::SoftwareControlled,
        }
    }
}

/// How the DC offset and trigger threshold of a unit are specified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaselineMode {
    /// Raw DAC code and absolute threshold code, programmed as-is.
    Legacy {
        dac_code: DacCode,
    },
    /// Baseline level requested in percent of full scale (measured from the side a pulse of the
    /// unit's polarity starts on), converted through the unit's calibration model, and a threshold
    /// relative to the measured baseline, in ADC counts.
    Calibrated {
        level: f64,
        relative_threshold: i32,
    },
}

impl Default for BaselineMode {
    fn default() -> Self {
        BaselineMode::Legacy { dac_code: DacCode::default() }
    }
}

impl BaselineMode {
    pub fn is_calibrated(&self) -> bool {
        matches!(self, Self::Calibrated { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UnitConfiguration {
    pub enabled: bool,
    pub polarity: Polarity,
    pub self_trigger: TriggerMode,
    pub baseline: BaselineMode,
    /// Absolute threshold code. Programmed as-is in Legacy mode; overwritten every time
    /// the relative threshold is resolved in Calibrated mode.
    pub threshold: u16,
}

impl UnitConfiguration {
    pub fn enabled() -> Self {
        UnitConfiguration { enabled: true, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfiguration {
    pub units: Vec<UnitConfiguration>,
    pub acquisition_mode: AcquisitionMode,
    pub ext_trigger: TriggerMode,
    /// Samples per unit per event.
    pub record_length: u32,
    /// Part of the record after the trigger, in percent.
    pub post_trigger: u32,
    pub max_events_per_block: u32,
    pub decimation: u32,
}

impl DeviceConfiguration {
    pub fn new(units: usize) -> Self {
        DeviceConfiguration {
            units: vec![UnitConfiguration::enabled(); units],
            acquisition_mode: AcquisitionMode::default(),
            ext_trigger: TriggerMode::AcqOnly,
            record_length: 1024,
            post_trigger: 50,
            max_events_per_block: 1,
            decimation: 1,
        }
    }

    pub fn enable_mask(&self) -> UnitMask {
        self.units.iter().enumerate()
            .filter(|(_, unit)| unit.enabled)
            .map(|(index, _)| index)
            .collect()
    }

    /// Enabled units whose threshold follows the measured baseline.
    pub fn calibrated_units(&self) -> UnitMask {
        self.units.iter().enumerate()
            .filter(|(_, unit)| unit.enabled && unit.baseline.is_calibrated())
            .map(|(index, _)| index)
            .collect()
    }
}
