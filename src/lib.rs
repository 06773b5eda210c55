mod sys;
mod regs;
mod config;
mod params;
mod device;
mod event;
mod trigger;
mod baseline;
mod restore;
mod calibration;
mod threshold;

use std::collections::TryReserveError;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    NotFound,
    Io(io::Error),
    Allocation(TryReserveError),
    Readout(io::Error),
    EventDecode(DecodeError),
    InvalidCalibrationPoint(InvalidPoint),
    HardwareWrite { addr: usize, cause: io::Error },
    AcquisitionRunning,
    Other(Box<dyn std::error::Error + Sync + Send + 'static>),
}

/// Reason an event block could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { words: usize },
    BadHeader { word: u32 },
    SizeMismatch { header: usize, block: usize },
    UnknownUnits { mask: u32 },
    UnevenPayload { words: usize, units: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated { words } =>
                write!(f, "block of {} words is shorter than an event header", words),
            Self::BadHeader { word } =>
                write!(f, "bad event header {:#010x}", word),
            Self::SizeMismatch { header, block } =>
                write!(f, "header announces {} words, block holds {}", header, block),
            Self::UnknownUnits { mask } =>
                write!(f, "unit mask {:#x} refers to units the board does not have", mask),
            Self::UnevenPayload { words, units } =>
                write!(f, "{} payload words cannot be split across {} units", words, units),
        }
    }
}

/// Reason a calibration point (or the fit built from two of them) was rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InvalidPoint {
    /// No observation fell inside the ADC code range, so there is no mode to filter around.
    NoSamples { unit: Option<usize> },
    /// Both set-points produced the same baseline.
    ZeroGain { unit: usize },
}

impl fmt::Display for InvalidPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoSamples { unit: Some(unit) } =>
                write!(f, "no valid baseline samples from unit {}", unit),
            Self::NoSamples { unit: None } =>
                write!(f, "no valid baseline samples"),
            Self::ZeroGain { unit } =>
                write!(f, "unit {} baseline does not follow the DAC (zero gain)", unit),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotFound =>
                write!(f, "digitizer not connected"),
            Self::Io(io_error) =>
                write!(f, "transport I/O error: {}", io_error),
            Self::Allocation(error) =>
                write!(f, "can't allocate the memory for the readout buffer: {}", error),
            Self::Readout(io_error) =>
                write!(f, "readout error: {}", io_error),
            Self::EventDecode(error) =>
                write!(f, "event build error: {}", error),
            Self::InvalidCalibrationPoint(point) =>
                write!(f, "invalid calibration point: {}", point),
            Self::HardwareWrite { addr, cause } =>
                write!(f, "register write error at {:#06x}: {}", addr, cause),
            Self::AcquisitionRunning =>
                write!(f, "can't run while acquisition is running"),
            Self::Other(error) =>
                write!(f, "{}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(io_error) | Self::Readout(io_error) => Some(io_error),
            Self::HardwareWrite { cause, .. } => Some(cause),
            Self::Allocation(error) => Some(error),
            _ => None
        }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::NotFound =>
                Self::new(io::ErrorKind::NotFound, error),
            Error::Io(io_error) | Error::Readout(io_error) =>
                io_error,
            Error::Other(error) => {
                match error.downcast::<io::Error>() {
                    Ok(error) => *error,
                    Err(error) => io::Error::new(io::ErrorKind::Other, error)
                }
            }
            error => io::Error::new(io::ErrorKind::Other, error),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            _ => Error::Io(error),
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(error: TryReserveError) -> Self {
        Error::Allocation(error)
    }
}

impl From<DecodeError> for Error {
    fn from(error: DecodeError) -> Self {
        Error::EventDecode(error)
    }
}

impl From<InvalidPoint> for Error {
    fn from(point: InvalidPoint) -> Self {
        Error::InvalidCalibrationPoint(point)
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use sys::Driver;

pub use sys::sim::{
    SimulatedDriver,
    SimulatedUnit,
    Faults,
};

pub use config::{
    Polarity,
    TriggerMode,
    AcquisitionMode,
    BaselineMode,
    UnitConfiguration,
    DeviceConfiguration,
};

pub use params::{
    BoardFamily,
    BoardInfo,
    UnitKind,
    TunableUnit,
    UnitMask,
    DacCode,
};

pub use device::Device;

pub use event::{
    EventBlock,
    Event,
};

pub use trigger::Discriminator;

pub use baseline::{
    estimate_baseline,
    BASELINE_TOLERANCE,
};

pub use calibration::{
    CalibrationModel,
    DeviceCalibration,
    CalibrationReport,
    UnitFit,
    CALIBRATION_POINTS,
    calibrate_dc_offset,
    apply_dc_offset,
    apply_dc_offsets,
    dac_code_for_level,
};

pub use threshold::{
    BaselineSource,
    ResolvedThreshold,
    ThresholdReport,
    resolve_thresholds,
    start_with_relative_thresholds,
};
