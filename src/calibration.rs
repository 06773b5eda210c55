//! DC offset calibration.
//!
//! The baseline a unit settles at is, to a good approximation, a linear function of the level
//! requested from its DC offset DAC. Calibration measures the baseline at two DAC levels and fits
//! `baseline = gain * level + offset` (both in percent of full scale); applying the calibration
//! inverts that fit to find the DAC code for a requested baseline.

use std::thread::sleep;
use std::time::Duration;

use crate::{InvalidPoint, Result};
use crate::sys::Driver;
use crate::config::{BaselineMode, DeviceConfiguration, Polarity, TriggerMode, UnitConfiguration};
use crate::config::AcquisitionMode;
use crate::params::{DacCode, TunableUnit, UnitMask};
use crate::device::{tolerate_write_failure, Device};
use crate::baseline::estimate_baseline;
use crate::restore::{Restore, Snapshot};

/// DAC levels, in percent of full range, at which the baseline is measured.
pub const CALIBRATION_POINTS: [f64; 2] = [25.0, 75.0];

/// Software triggered acquisitions per calibration point.
const NACQS: usize = 20;

/// Samples averaged into one observation. The first sample of a record is skipped.
const OBSERVATION_WINDOW: std::ops::Range<usize> = 1..21;

/// Time the front end needs to settle after a DAC change.
const SETTLE_TIME: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationModel {
    pub gain: f64,
    pub offset: f64,
}

impl Default for CalibrationModel {
    fn default() -> Self {
        CalibrationModel::IDENTITY
    }
}

impl CalibrationModel {
    /// Model of an ideal front end, used until a unit is calibrated.
    pub const IDENTITY: CalibrationModel = CalibrationModel { gain: 1.0, offset: 0.0 };

    /// Fits a line through two `(level, baseline)` points. Returns `None` if the baselines are
    /// equal, since such a model cannot be inverted.
    pub fn fit((x1, y1): (f64, f64), (x2, y2): (f64, f64)) -> Option<CalibrationModel> {
        let gain = (y2 - y1) / (x2 - x1);
        let offset = (x2 * y1 - x1 * y2) / (x2 - x1);
        let model = CalibrationModel { gain, offset };
        model.is_valid().then_some(model)
    }

    pub fn is_valid(&self) -> bool {
        self.gain.is_finite() && self.offset.is_finite() && self.gain != 0.0
    }

    /// Baseline, in percent of full scale, expected at DAC `level`.
    pub fn baseline(&self, level: f64) -> f64 {
        self.gain * level + self.offset
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCalibration {
    pub units: Vec<CalibrationModel>,
}

impl DeviceCalibration {
    pub fn identity(units: usize) -> Self {
        DeviceCalibration { units: vec![CalibrationModel::IDENTITY; units] }
    }

    pub fn unit(&self, unit: TunableUnit) -> CalibrationModel {
        self.units.get(unit.index).copied().unwrap_or_default()
    }
}

/// Outcome of calibrating one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFit {
    pub unit: TunableUnit,
    /// Measured baseline at each of `CALIBRATION_POINTS`, in percent of full scale.
    pub baselines: [f64; 2],
    /// `None` if the baseline did not follow the DAC.
    pub model: Option<CalibrationModel>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationReport {
    pub fits: Vec<UnitFit>,
}

impl CalibrationReport {
    pub fn invalid_units(&self) -> UnitMask {
        self.fits.iter()
            .filter(|fit| fit.model.is_none())
            .map(|fit| fit.unit.index)
            .collect()
    }
}

/// DAC code that puts the baseline of a unit with `model` at `level` percent of full scale.
///
/// For negative pulses `level` is measured from the top of the range. The result is clamped to
/// the DAC range however extreme the model is.
pub fn dac_code_for_level(model: &CalibrationModel, level: f64, polarity: Polarity) -> DacCode {
    let level = match polarity {
        Polarity::Positive => level,
        Polarity::Negative => (level - 100.0).abs(),
    };
    let dac_level = (level - model.offset) / model.gain;
    DacCode::from_percent((dac_level - 100.0).abs())
}

/// Programs the DC offset of `unit`: the raw code in Legacy mode, or the code `model` gives for
/// the requested level in Calibrated mode.
pub fn apply_dc_offset<D: Driver>(device: &mut Device<D>, unit: TunableUnit,
                                  config: &UnitConfiguration, model: &CalibrationModel)
        -> Result<DacCode> {
    let code = match config.baseline {
        BaselineMode::Legacy { dac_code } => dac_code,
        BaselineMode::Calibrated { level, .. } => {
            let code = dac_code_for_level(model, level, config.polarity);
            log::debug!("{}: baseline {}% ({:?}) needs DAC code {:#06x}",
                unit, level, config.polarity, code.code());
            code
        }
    };
    device.set_dc_offset(unit, code)?;
    Ok(code)
}

/// Programs the DC offset of every enabled Calibrated unit. A failed write is logged and leaves
/// that unit out of the result.
pub fn apply_dc_offsets<D: Driver>(device: &mut Device<D>, config: &DeviceConfiguration,
                                   calibration: &DeviceCalibration)
        -> Result<Vec<(TunableUnit, DacCode)>> {
    let units = device.info().units;
    let mut applied = Vec::new();
    for index in config.calibrated_units().units().filter(|&index| index < units) {
        let unit = device.info().unit(index);
        let result = apply_dc_offset(device, unit, &config.units[index], &calibration.unit(unit));
        if let Some(code) = tolerate_write_failure(result)? {
            applied.push((unit, code));
        }
    }
    Ok(applied)
}

/// Mean of the observation window, or `None` if the record is too short.
fn observation(samples: &[u16]) -> Option<u32> {
    let window = samples.get(OBSERVATION_WINDOW)?;
    let sum = window.iter().map(|&sample| sample as u32).sum::<u32>();
    Some(sum / window.len() as u32)
}

/// Measures the baseline of every unit at each calibration point.
fn measure_points<D: Driver>(device: &mut Device<D>, units: &[TunableUnit])
        -> Result<Vec<[f64; 2]>> {
    let all_units = device.info().unit_mask();
    let code_range = device.info().code_range();
    let mask = units.iter().map(|unit| unit.index).collect::<UnitMask>();
    let mut baselines = vec![[0.0; 2]; units.len()];
    for (point, &level) in CALIBRATION_POINTS.iter().enumerate() {
        device.set_self_trigger(TriggerMode::Disabled, all_units)?;
        device.set_ext_trigger(TriggerMode::Disabled)?;
        device.set_enable_mask(mask)?;
        device.set_acquisition_mode(AcquisitionMode::SoftwareControlled)?;
        device.set_max_events_per_block(1)?;
        device.set_decimation(1)?;

        // the DAC is inverted: a high code gives a low baseline
        let code = DacCode::from_percent(100.0 - level);
        for &unit in units {
            tolerate_write_failure(device.set_dc_offset(unit, code))?;
        }
        sleep(SETTLE_TIME);
        device.clear_data()?;

        device.start_acquisition()?;
        let mut observations = vec![Vec::with_capacity(NACQS); units.len()];
        for acquisition in 0..NACQS {
            device.software_trigger()?;
            let block = device.read_event_block()?;
            if block.is_empty() {
                log::debug!("acquisition {} at {}% returned no data", acquisition, level);
                continue
            }
            let event = device.decode_event(&block)?;
            for (unit, observations) in units.iter().zip(observations.iter_mut()) {
                observations.extend(observation(event.samples(*unit)));
            }
        }
        device.stop_acquisition()?;

        for ((unit, observations), unit_baselines) in
                units.iter().zip(&observations).zip(baselines.iter_mut()) {
            unit_baselines[point] = estimate_baseline(observations, code_range)
                .map_err(|_| InvalidPoint::NoSamples { unit: Some(unit.index) })?;
            log::debug!("{}: baseline {:.3}% at DAC level {}%", unit, unit_baselines[point], level);
        }
    }
    Ok(baselines)
}

/// Calibrates the DC offset of every unit in `targets`.
///
/// Board settings disturbed by the measurement are restored before returning, whether or not
/// calibration succeeds. On success the new models are stored in `calibration`, persisted to
/// the board, and applied to the Calibrated units of `config`. A unit whose baseline does not
/// follow the DAC keeps its previous model and is switched to Legacy mode in `config`.
/// Neither `calibration` nor `config` is changed unless the models are persisted.
pub fn calibrate_dc_offset<D: Driver>(device: &mut Device<D>, targets: UnitMask,
                                      config: &mut DeviceConfiguration,
                                      calibration: &mut DeviceCalibration)
        -> Result<CalibrationReport> {
    device.ensure_idle()?;
    let info = *device.info();
    if !info.family.supports_dc_calibration() {
        log::warn!("{:?} boards do not support DC offset calibration", info.family);
        return Ok(CalibrationReport::default())
    }
    let units = (targets & info.unit_mask()).units()
        .map(|index| info.unit(index))
        .collect::<Vec<_>>();
    if units.is_empty() {
        return Ok(CalibrationReport::default())
    }

    let baselines = {
        let snapshot = Snapshot::acquisition_settings(device)?;
        let mut device = Restore::new(&mut *device, snapshot);
        measure_points(&mut *device, &units)?
    };

    let mut new_calibration = calibration.clone();
    if new_calibration.units.len() < info.units {
        new_calibration.units.resize(info.units, CalibrationModel::IDENTITY);
    }
    let mut new_config = config.clone();
    let mut fallbacks = Vec::new();
    let [x1, x2] = CALIBRATION_POINTS;
    let mut report = CalibrationReport::default();
    for (&unit, &[y1, y2]) in units.iter().zip(&baselines) {
        let model = CalibrationModel::fit((x1, y1), (x2, y2));
        match model {
            Some(model) => {
                log::info!("{} DAC calibration ready: gain {:.5}, offset {:.5}",
                    unit, model.gain, model.offset);
                new_calibration.units[unit.index] = model;
            }
            None => {
                log::warn!("{}: {}; falling back to an uncalibrated DC offset",
                    unit, InvalidPoint::ZeroGain { unit: unit.index });
                if let Some(unit_config) = new_config.units.get_mut(unit.index) {
                    if let BaselineMode::Calibrated { level, .. } = unit_config.baseline {
                        let dac_code = dac_code_for_level(
                            &CalibrationModel::IDENTITY, level, unit_config.polarity);
                        unit_config.baseline = BaselineMode::Legacy { dac_code };
                        fallbacks.push(unit);
                    }
                }
            }
        }
        report.fits.push(UnitFit { unit, baselines: [y1, y2], model });
    }

    device.persist_calibration(&new_calibration)?;
    *calibration = new_calibration;
    *config = new_config;

    apply_dc_offsets(device, config, calibration)?;
    for unit in fallbacks {
        let result = apply_dc_offset(device, unit, &config.units[unit.index],
                                     &calibration.unit(unit));
        tolerate_write_failure(result)?;
    }
    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;
    use crate::params::{BoardFamily, UnitKind};
    use crate::regs::board;
    use crate::sys::sim::{Faults, SimulatedDriver, SimulatedUnit};

    fn close(a: f64, b: f64, tolerance: f64) -> bool {
        (a - b).abs() <= tolerance
    }

    #[test]
    fn test_fit() {
        let model = CalibrationModel::fit((25.0, 40.0), (75.0, 60.0)).unwrap();
        assert!(close(model.gain, 0.4, 1e-12));
        assert!(close(model.offset, 30.0, 1e-12));
        assert!(close(model.baseline(25.0), 40.0, 1e-12));
    }

    #[test]
    fn test_fit_zero_gain() {
        assert_eq!(CalibrationModel::fit((25.0, 50.0), (75.0, 50.0)), None);
    }

    #[test]
    fn test_level_to_dac_code() {
        let model = CalibrationModel { gain: 0.4, offset: 30.0 };
        let code = dac_code_for_level(&model, 50.0, Polarity::Positive).code();
        assert!(code.abs_diff(32768) <= 1);
    }

    #[test]
    fn test_level_round_trip() {
        let model = CalibrationModel::fit((25.0, 40.0), (75.0, 60.0)).unwrap();
        let code = dac_code_for_level(&model, 40.0, Polarity::Positive);
        assert!(code.code().abs_diff(DacCode::from_percent(100.0 - 25.0).code()) <= 1);
    }

    #[test]
    fn test_level_negative_polarity() {
        let model = CalibrationModel::IDENTITY;
        assert_eq!(dac_code_for_level(&model, 10.0, Polarity::Negative),
                   DacCode::from_percent(10.0));
        assert_eq!(dac_code_for_level(&model, 10.0, Polarity::Positive),
                   DacCode::from_percent(90.0));
    }

    #[test]
    fn test_level_clamped() {
        let model = CalibrationModel { gain: 1e-9, offset: 0.0 };
        assert_eq!(dac_code_for_level(&model, 50.0, Polarity::Positive), DacCode::MAX);
        assert_eq!(dac_code_for_level(&model, 50.0, Polarity::Negative), DacCode::MAX);
        let model = CalibrationModel { gain: 1.0, offset: f64::NAN };
        assert_eq!(dac_code_for_level(&model, 50.0, Polarity::Positive), DacCode::MIN);
    }

    fn calibrated_config(units: usize) -> DeviceConfiguration {
        let mut config = DeviceConfiguration::new(units);
        for unit in config.units.iter_mut() {
            unit.baseline = BaselineMode::Calibrated { level: 10.0, relative_threshold: 100 };
        }
        config
    }

    fn simulated_board() -> SimulatedDriver {
        SimulatedDriver::new(BoardFamily::X730, 3)
            .with_unit(0, SimulatedUnit { baseline_gain: 0.4, baseline_offset: 30.0,
                                          ..Default::default() })
            .with_unit(2, SimulatedUnit { baseline_gain: 0.98, baseline_offset: 1.0, noise: 3,
                                          glitch_every: Some(7), glitch: 400,
                                          ..Default::default() })
    }

    #[test]
    fn test_calibrate() {
        let mut device = Device::new(simulated_board()).unwrap();
        device.set_post_trigger(30).unwrap();
        device.set_max_events_per_block(16).unwrap();
        let mut config = calibrated_config(3);
        let mut calibration = DeviceCalibration::identity(3);
        let report = calibrate_dc_offset(&mut device, UnitMask::first(3),
                                         &mut config, &mut calibration).unwrap();

        assert_eq!(report.fits.len(), 3);
        assert!(report.invalid_units().is_empty());
        for (model, (gain, offset)) in calibration.units.iter()
                .zip([(0.4, 30.0), (1.0, 0.0), (0.98, 1.0)]) {
            assert!(close(model.gain, gain, 0.005), "{:?}", model);
            assert!(close(model.offset, offset, 0.1), "{:?}", model);
        }

        assert!(!device.is_running());
        assert_eq!(device.post_trigger().unwrap(), 30);
        assert_eq!(device.max_events_per_block().unwrap(), 16);
        assert_eq!(device.load_calibration().unwrap(), calibration);
        let unit = device.info().unit(0);
        assert_eq!(device.dc_offset(unit).unwrap(),
                   dac_code_for_level(&calibration.units[0], 10.0, Polarity::Positive));
    }

    #[test]
    fn test_calibrate_zero_gain_unit() {
        let driver = simulated_board()
            .with_unit(1, SimulatedUnit { baseline_gain: 0.0, baseline_offset: 40.0, noise: 0,
                                          ..Default::default() });
        let mut device = Device::new(driver).unwrap();
        let mut config = calibrated_config(3);
        let mut calibration = DeviceCalibration::identity(3);
        let previous = CalibrationModel { gain: 0.5, offset: 2.0 };
        calibration.units[1] = previous;
        let report = calibrate_dc_offset(&mut device, UnitMask::first(3),
                                         &mut config, &mut calibration).unwrap();

        assert_eq!(report.invalid_units(), UnitMask::unit(1));
        assert_eq!(calibration.units[1], previous);
        assert_eq!(config.units[1].baseline,
                   BaselineMode::Legacy { dac_code: DacCode::from_percent(90.0) });
        assert!(config.units[0].baseline.is_calibrated());
        let unit = device.info().unit(1);
        assert_eq!(device.dc_offset(unit).unwrap(), DacCode::from_percent(90.0));
    }

    #[test]
    fn test_calibrate_persist_failure_keeps_previous_state() {
        let mut device = Device::new(simulated_board()).unwrap();
        device.driver().set_faults(Faults { fail_write: Some(board::ADDR_FLASH_COMMIT),
                                            ..Default::default() });
        let mut config = calibrated_config(3);
        let mut calibration = DeviceCalibration::identity(3);
        let result = calibrate_dc_offset(&mut device, UnitMask::first(3),
                                         &mut config, &mut calibration);

        assert!(matches!(result,
            Err(Error::HardwareWrite { addr: board::ADDR_FLASH_COMMIT, .. })));
        assert_eq!(calibration, DeviceCalibration::identity(3));
        assert_eq!(config, calibrated_config(3));
        device.driver().set_faults(Faults::default());
        assert_eq!(device.load_calibration().unwrap(), DeviceCalibration::identity(3));
        assert!(!device.is_running());
        assert_eq!(device.dc_offset(device.info().unit(0)).unwrap(), DacCode::MID);
    }

    #[test]
    fn test_calibrate_grouped_board() {
        let driver = SimulatedDriver::new(BoardFamily::X740, 4)
            .with_unit(1, SimulatedUnit { baseline_gain: 0.4, baseline_offset: 30.0,
                                          ..Default::default() });
        let mut device = Device::new(driver).unwrap();
        let mut config = calibrated_config(4);
        let mut calibration = DeviceCalibration::identity(4);
        let report = calibrate_dc_offset(&mut device, UnitMask::first(4),
                                         &mut config, &mut calibration).unwrap();

        assert_eq!(report.fits.len(), 4);
        assert!(report.fits.iter().all(|fit| fit.unit.kind == UnitKind::Group));
        assert!(report.invalid_units().is_empty());
        assert!(close(calibration.units[0].gain, 1.0, 0.01), "{:?}", calibration.units[0]);
        assert!(close(calibration.units[1].gain, 0.4, 0.01), "{:?}", calibration.units[1]);
        assert!(close(calibration.units[1].offset, 30.0, 0.3), "{:?}", calibration.units[1]);
        let unit = device.info().unit(1);
        assert_eq!(device.dc_offset(unit).unwrap(),
                   dac_code_for_level(&calibration.units[1], 10.0, Polarity::Positive));
    }

    #[test]
    fn test_calibrate_unsupported_board() {
        let mut device = Device::new(SimulatedDriver::new(BoardFamily::X742, 2)).unwrap();
        let mut config = calibrated_config(2);
        let mut calibration = DeviceCalibration::identity(2);
        device.driver().clear_writes();
        let report = calibrate_dc_offset(&mut device, UnitMask::first(2),
                                         &mut config, &mut calibration).unwrap();
        assert!(report.fits.is_empty());
        assert!(device.driver().writes().is_empty());
        assert_eq!(calibration, DeviceCalibration::identity(2));
    }

    #[test]
    fn test_calibrate_silent_unit_aborts() {
        let driver = simulated_board()
            .with_unit(1, SimulatedUnit { silent: true, ..Default::default() });
        let mut device = Device::new(driver).unwrap();
        device.set_post_trigger(30).unwrap();
        let mut config = calibrated_config(3);
        let mut calibration = DeviceCalibration::identity(3);
        let result = calibrate_dc_offset(&mut device, UnitMask::first(3),
                                         &mut config, &mut calibration);

        assert!(matches!(result,
            Err(Error::InvalidCalibrationPoint(InvalidPoint::NoSamples { unit: Some(1) }))));
        assert_eq!(calibration, DeviceCalibration::identity(3));
        assert_eq!(device.load_calibration().unwrap(), DeviceCalibration::identity(3));
        assert!(!device.is_running());
        assert_eq!(device.post_trigger().unwrap(), 30);
        assert_eq!(device.dc_offset(device.info().unit(0)).unwrap(), DacCode::MID);
    }

    #[test]
    fn test_calibrate_readout_failure_aborts() {
        let mut device = Device::new(simulated_board()).unwrap();
        device.driver().set_faults(Faults { fail_readout: true, ..Default::default() });
        let mut config = calibrated_config(3);
        let mut calibration = DeviceCalibration::identity(3);
        let result = calibrate_dc_offset(&mut device, UnitMask::first(3),
                                         &mut config, &mut calibration);
        assert!(matches!(result, Err(Error::Readout(_))));
        assert!(!device.is_running());
        assert!(!device.driver().writes().iter().any(|&(addr, _)| addr == board::ADDR_FLASH_COMMIT));
    }

    #[test]
    fn test_calibrate_survives_dac_write_failure() {
        let mut device = Device::new(simulated_board()).unwrap();
        let addr = board::unit_register(board::ADDR_UNIT_DC_OFFSET, 2);
        device.driver().set_faults(Faults { fail_write: Some(addr), ..Default::default() });
        let mut config = calibrated_config(3);
        let mut calibration = DeviceCalibration::identity(3);
        let report = calibrate_dc_offset(&mut device, UnitMask::first(3),
                                         &mut config, &mut calibration).unwrap();
        assert_eq!(report.fits.len(), 3);
        assert!(close(calibration.units[0].gain, 0.4, 0.005));
    }

    #[test]
    fn test_calibrate_refused_while_running() {
        let mut device = Device::new(simulated_board()).unwrap();
        device.start_acquisition().unwrap();
        let mut config = calibrated_config(3);
        let mut calibration = DeviceCalibration::identity(3);
        assert!(matches!(calibrate_dc_offset(&mut device, UnitMask::first(3),
                                             &mut config, &mut calibration),
                         Err(Error::AcquisitionRunning)));
    }

    #[test]
    fn test_apply_dc_offsets() {
        let mut device = Device::new(simulated_board()).unwrap();
        let mut config = calibrated_config(3);
        config.units[1].baseline = BaselineMode::Legacy { dac_code: DacCode::from_code(7) };
        config.units[2].polarity = Polarity::Negative;
        let mut calibration = DeviceCalibration::identity(3);
        calibration.units[0] = CalibrationModel { gain: 0.4, offset: 30.0 };
        let applied = apply_dc_offsets(&mut device, &config, &calibration).unwrap();
        let units = device.info().units().collect::<Vec<_>>();
        assert_eq!(applied, vec![
            (units[0], dac_code_for_level(&calibration.units[0], 10.0, Polarity::Positive)),
            (units[2], DacCode::from_percent(10.0)),
        ]);
        assert_eq!(device.dc_offset(units[1]).unwrap(), DacCode::MID);
    }
}
