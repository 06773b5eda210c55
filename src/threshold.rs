//! Trigger thresholds relative to the live baseline.
//!
//! Units in Calibrated mode specify their threshold as a distance from the baseline. The
//! baseline is measured from one self-triggered event, with the trigger threshold temporarily
//! placed close to where the DAC setting should put the baseline; units that do not trigger on
//! their own are measured from one software-triggered event instead.

use std::thread::sleep;
use std::time::Duration;

use crate::Result;
use crate::sys::Driver;
use crate::config::{BaselineMode, DeviceConfiguration, Polarity};
use crate::params::TunableUnit;
use crate::device::{tolerate_write_failure, Device};
use crate::restore::{Restore, Snapshot};

/// Post-trigger size, in percent, while measuring.
const MEASURE_POST_TRIGGER: u32 = 50;

/// Distance of the exploratory threshold from the expected baseline, in counts.
const COARSE_THRESHOLD_OFFSET: i64 = 100;

/// Time given to the units to self-trigger.
const SELF_TRIGGER_WAIT: Duration = Duration::from_millis(300);

/// Samples of a software-triggered record averaged into a baseline.
const FALLBACK_WINDOW: std::ops::Range<usize> = 1..11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineSource {
    SelfTrigger,
    SoftwareTrigger,
    /// The unit produced no samples in either event; its threshold is 0.
    NoSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedThreshold {
    pub unit: TunableUnit,
    pub source: BaselineSource,
    /// Measured baseline, in counts.
    pub baseline: Option<u32>,
    pub threshold: u16,
    /// Whether the threshold register was written successfully.
    pub written: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThresholdReport {
    pub units: Vec<ResolvedThreshold>,
}

fn clamp_to_range(code: i64, code_range: u32) -> u16 {
    code.clamp(0, code_range as i64 - 1) as u16
}

fn final_threshold(baseline: u32, relative: i32, polarity: Polarity, code_range: u32) -> u16 {
    clamp_to_range(polarity.offset(baseline as i64, relative as i64), code_range)
}

fn mean(samples: &[u16]) -> Option<u32> {
    if samples.is_empty() {
        return None
    }
    let sum = samples.iter().map(|&sample| sample as u64).sum::<u64>();
    Some((sum / samples.len() as u64) as u32)
}

/// Mean of the first half of the pre-trigger part of a self-triggered record.
fn self_triggered_baseline(samples: &[u16]) -> Option<u32> {
    let window = samples.len() * ((100 - MEASURE_POST_TRIGGER as usize) / 2) / 100;
    mean(&samples[..window])
}

struct Target {
    unit: TunableUnit,
    polarity: Polarity,
    relative: i32,
    baseline: Option<(u32, BaselineSource)>,
}

/// Measures the baseline of every enabled Calibrated unit and programs its threshold at the
/// configured distance from it. The resolved thresholds are stored in `config`.
///
/// The post-trigger size is restored and acquisition is stopped before returning.
pub fn resolve_thresholds<D: Driver>(device: &mut Device<D>, config: &mut DeviceConfiguration)
        -> Result<ThresholdReport> {
    device.ensure_idle()?;
    let info = *device.info();
    let mut targets = config.calibrated_units().units()
        .filter(|&index| index < info.units)
        .filter_map(|index| match config.units[index].baseline {
            BaselineMode::Calibrated { relative_threshold, .. } => Some(Target {
                unit: info.unit(index),
                polarity: config.units[index].polarity,
                relative: relative_threshold,
                baseline: None,
            }),
            BaselineMode::Legacy { .. } => None,
        })
        .collect::<Vec<_>>();
    if targets.is_empty() {
        log::debug!("no unit uses a relative threshold");
        return Ok(ThresholdReport::default())
    }

    let code_range = info.code_range();
    let snapshot = Snapshot::post_trigger(device)?;
    let mut device = Restore::new(&mut *device, snapshot);
    device.set_post_trigger(MEASURE_POST_TRIGGER)?;

    for target in &targets {
        let expected = device.dc_offset(target.unit)?.nominal_baseline(code_range) as i64;
        let coarse = clamp_to_range(target.polarity.offset(expected, COARSE_THRESHOLD_OFFSET),
                                    code_range);
        log::debug!("{}: expecting baseline near {}, exploratory threshold {}",
            target.unit, expected, coarse);
        tolerate_write_failure(device.set_threshold(target.unit, coarse))?;
    }

    device.start_acquisition()?;
    sleep(SELF_TRIGGER_WAIT);
    let block = device.read_event_block()?;
    if block.is_empty() {
        log::debug!("no self-triggered event");
    } else {
        let event = device.decode_event(&block)?;
        for target in targets.iter_mut() {
            target.baseline = self_triggered_baseline(event.samples(target.unit))
                .map(|baseline| (baseline, BaselineSource::SelfTrigger));
        }
    }
    device.clear_data()?;

    if targets.iter().any(|target| target.baseline.is_none()) {
        log::debug!("software trigger needed for units without a self-triggered record");
        device.software_trigger()?;
        let block = device.read_event_block()?;
        if !block.is_empty() {
            let event = device.decode_event(&block)?;
            for target in targets.iter_mut().filter(|target| target.baseline.is_none()) {
                target.baseline = event.samples(target.unit).get(FALLBACK_WINDOW)
                    .and_then(mean)
                    .map(|baseline| (baseline, BaselineSource::SoftwareTrigger));
            }
        }
    }

    let mut report = ThresholdReport::default();
    for target in &targets {
        let (baseline, source, threshold) = match target.baseline {
            Some((baseline, source)) =>
                (Some(baseline), source,
                 final_threshold(baseline, target.relative, target.polarity, code_range)),
            None => {
                log::warn!("{} produced no samples; setting its threshold to 0", target.unit);
                (None, BaselineSource::NoSignal, 0)
            }
        };
        config.units[target.unit.index].threshold = threshold;
        let written = tolerate_write_failure(device.set_threshold(target.unit, threshold))?
            .is_some();
        log::info!("{}: baseline {:?} from {:?}, threshold {}",
            target.unit, baseline, source, threshold);
        report.units.push(ResolvedThreshold {
            unit: target.unit,
            source,
            baseline,
            threshold,
            written,
        });
    }
    device.stop_acquisition()?;
    Ok(report)
}

/// Resolves relative thresholds and then starts acquisition.
pub fn start_with_relative_thresholds<D: Driver>(device: &mut Device<D>,
                                                 config: &mut DeviceConfiguration)
        -> Result<ThresholdReport> {
    let report = resolve_thresholds(device, config)?;
    device.clear_data()?;
    device.start_acquisition()?;
    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;
    use crate::calibration::DeviceCalibration;
    use crate::params::{BoardFamily, UnitKind};
    use crate::regs::board;
    use crate::sys::sim::{Faults, SimulatedDriver, SimulatedUnit};

    #[test]
    fn test_final_threshold() {
        assert_eq!(final_threshold(1000, 50, Polarity::Positive, 16384), 1050);
        assert_eq!(final_threshold(1000, 50, Polarity::Negative, 16384), 950);
        assert_eq!(final_threshold(16380, 50, Polarity::Positive, 16384), 16383);
        assert_eq!(final_threshold(10, 50, Polarity::Negative, 16384), 0);
        assert_eq!(final_threshold(10, -50, Polarity::Positive, 16384), 0);
    }

    #[test]
    fn test_self_triggered_window() {
        let mut samples = vec![100u16; 25];
        samples.extend([4000; 75]);
        assert_eq!(self_triggered_baseline(&samples), Some(100));
        assert_eq!(self_triggered_baseline(&[7, 7, 7]), None);
    }

    /// Unit 1 has negative pulses, unit 2 never produces samples and the pulses of unit 3 are
    /// too small to reach the exploratory threshold.
    fn configured_device() -> (Device<SimulatedDriver>, DeviceConfiguration) {
        let driver = SimulatedDriver::new(BoardFamily::X730, 4)
            .with_unit(2, SimulatedUnit { silent: true, ..Default::default() })
            .with_unit(3, SimulatedUnit { pulse: 50, ..Default::default() });
        let mut device = Device::new(driver).unwrap();
        let mut config = DeviceConfiguration::new(4);
        for unit in config.units.iter_mut() {
            unit.baseline = BaselineMode::Calibrated { level: 10.0, relative_threshold: 50 };
        }
        config.units[1].polarity = Polarity::Negative;
        config.post_trigger = 20;
        device.configure(&config, &DeviceCalibration::identity(4)).unwrap();
        (device, config)
    }

    #[test]
    fn test_resolve() {
        let (mut device, mut config) = configured_device();
        let report = resolve_thresholds(&mut device, &mut config).unwrap();
        let units = device.info().units().collect::<Vec<_>>();
        assert_eq!(report.units.len(), 4);

        let sources = report.units.iter().map(|resolved| resolved.source).collect::<Vec<_>>();
        assert_eq!(sources, vec![
            BaselineSource::SelfTrigger,
            BaselineSource::SelfTrigger,
            BaselineSource::NoSignal,
            BaselineSource::SoftwareTrigger,
        ]);

        // level 10% puts positive units near 1638 counts and the negative one near 14746
        let baseline = |index: usize| report.units[index].baseline.unwrap();
        assert!(baseline(0).abs_diff(1638) <= 3);
        assert!(baseline(1).abs_diff(14746) <= 3);
        assert!(baseline(3).abs_diff(1638) <= 3);
        assert_eq!(report.units[0].threshold as u32, baseline(0) + 50);
        assert_eq!(report.units[1].threshold as u32, baseline(1) - 50);
        assert_eq!(report.units[2].baseline, None);
        assert_eq!(report.units[2].threshold, 0);
        assert_eq!(report.units[3].threshold as u32, baseline(3) + 50);

        for (resolved, unit) in report.units.iter().zip(&units) {
            assert!(resolved.written);
            assert_eq!(device.threshold(*unit).unwrap(), resolved.threshold);
            assert_eq!(config.units[unit.index].threshold, resolved.threshold);
        }
        assert!(!device.is_running());
        assert_eq!(device.post_trigger().unwrap(), 20);
    }

    #[test]
    fn test_resolve_grouped_board() {
        let driver = SimulatedDriver::new(BoardFamily::X740, 4)
            .with_unit(2, SimulatedUnit { pulse: 50, ..Default::default() })
            .with_unit(3, SimulatedUnit { silent: true, ..Default::default() });
        let mut device = Device::new(driver).unwrap();
        let mut config = DeviceConfiguration::new(4);
        for unit in config.units.iter_mut() {
            unit.baseline = BaselineMode::Calibrated { level: 10.0, relative_threshold: 50 };
        }
        config.units[1].polarity = Polarity::Negative;
        device.configure(&config, &DeviceCalibration::identity(4)).unwrap();

        let report = resolve_thresholds(&mut device, &mut config).unwrap();
        let sources = report.units.iter().map(|resolved| resolved.source).collect::<Vec<_>>();
        assert_eq!(sources, vec![
            BaselineSource::SelfTrigger,
            BaselineSource::SelfTrigger,
            BaselineSource::SoftwareTrigger,
            BaselineSource::NoSignal,
        ]);

        // 12-bit groups: level 10% is near 410 counts, or near 3686 for negative pulses
        let baseline = |index: usize| report.units[index].baseline.unwrap();
        assert!(baseline(0).abs_diff(410) <= 3);
        assert!(baseline(1).abs_diff(3686) <= 3);
        assert!(baseline(2).abs_diff(410) <= 3);
        assert_eq!(report.units[0].threshold as u32, baseline(0) + 50);
        assert_eq!(report.units[1].threshold as u32, baseline(1) - 50);
        assert_eq!(report.units[3].threshold, 0);
        for resolved in report.units.iter() {
            assert_eq!(resolved.unit.kind, UnitKind::Group);
            assert_eq!(device.threshold(resolved.unit).unwrap(), resolved.threshold);
        }
        assert!(!device.is_running());
    }

    #[test]
    fn test_start_with_relative_thresholds() {
        let (mut device, mut config) = configured_device();
        start_with_relative_thresholds(&mut device, &mut config).unwrap();
        assert!(device.is_running());
        assert!(device.ensure_idle().is_err());
        device.stop_acquisition().unwrap();
    }

    #[test]
    fn test_nothing_to_resolve() {
        let mut device = Device::new(SimulatedDriver::new(BoardFamily::X730, 2)).unwrap();
        let mut config = DeviceConfiguration::new(2);
        device.driver().clear_writes();
        let report = resolve_thresholds(&mut device, &mut config).unwrap();
        assert!(report.units.is_empty());
        assert!(device.driver().writes().is_empty());
    }

    #[test]
    fn test_refused_while_running() {
        let (mut device, mut config) = configured_device();
        device.start_acquisition().unwrap();
        assert!(matches!(resolve_thresholds(&mut device, &mut config),
                         Err(Error::AcquisitionRunning)));
    }

    #[test]
    fn test_readout_failure_restores_post_trigger() {
        let (mut device, mut config) = configured_device();
        device.driver().set_faults(Faults { fail_readout: true, ..Default::default() });
        assert!(matches!(resolve_thresholds(&mut device, &mut config), Err(Error::Readout(_))));
        assert!(!device.is_running());
        assert_eq!(device.post_trigger().unwrap(), 20);
    }

    #[test]
    fn test_threshold_write_failure_is_not_fatal() {
        let (mut device, mut config) = configured_device();
        let addr = board::unit_register(board::ADDR_UNIT_THRESHOLD, 3);
        device.driver().set_faults(Faults { fail_write: Some(addr), ..Default::default() });
        let report = resolve_thresholds(&mut device, &mut config).unwrap();
        assert!(report.units[0].written);
        assert!(!report.units[3].written);
    }
}
