use wavecal::{BaselineMode, BoardFamily, Device, DeviceConfiguration};
use wavecal::{SimulatedDriver, SimulatedUnit};

/// Baseline requested for every unit once calibrated, in percent of full scale.
const BASELINE_LEVEL: f64 = 10.0;

fn simulated_board() -> SimulatedDriver {
    let front_ends = [
        (1.00, 0.0),
        (0.97, 1.2),
        (1.02, -0.8),
        (0.95, 2.5),
        (1.01, 0.3),
        (0.99, -1.5),
        (0.0, 40.0), // stuck front end
        (1.03, 0.9),
    ];
    let mut driver = SimulatedDriver::new(BoardFamily::X730, front_ends.len());
    for (index, &(baseline_gain, baseline_offset)) in front_ends.iter().enumerate() {
        driver = driver.with_unit(index, SimulatedUnit {
            baseline_gain,
            baseline_offset,
            noise: if baseline_gain == 0.0 { 0 } else { 3 },
            glitch_every: Some(9),
            glitch: 250,
            ..Default::default()
        });
    }
    driver
}

fn main() -> wavecal::Result<()> {
    env_logger::init();
    let mut device = Device::new(simulated_board())?;
    let info = *device.info();
    let mut calibration = device.load_calibration()?;
    let mut config = DeviceConfiguration::new(info.units);
    for unit in config.units.iter_mut() {
        unit.baseline = BaselineMode::Calibrated { level: BASELINE_LEVEL, relative_threshold: 100 };
    }

    println!("calibrating {} units of a simulated {:?} board ({} bit)",
        info.units, info.family, info.adc_bits);
    let report = wavecal::calibrate_dc_offset(&mut device, info.unit_mask(),
                                              &mut config, &mut calibration)?;

    println!("calibration:");
    for fit in report.fits.iter() {
        let [y1, y2] = fit.baselines;
        match fit.model {
            Some(model) =>
                println!("  {:<10} baseline {:6.2}% .. {:6.2}%  gain {:+.5}  offset {:+.5}",
                    fit.unit.to_string(), y1, y2, model.gain, model.offset),
            None =>
                println!("  {:<10} baseline {:6.2}% .. {:6.2}%  invalid, left uncalibrated",
                    fit.unit.to_string(), y1, y2),
        }
    }

    println!("DC offsets for a {}% baseline:", BASELINE_LEVEL);
    for unit in info.units() {
        let mode = if config.units[unit.index].baseline.is_calibrated() { "calibrated" }
                   else { "legacy" };
        println!("  {:<10} DAC code {:#06x} ({})",
            unit.to_string(), device.dc_offset(unit)?.code(), mode);
    }
    Ok(())
}
