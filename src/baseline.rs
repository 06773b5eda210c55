//! Robust estimation of a baseline from repeated observations.

use crate::InvalidPoint;

/// Observations further than this many counts from the mode are treated as outliers.
pub const BASELINE_TOLERANCE: u32 = 5;

/// Estimates the baseline from `observations` (in ADC counts) and returns it in percent of
/// `code_range`.
///
/// The mode of the observations that fall inside the code range is found first, the earliest
/// observation winning ties. The result is the mean of the observations within
/// `BASELINE_TOLERANCE` of the mode, which rejects glitches that a plain mean would follow.
pub fn estimate_baseline(observations: &[u32], code_range: u32)
        -> core::result::Result<f64, InvalidPoint> {
    let mut histogram = vec![0u32; code_range as usize];
    for &value in observations.iter().filter(|&&value| value < code_range) {
        histogram[value as usize] += 1;
    }

    let mut mode = None;
    for &value in observations.iter().filter(|&&value| value < code_range) {
        match mode {
            Some(best) if histogram[best as usize] >= histogram[value as usize] => (),
            _ => mode = Some(value),
        }
    }
    let mode = mode.ok_or(InvalidPoint::NoSamples { unit: None })?;

    let (sum, count) = observations.iter()
        .filter(|&&value| value < code_range && value.abs_diff(mode) <= BASELINE_TOLERANCE)
        .fold((0u64, 0u64), |(sum, count), &value| (sum + value as u64, count + 1));
    let mean = sum as f64 / count as f64;
    log::trace!("estimate_baseline: mode {}, {} of {} observations in band, mean {}",
        mode, count, observations.len(), mean);
    Ok(mean * 100.0 / code_range as f64)
}
