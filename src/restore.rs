//! Settings read back from the board before a calibration or threshold run, and the guard that
//! writes them back however the run ends.

use std::ops::{Deref, DerefMut};

use crate::Result;
use crate::sys::Driver;
use crate::config::{AcquisitionMode, TriggerMode};
use crate::params::{DacCode, TunableUnit, UnitMask};
use crate::device::Device;

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    max_events_per_block: Option<u32>,
    post_trigger: Option<u32>,
    acquisition_mode: Option<AcquisitionMode>,
    ext_trigger: Option<TriggerMode>,
    enable_mask: Option<UnitMask>,
    decimation: Option<u32>,
    self_trigger: Vec<(TunableUnit, TriggerMode)>,
    thresholds: Vec<(TunableUnit, u16)>,
    dc_offsets: Vec<(TunableUnit, DacCode)>,
}

impl Snapshot {
    /// Everything the DC offset calibration disturbs.
    pub fn acquisition_settings<D: Driver>(device: &Device<D>) -> Result<Snapshot> {
        let units = device.info().units().collect::<Vec<_>>();
        Ok(Snapshot {
            max_events_per_block: Some(device.max_events_per_block()?),
            post_trigger: Some(device.post_trigger()?),
            acquisition_mode: Some(device.acquisition_mode()?),
            ext_trigger: Some(device.ext_trigger()?),
            enable_mask: Some(device.enable_mask()?),
            decimation: device.decimation()?,
            self_trigger: units.iter()
                .map(|&unit| Ok((unit, device.self_trigger(unit)?)))
                .collect::<Result<_>>()?,
            thresholds: units.iter()
                .map(|&unit| Ok((unit, device.threshold(unit)?)))
                .collect::<Result<_>>()?,
            dc_offsets: units.iter()
                .map(|&unit| Ok((unit, device.dc_offset(unit)?)))
                .collect::<Result<_>>()?,
        })
    }

    /// Only the post-trigger size, which threshold resolution changes temporarily.
    pub fn post_trigger<D: Driver>(device: &Device<D>) -> Result<Snapshot> {
        Ok(Snapshot {
            post_trigger: Some(device.post_trigger()?),
            ..Default::default()
        })
    }

    /// Stops acquisition, drops pending data and writes back every saved setting. Failures are
    /// logged and do not stop the remaining settings from being restored.
    pub fn restore<D: Driver>(&self, device: &mut Device<D>) {
        fn report(what: &str, result: Result<()>) {
            if let Err(error) = result {
                log::error!("failed to restore {}: {}", what, error);
            }
        }

        if device.is_running() {
            report("acquisition state", device.stop_acquisition());
        }
        report("readout buffer", device.clear_data());
        if let Some(events) = self.max_events_per_block {
            report("max events per block", device.set_max_events_per_block(events));
        }
        if let Some(percent) = self.post_trigger {
            report("post-trigger size", device.set_post_trigger(percent));
        }
        if let Some(mode) = self.acquisition_mode {
            report("acquisition mode", device.set_acquisition_mode(mode));
        }
        if let Some(mode) = self.ext_trigger {
            report("external trigger mode", device.set_ext_trigger(mode));
        }
        if let Some(mask) = self.enable_mask {
            report("enable mask", device.set_enable_mask(mask));
        }
        if let Some(factor) = self.decimation {
            report("decimation", device.set_decimation(factor));
        }
        for &(unit, mode) in &self.self_trigger {
            report("self-trigger mode", device.set_self_trigger(mode, UnitMask::unit(unit.index)));
        }
        for &(unit, code) in &self.thresholds {
            report("threshold", device.set_threshold(unit, code));
        }
        for &(unit, code) in &self.dc_offsets {
            report("DC offset", device.set_dc_offset(unit, code));
        }
        log::debug!("restored board settings");
    }
}

/// Gives access to the device and restores `snapshot` when dropped.
pub struct Restore<'a, D: Driver> {
    device: &'a mut Device<D>,
    snapshot: Snapshot,
}

impl<'a, D: Driver> Restore<'a, D> {
    pub fn new(device: &'a mut Device<D>, snapshot: Snapshot) -> Restore<'a, D> {
        Restore { device, snapshot }
    }
}

impl<'a, D: Driver> Deref for Restore<'a, D> {
    type Target = Device<D>;

    fn deref(&self) -> &Device<D> {
        &*self.device
    }
}

impl<'a, D: Driver> DerefMut for Restore<'a, D> {
    fn deref_mut(&mut self) -> &mut Device<D> {
        &mut *self.device
    }
}

impl<'a, D: Driver> Drop for Restore<'a, D> {
    fn drop(&mut self) {
        self.snapshot.restore(&mut *self.device);
    }
}
