use crate::{Error, Result};
use crate::sys::Driver;
use crate::regs::board::{self, AcqControl, AcqStatus, TriggerSources};
use crate::config::{AcquisitionMode, DeviceConfiguration, Polarity, TriggerMode};
use crate::params::{BoardFamily, BoardInfo, DacCode, TunableUnit, UnitMask};
use crate::event::{Event, EventBlock};
use crate::calibration::{apply_dc_offset, CalibrationModel, DeviceCalibration};

/// An open digitizer. All hardware access of a process goes through one `Device`.
#[derive(Debug)]
pub struct Device<D: Driver> {
    driver: D,
    info: BoardInfo,
    running: bool,
}

/// Logs a failed register write and carries on; any other error is passed through.
pub(crate) fn tolerate_write_failure<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error @ Error::HardwareWrite { .. }) => {
            log::warn!("{}", error);
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

impl<D: Driver> Device<D> {
    pub fn new(driver: D) -> Result<Device<D>> {
        let mut device = Device {
            driver,
            info: BoardInfo::new(BoardFamily::X724, 0),
            running: false,
        };
        let value = device.read_user_u32(board::ADDR_BOARD_INFO)?;
        let family_code = board::board_info_family_code(value);
        let family = BoardFamily::from_code(family_code)
            .ok_or_else(|| Error::Other(format!("unknown board family code {}", family_code).into()))?;
        let units = board::board_info_units(value);
        if units > board::MAX_UNITS {
            return Err(Error::Other(
                format!("board reports {} units, at most {} are supported",
                        units, board::MAX_UNITS).into()))
        }
        device.info = BoardInfo::new(family, units);
        log::info!("opened {:?} digitizer with {} units of {} bits",
            device.info.family, device.info.units, device.info.adc_bits);
        // the board may have been left running by a previous session
        device.running = device.read_status()?.contains(AcqStatus::Run);
        Ok(device)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn info(&self) -> &BoardInfo {
        &self.info
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Fails with `AcquisitionRunning` unless acquisition is stopped.
    pub fn ensure_idle(&self) -> Result<()> {
        if self.running { Err(Error::AcquisitionRunning) } else { Ok(()) }
    }

    fn read_user_u32(&self, addr: usize) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.driver.read_user(addr, &mut bytes[..])?;
        let data = u32::from_le_bytes(bytes);
        log::trace!("read_user_u32({:#x}) = {:#x}", addr, data);
        Ok(data)
    }

    fn write_user_u32(&mut self, addr: usize, data: u32) -> Result<()> {
        log::trace!("write_user_u32({:#x}, {:#x})", addr, data);
        let bytes = u32::to_le_bytes(data);
        self.driver.write_user(addr, &bytes[..])
            .map_err(|cause| Error::HardwareWrite { addr, cause })
    }

    fn modify_user_u32<F: FnOnce(u32) -> u32>(&mut self, addr: usize, f: F) -> Result<()> {
        let value = self.read_user_u32(addr)?;
        self.write_user_u32(addr, f(value))
    }

    pub fn read_control(&self) -> Result<AcqControl> {
        let value = AcqControl::from_bits_retain(self.read_user_u32(board::ADDR_ACQ_CONTROL)?);
        log::debug!("read_control() = {:?}", value);
        Ok(value)
    }

    pub fn write_control(&mut self, value: AcqControl) -> Result<()> {
        log::debug!("write_control({:?})", value);
        self.write_user_u32(board::ADDR_ACQ_CONTROL, value.bits())
    }

    pub fn modify_control<F: FnOnce(&mut AcqControl)>(&mut self, f: F) -> Result<()> {
        let mut value = self.read_control()?;
        f(&mut value);
        self.write_control(value)
    }

    pub fn read_status(&self) -> Result<AcqStatus> {
        let value = AcqStatus::from_bits_retain(self.read_user_u32(board::ADDR_ACQ_STATUS)?);
        log::debug!("read_status() = {:?}", value);
        Ok(value)
    }

    pub fn start_acquisition(&mut self) -> Result<()> {
        log::debug!("start_acquisition()");
        self.modify_control(|val| val.insert(AcqControl::Run))?;
        self.running = true;
        Ok(())
    }

    pub fn stop_acquisition(&mut self) -> Result<()> {
        log::debug!("stop_acquisition()");
        self.modify_control(|val| val.remove(AcqControl::Run))?;
        self.running = false;
        Ok(())
    }

    /// Drops every event waiting in the readout buffer.
    pub fn clear_data(&mut self) -> Result<()> {
        log::debug!("clear_data()");
        self.write_user_u32(board::ADDR_SW_CLEAR, 1)
    }

    pub fn acquisition_mode(&self) -> Result<AcquisitionMode> {
        Ok(AcquisitionMode::from_register_code(self.read_control()?.mode_bits()))
    }

    pub fn set_acquisition_mode(&mut self, mode: AcquisitionMode) -> Result<()> {
        log::debug!("set_acquisition_mode({:?})", mode);
        self.modify_control(|val| *val = val.with_mode_bits(mode.register_code()))
    }

    fn read_trigger_masks(&self) -> Result<(TriggerSources, TriggerSources)> {
        let acquire = self.read_user_u32(board::ADDR_GLOBAL_TRIGGER_MASK)?;
        let propagate = self.read_user_u32(board::ADDR_TRIGGER_OUT_MASK)?;
        Ok((TriggerSources::from_bits_retain(acquire), TriggerSources::from_bits_retain(propagate)))
    }

    fn modify_trigger_masks(&mut self, sources: TriggerSources, mode: TriggerMode) -> Result<()> {
        self.modify_user_u32(board::ADDR_GLOBAL_TRIGGER_MASK, |val| {
            let mut val = TriggerSources::from_bits_retain(val);
            val.set(sources, mode.acquires());
            val.bits()
        })?;
        self.modify_user_u32(board::ADDR_TRIGGER_OUT_MASK, |val| {
            let mut val = TriggerSources::from_bits_retain(val);
            val.set(sources, mode.propagates());
            val.bits()
        })
    }

    pub fn ext_trigger(&self) -> Result<TriggerMode> {
        let (acquire, propagate) = self.read_trigger_masks()?;
        Ok(TriggerMode::from_flags(acquire.contains(TriggerSources::External),
                                   propagate.contains(TriggerSources::External)))
    }

    pub fn set_ext_trigger(&mut self, mode: TriggerMode) -> Result<()> {
        log::debug!("set_ext_trigger({:?})", mode);
        self.modify_trigger_masks(TriggerSources::External, mode)
    }

    pub fn self_trigger(&self, unit: TunableUnit) -> Result<TriggerMode> {
        let (acquire, propagate) = self.read_trigger_masks()?;
        let source = TriggerSources::unit(unit.index);
        Ok(TriggerMode::from_flags(acquire.contains(source), propagate.contains(source)))
    }

    /// Sets the self-trigger mode of every unit in `mask`.
    pub fn set_self_trigger(&mut self, mode: TriggerMode, mask: UnitMask) -> Result<()> {
        log::debug!("set_self_trigger({:?}, {:#x})", mode, mask.bits());
        let sources = TriggerSources::from_bits_retain(mask.bits() & TriggerSources::UNIT_MASK);
        self.modify_trigger_masks(sources, mode)
    }

    pub fn enable_mask(&self) -> Result<UnitMask> {
        Ok(UnitMask::from_bits_retain(self.read_user_u32(board::ADDR_UNIT_ENABLE_MASK)?))
    }

    pub fn set_enable_mask(&mut self, mask: UnitMask) -> Result<()> {
        log::debug!("set_enable_mask({:#x})", mask.bits());
        self.write_user_u32(board::ADDR_UNIT_ENABLE_MASK, (mask & self.info.unit_mask()).bits())
    }

    pub fn dc_offset(&self, unit: TunableUnit) -> Result<DacCode> {
        let addr = board::unit_register(board::ADDR_UNIT_DC_OFFSET, unit.index);
        Ok(DacCode::from_code(self.read_user_u32(addr)? as u16))
    }

    pub fn set_dc_offset(&mut self, unit: TunableUnit, code: DacCode) -> Result<()> {
        log::debug!("set_dc_offset({}, {:#06x})", unit, code.code());
        let addr = board::unit_register(board::ADDR_UNIT_DC_OFFSET, unit.index);
        self.write_user_u32(addr, code.code() as u32)
    }

    pub fn threshold(&self, unit: TunableUnit) -> Result<u16> {
        let addr = board::unit_register(board::ADDR_UNIT_THRESHOLD, unit.index);
        Ok(self.read_user_u32(addr)? as u16)
    }

    pub fn set_threshold(&mut self, unit: TunableUnit, code: u16) -> Result<()> {
        log::debug!("set_threshold({}, {})", unit, code);
        let addr = board::unit_register(board::ADDR_UNIT_THRESHOLD, unit.index);
        self.write_user_u32(addr, code as u32)
    }

    pub fn polarity(&self, unit: TunableUnit) -> Result<Polarity> {
        let addr = board::unit_register(board::ADDR_UNIT_POLARITY, unit.index);
        Ok(Polarity::from_register_code(self.read_user_u32(addr)?))
    }

    pub fn set_polarity(&mut self, unit: TunableUnit, polarity: Polarity) -> Result<()> {
        log::debug!("set_polarity({}, {:?})", unit, polarity);
        let addr = board::unit_register(board::ADDR_UNIT_POLARITY, unit.index);
        self.write_user_u32(addr, polarity.register_code())
    }

    pub fn post_trigger(&self) -> Result<u32> {
        self.read_user_u32(board::ADDR_POST_TRIGGER)
    }

    pub fn set_post_trigger(&mut self, percent: u32) -> Result<()> {
        log::debug!("set_post_trigger({})", percent);
        self.write_user_u32(board::ADDR_POST_TRIGGER, percent.min(100))
    }

    pub fn record_length(&self) -> Result<u32> {
        self.read_user_u32(board::ADDR_RECORD_LENGTH)
    }

    pub fn set_record_length(&mut self, samples: u32) -> Result<()> {
        log::debug!("set_record_length({})", samples);
        // samples are packed two per word
        self.write_user_u32(board::ADDR_RECORD_LENGTH, samples.next_multiple_of(2))
    }

    pub fn max_events_per_block(&self) -> Result<u32> {
        self.read_user_u32(board::ADDR_MAX_EVENTS_BLT)
    }

    pub fn set_max_events_per_block(&mut self, events: u32) -> Result<()> {
        log::debug!("set_max_events_per_block({})", events);
        self.write_user_u32(board::ADDR_MAX_EVENTS_BLT, events)
    }

    /// Returns `None` on families without a decimation register.
    pub fn decimation(&self) -> Result<Option<u32>> {
        if !self.info.family.has_decimation() {
            return Ok(None)
        }
        Ok(Some(self.read_user_u32(board::ADDR_DECIMATION)?))
    }

    /// Does nothing on families without a decimation register.
    pub fn set_decimation(&mut self, factor: u32) -> Result<()> {
        if !self.info.family.has_decimation() {
            return Ok(())
        }
        log::debug!("set_decimation({})", factor);
        self.write_user_u32(board::ADDR_DECIMATION, factor)
    }

    pub fn software_trigger(&mut self) -> Result<()> {
        log::debug!("software_trigger()");
        self.write_user_u32(board::ADDR_SW_TRIGGER, 1)
    }

    /// Reads the next event from the board, or an empty block if none is ready.
    pub fn read_event_block(&mut self) -> Result<EventBlock> {
        let status = self.read_status().map_err(into_readout)?;
        if !status.contains(AcqStatus::EventReady) {
            return Ok(EventBlock::default())
        }
        let size = self.read_user_u32(board::ADDR_EVENT_SIZE).map_err(into_readout)? as usize;
        let mut block = EventBlock::zeroed(size)?;
        self.driver.read_dma(board::ADDR_EVENT_BUFFER, block.as_bytes_mut())
            .map_err(Error::Readout)?;
        log::debug!("read_event_block() = {} words", block.len());
        Ok(block)
    }

    pub fn decode_event(&self, block: &EventBlock) -> Result<Event> {
        Ok(Event::decode(block, &self.info)?)
    }

    /// Writes every unit's model to the calibration page of board flash.
    pub fn persist_calibration(&mut self, calibration: &DeviceCalibration) -> Result<()> {
        for (index, model) in calibration.units.iter().enumerate().take(self.info.units) {
            let slot = board::flash_cal_slot(index);
            let gain = model.gain.to_bits();
            let offset = model.offset.to_bits();
            self.write_user_u32(slot + 0x00, board::FLASH_CAL_MARKER)?;
            self.write_user_u32(slot + 0x04, gain as u32)?;
            self.write_user_u32(slot + 0x08, (gain >> 32) as u32)?;
            self.write_user_u32(slot + 0x0c, offset as u32)?;
            self.write_user_u32(slot + 0x10, (offset >> 32) as u32)?;
        }
        self.write_user_u32(board::ADDR_FLASH_COMMIT, 1)?;
        log::info!("saved DAC calibration of {} units to flash", self.info.units);
        Ok(())
    }

    /// Reads the calibration page of board flash. Units without a valid record get
    /// the identity model.
    pub fn load_calibration(&self) -> Result<DeviceCalibration> {
        let mut calibration = DeviceCalibration::identity(self.info.units);
        for unit in self.info.units() {
            let slot = board::flash_cal_slot(unit.index);
            if self.read_user_u32(slot)? != board::FLASH_CAL_MARKER {
                log::debug!("no DAC calibration stored for {}", unit);
                continue
            }
            let read_f64 = |addr: usize| -> Result<f64> {
                let low = self.read_user_u32(addr)? as u64;
                let high = self.read_user_u32(addr + 4)? as u64;
                Ok(f64::from_bits(high << 32 | low))
            };
            let model = CalibrationModel {
                gain: read_f64(slot + 0x04)?,
                offset: read_f64(slot + 0x0c)?,
            };
            if model.is_valid() {
                calibration.units[unit.index] = model;
            } else {
                log::warn!("ignoring invalid DAC calibration stored for {}: {:?}", unit, model);
            }
        }
        Ok(calibration)
    }

    /// Programs the board from `config`, converting calibrated baseline requests to DAC codes
    /// with `calibration`.
    pub fn configure(&mut self, config: &DeviceConfiguration, calibration: &DeviceCalibration)
            -> Result<()> {
        self.ensure_idle()?;
        self.set_record_length(config.record_length)?;
        self.set_post_trigger(config.post_trigger)?;
        self.set_max_events_per_block(config.max_events_per_block)?;
        self.set_acquisition_mode(config.acquisition_mode)?;
        self.set_ext_trigger(config.ext_trigger)?;
        self.set_decimation(config.decimation)?;
        self.set_enable_mask(config.enable_mask())?;
        for unit in self.info.units().collect::<Vec<_>>() {
            let Some(unit_config) = config.units.get(unit.index).filter(|cfg| cfg.enabled)
                else { continue };
            let model = calibration.unit(unit);
            tolerate_write_failure(apply_dc_offset(self, unit, unit_config, &model))?;
            self.set_self_trigger(unit_config.self_trigger, UnitMask::unit(unit.index))?;
            self.set_threshold(unit, unit_config.threshold)?;
            self.set_polarity(unit, unit_config.polarity)?;
        }
        Ok(())
    }
}

fn into_readout(error: Error) -> Error {
    match error {
        Error::Io(cause) => Error::Readout(cause),
        error => error,
    }
}
