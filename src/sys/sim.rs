//! Register-level model of a digitizer.
//!
//! Each unit produces a baseline that follows its DC offset DAC through a linear front end
//! (`offset + gain * level`, in percent of full scale), plus uniform noise. When acquisition
//! starts, units with self-trigger enabled run their waveform through a discriminator at the
//! programmed threshold; the ones that fire contribute a record with a pulse to one event.
//! Software triggers record every enabled unit without a pulse.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::ops::Range;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::sys::Driver;
use crate::regs::board::{self, AcqControl, AcqStatus, TriggerSources};
use crate::params::{BoardFamily, BoardInfo, DacCode};
use crate::config::Polarity;
use crate::event::encode_event;
use crate::trigger::Discriminator;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedUnit {
    pub baseline_gain: f64,
    /// In percent of full scale.
    pub baseline_offset: f64,
    /// Samples deviate from the baseline by up to this many counts either way.
    pub noise: u16,
    /// Height of the pulse seen by the self-trigger, in counts, in the direction of the polarity.
    pub pulse: u16,
    /// Every n-th event shifts this unit's whole record by `glitch` counts.
    pub glitch_every: Option<u32>,
    pub glitch: i32,
    /// The unit never produces samples.
    pub silent: bool,
}

impl Default for SimulatedUnit {
    fn default() -> Self {
        SimulatedUnit {
            baseline_gain: 1.0,
            baseline_offset: 0.0,
            noise: 2,
            pulse: 2000,
            glitch_every: None,
            glitch: 0,
            silent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Faults {
    /// Writes to this register fail.
    pub fail_write: Option<usize>,
    /// Block transfers fail.
    pub fail_readout: bool,
    /// Events come out with a damaged header.
    pub corrupt_events: bool,
}

#[derive(Debug)]
struct State {
    registers: HashMap<usize, u32>,
    units: Vec<SimulatedUnit>,
    events: VecDeque<Vec<u32>>,
    /// Calibration page writes waiting for a flash commit.
    flash_pending: HashMap<usize, u32>,
    faults: Faults,
    rng: StdRng,
    counter: u32,
    writes: Vec<(usize, u32)>,
}

impl State {
    fn register(&self, addr: usize) -> u32 {
        self.registers.get(&addr).copied().unwrap_or(0)
    }

    fn running(&self) -> bool {
        AcqControl::from_bits_retain(self.register(board::ADDR_ACQ_CONTROL))
            .contains(AcqControl::Run)
    }

    fn record_length(&self) -> usize {
        (self.register(board::ADDR_RECORD_LENGTH) as usize).max(2).next_multiple_of(2)
    }

    fn polarity(&self, index: usize) -> Polarity {
        Polarity::from_register_code(
            self.register(board::unit_register(board::ADDR_UNIT_POLARITY, index)))
    }

    /// Units that are enabled and produce samples.
    fn live_units(&self, info: &BoardInfo) -> Vec<usize> {
        let enabled = self.register(board::ADDR_UNIT_ENABLE_MASK);
        (0..info.units)
            .filter(|&index| enabled & (1 << index) != 0 && !self.units[index].silent)
            .collect()
    }

    fn baseline(&self, info: &BoardInfo, index: usize) -> f64 {
        let unit = &self.units[index];
        let dac = DacCode::from_code(
            self.register(board::unit_register(board::ADDR_UNIT_DC_OFFSET, index)) as u16);
        let level = 100.0 - dac.percent();
        info.code_range() as f64 * (unit.baseline_offset + unit.baseline_gain * level) / 100.0
    }

    fn waveform(&mut self, info: &BoardInfo, index: usize, length: usize, pulse: Range<usize>)
            -> Vec<u16> {
        let unit = self.units[index];
        let polarity = self.polarity(index);
        let mut baseline = self.baseline(info, index).round() as i64;
        if let Some(every) = unit.glitch_every.filter(|&every| every > 0) {
            if self.counter % every == every - 1 {
                baseline += unit.glitch as i64;
            }
        }
        let top = info.code_range() as i64 - 1;
        let noise = unit.noise as i64;
        let rng = &mut self.rng;
        (0..length)
            .map(|position| {
                let mut level = baseline;
                if noise > 0 {
                    level += rng.gen_range(-noise..=noise);
                }
                if pulse.contains(&position) {
                    level = polarity.offset(level, unit.pulse as i64);
                }
                level.clamp(0, top) as u16
            })
            .collect()
    }

    fn push_event(&mut self, info: &BoardInfo, records: Vec<(usize, Vec<u16>)>) {
        let kind = info.family.unit_kind();
        let records = records.into_iter()
            .map(|(index, record)| (index, vec![record; kind.channels()]))
            .collect::<Vec<_>>();
        let mut words = encode_event(self.counter, self.counter.wrapping_mul(1000), kind, &records);
        if self.faults.corrupt_events {
            words[0] = 0xB << 28 | (words[0] & 0x0fff_ffff);
        }
        log::trace!("sim: event {} with units {:?}", self.counter,
            records.iter().map(|(index, _)| *index).collect::<Vec<_>>());
        self.events.push_back(words);
        self.counter = self.counter.wrapping_add(1);
    }

    fn software_trigger(&mut self, info: &BoardInfo) {
        if !self.running() {
            return
        }
        let length = self.record_length();
        let records = self.live_units(info).into_iter()
            .map(|index| (index, self.waveform(info, index, length, 0..0)))
            .collect();
        self.push_event(info, records);
    }

    fn self_trigger(&mut self, info: &BoardInfo) {
        let armed = self.register(board::ADDR_GLOBAL_TRIGGER_MASK) & TriggerSources::UNIT_MASK;
        let length = self.record_length();
        let pre_trigger = length * (100 - self.register(board::ADDR_POST_TRIGGER).min(100) as usize)
            / 100;
        let pulse = length..length + (length / 8).max(1);
        let mut records = Vec::new();
        for index in self.live_units(info) {
            if armed & (1 << index) == 0 {
                continue
            }
            let threshold = self.register(board::unit_register(board::ADDR_UNIT_THRESHOLD, index))
                .min(i16::MAX as u32) as i16;
            let stream = self.waveform(info, index, 3 * length, pulse.clone());
            let samples = stream.iter().map(|&sample| sample as i16).collect::<Vec<_>>();
            let mut discriminator = Discriminator::new(threshold, 0, self.polarity(index));
            if let Some(fired) = discriminator.find(&samples) {
                let start = fired.saturating_sub(pre_trigger).min(2 * length);
                records.push((index, stream[start..start + length].to_vec()));
            }
        }
        if !records.is_empty() {
            self.push_event(info, records);
        }
    }
}

/// A digitizer that exists only in memory.
#[derive(Debug)]
pub struct SimulatedDriver {
    info: BoardInfo,
    state: RefCell<State>,
}

impl SimulatedDriver {
    pub fn new(family: BoardFamily, units: usize) -> SimulatedDriver {
        let info = BoardInfo::new(family, units);
        let mut registers = HashMap::new();
        registers.insert(board::ADDR_RECORD_LENGTH, 1024);
        registers.insert(board::ADDR_POST_TRIGGER, 50);
        registers.insert(board::ADDR_MAX_EVENTS_BLT, 1);
        registers.insert(board::ADDR_UNIT_ENABLE_MASK, info.unit_mask().bits());
        registers.insert(board::ADDR_GLOBAL_TRIGGER_MASK, TriggerSources::Software.bits());
        if family.has_decimation() {
            registers.insert(board::ADDR_DECIMATION, 1);
        }
        for index in 0..units {
            registers.insert(board::unit_register(board::ADDR_UNIT_DC_OFFSET, index),
                             DacCode::MID.code() as u32);
        }
        SimulatedDriver {
            info,
            state: RefCell::new(State {
                registers,
                units: vec![SimulatedUnit::default(); units],
                events: VecDeque::new(),
                flash_pending: HashMap::new(),
                faults: Faults::default(),
                rng: StdRng::seed_from_u64(0x5eed),
                counter: 0,
                writes: Vec::new(),
            }),
        }
    }

    pub fn with_seed(self, seed: u64) -> SimulatedDriver {
        self.state.borrow_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_unit(self, index: usize, unit: SimulatedUnit) -> SimulatedDriver {
        self.set_unit(index, unit);
        self
    }

    pub fn info(&self) -> &BoardInfo {
        &self.info
    }

    pub fn unit(&self, index: usize) -> SimulatedUnit {
        self.state.borrow().units[index]
    }

    pub fn set_unit(&self, index: usize, unit: SimulatedUnit) {
        self.state.borrow_mut().units[index] = unit;
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.borrow_mut().faults = faults;
    }

    /// Current value of a register, without the side effects of a read.
    pub fn register(&self, addr: usize) -> u32 {
        self.state.borrow().register(addr)
    }

    /// Every successful register write so far, in order.
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.borrow().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.borrow_mut().writes.clear();
    }

    pub fn pending_events(&self) -> usize {
        self.state.borrow().events.len()
    }
}

fn invalid_width(len: usize) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput,
        format!("register access must be 4 bytes wide, not {}", len))
}

impl Driver for SimulatedDriver {
    fn read_user(&self, addr: usize, data: &mut [u8]) -> io::Result<()> {
        if data.len() != 4 {
            return Err(invalid_width(data.len()))
        }
        let state = self.state.borrow();
        let value = match addr {
            board::ADDR_BOARD_INFO =>
                self.info.family.code() as u32 | (self.info.units as u32 & 0xff) << 16,
            board::ADDR_ACQ_STATUS => {
                let mut status = AcqStatus::BoardReady;
                status.set(AcqStatus::Run, state.running());
                status.set(AcqStatus::EventReady, !state.events.is_empty());
                status.bits()
            }
            board::ADDR_EVENT_SIZE =>
                state.events.front().map(|words| words.len() as u32).unwrap_or(0),
            _ => state.register(addr),
        };
        data.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn write_user(&self, addr: usize, data: &[u8]) -> io::Result<()> {
        let bytes: [u8; 4] = data.try_into().map_err(|_| invalid_width(data.len()))?;
        let value = u32::from_le_bytes(bytes);
        let mut state = self.state.borrow_mut();
        if state.faults.fail_write == Some(addr) {
            return Err(io::Error::other(format!("write to {:#06x} was not acknowledged", addr)))
        }
        state.writes.push((addr, value));
        match addr {
            board::ADDR_SW_CLEAR =>
                state.events.clear(),
            board::ADDR_SW_TRIGGER =>
                state.software_trigger(&self.info),
            board::ADDR_FLASH_COMMIT => {
                let pending = std::mem::take(&mut state.flash_pending);
                log::debug!("sim: committing {} flash calibration words", pending.len());
                state.registers.extend(pending);
            }
            addr if board::is_flash_cal(addr) => {
                state.flash_pending.insert(addr, value);
            }
            board::ADDR_ACQ_CONTROL => {
                let was_running = state.running();
                state.registers.insert(addr, value);
                if !was_running && state.running() {
                    state.self_trigger(&self.info);
                }
            }
            _ => {
                state.registers.insert(addr, value);
            }
        }
        Ok(())
    }

    fn read_dma(&self, _addr: usize, data: &mut [u8]) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.faults.fail_readout {
            return Err(io::Error::other("block transfer timed out"))
        }
        let Some(words) = state.events.pop_front() else {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no event in the output buffer"))
        };
        let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
        if bytes.len() != data.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput,
                format!("transfer of {} bytes does not match event of {} bytes",
                        data.len(), bytes.len())))
        }
        data.copy_from_slice(bytes);
        Ok(())
    }
}
