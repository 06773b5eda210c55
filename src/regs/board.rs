//! Register map of the digitizer board.
//!
//! Per-unit registers repeat every `UNIT_STRIDE` bytes; on grouped boards the unit is a group of
//! eight channels, otherwise a single channel.

#![allow(dead_code)]

use bitflags::bitflags;

pub const UNIT_STRIDE: usize = 0x100;

/// Unit Trigger Threshold
pub const ADDR_UNIT_THRESHOLD: usize = 0x1080;

/// Unit DC Offset
pub const ADDR_UNIT_DC_OFFSET: usize = 0x1098;

/// Unit Trigger Polarity
pub const ADDR_UNIT_POLARITY: usize = 0x10a8;

pub fn unit_register(base: usize, index: usize) -> usize {
    base + index * UNIT_STRIDE
}

/// Record Length (in samples)
pub const ADDR_RECORD_LENGTH: usize = 0x8020;

/// Decimation Factor (only on families that expose it)
pub const ADDR_DECIMATION: usize = 0x8044;

/// Acquisition Control
pub const ADDR_ACQ_CONTROL: usize = 0x8100;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AcqControl: u32 {
        const Mode0 = 1<<0;
        const Mode1 = 1<<1;
        const Run   = 1<<2;
    }
}

impl AcqControl {
    pub const MODE_MASK: u32 = 0b11;

    pub fn mode_bits(self) -> u32 {
        self.bits() & Self::MODE_MASK
    }

    pub fn with_mode_bits(self, mode: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::MODE_MASK) | (mode & Self::MODE_MASK))
    }
}

/// Acquisition Status
pub const ADDR_ACQ_STATUS: usize = 0x8104;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AcqStatus: u32 {
        const Run        = 1<<2;
        const EventReady = 1<<3;
        const EventFull  = 1<<4;
        const BoardReady = 1<<8;
    }
}

/// Software Trigger (write any value)
pub const ADDR_SW_TRIGGER: usize = 0x8108;

/// Global Trigger Mask: which sources make the board acquire.
pub const ADDR_GLOBAL_TRIGGER_MASK: usize = 0x810c;

/// Front Panel Trigger-Out Enable Mask: which sources are propagated to TRG-OUT.
pub const ADDR_TRIGGER_OUT_MASK: usize = 0x8110;

bitflags! {
    /// Layout shared by both trigger mask registers. Bits 0..=15 select units.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TriggerSources: u32 {
        const External = 1<<30;
        const Software = 1<<31;

        const _ = 0xffff;
    }
}

/// Units addressable through the trigger source and enable masks.
pub const MAX_UNITS: usize = 16;

impl TriggerSources {
    pub const UNIT_MASK: u32 = 0xffff;

    pub fn unit(index: usize) -> Self {
        debug_assert!(index < 16);
        Self::from_bits_retain(1 << index)
    }
}

/// Post Trigger (in percent of the record length)
pub const ADDR_POST_TRIGGER: usize = 0x8114;

/// Unit Enable Mask
pub const ADDR_UNIT_ENABLE_MASK: usize = 0x8120;

/// Board Info
pub const ADDR_BOARD_INFO: usize = 0x8140;

pub fn board_info_family_code(value: u32) -> u8 {
    (value >> 0) as u8
}

pub fn board_info_units(value: u32) -> usize {
    ((value >> 16) & 0xff) as usize
}

/// Event Size (in 32-bit words) of the next event in the output buffer
pub const ADDR_EVENT_SIZE: usize = 0x814c;

/// Max Number of Events per Block Transfer
pub const ADDR_MAX_EVENTS_BLT: usize = 0xef1c;

/// Software Clear (write any value)
pub const ADDR_SW_CLEAR: usize = 0xef28;

/// Event Readout Buffer; read with block transfers only.
pub const ADDR_EVENT_BUFFER: usize = 0x0000;

/// Calibration page in board flash. Each unit takes one `FLASH_CAL_STRIDE` slot holding
/// the marker word followed by gain and offset as little-endian `f64` word pairs.
pub const ADDR_FLASH_CAL_PAGE: usize = 0xf800;

pub const FLASH_CAL_STRIDE: usize = 0x20;

pub const FLASH_CAL_MARKER: u32 = 0xdac0_ca11;

/// Flash Commit (write any value to program the calibration page)
pub const ADDR_FLASH_COMMIT: usize = 0xf7fc;

pub fn flash_cal_slot(index: usize) -> usize {
    ADDR_FLASH_CAL_PAGE + index * FLASH_CAL_STRIDE
}

pub fn is_flash_cal(addr: usize) -> bool {
    (ADDR_FLASH_CAL_PAGE..ADDR_FLASH_CAL_PAGE + MAX_UNITS * FLASH_CAL_STRIDE).contains(&addr)
}
