//! Event blocks as read from the board, and their decoding into per-unit sample views.
//!
//! An event starts with a four word header:
//!
//! ```text
//! word 0: [31:28] 0xA          [27:0] event size in words, header included
//! word 1: [31:16] reserved     [15:0] mask of units present in the event
//! word 2: [31:24] reserved     [23:0] event counter
//! word 3: trigger time tag
//! ```
//!
//! It is followed by one equally sized payload per present unit, in ascending unit order. Each
//! payload word holds two samples, the earlier one in the low half. A group payload holds the
//! records of its eight channels back to back.

use crate::{DecodeError, Result};
use crate::params::{BoardInfo, TunableUnit, UnitKind, UnitMask};

const HEADER_WORDS: usize = 4;
const HEADER_TAG: u32 = 0xA;
const SIZE_MASK: u32 = 0x0fff_ffff;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBlock {
    words: Vec<u32>,
}

impl EventBlock {
    /// Allocates a zeroed block, reporting allocation failure instead of aborting.
    pub fn zeroed(words: usize) -> Result<EventBlock> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(words)?;
        buffer.resize(words, 0);
        Ok(EventBlock { words: buffer })
    }

    pub fn from_words(words: Vec<u32>) -> EventBlock {
        EventBlock { words }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words[..])
    }
}

/// One decoded event. Units absent from the event have no samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub counter: u32,
    pub time_tag: u32,
    pub unit_mask: UnitMask,
    samples: Vec<Vec<u16>>,
}

impl Event {
    /// Decodes the first event of `block`.
    pub fn decode(block: &EventBlock, info: &BoardInfo) -> core::result::Result<Event, DecodeError> {
        let words = block.words();
        if words.len() < HEADER_WORDS {
            return Err(DecodeError::Truncated { words: words.len() })
        }
        if words[0] >> 28 != HEADER_TAG {
            return Err(DecodeError::BadHeader { word: words[0] })
        }
        let size = (words[0] & SIZE_MASK) as usize;
        if size < HEADER_WORDS || size > words.len() {
            return Err(DecodeError::SizeMismatch { header: size, block: words.len() })
        }
        let unit_mask = UnitMask::from_bits_retain(words[1] & 0xffff);
        if unit_mask.units().any(|index| index >= info.units) {
            return Err(DecodeError::UnknownUnits { mask: unit_mask.bits() })
        }

        let payload = &words[HEADER_WORDS..size];
        let present = unit_mask.bits().count_ones() as usize;
        let unit_words = match present {
            0 if payload.is_empty() => 0,
            0 => return Err(DecodeError::UnevenPayload { words: payload.len(), units: 0 }),
            _ => payload.len() / present,
        };
        let channels = info.family.unit_kind().channels();
        if unit_words * present != payload.len() || unit_words % channels != 0 {
            return Err(DecodeError::UnevenPayload { words: payload.len(), units: present })
        }
        let channel_words = unit_words / channels;

        let code_mask = (info.code_range() - 1) as u16;
        let mut samples = vec![Vec::new(); info.units];
        for (chunk, index) in payload.chunks(unit_words.max(1)).zip(unit_mask.units()) {
            // Only the representative channel (the first one of a group) is kept.
            samples[index] = chunk[..channel_words].iter()
                .flat_map(|&word| [word as u16, (word >> 16) as u16])
                .map(|sample| sample & code_mask)
                .collect();
        }

        Ok(Event {
            counter: words[2] & 0x00ff_ffff,
            time_tag: words[3],
            unit_mask,
            samples,
        })
    }

    pub fn samples(&self, unit: TunableUnit) -> &[u16] {
        self.samples.get(unit.index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_samples(&self, unit: TunableUnit) -> bool {
        !self.samples(unit).is_empty()
    }
}

/// Builds the words of one event. `records` lists present units in ascending order, each with
/// one record per channel of the unit; every record must have the same even length.
pub(crate) fn encode_event(counter: u32, time_tag: u32, kind: UnitKind,
                           records: &[(usize, Vec<Vec<u16>>)]) -> Vec<u32> {
    let mut words = vec![0; HEADER_WORDS];
    let mut unit_mask = 0u32;
    for (index, channels) in records {
        debug_assert_eq!(channels.len(), kind.channels());
        unit_mask |= 1 << index;
        for record in channels {
            debug_assert!(record.len() % 2 == 0);
            words.extend(record.chunks(2)
                .map(|pair| pair[0] as u32 | (pair[1] as u32) << 16));
        }
    }
    words[0] = HEADER_TAG << 28 | (words.len() as u32 & SIZE_MASK);
    words[1] = unit_mask;
    words[2] = counter & 0x00ff_ffff;
    words[3] = time_tag;
    words
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::BoardFamily;

    fn channel_board() -> BoardInfo {
        BoardInfo::new(BoardFamily::X730, 4)
    }

    #[test]
    fn test_decode_present_units() {
        let info = channel_board();
        let words = encode_event(7, 1234, UnitKind::Channel, &[
            (1, vec![vec![100, 101, 102, 103]]),
            (3, vec![vec![900, 901, 902, 903]]),
        ]);
        let event = Event::decode(&EventBlock::from_words(words), &info).unwrap();
        assert_eq!(event.counter, 7);
        assert_eq!(event.time_tag, 1234);
        assert_eq!(event.unit_mask.bits(), 0b1010);
        assert_eq!(event.samples(info.unit(0)), &[] as &[u16]);
        assert_eq!(event.samples(info.unit(1)), &[100, 101, 102, 103]);
        assert!(!event.has_samples(info.unit(2)));
        assert_eq!(event.samples(info.unit(3)), &[900, 901, 902, 903]);
    }

    #[test]
    fn test_decode_group_keeps_first_channel() {
        let info = BoardInfo::new(BoardFamily::X740, 2);
        let group = (0..8).map(|channel| vec![channel * 10, channel * 10 + 1]).collect();
        let words = encode_event(0, 0, UnitKind::Group, &[(1, group)]);
        let event = Event::decode(&EventBlock::from_words(words), &info).unwrap();
        assert_eq!(event.samples(info.unit(1)), &[0, 1]);
        assert!(!event.has_samples(info.unit(0)));
    }

    #[test]
    fn test_decode_masks_to_adc_range() {
        let info = channel_board();
        let words = encode_event(0, 0, UnitKind::Channel, &[(0, vec![vec![0xffff, 0x4001]])]);
        let event = Event::decode(&EventBlock::from_words(words), &info).unwrap();
        assert_eq!(event.samples(info.unit(0)), &[0x3fff, 0x0001]);
    }

    #[test]
    fn test_decode_errors() {
        let info = channel_board();
        assert_eq!(Event::decode(&EventBlock::from_words(vec![0xA000_0004]), &info),
                   Err(DecodeError::Truncated { words: 1 }));
        assert_eq!(Event::decode(&EventBlock::from_words(vec![0xB000_0004, 0, 0, 0]), &info),
                   Err(DecodeError::BadHeader { word: 0xB000_0004 }));
        assert_eq!(Event::decode(&EventBlock::from_words(vec![0xA000_0008, 0, 0, 0]), &info),
                   Err(DecodeError::SizeMismatch { header: 8, block: 4 }));
        assert_eq!(Event::decode(&EventBlock::from_words(vec![0xA000_0004, 0x10, 0, 0]), &info),
                   Err(DecodeError::UnknownUnits { mask: 0x10 }));
        assert_eq!(Event::decode(&EventBlock::from_words(vec![0xA000_0007, 0b11, 0, 0, 1, 2, 3]),
                                 &info),
                   Err(DecodeError::UnevenPayload { words: 3, units: 2 }));
    }

    #[test]
    fn test_zeroed_block_bytes() {
        let mut block = EventBlock::zeroed(3).unwrap();
        assert_eq!(block.as_bytes_mut().len(), 12);
        block.as_bytes_mut()[0] = 0x04;
        assert_eq!(block.words()[0], u32::from_ne_bytes([0x04, 0, 0, 0]));
    }
}
