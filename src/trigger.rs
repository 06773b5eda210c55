//! Level discriminator with hysteresis using SIMD operations.
//!
//! Models the per-unit self-trigger of the board: a unit triggers when its signal crosses the
//! threshold in the direction of its pulse polarity.

use crate::config::Polarity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Below,
    Above,
}

#[derive(Debug, Clone, Copy)]
pub struct Discriminator {
    state: State,
    polarity: Polarity,
    level: i16, // if let Fresh = state { state = if sample < level { Below } else { Above } }
    below: i16, // if sample < below { state = Below }
    above: i16, // if sample > above { state = Above }
}

impl Discriminator {
    /// Create a new discriminator at `level`.
    ///
    /// A positive polarity discriminator fires on the sample where a below condition (strictly
    /// below `level - hysteresis`) turns into an above condition (strictly above
    /// `level + hysteresis`); a negative polarity discriminator fires on the opposite transition.
    /// Transitions in the other direction only rearm it.
    ///
    /// The signal has to be seen on the quiet side of the threshold before the discriminator can
    /// fire, so a threshold placed on the wrong side of the baseline never triggers.
    pub fn new(level: i16, hysteresis: u16, polarity: Polarity) -> Discriminator {
        Discriminator {
            state: State::Fresh,
            polarity,
            level,
            below: level.saturating_sub_unsigned(hysteresis),
            above: level.saturating_add_unsigned(hysteresis),
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Fresh;
    }

    /// Scan incoming data for a threshold crossing.
    ///
    /// Returns the index of the sample that caused the discriminator to fire, if any.
    pub fn find(&mut self, mut samples: &[i16]) -> Option<usize> {
        let len_before = samples.len();
        let fired = self.scan(&mut samples);
        fired.then(|| len_before - samples.len())
    }

    fn scan(&mut self, samples: &mut &[i16]) -> bool {
        use wide::{i16x8, CmpGt, CmpLt};

        fn scan_for<P, Q>(samples: &mut &[i16], predicate: P, scalar: Q) -> bool
                where P: Fn(i16x8) -> i16x8, Q: Fn(i16) -> bool {
            let data: &[i16] = samples;
            let mut offset = 0;
            let mut chunks = data.chunks_exact(8);
            for group in &mut chunks {
                let mask = predicate(i16x8::new(core::array::from_fn(|lane| group[lane])));
                if mask.any() {
                    offset += (mask.move_mask() as u32).trailing_zeros() as usize;
                    *samples = &data[offset..];
                    return true
                }
                offset += 8;
            }
            for &sample in chunks.remainder() {
                if scalar(sample) {
                    *samples = &data[offset..];
                    return true
                }
                offset += 1;
            }
            *samples = &data[offset..];
            false
        }

        match (self.state, *samples) {
            (State::Fresh, []) =>
                return false,
            (State::Fresh, [first_sample, ..]) => {
                self.state = if *first_sample < self.level { State::Below } else { State::Above };
            }
            _ => ()
        }

        let (above, below) = (self.above, self.below);
        let above_x8 = i16x8::splat(above);
        let below_x8 = i16x8::splat(below);
        loop {
            let found = match self.state {
                State::Fresh => unreachable!(),
                State::Below => scan_for(samples,
                    |group| group.cmp_gt(above_x8), |sample| sample > above),
                State::Above => scan_for(samples,
                    |group| group.cmp_lt(below_x8), |sample| sample < below),
            };
            if !found {
                return false
            }
            self.state = match self.state {
                State::Below => State::Above,
                _ => State::Below,
            };
            match (self.state, self.polarity) {
                (State::Above, Polarity::Positive) |
                (State::Below, Polarity::Negative) => return true,
                // rearmed; step past the sample that caused the transition
                _ => *samples = &samples[1..],
            }
        }
    }
}
