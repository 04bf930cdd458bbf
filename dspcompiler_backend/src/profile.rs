//! The compiled profile and its wire format.
//!
//! A [`Profile`] is what gets uploaded to the sequencer: a fixed 32-byte
//! header followed (in separate buffers) by the digital table and the 4 analog
//! tables. The firmware parses the header positionally:
//!
//! | offset | field       | type     |
//! |--------|-------------|----------|
//! | 0      | `count`     | `u32`    |
//! | 4      | `clock`     | `f32`    |
//! | 8      | `init_dio`  | `u32`    |
//! | 12     | `n_digital` | `u32`    |
//! | 16     | `n_analog`  | `[u32;4]`|
//!
//! All values are little-endian. Table rows are `(tick: u32, value: u32)`
//! pairs; analog values are signed deltas written as wrapping `u32`.
//!
//! Besides the wire encoding this module hosts the upload cache check
//! ([`should_upload`]) and diagnostics to inspect what a profile will output.

use ndarray::{Array1, Array2};

use crate::analog::{AnalogRow, AnalogTables};
use crate::channel::NUM_ANALOG;
use crate::digital::DigitalRow;
use crate::utils::binfind_rows_until;

/// Size of the encoded [`ProfileHeader`].
pub const HEADER_LEN: usize = 32;

/// Fixed-layout profile description.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProfileHeader {
    /// Runtime in ticks.
    pub count: u32,
    /// Tick period in microseconds (`1000 / ticks_per_ms`).
    pub clock: f32,
    /// Digital word in effect before the profile starts.
    pub init_dio: u32,
    pub n_digital: u32,
    pub n_analog: [u32; NUM_ANALOG],
}

impl ProfileHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let words = [
            self.count,
            self.clock.to_bits(),
            self.init_dio,
            self.n_digital,
            self.n_analog[0],
            self.n_analog[1],
            self.n_analog[2],
            self.n_analog[3],
        ];
        for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HEADER_LEN {
            return None;
        }
        let word = |i: usize| {
            let mut le = [0u8; 4];
            le.copy_from_slice(&bytes[4 * i..4 * i + 4]);
            u32::from_le_bytes(le)
        };
        Some(Self {
            count: word(0),
            clock: f32::from_bits(word(1)),
            init_dio: word(2),
            n_digital: word(3),
            n_analog: [word(4), word(5), word(6), word(7)],
        })
    }
}

/// Header plus tables, ready to upload.
#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    pub header: ProfileHeader,
    pub digital: Vec<DigitalRow>,
    pub analog: AnalogTables,
}

/// Assembles the header around finished tables.
///
/// ```
/// use dspcompiler_backend::*;
///
/// let digital = vec![DigitalRow::new(0, 0b11), DigitalRow::new(100, 0)];
/// let analog: [Vec<AnalogRow>; 4] = Default::default();
/// let profile = assemble(digital, analog.map(|_| placeholder_table()), 10, 0);
/// assert_eq!(profile.header.count, 100);
/// assert_eq!(profile.header.clock, 100.);
/// assert_eq!(profile.header.n_analog, [1; 4]);
/// ```
pub fn assemble(
    digital: Vec<DigitalRow>,
    analog: AnalogTables,
    ticks_per_ms: u32,
    initial_digital: u32,
) -> Profile {
    let runtime = digital
        .iter()
        .map(|row| row.tick)
        .chain(analog.iter().flatten().map(|row| row.tick))
        .max()
        .unwrap_or(0);
    let header = ProfileHeader {
        count: runtime,
        clock: (1000. / ticks_per_ms as f64) as f32,
        init_dio: initial_digital,
        n_digital: digital.len() as u32,
        n_analog: [
            analog[0].len() as u32,
            analog[1].len() as u32,
            analog[2].len() as u32,
            analog[3].len() as u32,
        ],
    };
    Profile {
        header,
        digital,
        analog,
    }
}

/// `true` unless `previous` has byte-identical header and tables.
pub fn should_upload(new: &Profile, previous: Option<&Profile>) -> bool {
    match previous {
        None => true,
        Some(prev) => {
            new.header.to_bytes() != prev.header.to_bytes()
                || new.digital != prev.digital
                || new.analog != prev.analog
        }
    }
}

fn encode_rows(rows: impl Iterator<Item = (u32, u32)>) -> Vec<u8> {
    rows.flat_map(|(tick, value)| {
        let mut pair = [0u8; 8];
        pair[..4].copy_from_slice(&tick.to_le_bytes());
        pair[4..].copy_from_slice(&value.to_le_bytes());
        pair
    })
    .collect()
}

impl Profile {
    pub fn runtime(&self) -> u32 {
        self.header.count
    }

    pub fn header_bytes(&self) -> [u8; HEADER_LEN] {
        self.header.to_bytes()
    }

    pub fn digital_bytes(&self) -> Vec<u8> {
        encode_rows(self.digital.iter().map(|row| (row.tick, row.mask)))
    }

    /// Panics if `channel` is not a hardware analog channel.
    pub fn analog_bytes(&self, channel: usize) -> Vec<u8> {
        assert!(
            channel < NUM_ANALOG,
            "Analog channel {} outside 0..{}",
            channel,
            NUM_ANALOG
        );
        encode_rows(self.analog[channel].iter().map(|row| (row.tick, row.adu as u32)))
    }

    /// Header, digital table and analog tables back to back.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut buf = self.header_bytes().to_vec();
        buf.extend(self.digital_bytes());
        for channel in 0..NUM_ANALOG {
            buf.extend(self.analog_bytes(channel));
        }
        buf
    }

    /// Tables as `(n, 2)` matrices of wire words.
    pub fn to_arrays(&self) -> (Array2<u32>, [Array2<u32>; NUM_ANALOG]) {
        let digital = Array2::from_shape_fn((self.digital.len(), 2), |(i, j)| {
            let row = &self.digital[i];
            if j == 0 {
                row.tick
            } else {
                row.mask
            }
        });
        let analog = std::array::from_fn(|ch| {
            let table = &self.analog[ch];
            Array2::from_shape_fn((table.len(), 2), |(i, j)| {
                let row: &AnalogRow = &table[i];
                if j == 0 {
                    row.tick
                } else {
                    row.adu as u32
                }
            })
        });
        (digital, analog)
    }

    /// Samples the step-held outputs at `nsamps` evenly spaced ticks from
    /// `start` to `end` (inclusive).
    ///
    /// Row 0 is the digital word, rows 1..=4 the analog channels. Before a
    /// table's first row the digital word is `init_dio` and analog values are 0.
    pub fn calc_signal_nsamps(&self, start: u32, end: u32, nsamps: usize) -> Array2<f64> {
        assert!(
            end > start,
            "Attempting to sample profile for invalid interval {}-{}",
            start,
            end
        );
        let positions = Array1::linspace(start as f64, end as f64, nsamps);
        let mut buffer = Array2::from_elem((1 + NUM_ANALOG, nsamps), 0.);

        for (k, &pos) in positions.iter().enumerate() {
            let idx = binfind_rows_until(|i| self.digital[i].tick, self.digital.len(), pos);
            buffer[[0, k]] = match idx {
                0 => self.header.init_dio as f64,
                i => self.digital[i - 1].mask as f64,
            };
            for (ch, table) in self.analog.iter().enumerate() {
                let idx = binfind_rows_until(|i| table[i].tick, table.len(), pos);
                if idx > 0 {
                    buffer[[ch + 1, k]] = table[idx - 1].adu as f64;
                }
            }
        }
        buffer
    }

    /// `(tick, on)` for the first row and every change of the line(s) in `mask`.
    pub fn digital_line_trace(&self, mask: u32) -> Vec<(u32, bool)> {
        let mut trace = Vec::new();
        let mut state = None;
        for row in &self.digital {
            let on = row.mask & mask != 0;
            if state != Some(on) {
                trace.push((row.tick, on));
                state = Some(on);
            }
        }
        trace
    }
}

/// Observer of uploaded profiles.
pub trait ProfileSink: Send + Sync {
    fn profile_uploaded(&self, profile: &Profile);
}

impl<F> ProfileSink for F
where
    F: Fn(&Profile) + Send + Sync,
{
    fn profile_uploaded(&self, profile: &Profile) {
        self(profile)
    }
}
