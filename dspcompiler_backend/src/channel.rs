//! Registry of the outputs a sequencer controls.
//!
//! A [`ChannelMap`] is built once while the device is configured and is
//! immutable during a run. It knows three kinds of outputs:
//!
//! - **digital lines**: one bit of the 32-bit output word. Several names may
//!   share a bit (e.g. a light source and the camera it always fires with).
//! - **analog lines**: a named view of one of the 4 DAC channels with its own
//!   physical-to-ADU conversion, see [`AnalogLine`].
//! - **packed secondary channels**: a position packed into the upper bits of
//!   the digital word, see [`PackedChannel`].
//!
//! Names are unique across all kinds; registration resolves them into
//! [`ChannelRef`]s so compilation never touches strings.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::action::*;
use crate::error::{CompileError, Result};

/// Number of hardware analog channels on the sequencer.
pub const NUM_ANALOG: usize = 4;

/// How a physical analog value turns into DAC units.
#[derive(Clone, Debug, PartialEq)]
pub enum AnalogEncoding {
    /// `adu = trunc(value / units_per_adu)`
    Linear,
    /// The value is an index into `levels`; `adu = trunc(levels[index] * adu_per_unit)`.
    Indexed { levels: Vec<f64>, adu_per_unit: f64 },
}

/// Analog output line.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalogLine {
    pub hw_channel: usize,
    pub units_per_adu: f64,
    pub encoding: AnalogEncoding,
    /// Position the line is moved to when an experiment is prepared.
    pub startup: Option<f64>,
}

impl AnalogLine {
    pub fn linear(hw_channel: usize, units_per_adu: f64) -> Self {
        Self {
            hw_channel,
            units_per_adu,
            encoding: AnalogEncoding::Linear,
            startup: None,
        }
    }

    pub fn indexed(hw_channel: usize, levels: Vec<f64>, adu_per_unit: f64) -> Self {
        Self {
            hw_channel,
            units_per_adu: 1. / adu_per_unit,
            encoding: AnalogEncoding::Indexed {
                levels,
                adu_per_unit,
            },
            startup: None,
        }
    }

    pub fn with_startup(mut self, startup: f64) -> Self {
        self.startup = Some(startup);
        self
    }

    /// Converts a requested value into absolute DAC units.
    ///
    /// The error string explains why the value was rejected.
    pub fn to_adu(&self, value: &ActionValue) -> std::result::Result<i64, String> {
        match &self.encoding {
            AnalogEncoding::Linear => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| "expected a finite number".to_string())?;
                Ok((v / self.units_per_adu).trunc() as i64)
            }
            AnalogEncoding::Indexed {
                levels,
                adu_per_unit,
            } => {
                let idx = value
                    .as_index()
                    .ok_or_else(|| "expected a non-negative integer index".to_string())?;
                let level = levels
                    .get(idx)
                    .ok_or_else(|| format!("index out of range 0..{}", levels.len()))?;
                Ok((level * adu_per_unit).trunc() as i64)
            }
        }
    }
}

/// Supplies the current index into [`PackedChannel::bases`]/[`PackedChannel::steps`].
pub type PositionSource = Arc<dyn Fn() -> usize + Send + Sync>;

/// Position encoded into the digital word: `word = (word & low_mask) + (target << shift)`
/// with `target = bases[i] + steps[i] * value` and `i` queried from `position_source`.
#[derive(Clone)]
pub struct PackedChannel {
    pub shift: u32,
    pub low_mask: u32,
    pub max_value: i64,
    pub bases: Vec<i64>,
    pub steps: Vec<i64>,
    pub position_source: PositionSource,
}

impl PackedChannel {
    /// Target position for `step` at the current source index.
    ///
    /// Returns `Err(index)` if the source reports an index without a base.
    /// Positions beyond the `i64` range saturate, which the encodable range
    /// check then rejects.
    pub fn target(&self, step: i64) -> std::result::Result<i64, usize> {
        let idx = (self.position_source)();
        match (self.bases.get(idx), self.steps.get(idx)) {
            (Some(base), Some(stride)) => Ok(stride
                .checked_mul(step)
                .and_then(|offset| base.checked_add(offset))
                .unwrap_or(if (*stride < 0) == (step < 0) {
                    i64::MAX
                } else {
                    i64::MIN
                })),
            _ => Err(idx),
        }
    }
}

impl fmt::Debug for PackedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedChannel")
            .field("shift", &self.shift)
            .field("low_mask", &format_args!("{:#x}", self.low_mask))
            .field("max_value", &self.max_value)
            .field("bases", &self.bases)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

/// Name registry for every output of one sequencer.
#[derive(Clone, Debug, Default)]
pub struct ChannelMap {
    names: IndexMap<String, ChannelRef>,
    digital: Vec<u32>,
    analog: Vec<AnalogLine>,
    packed: Vec<PackedChannel>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn assert_new_name(&self, name: &str) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(CompileError::InvalidChannel {
                name: name.to_string(),
                reason: "name is already registered".to_string(),
            });
        }
        Ok(())
    }

    /// Registers a digital line driving bit `bit` of the output word.
    pub fn add_digital_line(&mut self, name: &str, bit: u32) -> Result<LineId> {
        self.assert_new_name(name)?;
        if bit >= 32 {
            return Err(CompileError::InvalidChannel {
                name: name.to_string(),
                reason: format!("bit {} outside the 32-bit digital word", bit),
            });
        }
        let id = LineId(self.digital.len());
        self.digital.push(1 << bit);
        self.names.insert(name.to_string(), ChannelRef::Digital(id));
        Ok(id)
    }

    /// Registers an analog line.
    pub fn add_analog_line(&mut self, name: &str, line: AnalogLine) -> Result<ChannelId> {
        self.assert_new_name(name)?;
        let invalid = |reason: String| CompileError::InvalidChannel {
            name: name.to_string(),
            reason,
        };
        if line.hw_channel >= NUM_ANALOG {
            return Err(invalid(format!(
                "hardware channel {} outside 0..{}",
                line.hw_channel, NUM_ANALOG
            )));
        }
        match &line.encoding {
            AnalogEncoding::Linear => {
                if !line.units_per_adu.is_finite() || line.units_per_adu == 0. {
                    return Err(invalid(format!(
                        "units per ADU must be finite and non-zero, got {}",
                        line.units_per_adu
                    )));
                }
            }
            AnalogEncoding::Indexed {
                levels,
                adu_per_unit,
            } => {
                if levels.is_empty() || !adu_per_unit.is_finite() {
                    return Err(invalid(
                        "indexed lines need levels and a finite ADU scale".to_string(),
                    ));
                }
            }
        }
        let id = ChannelId(self.analog.len());
        self.analog.push(line);
        self.names.insert(name.to_string(), ChannelRef::Analog(id));
        Ok(id)
    }

    /// Registers a packed secondary channel.
    pub fn add_packed_secondary(&mut self, name: &str, chan: PackedChannel) -> Result<ChannelRef> {
        self.assert_new_name(name)?;
        let invalid = |reason: &str| CompileError::InvalidChannel {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if chan.shift >= 32 {
            return Err(invalid("shift outside the 32-bit digital word"));
        }
        if chan.bases.is_empty() || chan.bases.len() != chan.steps.len() {
            return Err(invalid("bases and steps must be non-empty and of equal length"));
        }
        if chan.max_value < 0 || chan.max_value > (u32::MAX >> chan.shift) as i64 {
            return Err(invalid("max value does not fit above the shift"));
        }
        let target = ChannelRef::PackedSecondary(ChannelId(self.packed.len()), chan.shift);
        self.packed.push(chan);
        self.names.insert(name.to_string(), target);
        Ok(target)
    }

    pub fn resolve(&self, name: &str) -> Option<ChannelRef> {
        self.names.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Registered name of a target.
    pub fn name_of(&self, target: ChannelRef) -> Option<&str> {
        self.names
            .iter()
            .find(|(_, r)| **r == target)
            .map(|(name, _)| name.as_str())
    }

    /// Name for error messages; falls back to the debug form of a foreign reference.
    pub(crate) fn describe(&self, target: ChannelRef) -> String {
        self.name_of(target)
            .map_or_else(|| format!("{:?}", target), |name| name.to_string())
    }

    pub fn digital_mask(&self, line: LineId) -> Option<u32> {
        self.digital.get(line.0).copied()
    }

    pub fn analog_line(&self, chan: ChannelId) -> Option<&AnalogLine> {
        self.analog.get(chan.0)
    }

    pub fn packed_channel(&self, chan: ChannelId) -> Option<&PackedChannel> {
        self.packed.get(chan.0)
    }

    /// All registered names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(|s| s.as_str())
    }

    /// `(name, mask)` of every digital line.
    pub fn digital_lines(&self) -> impl Iterator<Item = (&str, u32)> {
        self.names.iter().filter_map(|(name, r)| match r {
            ChannelRef::Digital(id) => Some((name.as_str(), self.digital[id.0])),
            _ => None,
        })
    }

    /// `(name, line)` of every analog line.
    pub fn analog_lines(&self) -> impl Iterator<Item = (&str, &AnalogLine)> {
        self.names.iter().filter_map(|(name, r)| match r {
            ChannelRef::Analog(id) => Some((name.as_str(), &self.analog[id.0])),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod test {
    use crate::channel::*;

    #[test]
    fn names_are_unique_across_kinds() {
        let mut map = ChannelMap::new();
        map.add_digital_line("laser", 3).unwrap();
        let err = map.add_analog_line("laser", AnalogLine::linear(0, 1.)).unwrap_err();
        assert!(matches!(err, CompileError::InvalidChannel { .. }));
    }

    #[test]
    fn lines_may_share_a_bit() {
        let mut map = ChannelMap::new();
        let a = map.add_digital_line("405", 4).unwrap();
        let b = map.add_digital_line("405 shutter", 4).unwrap();
        assert_ne!(a, b);
        assert_eq!(map.digital_mask(a), Some(16));
        assert_eq!(map.digital_mask(b), Some(16));
        assert_eq!(map.name_of(b.into()), Some("405 shutter"));
        assert_eq!(map.digital_mask(LineId(9)), None);
        assert_eq!(map.describe(LineId(9).into()), "Digital(LineId(9))");
    }

    #[test]
    fn rejects_bad_registrations() {
        let mut map = ChannelMap::new();
        assert!(map.add_digital_line("d", 32).is_err());
        assert!(map.add_analog_line("a", AnalogLine::linear(4, 1.)).is_err());
        assert!(map.add_analog_line("b", AnalogLine::linear(0, 0.)).is_err());
        assert!(map.is_empty());
    }

    #[test]
    fn linear_and_indexed_conversion() {
        let z = AnalogLine::linear(0, 0.5);
        assert_eq!(z.to_adu(&ActionValue::Float(10.3)), Ok(20));
        assert_eq!(z.to_adu(&ActionValue::Float(-10.3)), Ok(-20));
        assert!(z.to_adu(&ActionValue::Bool(true)).is_err());

        let retarder = AnalogLine::indexed(1, vec![0., 1., 2., 3.], 3276.8);
        assert_eq!(retarder.to_adu(&ActionValue::Float(1.)), Ok(3276));
        assert_eq!(retarder.to_adu(&ActionValue::Float(3.)), Ok(9830));
        assert!(retarder.to_adu(&ActionValue::Float(4.)).is_err());
        assert!(retarder.to_adu(&ActionValue::Float(1.5)).is_err());
    }

    #[test]
    fn packed_target_follows_position_source() {
        let chan = PackedChannel {
            shift: 16,
            low_mask: 0xffff,
            max_value: 0x3fff,
            bases: vec![8000, 9500, 9500],
            steps: vec![679, 678, 683],
            position_source: Arc::new(|| 2),
        };
        assert_eq!(chan.target(2), Ok(9500 + 2 * 683));
        let lost = PackedChannel {
            position_source: Arc::new(|| 7),
            ..chan.clone()
        };
        assert_eq!(lost.target(0), Err(7));

        let mut map = ChannelMap::new();
        let r = map.add_packed_secondary("SI phase", chan).unwrap();
        assert_eq!(r, ChannelRef::PackedSecondary(ChannelId(0), 16));
        assert_eq!(map.resolve("SI phase"), Some(r));
    }

    #[test]
    fn iteration_keeps_registration_order() {
        let mut map = ChannelMap::new();
        map.add_digital_line("cam", 0).unwrap();
        map.add_analog_line("z", AnalogLine::linear(2, 1.)).unwrap();
        map.add_digital_line("laser", 5).unwrap();
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["cam", "z", "laser"]);
        assert_eq!(
            map.digital_lines().collect::<Vec<_>>(),
            vec![("cam", 1), ("laser", 32)]
        );
        assert_eq!(map.analog_lines().count(), 1);
    }
}
