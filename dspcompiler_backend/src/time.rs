//! Exact action timestamps and their quantization onto the sequencer clock.
//!
//! Experiment tables specify action times as decimal milliseconds. They are
//! kept exact ([`ActionTime`]) until the very last moment and then quantized
//! into integer ticks by [`quantize`]:
//!
//! 1. `time * ticks_per_ms` is evaluated exactly and converted to `f64`;
//! 2. the float is rounded half-up (`floor(x + 0.5)`), so that e.g. `10.1`
//!    and `10.0999999` at 10 ticks/ms both land on tick `101`;
//! 3. the ticks are deduplicated and sorted; the smallest becomes the base
//!    tick which every table is rebased against.
//!
//! A repetition duration pads the grid with one trailing tick, and a grid with
//! a single distinct tick is padded with `last + 1` because the sequencer
//! refuses profiles with fewer than two timepoints.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::action::Action;
use crate::error::{CompileError, Result};

/// Largest supported number of decimal places.
pub const MAX_SCALE: u32 = 18;

/// Exact decimal timestamp in milliseconds: `mantissa * 10^-scale`.
///
/// Equality and ordering compare numeric values, so `1.0` and `1.00` are equal.
///
/// ```
/// use dspcompiler_backend::time::ActionTime;
///
/// let t: ActionTime = "10.25".parse().unwrap();
/// assert_eq!(t, ActionTime::new(1025, 2));
/// assert_eq!(t.scaled_f64(10), 102.5);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct ActionTime {
    mantissa: i64,
    scale: u32,
}

impl ActionTime {
    pub const ZERO: ActionTime = ActionTime {
        mantissa: 0,
        scale: 0,
    };

    /// Constructs `mantissa * 10^-scale` milliseconds.
    ///
    /// Panics if `scale` exceeds [`MAX_SCALE`].
    pub fn new(mantissa: i64, scale: u32) -> Self {
        assert!(
            scale <= MAX_SCALE,
            "ActionTime scale {} exceeds the supported {} decimal places",
            scale,
            MAX_SCALE
        );
        Self { mantissa, scale }
    }

    pub fn from_millis(ms: i64) -> Self {
        Self::new(ms, 0)
    }

    pub fn mantissa(&self) -> i64 {
        self.mantissa
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn as_f64(&self) -> f64 {
        self.scaled_f64(1)
    }

    /// Returns `self * factor` as the nearest `f64`.
    ///
    /// The product is formed exactly and then divided by an exactly
    /// representable power of ten, so the result is correctly rounded.
    pub fn scaled_f64(&self, factor: u32) -> f64 {
        let product = self.mantissa as i128 * factor as i128;
        product as f64 / 10f64.powi(self.scale as i32)
    }

    /// Quantizes `self * ticks_per_ms` onto the tick grid (round half up).
    pub fn to_tick(&self, ticks_per_ms: u32) -> i64 {
        round_half_up(self.scaled_f64(ticks_per_ms))
    }

    fn widened(&self, scale: u32) -> i128 {
        self.mantissa as i128 * 10i128.pow(scale - self.scale)
    }
}

/// `floor(x + 0.5)`: ties go towards positive infinity, never to even.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

impl PartialEq for ActionTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ActionTime {}

impl Ord for ActionTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        self.widened(scale).cmp(&other.widened(scale))
    }
}
impl PartialOrd for ActionTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for ActionTime {
    fn from(ms: i64) -> Self {
        ActionTime::from_millis(ms)
    }
}

impl fmt::Display for ActionTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let padded = format!("{:0>width$}", digits, width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, int_part, frac_part)
    }
}

impl FromStr for ActionTime {
    type Err = CompileError;

    /// Parses plain decimals (`"-12.5"`) and exponent notation (`"1e-05"`).
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| CompileError::InvalidTime {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = s.trim();
        let (number, exponent) = match trimmed.find(|c| c == 'e' || c == 'E') {
            Some(idx) => {
                let exp = trimmed[idx + 1..]
                    .parse::<i32>()
                    .map_err(|_| invalid("malformed exponent"))?;
                (&trimmed[..idx], exp)
            }
            None => (trimmed, 0),
        };
        let (negative, unsigned) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number.strip_prefix('+').unwrap_or(number)),
        };
        let (int_digits, frac_digits) = match unsigned.split_once('.') {
            Some((i, f)) => (i, f),
            None => (unsigned, ""),
        };
        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(invalid("no digits"));
        }
        if !int_digits
            .chars()
            .chain(frac_digits.chars())
            .all(|c| c.is_ascii_digit())
        {
            return Err(invalid("unexpected character"));
        }

        let mut mantissa: i128 = 0;
        for c in int_digits.chars().chain(frac_digits.chars()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(c as i128 - '0' as i128))
                .ok_or_else(|| invalid("too many digits"))?;
        }
        let mut scale = frac_digits.len() as i64 - exponent as i64;
        if scale < 0 {
            let shift = u32::try_from(-scale).map_err(|_| invalid("exponent out of range"))?;
            mantissa = 10i128
                .checked_pow(shift)
                .and_then(|p| mantissa.checked_mul(p))
                .ok_or_else(|| invalid("value out of range"))?;
            scale = 0;
        }
        // Drop trailing zeros before giving up on precision.
        while scale > MAX_SCALE as i64 && mantissa % 10 == 0 {
            mantissa /= 10;
            scale -= 1;
        }
        if scale > MAX_SCALE as i64 {
            return Err(invalid("too many decimal places"));
        }
        if negative {
            mantissa = -mantissa;
        }
        let mantissa = i64::try_from(mantissa).map_err(|_| invalid("value out of range"))?;
        Ok(ActionTime::new(mantissa, scale as u32))
    }
}

/// The deduplicated, sorted set of absolute ticks a profile is built on.
#[derive(Clone, Debug, PartialEq)]
pub struct TickGrid {
    ticks_per_ms: u32,
    ticks: Vec<i64>,
    base_tick: i64,
    padded: bool,
}

impl TickGrid {
    pub fn ticks_per_ms(&self) -> u32 {
        self.ticks_per_ms
    }

    /// Absolute tick of an action time on this grid's clock.
    pub fn tick_of(&self, time: ActionTime) -> i64 {
        time.to_tick(self.ticks_per_ms)
    }

    /// Absolute ticks in ascending order, padding ticks included.
    pub fn ticks(&self) -> &[i64] {
        &self.ticks
    }

    pub fn base_tick(&self) -> i64 {
        self.base_tick
    }

    /// `true` if a synthetic `last + 1` tick was appended to a single-timepoint grid.
    pub fn is_padded(&self) -> bool {
        self.padded
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn last_tick(&self) -> i64 {
        *self.ticks.last().unwrap_or(&self.base_tick)
    }

    /// Row index of an absolute tick.
    pub fn index_of(&self, tick: i64) -> Option<usize> {
        self.ticks.binary_search(&tick).ok()
    }

    /// Rebases an absolute tick against the base tick.
    pub fn rebase(&self, tick: i64) -> Result<u32> {
        tick.checked_sub(self.base_tick)
            .and_then(|offset| u32::try_from(offset).ok())
            .ok_or(CompileError::TickOverflow { tick })
    }
}

/// Quantizes action times onto the sequencer clock.
///
/// # Arguments
/// - `actions`: the actions of one profile, in time order.
/// - `ticks_per_ms`: sequencer resolution.
/// - `rep_duration`: optional repetition length in milliseconds. If the
///   actions span less than this, a trailing tick at `base + rep` is added.
/// - `pad_single_timepoint`: append `last + 1` if only one tick remains.
///
/// ```
/// use dspcompiler_backend::*;
///
/// let mut map = ChannelMap::new();
/// let led = map.add_digital_line("led", 0).unwrap();
/// let actions = vec![Action::digital(ActionTime::from_millis(5), led, true)];
/// let grid = quantize(&actions, 10, None, true).unwrap();
/// assert_eq!(grid.ticks(), &[50, 51]);
/// assert!(grid.is_padded());
/// ```
pub fn quantize(
    actions: &[Action],
    ticks_per_ms: u32,
    rep_duration: Option<ActionTime>,
    pad_single_timepoint: bool,
) -> Result<TickGrid> {
    if actions.is_empty() {
        return Err(CompileError::EmptyActions);
    }
    let unique: BTreeSet<i64> = actions
        .iter()
        .map(|action| action.time.to_tick(ticks_per_ms))
        .collect();
    let mut ticks: Vec<i64> = unique.into_iter().collect();
    let base_tick = ticks[0];

    if let Some(rep) = rep_duration {
        let rep_ticks = rep.to_tick(ticks_per_ms);
        let last = ticks[ticks.len() - 1];
        let end = base_tick
            .checked_add(rep_ticks)
            .ok_or(CompileError::TickOverflow { tick: rep_ticks })?;
        if end > last {
            ticks.push(end);
        }
    }

    let mut padded = false;
    if pad_single_timepoint && ticks.len() == 1 {
        let next = ticks[0]
            .checked_add(1)
            .ok_or(CompileError::TickOverflow { tick: ticks[0] })?;
        ticks.push(next);
        padded = true;
    }

    Ok(TickGrid {
        ticks_per_ms,
        ticks,
        base_tick,
        padded,
    })
}
