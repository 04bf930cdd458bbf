//! Actions: what happens, where, and when.
//!
//! The experiment layer hands the device a table of `(time, handler, value)`
//! entries ([`TableEntry`]). Handler names are resolved once against the
//! [`ChannelMap`](crate::channel::ChannelMap) into a [`ChannelRef`], which turns
//! each entry into an [`Action`] the compiler can route without string lookups.

use std::collections::HashMap;
use std::fmt;

use crate::channel::ChannelMap;
use crate::error::{CompileError, Result};
use crate::time::ActionTime;

/// Index of a digital line in its [`ChannelMap`](crate::channel::ChannelMap).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(pub(crate) usize);

/// Index of an analog or packed channel in its [`ChannelMap`](crate::channel::ChannelMap).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) usize);

/// Resolved action target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelRef {
    /// A single bit of the digital output word.
    Digital(LineId),
    /// A 16-bit DAC line feeding one of the 4 hardware analog channels.
    Analog(ChannelId),
    /// A position packed into the digital word above `shift`.
    PackedSecondary(ChannelId, u32),
}

impl ChannelRef {
    pub fn is_digital_word(&self) -> bool {
        matches!(
            self,
            ChannelRef::Digital(_) | ChannelRef::PackedSecondary(..)
        )
    }
}

impl From<LineId> for ChannelRef {
    fn from(line: LineId) -> Self {
        ChannelRef::Digital(line)
    }
}

impl From<ChannelId> for ChannelRef {
    fn from(chan: ChannelId) -> Self {
        ChannelRef::Analog(chan)
    }
}

/// Requested setting of a target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ActionValue {
    Bool(bool),
    Float(f64),
}

impl ActionValue {
    /// Interprets the value as a line state; `0.0` and `1.0` are accepted too.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            ActionValue::Bool(b) => Some(b),
            ActionValue::Float(v) if v == 0. => Some(false),
            ActionValue::Float(v) if v == 1. => Some(true),
            ActionValue::Float(_) => None,
        }
    }

    /// Interprets the value as a finite number.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            ActionValue::Float(v) if v.is_finite() => Some(v),
            _ => None,
        }
    }

    /// Interprets the value as a non-negative integral index.
    pub fn as_index(&self) -> Option<usize> {
        let v = self.as_f64()?;
        if v >= 0. && v.fract() == 0. && v <= usize::MAX as f64 {
            Some(v as usize)
        } else {
            None
        }
    }
}

impl From<bool> for ActionValue {
    fn from(b: bool) -> Self {
        ActionValue::Bool(b)
    }
}

impl From<f64> for ActionValue {
    fn from(v: f64) -> Self {
        ActionValue::Float(v)
    }
}

impl fmt::Display for ActionValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ActionValue::Bool(b) => write!(f, "{}", b),
            ActionValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One resolved action.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Action {
    pub time: ActionTime,
    pub target: ChannelRef,
    pub value: ActionValue,
}

impl Action {
    pub fn new(
        time: ActionTime,
        target: impl Into<ChannelRef>,
        value: impl Into<ActionValue>,
    ) -> Self {
        Self {
            time,
            target: target.into(),
            value: value.into(),
        }
    }

    pub fn digital(time: ActionTime, line: LineId, on: bool) -> Self {
        Self::new(time, line, on)
    }

    pub fn analog(time: ActionTime, chan: ChannelId, value: f64) -> Self {
        Self::new(time, chan, value)
    }
}

/// Value each target received at each tick of one compile pass.
#[derive(Default)]
pub(crate) struct TickValues(HashMap<(i64, ChannelRef), ActionValue>);

impl TickValues {
    /// Records `action` at `tick`. Returns `Ok(false)` for an identical repeat.
    pub(crate) fn record(&mut self, tick: i64, action: &Action, map: &ChannelMap) -> Result<bool> {
        match self.0.insert((tick, action.target), action.value) {
            None => Ok(true),
            Some(prev) if prev == action.value => Ok(false),
            Some(prev) => Err(CompileError::ConflictingAction {
                handler: map.describe(action.target),
                time: action.time,
                tick,
                first: prev.to_string(),
                second: action.value.to_string(),
            }),
        }
    }
}

/// Entry of the experiment's action table, before name resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct TableEntry {
    pub time: ActionTime,
    pub handler: String,
    pub value: ActionValue,
}

impl TableEntry {
    pub fn new(time: ActionTime, handler: &str, value: impl Into<ActionValue>) -> Self {
        Self {
            time,
            handler: handler.to_string(),
            value: value.into(),
        }
    }
}

impl fmt::Display for TableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.time, self.handler, self.value)
    }
}

#[cfg(test)]
mod test {
    use crate::action::*;

    #[test]
    fn value_interpretation() {
        assert_eq!(ActionValue::Bool(true).as_bool(), Some(true));
        assert_eq!(ActionValue::Float(0.).as_bool(), Some(false));
        assert_eq!(ActionValue::Float(0.5).as_bool(), None);
        assert_eq!(ActionValue::Bool(true).as_f64(), None);
        assert_eq!(ActionValue::Float(f64::NAN).as_f64(), None);
        assert_eq!(ActionValue::Float(2.).as_index(), Some(2));
        assert_eq!(ActionValue::Float(2.5).as_index(), None);
        assert_eq!(ActionValue::Float(-1.).as_index(), None);
    }

    #[test]
    fn digital_word_targets() {
        assert!(ChannelRef::Digital(LineId(0)).is_digital_word());
        assert!(ChannelRef::PackedSecondary(ChannelId(0), 16).is_digital_word());
        assert!(!ChannelRef::Analog(ChannelId(0)).is_digital_word());
    }

    #[test]
    fn repeated_values_at_a_tick() {
        let mut map = ChannelMap::new();
        let line = map.add_digital_line("cam", 1).unwrap();
        let mut seen = TickValues::default();
        let on = Action::digital(ActionTime::from_millis(1), line, true);
        let off = Action::digital(ActionTime::from_millis(1), line, false);
        assert_eq!(seen.record(10, &on, &map), Ok(true));
        assert_eq!(seen.record(10, &on, &map), Ok(false));
        assert_eq!(seen.record(11, &off, &map), Ok(true));
        let err = seen.record(10, &off, &map).unwrap_err();
        assert!(matches!(err, CompileError::ConflictingAction { tick: 10, .. }));
    }

    #[test]
    fn table_entry_display() {
        let entry = TableEntry::new(ActionTime::new(15, 1), "488 shutter", true);
        assert_eq!(entry.to_string(), "(1.5, 488 shutter, true)");
    }
}
