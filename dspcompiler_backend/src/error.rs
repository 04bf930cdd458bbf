//! Error types for profile compilation.
//!
//! Every variant that originates from a particular action carries the handler
//! name and the action time, so the experiment layer can abort the run with a
//! message pointing at the offending table entry.

use thiserror::Error;

use crate::time::ActionTime;

/// Result type alias for compiler operations.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors that can occur while turning an action table into a profile.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// Compilation was invoked without any actions.
    #[error("Cannot compile a profile from an empty action list")]
    EmptyActions,

    /// Two actions for the same handler land on the same tick with different values.
    #[error("Simultaneous actions with handler '{handler}' at time {time} (tick {tick}): {first} vs {second}")]
    ConflictingAction {
        handler: String,
        time: ActionTime,
        tick: i64,
        first: String,
        second: String,
    },

    /// A line was switched off although the bookkeeping says the word cannot hold it.
    #[error("Negative digital value from adding {addend:#b} to {current:#b} (handler '{handler}' at time {time})")]
    DigitalUnderflow {
        handler: String,
        time: ActionTime,
        current: i64,
        addend: i64,
    },

    /// The cumulative digital word no longer fits the 32-bit output register.
    #[error("Digital value {value:#x} exceeds 32 bits (handler '{handler}' at time {time})")]
    DigitalOverflow {
        handler: String,
        time: ActionTime,
        value: i64,
    },

    /// The action targets a channel this device does not control.
    #[error("Unhandled handler when generating profile: '{handler}' at time {time}")]
    UnroutableHandler { handler: String, time: ActionTime },

    /// The action value does not fit the channel kind or encoding.
    #[error("Invalid value {value} for handler '{handler}' at time {time}: {reason}")]
    InvalidActionValue {
        handler: String,
        time: ActionTime,
        value: String,
        reason: String,
    },

    /// A packed secondary channel position outside the encodable range.
    #[error("Tried to move '{handler}' too far at time {time}: position {value} outside 0..={max}")]
    PackedValueOutOfRange {
        handler: String,
        time: ActionTime,
        value: i64,
        max: i64,
    },

    /// An analog table entry does not fit the 32-bit table word.
    #[error("Analog value {adu} ADU for handler '{handler}' at time {time} does not fit a 32-bit table entry")]
    AnalogValueOutOfRange {
        handler: String,
        time: ActionTime,
        adu: i128,
    },

    /// A rebased tick does not fit the sequencer's 32-bit tick counter.
    #[error("Tick {tick} does not fit the 32-bit sequencer clock")]
    TickOverflow { tick: i64 },

    /// A timestamp could not be parsed or represented.
    #[error("Invalid action time '{input}': {reason}")]
    InvalidTime { input: String, reason: String },

    /// A channel registration was rejected.
    #[error("Invalid channel '{name}': {reason}")]
    InvalidChannel { name: String, reason: String },
}
