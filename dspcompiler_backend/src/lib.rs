//! # dspcompiler_backend
//!
//! Compiles a sparse, time-ordered list of actions (turn this light on, move
//! that piezo, trigger a camera) into the dense tables a DSP or FPGA hardware
//! sequencer executes. The output has to be bit-exact: the firmware parses the
//! profile positionally and has no tolerance for malformed tables.
//!
//! The stages, in dependency order:
//! 1. [`time`]: decimal timestamps are quantized onto the sequencer clock.
//! 2. [`digital`]: the cumulative 32-bit output word is rebuilt from per-line
//!    on/off actions, starting from the previous profile's final word.
//! 3. [`analog`]: physical values become ADU tables, one per hardware channel,
//!    optionally rebased against the previous profile's final positions.
//! 4. [`profile`]: header assembly, wire encoding and the upload cache check.
//!
//! [`ProfileCompiler`] runs all of them with the quirks of one
//! [`HardwareVariant`]. Uploading and triggering live in `dspctrl_backend`.

pub mod action;
pub mod analog;
pub mod channel;
pub mod compiler;
pub mod digital;
pub mod error;
pub mod profile;
pub mod quirks;
pub mod time;
pub mod utils;

#[cfg(feature = "python")]
pub mod python;

pub use action::*;
pub use analog::*;
pub use channel::*;
pub use compiler::*;
pub use digital::*;
pub use error::CompileError;
pub use profile::*;
pub use quirks::*;
pub use time::*;
pub use utils::*;
