//! # dspctrl_backend
//!
//! Drives DSP and FPGA hardware sequencers with profiles compiled by
//! [`dspcompiler_backend`]. The compiler is pure; this crate adds the state
//! that lives between executions and the plumbing around the remote card:
//!
//! - [`device`]: the [`SequencerDevice`] execution state machine, upload
//!   caching, abort and snapshot operations.
//! - [`link`]: the [`SequencerLink`] trait for remote calls, and an
//!   in-process [`LoopbackLink`].
//! - [`events`]: the publish/subscribe bus carrying status updates and the
//!   completion signal.
//! - [`phase`]: observable execution phase.
//! - [`config`]: TOML device description.

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod link;
pub mod phase;

pub use crate::config::*;
pub use crate::device::*;
pub use crate::error::*;
pub use crate::events::*;
pub use crate::link::*;
pub use crate::phase::*;
