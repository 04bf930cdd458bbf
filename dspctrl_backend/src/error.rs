//! Error types of the sequencer driver.
//!
//! - [`LinkError`]: a remote call on the sequencer connection failed.
//! - [`ConfigError`]: the device configuration could not be read or is inconsistent.
//! - [`DriverError`]: what driver operations return; wraps the two above and
//!   compile errors so experiment code can abort the run with one message.

use std::path::PathBuf;
use std::time::Duration;

use dspcompiler_backend::CompileError;
use thiserror::Error;

/// Result alias for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Connection to the sequencer was lost")]
    Disconnected,

    #[error("Remote call timed out")]
    TimedOut,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Invalid(String),

    #[error("Invalid channel configuration: {0}")]
    Channel(#[from] CompileError),
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Sequencer call '{call}' failed after {attempts} attempt(s): {source}")]
    Link {
        call: &'static str,
        attempts: u32,
        #[source]
        source: LinkError,
    },

    #[error("Sequencer did not report completion within {timeout:?}")]
    CompletionTimeout { timeout: Duration },

    #[error("Invalid table slice {start}..{stop} of a table with {len} entries")]
    InvalidRange { start: usize, stop: usize, len: usize },

    #[error("Device does not control line '{0}'")]
    UnknownLine(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
