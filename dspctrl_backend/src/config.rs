//! TOML description of one sequencer and the outputs wired to it.
//!
//! ```toml
//! name = "DSP"
//! variant = "dsp"
//! completion_timeout_ms = 60000
//!
//! [[digital]]
//! name = "488 shutter"
//! bit = 0
//! kind = "light"
//!
//! [[analog]]
//! name = "z piezo"
//! channel = 0
//! sensitivity = 30.0   # um per volt
//! ```

use std::path::Path;
use std::time::Duration;

use dspcompiler_backend::*;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

fn default_dac_volts() -> f64 {
    10.0
}

fn default_dac_bits() -> u32 {
    16
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_sensitivity() -> f64 {
    1.0
}

fn de_variant<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HardwareVariant, D::Error> {
    let name = String::deserialize(deserializer)?;
    name.parse().map_err(serde::de::Error::custom)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Light,
    Camera,
    #[default]
    Trigger,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DigitalLineConfig {
    pub name: String,
    pub bit: u32,
    #[serde(default)]
    pub kind: LineKind,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalogLineConfig {
    pub name: String,
    pub channel: usize,
    /// Physical units per volt.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    /// Volts applied when an experiment is prepared.
    pub startup: Option<f64>,
    /// Discrete voltages selected by index, e.g. retarder levels.
    pub levels: Option<Vec<f64>>,
}

/// Position packed into the upper bits of the digital word.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackedConfig {
    pub name: String,
    pub shift: u32,
    pub low_mask: u32,
    pub max_value: i64,
    pub bases: Vec<i64>,
    pub steps: Vec<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuirkOverrides {
    pub pad_single_timepoint: Option<bool>,
    pub fixup_trailing_analog: Option<bool>,
    pub rebase_analog_across_profiles: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default, deserialize_with = "de_variant")]
    pub variant: HardwareVariant,
    pub ticks_per_ms: Option<u32>,
    /// Full-scale output range of the DACs.
    #[serde(default = "default_dac_volts")]
    pub dac_volts: f64,
    #[serde(default = "default_dac_bits")]
    pub dac_bits: u32,
    /// No timeout when absent.
    pub completion_timeout_ms: Option<u64>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub quirks: QuirkOverrides,
    #[serde(default)]
    pub digital: Vec<DigitalLineConfig>,
    #[serde(default)]
    pub analog: Vec<AnalogLineConfig>,
    pub packed: Option<PackedConfig>,
}

impl DeviceConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("device name must not be empty".into()));
        }
        if self.ticks_per_ms == Some(0) {
            return Err(ConfigError::Invalid("ticks_per_ms must be positive".into()));
        }
        if !(self.dac_volts > 0.0 && self.dac_volts.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "dac_volts must be positive, got {}",
                self.dac_volts
            )));
        }
        if !(1..=31).contains(&self.dac_bits) {
            return Err(ConfigError::Invalid(format!(
                "dac_bits must be in 1..=31, got {}",
                self.dac_bits
            )));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be at least 1".into()));
        }
        if let Some(packed) = &self.packed {
            if packed.bases.len() != packed.steps.len() {
                return Err(ConfigError::Invalid(format!(
                    "packed channel '{}' has {} bases but {} steps",
                    packed.name,
                    packed.bases.len(),
                    packed.steps.len()
                )));
            }
        }
        Ok(())
    }

    pub fn quirks(&self) -> Quirks {
        let preset = self.variant.quirks();
        Quirks {
            pad_single_timepoint: self
                .quirks
                .pad_single_timepoint
                .unwrap_or(preset.pad_single_timepoint),
            fixup_trailing_analog: self
                .quirks
                .fixup_trailing_analog
                .unwrap_or(preset.fixup_trailing_analog),
            rebase_analog_across_profiles: self
                .quirks
                .rebase_analog_across_profiles
                .unwrap_or(preset.rebase_analog_across_profiles),
        }
    }

    pub fn ticks_per_ms(&self) -> u32 {
        self.ticks_per_ms.unwrap_or_else(|| self.variant.ticks_per_ms())
    }

    pub fn adu_per_volt(&self) -> f64 {
        (1u64 << self.dac_bits) as f64 / self.dac_volts
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    /// Configured digital lines plus the variant's fixed camera lines that
    /// the file does not redefine, as `(name, bit, kind)`.
    pub fn digital_lines(&self) -> Vec<(String, u32, LineKind)> {
        let mut lines: Vec<_> = self
            .variant
            .default_camera_lines()
            .into_iter()
            .filter(|(name, _)| !self.digital.iter().any(|d| d.name == *name))
            .map(|(name, bit)| (name.to_string(), bit, LineKind::Camera))
            .collect();
        lines.extend(self.digital.iter().map(|d| (d.name.clone(), d.bit, d.kind)));
        lines
    }

    /// Builds the compiler's channel registry.
    ///
    /// A packed channel needs `position_source`, which reports the current
    /// position index of the mechanism the channel drives.
    pub fn channel_map(
        &self,
        position_source: Option<PositionSource>,
    ) -> Result<ChannelMap, ConfigError> {
        let mut map = ChannelMap::new();
        for (name, bit, _) in self.digital_lines() {
            map.add_digital_line(&name, bit)?;
        }
        let adu_per_volt = self.adu_per_volt();
        for line in &self.analog {
            let mut analog = match &line.levels {
                Some(levels) => AnalogLine::indexed(line.channel, levels.clone(), adu_per_volt),
                None => AnalogLine::linear(line.channel, line.sensitivity / adu_per_volt),
            };
            if let Some(startup) = line.startup {
                analog = analog.with_startup(startup);
            }
            map.add_analog_line(&line.name, analog)?;
        }
        if let Some(packed) = &self.packed {
            let position_source = position_source.ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "packed channel '{}' needs a position source",
                    packed.name
                ))
            })?;
            map.add_packed_secondary(
                &packed.name,
                PackedChannel {
                    shift: packed.shift,
                    low_mask: packed.low_mask,
                    max_value: packed.max_value,
                    bases: packed.bases.clone(),
                    steps: packed.steps.clone(),
                    position_source,
                },
            )?;
        }
        Ok(map)
    }

    pub fn compiler(
        &self,
        position_source: Option<PositionSource>,
    ) -> Result<ProfileCompiler, ConfigError> {
        let map = self.channel_map(position_source)?;
        Ok(ProfileCompiler::with_quirks(map, self.quirks(), self.ticks_per_ms()))
    }
}
