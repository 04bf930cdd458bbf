//! Per-variant behavioral switches of the profile compiler.
//!
//! The DSP card and its FPGA successor accept the same profile layout but
//! differ in a few details that must be reproduced bit for bit.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use maplit::btreemap;

/// Compile-time switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quirks {
    /// Append `last + 1` to single-timepoint grids.
    pub pad_single_timepoint: bool,
    /// Append a trailing analog row when analog activity reaches the end of the profile.
    pub fixup_trailing_analog: bool,
    /// Emit analog values as deltas against the previous profile's final values.
    pub rebase_analog_across_profiles: bool,
}

/// Supported sequencer variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HardwareVariant {
    Dsp,
    CrioFpga,
    UcsfOmx,
}

impl HardwareVariant {
    pub fn quirks(&self) -> Quirks {
        match self {
            HardwareVariant::Dsp => Quirks {
                pad_single_timepoint: true,
                fixup_trailing_analog: true,
                rebase_analog_across_profiles: true,
            },
            HardwareVariant::CrioFpga => Quirks {
                pad_single_timepoint: true,
                fixup_trailing_analog: false,
                rebase_analog_across_profiles: false,
            },
            HardwareVariant::UcsfOmx => Quirks {
                pad_single_timepoint: true,
                fixup_trailing_analog: true,
                rebase_analog_across_profiles: false,
            },
        }
    }

    pub fn ticks_per_ms(&self) -> u32 {
        match self {
            HardwareVariant::Dsp | HardwareVariant::UcsfOmx => 10,
            HardwareVariant::CrioFpga => 1000,
        }
    }

    /// Camera trigger lines wired on every unit of this variant.
    pub fn default_camera_lines(&self) -> BTreeMap<&'static str, u32> {
        match self {
            HardwareVariant::UcsfOmx => btreemap! {
                "West" => 0,
                "Northwest" => 1,
                "Northeast" => 2,
                "East" => 3,
            },
            _ => BTreeMap::new(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareVariant::Dsp => "dsp",
            HardwareVariant::CrioFpga => "crio_fpga",
            HardwareVariant::UcsfOmx => "ucsf_omx",
        }
    }
}

impl Default for HardwareVariant {
    fn default() -> Self {
        HardwareVariant::Dsp
    }
}

impl fmt::Display for HardwareVariant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HardwareVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dsp" => Ok(HardwareVariant::Dsp),
            "crio_fpga" | "fpga" => Ok(HardwareVariant::CrioFpga),
            "ucsf_omx" | "omx" => Ok(HardwareVariant::UcsfOmx),
            other => Err(format!(
                "unknown hardware variant '{}', expected one of dsp, crio_fpga, ucsf_omx",
                other
            )),
        }
    }
}
