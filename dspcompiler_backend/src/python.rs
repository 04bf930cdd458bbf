//! Python bindings, enabled with the `python` feature.
//!
//! Exposes a stateful `ProfileCompiler` that keeps the baseline and the last
//! compiled profile between calls, so a Python device module can hand over
//! `(time, handler name, value)` tuples and get back the header bytes and
//! the tables as numpy arrays.

use numpy::{IntoPyArray, PyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyBytes};

use crate::action::*;
use crate::channel::*;
use crate::compiler::*;
use crate::error::CompileError;
use crate::profile::*;
use crate::quirks::*;
use crate::time::ActionTime;

impl From<CompileError> for PyErr {
    fn from(err: CompileError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

fn extract_time(obj: &PyAny) -> PyResult<ActionTime> {
    // str() keeps Decimal precision and works for floats and ints alike
    Ok(obj.str()?.to_str()?.parse::<ActionTime>()?)
}

fn extract_value(obj: &PyAny) -> PyResult<ActionValue> {
    if let Ok(b) = obj.downcast::<PyBool>() {
        return Ok(ActionValue::Bool(b.is_true()));
    }
    Ok(ActionValue::Float(obj.extract::<f64>()?))
}

#[pyclass(name = "ProfileCompiler")]
pub struct PyProfileCompiler {
    map: ChannelMap,
    quirks: Quirks,
    ticks_per_ms: u32,
    baseline: Baseline,
    prev_profile: Option<Profile>,
}

impl PyProfileCompiler {
    fn compiler(&self) -> ProfileCompiler {
        ProfileCompiler::with_quirks(self.map.clone(), self.quirks, self.ticks_per_ms)
    }
}

#[pymethods]
impl PyProfileCompiler {
    #[new]
    #[pyo3(signature = (variant = "dsp", ticks_per_ms = None))]
    fn new(variant: &str, ticks_per_ms: Option<u32>) -> PyResult<Self> {
        let variant: HardwareVariant = variant.parse().map_err(PyValueError::new_err)?;
        let ticks_per_ms = ticks_per_ms.unwrap_or_else(|| variant.ticks_per_ms());
        if ticks_per_ms == 0 {
            return Err(PyValueError::new_err("ticks_per_ms must be positive"));
        }
        Ok(Self {
            map: ChannelMap::new(),
            quirks: variant.quirks(),
            ticks_per_ms,
            baseline: Baseline::default(),
            prev_profile: None,
        })
    }

    fn add_digital_line(&mut self, name: &str, bit: u32) -> PyResult<()> {
        self.map.add_digital_line(name, bit)?;
        Ok(())
    }

    fn add_analog_line(
        &mut self,
        name: &str,
        hw_channel: usize,
        units_per_adu: f64,
    ) -> PyResult<()> {
        self.map
            .add_analog_line(name, AnalogLine::linear(hw_channel, units_per_adu))?;
        Ok(())
    }

    fn add_indexed_line(
        &mut self,
        name: &str,
        hw_channel: usize,
        levels: Vec<f64>,
        adu_per_unit: f64,
    ) -> PyResult<()> {
        self.map
            .add_analog_line(name, AnalogLine::indexed(hw_channel, levels, adu_per_unit))?;
        Ok(())
    }

    fn num_runnable_lines(&self, table: Vec<(&PyAny, String, &PyAny)>, index: usize) -> usize {
        table
            .iter()
            .skip(index)
            .take_while(|(_, name, _)| self.map.contains(name))
            .count()
    }

    /// Compiles `[(time, name, value), ...]` and advances the baseline.
    ///
    /// Returns `(header, digital, [analog; 4], changed)` where `changed` tells
    /// whether the profile differs from the previous one.
    #[pyo3(signature = (table, rep_duration = None))]
    fn compile<'py>(
        &mut self,
        py: Python<'py>,
        table: Vec<(&PyAny, String, &PyAny)>,
        rep_duration: Option<&PyAny>,
    ) -> PyResult<(&'py PyBytes, &'py PyArray2<u32>, Vec<&'py PyArray2<u32>>, bool)> {
        let entries = table
            .into_iter()
            .map(|(time, handler, value)| {
                Ok(TableEntry {
                    time: extract_time(time)?,
                    handler,
                    value: extract_value(value)?,
                })
            })
            .collect::<PyResult<Vec<_>>>()?;
        let rep_duration = rep_duration.map(extract_time).transpose()?;

        let out = self
            .compiler()
            .compile_table(&entries, rep_duration, &self.baseline)?;
        self.baseline = out.next_baseline;
        let changed = should_upload(&out.profile, self.prev_profile.as_ref());

        let header = PyBytes::new(py, &out.profile.header_bytes());
        let (digital, analog) = out.profile.to_arrays();
        let analog = analog.into_iter().map(|a| a.into_pyarray(py)).collect();
        self.prev_profile = Some(out.profile);
        Ok((header, digital.into_pyarray(py), analog, changed))
    }

    /// Samples the last compiled profile, see `Profile::calc_signal_nsamps`.
    fn calc_signal_nsamps<'py>(
        &self,
        py: Python<'py>,
        start: u32,
        end: u32,
        nsamps: usize,
    ) -> PyResult<&'py PyArray2<f64>> {
        let profile = self
            .prev_profile
            .as_ref()
            .ok_or_else(|| PyValueError::new_err("No profile has been compiled yet"))?;
        if end <= start {
            return Err(PyValueError::new_err(format!(
                "Invalid sampling interval {}-{}",
                start, end
            )));
        }
        Ok(profile.calc_signal_nsamps(start, end, nsamps).into_pyarray(py))
    }

    fn last_digital(&self) -> u32 {
        self.baseline.last_digital
    }

    fn last_analog(&self) -> [i64; NUM_ANALOG] {
        self.baseline.last_analog
    }

    /// Forgets the baseline and the cached profile, as at experiment start.
    fn reset(&mut self) {
        self.baseline = Baseline::default();
        self.prev_profile = None;
    }
}

#[pymodule]
fn dspcompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyProfileCompiler>()?;
    Ok(())
}
