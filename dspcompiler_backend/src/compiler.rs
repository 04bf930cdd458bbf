//! Entry point tying the compile stages together.
//!
//! [`ProfileCompiler::compile`] runs quantization, digital reconstruction,
//! analog table generation, the trailing-analog fixup and header assembly
//! with the quirks of one hardware variant. The compiler is pure: the only
//! state carried between calls is the [`Baseline`], which the caller threads
//! through in call order.

use tracing::debug;

use crate::action::*;
use crate::analog::*;
use crate::channel::{ChannelMap, NUM_ANALOG};
use crate::digital::*;
use crate::error::{CompileError, Result};
use crate::profile::*;
use crate::quirks::*;
use crate::time::*;
use crate::utils::TickTimer;

/// Output state at the end of the previously executed profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Baseline {
    pub last_digital: u32,
    pub last_analog: [i64; NUM_ANALOG],
}

/// Result of one compile call.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledProfile {
    pub profile: Profile,
    /// Baseline to pass to the next compile once this profile has run.
    pub next_baseline: Baseline,
    /// Running digital word after the last action.
    pub final_digital: u32,
    pub grid: TickGrid,
}

/// Compiler configured for one sequencer.
#[derive(Clone, Debug)]
pub struct ProfileCompiler {
    map: ChannelMap,
    quirks: Quirks,
    ticks_per_ms: u32,
}

impl ProfileCompiler {
    /// Compiler with the preset quirks and clock of `variant`.
    pub fn new(map: ChannelMap, variant: HardwareVariant) -> Self {
        Self::with_quirks(map, variant.quirks(), variant.ticks_per_ms())
    }

    pub fn with_quirks(map: ChannelMap, quirks: Quirks, ticks_per_ms: u32) -> Self {
        assert!(ticks_per_ms > 0, "Sequencer resolution must be positive");
        Self {
            map,
            quirks,
            ticks_per_ms,
        }
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    pub fn ticks_per_ms(&self) -> u32 {
        self.ticks_per_ms
    }

    /// Resolves handler names into actions.
    pub fn resolve_table(&self, entries: &[TableEntry]) -> Result<Vec<Action>> {
        entries
            .iter()
            .map(|entry| {
                let target = self.map.resolve(&entry.handler).ok_or_else(|| {
                    CompileError::UnroutableHandler {
                        handler: entry.handler.clone(),
                        time: entry.time,
                    }
                })?;
                Ok(Action {
                    time: entry.time,
                    target,
                    value: entry.value,
                })
            })
            .collect()
    }

    /// Number of leading entries from `index` on whose handler this compiler knows.
    pub fn num_runnable(&self, entries: &[TableEntry], index: usize) -> usize {
        entries
            .iter()
            .skip(index)
            .take_while(|entry| self.map.contains(&entry.handler))
            .count()
    }

    /// Compiles a slice of the experiment's action table.
    pub fn compile_table(
        &self,
        entries: &[TableEntry],
        rep_duration: Option<ActionTime>,
        baseline: &Baseline,
    ) -> Result<CompiledProfile> {
        let actions = self.resolve_table(entries)?;
        self.compile(&actions, rep_duration, baseline)
    }

    /// Compiles time-ordered actions into a profile.
    ///
    /// ```
    /// use dspcompiler_backend::*;
    ///
    /// let mut map = ChannelMap::new();
    /// let light = map.add_digital_line("light_488", 0).unwrap();
    /// let compiler = ProfileCompiler::new(map, HardwareVariant::Dsp);
    /// let actions = vec![
    ///     Action::digital(ActionTime::from_millis(0), light, true),
    ///     Action::digital(ActionTime::from_millis(10), light, false),
    /// ];
    /// let out = compiler.compile(&actions, None, &Baseline::default()).unwrap();
    /// assert_eq!(out.profile.runtime(), 100);
    /// assert_eq!(out.next_baseline.last_digital, 0);
    /// ```
    pub fn compile(
        &self,
        actions: &[Action],
        rep_duration: Option<ActionTime>,
        baseline: &Baseline,
    ) -> Result<CompiledProfile> {
        let mut timer = TickTimer::new();
        let grid = quantize(
            actions,
            self.ticks_per_ms,
            rep_duration,
            self.quirks.pad_single_timepoint,
        )?;
        timer.tick_log("quantize");

        let DigitalTable {
            mut rows,
            final_value,
        } = build_digital_table(actions, &grid, &self.map, baseline.last_digital)?;
        timer.tick_log("digital");

        let analog = build_analog_tables(
            actions,
            &grid,
            &self.map,
            &baseline.last_analog,
            self.quirks.rebase_analog_across_profiles,
        )?;
        let fixed = self.quirks.fixup_trailing_analog
            && fixup_trailing_analog(&mut rows, &analog, final_value);
        if fixed {
            debug!("appended trailing digital row after analog activity");
        }
        timer.tick_log("analog");

        let profile = assemble(rows, analog, self.ticks_per_ms, baseline.last_digital);
        let next_baseline = self.next_baseline(actions, &profile, baseline);
        debug!(
            runtime = profile.runtime(),
            n_digital = profile.header.n_digital,
            n_analog = ?profile.header.n_analog,
            "assembled profile"
        );
        Ok(CompiledProfile {
            profile,
            next_baseline,
            final_digital: final_value,
            grid,
        })
    }

    fn next_baseline(&self, actions: &[Action], profile: &Profile, old: &Baseline) -> Baseline {
        let mut touched = [false; NUM_ANALOG];
        for action in actions {
            if let ChannelRef::Analog(chan) = action.target {
                if let Some(line) = self.map.analog_line(chan) {
                    touched[line.hw_channel] = true;
                }
            }
        }
        let mut next = *old;
        next.last_digital = profile.digital.last().map_or(old.last_digital, |row| row.mask);
        for ch in 0..NUM_ANALOG {
            if !touched[ch] {
                continue;
            }
            if let Some(row) = profile.analog[ch].last() {
                next.last_analog[ch] = if self.quirks.rebase_analog_across_profiles {
                    row.adu + old.last_analog[ch]
                } else {
                    row.adu
                };
            }
        }
        next
    }
}

#[cfg(test)]
mod test {
    use crate::channel::*;
    use crate::compiler::*;

    fn ms(t: i64) -> ActionTime {
        ActionTime::from_millis(t)
    }

    fn compiler(variant: HardwareVariant) -> (ProfileCompiler, LineId, ChannelId) {
        let mut map = ChannelMap::new();
        let light = map.add_digital_line("light", 0).unwrap();
        let z = map.add_analog_line("z", AnalogLine::linear(1, 0.5)).unwrap();
        (ProfileCompiler::new(map, variant), light, z)
    }

    #[test]
    fn rebased_baseline_accumulates() {
        let (c, light, z) = compiler(HardwareVariant::Dsp);
        let actions = vec![Action::digital(ms(0), light, true), Action::analog(ms(1), z, 10.)];
        let first = c.compile(&actions, None, &Baseline::default()).unwrap();
        assert_eq!(first.profile.analog[1], vec![AnalogRow::new(10, 20)]);
        assert_eq!(first.next_baseline.last_analog, [0, 20, 0, 0]);
        assert_eq!(first.next_baseline.last_digital, 1);

        // Same target again is a zero delta
        let second = c.compile(&actions[1..], None, &first.next_baseline).unwrap();
        assert_eq!(second.profile.analog[1], vec![AnalogRow::new(0, 0)]);
        assert_eq!(second.next_baseline.last_analog, [0, 20, 0, 0]);
        assert_eq!(second.profile.header.init_dio, 1);
    }

    #[test]
    fn fpga_keeps_absolute_values() {
        let (c, light, z) = compiler(HardwareVariant::CrioFpga);
        let baseline = Baseline {
            last_digital: 0,
            last_analog: [0, 7, 0, 0],
        };
        let actions = vec![Action::digital(ms(0), light, true), Action::analog(ms(1), z, 10.)];
        let out = c.compile(&actions, None, &baseline).unwrap();
        assert_eq!(out.profile.analog[1], vec![AnalogRow::new(1000, 20)]);
        assert_eq!(out.next_baseline.last_analog, [0, 20, 0, 0]);
        // No trailing fixup on the FPGA
        assert_eq!(out.profile.digital.len(), 2);
        assert_eq!(out.profile.header.clock, 1.);
    }

    #[test]
    fn dsp_fixup_follows_trailing_analog() {
        let (c, light, z) = compiler(HardwareVariant::Dsp);
        let actions = vec![Action::digital(ms(0), light, true), Action::analog(ms(10), z, 1.)];
        let out = c.compile(&actions, None, &Baseline::default()).unwrap();
        assert_eq!(
            out.profile.digital,
            vec![DigitalRow::new(0, 1), DigitalRow::new(100, 1), DigitalRow::new(101, 1)]
        );
        assert_eq!(out.profile.runtime(), 101);
        assert_eq!(out.next_baseline.last_digital, 1);
    }

    #[test]
    fn resolve_and_count_runnable() {
        let (c, _, _) = compiler(HardwareVariant::Dsp);
        let table = vec![
            TableEntry::new(ms(0), "light", true),
            TableEntry::new(ms(1), "z", 2.),
            TableEntry::new(ms(2), "stage motor", 1.),
            TableEntry::new(ms(3), "light", false),
        ];
        assert_eq!(c.num_runnable(&table, 0), 2);
        assert_eq!(c.num_runnable(&table, 2), 0);
        assert_eq!(c.num_runnable(&table, 3), 1);
        assert_eq!(c.num_runnable(&table, 9), 0);

        let err = c.compile_table(&table, None, &Baseline::default()).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnroutableHandler {
                handler: "stage motor".to_string(),
                time: ms(2),
            }
        );
        assert!(c.compile_table(&table[..2], None, &Baseline::default()).is_ok());
    }

    #[test]
    fn untouched_channels_keep_their_baseline() {
        let (c, light, _) = compiler(HardwareVariant::CrioFpga);
        let baseline = Baseline {
            last_digital: 0,
            last_analog: [3, 4, 5, 6],
        };
        let out = c
            .compile(&[Action::digital(ms(0), light, true)], None, &baseline)
            .unwrap();
        assert_eq!(out.next_baseline.last_analog, [3, 4, 5, 6]);
    }
}
