//! Reconstruction of the cumulative digital output word.
//!
//! The sequencer outputs a 32-bit word per row. Actions only say "turn this
//! line on/off", so the word is rebuilt by adding or subtracting each line's
//! bit from a running value seeded with the previous profile's final word.
//! Every action writes the running value into its tick's row, and rows without
//! any action keep the carried-over baseline, so analog-only rows never zero
//! the outputs.
//!
//! Packed secondary channels live in the same word: their position replaces
//! everything above `shift` while the low bits are kept.

use std::collections::HashMap;

use crate::action::*;
use crate::channel::ChannelMap;
use crate::error::{CompileError, Result};
use crate::time::TickGrid;

/// One row of the digital table: `(tick - base_tick, word)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DigitalRow {
    pub tick: u32,
    pub mask: u32,
}

impl DigitalRow {
    pub fn new(tick: u32, mask: u32) -> Self {
        Self { tick, mask }
    }
}

/// Digital rows plus the running word after the last action.
///
/// `final_value` may differ from the last row's mask when the grid was
/// extended by a repetition-duration tick.
#[derive(Clone, Debug, PartialEq)]
pub struct DigitalTable {
    pub rows: Vec<DigitalRow>,
    pub final_value: u32,
}

/// Row index of `tick`. Panics if `actions` and `grid` disagree.
pub(crate) fn row_index(grid: &TickGrid, tick: i64) -> usize {
    grid.index_of(tick)
        .unwrap_or_else(|| panic!("tick {} is not on the quantized grid", tick))
}

/// Builds the digital table on `grid`.
///
/// `actions` must be in time order and be the actions `grid` was quantized
/// from. Analog actions are accepted and only write the running word into
/// their row.
///
/// ```
/// use dspcompiler_backend::*;
///
/// let mut map = ChannelMap::new();
/// let light = map.add_digital_line("light_488", 0).unwrap();
/// let camera = map.add_digital_line("camera_A", 1).unwrap();
/// let ms = ActionTime::from_millis;
/// let actions = vec![
///     Action::digital(ms(0), light, true),
///     Action::digital(ms(0), camera, true),
///     Action::digital(ms(10), light, false),
///     Action::digital(ms(10), camera, false),
/// ];
/// let grid = quantize(&actions, 10, None, true).unwrap();
/// let table = build_digital_table(&actions, &grid, &map, 0).unwrap();
/// assert_eq!(table.rows, vec![DigitalRow::new(0, 0b11), DigitalRow::new(100, 0)]);
/// ```
pub fn build_digital_table(
    actions: &[Action],
    grid: &TickGrid,
    map: &ChannelMap,
    last_digital: u32,
) -> Result<DigitalTable> {
    let mut rows = grid
        .ticks()
        .iter()
        .map(|&tick| Ok(DigitalRow::new(grid.rebase(tick)?, last_digital)))
        .collect::<Result<Vec<_>>>()?;

    let mut running = last_digital as i64;
    // Keyed by bit, so lines sharing a bit share a state
    let mut bit_state: HashMap<u32, bool> = HashMap::new();
    let mut seen = TickValues::default();

    for action in actions {
        let tick = grid.tick_of(action.time);
        let index = row_index(grid, tick);
        if action.target.is_digital_word() && seen.record(tick, action, map)? {
            running = match action.target {
                ChannelRef::Digital(line) => {
                    apply_line(action, line, map, running, &mut bit_state)?
                }
                ChannelRef::PackedSecondary(chan, _) => apply_packed(action, chan, map, running)?,
                ChannelRef::Analog(_) => running,
            };
            if running > u32::MAX as i64 {
                return Err(CompileError::DigitalOverflow {
                    handler: map.describe(action.target),
                    time: action.time,
                    value: running,
                });
            }
        }
        rows[index].mask = running as u32;
    }

    if grid.is_padded() {
        if let Some(last) = rows.last_mut() {
            last.mask = running as u32;
        }
    }

    Ok(DigitalTable {
        rows,
        final_value: running as u32,
    })
}

fn apply_line(
    action: &Action,
    line: LineId,
    map: &ChannelMap,
    running: i64,
    bit_state: &mut HashMap<u32, bool>,
) -> Result<i64> {
    let handler = || map.describe(action.target);
    let bit = map
        .digital_mask(line)
        .ok_or_else(|| CompileError::UnroutableHandler {
            handler: handler(),
            time: action.time,
        })?;
    let on = action
        .value
        .as_bool()
        .ok_or_else(|| CompileError::InvalidActionValue {
            handler: handler(),
            time: action.time,
            value: action.value.to_string(),
            reason: "digital lines take on/off values".to_string(),
        })?;

    if bit_state.insert(bit, on) == Some(on) {
        return Ok(running);
    }
    let addend = if on { bit as i64 } else { -(bit as i64) };
    if running + addend < 0 {
        return Err(CompileError::DigitalUnderflow {
            handler: handler(),
            time: action.time,
            current: running,
            addend,
        });
    }
    Ok(running + addend)
}

fn apply_packed(action: &Action, chan: ChannelId, map: &ChannelMap, running: i64) -> Result<i64> {
    let handler = || map.describe(action.target);
    let packed = map
        .packed_channel(chan)
        .ok_or_else(|| CompileError::UnroutableHandler {
            handler: handler(),
            time: action.time,
        })?;
    let step = action
        .value
        .as_f64()
        .filter(|v| v.fract() == 0.)
        .ok_or_else(|| CompileError::InvalidActionValue {
            handler: handler(),
            time: action.time,
            value: action.value.to_string(),
            reason: "expected an integral step".to_string(),
        })? as i64;
    let target = packed
        .target(step)
        .map_err(|idx| CompileError::PackedValueOutOfRange {
            handler: handler(),
            time: action.time,
            value: idx as i64,
            max: packed.bases.len() as i64 - 1,
        })?;
    if !(0..=packed.max_value).contains(&target) {
        return Err(CompileError::PackedValueOutOfRange {
            handler: handler(),
            time: action.time,
            value: target,
            max: packed.max_value,
        });
    }
    Ok((running & packed.low_mask as i64) + (target << packed.shift))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::channel::*;
    use crate::digital::*;
    use crate::time::*;

    fn ms(t: i64) -> ActionTime {
        ActionTime::from_millis(t)
    }

    fn lines() -> (ChannelMap, LineId, LineId) {
        let mut map = ChannelMap::new();
        let a = map.add_digital_line("light", 0).unwrap();
        let b = map.add_digital_line("camera", 1).unwrap();
        (map, a, b)
    }

    fn build(actions: &[Action], map: &ChannelMap, last: u32) -> Result<DigitalTable> {
        let grid = quantize(actions, 10, None, true)?;
        build_digital_table(actions, &grid, map, last)
    }

    #[test]
    fn single_action_is_padded_with_final_value() {
        let (map, a, _) = lines();
        let table = build(&[Action::digital(ms(3), a, true)], &map, 0).unwrap();
        assert_eq!(table.rows, vec![DigitalRow::new(0, 1), DigitalRow::new(1, 1)]);
    }

    #[test]
    fn analog_rows_keep_the_running_word() {
        let (mut map, a, _) = lines();
        let z = map.add_analog_line("z", AnalogLine::linear(0, 1.)).unwrap();
        let actions = vec![
            Action::digital(ms(0), a, true),
            Action::analog(ms(5), z, 3.),
            Action::digital(ms(10), a, false),
        ];
        let table = build(&actions, &map, 0b100).unwrap();
        assert_eq!(
            table.rows,
            vec![
                DigitalRow::new(0, 0b101),
                DigitalRow::new(50, 0b101),
                DigitalRow::new(100, 0b100),
            ]
        );
        assert_eq!(table.final_value, 0b100);
    }

    #[test]
    fn rep_padding_row_holds_the_baseline() {
        let (map, a, _) = lines();
        let actions = vec![Action::digital(ms(0), a, true), Action::digital(ms(1), a, false)];
        let grid = quantize(&actions, 10, Some(ms(5)), true).unwrap();
        let table = build_digital_table(&actions, &grid, &map, 0b10).unwrap();
        assert_eq!(table.rows.last(), Some(&DigitalRow::new(50, 0b10)));
    }

    #[test]
    fn turning_off_an_off_line_underflows() {
        let (map, a, _) = lines();
        let err = build(&[Action::digital(ms(0), a, false)], &map, 0).unwrap_err();
        assert!(matches!(
            err,
            CompileError::DigitalUnderflow { current: 0, addend: -1, .. }
        ));
    }

    #[test]
    fn conflicting_values_at_one_tick() {
        let (map, a, _) = lines();
        let actions = vec![
            Action::digital(ActionTime::new(100, 1), a, true),
            Action::digital(ActionTime::new(1001, 2), a, false),
        ];
        let err = build(&actions, &map, 0).unwrap_err();
        assert!(matches!(err, CompileError::ConflictingAction { tick: 100, .. }));
    }

    #[test]
    fn identical_repeats_are_ignored() {
        let (map, a, b) = lines();
        let actions = vec![
            Action::digital(ms(0), a, true),
            Action::digital(ms(0), b, true),
            Action::digital(ms(0), a, true),
            Action::digital(ms(2), b, false),
        ];
        let table = build(&actions, &map, 0).unwrap();
        assert_eq!(table.rows[0].mask, 0b11);
        assert_eq!(table.rows[1].mask, 0b01);
    }

    #[test]
    fn baseline_carries_between_calls() {
        let (map, a, b) = lines();
        let first = build(
            &[Action::digital(ms(0), a, true), Action::digital(ms(1), b, true)],
            &map,
            0,
        )
        .unwrap();
        assert_eq!(first.final_value, 0b11);
        let second = build(
            &[Action::digital(ms(5), b, false), Action::digital(ms(6), a, false)],
            &map,
            first.final_value,
        )
        .unwrap();
        assert_eq!(second.rows[0].mask, 0b01);
        assert_eq!(second.rows[1].mask, 0);
    }

    #[test]
    fn invalid_digital_value() {
        let (map, a, _) = lines();
        let err = build(&[Action::new(ms(0), a, 0.5)], &map, 0).unwrap_err();
        assert!(matches!(err, CompileError::InvalidActionValue { .. }));
    }

    fn phase_map(angle: usize) -> (ChannelMap, ChannelRef, LineId) {
        let mut map = ChannelMap::new();
        let cam = map.add_digital_line("West", 0).unwrap();
        let phase = map
            .add_packed_secondary(
                "SI phase",
                PackedChannel {
                    shift: 16,
                    low_mask: 0xffff,
                    max_value: 0x3fff,
                    bases: vec![8000, 9500, 9500],
                    steps: vec![679, 678, 683],
                    position_source: Arc::new(move || angle),
                },
            )
            .unwrap();
        (map, phase, cam)
    }

    #[test]
    fn packed_phase_replaces_high_bits() {
        let (map, phase, cam) = phase_map(1);
        let actions = vec![
            Action::digital(ms(0), cam, true),
            Action::new(ms(1), phase, 2.),
            Action::digital(ms(2), cam, false),
        ];
        let table = build(&actions, &map, 0).unwrap();
        let packed = (9500 + 2 * 678) << 16;
        assert_eq!(table.rows[1].mask, packed + 1);
        assert_eq!(table.rows[2].mask, packed);
    }

    #[test]
    fn packed_phase_out_of_range() {
        let (map, phase, _) = phase_map(0);
        let err = build(&[Action::new(ms(0), phase, 20.)], &map, 0).unwrap_err();
        assert_eq!(
            err,
            CompileError::PackedValueOutOfRange {
                handler: "SI phase".to_string(),
                time: ms(0),
                value: 8000 + 20 * 679,
                max: 0x3fff,
            }
        );

        let (map, phase, _) = phase_map(5);
        let err = build(&[Action::new(ms(0), phase, 0.)], &map, 0).unwrap_err();
        assert!(matches!(err, CompileError::PackedValueOutOfRange { value: 5, max: 2, .. }));
    }

    #[test]
    fn huge_phase_steps_are_out_of_range() {
        let (map, phase, _) = phase_map(1);
        for (step, value) in [(1e17, i64::MAX), (-1e17, i64::MIN)] {
            let err = build(&[Action::new(ms(0), phase, step)], &map, 0).unwrap_err();
            assert_eq!(
                err,
                CompileError::PackedValueOutOfRange {
                    handler: "SI phase".to_string(),
                    time: ms(0),
                    value,
                    max: 0x3fff,
                }
            );
        }
    }

    #[test]
    fn foreign_reference_is_unroutable() {
        let (map, _, _) = lines();
        let mut other = ChannelMap::new();
        for bit in 0..5 {
            other.add_digital_line(&format!("line{}", bit), bit).unwrap();
        }
        let foreign = other.resolve("line4").unwrap();
        let err = build(&[Action::new(ms(0), foreign, true)], &map, 0).unwrap_err();
        assert!(matches!(err, CompileError::UnroutableHandler { .. }));
    }
}
