//! Per-channel analog tables.
//!
//! Each of the 4 hardware channels gets its own `(tick, adu)` table. On the
//! DSP the sequencer treats every uploaded value as an offset from wherever
//! the output currently sits, so values are rebased against the previous
//! profile's final positions when the variant asks for it.

use crate::action::*;
use crate::channel::{ChannelMap, NUM_ANALOG};
use crate::digital::DigitalRow;
use crate::error::{CompileError, Result};
use crate::time::TickGrid;

/// One row of an analog table: `(tick - base_tick, adu)`.
///
/// `adu` is signed and lies in `i32::MIN..=u32::MAX`; rebased values go
/// negative and are written to the wire as their two's complement `u32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AnalogRow {
    pub tick: u32,
    pub adu: i64,
}

impl AnalogRow {
    pub fn new(tick: u32, adu: i64) -> Self {
        Self { tick, adu }
    }
}

pub type AnalogTables = [Vec<AnalogRow>; NUM_ANALOG];

/// Table of a channel without actions.
pub fn placeholder_table() -> Vec<AnalogRow> {
    vec![AnalogRow::new(0, 0)]
}

/// Builds the 4 analog tables on `grid`.
///
/// Digital-word actions in `actions` are skipped.
pub fn build_analog_tables(
    actions: &[Action],
    grid: &TickGrid,
    map: &ChannelMap,
    last_analog: &[i64; NUM_ANALOG],
    rebase: bool,
) -> Result<AnalogTables> {
    let mut tables: [Vec<AnalogRow>; NUM_ANALOG] = Default::default();
    let mut seen = TickValues::default();

    for action in actions {
        let chan = match action.target {
            ChannelRef::Analog(chan) => chan,
            _ => continue,
        };
        let handler = || map.describe(action.target);
        let line = map
            .analog_line(chan)
            .ok_or_else(|| CompileError::UnroutableHandler {
                handler: handler(),
                time: action.time,
            })?;
        let tick = grid.tick_of(action.time);
        if !seen.record(tick, action, map)? {
            continue;
        }
        let absolute = line
            .to_adu(&action.value)
            .map_err(|reason| CompileError::InvalidActionValue {
                handler: handler(),
                time: action.time,
                value: action.value.to_string(),
                reason,
            })?;
        let offset = if rebase {
            last_analog[line.hw_channel]
        } else {
            0
        };
        let adu = absolute
            .checked_sub(offset)
            .filter(|adu| (i32::MIN as i64..=u32::MAX as i64).contains(adu))
            .ok_or_else(|| CompileError::AnalogValueOutOfRange {
                handler: handler(),
                time: action.time,
                adu: absolute as i128 - offset as i128,
            })?;
        tables[line.hw_channel].push(AnalogRow::new(grid.rebase(tick)?, adu));
    }

    for table in tables.iter_mut().filter(|t| t.is_empty()) {
        *table = placeholder_table();
    }
    Ok(tables)
}

/// Appends a digital row one tick after the last analog row if analog
/// activity reaches the end of the digital table; the sequencer drops
/// trailing analog rows otherwise.
///
/// Returns whether a row was appended.
pub fn fixup_trailing_analog(
    digital: &mut Vec<DigitalRow>,
    analog: &AnalogTables,
    final_value: u32,
) -> bool {
    let last_analog = analog
        .iter()
        .filter_map(|table| table.last())
        .map(|row| row.tick)
        .max()
        .unwrap_or(0);
    let last_digital = digital.last().map_or(0, |row| row.tick);
    if digital.is_empty() || last_analog >= last_digital {
        digital.push(DigitalRow::new(last_analog.saturating_add(1), final_value));
        true
    } else {
        false
    }
}
