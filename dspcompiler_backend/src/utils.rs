use std::time::Instant;

use tracing::debug;

// Utility class for time-tracking of compile stages
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since construction or the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, stage: &str) -> f64 {
        let diff = self.tick();
        debug!(stage, elapsed_ms = diff, "compile stage finished");
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

// Assuming ticks are in rising order (does not check).
// Returns the number of entries whose tick is at or before `pos`, i.e. the
// index one past the entry that is in effect at `pos`.
pub fn binfind_rows_until(ticks: impl Fn(usize) -> u32, len: usize, pos: f64) -> usize {
    let mut low: i64 = 0;
    let mut high: i64 = len as i64 - 1;
    while low <= high {
        let mid = ((low + high) / 2) as usize;
        if (ticks(mid) as f64) <= pos {
            low = mid as i64 + 1;
        } else {
            high = mid as i64 - 1;
        }
    }
    low as usize
}
