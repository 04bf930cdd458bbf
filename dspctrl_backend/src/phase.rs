use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Where a device is in the execution of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ProfileReady,
    Uploading,
    Armed,
    Triggered,
    AwaitingCompletion,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::ProfileReady => "profile ready",
            Phase::Uploading => "uploading",
            Phase::Armed => "armed",
            Phase::Triggered => "triggered",
            Phase::AwaitingCompletion => "awaiting completion",
        };
        f.write_str(name)
    }
}

/// Broadcasts phase changes of one device.
///
/// Every `set` bumps a change counter under the same mutex as the phase so
/// observers can tell which changes they have already seen.
pub struct PhaseWatch {
    state: Arc<Mutex<(usize, Phase)>>, // (change_num, phase)
    condvar: Arc<Condvar>,
}

impl Default for PhaseWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseWatch {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new((0, Phase::Idle))),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn get(&self) -> Phase {
        self.state.lock().1
    }

    pub fn set(&self, phase: Phase) {
        let mut guard = self.state.lock();
        let (change_num, current) = &mut *guard;
        *current = phase;
        *change_num += 1;
        self.condvar.notify_all();
    }

    /// Blocks until the device is in `phase` or `timeout` expires.
    /// Returns whether the phase was reached.
    pub fn wait_for(&self, phase: Phase, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock();
        while guard.1 != phase {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                return guard.1 == phase;
            }
        }
        true
    }

    /// Observer that sees every change posted after this call.
    pub fn new_recvr(&self) -> PhaseRecvr {
        // Changes posted so far are considered seen
        let (change_num, _phase) = &*self.state.lock();
        PhaseRecvr {
            state: self.state.clone(),
            condvar: self.condvar.clone(),
            viewed_change_num: *change_num,
        }
    }
}

pub struct PhaseRecvr {
    state: Arc<Mutex<(usize, Phase)>>,
    condvar: Arc<Condvar>,
    viewed_change_num: usize,
}

impl PhaseRecvr {
    /// Waits for the next unseen change and returns the phase current at that
    /// point. Changes posted in quick succession coalesce into the latest one.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Phase> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock();
        while guard.0 == self.viewed_change_num {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        let (change_num, phase) = &*guard;
        if *change_num == self.viewed_change_num {
            return None;
        }
        self.viewed_change_num = *change_num;
        Some(*phase)
    }
}

#[cfg(test)]
mod test {
    use crate::phase::*;
    use std::thread;

    #[test]
    fn starts_idle() {
        let watch = PhaseWatch::new();
        assert_eq!(watch.get(), Phase::Idle);
        assert!(watch.wait_for(Phase::Idle, Duration::ZERO));
    }

    #[test]
    fn wait_for_times_out() {
        let watch = PhaseWatch::new();
        assert!(!watch.wait_for(Phase::Armed, Duration::from_millis(10)));
    }

    #[test]
    fn wait_for_sees_other_thread() {
        let watch = Arc::new(PhaseWatch::new());
        let setter = watch.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set(Phase::AwaitingCompletion);
        });
        assert!(watch.wait_for(Phase::AwaitingCompletion, Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn recvr_skips_changes_posted_before_creation() {
        let watch = PhaseWatch::new();
        watch.set(Phase::Uploading);
        let mut recvr = watch.new_recvr();
        assert_eq!(recvr.recv_timeout(Duration::from_millis(5)), None);
        watch.set(Phase::Armed);
        assert_eq!(recvr.recv_timeout(Duration::from_millis(5)), Some(Phase::Armed));
    }
}
