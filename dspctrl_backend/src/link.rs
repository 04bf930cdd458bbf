//! Connection to the remote sequencer.
//!
//! The real transport is an RPC proxy to the computer hosting the DSP or FPGA
//! card. The driver only needs the handful of calls in [`SequencerLink`]; any
//! RPC framework can implement it. [`LoopbackLink`] is an in-process stand-in
//! that records every call, used by the demo binary and the tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use dspcompiler_backend::Profile;

use crate::error::LinkError;

/// Remote calls of a hardware sequencer.
pub trait SequencerLink: Send + Sync {
    /// Stops whatever the sequencer is doing. Must not wait for other calls.
    fn abort(&self) -> Result<(), LinkError>;
    /// Sends header and tables and loads them (`profileSet` + `DownloadProfile`).
    fn upload_profile(&self, profile: &Profile) -> Result<(), LinkError>;
    /// Arms the loaded profile for `num_reps` repetitions.
    fn init_profile(&self, num_reps: u32) -> Result<(), LinkError>;
    /// Starts the armed profile; completion is reported asynchronously.
    fn trigger_collect(&self) -> Result<(), LinkError>;
    fn write_digital(&self, value: u32) -> Result<(), LinkError>;
    fn move_absolute_adu(&self, channel: usize, adu: i64) -> Result<(), LinkError>;
    /// Exposes the cameras in `camera_mask` while each `(line, ms)` light is on.
    fn arcl(&self, camera_mask: u32, light_times: &[(u32, u32)]) -> Result<(), LinkError>;
    /// Re-establishes the connection after a failed call.
    fn reconnect(&self) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Call recorded by [`LoopbackLink`].
#[derive(Clone, Debug, PartialEq)]
pub enum LinkCall {
    Abort,
    UploadProfile(Profile),
    InitProfile(u32),
    TriggerCollect,
    WriteDigital(u32),
    MoveAbsolute { channel: usize, adu: i64 },
    Arcl { camera_mask: u32, light_times: Vec<(u32, u32)> },
    Reconnect,
}

impl LinkCall {
    pub fn name(&self) -> &'static str {
        match self {
            LinkCall::Abort => "abort",
            LinkCall::UploadProfile(_) => "upload_profile",
            LinkCall::InitProfile(_) => "init_profile",
            LinkCall::TriggerCollect => "trigger_collect",
            LinkCall::WriteDigital(_) => "write_digital",
            LinkCall::MoveAbsolute { .. } => "move_absolute_adu",
            LinkCall::Arcl { .. } => "arcl",
            LinkCall::Reconnect => "reconnect",
        }
    }
}

type TriggerHook = Arc<dyn Fn() + Send + Sync>;

/// In-process sequencer that records calls.
///
/// A trigger hook stands in for the remote "done" callback, and failures can
/// be injected per call name.
#[derive(Default)]
pub struct LoopbackLink {
    calls: Mutex<Vec<LinkCall>>,
    failures: Mutex<HashMap<&'static str, (u32, LinkError)>>,
    on_trigger: Mutex<Option<TriggerHook>>,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `hook` on every successful `trigger_collect`, on the calling thread.
    pub fn set_trigger_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_trigger.lock() = Some(Arc::new(hook));
    }

    pub fn clear_trigger_hook(&self) {
        *self.on_trigger.lock() = None;
    }

    /// Makes the next `times` calls named `call` fail with `err`.
    pub fn fail_next(&self, call: &'static str, times: u32, err: LinkError) {
        self.failures.lock().insert(call, (times, err));
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|c| c.name()).collect()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.name() == call).count()
    }

    pub fn uploads(&self) -> Vec<Profile> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                LinkCall::UploadProfile(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: LinkCall) -> Result<(), LinkError> {
        let name = call.name();
        trace!(call = name, "loopback call");
        self.calls.lock().push(call);
        let mut failures = self.failures.lock();
        if let Some((remaining, err)) = failures.get_mut(name) {
            let err = err.clone();
            *remaining -= 1;
            if *remaining == 0 {
                failures.remove(name);
            }
            return Err(err);
        }
        Ok(())
    }
}

impl SequencerLink for LoopbackLink {
    fn abort(&self) -> Result<(), LinkError> {
        self.record(LinkCall::Abort)
    }

    fn upload_profile(&self, profile: &Profile) -> Result<(), LinkError> {
        self.record(LinkCall::UploadProfile(profile.clone()))
    }

    fn init_profile(&self, num_reps: u32) -> Result<(), LinkError> {
        self.record(LinkCall::InitProfile(num_reps))
    }

    fn trigger_collect(&self) -> Result<(), LinkError> {
        self.record(LinkCall::TriggerCollect)?;
        // Clone out so the hook may call back into this link
        let hook = self.on_trigger.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn write_digital(&self, value: u32) -> Result<(), LinkError> {
        self.record(LinkCall::WriteDigital(value))
    }

    fn move_absolute_adu(&self, channel: usize, adu: i64) -> Result<(), LinkError> {
        self.record(LinkCall::MoveAbsolute { channel, adu })
    }

    fn arcl(&self, camera_mask: u32, light_times: &[(u32, u32)]) -> Result<(), LinkError> {
        self.record(LinkCall::Arcl {
            camera_mask,
            light_times: light_times.to_vec(),
        })
    }

    fn reconnect(&self) -> Result<(), LinkError> {
        self.record(LinkCall::Reconnect)
    }
}
