//! # Sequencer device driver
//!
//! A [`SequencerDevice`] owns everything that persists between executions of
//! one DSP or FPGA sequencer: the compiler configured for its wiring, the
//! [`Baseline`] (output state the previous profile left behind), the last
//! uploaded profile, and the light/camera selection used for snapshots.
//!
//! ## Executing a table
//!
//! [`SequencerDevice::execute_table`] compiles a slice of the experiment's
//! action table, uploads the profile only if it differs from the one already
//! on the card, arms and triggers it, and blocks until the remote side reports
//! `"<name> done"` through [`SequencerDevice::receive_data`]. Progress is
//! visible through [`SequencerDevice::phase`]:
//!
//! `Idle → ProfileReady → Uploading (if changed) → Armed → Triggered → AwaitingCompletion → Idle`
//!
//! The device returns to `Idle` on every exit path, errors included.
//!
//! ## Aborting
//!
//! [`SequencerDevice::on_abort`] never takes the device lock, so it can be
//! called from any thread while an execution is blocked. It stops the
//! sequencer, forces `Idle` and releases the completion wait, which then
//! returns [`Completion::Aborted`].
//!
//! ## Concurrency
//!
//! `execute_table`, `run_profile` and `prepare_for_experiment` serialize on a
//! per-device execution mutex. The remaining device state sits behind a
//! separate lock that is only held for short reads and writes, never across a
//! remote call, a bus publish or a [`ProfileSink`] callback. Subscribers to the
//! status events may therefore query the device while an execution is running.
//!
//! The completion waiter is registered on the [`EventBus`] before the first
//! remote call, so a completion or abort delivered while the device is still
//! uploading is never lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use dspcompiler_backend::*;

use crate::config::{DeviceConfig, LineKind};
use crate::error::{ConfigError, DriverError, DriverResult, LinkError};
use crate::events::*;
use crate::link::SequencerLink;
use crate::phase::{Phase, PhaseWatch};

/// Exposure time of a light source that was never set, in ms.
pub const DEFAULT_EXPOSURE_MS: f64 = 100.0;

/// `2^16` ADU over a 10 V range.
pub const DEFAULT_ADU_PER_VOLT: f64 = 6553.6;

/// How a blocking execution ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Done,
    Aborted,
}

#[derive(Default)]
struct DeviceState {
    baseline: Baseline,
    last_profile: Option<Profile>,
    active_lights: IndexSet<String>,
    active_cameras: IndexSet<String>,
    exposure_times: IndexMap<String, f64>,
}

/// Removes the completion waiter from the bus unless it already fired.
struct WaiterGuard<'a> {
    bus: &'a EventBus,
    waiter: OneShot,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.bus.cancel(&self.waiter);
    }
}

pub struct SequencerDevice {
    name: String,
    done_event: String,
    compiler: ProfileCompiler,
    link: Arc<dyn SequencerLink>,
    bus: Arc<EventBus>,
    phase: PhaseWatch,
    exec: Mutex<()>,
    state: Mutex<DeviceState>,
    aborted: AtomicBool,
    lights: IndexMap<String, u32>,
    cameras: IndexMap<String, u32>,
    adu_per_volt: f64,
    completion_timeout: Option<Duration>,
    retry_attempts: u32,
    sink: Option<Arc<dyn ProfileSink>>,
}

impl SequencerDevice {
    /// Device named `name` (completion arrives as `"<name> done"`) with no
    /// completion timeout and no retries.
    pub fn new(
        name: &str,
        compiler: ProfileCompiler,
        link: Arc<dyn SequencerLink>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            name: name.to_string(),
            done_event: format!("{} done", name),
            compiler,
            link,
            bus,
            phase: PhaseWatch::new(),
            exec: Mutex::new(()),
            state: Mutex::new(DeviceState::default()),
            aborted: AtomicBool::new(false),
            lights: IndexMap::new(),
            cameras: IndexMap::new(),
            adu_per_volt: DEFAULT_ADU_PER_VOLT,
            completion_timeout: None,
            retry_attempts: 1,
            sink: None,
        }
    }

    /// Builds a device from its configuration file contents. Lines of kind
    /// `light` and `camera` become selectable for [`Self::take_image`].
    pub fn from_config(
        config: &DeviceConfig,
        link: Arc<dyn SequencerLink>,
        bus: Arc<EventBus>,
        position_source: Option<PositionSource>,
    ) -> Result<Self, ConfigError> {
        let compiler = config.compiler(position_source)?;
        let mut device = Self::new(&config.name, compiler, link, bus)
            .with_adu_per_volt(config.adu_per_volt())
            .with_retry_attempts(config.retry_attempts);
        device.completion_timeout = config.completion_timeout();
        for (name, bit, kind) in config.digital_lines() {
            match kind {
                LineKind::Light => {
                    device.lights.insert(name, 1 << bit);
                }
                LineKind::Camera => {
                    device.cameras.insert(name, 1 << bit);
                }
                LineKind::Trigger => {}
            }
        }
        Ok(device)
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    /// Total attempts per remote call; `1` propagates the first failure.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        assert!(attempts > 0, "At least one attempt is required");
        self.retry_attempts = attempts;
        self
    }

    pub fn with_adu_per_volt(mut self, adu_per_volt: f64) -> Self {
        self.adu_per_volt = adu_per_volt;
        self
    }

    pub fn with_profile_sink(mut self, sink: Arc<dyn ProfileSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Marks the digital line `name` as a light source.
    pub fn with_light(mut self, name: &str) -> DriverResult<Self> {
        let mask = self.digital_mask(name)?;
        self.lights.insert(name.to_string(), mask);
        Ok(self)
    }

    /// Marks the digital line `name` as a camera trigger.
    pub fn with_camera(mut self, name: &str) -> DriverResult<Self> {
        let mask = self.digital_mask(name)?;
        self.cameras.insert(name.to_string(), mask);
        Ok(self)
    }

    fn digital_mask(&self, name: &str) -> DriverResult<u32> {
        let map = self.compiler.channel_map();
        match map.resolve(name) {
            Some(ChannelRef::Digital(line)) => map
                .digital_mask(line)
                .ok_or_else(|| DriverError::UnknownLine(name.to_string())),
            _ => Err(DriverError::UnknownLine(name.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event that signals completion of a triggered profile.
    pub fn done_event(&self) -> &str {
        &self.done_event
    }

    pub fn phase(&self) -> &PhaseWatch {
        &self.phase
    }

    pub fn compiler(&self) -> &ProfileCompiler {
        &self.compiler
    }

    pub fn baseline(&self) -> Baseline {
        self.state.lock().baseline
    }

    pub fn last_profile(&self) -> Option<Profile> {
        self.state.lock().last_profile.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Runs one remote call, reconnecting and retrying up to the configured
    /// number of attempts. An abort stops further retries.
    fn call<T>(
        &self,
        call: &'static str,
        f: impl Fn(&dyn SequencerLink) -> Result<T, LinkError>,
    ) -> DriverResult<T> {
        let mut attempt = 1;
        loop {
            match f(self.link.as_ref()) {
                Ok(value) => return Ok(value),
                Err(source) => {
                    error!(device = %self.name, call, attempt, %source, "sequencer call failed");
                    if attempt >= self.retry_attempts || self.is_aborted() {
                        return Err(DriverError::Link {
                            call,
                            attempts: attempt,
                            source,
                        });
                    }
                    if let Err(err) = self.link.reconnect() {
                        warn!(device = %self.name, %err, "reconnect failed");
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Number of entries from `index` on that this device can execute.
    pub fn get_num_runnable_lines(&self, table: &[TableEntry], index: usize) -> usize {
        self.compiler.num_runnable(table, index)
    }

    /// Executes `table[start..stop]` `num_reps` times and waits for completion.
    ///
    /// `rep_duration` pads each repetition to at least that many ms.
    pub fn execute_table(
        &self,
        table: &[TableEntry],
        start: usize,
        stop: usize,
        num_reps: u32,
        rep_duration: Option<ActionTime>,
    ) -> DriverResult<Completion> {
        if start > stop || stop > table.len() {
            return Err(DriverError::InvalidRange {
                start,
                stop,
                len: table.len(),
            });
        }
        let _exec = self.exec.lock();
        self.aborted.store(false, Ordering::SeqCst);
        let result = self.execute_entries(&table[start..stop], num_reps, rep_duration);
        self.phase.set(Phase::Idle);
        result
    }

    fn execute_entries(
        &self,
        entries: &[TableEntry],
        num_reps: u32,
        rep_duration: Option<ActionTime>,
    ) -> DriverResult<Completion> {
        let baseline = self.baseline();
        let compiled = self.compiler.compile_table(entries, rep_duration, &baseline)?;
        let changed = {
            let mut state = self.state.lock();
            // The baseline follows the profile even if the run is aborted
            state.baseline = compiled.next_baseline;
            should_upload(&compiled.profile, state.last_profile.as_ref())
        };
        self.phase.set(Phase::ProfileReady);

        let guard = WaiterGuard {
            bus: &self.bus,
            waiter: self.bus.one_shot(&self.done_event),
        };
        if changed {
            self.upload(compiled.profile)?;
        } else {
            debug!(device = %self.name, "profile unchanged, skipping upload");
        }
        self.arm_and_wait(&guard, num_reps)
    }

    fn upload(&self, profile: Profile) -> DriverResult<()> {
        self.phase.set(Phase::Uploading);
        // What the card holds is unknown until the upload succeeds
        self.state.lock().last_profile = None;
        info!(
            device = %self.name,
            runtime = profile.runtime(),
            n_digital = profile.header.n_digital,
            "uploading profile"
        );
        self.call("upload_profile", |link| link.upload_profile(&profile))?;
        if let Some(sink) = &self.sink {
            sink.profile_uploaded(&profile);
        }
        self.state.lock().last_profile = Some(profile);
        Ok(())
    }

    fn arm_and_wait(&self, guard: &WaiterGuard, num_reps: u32) -> DriverResult<Completion> {
        if self.is_aborted() {
            return Ok(Completion::Aborted);
        }
        self.bus.publish(
            UPDATE_STATUS_LIGHT,
            Payload::Status(StatusUpdate {
                key: "device waiting".to_string(),
                text: format!("Waiting for\n{} to finish", self.name),
                color: (255, 255, 0),
            }),
        );
        self.phase.set(Phase::Armed);
        self.call("init_profile", |link| link.init_profile(num_reps))?;
        if self.is_aborted() {
            return Ok(Completion::Aborted);
        }

        self.phase.set(Phase::Triggered);
        info!(device = %self.name, num_reps, "triggering profile");
        self.call("trigger_collect", |link| link.trigger_collect())?;
        if self.is_aborted() {
            // The abort may have reached the card before the trigger did
            warn!(device = %self.name, "aborted while triggering, stopping again");
            if let Err(err) = self.link.abort() {
                error!(device = %self.name, %err, "abort call failed");
            }
            return Ok(Completion::Aborted);
        }
        self.phase.set(Phase::AwaitingCompletion);

        let outcome = guard.waiter.wait(self.completion_timeout);
        let completion = match outcome {
            WaitOutcome::Fired(_) if !self.is_aborted() => Completion::Done,
            WaitOutcome::Fired(_) | WaitOutcome::Cleared => Completion::Aborted,
            WaitOutcome::TimedOut => {
                let timeout = self.completion_timeout.unwrap_or_default();
                error!(device = %self.name, ?timeout, "completion timed out");
                return Err(DriverError::CompletionTimeout { timeout });
            }
        };
        debug!(device = %self.name, ?completion, "execution finished");
        self.bus.publish(EXPERIMENT_EXECUTION, Payload::None);
        Ok(completion)
    }

    /// Uploads a hand-built profile unconditionally and runs it.
    pub fn run_profile(&self, profile: &Profile, num_reps: u32) -> DriverResult<Completion> {
        let _exec = self.exec.lock();
        self.aborted.store(false, Ordering::SeqCst);
        let result = (|| {
            let guard = WaiterGuard {
                bus: &self.bus,
                waiter: self.bus.one_shot(&self.done_event),
            };
            self.upload(profile.clone())?;
            self.arm_and_wait(&guard, num_reps)
        })();
        self.phase.set(Phase::Idle);
        result
    }

    /// Stops the sequencer and releases a blocked execution.
    ///
    /// A failing abort call is logged, not returned.
    pub fn on_abort(&self) {
        warn!(device = %self.name, "abort requested");
        self.aborted.store(true, Ordering::SeqCst);
        if let Err(err) = self.link.abort() {
            error!(device = %self.name, %err, "abort call failed");
        }
        self.phase.set(Phase::Idle);
        self.bus.publish(&self.done_event, Payload::None);
    }

    /// Callback for messages from the remote sequencer.
    pub fn receive_data(&self, action: &str) {
        if action == "done" || action == self.done_event {
            debug!(device = %self.name, "sequencer reported completion");
            self.bus.publish(&self.done_event, Payload::None);
        } else {
            debug!(device = %self.name, action, "ignoring sequencer message");
        }
    }

    /// Resets the baseline: digital outputs off, analog lines with a startup
    /// voltage moved there, all others at zero.
    pub fn prepare_for_experiment(&self) -> DriverResult<()> {
        let _exec = self.exec.lock();
        self.aborted.store(false, Ordering::SeqCst);
        let mut baseline = Baseline::default();
        for (name, line) in self.compiler.channel_map().analog_lines() {
            let Some(volts) = line.startup else {
                continue;
            };
            let adu = (volts * self.adu_per_volt).trunc() as i64;
            debug!(device = %self.name, line = name, volts, adu, "moving to startup position");
            self.call("move_absolute_adu", |link| link.move_absolute_adu(line.hw_channel, adu))?;
            baseline.last_analog[line.hw_channel] = adu;
        }
        self.state.lock().baseline = baseline;
        Ok(())
    }

    pub fn cleanup_after_experiment(&self) -> DriverResult<()> {
        self.set_digital(0)
    }

    /// Forces the next execution to upload its profile.
    pub fn invalidate_profile_cache(&self) {
        self.state.lock().last_profile = None;
    }

    pub fn set_digital(&self, value: u32) -> DriverResult<()> {
        self.call("write_digital", |link| link.write_digital(value))
    }

    /// Drives analog line `name` to `volts` directly.
    pub fn set_analog_voltage(&self, name: &str, volts: f64) -> DriverResult<()> {
        let map = self.compiler.channel_map();
        let line = match map.resolve(name) {
            Some(ChannelRef::Analog(chan)) => map.analog_line(chan),
            _ => None,
        }
        .ok_or_else(|| DriverError::UnknownLine(name.to_string()))?;
        let adu = (volts * self.adu_per_volt).trunc() as i64;
        self.call("move_absolute_adu", |link| link.move_absolute_adu(line.hw_channel, adu))
    }

    pub fn toggle_light(&self, name: &str, enabled: bool) -> DriverResult<()> {
        if !self.lights.contains_key(name) {
            return Err(DriverError::UnknownLine(name.to_string()));
        }
        let mut state = self.state.lock();
        if enabled {
            state.active_lights.insert(name.to_string());
        } else {
            state.active_lights.shift_remove(name);
        }
        Ok(())
    }

    pub fn toggle_camera(&self, name: &str, enabled: bool) -> DriverResult<()> {
        if !self.cameras.contains_key(name) {
            return Err(DriverError::UnknownLine(name.to_string()));
        }
        let mut state = self.state.lock();
        if enabled {
            state.active_cameras.insert(name.to_string());
        } else {
            state.active_cameras.shift_remove(name);
        }
        Ok(())
    }

    pub fn set_exposure_time(&self, light: &str, ms: f64) -> DriverResult<()> {
        if !self.lights.contains_key(light) {
            return Err(DriverError::UnknownLine(light.to_string()));
        }
        self.state.lock().exposure_times.insert(light.to_string(), ms);
        Ok(())
    }

    pub fn exposure_time(&self, light: &str) -> DriverResult<f64> {
        if !self.lights.contains_key(light) {
            return Err(DriverError::UnknownLine(light.to_string()));
        }
        Ok(self
            .state
            .lock()
            .exposure_times
            .get(light)
            .copied()
            .unwrap_or(DEFAULT_EXPOSURE_MS))
    }

    /// Exposes the enabled cameras while each enabled light is on for its
    /// exposure time, rounded up to whole ms. Returns the longest exposure.
    pub fn take_image(&self) -> DriverResult<f64> {
        let mut light_times = Vec::new();
        let mut max_time = 0u32;
        let camera_mask = {
            let state = self.state.lock();
            for (name, &mask) in &self.lights {
                if !state.active_lights.contains(name) {
                    continue;
                }
                let exposure = state
                    .exposure_times
                    .get(name)
                    .copied()
                    .unwrap_or(DEFAULT_EXPOSURE_MS);
                // The card only takes whole milliseconds
                let ms = exposure.ceil().max(0.0) as u32;
                light_times.push((mask, ms));
                max_time = max_time.max(ms);
            }
            self.cameras
                .iter()
                .filter(|(name, _)| state.active_cameras.contains(*name))
                .fold(0u32, |acc, (_, &mask)| acc | mask)
        };
        debug!(device = %self.name, camera_mask, ?light_times, "taking image");
        self.call("arcl", |link| link.arcl(camera_mask, &light_times))?;
        Ok(max_time as f64)
    }

    /// Hooks this device to the experiment-wide events.
    ///
    /// The bus only holds weak references, so dropping the device silently
    /// detaches it.
    pub fn subscribe(self: &Arc<Self>) -> Vec<SubscriptionId> {
        let on = |event: &str, f: fn(&SequencerDevice)| {
            let device: Weak<SequencerDevice> = Arc::downgrade(self);
            self.bus.subscribe(event, DEFAULT_PRIORITY, move |_| {
                if let Some(device) = device.upgrade() {
                    f(&device);
                }
            })
        };
        vec![
            on(USER_ABORT, |device| device.on_abort()),
            on(PREPARE_FOR_EXPERIMENT, |device| {
                if let Err(err) = device.prepare_for_experiment() {
                    error!(device = %device.name, %err, "prepare for experiment failed");
                }
            }),
            on(CLEANUP_AFTER_EXPERIMENT, |device| {
                if let Err(err) = device.cleanup_after_experiment() {
                    error!(device = %device.name, %err, "cleanup after experiment failed");
                }
            }),
        ]
    }
}
