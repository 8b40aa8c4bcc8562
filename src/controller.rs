//! Continuous-velocity move orchestration.
//!
//! [`FlyScanController`] sequences one scan line end to end:
//! disarm, compute gate parameters, program registers, position the
//! motor a run-up before the gate, arm, launch the traversal on its own
//! thread, then drain the capture streams and return the device to
//! idle. The scan engine drives it through `prepare_for_move` /
//! `start_move` / `wait_while_moving`; per-axis consumers pull samples
//! through [`PositionStream`] handles fanned out by logical index.

use crate::capture::{CaptureCanceller, CaptureChannel, CaptureProgress};
use crate::error::FlyScanError;
use crate::events::{EventBus, ScanEvent};
use crate::motion::{FlyableAxis, TriggeredDetector};
use crate::scanlog::{ScanLineRecord, ScanLog};
use crate::timing::{self, AccelerationBudget, DetectorProfile, MovePlan, PulseRoute, ScanSpec};
use crate::utils::{CancelToken, poll_until};
use crate::zebra::{
    ArmSource, CaptureMask, CaptureSource, Encoder, GateSource, PulseSource, SourceSettings,
    ZebraDevice,
};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Scan-line lifecycle. `Failed` is reachable from every other state;
/// the next `prepare_for_move` recovers by driving the device back
/// through disarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Configuring,
    Armed,
    Moving,
    Draining,
    Failed,
}

/// Static orchestrator tuning; deployment-specific values come from
/// [`FlyScanConfig`](crate::config::FlyScanConfig).
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Encoder compared against the gate/pulse thresholds
    pub encoder: Encoder,
    /// Capture sources latched on each pulse
    pub capture: CaptureMask,
    /// Floor on the run-up distance, axis units
    pub min_accel_distance: f64,
    /// Sleep between register status polls
    pub register_poll_interval: Duration,
    /// Re-issue the disarm command every this many status polls
    pub disarm_retry_every: u32,
    /// Give up disarming after this many status polls
    pub disarm_poll_limit: u32,
    /// Patience for the armed status to assert after an arm command
    pub arm_timeout: Duration,
    /// Sleep between move/drain completion polls
    pub move_poll_interval: Duration,
    /// Drain polls allowed after the move before a point-count
    /// mismatch becomes an error
    pub drain_poll_limit: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            encoder: Encoder::Enc1,
            capture: CaptureMask::empty().with(CaptureSource::Enc1),
            min_accel_distance: 0.0,
            register_poll_interval: Duration::from_millis(50),
            disarm_retry_every: 10,
            disarm_poll_limit: 100,
            arm_timeout: Duration::from_secs(5),
            move_poll_interval: Duration::from_millis(25),
            drain_poll_limit: 200,
        }
    }
}

impl From<PulseRoute> for PulseSource {
    fn from(route: PulseRoute) -> Self {
        match route {
            PulseRoute::Time => PulseSource::Time,
            PulseRoute::Position => PulseSource::Position,
            PulseRoute::External => PulseSource::External,
        }
    }
}

/// Consumer handle onto one capture channel.
///
/// Cloning is cheap and clones share the underlying channel; reads are
/// serialized per index, while different indices never block each
/// other.
#[derive(Clone)]
pub struct PositionStream {
    index: usize,
    channel: Arc<Mutex<CaptureChannel>>,
    progress: Arc<CaptureProgress>,
}

impl PositionStream {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Blocking ordered read; see [`CaptureChannel::read`].
    pub fn read(&self, max_to_read: usize) -> Result<Vec<f64>, FlyScanError> {
        self.channel.lock().read(max_to_read)
    }

    pub fn is_complete(&self) -> bool {
        self.progress.is_complete()
    }

    pub fn points_returned(&self) -> u64 {
        self.progress.returned()
    }
}

/// Requested line parameters, staged by the scan engine's setters.
#[derive(Debug, Clone)]
struct LineRequest {
    start: f64,
    end: f64,
    step: f64,
    trigger_period: f64,
    route: PulseRoute,
}

impl Default for LineRequest {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 0.0,
            step: 1.0,
            trigger_period: 1.0,
            route: PulseRoute::Time,
        }
    }
}

/// Per-line aggregate owning the capture streams and the in-flight
/// move. Created by `prepare_for_move`, torn down when the next line
/// starts or on `stop_and_reset`.
struct MoveSession {
    scan: ScanSpec,
    plan: MovePlan,
    saved_speed: f64,
    streams: HashMap<usize, PositionStream>,
    cancellers: Vec<CaptureCanceller>,
    move_thread: Option<JoinHandle<Result<(), FlyScanError>>>,
    stop_issued: bool,
    started: Instant,
}

struct ControllerState {
    phase: ScanPhase,
    line: LineRequest,
    cached_triggers: Option<u64>,
    session: Option<MoveSession>,
}

/// Orchestrator for one position-compare unit and its scan axis.
pub struct FlyScanController {
    zebra: ZebraDevice,
    axis: Arc<dyn FlyableAxis>,
    detectors: Mutex<Vec<Arc<dyn TriggeredDetector>>>,
    settings: ControllerSettings,
    events: EventBus,
    cancel: CancelToken,
    state: Mutex<ControllerState>,
    scan_log: Option<Mutex<ScanLog>>,
}

impl FlyScanController {
    pub fn new(
        zebra: ZebraDevice,
        axis: Arc<dyn FlyableAxis>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            zebra,
            axis,
            detectors: Mutex::new(Vec::new()),
            settings,
            events: EventBus::new(),
            cancel: CancelToken::new(),
            state: Mutex::new(ControllerState {
                phase: ScanPhase::Idle,
                line: LineRequest::default(),
                cached_triggers: None,
                session: None,
            }),
            scan_log: None,
        }
    }

    /// Record a JSONL summary of every completed line.
    pub fn with_scan_log(mut self, log: ScanLog) -> Self {
        self.scan_log = Some(Mutex::new(log));
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Token shared with everything that blocks on this scan; cancel it
    /// to interrupt a line from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn add_detector(&self, detector: Arc<dyn TriggeredDetector>) {
        self.detectors.lock().push(detector);
    }

    pub fn phase(&self) -> ScanPhase {
        self.state.lock().phase
    }

    // === Line parameters (staged by the scan engine) ===

    pub fn set_scan_line(&self, start: f64, end: f64, step: f64) {
        let mut state = self.state.lock();
        state.line.start = start;
        state.line.end = end;
        state.line.step = step;
        state.cached_triggers = None;
    }

    pub fn set_trigger_period(&self, period: f64) {
        let mut state = self.state.lock();
        state.line.trigger_period = period;
        state.cached_triggers = None;
    }

    pub fn set_pulse_route(&self, route: PulseRoute) {
        let mut state = self.state.lock();
        state.line.route = route;
        state.cached_triggers = None;
    }

    /// Trigger count of the requested line, cached until a setter
    /// invalidates it.
    pub fn number_of_triggers(&self) -> Result<u64, FlyScanError> {
        let mut state = self.state.lock();
        if let Some(cached) = state.cached_triggers {
            return Ok(cached);
        }
        let triggers = Self::scan_from(&state.line)?.number_of_triggers();
        state.cached_triggers = Some(triggers);
        Ok(triggers)
    }

    /// Wall-time estimate for the requested line, including run-up and
    /// run-down once a plan exists.
    pub fn total_time(&self) -> Result<f64, FlyScanError> {
        let state = self.state.lock();
        if let Some(session) = &state.session {
            return Ok(session.plan.total_time);
        }
        let scan = Self::scan_from(&state.line)?;
        Ok(scan.number_of_triggers() as f64 * scan.trigger_period)
    }

    fn scan_from(line: &LineRequest) -> Result<ScanSpec, FlyScanError> {
        ScanSpec::new(
            line.start,
            line.end,
            line.step,
            line.trigger_period,
            line.route,
        )
    }

    fn set_phase(&self, phase: ScanPhase) {
        self.state.lock().phase = phase;
        self.events.publish(ScanEvent::PhaseChanged(phase));
    }

    // === Scan-line sequencing ===

    /// Configure and arm the device for the staged line.
    ///
    /// Ensures the unit is disarmed (re-issuing the command, since one
    /// disarm is not guaranteed to land within a bus-update period),
    /// programs sources then timing, positions the motor a full run-up
    /// before the gate, arms, and leaves the session ready for
    /// `start_move`. Any error lands in `Failed` with a best-effort
    /// disarm; retrying from there is supported.
    pub fn prepare_for_move(&self) -> Result<(), FlyScanError> {
        {
            let mut state = self.state.lock();
            match state.phase {
                ScanPhase::Idle | ScanPhase::Configuring | ScanPhase::Armed | ScanPhase::Failed => {
                }
                other => {
                    return Err(FlyScanError::Config(format!(
                        "prepare_for_move is not valid while {other:?}"
                    )));
                }
            }
            // Invalidate the previous line's channels together so none
            // leaks state into this one
            if let Some(old) = state.session.take() {
                for canceller in &old.cancellers {
                    canceller.cancel();
                }
            }
            state.phase = ScanPhase::Configuring;
        }
        self.events
            .publish(ScanEvent::PhaseChanged(ScanPhase::Configuring));
        self.cancel.reset();

        match self.configure() {
            Ok(session) => {
                let triggers = session.plan.gate.triggers;
                self.state.lock().session = Some(session);
                self.set_phase(ScanPhase::Armed);
                self.events.publish(ScanEvent::Armed { triggers });
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn configure(&self) -> Result<MoveSession, FlyScanError> {
        eprintln!("CFG ensure_disarmed"); self.ensure_disarmed()?;

        eprintln!("CFG scan_from"); let scan = Self::scan_from(&self.state.lock().line)?;
        eprintln!("CFG profiles"); let profiles = self.detector_profiles()?;
        eprintln!("CFG gate"); let gate = timing::compute_gate_parameters(&scan, &profiles)?;

        // Sources first: the unit only validates cross-register
        // consistency once its mode is fixed
        eprintln!("CFG apply_sources"); self.zebra.apply_sources(&SourceSettings {
            arm_source: ArmSource::Soft,
            gate_source: GateSource::Position,
            pulse_source: scan.route.into(),
            encoder: self.settings.encoder,
            direction: gate.direction,
            capture: self.settings.capture,
            time_unit: gate.time_unit,
        })?;
        eprintln!("CFG apply_timing"); let readback = self.zebra.apply_timing(&gate)?;

        // Motion follows what the hardware accepted, not what we asked
        let speed = timing::required_speed(&scan, readback.pulse_step, gate.time_unit);
        let limit = self.axis.max_speed()?;
        if speed > limit {
            return Err(FlyScanError::SpeedLimit {
                required: speed,
                limit,
            });
        }

        let budget = AccelerationBudget::compute(
            speed,
            self.axis.time_to_velocity()?,
            self.settings.min_accel_distance,
            &profiles,
        );
        let plan = MovePlan::new(gate, budget, &scan);

        eprintln!("CFG move_async"); let saved_speed = self.axis.speed()?;
        self.axis.move_async(plan.prestart)?;
        eprintln!("CFG wait_while_busy"); self.axis
            .wait_while_busy(&self.cancel, self.settings.move_poll_interval)?;

        eprintln!("CFG arm"); self.zebra.arm()?;
        eprintln!("CFG poll armed"); poll_until(
            || self.zebra.is_armed(),
            self.settings.arm_timeout,
            self.settings.register_poll_interval,
        )?;

        info!(
            "Line armed on {}: {} triggers, speed {:.6}/s, run-up {:.6}",
            self.zebra.prefix(),
            plan.gate.triggers,
            speed,
            budget.accel_distance
        );
        Ok(MoveSession {
            scan,
            plan,
            saved_speed,
            streams: HashMap::new(),
            cancellers: Vec::new(),
            move_thread: None,
            stop_issued: false,
            started: Instant::now(),
        })
    }

    fn detector_profiles(&self) -> Result<Vec<DetectorProfile>, FlyScanError> {
        let detectors = self.detectors.lock();
        if detectors.is_empty() {
            return Err(FlyScanError::Config(
                "No detectors registered for the scan line".to_string(),
            ));
        }
        detectors.iter().map(|d| d.profile()).collect()
    }

    fn ensure_disarmed(&self) -> Result<(), FlyScanError> {
        let mut polls = 0;
        loop {
            self.cancel.check()?;
            if !self.zebra.is_armed()? {
                return Ok(());
            }
            if polls % self.settings.disarm_retry_every == 0 {
                debug!("Device armed, issuing disarm (poll {polls})");
                self.zebra.disarm()?;
            }
            polls += 1;
            if polls >= self.settings.disarm_poll_limit {
                return Err(FlyScanError::Config(format!(
                    "Device still armed after {polls} disarm polls"
                )));
            }
            std::thread::sleep(self.settings.register_poll_interval);
        }
    }

    /// Launch the constant-velocity traversal on its own thread.
    pub fn start_move(&self) -> Result<(), FlyScanError> {
        let target = {
            let mut state = self.state.lock();
            if state.phase != ScanPhase::Armed {
                return Err(FlyScanError::Config(format!(
                    "start_move is not valid while {:?}",
                    state.phase
                )));
            }
            let session = state
                .session
                .as_mut()
                .ok_or_else(|| FlyScanError::Config("No prepared scan line".to_string()))?;

            let axis = self.axis.clone();
            let cancel = self.cancel.clone();
            let poll = self.settings.move_poll_interval;
            let speed = session.plan.budget.required_speed;
            let target = session.plan.overrun;
            let handle = std::thread::Builder::new()
                .name("flyscan-move".to_string())
                .spawn(move || {
                    axis.set_speed(speed)?;
                    axis.move_async(target)?;
                    axis.wait_while_busy(&cancel, poll)
                })?;
            session.move_thread = Some(handle);
            state.phase = ScanPhase::Moving;
            target
        };
        self.events
            .publish(ScanEvent::PhaseChanged(ScanPhase::Moving));
        self.events.publish(ScanEvent::MoveStarted { target });
        Ok(())
    }

    pub fn is_moving(&self) -> bool {
        self.state.lock().phase == ScanPhase::Moving
    }

    /// Block until the traversal and every active capture stream have
    /// finished, then return the device to idle.
    ///
    /// The wait on the move itself is open-ended; once the motor is
    /// done, the capture streams get a bounded drain before a short
    /// point count is reported as an error. Interruption stops the
    /// motor exactly once and leaves the session in `Failed`.
    pub fn wait_while_moving(&self) -> Result<(), FlyScanError> {
        match self.phase() {
            ScanPhase::Moving => {}
            ScanPhase::Idle => return Ok(()),
            other => {
                return Err(FlyScanError::Config(format!(
                    "wait_while_moving is not valid while {other:?}"
                )));
            }
        }

        // Open-ended wait for the move thread
        loop {
            if self.cancel.is_cancelled() {
                return self.handle_interrupt();
            }
            let move_done = {
                let state = self.state.lock();
                match &state.session {
                    Some(session) => session
                        .move_thread
                        .as_ref()
                        .map(|handle| handle.is_finished())
                        .unwrap_or(true),
                    None => true,
                }
            };
            if move_done {
                break;
            }
            std::thread::sleep(self.settings.move_poll_interval);
        }

        self.set_phase(ScanPhase::Draining);

        let joined = {
            let mut state = self.state.lock();
            state
                .session
                .as_mut()
                .and_then(|session| session.move_thread.take())
                .map(|handle| handle.join())
        };
        match joined {
            None | Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => {
                self.fail(&e);
                return Err(e);
            }
            Some(Err(_)) => {
                let e = FlyScanError::Protocol("Move thread panicked".to_string());
                self.fail(&e);
                return Err(e);
            }
        }

        // Bounded drain: the counter may still be catching up with the
        // last few pulses
        let mut polls = 0;
        loop {
            if self.cancel.is_cancelled() {
                return self.handle_interrupt();
            }
            let (complete, expected, returned) = self.drain_progress();
            if complete {
                break;
            }
            polls += 1;
            if polls >= self.settings.drain_poll_limit {
                let e = FlyScanError::CaptureShortfall { expected, returned };
                self.fail(&e);
                return Err(e);
            }
            std::thread::sleep(self.settings.move_poll_interval);
        }

        self.finish_line()
    }

    /// Whether every active stream is complete, plus the worst
    /// progress for shortfall reporting.
    fn drain_progress(&self) -> (bool, u64, u64) {
        let state = self.state.lock();
        match &state.session {
            Some(session) => {
                let expected = session.plan.gate.triggers;
                let returned = session
                    .streams
                    .values()
                    .map(|stream| stream.points_returned())
                    .min()
                    .unwrap_or(expected);
                let complete = session.streams.values().all(|stream| stream.is_complete());
                (complete || session.streams.is_empty(), expected, returned)
            }
            None => (true, 0, 0),
        }
    }

    fn finish_line(&self) -> Result<(), FlyScanError> {
        let (record, captured, saved_speed) = {
            let state = self.state.lock();
            let session = state.session.as_ref().ok_or_else(|| {
                FlyScanError::Config("Scan line vanished during drain".to_string())
            })?;
            let captured = session
                .streams
                .values()
                .map(|stream| stream.points_returned())
                .max()
                .unwrap_or(session.plan.gate.triggers);
            let record = ScanLineRecord {
                timestamp: Utc::now(),
                start: session.scan.start,
                end: session.scan.end,
                step: session.scan.step,
                trigger_period: session.scan.trigger_period,
                triggers: session.plan.gate.triggers,
                captured,
                elapsed_s: session.started.elapsed().as_secs_f64(),
            };
            (record, captured, session.saved_speed)
        };

        self.axis.set_speed(saved_speed)?;
        if let Err(e) = self.zebra.disarm() {
            warn!("Post-line disarm failed: {e}");
        }
        if let Some(log) = &self.scan_log {
            if let Err(e) = log.lock().add(record) {
                warn!("Failed to record scan line: {e}");
            }
        }

        self.set_phase(ScanPhase::Idle);
        self.events.publish(ScanEvent::LineComplete { captured });
        Ok(())
    }

    /// Interrupt path: stop the motor exactly once, unblock pending
    /// reads, land in `Failed`.
    fn handle_interrupt(&self) -> Result<(), FlyScanError> {
        let (should_stop, cancellers, thread) = {
            let mut state = self.state.lock();
            match state.session.as_mut() {
                Some(session) => {
                    let should_stop = !session.stop_issued;
                    session.stop_issued = true;
                    (
                        should_stop,
                        session.cancellers.clone(),
                        session.move_thread.take(),
                    )
                }
                None => (false, Vec::new(), None),
            }
        };

        if should_stop {
            if let Err(e) = self.axis.stop() {
                warn!("Motor stop on interrupt failed: {e}");
            }
        }
        for canceller in &cancellers {
            canceller.cancel();
        }
        if let Some(handle) = thread {
            // The move thread watches the same token and exits promptly
            let _ = handle.join();
        }

        self.set_phase(ScanPhase::Failed);
        self.events.publish(ScanEvent::Fault {
            message: "Scan line interrupted".to_string(),
        });
        Err(FlyScanError::Interrupted)
    }

    fn fail(&self, error: &FlyScanError) {
        warn!("Scan line failed: {error}");
        // Whatever went wrong, try not to leave the unit armed, and
        // unblock anyone waiting on points that will never arrive
        if let Err(e) = self.zebra.disarm() {
            warn!("Disarm after failure also failed: {e}");
        }
        let cancellers = match &self.state.lock().session {
            Some(session) => session.cancellers.clone(),
            None => Vec::new(),
        };
        for canceller in &cancellers {
            canceller.cancel();
        }
        self.set_phase(ScanPhase::Failed);
        self.events.publish(ScanEvent::Fault {
            message: error.to_string(),
        });
    }

    /// Abandon the current line: cancel pending reads, stop the motor
    /// if it has not been stopped already, disarm and reset the unit.
    ///
    /// Usable from `Armed`, `Moving` or `Failed`; a no-op when idle.
    pub fn stop_and_reset(&self) -> Result<(), FlyScanError> {
        self.cancel.cancel();

        let session = self.state.lock().session.take();
        if let Some(mut session) = session {
            for canceller in &session.cancellers {
                canceller.cancel();
            }
            if let Some(handle) = session.move_thread.take() {
                let _ = handle.join();
            }
            if !session.stop_issued {
                self.axis.stop()?;
            }
            if let Err(e) = self.axis.set_speed(session.saved_speed) {
                warn!("Speed restore on stop failed: {e}");
            }
        }

        self.zebra.disarm()?;
        self.zebra.reset()?;
        self.set_phase(ScanPhase::Idle);
        self.cancel.reset();
        Ok(())
    }

    // === Capture fan-out ===

    /// Capture stream for one logical channel index (encoders 1-4 on
    /// 0-3, elapsed time on 4).
    ///
    /// Idempotent per line: repeated requests for the same index share
    /// one channel; distinct indices are independent blocking streams.
    /// The index must be enabled in the configured capture mask, which
    /// is checked once here when the stream is created.
    pub fn position_stream(&self, index: usize) -> Result<PositionStream, FlyScanError> {
        let mut state = self.state.lock();
        let session = state
            .session
            .as_mut()
            .ok_or_else(|| FlyScanError::Config("No prepared scan line".to_string()))?;

        if let Some(stream) = session.streams.get(&index) {
            return Ok(stream.clone());
        }

        let source = CaptureSource::from_index(index)
            .ok_or_else(|| FlyScanError::Config(format!("No capture channel with index {index}")))?;
        if !self.settings.capture.contains(source) {
            return Err(FlyScanError::Config(format!(
                "Capture channel {index} is not enabled in the capture mask"
            )));
        }

        let mut channel = CaptureChannel::new(self.zebra.waveform(source)?, self.zebra.counter()?);
        channel.start(session.plan.gate.triggers)?;
        session.cancellers.push(channel.canceller());

        let stream = PositionStream {
            index,
            progress: channel.progress(),
            channel: Arc::new(Mutex::new(channel)),
        };
        session.streams.insert(index, stream.clone());
        Ok(stream)
    }
}

impl Drop for FlyScanController {
    fn drop(&mut self) {
        // Best effort: never leave the unit armed on the way out
        if self.state.lock().phase != ScanPhase::Idle {
            let _ = self.zebra.disarm();
        }
    }
}
