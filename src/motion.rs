//! Motor and detector abstractions consumed by the orchestrator.

use crate::ca::{ChannelRegistry, PvChannel};
use crate::error::FlyScanError;
use crate::timing::DetectorProfile;
use crate::utils::CancelToken;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// An axis capable of a constant-velocity traversal.
///
/// Implementations wrap whatever motion controller the beamline runs;
/// the orchestrator only needs asynchronous moves, speed control and a
/// stop that is safe to call at any time.
pub trait FlyableAxis: Send + Sync {
    fn name(&self) -> &str;

    fn position(&self) -> Result<f64, FlyScanError>;

    /// Start a move and return immediately.
    fn move_async(&self, target: f64) -> Result<(), FlyScanError>;

    fn set_speed(&self, speed: f64) -> Result<(), FlyScanError>;

    fn speed(&self) -> Result<f64, FlyScanError>;

    /// Hard velocity limit of the axis.
    fn max_speed(&self) -> Result<f64, FlyScanError>;

    /// Time the axis needs to ramp from rest to its programmed speed.
    fn time_to_velocity(&self) -> Result<f64, FlyScanError>;

    fn is_busy(&self) -> Result<bool, FlyScanError>;

    fn stop(&self) -> Result<(), FlyScanError>;

    /// Block until the axis reports done, checking `cancel` between
    /// polls. Infinite wait: completion is hardware-driven.
    fn wait_while_busy(
        &self,
        cancel: &CancelToken,
        poll_interval: Duration,
    ) -> Result<(), FlyScanError> {
        loop {
            cancel.check()?;
            if !self.is_busy()? {
                return Ok(());
            }
            std::thread::sleep(poll_interval);
        }
    }
}

/// A detector exposed by the position-compare unit's pulses.
pub trait TriggeredDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Exposure settings for the coming line.
    fn profile(&self) -> Result<DetectorProfile, FlyScanError>;
}

/// Motor-record fields used by [`CaAxis`].
const FIELD_TARGET: &str = "VAL";
const FIELD_READBACK: &str = "RBV";
const FIELD_SPEED: &str = "VELO";
const FIELD_MAX_SPEED: &str = "VMAX";
const FIELD_ACCEL_TIME: &str = "ACCL";
const FIELD_DONE_MOVING: &str = "DMOV";
const FIELD_STOP: &str = "STOP";

/// A standard EPICS motor record driven through the channel registry.
pub struct CaAxis {
    registry: Arc<ChannelRegistry>,
    record: String,
}

impl CaAxis {
    pub fn new(registry: Arc<ChannelRegistry>, record: &str) -> Self {
        Self {
            registry,
            record: record.to_string(),
        }
    }

    fn field(&self, field: &str) -> Result<Arc<PvChannel>, FlyScanError> {
        self.registry.channel(&format!("{}.{}", self.record, field))
    }
}

impl FlyableAxis for CaAxis {
    fn name(&self) -> &str {
        &self.record
    }

    fn position(&self) -> Result<f64, FlyScanError> {
        self.field(FIELD_READBACK)?.get()
    }

    fn move_async(&self, target: f64) -> Result<(), FlyScanError> {
        debug!("{} -> {target}", self.record);
        self.field(FIELD_TARGET)?.put(target)
    }

    fn set_speed(&self, speed: f64) -> Result<(), FlyScanError> {
        self.field(FIELD_SPEED)?.put(speed)
    }

    fn speed(&self) -> Result<f64, FlyScanError> {
        self.field(FIELD_SPEED)?.get()
    }

    fn max_speed(&self) -> Result<f64, FlyScanError> {
        self.field(FIELD_MAX_SPEED)?.get()
    }

    fn time_to_velocity(&self) -> Result<f64, FlyScanError> {
        self.field(FIELD_ACCEL_TIME)?.get()
    }

    fn is_busy(&self) -> Result<bool, FlyScanError> {
        // DMOV drops to 0 while a move is in flight
        Ok(self.field(FIELD_DONE_MOVING)?.get()? == 0.0)
    }

    fn stop(&self) -> Result<(), FlyScanError> {
        self.field(FIELD_STOP)?.put(1.0)
    }
}

/// A detector whose exposure is read from a register at line setup.
pub struct CaDetector {
    registry: Arc<ChannelRegistry>,
    name: String,
    collection_time_pv: String,
    min_accel_time: Option<f64>,
}

impl CaDetector {
    pub fn new(registry: Arc<ChannelRegistry>, name: &str, collection_time_pv: &str) -> Self {
        Self {
            registry,
            name: name.to_string(),
            collection_time_pv: collection_time_pv.to_string(),
            min_accel_time: None,
        }
    }

    /// Require extra run-up time before the first trigger.
    pub fn with_min_accel_time(mut self, seconds: f64) -> Self {
        self.min_accel_time = Some(seconds);
        self
    }
}

impl TriggeredDetector for CaDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn profile(&self) -> Result<DetectorProfile, FlyScanError> {
        let collection_time = self.registry.channel(&self.collection_time_pv)?.get()?;
        Ok(DetectorProfile {
            collection_time,
            min_accel_time: self.min_accel_time,
        })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockAxisState {
        position: f64,
        speed: f64,
        busy: bool,
    }

    /// Axis double: moves complete instantly unless `hold` keeps the
    /// axis "in flight" until someone stops it.
    pub(crate) struct MockAxis {
        state: Mutex<MockAxisState>,
        stops: AtomicUsize,
        hold: AtomicBool,
        pub max_speed: f64,
        pub time_to_velocity: f64,
    }

    impl MockAxis {
        pub(crate) fn new() -> Self {
            Self {
                state: Mutex::new(MockAxisState {
                    position: 0.0,
                    speed: 1.0,
                    busy: false,
                }),
                stops: AtomicUsize::new(0),
                hold: AtomicBool::new(false),
                max_speed: 100.0,
                time_to_velocity: 0.1,
            }
        }

        /// Make subsequent moves hang until `stop` is called.
        pub(crate) fn set_hold(&self, hold: bool) {
            self.hold.store(hold, Ordering::SeqCst);
        }

        pub(crate) fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }

        pub(crate) fn current_speed(&self) -> f64 {
            self.state.lock().speed
        }
    }

    impl FlyableAxis for MockAxis {
        fn name(&self) -> &str {
            "mock-axis"
        }

        fn position(&self) -> Result<f64, FlyScanError> {
            Ok(self.state.lock().position)
        }

        fn move_async(&self, target: f64) -> Result<(), FlyScanError> {
            let mut state = self.state.lock();
            if self.hold.load(Ordering::SeqCst) {
                state.busy = true;
            } else {
                state.position = target;
            }
            Ok(())
        }

        fn set_speed(&self, speed: f64) -> Result<(), FlyScanError> {
            self.state.lock().speed = speed;
            Ok(())
        }

        fn speed(&self) -> Result<f64, FlyScanError> {
            Ok(self.state.lock().speed)
        }

        fn max_speed(&self) -> Result<f64, FlyScanError> {
            Ok(self.max_speed)
        }

        fn time_to_velocity(&self) -> Result<f64, FlyScanError> {
            Ok(self.time_to_velocity)
        }

        fn is_busy(&self) -> Result<bool, FlyScanError> {
            Ok(self.state.lock().busy)
        }

        fn stop(&self) -> Result<(), FlyScanError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.state.lock().busy = false;
            Ok(())
        }
    }

    /// Detector double with a fixed profile.
    pub(crate) struct MockDetector {
        pub profile: DetectorProfile,
    }

    impl TriggeredDetector for MockDetector {
        fn name(&self) -> &str {
            "mock-detector"
        }

        fn profile(&self) -> Result<DetectorProfile, FlyScanError> {
            Ok(self.profile)
        }
    }
}
