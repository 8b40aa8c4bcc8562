pub mod ca;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod motion;
pub mod scanlog;
pub mod timing;
pub mod utils;
pub mod zebra;

pub use ca::{
    CaClient, CaClientBuilder, ChannelAccess, ChannelRegistry, ConnectionConfig, MonitorHandle,
    PvChannel,
};
pub use capture::{CaptureCanceller, CaptureChannel, CaptureProgress};
pub use config::{FlyScanConfig, load_config, load_config_or_default};
pub use controller::{ControllerSettings, FlyScanController, PositionStream, ScanPhase};
pub use error::FlyScanError;
pub use events::{EventBus, ScanEvent};
pub use motion::{CaAxis, CaDetector, FlyableAxis, TriggeredDetector};
pub use scanlog::{ScanLineRecord, ScanLog};
pub use timing::{
    AccelerationBudget, DetectorProfile, Direction, GateParameters, MovePlan, PulseRoute,
    ScanSpec, TimeUnit, compute_gate_parameters, required_speed,
};
pub use utils::CancelToken;
pub use zebra::{
    ArmSource, CaptureMask, CaptureSource, Encoder, GateSource, PulseSource, SourceSettings,
    ZebraDevice,
};
