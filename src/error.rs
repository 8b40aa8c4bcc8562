use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlyScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection timeout")]
    Timeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Channel disconnected: {0}")]
    Disconnected(String),
    #[error("Gateway error {code}: {message}")]
    Gateway { code: i32, message: String },
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Readback mismatch on {register}: wrote {requested}, read back {actual} (tolerance {tolerance})"
    )]
    Readback {
        register: &'static str,
        requested: f64,
        actual: f64,
        tolerance: f64,
    },
    #[error("Required speed {required} exceeds motor limit {limit}")]
    SpeedLimit { required: f64, limit: f64 },
    #[error("Capture incomplete: {returned} of {expected} points downloaded")]
    CaptureShortfall { expected: u64, returned: u64 },
    #[error("Interrupted")]
    Interrupted,
}
