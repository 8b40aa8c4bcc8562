use crate::error::FlyScanError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between the orchestrator, the
/// move thread and anything blocked in a capture read.
///
/// Interruption in this crate is always explicit: blocking loops check
/// the token between polls and return [`FlyScanError::Interrupted`]
/// instead of being torn down from outside.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token for a new scan line.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Bail out if a cancellation is pending.
    pub fn check(&self) -> Result<(), FlyScanError> {
        if self.is_cancelled() {
            Err(FlyScanError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Poll a condition with timeout.
///
/// Repeatedly calls `condition` until it returns `Ok(true)`, sleeping
/// `poll_interval` between attempts. Gives up with
/// [`FlyScanError::Timeout`] once `timeout` has elapsed; condition
/// errors propagate immediately.
pub fn poll_until<F>(
    mut condition: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), FlyScanError>
where
    F: FnMut() -> Result<bool, FlyScanError>,
{
    let start = Instant::now();

    loop {
        match condition() {
            Ok(true) => return Ok(()),
            Ok(false) => {
                if start.elapsed() >= timeout {
                    return Err(FlyScanError::Timeout);
                }
                std::thread::sleep(poll_interval);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_poll_until_success() {
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = counter.clone();

        let result = poll_until(
            || {
                let mut count = counter_clone.lock();
                *count += 1;
                Ok(*count >= 3)
            },
            Duration::from_millis(500),
            Duration::from_millis(10),
        );

        assert!(result.is_ok());
        assert!(*counter.lock() >= 3);
    }

    #[test]
    fn test_poll_until_timeout() {
        let result = poll_until(
            || Ok(false),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        assert!(matches!(result, Err(FlyScanError::Timeout)));
    }

    #[test]
    fn test_poll_until_error() {
        let result = poll_until(
            || Err(FlyScanError::Protocol("bus fault".to_string())),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
        assert!(matches!(result, Err(FlyScanError::Protocol(_))));
    }

    #[test]
    fn test_cancel_token_round_trip() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(FlyScanError::Interrupted)));
        token.reset();
        assert!(token.check().is_ok());
    }
}
