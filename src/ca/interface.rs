use crate::error::FlyScanError;
use crossbeam_channel::Receiver;

/// Blocking get/put/monitor access to named process variables.
///
/// This trait abstracts the Channel-Access-style transport behind the
/// register model, so hardware code can be exercised against mock
/// implementations in tests while production code talks to a gateway
/// over TCP ([`CaClient`](super::CaClient)).
///
/// All methods are synchronous network round-trips; callers treat them
/// as blocking I/O.
pub trait ChannelAccess: Send + Sync {
    /// Read the current value of a scalar register.
    fn get(&self, pv: &str) -> Result<f64, FlyScanError>;

    /// Write a scalar register. Returns once the gateway has accepted
    /// the write; it does not imply the value has been read back.
    fn put(&self, pv: &str, value: f64) -> Result<(), FlyScanError>;

    /// Read `count` elements of a waveform register starting at `first`.
    ///
    /// Elements below `first` are assumed already consumed; the gateway
    /// never re-sends them.
    fn get_waveform(&self, pv: &str, first: usize, count: usize)
    -> Result<Vec<f64>, FlyScanError>;

    /// Subscribe to value updates of a register.
    ///
    /// The subscription delivers an initial event carrying the current
    /// value, then one event per change. Dropping the handle cancels
    /// the subscription.
    fn monitor(&self, pv: &str) -> Result<MonitorHandle, FlyScanError>;
}

/// Live monitor subscription returned by [`ChannelAccess::monitor`].
pub struct MonitorHandle {
    updates: Receiver<f64>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl MonitorHandle {
    pub fn new(updates: Receiver<f64>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            updates,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// The raw update stream, for use in `select!` loops.
    pub fn updates(&self) -> &Receiver<f64> {
        &self.updates
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_drop_cancels_subscription() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let (tx, rx) = unbounded();
        tx.send(1.0).unwrap();

        let handle = MonitorHandle::new(rx, move || flag.store(true, Ordering::SeqCst));
        assert_eq!(handle.updates().recv().unwrap(), 1.0);
        drop(handle);
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
