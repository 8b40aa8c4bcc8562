//! Blocking, ordered reads of hardware-captured samples.
//!
//! The position-compare unit appends one sample per pulse to a waveform
//! record and advances a shared points-downloaded counter. A
//! [`CaptureChannel`] pairs one waveform with a monitor subscription on
//! that counter and hands samples to its consumer strictly in index
//! order, each exactly once. `read` is the scan engine's suspension
//! point: it blocks the calling thread with no timeout (completion is
//! hardware-driven and open-ended) but can be unblocked from another
//! thread through a [`CaptureCanceller`].

use crate::ca::{MonitorHandle, PvChannel};
use crate::error::FlyScanError;
use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capture progress readable without the consumer's read lock.
#[derive(Debug, Default)]
pub struct CaptureProgress {
    expected: AtomicU64,
    returned: AtomicU64,
}

impl CaptureProgress {
    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::Acquire)
    }

    pub fn returned(&self) -> u64 {
        self.returned.load(Ordering::Acquire)
    }

    /// Complete once every expected point has been handed out.
    pub fn is_complete(&self) -> bool {
        let expected = self.expected();
        expected > 0 && self.returned() >= expected
    }
}

/// Unblocks a pending [`CaptureChannel::read`] from another thread.
#[derive(Clone)]
pub struct CaptureCanceller(Sender<()>);

impl CaptureCanceller {
    pub fn cancel(&self) {
        // One queued cancel is enough; read drains it on wake
        let _ = self.0.try_send(());
    }
}

/// Ordered reader over one capture waveform.
pub struct CaptureChannel {
    waveform: Arc<PvChannel>,
    counter: Arc<PvChannel>,
    monitor: Option<MonitorHandle>,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
    progress: Arc<CaptureProgress>,
    available: u64,
    initial_seen: bool,
    over_delivery_logged: bool,
}

impl CaptureChannel {
    pub fn new(waveform: Arc<PvChannel>, counter: Arc<PvChannel>) -> Self {
        let (cancel_tx, cancel_rx) = bounded(1);
        Self {
            waveform,
            counter,
            monitor: None,
            cancel_tx,
            cancel_rx,
            progress: Arc::new(CaptureProgress::default()),
            available: 0,
            initial_seen: false,
            over_delivery_logged: false,
        }
    }

    /// Shared progress handle for completion checks.
    pub fn progress(&self) -> Arc<CaptureProgress> {
        self.progress.clone()
    }

    pub fn canceller(&self) -> CaptureCanceller {
        CaptureCanceller(self.cancel_tx.clone())
    }

    /// Begin monitoring the shared counter for a line of `expected` points.
    pub fn start(&mut self, expected: u64) -> Result<(), FlyScanError> {
        if self.monitor.is_some() {
            return Err(FlyScanError::Config(format!(
                "Capture channel {} already started",
                self.waveform.name()
            )));
        }
        if expected == 0 {
            return Err(FlyScanError::Config(
                "Expected point count must be positive".to_string(),
            ));
        }
        self.progress.expected.store(expected, Ordering::Release);
        self.progress.returned.store(0, Ordering::Release);
        self.available = 0;
        self.initial_seen = false;
        self.over_delivery_logged = false;
        // Drop a cancel left over from a previous line
        while self.cancel_rx.try_recv().is_ok() {}
        self.monitor = Some(self.counter.monitor()?);
        debug!(
            "Capture channel {} started for {expected} points",
            self.waveform.name()
        );
        Ok(())
    }

    /// Block until new samples are available, then return up to
    /// `max_to_read` of them in index order.
    ///
    /// The first call returns on the subscription's initial counter
    /// event, possibly with an empty batch; later calls wait until the
    /// counter moves past the last returned index. Once the line is
    /// complete the call returns an empty batch immediately.
    pub fn read(&mut self, max_to_read: usize) -> Result<Vec<f64>, FlyScanError> {
        let monitor = self.monitor.as_ref().ok_or_else(|| {
            FlyScanError::Config(format!(
                "Capture channel {} not started",
                self.waveform.name()
            ))
        })?;

        loop {
            let returned = self.progress.returned();
            if self.available > returned {
                break;
            }
            if self.initial_seen && self.progress.is_complete() {
                return Ok(Vec::new());
            }

            select! {
                recv(monitor.updates()) -> event => match event {
                    Ok(value) => {
                        let expected = self.progress.expected();
                        let mut count = value as u64;
                        if count > expected {
                            // Device jitter can capture a few points past the
                            // programmed cap; benign, but worth a trace.
                            if !self.over_delivery_logged {
                                warn!(
                                    "Counter on {} reports {count} points, {expected} expected; extra points ignored",
                                    self.counter.name()
                                );
                                self.over_delivery_logged = true;
                            }
                            count = expected;
                        }
                        self.available = self.available.max(count);
                        if !self.initial_seen {
                            self.initial_seen = true;
                            break;
                        }
                    }
                    Err(_) => {
                        return Err(FlyScanError::Disconnected(self.counter.name().to_string()));
                    }
                },
                recv(self.cancel_rx) -> _ => return Err(FlyScanError::Interrupted),
            }
        }

        let returned = self.progress.returned();
        let batch = (self.available - returned).min(max_to_read as u64);
        if batch == 0 {
            return Ok(Vec::new());
        }
        let samples = self
            .waveform
            .get_waveform(returned as usize, batch as usize)?;
        self.progress
            .returned
            .store(returned + batch, Ordering::Release);
        if self.progress.is_complete() {
            debug!(
                "Capture channel {} complete: {} points",
                self.waveform.name(),
                self.progress.expected()
            );
        }
        Ok(samples)
    }

    pub fn is_complete(&self) -> bool {
        self.progress.is_complete()
    }

    /// Disable monitoring and reset progress so the channel could be
    /// started again; in practice each scan line allocates fresh ones.
    pub fn stop(&mut self) {
        self.monitor = None;
        self.progress.expected.store(0, Ordering::Release);
        self.progress.returned.store(0, Ordering::Release);
        self.available = 0;
        self.initial_seen = false;
        self.over_delivery_logged = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::ChannelRegistry;
    use crate::ca::mock::MockTransport;

    const COUNTER: &str = "TS:PC_NUM_DOWN";
    const WAVE: &str = "TS:PC_ENC1";

    fn channel(transport: &Arc<MockTransport>) -> CaptureChannel {
        let registry = ChannelRegistry::new(transport.clone());
        CaptureChannel::new(
            registry.channel(WAVE).unwrap(),
            registry.channel(COUNTER).unwrap(),
        )
    }

    fn transport_with(points: Vec<f64>) -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport.set(COUNTER, 0.0);
        transport.set_waveform(WAVE, points);
        transport
    }

    #[test]
    fn test_batches_follow_counter_without_gaps() {
        let transport = transport_with(vec![10.0, 11.0, 12.0, 13.0, 14.0]);
        let mut channel = channel(&transport);
        channel.start(5).unwrap();

        // Counter observations 0, 0, 2, 2, 5
        transport.push(COUNTER, 0.0);
        transport.push(COUNTER, 2.0);
        transport.push(COUNTER, 2.0);
        transport.push(COUNTER, 5.0);

        // Initial event: nothing captured yet
        assert_eq!(channel.read(100).unwrap(), Vec::<f64>::new());
        assert!(!channel.is_complete());
        // Stale repeat of 0 is skipped, 2 delivers the first batch
        assert_eq!(channel.read(100).unwrap(), vec![10.0, 11.0]);
        assert!(!channel.is_complete());
        // Stale repeat of 2 is skipped, 5 delivers the rest
        assert_eq!(channel.read(100).unwrap(), vec![12.0, 13.0, 14.0]);
        assert!(channel.is_complete());
    }

    #[test]
    fn test_max_to_read_caps_batches() {
        let transport = transport_with(vec![1.0, 2.0, 3.0, 4.0]);
        let mut channel = channel(&transport);
        channel.start(4).unwrap();
        transport.push(COUNTER, 4.0);

        assert_eq!(channel.read(100).unwrap(), Vec::<f64>::new());
        assert_eq!(channel.read(3).unwrap(), vec![1.0, 2.0, 3.0]);
        // Remainder is served without waiting for another event
        assert_eq!(channel.read(3).unwrap(), vec![4.0]);
        assert!(channel.is_complete());
    }

    #[test]
    fn test_over_delivery_is_clamped() {
        let transport = transport_with(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut channel = channel(&transport);
        channel.start(3).unwrap();
        transport.push(COUNTER, 5.0);

        assert_eq!(channel.read(100).unwrap(), Vec::<f64>::new());
        assert_eq!(channel.read(100).unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(channel.is_complete());
        // Completed stream answers immediately instead of blocking
        assert_eq!(channel.read(100).unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn test_cancel_unblocks_reader() {
        let transport = transport_with(vec![]);
        let mut channel = channel(&transport);
        channel.start(5).unwrap();
        // Consume the initial event so the next read truly blocks
        assert_eq!(channel.read(100).unwrap(), Vec::<f64>::new());

        let canceller = channel.canceller();
        let reader = std::thread::spawn(move || channel.read(100));
        std::thread::sleep(std::time::Duration::from_millis(20));
        canceller.cancel();

        match reader.join().unwrap() {
            Err(FlyScanError::Interrupted) => {}
            other => panic!("expected interruption, got {other:?}"),
        }
    }

    #[test]
    fn test_read_requires_start() {
        let transport = transport_with(vec![]);
        let mut channel = channel(&transport);
        assert!(channel.read(1).is_err());
    }

    #[test]
    fn test_stop_resets_for_reuse() {
        let transport = transport_with(vec![7.0, 8.0]);
        let mut channel = channel(&transport);
        channel.start(2).unwrap();
        transport.push(COUNTER, 2.0);
        assert_eq!(channel.read(100).unwrap(), Vec::<f64>::new());
        assert_eq!(channel.read(100).unwrap(), vec![7.0, 8.0]);

        channel.stop();
        assert!(!channel.is_complete());
        assert_eq!(channel.progress().returned(), 0);

        // Counter restarts from zero on the next line
        transport.set(COUNTER, 0.0);
        channel.start(2).unwrap();
        transport.push(COUNTER, 2.0);
        assert_eq!(channel.read(100).unwrap(), Vec::<f64>::new());
        assert_eq!(channel.read(100).unwrap(), vec![7.0, 8.0]);
    }
}
