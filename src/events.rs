//! Typed scan lifecycle events.
//!
//! Observers subscribe for an explicit channel instead of registering
//! reflective callbacks; every event is a tagged variant with a typed
//! payload, so consumers match instead of downcasting.

use crate::controller::ScanPhase;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    PhaseChanged(ScanPhase),
    Armed { triggers: u64 },
    MoveStarted { target: f64 },
    LineComplete { captured: u64 },
    Fault { message: String },
}

/// Fan-out of [`ScanEvent`]s to any number of subscribers.
///
/// Publishing never blocks: channels are unbounded and subscribers that
/// dropped their receiver are pruned on the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ScanEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: ScanEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
