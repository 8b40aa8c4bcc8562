//! In-memory transport used by the crate's tests.

use super::interface::{ChannelAccess, MonitorHandle};
use crate::error::FlyScanError;
use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct MockState {
    scalars: HashMap<String, f64>,
    waveforms: HashMap<String, Vec<f64>>,
    monitors: HashMap<String, Vec<Sender<f64>>>,
    puts: Vec<(String, f64)>,
    rbv_offsets: HashMap<String, f64>,
    links: HashMap<String, Vec<(String, f64)>>,
}

/// Fake gateway holding scalar and waveform records in memory.
///
/// Writes are recorded in order so tests can assert on write sequencing;
/// `push` drives monitor subscriptions the way hardware updates would.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a scalar record with an initial value.
    pub fn set(&self, pv: &str, value: f64) {
        self.state.lock().scalars.insert(pv.to_string(), value);
    }

    /// Define a waveform record.
    pub fn set_waveform(&self, pv: &str, values: Vec<f64>) {
        self.state.lock().waveforms.insert(pv.to_string(), values);
    }

    /// Make the paired `:RBV` record drift from subsequent writes, to
    /// exercise readback verification failures.
    pub fn set_rbv_offset(&self, pv: &str, offset: f64) {
        self.state.lock().rbv_offsets.insert(pv.to_string(), offset);
    }

    /// Couple records: writing `pv` also sets `target` to `value`, the
    /// way a command record flips a status bit in hardware.
    pub fn link(&self, pv: &str, target: &str, value: f64) {
        self.state
            .lock()
            .links
            .entry(pv.to_string())
            .or_default()
            .push((target.to_string(), value));
    }

    /// Update a scalar and notify its monitor subscriptions.
    pub fn push(&self, pv: &str, value: f64) {
        let mut state = self.state.lock();
        state.scalars.insert(pv.to_string(), value);
        if let Some(senders) = state.monitors.get_mut(pv) {
            senders.retain(|tx| tx.send(value).is_ok());
        }
    }

    /// All writes seen so far, in issue order.
    pub fn puts(&self) -> Vec<(String, f64)> {
        self.state.lock().puts.clone()
    }

    pub fn put_count(&self, pv: &str) -> usize {
        self.state
            .lock()
            .puts
            .iter()
            .filter(|(name, _)| name == pv)
            .count()
    }

    pub fn last_put(&self, pv: &str) -> Option<f64> {
        self.state
            .lock()
            .puts
            .iter()
            .rev()
            .find(|(name, _)| name == pv)
            .map(|(_, value)| *value)
    }
}

impl ChannelAccess for MockTransport {
    fn get(&self, pv: &str) -> Result<f64, FlyScanError> {
        let state = self.state.lock();
        if let Some(value) = state.scalars.get(pv) {
            return Ok(*value);
        }
        if let Some(wave) = state.waveforms.get(pv) {
            return Ok(wave.first().copied().unwrap_or(0.0));
        }
        Err(FlyScanError::Protocol(format!("no such record: {pv}")))
    }

    fn put(&self, pv: &str, value: f64) -> Result<(), FlyScanError> {
        let mut state = self.state.lock();
        state.scalars.insert(pv.to_string(), value);
        state.puts.push((pv.to_string(), value));
        // Mirror writes into the paired readback record when one exists
        let rbv = format!("{pv}:RBV");
        if state.scalars.contains_key(&rbv) {
            let offset = state.rbv_offsets.get(pv).copied().unwrap_or(0.0);
            state.scalars.insert(rbv, value + offset);
        }
        for (target, linked_value) in state.links.get(pv).cloned().unwrap_or_default() {
            state.scalars.insert(target.clone(), linked_value);
            if let Some(senders) = state.monitors.get_mut(&target) {
                senders.retain(|tx| tx.send(linked_value).is_ok());
            }
        }
        if let Some(senders) = state.monitors.get_mut(pv) {
            senders.retain(|tx| tx.send(value).is_ok());
        }
        Ok(())
    }

    fn get_waveform(
        &self,
        pv: &str,
        first: usize,
        count: usize,
    ) -> Result<Vec<f64>, FlyScanError> {
        let state = self.state.lock();
        let wave = state
            .waveforms
            .get(pv)
            .ok_or_else(|| FlyScanError::Protocol(format!("no such waveform: {pv}")))?;
        wave.get(first..first + count)
            .map(|slice| slice.to_vec())
            .ok_or_else(|| {
                FlyScanError::Protocol(format!(
                    "waveform {pv} slice {first}+{count} out of range ({} elements)",
                    wave.len()
                ))
            })
    }

    fn monitor(&self, pv: &str) -> Result<MonitorHandle, FlyScanError> {
        let mut state = self.state.lock();
        let initial = state
            .scalars
            .get(pv)
            .copied()
            .ok_or_else(|| FlyScanError::Protocol(format!("no such record: {pv}")))?;
        let (tx, rx) = unbounded();
        tx.send(initial)
            .map_err(|_| FlyScanError::Disconnected(pv.to_string()))?;
        state.monitors.entry(pv.to_string()).or_default().push(tx);
        Ok(MonitorHandle::new(rx, || {}))
    }
}
