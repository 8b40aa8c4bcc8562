use super::interface::{ChannelAccess, MonitorHandle};
use crate::error::FlyScanError;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A connected handle to one named register.
///
/// Obtained from a [`ChannelRegistry`]; holds the transport and its PV
/// name so callers stop threading name strings through every layer.
pub struct PvChannel {
    pv: String,
    transport: Arc<dyn ChannelAccess>,
}

impl PvChannel {
    fn connect(transport: Arc<dyn ChannelAccess>, pv: &str) -> Result<Self, FlyScanError> {
        // A first read both verifies the record exists and warms the
        // gateway-side channel.
        transport.get(pv)?;
        debug!("Connected channel {pv}");
        Ok(Self {
            pv: pv.to_string(),
            transport,
        })
    }

    pub fn name(&self) -> &str {
        &self.pv
    }

    pub fn get(&self) -> Result<f64, FlyScanError> {
        self.transport.get(&self.pv)
    }

    pub fn put(&self, value: f64) -> Result<(), FlyScanError> {
        self.transport.put(&self.pv, value)
    }

    pub fn get_waveform(&self, first: usize, count: usize) -> Result<Vec<f64>, FlyScanError> {
        self.transport.get_waveform(&self.pv, first, count)
    }

    pub fn monitor(&self) -> Result<MonitorHandle, FlyScanError> {
        self.transport.monitor(&self.pv)
    }
}

/// Process-scoped cache of connected channels, keyed by PV name.
///
/// Channels are shared across scan lines; the registry outlives any one
/// controller and is passed by handle to every component that needs
/// register access. Lookup and insertion are guarded by a single critical
/// section; connection establishment happens outside the lock so a slow
/// record cannot stall unrelated lookups. When two threads race to create
/// the same channel, the first insert wins and the loser's connection is
/// dropped.
pub struct ChannelRegistry {
    transport: Arc<dyn ChannelAccess>,
    channels: Mutex<HashMap<String, Arc<PvChannel>>>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn ChannelAccess>) -> Self {
        Self {
            transport,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a channel, connecting it on first use.
    pub fn channel(&self, pv: &str) -> Result<Arc<PvChannel>, FlyScanError> {
        if let Some(channel) = self.channels.lock().get(pv) {
            return Ok(channel.clone());
        }

        let fresh = Arc::new(PvChannel::connect(self.transport.clone(), pv)?);

        let mut channels = self.channels.lock();
        Ok(channels
            .entry(pv.to_string())
            .or_insert(fresh)
            .clone())
    }

    /// Number of connected channels, for diagnostics.
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }
}
