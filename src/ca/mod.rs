pub mod client;
pub mod interface;
pub mod protocol;
pub mod registry;

#[cfg(test)]
pub(crate) mod mock;

// Re-export the main types
pub use client::{CaClient, CaClientBuilder, ConnectionConfig};
pub use interface::{ChannelAccess, MonitorHandle};
pub use registry::{ChannelRegistry, PvChannel};
