use super::interface::{ChannelAccess, MonitorHandle};
use super::protocol::{self, FrameHeader, HEADER_SIZE, Op};
use crate::error::FlyScanError;
use byteorder::{BigEndian, WriteBytesExt};
use crossbeam_channel::{Sender, bounded, unbounded};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Connection configuration for the register gateway TCP client.
///
/// All timeouts have sensible defaults but can be customized for specific
/// network conditions. The read timeout bounds how long a request waits
/// for its reply; monitor events are pushed by the gateway and are not
/// subject to it.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing the initial TCP connection
    pub connect_timeout: Duration,
    /// Timeout for a request/reply round trip
    pub read_timeout: Duration,
    /// Timeout for writing a frame to the gateway
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder for constructing [`CaClient`] instances with flexible configuration.
///
/// # Examples
///
/// ```no_run
/// use zebra_flyscan::CaClient;
///
/// let client = CaClient::builder()
///     .address("172.23.5.10")
///     .port(5064)
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct CaClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    config: ConnectionConfig,
}

impl CaClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the full connection configuration
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set request/reply timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Connect and start the reply-routing reader thread.
    pub fn build(self) -> Result<CaClient, FlyScanError> {
        let address = self
            .address
            .ok_or_else(|| FlyScanError::Config("Gateway address must be specified".to_string()))?;
        let port = self
            .port
            .ok_or_else(|| FlyScanError::Config("Gateway port must be specified".to_string()))?;

        let socket_addr: SocketAddr = format!("{address}:{port}")
            .parse()
            .map_err(|_| FlyScanError::InvalidAddress(address.clone()))?;

        debug!("Connecting to register gateway at {socket_addr}");

        let stream =
            TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout).map_err(|e| {
                warn!("Failed to connect to {socket_addr}: {e}");
                if e.kind() == std::io::ErrorKind::TimedOut {
                    FlyScanError::Timeout
                } else {
                    FlyScanError::Io(e)
                }
            })?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;

        // The reader thread owns a blocking clone of the socket; request
        // timeouts are enforced on the reply channel instead.
        let reader_stream = stream.try_clone()?;
        reader_stream.set_read_timeout(None)?;

        let shared = Arc::new(ClientShared {
            writer: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            reply_timeout: self.config.read_timeout,
        });

        let router = shared.clone();
        std::thread::Builder::new()
            .name("ca-router".to_string())
            .spawn(move || route_frames(reader_stream, router))?;

        debug!("Connected to register gateway");
        Ok(CaClient { shared })
    }
}

type ReplySender = Sender<Result<Vec<f64>, FlyScanError>>;

struct ClientShared {
    writer: Mutex<TcpStream>,
    pending: Mutex<HashMap<u32, ReplySender>>,
    monitors: Mutex<HashMap<u32, Sender<f64>>>,
    next_id: AtomicU32,
    reply_timeout: Duration,
}

impl ClientShared {
    fn send_frame(&self, op: Op, request_id: u32, payload: &[u8]) -> Result<(), FlyScanError> {
        let header = FrameHeader::request(op, request_id, payload.len() as u32);
        let mut writer = self.writer.lock();
        writer.write_all(&header.to_bytes())?;
        if !payload.is_empty() {
            writer.write_all(payload)?;
        }
        Ok(())
    }

    /// Send a request frame and block until its reply is routed back.
    fn round_trip(&self, op: Op, payload: &[u8]) -> Result<Vec<f64>, FlyScanError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.round_trip_with_id(op, request_id, payload)
    }

    fn round_trip_with_id(
        &self,
        op: Op,
        request_id: u32,
        payload: &[u8],
    ) -> Result<Vec<f64>, FlyScanError> {
        let (tx, rx) = bounded(1);
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send_frame(op, request_id, payload) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match rx.recv_timeout(self.reply_timeout) {
            Ok(result) => result,
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(FlyScanError::Timeout)
            }
        }
    }
}

/// Reader-thread loop: routes replies to their waiting requests and
/// monitor events to their subscriptions until the socket closes.
fn route_frames(mut stream: TcpStream, shared: Arc<ClientShared>) {
    loop {
        let header = match protocol::read_exact_bytes::<HEADER_SIZE>(&mut stream)
            .and_then(|bytes| FrameHeader::from_bytes(&bytes))
        {
            Ok(header) => header,
            Err(e) => {
                debug!("Gateway connection closed: {e}");
                break;
            }
        };
        let payload = match protocol::read_payload(&mut stream, header.payload_len as usize) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to read frame payload: {e}");
                break;
            }
        };

        match header.op {
            Op::Reply => {
                let waiter = shared.pending.lock().remove(&header.request_id);
                let result = if header.status == 0 {
                    protocol::decode_values(&payload)
                } else {
                    Err(protocol::decode_error(&header, &payload))
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("Dropping reply for unknown request {}", header.request_id),
                }
            }
            Op::Event => {
                if header.status != 0 {
                    warn!(
                        "Monitor {} reported gateway status {}",
                        header.request_id, header.status
                    );
                    continue;
                }
                match protocol::decode_values(&payload) {
                    Ok(values) if !values.is_empty() => {
                        if let Some(tx) = shared.monitors.lock().get(&header.request_id) {
                            // A lagging subscriber is not this thread's problem
                            let _ = tx.send(values[0]);
                        }
                    }
                    Ok(_) => warn!("Empty monitor event for subscription {}", header.request_id),
                    Err(e) => warn!("Bad monitor event payload: {e}"),
                }
            }
            other => warn!("Unexpected frame {other:?} from gateway"),
        }
    }

    // Unblock every waiter before exiting
    let mut pending = shared.pending.lock();
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(FlyScanError::Disconnected("gateway".to_string())));
    }
    shared.monitors.lock().clear();
}

/// TCP client for a Channel-Access-style register gateway.
///
/// One persistent connection carries all request/reply traffic plus
/// asynchronous monitor events; a dedicated reader thread demultiplexes
/// them by request id. The client is `Send + Sync` and is normally shared
/// as an `Arc<dyn ChannelAccess>`.
pub struct CaClient {
    shared: Arc<ClientShared>,
}

impl CaClient {
    /// Create a new client with default configuration.
    pub fn new(addr: &str, port: u16) -> Result<Self, FlyScanError> {
        Self::builder().address(addr).port(port).build()
    }

    /// Create a builder for flexible configuration.
    pub fn builder() -> CaClientBuilder {
        CaClientBuilder::default()
    }
}

impl ChannelAccess for CaClient {
    fn get(&self, pv: &str) -> Result<f64, FlyScanError> {
        let mut payload = Vec::new();
        protocol::encode_pv(&mut payload, pv)?;
        let values = self.shared.round_trip(Op::Get, &payload)?;
        values
            .first()
            .copied()
            .ok_or_else(|| FlyScanError::Protocol(format!("Empty reply reading {pv}")))
    }

    fn put(&self, pv: &str, value: f64) -> Result<(), FlyScanError> {
        let mut payload = Vec::new();
        protocol::encode_pv(&mut payload, pv)?;
        protocol::encode_values(&mut payload, &[value])?;
        self.shared.round_trip(Op::Put, &payload)?;
        Ok(())
    }

    fn get_waveform(
        &self,
        pv: &str,
        first: usize,
        count: usize,
    ) -> Result<Vec<f64>, FlyScanError> {
        let mut payload = Vec::new();
        protocol::encode_pv(&mut payload, pv)?;
        payload.write_u32::<BigEndian>(first as u32)?;
        payload.write_u32::<BigEndian>(count as u32)?;
        let values = self.shared.round_trip(Op::GetWave, &payload)?;
        if values.len() != count {
            warn!(
                "Waveform {pv} returned {} of {count} requested elements",
                values.len()
            );
        }
        Ok(values)
    }

    fn monitor(&self, pv: &str) -> Result<MonitorHandle, FlyScanError> {
        let subscription_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();

        // Register before the request goes out so the initial event
        // cannot slip past the router.
        self.shared.monitors.lock().insert(subscription_id, tx);

        let mut payload = Vec::new();
        protocol::encode_pv(&mut payload, pv)?;
        if let Err(e) = self
            .shared
            .round_trip_with_id(Op::MonitorStart, subscription_id, &payload)
        {
            self.shared.monitors.lock().remove(&subscription_id);
            return Err(e);
        }

        let shared = self.shared.clone();
        Ok(MonitorHandle::new(rx, move || {
            shared.monitors.lock().remove(&subscription_id);
            if let Err(e) = shared.send_frame(Op::MonitorCancel, subscription_id, &[]) {
                debug!("Failed to cancel subscription {subscription_id}: {e}");
            }
        }))
    }
}

impl Drop for CaClient {
    fn drop(&mut self) {
        // Closing the socket lets the router thread run down on its own
        let _ = self.shared.writer.lock().shutdown(Shutdown::Both);
    }
}
