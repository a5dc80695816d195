//! Serial port connection
//!
//! [`SerialConnection`] owns at most one open port. A spawned I/O task holds
//! the stream; writes reach it through a request channel and received bytes
//! leave it as [`TransportEvent::Data`]. An unexpected close schedules
//! reconnect attempts with exponential backoff.

use super::{
    ConnectionInfo, ConnectionOptions, ConnectionState, DisconnectReason, DynSerial, EndpointInfo,
    PortEnumerator, PortOpener, SerialPortIO, TransportError, TransportEvent,
};
use crate::core::scheduler::ScheduledTask;
use crate::utils::autodetect;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPortType, StopBits};
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

const READ_BUFFER_SIZE: usize = 1024;
const EVENT_CAPACITY: usize = 1024;

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity '{}'", other)),
        }
    }
}

impl From<SerialParity> for Parity {
    fn from(parity: SerialParity) -> Self {
        match parity {
            SerialParity::None => Parity::None,
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Driver-level read/write timeout
    pub timeout: Duration,
}

impl SerialConfig {
    /// Create a new serial configuration with 8N1 framing
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the driver-level timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same parameters for another port
    #[must_use]
    pub fn for_port(&self, port: &str) -> Self {
        Self {
            port: port.to_string(),
            ..self.clone()
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("", 9600)
    }
}

impl SerialPortIO for tokio_serial::SerialStream {
    fn discard_buffers(&mut self) -> io::Result<()> {
        tokio_serial::SerialPort::clear(self, tokio_serial::ClearBuffer::All).map_err(io::Error::from)
    }
}

/// Host serial ports via `serialport` and `tokio-serial`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn list_ports(&self) -> Result<Vec<EndpointInfo>, TransportError> {
        let ports = serialport::available_ports()
            .map_err(|e| TransportError::Enumeration(e.to_string()))?;

        Ok(ports
            .into_iter()
            .map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => EndpointInfo {
                    path: info.port_name,
                    manufacturer: usb.manufacturer,
                    vendor_id: Some(usb.vid),
                    product_id: Some(usb.pid),
                    serial_number: usb.serial_number,
                },
                _ => EndpointInfo::new(info.port_name),
            })
            .collect())
    }
}

#[async_trait]
impl PortOpener for SystemPorts {
    async fn open(&self, config: &SerialConfig) -> Result<DynSerial, TransportError> {
        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let builder = tokio_serial::new(config.port.as_str(), config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(config.parity.into())
            .flow_control(FlowControl::None)
            .timeout(config.timeout);

        let stream = tokio_serial::SerialStream::open(&builder).map_err(|e| TransportError::Open {
            path: config.port.clone(),
            message: e.to_string(),
        })?;

        Ok(Box::new(stream))
    }
}

enum IoRequest {
    Write(Bytes, oneshot::Sender<io::Result<()>>),
    Drain(oneshot::Sender<io::Result<()>>),
    Discard(oneshot::Sender<io::Result<()>>),
}

#[derive(Default)]
struct Link {
    state: ConnectionState,
    io: Option<mpsc::Sender<IoRequest>>,
    generation: u64,
    reconnect_attempts: u32,
    reconnect_task: Option<ScheduledTask>,
    path: Option<String>,
    connection_start: Option<DateTime<Local>>,
    last_activity: Option<Instant>,
}

struct Inner {
    options: ConnectionOptions,
    enumerator: Arc<dyn PortEnumerator>,
    opener: Arc<dyn PortOpener>,
    link: Mutex<Link>,
    events: broadcast::Sender<TransportEvent>,
}

/// Reconnecting serial connection handle
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct SerialConnection {
    inner: Arc<Inner>,
}

impl SerialConnection {
    /// Create a connection using the given port backends
    pub fn new(
        options: ConnectionOptions,
        enumerator: Arc<dyn PortEnumerator>,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                options,
                enumerator,
                opener,
                link: Mutex::new(Link::default()),
                events,
            }),
        }
    }

    /// Create a connection on the host's serial ports
    pub fn system(options: ConnectionOptions) -> Self {
        let ports = Arc::new(SystemPorts);
        Self::new(options, ports.clone(), ports)
    }

    /// Subscribe to lifecycle and data events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Enumerate serial endpoints
    pub fn list_endpoints(&self) -> Result<Vec<EndpointInfo>, TransportError> {
        let ports = self.inner.enumerator.list_ports()?;
        debug!("Found {} serial ports", ports.len());
        Ok(ports)
    }

    /// Open `path`, or the first FTDI adapter when no path is given.
    ///
    /// Cancels any scheduled reconnect. Connecting while already connected
    /// is a no-op.
    pub async fn connect(&self, path: Option<&str>) -> Result<(), TransportError> {
        let path = match path {
            Some(path) => path.to_string(),
            None => match autodetect::detect(self.inner.enumerator.as_ref()) {
                Ok(path) => {
                    info!("Auto-detected FTDI device at {}", path);
                    path
                }
                Err(e) => {
                    error!("Port auto-detection failed: {}", e);
                    return Err(e);
                }
            },
        };

        self.inner.open(&path, false).await
    }

    /// Close the port and suppress automatic reconnection
    pub fn disconnect(&self) {
        info!("Manually disconnecting");

        let was_open = {
            let mut link = self.inner.link.lock();
            if let Some(task) = link.reconnect_task.take() {
                task.cancel();
            }
            link.reconnect_attempts = self.inner.options.reconnect.max_attempts;
            link.state = ConnectionState::Disconnected;
            link.generation += 1;
            link.io.take().is_some()
        };

        if was_open {
            info!("Serial port closed");
            self.inner.emit(TransportEvent::Disconnected(DisconnectReason::User));
        }
    }

    /// Write `data` to the port
    pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        trace!(bytes = data.len(), "Writing to serial port");
        let data = Bytes::copy_from_slice(data);
        self.inner.request(|reply| IoRequest::Write(data, reply)).await
    }

    /// Wait until written bytes have left the port
    pub async fn drain(&self) -> Result<(), TransportError> {
        self.inner.request(IoRequest::Drain).await
    }

    /// Discard buffered input and output
    pub async fn flush(&self) -> Result<(), TransportError> {
        self.inner.request(IoRequest::Discard).await
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    /// `Ok` when a port is open, otherwise why it is not usable
    pub fn check_connected(&self) -> Result<(), TransportError> {
        self.inner.io().map(|_| ())
    }

    /// Whether a port is open
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connected and active within the idle limit
    pub fn is_healthy(&self) -> bool {
        let link = self.inner.link.lock();
        link.state == ConnectionState::Connected
            && link
                .last_activity
                .is_some_and(|t| t.elapsed() < self.inner.options.idle_limit)
    }

    /// Snapshot for status displays
    pub fn connection_info(&self) -> ConnectionInfo {
        let link = self.inner.link.lock();
        ConnectionInfo {
            state: link.state,
            is_connected: link.state == ConnectionState::Connected,
            is_connecting: link.state == ConnectionState::Connecting,
            path: link.path.clone(),
            reconnect_attempts: link.reconnect_attempts,
            max_reconnect_attempts: self.inner.options.reconnect.max_attempts,
            connection_start: link.connection_start,
            idle_for: link.last_activity.map(|t| t.elapsed()),
        }
    }
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn io(&self) -> Result<mpsc::Sender<IoRequest>, TransportError> {
        let link = self.link.lock();
        match (&link.state, &link.io) {
            (ConnectionState::Connected, Some(io)) => Ok(io.clone()),
            (ConnectionState::Exhausted, _) => Err(TransportError::ReconnectExhausted {
                attempts: link.reconnect_attempts,
            }),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn request<F>(&self, make: F) -> Result<(), TransportError>
    where
        F: FnOnce(oneshot::Sender<io::Result<()>>) -> IoRequest,
    {
        let io = self.io()?;
        let (tx, rx) = oneshot::channel();
        let request = make(tx);

        let limit = self.options.write_timeout;
        let exchange = async {
            io.send(request)
                .await
                .map_err(|_| TransportError::NotConnected)?;
            rx.await.map_err(|_| TransportError::Disconnected)??;
            Ok::<_, TransportError>(())
        };

        tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| TransportError::WriteTimeout(limit))??;

        self.link.lock().last_activity = Some(Instant::now());
        Ok(())
    }

    fn received(&self, data: Bytes) {
        self.link.lock().last_activity = Some(Instant::now());
        trace!(bytes = data.len(), "Received from serial port");
        self.emit(TransportEvent::Data(data));
    }

    async fn open(self: &Arc<Self>, path: &str, reconnect: bool) -> Result<(), TransportError> {
        {
            let mut link = self.link.lock();
            match link.state {
                ConnectionState::Connecting => return Err(TransportError::ConnectionInProgress),
                ConnectionState::Connected => {
                    warn!("Already connected to {}", link.path.as_deref().unwrap_or(path));
                    return Ok(());
                }
                ConnectionState::Reconnecting { .. } => {
                    if !reconnect {
                        if let Some(task) = link.reconnect_task.take() {
                            task.cancel();
                        }
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Exhausted => {
                    if reconnect {
                        // Superseded by a manual disconnect
                        return Ok(());
                    }
                }
            }
            link.state = ConnectionState::Connecting;
            link.path = Some(path.to_string());
            link.connection_start = Some(Local::now());
        }

        info!("Connecting to {}", path);
        let started = Instant::now();
        let limit = self.options.connect_timeout;
        let config = self.options.serial.for_port(path);

        let opened = match tokio::time::timeout(limit, self.opener.open(&config)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionTimeout(limit)),
        };

        match opened {
            Ok(port) => {
                let (tx, rx) = mpsc::channel(16);
                let generation = {
                    let mut link = self.link.lock();
                    if link.state != ConnectionState::Connecting {
                        drop(port);
                        return Err(TransportError::Aborted);
                    }
                    link.generation += 1;
                    link.io = Some(tx);
                    link.state = ConnectionState::Connected;
                    link.reconnect_attempts = 0;
                    link.last_activity = Some(Instant::now());
                    link.generation
                };

                tokio::spawn(run_io(Arc::downgrade(self), port, rx, generation));

                let connection_time = started.elapsed();
                info!("Connected to {} in {}ms", path, connection_time.as_millis());
                self.emit(TransportEvent::Connected {
                    path: path.to_string(),
                    connection_time,
                });
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", path, e);
                self.emit(TransportEvent::Error(e.to_string()));

                let still_ours = {
                    let mut link = self.link.lock();
                    let ours = link.state == ConnectionState::Connecting;
                    if ours {
                        link.state = ConnectionState::Disconnected;
                    }
                    ours
                };
                if reconnect && still_ours {
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    fn link_lost(self: &Arc<Self>, generation: u64, reason: DisconnectReason) {
        {
            let mut link = self.link.lock();
            if link.generation != generation || link.state != ConnectionState::Connected {
                return;
            }
            link.io = None;
            link.state = ConnectionState::Disconnected;
        }

        match &reason {
            DisconnectReason::IoError(e) => {
                error!("Serial port error: {}", e);
                self.emit(TransportEvent::Error(e.clone()));
            }
            _ => info!("Serial port closed"),
        }
        self.emit(TransportEvent::Disconnected(reason));

        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let policy = self.options.reconnect;
        let mut link = self.link.lock();

        if !policy.should_attempt(link.reconnect_attempts) {
            let attempts = link.reconnect_attempts;
            link.state = ConnectionState::Exhausted;
            drop(link);
            error!("Max reconnection attempts reached ({})", attempts);
            self.emit(TransportEvent::ReconnectExhausted { attempts });
            return;
        }

        link.reconnect_attempts += 1;
        let attempt = link.reconnect_attempts;
        let delay = policy.delay_for_attempt(attempt);
        link.state = ConnectionState::Reconnecting {
            attempt,
            next_delay: delay,
        };

        info!(
            "Scheduling reconnection attempt {}/{} in {}ms",
            attempt,
            policy.max_attempts,
            delay.as_millis()
        );

        let weak = Arc::downgrade(self);
        link.reconnect_task = Some(ScheduledTask::after(delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(attempt, delay).await;
            }
        }));
    }

    async fn reconnect(self: Arc<Self>, attempt: u32, delay: Duration) {
        let path = {
            let link = self.link.lock();
            if !matches!(link.state, ConnectionState::Reconnecting { .. }) {
                return;
            }
            link.path.clone()
        };
        let Some(path) = path else {
            return;
        };

        self.emit(TransportEvent::Reconnecting {
            attempt,
            max_attempts: self.options.reconnect.max_attempts,
            delay,
        });

        if let Err(e) = self.open(&path, true).await {
            warn!("Reconnection attempt {} failed: {}", attempt, e);
        }
    }
}

async fn run_io(
    inner: Weak<Inner>,
    mut port: DynSerial,
    mut requests: mpsc::Receiver<IoRequest>,
    generation: u64,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    debug!("Serial I/O task released");
                    return;
                };
                if let Err(e) = serve(&mut port, request).await {
                    break DisconnectReason::IoError(e.to_string());
                }
            }
            read = port.read(&mut buf) => match read {
                Ok(0) => break DisconnectReason::RemoteClosed,
                Ok(n) => {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    inner.received(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => break DisconnectReason::IoError(e.to_string()),
            }
        }
    };

    drop(port);
    if let Some(inner) = inner.upgrade() {
        inner.link_lost(generation, reason);
    }
}

/// Serve one request. An `Err` ends the link.
async fn serve(port: &mut DynSerial, request: IoRequest) -> io::Result<()> {
    let (result, reply, fatal) = match request {
        IoRequest::Write(data, reply) => (port.write_all(&data).await, reply, true),
        IoRequest::Drain(reply) => (port.flush().await, reply, true),
        IoRequest::Discard(reply) => (port.discard_buffers(), reply, false),
    };

    match result {
        Ok(()) => {
            let _ = reply.send(Ok(()));
            Ok(())
        }
        Err(e) => {
            let _ = reply.send(Err(io::Error::new(e.kind(), e.to_string())));
            if fatal {
                Err(e)
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{MockPortEnumerator, ReconnectPolicy};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::DuplexStream;

    struct FakeOpener {
        peers: mpsc::UnboundedSender<DuplexStream>,
        fail: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl PortOpener for FakeOpener {
        async fn open(&self, config: &SerialConfig) -> Result<DynSerial, TransportError> {
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Open {
                    path: config.port.clone(),
                    message: "device busy".into(),
                });
            }
            let (ours, theirs) = tokio::io::duplex(256);
            let _ = self.peers.send(theirs);
            Ok(Box::new(ours))
        }
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            serial: SerialConfig::default(),
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
            idle_limit: Duration::from_millis(1500),
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1000),
                max_delay: Duration::from_millis(30000),
            },
        }
    }

    fn connection(
        delay: Duration,
    ) -> (SerialConnection, Arc<FakeOpener>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let opener = Arc::new(FakeOpener {
            peers,
            fail: AtomicBool::new(false),
            delay,
        });
        let mut enumerator = MockPortEnumerator::new();
        enumerator
            .expect_list_ports()
            .returning(|| Ok(vec![EndpointInfo::new("/dev/ttyS0")]));
        let conn = SerialConnection::new(options(), Arc::new(enumerator), opener.clone());
        (conn, opener, rx)
    }

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(120), rx.recv()).await {
                Ok(Ok(TransportEvent::Data(_))) => continue,
                Ok(Ok(event)) => return event,
                other => panic!("no event: {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_write_and_receive() {
        let (conn, _opener, mut peers) = connection(Duration::ZERO);
        let mut events = conn.subscribe();

        conn.connect(Some("/dev/ttyUSB0")).await.unwrap();
        assert!(conn.is_connected());
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected { ref path, .. } if path == "/dev/ttyUSB0"
        ));

        let mut peer = peers.recv().await.unwrap();
        conn.write(b"SGW\r").await.unwrap();
        conn.drain().await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SGW\r");

        peer.write_all(b"Gross 1.00 lb.\r\n").await.unwrap();
        let data = loop {
            if let TransportEvent::Data(data) = events.recv().await.unwrap() {
                break data;
            }
        };
        assert_eq!(&data[..], b"Gross 1.00 lb.\r\n");
        assert!(conn.flush().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_is_noop() {
        let (conn, _opener, _peers) = connection(Duration::ZERO);
        conn.connect(Some("/dev/ttyUSB0")).await.unwrap();
        conn.connect(Some("/dev/ttyUSB1")).await.unwrap();
        assert_eq!(conn.connection_info().path.as_deref(), Some("/dev/ttyUSB0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_rejected() {
        let (conn, _opener, _peers) = connection(Duration::from_millis(100));
        let other = conn.clone();
        let first = tokio::spawn(async move { other.connect(Some("/dev/ttyUSB0")).await });
        tokio::task::yield_now().await;

        let second = conn.connect(Some("/dev/ttyUSB0")).await;
        assert!(matches!(second, Err(TransportError::ConnectionInProgress)));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (conn, _opener, _peers) = connection(Duration::from_secs(10));
        let result = conn.connect(Some("/dev/ttyUSB0")).await;
        assert!(matches!(result, Err(TransportError::ConnectionTimeout(_))));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_write_when_disconnected() {
        let (conn, _opener, _peers) = connection(Duration::ZERO);
        assert!(matches!(conn.write(b"SGW\r").await, Err(TransportError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reconnects() {
        let (conn, _opener, mut peers) = connection(Duration::ZERO);
        let mut events = conn.subscribe();
        conn.connect(Some("/dev/ttyUSB0")).await.unwrap();
        next_event(&mut events).await;

        let started = Instant::now();
        drop(peers.recv().await.unwrap());

        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected(DisconnectReason::RemoteClosed)
        ));
        match next_event(&mut events).await {
            TransportEvent::Reconnecting { attempt, delay, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(1000));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected { .. }));
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(conn.connection_info().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion() {
        let (conn, opener, mut peers) = connection(Duration::ZERO);
        let mut events = conn.subscribe();
        conn.connect(Some("/dev/ttyUSB0")).await.unwrap();
        next_event(&mut events).await;

        opener.fail.store(true, Ordering::SeqCst);
        let started = Instant::now();
        drop(peers.recv().await.unwrap());

        let mut delays = Vec::new();
        let attempts = loop {
            match next_event(&mut events).await {
                TransportEvent::Reconnecting { delay, .. } => delays.push(delay.as_millis()),
                TransportEvent::ReconnectExhausted { attempts } => break attempts,
                _ => {}
            }
        };

        assert_eq!(attempts, 3);
        assert_eq!(delays, vec![1000, 2000, 4000]);
        assert!(started.elapsed() >= Duration::from_millis(7000));
        assert_eq!(conn.state(), ConnectionState::Exhausted);
        assert!(matches!(
            conn.check_connected(),
            Err(TransportError::ReconnectExhausted { attempts: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_suppresses_reconnect() {
        let (conn, _opener, mut peers) = connection(Duration::ZERO);
        let mut events = conn.subscribe();
        conn.connect(Some("/dev/ttyUSB0")).await.unwrap();
        next_event(&mut events).await;
        let _peer = peers.recv().await.unwrap();

        conn.disconnect();
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected(DisconnectReason::User)
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_scheduled_reconnect() {
        let (conn, _opener, mut peers) = connection(Duration::ZERO);
        let mut events = conn.subscribe();
        conn.connect(Some("/dev/ttyUSB0")).await.unwrap();
        next_event(&mut events).await;

        drop(peers.recv().await.unwrap());
        next_event(&mut events).await;
        assert!(matches!(conn.state(), ConnectionState::Reconnecting { attempt: 1, .. }));

        conn.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_tracks_activity() {
        let (conn, _opener, mut peers) = connection(Duration::ZERO);
        assert!(!conn.is_healthy());

        conn.connect(Some("/dev/ttyUSB0")).await.unwrap();
        let _peer = peers.recv().await.unwrap();
        assert!(conn.is_healthy());

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(!conn.is_healthy());

        conn.write(b"SGW\r").await.unwrap();
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_auto_detect_without_ftdi() {
        let (conn, _opener, _peers) = connection(Duration::ZERO);
        assert!(matches!(conn.connect(None).await, Err(TransportError::NoDeviceFound)));
    }

    #[test]
    fn test_parity_parse() {
        assert_eq!("E".parse::<SerialParity>().unwrap(), SerialParity::Even);
        assert!("mark".parse::<SerialParity>().is_err());
    }
}
