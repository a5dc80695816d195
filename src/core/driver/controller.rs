//! Hardware scale controller
//!
//! Correlates replies with commands by order: a command is written, and the
//! next complete line resolves it. Only one command is outstanding at a
//! time; concurrent callers queue on the command lock.

use super::{DriverError, DriverEvent, ScaleDriver, ScaleResponse, ScaleStats, StatsSnapshot};
use crate::config::{ConfigError, ScaleConfig};
use crate::core::logger::{DataLogger, Direction};
use crate::core::protocol::{parse_response, CommandTable, LineFramer, ParsedResponse, COMMAND_LEN};
use crate::core::scheduler::ScheduledTask;
use crate::core::transport::{
    DisconnectReason, EndpointInfo, SerialConnection, TransportError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Linear retry step: attempt `n` waits `n * RETRY_STEP`
const RETRY_STEP: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 1024;

/// The command currently awaiting a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    /// Command name
    pub name: String,
    /// When the attempt started
    pub issued_at: Instant,
    /// When the attempt times out
    pub deadline: Instant,
}

struct Pending {
    id: u64,
    command: PendingCommand,
    reply: oneshot::Sender<ParsedResponse>,
}

/// Clears the pending slot when an attempt ends, however it ends
struct PendingSlot<'a> {
    slot: &'a Mutex<Option<Pending>>,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|p| p.id == self.id) {
            *slot = None;
        }
    }
}

struct Inner {
    config: Arc<ScaleConfig>,
    commands: CommandTable,
    transport: SerialConnection,
    logger: DataLogger,
    pending: Mutex<Option<Pending>>,
    next_id: AtomicU64,
    command_lock: tokio::sync::Mutex<()>,
    stats: Mutex<ScaleStats>,
    polling: Mutex<Option<ScheduledTask>>,
    events: broadcast::Sender<DriverEvent>,
}

/// Scale driver over a serial connection
///
/// Must be created inside a Tokio runtime; it spawns a task that consumes
/// transport events.
#[derive(Clone)]
pub struct ScaleController {
    inner: Arc<Inner>,
}

impl ScaleController {
    /// Controller on the host's serial ports
    pub fn new(config: Arc<ScaleConfig>) -> Result<Self, ConfigError> {
        let transport = SerialConnection::system(config.connection_options());
        let logger = DataLogger::from_config(&config.logging);
        Self::with_transport(config, transport, logger)
    }

    /// Controller on an existing connection
    pub fn with_transport(
        config: Arc<ScaleConfig>,
        transport: SerialConnection,
        logger: DataLogger,
    ) -> Result<Self, ConfigError> {
        let commands = config.command_table()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let transport_events = transport.subscribe();

        let inner = Arc::new(Inner {
            config,
            commands,
            transport,
            logger,
            pending: Mutex::new(None),
            next_id: AtomicU64::new(0),
            command_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(ScaleStats::default()),
            polling: Mutex::new(None),
            events,
        });

        tokio::spawn(pump(Arc::downgrade(&inner), transport_events));

        Ok(Self { inner })
    }

    /// The command awaiting a reply, if any
    pub fn pending_command(&self) -> Option<PendingCommand> {
        self.inner.pending.lock().as_ref().map(|p| p.command.clone())
    }

    /// Underlying connection
    pub fn transport(&self) -> &SerialConnection {
        &self.inner.transport
    }

}

impl Inner {
    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    async fn send(&self, name: &str, retries: Option<u32>) -> Result<ScaleResponse, DriverError> {
        let result = self.run_command(name, retries).await;
        if let Err(e) = &result {
            self.logger.log_error(name, e);
        }
        result
    }

    async fn run_command(
        &self,
        name: &str,
        retries: Option<u32>,
    ) -> Result<ScaleResponse, DriverError> {
        self.transport.check_connected()?;
        let code = *self
            .commands
            .get(name)
            .ok_or_else(|| DriverError::UnknownCommand(name.to_string()))?;
        let max_retries = retries.unwrap_or(self.config.polling.retries);

        let _turn = self.command_lock.lock().await;

        let mut attempt = 0;
        loop {
            match self.attempt(name, &code, attempt).await {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() => {
                    self.stats.lock().errors += 1;
                    if attempt == 0 {
                        return Err(e);
                    }
                    // refused before reaching the wire, so only earlier attempts count
                    return Err(DriverError::RetriesExhausted {
                        command: name.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) if attempt >= max_retries => {
                    self.stats.lock().errors += 1;
                    return Err(DriverError::RetriesExhausted {
                        command: name.to_string(),
                        attempts: attempt + 1,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        "Command {} attempt {}/{} failed, retrying: {}",
                        name,
                        attempt,
                        max_retries + 1,
                        e
                    );
                    tokio::time::sleep(RETRY_STEP * attempt).await;
                }
            }
        }
    }

    async fn attempt(
        &self,
        name: &str,
        code: &[u8; COMMAND_LEN],
        attempt: u32,
    ) -> Result<ScaleResponse, DriverError> {
        self.transport.check_connected()?;

        let timeout = self.config.response_timeout();
        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        *self.pending.lock() = Some(Pending {
            id,
            command: PendingCommand {
                name: name.to_string(),
                issued_at,
                deadline,
            },
            reply: tx,
        });
        let _slot = PendingSlot {
            slot: &self.pending,
            id,
        };
        self.stats.lock().commands_sent += 1;

        debug!("Sending command {} ({:?})", name, String::from_utf8_lossy(code));
        self.logger.log_raw(Direction::Sent, code);

        let exchange = async {
            self.transport.write(code).await?;
            self.transport.drain().await?;
            rx.await
                .map_err(|_| DriverError::from(TransportError::Disconnected))
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Ok(parsed)) => {
                let response_time = issued_at.elapsed();
                {
                    let mut stats = self.stats.lock();
                    stats.responses_received += 1;
                    stats.last_reading = Some(parsed.timestamp);
                }
                debug!(
                    "Command {} answered in {}ms: {}",
                    name,
                    response_time.as_millis(),
                    parsed.raw
                );
                Ok(ScaleResponse {
                    raw: parsed.raw.clone(),
                    timestamp: parsed.timestamp,
                    parsed,
                    command: name.to_string(),
                    response_time,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.stats.lock().timeouts += 1;
                warn!("Command {} timed out after {}ms", name, timeout.as_millis());
                Err(DriverError::CommandTimeout {
                    command: name.to_string(),
                    attempt: attempt + 1,
                })
            }
        }
    }

    fn handle_line(&self, line: &str) {
        let parsed = parse_response(line);

        let resolved = self.pending.lock().take();
        let command = match resolved {
            Some(pending) => {
                let name = pending.command.name;
                // Receiver gone means the attempt was cancelled
                let _ = pending.reply.send(parsed.clone());
                Some(name)
            }
            None => {
                debug!("Unsolicited line: {}", line);
                None
            }
        };

        self.emit(DriverEvent::Response { parsed, command });
    }

    async fn poll_once(&self, command: &str) {
        match self.send(command, None).await {
            Ok(response) => {
                self.logger.log_reading(&response);
                self.emit(DriverEvent::Reading(response));
            }
            Err(e) => {
                self.emit(DriverEvent::PollingError {
                    command: command.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn stop_polling(&self) {
        if let Some(task) = self.polling.lock().take() {
            task.cancel();
            info!("Scale polling stopped");
        }
    }

    fn on_transport_event(&self, event: TransportEvent, framer: &mut LineFramer) {
        match event {
            TransportEvent::Data(data) => {
                self.logger.log_raw(Direction::Received, &data);
                for line in framer.push(&data) {
                    self.handle_line(&line);
                }
            }
            TransportEvent::Connected {
                path,
                connection_time,
            } => {
                framer.clear();
                self.logger.log_connection(
                    "connected",
                    json!({ "path": path, "connectionTimeMs": connection_time.as_millis() as u64 }),
                );
                self.emit(DriverEvent::Connected {
                    path,
                    connection_time,
                });
            }
            TransportEvent::Disconnected(reason) => {
                framer.clear();
                self.pending.lock().take();
                if reason != DisconnectReason::User {
                    self.stop_polling();
                }
                self.logger
                    .log_connection("disconnected", json!({ "reason": reason.to_string() }));
                self.emit(DriverEvent::Disconnected(reason));
            }
            TransportEvent::Error(message) => {
                self.stats.lock().errors += 1;
                self.logger
                    .log_connection("error", json!({ "message": message }));
                self.emit(DriverEvent::Error(message));
            }
            TransportEvent::Reconnecting {
                attempt,
                max_attempts,
                delay,
            } => {
                self.logger.log_connection(
                    "reconnecting",
                    json!({ "attempt": attempt, "maxAttempts": max_attempts, "delayMs": delay.as_millis() as u64 }),
                );
                self.emit(DriverEvent::Reconnecting {
                    attempt,
                    max_attempts,
                    delay,
                });
            }
            TransportEvent::ReconnectExhausted { attempts } => {
                self.logger
                    .log_connection("reconnect_exhausted", json!({ "attempts": attempts }));
                self.emit(DriverEvent::ReconnectExhausted { attempts });
            }
        }
    }
}

/// Feeds transport events into the controller until either side goes away
async fn pump(inner: Weak<Inner>, mut events: broadcast::Receiver<TransportEvent>) {
    let mut framer = LineFramer::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Dropped {} transport events", skipped);
                framer.clear();
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_transport_event(event, &mut framer);
    }
}

#[async_trait]
impl ScaleDriver for ScaleController {
    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>, DriverError> {
        Ok(self.inner.transport.list_endpoints()?)
    }

    async fn connect(&self, path: Option<&str>) -> Result<(), DriverError> {
        let path = path.or(self.inner.config.serial.path.as_deref());
        self.inner.transport.connect(path).await?;

        // Drop anything the scale sent before the port was ours
        if let Err(e) = self.inner.transport.flush().await {
            warn!("Failed to discard stale port data: {}", e);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.stop_polling();
        self.inner.transport.disconnect();
        self.inner.pending.lock().take();
    }

    fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    async fn send_command_with_retries(
        &self,
        name: &str,
        retries: Option<u32>,
    ) -> Result<ScaleResponse, DriverError> {
        self.inner.send(name, retries).await
    }

    fn start_polling(&self, command: &str) {
        let mut polling = self.inner.polling.lock();
        if polling.is_some() {
            warn!("Polling already active");
            return;
        }

        self.inner.stats.lock().reset();
        let interval = self.inner.config.polling_interval();
        info!(
            "Starting scale polling: {} every {}ms",
            command,
            interval.as_millis()
        );

        let weak = Arc::downgrade(&self.inner);
        let command = command.to_string();
        *polling = Some(ScheduledTask::repeating(interval, move || {
            let weak = weak.clone();
            let command = command.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.poll_once(&command).await;
                }
            }
        }));
    }

    fn stop_polling(&self) {
        self.inner.stop_polling();
    }

    fn is_polling(&self) -> bool {
        self.inner.polling.lock().is_some()
    }

    fn stats(&self) -> StatsSnapshot {
        let connection = self.inner.transport.connection_info();
        let is_polling = self.is_polling();
        self.inner.stats.lock().snapshot(is_polling, connection)
    }

    fn is_healthy(&self) -> bool {
        let within_loss =
            self.inner.stats.lock().packet_loss() <= self.inner.config.validation.max_packet_loss;
        self.inner.transport.is_healthy() && within_loss
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.inner.events.subscribe()
    }
}
