//! Synthetic scale
//!
//! Answers commands from an in-memory scale state so the rest of the stack
//! can run without hardware. Replies are formatted as the scale would send
//! them and parsed by the same parser as real traffic.

use super::{DriverError, DriverEvent, ScaleDriver, ScaleResponse, ScaleStats, StatsSnapshot};
use crate::config::{ConfigError, ScaleConfig};
use crate::core::protocol::{parse_response, CommandTable, ScaleCommand};
use crate::core::scheduler::ScheduledTask;
use crate::core::transport::{
    ConnectionInfo, ConnectionState, DisconnectReason, EndpointInfo, TransportError,
};
use crate::utils::autodetect::FTDI_VENDOR_ID;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Path reported for the synthetic adapter
pub const MOCK_PORT_PATH: &str = "/dev/tty.usbserial-MOCK001";

const MOCK_PRODUCT_ID: u16 = 0x6001;
const CONNECT_DELAY: Duration = Duration::from_millis(100);
const BASE_GROSS: f64 = 100.55;
const BASE_NET: f64 = 95.3;
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct MockState {
    gross_weight: f64,
    net_weight: f64,
    count: u64,
    piece_weight: f64,
    unit: &'static str,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            gross_weight: BASE_GROSS,
            net_weight: BASE_NET,
            count: 157,
            piece_weight: 0.635,
            unit: "lb",
        }
    }
}

impl MockState {
    /// Raw reply line for `command`, applying side effects
    fn reply(&mut self, command: ScaleCommand) -> String {
        match command {
            ScaleCommand::GrossWeight => format!("Gross {} {}.", self.gross_weight, self.unit),
            ScaleCommand::NetWeight => format!("Net {} {}.", self.net_weight, self.unit),
            ScaleCommand::Count => format!("Count {} Pieces", self.count),
            ScaleCommand::PieceWeight => {
                format!("Piece Weight {} {}.", self.piece_weight, self.unit)
            }
            ScaleCommand::Zero => {
                self.gross_weight = 0.0;
                "Zero Complete".to_string()
            }
            ScaleCommand::Tare => {
                self.net_weight = 0.0;
                "Tare Acquired".to_string()
            }
            ScaleCommand::Print => format!("{} {}. Gross", self.gross_weight, self.unit),
            ScaleCommand::Version => "V 2.01".to_string(),
        }
    }

    /// Jitter weights by up to ±0.05 and now and then nudge the count
    fn vary(&mut self, rng: &mut impl Rng) {
        let variation = rng.gen_range(-0.05..0.05);
        self.gross_weight = round2((BASE_GROSS + variation).max(0.0));
        self.net_weight = round2((BASE_NET + variation).max(0.0));

        if rng.gen_bool(0.1) {
            let step: i64 = rng.gen_range(-1..=1);
            self.count = self.count.saturating_add_signed(step);
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

struct MockInner {
    config: Arc<ScaleConfig>,
    commands: CommandTable,
    state: Mutex<MockState>,
    connected: Mutex<Option<DateTime<Local>>>,
    stats: Mutex<ScaleStats>,
    polling: Mutex<Option<ScheduledTask>>,
    events: broadcast::Sender<DriverEvent>,
}

/// Scale driver backed by simulated state
#[derive(Clone)]
pub struct MockScaleController {
    inner: Arc<MockInner>,
}

impl MockScaleController {
    /// Create a synthetic scale
    pub fn new(config: Arc<ScaleConfig>) -> Result<Self, ConfigError> {
        let commands = config.command_table()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(MockInner {
                config,
                commands,
                state: Mutex::new(MockState::default()),
                connected: Mutex::new(None),
                stats: Mutex::new(ScaleStats::default()),
                polling: Mutex::new(None),
                events,
            }),
        })
    }
}

impl MockInner {
    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    fn is_connected(&self) -> bool {
        self.connected.lock().is_some()
    }

    fn injected_error(&self, name: &str) -> Option<ScaleResponse> {
        let testing = &self.config.testing;
        let mut rng = rand::thread_rng();
        if !testing.simulate_errors || !rng.gen_bool(testing.error_rate.clamp(0.0, 1.0)) {
            return None;
        }
        let (raw, description) = testing.error_responses.iter().choose(&mut rng)?;

        let mut parsed = parse_response(raw);
        parsed.error = Some(description.clone());
        Some(ScaleResponse {
            raw: parsed.raw.clone(),
            timestamp: parsed.timestamp,
            parsed,
            command: name.to_string(),
            response_time: self.config.response_delay(),
        })
    }

    async fn send(&self, name: &str) -> Result<ScaleResponse, DriverError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        if !self.commands.contains(name) {
            return Err(DriverError::UnknownCommand(name.to_string()));
        }
        self.stats.lock().commands_sent += 1;

        let delay = self.config.response_delay();
        let timeout = self.config.response_timeout();
        if delay > timeout {
            self.stats.lock().timeouts += 1;
            warn!(
                "Mock response delay {}ms exceeds timeout {}ms",
                delay.as_millis(),
                timeout.as_millis()
            );
            return Err(DriverError::CommandTimeout {
                command: name.to_string(),
                attempt: 1,
            });
        }

        tokio::time::sleep(delay).await;

        if let Some(response) = self.injected_error(name) {
            let mut stats = self.stats.lock();
            stats.errors += 1;
            stats.responses_received += 1;
            debug!("Mock scale returning error response {}", response.raw);
            return Ok(response);
        }

        let raw = match self.config.testing.mock_responses.get(name) {
            Some(fixed) => fixed.clone(),
            None => {
                let command = ScaleCommand::from_name(name)
                    .ok_or_else(|| DriverError::UnknownCommand(name.to_string()))?;
                self.state.lock().reply(command)
            }
        };

        let parsed = parse_response(&raw);
        {
            let mut stats = self.stats.lock();
            stats.responses_received += 1;
            stats.last_reading = Some(parsed.timestamp);
        }
        debug!("Mock scale response to {}: {}", name, raw);

        self.emit(DriverEvent::Response {
            parsed: parsed.clone(),
            command: Some(name.to_string()),
        });

        Ok(ScaleResponse {
            raw,
            timestamp: parsed.timestamp,
            parsed,
            command: name.to_string(),
            response_time: delay,
        })
    }

    async fn poll_once(&self, command: &str) {
        self.state.lock().vary(&mut rand::thread_rng());

        match self.send(command).await {
            Ok(response) => self.emit(DriverEvent::Reading(response)),
            Err(e) => {
                error!("Mock polling error: {}", e);
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
            info!("Mock scale polling stopped");
        }
    }
}

#[async_trait]
impl ScaleDriver for MockScaleController {
    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>, DriverError> {
        Ok(vec![EndpointInfo {
            path: MOCK_PORT_PATH.to_string(),
            manufacturer: Some("FTDI".to_string()),
            vendor_id: Some(FTDI_VENDOR_ID),
            product_id: Some(MOCK_PRODUCT_ID),
            serial_number: Some("MOCK001".to_string()),
        }])
    }

    async fn connect(&self, path: Option<&str>) -> Result<(), DriverError> {
        let path = path.unwrap_or(MOCK_PORT_PATH).to_string();
        info!("Mock scale connecting to {}", path);

        tokio::time::sleep(CONNECT_DELAY).await;
        *self.inner.connected.lock() = Some(Local::now());

        info!("Mock scale connected");
        self.inner.emit(DriverEvent::Connected {
            path,
            connection_time: CONNECT_DELAY,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        info!("Mock scale disconnecting");
        self.inner.stop_polling();
        *self.inner.connected.lock() = None;
        self.inner.emit(DriverEvent::Disconnected(DisconnectReason::User));
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn send_command_with_retries(
        &self,
        name: &str,
        _retries: Option<u32>,
    ) -> Result<ScaleResponse, DriverError> {
        self.inner.send(name).await
    }

    fn start_polling(&self, command: &str) {
        let mut polling = self.inner.polling.lock();
        if polling.is_some() {
            warn!("Mock polling already active");
            return;
        }

        self.inner.stats.lock().reset();
        let interval = self.inner.config.polling_interval();
        info!(
            "Starting mock scale polling: {} every {}ms",
            command,
            interval.as_millis()
        );

        let inner = Arc::downgrade(&self.inner);
        let command = command.to_string();
        *polling = Some(ScheduledTask::repeating(interval, move || {
            let inner = inner.clone();
            let command = command.clone();
            async move {
                if let Some(inner) = inner.upgrade() {
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
        let connection_start = *self.inner.connected.lock();
        let stats = self.inner.stats.lock().clone();
        let connection = ConnectionInfo {
            state: if connection_start.is_some() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            is_connected: connection_start.is_some(),
            is_connecting: false,
            path: Some(MOCK_PORT_PATH.to_string()),
            reconnect_attempts: 0,
            max_reconnect_attempts: 0,
            connection_start,
            idle_for: stats
                .last_reading
                .and_then(|t| (Local::now() - t).to_std().ok()),
        };
        stats.snapshot(self.is_polling(), connection)
    }

    fn is_healthy(&self) -> bool {
        self.is_connected()
            && self.inner.stats.lock().packet_loss() <= self.inner.config.validation.max_packet_loss
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.inner.events.subscribe()
    }
}
