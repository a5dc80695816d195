//! Command counters and derived health figures

use crate::core::transport::ConnectionInfo;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::Duration;

/// Fraction of sent commands without a reply, clamped to `0.0..=1.0`
pub fn packet_loss(commands_sent: u64, responses_received: u64) -> f64 {
    if commands_sent == 0 {
        return 0.0;
    }
    let lost = commands_sent.saturating_sub(responses_received);
    lost as f64 / commands_sent as f64
}

/// Running command counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStats {
    /// Attempts written
    pub commands_sent: u64,
    /// Attempts answered
    pub responses_received: u64,
    /// Commands that failed after all retries, plus transport errors
    pub errors: u64,
    /// Attempts that hit the response timeout
    pub timeouts: u64,
    /// When the current polling session started
    pub start_time: Option<DateTime<Local>>,
    /// Last successful reply
    pub last_reading: Option<DateTime<Local>>,
}

impl ScaleStats {
    /// Zero the counters and stamp a new start time
    pub fn reset(&mut self) {
        *self = Self {
            start_time: Some(Local::now()),
            ..Self::default()
        };
    }

    /// Loss ratio for the current counters
    pub fn packet_loss(&self) -> f64 {
        packet_loss(self.commands_sent, self.responses_received)
    }

    /// Time since `start_time`, zero if never started
    pub fn runtime(&self) -> Duration {
        self.start_time
            .and_then(|start| (Local::now() - start).to_std().ok())
            .unwrap_or_default()
    }

    /// Build a snapshot together with connection details
    pub fn snapshot(&self, is_polling: bool, connection: ConnectionInfo) -> StatsSnapshot {
        StatsSnapshot {
            stats: self.clone(),
            runtime: self.runtime(),
            packet_loss: self.packet_loss(),
            is_polling,
            connection,
        }
    }
}

/// Point-in-time view of driver statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Raw counters
    #[serde(flatten)]
    pub stats: ScaleStats,
    /// Time since polling started
    pub runtime: Duration,
    /// Loss ratio
    pub packet_loss: f64,
    /// Polling running
    pub is_polling: bool,
    /// Connection details
    pub connection: ConnectionInfo,
}
