//! Link logger
//!
//! Thin wrapper around `tracing` that tags every line with the device name,
//! so several links can share one subscriber.

use tracing::{debug, info, trace, warn};

use crate::state::ConnectionState;

/// Lightweight logger for device-link logging
#[derive(Debug, Clone)]
pub struct ChannelLogger {
    pub device: String,
}

impl ChannelLogger {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    /// Log connection attempt
    pub fn log_connect(&self, protocol: &str, target: &str, details: &str) {
        info!(device = %self.device, "[CONNECT] {} to {} - {}", protocol, target, details);
    }

    /// Log connection status change
    pub fn log_status(&self, old_state: ConnectionState, new_state: ConnectionState, reason: &str) {
        info!(device = %self.device, "[STATUS] {} -> {} - {}", old_state, new_state, reason);
    }

    /// Log retry attempt
    pub fn log_retry(&self, attempt: u32, max_attempts: u32, delay_ms: u64, reason: &str) {
        warn!(
            device = %self.device,
            "[RETRY] Attempt {}/{}, delay {}ms - {}",
            attempt, max_attempts, delay_ms, reason
        );
    }

    /// Log raw frame in hex format (TRACE level)
    pub fn log_raw_frame(&self, direction: &str, data: &[u8]) {
        let hex_str = data
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        trace!(device = %self.device, "[{}] {}", direction, hex_str);
    }

    /// Log one request/response exchange
    pub fn log_exchange(&self, unit_id: u8, function_code: u8, address: u16, count: u16) {
        debug!(
            device = %self.device,
            "[req] u{}f{:02X}a{} x{}",
            unit_id, function_code, address, count
        );
    }

    /// Log poll tick result (failures at WARN)
    pub fn log_poll_result(&self, ok: usize, err: usize) {
        if err > 0 {
            warn!(device = %self.device, "[poll] ok={} err={}", ok, err);
        } else {
            debug!(device = %self.device, "[poll] ok={}", ok);
        }
    }
}
