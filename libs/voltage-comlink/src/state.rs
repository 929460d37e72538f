//! Connection State
//!
//! The lifecycle states of one physical link and the status snapshot that
//! dashboards and pollers query without issuing an operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ComLinkError;

/// Connection state for one device link.
///
/// Retry bookkeeping lives inside the variants that need it, so a
/// `Connected` link cannot carry a stale attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport held; initial state and the result of `disconnect()`
    #[default]
    Disconnected,
    /// Opening the transport. `attempt` is 0 for an explicit connect and
    /// n > 0 for the n-th automatic retry
    Connecting { attempt: u32 },
    /// Transport open, operations allowed
    Connected,
    /// Waiting out the retry delay before automatic attempt `attempt`
    Reconnecting { attempt: u32 },
    /// Last open or exchange failed; `attempts` automatic retries consumed
    Failed { attempts: u32 },
}

impl ConnectionState {
    /// Check if state represents an active connection
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Automatic retry number this state belongs to (0 outside a retry cycle)
    pub fn attempt(&self) -> u32 {
        match self {
            ConnectionState::Connecting { attempt } | ConnectionState::Reconnecting { attempt } => {
                *attempt
            },
            ConnectionState::Failed { attempts } => *attempts,
            ConnectionState::Disconnected | ConnectionState::Connected => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting { .. } => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting { .. } => "RECONNECTING",
            ConnectionState::Failed { .. } => "FAILED",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One observed transition, broadcast to status subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: String,
}

/// Queryable status of a link
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub device: String,
    pub state: ConnectionState,
    pub max_attempts: u32,
    pub last_error: Option<ComLinkError>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_connected: Option<DateTime<Utc>>,
}

impl LinkStatus {
    pub fn new(device: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            device: device.into(),
            state: ConnectionState::Disconnected,
            max_attempts,
            last_error: None,
            last_error_at: None,
            last_connected: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Record an error as the latest one observed on this link
    pub fn record_error(&mut self, error: &ComLinkError) {
        self.last_error = Some(error.clone());
        self.last_error_at = Some(Utc::now());
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state {
            ConnectionState::Connecting { attempt } if attempt > 0 => write!(
                f,
                "connecting (attempt {}/{})",
                attempt, self.max_attempts
            ),
            ConnectionState::Reconnecting { attempt } => write!(
                f,
                "reconnecting (attempt {}/{})",
                attempt, self.max_attempts
            ),
            ConnectionState::Failed { attempts } if attempts > 0 => write!(
                f,
                "failed ({}/{} attempts)",
                attempts, self.max_attempts
            ),
            state => f.write_str(&state.name().to_lowercase()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Reconnecting { attempt: 1 }.is_connected());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_attempt_tracking() {
        assert_eq!(ConnectionState::Connecting { attempt: 0 }.attempt(), 0);
        assert_eq!(ConnectionState::Reconnecting { attempt: 3 }.attempt(), 3);
        assert_eq!(ConnectionState::Failed { attempts: 5 }.attempt(), 5);
        assert_eq!(ConnectionState::Connected.attempt(), 0);
    }

    #[test]
    fn test_status_display() {
        let mut status = LinkStatus::new("bms-1", 5);
        assert_eq!(status.to_string(), "disconnected");

        status.state = ConnectionState::Reconnecting { attempt: 3 };
        assert_eq!(status.to_string(), "reconnecting (attempt 3/5)");

        status.state = ConnectionState::Failed { attempts: 5 };
        assert_eq!(status.to_string(), "failed (5/5 attempts)");

        status.state = ConnectionState::Connected;
        assert_eq!(status.to_string(), "connected");
    }

    #[test]
    fn test_status_serialization() {
        let mut status = LinkStatus::new("meter", 5);
        status.state = ConnectionState::Failed { attempts: 2 };
        status.record_error(&ComLinkError::timeout("no response"));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"]["state"], "failed");
        assert_eq!(json["state"]["attempts"], 2);
        assert_eq!(json["last_error"], "Timeout: no response");
        assert!(json["last_error_at"].is_string());
    }
}
