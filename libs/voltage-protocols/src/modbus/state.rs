//! Link state machine
//!
//! Pure transition function over [`ConnectionState`]. Each accepted event
//! yields the next state and at most one command for the runtime to carry
//! out (open a transport, arm the retry timer, release the handle). The
//! runtime never assigns a state directly.
//!
//! ```text
//! Disconnected --ConnectRequested--> Connecting{0}            [Open]
//! Connecting{n} --Opened-----------> Connected
//! Connecting{n} --OpenFailed-------> Failed{n}                [ScheduleRetry n+1]?
//! Connected ----TransportFailed----> Failed{0}                [ScheduleRetry 1]?
//! Failed{n} ----RetryScheduled-----> Reconnecting{n+1}
//! Reconnecting{n} --DelayElapsed---> Connecting{n}            [Open]
//! any ----------DisconnectRequested--> Disconnected           [Close]
//! ```
//!
//! `Failed` is the resting state once automatic attempts are exhausted or
//! auto-reconnect is off; only an explicit connect leaves it.

use voltage_comlink::ConnectionState;

use super::config::ReconnectPolicy;

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Caller asked to connect (resets the retry counter)
    ConnectRequested,
    /// Transport opened
    Opened,
    /// Transport open failed or timed out
    OpenFailed,
    /// An exchange on the open transport failed at transport level
    TransportFailed,
    /// Retry timer armed
    RetryScheduled,
    /// Retry delay passed
    RetryDelayElapsed,
    /// Caller asked to disconnect
    DisconnectRequested,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    /// Open a fresh transport
    Open,
    /// Arm the retry timer for automatic attempt `attempt`
    ScheduleRetry { attempt: u32 },
    /// Drop the transport handle
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub command: Option<LinkCommand>,
}

impl Transition {
    fn to(next: ConnectionState) -> Self {
        Self {
            next,
            command: None,
        }
    }

    fn with(next: ConnectionState, command: LinkCommand) -> Self {
        Self {
            next,
            command: Some(command),
        }
    }
}

/// Apply `event` to `state`. `None` means the event does not apply in this
/// state and must be ignored.
pub fn next(state: ConnectionState, event: LinkEvent, policy: &ReconnectPolicy) -> Option<Transition> {
    use ConnectionState as S;
    use LinkEvent as E;

    let retry = |consumed: u32| {
        (policy.enabled && consumed < policy.max_attempts).then_some(LinkCommand::ScheduleRetry {
            attempt: consumed + 1,
        })
    };

    let transition = match (state, event) {
        (S::Connected, E::ConnectRequested) => return None,
        (_, E::ConnectRequested) => {
            Transition::with(S::Connecting { attempt: 0 }, LinkCommand::Open)
        },

        (S::Connecting { .. }, E::Opened) => Transition::to(S::Connected),
        (S::Connecting { attempt }, E::OpenFailed) => Transition {
            next: S::Failed { attempts: attempt },
            command: retry(attempt),
        },

        (S::Connected, E::TransportFailed) => Transition {
            next: S::Failed { attempts: 0 },
            command: retry(0),
        },

        (S::Failed { attempts }, E::RetryScheduled) => {
            Transition::to(S::Reconnecting {
                attempt: attempts + 1,
            })
        },
        (S::Reconnecting { attempt }, E::RetryDelayElapsed) => {
            Transition::with(S::Connecting { attempt }, LinkCommand::Open)
        },

        (S::Disconnected, E::DisconnectRequested) => return None,
        (_, E::DisconnectRequested) => Transition::with(S::Disconnected, LinkCommand::Close),

        _ => return None,
    };
    Some(transition)
}
