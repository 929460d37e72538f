//! Modbus Connection Manager
//!
//! Owns the transport handle and the link state machine for one device.
//!
//! - One exchange at a time: the link slot sits behind a fair (FIFO) async
//!   mutex held for the whole exchange including its timeout, so concurrent
//!   callers complete in submission order and never interleave on the wire.
//! - Operations outside `Connected` fail with `NotConnected` at once; they are
//!   never queued across a reconnect.
//! - Automatic reconnection runs in a supervisor task owned by the manager.
//!   The task holds its own retry counter and is cancelled by `disconnect()`,
//!   `connect()` and drop.

use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::{ChannelLogger, ConnectionState, LinkStatus, StateChange};

use super::config::{DeviceConnectionConfig, ReconnectPolicy, TransportSettings};
use super::connection::{Connector, ResponseShape, SystemConnector, Transport};
use super::pdu::ModbusPdu;
use super::state::{self, LinkCommand, LinkEvent, Transition};
use super::transport::{split_frame, ModbusFrameProcessor, ModbusMode};

/// Capacity of the state-change broadcast
const STATE_CHANNEL_CAPACITY: usize = 64;

/// Transport handle plus framing state, guarded together
struct LinkSlot {
    transport: Option<Box<dyn Transport>>,
    framer: ModbusFrameProcessor,
}

/// Parameters fixed for one connect() session
#[derive(Debug, Clone)]
struct SessionParams {
    settings: TransportSettings,
    policy: ReconnectPolicy,
    timeout: Duration,
    unit_id: u8,
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Session {
    config: Option<DeviceConnectionConfig>,
    params: Option<SessionParams>,
    supervisor: Option<Supervisor>,
    logger: ChannelLogger,
}

enum OpenOutcome {
    Connected,
    /// Opened, but a disconnect or reconnect superseded the attempt
    Superseded,
    Failed { error: ComLinkError, retry: bool },
}

struct Shared {
    connector: Arc<dyn Connector>,
    link: Mutex<LinkSlot>,
    status: RwLock<LinkStatus>,
    session: SyncMutex<Session>,
    events: broadcast::Sender<StateChange>,
}

/// Connection manager for one Modbus device
pub struct ModbusConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ModbusConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusConnectionManager")
            .field("status", &*self.shared.status.read())
            .finish()
    }
}

impl Default for ModbusConnectionManager {
    fn default() -> Self {
        Self::new(Arc::new(SystemConnector))
    }
}

impl ModbusConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let policy = ReconnectPolicy::default();
        Self {
            shared: Arc::new(Shared {
                connector,
                link: Mutex::new(LinkSlot {
                    transport: None,
                    framer: ModbusFrameProcessor::new(ModbusMode::Tcp),
                }),
                status: RwLock::new(LinkStatus::new("", policy.max_attempts)),
                session: SyncMutex::new(Session {
                    config: None,
                    params: None,
                    supervisor: None,
                    logger: ChannelLogger::new(""),
                }),
                events,
            }),
        }
    }

    /// Current status snapshot; never blocks on an in-flight exchange
    pub fn status(&self) -> LinkStatus {
        self.shared.status.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.shared.events.subscribe()
    }

    /// Configuration of the current session
    pub fn config(&self) -> Option<DeviceConnectionConfig> {
        self.shared.session.lock().config.clone()
    }

    pub fn logger(&self) -> ChannelLogger {
        self.shared.logger()
    }

    /// Connect with `config`, replacing any previous session wholesale.
    ///
    /// Resets the automatic retry counter. If the open fails and
    /// auto-reconnect is on, retries continue in the background and the
    /// open error is still returned.
    pub async fn connect(&self, config: DeviceConnectionConfig) -> Result<()> {
        let settings = config.settings()?;
        let params = SessionParams {
            settings,
            policy: config.reconnect_policy(),
            timeout: config.response_timeout(),
            unit_id: config.unit_id,
        };

        let unchanged = self.shared.session.lock().config.as_ref() == Some(&config);
        if unchanged && self.is_connected() {
            debug!("{}: already connected", config.name);
            return Ok(());
        }

        self.shared.stop_supervisor().await;
        let mut slot = self.shared.link.lock().await;

        if let Some(transport) = slot.transport.take() {
            self.shared
                .apply(LinkEvent::DisconnectRequested, "reconnect with new configuration");
            close_quietly(transport).await;
        }

        {
            let mut session = self.shared.session.lock();
            session.logger = ChannelLogger::new(config.name.clone());
            session.params = Some(params.clone());
            session.config = Some(config.clone());
        }
        {
            let mut status = self.shared.status.write();
            status.device = config.name.clone();
            status.max_attempts = params.policy.max_attempts;
        }

        self.shared
            .apply(LinkEvent::ConnectRequested, "connect requested");

        match self.shared.open_link(&mut slot, &params, None).await {
            OpenOutcome::Connected => Ok(()),
            OpenOutcome::Superseded => Err(ComLinkError::NotConnected),
            OpenOutcome::Failed { error, retry } => {
                if retry {
                    self.shared.spawn_supervisor(params);
                }
                Err(error)
            },
        }
    }

    /// Disconnect and stop automatic reconnection. An exchange in flight
    /// is allowed to finish or time out first.
    pub async fn disconnect(&self) {
        self.shared.stop_supervisor().await;
        let mut slot = self.shared.link.lock().await;
        self.shared
            .apply(LinkEvent::DisconnectRequested, "disconnect requested");
        slot.framer.clear_pending();
        if let Some(transport) = slot.transport.take() {
            close_quietly(transport).await;
        }
    }

    /// Send one request PDU and return the matching response PDU.
    ///
    /// Transport failures and misframed responses close the link, move it
    /// to `Failed` and, with auto-reconnect, start the supervisor. A
    /// well-formed response that does not match the request (unit, function)
    /// leaves the state untouched.
    pub async fn execute(&self, request: &ModbusPdu) -> Result<ModbusPdu> {
        if !self.is_connected() {
            return Err(ComLinkError::NotConnected);
        }

        let mut slot = self.shared.link.lock().await;
        // the link may have dropped while this request was queued
        let params = match self.shared.params() {
            Some(params) if self.is_connected() => params,
            _ => return Err(ComLinkError::NotConnected),
        };

        let logger = self.shared.logger();
        let LinkSlot { transport, framer } = &mut *slot;
        let Some(link) = transport.as_mut() else {
            return Err(ComLinkError::NotConnected);
        };

        let frame = framer.build_frame(params.unit_id, request);
        logger.log_raw_frame("TX", &frame);

        // Any failure up to a well-formed frame leaves the stream position
        // unknown: timeouts, I/O errors, bad lengths, bad checksums.
        let framed = match link
            .exchange(&frame, ResponseShape::for_request(request), params.timeout)
            .await
        {
            Ok(response) => {
                logger.log_raw_frame("RX", &response);
                split_frame(framer.mode(), &response)
            },
            Err(e) => Err(e),
        };

        match framed {
            Ok(parts) => match framer.accept(parts) {
                Ok((_, pdu)) => Ok(pdu),
                Err(e) => {
                    self.shared.record_error(&e);
                    Err(e)
                },
            },
            Err(e) => {
                framer.clear_pending();
                self.shared.record_error(&e);
                if !e.is_transport() {
                    warn!("Link out of step ({}), dropping transport", e);
                }
                if let Some(dead) = transport.take() {
                    close_quietly(dead).await;
                }
                let transition = self.shared.apply(LinkEvent::TransportFailed, &e.to_string());
                if schedules_retry(transition) {
                    self.shared.spawn_supervisor(params);
                }
                Err(e)
            },
        }
    }

    /// Record an operation error that never reached the wire
    pub fn record_error(&self, error: &ComLinkError) {
        self.shared.record_error(error);
    }
}

impl Drop for ModbusConnectionManager {
    fn drop(&mut self) {
        if let Some(supervisor) = self.shared.session.lock().supervisor.take() {
            supervisor.cancel.cancel();
        }
    }
}

impl Shared {
    fn logger(&self) -> ChannelLogger {
        self.session.lock().logger.clone()
    }

    fn params(&self) -> Option<SessionParams> {
        self.session.lock().params.clone()
    }

    fn record_error(&self, error: &ComLinkError) {
        self.status.write().record_error(error);
    }

    /// Run one event through the state machine and publish the transition
    fn apply(&self, event: LinkEvent, reason: &str) -> Option<Transition> {
        let (policy, logger) = {
            let session = self.session.lock();
            (
                session.params.as_ref().map(|p| p.policy).unwrap_or_default(),
                session.logger.clone(),
            )
        };

        let (from, transition) = {
            let mut status = self.status.write();
            let from = status.state;
            let transition = state::next(from, event, &policy)?;
            status.state = transition.next;
            if transition.next.is_connected() {
                status.last_connected = Some(Utc::now());
            }
            (from, transition)
        };

        logger.log_status(from, transition.next, reason);
        // no subscribers is fine
        let _ = self.events.send(StateChange {
            from,
            to: transition.next,
            reason: reason.to_string(),
        });
        Some(transition)
    }

    /// `apply`, unless `cancel` has fired
    fn apply_live(
        &self,
        cancel: Option<&CancellationToken>,
        event: LinkEvent,
        reason: &str,
    ) -> Option<Transition> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return None;
        }
        self.apply(event, reason)
    }

    /// Open a transport for the current `Connecting` state and install it
    async fn open_link(
        &self,
        slot: &mut LinkSlot,
        params: &SessionParams,
        cancel: Option<&CancellationToken>,
    ) -> OpenOutcome {
        let logger = self.logger();
        logger.log_connect(
            &params.settings.mode().to_string(),
            &params.settings.target(),
            &format!(
                "unit={} timeout={}ms",
                params.unit_id,
                params.timeout.as_millis()
            ),
        );

        match self.connector.open(&params.settings, params.timeout).await {
            Ok(transport) => {
                let reason = format!("opened {}", transport.describe());
                if self.apply_live(cancel, LinkEvent::Opened, &reason).is_none() {
                    close_quietly(transport).await;
                    return OpenOutcome::Superseded;
                }
                slot.framer = ModbusFrameProcessor::new(params.settings.mode());
                slot.transport = Some(transport);
                OpenOutcome::Connected
            },
            Err(error) => {
                self.record_error(&error);
                let transition = self.apply_live(cancel, LinkEvent::OpenFailed, &error.to_string());
                OpenOutcome::Failed {
                    retry: schedules_retry(transition),
                    error,
                }
            },
        }
    }

    fn spawn_supervisor(self: &Arc<Self>, params: SessionParams) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(Arc::clone(self), params, cancel.clone()));
        if let Some(previous) = self
            .session
            .lock()
            .supervisor
            .replace(Supervisor { cancel, handle })
        {
            previous.cancel.cancel();
        }
    }

    async fn stop_supervisor(&self) {
        let supervisor = self.session.lock().supervisor.take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.handle.await {
                warn!("Reconnect supervisor ended abnormally: {}", e);
            }
        }
    }
}

/// Reconnect loop: Failed -> Reconnecting -> (delay) -> Connecting -> open,
/// until connected, attempts are exhausted or cancelled
async fn supervise(shared: Arc<Shared>, params: SessionParams, cancel: CancellationToken) {
    loop {
        let Some(scheduled) =
            shared.apply_live(Some(&cancel), LinkEvent::RetryScheduled, "retry scheduled")
        else {
            break;
        };

        let reason = shared
            .status
            .read()
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        shared.logger().log_retry(
            scheduled.next.attempt(),
            params.policy.max_attempts,
            params.policy.delay.as_millis() as u64,
            &reason,
        );

        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(params.policy.delay) => {},
        }

        let mut slot = shared.link.lock().await;
        if shared
            .apply_live(Some(&cancel), LinkEvent::RetryDelayElapsed, "retry delay elapsed")
            .is_none()
        {
            break;
        }

        match shared.open_link(&mut slot, &params, Some(&cancel)).await {
            OpenOutcome::Failed { retry: true, .. } => continue,
            _ => break,
        }
    }
    debug!("Reconnect supervisor stopped");
}

fn schedules_retry(transition: Option<Transition>) -> bool {
    matches!(
        transition.and_then(|t| t.command),
        Some(LinkCommand::ScheduleRetry { .. })
    )
}

async fn close_quietly(mut transport: Box<dyn Transport>) {
    let peer = transport.describe();
    if let Err(e) = transport.close().await {
        debug!("Close {}: {}", peer, e);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::modbus::codec::ModbusCodec;
    use crate::modbus::mock::{MockConnector, SimulatedDevice};
    use crate::modbus::types::Region;
    use tracing_test::traced_test;

    fn manager_for(device: &SimulatedDevice) -> ModbusConnectionManager {
        ModbusConnectionManager::new(Arc::new(MockConnector::new(device.clone())))
    }

    fn config() -> DeviceConnectionConfig {
        DeviceConnectionConfig::tcp("bms-1", "127.0.0.1", 1502, 1)
    }

    #[tokio::test]
    async fn test_rejects_operations_when_disconnected() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        let manager = manager_for(&device);
        let pdu = ModbusCodec::build_read_pdu(Region::HoldingRegister, 0, 1).unwrap();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.execute(&pdu).await, Err(ComLinkError::NotConnected));
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_execute_disconnect() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        device.set_holding(10, &[750]);
        let manager = manager_for(&device);
        let mut events = manager.subscribe();

        manager.connect(config()).await.unwrap();
        assert!(manager.is_connected());
        assert!(manager.status().last_connected.is_some());
        assert_eq!(manager.status().device, "bms-1");

        let pdu = ModbusCodec::build_read_pdu(Region::HoldingRegister, 10, 1).unwrap();
        let response = manager.execute(&pdu).await.unwrap();
        assert_eq!(response.as_slice(), &[0x03, 0x02, 0x02, 0xEE]);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let first = events.recv().await.unwrap();
        assert_eq!(first.to, ConnectionState::Connecting { attempt: 0 });
        assert_eq!(events.recv().await.unwrap().to, ConnectionState::Connected);
        assert_eq!(events.recv().await.unwrap().to, ConnectionState::Disconnected);

        assert!(logs_contain("[STATUS] DISCONNECTED -> CONNECTING"));
        assert!(logs_contain("[STATUS] CONNECTED -> DISCONNECTED - disconnect requested"));
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_state_untouched() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        let manager = manager_for(&device);
        let mut bad = config();
        bad.host = None;

        assert!(matches!(
            manager.connect(bad).await,
            Err(ComLinkError::Config(_))
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(device.open_count(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_without_reconnect() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        device.refuse_opens(true);
        let manager = manager_for(&device);

        let err = manager.connect(config()).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(manager.state(), ConnectionState::Failed { attempts: 0 });
        assert_eq!(manager.status().last_error, Some(err));
    }

    #[tokio::test]
    async fn test_device_exception_keeps_link() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        device.respond_with_exception(Some(0x02));
        let manager = manager_for(&device);
        manager.connect(config()).await.unwrap();

        let pdu = ModbusCodec::build_read_pdu(Region::HoldingRegister, 0, 1).unwrap();
        let response = manager.execute(&pdu).await.unwrap();
        // exception PDUs are returned for the codec to interpret
        assert_eq!(response.as_slice(), &[0x83, 0x02]);
        assert!(manager.is_connected());
    }
}
