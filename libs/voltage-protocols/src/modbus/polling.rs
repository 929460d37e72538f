//! Polling driver
//!
//! Reads a set of named points on a fixed interval and publishes each tick
//! as a [`DeviceSnapshot`] on a watch channel. A failed read is recorded and
//! logged; the loop keeps running.
//!
//! At most one loop runs per driver. Starting a new loop cancels the old one
//! and waits for it to finish before the new one is spawned. Cancellation is
//! checked between point reads, so an exchange already on the wire always
//! completes and never leaves the stream out of step.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voltage_comlink::error::{ComLinkError, Result};

use super::register_map::{DeviceSnapshot, PointResolver};

/// Identifies one started polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollHandle {
    id: u64,
}

impl PollHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Bookkeeping of the polling loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollState {
    /// Handle id of the running loop
    pub active: Option<u64>,
    pub interval_ms: u64,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<ComLinkError>,
    pub last_error_at: Option<DateTime<Utc>>,
}

struct ActivePoll {
    handle: PollHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PollingDriver {
    resolver: PointResolver,
    active: Mutex<Option<ActivePoll>>,
    next_id: AtomicU64,
    latest: Arc<watch::Sender<Option<DeviceSnapshot>>>,
    state: Arc<RwLock<PollState>>,
}

impl std::fmt::Debug for PollingDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingDriver")
            .field("state", &*self.state.read())
            .finish()
    }
}

impl PollingDriver {
    pub fn new(resolver: PointResolver) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            resolver,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            latest: Arc::new(latest),
            state: Arc::new(RwLock::new(PollState::default())),
        }
    }

    /// Start polling `points` every `interval`, replacing any running loop
    pub async fn start_polling(&self, interval: Duration, points: Vec<String>) -> Result<PollHandle> {
        if interval.is_zero() {
            return Err(ComLinkError::invalid_request("Polling interval must be > 0"));
        }
        if points.is_empty() {
            return Err(ComLinkError::invalid_request("No points to poll"));
        }
        for name in &points {
            self.resolver.map().get(name)?;
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!("Replacing poll loop #{}", previous.handle.id);
            stop(previous).await;
        }

        let handle = PollHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let cancel = CancellationToken::new();
        {
            let mut state = self.state.write();
            state.active = Some(handle.id);
            state.interval_ms = interval.as_millis() as u64;
        }

        info!(
            "Polling #{} started: {} points every {}ms",
            handle.id,
            points.len(),
            interval.as_millis()
        );
        let task = tokio::spawn(poll_loop(
            self.resolver.clone(),
            points,
            interval,
            cancel.clone(),
            Arc::clone(&self.latest),
            Arc::clone(&self.state),
        ));

        *active = Some(ActivePoll {
            handle,
            cancel,
            task,
        });
        Ok(handle)
    }

    /// Stop the loop started with `handle`. Returns false when `handle` is
    /// stale (already stopped or replaced).
    pub async fn stop_polling(&self, handle: PollHandle) -> bool {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(current) if current.handle == handle => {
                stop(current).await;
                self.state.write().active = None;
                info!("Polling #{} stopped", handle.id);
                true
            },
            other => {
                *active = other;
                false
            },
        }
    }

    pub fn is_polling(&self) -> bool {
        self.state.read().active.is_some()
    }

    /// Most recent published snapshot
    pub fn latest(&self) -> Option<DeviceSnapshot> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DeviceSnapshot>> {
        self.latest.subscribe()
    }

    pub fn poll_state(&self) -> PollState {
        self.state.read().clone()
    }
}

impl Drop for PollingDriver {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

async fn stop(poll: ActivePoll) {
    poll.cancel.cancel();
    if let Err(e) = poll.task.await {
        warn!("Poll loop #{} ended abnormally: {}", poll.handle.id, e);
    }
}

async fn poll_loop(
    resolver: PointResolver,
    points: Vec<String>,
    interval: Duration,
    cancel: CancellationToken,
    latest: Arc<watch::Sender<Option<DeviceSnapshot>>>,
    state: Arc<RwLock<PollState>>,
) {
    let logger = resolver.client().manager().logger();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    'ticks: loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }

        let mut snapshot = DeviceSnapshot::new(resolver.client().status().device);
        for name in &points {
            if cancel.is_cancelled() {
                break 'ticks;
            }
            snapshot.record(name, resolver.read_reading(name).await);
        }

        logger.log_poll_result(snapshot.metrics.len(), snapshot.errors.len());
        {
            let mut state = state.write();
            state.ticks += 1;
            state.last_tick_at = Some(snapshot.timestamp);
            for (name, error) in &snapshot.errors {
                warn!("Poll {}: {}", name, error);
                state.last_error = Some(error.clone());
                state.last_error_at = Some(Utc::now());
            }
        }
        latest.send_replace(Some(snapshot));
    }
    debug!("Poll loop exited");
}
