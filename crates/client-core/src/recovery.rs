//! Recovery controller
//!
//! Watches connectivity events and rebuilds the user agent when the path
//! to the server is back: `stop` → `create_user_agent` → `register`, then
//! BLF re-subscription and a Phantom agent-status callout. Failures are
//! swallowed and rescheduled with jittered exponential backoff; nothing
//! here ever escalates.

use crate::adapters::{NullPhantomApi, PhantomApi};
use crate::client::SoftphoneClient;
use crate::connectivity::{ConnectivitySnapshot, InternetStatus};
use crate::error::ClientResult;
use crate::events::{ClientEvent, EventBus, RegistrationState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The narrow control surface the controller drives.
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    async fn is_connected_and_registered(&self) -> bool;
    async fn stop(&self);
    async fn create_user_agent(&self) -> ClientResult<()>;
    async fn register(&self) -> ClientResult<()>;
    async fn resubscribe_blf(&self) -> ClientResult<()>;
}

#[async_trait]
impl RecoveryTarget for SoftphoneClient {
    async fn is_connected_and_registered(&self) -> bool {
        self.is_connected() && self.registration_state().await == RegistrationState::Registered
    }

    async fn stop(&self) {
        SoftphoneClient::stop(self).await;
    }

    async fn create_user_agent(&self) -> ClientResult<()> {
        SoftphoneClient::create_user_agent(self).await
    }

    async fn register(&self) -> ClientResult<()> {
        SoftphoneClient::register(self).await
    }

    async fn resubscribe_blf(&self) -> ClientResult<()> {
        SoftphoneClient::resubscribe_blf(self).await
    }
}

/// Backoff tunables.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// First attempt after eligibility.
    pub initial_delay: Duration,
    /// Base of the exponential schedule for retries.
    pub backoff_base: Duration,
    pub max_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            initial_delay: Duration::from_millis(250),
            backoff_base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Delay before attempt number `attempt` (0-based), before jitter.
pub(crate) fn backoff_delay(config: &RecoveryConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return config.initial_delay;
    }
    let exp = attempt.saturating_sub(1).min(16);
    let raw = config.backoff_base.as_millis() as u64 * (1u64 << exp);
    Duration::from_millis(raw).min(config.max_delay)
}

/// Uniform jitter in [0.8, 1.2].
fn apply_jitter(delay: Duration) -> Duration {
    let factor: f64 = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

struct RecoveryInner {
    config: RecoveryConfig,
    target: Arc<dyn RecoveryTarget>,
    phantom: Arc<dyn PhantomApi>,
    username: String,
    bus: EventBus,
    enabled: AtomicBool,
    in_flight: AtomicBool,
    attempt: AtomicU32,
    pending: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Debounced reconnect scheduler.
#[derive(Clone)]
pub struct RecoveryController {
    inner: Arc<RecoveryInner>,
}

impl RecoveryController {
    pub fn new(bus: EventBus, target: Arc<dyn RecoveryTarget>, username: impl Into<String>) -> Self {
        Self::with_config(bus, target, username, RecoveryConfig::default(), Arc::new(NullPhantomApi))
    }

    pub fn with_config(
        bus: EventBus,
        target: Arc<dyn RecoveryTarget>,
        username: impl Into<String>,
        config: RecoveryConfig,
        phantom: Arc<dyn PhantomApi>,
    ) -> Self {
        RecoveryController {
            inner: Arc::new(RecoveryInner {
                config,
                target,
                phantom,
                username: username.into(),
                bus,
                enabled: AtomicBool::new(true),
                in_flight: AtomicBool::new(false),
                attempt: AtomicU32::new(0),
                pending: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start watching connectivity events.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let controller = self.clone();
        let mut rx = self.inner.bus.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut last_snapshot: Option<ConnectivitySnapshot> = None;
            loop {
                match rx.recv().await {
                    Ok(ClientEvent::ConnectivityChanged { snapshot }) => {
                        last_snapshot = Some(snapshot.clone());
                        controller.consider(&snapshot).await;
                    }
                    Ok(ClientEvent::NetworkPathChanged { .. }) => {
                        if let Some(snapshot) = &last_snapshot {
                            controller.consider(snapshot).await;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.cancel_pending();
    }

    /// Manual disconnect: no automatic reconnection until re-enabled.
    pub fn disconnect(&self) {
        info!("auto-reconnect disabled");
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.cancel_pending();
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.cancel_pending();
        }
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Attempts since the last success; resets to zero on a successful
    /// reconnect.
    pub fn attempt_count(&self) -> u32 {
        self.inner.attempt.load(Ordering::SeqCst)
    }

    fn cancel_pending(&self) {
        if let Some(task) = self.inner.pending.lock().take() {
            task.abort();
        }
    }

    async fn consider(&self, snapshot: &ConnectivitySnapshot) {
        if !self.eligible(snapshot).await {
            return;
        }
        self.schedule();
    }

    async fn eligible(&self, snapshot: &ConnectivitySnapshot) -> bool {
        if !self.inner.enabled.load(Ordering::SeqCst) {
            return false;
        }
        if !snapshot.link_up
            || snapshot.internet_status != InternetStatus::Up
            || snapshot.sip_reachable != Some(true)
        {
            return false;
        }
        if self.inner.in_flight.load(Ordering::SeqCst) {
            return false;
        }
        if self.inner.pending.lock().is_some() {
            return false;
        }
        !self.inner.target.is_connected_and_registered().await
    }

    fn schedule(&self) {
        let attempt = self.inner.attempt.load(Ordering::SeqCst);
        let delay = apply_jitter(backoff_delay(&self.inner.config, attempt));
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        let controller = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            *controller.inner.pending.lock() = None;

            if !controller.inner.enabled.load(Ordering::SeqCst) {
                return;
            }
            if controller.inner.target.is_connected_and_registered().await {
                controller.inner.attempt.store(0, Ordering::SeqCst);
                return;
            }

            controller.inner.in_flight.store(true, Ordering::SeqCst);
            let result = controller.run_reconnect().await;
            controller.inner.in_flight.store(false, Ordering::SeqCst);

            match result {
                Ok(()) => {
                    info!("reconnect succeeded");
                    controller.inner.attempt.store(0, Ordering::SeqCst);
                }
                Err(e) => {
                    let attempt = controller.inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(error = %e, attempt, "reconnect failed; rescheduling");
                    controller.schedule();
                }
            }
        });
        *self.inner.pending.lock() = Some(handle);
    }

    async fn run_reconnect(&self) -> ClientResult<()> {
        let target = &self.inner.target;
        target.stop().await;
        target.create_user_agent().await?;
        target.register().await?;
        if let Err(e) = target.resubscribe_blf().await {
            warn!(error = %e, "BLF re-subscribe after reconnect failed");
        }
        // Restore the agent-state indication; purely informational.
        if self
            .inner
            .phantom
            .query_agent_status(&self.inner.username)
            .await
            .is_none()
        {
            debug!("agent status unavailable after reconnect");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use std::time::Instant;

    #[test]
    fn backoff_schedule() {
        let config = RecoveryConfig::default();
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(250));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 6), Duration::from_secs(32).min(Duration::from_secs(30)));
        assert_eq!(backoff_delay(&config, 20), Duration::from_secs(30));
    }

    struct FlakyTarget {
        connected: AtomicBool,
        failures_left: AtomicU32,
        attempts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl RecoveryTarget for FlakyTarget {
        async fn is_connected_and_registered(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn stop(&self) {}

        async fn create_user_agent(&self) -> ClientResult<()> {
            self.attempts.lock().push(Instant::now());
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
            {
                return Err(ClientError::TransportStartFailed {
                    reason: "still down".to_string(),
                });
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn register(&self) -> ClientResult<()> {
            Ok(())
        }

        async fn resubscribe_blf(&self) -> ClientResult<()> {
            Ok(())
        }
    }

    fn up_snapshot() -> ConnectivitySnapshot {
        ConnectivitySnapshot {
            link_up: true,
            internet_status: InternetStatus::Up,
            sip_reachable: Some(true),
            ..ConnectivitySnapshot::default()
        }
    }

    #[tokio::test]
    async fn reconnects_with_backoff_until_success() {
        let bus = EventBus::new(32);
        let target = Arc::new(FlakyTarget {
            connected: AtomicBool::new(false),
            failures_left: AtomicU32::new(1),
            attempts: Mutex::new(Vec::new()),
        });
        let controller = RecoveryController::new(bus.clone(), target.clone(), "1001");
        controller.start();

        bus.emit(ClientEvent::ConnectivityChanged {
            snapshot: up_snapshot(),
        });

        // First attempt ~250ms, second no sooner than 0.8s after it.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let attempts = target.attempts.lock().clone();
        assert_eq!(attempts.len(), 2, "one failure then one success");
        let gap = attempts[1].duration_since(attempts[0]);
        assert!(gap >= Duration::from_millis(780), "gap was {:?}", gap);
        assert!(target.connected.load(Ordering::SeqCst));
        assert_eq!(controller.attempt_count(), 0);
        controller.stop();
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_attempts() {
        let bus = EventBus::new(32);
        let target = Arc::new(FlakyTarget {
            connected: AtomicBool::new(false),
            failures_left: AtomicU32::new(100),
            attempts: Mutex::new(Vec::new()),
        });
        let controller = RecoveryController::new(bus.clone(), target.clone(), "1001");
        controller.start();

        bus.emit(ClientEvent::ConnectivityChanged {
            snapshot: up_snapshot(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.disconnect();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(target.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn not_eligible_while_connected() {
        let bus = EventBus::new(32);
        let target = Arc::new(FlakyTarget {
            connected: AtomicBool::new(true),
            failures_left: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
        });
        let controller = RecoveryController::new(bus.clone(), target.clone(), "1001");
        controller.start();
        bus.emit(ClientEvent::ConnectivityChanged {
            snapshot: up_snapshot(),
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(target.attempts.lock().is_empty());
        controller.stop();
    }
}
