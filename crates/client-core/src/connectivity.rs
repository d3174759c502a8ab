//! Connectivity monitor
//!
//! Classifies three layers of reachability: the local link (host hints),
//! the internet (a quorum of HTTP probes with hysteresis), and the SIP
//! server (a WebSocket open with the `sip` sub-protocol). Publishes a
//! snapshot on every transition; the recovery controller reacts, this
//! component never reconnects anything itself.

use crate::events::{ClientEvent, EventBus};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Internet reachability classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternetStatus {
    Unknown,
    Up,
    Down,
}

/// The published view of connectivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySnapshot {
    /// Host link hint; `false` short-circuits everything to down.
    pub link_up: bool,
    pub internet_status: InternetStatus,
    /// `None` until the first SIP probe ran.
    pub sip_reachable: Option<bool>,
    /// Fingerprint of the local network path; changes mean the host moved
    /// networks without necessarily going offline.
    pub network_path_signature: String,
    pub last_internet_transition: Option<DateTime<Utc>>,
    pub last_sip_transition: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for ConnectivitySnapshot {
    fn default() -> Self {
        ConnectivitySnapshot {
            link_up: true,
            internet_status: InternetStatus::Unknown,
            sip_reachable: None,
            network_path_signature: String::new(),
            last_internet_transition: None,
            last_sip_transition: None,
            last_check: None,
        }
    }
}

/// Monitor tunables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub probe_urls: Vec<String>,
    pub probe_timeout: Duration,
    pub sip_probe_timeout: Duration,
    /// Check cadence while the internet is not known to be up.
    pub fast_interval: Duration,
    /// Check cadence while everything is up.
    pub slow_interval: Duration,
    pub required_consecutive_successes: u32,
    pub required_consecutive_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            probe_urls: vec![
                "https://www.gstatic.com/generate_204".to_string(),
                "https://connectivitycheck.gstatic.com/generate_204".to_string(),
                "https://www.msftconnecttest.com/connecttest.txt".to_string(),
                "https://captive.apple.com/hotspot-detect.html".to_string(),
            ],
            probe_timeout: Duration::from_secs(4),
            sip_probe_timeout: Duration::from_millis(4500),
            fast_interval: Duration::from_secs(4),
            slow_interval: Duration::from_secs(15),
            required_consecutive_successes: 2,
            required_consecutive_failures: 2,
        }
    }
}

/// Up/down classifier requiring N consecutive observations to flip.
#[derive(Debug)]
pub(crate) struct Hysteresis {
    status: InternetStatus,
    consecutive_up: u32,
    consecutive_down: u32,
    required_up: u32,
    required_down: u32,
}

impl Hysteresis {
    pub fn new(required_up: u32, required_down: u32) -> Self {
        Hysteresis {
            status: InternetStatus::Unknown,
            consecutive_up: 0,
            consecutive_down: 0,
            required_up: required_up.max(1),
            required_down: required_down.max(1),
        }
    }

    pub fn status(&self) -> InternetStatus {
        self.status
    }

    /// Force a state (the link-down short circuit) and reset counters.
    pub fn force(&mut self, status: InternetStatus) {
        self.status = status;
        self.consecutive_up = 0;
        self.consecutive_down = 0;
    }

    /// Feed one observation; returns the new status if it flipped.
    pub fn observe(&mut self, up: bool) -> Option<InternetStatus> {
        if up {
            self.consecutive_up += 1;
            self.consecutive_down = 0;
        } else {
            self.consecutive_down += 1;
            self.consecutive_up = 0;
        }
        let next = match self.status {
            InternetStatus::Up => {
                if self.consecutive_down >= self.required_down {
                    Some(InternetStatus::Down)
                } else {
                    None
                }
            }
            InternetStatus::Down => {
                if self.consecutive_up >= self.required_up {
                    Some(InternetStatus::Up)
                } else {
                    None
                }
            }
            InternetStatus::Unknown => {
                // First classification needs the same streak.
                if self.consecutive_up >= self.required_up {
                    Some(InternetStatus::Up)
                } else if self.consecutive_down >= self.required_down {
                    Some(InternetStatus::Down)
                } else {
                    None
                }
            }
        };
        if let Some(next) = next {
            self.status = next;
            self.consecutive_up = 0;
            self.consecutive_down = 0;
            return Some(next);
        }
        None
    }
}

/// Success quorum for an UP vote from `total` probes:
/// `max(2, ceil(total * 0.5))`. A deployment configured with fewer than
/// two probe URLs can therefore never classify up.
pub(crate) fn probe_quorum(total: usize) -> usize {
    let half = (total + 1) / 2;
    half.max(2)
}

struct MonitorInner {
    config: MonitorConfig,
    sip_url: String,
    bus: EventBus,
    http: reqwest::Client,
    snapshot: Mutex<ConnectivitySnapshot>,
    hysteresis: Mutex<Hysteresis>,
    link_up: AtomicBool,
    check_tx: mpsc::Sender<String>,
    check_rx: Mutex<Option<mpsc::Receiver<String>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Probe-driven reachability classifier.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(bus: EventBus, sip_url: impl Into<String>, config: MonitorConfig) -> Self {
        let (check_tx, check_rx) = mpsc::channel(8);
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .unwrap_or_default();
        ConnectivityMonitor {
            inner: Arc::new(MonitorInner {
                hysteresis: Mutex::new(Hysteresis::new(
                    config.required_consecutive_successes,
                    config.required_consecutive_failures,
                )),
                config,
                sip_url: sip_url.into(),
                bus,
                http,
                snapshot: Mutex::new(ConnectivitySnapshot::default()),
                link_up: AtomicBool::new(true),
                check_tx,
                check_rx: Mutex::new(Some(check_rx)),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        self.inner.snapshot.lock().clone()
    }

    /// Start the probe scheduler.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }
        let Some(mut check_rx) = self.inner.check_rx.lock().take() else {
            return;
        };
        let monitor = self.clone();
        *task = Some(tokio::spawn(async move {
            monitor.run_check("startup").await;
            loop {
                let interval = {
                    let snapshot = monitor.inner.snapshot.lock();
                    if snapshot.internet_status == InternetStatus::Up {
                        monitor.inner.config.slow_interval
                    } else {
                        monitor.inner.config.fast_interval
                    }
                };
                let jittered = jitter(interval);
                tokio::select! {
                    _ = tokio::time::sleep(jittered) => {
                        monitor.run_check("interval").await;
                    }
                    reason = check_rx.recv() => {
                        match reason {
                            Some(reason) => monitor.run_check(&reason).await,
                            None => break,
                        }
                    }
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
    }

    /// Host link hint (the `online`/`offline` pair of a browser host, a
    /// netlink watcher elsewhere). Offline short-circuits the snapshot.
    pub fn notify_link_state(&self, up: bool) {
        self.inner.link_up.store(up, Ordering::SeqCst);
        if up {
            self.request_immediate_check("link-up");
            return;
        }
        let changed = {
            let mut snapshot = self.inner.snapshot.lock();
            let changed = snapshot.link_up
                || snapshot.internet_status != InternetStatus::Down
                || snapshot.sip_reachable != Some(false);
            snapshot.link_up = false;
            if snapshot.internet_status != InternetStatus::Down {
                snapshot.last_internet_transition = Some(Utc::now());
            }
            snapshot.internet_status = InternetStatus::Down;
            snapshot.sip_reachable = Some(false);
            changed
        };
        self.inner.hysteresis.lock().force(InternetStatus::Down);
        if changed {
            self.publish();
        }
    }

    /// The host became visible/woke up; probe now.
    pub fn notify_resumed(&self) {
        self.request_immediate_check("resumed");
    }

    pub fn request_immediate_check(&self, reason: &str) {
        let _ = self.inner.check_tx.try_send(reason.to_string());
    }

    async fn run_check(&self, reason: &str) {
        debug!(reason, "connectivity check");

        let signature = network_path_signature();
        let path_changed = {
            let mut snapshot = self.inner.snapshot.lock();
            if snapshot.network_path_signature != signature {
                let first = snapshot.network_path_signature.is_empty();
                snapshot.network_path_signature = signature.clone();
                !first
            } else {
                false
            }
        };
        if path_changed {
            debug!(signature = %signature, "network path changed");
            self.inner
                .bus
                .emit(ClientEvent::NetworkPathChanged { signature });
        }

        if !self.inner.link_up.load(Ordering::SeqCst) {
            // Already short-circuited by notify_link_state.
            return;
        }

        let urls = &self.inner.config.probe_urls;
        let results = join_all(urls.iter().map(|url| self.probe_http(url))).await;
        let successes = results.iter().filter(|ok| **ok).count();
        let up_vote = successes >= probe_quorum(urls.len());
        debug!(successes, total = urls.len(), up_vote, "internet probes");

        let transition = self.inner.hysteresis.lock().observe(up_vote);
        let status = self.inner.hysteresis.lock().status();

        let sip_reachable = if status == InternetStatus::Up {
            match self.probe_sip().await {
                Ok(reachable) => Some(reachable),
                Err(e) => {
                    debug!(error = %e, "SIP probe error");
                    Some(false)
                }
            }
        } else if status == InternetStatus::Down {
            Some(false)
        } else {
            None
        };

        let changed = {
            let mut snapshot = self.inner.snapshot.lock();
            let mut changed = false;
            if !snapshot.link_up {
                snapshot.link_up = true;
                changed = true;
            }
            if transition.is_some() {
                snapshot.internet_status = status;
                snapshot.last_internet_transition = Some(Utc::now());
                changed = true;
            }
            if snapshot.sip_reachable != sip_reachable {
                snapshot.sip_reachable = sip_reachable;
                snapshot.last_sip_transition = Some(Utc::now());
                changed = true;
            }
            snapshot.last_check = Some(Utc::now());
            changed
        };

        if changed {
            self.publish();
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.inner
            .bus
            .emit(ClientEvent::ConnectivityChanged { snapshot });
    }

    async fn probe_http(&self, url: &str) -> bool {
        match self.inner.http.get(url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(url, error = %e, "probe failed");
                false
            }
        }
    }

    /// Open a WebSocket to the SIP server with the `sip` sub-protocol and
    /// close it cleanly the moment it opens.
    async fn probe_sip(&self) -> crate::error::ClientResult<bool> {
        let url = match softline_sip_transport::build_ws_url(&self.inner.sip_url) {
            Ok(url) => url,
            Err(_) => return Ok(false),
        };
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        let mut request = match url.as_str().into_client_request() {
            Ok(request) => request,
            Err(_) => return Ok(false),
        };
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            http::HeaderValue::from_static("sip"),
        );
        match tokio::time::timeout(
            self.inner.config.sip_probe_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((mut ws, _))) => {
                // Normal closure (1000) the moment the socket opens; the
                // probe only cares that the handshake succeeded.
                use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
                use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: Default::default(),
                    }))
                    .await;
                Ok(true)
            }
            Ok(Err(e)) => {
                debug!(error = %e, "SIP probe failed");
                Ok(false)
            }
            Err(_) => {
                warn!("SIP probe timed out");
                Err(crate::error::ClientError::ProbeTimeout { target: url })
            }
        }
    }
}

fn jitter(interval: Duration) -> Duration {
    let factor: f64 = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((interval.as_millis() as f64 * factor) as u64)
}

/// Fingerprint of the local network path: the set of non-loopback
/// interfaces and their addresses, hashed.
pub(crate) fn network_path_signature() -> String {
    let mut entries: Vec<String> = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .map(|i| format!("{}={}", i.name, i.ip()))
            .collect(),
        Err(_) => Vec::new(),
    };
    entries.sort();
    let mut hasher = DefaultHasher::new();
    entries.hash(&mut hasher);
    format!("if:{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hysteresis_requires_consecutive_observations() {
        let mut h = Hysteresis::new(2, 2);
        assert_eq!(h.observe(true), None);
        assert_eq!(h.observe(false), None); // breaks the streak
        assert_eq!(h.observe(true), None);
        assert_eq!(h.observe(true), Some(InternetStatus::Up));
        assert_eq!(h.status(), InternetStatus::Up);

        assert_eq!(h.observe(false), None);
        assert_eq!(h.observe(false), Some(InternetStatus::Down));
    }

    #[test]
    fn hysteresis_force_resets_counters() {
        let mut h = Hysteresis::new(2, 2);
        assert_eq!(h.observe(true), None);
        h.force(InternetStatus::Down);
        assert_eq!(h.observe(true), None);
        assert_eq!(h.observe(true), Some(InternetStatus::Up));
    }

    #[test]
    fn quorum_rule() {
        assert_eq!(probe_quorum(4), 2);
        assert_eq!(probe_quorum(5), 3);
        assert_eq!(probe_quorum(8), 4);
        // Small sets still need two successes; one probe alone can never
        // vote up.
        assert_eq!(probe_quorum(2), 2);
        assert_eq!(probe_quorum(1), 2);
    }

    #[test]
    fn path_signature_is_stable() {
        assert_eq!(network_path_signature(), network_path_signature());
        assert!(network_path_signature().starts_with("if:"));
    }

    #[tokio::test]
    async fn link_down_short_circuits() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let monitor =
            ConnectivityMonitor::new(bus, "pbx.example.com", MonitorConfig::default());
        monitor.notify_link_state(false);

        let snapshot = monitor.snapshot();
        assert!(!snapshot.link_up);
        assert_eq!(snapshot.internet_status, InternetStatus::Down);
        assert_eq!(snapshot.sip_reachable, Some(false));

        match rx.recv().await {
            Ok(ClientEvent::ConnectivityChanged { snapshot }) => {
                assert_eq!(snapshot.internet_status, InternetStatus::Down);
            }
            other => panic!("expected ConnectivityChanged, got {:?}", other),
        }
    }
}
