//! The softphone client: user agent lifecycle and message dispatch
//!
//! `SoftphoneClient` owns the one transport, the one registration, every
//! call session and every BLF subscription. It is cheap to clone (an `Arc`
//! around shared state); background tasks hold clones. Operations are
//! spread over sibling modules the way the feature areas split: calls,
//! registration, DTMF, transfers, NOTIFY handling.

pub(crate) mod dialog;
pub(crate) mod registrar;
pub(crate) mod calls;
mod dtmf;
mod transfer;
mod notify;

use crate::adapters::{ContactsDirectory, NullContacts};
use crate::blf::BlfStore;
use crate::call::{
    CallHistoryRecord, CallInfo, CallOutcome, CallState, CallStats, SessionId, LINE_COUNT,
};
use crate::config::{SipConfig, SipConfigPatch};
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventBus, RegistrationState, TransportStatus};
use crate::media::{MediaFactory, NullMediaFactory};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dialog::Session;
use softline_sip_core::builder::generate_tag;
use softline_sip_core::{Message, Request, Response, ResponseBuilder, StatusCode};
use softline_sip_transport::{
    Transport, TransportEvent, TransportFactory, TransportOptions, WsTransportFactory,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

/// Delay between transport open and the automatic REGISTER.
const AUTO_REGISTER_DELAY: Duration = Duration::from_millis(500);
/// Bound on waiting for a final response to a non-INVITE request.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub(crate) struct Counters {
    pub total: AtomicU64,
    pub outgoing: AtomicU64,
    pub incoming: AtomicU64,
    pub missed: AtomicU64,
}

pub(crate) struct RegistrationRecord {
    pub state: RegistrationState,
    pub registered_at: Option<DateTime<Utc>>,
    /// REGISTER dialog identifiers, stable across refreshes.
    pub call_id: Option<String>,
    pub from_tag: String,
    pub cseq: u32,
}

impl Default for RegistrationRecord {
    fn default() -> Self {
        RegistrationRecord {
            state: RegistrationState::Unregistered,
            registered_at: None,
            call_id: None,
            from_tag: generate_tag(),
            cseq: 0,
        }
    }
}

pub(crate) struct ClientInner {
    pub config: RwLock<SipConfig>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub media_factory: Arc<dyn MediaFactory>,
    pub contacts: Arc<dyn ContactsDirectory>,
    pub bus: EventBus,
    pub transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Random `.invalid` Via/Contact host, as WebSocket clients use.
    pub local_host: String,
    pub registration: RwLock<RegistrationRecord>,
    pub refresh_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    pub sessions: DashMap<SessionId, Arc<Session>>,
    pub call_index: DashMap<String, SessionId>,
    pub lines: parking_lot::Mutex<[Option<SessionId>; LINE_COUNT]>,
    pub selected_line: parking_lot::Mutex<Option<u8>>,
    pub pending: DashMap<String, oneshot::Sender<Response>>,
    pub session_seq: AtomicU64,
    pub stats: Counters,
    pub blf: BlfStore,
    pub tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    pub running: AtomicBool,
}

/// Builder wiring collaborators into a [`SoftphoneClient`].
///
/// # Examples
///
/// ```rust,no_run
/// use softline_client_core::client::SoftphoneClient;
/// use softline_client_core::config::SipConfig;
///
/// # async fn example() {
/// let config = SipConfig::new("pbx.example.com", "1001", "secret", "pbx.example.com");
/// let client = SoftphoneClient::builder(config).build();
/// client.create_user_agent().await.unwrap();
/// # }
/// ```
pub struct SoftphoneClientBuilder {
    config: SipConfig,
    transport_factory: Arc<dyn TransportFactory>,
    media_factory: Arc<dyn MediaFactory>,
    contacts: Arc<dyn ContactsDirectory>,
    bus: Option<EventBus>,
}

impl SoftphoneClientBuilder {
    pub fn new(config: SipConfig) -> Self {
        SoftphoneClientBuilder {
            config,
            transport_factory: Arc::new(WsTransportFactory),
            media_factory: Arc::new(NullMediaFactory::new()),
            contacts: Arc::new(NullContacts),
            bus: None,
        }
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn media_factory(mut self, factory: Arc<dyn MediaFactory>) -> Self {
        self.media_factory = factory;
        self
    }

    pub fn contacts(mut self, contacts: Arc<dyn ContactsDirectory>) -> Self {
        self.contacts = contacts;
        self
    }

    /// Share an existing bus instead of creating one.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> SoftphoneClient {
        let local_host = format!("{:x}.invalid", rand::random::<u64>());
        SoftphoneClient {
            inner: Arc::new(ClientInner {
                config: RwLock::new(self.config),
                transport_factory: self.transport_factory,
                media_factory: self.media_factory,
                contacts: self.contacts,
                bus: self.bus.unwrap_or_default(),
                transport: RwLock::new(None),
                local_host,
                registration: RwLock::new(RegistrationRecord::default()),
                refresh_task: parking_lot::Mutex::new(None),
                sessions: DashMap::new(),
                call_index: DashMap::new(),
                lines: parking_lot::Mutex::new([None, None, None]),
                selected_line: parking_lot::Mutex::new(None),
                pending: DashMap::new(),
                session_seq: AtomicU64::new(0),
                stats: Counters::default(),
                blf: BlfStore::default(),
                tasks: parking_lot::Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }
}

/// The multi-line softphone core.
#[derive(Clone)]
pub struct SoftphoneClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl SoftphoneClient {
    /// Build a client with default collaborators.
    pub fn new(config: SipConfig) -> Self {
        SoftphoneClientBuilder::new(config).build()
    }

    pub fn builder(config: SipConfig) -> SoftphoneClientBuilder {
        SoftphoneClientBuilder::new(config)
    }

    /// The shared event bus.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ClientEvent> {
        self.inner.bus.subscribe()
    }

    /// Snapshot of the current configuration.
    pub async fn config(&self) -> SipConfig {
        self.inner.config.read().await.clone()
    }

    /// Merge a partial reconfiguration. Nothing restarts; the merged
    /// config is picked up by the next `create_user_agent`.
    pub async fn configure(&self, patch: SipConfigPatch) {
        self.inner.config.write().await.apply(patch);
    }

    pub async fn registration_state(&self) -> RegistrationState {
        self.inner.registration.read().await.state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Aggregate call counters.
    pub fn stats(&self) -> CallStats {
        CallStats {
            total_calls: self.inner.stats.total.load(Ordering::SeqCst),
            outgoing_calls: self.inner.stats.outgoing.load(Ordering::SeqCst),
            incoming_calls: self.inner.stats.incoming.load(Ordering::SeqCst),
            missed_calls: self.inner.stats.missed.load(Ordering::SeqCst),
            active_calls: self.inner.sessions.len(),
        }
    }

    /// Snapshots of all live sessions.
    pub fn list_calls(&self) -> Vec<CallInfo> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    pub fn get_call(&self, session_id: &SessionId) -> ClientResult<CallInfo> {
        self.session_checked(session_id).map(|s| s.snapshot())
    }

    /// Start the user agent: build the transport, connect, and begin
    /// dispatching. Registration follows automatically shortly after the
    /// transport opens.
    pub async fn create_user_agent(&self) -> ClientResult<()> {
        let config = self.inner.config.read().await.clone();
        config.validate()?;
        softline_sip_transport::build_ws_url(&config.server_url).map_err(|_| {
            ClientError::UriBuildFailed {
                input: config.server_url.clone(),
            }
        })?;

        if self.inner.transport.read().await.is_some() {
            return Err(ClientError::TransportStartFailed {
                reason: "user agent already exists".to_string(),
            });
        }

        let options = TransportOptions {
            keep_alive_interval: config.keep_alive_interval,
            keep_alive_max_failures: config.keep_alive_max_failures,
            connect_timeout: Duration::from_secs(10),
            trace: config.trace_sip,
        };

        self.inner
            .bus
            .emit(ClientEvent::TransportStateChanged {
                state: TransportStatus::Connecting,
            });

        let (transport, events) = self
            .inner
            .transport_factory
            .connect(&config.server_url, &options)
            .await
            .map_err(|e| {
                self.inner.bus.emit(ClientEvent::TransportError {
                    reason: e.to_string(),
                });
                self.inner.bus.emit(ClientEvent::TransportStateChanged {
                    state: TransportStatus::Disconnected,
                });
                ClientError::TransportStartFailed {
                    reason: e.to_string(),
                }
            })?;

        info!(server = %transport.description(), "user agent started");
        *self.inner.transport.write().await = Some(transport);
        self.inner.running.store(true, Ordering::SeqCst);

        let client = self.clone();
        let handle = tokio::spawn(async move { client.run_event_loop(events).await });
        self.inner.tasks.lock().push(handle);
        Ok(())
    }

    /// Stop the user agent: tear down sessions, subscriptions and the
    /// registration record, and close the transport.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        // The event loop dies first so the close below is not observed as
        // a remote disconnect.
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = self.inner.refresh_task.lock().take() {
            task.abort();
        }
        self.inner.blf.stop_maintenance();

        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for session in sessions {
            self.terminate_session(&session, "Client stopped", CallState::Terminated)
                .await;
        }

        self.inner.blf.clear();
        self.inner.pending.clear();

        if let Some(transport) = self.inner.transport.write().await.take() {
            transport.close().await;
        }

        let was_registered = {
            let mut reg = self.inner.registration.write().await;
            let was = reg.state == RegistrationState::Registered
                || reg.state == RegistrationState::Registering;
            reg.state = RegistrationState::Unregistered;
            reg.registered_at = None;
            was
        };
        if was_registered {
            self.inner.bus.emit(ClientEvent::RegistrationStateChanged {
                state: RegistrationState::Unregistered,
            });
            self.inner.bus.emit(ClientEvent::Unregistered);
        }

        self.inner.bus.emit(ClientEvent::TransportStateChanged {
            state: TransportStatus::Disconnected,
        });
        info!("user agent stopped");
    }

    // ===== transport event loop =====

    async fn run_event_loop(self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => {
                    self.inner.bus.emit(ClientEvent::TransportStateChanged {
                        state: TransportStatus::Connected,
                    });
                    self.inner.bus.emit(ClientEvent::TransportConnected);
                    self.spawn_auto_register();
                }
                TransportEvent::IncomingMessage(message) => {
                    self.dispatch_message(*message).await;
                }
                TransportEvent::Disconnected { reason } => {
                    self.handle_transport_lost(&reason).await;
                    break;
                }
                TransportEvent::KeepAliveTimeout => {
                    self.inner.bus.emit(ClientEvent::TransportError {
                        reason: "keep-alive timeout".to_string(),
                    });
                    if let Some(transport) = self.inner.transport.write().await.take() {
                        transport.close().await;
                    }
                    self.handle_transport_lost("keep-alive timeout").await;
                    break;
                }
                TransportEvent::Error { reason } => {
                    self.inner
                        .bus
                        .emit(ClientEvent::TransportError { reason });
                }
            }
        }
        debug!("transport event loop ended");
    }

    fn spawn_auto_register(&self) {
        let client = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(AUTO_REGISTER_DELAY).await;
            if !client.is_connected() {
                return;
            }
            if client.registration_state().await == RegistrationState::Unregistered {
                if let Err(e) = client.register().await {
                    warn!(error = %e, "auto-register failed");
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    /// Transport is gone: registration and subscriptions are void, every
    /// session dies, and the recovery controller decides what happens
    /// next.
    async fn handle_transport_lost(&self, reason: &str) {
        warn!(reason, "transport lost");
        self.inner.running.store(false, Ordering::SeqCst);
        *self.inner.transport.write().await = None;
        if let Some(task) = self.inner.refresh_task.lock().take() {
            task.abort();
        }

        self.inner.bus.emit(ClientEvent::TransportStateChanged {
            state: TransportStatus::Disconnected,
        });
        self.inner.bus.emit(ClientEvent::TransportDisconnected {
            reason: reason.to_string(),
        });

        {
            let mut reg = self.inner.registration.write().await;
            if reg.state != RegistrationState::Unregistered {
                reg.state = RegistrationState::Unregistered;
                reg.registered_at = None;
                self.inner.bus.emit(ClientEvent::RegistrationStateChanged {
                    state: RegistrationState::Unregistered,
                });
                self.inner.bus.emit(ClientEvent::Unregistered);
            }
        }

        self.inner.blf.stop_maintenance();
        self.inner.blf.clear();

        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for session in sessions {
            self.terminate_session(&session, "Transport lost", CallState::Failed)
                .await;
        }
        self.inner.pending.clear();
    }

    async fn dispatch_message(&self, message: Message) {
        match message {
            Message::Request(request) => self.dispatch_request(request).await,
            Message::Response(response) => self.dispatch_response(response).await,
        }
    }

    async fn dispatch_request(&self, request: Request) {
        use softline_sip_core::Method;
        debug!(method = %request.method, call_id = ?request.call_id(), "request received");
        match request.method.clone() {
            Method::Invite => self.handle_incoming_invite(request).await,
            Method::Ack => {}
            Method::Bye => self.handle_incoming_bye(request).await,
            Method::Cancel => self.handle_incoming_cancel(request).await,
            Method::Notify => self.handle_incoming_notify(request).await,
            Method::Options => {
                self.reply(&request, StatusCode::OK).await;
            }
            Method::Message => {
                self.reply(&request, StatusCode::OK).await;
                let from = request
                    .headers
                    .from_address()
                    .map(|a| a.uri.to_string())
                    .unwrap_or_default();
                self.inner.bus.emit(ClientEvent::MessageReceived {
                    from,
                    body: request.body_str().to_string(),
                });
            }
            Method::Info => {
                self.reply(&request, StatusCode::OK).await;
            }
            _ => {
                self.reply(&request, StatusCode::NOT_IMPLEMENTED).await;
            }
        }
    }

    async fn dispatch_response(&self, response: Response) {
        use softline_sip_core::Method;
        let call_id = response.call_id().unwrap_or("").to_string();
        let cseq = match response.cseq() {
            Ok(cseq) => cseq,
            Err(_) => {
                warn!("response without CSeq dropped");
                return;
            }
        };

        let key = pending_key(&call_id, cseq.seq);
        if let Some((_, tx)) = self.inner.pending.remove(&key) {
            let _ = tx.send(response);
            return;
        }

        if let Some(session) = self.session_by_call_id(&call_id) {
            match cseq.method {
                Method::Invite => self.handle_invite_response(session, response).await,
                Method::Refer => self.handle_refer_response(session, response).await,
                Method::Bye | Method::Cancel => {
                    debug!(status = response.status.code(), "teardown response");
                }
                _ => {}
            }
        } else {
            debug!(call_id = %call_id, "response for unknown dialog dropped");
        }
    }

    // ===== shared plumbing =====

    pub(crate) async fn reply(&self, request: &Request, status: StatusCode) {
        let response = ResponseBuilder::reply_to(request, status).build();
        if let Err(e) = self.send_message(response.into()).await {
            warn!(error = %e, "failed to send response");
        }
    }

    pub(crate) async fn send_message(&self, message: Message) -> ClientResult<()> {
        let transport = self
            .inner
            .transport
            .read()
            .await
            .clone()
            .ok_or(ClientError::Transport(
                softline_sip_transport::TransportError::NotConnected,
            ))?;
        transport.send(message).await?;
        Ok(())
    }

    /// Send a request and wait for its final response, keyed by
    /// Call-ID + CSeq. Provisional responses to non-INVITE requests are
    /// not expected from the servers this stack targets.
    pub(crate) async fn send_request_await(
        &self,
        request: Request,
        operation: &str,
    ) -> ClientResult<Response> {
        let call_id = request.call_id().unwrap_or("").to_string();
        let seq = request.cseq()?.seq;
        let key = pending_key(&call_id, seq);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(key.clone(), tx);

        if let Err(e) = self.send_message(request.into()).await {
            self.inner.pending.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.inner.pending.remove(&key);
                Err(ClientError::OperationTimeout {
                    operation: operation.to_string(),
                })
            }
            Err(_) => {
                self.inner.pending.remove(&key);
                Err(ClientError::OperationTimeout {
                    operation: operation.to_string(),
                })
            }
        }
    }

    pub(crate) fn session_by_call_id(&self, call_id: &str) -> Option<Arc<Session>> {
        let id = self.inner.call_index.get(call_id)?.clone();
        self.inner.sessions.get(&id).map(|e| e.value().clone())
    }

    pub(crate) fn session_checked(&self, session_id: &SessionId) -> ClientResult<Arc<Session>> {
        self.inner
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ClientError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Lowest-numbered idle line, or `None` when all three are taken.
    pub(crate) fn allocate_line(&self, session_id: &SessionId) -> Option<u8> {
        let mut lines = self.inner.lines.lock();
        for (index, slot) in lines.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(session_id.clone());
                return Some(index as u8 + 1);
            }
        }
        None
    }

    pub(crate) fn free_line(&self, line: u8) {
        if line == 0 || line as usize > LINE_COUNT {
            return;
        }
        self.inner.lines.lock()[line as usize - 1] = None;
        {
            let mut selected = self.inner.selected_line.lock();
            if *selected == Some(line) {
                *selected = None;
            }
        }
        self.inner.bus.emit(ClientEvent::LineReleased { line });
    }

    pub(crate) fn note_selected_line(&self, line: Option<u8>) {
        *self.inner.selected_line.lock() = line;
    }

    pub(crate) fn selected_session(&self) -> Option<Arc<Session>> {
        let line = (*self.inner.selected_line.lock())?;
        let id = self.inner.lines.lock()[line as usize - 1].clone()?;
        self.inner.sessions.get(&id).map(|e| e.value().clone())
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        let seq = self.inner.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        SessionId::generate(seq)
    }

    /// Common teardown: final state, maps, line, media, timers, events.
    pub(crate) async fn terminate_session(
        &self,
        session: &Arc<Session>,
        reason: &str,
        final_state: CallState,
    ) {
        if session.state().is_terminal() {
            return;
        }
        session.timers.lock().cancel_all();
        session.set_state(final_state);
        self.notify_attended_terminated(session);

        self.inner.sessions.remove(&session.id);
        self.inner.call_index.remove(&session.call_id());
        self.free_line(session.line);

        let media = session.media.lock().take();
        if let Some(media) = media {
            media.close().await;
        }

        let outcome = if session.was_locally_answered() || session.answered_at.lock().is_some() {
            CallOutcome::Completed
        } else {
            match session.direction {
                crate::call::CallDirection::Incoming => CallOutcome::Missed,
                crate::call::CallDirection::Outgoing => CallOutcome::Cancelled,
            }
        };
        if outcome == CallOutcome::Missed {
            self.inner.stats.missed.fetch_add(1, Ordering::SeqCst);
        }

        self.inner.bus.emit(ClientEvent::SessionTerminated {
            session_id: session.id.clone(),
            line: session.line,
            direction: session.direction,
            reason: reason.to_string(),
        });
        self.inner.bus.emit(ClientEvent::CallHistory {
            record: CallHistoryRecord {
                id: session.id.clone(),
                number: session.remote_number.clone(),
                name: session.remote_display.lock().clone(),
                direction: session.direction,
                duration_seconds: session.duration_seconds(),
                status: outcome,
                timestamp: Utc::now(),
            },
        });
        info!(session = %session.id, line = session.line, reason, "session terminated");
    }
}

pub(crate) fn pending_key(call_id: &str, seq: u32) -> String {
    format!("{}:{}", call_id, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> SoftphoneClient {
        SoftphoneClient::new(SipConfig::new("pbx", "1001", "pw", "pbx"))
    }

    #[test]
    fn line_allocation_is_lowest_first() {
        let client = test_client();
        let a = SessionId::from_raw("a");
        let b = SessionId::from_raw("b");
        let c = SessionId::from_raw("c");
        let d = SessionId::from_raw("d");
        assert_eq!(client.allocate_line(&a), Some(1));
        assert_eq!(client.allocate_line(&b), Some(2));
        assert_eq!(client.allocate_line(&c), Some(3));
        assert_eq!(client.allocate_line(&d), None);
        client.free_line(2);
        assert_eq!(client.allocate_line(&d), Some(2));
    }

    #[tokio::test]
    async fn create_user_agent_requires_valid_config() {
        let client = SoftphoneClient::new(SipConfig::new("", "1001", "pw", "pbx"));
        let err = client.create_user_agent().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn stats_start_at_zero() {
        let client = test_client();
        let stats = client.stats();
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.active_calls, 0);
    }
}
