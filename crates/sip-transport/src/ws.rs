//! SIP over WebSocket (RFC 7118)
//!
//! Frames map one-to-one onto SIP messages. Keep-alive is the CRLF probe
//! from RFC 7118 §5.4: the client periodically writes a double CRLF and
//! treats repeated write failures as a dead link (the probe's reply, a
//! single CRLF, arrives as an empty text frame and is ignored by the
//! reader).

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    Transport, TransportEvent, TransportFactory, TransportOptions, TransportState,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use softline_sip_core::{parse_message, Message};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTED: u8 = 2;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build the WebSocket URL for a configured SIP server.
///
/// A literal `ws://` or `wss://` URL is used untouched; a bare host gets
/// the conventional secure port and path (`wss://host:8089/ws`); a bare
/// `host:port` keeps its port.
pub fn build_ws_url(server: &str) -> TransportResult<String> {
    let server = server.trim();
    if server.is_empty() {
        return Err(TransportError::InvalidUrl {
            url: server.to_string(),
            reason: "empty server".to_string(),
        });
    }
    if server.starts_with("ws://") || server.starts_with("wss://") {
        return Ok(server.to_string());
    }
    if server.contains("://") {
        return Err(TransportError::InvalidUrl {
            url: server.to_string(),
            reason: "unsupported scheme".to_string(),
        });
    }
    if server.contains(':') {
        Ok(format!("wss://{}/ws", server))
    } else {
        Ok(format!("wss://{}:8089/ws", server))
    }
}

enum OutCommand {
    Frame(WsMessage),
    KeepAlive,
    Shutdown,
}

/// The production transport: one WebSocket carrying SIP text frames.
pub struct WebSocketTransport {
    url: String,
    trace: bool,
    state: Arc<AtomicU8>,
    closed: Arc<AtomicBool>,
    out_tx: mpsc::Sender<OutCommand>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Connect to `server` (a host or a literal WebSocket URL) and return
    /// the transport plus its event stream.
    pub async fn connect(
        server: &str,
        options: &TransportOptions,
    ) -> TransportResult<(Arc<Self>, mpsc::Receiver<TransportEvent>)> {
        let url = build_ws_url(server)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            http::HeaderValue::from_static("sip"),
        );

        debug!(url = %url, "connecting SIP WebSocket");
        let connect = connect_async(request);
        let (ws, _response) = tokio::time::timeout(options.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                timeout_ms: options.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| TransportError::ConnectFailed {
                reason: e.to_string(),
            })?;

        let (sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);

        let state = Arc::new(AtomicU8::new(STATE_CONNECTED));
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Arc::new(WebSocketTransport {
            url: url.clone(),
            trace: options.trace,
            state: state.clone(),
            closed: closed.clone(),
            out_tx: out_tx.clone(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(writer_task(
            sink,
            out_rx,
            event_tx.clone(),
            options.keep_alive_max_failures,
        ));
        let reader = tokio::spawn(reader_task(
            stream,
            event_tx.clone(),
            state.clone(),
            closed.clone(),
            options.trace,
        ));
        let keepalive = tokio::spawn(keepalive_task(
            out_tx,
            options.keep_alive_interval,
        ));
        {
            let mut tasks = transport.tasks.lock();
            tasks.push(writer);
            tasks.push(reader);
            tasks.push(keepalive);
        }

        let _ = event_tx.send(TransportEvent::Connected).await;
        Ok((transport, event_rx))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: Message) -> TransportResult<()> {
        if self.state.load(Ordering::SeqCst) != STATE_CONNECTED {
            return Err(TransportError::NotConnected);
        }
        let text = message.to_string();
        if self.trace {
            trace!(url = %self.url, "--> {}", text);
        }
        self.out_tx
            .send(OutCommand::Frame(WsMessage::Text(text)))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        let _ = self.out_tx.send(OutCommand::Shutdown).await;
        // Give the writer a moment to flush the close frame, then reap.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    fn state(&self) -> TransportState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => TransportState::Connected,
            _ => TransportState::Disconnected,
        }
    }

    fn description(&self) -> String {
        self.url.clone()
    }
}

async fn writer_task(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut out_rx: mpsc::Receiver<OutCommand>,
    events: mpsc::Sender<TransportEvent>,
    keep_alive_max_failures: u32,
) {
    let mut keepalive_failures = 0u32;
    while let Some(command) = out_rx.recv().await {
        match command {
            OutCommand::Frame(frame) => {
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "WebSocket send failed");
                    let _ = events
                        .send(TransportEvent::Error {
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
            OutCommand::KeepAlive => {
                match sink.send(WsMessage::Text("\r\n\r\n".to_string())).await {
                    Ok(()) => keepalive_failures = 0,
                    Err(e) => {
                        keepalive_failures += 1;
                        warn!(
                            failures = keepalive_failures,
                            error = %e,
                            "keep-alive probe failed"
                        );
                        if keepalive_failures >= keep_alive_max_failures {
                            let _ = events.send(TransportEvent::KeepAliveTimeout).await;
                            break;
                        }
                    }
                }
            }
            OutCommand::Shutdown => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
}

async fn reader_task(
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<AtomicU8>,
    closed: Arc<AtomicBool>,
    trace_frames: bool,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                handle_frame(&text, &events, trace_frames).await;
            }
            Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => handle_frame(&text, &events, trace_frames).await,
                Err(_) => {
                    let _ = events
                        .send(TransportEvent::Error {
                            reason: "non-UTF-8 binary frame".to_string(),
                        })
                        .await;
                }
            },
            Some(Ok(WsMessage::Close(frame))) => {
                break match frame {
                    Some(f) => format!("closed by peer: {}", f.reason),
                    None => "closed by peer".to_string(),
                };
            }
            Some(Ok(_)) => {} // ping/pong handled by the protocol layer
            Some(Err(e)) => break format!("read error: {}", e),
            None => break "socket closed".to_string(),
        }
    };

    state.store(STATE_DISCONNECTED, Ordering::SeqCst);
    if !closed.load(Ordering::SeqCst) {
        let _ = events.send(TransportEvent::Disconnected { reason }).await;
    }
}

async fn handle_frame(text: &str, events: &mpsc::Sender<TransportEvent>, trace_frames: bool) {
    if text.trim().is_empty() {
        // CRLF keep-alive reply.
        return;
    }
    if trace_frames {
        trace!("<-- {}", text);
    }
    match parse_message(text) {
        Ok(message) => {
            let _ = events
                .send(TransportEvent::IncomingMessage(Box::new(message)))
                .await;
        }
        Err(e) => {
            warn!(error = %e, "dropping unparseable frame");
            let _ = events
                .send(TransportEvent::Error {
                    reason: e.to_string(),
                })
                .await;
        }
    }
}

async fn keepalive_task(out_tx: mpsc::Sender<OutCommand>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    loop {
        ticker.tick().await;
        if out_tx.send(OutCommand::KeepAlive).await.is_err() {
            break;
        }
    }
}

/// Default factory producing [`WebSocketTransport`]s.
#[derive(Debug, Default, Clone)]
pub struct WsTransportFactory;

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(
        &self,
        url: &str,
        options: &TransportOptions,
    ) -> TransportResult<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        let (transport, events) = WebSocketTransport::connect(url, options).await?;
        Ok((transport as Arc<dyn Transport>, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_default_port_and_path() {
        assert_eq!(
            build_ws_url("pbx.example.com").unwrap(),
            "wss://pbx.example.com:8089/ws"
        );
    }

    #[test]
    fn host_with_port_keeps_port() {
        assert_eq!(
            build_ws_url("pbx.example.com:9443").unwrap(),
            "wss://pbx.example.com:9443/ws"
        );
    }

    #[test]
    fn literal_url_is_untouched() {
        assert_eq!(
            build_ws_url("ws://10.0.0.5:8088/asterisk/ws").unwrap(),
            "ws://10.0.0.5:8088/asterisk/ws"
        );
    }

    #[test]
    fn foreign_scheme_is_rejected() {
        assert!(build_ws_url("https://pbx.example.com").is_err());
        assert!(build_ws_url("").is_err());
    }
}
