//! Upstream WebSocket driver.
//!
//! Each upstream connection runs as its own task owning the socket. The
//! broker loop talks to it through a command channel (send/close) and hears
//! back through a shared event channel; the loop thread stays the only
//! mutator of broker state. The [`Upstream`] trait is the seam between the
//! handlers and the transport so the handlers are testable without sockets.

use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::protocol::Message, Connector,
};
use tracing::{debug, error, info, warn};
use url::Url;

/// Bound on resolver, TCP connect, and TLS+WebSocket handshake, each.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a connection task reports back to the broker loop.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// Handshake completed; the socket is live.
    Opened { id: u64 },
    /// Resolve, connect, or handshake failed; no socket exists.
    OpenFailed { id: u64, error: String },
    /// One upstream frame. `remaining > 0` flags a fragmented frame whose
    /// continuation is forthcoming.
    Data {
        id: u64,
        payload: Vec<u8>,
        remaining: u32,
    },
    /// Mid-stream read or write failure.
    Error { id: u64, error: String },
    /// The socket is gone, cleanly or not. Always the task's last word.
    Closed { id: u64 },
}

/// Commands the broker loop sends into a connection task.
#[derive(Debug)]
enum ConnCommand {
    Send(Vec<u8>),
    Close,
}

/// Transport seam used by the message handlers.
pub trait Upstream {
    /// Start opening a connection; completion arrives as an event.
    fn open(&mut self, id: u64, url: &str);
    /// Forward bytes to the socket as a single write.
    fn send(&mut self, id: u64, data: Vec<u8>);
    /// Begin closing the socket; `Closed` arrives as an event.
    fn close(&mut self, id: u64);
    /// Drop task bookkeeping after a `Closed`/`OpenFailed` event.
    fn forget(&mut self, id: u64);
}

/// The real driver: one tokio task per upstream socket.
pub struct TokioUpstream {
    events: mpsc::UnboundedSender<UpstreamEvent>,
    commands: HashMap<u64, mpsc::UnboundedSender<ConnCommand>>,
}

impl TokioUpstream {
    pub fn new(events: mpsc::UnboundedSender<UpstreamEvent>) -> Self {
        Self {
            events,
            commands: HashMap::new(),
        }
    }
}

impl Upstream for TokioUpstream {
    fn open(&mut self, id: u64, url: &str) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.commands.insert(id, cmd_tx);
        let events = self.events.clone();
        let url = url.to_string();
        tokio::spawn(run_connection(id, url, events, cmd_rx));
    }

    fn send(&mut self, id: u64, data: Vec<u8>) {
        if let Some(tx) = self.commands.get(&id) {
            if tx.send(ConnCommand::Send(data)).is_err() {
                debug!(id, "send dropped; connection task already gone");
            }
        } else {
            debug!(id, "send dropped; connection unknown");
        }
    }

    fn close(&mut self, id: u64) {
        if let Some(tx) = self.commands.get(&id) {
            let _ = tx.send(ConnCommand::Close);
        }
    }

    fn forget(&mut self, id: u64) {
        self.commands.remove(&id);
    }
}

/// Full lifecycle of one upstream socket: connect, pump, close.
async fn run_connection(
    id: u64,
    url: String,
    events: mpsc::UnboundedSender<UpstreamEvent>,
    cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
) {
    info!(id, %url, "connecting upstream");
    let ws = match connect(&url).await {
        Ok(ws) => ws,
        Err(e) => {
            counter!("wsmux_upstream_connect_failures_total").increment(1);
            warn!(id, %url, error = %e, "upstream connect failed");
            let _ = events.send(UpstreamEvent::OpenFailed {
                id,
                error: e.to_string(),
            });
            return;
        }
    };

    gauge!("wsmux_upstream_connections").increment(1.0);
    info!(id, %url, "upstream connected");
    let _ = events.send(UpstreamEvent::Opened { id });

    pump(id, ws, &events, cmd_rx).await;

    gauge!("wsmux_upstream_connections").decrement(1.0);
    info!(id, %url, "upstream closed");
    let _ = events.send(UpstreamEvent::Closed { id });
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<TcpStream>,
>;

/// Resolve, connect, and handshake, each leg bounded by
/// [`CONNECT_TIMEOUT`]. IPv4 addresses are tried first.
async fn connect(url_str: &str) -> Result<WsStream, String> {
    let url = Url::parse(url_str).map_err(|e| format!("bad url: {e}"))?;
    let host = url.host_str().ok_or_else(|| "no host in url".to_string())?;
    let default_port = if url.scheme() == "ws" { 80 } else { 443 };
    let port = url.port().unwrap_or(default_port);

    let addrs: Vec<SocketAddr> = tokio::time::timeout(
        CONNECT_TIMEOUT,
        tokio::net::lookup_host((host, port)),
    )
    .await
    .map_err(|_| "resolve timed out".to_string())?
    .map_err(|e| format!("resolve failed: {e}"))?
    .collect();

    let mut sorted: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    sorted.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());
    if sorted.is_empty() {
        return Err(format!("no addresses for {host}"));
    }

    let mut tcp = None;
    for addr in &sorted {
        debug!(%addr, "trying upstream address");
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                tcp = Some(stream);
                break;
            }
            Ok(Err(e)) => debug!(%addr, error = %e, "tcp connect failed"),
            Err(_) => debug!(%addr, "tcp connect timed out"),
        }
    }
    let tcp = tcp.ok_or_else(|| "all connection attempts failed".to_string())?;

    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = root_store.add(cert);
    }
    let connector = Connector::Rustls(Arc::new(
        rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("tls config error: {e}"))?
        .with_root_certificates(root_store)
        .with_no_client_auth(),
    ));

    let (ws, response) = tokio::time::timeout(
        CONNECT_TIMEOUT,
        client_async_tls_with_config(url_str, tcp, None, Some(connector)),
    )
    .await
    .map_err(|_| "handshake timed out".to_string())?
    .map_err(|e| format!("handshake failed: {e}"))?;

    debug!(status = ?response.status(), "websocket handshake complete");
    Ok(ws)
}

/// Pump frames both ways until the socket or the command channel ends.
async fn pump(
    id: u64,
    ws: WsStream,
    events: &mpsc::UnboundedSender<UpstreamEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        counter!("wsmux_upstream_frames_total").increment(1);
                        let _ = events.send(UpstreamEvent::Data {
                            id,
                            payload: text.into_bytes(),
                            remaining: 0,
                        });
                    }
                    Some(Ok(Message::Binary(data))) => {
                        counter!("wsmux_upstream_frames_total").increment(1);
                        let _ = events.send(UpstreamEvent::Data {
                            id,
                            payload: data,
                            remaining: 0,
                        });
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            let _ = events.send(UpstreamEvent::Error {
                                id,
                                error: format!("pong failed: {e}"),
                            });
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(id, ?frame, "upstream sent close");
                        return;
                    }
                    Some(Err(e)) => {
                        error!(id, error = %e, "upstream read failed");
                        let _ = events.send(UpstreamEvent::Error {
                            id,
                            error: e.to_string(),
                        });
                        return;
                    }
                    None => {
                        debug!(id, "upstream stream ended");
                        return;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ConnCommand::Send(data)) => {
                        // Subscription payloads are text on every upstream we
                        // front; fall back to a binary frame otherwise.
                        let msg = match String::from_utf8(data) {
                            Ok(text) => Message::Text(text),
                            Err(e) => Message::Binary(e.into_bytes()),
                        };
                        if let Err(e) = write.send(msg).await {
                            let _ = events.send(UpstreamEvent::Error {
                                id,
                                error: format!("write failed: {e}"),
                            });
                            return;
                        }
                    }
                    Some(ConnCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! Recording transport for handler tests.

    use super::Upstream;

    #[derive(Debug, PartialEq, Eq)]
    pub enum Call {
        Open { id: u64, url: String },
        Send { id: u64, data: Vec<u8> },
        Close { id: u64 },
    }

    /// Records every call; completion events are injected by the test.
    #[derive(Default)]
    pub struct MockUpstream {
        pub calls: Vec<Call>,
    }

    impl MockUpstream {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sends_for(&self, id: u64) -> Vec<&[u8]> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Send { id: i, data } if *i == id => Some(data.as_slice()),
                    _ => None,
                })
                .collect()
        }

        pub fn close_count(&self, id: u64) -> usize {
            self.calls
                .iter()
                .filter(|c| matches!(c, Call::Close { id: i } if *i == id))
                .count()
        }
    }

    impl Upstream for MockUpstream {
        fn open(&mut self, id: u64, url: &str) {
            self.calls.push(Call::Open {
                id,
                url: url.to_string(),
            });
        }

        fn send(&mut self, id: u64, data: Vec<u8>) {
            self.calls.push(Call::Send { id, data });
        }

        fn close(&mut self, id: u64) {
            self.calls.push(Call::Close { id });
        }

        fn forget(&mut self, _id: u64) {}
    }
}
