//! Real-time transport: endpoint URLs, the [`Connector`] seam and the
//! tokio-tungstenite implementation.
//!
//! ## Design
//! - A connector spawns one task per connection and hands back a
//!   [`TransportHandle`] holding the command channel into that task.
//! - The task reports `Opened` / `Frame` / `Closed` as [`TransportEvent`]s,
//!   tagged with the connection id so the session can ignore stale sockets.
//! - Every connection ends with exactly one `Closed` event, including failed
//!   handshakes.

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, ORIGIN};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info};

use crate::error::ChatError;
use crate::frame::OutboundFrame;

/// Monotonic id of one connection attempt within a session.
pub type ConnectionId = u64;

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// URLs derived from the site origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    origin: Url,
}

impl Endpoints {
    /// Accepts `http://` and `https://` origins with a host.
    pub fn new(origin: &str) -> Result<Self, ChatError> {
        let invalid = |reason: &str| ChatError::InvalidOrigin {
            origin: origin.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(origin).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host"));
        }
        Ok(Self { origin: url })
    }

    /// True when the origin is served over TLS.
    pub fn is_secure(&self) -> bool {
        self.origin.scheme() == "https"
    }

    /// Origin serialization as a browser would send it (`scheme://host[:port]`).
    pub fn origin(&self) -> String {
        self.origin.origin().ascii_serialization()
    }

    /// `{ws|wss}://<host>/ws/chat/<room>/`
    pub fn websocket(&self, room_id: &str) -> Result<Url, ChatError> {
        let mut url = self.with_path(&["ws", "chat", room_id, ""])?;
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| ChatError::InvalidOrigin {
            origin: self.origin.to_string(),
            reason: format!("cannot switch scheme to {scheme}"),
        })?;
        Ok(url)
    }

    /// `<origin>/upload-file/<room>/`
    pub fn upload_file(&self, room_id: &str) -> Result<Url, ChatError> {
        self.with_path(&["upload-file", room_id, ""])
    }

    /// `<origin>/upload-voice/<room>/`
    pub fn upload_voice(&self, room_id: &str) -> Result<Url, ChatError> {
        self.with_path(&["upload-voice", room_id, ""])
    }

    fn with_path(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.origin.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| ChatError::InvalidOrigin {
                origin: self.origin.to_string(),
                reason: "origin cannot carry a path".to_string(),
            })?
            .clear()
            .extend(segments);
        Ok(url)
    }
}

/// Cookie header a browser would attach for this site, if there is anything
/// to send.
pub fn cookie_header(csrf_token: &str, session_id: Option<&str>) -> Option<String> {
    let mut parts = Vec::new();
    if !csrf_token.is_empty() {
        parts.push(format!("csrftoken={csrf_token}"));
    }
    if let Some(session) = session_id.filter(|s| !s.is_empty()) {
        parts.push(format!("sessionid={session}"));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

// ---------------------------------------------------------------------------
// Events and handles
// ---------------------------------------------------------------------------

/// Lifecycle and data events reported by a connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened { id: ConnectionId },
    Frame { id: ConnectionId, text: String },
    Closed { id: ConnectionId, reason: Option<String> },
}

impl TransportEvent {
    pub fn id(&self) -> ConnectionId {
        match self {
            TransportEvent::Opened { id }
            | TransportEvent::Frame { id, .. }
            | TransportEvent::Closed { id, .. } => *id,
        }
    }
}

/// Commands from the session into a connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Send(String),
    Close,
}

/// Socket state as tracked by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// The session's end of one connection.
#[derive(Debug)]
pub struct TransportHandle {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<TransportCommand>,
    state: ReadyState,
}

impl TransportHandle {
    pub fn new(id: ConnectionId, commands: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self {
            id,
            commands,
            state: ReadyState::Connecting,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ReadyState::Open
    }

    pub(crate) fn mark_open(&mut self) {
        if self.state == ReadyState::Connecting {
            self.state = ReadyState::Open;
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = ReadyState::Closed;
    }

    /// Queue a frame. Returns `false` (and sends nothing) unless open.
    pub fn send(&self, frame: &OutboundFrame) -> bool {
        if !self.is_open() {
            return false;
        }
        self.commands
            .send(TransportCommand::Send(frame.to_json()))
            .is_ok()
    }

    /// Ask the connection task to close. Idempotent.
    pub fn close(&mut self) {
        if matches!(self.state, ReadyState::Closing | ReadyState::Closed) {
            return;
        }
        let _ = self.commands.send(TransportCommand::Close);
        self.state = ReadyState::Closing;
    }
}

// ---------------------------------------------------------------------------
// Connector seam
// ---------------------------------------------------------------------------

/// Everything a connector needs to open one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub id: ConnectionId,
    pub url: Url,
    /// Value for the `Origin` header.
    pub origin: String,
    pub cookie: Option<String>,
}

/// Opens connections. Implementations must report exactly one
/// [`TransportEvent::Closed`] per connection, after any `Opened`/`Frame`.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        request: ConnectRequest,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> TransportHandle;
}

/// [`Connector`] backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(
        &self,
        request: ConnectRequest,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> TransportHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = TransportHandle::new(request.id, tx);
        tokio::spawn(run_socket(request, rx, events));
        handle
    }
}

/// Build the handshake request with the headers a browser would send.
pub fn handshake_request(
    request: &ConnectRequest,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ChatError> {
    let mut ws_request = request.url.as_str().into_client_request()?;
    let headers = ws_request.headers_mut();
    let origin = HeaderValue::from_str(&request.origin)
        .map_err(|e| ChatError::Config(format!("invalid Origin header: {e}")))?;
    headers.insert(ORIGIN, origin);
    if let Some(cookie) = &request.cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|e| ChatError::Config(format!("invalid Cookie header: {e}")))?;
        headers.insert(COOKIE, value);
    }
    Ok(ws_request)
}

async fn run_socket(
    request: ConnectRequest,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let id = request.id;
    let reason = match drive_socket(request, &mut commands, &events).await {
        Ok(()) => None,
        Err(e) => Some(e.to_string()),
    };
    let _ = events.send(TransportEvent::Closed { id, reason });
}

async fn drive_socket(
    request: ConnectRequest,
    commands: &mut mpsc::UnboundedReceiver<TransportCommand>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> Result<(), ChatError> {
    let id = request.id;
    let ws_request = handshake_request(&request)?;

    let connect = tokio_tungstenite::connect_async(ws_request);
    tokio::pin!(connect);

    // A close requested while the handshake is in flight abandons it.
    let ws_stream = loop {
        tokio::select! {
            result = &mut connect => break result?.0,
            cmd = commands.recv() => match cmd {
                Some(TransportCommand::Send(_)) => continue,
                Some(TransportCommand::Close) | None => {
                    debug!(connection = id, "closed before handshake completed");
                    return Ok(());
                }
            },
        }
    };

    info!(connection = id, url = %request.url, "WS connected");
    if events.send(TransportEvent::Opened { id }).is_err() {
        return Ok(());
    }

    let (mut ws_sink, mut ws_source) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_source.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if events.send(TransportEvent::Frame { id, text }).is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary / ping / pong
                    Some(Err(e)) => return Err(e.into()),
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(TransportCommand::Send(text)) => {
                        ws_sink.send(WsMessage::Text(text)).await?;
                    }
                    Some(TransportCommand::Close) | None => {
                        let _ = ws_sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_origin_maps_to_ws() {
        let ep = Endpoints::new("http://localhost:8000").unwrap();
        assert!(!ep.is_secure());
        assert_eq!(
            ep.websocket("12").unwrap().as_str(),
            "ws://localhost:8000/ws/chat/12/"
        );
    }

    #[test]
    fn https_origin_maps_to_wss() {
        let ep = Endpoints::new("https://chat.example.com").unwrap();
        assert!(ep.is_secure());
        assert_eq!(
            ep.websocket("room-a").unwrap().as_str(),
            "wss://chat.example.com/ws/chat/room-a/"
        );
    }

    #[test]
    fn origin_path_and_query_are_replaced() {
        let ep = Endpoints::new("https://chat.example.com/some/page?x=1#frag").unwrap();
        assert_eq!(
            ep.upload_file("3").unwrap().as_str(),
            "https://chat.example.com/upload-file/3/"
        );
        assert_eq!(ep.origin(), "https://chat.example.com");
    }

    #[test]
    fn upload_endpoints() {
        let ep = Endpoints::new("http://127.0.0.1:8000").unwrap();
        assert_eq!(
            ep.upload_file("7").unwrap().as_str(),
            "http://127.0.0.1:8000/upload-file/7/"
        );
        assert_eq!(
            ep.upload_voice("7").unwrap().as_str(),
            "http://127.0.0.1:8000/upload-voice/7/"
        );
    }

    #[test]
    fn room_id_is_percent_encoded_as_one_segment() {
        let ep = Endpoints::new("http://localhost").unwrap();
        assert_eq!(
            ep.websocket("a/b c").unwrap().as_str(),
            "ws://localhost/ws/chat/a%2Fb%20c/"
        );
    }

    #[test]
    fn rejects_non_http_origins() {
        assert!(matches!(
            Endpoints::new("ftp://example.com"),
            Err(ChatError::InvalidOrigin { .. })
        ));
        assert!(matches!(
            Endpoints::new("not a url"),
            Err(ChatError::InvalidOrigin { .. })
        ));
    }

    #[test]
    fn cookie_header_combinations() {
        assert_eq!(cookie_header("", None), None);
        assert_eq!(cookie_header("t", None).as_deref(), Some("csrftoken=t"));
        assert_eq!(
            cookie_header("t", Some("s")).as_deref(),
            Some("csrftoken=t; sessionid=s")
        );
        assert_eq!(cookie_header("", Some("s")).as_deref(), Some("sessionid=s"));
        assert_eq!(cookie_header("", Some("")), None);
    }

    #[test]
    fn handshake_request_carries_origin_and_cookie() {
        let ep = Endpoints::new("https://chat.example.com").unwrap();
        let req = ConnectRequest {
            id: 1,
            url: ep.websocket("5").unwrap(),
            origin: ep.origin(),
            cookie: cookie_header("tok", Some("sess")),
        };
        let ws = handshake_request(&req).unwrap();
        assert_eq!(ws.headers()[ORIGIN], "https://chat.example.com");
        assert_eq!(ws.headers()[COOKIE], "csrftoken=tok; sessionid=sess");
        assert_eq!(ws.uri().path(), "/ws/chat/5/");
    }

    #[test]
    fn handle_send_requires_open_state() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = TransportHandle::new(1, tx);
        assert_eq!(handle.ready_state(), ReadyState::Connecting);
        assert!(!handle.send(&OutboundFrame::TypingNotice));
        assert!(rx.try_recv().is_err());

        handle.mark_open();
        assert!(handle.send(&OutboundFrame::TypingNotice));
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportCommand::Send(r#"{"typing":true}"#.to_string())
        );
    }

    #[test]
    fn handle_close_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = TransportHandle::new(1, tx);
        handle.mark_open();
        handle.close();
        handle.close();
        assert_eq!(handle.ready_state(), ReadyState::Closing);
        assert_eq!(rx.try_recv().unwrap(), TransportCommand::Close);
        assert!(rx.try_recv().is_err());
        assert!(!handle.send(&OutboundFrame::TypingNotice));
    }

    #[test]
    fn closed_handle_cannot_reopen() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handle = TransportHandle::new(1, tx);
        handle.mark_closed();
        handle.mark_open();
        assert_eq!(handle.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn ws_connector_reports_closed_on_refused_connection() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ep = Endpoints::new(&format!("http://127.0.0.1:{port}")).unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _handle = WsConnector.connect(
            ConnectRequest {
                id: 9,
                url: ep.websocket("1").unwrap(),
                origin: ep.origin(),
                cookie: None,
            },
            events_tx,
        );
        match events_rx.recv().await {
            Some(TransportEvent::Closed { id, reason }) => {
                assert_eq!(id, 9);
                assert!(reason.is_some());
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ws_connector_round_trip_against_loopback_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(r#"{"unread_count":2}"#.into()))
                .await
                .unwrap();
            // Echo the first client frame back, then close.
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Text(text) = msg {
                    ws.send(WsMessage::Text(text)).await.unwrap();
                    break;
                }
            }
            let _ = ws.close(None).await;
        });

        let ep = Endpoints::new(&format!("http://127.0.0.1:{port}")).unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut handle = WsConnector.connect(
            ConnectRequest {
                id: 1,
                url: ep.websocket("1").unwrap(),
                origin: ep.origin(),
                cookie: None,
            },
            events_tx,
        );

        assert_eq!(events_rx.recv().await, Some(TransportEvent::Opened { id: 1 }));
        handle.mark_open();
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::Frame {
                id: 1,
                text: r#"{"unread_count":2}"#.into()
            })
        );
        assert!(handle.send(&OutboundFrame::ChatMessageSend {
            message: "hi".into()
        }));
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::Frame {
                id: 1,
                text: r#"{"message":"hi"}"#.into()
            })
        );
        match events_rx.recv().await {
            Some(TransportEvent::Closed { id: 1, .. }) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        server.await.unwrap();
    }
}
