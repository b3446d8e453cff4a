//! The chat session: connection lifecycle, reconnect and typing timers,
//! inbound dispatch and the user's outbound actions.
//!
//! ## Design
//! - All session state lives in [`ChatSession`] and is mutated from one task.
//! - Connection tasks report back through an unbounded channel of
//!   [`TransportEvent`]s; events from a replaced connection are ignored.
//! - Timers are plain deadlines (`Option<Instant>`), so there is never more
//!   than one pending reconnect or typing-clear timer, and cancelling is
//!   setting the field to `None`.
//! - Uploads and recordings run on their own tasks and are handed back as
//!   [`PendingUpload`]s.
//!
//! ## Lifecycle
//! 1. `start(params)` closes any current transport, cancels a pending
//!    reconnect and opens a new connection.
//! 2. `Opened` marks the transport open and scrolls to the latest message.
//! 3. Each `Frame` is parsed and applied to the [`ChatView`].
//! 4. `Closed` schedules one reconnect per the [`ReconnectPolicy`]; when the
//!    policy gives up the view shows [`ConnectionState::Disconnected`].
//! 5. `stop()` tears everything down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ChatConfig, ReconnectPolicy};
use crate::error::ChatError;
use crate::frame::{parse_frame, OutboundFrame};
use crate::transport::{
    cookie_header, ConnectRequest, ConnectionId, Connector, Endpoints, TransportEvent,
    TransportHandle,
};
use crate::upload::{Attachment, PendingUpload, Uploader};
use crate::view::{ChatView, ConnectionState};
use crate::voice::{AudioSource, VoiceRecorder};

/// Identity a session is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub room_id: String,
    pub display_name: String,
    pub csrf_token: String,
}

/// Timing knobs of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub typing_idle: Duration,
    pub voice_clip: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &ChatConfig) -> Result<Self, ChatError> {
        Ok(Self {
            typing_idle: config.typing_idle(),
            voice_clip: config.voice_clip(),
            reconnect: config.reconnect_policy()?,
        })
    }
}

/// Something that happened and must be handled by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Transport(TransportEvent),
    ReconnectDue,
    TypingIdle,
}

/// Keys the session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    Escape,
    Char(char),
}

/// A key press, with the Shift modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub key: Key,
    pub shift: bool,
}

impl KeyPress {
    pub fn plain(key: Key) -> Self {
        Self { key, shift: false }
    }

    pub fn shifted(key: Key) -> Self {
        Self { key, shift: true }
    }
}

/// Whether the caller should still apply the key's default effect
/// (e.g. insert a newline for Shift+Enter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    PreventDefault,
    Default,
}

/// User input fed into [`ChatSession::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    Input(String),
    Key(KeyPress),
    SelectFiles(Vec<PathBuf>),
    SendFile,
    RecordVoice,
    ToggleTheme,
    ToggleProfile,
    CloseProfile,
    ScrollUp(usize),
    ScrollToLatest,
    Restart,
    Quit,
}

pub struct ChatSession {
    settings: SessionSettings,
    endpoints: Endpoints,
    session_id: Option<String>,
    connector: Arc<dyn Connector>,
    uploader: Uploader,
    recorder: VoiceRecorder,
    view: ChatView,
    params: Option<SessionParams>,
    transport: Option<TransportHandle>,
    next_connection_id: ConnectionId,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    typing_clear_at: Option<Instant>,
    selected_files: Vec<PathBuf>,
}

impl ChatSession {
    /// Build a session from configuration. Nothing connects until
    /// [`ChatSession::start`].
    pub fn new(
        config: &ChatConfig,
        connector: Arc<dyn Connector>,
        audio: Arc<dyn AudioSource>,
    ) -> Result<Self, ChatError> {
        let settings = SessionSettings::from_config(config)?;
        let endpoints = Endpoints::new(&config.origin)?;
        let uploader = Uploader::new(endpoints.clone(), config.session_id.clone());
        let recorder = VoiceRecorder::new(audio, settings.voice_clip);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            view: ChatView::new(config.display_name.clone(), config.theme),
            settings,
            endpoints,
            session_id: config.session_id.clone(),
            connector,
            uploader,
            recorder,
            params: None,
            transport: None,
            next_connection_id: 0,
            events_tx,
            events_rx,
            reconnect_at: None,
            reconnect_attempt: 0,
            typing_clear_at: None,
            selected_files: Vec::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn view(&self) -> &ChatView {
        &self.view
    }

    pub fn params(&self) -> Option<&SessionParams> {
        self.params.as_ref()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// True when the current transport has completed its handshake.
    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open())
    }

    pub fn transport_id(&self) -> Option<ConnectionId> {
        self.transport.as_ref().map(|t| t.id())
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn typing_clear_pending(&self) -> bool {
        self.typing_clear_at.is_some()
    }

    pub fn selected_files(&self) -> &[PathBuf] {
        &self.selected_files
    }

    // -----------------------------------------------------------------------
    // Connection manager
    // -----------------------------------------------------------------------

    /// Open the room's transport, replacing any existing one.
    ///
    /// An empty room id is ignored.
    pub fn start(&mut self, params: SessionParams) {
        if params.room_id.is_empty() {
            debug!("start ignored: no room id");
            return;
        }
        self.reconnect_attempt = 0;
        self.open_transport(params);
    }

    /// Close the transport and cancel both timers.
    pub fn stop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.params = None;
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.typing_clear_at = None;
        self.view.connection = ConnectionState::Idle;
    }

    fn open_transport(&mut self, params: SessionParams) {
        if let Some(mut old) = self.transport.take() {
            old.close();
        }
        self.reconnect_at = None;

        let url = match self.endpoints.websocket(&params.room_id) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, room = %params.room_id, "cannot build chat endpoint");
                return;
            }
        };

        self.next_connection_id += 1;
        let request = ConnectRequest {
            id: self.next_connection_id,
            url,
            origin: self.endpoints.origin(),
            cookie: cookie_header(&params.csrf_token, self.session_id.as_deref()),
        };
        info!(
            connection = request.id,
            room = %params.room_id,
            url = %request.url,
            "opening chat transport"
        );

        self.view.set_own_name(params.display_name.clone());
        self.view.connection = ConnectionState::Connecting;
        self.transport = Some(self.connector.connect(request, self.events_tx.clone()));
        self.params = Some(params);
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() || self.params.is_none() {
            return;
        }
        let attempt = self.reconnect_attempt.saturating_add(1);
        match self.settings.reconnect.delay_for(attempt) {
            Some(delay) => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "WS reconnect...");
                self.reconnect_attempt = attempt;
                self.reconnect_at = Some(Instant::now() + delay);
                self.view.connection = ConnectionState::Reconnecting { attempt, delay };
            }
            None => {
                warn!(
                    attempts = self.reconnect_attempt,
                    "reconnect attempts exhausted, giving up"
                );
                self.view.connection = ConnectionState::Disconnected;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    /// Wait for the next transport event or timer expiry.
    pub async fn next_event(&mut self) -> SessionEvent {
        let reconnect_at = self.reconnect_at;
        let typing_clear_at = self.typing_clear_at;
        tokio::select! {
            Some(event) = self.events_rx.recv() => SessionEvent::Transport(event),
            _ = sleep_until_opt(reconnect_at) => SessionEvent::ReconnectDue,
            _ = sleep_until_opt(typing_clear_at) => SessionEvent::TypingIdle,
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Transport(event) => self.handle_transport_event(event),
            SessionEvent::ReconnectDue => {
                if self.reconnect_at.take().is_none() {
                    return;
                }
                if let Some(params) = self.params.clone() {
                    self.open_transport(params);
                }
            }
            SessionEvent::TypingIdle => {
                if self.typing_clear_at.take().is_some() {
                    self.view.clear_typing();
                }
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(transport) = self.transport.as_mut().filter(|t| t.id() == event.id()) else {
            debug!(connection = event.id(), "ignoring event from replaced transport");
            return;
        };

        match event {
            TransportEvent::Opened { .. } => {
                transport.mark_open();
                self.reconnect_attempt = 0;
                self.view.connection = ConnectionState::Open;
                self.view.scroll_to_latest();
            }
            TransportEvent::Frame { text, .. } => match parse_frame(&text) {
                Some(frame) => {
                    let rule = self.view.apply_frame(frame);
                    debug!(?rule, "frame dispatched");
                }
                None => debug!(len = text.len(), "dropping malformed frame"),
            },
            TransportEvent::Closed { id, reason } => {
                transport.mark_closed();
                match reason {
                    Some(reason) => warn!(connection = id, %reason, "transport closed"),
                    None => info!(connection = id, "transport closed"),
                }
                self.schedule_reconnect();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outbound actions
    // -----------------------------------------------------------------------

    fn open_transport_ref(&self) -> Option<&TransportHandle> {
        self.transport.as_ref().filter(|t| t.is_open())
    }

    /// Record new input text. When connected, announces typing and re-arms
    /// the typing-clear timer.
    pub fn input_changed(&mut self, text: impl Into<String>) {
        self.view.input = text.into();
        let Some(transport) = self.open_transport_ref() else {
            return;
        };
        transport.send(&OutboundFrame::TypingNotice);
        self.typing_clear_at = Some(Instant::now() + self.settings.typing_idle);
    }

    /// Send the trimmed input as a chat message and clear it.
    ///
    /// Returns `false` without sending when the input is blank or the
    /// transport is not open.
    pub fn send_message(&mut self) -> bool {
        let text = self.view.input.trim();
        if text.is_empty() {
            return false;
        }
        let Some(transport) = self.open_transport_ref() else {
            return false;
        };
        let frame = OutboundFrame::ChatMessageSend {
            message: text.to_string(),
        };
        if !transport.send(&frame) {
            return false;
        }
        self.view.input.clear();
        true
    }

    /// Enter (without Shift) sends; Escape closes the profile drawer.
    pub fn key_down(&mut self, key: KeyPress) -> KeyOutcome {
        match key.key {
            Key::Enter if !key.shift => {
                self.send_message();
                KeyOutcome::PreventDefault
            }
            Key::Escape => {
                self.view.close_profile();
                KeyOutcome::Default
            }
            _ => KeyOutcome::Default,
        }
    }

    /// Replace the file selection.
    pub fn select_files(&mut self, paths: Vec<PathBuf>) {
        self.selected_files = paths;
    }

    /// Upload the first selected file and clear the selection.
    ///
    /// Returns `None` when nothing is selected or the session was never
    /// started.
    pub fn send_file(&mut self) -> Option<PendingUpload> {
        let path = self.selected_files.first().cloned()?;
        let params = self.params.clone()?;
        self.selected_files.clear();

        let uploader = self.uploader.clone();
        Some(PendingUpload::spawn("file", async move {
            let attachment = Attachment::from_path(&path).await?;
            uploader
                .upload_file(&params.room_id, &params.csrf_token, attachment)
                .await
        }))
    }

    /// Record a clip of the configured length and upload it.
    ///
    /// An unavailable audio source is logged as a warning and surfaces only
    /// through the returned upload's result.
    pub fn record_voice(&mut self) -> Option<PendingUpload> {
        let params = self.params.clone()?;
        let recorder = self.recorder.clone();
        let uploader = self.uploader.clone();
        Some(PendingUpload::spawn("voice", async move {
            let clip = match recorder.record().await {
                Ok(clip) => clip,
                Err(e) => {
                    warn!(error = %e, "Mic error");
                    return Err(e);
                }
            };
            uploader
                .upload_voice(&params.room_id, &params.csrf_token, clip)
                .await
        }))
    }

    pub fn toggle_theme(&mut self) {
        self.view.toggle_theme();
    }

    pub fn toggle_profile(&mut self) {
        self.view.toggle_profile();
    }

    pub fn close_profile(&mut self) {
        self.view.close_profile();
    }

    /// Apply one user action. Uploads started here are fire-and-forget.
    pub fn handle_action(&mut self, action: UserAction) {
        match action {
            UserAction::Input(text) => self.input_changed(text),
            UserAction::Key(key) => {
                self.key_down(key);
            }
            UserAction::SelectFiles(paths) => self.select_files(paths),
            UserAction::SendFile => {
                let _ = self.send_file();
            }
            UserAction::RecordVoice => {
                let _ = self.record_voice();
            }
            UserAction::ToggleTheme => self.toggle_theme(),
            UserAction::ToggleProfile => self.toggle_profile(),
            UserAction::CloseProfile => self.close_profile(),
            UserAction::ScrollUp(rows) => self.view.scroll_up(rows),
            UserAction::ScrollToLatest => self.view.scroll_to_latest(),
            UserAction::Restart => {
                if let Some(params) = self.params.clone() {
                    self.start(params);
                }
            }
            UserAction::Quit => self.stop(),
        }
    }

    /// Drive the session until `actions` closes or yields
    /// [`UserAction::Quit`]. `on_change` sees the view after every step.
    pub async fn run<F>(mut self, mut actions: mpsc::Receiver<UserAction>, mut on_change: F)
    where
        F: FnMut(&ChatView),
    {
        on_change(&self.view);
        loop {
            tokio::select! {
                event = self.next_event() => self.handle_event(event),
                action = actions.recv() => match action {
                    Some(UserAction::Quit) | None => break,
                    Some(action) => self.handle_action(action),
                },
            }
            on_change(&self.view);
        }
        self.stop();
        on_change(&self.view);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_press_constructors() {
        assert_eq!(
            KeyPress::plain(Key::Enter),
            KeyPress {
                key: Key::Enter,
                shift: false
            }
        );
        assert!(KeyPress::shifted(Key::Enter).shift);
    }

    #[test]
    fn settings_from_default_config() {
        let settings = SessionSettings::from_config(&ChatConfig::default()).unwrap();
        assert_eq!(settings.typing_idle, Duration::from_millis(1200));
        assert_eq!(settings.voice_clip, Duration::from_secs(4));
        assert_eq!(settings.reconnect, ReconnectPolicy::default());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_none_never_completes() {
        let res = tokio::time::timeout(Duration::from_secs(3600), sleep_until_opt(None)).await;
        assert!(res.is_err());
    }
}
