//! View-model for a chat session and its pure render step.
//!
//! [`ChatView`] holds everything the screen shows: unread badge, typing
//! status line, message bubbles, input text, theme, profile drawer and the
//! connection state. Inbound frames mutate it through [`ChatView::apply_frame`];
//! [`ChatView::render`] turns it into lines without touching any terminal.

use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::frame::InboundFrame;

/// Label shown on bubbles the local user sent.
pub const OWN_SENDER_LABEL: &str = "You";

// ---------------------------------------------------------------------------
// Small state types
// ---------------------------------------------------------------------------

/// Colour theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Theme::Light => write!(f, "light"),
            Theme::Dark => write!(f, "dark"),
        }
    }
}

/// Whose message a bubble shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BubbleClass {
    Me,
    Other,
}

/// One rendered chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBubble {
    pub class: BubbleClass,
    pub sender_label: String,
    /// Message text exactly as received. Not escaped or sanitized.
    pub content: String,
}

/// The unread-count badge. Hiding it leaves the last text in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadBadge {
    pub text: String,
    pub visible: bool,
}

/// Profile drawer and its overlay; toggled together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilePanel {
    pub drawer_active: bool,
    pub overlay_active: bool,
}

/// Connection lifecycle as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: the reconnect policy gave up.
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt, delay } => write!(
                f,
                "reconnecting in {:.1}s (attempt {})",
                delay.as_secs_f64(),
                attempt
            ),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Which dispatcher rule handled a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    UnreadCount,
    Typing,
    Message,
}

// ---------------------------------------------------------------------------
// ChatView
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatView {
    own_name: String,
    pub badge: UnreadBadge,
    pub typing_status: String,
    pub messages: Vec<MessageBubble>,
    /// Number of bubbles above the bottom edge of the viewport.
    pub scroll_position: usize,
    pub input: String,
    pub theme: Theme,
    pub profile: ProfilePanel,
    pub connection: ConnectionState,
}

impl ChatView {
    pub fn new(own_name: impl Into<String>, theme: Theme) -> Self {
        Self {
            own_name: own_name.into(),
            badge: UnreadBadge::default(),
            typing_status: String::new(),
            messages: Vec::new(),
            scroll_position: 0,
            input: String::new(),
            theme,
            profile: ProfilePanel::default(),
            connection: ConnectionState::Idle,
        }
    }

    pub fn own_name(&self) -> &str {
        &self.own_name
    }

    pub fn set_own_name(&mut self, name: impl Into<String>) {
        self.own_name = name.into();
    }

    /// Route a frame to its handler.
    pub fn apply_frame(&mut self, frame: InboundFrame) -> Dispatched {
        match frame {
            InboundFrame::UnreadCount { count } => {
                self.set_unread(count);
                Dispatched::UnreadCount
            }
            InboundFrame::Typing { username } => {
                self.typing_status = format!("{username} is typing...");
                Dispatched::Typing
            }
            InboundFrame::ChatMessage { username, message } => {
                self.clear_typing();
                self.append_message(&username, message.unwrap_or_default());
                self.scroll_to_latest();
                Dispatched::Message
            }
        }
    }

    /// Show `count` on the badge, or hide it (keeping the old text) on `None`.
    pub fn set_unread(&mut self, count: Option<String>) {
        match count {
            Some(text) => {
                self.badge.text = text;
                self.badge.visible = true;
            }
            None => self.badge.visible = false,
        }
    }

    pub fn clear_typing(&mut self) {
        self.typing_status.clear();
    }

    fn append_message(&mut self, username: &str, content: String) {
        let bubble = if username == self.own_name {
            MessageBubble {
                class: BubbleClass::Me,
                sender_label: OWN_SENDER_LABEL.to_string(),
                content,
            }
        } else {
            MessageBubble {
                class: BubbleClass::Other,
                sender_label: username.to_string(),
                content,
            }
        };
        self.messages.push(bubble);
    }

    pub fn scroll_to_latest(&mut self) {
        self.scroll_position = self.messages.len();
    }

    pub fn is_scrolled_to_latest(&self) -> bool {
        self.scroll_position == self.messages.len()
    }

    /// Scroll up by `rows` bubbles, stopping at the first one.
    pub fn scroll_up(&mut self, rows: usize) {
        self.scroll_position = self.scroll_position.saturating_sub(rows);
    }

    pub fn toggle_theme(&mut self) {
        self.theme = self.theme.toggled();
    }

    pub fn toggle_profile(&mut self) {
        self.profile.drawer_active = !self.profile.drawer_active;
        self.profile.overlay_active = !self.profile.overlay_active;
    }

    pub fn close_profile(&mut self) {
        self.profile = ProfilePanel::default();
    }

    /// Render the view into display lines, showing at most `viewport_rows`
    /// bubbles ending at the scroll position.
    pub fn render(&self, viewport_rows: usize) -> Vec<RenderedLine> {
        let mut lines = Vec::new();

        lines.push(RenderedLine::new(
            LineStyle::Status(self.connection),
            format!("[{}] {}", self.theme, self.connection),
        ));

        if self.badge.visible {
            lines.push(RenderedLine::new(
                LineStyle::Badge,
                format!("{} unread", self.badge.text),
            ));
        }

        let end = self.scroll_position.min(self.messages.len());
        let start = end.saturating_sub(viewport_rows);
        for bubble in &self.messages[start..end] {
            lines.push(RenderedLine::bubble(bubble));
        }

        if !self.typing_status.is_empty() {
            lines.push(RenderedLine::new(LineStyle::Typing, self.typing_status.clone()));
        }

        if self.profile.drawer_active {
            lines.push(RenderedLine::new(
                LineStyle::Drawer,
                format!("profile: {}", self.own_name),
            ));
        }

        lines
    }
}

/// How a rendered line should be styled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Status(ConnectionState),
    Badge,
    Bubble(BubbleClass),
    Typing,
    Drawer,
}

/// One display line produced by [`ChatView::render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedLine {
    pub style: LineStyle,
    pub text: String,
}

impl RenderedLine {
    pub fn new(style: LineStyle, text: String) -> Self {
        Self { style, text }
    }

    pub fn bubble(bubble: &MessageBubble) -> Self {
        Self {
            style: LineStyle::Bubble(bubble.class),
            text: format!("{}: {}", bubble.sender_label, bubble.content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::parse_frame;
    use proptest::prelude::*;

    fn view() -> ChatView {
        ChatView::new("bob", Theme::Light)
    }

    fn apply(view: &mut ChatView, text: &str) -> Option<Dispatched> {
        parse_frame(text).map(|f| view.apply_frame(f))
    }

    #[test]
    fn unread_three_shows_badge() {
        let mut v = view();
        assert_eq!(apply(&mut v, r#"{"unread_count":3}"#), Some(Dispatched::UnreadCount));
        assert!(v.badge.visible);
        assert_eq!(v.badge.text, "3");
    }

    #[test]
    fn fractional_unread_count_is_shown_as_sent() {
        let mut v = view();
        apply(&mut v, r#"{"unread_count":2.9}"#);
        assert!(v.badge.visible);
        assert_eq!(v.badge.text, "2.9");
    }

    #[test]
    fn unread_zero_hides_badge_but_keeps_text() {
        let mut v = view();
        apply(&mut v, r#"{"unread_count":5}"#);
        apply(&mut v, r#"{"unread_count":0}"#);
        assert!(!v.badge.visible);
        assert_eq!(v.badge.text, "5");
    }

    #[test]
    fn unread_frame_does_not_touch_messages_or_typing() {
        let mut v = view();
        apply(&mut v, r#"{"typing":true,"username":"alice"}"#);
        apply(&mut v, r#"{"unread_count":2}"#);
        assert!(v.messages.is_empty());
        assert_eq!(v.typing_status, "alice is typing...");
    }

    #[test]
    fn typing_sets_status_line() {
        let mut v = view();
        assert_eq!(apply(&mut v, r#"{"typing":true,"username":"alice"}"#), Some(Dispatched::Typing));
        assert_eq!(v.typing_status, "alice is typing...");
        assert!(v.messages.is_empty());
    }

    #[test]
    fn other_message_appends_other_bubble() {
        let mut v = view();
        apply(&mut v, r#"{"username":"alice","message":"hi"}"#);
        assert_eq!(
            v.messages,
            vec![MessageBubble {
                class: BubbleClass::Other,
                sender_label: "alice".into(),
                content: "hi".into(),
            }]
        );
        assert!(v.is_scrolled_to_latest());
    }

    #[test]
    fn own_message_is_labelled_you() {
        let mut v = view();
        apply(&mut v, r#"{"username":"bob","message":"hello"}"#);
        assert_eq!(v.messages[0].class, BubbleClass::Me);
        assert_eq!(v.messages[0].sender_label, OWN_SENDER_LABEL);
    }

    #[test]
    fn message_clears_typing_status() {
        let mut v = view();
        apply(&mut v, r#"{"typing":true,"username":"alice"}"#);
        apply(&mut v, r#"{"username":"alice","message":"done"}"#);
        assert!(v.typing_status.is_empty());
    }

    #[test]
    fn message_without_text_renders_empty_content() {
        let mut v = view();
        apply(&mut v, r#"{"username":"alice"}"#);
        assert_eq!(v.messages[0].content, "");
    }

    #[test]
    fn markup_in_content_is_not_escaped() {
        let mut v = view();
        apply(&mut v, r#"{"username":"eve","message":"<img src=x onerror=alert(1)>"}"#);
        assert_eq!(v.messages[0].content, "<img src=x onerror=alert(1)>");
    }

    #[test]
    fn toggles_are_independent_of_connection() {
        let mut v = view();
        v.toggle_theme();
        assert_eq!(v.theme, Theme::Dark);
        v.toggle_theme();
        assert_eq!(v.theme, Theme::Light);

        v.toggle_profile();
        assert!(v.profile.drawer_active && v.profile.overlay_active);
        v.toggle_profile();
        assert!(!v.profile.drawer_active && !v.profile.overlay_active);

        v.toggle_profile();
        v.close_profile();
        assert_eq!(v.profile, ProfilePanel::default());
        v.close_profile();
        assert_eq!(v.profile, ProfilePanel::default());
        assert_eq!(v.connection, ConnectionState::Idle);
    }

    #[test]
    fn render_shows_window_ending_at_scroll_position() {
        let mut v = view();
        for i in 0..5 {
            apply(&mut v, &format!(r#"{{"username":"alice","message":"m{i}"}}"#));
        }
        let bubbles: Vec<String> = v
            .render(2)
            .into_iter()
            .filter(|l| matches!(l.style, LineStyle::Bubble(_)))
            .map(|l| l.text)
            .collect();
        assert_eq!(bubbles, vec!["alice: m3", "alice: m4"]);

        v.scroll_up(2);
        let bubbles: Vec<String> = v
            .render(2)
            .into_iter()
            .filter(|l| matches!(l.style, LineStyle::Bubble(_)))
            .map(|l| l.text)
            .collect();
        assert_eq!(bubbles, vec!["alice: m1", "alice: m2"]);
    }

    #[test]
    fn render_includes_badge_typing_and_drawer() {
        let mut v = view();
        v.connection = ConnectionState::Open;
        apply(&mut v, r#"{"unread_count":4}"#);
        apply(&mut v, r#"{"typing":true,"username":"alice"}"#);
        v.toggle_profile();
        let lines = v.render(10);
        assert_eq!(lines[0].text, "[light] connected");
        assert!(lines.contains(&RenderedLine::new(LineStyle::Badge, "4 unread".into())));
        assert!(lines.contains(&RenderedLine::new(LineStyle::Typing, "alice is typing...".into())));
        assert!(lines.contains(&RenderedLine::new(LineStyle::Drawer, "profile: bob".into())));
    }

    #[test]
    fn render_hides_badge_when_zero() {
        let mut v = view();
        apply(&mut v, r#"{"unread_count":0}"#);
        assert!(!v.render(10).iter().any(|l| l.style == LineStyle::Badge));
    }

    #[test]
    fn connection_state_display() {
        let s = ConnectionState::Reconnecting {
            attempt: 2,
            delay: Duration::from_millis(1200),
        };
        assert_eq!(s.to_string(), "reconnecting in 1.2s (attempt 2)");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }

    proptest! {
        #[test]
        fn badge_visible_iff_count_positive(count in 0u64..1_000_000) {
            let mut v = view();
            v.apply_frame(InboundFrame::unread(count));
            prop_assert_eq!(v.badge.visible, count > 0);
            if count > 0 {
                prop_assert_eq!(v.badge.text.clone(), count.to_string());
            }
        }
    }
}
