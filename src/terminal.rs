//! Incremental terminal output for a [`ChatView`].
//!
//! The session hands out whole view snapshots; a terminal can only append.
//! [`TerminalPainter`] remembers what it already printed and emits just the
//! new lines, then [`paint`] colours them for the current theme.

use colored::*;

use crate::view::{BubbleClass, ChatView, ConnectionState, LineStyle, RenderedLine, Theme};

/// How many bubbles to reprint when the user scrolls back.
pub const HISTORY_ROWS: usize = 10;

#[derive(Debug, Default)]
pub struct TerminalPainter {
    printed_messages: usize,
    last_status: Option<String>,
    last_badge: Option<String>,
    last_typing: String,
    last_scroll: Option<usize>,
    drawer_shown: bool,
}

impl TerminalPainter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines that changed since the previous call.
    pub fn diff(&mut self, view: &ChatView) -> Vec<RenderedLine> {
        let mut out = Vec::new();

        for line in view.render(HISTORY_ROWS) {
            match line.style {
                LineStyle::Status(_) => {
                    if self.last_status.as_deref() != Some(line.text.as_str()) {
                        self.last_status = Some(line.text.clone());
                        out.push(line);
                    }
                }
                LineStyle::Badge => {
                    if self.last_badge.as_deref() != Some(line.text.as_str()) {
                        self.last_badge = Some(line.text.clone());
                        out.push(line);
                    }
                }
                _ => {}
            }
        }
        if !view.badge.visible {
            self.last_badge = None;
        }

        // Scrolled back: reprint the window once per scroll position.
        if !view.is_scrolled_to_latest() {
            if self.last_scroll != Some(view.scroll_position) {
                self.last_scroll = Some(view.scroll_position);
                out.extend(
                    view.render(HISTORY_ROWS)
                        .into_iter()
                        .filter(|l| matches!(l.style, LineStyle::Bubble(_))),
                );
            }
        } else {
            self.last_scroll = None;
            if view.messages.len() > self.printed_messages {
                out.extend(
                    view.messages[self.printed_messages..]
                        .iter()
                        .map(RenderedLine::bubble),
                );
                self.printed_messages = view.messages.len();
            }
        }

        if view.typing_status != self.last_typing {
            self.last_typing = view.typing_status.clone();
            if !view.typing_status.is_empty() {
                out.push(RenderedLine::new(LineStyle::Typing, view.typing_status.clone()));
            }
        }

        if view.profile.drawer_active != self.drawer_shown {
            self.drawer_shown = view.profile.drawer_active;
            if self.drawer_shown {
                out.push(RenderedLine::new(
                    LineStyle::Drawer,
                    format!("profile: {}", view.own_name()),
                ));
            }
        }

        out
    }
}

/// Colour one line for `theme`.
pub fn paint(line: &RenderedLine, theme: Theme) -> String {
    let text = line.text.as_str();
    let styled = match line.style {
        LineStyle::Status(ConnectionState::Open) => text.green(),
        LineStyle::Status(ConnectionState::Reconnecting { .. }) => text.yellow(),
        LineStyle::Status(ConnectionState::Disconnected) => text.red().bold(),
        LineStyle::Status(_) => text.dimmed(),
        LineStyle::Badge => text.white().on_red().bold(),
        LineStyle::Bubble(BubbleClass::Me) => match theme {
            Theme::Light => text.blue(),
            Theme::Dark => text.bright_cyan(),
        },
        LineStyle::Bubble(BubbleClass::Other) => match theme {
            Theme::Light => text.normal(),
            Theme::Dark => text.bright_white(),
        },
        LineStyle::Typing => text.italic().dimmed(),
        LineStyle::Drawer => text.magenta(),
    };
    styled.to_string()
}
