use std::path::PathBuf;

use clap::Parser;

use crate::config::ChatConfig;
use crate::session::{Key, KeyPress, UserAction};
use crate::view::Theme;

#[derive(Parser, Debug)]
#[command(name = "chatroom")]
#[command(version)]
#[command(about = "A terminal client for room-scoped WebSocket chat")]
pub struct Args {
    /// Room (chat) id to join
    pub room: Option<String>,

    /// Your display name in the room; your own messages are matched against it
    #[arg(long, short = 'n')]
    pub name: Option<String>,

    /// Site origin, e.g. https://chat.example.com (https selects wss)
    #[arg(long)]
    pub origin: Option<String>,

    /// Anti-forgery token sent as X-CSRFToken (or set CHAT_CSRF_TOKEN)
    #[arg(long)]
    pub csrf_token: Option<String>,

    /// Server session cookie value (or set CHAT_SESSION_ID)
    #[arg(long)]
    pub session_id: Option<String>,

    /// Path to a TOML config file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Start in this colour theme
    #[arg(long, value_enum)]
    pub theme: Option<Theme>,
}

impl Args {
    /// Overlay command-line values on `config`.
    pub fn apply_to(&self, config: &mut ChatConfig) {
        if let Some(room) = &self.room {
            config.room_id = room.clone();
        }
        if let Some(name) = &self.name {
            config.display_name = name.clone();
        }
        if let Some(origin) = &self.origin {
            config.origin = origin.clone();
        }
        if let Some(token) = &self.csrf_token {
            config.csrf_token = token.clone();
        }
        if let Some(session) = &self.session_id {
            config.session_id = Some(session.clone());
        }
        if let Some(theme) = self.theme {
            config.theme = theme;
        }
    }
}

/// Help text for the in-chat slash commands.
pub const COMMANDS_HELP: &str = "commands: /file <path>  /voice  /theme  /profile  /close  \
/up [n]  /down  /reconnect  /quit  (start a message with // to send a literal slash)";

/// Turn one line typed at the prompt into session actions.
///
/// Plain text is typed into the input and submitted with Enter. Lines
/// starting with `/` are commands; `//` escapes a leading slash.
pub fn parse_line(line: &str) -> Result<Vec<UserAction>, String> {
    if line.trim().is_empty() {
        return Ok(Vec::new());
    }
    if let Some(rest) = line.strip_prefix("//") {
        return Ok(type_and_submit(format!("/{rest}")));
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(type_and_submit(line.to_string()));
    };

    let mut words = command.split_whitespace();
    let name = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();
    let actions = match name {
        "file" => {
            if rest.is_empty() {
                return Err("usage: /file <path>".to_string());
            }
            let paths = rest.iter().map(PathBuf::from).collect();
            vec![UserAction::SelectFiles(paths), UserAction::SendFile]
        }
        "voice" => vec![UserAction::RecordVoice],
        "theme" => vec![UserAction::ToggleTheme],
        "profile" => vec![UserAction::ToggleProfile],
        "close" | "esc" => vec![UserAction::Key(KeyPress::plain(Key::Escape))],
        "up" => {
            let rows = match rest.first() {
                Some(n) => n
                    .parse()
                    .map_err(|_| format!("usage: /up [rows], got '{n}'"))?,
                None => crate::terminal::HISTORY_ROWS,
            };
            vec![UserAction::ScrollUp(rows)]
        }
        "down" => vec![UserAction::ScrollToLatest],
        "reconnect" => vec![UserAction::Restart],
        "quit" | "exit" => vec![UserAction::Quit],
        other => return Err(format!("unknown command '/{other}'; {COMMANDS_HELP}")),
    };
    Ok(actions)
}

fn type_and_submit(text: String) -> Vec<UserAction> {
    vec![
        UserAction::Input(text),
        UserAction::Key(KeyPress::plain(Key::Enter)),
    ]
}
