//! Client configuration: TOML file, environment overrides and defaults.
//!
//! Precedence is CLI > environment > file > defaults. The CLI layer lives in
//! [`crate::cli`]; this module covers the other three.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::session::SessionParams;
use crate::view::Theme;

/// Environment variable holding the anti-forgery token.
pub const ENV_CSRF_TOKEN: &str = "CHAT_CSRF_TOKEN";
/// Environment variable holding the server session id cookie.
pub const ENV_SESSION_ID: &str = "CHAT_SESSION_ID";

/// Delay used by the fixed reconnect policy and the typing-clear timer.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1200;
pub const DEFAULT_TYPING_IDLE_MS: u64 = 1200;
pub const DEFAULT_VOICE_CLIP_MS: u64 = 4000;

// ---------------------------------------------------------------------------
// Reconnect policy
// ---------------------------------------------------------------------------

/// How the connection manager schedules reconnects after a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay every time, no attempt limit.
    Fixed { delay: Duration },
    /// `base * 2^(attempt-1)` capped at `max_delay`; gives up after
    /// `max_attempts` consecutive failures.
    CappedExponential {
        base: Duration,
        max_delay: Duration,
        max_attempts: u32,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// Returns `None` when the policy has run out of attempts and the session
    /// should give up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Fixed { delay } => Some(*delay),
            ReconnectPolicy::CappedExponential {
                base,
                max_delay,
                max_attempts,
            } => {
                if attempt == 0 || attempt > *max_attempts {
                    return None;
                }
                let exp = attempt.saturating_sub(1).min(20);
                let scaled = base.saturating_mul(1u32 << exp);
                Some(scaled.min(*max_delay))
            }
        }
    }
}

/// Which policy the `[reconnect]` section selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Fixed,
    CappedExponential,
}

/// The `[reconnect]` table as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub policy: PolicyKind,
    pub delay_ms: u64,
    pub base_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Fixed,
            delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            base_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectSection {
    /// Validate the section and turn it into a [`ReconnectPolicy`].
    pub fn to_policy(&self) -> Result<ReconnectPolicy, ChatError> {
        match self.policy {
            PolicyKind::Fixed => {
                if self.delay_ms == 0 {
                    return Err(ChatError::Config(
                        "reconnect.delay_ms must be greater than zero".into(),
                    ));
                }
                Ok(ReconnectPolicy::Fixed {
                    delay: Duration::from_millis(self.delay_ms),
                })
            }
            PolicyKind::CappedExponential => {
                if self.base_ms == 0 || self.max_attempts == 0 {
                    return Err(ChatError::Config(
                        "reconnect.base_ms and reconnect.max_attempts must be greater than zero"
                            .into(),
                    ));
                }
                if self.max_delay_ms < self.base_ms {
                    return Err(ChatError::Config(format!(
                        "reconnect.max_delay_ms ({}) is below reconnect.base_ms ({})",
                        self.max_delay_ms, self.base_ms
                    )));
                }
                Ok(ReconnectPolicy::CappedExponential {
                    base: Duration::from_millis(self.base_ms),
                    max_delay: Duration::from_millis(self.max_delay_ms),
                    max_attempts: self.max_attempts,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChatConfig
// ---------------------------------------------------------------------------

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Origin of the chat site, e.g. `https://chat.example.com`. Its scheme
    /// decides between `ws` and `wss`.
    pub origin: String,
    pub room_id: String,
    pub display_name: String,
    pub csrf_token: String,
    /// Value of the server's `sessionid` cookie, if the server needs one.
    pub session_id: Option<String>,
    pub theme: Theme,
    pub typing_idle_ms: u64,
    pub voice_clip_ms: u64,
    /// Program and arguments that write a webm audio stream to stdout.
    pub recorder_command: Vec<String>,
    pub reconnect: ReconnectSection,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            origin: "http://127.0.0.1:8000".to_string(),
            room_id: String::new(),
            display_name: String::new(),
            csrf_token: String::new(),
            session_id: None,
            theme: Theme::Light,
            typing_idle_ms: DEFAULT_TYPING_IDLE_MS,
            voice_clip_ms: DEFAULT_VOICE_CLIP_MS,
            recorder_command: default_recorder_command(),
            reconnect: ReconnectSection::default(),
        }
    }
}

/// ffmpeg capturing the default PulseAudio source as Opus-in-WebM on stdout.
/// ffmpeg writes the WebM trailer when it receives SIGTERM.
pub fn default_recorder_command() -> Vec<String> {
    [
        "ffmpeg", "-nostdin", "-loglevel", "error", "-f", "pulse", "-i", "default", "-c:a", "libopus",
        "-f", "webm", "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ChatConfig {
    /// Parse a configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ChatError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        let text = std::fs::read_to_string(path).map_err(|e| ChatError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup. Empty values are
    /// treated as unset.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_CSRF_TOKEN).filter(|v| !v.is_empty()) {
            self.csrf_token = token;
        }
        if let Some(session) = lookup(ENV_SESSION_ID).filter(|v| !v.is_empty()) {
            self.session_id = Some(session);
        }
    }

    /// Check the values a session cannot run without.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.display_name.trim().is_empty() {
            return Err(ChatError::Config("display_name must be set".into()));
        }
        if self.typing_idle_ms == 0 {
            return Err(ChatError::Config(
                "typing_idle_ms must be greater than zero".into(),
            ));
        }
        if self.voice_clip_ms == 0 {
            return Err(ChatError::Config(
                "voice_clip_ms must be greater than zero".into(),
            ));
        }
        crate::transport::Endpoints::new(&self.origin)?;
        self.reconnect.to_policy()?;
        Ok(())
    }

    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            room_id: self.room_id.clone(),
            display_name: self.display_name.clone(),
            csrf_token: self.csrf_token.clone(),
        }
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn voice_clip(&self) -> Duration {
        Duration::from_millis(self.voice_clip_ms)
    }

    pub fn reconnect_policy(&self) -> Result<ReconnectPolicy, ChatError> {
        self.reconnect.to_policy()
    }
}
