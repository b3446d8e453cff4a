//! Client for room-scoped real-time chat.
//!
//! A [`session::ChatSession`] keeps one WebSocket open to
//! `/ws/chat/<room>/`, reconnecting after every close, and applies inbound
//! frames to a [`view::ChatView`]. Text and typing notices go out over the
//! socket; files and voice clips are posted as multipart uploads.

pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod session;
pub mod terminal;
pub mod transport;
pub mod upload;
pub mod view;
pub mod voice;

pub use config::{ChatConfig, ReconnectPolicy};
pub use error::ChatError;
pub use frame::{parse_frame, InboundFrame, OutboundFrame};
pub use session::{ChatSession, Key, KeyOutcome, KeyPress, SessionEvent, SessionParams, UserAction};
pub use transport::{Connector, Endpoints, TransportEvent, WsConnector};
pub use upload::{PendingUpload, UploadReceipt, Uploader};
pub use view::{BubbleClass, ChatView, ConnectionState, Theme};
pub use voice::{AudioSource, CommandAudioSource, VoiceClip, VoiceRecorder};
