use std::sync::Arc;

use chatroom_client::cli::{parse_line, Args, COMMANDS_HELP};
use chatroom_client::config::ChatConfig;
use chatroom_client::session::{ChatSession, UserAction};
use chatroom_client::terminal::{paint, TerminalPainter};
use chatroom_client::transport::WsConnector;
use chatroom_client::voice::CommandAudioSource;
use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

/// Feed stdin lines into the session as actions. Closing stdin ends the
/// session.
async fn read_stdin(actions: mpsc::Sender<UserAction>) {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    while let Some(Ok(line)) = lines.next().await {
        match parse_line(&line) {
            Ok(parsed) => {
                for action in parsed {
                    if actions.send(action).await.is_err() {
                        return;
                    }
                }
            }
            Err(msg) => eprintln!("{}", msg.yellow()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so they do not interleave with the chat on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chatroom_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ChatConfig::load(path)?,
        None => ChatConfig::default(),
    };
    config.apply_env();
    args.apply_to(&mut config);
    config.validate()?;
    if config.room_id.is_empty() {
        return Err("no room given: pass ROOM or set room_id in the config file".into());
    }

    let audio = Arc::new(CommandAudioSource::from_command(&config.recorder_command)?);
    let mut session = ChatSession::new(&config, Arc::new(WsConnector), audio)?;
    session.start(config.session_params());

    eprintln!("{}", COMMANDS_HELP.dimmed());

    let (action_tx, action_rx) = mpsc::channel(64);
    tokio::spawn(read_stdin(action_tx));

    let mut painter = TerminalPainter::new();
    session
        .run(action_rx, |view| {
            for line in painter.diff(view) {
                println!("{}", paint(&line, view.theme));
            }
        })
        .await;

    Ok(())
}
