//! Voice clip capture.
//!
//! An [`AudioSource`] opens a capture that yields encoded audio chunks until
//! it is stopped. [`VoiceRecorder`] records one clip of at most
//! `clip_length`, stopping the capture itself if it is still running when the
//! window closes, and packages the chunks into a single [`VoiceClip`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use crate::error::ChatError;

/// Container/codec of uploaded clips.
pub const WEBM_MIME: &str = "audio/webm";

/// One recorded clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceClip {
    pub data: Vec<u8>,
    pub mime: &'static str,
    pub chunk_count: usize,
}

impl VoiceClip {
    /// Concatenate recorded chunks in arrival order.
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        let chunk_count = chunks.len();
        Self {
            data: chunks.concat(),
            mime: WEBM_MIME,
            chunk_count,
        }
    }

    pub fn file_name(&self) -> String {
        format!("voice-{}.webm", uuid::Uuid::new_v4())
    }
}

/// A running capture: a chunk stream plus a stop switch.
///
/// After [`AudioCapture::stop`] the source flushes what it has and then closes
/// the chunk channel. Dropping the capture also stops it.
#[derive(Debug)]
pub struct AudioCapture {
    chunks: mpsc::Receiver<Vec<u8>>,
    stop: Option<oneshot::Sender<()>>,
}

impl AudioCapture {
    pub fn new(chunks: mpsc::Receiver<Vec<u8>>, stop: oneshot::Sender<()>) -> Self {
        Self {
            chunks,
            stop: Some(stop),
        }
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    pub fn is_recording(&self) -> bool {
        self.stop.is_some()
    }

    /// Next chunk, or `None` once the source has finished.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.chunks.recv().await
    }
}

/// Something that can be recorded from, e.g. a microphone.
pub trait AudioSource: Send + Sync {
    /// Start capturing. Fails when the device or permission is unavailable.
    fn open(&self) -> Result<AudioCapture, ChatError>;
}

// ---------------------------------------------------------------------------
// Command-backed source
// ---------------------------------------------------------------------------

/// How long a stopped recorder gets to flush and exit before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Captures audio by running a program that writes an encoded stream to
/// stdout (ffmpeg, arecord piped through an encoder, ...).
///
/// On unix the program runs in its own process group. Stopping sends SIGTERM
/// to the whole group so encoders can write their trailer, then forwards the
/// rest of stdout. A group that is still running after the stop grace period
/// is killed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAudioSource {
    program: String,
    args: Vec<String>,
    stop_grace: Duration,
}

impl CommandAudioSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Build from `[program, args...]`.
    pub fn from_command(command: &[String]) -> Result<Self, ChatError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ChatError::Config("recorder_command is empty".into()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    /// Override how long a stopped recorder may keep running (default 2 s).
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

impl AudioSource for CommandAudioSource {
    fn open(&self) -> Result<AudioCapture, ChatError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| ChatError::AudioSource(format!("{}: {e}", self.program)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChatError::AudioSource("recorder stdout unavailable".into()))?;

        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(pump_recorder(
            child,
            stdout,
            chunk_tx,
            stop_rx,
            self.stop_grace,
        ));
        Ok(AudioCapture::new(chunk_rx, stop_tx))
    }
}

async fn pump_recorder(
    mut child: Child,
    mut stdout: ChildStdout,
    chunks: mpsc::Sender<Vec<u8>>,
    mut stop: oneshot::Receiver<()>,
    stop_grace: Duration,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if chunks.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            },
            _ = &mut stop => {
                request_stop(&mut child);
                let flushed =
                    tokio::time::timeout(stop_grace, forward_rest(&mut stdout, &chunks)).await;
                if flushed.is_err() {
                    warn!(
                        grace_ms = stop_grace.as_millis() as u64,
                        "recorder still running after stop, killing it"
                    );
                    force_kill(&mut child);
                }
                break;
            }
        }
    }
    // Close the chunk stream before reaping so `record` does not wait on the exit.
    drop(chunks);
    let _ = child.wait().await;
}

/// Forward stdout until EOF.
async fn forward_rest(stdout: &mut ChildStdout, chunks: &mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 4096];
    while let Ok(n) = stdout.read(&mut buf).await {
        if n == 0 || chunks.send(buf[..n].to_vec()).await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) -> bool {
    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, ?signal, error = %e, "signalling recorder group failed");
            false
        }
    }
}

/// Ask the recorder to finish its output and exit.
fn request_stop(child: &mut Child) {
    #[cfg(unix)]
    {
        if signal_group(child, Signal::SIGTERM) {
            return;
        }
    }
    let _ = child.start_kill();
}

fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    signal_group(child, Signal::SIGKILL);
    let _ = child.start_kill();
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Records fixed-length clips from an [`AudioSource`].
#[derive(Clone)]
pub struct VoiceRecorder {
    source: Arc<dyn AudioSource>,
    clip_length: Duration,
}

impl VoiceRecorder {
    pub fn new(source: Arc<dyn AudioSource>, clip_length: Duration) -> Self {
        Self {
            source,
            clip_length,
        }
    }

    /// Record one clip. Ends early if the source finishes on its own.
    pub async fn record(&self) -> Result<VoiceClip, ChatError> {
        let mut capture = self.source.open()?;
        let deadline = tokio::time::Instant::now() + self.clip_length;
        let mut chunks = Vec::new();

        loop {
            if capture.is_recording() {
                tokio::select! {
                    chunk = capture.next_chunk() => match chunk {
                        Some(chunk) => chunks.push(chunk),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!(clip_ms = self.clip_length.as_millis() as u64, "clip window elapsed, stopping recorder");
                        capture.stop();
                    }
                }
            } else {
                match capture.next_chunk().await {
                    Some(chunk) => chunks.push(chunk),
                    None => break,
                }
            }
        }

        if chunks.iter().all(|c| c.is_empty()) {
            return Err(ChatError::AudioSource("no audio captured".into()));
        }
        Ok(VoiceClip::from_chunks(chunks))
    }
}

impl std::fmt::Debug for VoiceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceRecorder")
            .field("clip_length", &self.clip_length)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits one chunk per `period` until stopped.
    struct TickingSource {
        period: Duration,
    }

    impl AudioSource for TickingSource {
        fn open(&self) -> Result<AudioCapture, ChatError> {
            let (tx, rx) = mpsc::channel(16);
            let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
            let period = self.period;
            tokio::spawn(async move {
                let mut n = 0u8;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(period) => {
                            n += 1;
                            if tx.send(vec![n]).await.is_err() {
                                break;
                            }
                        }
                        _ = &mut stop_rx => {
                            let _ = tx.send(vec![0xff]).await;
                            break;
                        }
                    }
                }
            });
            Ok(AudioCapture::new(rx, stop_tx))
        }
    }

    /// Emits the given chunks immediately and finishes.
    struct FiniteSource(Vec<Vec<u8>>);

    impl AudioSource for FiniteSource {
        fn open(&self) -> Result<AudioCapture, ChatError> {
            let (tx, rx) = mpsc::channel(16);
            let (stop_tx, _stop_rx) = oneshot::channel();
            for chunk in self.0.clone() {
                tx.try_send(chunk).unwrap();
            }
            Ok(AudioCapture::new(rx, stop_tx))
        }
    }

    struct DeniedSource;

    impl AudioSource for DeniedSource {
        fn open(&self) -> Result<AudioCapture, ChatError> {
            Err(ChatError::AudioSource("permission denied".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recording_stops_at_clip_window_and_keeps_final_chunk() {
        let recorder = VoiceRecorder::new(
            Arc::new(TickingSource {
                period: Duration::from_millis(1500),
            }),
            Duration::from_secs(4),
        );
        let started = tokio::time::Instant::now();
        let clip = recorder.record().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(clip.data, vec![1, 2, 0xff]);
        assert_eq!(clip.chunk_count, 3);
        assert_eq!(clip.mime, WEBM_MIME);
    }

    #[tokio::test(start_paused = true)]
    async fn recording_ends_early_when_source_finishes() {
        let recorder = VoiceRecorder::new(
            Arc::new(FiniteSource(vec![b"ab".to_vec(), b"cd".to_vec()])),
            Duration::from_secs(4),
        );
        let started = tokio::time::Instant::now();
        let clip = recorder.record().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(clip.data, b"abcd");
    }

    #[tokio::test]
    async fn denied_source_is_reported() {
        let recorder = VoiceRecorder::new(Arc::new(DeniedSource), Duration::from_secs(4));
        assert!(matches!(
            recorder.record().await,
            Err(ChatError::AudioSource(_))
        ));
    }

    #[tokio::test]
    async fn empty_capture_is_an_error() {
        let recorder = VoiceRecorder::new(Arc::new(FiniteSource(vec![])), Duration::from_secs(4));
        assert!(matches!(
            recorder.record().await,
            Err(ChatError::AudioSource(_))
        ));
    }

    #[test]
    fn clip_file_name_is_webm() {
        let clip = VoiceClip::from_chunks(vec![vec![1]]);
        let name = clip.file_name();
        assert!(name.starts_with("voice-") && name.ends_with(".webm"), "{name}");
    }

    #[test]
    fn from_command_requires_program() {
        assert!(matches!(
            CommandAudioSource::from_command(&[]),
            Err(ChatError::Config(_))
        ));
        let src = CommandAudioSource::from_command(&["ffmpeg".into(), "-i".into()]).unwrap();
        assert_eq!(src, CommandAudioSource::new("ffmpeg", vec!["-i".into()]));
        assert_eq!(src.stop_grace, DEFAULT_STOP_GRACE);
    }

    #[tokio::test]
    async fn missing_recorder_program_fails_to_open() {
        let src = CommandAudioSource::new("definitely-not-a-recorder-binary", vec![]);
        assert!(matches!(src.open(), Err(ChatError::AudioSource(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_source_streams_stdout() {
        let src = CommandAudioSource::new("sh", vec!["-c".into(), "printf webmdata".into()]);
        let recorder = VoiceRecorder::new(Arc::new(src), Duration::from_secs(10));
        let clip = recorder.record().await.unwrap();
        assert_eq!(clip.data, b"webmdata");
    }

    #[cfg(unix)]
    fn shell(script: &str) -> CommandAudioSource {
        CommandAudioSource::new("sh", vec!["-c".into(), script.into()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipeline_recorder_stops_at_clip_window() {
        // `cat` holds stdout open after `sh` exits unless the whole group stops.
        let recorder = VoiceRecorder::new(
            Arc::new(shell("printf HEAD; sleep 3 | cat")),
            Duration::from_millis(200),
        );
        let started = std::time::Instant::now();
        let clip = recorder.record().await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(1500),
            "took {:?}",
            started.elapsed()
        );
        assert_eq!(clip.data, b"HEAD");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stopped_recorder_flushes_its_tail() {
        let recorder = VoiceRecorder::new(
            Arc::new(shell(
                "trap 'printf TAIL; exit 0' INT TERM; printf HEAD; sleep 5 & wait",
            )),
            Duration::from_millis(300),
        );
        let started = std::time::Instant::now();
        let clip = recorder.record().await.unwrap();
        assert_eq!(clip.data, b"HEADTAIL");
        assert!(
            started.elapsed() < Duration::from_millis(1500),
            "took {:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn recorder_ignoring_stop_is_killed_after_grace() {
        let source = shell("trap '' TERM; printf HEAD; sleep 10")
            .stop_grace(Duration::from_millis(300));
        let recorder = VoiceRecorder::new(Arc::new(source), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let clip = recorder.record().await.unwrap();
        assert_eq!(clip.data, b"HEAD");
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
    }
}
