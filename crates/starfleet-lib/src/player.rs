//! Audio player — MP3/WAV clips → rodio playback thread.
//!
//! ```text
//! play_mp3(bytes) → decoder thread: minimp3 frames → StreamingSource
//!     → [PlayCmd::Append] → playback thread: Sink (gapless, in order)
//! ```
//!
//! Epoch-based interruption: `stop()` bumps an [`AtomicU64`] so decoder
//! threads of earlier clips stop feeding, raises the halt flag shared by
//! their sources, and resets the sink. Audio failures are logged and never
//! surface as errors.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rodio::{OutputStream, Sink, Source};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use starfleet_core::types::PlayerState;

use crate::streaming_source::{PcmChunk, PcmFrame, StreamingSource};

/// How often the playback thread checks whether the sink drained.
const IDLE_POLL: Duration = Duration::from_millis(50);

type BoxedSource = Box<dyn Source<Item = i16> + Send>;

enum PlayCmd {
    Append(BoxedSource),
    Stop,
}

/// Cloneable handle to the playback thread.
#[derive(Clone)]
pub struct AudioPlayer {
    cmd_tx: std::sync::mpsc::Sender<PlayCmd>,
    state_rx: watch::Receiver<PlayerState>,
    epoch: Arc<AtomicU64>,
    halt: Arc<Mutex<Arc<AtomicBool>>>,
    /// Clips submitted but not yet handed to the sink.
    pending: Arc<AtomicUsize>,
    cue: Option<std::path::PathBuf>,
}

impl AudioPlayer {
    /// Spawn the playback thread. Without an output device the player
    /// accepts and discards clips.
    pub fn new(cue: Option<std::path::PathBuf>) -> Self {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<PlayCmd>();
        let (state_tx, state_rx) = watch::channel(PlayerState::Idle);
        let pending = Arc::new(AtomicUsize::new(0));

        let thread_pending = pending.clone();
        let spawned = std::thread::Builder::new()
            .name("starfleet-playback".into())
            .spawn(move || playback_thread(cmd_rx, state_tx, thread_pending));
        if let Err(e) = spawned {
            error!("failed to spawn playback thread: {e}");
        }

        Self {
            cmd_tx,
            state_rx,
            epoch: Arc::new(AtomicU64::new(0)),
            halt: Arc::new(Mutex::new(Arc::new(AtomicBool::new(false)))),
            pending,
            cue,
        }
    }

    /// Queue an MP3 clip. Decoding runs on its own thread.
    pub fn play_mp3(&self, bytes: Vec<u8>) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let current_epoch = self.epoch.clone();
        let halt = self.halt.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let cmd_tx = self.cmd_tx.clone();
        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::SeqCst);

        let spawned = std::thread::Builder::new()
            .name("starfleet-mp3".into())
            .spawn(move || {
                let mut frame_tx: Option<std::sync::mpsc::Sender<PcmChunk>> = None;
                let mut queued = false;
                let decoded = decode_mp3(&bytes, |frame| {
                    if current_epoch.load(Ordering::SeqCst) != epoch {
                        return false;
                    }
                    if let Some(tx) = &frame_tx {
                        return tx.send(PcmChunk::Frame(frame)).is_ok();
                    }
                    let (tx, rx) = std::sync::mpsc::channel();
                    let source = StreamingSource::new(rx, frame, halt.clone());
                    queued = cmd_tx.send(PlayCmd::Append(Box::new(source))).is_ok();
                    frame_tx = Some(tx);
                    queued
                });

                match decoded {
                    Ok(0) => warn!("mp3 clip contained no audio frames"),
                    Ok(frames) => debug!("decoded {frames} mp3 frames"),
                    Err(e) => warn!("mp3 clip skipped: {e}"),
                }
                if let Some(tx) = frame_tx {
                    let _ = tx.send(PcmChunk::Done);
                }
                if !queued {
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn mp3 decoder: {e}");
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Play an `.mp3` or `.wav` file. Unreadable files are logged and skipped.
    pub fn play_file(&self, path: &Path) {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!("cannot play {}: {e}", path.display());
                return;
            }
        };
        let is_mp3 = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
        if is_mp3 {
            self.play_mp3(bytes);
            return;
        }

        match rodio::Decoder::new(Cursor::new(bytes)) {
            Ok(decoder) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                if self.cmd_tx.send(PlayCmd::Append(Box::new(decoder))).is_err() {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Err(e) => warn!("cannot decode {}: {e}", path.display()),
        }
    }

    /// Play the "working" cue, if one is configured.
    pub fn play_cue(&self) {
        if let Some(cue) = &self.cue {
            self.play_file(cue);
        }
    }

    /// Interrupt everything queued or playing.
    pub fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut halt = self.halt.lock().unwrap_or_else(|e| e.into_inner());
            halt.store(true, Ordering::SeqCst);
            *halt = Arc::new(AtomicBool::new(false));
        }
        let _ = self.cmd_tx.send(PlayCmd::Stop);
    }

    pub fn state(&self) -> PlayerState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state_rx.clone()
    }

    /// Resolve once nothing is queued or playing.
    pub async fn wait_idle(&self) {
        loop {
            if self.pending.load(Ordering::SeqCst) == 0 && self.state() == PlayerState::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Decode MP3 bytes frame by frame. `emit` returns false to stop early.
///
/// Errors before the first frame are returned; later ones end the clip.
fn decode_mp3(
    bytes: &[u8],
    mut emit: impl FnMut(PcmFrame) -> bool,
) -> std::result::Result<usize, minimp3::Error> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut frames = 0usize;
    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                frames += 1;
                let keep_going = emit(PcmFrame {
                    samples: frame.data,
                    channels: frame.channels as u16,
                    sample_rate: frame.sample_rate as u32,
                });
                if !keep_going {
                    break;
                }
            }
            Err(minimp3::Error::Eof) | Err(minimp3::Error::InsufficientData) => break,
            Err(minimp3::Error::SkippedData) => continue,
            Err(e) if frames > 0 => {
                warn!("mp3 decode stopped after {frames} frames: {e}");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(frames)
}

// ─── Playback thread ───────────────────────────────────────────────────────

fn playback_thread(
    cmd_rx: std::sync::mpsc::Receiver<PlayCmd>,
    state_tx: watch::Sender<PlayerState>,
    pending: Arc<AtomicUsize>,
) {
    // OutputStream is !Send, so it lives and dies on this thread.
    let opened = OutputStream::try_default()
        .map_err(|e| e.to_string())
        .and_then(|(stream, handle)| {
            Sink::try_new(&handle)
                .map(|sink| (stream, handle, sink))
                .map_err(|e| e.to_string())
        });
    let (_stream, handle, mut sink) = match opened {
        Ok(parts) => parts,
        Err(e) => {
            error!("playback: no audio output ({e}); sounds are disabled");
            discard_commands(cmd_rx, &pending);
            return;
        }
    };

    loop {
        match cmd_rx.recv_timeout(IDLE_POLL) {
            Ok(PlayCmd::Append(source)) => {
                sink.append(source);
                set_state(&state_tx, PlayerState::Playing);
                pending.fetch_sub(1, Ordering::SeqCst);
                debug!("playback: clip appended");
            }
            Ok(PlayCmd::Stop) => {
                sink.stop();
                sink = match Sink::try_new(&handle) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("playback: failed to recreate sink: {e}");
                        set_state(&state_tx, PlayerState::Idle);
                        discard_commands(cmd_rx, &pending);
                        return;
                    }
                };
                debug!("playback: stopped");
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                sink.stop();
                break;
            }
        }
        if sink.empty() {
            set_state(&state_tx, PlayerState::Idle);
        }
    }
}

/// Keep accounting for clips when there is nothing to play them on.
fn discard_commands(cmd_rx: std::sync::mpsc::Receiver<PlayCmd>, pending: &AtomicUsize) {
    for cmd in cmd_rx {
        if let PlayCmd::Append(_) = cmd {
            pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn set_state(tx: &watch::Sender<PlayerState>, state: PlayerState) {
    tx.send_if_modified(|s| {
        if *s == state {
            false
        } else {
            *s = state;
            true
        }
    });
}
