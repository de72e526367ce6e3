//! Push-to-talk recorder.
//!
//! `start()` opens a sample source and collects into a buffer on a tokio
//! task; `stop()` ends the take and hands back the samples. The source is
//! pluggable so the state machine can be exercised without a microphone.
//! Opening blocks until the device is streaming, so it runs on the blocking
//! pool and the recorder reports busy meanwhile.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use starfleet_core::wav::{SAMPLE_RATE, compute_rms, duration_ms};
use starfleet_core::{Error, Result};

use crate::capture::AudioCapture;

/// How long `stop()` waits for the collector to hand over its buffer.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// A stream of 16 kHz mono sample batches.
#[async_trait]
pub trait SampleSource: Send {
    /// Next batch, or `None` when the source is exhausted.
    async fn next_samples(&mut self) -> Option<Vec<i16>>;
}

#[async_trait]
impl SampleSource for AudioCapture {
    async fn next_samples(&mut self) -> Option<Vec<i16>> {
        AudioCapture::next_samples(self).await
    }
}

#[async_trait]
impl SampleSource for mpsc::UnboundedReceiver<Vec<i16>> {
    async fn next_samples(&mut self) -> Option<Vec<i16>> {
        self.recv().await
    }
}

type SourceOpener = Arc<dyn Fn() -> Result<Box<dyn SampleSource>> + Send + Sync>;

struct Take {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Vec<i16>>,
}

enum Slot {
    Idle,
    /// Source is being opened by the start call with this ticket.
    Opening(u64),
    Recording(Take),
}

pub struct Recorder {
    open: SourceOpener,
    max_samples: usize,
    slot: Mutex<Slot>,
    tickets: AtomicU64,
    level: Arc<AtomicU32>,
}

impl Recorder {
    /// Recorder on the default microphone, capped at `max_record_secs`.
    pub fn new(max_record_secs: u64) -> Self {
        Self::with_source(max_record_secs, || {
            Ok(Box::new(AudioCapture::new()?) as Box<dyn SampleSource>)
        })
    }

    pub fn with_source(
        max_record_secs: u64,
        open: impl Fn() -> Result<Box<dyn SampleSource>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            open: Arc::new(open),
            max_samples: SAMPLE_RATE as usize * max_record_secs.max(1) as usize,
            slot: Mutex::new(Slot::Idle),
            tickets: AtomicU64::new(0),
            level: Arc::new(AtomicU32::new(0)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while a take is open or being opened.
    pub fn is_recording(&self) -> bool {
        !matches!(*self.slot(), Slot::Idle)
    }

    /// RMS level of the most recent batch, 0.0–1.0.
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Begin a take. A `discard()` while the source is still opening makes
    /// this return `Error::Cancelled`.
    pub async fn start(&self) -> Result<()> {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst);
        {
            let mut slot = self.slot();
            if !matches!(*slot, Slot::Idle) {
                return Err(Error::Busy);
            }
            *slot = Slot::Opening(ticket);
        }

        let open = self.open.clone();
        let opened = match tokio::task::spawn_blocking(move || open()).await {
            Ok(opened) => opened,
            Err(e) => Err(Error::Capture(format!("capture open task failed: {e}"))),
        };

        let mut slot = self.slot();
        if !matches!(*slot, Slot::Opening(t) if t == ticket) {
            debug!("recording discarded while opening");
            return Err(Error::Cancelled);
        }
        let mut source = match opened {
            Ok(source) => source,
            Err(e) => {
                *slot = Slot::Idle;
                return Err(e);
            }
        };
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let level = self.level.clone();
        let max_samples = self.max_samples;
        level.store(0f32.to_bits(), Ordering::Relaxed);

        let task = tokio::spawn(async move {
            let mut samples: Vec<i16> = Vec::with_capacity(SAMPLE_RATE as usize * 5);
            let mut capped = false;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    batch = source.next_samples() => match batch {
                        Some(batch) => {
                            level.store(compute_rms(&batch).to_bits(), Ordering::Relaxed);
                            let room = max_samples - samples.len();
                            if batch.len() > room && !capped {
                                capped = true;
                                warn!(
                                    "recording reached {} ms limit, dropping further audio",
                                    duration_ms(max_samples, SAMPLE_RATE)
                                );
                            }
                            samples.extend_from_slice(&batch[..batch.len().min(room)]);
                        }
                        None => {
                            debug!("sample source ended");
                            break;
                        }
                    },
                }
            }
            samples
        });

        *slot = Slot::Recording(Take { stop_tx, task });
        info!("recording started");
        Ok(())
    }

    /// End the take and return what was captured.
    pub async fn stop(&self) -> Result<Vec<i16>> {
        let Take { stop_tx, task } = {
            let mut slot = self.slot();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Recording(take) => take,
                other => {
                    *slot = other;
                    return Err(Error::NoRecording);
                }
            }
        };

        let _ = stop_tx.send(());
        let abort = task.abort_handle();
        let samples = match tokio::time::timeout(STOP_GRACE, task).await {
            Ok(Ok(samples)) => samples,
            Ok(Err(e)) => return Err(Error::Capture(format!("recorder task failed: {e}"))),
            Err(_) => {
                abort.abort();
                return Err(Error::Capture("recorder did not stop in time".into()));
            }
        };
        self.level.store(0f32.to_bits(), Ordering::Relaxed);

        if samples.is_empty() {
            warn!("no audio data recorded");
            return Err(Error::EmptyRecording);
        }
        info!(
            "recorded {} samples ({} ms, rms {:.3})",
            samples.len(),
            duration_ms(samples.len(), SAMPLE_RATE),
            compute_rms(&samples)
        );
        Ok(samples)
    }

    /// Drop the current take, if any, without returning audio.
    pub fn discard(&self) {
        let previous = std::mem::replace(&mut *self.slot(), Slot::Idle);
        if let Slot::Recording(take) = previous {
            let _ = take.stop_tx.send(());
            take.task.abort();
            debug!("recording discarded");
        }
    }
}
