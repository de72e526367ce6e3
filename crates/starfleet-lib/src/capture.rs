//! Microphone capture using cpal.
//!
//! `AudioCapture` reads the default input device and delivers 16 kHz mono
//! i16 samples regardless of the device's native format, rate or channel
//! count.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, error};

use starfleet_core::wav::SAMPLE_RATE;
use starfleet_core::{Error, Result};

pub struct AudioCapture {
    rx: mpsc::UnboundedReceiver<Vec<i16>>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioCapture {
    /// Open the default input device and start capturing.
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            Error::Capture("no microphone found, connect an audio input device".into())
        })?;

        let supported = device
            .default_input_config()
            .map_err(|e| Error::Capture(format!("failed to get input config: {e}")))?;

        let native_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        debug!(
            device = device.name().unwrap_or_default(),
            native_rate, channels, ?sample_format, "opening microphone"
        );

        let (tx, rx) = mpsc::unbounded_channel::<Vec<i16>>();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        // cpal Stream is !Send on macOS, so it lives on its own OS thread.
        let thread = std::thread::Builder::new()
            .name("starfleet-capture".into())
            .spawn(move || {
                let convert = move |interleaved: Vec<i16>| {
                    let mono = mix_to_mono(&interleaved, channels);
                    resample_linear(&mono, native_rate, SAMPLE_RATE)
                };
                let on_err = |err: cpal::StreamError| error!("capture stream error: {err}");

                let stream = match sample_format {
                    SampleFormat::I16 => {
                        let (tx, stop) = (tx.clone(), thread_stop.clone());
                        device.build_input_stream(
                            &config,
                            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                                if !stop.load(Ordering::Relaxed) {
                                    let _ = tx.send(convert(data.to_vec()));
                                }
                            },
                            on_err,
                            None,
                        )
                    }
                    SampleFormat::U16 => {
                        let (tx, stop) = (tx.clone(), thread_stop.clone());
                        device.build_input_stream(
                            &config,
                            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                                if !stop.load(Ordering::Relaxed) {
                                    let samples =
                                        data.iter().map(|&s| (i32::from(s) - 32768) as i16).collect();
                                    let _ = tx.send(convert(samples));
                                }
                            },
                            on_err,
                            None,
                        )
                    }
                    SampleFormat::F32 => {
                        let (tx, stop) = (tx.clone(), thread_stop.clone());
                        device.build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                if !stop.load(Ordering::Relaxed) {
                                    let samples = data
                                        .iter()
                                        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                                        .collect();
                                    let _ = tx.send(convert(samples));
                                }
                            },
                            on_err,
                            None,
                        )
                    }
                    other => {
                        let _ = ready_tx.send(Err(Error::Capture(format!(
                            "unsupported sample format: {other:?}"
                        ))));
                        return;
                    }
                };

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx
                            .send(Err(Error::Capture(format!("failed to build stream: {e}"))));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::Capture(format!("failed to start stream: {e}"))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::park();
                }
                // stream dropped here, which stops cpal
            })
            .map_err(|e| Error::Capture(format!("failed to spawn capture thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Capture("capture thread exited during startup".into()))??;

        Ok(Self {
            rx,
            stop,
            thread: Some(thread),
        })
    }

    /// Next batch of converted samples; `None` once the stream has ended.
    pub async fn next_samples(&mut self) -> Option<Vec<i16>> {
        self.rx.recv().await
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Sample conversion
// ---------------------------------------------------------------------------

/// Average interleaved channels down to mono.
fn mix_to_mono(input: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return input.to_vec();
    }
    let ch = usize::from(channels);
    input
        .chunks_exact(ch)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / i32::from(channels)) as i16
        })
        .collect()
}

/// Linear-interpolation resampler. Good enough for speech.
fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() || to_rate == 0 {
        return input.to_vec();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let output_len = (input.len() as f64 / ratio) as usize;
    (0..output_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            let s0 = f64::from(input[idx]);
            let s1 = input.get(idx + 1).map_or(s0, |&s| f64::from(s));
            (s0 + frac * (s1 - s0)) as i16
        })
        .collect()
}
