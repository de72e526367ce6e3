//! rodio `Source` fed with decoded PCM frames over a channel.
//!
//! The decoder thread sends one `PcmFrame` per MP3 frame, each carrying its
//! own channel count and sample rate, so format changes land on frame
//! boundaries. When no frame is ready within 10 ms a frame of silence is
//! produced to keep the output device fed. `Done`, a dropped sender or the
//! stop flag end iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use rodio::Source;

const UNDERRUN_WAIT: Duration = Duration::from_millis(10);

/// Interleaved i16 samples in a single format.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
}

pub enum PcmChunk {
    Frame(PcmFrame),
    /// No more frames will arrive.
    Done,
}

pub struct StreamingSource {
    rx: Receiver<PcmChunk>,
    frame: Vec<i16>,
    pos: usize,
    channels: u16,
    sample_rate: u32,
    finished: bool,
    stop: Arc<AtomicBool>,
}

impl StreamingSource {
    /// `first` should be the first decoded frame, so the sink never starts
    /// on an empty source.
    pub fn new(rx: Receiver<PcmChunk>, first: PcmFrame, stop: Arc<AtomicBool>) -> Self {
        Self {
            rx,
            channels: first.channels.max(1),
            sample_rate: first.sample_rate,
            frame: first.samples,
            pos: 0,
            finished: false,
            stop,
        }
    }

    fn load(&mut self, frame: PcmFrame) {
        self.channels = frame.channels.max(1);
        self.sample_rate = frame.sample_rate;
        self.frame = frame.samples;
        self.pos = 0;
    }

    fn silence(&mut self) {
        self.frame.clear();
        self.frame.resize(usize::from(self.channels), 0);
        self.pos = 0;
    }

    fn advance(&mut self) {
        let next = match self.rx.try_recv() {
            Ok(chunk) => Ok(chunk),
            Err(_) => self.rx.recv_timeout(UNDERRUN_WAIT),
        };
        match next {
            Ok(PcmChunk::Frame(frame)) => self.load(frame),
            Ok(PcmChunk::Done) | Err(RecvTimeoutError::Disconnected) => self.finished = true,
            Err(RecvTimeoutError::Timeout) => self.silence(),
        }
    }

    fn remaining(&self) -> usize {
        self.frame.len() - self.pos
    }
}

impl Iterator for StreamingSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(&sample) = self.frame.get(self.pos) {
                self.pos += 1;
                return Some(sample);
            }
            if self.finished {
                return None;
            }
            self.advance();
        }
    }
}

impl Source for StreamingSource {
    fn current_frame_len(&self) -> Option<usize> {
        match self.remaining() {
            0 if self.finished => Some(0),
            0 => Some(usize::from(self.channels)),
            n => Some(n),
        }
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}
