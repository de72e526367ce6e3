//! Spoken responses via the OpenAI speech endpoint.

use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use starfleet_core::text_prep::{MAX_SPEECH_INPUT, clean_text_for_speech, split_text};
use starfleet_core::{Error, Result};

use crate::config::OpenAiConfig;
use crate::player::AudioPlayer;

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    speed: f32,
}

#[derive(Clone)]
pub struct SpeechClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl SpeechClient {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Speech(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Synthesize one chunk of text to MP3 bytes.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let api_key = self.config.require_api_key()?;
        let body = SpeechRequest {
            model: &self.config.speech_model,
            input: text,
            voice: &self.config.voice,
            response_format: "mp3",
            speed: self.config.speed,
        };

        let resp = self
            .http
            .post(self.config.endpoint("audio/speech"))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Speech(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Speech(format!("speech API error ({status}): {body}")));
        }

        let mut audio = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Speech(format!("stream error: {e}")))?;
            audio.extend_from_slice(&chunk);
        }
        debug!(bytes = audio.len(), chars = text.len(), "synthesized speech");
        Ok(audio)
    }
}

/// Reads model answers aloud through the shared player.
#[derive(Clone)]
pub struct Speaker {
    client: SpeechClient,
    player: AudioPlayer,
}

impl Speaker {
    pub fn new(client: SpeechClient, player: AudioPlayer) -> Self {
        Self { client, player }
    }

    /// Speak `text` and wait for playback to finish.
    ///
    /// Chunks are synthesized in order and queued as they arrive, so the
    /// first sentence plays while the rest is still being fetched.
    pub async fn speak(&self, text: &str, cancel: &CancellationToken) -> Result<()> {
        let cleaned = clean_text_for_speech(text);
        if !cleaned.chars().any(char::is_alphanumeric) {
            return Ok(());
        }
        let chunks = split_text(&cleaned, MAX_SPEECH_INPUT);
        info!("speaking {} chunk(s)", chunks.len());

        for chunk in &chunks {
            let audio = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                audio = self.client.synthesize(chunk) => audio?,
            };
            self.player.play_mp3(audio);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.player.stop();
                Err(Error::Cancelled)
            }
            _ = self.player.wait_idle() => Ok(()),
        }
    }
}
