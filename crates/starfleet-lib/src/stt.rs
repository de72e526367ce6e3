//! Speech-to-text via the OpenAI transcription endpoint.

use std::time::Duration;

use tracing::{debug, info};

use starfleet_core::text_prep::normalize_transcript;
use starfleet_core::types::Transcript;
use starfleet_core::wav::{SAMPLE_RATE, duration_ms, parse_wav_header, write_wav};
use starfleet_core::{Error, Result};

use crate::config::OpenAiConfig;

#[derive(Clone)]
pub struct Transcriber {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl Transcriber {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Transcription(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Transcribe a complete WAV file.
    pub async fn transcribe_wav(&self, wav: &[u8]) -> Result<String> {
        let api_key = self.config.require_api_key()?;
        let header =
            parse_wav_header(wav).map_err(|e| Error::Transcription(format!("invalid WAV: {e}")))?;
        debug!(
            bytes = wav.len(),
            audio_ms = header.duration_ms(),
            model = %self.config.transcription_model,
            "sending audio for transcription"
        );

        let part = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("recording.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Transcription(format!("mime error: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.transcription_model.clone())
            .text("language", self.config.language.clone())
            .text("temperature", "0")
            .text("response_format", "text");

        let resp = self
            .http
            .post(self.config.endpoint("audio/transcriptions"))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transcription(format!("request failed: {e}")))?;

        let status = resp.status();
        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Transcription(format!("response read error: {e}")))?;
        if !status.is_success() {
            return Err(Error::Transcription(format!("transcription failed ({status}): {body}")));
        }

        let text = parse_transcription_body(&body, is_json)?;
        info!("transcribed: {text:?}");
        Ok(text)
    }

    /// Encode 16 kHz mono samples as WAV and transcribe them.
    pub async fn transcribe_samples(&self, samples: &[i16]) -> Result<Transcript> {
        if samples.is_empty() {
            return Err(Error::EmptyRecording);
        }
        let wav = write_wav(samples, SAMPLE_RATE);
        let text = self.transcribe_wav(&wav).await?;
        Ok(Transcript {
            text,
            duration_ms: Some(duration_ms(samples.len(), SAMPLE_RATE)),
        })
    }
}

/// Extract the transcript from a `text` or `json` response body.
fn parse_transcription_body(body: &str, is_json: bool) -> Result<String> {
    if !is_json {
        return Ok(normalize_transcript(body));
    }
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| Error::Transcription(format!("invalid JSON: {e}; raw={body}")))?;
    let raw = value.get("text").and_then(|v| v.as_str()).unwrap_or("");
    Ok(normalize_transcript(raw))
}
