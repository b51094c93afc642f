//! # Speech-to-Text Adapters
//!
//! Three transcription variants:
//!
//! - **Vendor streaming** — an outbound WebSocket to the vendor realtime
//!   endpoint. PCM chunks go out; partial/final transcript events come back
//!   on a provider-managed task and are pushed onto a channel the session
//!   coordinator drains. Session logic never runs on the provider task.
//! - **Vendor batch** — one HTTP call with a complete audio blob.
//! - **Offline simulator** — a deterministic stand-in that reveals the words
//!   of a fixed phrase paced by cumulative ingested-audio duration. Used when
//!   no vendor credential is configured, and as the in-session fallback when
//!   the vendor degrades mid-stream.
//!
//! ## Vendor realtime message shapes:
//! Incoming text frames are JSON with a `message_type` of `PartialTranscript`
//! or `FinalTranscript` and a `text` field; error frames carry an `error`
//! field. A `{"terminate_session": true}` text frame asks the vendor to
//! flush and close.

use crate::config::SimulatorConfig;
use crate::session::events::SttEvent;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Batch transcription of one complete audio blob.
#[async_trait]
pub trait BatchSttBackend: Send + Sync {
    /// Short variant name used in stage records and logs.
    fn name(&self) -> &'static str;

    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// Vendor batch transcription over HTTP: POST the audio bytes, read back
/// `{"text": ...}`.
pub struct VendorBatchStt {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl VendorBatchStt {
    pub fn new(url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            api_key,
        }
    }
}

#[async_trait]
impl BatchSttBackend for VendorBatchStt {
    fn name(&self) -> &'static str {
        "vendor"
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        if audio.is_empty() {
            return Ok(String::new());
        }

        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(60))
            .header("authorization", &self.api_key)
            .header("content-type", "application/octet-stream")
            .body(audio.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "batch transcription returned status {}",
                response.status()
            ));
        }

        let body: Value = response.json().await?;
        let text = body
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        debug!(len = text.len(), "batch transcription complete");
        Ok(text)
    }
}

/// Deterministic offline transcription simulator.
///
/// Reveals one word of the configured phrase for every `ms_per_word`
/// milliseconds of ingested audio, emitting the running prefix as partial
/// events. `finish` produces the complete phrase as the final transcript —
/// unless no audio was ever ingested, in which case the final is empty
/// ("no speech detected").
pub struct SimulatorStt {
    words: Vec<String>,
    ms_per_word: u64,
    revealed: usize,
    heard_audio: bool,
    finalized: bool,
}

impl SimulatorStt {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            words: config
                .phrase
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            ms_per_word: config.ms_per_word.max(1),
            revealed: 0,
            heard_audio: false,
            finalized: false,
        }
    }

    /// Advance the reveal clock to the given cumulative ingested-audio
    /// duration, returning any newly revealed partials.
    pub fn on_ingested(&mut self, total_ingested_ms: u64) -> Vec<SttEvent> {
        if self.finalized {
            return Vec::new();
        }
        if total_ingested_ms > 0 {
            self.heard_audio = true;
        }

        let target = ((total_ingested_ms / self.ms_per_word) as usize).min(self.words.len());
        let mut events = Vec::new();
        while self.revealed < target {
            self.revealed += 1;
            events.push(SttEvent::Partial(self.words[..self.revealed].join(" ")));
        }
        events
    }

    /// Finalize the stream. Returns `None` when already finalized.
    pub fn finish(&mut self) -> Option<SttEvent> {
        if self.finalized {
            return None;
        }
        self.finalized = true;

        let text = if self.heard_audio {
            self.words.join(" ")
        } else {
            String::new()
        };
        Some(SttEvent::Final(text))
    }

    /// The running partial prefix revealed so far.
    pub fn partial_text(&self) -> String {
        self.words[..self.revealed].join(" ")
    }
}

/// Command channel into the vendor streaming task.
enum VendorCommand {
    Audio(Vec<u8>),
    Finish,
}

/// Handle for feeding audio into a live vendor stream.
///
/// Sends are fire-and-forget: once the vendor task has exited (connection
/// closed or degraded) further sends are silently dropped, which matches the
/// fallthrough behavior the coordinator expects.
pub struct VendorStreamHandle {
    tx: UnboundedSender<VendorCommand>,
}

impl VendorStreamHandle {
    pub fn send_audio(&self, chunk: Vec<u8>) {
        let _ = self.tx.send(VendorCommand::Audio(chunk));
    }

    /// Handle with no live connection behind it; sends vanish.
    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Ask the vendor to flush pending transcripts and terminate.
    pub fn finish(&self) {
        let _ = self.tx.send(VendorCommand::Finish);
    }
}

/// Spawn the vendor realtime connection task.
///
/// Returns the audio handle plus the event channel the coordinator drains.
/// Connection failure surfaces as a `Fatal` event; mid-stream vendor errors
/// (including deprecated-model notices) surface as `Degraded` so the session
/// can fall back to the simulator and continue.
pub fn spawn_vendor_stream(
    url: String,
    api_key: String,
    sample_rate: u32,
) -> (VendorStreamHandle, UnboundedReceiver<SttEvent>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let full_url = format!("{url}?sample_rate={sample_rate}");

        let mut request = match full_url.clone().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                let _ = event_tx.send(SttEvent::Fatal(format!("invalid vendor url: {e}")));
                return;
            }
        };
        match HeaderValue::from_str(&api_key) {
            Ok(value) => {
                request.headers_mut().insert("authorization", value);
            }
            Err(e) => {
                let _ = event_tx.send(SttEvent::Fatal(format!("invalid vendor api key: {e}")));
                return;
            }
        }

        let (ws, _) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(e) => {
                let _ = event_tx.send(SttEvent::Fatal(format!(
                    "vendor handshake failed ({full_url}): {e}"
                )));
                return;
            }
        };
        debug!("vendor realtime stream connected");

        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(VendorCommand::Audio(chunk)) => {
                        if sink.send(Message::Binary(chunk)).await.is_err() {
                            warn!("vendor stream closed while sending audio");
                            break;
                        }
                    }
                    Some(VendorCommand::Finish) => {
                        let terminate = r#"{"terminate_session": true}"#.to_string();
                        let _ = sink.send(Message::Text(terminate)).await;
                    }
                    // Handle dropped: the session is gone
                    None => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !forward_vendor_message(&text, &event_tx) {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = event_tx.send(SttEvent::Degraded(format!(
                            "vendor stream error: {e}"
                        )));
                        break;
                    }
                },
            }
        }
    });

    (VendorStreamHandle { tx: cmd_tx }, event_rx)
}

/// Map one vendor JSON frame onto the session event channel.
///
/// Returns `false` when the stream should be torn down (terminated session
/// or a degradation the coordinator will recover from).
fn forward_vendor_message(text: &str, tx: &UnboundedSender<SttEvent>) -> bool {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        // Unparseable vendor frames are ignored, like malformed control frames
        Err(_) => return true,
    };

    if let Some(error) = value.get("error").and_then(Value::as_str) {
        let _ = tx.send(SttEvent::Degraded(error.to_string()));
        return false;
    }

    match value.get("message_type").and_then(Value::as_str) {
        Some("PartialTranscript") => {
            let transcript = value.get("text").and_then(Value::as_str).unwrap_or_default();
            if !transcript.trim().is_empty() {
                let _ = tx.send(SttEvent::Partial(transcript.trim().to_string()));
            }
            true
        }
        Some("FinalTranscript") => {
            let transcript = value.get("text").and_then(Value::as_str).unwrap_or_default();
            let _ = tx.send(SttEvent::Final(transcript.trim().to_string()));
            true
        }
        Some("SessionTerminated") => false,
        _ => true,
    }
}
