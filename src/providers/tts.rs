//! # Text-to-Speech Adapters
//!
//! Synthesizes reply text to audio bytes. Variants in priority order:
//!
//! 1. **Hosted voice** — named vendor voice with a configured voice id and
//!    output format
//! 2. **Offline engine** — a local command rendering speech to a temporary
//!    file, read back as bytes
//! 3. **Silent clip** — a fixed-duration silent WAV so the client always
//!    receives a terminal audio frame
//!
//! Synthesis failures are never fatal to a session: the chain either
//! substitutes the silent clip or reports no audio, and the session closes
//! normally either way.

use crate::config::TtsConfig;
use crate::pipeline::StageTimer;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// One text-to-speech backend variant.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Short variant name used in stage records and logs.
    fn name(&self) -> &'static str;

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Hosted voice synthesis (vendor HTTP API keyed by voice id).
pub struct HostedVoiceTts {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    voice_id: String,
    model: String,
    output_format: String,
}

impl HostedVoiceTts {
    pub fn new(config: &TtsConfig, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            api_key,
            voice_id: config.voice_id.clone(),
            model: config.model.clone(),
            output_format: config.output_format.clone(),
        }
    }
}

#[async_trait]
impl TtsBackend for HostedVoiceTts {
    fn name(&self) -> &'static str {
        "hosted"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.api_url.trim_end_matches('/'), self.voice_id);

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .header("xi-api-key", &self.api_key)
            .query(&[("output_format", self.output_format.as_str())])
            .json(&json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "hosted voice synthesis returned status {}",
                response.status()
            ));
        }

        let audio = response.bytes().await?.to_vec();
        if audio.is_empty() {
            return Err(anyhow!("hosted voice synthesis returned no audio"));
        }
        Ok(audio)
    }
}

/// Offline engine: a shell command that reads the text on stdin and renders
/// audio to the file path passed as `$1`; the file is read back as bytes.
pub struct OfflineEngineTts {
    command: String,
    timeout: Duration,
}

impl OfflineEngineTts {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl TtsBackend for OfflineEngineTts {
    fn name(&self) -> &'static str {
        "offline-engine"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let output_file = tempfile::NamedTempFile::new()
            .map_err(|e| anyhow!("failed to create synthesis temp file: {e}"))?;
        let output_path = output_file.path().to_path_buf();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .arg("tts-engine") // $0 for the command script
            .arg(&output_path) // $1: where the engine writes its audio
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn synthesis engine: {e}"))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open synthesis engine stdin"))?;
        stdin.write_all(text.as_bytes()).await?;
        drop(stdin);

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("synthesis engine timed out after {:?}", self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "synthesis engine failed (exit {:?}): {}",
                output.status.code(),
                stderr.trim()
            ));
        }

        let audio = tokio::fs::read(&output_path).await?;
        if audio.is_empty() {
            return Err(anyhow!("synthesis engine produced an empty file"));
        }
        Ok(audio)
    }
}

/// Build a silent 16-bit mono PCM WAV clip of the given duration.
///
/// Used as the last-resort synthesis result so the client's playback path
/// always receives a well-formed terminal audio frame.
pub fn silent_wav_clip(duration_ms: u64, sample_rate: u32) -> Vec<u8> {
    let samples = (sample_rate as u64 * duration_ms / 1000) as usize;
    let track = vec![0i16; samples];
    let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);

    let mut cursor = std::io::Cursor::new(Vec::new());
    match wav::write(header, &wav::BitDepth::Sixteen(track), &mut cursor) {
        Ok(()) => cursor.into_inner(),
        Err(e) => {
            // In-memory WAV encoding of zeroed samples cannot realistically
            // fail; degrade to no audio rather than panicking mid-session.
            warn!(error = %e, "silent clip encoding failed");
            Vec::new()
        }
    }
}

/// The ordered synthesis fallback chain.
pub struct TtsChain {
    backends: Vec<Box<dyn TtsBackend>>,
    silent_fallback: bool,
    silence_duration_ms: u64,
    silence_sample_rate: u32,
}

impl TtsChain {
    pub fn new(
        backends: Vec<Box<dyn TtsBackend>>,
        silent_fallback: bool,
        silence_duration_ms: u64,
        silence_sample_rate: u32,
    ) -> Self {
        Self {
            backends,
            silent_fallback,
            silence_duration_ms,
            silence_sample_rate,
        }
    }

    /// Variant names in attempt order (excluding the silent fallback).
    pub fn variant_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Run the chain: first variant producing audio bytes wins; the silent
    /// clip substitutes when everything fails (if enabled). `None` means the
    /// session proceeds without a terminal audio frame.
    pub async fn synthesize(&self, text: &str, stages: &mut StageTimer) -> Option<Vec<u8>> {
        if !text.trim().is_empty() {
            for backend in &self.backends {
                let stage = format!("tts:{}", backend.name());
                stages.start(&stage);

                match backend.synthesize(text).await {
                    Ok(audio) => {
                        debug!(backend = backend.name(), bytes = audio.len(), "audio synthesized");
                        stages.end(&stage, true, Some(&format!("bytes={}", audio.len())));
                        return Some(audio);
                    }
                    Err(e) => {
                        warn!(backend = backend.name(), error = %e, "synthesis backend failed");
                        stages.end(&stage, false, Some(&e.to_string()));
                    }
                }
            }
        }

        if self.silent_fallback {
            let clip = silent_wav_clip(self.silence_duration_ms, self.silence_sample_rate);
            if !clip.is_empty() {
                stages.start("tts:silent-fallback");
                stages.end(
                    "tts:silent-fallback",
                    true,
                    Some(&format!("bytes={}", clip.len())),
                );
                return Some(clip);
            }
        }

        None
    }
}

/// Build the chain from configuration.
pub fn build_tts_chain(config: &TtsConfig) -> TtsChain {
    let mut backends: Vec<Box<dyn TtsBackend>> = Vec::new();

    if let Some(key) = &config.api_key {
        backends.push(Box::new(HostedVoiceTts::new(config, key.clone())));
    }

    if let Some(command) = &config.engine_command {
        backends.push(Box::new(OfflineEngineTts::new(
            command.clone(),
            Duration::from_secs(config.engine_timeout_secs),
        )));
    }

    TtsChain::new(
        backends,
        config.silent_fallback,
        config.silence_duration_ms,
        config.silence_sample_rate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_clip_is_well_formed_wav() {
        let clip = silent_wav_clip(500, 22050);
        assert!(!clip.is_empty());

        let mut cursor = std::io::Cursor::new(clip);
        let (header, data) = wav::read(&mut cursor).expect("clip parses as WAV");
        assert_eq!(header.sampling_rate, 22050);
        assert_eq!(header.channel_count, 1);
        assert_eq!(header.bits_per_sample, 16);

        match data {
            wav::BitDepth::Sixteen(samples) => {
                assert_eq!(samples.len(), 22050 / 2); // 500 ms
                assert!(samples.iter().all(|&s| s == 0));
            }
            other => panic!("unexpected bit depth: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chain_substitutes_silent_clip() {
        let chain = TtsChain::new(Vec::new(), true, 500, 22050);
        let mut stages = StageTimer::new();
        let audio = chain.synthesize("hello", &mut stages).await;
        assert!(audio.is_some());
        assert_eq!(
            stages.snapshot().get("tts:silent-fallback").unwrap().success,
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_chain_without_fallback_reports_no_audio() {
        let chain = TtsChain::new(Vec::new(), false, 500, 22050);
        let mut stages = StageTimer::new();
        assert!(chain.synthesize("hello", &mut stages).await.is_none());
    }

    #[tokio::test]
    async fn test_offline_engine_reads_back_rendered_file() {
        let backend = OfflineEngineTts::new(
            r#"cat > /dev/null; printf 'rendered-audio' > "$1""#.to_string(),
            Duration::from_secs(5),
        );
        let audio = backend.synthesize("speak this").await.unwrap();
        assert_eq!(audio, b"rendered-audio");
    }

    #[tokio::test]
    async fn test_offline_engine_failure_is_error() {
        let backend = OfflineEngineTts::new("exit 2".to_string(), Duration::from_secs(5));
        assert!(backend.synthesize("speak this").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_engine_falls_through_to_silent_clip() {
        let chain = TtsChain::new(
            vec![Box::new(OfflineEngineTts::new(
                "exit 2".to_string(),
                Duration::from_secs(5),
            ))],
            true,
            250,
            22050,
        );
        let mut stages = StageTimer::new();
        let audio = chain.synthesize("hello", &mut stages).await;
        assert!(audio.is_some());

        let snapshot = stages.snapshot();
        assert_eq!(snapshot.get("tts:offline-engine").unwrap().success, Some(false));
        assert_eq!(snapshot.get("tts:silent-fallback").unwrap().success, Some(true));
    }
}
