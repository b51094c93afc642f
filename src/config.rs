//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! Provider credentials keep their historical environment variable names
//! (`ASSEMBLYAI_API_KEY`, `OPENAI_API_KEY`, `ELEVENLABS_API_KEY`, ...) so an
//! existing deployment's `.env` keeps working without translation.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known provider/deployment environment variables
//! 2. Environment variables with APP_ prefix
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The resulting `AppConfig` is validated once at startup and treated as
//! read-only afterwards; sessions take a snapshot when they are created, so
//! there is no hidden mutable provider state shared between connections.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub audio: AudioConfig,
    pub stt: SttConfig,
    pub simulator: SimulatorConfig,
    pub reply: ReplyConfig,
    pub tts: TtsConfig,
}

/// HTTP/WebSocket server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Shared-token authentication for the WebSocket endpoints.
///
/// When `ws_token` is unset every connection is accepted (development mode).
/// When set, clients must supply a matching `?token=` query parameter or the
/// connection is closed with the policy close code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub ws_token: Option<String>,

    /// Lifetime advertised for ephemeral development tokens issued by
    /// `POST /api/v1/token`
    pub token_ttl_seconds: u64,
}

/// Expected inbound audio format.
///
/// The streaming endpoint receives raw PCM in this format; the ingested-audio
/// duration clock (which paces the offline simulator) is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Samples per second (16000 for the vendor realtime API)
    pub sample_rate: u32,

    /// Channel count (mono expected)
    pub channels: u16,

    /// Bits per sample (16-bit little-endian PCM)
    pub bit_depth: u16,

    /// Bounded wait after a stop frame for in-flight vendor events to flush
    /// before the session is finalized with best-available data
    pub flush_timeout_ms: u64,
}

/// Speech-to-text provider selection.
///
/// With an API key configured the vendor backends are used; without one the
/// deterministic offline simulator takes over (and also serves as the
/// in-session fallback when the vendor degrades mid-stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub api_key: Option<String>,

    /// Vendor realtime WebSocket endpoint for the streaming variant
    pub streaming_url: String,

    /// Vendor HTTP endpoint for the batch variant; unset disables vendor
    /// batch transcription entirely
    pub batch_url: Option<String>,
}

/// Offline transcription simulator fixture.
///
/// The simulator reveals the words of `phrase` paced by cumulative ingested
/// audio duration, which keeps tests and credential-less development fully
/// deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// The complete transcript the simulator eventually produces
    pub phrase: String,

    /// Milliseconds of ingested audio required to reveal each word
    pub ms_per_word: u64,

    /// Wall-clock idle time (no inbound audio) after which a streaming
    /// session is finalized as if a stop frame had arrived
    pub idle_finalize_ms: u64,
}

/// Reply-generation chain configuration.
///
/// Variants are attempted in fixed priority order, each at most once per
/// call: local command, HTTP proxy, rule-based fallback, hosted chat
/// completion. A variant participates only when its settings are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// Shell command reading the transcript on stdin and writing the reply
    /// to stdout (`KLARVIA_MODEL_CMD`)
    pub command: Option<String>,

    /// Timeout for the local command, seconds
    pub command_timeout_secs: u64,

    /// Local model proxy endpoint accepting `{"text": ...}` (`AI_CHAT_URL`)
    pub proxy_url: Option<String>,

    /// Whether the in-process rule-based fallback participates in the chain
    pub rule_based_enabled: bool,

    /// Hosted chat completion credentials (`OPENAI_API_KEY`)
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,

    /// System prompt prepended to every hosted conversation
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Text-to-speech chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Hosted voice synthesis credentials (`ELEVENLABS_API_KEY`)
    pub api_key: Option<String>,
    pub api_url: String,
    pub voice_id: String,
    pub model: String,
    pub output_format: String,

    /// Offline engine: shell command reading text on stdin and writing
    /// rendered audio to the file path passed as its first argument
    pub engine_command: Option<String>,
    pub engine_timeout_secs: u64,

    /// Substitute a short silent clip when every synthesis variant fails,
    /// so the client always receives a terminal audio frame
    pub silent_fallback: bool,
    pub silence_duration_ms: u64,
    pub silence_sample_rate: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8001,
            },
            auth: AuthConfig {
                ws_token: None,
                token_ttl_seconds: 3600,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
                flush_timeout_ms: 300,
            },
            stt: SttConfig {
                api_key: None,
                streaming_url: "wss://api.assemblyai.com/v2/realtime/ws".to_string(),
                batch_url: None,
            },
            simulator: SimulatorConfig {
                phrase: "Hello Klarvia I have a headache".to_string(),
                ms_per_word: 350,
                idle_finalize_ms: 1200,
            },
            reply: ReplyConfig {
                command: None,
                command_timeout_secs: 30,
                proxy_url: None,
                rule_based_enabled: true,
                api_key: None,
                api_url: "https://api.openai.com/v1/chat/completions".to_string(),
                model: "gpt-4o-mini".to_string(),
                system_prompt: "You are Klarvia, a friendly and concise voice AI assistant. \
                                Answer clearly and keep responses short for text-to-speech."
                    .to_string(),
                max_tokens: 256,
                temperature: 0.6,
            },
            tts: TtsConfig {
                api_key: None,
                api_url: "https://api.elevenlabs.io/v1/text-to-speech".to_string(),
                voice_id: "Rachel".to_string(),
                model: "eleven_multilingual_v2".to_string(),
                output_format: "mp3".to_string(),
                engine_command: None,
                engine_timeout_secs: 30,
                silent_fallback: true,
                silence_duration_ms: 500,
                silence_sample_rate: 22050,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platform conventions
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // Historical provider variable names used by existing deployments
        for (var, key) in [
            ("WS_AUTH_TOKEN", "auth.ws_token"),
            ("ASSEMBLYAI_API_KEY", "stt.api_key"),
            ("KLARVIA_MODEL_CMD", "reply.command"),
            ("AI_CHAT_URL", "reply.proxy_url"),
            ("OPENAI_API_KEY", "reply.api_key"),
            ("OPENAI_MODEL", "reply.model"),
            ("ELEVENLABS_API_KEY", "tts.api_key"),
            ("ELEVENLABS_VOICE_ID", "tts.voice_id"),
            ("TTS_AUDIO_FORMAT", "tts.output_format"),
            ("SAMPLE_RATE", "audio.sample_rate"),
            ("CHANNELS", "audio.channels"),
        ] {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catches configuration errors at startup rather than mid-session.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.channels == 0 || self.audio.channels > 2 {
            return Err(anyhow::anyhow!("Audio channel count must be 1 or 2"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM input is supported (got {}-bit)",
                self.audio.bit_depth
            ));
        }

        if self.simulator.phrase.trim().is_empty() {
            return Err(anyhow::anyhow!("Simulator phrase cannot be empty"));
        }

        if self.simulator.ms_per_word == 0 {
            return Err(anyhow::anyhow!(
                "Simulator pacing must be greater than 0 ms per word"
            ));
        }

        if self.reply.command_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Reply command timeout must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.reply.temperature) {
            return Err(anyhow::anyhow!(
                "Reply temperature must be between 0.0 and 2.0"
            ));
        }

        if self.tts.silence_duration_ms == 0 || self.tts.silence_sample_rate == 0 {
            return Err(anyhow::anyhow!(
                "Silent fallback clip duration and sample rate must be greater than 0"
            ));
        }

        Ok(())
    }

    /// Name of the speech-to-text backend a new session would use.
    pub fn active_stt_backend(&self) -> &'static str {
        if self.stt.api_key.is_some() {
            "vendor"
        } else {
            "simulator"
        }
    }

    /// Name of the text-to-speech backend a new session would try first.
    pub fn active_tts_backend(&self) -> &'static str {
        if self.tts.api_key.is_some() {
            "hosted"
        } else if self.tts.engine_command.is_some() {
            "offline-engine"
        } else if self.tts.silent_fallback {
            "silent-fallback"
        } else {
            "disabled"
        }
    }

    /// Reply variants that would participate in the fallback chain, in
    /// priority order.
    pub fn reply_variants(&self) -> Vec<&'static str> {
        let mut variants = Vec::new();
        if self.reply.command.is_some() {
            variants.push("command");
        }
        if self.reply.proxy_url.is_some() {
            variants.push("proxy");
        }
        if self.reply.rule_based_enabled {
            variants.push("rule-based");
        }
        if self.reply.api_key.is_some() {
            variants.push("hosted-chat");
        }
        variants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8001);
        assert_eq!(config.audio.sample_rate, 16000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.bit_depth = 24;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.simulator.ms_per_word = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_selection_follows_credentials() {
        let mut config = AppConfig::default();
        assert_eq!(config.active_stt_backend(), "simulator");
        config.stt.api_key = Some("key".to_string());
        assert_eq!(config.active_stt_backend(), "vendor");

        let mut config = AppConfig::default();
        assert_eq!(config.active_tts_backend(), "silent-fallback");
        config.tts.engine_command = Some("espeak-pipe".to_string());
        assert_eq!(config.active_tts_backend(), "offline-engine");
        config.tts.api_key = Some("key".to_string());
        assert_eq!(config.active_tts_backend(), "hosted");
    }

    #[test]
    fn test_reply_variants_priority_order() {
        let mut config = AppConfig::default();
        config.reply.command = Some("cat".to_string());
        config.reply.proxy_url = Some("http://127.0.0.1:9000/chat".to_string());
        config.reply.api_key = Some("key".to_string());
        assert_eq!(
            config.reply_variants(),
            vec!["command", "proxy", "rule-based", "hosted-chat"]
        );

        config.reply.command = None;
        config.reply.rule_based_enabled = false;
        assert_eq!(config.reply_variants(), vec!["proxy", "hosted-chat"]);
    }
}
