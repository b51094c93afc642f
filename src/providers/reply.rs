//! # Reply Generation Adapters
//!
//! Turns a final transcript into assistant reply text. Several backends are
//! supported, tried in a fixed priority order with fallthrough:
//!
//! 1. **Local command** — an externally configured shell command, transcript
//!    on stdin, reply on stdout, bounded by a timeout
//! 2. **HTTP proxy** — a local model proxy accepting `{"text": ...}`
//! 3. **Rule-based** — in-process canned replies, always available
//! 4. **Hosted chat** — an OpenAI-style chat completion with accumulated
//!    message history and a fixed system prompt
//!
//! Each variant is attempted at most once per call (fallthrough, not retry).
//! The first variant producing non-empty text wins; if every variant fails
//! the chain returns the empty string and the caller substitutes an echo or
//! apology reply.

use crate::config::ReplyConfig;
use crate::pipeline::StageTimer;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// One reply-generation backend variant.
#[async_trait]
pub trait ReplyBackend: Send + Sync {
    /// Short variant name used in stage records and logs.
    fn name(&self) -> &'static str;

    /// Generate a reply for the given transcript. An `Ok` with empty text is
    /// treated as a failed attempt by the chain.
    async fn reply(&self, text: &str) -> Result<String>;
}

/// Runs the configured local model command with the transcript on stdin.
///
/// The command is executed through `sh -c`, matching how deployments specify
/// it (`KLARVIA_MODEL_CMD="python run_infer.py --flag"`). Non-zero exit or
/// timeout counts as failure.
pub struct LocalCommandReply {
    command: String,
    timeout: Duration,
}

impl LocalCommandReply {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl ReplyBackend for LocalCommandReply {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn reply(&self, text: &str) -> Result<String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn reply command: {e}"))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open reply command stdin"))?;
        stdin.write_all(text.as_bytes()).await?;
        drop(stdin); // close stdin to signal EOF

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("reply command timed out after {:?}", self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "reply command failed (exit {:?}): {}",
                output.status.code(),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// POSTs the transcript to a local model proxy endpoint.
///
/// Accepts several response shapes for compatibility with existing proxies:
/// a JSON object with a `reply`, `text`, or `output` field, a bare JSON
/// string, or a plain-text body.
pub struct HttpProxyReply {
    url: String,
    client: reqwest::Client,
}

impl HttpProxyReply {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ReplyBackend for HttpProxyReply {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn reply(&self, text: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(30))
            .json(&json!({ "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "reply proxy returned status {}",
                response.status()
            ));
        }

        let body = response.text().await?;
        let reply = match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(map)) => ["reply", "text", "output"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default(),
            Ok(Value::String(s)) => s,
            _ => body,
        };

        Ok(reply.trim().to_string())
    }
}

/// In-process rule-based fallback. Always produces a reply, so any variant
/// below it in the chain is only reached when it is disabled.
pub struct RuleBasedReply;

#[async_trait]
impl ReplyBackend for RuleBasedReply {
    fn name(&self) -> &'static str {
        "rule-based"
    }

    async fn reply(&self, text: &str) -> Result<String> {
        let lower = text.to_lowercase();
        let reply = if ["hi", "hello", "hey"].iter().any(|k| lower.contains(k)) {
            "Hi, I'm Klarvia. How are you feeling right now?".to_string()
        } else if lower.contains("help") || lower.contains("support") {
            "I'm here with you. What's been feeling heaviest lately?".to_string()
        } else {
            format!("You said: '{text}'. Tell me more about that.")
        };
        Ok(reply)
    }
}

/// Hosted chat completion with per-session message history.
///
/// The history starts with the configured system prompt; each successful
/// exchange appends the user and assistant turns so follow-up questions keep
/// their context for the lifetime of the session.
pub struct HostedChatReply {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    history: Mutex<Vec<Value>>,
}

impl HostedChatReply {
    pub fn new(config: &ReplyConfig, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            history: Mutex::new(vec![json!({
                "role": "system",
                "content": config.system_prompt,
            })]),
        }
    }
}

#[async_trait]
impl ReplyBackend for HostedChatReply {
    fn name(&self) -> &'static str {
        "hosted-chat"
    }

    async fn reply(&self, text: &str) -> Result<String> {
        // Build the payload without holding the lock across the request
        let messages = {
            let mut history = self.history.lock().unwrap();
            history.push(json!({ "role": "user", "content": text }));
            history.clone()
        };

        let payload = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(&self.api_url)
            .timeout(Duration::from_secs(30))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "hosted chat returned status {}",
                response.status()
            ));
        }

        let body: Value = response.json().await?;
        let reply = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        if !reply.is_empty() {
            let mut history = self.history.lock().unwrap();
            history.push(json!({ "role": "assistant", "content": reply }));
        }

        Ok(reply)
    }
}

/// The ordered reply fallback chain.
pub struct ReplyChain {
    backends: Vec<Box<dyn ReplyBackend>>,
}

impl ReplyChain {
    pub fn new(backends: Vec<Box<dyn ReplyBackend>>) -> Self {
        Self { backends }
    }

    /// Variant names in attempt order.
    pub fn variant_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Run the chain: first non-empty reply wins, every attempt is timed.
    ///
    /// Returns the empty string when the input is empty or every variant
    /// fails; the caller decides on the echo/apology substitution.
    pub async fn generate(&self, text: &str, stages: &mut StageTimer) -> String {
        if text.trim().is_empty() {
            return String::new();
        }

        for backend in &self.backends {
            let stage = format!("reply:{}", backend.name());
            stages.start(&stage);

            match backend.reply(text).await {
                Ok(reply) if !reply.trim().is_empty() => {
                    debug!(backend = backend.name(), len = reply.len(), "reply generated");
                    stages.end(&stage, true, Some(&format!("len={}", reply.len())));
                    return reply.trim().to_string();
                }
                Ok(_) => {
                    stages.end(&stage, false, Some("empty reply"));
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "reply backend failed");
                    stages.end(&stage, false, Some(&e.to_string()));
                }
            }
        }

        String::new()
    }
}

/// Build the chain from configuration. Variant order is fixed; presence of
/// each variant's settings decides participation.
pub fn build_reply_chain(config: &ReplyConfig) -> ReplyChain {
    let mut backends: Vec<Box<dyn ReplyBackend>> = Vec::new();

    if let Some(command) = &config.command {
        backends.push(Box::new(LocalCommandReply::new(
            command.clone(),
            Duration::from_secs(config.command_timeout_secs),
        )));
    }

    if let Some(url) = &config.proxy_url {
        backends.push(Box::new(HttpProxyReply::new(url.clone())));
    }

    if config.rule_based_enabled {
        backends.push(Box::new(RuleBasedReply));
    }

    if let Some(key) = &config.api_key {
        backends.push(Box::new(HostedChatReply::new(config, key.clone())));
    }

    ReplyChain::new(backends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rule_based_greeting() {
        let backend = RuleBasedReply;
        let reply = backend.reply("hello there").await.unwrap();
        assert!(reply.contains("Klarvia"));
    }

    #[tokio::test]
    async fn test_rule_based_echo() {
        let backend = RuleBasedReply;
        let reply = backend.reply("the weather is nice").await.unwrap();
        assert!(reply.contains("the weather is nice"));
    }

    #[tokio::test]
    async fn test_local_command_success() {
        let backend = LocalCommandReply::new("cat".to_string(), Duration::from_secs(5));
        let reply = backend.reply("echo this back").await.unwrap();
        assert_eq!(reply, "echo this back");
    }

    #[tokio::test]
    async fn test_local_command_nonzero_exit_is_error() {
        let backend = LocalCommandReply::new("exit 3".to_string(), Duration::from_secs(5));
        assert!(backend.reply("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_chain_falls_through_failed_command() {
        // A command that exits non-zero must not surface a failure; the next
        // configured variant (rule-based) takes over.
        let chain = ReplyChain::new(vec![
            Box::new(LocalCommandReply::new(
                "exit 1".to_string(),
                Duration::from_secs(5),
            )),
            Box::new(RuleBasedReply),
        ]);

        let mut stages = StageTimer::new();
        let reply = chain.generate("I need some help", &mut stages).await;
        assert!(reply.contains("I'm here with you"));

        let snapshot = stages.snapshot();
        assert_eq!(snapshot.get("reply:command").unwrap().success, Some(false));
        assert_eq!(snapshot.get("reply:rule-based").unwrap().success, Some(true));
    }

    #[tokio::test]
    async fn test_chain_first_success_short_circuits() {
        let chain = ReplyChain::new(vec![
            Box::new(LocalCommandReply::new(
                "printf 'from the command'".to_string(),
                Duration::from_secs(5),
            )),
            Box::new(RuleBasedReply),
        ]);

        let mut stages = StageTimer::new();
        let reply = chain.generate("hello", &mut stages).await;
        assert_eq!(reply, "from the command");
        // Rule-based must not have been attempted
        assert!(stages.snapshot().get("reply:rule-based").is_none());
    }

    #[tokio::test]
    async fn test_chain_empty_input_returns_empty() {
        let chain = ReplyChain::new(vec![Box::new(RuleBasedReply)]);
        let mut stages = StageTimer::new();
        assert_eq!(chain.generate("   ", &mut stages).await, "");
    }

    #[tokio::test]
    async fn test_chain_all_failed_returns_empty() {
        let chain = ReplyChain::new(vec![Box::new(LocalCommandReply::new(
            "exit 1".to_string(),
            Duration::from_secs(5),
        ))]);
        let mut stages = StageTimer::new();
        assert_eq!(chain.generate("hello", &mut stages).await, "");
    }

    #[test]
    fn test_build_chain_respects_configuration() {
        let mut config = crate::config::AppConfig::default().reply;
        config.command = Some("cat".to_string());
        config.proxy_url = Some("http://127.0.0.1:9000/chat".to_string());
        let chain = build_reply_chain(&config);
        assert_eq!(chain.variant_names(), vec!["command", "proxy", "rule-based"]);

        config.rule_based_enabled = false;
        config.command = None;
        let chain = build_reply_chain(&config);
        assert_eq!(chain.variant_names(), vec!["proxy"]);
    }
}
