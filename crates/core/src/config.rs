use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    /// Explicit provider name; inferred from the model prefix when absent.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default = "default_max_consecutive_tool_errors")]
    pub max_consecutive_tool_errors: u32,
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    /// Settle delays before reading the frame cache after a tool call.
    /// Navigation and typing need longer for the page to render.
    #[serde(default = "default_settle_ms")]
    pub settle_ms_default: u64,
    #[serde(default = "default_settle_ms_navigation")]
    pub settle_ms_navigation: u64,
    #[serde(default = "default_settle_ms_typing")]
    pub settle_ms_typing: u64,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tool_iterations() -> u32 {
    15
}

fn default_max_consecutive_tool_errors() -> u32 {
    3
}

fn default_max_history_turns() -> usize {
    40
}

fn default_settle_ms() -> u64 {
    500
}

fn default_settle_ms_navigation() -> u64 {
    1500
}

fn default_settle_ms_typing() -> u64 {
    800
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            provider: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_tool_iterations: default_max_tool_iterations(),
            max_consecutive_tool_errors: default_max_consecutive_tool_errors(),
            max_history_turns: default_max_history_turns(),
            settle_ms_default: default_settle_ms(),
            settle_ms_navigation: default_settle_ms_navigation(),
            settle_ms_typing: default_settle_ms_typing(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Command used to spawn the browser automation process.
    #[serde(default = "default_gateway_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Liveness probe endpoint; any 2xx/4xx response counts as alive.
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
    #[serde(default = "default_startup_poll_ms")]
    pub startup_poll_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

fn default_gateway_command() -> String {
    "npx".to_string()
}

fn default_probe_url() -> String {
    "http://127.0.0.1:9222/json/version".to_string()
}

fn default_startup_attempts() -> u32 {
    20
}

fn default_startup_poll_ms() -> u64 {
    500
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_health_interval_secs() -> u64 {
    15
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            args: Vec::new(),
            probe_url: default_probe_url(),
            startup_attempts: default_startup_attempts(),
            startup_poll_ms: default_startup_poll_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerConfig {
    #[serde(default = "default_min_fps")]
    pub min_fps: u32,
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,
    /// Consecutive unchanged frames before the rate starts stepping down.
    #[serde(default = "default_unchanged_threshold")]
    pub unchanged_threshold: u32,
    #[serde(default = "default_max_capture_failures")]
    pub max_capture_failures: u32,
    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: u64,
    #[serde(default = "default_stream_change_threshold")]
    pub change_threshold_percent: f64,
    /// Width of the scaled copy published to the UI.
    #[serde(default = "default_scaled_width")]
    pub scaled_width: u32,
}

fn default_min_fps() -> u32 {
    1
}

fn default_max_fps() -> u32 {
    5
}

fn default_unchanged_threshold() -> u32 {
    3
}

fn default_max_capture_failures() -> u32 {
    5
}

fn default_failure_cooldown_secs() -> u64 {
    10
}

fn default_stream_change_threshold() -> f64 {
    0.5
}

fn default_scaled_width() -> u32 {
    960
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            min_fps: default_min_fps(),
            max_fps: default_max_fps(),
            unchanged_threshold: default_unchanged_threshold(),
            max_capture_failures: default_max_capture_failures(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
            change_threshold_percent: default_stream_change_threshold(),
            scaled_width: default_scaled_width(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionConfig {
    #[serde(default = "default_change_threshold")]
    pub default_threshold_percent: f64,
    /// Text entry produces a subtle visual delta, so it gets a lower bar.
    #[serde(default = "default_text_entry_threshold")]
    pub text_entry_threshold_percent: f64,
    /// Per-channel tolerance absorbing anti-aliasing noise.
    #[serde(default = "default_aa_tolerance")]
    pub aa_tolerance: u8,
}

fn default_change_threshold() -> f64 {
    0.5
}

fn default_text_entry_threshold() -> f64 {
    0.1
}

fn default_aa_tolerance() -> u8 {
    10
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            default_threshold_percent: default_change_threshold(),
            text_entry_threshold_percent: default_text_entry_threshold(),
            aa_tolerance: default_aa_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub streamer: StreamerConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".webpilot")
            .join("config.json")
    }

    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Resolve the API key for a provider: config first, then the
    /// provider-specific environment variable, then WEBPILOT_API_KEY.
    pub fn resolve_api_key(&self, provider: &str) -> Option<String> {
        if let Some(pc) = self.providers.get(provider) {
            if !pc.api_key.is_empty() {
                return Some(pc.api_key.clone());
            }
        }
        let env_var = match provider {
            "anthropic" => "ANTHROPIC_API_KEY",
            "gemini" => "GEMINI_API_KEY",
            "openai" => "OPENAI_API_KEY",
            _ => return std::env::var("WEBPILOT_API_KEY").ok(),
        };
        std::env::var(env_var)
            .ok()
            .or_else(|| std::env::var("WEBPILOT_API_KEY").ok())
    }

    pub fn api_base(&self, provider: &str) -> Option<String> {
        self.providers.get(provider).and_then(|pc| pc.api_base.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.agent.max_tool_iterations, 15);
        assert_eq!(config.agent.max_consecutive_tool_errors, 3);
        assert_eq!(config.streamer.min_fps, 1);
        assert_eq!(config.streamer.max_fps, 5);
        assert_eq!(config.streamer.unchanged_threshold, 3);
        assert_eq!(config.vision.text_entry_threshold_percent, 0.1);
        assert_eq!(config.vision.default_threshold_percent, 0.5);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "agent": {"model": "gemini/gemini-2.0-flash", "maxToolIterations": 8},
            "providers": {"gemini": {"apiKey": "k"}}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.agent.model, "gemini/gemini-2.0-flash");
        assert_eq!(config.agent.max_tool_iterations, 8);
        // Untouched fields keep their defaults
        assert_eq!(config.agent.max_consecutive_tool_errors, 3);
        assert_eq!(config.gateway.max_reconnect_attempts, 5);
        assert_eq!(config.resolve_api_key("gemini").as_deref(), Some("k"));
    }
}
