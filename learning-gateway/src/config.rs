//! Configuration for the learning gateway
//!
//! CLI arguments with environment variable fallbacks.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

use narrative_engine::EngineConfig;

/// Learning gateway - adaptive narrative sessions over REST and WebSocket
#[derive(Parser, Debug, Clone)]
#[command(name = "learning-gateway")]
#[command(about = "REST and WebSocket gateway for adaptive narrative learning sessions")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Engine tuning file (YAML)
    #[arg(long, env = "ENGINE_CONFIG")]
    pub engine_config: Option<PathBuf>,

    /// Nuggets and narrative nodes to load at startup (YAML or JSON)
    #[arg(long, env = "SEED_LIBRARY")]
    pub seed_library: Option<PathBuf>,

    /// Base URL of an OpenAI-compatible chat completions API
    #[arg(long, env = "LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    /// Model name sent with every completion request
    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// API key for the model endpoint
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Provider name written to usage records
    #[arg(long, env = "LLM_PROVIDER", default_value = "openai")]
    pub llm_provider: String,

    /// Append usage records to this JSONL file
    #[arg(long, env = "USAGE_LOG")]
    pub usage_log: Option<PathBuf>,

    /// Enable development mode (scripted mock model instead of HTTP)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            match self.llm_base_url.as_deref() {
                None | Some("") => {
                    return Err("LLM_BASE_URL is required outside development mode".to_string());
                }
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    return Err(format!("LLM_BASE_URL must be an http(s) URL, got {}", url));
                }
                _ => {}
            }
        }

        if self.llm_model.trim().is_empty() {
            return Err("LLM_MODEL must not be empty".to_string());
        }

        Ok(())
    }

    /// Engine config from `ENGINE_CONFIG`, or defaults.
    pub fn load_engine_config(&self) -> anyhow::Result<EngineConfig> {
        match &self.engine_config {
            Some(path) => {
                let yaml = std::fs::read_to_string(path)?;
                Ok(EngineConfig::from_yaml(&yaml)?)
            }
            None => Ok(EngineConfig::default()),
        }
    }

    /// Default `EnvFilter` directives when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> String {
        format!(
            "learning_gateway={level},narrative_engine={level},tutor_agent={level},info",
            level = self.log_level
        )
    }
}
