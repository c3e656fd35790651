//! Application Configuration Module
//!
//! Loads settings for the guided-fix service from environment variables into a
//! single struct that is passed around at startup.

use guided_fix_core::options::{
    DEFAULT_FRAME_INTERVAL, DEFAULT_GUIDANCE_TIMEOUT, DEFAULT_MIN_GUIDANCE_INTERVAL, SessionOptions,
};
use secrecy::SecretString;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuideProvider {
    OpenAI,
    /// Scripted offline guide, no API key needed.
    Demo,
}

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: Option<SecretString>,
    pub chat_model: String,
    pub log_level: Level,
    pub provider: GuideProvider,
    pub frame_interval: Duration,
    pub min_guidance_interval: Duration,
    pub guidance_timeout: Duration,
    pub prompts_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidNumber { name: String, value: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `GUIDE_PROVIDER`: "openai" or "demo". Defaults to "openai".
    // *   `OPENAI_API_KEY`: Required if provider is "openai".
    // *   `CHAT_MODEL`: (Optional) Vision model for guidance and plans. Defaults to "gpt-4o".
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    // *   `FRAME_INTERVAL_MS`, `GUIDANCE_MIN_INTERVAL_MS`, `GUIDANCE_TIMEOUT_MS`: (Optional) session timing.
    // *   `PROMPTS_DIR`: (Optional) Directory of prompt overrides. Defaults to "prompts".
    ///
    /// `provider` takes precedence over `GUIDE_PROVIDER` when given.
    pub fn from_env(provider: Option<GuideProvider>) -> Result<Self, ConfigError> {
        // Ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok(), provider)
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        provider: Option<GuideProvider>,
    ) -> Result<Self, ConfigError> {
        let provider = provider.unwrap_or_else(|| {
            let provider_str = lookup("GUIDE_PROVIDER").unwrap_or_else(|| "openai".to_string());
            match provider_str.to_lowercase().as_str() {
                "demo" => GuideProvider::Demo,
                // Default to OpenAI for "openai" or any other value
                _ => GuideProvider::OpenAI,
            }
        });

        let openai_api_key = lookup("OPENAI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);
        let chat_model = lookup("CHAT_MODEL").unwrap_or_else(|| "gpt-4o".to_string());

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        let millis = |name: &str, default: Duration| -> Result<Duration, ConfigError> {
            let Some(value) = lookup(name) else {
                return Ok(default);
            };
            match value.trim().parse::<u64>() {
                Ok(ms) => Ok(Duration::from_millis(ms)),
                Err(_) => Err(ConfigError::InvalidNumber {
                    name: name.to_string(),
                    value,
                }),
            }
        };

        let config = Self {
            openai_api_key,
            chat_model,
            log_level,
            provider,
            frame_interval: millis("FRAME_INTERVAL_MS", DEFAULT_FRAME_INTERVAL)?,
            min_guidance_interval: millis("GUIDANCE_MIN_INTERVAL_MS", DEFAULT_MIN_GUIDANCE_INTERVAL)?,
            guidance_timeout: millis("GUIDANCE_TIMEOUT_MS", DEFAULT_GUIDANCE_TIMEOUT)?,
            prompts_dir: lookup("PROMPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("prompts")),
        };

        if config.provider == GuideProvider::OpenAI && config.openai_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "OPENAI_API_KEY must be set for openai provider".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::default()
            .with_frame_interval(self.frame_interval)
            .with_min_guidance_interval(self.min_guidance_interval)
            .with_guidance_timeout(self.guidance_timeout)
    }
}
