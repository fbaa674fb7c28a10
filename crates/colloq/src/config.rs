//! Client configuration.
//!
//! Sources, lowest precedence first: built-in defaults, the TOML config file
//! (optional), then `COLLOQ__*` environment variables, e.g.
//! `COLLOQ__RECONNECT__MAX_ATTEMPTS=5`.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "colloq";
pub const ENV_PREFIX: &str = "COLLOQ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the conversation service.
    pub url: String,
    pub organization_id: String,
    pub tenant_id: String,
    pub external_user_id: Option<String>,
    /// Static bearer token. When absent the caller supplies a token provider.
    pub access_token: Option<String>,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/conversations/ws".to_string(),
            organization_id: String::new(),
            tenant_id: String::new(),
            external_user_id: None,
            access_token: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed attempts before the transport gives up. Unset
    /// retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): doubles from the base
    /// up to the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

impl ClientConfig {
    /// Load from `path` (or the default location) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => expand_path(path)?,
            None => default_config_path()?,
        };
        Self::load_from(&path, ENV_PREFIX)
    }

    fn load_from(path: &Path, env_prefix: &str) -> Result<Self> {
        let defaults = ReconnectConfig::default();
        let built = Config::builder()
            .set_default("reconnect.base_backoff_ms", defaults.base_backoff_ms as i64)?
            .set_default("reconnect.max_backoff_ms", defaults.max_backoff_ms as i64)?
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        built
            .try_deserialize()
            .with_context(|| format!("parsing config from {}", path.display()))
    }

    /// Render as TOML, with the token redacted.
    pub fn to_toml_redacted(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.access_token.is_some() {
            shown.access_token = Some("<redacted>".to_string());
        }
        toml::to_string_pretty(&shown).context("serializing config to TOML")
    }
}

pub fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => {
            let expanded = shellexpand::full(text).context("expanding path")?;
            Ok(PathBuf::from(expanded.to_string()))
        }
        None => Ok(path.to_path_buf()),
    }
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}
