use jobsync_core::wire::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:8000/ws/jobs";
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 10;
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Url,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random extra delay, as a fraction of the backoff.
    pub jitter_ratio: f64,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Values taken from the command line; empty or absent fields fall through
/// to the environment and then to defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigFlags {
    pub url: String,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub max_frame_bytes: Option<usize>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid job source url '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("job source url must use ws or wss, got '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid value for {key}: '{value}'")]
    InvalidNumber { key: String, value: String },
}

pub fn load_config(flags: &ConfigFlags) -> Result<ClientConfig, ConfigError> {
    load_config_with(flags, |key| std::env::var(key).ok())
}

pub fn load_config_with<F>(flags: &ConfigFlags, env: F) -> Result<ClientConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let url = resolve_url(&flags.url, &env)?;
    let mut config = ClientConfig::new(url);
    if let Some(ms) = resolve_number(flags.initial_backoff_ms, "JOBSYNC_INITIAL_BACKOFF_MS", &env)? {
        config.initial_backoff = Duration::from_millis(ms.max(1));
    }
    if let Some(secs) = resolve_number(flags.max_backoff_secs, "JOBSYNC_MAX_BACKOFF_SECS", &env)? {
        config.max_backoff = Duration::from_secs(secs);
    }
    if config.max_backoff < config.initial_backoff {
        config.max_backoff = config.initial_backoff;
    }
    let max_frame = flags.max_frame_bytes.map(|v| v as u64);
    if let Some(bytes) = resolve_number(max_frame, "JOBSYNC_MAX_FRAME_BYTES", &env)? {
        config.max_frame_bytes = bytes as usize;
    }
    Ok(config)
}

fn resolve_url<F>(flag: &str, env: &F) -> Result<Url, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = if !flag.trim().is_empty() {
        flag.trim().to_string()
    } else if let Some(value) = env("JOBSYNC_URL").filter(|v| !v.trim().is_empty()) {
        value.trim().to_string()
    } else {
        DEFAULT_URL.to_string()
    };
    let url = Url::parse(&raw).map_err(|err| ConfigError::InvalidUrl {
        value: raw.clone(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

fn resolve_number<F>(flag: Option<u64>, key: &str, env: &F) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if flag.is_some() {
        return Ok(flag);
    }
    let Some(value) = env(key).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value,
        })
}
