use std::io;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub directive: String,
    pub to_stdout: bool,
}

impl LogSettings {
    /// `RUST_LOG` wins when set; otherwise `JOBSYNC_LOG_LEVEL`, then `info`.
    /// Output goes to stderr unless `JOBSYNC_LOG_STDOUT` is truthy, which
    /// keeps stdout free for whatever embeds the client.
    pub fn from_env_with<F>(env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| env(key).filter(|value| !value.trim().is_empty());
        let directive = non_empty("RUST_LOG")
            .or_else(|| non_empty("JOBSYNC_LOG_LEVEL"))
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        let to_stdout = env("JOBSYNC_LOG_STDOUT")
            .and_then(|value| parse_bool_flag(&value))
            .unwrap_or(false);
        Self {
            directive,
            to_stdout,
        }
    }
}

pub fn init_logging() {
    let settings = LogSettings::from_env_with(|key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&settings.directive)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    if settings.to_stdout {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
