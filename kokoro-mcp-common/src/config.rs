//! Configuration module for loading environment variables and settings.

use crate::error::ConfigError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default base URL of the Kokoro engine service.
pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8880";

/// Default voice used when a request does not name one.
pub const DEFAULT_VOICE: &str = "af_heart";

/// Default per-call synthesis timeout in seconds.
pub const DEFAULT_SYNTHESIS_TIMEOUT_SECS: u64 = 60;

/// Default retention for finished sessions in seconds.
pub const DEFAULT_SESSION_RETENTION_SECS: u64 = 600;

/// How synthesized audio is handed back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioDelivery {
    /// WAV files in the temp audio directory, referenced by HTTP URL
    #[default]
    File,
    /// Payloads kept in memory and returned inline
    Memory,
}

impl FromStr for AudioDelivery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(AudioDelivery::File),
            "memory" => Ok(AudioDelivery::Memory),
            other => Err(format!(
                "'{}' is not a delivery mode. Valid options: file, memory",
                other
            )),
        }
    }
}

impl fmt::Display for AudioDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioDelivery::File => write!(f, "file"),
            AudioDelivery::Memory => write!(f, "memory"),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// The MCP transport port is not part of it; `PORT` is read by
/// [`TransportArgs`](crate::transport::TransportArgs).
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Kokoro engine service
    pub engine_url: String,
    /// Host used when building audio URLs
    pub http_host: String,
    /// Port used when building audio URLs
    pub http_port: u16,
    /// Directory that holds generated audio files
    pub temp_audio_dir: PathBuf,
    /// Audio delivery mode
    pub delivery: AudioDelivery,
    /// Voice used when none is requested
    pub default_voice: String,
    /// Per-call synthesis timeout (`None` disables it)
    pub synthesis_timeout: Option<Duration>,
    /// Maximum simultaneous syntheses across all sessions
    pub max_concurrent_syntheses: usize,
    /// How long finished sessions are kept before the sweeper drops them
    pub session_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            http_host: "127.0.0.1".to_string(),
            http_port: 8080,
            temp_audio_dir: PathBuf::from("temp_audio"),
            delivery: AudioDelivery::File,
            default_voice: DEFAULT_VOICE.to_string(),
            synthesis_timeout: Some(Duration::from_secs(DEFAULT_SYNTHESIS_TIMEOUT_SECS)),
            max_concurrent_syntheses: 1,
            session_retention: Duration::from_secs(DEFAULT_SESSION_RETENTION_SECS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and .env file.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be
    /// parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// Unset variables fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let engine_url = lookup("KOKORO_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.engine_url);
        if engine_url.is_empty() {
            return Err(ConfigError::invalid_value("KOKORO_API_URL", "must not be empty"));
        }

        let http_host = lookup("HTTP_HOST").unwrap_or(defaults.http_host);
        let http_port = parse_var(&lookup, "HTTP_PORT")?.unwrap_or(defaults.http_port);
        let temp_audio_dir = lookup("TEMP_AUDIO_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.temp_audio_dir);
        let delivery = parse_var(&lookup, "AUDIO_DELIVERY")?.unwrap_or(defaults.delivery);
        let default_voice = lookup("DEFAULT_VOICE").unwrap_or(defaults.default_voice);

        let synthesis_timeout = match parse_var::<u64, _>(&lookup, "SYNTHESIS_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.synthesis_timeout,
        };

        let max_concurrent_syntheses = parse_var(&lookup, "MAX_CONCURRENT_SYNTHESES")?
            .unwrap_or(defaults.max_concurrent_syntheses);
        if max_concurrent_syntheses == 0 {
            return Err(ConfigError::invalid_value(
                "MAX_CONCURRENT_SYNTHESES",
                "must be at least 1",
            ));
        }

        let session_retention = parse_var(&lookup, "SESSION_RETENTION_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.session_retention);

        Ok(Self {
            engine_url,
            http_host,
            http_port,
            temp_audio_dir,
            delivery,
            default_voice,
            synthesis_timeout,
            max_concurrent_syntheses,
            session_retention,
        })
    }

    /// Base URL under which audio files are published.
    pub fn audio_base_url(&self) -> String {
        format!("http://{}:{}/audio", self.http_host, self.http_port)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid_value(name, format!("{} ({})", raw, e))),
    }
}
