use std::{path::PathBuf, time::Duration};

use thiserror::Error;
use tracing::warn;

pub const DEFAULT_RATE_LIMIT_REQUESTS: usize = 12;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 300;
pub const DEFAULT_RATE_LIMIT_MAX_CLIENTS: usize = 50_000;
pub const DEFAULT_ARTIFACT_RETENTION_SECONDS: u64 = 15 * 60;
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_TURNSTILE_VERIFY_URL: &str =
    "https://challenges.cloudflare.com/turnstile/v0/siteverify";
pub const DEFAULT_PROBE_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 15 * 60;
pub const DEFAULT_SOCKET_TIMEOUT_SECONDS: u64 = 20;
pub const DEFAULT_ENGINE_RETRIES: u32 = 2;
const TURNSTILE_TIMEOUT_SECONDS: u64 = 10;
/// Vite dev server origins, used when `ALLOWED_ORIGINS` is unset.
pub const DEV_ALLOWED_ORIGINS: &[&str] = &["http://127.0.0.1:5173", "http://localhost:5173"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
    pub max_tracked_clients: usize,
}

#[derive(Debug, Clone, Default)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub secret_key: Option<String>,
    pub site_key: Option<String>,
    pub allowed_hostnames: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub program: String,
    pub probe_timeout: Duration,
    pub fetch_timeout: Duration,
    pub socket_timeout_seconds: u64,
    pub retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECONDS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECONDS),
            socket_timeout_seconds: DEFAULT_SOCKET_TIMEOUT_SECONDS,
            retries: DEFAULT_ENGINE_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub trust_proxy_headers: bool,
    pub rate_limit: RateLimitConfig,
    pub artifact_dir: PathBuf,
    pub artifact_retention: Duration,
    pub max_artifact_bytes: u64,
    pub max_concurrent_downloads: usize,
    pub verification: VerificationConfig,
    pub turnstile_verify_url: String,
    pub turnstile_timeout: Duration,
    pub engine: EngineConfig,
    pub extra_restricted_phrases: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let rate_limit = RateLimitConfig {
            max_requests: read_usize_env("RATE_LIMIT_REQUESTS")
                .unwrap_or(DEFAULT_RATE_LIMIT_REQUESTS),
            window: Duration::from_secs(
                read_u64_env("RATE_LIMIT_WINDOW_SECONDS")
                    .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
            ),
            max_tracked_clients: read_usize_env("RATE_LIMIT_MAX_CLIENTS")
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX_CLIENTS),
        };

        let verification = VerificationConfig {
            enabled: read_bool_env("VERIFICATION_ENABLED").unwrap_or(false),
            secret_key: read_string_env("TURNSTILE_SECRET_KEY"),
            site_key: read_string_env("TURNSTILE_SITE_KEY"),
            allowed_hostnames: read_list_env("TURNSTILE_ALLOWED_HOSTNAMES")
                .into_iter()
                .map(|host| host.to_ascii_lowercase())
                .collect(),
        };

        let engine = EngineConfig {
            program: read_string_env("YT_DLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),
            probe_timeout: Duration::from_secs(
                read_u64_env("YT_DLP_PROBE_TIMEOUT_SECONDS")
                    .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECONDS),
            ),
            fetch_timeout: Duration::from_secs(
                read_u64_env("YT_DLP_FETCH_TIMEOUT_SECONDS")
                    .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECONDS),
            ),
            socket_timeout_seconds: read_u64_env("YT_DLP_SOCKET_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_SOCKET_TIMEOUT_SECONDS),
            retries: read_u64_env("YT_DLP_RETRIES")
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(DEFAULT_ENGINE_RETRIES),
        };

        let config = Self {
            bind_addr: resolve_bind_addr(),
            allowed_origins: allowed_origins_or_dev(read_list_env("ALLOWED_ORIGINS")),
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            rate_limit,
            artifact_dir: read_string_env("ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("downloads")),
            artifact_retention: Duration::from_secs(
                read_u64_env("ARTIFACT_RETENTION_SECONDS")
                    .unwrap_or(DEFAULT_ARTIFACT_RETENTION_SECONDS),
            ),
            max_artifact_bytes: read_u64_env("MAX_ARTIFACT_BYTES")
                .unwrap_or(DEFAULT_MAX_ARTIFACT_BYTES),
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            verification,
            turnstile_verify_url: read_string_env("TURNSTILE_VERIFY_URL")
                .unwrap_or_else(|| DEFAULT_TURNSTILE_VERIFY_URL.to_string()),
            turnstile_timeout: Duration::from_secs(TURNSTILE_TIMEOUT_SECONDS),
            engine,
            extra_restricted_phrases: read_list_env("RESTRICTED_PHRASES"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("RATE_LIMIT_REQUESTS", self.rate_limit.max_requests as u64),
            ("RATE_LIMIT_WINDOW_SECONDS", self.rate_limit.window.as_secs()),
            ("RATE_LIMIT_MAX_CLIENTS", self.rate_limit.max_tracked_clients as u64),
            ("ARTIFACT_RETENTION_SECONDS", self.artifact_retention.as_secs()),
            ("MAX_ARTIFACT_BYTES", self.max_artifact_bytes),
            ("MAX_CONCURRENT_DOWNLOADS", self.max_concurrent_downloads as u64),
        ];

        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }

        Ok(())
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    let parsed = parse_bool(&value);
    if parsed.is_none() {
        warn!("{name}={value:?} is not a boolean; using the default");
    }
    parsed
}

fn read_usize_env(name: &str) -> Option<usize> {
    let value = std::env::var(name).ok()?;
    let parsed = value.trim().parse::<usize>().ok();
    if parsed.is_none() {
        warn!("{name}={value:?} is not a valid number; using the default");
    }
    parsed
}

fn read_u64_env(name: &str) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    let parsed = value.trim().parse::<u64>().ok();
    if parsed.is_none() {
        warn!("{name}={value:?} is not a valid number; using the default");
    }
    parsed
}

fn read_list_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|value| parse_list(&value))
        .unwrap_or_default()
}

fn allowed_origins_or_dev(configured: Vec<String>) -> Vec<String> {
    if !configured.is_empty() {
        return configured;
    }
    warn!("ALLOWED_ORIGINS is not set; allowing local development origins only");
    dev_origins()
}

fn dev_origins() -> Vec<String> {
    DEV_ALLOWED_ORIGINS.iter().map(ToString::to_string).collect()
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

impl Config {
    /// Built-in defaults with no environment overrides.
    pub fn defaults(artifact_dir: PathBuf) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            allowed_origins: dev_origins(),
            trust_proxy_headers: false,
            rate_limit: RateLimitConfig {
                max_requests: DEFAULT_RATE_LIMIT_REQUESTS,
                window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
                max_tracked_clients: DEFAULT_RATE_LIMIT_MAX_CLIENTS,
            },
            artifact_dir,
            artifact_retention: Duration::from_secs(DEFAULT_ARTIFACT_RETENTION_SECONDS),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            verification: VerificationConfig::default(),
            turnstile_verify_url: DEFAULT_TURNSTILE_VERIFY_URL.to_string(),
            turnstile_timeout: Duration::from_secs(TURNSTILE_TIMEOUT_SECONDS),
            engine: EngineConfig::default(),
            extra_restricted_phrases: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" YES "), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_list_drops_blank_items() {
        assert_eq!(
            parse_list(" example.com, ,www.example.com,"),
            vec!["example.com".to_string(), "www.example.com".to_string()]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn unset_origins_fall_back_to_dev_server() {
        assert_eq!(
            allowed_origins_or_dev(Vec::new()),
            vec![
                "http://127.0.0.1:5173".to_string(),
                "http://localhost:5173".to_string()
            ]
        );
        let configured = vec!["https://grab.example.com".to_string()];
        assert_eq!(allowed_origins_or_dev(configured.clone()), configured);
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut config = Config::defaults(PathBuf::from("downloads"));
        assert!(config.validate().is_ok());

        config.rate_limit.window = Duration::ZERO;
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("RATE_LIMIT_WINDOW_SECONDS"));
    }
}
