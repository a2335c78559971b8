use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::workflows::onboarding::{
    ChallengeSequencer, CheckRunner, EditPolicy, SequenceAllocator,
};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub onboarding: OnboardingConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            onboarding: OnboardingConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Timeouts, retry bounds, and identifier formats for the onboarding pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingConfig {
    pub check_timeout: Duration,
    pub poll_interval: Duration,
    pub oracle_attempts: u32,
    pub challenge_window: Duration,
    pub account_prefix: String,
    pub account_sequence_limit: u32,
    pub edit_policy: EditPolicy,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            oracle_attempts: 3,
            challenge_window: Duration::from_secs(5),
            account_prefix: "SAV".to_string(),
            account_sequence_limit: 999,
            edit_policy: EditPolicy::CascadeInvalidate,
        }
    }
}

impl OnboardingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let check_timeout = duration_ms("ONBOARDING_CHECK_TIMEOUT_MS", defaults.check_timeout)?;
        let poll_interval = duration_ms("ONBOARDING_POLL_INTERVAL_MS", defaults.poll_interval)?;
        let challenge_window =
            duration_ms("ONBOARDING_CHALLENGE_WINDOW_MS", defaults.challenge_window)?;
        let oracle_attempts = number("ONBOARDING_ORACLE_ATTEMPTS", defaults.oracle_attempts)?;
        let account_sequence_limit = number(
            "ONBOARDING_ACCOUNT_SEQUENCE_LIMIT",
            defaults.account_sequence_limit,
        )?;

        let account_prefix = env::var("ONBOARDING_ACCOUNT_PREFIX")
            .map(|value| value.trim().to_ascii_uppercase())
            .unwrap_or(defaults.account_prefix);
        if account_prefix.is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "ONBOARDING_ACCOUNT_PREFIX",
                value: account_prefix,
            });
        }

        let edit_policy = match env::var("ONBOARDING_EDIT_POLICY") {
            Ok(raw) => EditPolicy::parse(&raw).ok_or(ConfigError::InvalidSetting {
                key: "ONBOARDING_EDIT_POLICY",
                value: raw,
            })?,
            Err(_) => defaults.edit_policy,
        };

        Ok(Self {
            check_timeout,
            poll_interval,
            oracle_attempts: oracle_attempts.max(1),
            challenge_window,
            account_prefix,
            account_sequence_limit,
            edit_policy,
        })
    }

    pub fn check_runner(&self) -> CheckRunner {
        CheckRunner::new(self.check_timeout, self.poll_interval, self.oracle_attempts)
    }

    pub fn challenge_sequencer(&self) -> ChallengeSequencer {
        ChallengeSequencer::standard(self.challenge_window).with_poll_interval(self.poll_interval)
    }

    pub fn allocator(&self) -> SequenceAllocator {
        SequenceAllocator::new(self.account_prefix.clone(), self.account_sequence_limit)
    }
}

fn duration_ms(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidSetting { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn number(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidSetting { key, value: raw }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidSetting { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidSetting { key, value } => {
                write!(f, "{key} has an unsupported value '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidSetting { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}
