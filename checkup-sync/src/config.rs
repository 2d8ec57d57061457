//! Station configuration
//!
//! Resolved from the environment (and an optional `.env` file) at boot, with
//! hardcoded fallbacks suitable for local development.

use crate::cache::CacheConfig;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:5000";
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// What happens to existing slices when a new patient ID is set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewPatientPolicy {
    /// Start the new patient with no department data
    #[default]
    DropAll,
    /// Keep the registration (`it`) slice, drop the clinical ones
    KeepIt,
}

impl FromStr for NewPatientPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_all" => Ok(NewPatientPolicy::DropAll),
            "keep_it" => Ok(NewPatientPolicy::KeepIt),
            other => Err(SyncError::Config(format!("Unknown new patient policy: {other}"))),
        }
    }
}

/// Whether clearing the `it` slice also clears the patient ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItResetPolicy {
    #[default]
    ClearPatientId,
    KeepPatientId,
}

impl FromStr for ItResetPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clear_patient_id" => Ok(ItResetPolicy::ClearPatientId),
            "keep_patient_id" => Ok(ItResetPolicy::KeepPatientId),
            other => Err(SyncError::Config(format!("Unknown it reset policy: {other}"))),
        }
    }
}

/// Record store reset semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorePolicy {
    pub new_patient: NewPatientPolicy,
    pub it_reset: ItResetPolicy,
}

/// Full station configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend base URL (REST endpoints live under `/api`)
    pub api_url: String,
    /// Realtime channel WebSocket URL
    pub socket_url: String,
    pub cache: CacheConfig,
    /// Delay before a field edit is committed to the store
    pub debounce: Duration,
    /// Interval of the polling fallback
    pub poll_interval: Duration,
    /// Reconnection attempts after the channel drops
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub http_timeout: Duration,
    pub policy: StorePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: socket_url_for(DEFAULT_API_URL),
            cache: CacheConfig::default(),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            policy: StorePolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, reading `.env` first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] when a variable is set but cannot be parsed.
    pub fn from_env() -> SyncResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!(error = %e, "No .env file loaded");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] when a value is present but invalid.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // === Endpoints ===
        if let Some(api_url) = lookup("CHECKUP_API_URL") {
            config.api_url = api_url.trim_end_matches('/').to_string();
        }
        config.socket_url = lookup("CHECKUP_SOCKET_URL")
            .unwrap_or_else(|| socket_url_for(&config.api_url));

        // === Local cache ===
        if let Some(path) = lookup("CHECKUP_CACHE_PATH") {
            config.cache.db_path = path;
        }

        // === Timing ===
        config.debounce = Duration::from_millis(parse_or(
            &lookup,
            "CHECKUP_DEBOUNCE_MS",
            DEFAULT_DEBOUNCE_MS,
        )?);
        config.poll_interval = Duration::from_secs(parse_or(
            &lookup,
            "CHECKUP_POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL_SECS,
        )?);
        config.reconnect_attempts =
            parse_or(&lookup, "CHECKUP_RECONNECT_ATTEMPTS", DEFAULT_RECONNECT_ATTEMPTS)?;
        config.reconnect_delay = Duration::from_millis(parse_or(
            &lookup,
            "CHECKUP_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
        )?);
        config.http_timeout = Duration::from_secs(parse_or(
            &lookup,
            "CHECKUP_HTTP_TIMEOUT_SECS",
            DEFAULT_HTTP_TIMEOUT_SECS,
        )?);

        // === Reset semantics ===
        config.policy = StorePolicy {
            new_patient: parse_or(
                &lookup,
                "CHECKUP_NEW_PATIENT_POLICY",
                NewPatientPolicy::default(),
            )?,
            it_reset: parse_or(&lookup, "CHECKUP_IT_RESET_POLICY", ItResetPolicy::default())?,
        };

        Ok(config)
    }

    /// Absolute URL of a backend endpoint
    pub fn api_endpoint(&self, endpoint: &str) -> String {
        let endpoint = endpoint.trim_start_matches('/');
        format!("{}/api/{endpoint}", self.api_url)
    }
}

/// WebSocket URL served next to the backend
pub fn socket_url_for(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws")
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> SyncResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| SyncError::Config(format!("{key}={raw}: {e}"))),
    }
}
