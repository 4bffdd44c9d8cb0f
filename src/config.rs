//! Client configuration with `MILLEGRILLES_AUTH_*` environment overrides.
//! Values are public settings; never put key material here.

use crate::error::{AuthError, Result};
use std::time::Duration;
use url::Url;

pub const ENV_HOSTNAME: &str = "MILLEGRILLES_AUTH_HOSTNAME";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "MILLEGRILLES_AUTH_REQUEST_TIMEOUT_MS";
pub const ENV_USER_LOOKUP_TIMEOUT_MS: &str = "MILLEGRILLES_AUTH_USER_LOOKUP_TIMEOUT_MS";
pub const ENV_DEBOUNCE_MS: &str = "MILLEGRILLES_AUTH_DEBOUNCE_MS";
pub const ENV_CHALLENGE_REFRESH_SECS: &str = "MILLEGRILLES_AUTH_CHALLENGE_REFRESH_SECS";
pub const ENV_SESSION_DURATION_SECS: &str = "MILLEGRILLES_AUTH_SESSION_DURATION_SECS";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Relying party host sent with challenge and device requests.
    pub hostname: String,
    pub request_timeout: Duration,
    pub user_lookup_timeout: Duration,
    pub debounce_delay: Duration,
    pub challenge_refresh_period: Duration,
    pub session_duration_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            request_timeout: Duration::from_secs(9),
            user_lookup_timeout: Duration::from_secs(20),
            debounce_delay: Duration::from_millis(400),
            challenge_refresh_period: Duration::from_secs(57),
            session_duration_secs: 86_400,
        }
    }
}

impl ClientConfig {
    /// Defaults with environment overrides applied. Blank variables are ignored.
    ///
    /// # Errors
    /// `Config` naming the variable when a numeric value does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        apply_overrides(&mut config, read_env)?;
        Ok(config)
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| normalize_value(&value))
}

fn normalize_value(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn apply_overrides(config: &mut ClientConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(value) = lookup(ENV_HOSTNAME) {
        config.hostname = relying_party_host(&value)?;
    }
    if let Some(ms) = parse_number(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
        config.request_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_number(&lookup, ENV_USER_LOOKUP_TIMEOUT_MS)? {
        config.user_lookup_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_number(&lookup, ENV_DEBOUNCE_MS)? {
        config.debounce_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = parse_number(&lookup, ENV_CHALLENGE_REFRESH_SECS)? {
        config.challenge_refresh_period = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_number(&lookup, ENV_SESSION_DURATION_SECS)? {
        config.session_duration_secs = secs;
    }
    Ok(())
}

/// Accepts a bare host or an origin URL such as `https://grille.local:8443/`
/// and keeps only the host, which is what challenges are bound to.
fn relying_party_host(value: &str) -> Result<String> {
    if !value.contains("://") {
        return Ok(value.to_string());
    }
    let parsed = Url::parse(value)
        .map_err(|err| AuthError::Config(format!("{ENV_HOSTNAME}: invalid origin {value:?}: {err}")))?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| AuthError::Config(format!("{ENV_HOSTNAME}: origin has no host: {value:?}")))
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| AuthError::Config(format!("{key}: expected a number, got {value:?}")))
        })
        .transpose()
}
