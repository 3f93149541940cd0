use std::time::Duration;

use tracing::warn;

pub const DEFAULT_URL: &str = "https://httpbin.org/post";

pub const URL_VAR: &str = "JSON_POST_URL";
pub const TIMEOUT_MS_VAR: &str = "JSON_POST_TIMEOUT_MS";
pub const USER_AGENT_VAR: &str = "JSON_POST_USER_AGENT";

/// Runner settings. The URL is validated when a request is submitted, not here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    pub url: String,
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

impl RunnerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: None,
            user_agent: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source. Unset or
    /// unparsable values fall back to defaults; rejected timeouts are logged.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            url: lookup(URL_VAR)
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            timeout: lookup(TIMEOUT_MS_VAR).and_then(|raw| parse_timeout_ms(&raw)),
            user_agent: lookup(USER_AGENT_VAR).filter(|agent| !agent.is_empty()),
        }
    }
}

fn parse_timeout_ms(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn!(
                var = TIMEOUT_MS_VAR,
                value = raw,
                "ignoring invalid timeout, expected a positive number of milliseconds"
            );
            None
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}
