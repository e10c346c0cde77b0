// Engine configuration
use anyhow::{Context, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";

#[derive(Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Buffered slots in the event pipeline; a full buffer blocks the orchestrator
    pub event_capacity: usize,
    /// Upper bound on waiting for the renderer to drain after the pipeline closes
    pub drain_grace: Duration,
    /// Deadline for each HTTP request sent to a server under test
    pub request_timeout: Duration,
    /// Time a process group gets between SIGTERM and SIGKILL
    pub termination_grace: Duration,
    /// Used when a test leaves `timeoutSeconds` unset
    pub default_test_timeout: Duration,
    pub api_url: String,
    pub access_token: Option<String>,
}

// The access token never reaches logs
impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("event_capacity", &self.event_capacity)
            .field("drain_grace", &self.drain_grace)
            .field("request_timeout", &self.request_timeout)
            .field("termination_grace", &self.termination_grace)
            .field("default_test_timeout", &self.default_test_timeout)
            .field("api_url", &self.api_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: 10,
            drain_grace: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            termination_grace: Duration::from_secs(2),
            default_test_timeout: Duration::from_secs(10),
            api_url: DEFAULT_API_URL.to_string(),
            access_token: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `STAGECHECK_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let event_capacity = parse_var(&lookup, "STAGECHECK_EVENT_CAPACITY")?
            .unwrap_or(defaults.event_capacity)
            .max(1);
        let drain_grace = parse_var(&lookup, "STAGECHECK_DRAIN_GRACE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.drain_grace);
        let request_timeout = parse_var(&lookup, "STAGECHECK_REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let termination_grace = parse_var(&lookup, "STAGECHECK_TERMINATION_GRACE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.termination_grace);
        let default_test_timeout = parse_var(&lookup, "STAGECHECK_DEFAULT_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.default_test_timeout);

        let api_url = lookup("STAGECHECK_API_URL")
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);
        let access_token = lookup("STAGECHECK_TOKEN").filter(|v| !v.is_empty());

        Ok(Self {
            event_capacity,
            drain_grace,
            request_timeout,
            termination_grace,
            default_test_timeout,
            api_url,
            access_token,
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", name, raw))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
