use std::str::FromStr;
use std::time::Duration;

use crate::Error;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "RESILIENT_HTTP_";

/// Poll interval used when neither the response nor the config supplies one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Retry and circuit-breaker policy. Read-only once the client is built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryConfig {
    /// Retries allowed on 429 after the initial attempt.
    pub max_rate_limit_retries: u32,
    /// Retries allowed on 5xx after the initial attempt.
    pub max_server_error_retries: u32,
    /// Base of the exponential 429 backoff when no `Retry-After` is sent.
    pub rate_limit_base_delay: Duration,
    /// Fixed wait before retrying a 5xx.
    pub server_error_retry_delay: Duration,
    /// Consecutive final failures that open the circuit.
    pub circuit_breaker_threshold: u32,
    /// Time since the last failure before a half-open probe is admitted.
    pub circuit_breaker_reset: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 3,
            max_server_error_retries: 1,
            rate_limit_base_delay: Duration::from_secs(1),
            server_error_retry_delay: Duration::from_secs(1),
            circuit_breaker_threshold: 5,
            circuit_breaker_reset: Duration::from_secs(30),
        }
    }
}

/// Bounds for the async poll loop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AsyncWaitConfig {
    /// Poll interval when the response carries no timing hint.
    pub poll_interval: Option<Duration>,
    /// Overall wait bound; zero leaves the loop bounded only by the caller.
    pub timeout: Duration,
    pub max_iterations: usize,
}

impl Default for AsyncWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: None,
            timeout: Duration::ZERO,
            max_iterations: 1000,
        }
    }
}

/// Configures the client: per-attempt timeout, retry policy and polling.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt request timeout in milliseconds.
    pub timeout_ms: u64,
    pub retry: RetryConfig,
    pub async_wait: AsyncWaitConfig,
    /// Vendor prefix tried before the generic `RateLimit-*` headers.
    pub rate_limit_header_prefix: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry: RetryConfig::default(),
            async_wait: AsyncWaitConfig::default(),
            rate_limit_header_prefix: "X-".to_owned(),
        }
    }
}

impl ClientOptions {
    /// Defaults overridden by `RESILIENT_HTTP_*` environment variables.
    ///
    /// Unset or empty variables keep their default. A value that does not
    /// parse is reported as [`Error::Config`].
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientOptions::from_env`] but reads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Overrides { lookup };
        let mut opts = Self::default();

        if let Some(value) = env.parse("TIMEOUT_MS")? {
            opts.timeout_ms = value;
        }

        let retry = &mut opts.retry;
        if let Some(value) = env.parse("MAX_RATE_LIMIT_RETRIES")? {
            retry.max_rate_limit_retries = value;
        }
        if let Some(value) = env.parse("MAX_5XX_RETRIES")? {
            retry.max_server_error_retries = value;
        }
        if let Some(value) = env.millis("RATE_LIMIT_BASE_DELAY_MS")? {
            retry.rate_limit_base_delay = value;
        }
        if let Some(value) = env.millis("SERVER_ERROR_RETRY_DELAY_MS")? {
            retry.server_error_retry_delay = value;
        }
        if let Some(value) = env.parse("CIRCUIT_BREAKER_THRESHOLD")? {
            retry.circuit_breaker_threshold = value;
        }
        if let Some(value) = env.millis("CIRCUIT_BREAKER_RESET_MS")? {
            retry.circuit_breaker_reset = value;
        }

        let wait = &mut opts.async_wait;
        if let Some(value) = env.millis("ASYNC_POLL_INTERVAL_MS")? {
            wait.poll_interval = Some(value);
        }
        if let Some(value) = env.millis("ASYNC_TIMEOUT_MS")? {
            wait.timeout = value;
        }
        if let Some(value) = env.parse("ASYNC_MAX_ITERATIONS")? {
            wait.max_iterations = value;
        }

        if let Some(prefix) = env.raw("RATE_LIMIT_HEADER_PREFIX") {
            opts.rate_limit_header_prefix = prefix;
        }

        Ok(opts)
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F> Overrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, Error> {
        match self.raw(name) {
            None => Ok(None),
            Some(value) => value.parse::<T>().map(Some).map_err(|_| {
                Error::Config(format!("{ENV_PREFIX}{name} has invalid value '{value}'"))
            }),
        }
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, Error> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }
}
