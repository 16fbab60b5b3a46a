use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use url::Url;

use crate::{
    breaker::CircuitBreaker,
    rate_limit::{retry_after, RateLimitTracker},
    transport::{attempt_timeout, HttpTransport, Transport},
    ClientOptions, Error, HttpRequest, RateLimitSnapshot, RequestContext, Response, Result,
};

/// Whether a logical operation may retry 429 and 5xx responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Retries {
    Enabled,
    Disabled,
}

/// HTTP client that retries transient failures, stops calling a failing
/// backend, and records the backend's rate-limit headers.
///
/// Clones share the circuit breaker and the rate-limit snapshot.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    base_url: Url,
    options: ClientOptions,
    breaker: Arc<CircuitBreaker>,
    rate_limits: Arc<RateLimitTracker>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("options", &self.options)
            .field("circuit", &self.breaker.state())
            .finish()
    }
}

impl ApiClient {
    /// Creates a client for `base_url` over the default `reqwest` transport.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        Self::with_transport(base_url, HttpTransport::new())
    }

    /// Creates a client whose options are read from `RESILIENT_HTTP_*`
    /// environment variables.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use resilient_http::ApiClient;
    ///
    /// let client = ApiClient::from_env("https://api.example.com/v1/").expect("valid config");
    /// ```
    pub fn from_env(base_url: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::from_env()?;
        Ok(Self::new(base_url)?.with_options(options))
    }

    /// Creates a client that sends every attempt through `transport`.
    pub fn with_transport<T>(base_url: impl AsRef<str>, transport: T) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let base_url = parse_base_url(base_url.as_ref())?;
        let options = ClientOptions::default();
        Ok(Self {
            transport: Arc::new(transport),
            base_url,
            breaker: Arc::new(breaker_for(&options)),
            rate_limits: Arc::new(RateLimitTracker::new(&*options.rate_limit_header_prefix)),
            options,
        })
    }

    /// Applies client options. Breaker and rate-limit state start fresh.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.breaker = Arc::new(breaker_for(&opts));
        self.rate_limits = Arc::new(RateLimitTracker::new(&*opts.rate_limit_header_prefix));
        self.options = opts;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Resolves `path` against the base URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|err| Error::InvalidUrl {
            url: path.to_owned(),
            reason: err.to_string(),
        })
    }

    /// Latest rate-limit headers seen on any response, as a copy.
    pub fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        self.rate_limits.snapshot()
    }

    /// Overwrites the rate-limit snapshot.
    pub fn set_rate_limit(&self, snapshot: Option<RateLimitSnapshot>) {
        self.rate_limits.set(snapshot);
    }

    /// Closes the circuit and forgets accumulated failures.
    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub(crate) fn rate_limit_tracker(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    pub async fn get(&self, ctx: &RequestContext, path: &str) -> Result<Response> {
        self.request(ctx, Method::GET, path, None).await
    }

    pub async fn post(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Response> {
        self.request(ctx, Method::POST, path, Some(body.into())).await
    }

    pub async fn put(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Response> {
        self.request(ctx, Method::PUT, path, Some(body.into())).await
    }

    pub async fn patch(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Response> {
        self.request(ctx, Method::PATCH, path, Some(body.into())).await
    }

    pub async fn delete(&self, ctx: &RequestContext, path: &str) -> Result<Response> {
        self.request(ctx, Method::DELETE, path, None).await
    }

    /// Sends `method` to `path` (relative to the base URL) with retries.
    pub async fn request(
        &self,
        ctx: &RequestContext,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let mut request = HttpRequest::new(method, self.url(path)?);
        request.body = body;
        self.send(ctx, request).await
    }

    /// Performs one logical operation.
    ///
    /// 429 and 5xx responses are retried within their own budgets. Any
    /// other failure counts against the circuit breaker and is returned as
    /// [`Error::Request`]. An open circuit fails with [`Error::CircuitOpen`]
    /// before touching the network.
    pub async fn send(&self, ctx: &RequestContext, request: HttpRequest) -> Result<Response> {
        self.execute(ctx, request, Retries::Enabled).await
    }

    /// Sends exactly one attempt, raced against `ctx`, and records its
    /// rate-limit headers. Status codes are not interpreted.
    pub async fn send_once(&self, ctx: &RequestContext, request: &HttpRequest) -> Result<Response> {
        let response = ctx
            .run(async {
                self.transport
                    .send(request)
                    .await
                    .map_err(Error::Transport)
            })
            .await?;
        self.rate_limits.observe(response.headers());
        Ok(response)
    }

    pub(crate) async fn execute(
        &self,
        ctx: &RequestContext,
        mut request: HttpRequest,
        retries: Retries,
    ) -> Result<Response> {
        if request.timeout.is_none() {
            request.timeout = Some(attempt_timeout(self.options.timeout_ms));
        }

        if self.breaker.is_open() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "circuit breaker open, rejecting {} {}",
                request.method,
                request.url
            );
            return Err(Error::CircuitOpen);
        }

        let policy = &self.options.retry;
        let (max_rate_limit, max_server_error) = match retries {
            Retries::Enabled => (
                policy.max_rate_limit_retries,
                policy.max_server_error_retries,
            ),
            Retries::Disabled => (0, 0),
        };
        let mut rate_limit_retries = 0u32;
        let mut server_error_retries = 0u32;

        loop {
            let response = match self.send_once(ctx, &request).await {
                Ok(response) => response,
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => return Err(self.fail(&request, None, err)),
            };
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let delay = retry_after(response.headers()).unwrap_or_else(|| {
                    rate_limit_backoff(policy.rate_limit_base_delay, rate_limit_retries)
                });
                if rate_limit_retries >= max_rate_limit {
                    let cause = Error::RateLimited { retry_after: delay };
                    return Err(self.fail(&request, Some(status), cause));
                }

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "rate limited on {} {}, retrying after {} ms",
                    request.method,
                    request.url,
                    delay.as_millis()
                );
                ctx.sleep(delay).await?;
                rate_limit_retries += 1;
                continue;
            }

            if status.is_server_error() && server_error_retries < max_server_error {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "server error {} on {} {}, retrying after {} ms",
                    status.as_u16(),
                    request.method,
                    request.url,
                    policy.server_error_retry_delay.as_millis()
                );
                ctx.sleep(policy.server_error_retry_delay).await?;
                server_error_retries += 1;
                continue;
            }

            if status.is_client_error() || status.is_server_error() {
                let cause = Error::from_status(status.as_u16(), response.body());
                return Err(self.fail(&request, Some(status), cause));
            }

            self.breaker.record_success();
            return Ok(response);
        }
    }

    /// Counts a final failure against the breaker and annotates it.
    fn fail(&self, request: &HttpRequest, status: Option<StatusCode>, cause: Error) -> Error {
        if self.breaker.record_failure() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "circuit breaker opened after {} consecutive failures",
                self.breaker.failure_count()
            );
        }
        Error::Request {
            method: request.method.clone(),
            url: request.url.to_string(),
            status: status.map(|status| status.as_u16()),
            source: Box::new(cause),
        }
    }
}

fn breaker_for(options: &ClientOptions) -> CircuitBreaker {
    CircuitBreaker::new(
        options.retry.circuit_breaker_threshold,
        options.retry.circuit_breaker_reset,
    )
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let invalid = |reason: String| Error::InvalidUrl {
        url: raw.to_owned(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_owned()));
    }
    Ok(url)
}

/// Exponential 429 backoff: `base * 2^retry`, exponent capped at 16.
fn rate_limit_backoff(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(1u32 << retry.min(16))
}
