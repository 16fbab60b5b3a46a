use std::time::Duration;

use reqwest::StatusCode;
use url::Url;

use crate::{
    client::Retries, options::DEFAULT_POLL_INTERVAL, ApiClient, Error, HttpRequest,
    RequestContext, Response, Result,
};

/// Resolves an async follow-up `location` against `base`.
///
/// Relative locations are joined onto the base URL. The result must share
/// the base URL's scheme, host (ignoring case) and effective port, so a
/// backend cannot send the poller to another origin.
pub fn resolve_location(base: &Url, location: &str) -> Result<Url> {
    let trimmed = location.trim();
    let invalid = |reason: String| Error::InvalidUrl {
        url: location.to_owned(),
        reason,
    };
    if trimmed.is_empty() {
        return Err(invalid("empty async location".to_owned()));
    }

    let resolved = base.join(trimmed).map_err(|err| invalid(err.to_string()))?;

    if !resolved.scheme().eq_ignore_ascii_case(base.scheme()) {
        return Err(invalid(format!(
            "scheme '{}' does not match base scheme '{}'",
            resolved.scheme(),
            base.scheme()
        )));
    }
    let same_host = match (resolved.host_str(), base.host_str()) {
        (Some(host), Some(base_host)) => host.eq_ignore_ascii_case(base_host),
        _ => false,
    };
    if !same_host {
        return Err(invalid(format!(
            "host {:?} does not match base host {:?}",
            resolved.host_str().unwrap_or_default(),
            base.host_str().unwrap_or_default()
        )));
    }
    if resolved.port_or_known_default() != base.port_or_known_default() {
        return Err(invalid(format!(
            "port {:?} does not match base port {:?}",
            resolved.port_or_known_default(),
            base.port_or_known_default()
        )));
    }

    Ok(resolved)
}

/// Per-loop bookkeeping, dropped when the loop returns.
struct AsyncWaitState {
    url: Url,
    delay: Duration,
    iteration: usize,
}

impl ApiClient {
    /// Sends `request`; when the backend answers 202 with a `Location`
    /// header, polls that location until the operation finishes.
    pub async fn send_and_wait(&self, ctx: &RequestContext, request: HttpRequest) -> Result<Response> {
        let response = self.send(ctx, request).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Ok(response);
        }
        match response.location() {
            Some(location) => {
                let location = location.to_owned();
                self.wait_for_async(ctx, &location, &response).await
            }
            None => Ok(response),
        }
    }

    /// Polls `location` until it stops answering 202.
    ///
    /// Each poll is preceded by a wait derived from the previous response's
    /// `Retry-After` or rate-limit headers, falling back to the configured
    /// poll interval. Polls are sent without 429/5xx retries. The first
    /// non-202 success is returned verbatim. Exceeding the iteration cap
    /// fails with [`Error::AsyncWaitExceeded`]; the configured overall
    /// timeout tightens, but never loosens, the deadline on `ctx`.
    pub async fn wait_for_async(
        &self,
        ctx: &RequestContext,
        location: &str,
        initial: &Response,
    ) -> Result<Response> {
        let url = resolve_location(self.base_url(), location)?;
        let wait = &self.options().async_wait;
        let ctx = ctx.with_optional_timeout(wait.timeout);

        let mut state = AsyncWaitState {
            url,
            delay: self.poll_delay(initial),
            iteration: 0,
        };

        loop {
            if state.iteration >= wait.max_iterations {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "giving up on {} after {} polls, operation may still be running",
                    state.url,
                    state.iteration
                );
                return Err(Error::AsyncWaitExceeded {
                    location: state.url.to_string(),
                    iterations: state.iteration,
                });
            }

            ctx.sleep(state.delay).await?;
            state.iteration += 1;

            #[cfg(feature = "tracing")]
            tracing::debug!("polling {} (attempt {})", state.url, state.iteration);

            let response = self
                .execute(&ctx, HttpRequest::get(state.url.clone()), Retries::Disabled)
                .await?;
            if response.status() != StatusCode::ACCEPTED {
                return Ok(response);
            }
            state.delay = self.poll_delay(&response);
        }
    }

    fn poll_delay(&self, response: &Response) -> Duration {
        self.rate_limit_tracker()
            .hinted_delay(response.headers())
            .or(self.options().async_wait.poll_interval)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }
}
