use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{transport::TransportError, Error, Result};

/// Cancellation signal and optional deadline carried through one logical
/// operation.
///
/// Every backoff sleep, poll sleep and request attempt is raced against the
/// context. Cancelling a context also cancels every context derived from it.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// A context with no deadline that is never cancelled unless asked to.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `token` as the cancellation signal.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel: token,
        }
    }

    /// Derives a context that ends at `deadline` or at the current deadline,
    /// whichever comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// Derives a context ending `timeout` from now. A timeout too large to
    /// represent as an instant keeps the current deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => Self {
                deadline: self.deadline,
                cancel: self.cancel.child_token(),
            },
        }
    }

    /// Like [`RequestContext::with_timeout`], but a zero timeout leaves the
    /// context unchanged. An existing tighter deadline is never loosened.
    pub fn with_optional_timeout(&self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            return self.clone();
        }
        self.with_timeout(timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, or `None` when there is none.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fails with the matching cancellation kind if the context is done.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleeps for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// Drives `fut` to completion unless the context ends first.
    ///
    /// Cancellation wins over a simultaneously ready result.
    pub(crate) async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Canceled),
            _ = expired => Err(Error::DeadlineExceeded),
            out = fut => out.map_err(|err| self.normalize(err)),
        }
    }

    /// Maps however a transport reports cancellation onto the two canonical
    /// kinds. Errors unrelated to this context pass through unchanged.
    pub(crate) fn normalize(&self, err: Error) -> Error {
        if err.is_cancellation() {
            return err;
        }
        if let Err(done) = self.check() {
            return done;
        }
        match err.root_cause() {
            Error::Transport(TransportError::Canceled) => Error::Canceled,
            _ => err,
        }
    }
}
