//! Retry loop for single remote operations
//!
//! Each attempt runs as its own tokio task so that a hung or panicking
//! attempt cannot take the caller down with it. The loop waits on either the
//! attempt's result or the context finishing, whichever comes first.
//!
//! Errors are classified by the caller-supplied `tolerate` predicates: a
//! tolerated error is retried after a short backoff, anything else is returned
//! at once. When the context finishes, the most recent tolerated error is
//! returned in preference to the bare context error, so callers see the
//! substantive cause.
//!
//! # Example
//!
//! ```ignore
//! let doc = retry(&ctx, || {
//!     let client = client.clone();
//!     let key = key.clone();
//!     async move { client.get(&key).await }
//! }, &[ClientError::is_malformed_response]).await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::cancel::{CancelError, RunContext};

/// Predicate marking an error as transient
pub type Tolerate<E> = fn(&E) -> bool;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Why a retried operation gave up
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation's own error: untolerated, or the last tolerated one
    /// observed before the context finished
    #[error("{0}")]
    Operation(E),

    /// The context finished before any attempt failed
    #[error("{0}")]
    Context(#[from] CancelError),

    /// An attempt panicked or was torn down outside of shutdown
    #[error("operation aborted: {0}")]
    Aborted(String),
}

impl<E> RetryError<E> {
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, RetryError::Context(CancelError::DeadlineExceeded))
    }
}

/// Run `operation` until it succeeds, fails untolerated, or `ctx` is done
pub async fn retry<T, E, F, Fut>(
    ctx: &RunContext,
    mut operation: F,
    tolerate: &[Tolerate<E>],
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    let mut last: Option<RetryError<E>> = None;
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        if let Some(cause) = ctx.err() {
            return Err(expired(cause, last));
        }

        let mut handle = tokio::spawn(operation());
        let joined = tokio::select! {
            joined = &mut handle => joined,
            cause = ctx.done() => {
                handle.abort();
                debug!(attempt = attempt, cause = %cause, "Retry interrupted by context");
                return Err(expired(cause, last));
            }
        };

        let err = match joined {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "Retry succeeded");
                }
                return Ok(value);
            }
            Ok(Err(err)) => {
                if !tolerate.iter().any(|t| t(&err)) {
                    return Err(RetryError::Operation(err));
                }
                debug!(
                    attempt = attempt,
                    backoff = ?backoff,
                    error = %err,
                    "Tolerated error, retrying"
                );
                RetryError::Operation(err)
            }
            Err(join_err) => {
                let reason = describe_join_error(join_err);
                if !ctx.is_shutting_down() {
                    warn!(attempt = attempt, reason = %reason, "Retry attempt aborted");
                    return Err(RetryError::Aborted(reason));
                }
                debug!(
                    attempt = attempt,
                    reason = %reason,
                    "Attempt aborted during shutdown, treating as transient"
                );
                RetryError::Aborted(reason)
            }
        };
        last = Some(err);

        if let Err(cause) = ctx.sleep(backoff).await {
            return Err(expired(cause, last));
        }
        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
    }
}

/// Run an operation that may be absent; a missing operation succeeds at once
pub async fn retry_optional<T, E, F, Fut>(
    ctx: &RunContext,
    operation: Option<F>,
    tolerate: &[Tolerate<E>],
) -> Result<Option<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    match operation {
        Some(op) => retry(ctx, op, tolerate).await.map(Some),
        None => {
            debug!("No operation given to retry, ignoring");
            Ok(None)
        }
    }
}

fn expired<E>(cause: CancelError, last: Option<RetryError<E>>) -> RetryError<E> {
    last.unwrap_or(RetryError::Context(cause))
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_cancelled() {
        return "attempt was cancelled".to_string();
    }
    let panic = err.into_panic();
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "attempt panicked".to_string()
    }
}
