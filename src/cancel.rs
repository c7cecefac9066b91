//! Deadline-bearing cancellation context
//!
//! Every suspension point in the engine (retry attempts, polling sleeps,
//! namespace teardown) races against a `RunContext`. A context carries a
//! cancellation token shared with the surrounding run, an optional deadline,
//! and a shutdown flag that is raised when the whole run is being torn down.
//!
//! # Example
//!
//! ```
//! use koe::cancel::RunContext;
//! use std::time::Duration;
//!
//! let run = RunContext::new();
//! let step = run.with_timeout(Duration::from_secs(30));
//! assert!(step.remaining().is_some());
//! assert!(run.remaining().is_none());
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation scope passed to every engine operation
#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    shutdown: Arc<AtomicBool>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    /// Root context with no deadline
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Root context driven by an existing token
    #[must_use]
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Child context that expires after `timeout`, or earlier if the parent does
    ///
    /// Cancelling the child never cancels the parent.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Child context sharing this deadline, cancellable on its own
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Enter the shutdown phase and cancel everything below this context
    ///
    /// While shutting down, the retry boundary treats a panicking attempt as a
    /// transient failure instead of an aborted operation.
    pub fn begin_shutdown(&self) {
        self.mark_shutdown();
        self.token.cancel();
    }

    /// Raise the shutdown flag without cancelling anything yet
    pub fn mark_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// `Some` once the context is cancelled or past its deadline
    pub fn err(&self) -> Option<CancelError> {
        if self.token.is_cancelled() {
            return Some(CancelError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is done
    pub async fn done(&self) -> CancelError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.token.cancelled() => CancelError::Cancelled,
                () = tokio::time::sleep_until(deadline) => CancelError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancelError::Cancelled
            }
        }
    }

    /// Sleep for `duration` unless the context finishes first
    pub async fn sleep(&self, duration: Duration) -> Result<(), CancelError> {
        tokio::select! {
            biased;
            cause = self.done() => Err(cause),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the context finishes first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CancelError> {
        if let Some(cause) = self.err() {
            return Err(cause);
        }
        tokio::select! {
            out = fut => Ok(out),
            cause = self.done() => Err(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_child_deadline_never_exceeds_parent() {
        let parent = RunContext::new().with_timeout(Duration::from_secs(5));
        let child = parent.with_timeout(Duration::from_secs(60));

        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_reports_deadline() {
        let ctx = RunContext::new().with_timeout(Duration::from_millis(200));
        assert_eq!(ctx.done().await, CancelError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(CancelError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children_only() {
        let parent = RunContext::new();
        let child = parent.child();

        child.cancel();
        assert_eq!(child.err(), Some(CancelError::Cancelled));
        assert_eq!(parent.err(), None);

        let other = parent.child();
        parent.cancel();
        assert_eq!(other.done().await, CancelError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_deadline() {
        let ctx = RunContext::new().with_timeout(Duration::from_secs(1));
        let result = ctx.sleep(Duration::from_secs(10)).await;
        assert_eq!(result, Err(CancelError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_shutdown_flag_is_shared() {
        let root = RunContext::new();
        let step = root.with_timeout(Duration::from_secs(30));

        root.begin_shutdown();
        assert!(step.is_shutting_down());
        assert_eq!(step.err(), Some(CancelError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_returns_output() {
        let ctx = RunContext::new();
        let out = ctx.run(async { 7 }).await;
        assert_eq!(out, Ok(7));
    }
}
