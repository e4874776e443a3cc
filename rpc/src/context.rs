//! Cancellation signal shared between the caller and a listener.
//!
//! A [`Context`] carries an optional deadline and a cancel trigger backed by a [`CancellationToken`]. Children
//! created with [`Context::with_cancel`], [`Context::with_deadline`] or [`Context::with_timeout`] are cancelled
//! together with their parent and never outlive the parent's deadline.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::time::Duration;
//! use rpchan::context::{Context, ContextError};
//!
//! let (ctx, cancel) = Context::background().with_timeout(Duration::from_secs(10));
//! assert!(ctx.err().is_none());
//! cancel.cancel();
//! ctx.done().await;
//! assert_eq!(ctx.err(), Some(ContextError::Canceled));
//! # }
//! ```
use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::{
    select,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

/// Why a [`Context`] is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// [`CancelHandle::cancel`] was called on this context or one of its parents
    #[error("context canceled")]
    Canceled,
    /// The deadline of this context or one of its parents elapsed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

struct ContextInner {
    token: CancellationToken,
    deadline: Option<Instant>,
    /// First recorded cause wins, the context is never un-cancelled
    cause: OnceLock<ContextError>,
    parent: Option<Context>,
}

/// Cheaply clonable cancellation signal, safe to observe from any number of concurrent waiters
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never done
    pub fn background() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                token: CancellationToken::new(),
                deadline: None,
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    fn child(&self, deadline: Option<Instant>) -> (Context, CancelHandle) {
        let deadline = match (self.inner.deadline, deadline) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        let ctx = Context {
            inner: Arc::new(ContextInner {
                token: self.inner.token.child_token(),
                deadline,
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        };
        let handle = CancelHandle { ctx: ctx.clone() };
        (ctx, handle)
    }

    /// Child context that can be cancelled through the returned [`CancelHandle`]
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        self.child(None)
    }

    /// Child context that is done once `deadline` is reached, or earlier if the parent deadline comes first
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        self.child(Some(deadline))
    }

    /// Same as [`with_deadline`](#method.with_deadline) with a deadline `timeout` from now
    ///
    /// A timeout too large to be represented as an instant adds no deadline of its own, the parent's one still applies.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.child(Instant::now().checked_add(timeout))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// The underlying token, cancelled once this context is done
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    fn cancel_with(&self, cause: ContextError) {
        let _ = self.inner.cause.set(cause);
        self.inner.token.cancel();
    }

    /// `None` while the context is live, otherwise the reason it is done
    ///
    /// Checking the error also fires an elapsed deadline, so a context whose deadline passed is reported as done
    /// even if nobody is waiting on [`done`](#method.done).
    pub fn err(&self) -> Option<ContextError> {
        if let Some(cause) = self.inner.cause.get() {
            return Some(*cause);
        }
        if let Some(cause) = self.inner.parent.as_ref().and_then(Context::err) {
            self.cancel_with(cause);
            return self.inner.cause.get().copied();
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                self.cancel_with(ContextError::DeadlineExceeded);
                return self.inner.cause.get().copied();
            }
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Completes once the context is cancelled or its deadline elapsed
    ///
    /// Cancel safe: dropping the future before completion has no effect on the context.
    pub async fn done(&self) {
        if self.err().is_some() {
            return;
        }
        match self.inner.deadline {
            Some(deadline) => {
                select! {
                    _ = self.inner.token.cancelled() => {},
                    _ = sleep_until(deadline) => {
                        self.cancel_with(ContextError::DeadlineExceeded);
                    }
                }
            }
            None => self.inner.token.cancelled().await,
        }
        // records the parent's cause when the cancellation came through the token hierarchy
        let _ = self.err();
    }
}

/// Cancels the [`Context`] it was created with, and every child of it
///
/// Dropping the handle does not cancel anything, so `let (ctx, _) = parent.with_timeout(..)` keeps the context alive
/// until its deadline.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    ctx: Context,
}

impl CancelHandle {
    /// Idempotent, the first cause recorded on the context is kept
    pub fn cancel(&self) {
        self.ctx.cancel_with(ContextError::Canceled);
    }
}
