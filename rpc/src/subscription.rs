//! The consuming side of a listener: a lazy, single traversal sequence of decoded values.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};

use async_channel::{Receiver, Sender};
use futures_util::{stream, Stream};
use log::debug;
use tokio::{
    select,
    sync::{oneshot, watch},
};

use crate::{
    codec::DecodeError,
    context::{CancelHandle, Context, ContextError},
    source::SourceError,
};

/// Lifecycle of the worker behind a [`Subscription`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Reading, decoding and forwarding messages
    Running,
    /// The loop stopped and the source is being released
    Draining,
    /// The source was released and the output channel closed
    Closed,
}

/// Why the sequence ended
#[derive(Debug, Clone)]
pub enum Termination {
    /// The context was cancelled or its deadline elapsed
    Cancelled(ContextError),
    /// The remote half ended the stream gracefully
    SourceClosed,
    /// The transport failed or the remote half answered with an error
    Source(Arc<SourceError>),
    /// A message failed decoding under [`DecodeErrorPolicy::Terminate`](crate::listener::DecodeErrorPolicy::Terminate)
    Decode(Arc<DecodeError>),
    /// Every [`Subscription`] was dropped
    ConsumerGone,
}

impl Termination {
    /// `true` for the endings that aren't failures: cancellation, graceful close and abandoned subscriptions
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_) | Self::SourceClosed | Self::ConsumerGone
        )
    }
}

/// Counters of a listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamMetrics {
    pub messages_received: u64,
    /// Values accepted by the output channel
    pub values_delivered: u64,
    pub decode_errors: u64,
}

/// State shared between the worker and every [`Subscription`] handle
pub(crate) struct Shared {
    messages_received: AtomicU64,
    values_delivered: AtomicU64,
    decode_errors: AtomicU64,
    termination: OnceLock<Termination>,
    state: watch::Receiver<ListenerState>,
}

impl Shared {
    pub(crate) fn new(state: watch::Receiver<ListenerState>) -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            values_delivered: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            termination: OnceLock::new(),
            state,
        }
    }

    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.values_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn terminate(&self, termination: Termination) {
        let _ = self.termination.set(termination);
    }

    fn metrics(&self) -> StreamMetrics {
        StreamMetrics {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            values_delivered: self.values_delivered.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// A value in the output channel
///
/// With a zero sized buffer the worker waits on `handoff` until a consumer took the value.
pub(crate) struct Envelope<T> {
    pub(crate) value: T,
    pub(crate) handoff: Option<oneshot::Sender<()>>,
}

/// Creates the write and read halves of an output channel
///
/// `buffer_size == 0` still needs one slot to pass the value, the rendezvous happens through the envelope handoff.
pub(crate) fn output_channel<T>(buffer_size: usize) -> (Sender<Envelope<T>>, Receiver<Envelope<T>>) {
    async_channel::bounded(buffer_size.max(1))
}

/// Cancels the worker once the last [`Subscription`] handle is dropped
struct AbandonGuard(CancelHandle);

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        debug!("> Subscription > every handle dropped, stopping listener");
        self.0.cancel();
    }
}

/// Sequence of values decoded by a [`Listener`](crate::listener::Listener)
///
/// It exposes only "take next value, or observe end-of-sequence". Clones share the same sequence: each value is
/// handed to exactly one of them, and all of them observe the end.
pub struct Subscription<T> {
    receiver: Receiver<Envelope<T>>,
    /// Listener scoped child of the caller's context
    ctx: Context,
    shared: Arc<Shared>,
    _guard: Arc<AbandonGuard>,
    finished: bool,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            ctx: self.ctx.clone(),
            shared: self.shared.clone(),
            _guard: self._guard.clone(),
            finished: self.finished,
        }
    }
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        receiver: Receiver<Envelope<T>>,
        ctx: Context,
        cancel: CancelHandle,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            receiver,
            ctx,
            shared,
            _guard: Arc::new(AbandonGuard(cancel)),
            finished: false,
        }
    }

    /// Waits for the next value
    ///
    /// Returns `None` once the sequence ended, and on every call after that. Nothing is returned once the context is
    /// done, even values already sitting in the buffer.
    pub async fn next(&mut self) -> Option<T> {
        if self.finished {
            return None;
        }

        let received = select! {
            biased;
            _ = self.ctx.done() => None,
            envelope = self.receiver.recv() => envelope.ok(),
        };

        match received {
            Some(Envelope { value, handoff }) => {
                if let Some(handoff) = handoff {
                    // the worker may have given up on the handoff already, the value is ours anyway
                    let _ = handoff.send(());
                }
                Some(value)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Turns the subscription into a [`Stream`] of values
    pub fn into_stream(self) -> impl Stream<Item = T> {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|value| (value, subscription))
        })
    }

    /// Collects every remaining value until the end of the sequence
    pub async fn collect(mut self) -> Vec<T> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await {
            values.push(value);
        }
        values
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }

    /// `None` while the worker runs, the reason it stopped afterwards
    pub fn termination(&self) -> Option<Termination> {
        self.shared.termination.get().cloned()
    }

    /// Waits until the worker released the source and closed the output channel, and returns why it stopped
    pub async fn closed(&self) -> Option<Termination> {
        let mut state = self.shared.state.clone();
        loop {
            if *state.borrow_and_update() == ListenerState::Closed {
                break;
            }
            if state.changed().await.is_err() {
                break;
            }
        }
        self.termination()
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.shared.metrics()
    }

    /// The context bounding this subscription
    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("state", &self.state())
            .field("metrics", &self.metrics())
            .field("finished", &self.finished)
            .finish()
    }
}
