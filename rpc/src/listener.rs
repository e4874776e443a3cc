//! The listener: one worker per stream reading raw messages, decoding them and forwarding the values.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::time::Duration;
//! use futures_util::stream;
//! use rpchan::{codec::JsonCodec, context::Context, listener::Listener, source::{from_stream, RawMessage}};
//!
//! #[derive(serde::Deserialize, Debug)]
//! struct T { a: i32, b: i32, c: String }
//!
//! let source = from_stream(stream::iter(vec![
//!     Ok(RawMessage::new(br#"{"a":1,"b":2,"c":"x"}"#.to_vec())),
//!     Ok(RawMessage::new(br#"{"a":3,"b":4,"c":"y"}"#.to_vec())),
//! ]));
//! let (ctx, _) = Context::background().with_timeout(Duration::from_secs(10));
//!
//! let mut values = Listener::new(source, JsonCodec).listen::<T>(&ctx, 1);
//! while let Some(v) = values.next().await {
//!     println!("{v:?}");
//! }
//! # }
//! ```
use std::{sync::Arc, time::Duration};

use async_channel::Sender;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::{oneshot, watch},
    time::timeout,
};

use crate::{
    codec::Decoder,
    context::Context,
    source::{SourceError, StreamSource},
    subscription::{output_channel, Envelope, ListenerState, Shared, Subscription, Termination},
};

/// What a listener does with a message that fails decoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeErrorPolicy {
    /// Drop the message, count it, and keep listening
    #[default]
    Skip,
    /// End the sequence with [`Termination::Decode`]
    Terminate,
}

/// Listener configuration
///
/// Deserializable so it can live in the caller's own configuration, eg:
/// `{"buffer_size": 16, "decode_errors": "terminate", "close_timeout_ms": 250}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Capacity of the output channel, 0 hands every value directly to a waiting consumer
    #[serde(default)]
    pub buffer_size: usize,
    #[serde(default)]
    pub decode_errors: DecodeErrorPolicy,
    /// Upper bound for releasing the source before the output channel is closed anyway
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

fn default_close_timeout_ms() -> u64 {
    1_000
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            decode_errors: DecodeErrorPolicy::default(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

/// Adapter from a [`StreamSource`] to a typed [`Subscription`]
///
/// The listener owns the source: [`listen`](#method.listen) consumes it and moves the source into the worker, which
/// is the only reader of the source for its whole life.
pub struct Listener<S, D> {
    source: S,
    decoder: D,
    config: ListenerConfig,
}

impl<S, D> Listener<S, D>
where
    S: StreamSource + 'static,
{
    pub fn new(source: S, decoder: D) -> Self {
        Self {
            source,
            decoder,
            config: ListenerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn decode_errors(mut self, policy: DecodeErrorPolicy) -> Self {
        self.config.decode_errors = policy;
        self
    }

    /// Spawns the worker and returns the sequence of decoded values right away
    ///
    /// The context may already be done, in which case the sequence is empty. Must be called within a tokio runtime.
    pub fn listen<T>(mut self, ctx: &Context, buffer_size: usize) -> Subscription<T>
    where
        D: Decoder<T>,
        T: Send + 'static,
    {
        self.config.buffer_size = buffer_size;
        self.start(ctx)
    }

    /// Same as [`listen`](#method.listen) using the configured buffer size
    pub fn start<T>(self, ctx: &Context) -> Subscription<T>
    where
        D: Decoder<T>,
        T: Send + 'static,
    {
        let (ctx, cancel) = ctx.with_cancel();
        let (sender, receiver) = output_channel(self.config.buffer_size);
        let (state_tx, state_rx) = watch::channel(ListenerState::Running);
        let shared = Arc::new(Shared::new(state_rx));

        let worker = Worker {
            source: self.source,
            decoder: self.decoder,
            config: self.config,
            ctx: ctx.clone(),
            sender,
            shared: shared.clone(),
            state: state_tx,
        };
        tokio::spawn(worker.run());

        Subscription::new(receiver, ctx, cancel, shared)
    }
}

/// Shorthand for `Listener::new(source, decoder).listen(ctx, buffer_size)`
pub fn listen<T, S, D>(ctx: &Context, source: S, decoder: D, buffer_size: usize) -> Subscription<T>
where
    S: StreamSource + 'static,
    D: Decoder<T>,
    T: Send + 'static,
{
    Listener::new(source, decoder).listen(ctx, buffer_size)
}

enum Push {
    Delivered,
    Cancelled,
    ConsumerGone,
}

struct Worker<S, D, T> {
    source: S,
    decoder: D,
    config: ListenerConfig,
    ctx: Context,
    sender: Sender<Envelope<T>>,
    shared: Arc<Shared>,
    state: watch::Sender<ListenerState>,
}

impl<S, D, T> Worker<S, D, T>
where
    S: StreamSource,
    D: Decoder<T>,
    T: Send + 'static,
{
    async fn run(mut self) {
        debug!(
            "> Listener > started with buffer size {}",
            self.config.buffer_size
        );
        let termination = self.process().await;

        self.state.send_replace(ListenerState::Draining);
        let close_timeout = Duration::from_millis(self.config.close_timeout_ms);
        if timeout(close_timeout, self.source.close()).await.is_err() {
            warn!("> Listener > releasing the source took longer than {close_timeout:?}");
        }

        debug!("> Listener > stopped: {termination:?}");
        self.shared.terminate(termination);
        self.sender.close();
        self.state.send_replace(ListenerState::Closed);
    }

    async fn process(&mut self) -> Termination {
        loop {
            let received = select! {
                biased;
                _ = self.ctx.done() => return self.cancelled(),
                received = self.source.receive() => received,
            };

            let raw = match received {
                Ok(raw) => raw,
                Err(SourceError::Closed) => return Termination::SourceClosed,
                Err(error) => {
                    error!("> Listener > stream failed: {error}");
                    return Termination::Source(Arc::new(error));
                }
            };
            self.shared.record_received();

            let value = match self.decoder.decode(&raw) {
                Ok(value) => value,
                Err(error) => {
                    self.shared.record_decode_error();
                    warn!(
                        "> Listener > dropping message {:?}: {error}",
                        raw.sequence_id
                    );
                    match self.config.decode_errors {
                        DecodeErrorPolicy::Skip => continue,
                        DecodeErrorPolicy::Terminate => {
                            return Termination::Decode(Arc::new(error))
                        }
                    }
                }
            };

            let pushed =
                Self::push(&self.ctx, &self.sender, self.config.buffer_size, value).await;
            match pushed {
                Push::Delivered => self.shared.record_delivered(),
                Push::Cancelled => return self.cancelled(),
                Push::ConsumerGone => return Termination::ConsumerGone,
            }
        }
    }

    /// Hands a value to the output channel, racing the push against the context
    ///
    /// Without buffer the push completes only once a consumer took the value.
    async fn push(
        ctx: &Context,
        sender: &Sender<Envelope<T>>,
        buffer_size: usize,
        value: T,
    ) -> Push {
        let (handoff, taken) = if buffer_size == 0 {
            let (handoff, taken) = oneshot::channel();
            (Some(handoff), Some(taken))
        } else {
            (None, None)
        };

        let sent = select! {
            biased;
            _ = ctx.done() => return Push::Cancelled,
            sent = sender.send(Envelope { value, handoff }) => sent,
        };
        if sent.is_err() {
            return Push::ConsumerGone;
        }

        match taken {
            None => Push::Delivered,
            Some(taken) => select! {
                biased;
                _ = ctx.done() => Push::Cancelled,
                taken = taken => match taken {
                    Ok(()) => Push::Delivered,
                    // the envelope was dropped without being taken
                    Err(_) => Push::ConsumerGone,
                },
            },
        }
    }

    fn cancelled(&self) -> Termination {
        // dropping the last subscription cancels the listener context after releasing its receiver
        if self.sender.receiver_count() == 0 {
            return Termination::ConsumerGone;
        }
        match self.ctx.err() {
            Some(cause) => Termination::Cancelled(cause),
            None => Termination::ConsumerGone,
        }
    }
}
