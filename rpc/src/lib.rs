//! Turns an RPC response stream into a typed, cancellable, buffered sequence of values.
//!
//! A [`Listener`] takes ownership of a [`StreamSource`](source::StreamSource), decodes every raw message with a
//! [`Decoder`](codec::Decoder) and forwards the values to a [`Subscription`], racing every wait against a
//! [`Context`].
pub mod codec;
pub mod context;
pub mod listener;
pub mod rpc_protocol;
pub mod source;
pub mod stream_protocol;
pub mod subscription;
pub mod transports;

pub use codec::{decode_fn, Decoder, JsonCodec, ProstCodec};
pub use context::{CancelHandle, Context, ContextError};
pub use listener::{listen, DecodeErrorPolicy, Listener, ListenerConfig};
pub use source::{from_stream, RawMessage, SourceError, StreamSource};
pub use subscription::{ListenerState, StreamMetrics, Subscription, Termination};
