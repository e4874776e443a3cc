//! The stream source capability a listener reads raw messages from.
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::transports::TransportError;

/// Opaque payload received from a stream, plus the sequence marker when the source has one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub payload: Bytes,
    pub sequence_id: Option<u32>,
}

impl RawMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            sequence_id: None,
        }
    }

    pub fn with_sequence(mut self, sequence_id: u32) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }
}

impl From<Vec<u8>> for RawMessage {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

/// Why a source stopped producing messages
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The remote half ended the stream gracefully
    #[error("stream closed by the remote half")]
    Closed,
    /// The wire failed underneath the stream
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The remote half answered with an error instead of the next message
    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },
}

/// An open RPC stream
///
/// A source has exactly one reader: the listener owning it takes it by value and drives it from a single task.
#[async_trait]
pub trait StreamSource: Send {
    /// Waits for the next message
    ///
    /// Must be cancel safe: the listener races this future against its cancellation signal and drops it when the
    /// signal wins.
    async fn receive(&mut self) -> Result<RawMessage, SourceError>;

    /// Releases the underlying resources, called once before the listener stops
    async fn close(&mut self) {}
}

#[async_trait]
impl<S: StreamSource + ?Sized> StreamSource for Box<S> {
    async fn receive(&mut self) -> Result<RawMessage, SourceError> {
        (**self).receive().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

/// [`StreamSource`] over any [`Stream`] of raw messages, see [`from_stream`]
///
/// The end of the inner stream is a graceful close, an `Err` item a transport failure.
pub struct StreamAdapter<St> {
    inner: Pin<Box<St>>,
}

/// Adapts a [`Stream`] of raw messages into a [`StreamSource`]
pub fn from_stream<St>(stream: St) -> StreamAdapter<St>
where
    St: Stream<Item = Result<RawMessage, TransportError>> + Send,
{
    StreamAdapter {
        inner: Box::pin(stream),
    }
}

#[async_trait]
impl<St> StreamSource for StreamAdapter<St>
where
    St: Stream<Item = Result<RawMessage, TransportError>> + Send,
{
    async fn receive(&mut self) -> Result<RawMessage, SourceError> {
        match self.inner.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(error)) => Err(SourceError::Transport(error)),
            None => Err(SourceError::Closed),
        }
    }
}
