//! Transports carrying the frames of an RPC stream between two ends.
//!
//! The stream protocol uses protobuf for the frames format and runs over whatever transport or wire meets the
//! requirements of the [`Transport`] trait.
//!
use async_trait::async_trait;

pub mod error;
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "websockets")]
pub mod web_socket;

#[derive(Debug)]
pub enum TransportEvent {
    /// The connect event is emitted when the transport gets connected.
    Connect,
    /// A frame received from the other end
    Message(Vec<u8>),
    /// The error event is emitted when the underlying wire reports an error without closing
    Error(String),
    /// The other end decided to end the communication
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Error while the underlying transport is running.
    ///
    /// For example: A peer reset the connection in a websocket connection
    ///
    #[error("transport failure: {0}")]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// Transport is already closed
    #[error("transport is closed")]
    Closed,
    /// When the received message is not a binary
    #[error("received a non binary message")]
    NotBinaryMessage,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn receive(&self) -> Result<TransportEvent, TransportError>;
    async fn send(&self, message: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&self);
    fn is_connected(&self) -> bool;
}
