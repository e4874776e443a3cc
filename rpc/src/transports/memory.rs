//! MemoryTransport connects both halves of a stream running on the same process.
//!
//! The most common use case is for testing. It uses [`async_channel`] internally
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Transport, TransportError, TransportEvent};
use async_channel::{bounded, Receiver, Sender};
use async_trait::async_trait;
use log::debug;

/// Using channels for the communication between a consuming [`StreamProtocol`](crate::stream_protocol::StreamProtocol)
/// and a producing [`StreamPublisher`](crate::stream_protocol::StreamPublisher) running on the same process.
pub struct MemoryTransport {
    /// The sender half of an [`async_channel::bounded`] channel
    ///
    /// One end stores the sender half of the channel which the other end stores the receiver half and viceversa
    sender: Sender<Vec<u8>>,
    /// The receiver half of an [`async_channel::bounded`] channel
    receiver: Receiver<Vec<u8>>,
    /// Cleared once [`Transport::close`] is called or the other end is gone
    connected: AtomicBool,
}

impl MemoryTransport {
    fn new(sender: Sender<Vec<u8>>, receiver: Receiver<Vec<u8>>) -> Self {
        Self {
            sender,
            receiver,
            connected: AtomicBool::new(true),
        }
    }

    /// It creates two [`MemoryTransport`]s for the both ends using [`async_channel::bounded`]
    ///
    /// The first element in the tuple is the transport for the consuming end and the second one for the producing end
    pub fn create() -> (Self, Self) {
        Self::with_capacity(32)
    }

    /// Same as [`create`](#method.create) but with a custom amount of in-flight frames per direction
    pub fn with_capacity(capacity: usize) -> (Self, Self) {
        let (client_sender, server_receiver) = bounded::<Vec<u8>>(capacity.max(1));
        let (server_sender, client_receiver) = bounded::<Vec<u8>>(capacity.max(1));

        let client = Self::new(client_sender, client_receiver);
        let server = Self::new(server_sender, server_receiver);

        (client, server)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn receive(&self) -> Result<TransportEvent, TransportError> {
        match self.receiver.recv().await {
            Ok(message) => Ok(TransportEvent::Message(message)),
            Err(_) => {
                debug!("> MemoryTransport > the other end is gone");
                self.close().await;
                Err(TransportError::Closed)
            }
        }
    }

    async fn send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        match self.sender.send(message).await {
            Ok(_) => Ok(()),
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.receiver.close();
        self.sender.close();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
