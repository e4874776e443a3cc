//! Both halves of an RPC stream carried by a [`Transport`].
//!
//! The producing half ([`StreamPublisher`]) sends an opening [`StreamMessage`], then one frame per payload, waiting for
//! the consumer's acknowledgement of each frame before sending the next one, and finally a `closed` frame.
//!
//! The consuming half ([`StreamProtocol`]) acknowledges every frame as soon as it's received and hands the payloads to
//! a [`Listener`](crate::listener::Listener) as a [`StreamSource`].
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use log::{debug, error};
use prost::Message;

use crate::{
    rpc_protocol::{
        parse::{build_message_identifier, fill_remote_error, parse_protocol_message, ParseErrors},
        RemoteError, RpcMessageTypes, StreamMessage,
    },
    source::{RawMessage, SourceError, StreamSource},
    transports::{Transport, TransportError, TransportEvent},
};

/// It knows how to consume the frames of a stream sent by a [`StreamPublisher`]
///
/// Frames for other message numbers sharing the transport are ignored.
pub struct StreamProtocol<T: Transport + ?Sized> {
    /// the ID of Port
    port_id: u32,
    /// ID of the message that inited the streaming
    message_number: u32,
    /// The last sequence id received in a [`StreamMessage`]
    last_received_sequence_id: u32,
    /// Flag to know if the remote half is closed or closed the stream
    is_remote_closed: bool,
    /// Flag to know if the close notification was already sent to the remote half
    is_local_closed: bool,
    /// The transport used for the communications
    transport: Arc<T>,
}

impl<T: Transport + ?Sized> StreamProtocol<T> {
    pub fn new(transport: Arc<T>, port_id: u32, message_number: u32) -> Self {
        Self {
            port_id,
            message_number,
            last_received_sequence_id: 0,
            is_remote_closed: false,
            is_local_closed: false,
            transport,
        }
    }

    pub fn last_received_sequence_id(&self) -> u32 {
        self.last_received_sequence_id
    }

    pub fn is_remote_closed(&self) -> bool {
        self.is_remote_closed
    }

    fn stream_message(&self, sequence_id: u32, closed: bool, ack: bool) -> StreamMessage {
        let message_type = if ack {
            RpcMessageTypes::StreamAck
        } else {
            RpcMessageTypes::StreamMessage
        };
        StreamMessage {
            port_id: self.port_id,
            sequence_id,
            message_identifier: build_message_identifier(
                message_type as u32,
                self.message_number,
            ),
            payload: vec![],
            closed,
            ack,
        }
    }

    /// It sends an ACK stream message to let the other half know that the stream is opened
    pub async fn acknowledge_open(&self) -> Result<(), TransportError> {
        self.acknowledge(0).await
    }

    /// Ack Message to let know the peer that we are ready to receive another message
    async fn acknowledge(&self, sequence_id: u32) -> Result<(), TransportError> {
        let ack = self.stream_message(sequence_id, false, true);
        self.transport.send(ack.encode_to_vec()).await
    }

    /// Handles a frame addressed to this stream, `None` when the frame isn't a payload for the listener
    async fn process_frame(&mut self, data: &[u8]) -> Option<Result<RawMessage, SourceError>> {
        let (message_type, message_number, stream_message) =
            match parse_protocol_message::<StreamMessage>(data) {
                Ok(parsed) => parsed,
                Err(ParseErrors::IsARemoteError((message_number, remote_error)))
                    if message_number == self.message_number =>
                {
                    self.is_remote_closed = true;
                    return Some(Err(SourceError::Remote {
                        code: remote_error.error_code,
                        message: remote_error.error_message,
                    }));
                }
                Err(error) => {
                    debug!("> StreamProtocol > ignoring frame: {error}");
                    return None;
                }
            };

        if message_number != self.message_number
            || !matches!(message_type, RpcMessageTypes::StreamMessage)
        {
            return None;
        }

        if stream_message.closed {
            debug!(
                "> StreamProtocol > stream {} closed by the remote half",
                self.message_number
            );
            self.is_remote_closed = true;
            return Some(Err(SourceError::Closed));
        }

        if stream_message.sequence_id == 0 {
            if let Err(error) = self.acknowledge_open().await {
                return Some(Err(error.into()));
            }
            return None;
        }

        self.last_received_sequence_id = stream_message.sequence_id;
        if let Err(error) = self.acknowledge(stream_message.sequence_id).await {
            return Some(Err(error.into()));
        }

        Some(Ok(
            RawMessage::new(stream_message.payload).with_sequence(stream_message.sequence_id)
        ))
    }
}

#[async_trait]
impl<T: Transport + ?Sized + 'static> StreamSource for StreamProtocol<T> {
    async fn receive(&mut self) -> Result<RawMessage, SourceError> {
        if self.is_remote_closed || self.is_local_closed {
            return Err(SourceError::Closed);
        }
        loop {
            match self.transport.receive().await {
                Ok(TransportEvent::Message(data)) => {
                    if let Some(result) = self.process_frame(&data).await {
                        return result;
                    }
                }
                Ok(TransportEvent::Connect) => continue,
                Ok(TransportEvent::Error(reason)) => {
                    error!("> StreamProtocol > transport error: {reason}");
                    return Err(TransportError::Internal(reason.into()).into());
                }
                Ok(TransportEvent::Close) => return Err(TransportError::Closed.into()),
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Lets the producing half know that nobody is listening anymore, unless it already closed the stream
    async fn close(&mut self) {
        if self.is_remote_closed || self.is_local_closed {
            return;
        }
        self.is_local_closed = true;
        let close_message = self.stream_message(self.last_received_sequence_id, true, false);
        if let Err(error) = self.transport.send(close_message.encode_to_vec()).await {
            debug!("> StreamProtocol > couldn't notify the close: {error}");
        }
    }
}

/// How a [`StreamPublisher::publish`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Every payload was acknowledged and the stream was closed
    Completed { sent: u32 },
    /// The consuming half closed the stream first
    ClosedByPeer { sent: u32 },
}

/// Producing half of an RPC stream
pub struct StreamPublisher<T: Transport + ?Sized> {
    port_id: u32,
    message_number: u32,
    transport: Arc<T>,
}

impl<T: Transport + ?Sized> StreamPublisher<T> {
    pub fn new(transport: Arc<T>, port_id: u32, message_number: u32) -> Self {
        Self {
            port_id,
            message_number,
            transport,
        }
    }

    fn stream_message(&self, sequence_id: u32, closed: bool, payload: Vec<u8>) -> StreamMessage {
        StreamMessage {
            closed,
            ack: false,
            sequence_id,
            message_identifier: build_message_identifier(
                RpcMessageTypes::StreamMessage as u32,
                self.message_number,
            ),
            port_id: self.port_id,
            payload,
        }
    }

    /// Sends every payload of `stream` through the transport, one acknowledged frame at a time
    pub async fn publish<S>(&self, stream: S) -> Result<PublishOutcome, TransportError>
    where
        S: Stream<Item = Vec<u8>> + Send,
    {
        let opening_message = self.stream_message(0, false, vec![]);
        self.transport.send(opening_message.encode_to_vec()).await?;
        if !self.wait_ack(0).await? {
            return Ok(PublishOutcome::ClosedByPeer { sent: 0 });
        }

        let mut sequence_number = 0;
        let mut stream = Box::pin(stream);
        while let Some(payload) = stream.next().await {
            sequence_number += 1;
            let current_message = self.stream_message(sequence_number, false, payload);
            self.transport.send(current_message.encode_to_vec()).await?;
            if !self.wait_ack(sequence_number).await? {
                debug!(
                    "> StreamPublisher > stream {} closed by the consumer after {} frames",
                    self.message_number, sequence_number
                );
                return Ok(PublishOutcome::ClosedByPeer {
                    sent: sequence_number,
                });
            }
        }

        let close_message = self.stream_message(sequence_number, true, vec![]);
        self.transport.send(close_message.encode_to_vec()).await?;

        Ok(PublishOutcome::Completed {
            sent: sequence_number,
        })
    }

    /// Ends the stream with an error instead of the next frame
    pub async fn fail(&self, error: impl Into<RemoteError>) -> Result<(), TransportError> {
        let mut remote_error = error.into();
        fill_remote_error(&mut remote_error, self.message_number);
        self.transport.send(remote_error.encode_to_vec()).await
    }

    /// Waits for the acknowledgement of `sequence_id`, `false` when the consumer closed the stream instead
    async fn wait_ack(&self, sequence_id: u32) -> Result<bool, TransportError> {
        loop {
            let data = match self.transport.receive().await? {
                TransportEvent::Message(data) => data,
                TransportEvent::Connect => continue,
                TransportEvent::Error(reason) => {
                    return Err(TransportError::Internal(reason.into()))
                }
                TransportEvent::Close => return Err(TransportError::Closed),
            };

            let (_, message_number, stream_message) =
                match parse_protocol_message::<StreamMessage>(&data) {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        debug!("> StreamPublisher > ignoring frame: {error}");
                        continue;
                    }
                };
            if message_number != self.message_number {
                continue;
            }
            if stream_message.closed {
                return Ok(false);
            }
            if stream_message.ack && stream_message.sequence_id == sequence_id {
                return Ok(true);
            }
        }
    }
}
