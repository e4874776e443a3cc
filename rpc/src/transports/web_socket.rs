//! Websockets as the wire carrying an RPC stream.
//!
//! Enabled with the `websockets` feature.
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use log::{debug, error};
use tokio::{net::TcpStream, sync::Mutex};

/// A [`WebSocketStream`] from a WebSocket connection
pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write Stream Half of [`WebSocketStream`]
type WriteStream = SplitSink<Socket, Message>;

/// Read Stream Half of [`WebSocketStream`]
type ReadStream = SplitStream<Socket>;

/// WebSocketClient structure to connect to a WebSocket Server
pub struct WebSocketClient;

impl WebSocketClient {
    /// Connect to a websocket server and returns a [`WebSocketTransport`] if all went OK or a [`TransportError`] if there was a error on establishing the connection
    pub async fn connect(host: &str) -> Result<WebSocketTransport, TransportError> {
        let (ws, _) = connect_async(host).await?;
        debug!("> WebSocketClient > Connected to {}", host);
        Ok(WebSocketTransport::new(ws))
    }
}

/// Transport over an established websocket connection.
///
/// Only binary messages are frames of the stream, text messages are reported as [`TransportError::NotBinaryMessage`]
pub struct WebSocketTransport {
    /// The read stream half of the [`WebSocketStream`]
    ///
    /// It's inside a [`Mutex`] in order to meet the requirements of the [`Transport`] trait that doesn't have mutable methods so we should do _Interior Mutability_
    ///
    read: Mutex<ReadStream>,
    /// The write stream half of the [`WebSocketStream`]
    write: Mutex<WriteStream>,
    /// Field to know if the socket is still usable
    ready: AtomicBool,
}

impl WebSocketTransport {
    /// Creates a new [`WebSocketTransport`] from a websocket connection
    pub fn new(ws: Socket) -> Self {
        let (write, read) = ws.split();
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            ready: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn receive(&self) -> Result<TransportEvent, TransportError> {
        loop {
            let message = self.read.lock().await.next().await;
            match message {
                Some(Ok(Message::Binary(data))) => return Ok(TransportEvent::Message(data)),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    error!("> WebSocketTransport > Received message is not binary");
                    return Err(TransportError::NotBinaryMessage);
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("> WebSocketTransport > Closing transport...");
                    self.ready.store(false, Ordering::SeqCst);
                    return Ok(TransportEvent::Close);
                }
                Some(Err(err)) => {
                    error!("> WebSocketTransport > Failed to receive message {err}");
                    self.ready.store(false, Ordering::SeqCst);
                    return Err(err.into());
                }
            }
        }
    }

    async fn send(&self, message: Vec<u8>) -> Result<(), TransportError> {
        let message = Message::binary(message);
        match self.write.lock().await.send(message).await {
            Err(err) => {
                error!("> WebSocketTransport > Error on sending in a ws connection {err}");
                Err(err.into())
            }
            Ok(_) => Ok(()),
        }
    }

    async fn close(&self) {
        if self.is_connected() {
            match self.write.lock().await.close().await {
                Ok(_) => {
                    self.ready.store(false, Ordering::SeqCst);
                }
                _ => {
                    debug!("> WebSocketTransport > Couldn't close transport")
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
