//! Contains the conversions from the errors of the current transports.
use std::{io, net::AddrParseError};

use super::TransportError;

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        TransportError::Internal(Box::new(value))
    }
}

impl From<AddrParseError> for TransportError {
    fn from(value: AddrParseError) -> Self {
        TransportError::Internal(Box::new(value))
    }
}

#[cfg(feature = "websockets")]
impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;

        match value {
            ConnectionClosed | AlreadyClosed => TransportError::Closed,
            other => TransportError::Internal(Box::new(other)),
        }
    }
}
