//! Parsing functions for the frames exchanged by both halves of an RPC stream.
use super::{RemoteError, RpcMessageHeader, RpcMessageTypes};
use prost::Message;

/// Build message identifier from type and number, and returns one number which it's the `message_identifier`
///
/// `message_identifier` packs two numbers:
///
/// Bits from 1 to 28 correspond to the sequential message number (analogous to JSON-RPC 2)
///
/// Bits from 28 to 32 correspond to message type
pub fn build_message_identifier(message_type: u32, message_number: u32) -> u32 {
    ((message_type & 0xf) << 27) | (message_number & 0x07ffffff)
}

/// Parse message type and number from message identifier
///
/// Do the inverse calculation of `build_message_identifier`
pub fn parse_message_identifier(value: u32) -> (u32, u32) {
    ((value >> 27) & 0xf, value & 0x07ffffff)
}

/// Decode bytes into [`RpcMessageHeader`] to get message type and message number
pub fn parse_header(data: &[u8]) -> Option<(RpcMessageTypes, u32)> {
    let message_header = RpcMessageHeader::decode(data).ok()?;
    let (message_type, message_number) =
        parse_message_identifier(message_header.message_identifier);
    let rpc_message_type = RpcMessageTypes::from_i32(message_type as i32)?;
    Some((rpc_message_type, message_number))
}

/// Errors produced by [`parse_protocol_message`]
#[derive(Debug, thiserror::Error)]
pub enum ParseErrors {
    /// Found a RemoteError message instead of the given type parameter
    #[error("found a remote error frame instead of the expected message")]
    IsARemoteError((u32, RemoteError)),
    /// The bytes failed decoding into the given type
    #[error("frame failed decoding into the expected message")]
    DecodingFailed,
    /// [`RpcMessageTypes::Empty`] and [`RpcMessageTypes::ServerReady`] frames carry nothing but a header
    #[error("frame carries no message")]
    NotMessageType,
    /// The bytes cannot even be decoded as a [`RpcMessageHeader`]
    #[error("invalid frame header")]
    InvalidHeader,
}

type ParseMessageResult<R> = Result<(RpcMessageTypes, u32, R), ParseErrors>;

/// Parse protocol message from bytes
///
/// A type parameter `R` (generic) is passed to try to decode the bytes into the given type.
///
/// If the [`RpcMessageHeader`]'s message type of the given bytes is a [`RpcMessageTypes::RemoteErrorResponse`],
/// an `Err(ParseErrors::IsARemoteError)` carrying the message number and the [`RemoteError`] is returned.
///
pub fn parse_protocol_message<R: Message + Default>(data: &[u8]) -> ParseMessageResult<R> {
    let (message_type, message_number) = match parse_header(data) {
        Some(header) => header,
        None => return Err(ParseErrors::InvalidHeader),
    };

    if matches!(message_type, RpcMessageTypes::RemoteErrorResponse) {
        let remote_error = match RemoteError::decode(data) {
            Ok(remote_error) => remote_error,
            Err(_) => {
                let mut remote_error_default = RemoteError::default();
                fill_remote_error(&mut remote_error_default, message_number);
                remote_error_default
            }
        };
        return Err(ParseErrors::IsARemoteError((message_number, remote_error)));
    }

    if matches!(
        message_type,
        RpcMessageTypes::Empty | RpcMessageTypes::ServerReady
    ) {
        return Err(ParseErrors::NotMessageType);
    }

    match R::decode(data) {
        Ok(message) => Ok((message_type, message_number, message)),
        Err(_) => Err(ParseErrors::DecodingFailed),
    }
}

/// Fills the `message_identifier` of a [`RemoteError`] built through [`RemoteErrorResponse`](super::RemoteErrorResponse),
/// which cannot know the message number at conversion time
pub fn fill_remote_error(remote_error: &mut RemoteError, message_number: u32) {
    remote_error.message_identifier =
        build_message_identifier(RpcMessageTypes::RemoteErrorResponse as u32, message_number);
}

#[cfg(test)]
mod tests {
    use crate::rpc_protocol::*;
    use prost::Message;

    use super::{
        build_message_identifier, parse_message_identifier, parse_protocol_message, ParseErrors,
    };

    #[test]
    fn test_message_identifier_packs_type_and_number() {
        let identifier = build_message_identifier(RpcMessageTypes::StreamAck as u32, 77);
        assert_eq!(
            parse_message_identifier(identifier),
            (RpcMessageTypes::StreamAck as u32, 77)
        );
        // the message number is truncated to 27 bits
        let identifier = build_message_identifier(RpcMessageTypes::StreamMessage as u32, u32::MAX);
        assert_eq!(parse_message_identifier(identifier).1, 0x07ffffff);
    }

    #[test]
    fn test_parse_protocol_message() {
        let message = StreamMessage {
            message_identifier: build_message_identifier(RpcMessageTypes::StreamMessage as u32, 3),
            port_id: 1,
            sequence_id: 4,
            closed: false,
            ack: false,
            payload: vec![1, 2, 3],
        };

        let vec = message.encode_to_vec();

        let (message_type, message_number, parsed) =
            parse_protocol_message::<StreamMessage>(&vec).unwrap();

        assert_eq!(message_type, RpcMessageTypes::StreamMessage);
        assert_eq!(message_number, 3);
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_remote_error_in_parse_protocol_message() {
        let remote_error = RemoteError {
            message_identifier: build_message_identifier(
                RpcMessageTypes::RemoteErrorResponse as u32,
                1,
            ),
            error_code: 400,
            error_message: "Bad request error".to_string(),
        };
        let vec = remote_error.encode_to_vec();

        let parse_back = parse_protocol_message::<StreamMessage>(&vec).unwrap_err();
        match parse_back {
            ParseErrors::IsARemoteError((message_number, remote_error_produced)) => {
                assert_eq!(message_number, 1);
                assert_eq!(remote_error, remote_error_produced);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_header_only_frames_are_not_messages() {
        let header = RpcMessageHeader {
            message_identifier: build_message_identifier(RpcMessageTypes::ServerReady as u32, 0),
        };
        let parse_back = parse_protocol_message::<StreamMessage>(&header.encode_to_vec());
        assert!(matches!(parse_back, Err(ParseErrors::NotMessageType)));
    }
}
