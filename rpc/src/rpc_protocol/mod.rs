//! Contains the wire messages exchanged by both halves of an RPC stream.
//!
//! Every message starts with a `fixed32` `message_identifier` at tag 1, so any frame can be decoded as a
//! [`RpcMessageHeader`] first to know which message type it carries.
pub mod parse;

/// Header shared by every frame. Decoding any message as this type yields its identifier.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcMessageHeader {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
}

/// A single frame of an RPC stream
///
/// The same message is used for data frames, acknowledgements (`ack == true`) and the close notification (`closed == true`)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamMessage {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
    #[prost(fixed32, tag = "3")]
    pub sequence_id: u32,
    #[prost(bool, tag = "4")]
    pub closed: bool,
    #[prost(bool, tag = "5")]
    pub ack: bool,
    #[prost(bytes = "vec", tag = "6")]
    pub payload: Vec<u8>,
}

/// Error sent by the remote half in place of the next stream frame
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteError {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(uint32, tag = "2")]
    pub error_code: u32,
    #[prost(string, tag = "3")]
    pub error_message: String,
}

/// Message types of the RPC protocol, numbered as the peer numbers them. Streams only use a few of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RpcMessageTypes {
    Empty = 0,
    Request = 1,
    Response = 2,
    StreamMessage = 3,
    StreamAck = 4,
    CreatePort = 5,
    CreatePortResponse = 6,
    RequestModule = 7,
    RequestModuleResponse = 8,
    RemoteErrorResponse = 9,
    DestroyPort = 10,
    ServerReady = 11,
}

/// This trait should be implemented by the Error type a producer wants to report to the consuming half
///
/// # Example
///
/// ```
/// use rpchan::rpc_protocol::{RemoteError, RemoteErrorResponse};
/// pub enum FeedError {
///     FeedNotFound,
///     Upstream
/// }
///
/// impl RemoteErrorResponse for FeedError {
///     fn error_code(&self) -> u32 {
///         match self {
///             Self::FeedNotFound => 404,
///             Self::Upstream => 502
///         }
///     }
///
///     fn error_message(&self) -> String {
///         match self {
///             Self::FeedNotFound => "The feed wasn't found".to_string(),
///             Self::Upstream => "Upstream failure".to_string()
///         }
///     }
/// }
///
/// let error: RemoteError = FeedError::FeedNotFound.into();
/// assert_eq!(error.error_code, 404);
/// assert_eq!(error.error_message, "The feed wasn't found")
/// ```
pub trait RemoteErrorResponse {
    fn error_code(&self) -> u32;
    fn error_message(&self) -> String;
}

/// Every type which implements [`RemoteErrorResponse`] can be turned into a [`RemoteError`]
impl<T: RemoteErrorResponse> From<T> for RemoteError {
    fn from(value: T) -> Self {
        Self {
            message_identifier: 0, // filled by `parse::fill_remote_error` once the message number is known
            error_code: value.error_code(),
            error_message: value.error_message(),
        }
    }
}
