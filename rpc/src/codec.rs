//! Decoding of raw stream payloads into caller chosen types.
//!
//! A listener is generic over the [`Decoder`] it receives. Codecs such as [`JsonCodec`] and [`ProstCodec`] implement
//! [`Decoder<T>`] for every type their wire format supports, so the type is picked at the call site:
//!
//! ```
//! use rpchan::codec::{Decoder, JsonCodec};
//! use rpchan::source::RawMessage;
//!
//! #[derive(serde::Deserialize, Debug, PartialEq)]
//! struct Tick { a: i64, b: i64, c: String }
//!
//! let raw = RawMessage::new(br#"{"a":1,"b":2,"c":"three"}"#.to_vec());
//! let tick: Tick = JsonCodec.decode(&raw).unwrap();
//! assert_eq!(tick, Tick { a: 1, b: 2, c: "three".to_string() });
//! ```
use std::{any::type_name, fmt, marker::PhantomData};

use serde::de::DeserializeOwned;

use crate::source::RawMessage;

/// Failure to turn a raw message into the requested type
///
/// A decode failure only concerns a single message, it's never a transport failure.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json payload for {type_name}: {source}")]
    Json {
        type_name: &'static str,
        source: serde_json::Error,
    },
    #[error("invalid protobuf payload for {type_name}: {source}")]
    Protobuf {
        type_name: &'static str,
        source: prost::DecodeError,
    },
    #[error("invalid payload for {type_name}: {source}")]
    Custom {
        type_name: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Decoder capability consumed by a [`Listener`](crate::listener::Listener)
pub trait Decoder<T>: Send + Sync + 'static {
    fn decode(&self, raw: &RawMessage) -> Result<T, DecodeError>;
}

/// Decodes JSON payloads into any [`DeserializeOwned`] type
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: DeserializeOwned> Decoder<T> for JsonCodec {
    fn decode(&self, raw: &RawMessage) -> Result<T, DecodeError> {
        serde_json::from_slice(&raw.payload).map_err(|source| DecodeError::Json {
            type_name: type_name::<T>(),
            source,
        })
    }
}

/// Decodes protobuf payloads into any [`prost::Message`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

impl<T: prost::Message + Default> Decoder<T> for ProstCodec {
    fn decode(&self, raw: &RawMessage) -> Result<T, DecodeError> {
        T::decode(raw.payload.clone()).map_err(|source| DecodeError::Protobuf {
            type_name: type_name::<T>(),
            source,
        })
    }
}

/// Decoder built from a closure over the raw payload, see [`decode_fn`]
pub struct FnCodec<F, T> {
    decode: F,
    _type: PhantomData<fn() -> T>,
}

impl<F, T> fmt::Debug for FnCodec<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCodec")
            .field("type", &type_name::<T>())
            .finish()
    }
}

/// Wraps a closure as a [`Decoder`]
///
/// ```
/// use rpchan::codec::{decode_fn, Decoder};
/// use rpchan::source::RawMessage;
///
/// let codec = decode_fn(|payload: &[u8]| std::str::from_utf8(payload).map(str::to_owned));
/// let text: String = codec.decode(&RawMessage::new(b"hello".to_vec())).unwrap();
/// assert_eq!(text, "hello");
/// ```
pub fn decode_fn<F, T, E>(decode: F) -> FnCodec<F, T>
where
    F: Fn(&[u8]) -> Result<T, E> + Send + Sync + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    FnCodec {
        decode,
        _type: PhantomData,
    }
}

impl<F, T, E> Decoder<T> for FnCodec<F, T>
where
    F: Fn(&[u8]) -> Result<T, E> + Send + Sync + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: 'static,
{
    fn decode(&self, raw: &RawMessage) -> Result<T, DecodeError> {
        (self.decode)(&raw.payload).map_err(|source| DecodeError::Custom {
            type_name: type_name::<T>(),
            source: source.into(),
        })
    }
}
