//! Typed entity messages and the registry of known message type ids.

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// First type id reserved for messages the controller handles itself.
pub const RESERVED_TYPE_IDS: u16 = 0xFF00;

/// A message addressed to a network view.
pub trait EntityMessage: Serialize + DeserializeOwned + 'static {
    const TYPE_ID: u16;
    const NAME: &'static str;
}

/// Payload of a response to a request message.
pub trait ResponseData: Serialize + DeserializeOwned + 'static {
    const TYPE_ID: u16;
    const NAME: &'static str;
}

/// Errors returned by message, RPC and synchronize handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The message body did not decode as the handler's type.
    #[error("failed to decode {name}: {source}")]
    Decode {
        name: &'static str,
        #[source]
        source: postcard::Error,
    },

    /// A synchronize blob was malformed.
    #[error("malformed payload: {0}")]
    Codec(#[from] tessera_net::CodecError),

    /// An RPC argument did not have the expected type.
    #[error("argument {index} of {method} has the wrong type")]
    Argument { method: String, index: usize },

    /// `respond` was called while handling a message that is not a request.
    #[error("message is not a request")]
    NotARequest,

    /// A message or response body could not be encoded.
    #[error("failed to encode {name}: {source}")]
    Encode {
        name: &'static str,
        #[source]
        source: postcard::Error,
    },

    /// Application-defined failure.
    #[error("{0}")]
    Custom(String),
}

pub(crate) fn encode_body<T: Serialize>(name: &'static str, value: &T) -> Result<Vec<u8>, HandlerError> {
    postcard::to_allocvec(value).map_err(|source| HandlerError::Encode { name, source })
}

pub(crate) fn decode_body<T: DeserializeOwned>(name: &'static str, body: &[u8]) -> Result<T, HandlerError> {
    postcard::from_bytes(body).map_err(|source| HandlerError::Decode { name, source })
}

/// Maps message type ids to their names.
///
/// Built once at startup and handed to the controller. Entity messages and
/// responses share one id space.
#[derive(Debug, Default, Clone)]
pub struct MessageRegistry {
    names: FxHashMap<u16, &'static str>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entity message type.
    pub fn register<M: EntityMessage>(&mut self) -> &mut Self {
        self.insert(M::TYPE_ID, M::NAME);
        self
    }

    /// Record a response type.
    pub fn register_response<R: ResponseData>(&mut self) -> &mut Self {
        self.insert(R::TYPE_ID, R::NAME);
        self
    }

    fn insert(&mut self, type_id: u16, name: &'static str) {
        let previous = self.names.insert(type_id, name);
        debug_assert!(
            previous.is_none_or(|previous| previous == name),
            "message type id {type_id:#06x} registered for both {} and {name}",
            previous.unwrap_or_default()
        );
    }

    pub fn name(&self, type_id: u16) -> Option<&'static str> {
        self.names.get(&type_id).copied()
    }

    pub fn contains(&self, type_id: u16) -> bool {
        self.names.contains_key(&type_id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
