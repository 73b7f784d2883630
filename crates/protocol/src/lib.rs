pub mod channel;
pub mod codec;
pub mod content;
pub mod message;
pub mod signature;

pub use channel::Channel;
pub use codec::{decode, encode, DELIMITER};
pub use content::MessageContent;
pub use message::{Header, Message, MessageData, PROTOCOL_VERSION};
pub use signature::{SignatureScheme, Signer};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Format(String),
    #[error("message signature does not match")]
    Auth,
    #[error("invalid json in {part}: {source}")]
    Json {
        part: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl CodecError {
    /// Both malformed frames and broken json are dropped the same way at the
    /// transport boundary; only authentication failures are distinguished.
    pub fn is_auth(&self) -> bool {
        matches!(self, CodecError::Auth)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unsupported signature scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("invalid signing key")]
    InvalidKey,
}
