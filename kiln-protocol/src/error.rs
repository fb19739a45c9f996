// SPDX-License-Identifier: MIT

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Frame too large: {length} exceeds maximum {max}")]
    FrameTooLarge { length: u64, max: u64 },

    #[error("Unsupported protocol version {version}, expected {supported}")]
    UnsupportedVersion { version: u32, supported: u32 },

    #[error("Unknown argument kind: {0}")]
    UnknownArgumentKind(u32),

    #[error("Unknown response tag: {0}")]
    UnknownResponseTag(u32),

    #[error("Invalid UTF-8 in {what}")]
    InvalidUtf8 {
        what: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("Truncated payload while reading {0}")]
    Truncated(&'static str),

    #[error("Unexpected response: expected {expected}")]
    UnexpectedResponse { expected: &'static str },
}

impl ProtocolError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Whether this error means the peer went away or sent a broken stream,
    /// as opposed to a malformed-but-delivered message.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Helper trait for adding context to IO errors
pub trait IoContext<T> {
    fn io_context(self, message: impl Into<String>) -> Result<T, ProtocolError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, message: impl Into<String>) -> Result<T, ProtocolError> {
        self.map_err(|e| ProtocolError::io(message, e))
    }
}
