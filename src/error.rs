//! Error types for rulebus

use thiserror::Error;

use crate::codec::ParseError;
use crate::patch::PatchError;

/// Result type alias for rulebus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in rulebus operations
#[derive(Error, Debug)]
pub enum Error {
    /// Ruleset container failed structural validation
    #[error("ruleset parse error: {0}")]
    Parse(#[from] ParseError),

    /// Ruleset references a capability that is not registered
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    /// Streamed payload length does not match the announced length
    #[error("stream length mismatch: got {got} bytes, expected {expected}")]
    LengthMismatch { got: usize, expected: usize },

    /// Streamed payload CRC does not match the announced CRC
    #[error("stream CRC mismatch: calculated {calculated:#010x}, expected {expected:#010x}")]
    StreamCrc { calculated: u32, expected: u32 },

    /// Serialized profile exceeds the caller-supplied maximum
    #[error("profile too large: {size} bytes > {max} max")]
    ProfileTooLarge { size: usize, max: usize },

    /// Ruleset definition cannot be compiled to a container
    #[error("ruleset build error: {0}")]
    Build(String),

    /// Delta patch application error
    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    /// OTA session cannot accept the request in its current state
    #[error("OTA error: {0}")]
    Ota(String),

    /// Persistent storage operation failed
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON parsing error (ruleset definitions)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
