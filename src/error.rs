use std::fmt;

use thiserror::Error;

/// An error raised while encoding a value graph.
#[derive(Clone, Debug, Error)]
pub enum EncodeError {
    /// The value has no wire form and no registered reducer claimed it.
    #[error("cannot encode {0}")]
    Unsupported(&'static str),

    /// An asynchronous source was consumed before the encoder reached it.
    #[error("async source already consumed")]
    SourceConsumed,

    /// The encoding session was torn down while a producer was still running.
    #[error("encoder session closed")]
    Closed,

    /// JSON serialization failed.
    #[error("serialization failed: {0}")]
    Json(String),

    /// A calendar value could not be formatted.
    #[error("time format: {0}")]
    Time(String),

    /// One or more cancellation hooks failed during cleanup.
    #[error("cleanup failed: {0}")]
    Cleanup(CompositeError),
}

impl From<serde_json::Error> for EncodeError {
    fn from(cause: serde_json::Error) -> Self {
        Self::Json(cause.to_string())
    }
}

/// An error raised while decoding a frame stream.
#[derive(Clone, Debug, Error)]
pub enum DecodeError {
    /// The transport failed before the stream completed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame failed to parse or violated the `[id, status, payload]` shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame stream ended while asynchronous values were still pending.
    #[error("stream interrupted: malformed stream")]
    Interrupted,

    /// A tagged node named a type with no registered reviver.
    #[error("unknown type tag: {0}")]
    UnknownTag(String),

    /// A node in the serialized graph was structurally invalid.
    #[error("malformed node: {0}")]
    BadNode(String),

    /// A user reviver rejected its payload.
    #[error("reviver failed: {0}")]
    Reviver(String),

    /// The decoding session was dropped while a revived value was still live.
    #[error("decoder session closed")]
    Closed,
}

/// Carries every individual failure raised while destroying concurrent
/// sources, so a single cancellation surfaces all of them at once.
#[derive(Clone, Debug)]
pub struct CompositeError {
    errors: Vec<EncodeError>,
}

impl CompositeError {
    pub fn new(errors: Vec<EncodeError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[EncodeError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<EncodeError> {
        self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s):", self.errors.len())?;
        for error in &self.errors {
            write!(f, " {};", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeError {}
