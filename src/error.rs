use std::io;

use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Everything that can end a send, receive or info run.
///
/// None of these are retried; a session that hits one cleans up and
/// hands it back to `main`.
#[derive(Debug, Error)]
pub(crate) enum Error {
    /// Pool or volume missing from the volume group, or volumes that
    /// cannot be combined (e.g. living in different pools).
    #[error("config lookup: {0}")]
    ConfigLookup(String),

    /// The volume group config text could not be parsed.
    #[error("config syntax error at line {line}: {message}")]
    ConfigSyntax { line: usize, message: String },

    /// The stream does not follow the wire format.
    #[error("stream scheme: {0}")]
    Scheme(String),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An external tool is missing, failed, or produced output we cannot read.
    #[error("{tool}: {reason}")]
    ExternalTool { tool: String, reason: String },
}

/// The local state does not match what the stream was produced against.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ConsistencyError {
    #[error("chunk size of stream ({stream} bytes) does not match local pool ({pool} bytes)")]
    ChunkSizeMismatch { stream: u64, pool: u64 },

    #[error(
        "basis volume does not match stream, incremental chain is broken \
         (sectors {offset:X}+{length:X}: expected {expected}, found {actual})"
    )]
    BasisMismatch {
        offset: u64,
        length: u64,
        expected: String,
        actual: String,
    },

    #[error("device is {actual} bytes, {required} bytes are needed")]
    VolumeTooSmall { actual: u64, required: u64 },
}

/// How far a session got before it failed; decides the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Nothing was emitted or mutated yet.
    Setup,
    Run,
}

#[derive(Debug, Error)]
#[error("{error}")]
pub(crate) struct SessionError {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl SessionError {
    pub(crate) fn setup(error: Error) -> Self {
        Self {
            stage: Stage::Setup,
            error,
        }
    }

    pub(crate) fn run(error: Error) -> Self {
        Self {
            stage: Stage::Run,
            error,
        }
    }
}

impl Error {
    pub(crate) fn scheme(message: impl Into<String>) -> Self {
        Error::Scheme(message.into())
    }

    pub(crate) fn tool(tool: &str, reason: impl Into<String>) -> Self {
        Error::ExternalTool {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}
