//! Crate error types
//!
//! `Error` covers startup and server-level failures; `StreamError` is the
//! small set of conditions a `SourceReader` can surface to a consumer.

use std::io;

/// Result alias for crate-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for configuration and server operations
#[derive(Debug)]
pub enum Error {
    /// Invalid configuration detected before startup
    Config(String),
    /// I/O failure while binding or serving
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(_) => None,
            Error::Io(err) => Some(err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Error type for reader-side stream operations
///
/// Producer-side I/O failures never reach consumers; they trigger reopen or
/// teardown inside the producer task. A reader only ever observes the end of
/// the stream or its own undersized buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The source is exhausted and will not produce more frames
    EndOfStream,
    /// The caller's buffer cannot hold the next frame or header
    BufferTooSmall {
        /// Bytes required to hold the pending frame
        needed: usize,
        /// Bytes the caller supplied
        got: usize,
    },
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::EndOfStream => write!(f, "end of stream"),
            StreamError::BufferTooSmall { needed, got } => {
                write!(f, "buffer too small: need {} bytes, got {}", needed, got)
            }
        }
    }
}

impl std::error::Error for StreamError {}
