//! streamtap: one-to-many live byte-stream fan-out over HTTP
//!
//! A single producer (a file, FIFO, or a child process's stdout) is read
//! once and delivered simultaneously to any number of HTTP consumers. Each
//! consumer follows the stream at its own pace over a shared frame ring;
//! consumers that fall more than one ring behind skip forward rather than
//! slowing the producer or anyone else. Nothing is persisted and nothing can
//! be rewound: this is a live tap, not a recorder.
//!
//! The library surface is the source subsystem ([`source`]) plus the thin
//! HTTP front-end ([`server`]); the `streamtap` binary wires them to a
//! command line.

pub mod error;
pub mod filter;
pub mod input;
pub mod server;
pub mod source;

pub use error::{Error, Result, StreamError};
pub use filter::{FilterKind, FrameFilter, Scan};
pub use input::{Input, InputSpec};
pub use server::{Config, StreamServer};
pub use source::{Source, SourceMap, SourceReader};
