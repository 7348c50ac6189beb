//! Server configuration

use std::time::Duration;

use crate::error::{Error, Result};
use crate::filter::FilterKind;

/// Default input path; also the sentinel `--exec` checks against.
pub const DEFAULT_PATH: &str = "/dev/stdin";
/// Default listen address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:80";
/// Default HTTP Content-Type for stream responses.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Server and source configuration options
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on, `host:port`
    pub addr: String,

    /// Input path: a file, FIFO, device node, or a directory mapped onto
    /// the URL namespace
    pub path: String,

    /// Treat `args` as a command line and read its stdout
    pub exec: bool,

    /// Trailing argv for `exec`
    pub args: Vec<String>,

    /// Maximum frame size in bytes. With the raw filter every frame is
    /// exactly this long; format-aware filters produce frames up to it.
    pub frame_bytes: usize,

    /// Frame filter name: `""` (raw) or `"mp3"`
    pub frame_filter: String,

    /// Header size in bytes; the header is read at every open and delivered
    /// to each client before any frame
    pub header_bytes: usize,

    /// Ring capacity in frames; the smaller it is, the sooner a slow client
    /// misses frames
    pub source_buffer: usize,

    /// Maximum input bytes per second per source (0 = unlimited)
    pub source_bandwidth: u64,

    /// Maximum bytes sent to each client (0 = unlimited)
    pub client_max_bytes: u64,

    /// Close a source once its last reader disconnects
    pub close_idle: bool,

    /// Content-Type for HTTP responses
    pub content_type: String,

    /// Worker thread cap (0 = number of CPUs)
    pub cpu_max: usize,

    /// Reopen the input on read error or EOF
    pub reopen: bool,

    /// Period between per-source stat log lines (zero = disabled)
    pub stat_log_interval: Duration,

    /// Force-close the input if it produces no bytes for this long
    /// (zero = disabled)
    pub max_quiet_interval: Duration,

    /// Setuid target after binding the listen port (0 = keep)
    pub uid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            path: DEFAULT_PATH.to_string(),
            exec: false,
            args: Vec::new(),
            frame_bytes: 64,
            frame_filter: String::new(),
            header_bytes: 0,
            source_buffer: 64,
            source_bandwidth: 0,
            client_max_bytes: 0,
            close_idle: false,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            cpu_max: 0,
            reopen: true,
            stat_log_interval: Duration::ZERO,
            max_quiet_interval: Duration::ZERO,
            uid: 0,
        }
    }
}

impl Config {
    /// Set the listen address
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Set the input path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Read a command's stdout instead of a path
    pub fn exec(mut self, args: Vec<String>) -> Self {
        self.exec = true;
        self.args = args;
        self
    }

    /// Set the maximum frame size
    pub fn frame_bytes(mut self, bytes: usize) -> Self {
        self.frame_bytes = bytes;
        self
    }

    /// Select a frame filter by name
    pub fn frame_filter(mut self, name: impl Into<String>) -> Self {
        self.frame_filter = name.into();
        self
    }

    /// Set the header size
    pub fn header_bytes(mut self, bytes: usize) -> Self {
        self.header_bytes = bytes;
        self
    }

    /// Set the ring capacity
    pub fn source_buffer(mut self, frames: usize) -> Self {
        self.source_buffer = frames;
        self
    }

    /// Cap the source read bandwidth
    pub fn source_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.source_bandwidth = bytes_per_sec;
        self
    }

    /// Cap the bytes sent to each client
    pub fn client_max_bytes(mut self, bytes: u64) -> Self {
        self.client_max_bytes = bytes;
        self
    }

    /// Close sources whose last reader disconnected
    pub fn close_idle(mut self, close: bool) -> Self {
        self.close_idle = close;
        self
    }

    /// Reopen inputs on error or EOF
    pub fn reopen(mut self, reopen: bool) -> Self {
        self.reopen = reopen;
        self
    }

    /// Enable the input stall watchdog
    pub fn max_quiet_interval(mut self, interval: Duration) -> Self {
        self.max_quiet_interval = interval;
        self
    }

    /// Enable periodic stat logging
    pub fn stat_log_interval(mut self, interval: Duration) -> Self {
        self.stat_log_interval = interval;
        self
    }

    /// Resolve the configured frame filter
    pub fn filter_kind(&self) -> Result<FilterKind> {
        FilterKind::from_name(&self.frame_filter).ok_or_else(|| {
            Error::Config(format!(
                "frame-filter \"{}\" not supported; try one of {}",
                self.frame_filter,
                FilterKind::known_names().join(", ")
            ))
        })
    }

    /// Worker thread count with the zero default resolved
    pub fn effective_cpu_max(&self) -> usize {
        if self.cpu_max > 0 {
            self.cpu_max
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Reject unusable configurations before anything is started.
    pub fn validate(&self) -> Result<()> {
        if self.source_buffer <= 2 {
            return Err(Error::Config(
                "source-buffer must be greater than 2".into(),
            ));
        }
        if self.frame_bytes < 1 {
            return Err(Error::Config("frame-bytes must not be zero".into()));
        }
        if self.path.is_empty() {
            return Err(Error::Config("path must not be empty".into()));
        }
        if self.exec && self.path != DEFAULT_PATH {
            return Err(Error::Config("cannot combine --exec and --path".into()));
        }
        if self.exec == self.args.is_empty() {
            return Err(Error::Config(
                "cannot use --exec without providing a command (or vice versa)".into(),
            ));
        }
        self.filter_kind()?;
        Ok(())
    }
}
