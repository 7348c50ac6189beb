//! Byte-stream inputs
//!
//! An [`Input`] is the producer side of a source: either an open filesystem
//! path (regular file, FIFO, or device node) or a child process whose stdout
//! is captured. The producer task owns the handle; closing a command input
//! kills and reaps the child.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

/// What a source reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// A filesystem path, including FIFOs and `/dev/*` pseudo-files
    Path(PathBuf),
    /// A command line; stdout is the stream
    Command(Vec<String>),
}

impl InputSpec {
    /// Label used in log lines for this input
    pub fn label(&self) -> String {
        match self {
            InputSpec::Path(path) => path.display().to_string(),
            InputSpec::Command(argv) => format!("{:?}", argv),
        }
    }
}

impl fmt::Display for InputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

enum Handle {
    File(File),
    Command { child: Child, stdout: ChildStdout },
}

/// An open byte source
pub struct Input {
    handle: Handle,
}

impl Input {
    /// Open the input described by `spec`.
    ///
    /// Opening a FIFO blocks until a writer appears; tokio runs the open on
    /// the blocking pool so the producer task parks without pinning a worker.
    pub async fn open(spec: &InputSpec) -> io::Result<Input> {
        let handle = match spec {
            InputSpec::Path(path) => Handle::File(File::open(path).await?),
            InputSpec::Command(argv) => {
                let (program, args) = argv.split_first().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "empty command line")
                })?;
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "child has no stdout pipe")
                })?;
                Handle::Command { child, stdout }
            }
        };
        Ok(Input { handle })
    }

    /// Process id of the child, for command inputs
    pub fn pid(&self) -> Option<u32> {
        match &self.handle {
            Handle::File(_) => None,
            Handle::Command { child, .. } => child.id(),
        }
    }

    /// Read available bytes into `buf`. `Ok(0)` means end of input.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.handle {
            Handle::File(file) => file.read(buf).await,
            Handle::Command { stdout, .. } => stdout.read(buf).await,
        }
    }

    /// Disconnect. Command inputs are killed and reaped so no zombie is left
    /// behind.
    pub async fn close(self) {
        if let Handle::Command { mut child, stdout } = self.handle {
            drop(stdout);
            if let Some(pid) = child.id() {
                tracing::info!(pid, "killing input command");
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}
