use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use streamtap::server::config::{DEFAULT_ADDR, DEFAULT_CONTENT_TYPE, DEFAULT_PATH};
use streamtap::{Config, StreamServer};

#[derive(Parser, Debug)]
#[command(name = "streamtap")]
#[command(about = "One-to-many live byte-stream fan-out over HTTP", long_about = None)]
struct Args {
    /// Address to listen on: "host:port" where host and port can be names
    /// or numbers
    #[arg(long, default_value = DEFAULT_ADDR)]
    address: String,

    /// Path to a source fifo, or a directory containing source fifos mapped
    /// onto the URI namespace
    #[arg(long, default_value = DEFAULT_PATH)]
    path: String,

    /// Execute a command (given after all flags) and read from its stdout
    #[arg(long)]
    exec: bool,

    /// Size of a data frame. Only complete frames are sent to clients.
    #[arg(long, default_value_t = 64)]
    frame_bytes: usize,

    /// Detect frame boundaries in source streams and send only full frames
    /// to clients. When a filter is active, --frame-bytes is the maximum
    /// frame size. Supported filter: mp3
    #[arg(long, default_value = "")]
    frame_filter: String,

    /// Size of header. A header is read from each source when it is opened,
    /// and delivered to each client before any data bytes.
    #[arg(long, default_value_t = 0)]
    header_bytes: usize,

    /// Number of frames to keep in memory for each source. The smaller this
    /// buffer is, the sooner a slow client will miss frames.
    #[arg(long, default_value_t = 64)]
    source_buffer: usize,

    /// Maximum bandwidth for each source, in bytes per second. 0=unlimited.
    #[arg(long, default_value_t = 0)]
    source_bandwidth: u64,

    /// Maximum bytes to send to each client. 0=unlimited.
    #[arg(long, default_value_t = 0)]
    client_max_bytes: u64,

    /// Close an input FIFO if all of its clients disconnect. It will reopen
    /// next time a client requests it.
    #[arg(long)]
    close_idle: bool,

    /// Content-Type header for HTTP responses
    #[arg(long, default_value = DEFAULT_CONTENT_TYPE)]
    content_type: String,

    /// Maximum worker threads. 0 uses the number of CPUs reported by the
    /// system.
    #[arg(long, default_value_t = 0)]
    cpu_max: usize,

    /// Reopen and resume reading if an error is encountered while reading
    /// the input. Use --reopen=false to disable.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    reopen: bool,

    /// Seconds between periodic statistics logs for each stream source, or
    /// 0 to disable
    #[arg(long, default_value_t = 0)]
    stat_log_interval: u64,

    /// Force-close and reopen the input if it produces no data for this
    /// many seconds, or 0 to disable
    #[arg(long, default_value_t = 0)]
    max_quiet_interval: u64,

    /// Setuid to the given user after binding the listening port. Ignored
    /// if 0; in Linux, consider setcap instead.
    #[arg(long, default_value_t = 0)]
    uid: u32,

    /// Print debug info
    #[arg(long)]
    debug: bool,

    /// Command to execute with --exec
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            addr: self.address,
            path: self.path,
            exec: self.exec,
            args: self.command,
            frame_bytes: self.frame_bytes,
            frame_filter: self.frame_filter,
            header_bytes: self.header_bytes,
            source_buffer: self.source_buffer,
            source_bandwidth: self.source_bandwidth,
            client_max_bytes: self.client_max_bytes,
            close_idle: self.close_idle,
            content_type: self.content_type,
            cpu_max: self.cpu_max,
            reopen: self.reopen,
            stat_log_interval: Duration::from_secs(self.stat_log_interval),
            max_quiet_interval: Duration::from_secs(self.max_quiet_interval),
            uid: self.uid,
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .compact()
        .init();
}

/// Setuid after the listen port is bound, so the port can be privileged
/// while the process is not.
fn drop_privileges(uid: u32) -> anyhow::Result<()> {
    if uid == 0 {
        return Ok(());
    }
    let rc = unsafe { libc::setuid(uid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("setuid failed");
    }
    tracing::info!(uid, "dropped privileges");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let config = args.into_config();
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.effective_cpu_max())
        .enable_all()
        .build()
        .context("cannot build runtime")?;

    runtime.block_on(async move {
        let uid = config.uid;
        let server = StreamServer::new(config)?;
        let listener = server.bind().context("cannot bind listen address")?;
        drop_privileges(uid)?;

        tokio::select! {
            result = server.serve(listener) => result.map_err(anyhow::Error::from),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                server.close();
                Ok(())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["streamtap"]).unwrap();
        let config = args.into_config();

        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.path, DEFAULT_PATH);
        assert_eq!(config.frame_bytes, 64);
        assert!(config.reopen);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_args_exec_command() {
        let args = Args::try_parse_from([
            "streamtap",
            "--exec",
            "--frame-bytes",
            "4096",
            "arecord",
            "-f",
            "cd",
        ])
        .unwrap();
        let config = args.into_config();

        assert!(config.exec);
        assert_eq!(config.args, vec!["arecord", "-f", "cd"]);
        assert_eq!(config.frame_bytes, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_args_reopen_flag() {
        let args = Args::try_parse_from(["streamtap", "--reopen", "false"]).unwrap();
        assert!(!args.reopen);

        let args = Args::try_parse_from(["streamtap", "--reopen", "true"]).unwrap();
        assert!(args.reopen);
    }

    #[test]
    fn test_args_intervals() {
        let args =
            Args::try_parse_from(["streamtap", "--stat-log-interval", "30", "--max-quiet-interval", "5"])
                .unwrap();
        let config = args.into_config();
        assert_eq!(config.stat_log_interval, Duration::from_secs(30));
        assert_eq!(config.max_quiet_interval, Duration::from_secs(5));
    }
}
