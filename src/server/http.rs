//! HTTP front-end
//!
//! Every GET resolves to a source path and streams its frames: first the
//! header (when configured), then frames as they are published, each flushed
//! to the client as its own chunk. A per-client pump task drives a
//! `SourceReader` and feeds the response body through a bounded channel, so
//! a slow client exerts backpressure on its own reader only, and the ring's
//! lap-skip keeps the reader near live data.

use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result, StreamError};
use crate::server::Config;
use crate::source::SourceMap;

/// TCP keep-alive probe period for accepted connections.
const KEEPALIVE_PERIOD_SECS: libc::c_int = 180;

/// The fan-out HTTP server
pub struct StreamServer {
    config: Config,
    sources: Arc<SourceMap>,
    shutdown: Notify,
}

impl StreamServer {
    /// Create a server from a validated configuration.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            sources: SourceMap::new(),
            shutdown: Notify::new(),
        }))
    }

    /// The server's source registry
    pub fn sources(&self) -> &Arc<SourceMap> {
        &self.sources
    }

    /// Bind the listen socket and enable keep-alive on it.
    ///
    /// Kept separate from [`serve`](Self::serve) so the caller can drop
    /// privileges between binding and serving.
    pub fn bind(&self) -> Result<std::net::TcpListener> {
        let listener = std::net::TcpListener::bind(&self.config.addr)?;
        listener.set_nonblocking(true)?;
        enable_keepalive(&listener)?;
        Ok(listener)
    }

    /// Accept and serve connections until [`close`](Self::close) is called.
    pub async fn serve(self: &Arc<Self>, listener: std::net::TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "listening");
        let listener = tokio::net::TcpListener::from_std(listener)?;

        let app = Router::new()
            .fallback(axum::routing::get(stream_handler))
            .with_state(Arc::clone(self));

        let server = Arc::clone(self);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server.shutdown.notified().await })
        .await
        .map_err(Error::Io)?;

        self.sources.close_all();
        Ok(())
    }

    /// Bind and serve in one step.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Stop accepting connections and close every source. Idempotent.
    pub fn close(&self) {
        self.sources.close_all();
        self.shutdown.notify_one();
    }

    /// Map a request URI onto a source path.
    ///
    /// A directory input exposes its entries on the URI namespace; anything
    /// else (including exec mode) serves the same source on every URI.
    fn resolve_path(&self, uri_path: &str) -> Option<String> {
        if self.config.exec {
            return Some(self.config.path.clone());
        }
        let base = Path::new(&self.config.path);
        if !base.is_dir() {
            return Some(self.config.path.clone());
        }
        let relative = uri_path.trim_start_matches('/');
        if relative.is_empty() {
            return None;
        }
        let mut clean = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => clean.push(part),
                // Anything that could escape the directory is refused.
                _ => return None,
            }
        }
        Some(base.join(clean).to_string_lossy().into_owned())
    }

    /// The single configured source has ended and cannot return; stop the
    /// server so the process can exit.
    fn shutdown_if_done(&self) {
        if self.sources.count() == 0 && !self.config.reopen {
            tracing::info!("single source ended and reopen is disabled, shutting down");
            self.close();
        }
    }
}

async fn stream_handler(
    State(server): State<Arc<StreamServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
) -> Response {
    let Some(path) = server.resolve_path(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let reader = match server.sources.new_reader(&path, &server.config) {
        Ok(reader) => reader,
        Err(err) => {
            tracing::error!(client = %peer, error = %err, "cannot attach reader");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Capacity 1: the pump only advances once the previous chunk has been
    // handed to the connection, so a slow client lags its reader, not the
    // producer.
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(1);
    let buf_len = server.config.frame_bytes.max(server.config.header_bytes);
    let content_type = server.config.content_type.clone();
    let pump_server = Arc::clone(&server);

    tokio::spawn(async move {
        let server = pump_server;
        let started = Instant::now();
        let mut reader = reader;
        let mut buf = vec![0u8; buf_len];
        let mut wrote = 0u64;
        loop {
            match reader.read_frame(&mut buf).await {
                Ok(n) => {
                    wrote += n as u64;
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        // Client disconnected; not an error.
                        break;
                    }
                }
                Err(StreamError::EndOfStream) => break,
                Err(err) => {
                    tracing::warn!(client = %peer, error = %err, "stream aborted");
                    break;
                }
            }
        }
        tracing::info!(
            client = %peer,
            elapsed = ?started.elapsed(),
            bytes = wrote,
            frames = reader.frames_read(),
            skipped = reader.frames_skipped(),
            "client finished"
        );
        drop(reader);
        server.shutdown_if_done();
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Enable keep-alive on the listen socket; accepted sockets inherit it.
fn enable_keepalive(listener: &std::net::TcpListener) -> Result<()> {
    use std::os::fd::AsRawFd;

    fn setsockopt(
        fd: libc::c_int,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    let fd = listener.as_raw_fd();
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    #[cfg(target_os = "linux")]
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, KEEPALIVE_PERIOD_SECS)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_resolve_single_path() {
        let config = Config::default().path("/dev/urandom");
        let server = StreamServer::new(config).unwrap();

        assert_eq!(
            server.resolve_path("/anything").as_deref(),
            Some("/dev/urandom")
        );
        assert_eq!(server.resolve_path("/").as_deref(), Some("/dev/urandom"));
    }

    #[test]
    fn test_resolve_exec() {
        let config = Config::default().exec(vec!["cat".into(), "/dev/zero".into()]);
        let server = StreamServer::new(config).unwrap();

        assert_eq!(
            server.resolve_path("/whatever").as_deref(),
            Some("/dev/stdin")
        );
    }

    #[test]
    fn test_resolve_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().to_str().unwrap().to_string();
        let config = Config::default().path(base.clone());
        let server = StreamServer::new(config).unwrap();

        assert_eq!(
            server.resolve_path("/radio/a.mp3"),
            Some(format!("{}/radio/a.mp3", base))
        );
        assert_eq!(server.resolve_path("/"), None);
        assert_eq!(server.resolve_path("/../etc/passwd"), None);
    }

    #[tokio::test]
    async fn test_streaming_request() {
        let config = Config::default()
            .addr("127.0.0.1:0")
            .path("/dev/urandom")
            .frame_bytes(64)
            .source_buffer(16)
            .client_max_bytes(1024)
            .close_idle(true);
        let server = StreamServer::new(config).unwrap();
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();

        let serve_handle = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let response = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
            conn.write_all(
                b"GET /stream HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
            let mut response = Vec::new();
            conn.read_to_end(&mut response).await.unwrap();
            response
        })
        .await
        .expect("response should complete once the client byte cap is hit");

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"), "got: {}", &text[..40]);
        assert!(text.contains("content-type: application/octet-stream"));

        let body_start = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("headers terminated")
            + 4;
        // Chunked framing inflates the byte count; the cap bounds the
        // payload itself at 1024 bytes (16 frames).
        assert!(response.len() - body_start >= 1024);

        server.close();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), serve_handle).await;
    }

    #[tokio::test]
    async fn test_directory_mapped_fifo() {
        use std::io::Write;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::TempDir::new().unwrap();
        let fifo = dir.path().join("radio");
        let cpath = std::ffi::CString::new(fifo.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) }, 0);

        let config = Config::default()
            .addr("127.0.0.1:0")
            .path(dir.path().to_str().unwrap())
            .frame_bytes(16)
            .source_buffer(5)
            .reopen(false);
        let server = StreamServer::new(config).unwrap();
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let serve_handle = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        // Feed the FIFO once the handler's producer has it open for reading,
        // pausing first so the client's reader is parked at frame 0.
        let writer = tokio::task::spawn_blocking(move || {
            let mut writer = std::fs::OpenOptions::new().write(true).open(fifo).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
            writer.write_all(&[0xabu8; 64]).unwrap();
        });

        let response = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
            conn.write_all(b"GET /radio HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut response = Vec::new();
            conn.read_to_end(&mut response).await.unwrap();
            response
        })
        .await
        .expect("stream should end when the fifo writer leaves");
        writer.await.unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"), "got: {}", &text[..40]);
        // 64 fifo bytes come through as four 16-byte frames; nothing else in
        // the response contains 0xab.
        assert_eq!(response.iter().filter(|&&b| b == 0xab).count(), 64);

        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), serve_handle).await;
    }
}
