//! Single-producer stream source
//!
//! A `Source` owns one input, one frame ring, and one header, and runs the
//! producer task that moves bytes from the input into published frames. Any
//! number of [`SourceReader`](super::SourceReader)s follow along, each at its
//! own pace; the producer never waits for them.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::error::StreamError;
use crate::filter::{FrameFilter, Scan};
use crate::input::{Input, InputSpec};
use crate::server::Config;
use crate::source::map::SourceMap;
use crate::source::reader::SourceReader;
use crate::source::ring::FrameRing;
use crate::source::stats::{SourceStats, StatsSnapshot};

/// Pause after a would-block read, so a non-blocking input cannot spin the
/// producer.
const ZERO_READ_BACKOFF: Duration = Duration::from_millis(10);

fn input_closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "input is closed")
}

/// One live input fanned out to many readers
pub struct Source {
    label: String,
    path: String,
    spec: InputSpec,
    ring: FrameRing,

    header_bytes: usize,
    /// Empty until the producer publishes the header; immutable afterwards
    header: Mutex<Bytes>,

    /// Terminal flag: no more frames will ever be published
    gone: AtomicBool,
    /// Close the source once the last reader detaches
    close_idle: AtomicBool,
    reopen: bool,

    bandwidth: u64,
    client_max_bytes: u64,
    stat_log_interval: Duration,
    max_quiet_interval: Duration,

    active_readers: AtomicU64,
    stats: SourceStats,
    started_at: Instant,

    /// Forces the in-flight input read to fail, standing in for closing the
    /// descriptor out from under a blocked read
    interrupt: Notify,

    map: Weak<SourceMap>,
}

impl Source {
    pub(crate) fn new(path: &str, config: &Config, map: Weak<SourceMap>) -> Arc<Source> {
        let spec = if config.exec {
            InputSpec::Command(config.args.clone())
        } else {
            InputSpec::Path(path.into())
        };
        Arc::new(Source {
            label: spec.label(),
            path: path.to_string(),
            spec,
            ring: FrameRing::new(config.source_buffer, config.frame_bytes),
            header_bytes: config.header_bytes,
            header: Mutex::new(Bytes::new()),
            gone: AtomicBool::new(false),
            close_idle: AtomicBool::new(config.close_idle),
            reopen: config.reopen,
            bandwidth: config.source_bandwidth,
            client_max_bytes: config.client_max_bytes,
            stat_log_interval: config.stat_log_interval,
            max_quiet_interval: config.max_quiet_interval,
            active_readers: AtomicU64::new(0),
            stats: SourceStats::default(),
            started_at: Instant::now(),
            interrupt: Notify::new(),
            map,
        })
    }

    /// Launch the producer task for this source.
    pub(crate) fn spawn_producer(self: &Arc<Self>, filter: Box<dyn FrameFilter>) {
        let source = Arc::clone(self);
        tokio::spawn(source.run(filter));
    }

    /// Identity key in the [`SourceMap`]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Log label (the path, or the command argv)
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn ring(&self) -> &FrameRing {
        &self.ring
    }

    pub(crate) fn client_max_bytes(&self) -> u64 {
        self.client_max_bytes
    }

    pub(crate) fn header_bytes(&self) -> usize {
        self.header_bytes
    }

    /// Total frames ever published
    pub fn published(&self) -> u64 {
        self.ring.published()
    }

    /// True once the source will never publish another frame
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// Number of attached readers
    pub fn active_readers(&self) -> u64 {
        self.active_readers.load(Ordering::SeqCst)
    }

    /// Current transfer counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn add_bytes_out(&self, n: u64) {
        self.stats.add_out(n);
    }

    /// Attach a new reader. Called by [`SourceMap`] under the map lock so a
    /// source can never be handed out while its idle-close is in flight.
    pub(crate) fn new_reader(self: &Arc<Self>) -> SourceReader {
        self.active_readers.fetch_add(1, Ordering::SeqCst);
        self.log_stats();
        SourceReader::new(Arc::clone(self))
    }

    /// Detach one reader; invoked by `SourceReader`'s `Drop`.
    pub(crate) fn reader_done(&self) {
        self.active_readers.fetch_sub(1, Ordering::SeqCst);
        self.log_stats();
        if self.close_idle.load(Ordering::Relaxed) {
            self.close_if_idle();
        }
    }

    fn close_if_idle(&self) {
        let idle = match self.map.upgrade() {
            Some(map) => map.remove_if_idle(self),
            None => self.active_readers() == 0,
        };
        if idle {
            self.close();
        }
    }

    /// Disconnect all readers and stop the producer. Idempotent.
    pub fn close(&self) {
        self.close_idle.store(true, Ordering::Relaxed);
        self.gone.store(true, Ordering::Release);
        // Release readers parked on the ring and abort any in-flight input
        // read so the producer observes `gone` promptly.
        self.ring.wake_all();
        self.interrupt.notify_one();
    }

    /// Record source statistics: reader count, transfer counters, uptime.
    pub fn log_stats(&self) {
        let snap = self.stats.snapshot();
        tracing::info!(
            source = %self.label,
            active_readers = self.active_readers(),
            in_bytes = snap.bytes_in,
            invalid_bytes = snap.bytes_invalid,
            out_bytes = snap.bytes_out,
            uptime = ?self.started_at.elapsed(),
            "source stats"
        );
    }

    fn header_ready(&self) -> bool {
        self.header.lock().unwrap().len() == self.header_bytes
    }

    /// Wait for the header, or for the source to end without one.
    ///
    /// Idempotent; the header is read-only once published. When the source
    /// was configured without a header this returns an empty buffer at once.
    pub async fn header(&self) -> Result<Bytes, StreamError> {
        if self.header_bytes == 0 {
            return Ok(Bytes::new());
        }
        self.ring
            .wait_until(|| self.header_ready() || self.is_gone())
            .await;
        let header = self.header.lock().unwrap();
        if header.len() == self.header_bytes {
            Ok(header.clone())
        } else {
            Err(StreamError::EndOfStream)
        }
    }

    /// Copy the header into `buf`, counting the bytes as delivered.
    pub(crate) async fn copy_header(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let header = self.header().await?;
        if buf.len() < header.len() {
            return Err(StreamError::BufferTooSmall {
                needed: header.len(),
                got: buf.len(),
            });
        }
        buf[..header.len()].copy_from_slice(&header);
        self.stats.add_out(header.len() as u64);
        Ok(header.len())
    }

    /// Read from the input, racing the interrupt signal.
    ///
    /// An interrupt permit posted between reads aborts the next one; that is
    /// fine, because interrupts are only posted at teardown or while the
    /// input is already quiet.
    async fn read_input(&self, input: &mut Input, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            _ = self.interrupt.notified() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "input read interrupted",
            )),
            res = input.read(buf) => res,
        }
    }

    /// Open the input and read its header.
    ///
    /// Any failure here is terminal for the producer: a short header read, a
    /// header that differs from the one already published, or the open
    /// itself failing. Waiters are woken in every case so a reader blocked
    /// on the header can re-check the source's fate.
    async fn open_input(&self) -> io::Result<Input> {
        let result = self.open_input_inner().await;
        self.ring.wake_all();
        result
    }

    async fn open_input_inner(&self) -> io::Result<Input> {
        let mut input = match Input::open(&self.spec).await {
            Ok(input) => input,
            Err(err) => {
                tracing::warn!(source = %self.label, error = %err, "open failed");
                return Err(err);
            }
        };
        match input.pid() {
            Some(pid) => tracing::info!(source = %self.label, pid, "source opened"),
            None => tracing::info!(source = %self.label, "source opened"),
        }

        if self.header_bytes > 0 {
            let mut header = vec![0u8; self.header_bytes];
            let mut pos = 0;
            while pos < self.header_bytes {
                if self.is_gone() {
                    input.close().await;
                    return Err(input_closed());
                }
                match self.read_input(&mut input, &mut header[pos..]).await {
                    Ok(0) => {
                        tracing::warn!(source = %self.label, "input ended inside header");
                        input.close().await;
                        return Err(input_closed());
                    }
                    Ok(got) => pos += got,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::warn!(source = %self.label, error = %err, "header read failed");
                        input.close().await;
                        return Err(err);
                    }
                }
            }
            let header = Bytes::from(header);
            let mismatched = {
                let stored = self.header.lock().unwrap();
                !stored.is_empty() && *stored != header
            };
            if mismatched {
                tracing::warn!(
                    source = %self.label,
                    "header changed across reopen, abandoning source"
                );
                input.close().await;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "header mismatch on reopen",
                ));
            }
            {
                let mut stored = self.header.lock().unwrap();
                *stored = header;
            }
            self.stats.add_in(self.header_bytes as u64);
        }
        Ok(input)
    }

    async fn close_input(&self, input: Input, opened_at: Instant) {
        tracing::info!(
            source = %self.label,
            open_for = ?opened_at.elapsed(),
            "input closed"
        );
        self.log_stats();
        input.close().await;
    }

    /// Fill the next write slot with one frame.
    ///
    /// Combines carryover bytes from the previous iteration with fresh input
    /// and walks the filter over the buffer until it accepts a frame. On
    /// success the slot holds exactly the accepted frame and any surplus is
    /// left in `todo` for the next call. If the buffer fills to capacity
    /// without an accepted frame, the whole buffer is shipped as one frame
    /// (reported size 0, so the throttle does not count it).
    async fn read_next_frame(
        &self,
        input: &mut Option<Input>,
        todo: &mut Vec<u8>,
        filter: &mut dyn FrameFilter,
    ) -> io::Result<usize> {
        let frame_bytes = self.ring.frame_bytes();
        let mut slot = self.ring.write_slot(self.ring.published()).await;
        slot.resize(frame_bytes, 0);

        let mut frame_end = 0;
        while frame_end < frame_bytes {
            if self.is_gone() {
                // Stop without using up todo.
                return Err(input_closed());
            } else if !todo.is_empty() {
                slot[frame_end..frame_end + todo.len()].copy_from_slice(todo);
                frame_end += todo.len();
                todo.clear();
            } else {
                // Stop after using up todo.
                let Some(open) = input.as_mut() else {
                    return Err(input_closed());
                };
                match self.read_input(open, &mut slot[frame_end..]).await {
                    Ok(0) => return Err(input_closed()),
                    Ok(got) => {
                        if self.is_gone() {
                            return Err(input_closed());
                        }
                        frame_end += got;
                        self.stats.add_in(got as u64);
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        tokio::time::sleep(ZERO_READ_BACKOFF).await;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            let mut frame_start = 0;
            let mut accepted = None;
            while frame_start < frame_end {
                match filter.scan(&slot[frame_start..frame_end]) {
                    Scan::Accept(size) if size > 0 => {
                        accepted = Some(size);
                        break;
                    }
                    // A zero-size accept cannot make progress; skip a byte
                    // like any other non-frame.
                    Scan::Accept(_) | Scan::Invalid => {
                        frame_start += 1;
                        self.stats.add_invalid(1);
                    }
                    Scan::Short => break,
                }
            }
            if let Some(size) = accepted {
                todo.extend_from_slice(&slot[frame_start + size..frame_end]);
                if frame_start > 0 {
                    slot.copy_within(frame_start..frame_start + size, 0);
                }
                slot.truncate(size);
                return Ok(size);
            }
            // Shuffle the remaining bytes over and get more data.
            slot.copy_within(frame_start..frame_end, 0);
            frame_end -= frame_start;
        }
        Ok(0)
    }

    /// Producer task: move bytes from the input into published frames until
    /// the input ends and cannot be reopened, or the source is closed.
    pub(crate) async fn run(self: Arc<Self>, mut filter: Box<dyn FrameFilter>) {
        let mut input = match self.open_input().await {
            Ok(input) => Some(input),
            Err(_) => {
                self.close();
                self.log_stats();
                return;
            }
        };
        let mut opened_at = Instant::now();
        let mut todo: Vec<u8> = Vec::with_capacity(self.ring.frame_bytes());

        let mut throttle = (self.bandwidth > 0).then(|| {
            let nanos =
                1_000_000_000u128 * self.ring.frame_bytes() as u128 / self.bandwidth as u128;
            let period = Duration::from_nanos(nanos as u64).max(Duration::from_nanos(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        if let Some(ticker) = throttle.as_mut() {
            // An interval fires immediately once; absorb that so the first
            // real tick takes a full period.
            ticker.tick().await;
        }
        let mut to_throttle = 0usize;

        let stat_task = (self.stat_log_interval > Duration::ZERO).then(|| {
            let source = Arc::clone(&self);
            let period = self.stat_log_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    source.log_stats();
                }
            })
        });

        let quiet_task = (self.max_quiet_interval > Duration::ZERO).then(|| {
            let source = Arc::clone(&self);
            let period = self.max_quiet_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                let mut last_count = source.stats.snapshot().bytes_in;
                let mut last_progress = Instant::now();
                loop {
                    ticker.tick().await;
                    let count = source.stats.snapshot().bytes_in;
                    if count == last_count {
                        tracing::warn!(
                            source = %source.label,
                            in_bytes = count,
                            quiet_for = ?last_progress.elapsed(),
                            "input stalled, forcing close"
                        );
                        source.interrupt.notify_one();
                    } else {
                        last_count = count;
                        last_progress = Instant::now();
                    }
                }
            })
        });

        while !self.is_gone() {
            match self
                .read_next_frame(&mut input, &mut todo, filter.as_mut())
                .await
            {
                Ok(frame_size) => {
                    self.ring.publish();
                    if let Some(ticker) = throttle.as_mut() {
                        to_throttle += frame_size;
                        while to_throttle >= self.ring.frame_bytes() {
                            ticker.tick().await;
                            to_throttle -= self.ring.frame_bytes();
                        }
                    }
                }
                Err(err) => {
                    if let Some(open) = input.take() {
                        tracing::info!(source = %self.label, error = %err, "input read ended");
                        self.close_input(open, opened_at).await;
                    }
                    if self.is_gone() || !self.reopen {
                        break;
                    }
                    match self.open_input().await {
                        Ok(reopened) => {
                            input = Some(reopened);
                            opened_at = Instant::now();
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        if let Some(task) = stat_task {
            task.abort();
        }
        if let Some(task) = quiet_task {
            task.abort();
        }
        if let Some(open) = input.take() {
            self.close_input(open, opened_at).await;
        }
        self.close();
        self.log_stats();
    }
}
