//! Per-consumer source cursor

use std::sync::Arc;

use crate::error::StreamError;
use crate::source::Source;

/// Reads frames from a [`Source`]. Every successful
/// [`read_frame`](SourceReader::read_frame) call yields exactly one complete
/// frame (or, first, the header).
///
/// Dropping the reader detaches it from the source; readers kept alive
/// needlessly can keep an idle-close source open.
pub struct SourceReader {
    source: Arc<Source>,
    did_header: bool,
    /// Next frame index to read
    next: u64,
    frames_read: u64,
    /// A frame is "skipped" if an earlier and a later frame were both
    /// returned but the frame itself never was.
    frames_skipped: u64,
    bytes_read: u64,
}

impl SourceReader {
    pub(crate) fn new(source: Arc<Source>) -> Self {
        Self {
            source,
            did_header: false,
            next: 0,
            frames_read: 0,
            frames_skipped: 0,
            bytes_read: 0,
        }
    }

    /// The source this reader is attached to
    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    /// Frames delivered so far (header not included)
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Frames skipped because the producer lapped this reader
    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }

    /// Frame bytes delivered so far (header not included)
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Next frame index this reader will ask for
    #[cfg(test)]
    pub(crate) fn cursor(&self) -> u64 {
        self.next
    }

    /// Read the next frame (or, on the first call of a headered source, the
    /// header) into `buf`, blocking until one is available.
    ///
    /// Locking here is kept to the minimum, which tolerates two benign
    /// races: the producer may advance after we compute the skip count (the
    /// undercount is made up on the next call), and it may advance exactly
    /// to the frame we are about to copy (the producer then waits on that
    /// one slot while we copy, which beats serializing every publication
    /// behind a source-wide lock). The publication counter never moves
    /// backward, so neither race can produce a stale or torn frame.
    pub async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let source = Arc::clone(&self.source);
        if !self.did_header {
            self.did_header = true;
            if source.header_bytes() > 0 {
                return source.copy_header(buf).await;
            }
        }
        if source.client_max_bytes() > 0 && self.bytes_read >= source.client_max_bytes() {
            return Err(StreamError::EndOfStream);
        }

        let ring = source.ring();
        let published = ring.published();
        if published > 0 && self.next == 0 {
            // New readers start out reading fresh frames.
            self.next = published - 1;
        } else if published >= self.next + ring.capacity() {
            // The producer has lapped this reader. Catch up.
            let delta = published - self.next - 1;
            self.frames_skipped += delta;
            self.next += delta;
        } else if self.next >= published {
            // Caught up to the producer (including "both at zero").
            let next = self.next;
            ring.wait_until(|| next < ring.published() || source.is_gone())
                .await;
            if self.next >= ring.published() {
                // Source is gone and no complete frames remain.
                return Err(StreamError::EndOfStream);
            }
        }

        let slot = ring.read_slot(self.next).await;
        let frame_size = slot.len();
        if buf.len() < frame_size {
            return Err(StreamError::BufferTooSmall {
                needed: frame_size,
                got: buf.len(),
            });
        }
        buf[..frame_size].copy_from_slice(&slot);
        drop(slot);

        source.add_bytes_out(frame_size as u64);
        self.next += 1;
        self.frames_read += 1;
        self.bytes_read += frame_size as u64;
        Ok(frame_size)
    }
}

impl Drop for SourceReader {
    fn drop(&mut self) {
        self.source.reader_done();
    }
}
