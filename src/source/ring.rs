//! Shared frame ring
//!
//! A fixed set of frame slots shared by one writer (the producer task) and
//! any number of readers. Slot `k % capacity` holds published frame `k`.
//! Exclusion is per slot, so a writer filling one slot never blocks readers
//! copying any other, which is what keeps thousands of readers cheap.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Ring of frame slots with a monotone publication counter
pub struct FrameRing {
    slots: Box<[RwLock<BytesMut>]>,
    frame_bytes: usize,
    /// Total frames ever published. Never decreases.
    published: AtomicU64,
    /// Broadcast for "published advanced" and lifecycle transitions
    notify: Notify,
}

impl FrameRing {
    /// Create a ring of `capacity` slots, each able to hold `frame_bytes`.
    ///
    /// Capacity must exceed 2: with fewer slots the writer and a current
    /// reader could contend for the same slot on every frame.
    pub fn new(capacity: usize, frame_bytes: usize) -> Self {
        assert!(capacity > 2, "ring capacity must be greater than 2");
        assert!(frame_bytes > 0, "frame size must be at least 1 byte");
        let slots = (0..capacity)
            .map(|_| RwLock::new(BytesMut::with_capacity(frame_bytes)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            frame_bytes,
            published: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Maximum frame size
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Total frames ever published
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Lock frame `index`'s slot for writing. Blocks while any reader is
    /// copying that slot out.
    pub async fn write_slot(&self, index: u64) -> RwLockWriteGuard<'_, BytesMut> {
        self.slots[(index % self.capacity()) as usize].write().await
    }

    /// Lock frame `index`'s slot for reading, keeping its contents stable
    /// for the duration of the copy.
    pub async fn read_slot(&self, index: u64) -> RwLockReadGuard<'_, BytesMut> {
        self.slots[(index % self.capacity()) as usize].read().await
    }

    /// Record one more published frame and wake every waiter.
    ///
    /// The caller must have released the slot's write guard first; readers
    /// woken here will immediately try to lock that slot.
    pub fn publish(&self) {
        self.published.fetch_add(1, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Wake every waiter without publishing, for lifecycle transitions
    /// (header arrival, source teardown).
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Park until `ready` returns true, re-checking on every wakeup.
    ///
    /// The waiter is registered *before* each check, so a wakeup landing
    /// between the check and the await cannot be lost; this is the condvar
    /// protocol the ring's counter and lifecycle flags rely on.
    pub async fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    #[should_panic(expected = "greater than 2")]
    fn test_tiny_capacity_rejected() {
        FrameRing::new(2, 16);
    }

    #[tokio::test]
    async fn test_publish_is_monotone() {
        let ring = FrameRing::new(4, 16);
        assert_eq!(ring.published(), 0);
        for want in 1..=10 {
            ring.publish();
            assert_eq!(ring.published(), want);
        }
    }

    #[tokio::test]
    async fn test_slot_roundtrip() {
        let ring = FrameRing::new(4, 8);
        {
            let mut slot = ring.write_slot(5).await;
            slot.clear();
            slot.extend_from_slice(b"abc");
        }
        ring.publish();
        // Index 5 and index 1 share a slot in a 4-slot ring.
        let slot = ring.read_slot(1).await;
        assert_eq!(&slot[..], b"abc");
    }

    #[tokio::test]
    async fn test_waiter_woken_by_publish() {
        let ring = Arc::new(FrameRing::new(4, 8));
        let waiter = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move {
                ring.wait_until(|| ring.published() > 0).await;
                ring.published()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ring.publish();
        let seen = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn test_wait_until_already_ready() {
        let ring = FrameRing::new(4, 8);
        ring.publish();
        // Must return without any further wakeup.
        tokio::time::timeout(Duration::from_millis(100), ring.wait_until(|| ring.published() > 0))
            .await
            .expect("ready condition should not block");
    }

    #[tokio::test]
    async fn test_reader_blocks_writer_on_same_slot() {
        let ring = Arc::new(FrameRing::new(4, 8));
        let read_guard = ring.read_slot(0).await;

        let ring2 = Arc::clone(&ring);
        let writer = tokio::spawn(async move {
            let mut slot = ring2.write_slot(0).await;
            slot.clear();
            slot.extend_from_slice(b"x");
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        // A different slot is not affected.
        let _other = ring.write_slot(1).await;

        drop(read_guard);
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should proceed once the reader is done")
            .unwrap();
    }
}
