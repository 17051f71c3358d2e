//! Process-wide pool of upload chunk buffers.
//!
//! Only the canonical 5MB block is pooled; buffers for non-default chunk
//! sizes are allocated fresh and dropped on return so odd sizes never
//! pollute the pool. The outstanding/peak counters track how many chunk
//! buffers are live between `get_buffer` and `put_buffer`, which is what
//! bounds the uploader's memory: the reader's fill buffer plus the
//! bounded queue plus the chunks inside the workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::constants::DEFAULT_CHUNK_SIZE;

/// The only buffer size the pool retains.
pub const POOL_BLOCK_SIZE: usize = DEFAULT_CHUNK_SIZE;

lazy_static! {
    static ref BUFFER_POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());
}

static OUTSTANDING: AtomicUsize = AtomicUsize::new(0);
static PEAK_OUTSTANDING: AtomicUsize = AtomicUsize::new(0);

/// Get a zero-initialized buffer of exactly `size` bytes, reusing a
/// pooled block when the size is canonical.
pub fn get_buffer(size: usize) -> Vec<u8> {
    let live = OUTSTANDING.fetch_add(1, Ordering::SeqCst) + 1;
    PEAK_OUTSTANDING.fetch_max(live, Ordering::SeqCst);

    if size == POOL_BLOCK_SIZE {
        if let Some(buffer) = BUFFER_POOL.lock().unwrap().pop() {
            return buffer;
        }
    }
    vec![0u8; size]
}

/// Return a buffer to the pool. Non-canonical sizes are dropped.
pub fn put_buffer(buffer: Vec<u8>) {
    let _ = OUTSTANDING.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
        Some(live.saturating_sub(1))
    });

    if buffer.len() == POOL_BLOCK_SIZE {
        BUFFER_POOL.lock().unwrap().push(buffer);
    }
}

/// Chunk buffers currently live (taken and not yet returned).
pub fn outstanding_buffers() -> usize {
    OUTSTANDING.load(Ordering::SeqCst)
}

/// High-water mark of concurrently live chunk buffers since the last
/// [`reset_peak_outstanding`].
pub fn peak_outstanding_buffers() -> usize {
    PEAK_OUTSTANDING.load(Ordering::SeqCst)
}

/// Reset the high-water mark to the current outstanding count.
pub fn reset_peak_outstanding() {
    PEAK_OUTSTANDING.store(OUTSTANDING.load(Ordering::SeqCst), Ordering::SeqCst);
}

#[cfg(test)]
pub(crate) fn pool_len() -> usize {
    BUFFER_POOL.lock().unwrap().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    lazy_static! {
        // The pool is process-wide; keep the counting tests from racing
        // each other.
        static ref POOL_TEST_LOCK: Mutex<()> = Mutex::new(());
    }

    #[test]
    fn test_canonical_buffers_are_reused() {
        let _guard = POOL_TEST_LOCK.lock().unwrap();

        let buffer = get_buffer(POOL_BLOCK_SIZE);
        assert_eq!(buffer.len(), POOL_BLOCK_SIZE);
        put_buffer(buffer);

        let before = pool_len();
        let buffer = get_buffer(POOL_BLOCK_SIZE);
        assert_eq!(pool_len(), before - 1);
        put_buffer(buffer);
    }

    #[test]
    fn test_non_canonical_buffers_are_not_pooled() {
        let _guard = POOL_TEST_LOCK.lock().unwrap();

        let buffer = get_buffer(1024);
        assert_eq!(buffer.len(), 1024);

        let before = pool_len();
        put_buffer(buffer);
        assert_eq!(pool_len(), before);
    }

    #[test]
    fn test_repeated_cycles() {
        let _guard = POOL_TEST_LOCK.lock().unwrap();

        for _ in 0..100 {
            let buffer = get_buffer(POOL_BLOCK_SIZE);
            assert_eq!(buffer.len(), POOL_BLOCK_SIZE);
            put_buffer(buffer);
        }
    }

    #[test]
    fn test_outstanding_counters() {
        let _guard = POOL_TEST_LOCK.lock().unwrap();

        let base = outstanding_buffers();
        reset_peak_outstanding();

        let a = get_buffer(POOL_BLOCK_SIZE);
        let b = get_buffer(POOL_BLOCK_SIZE);
        assert_eq!(outstanding_buffers(), base + 2);
        assert!(peak_outstanding_buffers() >= base + 2);

        put_buffer(a);
        put_buffer(b);
        assert_eq!(outstanding_buffers(), base);
        // The peak stays put until the next reset.
        assert!(peak_outstanding_buffers() >= base + 2);
    }
}
