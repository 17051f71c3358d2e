//! Reporter that records every call, for assertions in tests.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::progress::Reporter;

#[derive(Default)]
pub struct MockReporter {
    pub init_calls: AtomicU64,
    pub init_total: AtomicU64,
    pub added: AtomicU64,
    pub complete_calls: AtomicU64,
    pub close_calls: AtomicU64,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_added(&self) -> u64 {
        self.added.load(Ordering::SeqCst)
    }
}

impl Reporter for MockReporter {
    fn init(&self, total: u64) {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.init_total.store(total, Ordering::SeqCst);
    }

    fn add(&self, n: u64) {
        self.added.fetch_add(n, Ordering::SeqCst);
    }

    fn complete(&self) {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}
