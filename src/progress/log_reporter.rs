//! Reporter that writes periodic progress lines through the log facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use log::info;

use crate::progress::Reporter;

/// Log a line roughly every this many uploaded bytes.
const REPORT_STEP: u64 = 50 * 1024 * 1024;

pub struct LogReporter {
    total: AtomicU64,
    uploaded: AtomicU64,
    next_report: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            next_report: AtomicU64::new(REPORT_STEP),
            started: Mutex::new(None),
        }
    }

    fn speed_mb_s(&self, uploaded: u64) -> f64 {
        let started = self.started.lock().unwrap();
        match *started {
            Some(t) => {
                let elapsed = t.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    uploaded as f64 / elapsed / 1024.0 / 1024.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }
}

impl Default for LogReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for LogReporter {
    fn init(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
        self.uploaded.store(0, Ordering::SeqCst);
        self.next_report.store(REPORT_STEP, Ordering::SeqCst);
        *self.started.lock().unwrap() = Some(Instant::now());
    }

    fn add(&self, n: u64) {
        let uploaded = self.uploaded.fetch_add(n, Ordering::SeqCst) + n;
        let due = self.next_report.load(Ordering::SeqCst);
        if uploaded >= due
            && self
                .next_report
                .compare_exchange(due, due + REPORT_STEP, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            info!(
                "Upload progress: {} MB transferred ({:.2} MB/s)",
                uploaded / 1024 / 1024,
                self.speed_mb_s(uploaded)
            );
        }
    }

    fn complete(&self) {
        let uploaded = self.uploaded.load(Ordering::SeqCst);
        info!(
            "Upload completed: {} bytes transferred ({:.2} MB/s)",
            uploaded,
            self.speed_mb_s(uploaded)
        );
    }

    fn close(&self) {}
}
