//! Result sinks
//!
//! Assertions report pass/fail outcomes keyed by test case id. A sink may
//! be shared by engines running on several threads, so every method takes
//! `&self`.

use std::sync::{Mutex, MutexGuard};

/// One recorded pass/fail result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub test_case: String,
    pub passed: bool,
    pub diagnostic: String,
}

/// Receives outcomes from assertion operations
pub trait ResultSink: Send + Sync {
    fn record_outcome(&self, test_case: &str, passed: bool, diagnostic: &str);

    /// Called by `report` once a test case has all its outcomes
    fn finalize(&self, test_case: &str);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps every outcome in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    outcomes: Mutex<Vec<Outcome>>,
    finalized: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes in the order they were recorded
    pub fn outcomes(&self) -> Vec<Outcome> {
        lock(&self.outcomes).clone()
    }

    /// Test case ids passed to `finalize`, in order
    pub fn finalized(&self) -> Vec<String> {
        lock(&self.finalized).clone()
    }

    /// Whether every outcome recorded for `test_case` passed. `None` when
    /// nothing was recorded for it.
    pub fn verdict(&self, test_case: &str) -> Option<bool> {
        let outcomes = lock(&self.outcomes);
        let mut seen = false;
        for o in outcomes.iter().filter(|o| o.test_case == test_case) {
            if !o.passed {
                return Some(false);
            }
            seen = true;
        }
        seen.then_some(true)
    }

    /// Number of failed outcomes across all test cases
    pub fn failures(&self) -> usize {
        lock(&self.outcomes).iter().filter(|o| !o.passed).count()
    }
}

impl ResultSink for MemorySink {
    fn record_outcome(&self, test_case: &str, passed: bool, diagnostic: &str) {
        lock(&self.outcomes).push(Outcome {
            test_case: test_case.to_string(),
            passed,
            diagnostic: diagnostic.to_string(),
        });
    }

    fn finalize(&self, test_case: &str) {
        lock(&self.finalized).push(test_case.to_string());
    }
}

/// Writes outcomes to the log and keeps nothing
#[derive(Debug, Default)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn record_outcome(&self, test_case: &str, passed: bool, diagnostic: &str) {
        if passed {
            log::info!("[{}] PASS {}", test_case, diagnostic);
        } else {
            log::warn!("[{}] FAIL {}", test_case, diagnostic);
        }
    }

    fn finalize(&self, test_case: &str) {
        log::info!("[{}] reported", test_case);
    }
}
