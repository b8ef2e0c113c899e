//! Regex scanning bounded by a wall-clock time budget.
//!
//! Each pass runs several `regex::bytes::Regex` scans directly over the raw
//! input buffer (never over a lossily-decoded copy, so high bytes pass
//! through exactly as encoded). Because the input is untrusted
//! and regex catastrophic backtracking is a real risk against adversarial
//! captures, every scan that walks the whole buffer is run to completion on
//! a dedicated worker thread and given a deadline: if the thread hasn't
//! produced its match list by then, the caller gets [`Error::RegexTimeout`]
//! and the owning pass treats it like any other recoverable per-record
//! failure — it logs and moves on rather than wedging the pipeline.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use regex::bytes::Regex;

use crate::error::{Error, Result};

/// Default per-scan time budget. Containers this parser targets are known to
/// take anywhere from a few seconds to a few minutes; this conservative
/// default covers both ends, and callers needing a different budget can
/// build their own [`ScanBudget`].
pub const DEFAULT_SCAN_BUDGET: Duration = Duration::from_secs(60);

/// A configurable time budget for one bounded regex scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanBudget(pub Duration);

impl Default for ScanBudget {
    fn default() -> Self {
        ScanBudget(DEFAULT_SCAN_BUDGET)
    }
}

/// One match produced by a bounded scan: owned copies of start/end offsets
/// and capture group spans, since the match list must outlive the worker
/// thread that `regex::bytes::Match` borrows from.
#[derive(Debug, Clone)]
pub struct OwnedMatch {
    pub start: usize,
    pub end: usize,
    /// Capture group spans, `None` for unmatched optional groups, index 0
    /// omitted (it is always `start..end`).
    pub groups: Vec<Option<(usize, usize)>>,
}

/// Run `pattern.captures_iter(haystack)` to completion on a worker thread,
/// returning every match's span and capture groups, or
/// [`Error::RegexTimeout`] if the scan does not finish within `budget`.
///
/// `pass` names the calling pass for the timeout error and worker thread.
pub fn bounded_find_iter(
    pattern: &Regex,
    haystack: &[u8],
    budget: ScanBudget,
    pass: &'static str,
) -> Result<Vec<OwnedMatch>> {
    // `regex::bytes::Regex` is `Clone` (it's an `Arc` around compiled
    // program state) and `Send + Sync`, so the worker can hold its own
    // handle without borrowing from this stack frame.
    let pattern = pattern.clone();
    let haystack = haystack.to_vec();
    let (tx, rx) = mpsc::channel();

    let builder = thread::Builder::new().name(format!("plfx-scan-{pass}"));
    let handle = builder
        .spawn(move || {
            let matches: Vec<OwnedMatch> = pattern
                .captures_iter(&haystack)
                .map(|caps| {
                    let m = caps.get(0).expect("capture group 0 always matches");
                    let groups = (1..caps.len())
                        .map(|i| caps.get(i).map(|g| (g.start(), g.end())))
                        .collect();
                    OwnedMatch { start: m.start(), end: m.end(), groups }
                })
                .collect();
            // Ignore send failure: it only means the receiver already
            // timed out and stopped listening.
            let _ = tx.send(matches);
        })
        .expect("spawning a scan worker thread");

    match rx.recv_timeout(budget.0) {
        Ok(matches) => {
            let _ = handle.join();
            Ok(matches)
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            // The worker thread is detached; it will finish eventually and
            // its result will simply be dropped. Signal a recoverable error
            // and move on rather than hard-killing the thread, which Rust
            // has no safe mechanism to do anyway.
            Err(Error::RegexTimeout { pass })
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(Error::RegexTimeout { pass })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_matches_and_groups() {
        let re = Regex::new(r"(?-u)(DB)(\d+)").unwrap();
        let hay = b"prefix DB12 middle DB7 suffix";
        let matches = bounded_find_iter(&re, hay, ScanBudget::default(), "test").unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(&hay[matches[0].groups[1].unwrap().0..matches[0].groups[1].unwrap().1], b"12");
        assert_eq!(&hay[matches[1].groups[1].unwrap().0..matches[1].groups[1].unwrap().1], b"7");
    }

    #[test]
    fn empty_haystack_yields_no_matches() {
        let re = Regex::new(r"(?-u)DB\d+").unwrap();
        let matches = bounded_find_iter(&re, b"", ScanBudget::default(), "test").unwrap();
        assert!(matches.is_empty());
    }
}
