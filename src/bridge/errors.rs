// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Scoped capture of server errors, and what to do when the server runs out
//! of memory.

use tracing::{debug, warn};
use x11rb::{protocol::xproto, x11_utils::X11Error};

/// Captures errors for a contiguous range of requests. The caller nominates
/// the first sequence number to intercept; every error at or after it lands
/// in the trap until `end` is called. The caller synchronizes with the
/// server before reading the result, so late errors can't escape the scope.
#[derive(Debug, Default)]
pub struct ErrorTrap {
    active: bool,
    first_sequence: u16,
    caught: Option<X11Error>,
}

impl ErrorTrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, first_sequence: u64) {
        debug_assert!(!self.active, "error trap is not reentrant");
        self.active = true;
        self.first_sequence = first_sequence as u16;
        self.caught = None;
    }

    /// Offers an error to the trap. True if the trap consumed it. The wire
    /// only carries the low 16 bits of the sequence, so membership in the
    /// guarded range is judged in a wrapping window.
    pub fn filter(&mut self, error: &X11Error) -> bool {
        if !self.active {
            return false;
        }

        let distance = error.sequence.wrapping_sub(self.first_sequence);
        if distance >= 0x8000 {
            return false;
        }

        // Only the first error of the range is interesting.
        if self.caught.is_none() {
            self.caught = Some(error.clone());
        }

        true
    }

    pub fn end(&mut self) -> Option<X11Error> {
        self.active = false;
        self.caught.take()
    }
}

/// Which badness quintile a client's share of allocated pixels falls in.
fn bucket(share_permille: u64) -> usize {
    match share_permille {
        0..=50 => 0,
        51..=100 => 1,
        101..=200 => 2,
        201..=500 => 3,
        _ => 4,
    }
}

/// Given per-client pixel scores, the clients to disconnect after the server
/// reports allocation failure: everyone in the highest populated bucket.
pub fn oom_victims<K: Clone>(scores: &[(K, u64)]) -> Vec<K> {
    let total: u64 = scores.iter().map(|(_, s)| s).sum();
    if total == 0 {
        return Vec::new();
    }

    let buckets: Vec<usize> = scores
        .iter()
        .map(|(_, s)| bucket(s * 1000 / total))
        .collect();

    let worst = buckets.iter().copied().max().unwrap();
    scores
        .iter()
        .zip(buckets)
        .filter(|(_, b)| *b == worst)
        .map(|((k, _), _)| k.clone())
        .collect()
}

/// Policy state for unguarded server errors.
#[derive(Debug, Default)]
pub struct ErrorPolicy {
    /// After memory exhaustion, destructors run on resources the server
    /// never created; the resulting not-found errors are expected.
    swallow_not_found: bool,
}

impl ErrorPolicy {
    /// Classifies an unguarded error. Returns true if the caller should run
    /// the quota-disconnect pass.
    pub fn note_error(&mut self, error: &X11Error) -> bool {
        match error.error_code {
            xproto::ALLOC_ERROR => {
                warn!("server reported allocation failure");
                self.swallow_not_found = true;
                true
            }
            xproto::WINDOW_ERROR | xproto::DRAWABLE_ERROR | xproto::PIXMAP_ERROR
                if self.swallow_not_found =>
            {
                debug!(
                    error_code = error.error_code,
                    sequence = error.sequence,
                    "ignoring expected error after memory exhaustion"
                );
                false
            }
            _ => {
                warn!(
                    error_code = error.error_code,
                    major = error.major_opcode,
                    minor = error.minor_opcode,
                    sequence = error.sequence,
                    "unhandled server error"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn quintile_edges() {
        assert_eq!(bucket(0), 0);
        assert_eq!(bucket(50), 0);
        assert_eq!(bucket(51), 1);
        assert_eq!(bucket(100), 1);
        assert_eq!(bucket(200), 2);
        assert_eq!(bucket(500), 3);
        assert_eq!(bucket(501), 4);
        assert_eq!(bucket(1000), 4);
    }

    #[test]
    fn worst_bucket_disconnected() {
        // A=10 (5%), B=20 (10%), C=170 (85%). Only C goes.
        let scores = [('a', 10), ('b', 20), ('c', 170)];
        assert_eq!(oom_victims(&scores), vec!['c']);
    }

    #[test]
    fn ties_in_worst_bucket() {
        let scores = [('a', 100), ('b', 100), ('c', 1)];
        assert_eq!(oom_victims(&scores), vec!['a', 'b']);
    }

    #[test]
    fn empty_scores() {
        let scores: [(char, u64); 0] = [];
        assert!(oom_victims(&scores).is_empty());

        let zeroed = [('a', 0)];
        assert!(oom_victims(&zeroed).is_empty());
    }
}
