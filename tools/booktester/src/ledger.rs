use std::collections::BTreeSet;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckReason {
    Verified,
    Skipped,
    FastForwarded,
}

/// Indices of listings that have been accounted for during one chapter run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckLedger {
    verified: BTreeSet<usize>,
    skipped: BTreeSet<usize>,
    fast_forwarded: BTreeSet<usize>,
}

impl CheckLedger {
    pub fn mark(&mut self, index: usize, reason: CheckReason) {
        match reason {
            CheckReason::Verified => self.verified.insert(index),
            CheckReason::Skipped => self.skipped.insert(index),
            CheckReason::FastForwarded => self.fast_forwarded.insert(index),
        };
    }

    pub fn mark_range(&mut self, range: Range<usize>, reason: CheckReason) {
        for index in range {
            self.mark(index, reason);
        }
    }

    pub fn is_checked(&self, index: usize) -> bool {
        self.verified.contains(&index)
            || self.skipped.contains(&index)
            || self.fast_forwarded.contains(&index)
    }

    pub fn checked(&self) -> BTreeSet<usize> {
        self.verified
            .iter()
            .chain(&self.skipped)
            .chain(&self.fast_forwarded)
            .copied()
            .collect()
    }

    /// Indices below `total` that were never checked.
    pub fn missing(&self, total: usize) -> Vec<usize> {
        (0..total).filter(|index| !self.is_checked(*index)).collect()
    }

    pub fn verified_count(&self) -> usize {
        self.verified.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn fast_forwarded_count(&self) -> usize {
        self.fast_forwarded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_lists_unchecked_indices_in_order() {
        let mut ledger = CheckLedger::default();
        ledger.mark(0, CheckReason::Verified);
        ledger.mark(2, CheckReason::Skipped);
        ledger.mark_range(4..6, CheckReason::FastForwarded);

        assert_eq!(ledger.missing(7), vec![1, 3, 6]);
        assert_eq!(ledger.checked(), BTreeSet::from([0, 2, 4, 5]));
        assert_eq!(ledger.fast_forwarded_count(), 2);
    }

    #[test]
    fn marking_twice_is_idempotent() {
        let mut ledger = CheckLedger::default();
        ledger.mark(1, CheckReason::Verified);
        ledger.mark(1, CheckReason::Verified);
        assert_eq!(ledger.verified_count(), 1);
        assert!(ledger.missing(2) == vec![0]);
    }
}
