use serde::Serialize;

/// What one pipeline cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub staged: usize,
    pub overflowed: u64,
    /// Already in the long-lived pool
    pub pool_hits: u64,
    /// Rehydrated from the store
    pub store_hits: u64,
    /// Never seen before and worth keeping
    pub fresh: u64,
    /// Never seen before and anonymous
    pub anonymous_new: u64,
    /// Discarded in the last phase for being anonymous
    pub anonymous_hits: u64,
    pub known: u64,
    pub inserted: u64,
    pub rejected: u64,
    pub insert_failures: u64,
    pub pruned: Option<usize>,
}

/// Running totals since boot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionStats {
    pub scans: u64,
    pub devices_seen: u64,
    pub pool_hits: u64,
    pub store_hits: u64,
    pub new_devices: u64,
    pub anonymous_hits: u64,
    pub insert_failures: u64,
    /// Rows in the store: count at boot plus inserts since
    pub total_entries: u64,
    pub overflowed: u64,
    pub pruned: u64,
    /// Core rebuilds since the process started
    pub restarts: u64,
}

impl SessionStats {
    pub fn absorb(&mut self, report: &CycleReport) {
        self.scans += 1;
        self.devices_seen += report.staged as u64;
        self.pool_hits += report.pool_hits;
        self.store_hits += report.store_hits;
        self.new_devices += report.fresh;
        self.anonymous_hits += report.anonymous_hits;
        self.insert_failures += report.insert_failures;
        self.total_entries += report.inserted;
        self.overflowed += report.overflowed;
        if let Some(pruned) = report.pruned {
            self.pruned += pruned as u64;
            self.total_entries = self.total_entries.saturating_sub(pruned as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_accumulates() {
        let mut stats = SessionStats {
            total_entries: 10,
            ..Default::default()
        };
        let report = CycleReport {
            staged: 4,
            inserted: 2,
            anonymous_hits: 1,
            pruned: Some(3),
            ..Default::default()
        };
        stats.absorb(&report);
        stats.absorb(&CycleReport::default());

        assert_eq!(stats.scans, 2);
        assert_eq!(stats.devices_seen, 4);
        assert_eq!(stats.anonymous_hits, 1);
        assert_eq!(stats.total_entries, 9);
    }
}
