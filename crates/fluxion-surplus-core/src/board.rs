// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use chrono::{DateTime, Utc};
use fluxion_surplus_types::AllocationResult;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::excess::ExcessReport;
use crate::traits::AllocationObserver;

/// Latest published state of one entry
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntrySnapshot {
    pub entry_id: String,
    pub excess: Option<ExcessReport>,
    pub allocation: Option<AllocationResult>,
    pub watchdog_alerted: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// In-memory board of the latest results of all entries
#[derive(Debug, Clone, Default)]
pub struct DistributionBoard {
    entries: Arc<RwLock<BTreeMap<String, EntrySnapshot>>>,
}

impl DistributionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an entry visible before its first cycle
    pub fn register(&self, entry_id: &str) {
        self.entries
            .write()
            .entry(entry_id.to_owned())
            .or_insert_with(|| EntrySnapshot {
                entry_id: entry_id.to_owned(),
                ..Default::default()
            });
    }

    pub fn snapshot(&self, entry_id: &str) -> Option<EntrySnapshot> {
        self.entries.read().get(entry_id).cloned()
    }

    pub fn all(&self) -> Vec<EntrySnapshot> {
        self.entries.read().values().cloned().collect()
    }

    fn update(&self, entry_id: &str, apply: impl FnOnce(&mut EntrySnapshot)) {
        let mut entries = self.entries.write();
        let snapshot = entries
            .entry(entry_id.to_owned())
            .or_insert_with(|| EntrySnapshot {
                entry_id: entry_id.to_owned(),
                ..Default::default()
            });
        apply(snapshot);
        snapshot.updated_at = Some(Utc::now());
    }
}

impl AllocationObserver for DistributionBoard {
    fn publish_excess(&self, entry_id: &str, report: &ExcessReport) {
        self.update(entry_id, |s| s.excess = Some(report.clone()));
    }

    fn publish_allocation(&self, entry_id: &str, result: &AllocationResult) {
        self.update(entry_id, |s| s.allocation = Some(result.clone()));
    }

    fn publish_watchdog(&self, entry_id: &str, alerted: bool) {
        self.update(entry_id, |s| s.watchdog_alerted = alerted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_read_back() {
        let board = DistributionBoard::new();
        board.register("roof");
        assert!(board.snapshot("roof").unwrap().allocation.is_none());

        let result = AllocationResult::empty(250.0, Utc::now());
        board.publish_allocation("roof", &result);
        board.publish_watchdog("roof", true);

        let snapshot = board.snapshot("roof").unwrap();
        assert!((snapshot.allocation.unwrap().total_power - 250.0).abs() < f64::EPSILON);
        assert!(snapshot.watchdog_alerted);
        assert!(snapshot.updated_at.is_some());
        assert_eq!(board.all().len(), 1);
        assert!(board.snapshot("garage").is_none());
    }
}
