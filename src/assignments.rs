//! Assignment store
//!
//! Columnar record of which group each assigned row occupies in every kind.
//! A shared `rowids` sequence (insertion order, duplicate-free, with a set for
//! O(1) membership) is aligned with one global-group-id column per kind.
//!
//! Streaming inference continuously appends rows at the tail and pops them
//! from the head: the pop order matches the `assigned` cursor of the row
//! stream, which re-reads payloads in file order. Group ids stored here are
//! *global* ids; translating back to packed ids at removal time goes through
//! the owning mixture's id tracker.
//!
//! During a kind-structure phase the per-kind columns are detached into the
//! worker slots (each kind's consumer owns its column) and re-attached at
//! cleanup; only the rowid sequence stays home. The detached flag guards
//! against using the columnar API meanwhile.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet, VecDeque};

use crate::rows::AssignmentRecord;

/// Row-to-group assignment state across all kinds.
#[derive(Clone, Debug, Default)]
pub struct Assignments {
    rowids: VecDeque<u64>,
    rowid_set: HashSet<u64>,
    columns: Vec<VecDeque<u64>>,
    detached: bool,
}

impl Assignments {
    /// An empty store with one column per kind.
    pub fn init(kind_count: usize) -> Self {
        Assignments {
            rowids: VecDeque::new(),
            rowid_set: HashSet::new(),
            columns: vec![VecDeque::new(); kind_count],
            detached: false,
        }
    }

    /// Number of kinds (columns).
    #[inline]
    pub fn kind_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of currently assigned rows.
    #[inline]
    pub fn row_count(&self) -> usize {
        self.rowids.len()
    }

    /// Assigned row ids in insertion order.
    #[inline]
    pub fn rowids(&self) -> &VecDeque<u64> {
        &self.rowids
    }

    /// Whether `rowid` is currently assigned.
    #[inline]
    pub fn contains(&self, rowid: u64) -> bool {
        self.rowid_set.contains(&rowid)
    }

    /// One kind's global-group-id column, aligned with `rowids`.
    #[inline]
    pub fn groupids(&self, kindid: usize) -> &VecDeque<u64> {
        assert!(!self.detached, "columns are detached");
        &self.columns[kindid]
    }

    /// Append a row with its per-kind global group ids, atomically across
    /// kinds. Returns `false` (no side effect) on a duplicate rowid.
    pub fn append_row(&mut self, rowid: u64, groupids: &[u64]) -> bool {
        assert!(!self.detached, "columns are detached");
        assert_eq!(groupids.len(), self.columns.len(), "kind-count mismatch");
        if !self.try_push_rowid(rowid) {
            return false;
        }
        for (column, &gid) in self.columns.iter_mut().zip(groupids) {
            column.push_back(gid);
        }
        true
    }

    /// Pop the oldest row; returns its id and per-kind global group ids.
    pub fn pop_row(&mut self) -> (u64, Vec<u64>) {
        assert!(!self.detached, "columns are detached");
        let rowid = self.pop_rowid();
        let groupids = self
            .columns
            .iter_mut()
            .map(|c| c.pop_front().expect("column shorter than rowids"))
            .collect();
        (rowid, groupids)
    }

    /// Record a rowid only (columns are detached during kind-structure
    /// phases; each kind's consumer appends to its own column).
    pub fn try_push_rowid(&mut self, rowid: u64) -> bool {
        if !self.rowid_set.insert(rowid) {
            return false;
        }
        self.rowids.push_back(rowid);
        true
    }

    /// Pop the oldest rowid only.
    pub fn pop_rowid(&mut self) -> u64 {
        let rowid = self.rowids.pop_front().expect("no assigned rows");
        self.rowid_set.remove(&rowid);
        rowid
    }

    /// Append a column for a new kind; the caller fills it.
    pub fn packed_add_kind(&mut self) -> &mut VecDeque<u64> {
        assert!(!self.detached, "columns are detached");
        self.columns.push(VecDeque::new());
        self.columns.last_mut().expect("just pushed")
    }

    /// Remove a kind's column, swapping the last column into its place.
    pub fn packed_remove_kind(&mut self, kindid: usize) {
        assert!(!self.detached, "columns are detached");
        self.columns.swap_remove(kindid);
    }

    /// Hand the columns to the kind-structure phase.
    pub fn detach_columns(&mut self) -> Vec<VecDeque<u64>> {
        assert!(!self.detached, "columns already detached");
        self.detached = true;
        std::mem::take(&mut self.columns)
    }

    /// Take the columns back after the phase; the kind count may have
    /// changed, but every column must cover the assigned rows.
    pub fn attach_columns(&mut self, columns: Vec<VecDeque<u64>>) {
        assert!(self.detached, "columns are not detached");
        for column in &columns {
            assert_eq!(column.len(), self.rowids.len(), "column length mismatch");
        }
        self.columns = columns;
        self.detached = false;
    }

    /// Serialize assignments, rewriting global group ids through the
    /// per-kind canonical maps (global id to sorted index).
    pub fn dump_records(&self, remap: &[HashMap<u64, u32>]) -> Vec<AssignmentRecord> {
        assert!(!self.detached, "columns are detached");
        assert_eq!(remap.len(), self.columns.len());
        let mut records = Vec::with_capacity(self.rowids.len());
        for (i, &rowid) in self.rowids.iter().enumerate() {
            let groupids = self
                .columns
                .iter()
                .zip(remap)
                .map(|(column, map)| map[&column[i]])
                .collect();
            records.push(AssignmentRecord { rowid, groupids });
        }
        records
    }

    /// Rebuild from records; the stored sorted indices become the global
    /// ids, matching a freshly loaded mixture's tracker.
    pub fn from_records(kind_count: usize, records: &[AssignmentRecord]) -> Self {
        let mut store = Assignments::init(kind_count);
        for record in records {
            assert_eq!(record.groupids.len(), kind_count, "kind-count mismatch");
            let groupids: Vec<u64> = record.groupids.iter().map(|&g| g as u64).collect();
            let pushed = store.append_row(record.rowid, &groupids);
            assert!(pushed, "duplicate rowid {} in assignments", record.rowid);
        }
        store
    }

    /// Structural consistency check; panics with a diagnostic on violation.
    pub fn validate(&self) {
        assert_eq!(self.rowids.len(), self.rowid_set.len(), "duplicate rowids");
        if !self.detached {
            for column in &self.columns {
                assert_eq!(column.len(), self.rowids.len(), "column length mismatch");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
