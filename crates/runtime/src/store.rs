// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Append-only snapshot storage
//!
//! Snapshots are referenced externally only by their [`SnapshotId`], which is
//! the store's length at insertion time. Ids are never reused or reassigned:
//! there is no removal.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::snapshot::Snapshot;

/// Position of a snapshot in its store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(u64);

impl SnapshotId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Value written back to the guest
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Id-indexed collection of snapshots
///
/// Appends are serialized by a single lock so ids stay sequential and
/// gap-free across threads.
#[derive(Default)]
pub struct SnapshotStore {
    snapshots: Mutex<Vec<Arc<Snapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot, returning its id
    pub fn push(&self, snapshot: Snapshot) -> SnapshotId {
        let mut snapshots = self.snapshots.lock();
        let id = SnapshotId(snapshots.len() as u64);
        snapshots.push(Arc::new(snapshot));
        id
    }

    pub fn get(&self, id: SnapshotId) -> Option<Arc<Snapshot>> {
        self.snapshots.lock().get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All snapshots with their ids, in insertion order
    pub fn snapshots(&self) -> Vec<(SnapshotId, Arc<Snapshot>)> {
        self.snapshots
            .lock()
            .iter()
            .enumerate()
            .map(|(i, s)| (SnapshotId(i as u64), Arc::clone(s)))
            .collect()
    }
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("len", &self.len())
            .finish()
    }
}
