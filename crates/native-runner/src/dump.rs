// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Writing snapshots to disk for inspection

use std::{fs, path::Path};

use anyhow::{Context, Result};
use runtime::{Snapshot, SnapshotId, SnapshotStore};
use tracing::info;

/// Write every snapshot in `store` into `dir`, creating it if needed
///
/// Each snapshot becomes `snapshot-<id>.globals`, `.data`, `.stack` and, when
/// the portable encoding succeeded, `.portable`.
pub fn dump_all(store: &SnapshotStore, dir: &Path) -> Result<usize> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let snapshots = store.snapshots();
    for (id, snapshot) in &snapshots {
        dump(*id, snapshot, dir)?;
    }
    Ok(snapshots.len())
}

fn dump(id: SnapshotId, snapshot: &Snapshot, dir: &Path) -> Result<()> {
    let mut files = vec![
        ("globals", snapshot.globals()),
        ("data", snapshot.data()),
        ("stack", snapshot.native_stack()),
    ];
    if let Some(portable) = snapshot.portable_stack() {
        files.push(("portable", portable));
    }

    for (extension, bytes) in files {
        let path = dir.join(format!("snapshot-{id}.{extension}"));
        fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    }
    info!(%id, dir = %dir.display(), "dumped snapshot");
    Ok(())
}
