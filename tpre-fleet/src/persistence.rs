//! On-disk known-nodes store.
//!
//! The fleet snapshot is persisted as a CBOR file so a restarting node can
//! resume learning from its last view instead of its seed peers. Writes go
//! to a temporary file first and are moved into place with a rename.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use eyre::Context as _;
use serde::{Deserialize, Serialize};

use crate::state::{FleetSnapshot, QuarantineRecord, WorkerEntry};

#[derive(Serialize, Deserialize)]
struct KnownNodesFile {
    entries: Vec<WorkerEntry>,
    quarantine: Vec<QuarantineRecord>,
}

/// Loads the known-nodes store, `None` if the file does not exist yet.
pub async fn load_known_nodes(path: &Path) -> eyre::Result<Option<FleetSnapshot>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).context(format!("while reading known-nodes store {}", path.display()));
        }
    };
    let file: KnownNodesFile =
        ciborium::from_reader(bytes.as_slice()).context("while decoding known-nodes store")?;
    let entries: BTreeMap<_, _> = file
        .entries
        .into_iter()
        .map(|entry| (entry.metadata.node_id, entry))
        .collect();
    let quarantine: BTreeMap<_, _> = file
        .quarantine
        .into_iter()
        .map(|record| (record.metadata.node_id, record))
        .collect();
    Ok(Some(FleetSnapshot::from_parts(entries, quarantine)))
}

/// Persists `snapshot` atomically (write to temp, then rename).
pub async fn save_known_nodes(path: &Path, snapshot: &FleetSnapshot) -> eyre::Result<()> {
    let file = KnownNodesFile {
        entries: snapshot.entries().cloned().collect(),
        quarantine: snapshot.quarantine().cloned().collect(),
    };
    let mut bytes = Vec::new();
    ciborium::into_writer(&file, &mut bytes).context("while encoding known-nodes store")?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .context(format!("while writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .context(format!("while installing {}", path.display()))?;
    Ok(())
}
