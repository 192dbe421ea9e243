//! One-shot tool that stamps a fresh store as a voter.
//!
//! Deployments that lay down their membership ahead of time initialize
//! each replica's storage before first start, skipping the recovery
//! handshake entirely. Clusters that grow organically use
//! [`crate::recover`] instead.

use std::path::Path;

use tracing::info;

use crate::storage::{DiskStorage, Storage, INITIAL_PROMISED};
use crate::types::{Metadata, Status, StorageError};

/// Mark the store at `path` as a voting member, creating it if needed.
///
/// Idempotent: an already-voting store is left untouched, and the
/// promised proposal is always preserved.
pub fn initialize(path: impl AsRef<Path>) -> Result<(), StorageError> {
    let mut storage = DiskStorage::open(&path)?;
    let state = storage.restore()?;

    if state.metadata.status == Status::Voting {
        return Ok(());
    }

    storage.persist_metadata(&Metadata {
        status: Status::Voting,
        promised: state.metadata.promised.max(INITIAL_PROMISED),
    })?;
    info!(path = %path.as_ref().display(), "storage initialized as voting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_marks_voting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log");

        initialize(&path).expect("initialize");

        let storage = DiskStorage::open(&path).expect("open");
        let state = storage.restore().expect("restore");
        assert_eq!(state.metadata.status, Status::Voting);
        assert_eq!(state.metadata.promised, INITIAL_PROMISED);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log");

        initialize(&path).expect("initialize");
        initialize(&path).expect("initialize again");

        let storage = DiskStorage::open(&path).expect("open");
        let state = storage.restore().expect("restore");
        assert_eq!(state.metadata.status, Status::Voting);
    }
}
