//! Durable per-position storage.
//!
//! The [`Storage`] trait abstracts what a replica must persist: one
//! [`Action`] per position, plus a single [`Metadata`] header. Writes
//! must be durable before they return; a crash mid-persist leaves the
//! store in its pre-persist state.
//!
//! [`DiskStorage`] is the production implementation, backed by a redb
//! database with two tables:
//!
//! - `actions`: `u64` position -> bincode-encoded [`Action`]
//! - `metadata`: reserved string keys for the [`Metadata`] header and
//!   the cached truncation point
//!
//! Every logical persist is one committed write transaction, and redb
//! commits are fsync-durable, which gives the crash contract for free.
//! A learned truncate removes the persisted keys below `to` inside the
//! same transaction that records the truncate action, so the cost is
//! proportional to the number of entries actually discarded, never to
//! the numeric width of the truncated range.
//!
//! [`MemoryStorage`] is the in-memory twin used by unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::types::{Action, Metadata, Op, Position, Proposal, StorageError};

const ACTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("actions");
const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");

const METADATA_KEY: &str = "metadata";
const BEGIN_KEY: &str = "begin";

/// Everything a replica learns from its store at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    /// The durable per-replica header.
    pub metadata: Metadata,

    /// Lowest retained position.
    pub begin: Position,

    /// Highest persisted position.
    pub end: Position,

    /// Positions persisted with `learned` set.
    pub learned: BTreeSet<u64>,

    /// Positions persisted but not yet learned.
    pub unlearned: BTreeSet<u64>,
}

impl State {
    fn empty() -> Self {
        Self {
            metadata: Metadata::default(),
            begin: Position::ZERO,
            end: Position::ZERO,
            learned: BTreeSet::new(),
            unlearned: BTreeSet::new(),
        }
    }
}

/// Durable mapping from position to [`Action`] plus one metadata slot.
///
/// Implementations must make every persist fsync-durable before
/// returning. The store is single-owner: exactly one replica holds it
/// open at a time.
pub trait Storage {
    /// Rebuild the full [`State`] from what is on disk.
    fn restore(&self) -> Result<State, StorageError>;

    /// Durably record `action` at its position.
    ///
    /// A learned `Truncate { to }` additionally discards every persisted
    /// position below `to`, atomically with recording the action, and
    /// raises the retained-range floor to `to`.
    fn persist(&mut self, action: &Action) -> Result<(), StorageError>;

    /// Durably replace the metadata header.
    fn persist_metadata(&mut self, metadata: &Metadata) -> Result<(), StorageError>;

    /// Return the persisted action at `position`.
    ///
    /// Fails with [`StorageError::Truncated`] below the truncation
    /// point and [`StorageError::NotFound`] for a hole.
    fn read(&self, position: Position) -> Result<Action, StorageError>;
}

fn open_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Open(e.to_string())
}

fn persist_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Persist(e.to_string())
}

fn backend_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn codec_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Codec(e.to_string())
}

/// redb-backed [`Storage`].
pub struct DiskStorage {
    db: Database,
    begin: Position,
    end: Position,
}

impl DiskStorage {
    /// Open the store at `path`, creating it (and its parent
    /// directories) if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(open_err)?;
            }
        }

        let db = if path.exists() {
            Database::open(path).map_err(open_err)?
        } else {
            Database::create(path).map_err(open_err)?
        };

        // Make sure both tables exist so later read transactions
        // never race table creation.
        let txn = db.begin_write().map_err(open_err)?;
        {
            txn.open_table(ACTIONS).map_err(open_err)?;
            txn.open_table(METADATA).map_err(open_err)?;
        }
        txn.commit().map_err(open_err)?;

        let state = Self::load_state(&db)?;
        Ok(Self {
            db,
            begin: state.begin,
            end: state.end,
        })
    }

    fn load_state(db: &Database) -> Result<State, StorageError> {
        let txn = db.begin_read().map_err(backend_err)?;

        let metadata_table = txn.open_table(METADATA).map_err(backend_err)?;
        let metadata = match metadata_table.get(METADATA_KEY).map_err(backend_err)? {
            Some(value) => bincode::deserialize(value.value()).map_err(codec_err)?,
            None => Metadata::default(),
        };
        let begin = match metadata_table.get(BEGIN_KEY).map_err(backend_err)? {
            Some(value) => Position(bincode::deserialize(value.value()).map_err(codec_err)?),
            None => Position::ZERO,
        };

        let actions = txn.open_table(ACTIONS).map_err(backend_err)?;
        let mut state = State {
            metadata,
            begin,
            ..State::empty()
        };
        for item in actions.iter().map_err(backend_err)? {
            let (key, value) = item.map_err(backend_err)?;
            let action: Action = bincode::deserialize(value.value()).map_err(codec_err)?;
            if action.learned {
                state.learned.insert(key.value());
            } else {
                state.unlearned.insert(key.value());
            }
            state.end = state.end.max(Position(key.value()));
        }

        Ok(state)
    }
}

impl Storage for DiskStorage {
    fn restore(&self) -> Result<State, StorageError> {
        Self::load_state(&self.db)
    }

    fn persist(&mut self, action: &Action) -> Result<(), StorageError> {
        let encoded = bincode::serialize(action).map_err(codec_err)?;
        let truncate_to = match (&action.op, action.learned) {
            (Some(Op::Truncate { to }), true) => Some(*to),
            _ => None,
        };

        let txn = self.db.begin_write().map_err(persist_err)?;
        {
            let mut actions = txn.open_table(ACTIONS).map_err(persist_err)?;

            if let Some(to) = truncate_to {
                // Walk only the keys that actually exist below `to`.
                let doomed: Vec<u64> = {
                    let mut keys = Vec::new();
                    for item in actions.range(..to.0).map_err(persist_err)? {
                        let (key, _) = item.map_err(persist_err)?;
                        keys.push(key.value());
                    }
                    keys
                };
                for key in doomed {
                    actions.remove(key).map_err(persist_err)?;
                }
            }

            actions
                .insert(action.position.0, encoded.as_slice())
                .map_err(persist_err)?;

            if let Some(to) = truncate_to {
                let mut metadata = txn.open_table(METADATA).map_err(persist_err)?;
                let begin = bincode::serialize(&to.0).map_err(codec_err)?;
                metadata
                    .insert(BEGIN_KEY, begin.as_slice())
                    .map_err(persist_err)?;
            }
        }
        txn.commit().map_err(persist_err)?;

        self.end = self.end.max(action.position);
        if let Some(to) = truncate_to {
            self.begin = self.begin.max(to);
        }
        Ok(())
    }

    fn persist_metadata(&mut self, metadata: &Metadata) -> Result<(), StorageError> {
        let encoded = bincode::serialize(metadata).map_err(codec_err)?;
        let txn = self.db.begin_write().map_err(persist_err)?;
        {
            let mut table = txn.open_table(METADATA).map_err(persist_err)?;
            table
                .insert(METADATA_KEY, encoded.as_slice())
                .map_err(persist_err)?;
        }
        txn.commit().map_err(persist_err)?;
        Ok(())
    }

    fn read(&self, position: Position) -> Result<Action, StorageError> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let actions = txn.open_table(ACTIONS).map_err(backend_err)?;
        match actions.get(position.0).map_err(backend_err)? {
            Some(value) => bincode::deserialize(value.value()).map_err(codec_err),
            None if position < self.begin => Err(StorageError::Truncated(position)),
            None => Err(StorageError::NotFound(position)),
        }
    }
}

/// In-memory [`Storage`] for unit tests.
///
/// State is lost on drop, which is what crash-shaped tests want.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    metadata: Metadata,
    begin: Position,
    actions: BTreeMap<u64, Action>,
}

impl MemoryStorage {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn restore(&self) -> Result<State, StorageError> {
        let mut state = State {
            metadata: self.metadata.clone(),
            begin: self.begin,
            ..State::empty()
        };
        for (key, action) in &self.actions {
            if action.learned {
                state.learned.insert(*key);
            } else {
                state.unlearned.insert(*key);
            }
            state.end = state.end.max(Position(*key));
        }
        Ok(state)
    }

    fn persist(&mut self, action: &Action) -> Result<(), StorageError> {
        if let (Some(Op::Truncate { to }), true) = (&action.op, action.learned) {
            self.actions = self.actions.split_off(&to.0);
            self.begin = self.begin.max(*to);
        }
        self.actions.insert(action.position.0, action.clone());
        Ok(())
    }

    fn persist_metadata(&mut self, metadata: &Metadata) -> Result<(), StorageError> {
        self.metadata = metadata.clone();
        Ok(())
    }

    fn read(&self, position: Position) -> Result<Action, StorageError> {
        match self.actions.get(&position.0) {
            Some(action) => Ok(action.clone()),
            None if position < self.begin => Err(StorageError::Truncated(position)),
            None => Err(StorageError::NotFound(position)),
        }
    }
}

/// Proposal a freshly initialized store reports. Kept here so the
/// initialize tool and the tests agree on it.
pub(crate) const INITIAL_PROMISED: Proposal = Proposal::ZERO;
