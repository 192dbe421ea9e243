//! The log facade: what clients actually hold.
//!
//! A [`Log`] owns one local replica plus the network view of its
//! peers. A [`Writer`] wraps a coordinator for one writing session
//! (start, then append/truncate); a [`Reader`] serves range reads from
//! the local replica and projects them down to client entries.
//!
//! ```text
//! Client                Writer                    cluster
//!   │  start()            │  elect()                │
//!   │────────────────────>│────────────────────────>│
//!   │  append(bytes)      │  write + learn          │
//!   │────────────────────>│────────────────────────>│
//!   │<─ Some(position) ───│                         │
//!   │
//!   │  read(from, to)   Reader ── local replica only
//! ```
//!
//! Reads surface only learned APPEND entries: NOPs, truncates, and the
//! unlearned NOPs synthesized for holes are protocol furniture, not
//! client data.

use std::path::Path;

use crate::coordinator::Coordinator;
use crate::network::Network;
use crate::replica::{Pid, Replica};
use crate::types::{Op, Position, ReadError, StorageError};

/// A handle on one replicated log member: a local replica and the
/// peers it coordinates with.
pub struct Log {
    quorum: usize,
    replica: Replica,
    network: Network,
}

impl Log {
    /// Open the local replica at `path` and join it to `peers`.
    ///
    /// The local replica is always part of the resulting network.
    pub fn open(
        quorum: usize,
        path: impl AsRef<Path>,
        peers: impl IntoIterator<Item = Pid>,
    ) -> Result<Self, StorageError> {
        let replica = Replica::open(path)?;
        let network = Network::new(peers);
        network.add(replica.pid());
        Ok(Self {
            quorum,
            replica,
            network,
        })
    }

    /// The local replica.
    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// The peer view, local replica included.
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Recover the numeric position behind an opaque
    /// [identity](Position::identity).
    pub fn position(&self, identity: &[u8]) -> Option<Position> {
        Position::from_identity(identity)
    }
}

/// One entry as clients see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Where the entry lives in the log.
    pub position: Position,

    /// The appended payload.
    pub data: Vec<u8>,
}

/// A writing session over a log.
///
/// One writer drives one coordinator. After any operation returns
/// `None` the session may have lost leadership; call
/// [`Writer::start`] again to re-elect before continuing.
pub struct Writer {
    coordinator: Coordinator,
}

impl Writer {
    /// Create a writer for `log`. No election happens yet.
    pub fn new(log: &Log) -> Self {
        Self {
            coordinator: Coordinator::new(log.quorum, log.replica.clone(), log.network.clone()),
        }
    }

    /// Elect this writer's coordinator.
    ///
    /// Returns the current end of the log, or `None` if the round was
    /// lost (call again to retry with a raised proposal).
    pub async fn start(&mut self) -> Option<Position> {
        self.coordinator.elect().await
    }

    /// Append `data`; returns its position once chosen by a quorum.
    pub async fn append(&mut self, data: &[u8]) -> Option<Position> {
        self.coordinator.append(data.to_vec()).await
    }

    /// Truncate the log below `to`; returns the position the truncate
    /// itself occupies.
    pub async fn truncate(&mut self, to: Position) -> Option<Position> {
        self.coordinator.truncate(to).await
    }
}

/// A reading session over a log's local replica.
pub struct Reader {
    replica: Replica,
}

impl Reader {
    /// Create a reader for `log`.
    pub fn new(log: &Log) -> Self {
        Self {
            replica: log.replica.clone(),
        }
    }

    /// Read the learned APPEND entries in `[from, to]`.
    ///
    /// Fails with the replica's range errors; positions holding NOPs,
    /// truncates, or nothing yet are silently skipped.
    pub async fn read(&self, from: Position, to: Position) -> Result<Vec<Entry>, ReadError> {
        let actions = self.replica.read(from, to).await?;
        Ok(actions
            .into_iter()
            .filter(|action| action.learned)
            .filter_map(|action| match action.op {
                Some(Op::Append { bytes }) => Some(Entry {
                    position: action.position,
                    data: bytes,
                }),
                _ => None,
            })
            .collect())
    }
}
