//! Core types for the replicated log.
//!
//! This module defines the building blocks shared by every layer:
//!
//! - [`Position`]: an index into the replicated log
//! - [`Proposal`]: a Paxos proposal number, ordering rounds across the
//!   whole position space
//! - [`Action`]: the unit of durable state kept per position
//! - [`Op`]: what an action does (nothing, append bytes, truncate a prefix)
//! - [`Status`] / [`Metadata`]: the per-replica durable header
//! - error enums for storage, reads, and catch-up

use serde::{Deserialize, Serialize};

/// A position in the replicated log.
///
/// Positions are dense numerically, but any single replica may hold an
/// arbitrary subset of them (holes are filled during catch-up). Position 0
/// is reserved for the NOP written by the first successful election;
/// client actions start at position 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Position(pub u64);

impl Position {
    /// The lowest position (0), reserved for the election NOP.
    pub const ZERO: Self = Self(0);

    /// Create a new position.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The next sequential position.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// A stable serialization of this position.
    ///
    /// The identity survives transport through external systems that only
    /// handle opaque bytes; [`Position::from_identity`] recovers the
    /// numeric position. Big-endian so identities sort like positions.
    pub fn identity(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Recover a position from its [identity](Position::identity).
    ///
    /// Returns `None` if `bytes` is not an 8-byte identity.
    pub fn from_identity(bytes: &[u8]) -> Option<Self> {
        let fixed: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(fixed)))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "position({})", self.0)
    }
}

/// A Paxos proposal number.
///
/// Chosen by a coordinator to order rounds across the entire position
/// space. A replica never promises a proposal lower than one it has
/// already promised, which is the safety anchor of the whole protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Proposal(pub u64);

impl Proposal {
    /// The initial proposal number (0), meaning "none promised yet".
    pub const ZERO: Self = Self(0);

    /// Create a new proposal number.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The next proposal number.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proposal({})", self.0)
    }
}

/// What an [`Action`] does once learned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// No effect. Fills holes and closes position 0 on a fresh cluster.
    Nop,

    /// Append an opaque client payload to the log.
    Append {
        /// The client payload. The log never interprets it.
        bytes: Vec<u8>,
    },

    /// Mark every position below `to` as reclaimable.
    Truncate {
        /// The first position that survives the truncation.
        to: Position,
    },
}

/// The unit of durable state kept per position.
///
/// An action moves through three stages on a replica: promised only
/// (a per-position prepare was accepted, no value yet), performed
/// (a value was accepted under some proposal), and learned (a quorum
/// chose the value and this replica was told so).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// The position this action occupies.
    pub position: Position,

    /// The highest proposal promised at this position when the action
    /// was made durable.
    pub promised: Proposal,

    /// The proposal under which a value was accepted, if any.
    ///
    /// `None` means this record only witnesses a per-position promise.
    pub performed: Option<Proposal>,

    /// Whether a quorum has learned this position.
    pub learned: bool,

    /// The accepted operation. Present exactly when `performed` is.
    pub op: Option<Op>,
}

impl Action {
    /// The synthetic action returned for a hole in `[begin, end]`:
    /// an unlearned NOP that catch-up will eventually replace.
    pub fn hole(position: Position) -> Self {
        Self {
            position,
            promised: Proposal::ZERO,
            performed: None,
            learned: false,
            op: Some(Op::Nop),
        }
    }
}

/// Replica lifecycle status.
///
/// Only a `Voting` replica answers promise and write requests; the
/// other statuses keep a replica that is still bootstrapping from
/// contributing a stale view to a quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Fresh storage, never part of the cluster.
    Empty,

    /// Mid auto-initialization handshake: this replica has seen the
    /// full membership report `Empty` and announced itself.
    Starting,

    /// Full member: answers promise and write requests.
    Voting,

    /// Catching up on positions learned by the rest of the cluster.
    Recovering,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Empty => "empty",
            Status::Starting => "starting",
            Status::Voting => "voting",
            Status::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// The durable per-replica header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Lifecycle status; see [`Status`].
    pub status: Status,

    /// The highest proposal this replica has promised at the
    /// position-space level. Never decreases.
    pub promised: Proposal,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            status: Status::Empty,
            promised: Proposal::ZERO,
        }
    }
}

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store could not be opened or created.
    #[error("failed to open store: {0}")]
    Open(String),

    /// A durable write failed.
    #[error("failed to persist record: {0}")]
    Persist(String),

    /// A read from the backing store failed.
    #[error("failed to read record: {0}")]
    Backend(String),

    /// The position has no persisted action.
    #[error("{0} is not persisted")]
    NotFound(Position),

    /// The position lies below the truncation point.
    #[error("{0} lies in a truncated prefix")]
    Truncated(Position),

    /// A record could not be encoded or decoded.
    #[error("failed to decode record: {0}")]
    Codec(String),
}

/// Errors surfaced by range reads.
///
/// These are caller errors, never fatal to the replica. The messages
/// are part of the public contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// The range starts below the replica's first retained position.
    #[error("Bad read range (truncated position)")]
    TruncatedPosition,

    /// The range extends past the replica's highest position.
    #[error("Bad read range (past end of log)")]
    PastEnd,

    /// The replica has shut down and can no longer serve reads.
    #[error("replica unavailable")]
    Unavailable,
}

/// Errors surfaced by catch-up and recovery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatchupError {
    /// A peer reported a higher proposal while catching up under a
    /// caller-supplied proposal; the caller's round is stale.
    #[error("another proposer is active (saw {0})")]
    Conflict(Proposal),

    /// Confirmed-dead peers make the required quorum impossible.
    #[error("quorum is no longer reachable")]
    QuorumLost,

    /// The local replica shut down mid catch-up.
    #[error("local replica shut down")]
    ReplicaGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        let p0 = Position::ZERO;
        let p1 = Position::new(1);

        assert!(p0 < p1);
        assert_eq!(p0.next(), p1);
    }

    #[test]
    fn test_position_display() {
        assert_eq!(Position::new(42).to_string(), "position(42)");
    }

    #[test]
    fn test_position_identity_roundtrip() {
        let position = Position::new(0x0102_0304_0506_0708);
        let identity = position.identity();

        assert_eq!(identity, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Position::from_identity(&identity), Some(position));
    }

    #[test]
    fn test_position_identity_sorts_like_positions() {
        let small = Position::new(5).identity();
        let large = Position::new(1 << 40).identity();

        assert!(small < large);
    }

    #[test]
    fn test_position_identity_rejects_bad_length() {
        assert_eq!(Position::from_identity(b"short"), None);
        assert_eq!(Position::from_identity(&[0; 9]), None);
    }

    #[test]
    fn test_proposal_ordering() {
        let a = Proposal::ZERO;
        let b = Proposal::new(1);

        assert!(a < b);
        assert_eq!(a.next(), b);
        assert_eq!(Proposal::new(7).to_string(), "proposal(7)");
    }

    #[test]
    fn test_action_serde_roundtrip() {
        let action = Action {
            position: Position::new(5),
            promised: Proposal::new(3),
            performed: Some(Proposal::new(3)),
            learned: true,
            op: Some(Op::Append {
                bytes: b"hello world".to_vec(),
            }),
        };

        let json = serde_json::to_string(&action).expect("serialize");
        let decoded: Action = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(action, decoded);
    }

    #[test]
    fn test_truncate_op_serde_roundtrip() {
        let op = Op::Truncate {
            to: Position::new(7),
        };

        let json = serde_json::to_string(&op).expect("serialize");
        let decoded: Op = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(op, decoded);
    }

    #[test]
    fn test_hole_is_unlearned_nop() {
        let hole = Action::hole(Position::new(3));

        assert_eq!(hole.position, Position::new(3));
        assert!(!hole.learned);
        assert!(hole.performed.is_none());
        assert_eq!(hole.op, Some(Op::Nop));
    }

    #[test]
    fn test_metadata_default_is_empty() {
        let metadata = Metadata::default();

        assert_eq!(metadata.status, Status::Empty);
        assert_eq!(metadata.promised, Proposal::ZERO);
    }

    #[test]
    fn test_read_error_messages() {
        assert_eq!(
            ReadError::TruncatedPosition.to_string(),
            "Bad read range (truncated position)"
        );
        assert_eq!(
            ReadError::PastEnd.to_string(),
            "Bad read range (past end of log)"
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Voting.to_string(), "voting");
        assert_eq!(Status::Recovering.to_string(), "recovering");
    }
}
