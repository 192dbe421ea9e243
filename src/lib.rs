//! # replog: a replicated append-only log on per-position Paxos
//!
//! Clients write opaque byte entries; the cluster assigns each entry a
//! monotonically increasing position and guarantees that, once
//! acknowledged, the entry is durable and identical across a quorum of
//! replicas. Readers retrieve entries by position range, and a
//! truncate marks a prefix reclaimable.
//!
//! Agreement is reached one position at a time with classic Paxos,
//! ordered across the whole position space by a single proposal
//! number per coordinator (the shape described in
//! [Paxos Made Simple][paxos]): an elected coordinator owns a proposal
//! that every replica has promised, so steady-state appends are a
//! single accept round plus a learned broadcast.
//!
//! [paxos]: https://lamport.azurewebsites.net/pubs/paxos-simple.pdf
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Log (Writer / Reader)                 │
//! │        one writing session, range reads, entries          │
//! └──────────────┬──────────────────────────────┬─────────────┘
//!                │                              │ read
//!                ▼                              ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │        Coordinator        │   │      local Replica        │
//! │  elect / append / truncate│   │ acceptor + learner actor  │
//! └──────────────┬────────────┘   └────────────┬──────────────┘
//!                │ broadcast                   │ persist
//!                ▼                             ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │          Network          │   │          Storage          │
//! │ peer set, quorum watches  │   │ redb: action per position │
//! └──────────────┬────────────┘   └───────────────────────────┘
//!                │
//!                ▼
//!        peer Replicas (each with its own Storage)
//! ```
//!
//! A blank node joins by running [`recover`](recover::recover), which
//! closes every outstanding position by consensus before the node is
//! allowed to vote. Fixed deployments can skip that with
//! [`initialize`](initialize::initialize), which stamps a fresh store
//! as a voter before first start.
//!
//! ## Module map
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Positions, proposals, actions, statuses, error enums |
//! | [`protocol`] | The six wire messages and broadcast/quorum plumbing |
//! | [`storage`] | The durable per-position store and its in-memory twin |
//! | [`replica`] | The acceptor/learner actor and its handle |
//! | [`network`] | Peer membership, broadcast, size watches |
//! | [`coordinator`] | The elected proposer |
//! | [`recover`] | Catch-up rounds and the bootstrap handshake |
//! | [`log`] | The client-facing facade |
//! | [`initialize`] | Tool for pre-initializing a replica's store |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod coordinator;
pub mod initialize;
pub mod log;
pub mod network;
pub mod protocol;
pub mod recover;
pub mod replica;
pub mod storage;
pub mod types;

pub use coordinator::Coordinator;
pub use initialize::initialize;
pub use log::{Entry, Log, Reader, Writer};
pub use network::{Network, SizePredicate};
pub use recover::{catchup, recover, RecoverError};
pub use replica::{Pid, Replica};
pub use storage::{DiskStorage, MemoryStorage, State, Storage};
pub use types::{
    Action, CatchupError, Metadata, Op, Position, Proposal, ReadError, Status, StorageError,
};
