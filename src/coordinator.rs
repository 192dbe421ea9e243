//! The coordinator: elected proposer for the whole position space.
//!
//! A coordinator binds one local replica to a network of peers and
//! drives the write side of the log:
//!
//! ```text
//! elect()      broadcast Promise { k }  ->  quorum grants
//!              index = max end across the quorum
//!              fill every position <= index not learned locally
//! append(b)    broadcast Write { k, index + 1, Append(b) } -> quorum
//!              broadcast Learned, index += 1
//! truncate(t)  same, with Truncate(t)
//! ```
//!
//! Exactly one coordinator can make progress at a time: any reply
//! carrying a higher proposal demotes this one, and every later
//! operation returns `None` until the caller elects again. Benign
//! failures (lost leadership, unreachable quorum, cancellation) all
//! surface as `None`; `Some(position)` means a quorum durably accepted
//! the write and the position was announced as learned.
//!
//! A phase that times out retries with a bumped proposal. The election
//! retries once and then gives up to the caller; append and truncate
//! keep retrying until the caller drops the future, which is the
//! cancellation path: abandoned broadcasts settle into nothing, and
//! whatever peers already persisted stays for the next coordinator to
//! find.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::network::{Network, SizePredicate};
use crate::protocol::{collect_quorum, Phase, PromiseRequest, WriteRequest, WriteResponse};
use crate::recover::catchup;
use crate::replica::Replica;
use crate::types::{Action, CatchupError, Op, Position, Proposal};

/// Default deadline for one broadcast phase.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
enum State {
    Initial,
    Elected { proposal: Proposal, index: Position },
    Demoted,
}

enum Election {
    Elected(Position),
    Rejected(Proposal),
    NoQuorum,
    Dead,
}

/// A proposer over one local [`Replica`] and a [`Network`] of peers.
///
/// The local replica must be a member of the network: its end position
/// and promises take part in elections like any other voter's.
pub struct Coordinator {
    quorum: usize,
    replica: Replica,
    network: Network,
    timeout: Duration,
    state: State,
}

impl Coordinator {
    /// Create a coordinator. It starts unelected.
    pub fn new(quorum: usize, replica: Replica, network: Network) -> Self {
        Self {
            quorum,
            replica,
            network,
            timeout: DEFAULT_TIMEOUT,
            state: State::Initial,
        }
    }

    /// Replace the per-phase deadline. Tests shrink it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Try to become the elected proposer.
    ///
    /// Waits until the network holds at least a quorum of members, then
    /// runs a position-space prepare and fills every position the local
    /// replica has not learned. Returns the post-election end of the
    /// log, or `None` on a lost round; the caller may simply call
    /// again, since the losing round raised the local promise.
    pub async fn elect(&mut self) -> Option<Position> {
        self.network
            .watch(self.quorum, SizePredicate::GreaterThanOrEqualTo)
            .await;

        let promised = self.replica.promised().await?;
        let mut proposal = promised.next();
        let mut retried = false;
        loop {
            match self.run_election(proposal).await {
                Election::Elected(index) => {
                    info!(proposal = %proposal, index = %index, "elected");
                    self.state = State::Elected { proposal, index };
                    return Some(index);
                }
                Election::Rejected(higher) => {
                    debug!(
                        proposal = %proposal,
                        higher = %higher,
                        "election lost to a higher proposal"
                    );
                    return None;
                }
                Election::Dead => return None,
                Election::NoQuorum => {
                    if retried {
                        return None;
                    }
                    retried = true;
                    proposal = proposal.next();
                    debug!(proposal = %proposal, "election timed out, retrying once");
                }
            }
        }
    }

    async fn run_election(&mut self, proposal: Proposal) -> Election {
        let mut responses = self.network.broadcast(PromiseRequest {
            proposal,
            position: None,
        });
        let replies = match collect_quorum(&mut responses, self.quorum, self.timeout).await {
            Phase::Quorum(replies) => replies,
            Phase::Rejected(higher) => return Election::Rejected(higher),
            Phase::NoQuorum => return Election::NoQuorum,
            Phase::Dead => return Election::Dead,
        };

        // The highest end any voter reported is the log's horizon.
        let index = replies
            .iter()
            .filter_map(|reply| reply.position)
            .max()
            .unwrap_or(Position::ZERO);

        // Close everything this replica has not learned, holes
        // included. On a fresh cluster that is exactly position 0,
        // which the fill closes with the election NOP.
        let missing = match self.replica.missing(index).await {
            Some(missing) => missing,
            None => return Election::Dead,
        };
        if !missing.is_empty() {
            debug!(
                proposal = %proposal,
                count = missing.len(),
                "filling positions left open below the horizon"
            );
        }
        match catchup(
            self.quorum,
            &self.replica,
            &self.network,
            Some(proposal),
            missing,
            self.timeout,
        )
        .await
        {
            Ok(()) => Election::Elected(index),
            Err(CatchupError::Conflict(higher)) => Election::Rejected(higher),
            Err(CatchupError::QuorumLost) => Election::NoQuorum,
            Err(CatchupError::ReplicaGone) => Election::Dead,
        }
    }

    /// Append opaque bytes to the log.
    ///
    /// Returns the position the entry was chosen at, or `None` if this
    /// coordinator is not (or no longer) elected or the quorum is
    /// unreachable.
    pub async fn append(&mut self, bytes: Vec<u8>) -> Option<Position> {
        self.perform(Op::Append { bytes }).await
    }

    /// Mark every position below `to` as reclaimable.
    ///
    /// The truncate itself occupies the next position, which is what
    /// the call returns.
    pub async fn truncate(&mut self, to: Position) -> Option<Position> {
        self.perform(Op::Truncate { to }).await
    }

    async fn perform(&mut self, op: Op) -> Option<Position> {
        let (mut proposal, index) = match self.state {
            State::Elected { proposal, index } => (proposal, index),
            State::Initial | State::Demoted => return None,
        };
        let position = index.next();

        loop {
            let mut responses = self.network.broadcast(WriteRequest {
                proposal,
                position,
                op: op.clone(),
            });
            match collect_quorum::<WriteResponse>(&mut responses, self.quorum, self.timeout).await {
                Phase::Quorum(_) => {
                    let action = Action {
                        position,
                        promised: proposal,
                        performed: Some(proposal),
                        learned: true,
                        op: Some(op),
                    };
                    self.network.learned(action);
                    self.state = State::Elected { proposal, index: position };
                    debug!(proposal = %proposal, position = %position, "write chosen");
                    return Some(position);
                }
                Phase::Rejected(higher) => {
                    warn!(
                        proposal = %proposal,
                        higher = %higher,
                        position = %position,
                        "demoted by a higher proposal"
                    );
                    self.state = State::Demoted;
                    return None;
                }
                Phase::Dead => return None,
                Phase::NoQuorum => {
                    proposal = proposal.next();
                    debug!(
                        position = %position,
                        proposal = %proposal,
                        "write timed out, retrying with bumped proposal"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use crate::types::{Metadata, Status};

    fn voting_replica() -> Replica {
        let mut storage = MemoryStorage::new();
        storage
            .persist_metadata(&Metadata {
                status: Status::Voting,
                promised: Proposal::ZERO,
            })
            .expect("persist metadata");
        Replica::with_storage(storage).expect("spawn replica")
    }

    #[tokio::test]
    async fn test_append_before_elect_returns_none() {
        let replica = voting_replica();
        let network = Network::new([replica.pid()]);
        let mut coordinator = Coordinator::new(1, replica, network);

        assert_eq!(coordinator.append(b"too early".to_vec()).await, None);
    }

    #[tokio::test]
    async fn test_single_replica_quorum_of_one() {
        let replica = voting_replica();
        let network = Network::new([replica.pid()]);
        let mut coordinator = Coordinator::new(1, replica.clone(), network);

        assert_eq!(coordinator.elect().await, Some(Position::ZERO));
        assert_eq!(
            coordinator.append(b"hello".to_vec()).await,
            Some(Position::new(1))
        );

        let actions = replica
            .read(Position::new(1), Position::new(1))
            .await
            .expect("read");
        assert!(actions[0].learned);
        assert_eq!(
            actions[0].op,
            Some(Op::Append {
                bytes: b"hello".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_election_nop_written_once() {
        let replica = voting_replica();
        let network = Network::new([replica.pid()]);
        let mut coordinator = Coordinator::new(1, replica.clone(), network.clone());

        assert_eq!(coordinator.elect().await, Some(Position::ZERO));
        let actions = replica
            .read(Position::ZERO, Position::ZERO)
            .await
            .expect("read");
        assert!(actions[0].learned);
        assert_eq!(actions[0].op, Some(Op::Nop));

        // A second election finds position 0 already learned and does
        // not reopen it.
        let mut second = Coordinator::new(1, replica.clone(), network);
        assert_eq!(second.elect().await, Some(Position::ZERO));
        let actions = replica
            .read(Position::ZERO, Position::ZERO)
            .await
            .expect("read");
        assert!(actions[0].learned);
        assert_eq!(actions[0].op, Some(Op::Nop));
    }
}
