//! Catch-up and recovery: turning a blank replica into a voter.
//!
//! ## Catch-up
//!
//! [`catchup`] closes a set of positions by running a full Paxos round
//! per position against the network:
//!
//! ```text
//! for each position p:
//!   broadcast Promise { proposal, position: p }    (phase 1)
//!   quorum grants -> adopt the highest performed value, else NOP
//!   broadcast Write { proposal, p, adopted }       (phase 2)
//!   quorum accepts -> broadcast Learned, apply locally
//! ```
//!
//! A round that times out or loses to a higher proposal bumps the
//! proposal past everything seen and retries, so a single stuck peer
//! cannot deadlock catch-up once a fresh quorum of promises lands.
//! When the caller supplies the proposal (an elected coordinator
//! filling holes) the bump is not ours to make: the round aborts with
//! [`CatchupError::Conflict`] instead.
//!
//! ## Recovery
//!
//! [`recover`] polls the cluster with `RecoverRequest`s until it sees a
//! quorum of voting peers, then transitions the local replica to
//! `Recovering`, catches up every position in `[1, end]`, and finally
//! marks it `Voting`.
//!
//! With `auto_initialize`, a cluster with no voting members can
//! bootstrap itself: once the *full* membership reports `Empty` the
//! replica announces `Starting`, and once the full membership has
//! announced, it commits to `Voting`. The intermediate status keeps a
//! partial bootstrap from ever forming a quorum of accidental voters.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::network::Network;
use crate::protocol::{
    collect_quorum, Event, Phase, PromiseRequest, RecoverRequest, RecoverResponse, WriteRequest,
};
use crate::replica::Replica;
use crate::types::{Action, CatchupError, Op, Position, Proposal, Status};

/// Default cadence for recovery polls and catch-up rounds.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// How one fill round failed.
pub(crate) enum FillError {
    /// A peer promised a higher proposal.
    Rejected(Proposal),

    /// The round timed out short of a quorum.
    NoQuorum,

    /// Confirmed-dead peers make a quorum impossible.
    Dead,
}

/// Run one Paxos round at `position` under `proposal`: learn the value
/// the cluster may already have chosen there, or force a NOP.
///
/// On success the chosen action has been accepted by a quorum and
/// broadcast as learned; the caller gets a copy to apply locally.
pub(crate) async fn fill(
    network: &Network,
    quorum: usize,
    proposal: Proposal,
    position: Position,
    limit: Duration,
) -> Result<Action, FillError> {
    // Phase 1: prepare the position and collect prior accepts.
    let mut responses = network.broadcast(PromiseRequest {
        proposal,
        position: Some(position),
    });
    let replies = match collect_quorum(&mut responses, quorum, limit).await {
        Phase::Quorum(replies) => replies,
        Phase::Rejected(higher) => return Err(FillError::Rejected(higher)),
        Phase::NoQuorum => return Err(FillError::NoQuorum),
        Phase::Dead => return Err(FillError::Dead),
    };

    // Adopt the accepted value with the highest performed proposal. A
    // reply carrying an already-learned action short-circuits the
    // round: that value is chosen, it only needs re-announcing.
    let mut adopted: Option<Action> = None;
    for reply in &replies {
        let Some(action) = &reply.action else { continue };
        if action.learned {
            network.learned(action.clone());
            debug!(position = %position, "fill found a learned value");
            return Ok(action.clone());
        }
        if action.performed.is_none() {
            // A bare per-position promise carries no value.
            continue;
        }
        match &adopted {
            Some(best) if best.performed >= action.performed => {}
            _ => adopted = Some(action.clone()),
        }
    }
    let op = adopted.and_then(|action| action.op).unwrap_or(Op::Nop);

    // Phase 2: drive the adopted value to a quorum.
    let mut responses = network.broadcast(WriteRequest {
        proposal,
        position,
        op: op.clone(),
    });
    match collect_quorum(&mut responses, quorum, limit).await {
        Phase::Quorum(_) => {
            let action = Action {
                position,
                promised: proposal,
                performed: Some(proposal),
                learned: true,
                op: Some(op),
            };
            network.learned(action.clone());
            debug!(position = %position, proposal = %proposal, "filled position");
            Ok(action)
        }
        Phase::Rejected(higher) => Err(FillError::Rejected(higher)),
        Phase::NoQuorum => Err(FillError::NoQuorum),
        Phase::Dead => Err(FillError::Dead),
    }
}

/// Close every position in `positions` by consensus and apply the
/// chosen values to `replica`.
///
/// With `proposal: None` the catch-up owns its proposal: it starts just
/// above the replica's promise and bumps past any competitor, retrying
/// each failed round after `timeout`. With `proposal: Some(_)` the
/// round belongs to an elected coordinator and any conflict aborts.
pub async fn catchup(
    quorum: usize,
    replica: &Replica,
    network: &Network,
    proposal: Option<Proposal>,
    positions: impl IntoIterator<Item = Position>,
    timeout: Duration,
) -> Result<(), CatchupError> {
    let supplied = proposal.is_some();
    let mut proposal = match proposal {
        Some(proposal) => proposal,
        None => match replica.promised().await {
            Some(promised) => promised.next(),
            None => return Err(CatchupError::ReplicaGone),
        },
    };

    for position in positions {
        loop {
            match fill(network, quorum, proposal, position, timeout).await {
                Ok(action) => {
                    // The learned broadcast already went to every
                    // member; delivering directly as well means the
                    // local replica need not be one.
                    replica.learned(action);
                    break;
                }
                Err(FillError::Rejected(higher)) => {
                    if supplied {
                        return Err(CatchupError::Conflict(higher));
                    }
                    let bumped = higher.next().max(proposal.next());
                    debug!(
                        position = %position,
                        proposal = %proposal,
                        bumped = %bumped,
                        "catch-up round lost, bumping proposal"
                    );
                    proposal = bumped;
                }
                Err(FillError::NoQuorum) => {
                    if supplied {
                        return Err(CatchupError::QuorumLost);
                    }
                    proposal = proposal.next();
                    warn!(
                        position = %position,
                        proposal = %proposal,
                        "catch-up round timed out, retrying with bumped proposal"
                    );
                }
                Err(FillError::Dead) => return Err(CatchupError::QuorumLost),
            }
        }
    }
    Ok(())
}

/// Errors surfaced by [`recover`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoverError {
    /// The local replica shut down mid-recovery.
    #[error("local replica shut down during recovery")]
    ReplicaGone,

    /// Confirmed-dead peers make the required quorum impossible.
    #[error("quorum lost during recovery: {0}")]
    QuorumLost(CatchupError),
}

/// Promote `replica` to a voting member.
///
/// Polls the cluster every [`DEFAULT_INTERVAL`] until it can either
/// catch up from a quorum of voting peers or, with `auto_initialize`,
/// bootstrap a wholly empty cluster. Returns the same replica once it
/// is voting.
pub async fn recover(
    quorum: usize,
    replica: Replica,
    network: &Network,
    auto_initialize: bool,
) -> Result<Replica, RecoverError> {
    recover_with_interval(quorum, replica, network, auto_initialize, DEFAULT_INTERVAL).await
}

/// [`recover`] with an explicit poll interval. Tests shrink it.
pub async fn recover_with_interval(
    quorum: usize,
    replica: Replica,
    network: &Network,
    auto_initialize: bool,
    interval: Duration,
) -> Result<Replica, RecoverError> {
    loop {
        let status = match replica.status().await {
            Some(status) => status,
            None => return Err(RecoverError::ReplicaGone),
        };
        if status == Status::Voting {
            return Ok(replica);
        }

        // Poll everyone for their view, for at most one interval.
        let mut responses = network.broadcast(RecoverRequest);
        let total = responses.total();
        let mut replies: Vec<RecoverResponse> = Vec::new();
        let _ = tokio::time::timeout(interval, async {
            while let Some(event) = responses.next().await {
                if let Event::Reply(reply) = event {
                    replies.push(reply);
                }
            }
        })
        .await;

        let voting: Vec<&RecoverResponse> = replies
            .iter()
            .filter(|reply| reply.status == Status::Voting)
            .collect();

        if voting.len() >= quorum {
            let end = voting
                .iter()
                .map(|reply| reply.end)
                .max()
                .unwrap_or(Position::ZERO);
            info!(end = %end, voters = voting.len(), "catching up from voting quorum");
            return promote(quorum, replica, network, end, interval).await;
        }

        if auto_initialize && total > 0 && replies.len() == total {
            let all_announced = replies
                .iter()
                .all(|reply| matches!(reply.status, Status::Starting | Status::Voting));
            let all_blank = replies
                .iter()
                .all(|reply| matches!(reply.status, Status::Empty | Status::Starting));

            if status == Status::Starting && all_announced {
                // The whole membership has announced; commit.
                if !replica.set_status(Status::Voting).await {
                    return Err(RecoverError::ReplicaGone);
                }
                info!("auto-initialization complete, replica voting");
                return Ok(replica);
            }
            if status == Status::Empty && all_blank {
                // No voters exist anywhere; announce and re-poll.
                if !replica.set_status(Status::Starting).await {
                    return Err(RecoverError::ReplicaGone);
                }
                debug!("auto-initialization announced");
                continue;
            }
        }

        debug!(
            replies = replies.len(),
            members = total,
            voters = voting.len(),
            "recovery poll inconclusive, retrying"
        );
        tokio::time::sleep(interval).await;
    }
}

/// Catch up `[1, end]` and flip the replica to voting.
async fn promote(
    quorum: usize,
    replica: Replica,
    network: &Network,
    end: Position,
    interval: Duration,
) -> Result<Replica, RecoverError> {
    if !replica.set_status(Status::Recovering).await {
        return Err(RecoverError::ReplicaGone);
    }

    let positions = (1..=end.0).map(Position::new);
    match catchup(quorum, &replica, network, None, positions, interval).await {
        Ok(()) => {}
        Err(CatchupError::ReplicaGone) => return Err(RecoverError::ReplicaGone),
        Err(e) => return Err(RecoverError::QuorumLost(e)),
    }

    if !replica.set_status(Status::Voting).await {
        return Err(RecoverError::ReplicaGone);
    }
    info!(end = %end, "replica caught up and voting");
    Ok(replica)
}
