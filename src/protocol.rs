//! Wire messages and RPC plumbing.
//!
//! Six message types make up the replica protocol. The structs are the
//! schema contract: they are serde types whose fields are only ever
//! appended, never renamed or reordered in meaning.
//!
//! | Request | Response | Purpose |
//! |---|---|---|
//! | [`PromiseRequest`] | [`PromiseResponse`] | Phase 1: position-space or per-position prepare |
//! | [`WriteRequest`] | [`WriteResponse`] | Phase 2: accept a value at a position |
//! | [`LearnedMessage`] | (none) | Tell a replica a position was chosen |
//! | [`RecoverRequest`] | [`RecoverResponse`] | Ask a replica for its status and range |
//!
//! ## Silence as an answer
//!
//! A replica that cannot or will not answer simply does not reply: a
//! non-voting replica mutes promise and write requests, and a replica
//! that hit a fatal storage error stops replying entirely. [`call`]
//! therefore distinguishes only two terminal outcomes: a reply, or a
//! confirmed-dead peer whose mailbox is gone. A live-but-silent peer
//! keeps the caller pending, and quorum logic treats that exactly like
//! a lost datagram.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::replica::{Message, Pid};
use crate::types::{Action, Op, Position, Proposal, Status};

/// Phase 1 request.
///
/// With `position: None` this is a position-space prepare (an election
/// round); with `position: Some(p)` it prepares a single position for a
/// fill round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseRequest {
    /// The proposer's proposal number.
    pub proposal: Proposal,

    /// The position to prepare, or `None` for the whole position space.
    pub position: Option<Position>,
}

/// Phase 1 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseResponse {
    /// Whether the promise was granted.
    pub okay: bool,

    /// On success, the granted proposal; on rejection, the higher
    /// proposal already promised.
    pub proposal: Proposal,

    /// For a granted position-space prepare: this replica's end.
    pub position: Option<Position>,

    /// For a granted per-position prepare: the previously persisted
    /// action at that position, if any.
    pub action: Option<Action>,
}

/// Phase 2 request: accept `op` at `position` under `proposal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// The proposer's proposal number.
    pub proposal: Proposal,

    /// The position being written.
    pub position: Position,

    /// The operation to accept.
    pub op: Op,
}

/// Phase 2 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Whether the write was accepted.
    pub okay: bool,

    /// On success, the write's proposal; on rejection, the higher
    /// proposal already promised.
    pub proposal: Proposal,

    /// The position the request named.
    pub position: Position,
}

/// Broadcast notification that a position's value was chosen.
///
/// Fire-and-forget: learned messages may be lost or reordered, and
/// catch-up restores consistency when they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedMessage {
    /// The chosen action, with `learned` set.
    pub action: Action,
}

/// Ask a replica for its recovery view. Answered in every status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverRequest;

/// A replica's recovery view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverResponse {
    /// The replica's lifecycle status.
    pub status: Status,

    /// Lowest retained position.
    pub begin: Position,

    /// Highest persisted position.
    pub end: Position,
}

/// A request type that can be dispatched into a replica mailbox.
///
/// This is the seam [`crate::network::Network::broadcast`] fans out
/// over: each request type knows its response type and how to wrap
/// itself, together with a reply channel, into a mailbox [`Message`].
pub trait Request: Clone + Send + 'static {
    /// The reply carried back on the response channel.
    type Response: Send + 'static;

    /// Wrap this request and its reply channel into a mailbox message.
    fn into_message(self, reply: oneshot::Sender<Self::Response>) -> Message;
}

impl Request for PromiseRequest {
    type Response = PromiseResponse;

    fn into_message(self, reply: oneshot::Sender<Self::Response>) -> Message {
        Message::Promise {
            request: self,
            reply,
        }
    }
}

impl Request for WriteRequest {
    type Response = WriteResponse;

    fn into_message(self, reply: oneshot::Sender<Self::Response>) -> Message {
        Message::Write {
            request: self,
            reply,
        }
    }
}

impl Request for RecoverRequest {
    type Response = RecoverResponse;

    fn into_message(self, reply: oneshot::Sender<Self::Response>) -> Message {
        Message::Recover { reply }
    }
}

/// A response that participates in quorum counting.
pub trait ProtocolResponse {
    /// Whether the replica granted the request.
    fn okay(&self) -> bool;

    /// The proposal the replica answered with. On rejection this is the
    /// higher proposal it has already promised.
    fn proposal(&self) -> Proposal;
}

impl ProtocolResponse for PromiseResponse {
    fn okay(&self) -> bool {
        self.okay
    }

    fn proposal(&self) -> Proposal {
        self.proposal
    }
}

impl ProtocolResponse for WriteResponse {
    fn okay(&self) -> bool {
        self.okay
    }

    fn proposal(&self) -> Proposal {
        self.proposal
    }
}

/// Terminal outcomes of a single-peer RPC.
#[derive(Debug)]
pub enum Outcome<R> {
    /// The replica answered.
    Reply(R),

    /// The replica's mailbox is gone: it shut down or never existed.
    Unreachable,
}

/// Send `request` to one replica and wait for its answer.
///
/// Resolves to [`Outcome::Unreachable`] only when the peer's mailbox or
/// reply slot is dropped; a peer that stays silent keeps the future
/// pending, which is indistinguishable from network loss by design.
pub async fn call<R: Request>(pid: &Pid, request: R) -> Outcome<R::Response> {
    let (tx, rx) = oneshot::channel();
    if pid.send(request.into_message(tx)).is_err() {
        return Outcome::Unreachable;
    }
    match rx.await {
        Ok(response) => Outcome::Reply(response),
        Err(_) => Outcome::Unreachable,
    }
}

/// One settled slot of a broadcast.
#[derive(Debug)]
pub enum Event<T> {
    /// A member answered.
    Reply(T),

    /// A member's mailbox is gone; it will never answer.
    Unreachable,
}

/// Replies to one broadcast, in arrival order.
///
/// Created by [`crate::network::Network::broadcast`]. A member that
/// stays silent never settles its slot, so [`Responses::next`] pends
/// until callers give up via their own deadline.
pub struct Responses<T> {
    rx: mpsc::UnboundedReceiver<Event<T>>,
    total: usize,
    seen: usize,
}

impl<T> Responses<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Event<T>>, total: usize) -> Self {
        Self { rx, total, seen: 0 }
    }

    /// How many members the request went to.
    pub fn total(&self) -> usize {
        self.total
    }

    /// The next settled slot, or `None` once every member is accounted
    /// for.
    pub async fn next(&mut self) -> Option<Event<T>> {
        if self.seen == self.total {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                self.seen += 1;
                Some(event)
            }
            None => None,
        }
    }
}

/// How one broadcast phase ended.
pub(crate) enum Phase<T> {
    /// A quorum of granted replies, in arrival order.
    Quorum(Vec<T>),

    /// A member answered with a higher proposal; the round is stale.
    Rejected(Proposal),

    /// The deadline passed without a quorum.
    NoQuorum,

    /// Enough members are confirmed dead that a quorum is impossible.
    Dead,
}

/// Drive one broadcast phase: count granted replies toward `quorum`,
/// stop at the first rejection, fail fast when confirmed-dead members
/// make the quorum impossible, and give up at `limit`.
pub(crate) async fn collect_quorum<T: ProtocolResponse>(
    responses: &mut Responses<T>,
    quorum: usize,
    limit: Duration,
) -> Phase<T> {
    let total = responses.total();
    if total < quorum {
        return Phase::Dead;
    }

    let gathered = tokio::time::timeout(limit, async {
        let mut okays = Vec::new();
        let mut missing = 0usize;
        loop {
            match responses.next().await {
                Some(Event::Reply(reply)) if reply.okay() => {
                    okays.push(reply);
                    if okays.len() >= quorum {
                        return Phase::Quorum(okays);
                    }
                }
                Some(Event::Reply(reply)) => return Phase::Rejected(reply.proposal()),
                Some(Event::Unreachable) => {
                    missing += 1;
                    if total - missing < quorum {
                        return Phase::Dead;
                    }
                }
                // Every member accounted for and still no quorum.
                None => return Phase::Dead,
            }
        }
    })
    .await;

    match gathered {
        Ok(phase) => phase,
        Err(_) => Phase::NoQuorum,
    }
}
