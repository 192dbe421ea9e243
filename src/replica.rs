//! The replica: acceptor and learner over the position space.
//!
//! A replica is an actor with a single mailbox. It processes one
//! message to completion before the next, and every reply it sends is
//! backed by an fsync-durable persist. The [`Replica`] handle is a
//! cheap clone over the mailbox sender; [`Pid`] is the address other
//! components use to reach it.
//!
//! ## Request handling
//!
//! ```text
//! Promise(proposal)            position-space prepare: gate on
//!                              metadata.promised, reply with end
//! Promise(proposal, position)  per-position prepare: gate on the
//!                              action's promised, reply with the
//!                              previously accepted action
//! Write(proposal, position)    accept a value if the proposal is
//!                              current, persist it unlearned
//! Learned(action)              persist the chosen value; a truncate
//!                              discards the prefix below `to`
//! Recover()                    report status plus [begin, end]
//! Read(from, to)               range read, synthesizing an unlearned
//!                              NOP for each hole
//! ```
//!
//! ## The non-voting gate
//!
//! A replica whose status is not `Voting` never answers promise or
//! write requests: the reply slot is parked and the caller stays
//! pending. A replica still catching up must not contribute a stale
//! view to a quorum, and silence is how quorum logic already treats
//! unreachable peers. Recover requests are answered in every status.
//!
//! ## Failure
//!
//! A storage error is fatal: the replica logs it, stops processing,
//! and drops its mailbox. Peers observe exactly what they would
//! observe for a crashed process, namely no replies.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::protocol::{
    self, LearnedMessage, Outcome, PromiseRequest, PromiseResponse, RecoverResponse, WriteRequest,
    WriteResponse,
};
use crate::storage::{DiskStorage, Storage};
use crate::types::{
    Action, Metadata, Op, Position, Proposal, ReadError, Status, StorageError,
};

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// The address of a replica: a handle on its mailbox.
///
/// Pids compare and hash by identity, so a network's peer set treats
/// two handles on the same replica as one member.
#[derive(Debug, Clone)]
pub struct Pid {
    id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

impl Pid {
    fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            sender,
        }
    }

    /// The unique identity of the replica behind this address.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver a message to the replica's mailbox.
    ///
    /// Fails only when the replica has shut down.
    pub(crate) fn send(&self, message: Message) -> Result<(), Box<Message>> {
        self.sender.send(message).map_err(|e| Box::new(e.0))
    }
}

impl PartialEq for Pid {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Pid {}

impl std::hash::Hash for Pid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "replica({})", self.id)
    }
}

/// A message in a replica's mailbox.
///
/// Built by [`crate::protocol::Request::into_message`] for the wire
/// requests; the remaining variants serve the local handle.
#[derive(Debug)]
pub enum Message {
    /// A phase 1 prepare, position-space or per-position.
    Promise {
        /// The request.
        request: PromiseRequest,
        /// Where the response goes. Parked while not voting.
        reply: oneshot::Sender<PromiseResponse>,
    },

    /// A phase 2 accept.
    Write {
        /// The request.
        request: WriteRequest,
        /// Where the response goes. Parked while not voting.
        reply: oneshot::Sender<WriteResponse>,
    },

    /// Notification that a position's value was chosen.
    Learned {
        /// The notification.
        message: LearnedMessage,
    },

    /// Status and range query, answered in every status.
    Recover {
        /// Where the response goes.
        reply: oneshot::Sender<RecoverResponse>,
    },

    /// Range read.
    Read {
        /// First position, inclusive.
        from: Position,
        /// Last position, inclusive.
        to: Position,
        /// Where the result goes.
        reply: oneshot::Sender<Result<Vec<Action>, ReadError>>,
    },

    /// Positions up to `to` that are not learned locally.
    Missing {
        /// Last position to consider, inclusive.
        to: Position,
        /// Where the result goes.
        reply: oneshot::Sender<Vec<Position>>,
    },

    /// Lifecycle status query.
    Status {
        /// Where the result goes.
        reply: oneshot::Sender<Status>,
    },

    /// Position-space promised proposal query.
    Promised {
        /// Where the result goes.
        reply: oneshot::Sender<Proposal>,
    },

    /// Lowest retained position query.
    Beginning {
        /// Where the result goes.
        reply: oneshot::Sender<Position>,
    },

    /// Highest persisted position query.
    Ending {
        /// Where the result goes.
        reply: oneshot::Sender<Position>,
    },

    /// Durably change the lifecycle status.
    SetStatus {
        /// The new status.
        status: Status,
        /// Acknowledged once the change is durable.
        reply: oneshot::Sender<()>,
    },

    /// Stop the replica. Acknowledged after storage is released.
    Shutdown {
        /// Acknowledged once the mailbox is closed.
        reply: oneshot::Sender<()>,
    },
}

/// A cloneable handle on a running replica.
#[derive(Debug, Clone)]
pub struct Replica {
    pid: Pid,
}

impl Replica {
    /// Open (or create) the durable store at `path` and start the
    /// replica actor over it.
    ///
    /// Must be called from within a tokio runtime; the actor lives on
    /// it until [`Replica::shutdown`] or the runtime stops.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_storage(DiskStorage::open(path)?)
    }

    /// Start a replica over an already-open storage backend.
    ///
    /// Mostly useful with [`crate::storage::MemoryStorage`] in tests.
    pub fn with_storage<S: Storage + Send + 'static>(storage: S) -> Result<Self, StorageError> {
        let state = storage.restore()?;
        let (sender, mailbox) = mpsc::unbounded_channel();
        let pid = Pid::new(sender);
        let process = ReplicaProcess {
            id: pid.id(),
            storage,
            metadata: state.metadata,
            begin: state.begin,
            end: state.end,
            learned: state.learned,
            unlearned: state.unlearned,
            muted: Vec::new(),
        };
        tokio::spawn(run(process, mailbox));
        Ok(Self { pid })
    }

    /// The replica's address.
    pub fn pid(&self) -> Pid {
        self.pid.clone()
    }

    /// Send a prepare and wait for the answer.
    ///
    /// Stays pending forever if the replica mutes the request (not
    /// voting) or is gone; see the module docs.
    pub async fn promise(&self, request: PromiseRequest) -> PromiseResponse {
        match protocol::call(&self.pid, request).await {
            Outcome::Reply(response) => response,
            Outcome::Unreachable => std::future::pending().await,
        }
    }

    /// Send a write and wait for the answer.
    ///
    /// Pending semantics match [`Replica::promise`].
    pub async fn write(&self, request: WriteRequest) -> WriteResponse {
        match protocol::call(&self.pid, request).await {
            Outcome::Reply(response) => response,
            Outcome::Unreachable => std::future::pending().await,
        }
    }

    /// Tell the replica a position's value was chosen. Fire-and-forget.
    pub fn learned(&self, action: Action) {
        let _ = self.pid.send(Message::Learned {
            message: LearnedMessage { action },
        });
    }

    /// Ask for the replica's recovery view.
    ///
    /// `None` if the replica has shut down.
    pub async fn recover(&self) -> Option<RecoverResponse> {
        match protocol::call(&self.pid, crate::protocol::RecoverRequest).await {
            Outcome::Reply(response) => Some(response),
            Outcome::Unreachable => None,
        }
    }

    /// Read the actions in `[from, to]`, synthesizing an unlearned NOP
    /// for every hole.
    pub async fn read(&self, from: Position, to: Position) -> Result<Vec<Action>, ReadError> {
        let (tx, rx) = oneshot::channel();
        if self.pid.send(Message::Read { from, to, reply: tx }).is_err() {
            return Err(ReadError::Unavailable);
        }
        rx.await.unwrap_or(Err(ReadError::Unavailable))
    }

    /// Positions `<= to` (and `>=` the replica's beginning) that the
    /// replica has not learned. `None` if it has shut down.
    pub async fn missing(&self, to: Position) -> Option<Vec<Position>> {
        self.query(|reply| Message::Missing { to, reply }).await
    }

    /// The replica's lifecycle status. `None` if it has shut down.
    pub async fn status(&self) -> Option<Status> {
        self.query(|reply| Message::Status { reply }).await
    }

    /// The position-space promised proposal. `None` if shut down.
    pub async fn promised(&self) -> Option<Proposal> {
        self.query(|reply| Message::Promised { reply }).await
    }

    /// The lowest retained position. `None` if shut down.
    pub async fn beginning(&self) -> Option<Position> {
        self.query(|reply| Message::Beginning { reply }).await
    }

    /// The highest persisted position. `None` if shut down.
    pub async fn ending(&self) -> Option<Position> {
        self.query(|reply| Message::Ending { reply }).await
    }

    /// Durably move the replica to `status`. `false` if it shut down
    /// before acknowledging.
    pub(crate) async fn set_status(&self, status: Status) -> bool {
        self.query(|reply| Message::SetStatus { status, reply })
            .await
            .is_some()
    }

    /// Stop the replica and wait until its storage is released.
    pub async fn shutdown(&self) {
        let _ = self.query(|reply| Message::Shutdown { reply }).await;
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Message) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.pid.send(build(tx)).ok()?;
        rx.await.ok()
    }
}

/// Reply slots parked by the non-voting gate. Never answered; holding
/// the sender keeps the caller pending, and dropping it on shutdown
/// lets callers observe the replica as gone.
#[derive(Debug)]
enum Muted {
    #[allow(dead_code)]
    Promise(oneshot::Sender<PromiseResponse>),
    #[allow(dead_code)]
    Write(oneshot::Sender<WriteResponse>),
}

enum Flow {
    Continue,
    Shutdown(oneshot::Sender<()>),
}

struct ReplicaProcess<S: Storage> {
    id: u64,
    storage: S,
    metadata: Metadata,
    begin: Position,
    end: Position,
    learned: BTreeSet<u64>,
    unlearned: BTreeSet<u64>,
    muted: Vec<Muted>,
}

async fn run<S: Storage>(mut process: ReplicaProcess<S>, mut mailbox: mpsc::UnboundedReceiver<Message>) {
    let mut shutdown_ack = None;
    while let Some(message) = mailbox.recv().await {
        match process.handle(message) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Shutdown(ack)) => {
                shutdown_ack = Some(ack);
                break;
            }
            Err(e) => {
                error!(replica = process.id, error = %e, "storage failure, replica stopping");
                break;
            }
        }
    }
    mailbox.close();
    drop(process);
    if let Some(ack) = shutdown_ack {
        let _ = ack.send(());
    }
}

impl<S: Storage> ReplicaProcess<S> {
    fn handle(&mut self, message: Message) -> Result<Flow, StorageError> {
        match message {
            Message::Promise { request, reply } => {
                if self.metadata.status != Status::Voting {
                    debug!(
                        replica = self.id,
                        status = %self.metadata.status,
                        "muting promise request while not voting"
                    );
                    self.muted.push(Muted::Promise(reply));
                } else {
                    let response = self.promise(request)?;
                    let _ = reply.send(response);
                }
            }
            Message::Write { request, reply } => {
                if self.metadata.status != Status::Voting {
                    debug!(
                        replica = self.id,
                        status = %self.metadata.status,
                        "muting write request while not voting"
                    );
                    self.muted.push(Muted::Write(reply));
                } else {
                    let response = self.write(request)?;
                    let _ = reply.send(response);
                }
            }
            Message::Learned { message } => self.learn(message.action)?,
            Message::Recover { reply } => {
                let _ = reply.send(RecoverResponse {
                    status: self.metadata.status,
                    begin: self.begin,
                    end: self.end,
                });
            }
            Message::Read { from, to, reply } => {
                let _ = reply.send(self.read(from, to)?);
            }
            Message::Missing { to, reply } => {
                let mut missing = Vec::new();
                for p in self.begin.0..=to.0 {
                    if !self.learned.contains(&p) {
                        missing.push(Position(p));
                    }
                }
                let _ = reply.send(missing);
            }
            Message::Status { reply } => {
                let _ = reply.send(self.metadata.status);
            }
            Message::Promised { reply } => {
                let _ = reply.send(self.metadata.promised);
            }
            Message::Beginning { reply } => {
                let _ = reply.send(self.begin);
            }
            Message::Ending { reply } => {
                let _ = reply.send(self.end);
            }
            Message::SetStatus { status, reply } => {
                let metadata = Metadata {
                    status,
                    promised: self.metadata.promised,
                };
                self.storage.persist_metadata(&metadata)?;
                self.metadata = metadata;
                debug!(replica = self.id, status = %status, "status changed");
                let _ = reply.send(());
            }
            Message::Shutdown { reply } => return Ok(Flow::Shutdown(reply)),
        }
        Ok(Flow::Continue)
    }

    /// Phase 1 handler, both flavors.
    fn promise(&mut self, request: PromiseRequest) -> Result<PromiseResponse, StorageError> {
        match request.position {
            None => {
                // Position-space prepare: an election round.
                if request.proposal > self.metadata.promised {
                    let metadata = Metadata {
                        status: self.metadata.status,
                        promised: request.proposal,
                    };
                    self.storage.persist_metadata(&metadata)?;
                    self.metadata = metadata;
                    debug!(
                        replica = self.id,
                        proposal = %request.proposal,
                        end = %self.end,
                        "promised position space"
                    );
                    Ok(PromiseResponse {
                        okay: true,
                        proposal: request.proposal,
                        position: Some(self.end),
                        action: None,
                    })
                } else {
                    debug!(
                        replica = self.id,
                        proposal = %request.proposal,
                        promised = %self.metadata.promised,
                        "rejecting stale position-space prepare"
                    );
                    Ok(PromiseResponse {
                        okay: false,
                        proposal: self.metadata.promised,
                        position: None,
                        action: None,
                    })
                }
            }
            Some(position) => {
                // Per-position prepare: a fill round.
                let existing = self.persisted(position)?;
                let promised = existing
                    .as_ref()
                    .map(|action| action.promised)
                    .unwrap_or(Proposal::ZERO);

                if request.proposal > promised {
                    let updated = match existing.clone() {
                        Some(mut action) => {
                            action.promised = request.proposal;
                            action
                        }
                        None => Action {
                            position,
                            promised: request.proposal,
                            performed: None,
                            learned: false,
                            op: None,
                        },
                    };
                    self.storage.persist(&updated)?;
                    self.note_persisted(&updated);
                    Ok(PromiseResponse {
                        okay: true,
                        proposal: request.proposal,
                        position: Some(position),
                        action: existing,
                    })
                } else {
                    Ok(PromiseResponse {
                        okay: false,
                        proposal: promised,
                        position: Some(position),
                        action: None,
                    })
                }
            }
        }
    }

    /// Phase 2 handler.
    fn write(&mut self, request: WriteRequest) -> Result<WriteResponse, StorageError> {
        let position = request.position;

        // A learned position is settled; acknowledge without touching it.
        // Any proposer that got this far adopted the chosen value in its
        // prepare round.
        if self.learned.contains(&position.0) {
            return Ok(WriteResponse {
                okay: true,
                proposal: request.proposal,
                position,
            });
        }

        let existing = self.persisted(position)?;
        let promised = existing
            .as_ref()
            .map(|action| action.promised)
            .unwrap_or(self.metadata.promised);

        if request.proposal < promised {
            warn!(
                replica = self.id,
                proposal = %request.proposal,
                promised = %promised,
                position = %position,
                "rejecting write with stale proposal"
            );
            return Ok(WriteResponse {
                okay: false,
                proposal: promised,
                position,
            });
        }

        let action = Action {
            position,
            promised: promised.max(request.proposal),
            performed: Some(request.proposal),
            learned: false,
            op: Some(request.op),
        };
        self.storage.persist(&action)?;
        self.note_persisted(&action);
        debug!(
            replica = self.id,
            proposal = %request.proposal,
            position = %position,
            "accepted write"
        );
        Ok(WriteResponse {
            okay: true,
            proposal: request.proposal,
            position,
        })
    }

    /// Learner handler. Idempotent per position.
    fn learn(&mut self, action: Action) -> Result<(), StorageError> {
        if self.learned.contains(&action.position.0) {
            return Ok(());
        }

        let chosen = Action {
            learned: true,
            ..action
        };
        self.storage.persist(&chosen)?;

        if let Some(Op::Truncate { to }) = chosen.op {
            self.begin = self.begin.max(to);
            self.learned = self.learned.split_off(&to.0);
            self.unlearned = self.unlearned.split_off(&to.0);
            debug!(replica = self.id, begin = %self.begin, "truncated prefix");
        }

        self.end = self.end.max(chosen.position);
        self.unlearned.remove(&chosen.position.0);
        self.learned.insert(chosen.position.0);
        debug!(replica = self.id, position = %chosen.position, "learned position");
        Ok(())
    }

    fn read(&self, from: Position, to: Position) -> Result<Result<Vec<Action>, ReadError>, StorageError> {
        if from < self.begin {
            return Ok(Err(ReadError::TruncatedPosition));
        }
        if to > self.end {
            return Ok(Err(ReadError::PastEnd));
        }

        let mut actions = Vec::new();
        for p in from.0..=to.0 {
            match self.storage.read(Position(p)) {
                Ok(action) => actions.push(action),
                Err(StorageError::NotFound(_)) | Err(StorageError::Truncated(_)) => {
                    actions.push(Action::hole(Position(p)));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Ok(actions))
    }

    /// The persisted action at `position`, if any. A truncated position
    /// reads as absent.
    fn persisted(&self, position: Position) -> Result<Option<Action>, StorageError> {
        match self.storage.read(position) {
            Ok(action) => Ok(Some(action)),
            Err(StorageError::NotFound(_)) | Err(StorageError::Truncated(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn note_persisted(&mut self, action: &Action) {
        self.end = self.end.max(action.position);
        if !self.learned.contains(&action.position.0) {
            self.unlearned.insert(action.position.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn voting_storage() -> MemoryStorage {
        let mut storage = MemoryStorage::new();
        storage
            .persist_metadata(&Metadata {
                status: Status::Voting,
                promised: Proposal::ZERO,
            })
            .expect("persist metadata");
        storage
    }

    fn voting_replica() -> Replica {
        Replica::with_storage(voting_storage()).expect("spawn replica")
    }

    #[tokio::test]
    async fn test_promise_sequence() {
        let replica = voting_replica();

        let response = replica
            .promise(PromiseRequest {
                proposal: Proposal::new(2),
                position: None,
            })
            .await;
        assert!(response.okay);
        assert_eq!(response.proposal, Proposal::new(2));
        assert_eq!(response.position, Some(Position::ZERO));
        assert!(response.action.is_none());

        // A lower proposal is rejected with the highest seen so far.
        let response = replica
            .promise(PromiseRequest {
                proposal: Proposal::new(1),
                position: None,
            })
            .await;
        assert!(!response.okay);
        assert_eq!(response.proposal, Proposal::new(2));
        assert!(response.position.is_none());

        let response = replica
            .promise(PromiseRequest {
                proposal: Proposal::new(3),
                position: None,
            })
            .await;
        assert!(response.okay);
        assert_eq!(response.proposal, Proposal::new(3));
        assert_eq!(response.position, Some(Position::ZERO));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let replica = voting_replica();

        let response = replica
            .promise(PromiseRequest {
                proposal: Proposal::new(1),
                position: None,
            })
            .await;
        assert!(response.okay);

        let response = replica
            .write(WriteRequest {
                proposal: Proposal::new(1),
                position: Position::new(1),
                op: Op::Append {
                    bytes: b"hello world".to_vec(),
                },
            })
            .await;
        assert!(response.okay);
        assert_eq!(response.position, Position::new(1));

        let actions = replica
            .read(Position::new(1), Position::new(1))
            .await
            .expect("read");
        assert_eq!(actions.len(), 1);

        let action = &actions[0];
        assert_eq!(action.position, Position::new(1));
        assert_eq!(action.promised, Proposal::new(1));
        assert_eq!(action.performed, Some(Proposal::new(1)));
        assert!(!action.learned);
        assert_eq!(
            action.op,
            Some(Op::Append {
                bytes: b"hello world".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let replica = voting_replica();

        let response = replica
            .promise(PromiseRequest {
                proposal: Proposal::new(5),
                position: None,
            })
            .await;
        assert!(response.okay);

        let response = replica
            .write(WriteRequest {
                proposal: Proposal::new(3),
                position: Position::new(1),
                op: Op::Append {
                    bytes: b"stale".to_vec(),
                },
            })
            .await;
        assert!(!response.okay);
        assert_eq!(response.proposal, Proposal::new(5));
    }

    #[tokio::test]
    async fn test_non_voting_replica_stays_silent() {
        let replica = Replica::with_storage(MemoryStorage::new()).expect("spawn replica");

        let promising = replica.promise(PromiseRequest {
            proposal: Proposal::new(2),
            position: None,
        });
        let outcome = tokio::time::timeout(Duration::from_millis(50), promising).await;
        assert!(outcome.is_err(), "promise should stay pending");

        let writing = replica.write(WriteRequest {
            proposal: Proposal::new(3),
            position: Position::new(1),
            op: Op::Append {
                bytes: b"hello world".to_vec(),
            },
        });
        let outcome = tokio::time::timeout(Duration::from_millis(50), writing).await;
        assert!(outcome.is_err(), "write should stay pending");

        // Recover is answered in every status.
        let response = replica.recover().await.expect("recover");
        assert_eq!(response.status, Status::Empty);
    }

    #[tokio::test]
    async fn test_per_position_promise_returns_prior_action() {
        let replica = voting_replica();

        replica
            .write(WriteRequest {
                proposal: Proposal::new(1),
                position: Position::new(1),
                op: Op::Append {
                    bytes: b"prior".to_vec(),
                },
            })
            .await;

        let response = replica
            .promise(PromiseRequest {
                proposal: Proposal::new(2),
                position: Some(Position::new(1)),
            })
            .await;
        assert!(response.okay);
        let action = response.action.expect("prior action");
        assert_eq!(action.performed, Some(Proposal::new(1)));
        assert_eq!(
            action.op,
            Some(Op::Append {
                bytes: b"prior".to_vec()
            })
        );

        // A repeat at the same proposal is stale against the raised
        // per-position promise.
        let response = replica
            .promise(PromiseRequest {
                proposal: Proposal::new(2),
                position: Some(Position::new(1)),
            })
            .await;
        assert!(!response.okay);
        assert_eq!(response.proposal, Proposal::new(2));
    }

    #[tokio::test]
    async fn test_learned_truncate_discards_prefix() {
        let replica = voting_replica();

        for i in 1..=10u64 {
            replica
                .write(WriteRequest {
                    proposal: Proposal::new(1),
                    position: Position::new(i),
                    op: Op::Append {
                        bytes: i.to_string().into_bytes(),
                    },
                })
                .await;
            replica.learned(Action {
                position: Position::new(i),
                promised: Proposal::new(1),
                performed: Some(Proposal::new(1)),
                learned: true,
                op: Some(Op::Append {
                    bytes: i.to_string().into_bytes(),
                }),
            });
        }

        replica.learned(Action {
            position: Position::new(11),
            promised: Proposal::new(1),
            performed: Some(Proposal::new(1)),
            learned: true,
            op: Some(Op::Truncate {
                to: Position::new(7),
            }),
        });

        assert_eq!(replica.beginning().await, Some(Position::new(7)));
        assert_eq!(replica.ending().await, Some(Position::new(11)));

        let error = replica
            .read(Position::new(6), Position::new(10))
            .await
            .expect_err("read below the truncation point");
        assert_eq!(error, ReadError::TruncatedPosition);

        let actions = replica
            .read(Position::new(7), Position::new(10))
            .await
            .expect("read");
        assert_eq!(actions.len(), 4);
    }

    #[tokio::test]
    async fn test_read_past_end() {
        let replica = voting_replica();

        let error = replica
            .read(Position::ZERO, Position::new(1))
            .await
            .expect_err("read past end");
        assert_eq!(error, ReadError::PastEnd);
    }

    #[tokio::test]
    async fn test_read_synthesizes_holes() {
        let replica = voting_replica();

        replica
            .write(WriteRequest {
                proposal: Proposal::new(1),
                position: Position::new(3),
                op: Op::Append {
                    bytes: b"three".to_vec(),
                },
            })
            .await;

        let actions = replica
            .read(Position::ZERO, Position::new(3))
            .await
            .expect("read");
        assert_eq!(actions.len(), 4);
        for hole in &actions[0..3] {
            assert!(!hole.learned);
            assert_eq!(hole.op, Some(Op::Nop));
        }
        assert_eq!(
            actions[3].op,
            Some(Op::Append {
                bytes: b"three".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_missing_reports_unlearned_and_holes() {
        let replica = voting_replica();

        replica
            .write(WriteRequest {
                proposal: Proposal::new(1),
                position: Position::new(2),
                op: Op::Append {
                    bytes: b"two".to_vec(),
                },
            })
            .await;
        replica.learned(Action {
            position: Position::new(1),
            promised: Proposal::new(1),
            performed: Some(Proposal::new(1)),
            learned: true,
            op: Some(Op::Nop),
        });

        // 0 is a hole, 1 is learned, 2 is unlearned, 3 is a hole.
        let missing = replica.missing(Position::new(3)).await.expect("missing");
        assert_eq!(
            missing,
            vec![Position::ZERO, Position::new(2), Position::new(3)]
        );
    }

    #[tokio::test]
    async fn test_shutdown_makes_replica_unreachable() {
        let replica = voting_replica();
        replica.shutdown().await;

        assert!(replica.status().await.is_none());
        assert_eq!(
            replica.read(Position::ZERO, Position::ZERO).await,
            Err(ReadError::Unavailable)
        );
    }

    #[tokio::test]
    async fn test_restore_after_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log");
        crate::initialize::initialize(&path).expect("initialize");

        {
            let replica = Replica::open(&path).expect("open");
            replica
                .promise(PromiseRequest {
                    proposal: Proposal::new(1),
                    position: None,
                })
                .await;
            replica
                .write(WriteRequest {
                    proposal: Proposal::new(1),
                    position: Position::new(1),
                    op: Op::Append {
                        bytes: b"hello world".to_vec(),
                    },
                })
                .await;
            replica.shutdown().await;
        }

        let replica = Replica::open(&path).expect("reopen");
        assert_eq!(replica.promised().await, Some(Proposal::new(1)));
        let actions = replica
            .read(Position::new(1), Position::new(1))
            .await
            .expect("read");
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].op,
            Some(Op::Append {
                bytes: b"hello world".to_vec()
            })
        );
    }
}
