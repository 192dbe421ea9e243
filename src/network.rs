//! Peer membership, request broadcast, and quorum-size watches.
//!
//! A [`Network`] tracks the current set of replica addresses and fans
//! requests out to all of them. It holds only [`Pid`]s, never whole
//! replicas, so membership stays a flat value with no back-pointers.
//!
//! Broadcast replies settle one at a time into a [`Responses`] stream:
//! callers count okays toward a quorum as they arrive instead of
//! waiting for the full set. A member whose mailbox is gone surfaces
//! as [`Event::Unreachable`], which lets quorum logic fail fast when
//! too many peers are confirmed dead; a member that is merely silent
//! simply never contributes an event.
//!
//! [`Network::watch`] resolves the first time the membership size
//! satisfies a predicate. Coordinators use it to hold an election until
//! enough members are even present to form a quorum.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::protocol::{Event, LearnedMessage, Outcome, Request, Responses};
use crate::replica::{Message, Pid};
use crate::types::Action;

/// Comparison applied by [`Network::watch`] as
/// `membership_size PREDICATE n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePredicate {
    /// `size == n`. The conventional default.
    EqualTo,
    /// `size != n`.
    NotEqualTo,
    /// `size < n`.
    LessThan,
    /// `size <= n`.
    LessThanOrEqualTo,
    /// `size > n`.
    GreaterThan,
    /// `size >= n`.
    GreaterThanOrEqualTo,
}

impl SizePredicate {
    fn holds(self, size: usize, n: usize) -> bool {
        match self {
            SizePredicate::EqualTo => size == n,
            SizePredicate::NotEqualTo => size != n,
            SizePredicate::LessThan => size < n,
            SizePredicate::LessThanOrEqualTo => size <= n,
            SizePredicate::GreaterThan => size > n,
            SizePredicate::GreaterThanOrEqualTo => size >= n,
        }
    }
}

struct WatchEntry {
    n: usize,
    predicate: SizePredicate,
    reply: oneshot::Sender<usize>,
}

struct Inner {
    members: HashSet<Pid>,
    watches: Vec<WatchEntry>,
}

/// A live view of the peer set. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Mutex<Inner>>,
}

impl Network {
    /// Create a network over an initial peer set.
    pub fn new(pids: impl IntoIterator<Item = Pid>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                members: pids.into_iter().collect(),
                watches: Vec::new(),
            })),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a peer. Idempotent.
    pub fn add(&self, pid: Pid) {
        let mut inner = self.locked();
        if inner.members.insert(pid) {
            debug!(size = inner.members.len(), "peer added");
        }
        Self::fire_watches(&mut inner);
    }

    /// Remove a peer. Idempotent.
    pub fn remove(&self, pid: &Pid) {
        let mut inner = self.locked();
        if inner.members.remove(pid) {
            debug!(size = inner.members.len(), "peer removed");
        }
        Self::fire_watches(&mut inner);
    }

    /// The current membership size.
    pub fn size(&self) -> usize {
        self.locked().members.len()
    }

    fn fire_watches(inner: &mut Inner) {
        let size = inner.members.len();
        let mut i = 0;
        while i < inner.watches.len() {
            if inner.watches[i].predicate.holds(size, inner.watches[i].n) {
                let entry = inner.watches.swap_remove(i);
                let _ = entry.reply.send(size);
            } else {
                i += 1;
            }
        }
    }

    /// Resolve to the membership size the first time
    /// `size PREDICATE n` holds. Checks immediately on registration.
    pub async fn watch(&self, n: usize, predicate: SizePredicate) -> usize {
        let rx = {
            let mut inner = self.locked();
            let size = inner.members.len();
            if predicate.holds(size, n) {
                return size;
            }
            let (tx, rx) = oneshot::channel();
            inner.watches.push(WatchEntry {
                n,
                predicate,
                reply: tx,
            });
            rx
        };
        match rx.await {
            Ok(size) => size,
            // The network itself went away; nothing left to observe.
            Err(_) => std::future::pending().await,
        }
    }

    /// Send `request` to every current member.
    ///
    /// Replies settle into the returned [`Responses`] as they arrive.
    pub fn broadcast<R: Request>(&self, request: R) -> Responses<R::Response> {
        let members: Vec<Pid> = self.locked().members.iter().cloned().collect();
        let total = members.len();
        let (tx, rx) = mpsc::unbounded_channel();

        for pid in members {
            let request = request.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let event = match crate::protocol::call(&pid, request).await {
                    Outcome::Reply(response) => Event::Reply(response),
                    Outcome::Unreachable => Event::Unreachable,
                };
                let _ = tx.send(event);
            });
        }

        Responses::new(rx, total)
    }

    /// Tell every member that `action` was chosen. Fire-and-forget:
    /// losses are repaired by catch-up.
    pub fn learned(&self, action: Action) {
        let inner = self.locked();
        for pid in &inner.members {
            let _ = pid.send(Message::Learned {
                message: LearnedMessage {
                    action: action.clone(),
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::Replica;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn pid() -> Pid {
        Replica::with_storage(MemoryStorage::new())
            .expect("spawn replica")
            .pid()
    }

    #[tokio::test]
    async fn test_watch_fires_on_threshold_crossings() {
        let pid1 = pid();
        let pid2 = pid();

        let network = Network::new([]);

        // Already-satisfied predicates resolve immediately.
        assert_eq!(network.watch(2, SizePredicate::NotEqualTo).await, 0);
        assert_eq!(
            network.watch(0, SizePredicate::GreaterThanOrEqualTo).await,
            0
        );
        assert_eq!(network.watch(1, SizePredicate::LessThan).await, 0);

        network.add(pid1.clone());
        assert_eq!(network.watch(1, SizePredicate::EqualTo).await, 1);

        let watching = network.watch(1, SizePredicate::GreaterThan);
        tokio::pin!(watching);
        let early = tokio::time::timeout(Duration::from_millis(20), watching.as_mut()).await;
        assert!(early.is_err(), "watch should still be pending");

        network.add(pid2.clone());
        assert_eq!(watching.await, 2);

        let watching = network.watch(1, SizePredicate::LessThanOrEqualTo);
        tokio::pin!(watching);
        let early = tokio::time::timeout(Duration::from_millis(20), watching.as_mut()).await;
        assert!(early.is_err(), "watch should still be pending");

        network.remove(&pid2);
        assert_eq!(watching.await, 1);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let network = Network::new([]);
        let p = pid();

        network.add(p.clone());
        network.add(p.clone());
        assert_eq!(network.size(), 1);

        network.remove(&p);
        network.remove(&p);
        assert_eq!(network.size(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let replicas: Vec<Replica> = (0..3)
            .map(|_| Replica::with_storage(MemoryStorage::new()).expect("spawn replica"))
            .collect();
        let network = Network::new(replicas.iter().map(|r| r.pid()));

        let mut responses = network.broadcast(crate::protocol::RecoverRequest);
        assert_eq!(responses.total(), 3);

        let mut replies = 0;
        while let Some(event) = responses.next().await {
            match event {
                Event::Reply(response) => {
                    assert_eq!(response.status, crate::types::Status::Empty);
                    replies += 1;
                }
                Event::Unreachable => panic!("live replicas should answer recover"),
            }
        }
        assert_eq!(replies, 3);
    }

    #[tokio::test]
    async fn test_broadcast_flags_dead_members() {
        let live = Replica::with_storage(MemoryStorage::new()).expect("spawn replica");
        let dead = Replica::with_storage(MemoryStorage::new()).expect("spawn replica");
        dead.shutdown().await;

        let network = Network::new([live.pid(), dead.pid()]);
        let mut responses = network.broadcast(crate::protocol::RecoverRequest);

        let mut replies = 0;
        let mut unreachable = 0;
        while let Some(event) = responses.next().await {
            match event {
                Event::Reply(_) => replies += 1,
                Event::Unreachable => unreachable += 1,
            }
        }
        assert_eq!((replies, unreachable), (1, 1));
    }
}
