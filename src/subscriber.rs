// src/subscriber.rs
//! Subscription registry: identifier -> room set, with a reverse room index
//! and per-identifier expiry timers.
//!
//! Every write for one identifier goes through that identifier's lane, a
//! task draining an unbounded queue in FIFO order. Callers await the lane's
//! reply instead of taking a lock, and lanes of different identifiers never
//! touch each other.

use crate::error::RegistryError;
use crate::types::{RoomId, RoomSet};
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identifier used when a client presents no credential.
pub const ANONYMOUS: &str = "anonymous";

/// `"{ip}@{credential}"`, the key every registry operation uses.
pub fn client_identifier(ip: impl std::fmt::Display, credential: Option<&str>) -> String {
    let credential = credential
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(ANONYMOUS);
    format!("{}@{}", ip, credential)
}

enum WriteOp {
    Replace(RoomSet),
    Add(RoomSet),
    Remove(RoomSet),
    Delete,
}

enum WriteOutcome {
    Rooms(RoomSet),
    Missing,
    Deleted(bool),
}

struct WriteRequest {
    op: WriteOp,
    reply: Option<oneshot::Sender<WriteOutcome>>,
}

#[derive(Clone)]
struct Lane {
    tx: mpsc::UnboundedSender<WriteRequest>,
    pending: Arc<AtomicUsize>,
}

struct ExpiryHandle {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    subscriptions: DashMap<String, RoomSet>,
    // room -> identifiers subscribed to it
    room_index: DashMap<RoomId, HashSet<String>>,
    lanes: DashMap<String, Lane>,
    expiries: DashMap<String, ExpiryHandle>,
    generation: AtomicU64,
}

#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &str) -> Option<RoomSet> {
        self.inner.subscriptions.get(identifier).map(|r| r.clone())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.inner.subscriptions.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.subscriptions.is_empty()
    }

    /// Creates or overwrites the subscription of `identifier`.
    pub async fn replace(
        &self,
        identifier: &str,
        rooms: impl IntoIterator<Item = RoomId>,
    ) -> RoomSet {
        let rooms: RoomSet = rooms.into_iter().collect();
        info!("📝 [SUB] {} replaces subscription with {:?}", identifier, rooms);
        match self.submit(identifier, WriteOp::Replace(rooms)).await {
            WriteOutcome::Rooms(rooms) => rooms,
            _ => RoomSet::new(),
        }
    }

    /// Unions `rooms` into the subscription, creating it when absent.
    pub async fn add(&self, identifier: &str, rooms: impl IntoIterator<Item = RoomId>) -> RoomSet {
        let rooms: RoomSet = rooms.into_iter().collect();
        info!("➕ [SUB] {} adds {:?}", identifier, rooms);
        match self.submit(identifier, WriteOp::Add(rooms)).await {
            WriteOutcome::Rooms(rooms) => rooms,
            _ => RoomSet::new(),
        }
    }

    /// Removes `rooms` and returns what is left. Fails when nothing was ever subscribed.
    pub async fn remove(
        &self,
        identifier: &str,
        rooms: impl IntoIterator<Item = RoomId>,
    ) -> Result<RoomSet, RegistryError> {
        let rooms: RoomSet = rooms.into_iter().collect();
        info!("➖ [SUB] {} removes {:?}", identifier, rooms);
        match self.submit(identifier, WriteOp::Remove(rooms)).await {
            WriteOutcome::Rooms(rooms) => Ok(rooms),
            _ => Err(RegistryError::NotFound(identifier.to_string())),
        }
    }

    /// Drops the subscription unconditionally. Returns whether one existed.
    pub async fn delete(&self, identifier: &str) -> bool {
        info!("🗑️ [SUB] {} clears subscription", identifier);
        matches!(
            self.submit(identifier, WriteOp::Delete).await,
            WriteOutcome::Deleted(true)
        )
    }

    /// True while a write for `identifier` is queued or being applied.
    pub fn has_pending_write(&self, identifier: &str) -> bool {
        self.inner
            .lanes
            .get(identifier)
            .map(|lane| lane.pending.load(Ordering::SeqCst) > 0)
            .unwrap_or(false)
    }

    /// Arms the expiry of a first-time subscriber.
    ///
    /// No-op when the identifier already has a subscription, has a write in
    /// flight, or already has a timer.
    pub fn arm_expiry(&self, identifier: &str, after: Duration) -> bool {
        if self.contains(identifier) || self.has_pending_write(identifier) {
            return false;
        }
        self.start_expiry(identifier, after, false)
    }

    /// Arms (or rearms) the expiry of an identifier whose connection went away.
    pub fn arm_expiry_on_disconnect(&self, identifier: &str, after: Duration) {
        self.start_expiry(identifier, after, true);
    }

    pub fn cancel_expiry(&self, identifier: &str) -> bool {
        match self.inner.expiries.remove(identifier) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                info!("⏹️ [SUB] Expiry of {} cancelled", identifier);
                true
            }
            None => false,
        }
    }

    pub fn has_expiry(&self, identifier: &str) -> bool {
        self.inner.expiries.contains_key(identifier)
    }

    /// Union of every subscription.
    pub fn desired_rooms(&self) -> HashSet<RoomId> {
        self.inner.room_index.iter().map(|e| *e.key()).collect()
    }

    pub fn subscribers(&self, room: RoomId) -> Vec<String> {
        self.inner
            .room_index
            .get(&room)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn start_expiry(&self, identifier: &str, after: Duration, replace_existing: bool) -> bool {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let handle = ExpiryHandle {
            generation,
            cancel: cancel.clone(),
        };

        match self.inner.expiries.entry(identifier.to_string()) {
            Entry::Occupied(mut slot) => {
                if !replace_existing {
                    return false;
                }
                slot.insert(handle).cancel.cancel();
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }

        info!("⏳ [SUB] Expiry of {} armed ({:?})", identifier, after);

        let registry = self.clone();
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[SUB] Expiry task of {} stopped", identifier);
                }
                _ = tokio::time::sleep(after) => {
                    // Whoever removes the handle owns the outcome: a concurrent
                    // cancel_expiry either got it first or finds nothing.
                    let won = registry
                        .inner
                        .expiries
                        .remove_if(&identifier, |_, h| h.generation == generation)
                        .is_some();
                    if won {
                        info!("⌛ [SUB] Subscription of {} expired", identifier);
                        registry.enqueue(&identifier, WriteRequest { op: WriteOp::Delete, reply: None });
                    }
                }
            }
        });
        true
    }

    async fn submit(&self, identifier: &str, op: WriteOp) -> WriteOutcome {
        let (reply, rx) = oneshot::channel();
        self.enqueue(
            identifier,
            WriteRequest {
                op,
                reply: Some(reply),
            },
        );
        rx.await.unwrap_or(WriteOutcome::Missing)
    }

    fn enqueue(&self, identifier: &str, mut request: WriteRequest) {
        loop {
            let lane = self
                .inner
                .lanes
                .entry(identifier.to_string())
                .or_insert_with(|| self.spawn_lane(identifier))
                .clone();

            lane.pending.fetch_add(1, Ordering::SeqCst);
            match lane.tx.send(request) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // The lane retired between lookup and send.
                    lane.pending.fetch_sub(1, Ordering::SeqCst);
                    self.inner
                        .lanes
                        .remove_if(identifier, |_, l| l.tx.same_channel(&lane.tx));
                    request = returned;
                }
            }
        }
    }

    fn spawn_lane(&self, identifier: &str) -> Lane {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteRequest>();
        let pending = Arc::new(AtomicUsize::new(0));
        let lane = Lane {
            tx,
            pending: pending.clone(),
        };

        let registry = self.clone();
        let identifier = identifier.to_string();
        debug!("[SUB] Lane opened for {}", identifier);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let retire = matches!(request.op, WriteOp::Delete);
                let outcome = registry.apply(&identifier, request.op);
                pending.fetch_sub(1, Ordering::SeqCst);
                if let Some(reply) = request.reply {
                    let _ = reply.send(outcome);
                }
                if retire {
                    registry.retire_lane(&identifier, &mut rx, &pending);
                    return;
                }
            }
        });
        lane
    }

    /// Closes a lane after a delete. Anything queued behind the delete moves,
    /// in order, to a fresh lane.
    fn retire_lane(
        &self,
        identifier: &str,
        rx: &mut mpsc::UnboundedReceiver<WriteRequest>,
        pending: &Arc<AtomicUsize>,
    ) {
        self.inner
            .lanes
            .remove_if(identifier, |_, lane| Arc::ptr_eq(&lane.pending, pending));
        rx.close();
        while let Ok(request) = rx.try_recv() {
            pending.fetch_sub(1, Ordering::SeqCst);
            self.enqueue(identifier, request);
        }
        debug!("[SUB] Lane closed for {}", identifier);
    }

    fn apply(&self, identifier: &str, op: WriteOp) -> WriteOutcome {
        let previous = self.get(identifier);
        let next = match (op, previous.as_ref()) {
            (WriteOp::Replace(rooms), _) => Some(rooms),
            (WriteOp::Add(rooms), Some(prev)) => Some(prev.union(&rooms).copied().collect()),
            (WriteOp::Add(rooms), None) => Some(rooms),
            (WriteOp::Remove(rooms), Some(prev)) => {
                Some(prev.difference(&rooms).copied().collect())
            }
            (WriteOp::Remove(_), None) => return WriteOutcome::Missing,
            (WriteOp::Delete, _) => None,
        };

        self.reindex(identifier, previous.as_ref(), next.as_ref());

        match next {
            Some(rooms) => {
                self.inner
                    .subscriptions
                    .insert(identifier.to_string(), rooms.clone());
                WriteOutcome::Rooms(rooms)
            }
            None => {
                self.inner.subscriptions.remove(identifier);
                WriteOutcome::Deleted(previous.is_some())
            }
        }
    }

    fn reindex(&self, identifier: &str, before: Option<&RoomSet>, after: Option<&RoomSet>) {
        let empty = RoomSet::new();
        let before = before.unwrap_or(&empty);
        let after = after.unwrap_or(&empty);

        for room in before.difference(after) {
            if let Some(mut ids) = self.inner.room_index.get_mut(room) {
                ids.remove(identifier);
            }
            self.inner.room_index.remove_if(room, |_, ids| ids.is_empty());
        }
        for room in after.difference(before) {
            self.inner
                .room_index
                .entry(*room)
                .or_default()
                .insert(identifier.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(rooms: &[RoomId]) -> RoomSet {
        rooms.iter().copied().collect()
    }

    #[test]
    fn identifier_defaults_to_anonymous() {
        assert_eq!(client_identifier("1.2.3.4", None), "1.2.3.4@anonymous");
        assert_eq!(client_identifier("1.2.3.4", Some("  ")), "1.2.3.4@anonymous");
        assert_eq!(client_identifier("1.2.3.4", Some("tok")), "1.2.3.4@tok");
    }

    #[tokio::test]
    async fn add_unions_with_existing_rooms() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.add("ip1@tok", [1, 2]).await, set(&[1, 2]));
        assert_eq!(registry.add("ip1@tok", [2, 3]).await, set(&[1, 2, 3]));
        assert_eq!(registry.get("ip1@tok"), Some(set(&[1, 2, 3])));
    }

    #[tokio::test]
    async fn remove_without_subscription_is_not_found() {
        let registry = SubscriptionRegistry::new();
        let err = registry.remove("ghost", [1]).await.unwrap_err();
        assert_eq!(err, RegistryError::NotFound("ghost".into()));
        assert_eq!(registry.get("ghost"), None);
        assert!(registry.desired_rooms().is_empty());
    }

    #[tokio::test]
    async fn remove_returns_remainder() {
        let registry = SubscriptionRegistry::new();
        registry.replace("a", [1, 2, 3]).await;
        assert_eq!(registry.remove("a", [2, 9]).await.unwrap(), set(&[1, 3]));
    }

    #[tokio::test]
    async fn replace_and_delete() {
        let registry = SubscriptionRegistry::new();
        registry.replace("a", [1, 2]).await;
        assert_eq!(registry.replace("a", [5]).await, set(&[5]));
        assert!(registry.delete("a").await);
        assert!(!registry.delete("a").await);
        assert_eq!(registry.get("a"), None);
        // the retired lane must not swallow later writes
        assert_eq!(registry.add("a", [7]).await, set(&[7]));
    }

    #[tokio::test]
    async fn reverse_index_tracks_subscribers() {
        let registry = SubscriptionRegistry::new();
        registry.replace("a", [1, 2]).await;
        registry.replace("b", [2, 3]).await;

        let mut subs = registry.subscribers(2);
        subs.sort();
        assert_eq!(subs, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.desired_rooms(), [1, 2, 3].into_iter().collect());

        registry.remove("a", [1, 2]).await.unwrap();
        assert_eq!(registry.subscribers(2), vec!["b".to_string()]);
        assert!(registry.subscribers(1).is_empty());
        assert_eq!(registry.desired_rooms(), [2, 3].into_iter().collect());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_for_one_identifier_are_all_applied() {
        let registry = SubscriptionRegistry::new();
        let mut tasks = Vec::new();
        for room in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.add("same", [room]).await }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.get("same"), Some((0..64).collect()));
    }

    #[tokio::test]
    async fn arm_expiry_only_for_new_subscribers() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.arm_expiry("new", Duration::from_secs(300)));
        // at most one timer
        assert!(!registry.arm_expiry("new", Duration::from_secs(300)));

        registry.replace("old", [1]).await;
        assert!(!registry.arm_expiry("old", Duration::from_secs(300)));
        assert!(!registry.has_expiry("old"));
    }

    #[tokio::test]
    async fn arm_expiry_skips_identifier_with_write_in_flight() {
        let registry = SubscriptionRegistry::new();
        registry.enqueue(
            "busy",
            WriteRequest {
                op: WriteOp::Add(set(&[1])),
                reply: None,
            },
        );
        assert!(registry.has_pending_write("busy"));
        assert!(!registry.arm_expiry("busy", Duration::from_secs(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn first_subscription_expires_without_connection() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.arm_expiry("fresh", Duration::from_secs(300)));
        registry.replace("fresh", [42]).await;

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(registry.get("fresh"), Some(set(&[42])));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.get("fresh"), None);
        assert!(registry.desired_rooms().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_expiry_deletes_after_timeout() {
        let registry = SubscriptionRegistry::new();
        registry.replace("id", [42]).await;
        registry.arm_expiry_on_disconnect("id", Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(registry.get("id"), None);
        assert!(!registry.has_expiry("id"));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_before_timeout_keeps_subscription() {
        let registry = SubscriptionRegistry::new();
        registry.replace("id", [42]).await;
        registry.arm_expiry_on_disconnect("id", Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(240)).await;
        assert!(registry.cancel_expiry("id"));
        assert!(!registry.cancel_expiry("id"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(registry.get("id"), Some(set(&[42])));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_previous_timer() {
        let registry = SubscriptionRegistry::new();
        registry.replace("id", [1]).await;
        registry.arm_expiry_on_disconnect("id", Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(200)).await;
        registry.arm_expiry_on_disconnect("id", Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(registry.get("id"), Some(set(&[1])));

        tokio::time::sleep(Duration::from_secs(151)).await;
        assert_eq!(registry.get("id"), None);
    }
}
