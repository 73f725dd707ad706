// src/broadcast.rs
//! Fan-out of upstream messages to downstream connections.
//!
//! Each connection owns its write lock. A delivery runs on its own task, so a
//! slow or dead subscriber only ever delays itself.

use crate::{
    state::RoomState,
    subscriber::SubscriptionRegistry,
    types::{BroadcastEnvelope, LiveInfo, LiveMessage, RoomId, RoomSet},
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Write half of a downstream connection.
#[async_trait]
pub trait Downstream: Send + 'static {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()>;

    async fn close(&mut self);
}

struct Connection {
    id: Uuid,
    identifier: String,
    global: bool,
    writer: Mutex<Box<dyn Downstream>>,
}

/// Returned by [`BroadcastRouter::connect`]; identifies exactly one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub identifier: String,
    pub global: bool,
}

struct Inner {
    registry: SubscriptionRegistry,
    rooms: RoomState,
    connections: DashMap<String, Arc<Connection>>,
    globals: DashMap<String, Arc<Connection>>,
    expiry: Duration,
}

#[derive(Clone)]
pub struct BroadcastRouter {
    inner: Arc<Inner>,
}

impl BroadcastRouter {
    /// `expiry` is how long a subscription outlives a dropped connection.
    pub fn new(registry: SubscriptionRegistry, rooms: RoomState, expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                rooms,
                connections: DashMap::new(),
                globals: DashMap::new(),
                expiry,
            }),
        }
    }

    /// Registers the connection of `identifier`, replacing any older one.
    pub async fn connect(
        &self,
        identifier: &str,
        downstream: Box<dyn Downstream>,
    ) -> ConnectionHandle {
        let (conn, handle) = new_connection(identifier, false, downstream);
        if let Some(old) = self
            .inner
            .connections
            .insert(identifier.to_string(), conn)
        {
            info!("🔁 [WS] {} reconnected, closing the previous connection", identifier);
            close_in_background(old);
        }

        self.inner.registry.cancel_expiry(identifier);
        // 空集合：连接存续期间不会触发首次订阅的过期计时
        self.inner.registry.add(identifier, RoomSet::new()).await;

        info!(
            "🔌 [WS] {} connected ({}), {} open",
            identifier,
            handle.id,
            self.connection_count()
        );
        handle
    }

    pub fn connect_global(
        &self,
        identifier: &str,
        downstream: Box<dyn Downstream>,
    ) -> ConnectionHandle {
        let (conn, handle) = new_connection(identifier, true, downstream);
        if let Some(old) = self.inner.globals.insert(identifier.to_string(), conn) {
            close_in_background(old);
        }
        info!("🌐 [WS] Global {} connected ({})", identifier, handle.id);
        handle
    }

    /// Drops whatever connection `identifier` holds and closes it.
    pub async fn disconnect(&self, identifier: &str) -> bool {
        let Some((_, conn)) = self.inner.connections.remove(identifier) else {
            return false;
        };
        conn.writer.lock().await.close().await;
        self.inner
            .registry
            .arm_expiry_on_disconnect(identifier, self.inner.expiry);
        info!("👋 [WS] {} disconnected", identifier);
        true
    }

    /// Called when the connection behind `handle` ended. A newer connection
    /// of the same identifier is left alone.
    pub fn release(&self, handle: &ConnectionHandle) -> bool {
        let table = if handle.global {
            &self.inner.globals
        } else {
            &self.inner.connections
        };
        let removed = table
            .remove_if(&handle.identifier, |_, conn| conn.id == handle.id)
            .is_some();

        if removed {
            info!("👋 [WS] {} closed ({})", handle.identifier, handle.id);
            if !handle.global {
                self.inner
                    .registry
                    .arm_expiry_on_disconnect(&handle.identifier, self.inner.expiry);
            }
        }
        removed
    }

    pub fn is_connected(&self, identifier: &str) -> bool {
        self.inner.connections.contains_key(identifier)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn global_count(&self) -> usize {
        self.inner.globals.len()
    }

    /// Sends `message` to everyone interested in `room` and to every global
    /// connection. Returns how many deliveries were started.
    pub fn dispatch(&self, room: RoomId, live_info: &LiveInfo, message: &LiveMessage) -> usize {
        let envelope = BroadcastEnvelope {
            command: &message.cmd,
            live_info,
            content: message.content(),
        };
        let payload: Arc<str> = match serde_json::to_string(&envelope) {
            Ok(json) => json.into(),
            Err(e) => {
                error!("❌ [BROADCAST] Cannot encode {} of room {}: {}", message.cmd, room, e);
                return 0;
            }
        };

        let mut identifiers: HashSet<String> =
            self.inner.registry.subscribers(room).into_iter().collect();
        for alias in self.inner.rooms.aliases_of(room) {
            identifiers.extend(self.inner.registry.subscribers(alias));
        }

        let mut targets: Vec<Arc<Connection>> = identifiers
            .iter()
            .filter_map(|id| self.inner.connections.get(id).map(|c| c.value().clone()))
            .collect();
        targets.extend(self.inner.globals.iter().map(|c| c.value().clone()));

        let count = targets.len();
        for conn in targets {
            let router = self.clone();
            let payload = payload.clone();
            tokio::spawn(async move { router.deliver(conn, payload).await });
        }
        count
    }

    async fn deliver(&self, conn: Arc<Connection>, payload: Arc<str>) {
        let mut writer = conn.writer.lock().await;
        match writer.send_text(&payload).await {
            Ok(()) => {}
            Err(e) => {
                warn!("⚠️ [BROADCAST] Write to {} failed: {}. Dropping connection.", conn.identifier, e);
                writer.close().await;
                drop(writer);
                self.evict(&conn);
            }
        }
    }

    fn evict(&self, conn: &Connection) {
        let table = if conn.global {
            &self.inner.globals
        } else {
            &self.inner.connections
        };
        let removed = table
            .remove_if(&conn.identifier, |_, c| c.id == conn.id)
            .is_some();
        if removed && !conn.global {
            self.inner
                .registry
                .arm_expiry_on_disconnect(&conn.identifier, self.inner.expiry);
        }
        debug!("[BROADCAST] Evicted {} (removed: {})", conn.identifier, removed);
    }
}

fn new_connection(
    identifier: &str,
    global: bool,
    downstream: Box<dyn Downstream>,
) -> (Arc<Connection>, ConnectionHandle) {
    let id = Uuid::new_v4();
    let conn = Arc::new(Connection {
        id,
        identifier: identifier.to_string(),
        global,
        writer: Mutex::new(downstream),
    });
    let handle = ConnectionHandle {
        id,
        identifier: identifier.to_string(),
        global,
    };
    (conn, handle)
}

fn close_in_background(conn: Arc<Connection>) {
    tokio::spawn(async move {
        conn.writer.lock().await.close().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, DownstreamSpy};

    const EXPIRY: Duration = Duration::from_secs(300);

    fn router() -> (BroadcastRouter, SubscriptionRegistry, RoomState) {
        let registry = SubscriptionRegistry::new();
        let rooms = RoomState::new();
        (
            BroadcastRouter::new(registry.clone(), rooms.clone(), EXPIRY),
            registry,
            rooms,
        )
    }

    fn info(room: RoomId) -> LiveInfo {
        LiveInfo {
            room_id: room,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_direct_alias_and_global_subscribers() {
        let (router, registry, rooms) = router();
        rooms.record_alias(5, 500);

        let direct = DownstreamSpy::default();
        let via_alias = DownstreamSpy::default();
        let other = DownstreamSpy::default();
        let global = DownstreamSpy::default();

        router.connect("a", direct.downstream()).await;
        router.connect("b", via_alias.downstream()).await;
        router.connect("c", other.downstream()).await;
        router.connect_global("g@global", global.downstream());
        registry.replace("a", [500]).await;
        registry.replace("b", [5]).await;
        registry.replace("c", [7]).await;

        let msg = LiveMessage::new("DANMU_MSG", &br#"{"cmd":"DANMU_MSG","info":[1]}"#[..]);
        assert_eq!(router.dispatch(500, &info(500), &msg), 3);

        eventually(|| direct.sent().len() == 1 && via_alias.sent().len() == 1 && global.sent().len() == 1).await;
        let envelope = &direct.sent_json()[0];
        assert_eq!(envelope["command"], "DANMU_MSG");
        assert_eq!(envelope["live_info"]["room_id"], 500);
        assert_eq!(envelope["content"]["info"], serde_json::json!([1]));
        assert!(other.sent().is_empty());
    }

    #[tokio::test]
    async fn subscribers_without_connection_are_skipped() {
        let (router, registry, _) = router();
        registry.replace("offline", [1]).await;
        let msg = LiveMessage::heartbeat_reply(3);
        assert_eq!(router.dispatch(1, &info(1), &msg), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_hold_up_others() {
        let (router, registry, _) = router();
        let slow = DownstreamSpy::default();
        let fast = DownstreamSpy::default();
        let gate = slow.stall();

        router.connect("slow", slow.downstream()).await;
        router.connect("fast", fast.downstream()).await;
        registry.replace("slow", [1]).await;
        registry.replace("fast", [1]).await;

        let msg = LiveMessage::new("SEND_GIFT", &b"{}"[..]);
        router.dispatch(1, &info(1), &msg);
        router.dispatch(1, &info(1), &msg);

        eventually(|| fast.sent().len() == 2).await;
        assert!(slow.sent().is_empty());

        gate.notify_waiters();
        gate.notify_one();
        eventually(|| !slow.sent().is_empty()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_drops_connection_and_arms_expiry() {
        let (router, registry, _) = router();
        let broken = DownstreamSpy::default();
        router.connect("ip@tok", broken.downstream()).await;
        registry.replace("ip@tok", [42]).await;
        broken.fail_writes();

        router.dispatch(42, &info(42), &LiveMessage::new("LIVE", &b"{}"[..]));
        eventually(|| !router.is_connected("ip@tok")).await;
        assert!(broken.is_closed());
        assert!(registry.has_expiry("ip@tok"));

        tokio::time::sleep(EXPIRY + Duration::from_secs(1)).await;
        assert_eq!(registry.get("ip@tok"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_expiry_keeps_subscription() {
        let (router, registry, _) = router();
        let first = DownstreamSpy::default();
        let handle = router.connect("ip@tok", first.downstream()).await;
        registry.replace("ip@tok", [42]).await;

        assert!(router.release(&handle));
        tokio::time::sleep(Duration::from_secs(240)).await;

        let second = DownstreamSpy::default();
        router.connect("ip@tok", second.downstream()).await;
        assert!(!registry.has_expiry("ip@tok"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(registry.get("ip@tok"), Some([42].into_iter().collect()));
    }

    #[tokio::test]
    async fn connect_seeds_empty_subscription() {
        let (router, registry, _) = router();
        router.connect("new", DownstreamSpy::default().downstream()).await;
        assert_eq!(registry.get("new"), Some(Default::default()));

        registry.replace("old", [1, 2]).await;
        router.connect("old", DownstreamSpy::default().downstream()).await;
        assert_eq!(registry.get("old"), Some([1, 2].into_iter().collect()));
    }

    #[tokio::test]
    async fn stale_release_keeps_newer_connection() {
        let (router, registry, _) = router();
        let first = DownstreamSpy::default();
        let old = router.connect("id", first.downstream()).await;
        let new = router
            .connect("id", DownstreamSpy::default().downstream())
            .await;

        eventually(|| first.is_closed()).await;
        assert!(!router.release(&old));
        assert!(router.is_connected("id"));
        assert!(!registry.has_expiry("id"));

        assert!(router.release(&new));
        assert!(!router.is_connected("id"));
        assert!(registry.has_expiry("id"));
    }

    #[tokio::test]
    async fn global_release_does_not_arm_expiry() {
        let (router, registry, _) = router();
        let handle = router.connect_global("1.2.3.4@global", DownstreamSpy::default().downstream());
        assert_eq!(router.global_count(), 1);
        assert!(router.release(&handle));
        assert_eq!(router.global_count(), 0);
        assert!(!registry.has_expiry("1.2.3.4@global"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_and_starts_expiry() {
        let (router, registry, _) = router();
        let conn = DownstreamSpy::default();
        router.connect("ip@tok", conn.downstream()).await;
        router.connect("other", DownstreamSpy::default().downstream()).await;
        registry.replace("ip@tok", [42]).await;
        assert_eq!(router.connection_count(), 2);

        assert!(router.disconnect("ip@tok").await);
        assert!(conn.is_closed());
        assert!(!router.is_connected("ip@tok"));
        assert_eq!(router.connection_count(), 1);
        assert!(registry.has_expiry("ip@tok"));
        assert!(!router.disconnect("ip@tok").await);
        assert!(!router.disconnect("unknown").await);

        tokio::time::sleep(EXPIRY + Duration::from_secs(1)).await;
        assert_eq!(registry.get("ip@tok"), None);
        assert!(router.is_connected("other"));
    }
}
