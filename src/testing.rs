// src/testing.rs
//! In-crate doubles for the collaborator traits.

use crate::{
    broadcast::Downstream,
    build_router,
    config::Config,
    error::{FrameError, ResolveError, UpstreamError},
    metadata::MetadataResolver,
    persist::{EventSink, NullSink},
    types::{LiveInfo, LiveMessage, OwnerInfo, RoomId, RoomInfo},
    upstream::{ConnectTarget, UpstreamConnector, UpstreamSession},
    ServerState,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Polls `check` until it holds, advancing (possibly paused) time in small steps.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// --- metadata ---

/// Unknown rooms resolve to themselves with owner `room * 10`.
#[derive(Default)]
pub struct MockResolver {
    canonical: DashMap<RoomId, RoomId>,
    failures: DashMap<RoomId, ResolveError>,
    calls: DashMap<RoomId, usize>,
    host: Mutex<Option<String>>,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn alias(&self, alias: RoomId, canonical: RoomId) {
        self.canonical.insert(alias, canonical);
    }

    pub fn fail(&self, room: RoomId, error: ResolveError) {
        self.failures.insert(room, error);
    }

    pub fn recover(&self, room: RoomId) {
        self.failures.remove(&room);
    }

    pub fn set_host(&self, url: &str) {
        *self.host.lock().unwrap() = Some(url.to_string());
    }

    pub fn calls(&self, room: RoomId) -> usize {
        self.calls.get(&room).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl MetadataResolver for MockResolver {
    async fn resolve_room(&self, room: RoomId, _force: bool) -> Result<RoomInfo, ResolveError> {
        *self.calls.entry(room).or_insert(0) += 1;
        if let Some(err) = self.failures.get(&room) {
            return Err(err.clone());
        }
        let room_id = self.canonical.get(&room).map(|c| *c).unwrap_or(room);
        Ok(RoomInfo {
            room_id,
            uid: room_id * 10,
            title: format!("room {}", room_id),
            cover: String::new(),
        })
    }

    async fn resolve_owner(&self, uid: i64, _force: bool) -> Result<OwnerInfo, ResolveError> {
        Ok(OwnerInfo {
            name: format!("owner {}", uid),
            face: String::new(),
            bio: String::new(),
            official_role: -1,
        })
    }

    async fn low_latency_host(&self, _room: RoomId, _force: bool) -> Option<String> {
        self.host.lock().unwrap().clone()
    }
}

// --- upstream ---

pub enum MockFrame {
    Message(LiveMessage),
    Garbage,
}

#[derive(Default)]
struct UpstreamInner {
    feeds: DashMap<RoomId, mpsc::UnboundedSender<MockFrame>>,
    connects: DashMap<RoomId, usize>,
    entered: DashMap<RoomId, usize>,
    refused: DashSet<RoomId>,
    urls: Mutex<Vec<String>>,
}

/// Every connect opens a session fed through [`MockConnector::send`].
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<UpstreamInner>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse(&self, room: RoomId) {
        self.inner.refused.insert(room);
    }

    pub fn connects(&self, room: RoomId) -> usize {
        self.inner.connects.get(&room).map(|c| *c).unwrap_or(0)
    }

    pub fn entered(&self, room: RoomId) -> usize {
        self.inner.entered.get(&room).map(|c| *c).unwrap_or(0)
    }

    pub fn urls(&self) -> Vec<String> {
        self.inner.urls.lock().unwrap().clone()
    }

    /// Feeds the newest session of `room`. False when it is gone.
    pub fn send(&self, room: RoomId, frame: MockFrame) -> bool {
        self.inner
            .feeds
            .get(&room)
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false)
    }

    pub fn message(&self, room: RoomId, cmd: &str, body: &str) -> bool {
        self.send(room, MockFrame::Message(LiveMessage::new(cmd, body.to_string())))
    }

    /// Ends the newest session of `room` as if the upstream hung up.
    pub fn hang_up(&self, room: RoomId) {
        self.inner.feeds.remove(&room);
    }
}

#[async_trait]
impl UpstreamConnector for MockConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Box<dyn UpstreamSession>, UpstreamError> {
        *self.inner.connects.entry(target.room).or_insert(0) += 1;
        self.inner.urls.lock().unwrap().push(target.url.clone());
        if self.inner.refused.contains(&target.room) {
            return Err(UpstreamError::Connect("refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.feeds.insert(target.room, tx);
        Ok(Box::new(MockSession {
            inner: self.inner.clone(),
            rx,
        }))
    }
}

struct MockSession {
    inner: Arc<UpstreamInner>,
    rx: mpsc::UnboundedReceiver<MockFrame>,
}

#[async_trait]
impl UpstreamSession for MockSession {
    async fn enter(&mut self, room: RoomId, _guest_uid: i64) -> Result<(), UpstreamError> {
        *self.inner.entered.entry(room).or_insert(0) += 1;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<LiveMessage>, UpstreamError> {
        match self.rx.recv().await {
            Some(MockFrame::Message(msg)) => Ok(Some(msg)),
            Some(MockFrame::Garbage) => Err(UpstreamError::Decode(FrameError::MissingCommand)),
            None => Ok(None),
        }
    }
}

// --- persistence ---

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(String, RoomId)>>,
}

impl RecordingSink {
    pub fn commands(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn persist(
        &self,
        command: &str,
        live_info: &LiveInfo,
        _message: &LiveMessage,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((command.to_string(), live_info.room_id));
        Ok(())
    }
}

// --- downstream ---

#[derive(Default)]
struct DownstreamInner {
    sent: Mutex<Vec<String>>,
    fail: AtomicBool,
    closed: AtomicBool,
    // when set, writes wait for this before completing
    gate: Mutex<Option<Arc<Notify>>>,
}

/// Test side of a [`MockDownstream`].
#[derive(Clone, Default)]
pub struct DownstreamSpy {
    inner: Arc<DownstreamInner>,
}

impl DownstreamSpy {
    pub fn downstream(&self) -> Box<dyn Downstream> {
        Box::new(MockDownstream {
            inner: self.inner.clone(),
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    pub fn fail_writes(&self) {
        self.inner.fail.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Makes every write hang until the returned notify fires.
    pub fn stall(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.inner.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

struct MockDownstream {
    inner: Arc<DownstreamInner>,
}

#[async_trait]
impl Downstream for MockDownstream {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        let gate = self.inner.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.inner.fail.load(Ordering::SeqCst) {
            anyhow::bail!("broken pipe");
        }
        self.inner.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

// --- server ---

/// State wired to the mocks above.
pub fn mock_state(config: Config) -> (ServerState, Arc<MockResolver>, MockConnector) {
    let resolver = MockResolver::new();
    let connector = MockConnector::new();
    let state = ServerState::new(
        Arc::new(config),
        resolver.clone(),
        Arc::new(connector.clone()),
        Arc::new(NullSink),
    );
    (state, resolver, connector)
}

/// Serves the full router on an ephemeral local port.
pub async fn spawn_server(state: ServerState) -> SocketAddr {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    addr
}
