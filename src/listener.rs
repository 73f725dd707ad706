// src/listener.rs
//! One upstream listener per canonical room.
//!
//! A launch resolves the requested id, handles the failure kinds of the
//! metadata lookup, follows short ids to their canonical room and connects.
//! The read loop then runs on its own task until it is stopped, its
//! watchdog fires or the upstream goes away.

use crate::{
    broadcast::BroadcastRouter,
    config::{Config, HostSelection},
    error::{ResolveError, UpstreamError},
    heartbeat::{HeartbeatWatchdog, WatchdogOutcome},
    metadata::{fetch_live_info, MetadataResolver},
    persist::EventSink,
    state::{ListenerHandle, RoomState},
    types::{LiveInfo, LiveMessage, RoomId},
    upstream::{ConnectTarget, UpstreamConnector, UpstreamSession},
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ORIGIN: &str = "https://live.bilibili.com";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a listener needs, shared by every launch.
#[derive(Clone)]
pub struct ListenerContext {
    pub config: Arc<Config>,
    pub rooms: RoomState,
    pub resolver: Arc<dyn MetadataResolver>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub sink: Arc<dyn EventSink>,
    pub router: BroadcastRouter,
}

/// What a launch did with the requested room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A new listener runs for `canonical`.
    Listening { canonical: RoomId },
    /// The requested id is a short id served by the listener of `canonical`.
    Aliased { canonical: RoomId },
    /// Another listener or launch already owns the room.
    AlreadyListening,
    /// The room does not exist; it will not be tried again.
    Excepted,
    /// Rate limited; the room is suppressed for the given duration.
    CoolingDown(Duration),
    /// Nothing was recorded; the next tick tries again.
    Failed(String),
}

#[derive(Debug)]
enum ExitReason {
    Stopped,
    UpstreamClosed,
    Failed(UpstreamError),
}

pub async fn launch(ctx: &ListenerContext, room: RoomId) -> LaunchOutcome {
    if ctx.rooms.is_excepted(room) {
        return LaunchOutcome::Excepted;
    }

    let live_info = match fetch_live_info(ctx.resolver.as_ref(), room, false).await {
        Ok(info) => info,
        Err(ResolveError::NotFound) => {
            warn!("🚫 [ROOM {}] Does not exist, excluded from listening", room);
            ctx.rooms.except(room);
            return LaunchOutcome::Excepted;
        }
        Err(ResolveError::RateLimited) => {
            let cool = ctx
                .rooms
                .cool_down(room, ctx.config.cooldown_base, ctx.config.cooldown_step);
            warn!("🧊 [ROOM {}] Rate limited, cooling down for {:?}", room, cool);
            return LaunchOutcome::CoolingDown(cool);
        }
        Err(ResolveError::Transient(e)) => {
            warn!("⚠️ [ROOM {}] Lookup failed: {}. Will retry next tick.", room, e);
            return LaunchOutcome::Failed(e);
        }
    };

    let canonical = live_info.room_id;
    let aliased = canonical != room;
    if aliased {
        ctx.rooms.record_alias(room, canonical);
        info!("🔗 [ROOM {}] Is a short id of {}", room, canonical);
    }

    // 短号指向已排除的房间，短号本身也一并排除
    if ctx.rooms.is_excepted(canonical) {
        warn!("🚫 [ROOM {}] Maps onto excluded room {}", room, canonical);
        ctx.rooms.except(room);
        return LaunchOutcome::Excepted;
    }

    if !ctx.rooms.claim(canonical) {
        if aliased {
            ctx.rooms.shadow(room);
            return LaunchOutcome::Aliased { canonical };
        }
        return LaunchOutcome::AlreadyListening;
    }

    let target = ConnectTarget {
        room: canonical,
        url: select_host(ctx, canonical).await,
        headers: vec![
            ("Origin", ORIGIN.to_string()),
            ("Referer", format!("{}/{}", ORIGIN, canonical)),
            ("User-Agent", ctx.config.user_agent.clone()),
        ],
    };

    debug!("[ROOM {}] Connecting to {}", canonical, target.url);
    let mut session = match ctx.connector.connect(&target).await {
        Ok(session) => session,
        Err(e) => {
            ctx.rooms.unclaim(canonical);
            warn!("❌ [ROOM {}] Connect failed: {}", canonical, e);
            return LaunchOutcome::Failed(e.to_string());
        }
    };

    let guest_uid = rand::thread_rng().gen_range(100_000..1_000_000_000i64);
    if let Err(e) = session.enter(canonical, guest_uid).await {
        ctx.rooms.unclaim(canonical);
        warn!("❌ [ROOM {}] Enter handshake failed: {}", canonical, e);
        return LaunchOutcome::Failed(e.to_string());
    }

    let handle = ctx.rooms.register(canonical, CancellationToken::new());
    ctx.rooms.mark_entered(canonical);
    if aliased {
        ctx.rooms.shadow(room);
    }
    info!("🎧 [ROOM {}] Listening ({})", canonical, live_info.name);

    tokio::spawn(run(ctx.clone(), canonical, live_info, session, handle));
    LaunchOutcome::Listening { canonical }
}

async fn select_host(ctx: &ListenerContext, room: RoomId) -> String {
    match &ctx.config.ws_host {
        HostSelection::Default => ctx.config.default_ws_host.clone(),
        HostSelection::Fixed(url) => url.clone(),
        HostSelection::Auto => match ctx.resolver.low_latency_host(room, false).await {
            Some(url) => url,
            None => ctx.config.default_ws_host.clone(),
        },
    }
}

async fn run(
    ctx: ListenerContext,
    room: RoomId,
    live_info: LiveInfo,
    mut session: Box<dyn UpstreamSession>,
    handle: ListenerHandle,
) {
    let watchdog = HeartbeatWatchdog::spawn(room, ctx.config.heartbeat_timeout, handle.stop.clone());
    let (info_tx, _) = watch::channel(Arc::new(live_info));
    let info_tx = Arc::new(info_tx);

    let reason = loop {
        let next = tokio::select! {
            _ = handle.stop.cancelled() => break ExitReason::Stopped,
            next = session.next_message() => next,
        };

        match next {
            Ok(Some(msg)) => {
                if msg.is_heartbeat_reply() {
                    watchdog.feed();
                }
                if msg.is_live_start()
                    && ctx.rooms.try_begin_refresh(room, ctx.config.live_refresh_window)
                {
                    tokio::spawn(refresh_live_info(ctx.clone(), room, info_tx.clone()));
                }
                let info = info_tx.borrow().clone();
                forward(&ctx, room, info, msg);
            }
            Ok(None) => break ExitReason::UpstreamClosed,
            Err(e) if e.is_recoverable() => {
                debug!("[ROOM {}] Skipping frame: {}", room, e);
            }
            Err(e) => break ExitReason::Failed(e),
        }
    };

    // 连接已断开，不能让监听一直占着房间
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await;
    handle.stop.cancel();
    let stalled = watchdog.outcome().await == WatchdogOutcome::Stalled;
    let released = ctx.rooms.release(room, handle.instance);

    match reason {
        _ if stalled => info!("💤 [ROOM {}] Upstream stalled, listener stopped", room),
        ExitReason::Stopped => info!("⏹️ [ROOM {}] Listener stopped", room),
        ExitReason::UpstreamClosed => warn!("🔌 [ROOM {}] Upstream closed the connection", room),
        ExitReason::Failed(e) => error!("❌ [ROOM {}] Listener failed: {}", room, e),
    }
    debug!("[ROOM {}] Bookkeeping released: {}", room, released);
}

/// Hands one message to the sink and the router.
fn forward(ctx: &ListenerContext, room: RoomId, info: Arc<LiveInfo>, msg: LiveMessage) {
    let sink = ctx.sink.clone();
    let persisted = msg.clone();
    let persisted_info = info.clone();
    tokio::spawn(async move {
        if let Err(e) = sink
            .persist(&persisted.cmd, &persisted_info, &persisted)
            .await
        {
            warn!("⚠️ [PERSIST] {} of room {} not saved: {:#}", persisted.cmd, room, e);
        }
    });

    ctx.router.dispatch(room, &info, &msg);
}

/// Reloads the metadata attached to outgoing envelopes when a room goes live.
async fn refresh_live_info(
    ctx: ListenerContext,
    room: RoomId,
    info_tx: Arc<watch::Sender<Arc<LiveInfo>>>,
) {
    match fetch_live_info(ctx.resolver.as_ref(), room, true).await {
        Ok(info) => {
            info_tx.send_replace(Arc::new(info));
            info!("🔄 [ROOM {}] Live info refreshed", room);
        }
        Err(e) => warn!("⚠️ [ROOM {}] Live info refresh failed, keeping the old one: {}", room, e),
    }

    if ctx.config.ws_host == HostSelection::Auto {
        ctx.resolver.low_latency_host(room, true).await;
    }
}
