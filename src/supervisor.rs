// src/supervisor.rs
use crate::{
    config::ShadowRetention,
    listener::{launch, LaunchOutcome, ListenerContext},
    subscriber::SubscriptionRegistry,
    types::RoomId,
};
use futures_util::future::join_all;
use std::collections::HashSet;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: Vec<RoomId>,
    pub aliased: Vec<RoomId>,
    pub stopped: Vec<RoomId>,
}

/// Keeps the set of running listeners in line with what subscribers want.
#[derive(Clone)]
pub struct RoomSupervisor {
    ctx: ListenerContext,
    registry: SubscriptionRegistry,
}

impl RoomSupervisor {
    pub fn new(ctx: ListenerContext, registry: SubscriptionRegistry) -> Self {
        Self { ctx, registry }
    }

    /// Runs [`tick`](Self::tick) every reconcile interval until `shutdown`
    /// fires, then stops every listener.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.ctx.config.reconcile_interval;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("🛰️ [SUPERVISOR] Reconciling every {:?}", period);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.tick().await;
                        if report != TickReport::default() {
                            debug!("[SUPERVISOR] {:?}", report);
                        }
                    }
                }
            }

            for room in self.ctx.rooms.listening() {
                self.ctx.rooms.stop(room);
            }
            info!("🛑 [SUPERVISOR] Stopped");
        })
    }

    /// Rooms that must keep a listener: everything subscribed plus the
    /// canonical room behind every shadowed alias.
    fn retained(&self) -> HashSet<RoomId> {
        let mut retain = self.registry.desired_rooms();
        retain.extend(
            self.ctx
                .rooms
                .shadowed()
                .into_iter()
                .map(|alias| self.ctx.rooms.resolve(alias)),
        );
        retain
    }

    pub async fn tick(&self) -> TickReport {
        let rooms = &self.ctx.rooms;
        let mut report = TickReport::default();

        if self.ctx.config.shadow_retention == ShadowRetention::Subscribed {
            let desired = self.registry.desired_rooms();
            let dropped = rooms.prune_shadows(|alias| desired.contains(&alias));
            if !dropped.is_empty() {
                debug!("[SUPERVISOR] Dropped unsubscribed short ids {:?}", dropped);
            }
        }

        let listening = rooms.listening();
        let mut to_launch = Vec::new();
        for room in self.retained() {
            if listening.contains(&room)
                || rooms.is_excepted(room)
                || rooms.is_cooling_down(room)
                || rooms.is_shadowed(room)
            {
                continue;
            }
            // 短号对应的真实房间已在监听，无需再查询
            if let Some(canonical) = rooms.canonical_of(room) {
                if rooms.is_listening(canonical) {
                    rooms.shadow(room);
                    report.aliased.push(room);
                    continue;
                }
            }
            to_launch.push(room);
        }

        let launches = to_launch.into_iter().map(|room| {
            let ctx = self.ctx.clone();
            tokio::spawn(async move { (room, launch(&ctx, room).await) })
        });
        for joined in join_all(launches).await {
            match joined {
                Ok((room, LaunchOutcome::Listening { .. })) => report.started.push(room),
                Ok((room, LaunchOutcome::Aliased { .. })) => report.aliased.push(room),
                Ok(_) => {}
                Err(e) => error!("💥 [SUPERVISOR] Launch task died: {}", e),
            }
        }

        let retain = self.retained();
        for room in rooms.listening() {
            if !retain.contains(&room) && rooms.stop(room) {
                info!("⏹️ [SUPERVISOR] No subscriber left for room {}, stopping", room);
                report.stopped.push(room);
            }
        }

        report.started.sort_unstable();
        report.aliased.sort_unstable();
        report.stopped.sort_unstable();
        report
    }

    pub fn listening_rooms(&self) -> HashSet<RoomId> {
        self.ctx.rooms.listening()
    }

    pub fn entered_rooms(&self) -> HashSet<RoomId> {
        self.ctx.rooms.entered()
    }

    pub fn excepted_rooms(&self) -> HashSet<RoomId> {
        self.ctx.rooms.excepted()
    }

    pub fn cooling_down_rooms(&self) -> HashSet<RoomId> {
        self.ctx.rooms.cooling_down()
    }

    pub fn shadowed_rooms(&self) -> HashSet<RoomId> {
        self.ctx.rooms.shadowed()
    }
}
