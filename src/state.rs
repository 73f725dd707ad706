// src/state.rs
use crate::types::RoomId;
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancellation handle of one running listener. `instance` tells apart two
/// listeners that ran for the same canonical room at different times.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    pub instance: u64,
    pub stop: CancellationToken,
}

/// Bookkeeping shared by the supervisor, the listeners and the router.
#[derive(Default)]
struct Inner {
    // canonical rooms with a live listener
    listening: DashSet<RoomId>,
    // canonical rooms currently being connected by a launch
    connecting: DashSet<RoomId>,
    // alias ids served by the listener of their canonical room
    shadowed: DashSet<RoomId>,
    // alias -> canonical, never rewritten once resolved
    aliases: DashMap<RoomId, RoomId>,
    // canonical -> aliases, kept in step with `aliases`
    alias_index: DashMap<RoomId, HashSet<RoomId>>,
    excepted: DashSet<RoomId>,
    cooling_down: DashSet<RoomId>,
    entered: DashSet<RoomId>,
    handles: DashMap<RoomId, ListenerHandle>,
    last_refresh: DashMap<RoomId, Instant>,
    instances: AtomicU64,
}

#[derive(Clone, Default)]
pub struct RoomState {
    inner: Arc<Inner>,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    // --- snapshots ---

    pub fn listening(&self) -> HashSet<RoomId> {
        self.inner.listening.iter().map(|r| *r).collect()
    }

    pub fn entered(&self) -> HashSet<RoomId> {
        self.inner.entered.iter().map(|r| *r).collect()
    }

    pub fn excepted(&self) -> HashSet<RoomId> {
        self.inner.excepted.iter().map(|r| *r).collect()
    }

    pub fn cooling_down(&self) -> HashSet<RoomId> {
        self.inner.cooling_down.iter().map(|r| *r).collect()
    }

    pub fn shadowed(&self) -> HashSet<RoomId> {
        self.inner.shadowed.iter().map(|r| *r).collect()
    }

    pub fn is_listening(&self, room: RoomId) -> bool {
        self.inner.listening.contains(&room)
    }

    pub fn is_excepted(&self, room: RoomId) -> bool {
        self.inner.excepted.contains(&room)
    }

    pub fn is_cooling_down(&self, room: RoomId) -> bool {
        self.inner.cooling_down.contains(&room)
    }

    pub fn is_shadowed(&self, room: RoomId) -> bool {
        self.inner.shadowed.contains(&room)
    }

    // --- aliases ---

    pub fn canonical_of(&self, room: RoomId) -> Option<RoomId> {
        self.inner.aliases.get(&room).map(|c| *c)
    }

    /// Canonical id for `room`, or `room` itself when it is not a known alias.
    pub fn resolve(&self, room: RoomId) -> RoomId {
        self.canonical_of(room).unwrap_or(room)
    }

    pub fn record_alias(&self, alias: RoomId, canonical: RoomId) {
        if let Entry::Vacant(slot) = self.inner.aliases.entry(alias) {
            slot.insert(canonical);
            self.inner
                .alias_index
                .entry(canonical)
                .or_default()
                .insert(alias);
        }
    }

    /// Every alias known to map onto `canonical`.
    pub fn aliases_of(&self, canonical: RoomId) -> Vec<RoomId> {
        self.inner
            .alias_index
            .get(&canonical)
            .map(|aliases| aliases.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn shadow(&self, alias: RoomId) {
        self.inner.shadowed.insert(alias);
    }

    /// Drops shadow aliases for which `keep` returns false.
    pub fn prune_shadows(&self, keep: impl Fn(RoomId) -> bool) -> Vec<RoomId> {
        let dropped: Vec<RoomId> = self
            .inner
            .shadowed
            .iter()
            .map(|r| *r)
            .filter(|r| !keep(*r))
            .collect();
        for alias in &dropped {
            self.inner.shadowed.remove(alias);
        }
        dropped
    }

    // --- exclusion & cooldown ---

    pub fn except(&self, room: RoomId) {
        self.inner.excepted.insert(room);
    }

    /// Suppresses `room` for `base + step × population` and schedules its release.
    pub fn cool_down(&self, room: RoomId, base: Duration, step: Duration) -> Duration {
        self.inner.cooling_down.insert(room);
        let population = self.inner.cooling_down.len() as u32;
        let cool = base + step * population;

        let state = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cool).await;
            state.inner.cooling_down.remove(&room);
            info!("🧊 [COOLDOWN] Room {} may be listened again", room);
        });
        cool
    }

    // --- listener lifecycle ---

    /// Claims `canonical` for connecting. Fails when it is excepted, already
    /// listening, or another launch holds the claim.
    pub fn claim(&self, canonical: RoomId) -> bool {
        if self.inner.excepted.contains(&canonical) {
            return false;
        }
        if !self.inner.connecting.insert(canonical) {
            return false;
        }
        if self.inner.listening.contains(&canonical) {
            self.inner.connecting.remove(&canonical);
            return false;
        }
        true
    }

    pub fn unclaim(&self, canonical: RoomId) {
        self.inner.connecting.remove(&canonical);
    }

    /// Turns a claim into a running listener and returns its handle.
    pub fn register(&self, canonical: RoomId, stop: CancellationToken) -> ListenerHandle {
        let handle = ListenerHandle {
            instance: self.inner.instances.fetch_add(1, Ordering::SeqCst) + 1,
            stop,
        };
        self.inner.handles.insert(canonical, handle.clone());
        self.inner.listening.insert(canonical);
        self.inner.connecting.remove(&canonical);
        handle
    }

    pub fn mark_entered(&self, canonical: RoomId) {
        self.inner.entered.insert(canonical);
    }

    /// Cancels the listener of `canonical` and drops its bookkeeping.
    pub fn stop(&self, canonical: RoomId) -> bool {
        let handle = self.inner.handles.remove(&canonical).map(|(_, h)| h);
        let was_listening = self.forget(canonical);
        match handle {
            Some(handle) => {
                handle.stop.cancel();
                true
            }
            None => {
                if was_listening {
                    warn!("⚠️ [ROOM] {} was listening without a stop handle", canonical);
                }
                was_listening
            }
        }
    }

    /// Called by a listener on its way out. Only clears bookkeeping that still
    /// belongs to this instance; a stop by the supervisor already did.
    pub fn release(&self, canonical: RoomId, instance: u64) -> bool {
        let owned = self
            .inner
            .handles
            .remove_if(&canonical, |_, h| h.instance == instance)
            .is_some();
        if owned {
            self.forget(canonical);
        }
        owned
    }

    fn forget(&self, canonical: RoomId) -> bool {
        let was_listening = self.inner.listening.remove(&canonical).is_some();
        self.inner.entered.remove(&canonical);
        for alias in self.aliases_of(canonical) {
            self.inner.shadowed.remove(&alias);
        }
        was_listening
    }

    /// True at most once per `window` for each room.
    pub fn try_begin_refresh(&self, room: RoomId, window: Duration) -> bool {
        let now = Instant::now();
        match self.inner.last_refresh.entry(room) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) >= window {
                    last.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }
}
