//! The relay engine: ingest, reader-side policy, subscriptions and broadcast.
//!
//! Every mount shares one [`Relay`]. Published events run the generic policy
//! chain, then the mount's own rules, and are routed into a storage layer.
//! Saving fires the post-save hooks (payments, deletions, group state,
//! curation) and fans the event out to live subscriptions whose mount reads
//! that layer.

pub mod conn;
pub mod info;
pub mod mount;

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use mount::{Mount, Route};

use crate::{
    config::{RelaySettings, Settings},
    curation::{Curator, REACTION_KINDS},
    error::{Reject, Verdict},
    event::{is_secret_kind, kinds, now, Event, Keys, KindClass},
    fetcher::EventFetcher,
    filter::Filter,
    groups::{Actor, GroupsManager},
    inbox::InboxStore,
    limits::Limits,
    membership::Membership,
    paywall::{self, PaywallCache},
    pinned::PinnedCache,
    policy::{self, Ctx, GENERIC_EVENT_CHAIN, GENERIC_FILTER_CHAIN},
    shard::ShardedMap,
    storage::{EventIter, LayerName, Layers, SaveOutcome, StoreError},
    wot::Wot,
};

/// Frames queued per connection before it is dropped as too slow.
pub const BROADCAST_BUFFER: usize = 256;
/// Most stored events returned for one filter.
pub const QUERY_CAP: usize = 500;
/// Scheduled events due within this many seconds are published.
pub const SCHEDULE_LEAD: u64 = 60;
/// Allowed clock distance for AUTH events, in seconds.
pub const AUTH_WINDOW: u64 = 600;

/// One connection's subscriptions and authenticated keys.
pub struct Listener {
    pub id: u64,
    pub mount: Mount,
    authed: RwLock<Vec<String>>,
    subs: RwLock<HashMap<String, Vec<Filter>>>,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Listener {
    pub fn authed(&self) -> Vec<String> {
        self.authed.read().clone()
    }

    pub fn add_authed(&self, pubkey: &str) {
        let mut authed = self.authed.write();
        if !authed.iter().any(|k| k == pubkey) {
            authed.push(pubkey.to_string());
        }
    }

    pub fn subscribe(&self, sub: &str, filters: Vec<Filter>) {
        self.subs.write().insert(sub.to_string(), filters);
    }

    pub fn unsubscribe(&self, sub: &str) -> bool {
        self.subs.write().remove(sub).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.read().len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a reply, waiting for room.
    pub async fn reply(&self, frame: String) -> bool {
        !self.cancel.is_cancelled() && self.tx.send(frame).await.is_ok()
    }

    /// Queue a broadcast frame without waiting; a full queue drops the connection.
    fn push(&self, frame: String) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn = self.id, "subscriber too slow, dropping connection");
                self.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

pub fn event_frame(sub: &str, ev: &Event) -> String {
    json!(["EVENT", sub, ev]).to_string()
}

pub fn closed_frame(sub: &str, reason: &Reject) -> String {
    json!(["CLOSED", sub, reason.to_string()]).to_string()
}

/// A secret-kind event is shown only to keys it is addressed to.
fn addressed_to(ev: &Event, readers: &[String]) -> bool {
    ev.tag_values("p").any(|p| readers.iter().any(|r| r == p))
}

pub struct Relay {
    settings: RwLock<Arc<RelaySettings>>,
    settings_path: PathBuf,
    domain: String,
    keys: Keys,
    layers: Layers,
    inbox: InboxStore,
    membership: Arc<Membership>,
    groups: GroupsManager,
    paywall: PaywallCache,
    wot: Wot,
    pinned: PinnedCache,
    limits: Limits,
    curator: Curator,
    fetcher: Arc<dyn EventFetcher>,
    listeners: ShardedMap<u64, Arc<Listener>>,
    next_listener: AtomicU64,
}

impl Relay {
    /// Open every layer, replay the membership log and rebuild group state.
    pub fn open(cfg: &Settings, fetcher: Arc<dyn EventFetcher>) -> Result<Arc<Self>> {
        let settings_path = cfg.settings_path();
        let settings = RelaySettings::load(&settings_path)?;
        let keys = Keys::from_secret_hex(&cfg.relay_secret_key).context("RELAY_SECRET_KEY")?;
        let layers = Layers::open(&cfg.data_dir)
            .with_context(|| format!("opening layers under {}", cfg.data_dir.display()))?;
        let membership = Arc::new(
            Membership::load(cfg.log_path(), settings.max_invites_per_person)
                .context("replaying membership log")?,
        );
        let groups = GroupsManager::load(keys.clone(), layers.get(LayerName::Groups));
        let pinned = PinnedCache::new();
        pinned.refresh(&settings, &layers, &keys);
        let curator = Curator::new(layers.clone(), membership.clone(), fetcher.clone());
        info!(
            relay = %keys.public_key(),
            members = membership.member_count(),
            "relay opened"
        );
        Ok(Arc::new(Self {
            settings: RwLock::new(Arc::new(settings)),
            settings_path,
            domain: cfg.domain.clone(),
            inbox: InboxStore::new(layers.clone()),
            keys,
            layers,
            membership,
            groups,
            paywall: PaywallCache::new(),
            wot: Wot::new(),
            pinned,
            limits: Limits::new(),
            curator,
            fetcher,
            listeners: ShardedMap::new(),
            next_listener: AtomicU64::new(1),
        }))
    }

    pub fn settings(&self) -> Arc<RelaySettings> {
        self.settings.read().clone()
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn layers(&self) -> &Layers {
        &self.layers
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn groups(&self) -> &GroupsManager {
        &self.groups
    }

    pub fn paywall(&self) -> &PaywallCache {
        &self.paywall
    }

    pub fn wot(&self) -> &Wot {
        &self.wot
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn is_member(&self, pk: &str) -> bool {
        pk == self.keys.public_key() || self.membership.is_member(pk)
    }

    /// Write changed settings to disk, then load them back.
    pub fn update_settings(&self, change: impl FnOnce(&mut RelaySettings)) -> Result<()> {
        let mut next = (*self.settings()).clone();
        change(&mut next);
        next.save(&self.settings_path)?;
        self.reload_settings()?;
        Ok(())
    }

    /// Pick up `settings.json` when it differs from the loaded copy.
    pub fn reload_settings(&self) -> Result<bool> {
        let loaded = RelaySettings::load(&self.settings_path)?;
        if *self.settings() == loaded {
            return Ok(false);
        }
        self.membership.set_max_invites(loaded.max_invites_per_person);
        self.pinned.refresh(&loaded, &self.layers, &self.keys);
        *self.settings.write() = Arc::new(loaded);
        info!("relay settings reloaded");
        Ok(true)
    }

    fn ctx<'a>(&'a self, settings: &'a RelaySettings, authed: &'a [String], now: u64) -> Ctx<'a> {
        Ctx {
            settings,
            membership: &self.membership,
            layers: &self.layers,
            relay_pubkey: self.keys.public_key(),
            authed,
            now,
        }
    }

    pub fn register(&self, mount: Mount, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Arc<Listener> {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(Listener {
            id,
            mount,
            authed: RwLock::new(Vec::new()),
            subs: RwLock::new(HashMap::new()),
            tx,
            cancel,
        });
        self.listeners.insert(id, listener.clone());
        listener
    }

    pub fn unregister(&self, id: u64) {
        self.listeners.remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.listeners.len()
    }

    /// Admit, store and announce an event published on `mount`.
    ///
    /// Follow-up events the group state machine asks for are ingested as the
    /// relay before this returns. The `Ok` message is empty for a fresh save.
    pub fn ingest(self: &Arc<Self>, mount: Mount, authed: &[String], ev: &Event) -> Result<String, Reject> {
        let (message, follow_ups) = self.ingest_one(mount, authed, ev)?;
        let relay_key = vec![self.keys.public_key().to_string()];
        let mut queue: VecDeque<Event> = follow_ups.into();
        while let Some(next) = queue.pop_front() {
            match self.ingest_one(Mount::Groups, &relay_key, &next) {
                Ok((_, more)) => queue.extend(more),
                Err(e) => warn!(id = %next.id, kind = next.kind, "relay follow-up refused: {e}"),
            }
        }
        Ok(message)
    }

    fn ingest_one(
        self: &Arc<Self>,
        mount: Mount,
        authed: &[String],
        ev: &Event,
    ) -> Result<(String, Vec<Event>), Reject> {
        let settings = self.settings();
        let now = now();
        let ctx = self.ctx(&settings, authed, now);
        let route = policy::run_events(GENERIC_EVENT_CHAIN, &ctx, ev)
            .and_then(|()| self.route(mount, &ctx, ev))
            .map_err(|e| {
                debug!(mount = %mount, id = %ev.id, kind = ev.kind, "event rejected: {e}");
                e
            })?;
        match route {
            Route::Ephemeral => {
                self.broadcast(mount.layer(), ev);
                Ok((String::new(), Vec::new()))
            }
            Route::Moderate { target, approve } => {
                self.moderate(&target, approve)?;
                Ok((String::new(), Vec::new()))
            }
            Route::Store(layer) => self.store(layer, ev, now),
        }
    }

    fn route(&self, mount: Mount, ctx: &Ctx, ev: &Event) -> Result<Route, Reject> {
        if mount != Mount::Groups {
            let queue = self.layers.get(LayerName::ModerationQueue);
            return mount::admit(mount, ctx, &self.wot, |id| queue.contains(id), ev);
        }
        if !ctx.settings.groups.enabled {
            return Err(Reject::blocked("groups are disabled on this relay"));
        }
        if ev.class() == KindClass::Ephemeral {
            return Err(Reject::invalid("ephemeral events are not accepted in groups"));
        }
        let actor = Actor {
            pubkey: &ev.pubkey,
            is_relay: ev.pubkey == self.keys.public_key(),
            is_relay_member: ctx.is_member(&ev.pubkey),
            is_relay_admin: self.membership.is_root(&ev.pubkey) || ctx.is_master(&ev.pubkey),
        };
        self.groups
            .admit(&actor, ev, self.layers.get(LayerName::Groups), ctx.now)?;
        Ok(Route::Store(LayerName::Groups))
    }

    fn store(self: &Arc<Self>, layer: LayerName, ev: &Event, now: u64) -> Result<(String, Vec<Event>), Reject> {
        let saved = if layer == LayerName::Inbox {
            self.inbox.store(ev)
        } else {
            self.layers.get(layer).store(ev)
        };
        let outcome = saved.map_err(|e| {
            error!(layer = %layer, id = %ev.id, "failed to save event: {e}");
            Reject::error("failed to save event")
        })?;
        match outcome {
            SaveOutcome::Saved => {}
            SaveOutcome::Duplicate => {
                return Ok(("duplicate: already have this event".into(), Vec::new()))
            }
            SaveOutcome::Superseded => {
                return Ok(("duplicate: a newer version is already stored".into(), Vec::new()))
            }
        }
        let stored_in = if layer == LayerName::Inbox && is_secret_kind(ev.kind) {
            LayerName::Secret
        } else {
            layer
        };
        debug!(layer = %stored_in, id = %ev.id, kind = ev.kind, "event saved");

        let mut follow_ups = Vec::new();
        let mut snapshots = Vec::new();
        match stored_in {
            LayerName::Main => {
                self.paywall.observe(ev);
                if ev.kind == kinds::DELETION {
                    self.apply_deletion(ev);
                }
                self.spawn_curation(ev);
            }
            LayerName::Groups => {
                let effects = self.groups.apply(ev, now);
                let groups = self.layers.get(LayerName::Groups);
                for id in &effects.deleted {
                    if let Err(e) = groups.delete(id) {
                        error!(id = %id, "failed to delete group event: {e}");
                    }
                }
                follow_ups = effects.publish;
                snapshots = effects.snapshots;
            }
            _ => {}
        }
        self.broadcast(stored_in, ev);
        let groups = self.layers.get(LayerName::Groups);
        for snap in snapshots {
            match groups.store(&snap) {
                Ok(SaveOutcome::Saved) => self.broadcast(LayerName::Groups, &snap),
                Ok(_) => {}
                Err(e) => error!(id = %snap.id, "failed to save group snapshot: {e}"),
            }
        }
        Ok((String::new(), follow_ups))
    }

    /// A kind-5 request removes the author's own events and addresses from `main`.
    fn apply_deletion(&self, request: &Event) {
        let main = self.layers.get(LayerName::Main);
        let by_id = request.tag_values("e").filter_map(|id| main.get(id));
        let by_address = request
            .tag_values("a")
            .filter_map(|a| main.get_latest(a))
            .filter(|t| t.created_at <= request.created_at);
        let targets: Vec<Arc<Event>> = by_id
            .chain(by_address)
            .filter(|t| t.pubkey == request.pubkey && t.kind != kinds::DELETION)
            .collect();
        for target in targets {
            match main.delete(&target.id) {
                Ok(_) => debug!(id = %target.id, "deleted on request"),
                Err(e) => error!(id = %target.id, "failed to delete event: {e}"),
            }
        }
    }

    fn spawn_curation(self: &Arc<Self>, ev: &Event) {
        if !REACTION_KINDS.contains(&ev.kind) {
            return;
        }
        let relay = Arc::clone(self);
        let ev = ev.clone();
        tokio::spawn(async move {
            let settings = relay.settings();
            for (layer, promoted) in relay.curator.on_saved(&settings, &ev, now()).await {
                info!(layer = %layer, id = %promoted.id, "event promoted");
                relay.broadcast(layer, &promoted);
            }
        });
    }

    /// Move a queued event into `moderated`, or drop it.
    fn moderate(&self, target: &str, approve: bool) -> Verdict {
        let queue = self.layers.get(LayerName::ModerationQueue);
        let Some(ev) = queue.get(target) else {
            return Err(Reject::invalid("event is not waiting for moderation"));
        };
        let failed = |e: StoreError| {
            error!(id = %target, "moderation failed: {e}");
            Reject::error("failed to moderate event")
        };
        if approve {
            self.layers
                .get(LayerName::Moderated)
                .store(&ev)
                .map_err(failed)?;
        }
        queue.delete(target).map_err(failed)?;
        info!(id = %target, approve, "moderation verdict applied");
        if approve {
            self.broadcast(LayerName::Moderated, &ev);
        }
        Ok(())
    }

    /// Reader-side policy for one event on `mount`.
    pub fn visible(
        &self,
        mount: Mount,
        ev: &Event,
        readers: &[String],
        selected_groups: &BTreeSet<String>,
        now: u64,
    ) -> bool {
        match mount {
            Mount::Main => {
                let settings = self.settings();
                if !settings.paywall.enabled() || !paywall::is_paywalled(&settings.paywall, ev) {
                    return true;
                }
                self.paywall.can_read(
                    &settings.paywall,
                    self.layers.get(LayerName::Main),
                    &ev.pubkey,
                    readers,
                    now,
                )
            }
            Mount::Inbox if is_secret_kind(ev.kind) => addressed_to(ev, readers),
            Mount::Groups => self.groups.can_see(ev, readers, selected_groups),
            Mount::Scheduled => readers.iter().any(|r| *r == ev.pubkey),
            _ => true,
        }
    }

    /// Subscription admission: generic chain, mount rules, private groups.
    pub fn check_filter(&self, mount: Mount, readers: &[String], filter: &Filter) -> Verdict {
        let settings = self.settings();
        let ctx = self.ctx(&settings, readers, now());
        policy::run_filters(GENERIC_FILTER_CHAIN, &ctx, filter)?;
        mount::gate_filter(mount, &ctx, filter)?;
        if mount == Mount::Groups {
            self.groups.gate(filter, readers)?;
        }
        Ok(())
    }

    /// Stored events for a subscription, newest first, pinned event leading.
    pub fn query(self: &Arc<Self>, mount: Mount, readers: &[String], filter: &Filter, cap: usize) -> EventIter {
        let member = readers.iter().any(|r| self.is_member(r));
        let lead = self.pinned.lead(mount.layer(), filter);
        let mut filter = filter.clone();
        let mut cap = cap;
        if lead.is_some() {
            filter.limit = filter.limit.map(|l| l.saturating_sub(1));
            cap = cap.saturating_sub(1);
        }
        let natural = match mount {
            Mount::Inbox => {
                let readers = readers.to_vec();
                self.inbox
                    .query(&filter, cap, move |ev| addressed_to(ev, &readers))
            }
            _ => self.layers.query(&mount.read_layers(member), &filter, cap),
        };
        let lead_id = lead.as_ref().map(|e| e.id.clone());
        let natural = natural.filter(move |ev| Some(&ev.id) != lead_id.as_ref());
        let relay = Arc::clone(self);
        let readers = readers.to_vec();
        let selected = GroupsManager::selected_groups(&filter);
        let now = now();
        Box::new(
            lead.into_iter()
                .chain(natural)
                .filter(move |ev| relay.visible(mount, ev, &readers, &selected, now)),
        )
    }

    /// Stored events matching `filter` across the mount's readable layers.
    pub fn count(&self, mount: Mount, readers: &[String], filter: &Filter) -> usize {
        let member = readers.iter().any(|r| self.is_member(r));
        match mount {
            Mount::Inbox => self.inbox.count(filter),
            _ => mount
                .read_layers(member)
                .into_iter()
                .map(|l| self.layers.get(l).count(filter))
                .sum(),
        }
    }

    /// Deliver a freshly saved event to every matching subscription.
    pub fn broadcast(&self, layer: LayerName, ev: &Event) {
        let now = now();
        for listener in self.listeners.values() {
            self.deliver(&listener, layer, ev, now);
        }
    }

    fn deliver(&self, listener: &Listener, layer: LayerName, ev: &Event, now: u64) {
        let readers = listener.authed();
        let member = readers.iter().any(|r| self.is_member(r));
        if !listener.mount.reads(layer, member) {
            return;
        }
        let mut frames = Vec::new();
        let mut revoked = Vec::new();
        for (sub, filters) in listener.subs.read().iter() {
            let Some(hit) = filters.iter().find(|f| f.matches(ev)) else {
                continue;
            };
            let selected = GroupsManager::selected_groups(hit);
            if listener.mount == Mount::Groups && !selected.is_empty() {
                if let Err(reason) = self.groups.gate(hit, &readers) {
                    revoked.push((sub.clone(), reason));
                    continue;
                }
            }
            if self.visible(listener.mount, ev, &readers, &selected, now) {
                frames.push(event_frame(sub, ev));
            }
        }
        for (sub, reason) in revoked {
            listener.unsubscribe(&sub);
            debug!(conn = listener.id, sub = %sub, "subscription re-gated: {reason}");
            frames.push(closed_frame(&sub, &reason));
        }
        for frame in frames {
            if !listener.push(frame) {
                break;
            }
        }
    }

    /// Check a NIP-42 response against the challenge sent on this connection.
    pub fn verify_auth(&self, ev: &Event, challenge: &str, now: u64) -> Verdict {
        if ev.kind != kinds::AUTH {
            return Err(Reject::invalid(format!("expected kind {}", kinds::AUTH)));
        }
        if ev.tag_value("challenge") != Some(challenge) {
            return Err(Reject::invalid("missing or incorrect challenge tag"));
        }
        let host = ev
            .tag_value("relay")
            .and_then(|r| url::Url::parse(r).ok())
            .and_then(|u| u.host_str().map(str::to_string));
        if host.as_deref() != Some(self.domain.as_str()) {
            return Err(Reject::invalid("missing or incorrect relay tag"));
        }
        if now.abs_diff(ev.created_at) > AUTH_WINDOW {
            return Err(Reject::invalid("auth event is too far from the current time"));
        }
        ev.verify()
            .map_err(|e| Reject::invalid(format!("signature verification failed: {e}")))
    }

    /// Move scheduled events that are due into `main`.
    pub fn publish_scheduled(self: &Arc<Self>, now: u64) -> usize {
        let scheduled = self.layers.get(LayerName::Scheduled);
        let due: Vec<Arc<Event>> = scheduled
            .query(&Filter::new().until(now + SCHEDULE_LEAD), usize::MAX)
            .collect();
        let main = self.layers.get(LayerName::Main);
        let mut published = 0;
        for ev in due {
            match main.store(&ev) {
                Ok(outcome) => {
                    if outcome == SaveOutcome::Saved {
                        self.paywall.observe(&ev);
                        self.broadcast(LayerName::Main, &ev);
                        published += 1;
                    }
                    if let Err(e) = scheduled.delete(&ev.id) {
                        warn!(id = %ev.id, "failed to clear scheduled event: {e}");
                    }
                }
                Err(e) => warn!(id = %ev.id, "failed to publish scheduled event: {e}"),
            }
        }
        published
    }

    /// Recompute the inbox web of trust from the current members.
    pub async fn rebuild_wot(&self) -> usize {
        let settings = self.settings();
        let members = self.membership.member_keys();
        self.wot
            .rebuild(
                &members,
                self.layers.get(LayerName::Main),
                self.fetcher.as_ref(),
                &settings.inbox.wot_relays,
                &settings.inbox.specifically_blocked,
            )
            .await
    }
}
