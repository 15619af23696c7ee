//! Closed groups: a directory of per-group state machines.
//!
//! Each group is folded from the moderation events stored in the `groups`
//! layer and guarded by its own lock. Applying an action may produce
//! follow-up events signed by the relay key: state snapshots for
//! subscribers, and the put-user/remove-user events that complete a join
//! or leave request.

pub mod action;
pub mod state;

use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

pub use action::{group_of, is_action_kind, parse, Action, ActionError, Moderation};
pub use state::{Actor, Group, GroupError, ROLE_ADMIN, ROLE_MODERATOR};

use crate::{
    error::Reject,
    event::{kinds, Event, EventTemplate, Keys},
    filter::Filter,
    shard::ShardedMap,
    storage::Layer,
};

/// Recently deleted ids refused on re-publication.
pub const DELETED_RING: usize = 128;
/// Maximum age of a moderation event, in seconds.
pub const FRESHNESS: u64 = 60;

pub(crate) fn snapshot_template(kind: u16, at: u64, group: &str) -> EventTemplate {
    EventTemplate::new(kind, at).tag(["d", group])
}

/// Replay order: by time, group creation first within a second, then by id.
pub(crate) fn replay_key(ev: &Event) -> (u64, bool, &str) {
    (ev.created_at, ev.kind != kinds::GROUP_CREATE, ev.id.as_str())
}

fn is_snapshot_kind(kind: u16) -> bool {
    (kinds::GROUP_METADATA..=kinds::GROUP_ROLES).contains(&kind)
}

/// What the relay must do after an action was applied.
#[derive(Debug, Default)]
pub struct Effects {
    /// Relay-signed actions to run through ingest.
    pub publish: Vec<Event>,
    /// Relay-signed state snapshots to store and broadcast.
    pub snapshots: Vec<Event>,
    /// Ids to remove from storage.
    pub deleted: Vec<String>,
}

pub struct GroupsManager {
    groups: ShardedMap<String, Arc<RwLock<Group>>>,
    deleted: Mutex<VecDeque<String>>,
    relay: Keys,
}

impl GroupsManager {
    pub fn new(relay: Keys) -> Self {
        Self {
            groups: ShardedMap::new(),
            deleted: Mutex::new(VecDeque::with_capacity(DELETED_RING)),
            relay,
        }
    }

    /// Rebuild every group from the events held in `layer`.
    pub fn load(relay: Keys, layer: &Layer) -> Self {
        let manager = Self::new(relay);
        let mut events: Vec<Arc<Event>> = layer.query(&Filter::new(), usize::MAX).collect();
        events.sort_by(|a, b| replay_key(a).cmp(&replay_key(b)));
        for ev in &events {
            let Some(id) = group_of(ev) else { continue };
            let group = manager.entry(id);
            let mut g = group.write();
            if is_snapshot_kind(ev.kind) {
                g.last_snapshot = g.last_snapshot.max(ev.created_at);
                continue;
            }
            if is_action_kind(ev.kind) {
                match parse(ev) {
                    Ok(m) => g.apply(ev, &m.action),
                    Err(e) => debug!(id = %ev.id, "skipping unparsable group action: {e}"),
                }
            }
            g.remember(&ev.id);
        }
        info!(groups = manager.groups.len(), events = events.len(), "groups loaded");
        manager
    }

    fn entry(&self, id: &str) -> Arc<RwLock<Group>> {
        self.groups
            .get_or_insert_with(id.to_string(), || Arc::new(RwLock::new(Group::new(id))))
    }

    /// Copy of a group's current state.
    pub fn get(&self, id: &str) -> Option<Group> {
        self.groups.get(&id.to_string()).map(|g| g.read().clone())
    }

    /// Every live group.
    pub fn directory(&self) -> Vec<Group> {
        let mut out: Vec<Group> = self
            .groups
            .values()
            .into_iter()
            .map(|g| g.read().clone())
            .filter(|g| g.exists() && !g.deleted)
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn relay_pubkey(&self) -> &str {
        self.relay.public_key()
    }

    pub fn is_recently_deleted(&self, id: &str) -> bool {
        self.deleted.lock().iter().any(|d| d == id)
    }

    fn mark_deleted(&self, ids: &[String]) {
        let mut ring = self.deleted.lock();
        for id in ids {
            if ring.len() == DELETED_RING {
                ring.pop_front();
            }
            ring.push_back(id.clone());
        }
    }

    /// Decide whether `ev` may enter the groups layer.
    pub fn admit(&self, actor: &Actor, ev: &Event, layer: &Layer, now: u64) -> Result<(), GroupError> {
        if self.is_recently_deleted(&ev.id) {
            return Err(GroupError::Deleted);
        }
        if is_snapshot_kind(ev.kind) {
            return if actor.is_relay {
                Ok(())
            } else {
                Err(GroupError::Malformed("group state is written by the relay".into()))
            };
        }
        let id = group_of(ev).ok_or_else(|| GroupError::Malformed("missing group id".into()))?;
        let group = self.get(id).unwrap_or_else(|| Group::new(id));
        if !is_action_kind(ev.kind) {
            return group.check_post(actor, ev);
        }
        let m = parse(ev).map_err(|e| GroupError::Malformed(e.to_string()))?;
        group.authorize(actor, ev, &m.action, now, FRESHNESS)?;
        if let Action::DeleteEvent(ids) = &m.action {
            if !actor.is_relay && !group.is_admin(actor.pubkey) {
                let hits_admin = ids
                    .iter()
                    .filter_map(|id| layer.get(id))
                    .any(|target| group.is_admin(&target.pubkey));
                if hits_admin {
                    return Err(GroupError::AdminOnly);
                }
            }
        }
        Ok(())
    }

    /// Fold a stored event into its group and compute the follow-ups.
    pub fn apply(&self, ev: &Event, now: u64) -> Effects {
        let mut effects = Effects::default();
        if is_snapshot_kind(ev.kind) {
            return effects;
        }
        let Some(id) = group_of(ev) else {
            return effects;
        };
        let group = self.entry(id);
        let mut g = group.write();
        g.remember(&ev.id);
        if !is_action_kind(ev.kind) {
            return effects;
        }
        let Ok(m) = parse(ev) else {
            return effects;
        };
        let was_member = g.is_member(&ev.pubkey);
        g.apply(ev, &m.action);
        match &m.action {
            Action::JoinRequest { code } if !was_member => {
                let mut tpl = EventTemplate::new(kinds::GROUP_PUT_USER, now)
                    .tag(["h", id])
                    .tag(["p", ev.pubkey.as_str()]);
                if let Some(code) = code {
                    tpl = tpl.tag(["code", code.as_str()]);
                }
                effects.publish.extend(self.sign(tpl));
            }
            Action::LeaveRequest if was_member => {
                let tpl = EventTemplate::new(kinds::GROUP_REMOVE_USER, now)
                    .tag(["h", id])
                    .tag(["p", ev.pubkey.as_str()])
                    .tag(["self-removal"]);
                effects.publish.extend(self.sign(tpl));
            }
            Action::DeleteEvent(ids) => {
                self.mark_deleted(ids);
                effects.deleted = ids.clone();
            }
            Action::CreateGroup
            | Action::DeleteGroup
            | Action::EditMetadata(_)
            | Action::PutUser(_)
            | Action::RemoveUser(_) => {
                effects.snapshots = g
                    .snapshots(now)
                    .into_iter()
                    .filter_map(|tpl| self.sign(tpl))
                    .collect();
            }
            _ => {}
        }
        if matches!(m.action, Action::DeleteGroup) {
            info!(group = %id, "group deleted");
        }
        effects
    }

    fn sign(&self, tpl: EventTemplate) -> Option<Event> {
        self.relay
            .sign(tpl)
            .map_err(|e| error!("signing group event failed: {e}"))
            .ok()
    }

    /// Reader-side visibility for one event.
    ///
    /// Groups in `selected` were already gated by [`GroupsManager::gate`].
    pub fn can_see(&self, ev: &Event, readers: &[String], selected: &BTreeSet<String>) -> bool {
        let Some(id) = group_of(ev) else { return true };
        if selected.contains(id) {
            return true;
        }
        match self.get(id) {
            Some(g) => g.visible_to(readers),
            None => true,
        }
    }

    /// Refuse subscriptions naming private groups the reader does not belong to.
    pub fn gate(&self, filter: &Filter, readers: &[String]) -> Result<(), Reject> {
        for id in Self::selected_groups(filter) {
            let Some(g) = self.get(&id) else { continue };
            if g.private && !readers.iter().any(|r| g.is_member(r)) {
                return Err(if readers.is_empty() {
                    Reject::auth_required("this group is private")
                } else {
                    Reject::restricted("you are not a member of this group")
                });
            }
        }
        Ok(())
    }

    /// Group ids the filter selects: `#h` values, and `#d` values when the
    /// filter can match group snapshots.
    pub fn selected_groups(filter: &Filter) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = filter.tag_selection("h").cloned().unwrap_or_default();
        let snapshots = filter.kinds.as_ref().map_or(true, |ks| {
            ks.iter()
                .any(|k| (kinds::GROUP_METADATA..=kinds::GROUP_ROLES).contains(k))
        });
        if snapshots {
            ids.extend(filter.tag_selection("d").into_iter().flatten().cloned());
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LayerName;
    use tempfile::TempDir;

    const NOW: u64 = 10_000;

    fn keys(n: u8) -> Keys {
        Keys::from_secret_hex(&hex::encode([n; 32])).unwrap()
    }

    fn actor<'a>(k: &'a Keys, relay: &Keys) -> Actor<'a> {
        Actor {
            pubkey: k.public_key(),
            is_relay: k.public_key() == relay.public_key(),
            is_relay_member: true,
            is_relay_admin: false,
        }
    }

    struct Fixture {
        _dir: TempDir,
        layer: Layer,
        relay: Keys,
        manager: GroupsManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let layer = Layer::open(dir.path(), LayerName::Groups).unwrap();
        let relay = keys(9);
        let manager = GroupsManager::new(relay.clone());
        Fixture {
            _dir: dir,
            layer,
            relay,
            manager,
        }
    }

    impl Fixture {
        /// Admit, store and apply, then run follow-ups the same way.
        fn submit(&self, author: &Keys, ev: Event) -> Result<Vec<Event>, GroupError> {
            self.manager
                .admit(&actor(author, &self.relay), &ev, &self.layer, NOW)?;
            self.layer.store(&ev).unwrap();
            let effects = self.manager.apply(&ev, NOW);
            let mut out = Vec::new();
            for snap in effects.snapshots {
                self.layer.store(&snap).unwrap();
                out.push(snap);
            }
            for id in effects.deleted {
                self.layer.delete(&id).unwrap();
            }
            for follow in effects.publish {
                out.extend(self.submit(&self.relay, follow)?);
            }
            Ok(out)
        }
    }

    fn action(k: &Keys, kind: u16, tags: &[&[&str]]) -> Event {
        let mut tpl = EventTemplate::new(kind, NOW - 1).tag(["h", "g1"]);
        for t in tags {
            tpl = tpl.tag(t.iter().copied());
        }
        k.sign(tpl).unwrap()
    }

    fn closed_group(fx: &Fixture, owner: &Keys) {
        fx.submit(owner, action(owner, kinds::GROUP_CREATE, &[])).unwrap();
        fx.submit(owner, action(owner, kinds::GROUP_EDIT_METADATA, &[&["closed"]]))
            .unwrap();
        fx.submit(owner, action(owner, kinds::GROUP_CREATE_INVITE, &[&["code", "alpha"]]))
            .unwrap();
    }

    #[test]
    fn join_with_code_publishes_membership() {
        let fx = fixture();
        let owner = keys(1);
        let joiner = keys(2);
        closed_group(&fx, &owner);

        let bad = action(&joiner, kinds::GROUP_JOIN_REQUEST, &[&["code", "beta"]]);
        let err = fx.submit(&joiner, bad).unwrap_err();
        assert_eq!(
            Reject::from(err).to_string(),
            "restricted: group is closed, you need an invite code"
        );

        let good = action(&joiner, kinds::GROUP_JOIN_REQUEST, &[&["code", "alpha"]]);
        let out = fx.submit(&joiner, good).unwrap();
        let members = out
            .iter()
            .find(|e| e.kind == kinds::GROUP_MEMBERS)
            .expect("members snapshot");
        assert_eq!(members.pubkey, fx.relay.public_key());
        assert!(members.tag_values("p").any(|p| p == joiner.public_key()));
        assert!(fx.manager.get("g1").unwrap().is_member(joiner.public_key()));

        let put = fx
            .layer
            .query(&Filter::new().kinds([kinds::GROUP_PUT_USER]), 10)
            .next()
            .unwrap();
        assert_eq!(put.tag_value("code"), Some("alpha"));
    }

    #[test]
    fn leave_marks_self_removal() {
        let fx = fixture();
        let owner = keys(1);
        let joiner = keys(2);
        closed_group(&fx, &owner);
        fx.submit(&joiner, action(&joiner, kinds::GROUP_JOIN_REQUEST, &[&["code", "alpha"]]))
            .unwrap();
        fx.submit(&joiner, action(&joiner, kinds::GROUP_LEAVE_REQUEST, &[]))
            .unwrap();
        let g = fx.manager.get("g1").unwrap();
        assert!(!g.is_member(joiner.public_key()));
        assert_eq!(g.removed.get(joiner.public_key()), Some(&true));
    }

    #[test]
    fn deleted_events_are_removed_and_refused() {
        let fx = fixture();
        let owner = keys(1);
        closed_group(&fx, &owner);
        let post = owner
            .sign(EventTemplate::new(9, NOW).tag(["h", "g1"]).content("hi"))
            .unwrap();
        fx.submit(&owner, post.clone()).unwrap();
        assert!(fx.layer.contains(&post.id));
        fx.submit(
            &owner,
            action(&owner, kinds::GROUP_DELETE_EVENT, &[&["e", post.id.as_str()]]),
        )
        .unwrap();
        assert!(!fx.layer.contains(&post.id));
        assert_eq!(fx.submit(&owner, post), Err(GroupError::Deleted));
    }

    #[test]
    fn outsiders_cannot_post_and_snapshots_are_relay_only() {
        let fx = fixture();
        let owner = keys(1);
        let outsider = keys(3);
        closed_group(&fx, &owner);
        let post = outsider
            .sign(EventTemplate::new(9, NOW).tag(["h", "g1"]))
            .unwrap();
        assert_eq!(fx.submit(&outsider, post), Err(GroupError::MembersOnly));
        let forged = outsider
            .sign(EventTemplate::new(kinds::GROUP_MEMBERS, NOW).tag(["d", "g1"]))
            .unwrap();
        assert!(matches!(fx.submit(&outsider, forged), Err(GroupError::Malformed(_))));
    }

    #[test]
    fn reload_rebuilds_state() {
        let fx = fixture();
        let owner = keys(1);
        let joiner = keys(2);
        closed_group(&fx, &owner);
        fx.submit(&joiner, action(&joiner, kinds::GROUP_JOIN_REQUEST, &[&["code", "alpha"]]))
            .unwrap();
        let reloaded = GroupsManager::load(fx.relay.clone(), &fx.layer);
        let g = reloaded.get("g1").unwrap();
        assert!(g.closed);
        assert!(g.is_member(joiner.public_key()));
        assert_eq!(g.invite_codes, vec!["alpha".to_string()]);
        assert!(g.last_snapshot >= NOW);
        assert_eq!(reloaded.directory().len(), 1);
    }

    #[test]
    fn private_groups_gate_and_hide() {
        let fx = fixture();
        let owner = keys(1);
        fx.submit(&owner, action(&owner, kinds::GROUP_CREATE, &[])).unwrap();
        let post = owner.sign(EventTemplate::new(9, NOW).tag(["h", "g1"])).unwrap();
        fx.submit(&owner, post.clone()).unwrap();
        assert!(fx.manager.can_see(&post, &[], &BTreeSet::new()));

        fx.submit(
            &owner,
            action(&owner, kinds::GROUP_EDIT_METADATA, &[&["private"], &["closed"]]),
        )
        .unwrap();
        assert!(!fx.manager.can_see(&post, &[], &BTreeSet::new()));
        assert!(fx
            .manager
            .can_see(&post, &[owner.public_key().to_string()], &BTreeSet::new()));

        let f = Filter::new().tag("h", ["g1"]);
        assert!(fx.manager.gate(&f, &[]).unwrap_err().wants_auth());
        let stranger = vec![keys(4).public_key().to_string()];
        assert_eq!(
            fx.manager.gate(&f, &stranger).unwrap_err().to_string(),
            "restricted: you are not a member of this group"
        );
        assert!(fx.manager.gate(&f, &[owner.public_key().to_string()]).is_ok());
        assert!(GroupsManager::selected_groups(&f).contains("g1"));
    }

    #[test]
    fn unrelated_tag_selection_does_not_reveal_private_groups() {
        let fx = fixture();
        let owner = keys(1);
        fx.submit(&owner, action(&owner, kinds::GROUP_CREATE, &[])).unwrap();
        fx.submit(
            &owner,
            action(&owner, kinds::GROUP_EDIT_METADATA, &[&["private"], &["closed"]]),
        )
        .unwrap();
        let draft = owner
            .sign(
                EventTemplate::new(30023, NOW)
                    .tag(["h", "g1"])
                    .tag(["d", "my-draft"]),
            )
            .unwrap();
        fx.submit(&owner, draft.clone()).unwrap();

        let by_d = Filter::new().tag("d", ["my-draft"]);
        assert!(fx.manager.gate(&by_d, &[]).is_ok());
        let selected = GroupsManager::selected_groups(&by_d);
        assert!(!fx.manager.can_see(&draft, &[], &selected));

        // `#d` only names groups for snapshot kinds
        let articles = Filter::new().kinds([30023]).tag("d", ["g1"]);
        assert!(GroupsManager::selected_groups(&articles).is_empty());
        let snapshots = Filter::new().kinds([kinds::GROUP_MEMBERS]).tag("d", ["g1"]);
        assert!(fx.manager.gate(&snapshots, &[]).unwrap_err().wants_auth());
    }
}
