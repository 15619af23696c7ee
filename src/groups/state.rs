//! Per-group state as the fold of its moderation actions.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::action::{Action, MetadataEdit, Moderation};
use crate::{
    error::{Prefix, Reject},
    event::{kinds, Event, EventTemplate},
};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_MODERATOR: &str = "moderator";
/// Recent ids kept for `previous` checks.
pub const RECENT: usize = 50;

/// Why a group event was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    #[error("invalid: {0}")]
    Malformed(String),
    #[error("invalid: group does not exist")]
    NoSuchGroup,
    #[error("invalid: group already exists")]
    Exists,
    #[error("restricted: only relay members can create groups")]
    NotRelayMember,
    #[error("invalid: moderation event is too old")]
    Stale,
    #[error("invalid: previous tag does not match recent events")]
    UnknownPrevious,
    #[error("restricted: group is closed, you need an invite code")]
    NeedsInvite,
    #[error("duplicate: already a member")]
    AlreadyMember,
    #[error("restricted: you were removed from this group")]
    Removed,
    #[error("invalid: not a member")]
    NotMember,
    #[error("restricted: you must be a group member to post")]
    MembersOnly,
    #[error("restricted: you have no role in this group")]
    NoRole,
    #[error("restricted: only admins can do that")]
    AdminOnly,
    #[error("invalid: nothing would change")]
    NoChange,
    #[error("invalid: {0}")]
    Visibility(&'static str),
    #[error("blocked: event was deleted")]
    Deleted,
}

impl GroupError {
    pub fn prefix(&self) -> Prefix {
        match self {
            GroupError::NotRelayMember
            | GroupError::NeedsInvite
            | GroupError::Removed
            | GroupError::MembersOnly
            | GroupError::NoRole
            | GroupError::AdminOnly => Prefix::Restricted,
            GroupError::AlreadyMember => Prefix::Duplicate,
            GroupError::Deleted => Prefix::Blocked,
            _ => Prefix::Invalid,
        }
    }
}

impl From<GroupError> for Reject {
    fn from(e: GroupError) -> Self {
        let text = e.to_string();
        let prefix = e.prefix();
        let message = text
            .strip_prefix(prefix.as_str())
            .and_then(|m| m.strip_prefix(": "))
            .unwrap_or(&text)
            .to_string();
        Reject::new(prefix, message)
    }
}

/// Who is acting and what they are allowed to do beyond the group itself.
pub struct Actor<'a> {
    pub pubkey: &'a str,
    /// The relay's own key.
    pub is_relay: bool,
    pub is_relay_member: bool,
    /// Pyramid root or relay owner.
    pub is_relay_admin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub about: String,
    pub picture: String,
    pub private: bool,
    pub closed: bool,
    pub hidden: bool,
    /// Members and their roles; an empty list is a plain member.
    pub members: BTreeMap<String, Vec<String>>,
    pub invite_codes: Vec<String>,
    /// Removed keys; `true` when they left on their own.
    pub removed: HashMap<String, bool>,
    pub recent: VecDeque<String>,
    pub created: bool,
    pub deleted: bool,
    pub last_metadata_update: u64,
    pub last_admins_update: u64,
    pub last_members_update: u64,
    /// `created_at` of the last snapshot, kept strictly increasing.
    pub last_snapshot: u64,
}

impl Group {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Fold moderation events in replay order.
    pub fn replay<'a>(id: &str, events: impl IntoIterator<Item = (&'a Event, Moderation)>) -> Self {
        let mut ordered: Vec<_> = events.into_iter().collect();
        ordered.sort_by(|(a, _), (b, _)| super::replay_key(a).cmp(&super::replay_key(b)));
        let mut group = Group::new(id);
        for (ev, m) in ordered {
            group.apply(ev, &m.action);
        }
        group
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn is_member(&self, pk: &str) -> bool {
        self.members.contains_key(pk)
    }

    pub fn has_role(&self, pk: &str) -> bool {
        self.members.get(pk).map_or(false, |r| !r.is_empty())
    }

    pub fn is_admin(&self, pk: &str) -> bool {
        self.members
            .get(pk)
            .map_or(false, |r| r.iter().any(|x| x == ROLE_ADMIN))
    }

    /// Readers who may see this group's events even though it is private or hidden.
    pub fn visible_to(&self, readers: &[String]) -> bool {
        (!self.private && !self.hidden) || readers.iter().any(|r| self.is_member(r))
    }

    pub fn remember(&mut self, id: &str) {
        if self.recent.iter().any(|r| r == id) {
            return;
        }
        if self.recent.len() == RECENT {
            self.recent.pop_front();
        }
        self.recent.push_back(id.to_string());
    }

    /// Every `previous` reference must prefix an id seen recently.
    pub fn check_previous(&self, ev: &Event) -> Result<(), GroupError> {
        for tag in ev.tags_named("previous") {
            for prefix in tag.0.iter().skip(1) {
                if prefix.is_empty()
                    || !self.recent.iter().any(|id| id.starts_with(prefix.as_str()))
                {
                    return Err(GroupError::UnknownPrevious);
                }
            }
        }
        Ok(())
    }

    /// Ordinary (non-action) posts are for members only.
    pub fn check_post(&self, actor: &Actor, ev: &Event) -> Result<(), GroupError> {
        if actor.is_relay {
            return Ok(());
        }
        if !self.exists() || self.deleted {
            return Err(GroupError::NoSuchGroup);
        }
        if !self.is_member(actor.pubkey) {
            return Err(GroupError::MembersOnly);
        }
        self.check_previous(ev)
    }

    /// Authorization and no-op checks for an action by `actor`.
    pub fn authorize(
        &self,
        actor: &Actor,
        ev: &Event,
        action: &Action,
        now: u64,
        freshness: u64,
    ) -> Result<(), GroupError> {
        if actor.is_relay {
            return Ok(());
        }
        if now.saturating_sub(ev.created_at) > freshness {
            return Err(GroupError::Stale);
        }
        if let Action::CreateGroup = action {
            if self.exists() {
                return Err(GroupError::Exists);
            }
            if !actor.is_relay_member {
                return Err(GroupError::NotRelayMember);
            }
            return Ok(());
        }
        if !self.exists() || self.deleted {
            return Err(GroupError::NoSuchGroup);
        }
        self.check_previous(ev)?;
        let pk = actor.pubkey;
        match action {
            Action::CreateGroup => Ok(()),
            Action::JoinRequest { code } => {
                if self.is_member(pk) {
                    return Err(GroupError::AlreadyMember);
                }
                if self.removed.get(pk) == Some(&false) {
                    return Err(GroupError::Removed);
                }
                if self.closed
                    && !code
                        .as_ref()
                        .map_or(false, |c| self.invite_codes.iter().any(|k| k == c))
                {
                    return Err(GroupError::NeedsInvite);
                }
                Ok(())
            }
            Action::LeaveRequest => {
                if self.is_member(pk) {
                    Ok(())
                } else {
                    Err(GroupError::NotMember)
                }
            }
            Action::DeleteGroup => {
                if actor.is_relay_admin || self.is_admin(pk) {
                    Ok(())
                } else {
                    Err(GroupError::AdminOnly)
                }
            }
            moderation => {
                if !self.has_role(pk) {
                    return Err(GroupError::NoRole);
                }
                self.authorize_moderation(pk, moderation)
            }
        }
    }

    fn authorize_moderation(&self, pk: &str, action: &Action) -> Result<(), GroupError> {
        match action {
            Action::EditMetadata(edit) => {
                if edit.is_empty() {
                    return Err(GroupError::NoChange);
                }
                self.check_visibility(edit)
            }
            Action::PutUser(users) => {
                let grants_admin = users
                    .iter()
                    .any(|(_, roles)| roles.iter().any(|r| r == ROLE_ADMIN));
                let touches_admin = users.iter().any(|(u, _)| self.is_admin(u));
                if (grants_admin || touches_admin) && !self.is_admin(pk) {
                    return Err(GroupError::AdminOnly);
                }
                let changes = users.iter().any(|(u, roles)| match self.members.get(u) {
                    None => true,
                    Some(held) => !roles.is_empty() && held != roles,
                });
                if changes {
                    Ok(())
                } else {
                    Err(GroupError::NoChange)
                }
            }
            Action::RemoveUser(users) => {
                if users.iter().any(|u| self.is_admin(u)) && !self.is_admin(pk) {
                    return Err(GroupError::AdminOnly);
                }
                if users.iter().any(|u| self.is_member(u)) {
                    Ok(())
                } else {
                    Err(GroupError::NoChange)
                }
            }
            Action::CreateInvite(code) => {
                if self.invite_codes.iter().any(|c| c == code) {
                    Err(GroupError::NoChange)
                } else {
                    Ok(())
                }
            }
            // Admin-authored targets are checked by the caller, which can see storage.
            Action::DeleteEvent(_) => Ok(()),
            _ => Ok(()),
        }
    }

    /// Private groups stay private and closed; becoming private means becoming closed.
    fn check_visibility(&self, edit: &MetadataEdit) -> Result<(), GroupError> {
        if self.private {
            if edit.private == Some(false) {
                return Err(GroupError::Visibility("a private group cannot become public"));
            }
            if edit.closed == Some(false) {
                return Err(GroupError::Visibility("a private group cannot be opened"));
            }
        }
        if edit.private == Some(true) && !edit.closed.unwrap_or(self.closed) {
            return Err(GroupError::Visibility("a private group must be closed"));
        }
        Ok(())
    }

    /// Apply an action unconditionally.
    pub fn apply(&mut self, ev: &Event, action: &Action) {
        let at = ev.created_at;
        match action {
            Action::CreateGroup => {
                if self.created && !self.deleted {
                    return;
                }
                *self = Group::new(self.id.clone());
                self.created = true;
                self.name = self.id.clone();
                self.members.insert(ev.pubkey.clone(), vec![ROLE_ADMIN.to_string()]);
                self.last_metadata_update = at;
                self.last_admins_update = at;
                self.last_members_update = at;
            }
            _ if !self.created || self.deleted => return,
            Action::DeleteGroup => {
                let id = self.id.clone();
                let last_snapshot = self.last_snapshot;
                *self = Group::new(id);
                self.created = true;
                self.deleted = true;
                self.private = true;
                self.closed = true;
                self.hidden = true;
                self.last_snapshot = last_snapshot;
                self.last_metadata_update = at;
                self.last_admins_update = at;
                self.last_members_update = at;
            }
            Action::EditMetadata(edit) => {
                if let Some(v) = &edit.name {
                    self.name = v.clone();
                }
                if let Some(v) = &edit.about {
                    self.about = v.clone();
                }
                if let Some(v) = &edit.picture {
                    self.picture = v.clone();
                }
                if let Some(v) = edit.private {
                    self.private = v;
                }
                if let Some(v) = edit.closed {
                    self.closed = v;
                }
                if let Some(v) = edit.hidden {
                    self.hidden = v;
                }
                self.last_metadata_update = at;
            }
            Action::PutUser(users) => {
                for (pk, roles) in users {
                    let held = self.members.entry(pk.clone()).or_default();
                    if !roles.is_empty() {
                        *held = roles.clone();
                    }
                    self.removed.remove(pk);
                }
                self.last_members_update = at;
                self.last_admins_update = at;
            }
            Action::RemoveUser(users) => {
                let self_removal = ev.has_tag("self-removal");
                for pk in users {
                    if self.members.remove(pk).is_some() {
                        self.removed.insert(pk.clone(), self_removal);
                    }
                }
                self.last_members_update = at;
                self.last_admins_update = at;
            }
            Action::CreateInvite(code) => {
                if !self.invite_codes.contains(code) {
                    self.invite_codes.push(code.clone());
                }
            }
            Action::DeleteEvent(ids) => {
                self.recent.retain(|r| !ids.contains(r));
            }
            Action::JoinRequest { .. } | Action::LeaveRequest => {}
        }
    }

    fn next_snapshot_at(&mut self, now: u64) -> u64 {
        self.last_snapshot = now.max(self.last_snapshot + 1);
        self.last_snapshot
    }

    /// Unsigned snapshot events: metadata, admins, members, roles.
    pub fn snapshots(&mut self, now: u64) -> Vec<EventTemplate> {
        let at = self.next_snapshot_at(now);
        let id = self.id.as_str();
        let mut meta = super::snapshot_template(kinds::GROUP_METADATA, at, id);
        if !self.deleted {
            meta = meta
                .tag(["name", self.name.as_str()])
                .tag(["about", self.about.as_str()])
                .tag(["picture", self.picture.as_str()]);
        }
        meta = meta
            .tag([if self.private { "private" } else { "public" }])
            .tag([if self.closed { "closed" } else { "open" }]);
        if self.hidden {
            meta = meta.tag(["hidden"]);
        }

        let mut admins = super::snapshot_template(kinds::GROUP_ADMINS, at, id);
        let mut members = super::snapshot_template(kinds::GROUP_MEMBERS, at, id);
        for (pk, roles) in &self.members {
            if !roles.is_empty() {
                let tag = ["p".to_string(), pk.clone()]
                    .into_iter()
                    .chain(roles.iter().cloned());
                admins = admins.tag(tag);
            }
            members = members.tag(["p", pk.as_str()]);
        }

        let roles = super::snapshot_template(kinds::GROUP_ROLES, at, id)
            .tag(["role", ROLE_ADMIN, "can do everything"])
            .tag(["role", ROLE_MODERATOR, "can moderate members and posts"]);
        vec![meta, admins, members, roles]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::Keys,
        groups::action::parse,
    };
    use proptest::prelude::*;

    fn keys(n: u8) -> Keys {
        Keys::from_secret_hex(&hex::encode([n; 32])).unwrap()
    }

    fn member_actor(k: &Keys) -> Actor<'_> {
        Actor {
            pubkey: k.public_key(),
            is_relay: false,
            is_relay_member: true,
            is_relay_admin: false,
        }
    }

    fn ev(k: &Keys, kind: u16, at: u64, tags: &[&[&str]]) -> Event {
        let mut tpl = EventTemplate::new(kind, at).tag(["h", "g1"]);
        for t in tags {
            tpl = tpl.tag(t.iter().copied());
        }
        k.sign(tpl).unwrap()
    }

    fn run(g: &mut Group, actor: &Actor, e: &Event) -> Result<(), GroupError> {
        let m = parse(e).map_err(|err| GroupError::Malformed(err.to_string()))?;
        g.authorize(actor, e, &m.action, e.created_at, 60)?;
        g.apply(e, &m.action);
        g.remember(&e.id);
        Ok(())
    }

    fn closed_group(owner: &Keys) -> Group {
        let mut g = Group::new("g1");
        run(&mut g, &member_actor(owner), &ev(owner, kinds::GROUP_CREATE, 10, &[])).unwrap();
        run(
            &mut g,
            &member_actor(owner),
            &ev(owner, kinds::GROUP_EDIT_METADATA, 11, &[&["closed"]]),
        )
        .unwrap();
        run(
            &mut g,
            &member_actor(owner),
            &ev(owner, kinds::GROUP_CREATE_INVITE, 12, &[&["code", "alpha"]]),
        )
        .unwrap();
        g
    }

    #[test]
    fn creator_is_admin() {
        let owner = keys(1);
        let g = closed_group(&owner);
        assert!(g.is_admin(owner.public_key()));
        assert!(g.closed);
        assert_eq!(g.invite_codes, vec!["alpha".to_string()]);
    }

    #[test]
    fn join_needs_matching_code() {
        let owner = keys(1);
        let joiner = keys(2);
        let mut g = closed_group(&owner);
        let mut outsider = member_actor(&joiner);
        outsider.is_relay_member = false;
        let bad = ev(&joiner, kinds::GROUP_JOIN_REQUEST, 20, &[&["code", "beta"]]);
        let err = run(&mut g, &outsider, &bad).unwrap_err();
        assert_eq!(err, GroupError::NeedsInvite);
        assert_eq!(
            Reject::from(err).to_string(),
            "restricted: group is closed, you need an invite code"
        );
        let good = ev(&joiner, kinds::GROUP_JOIN_REQUEST, 21, &[&["code", "alpha"]]);
        assert!(run(&mut g, &outsider, &good).is_ok());
    }

    #[test]
    fn removed_users_cannot_rejoin_unless_they_left() {
        let owner = keys(1);
        let (a, b) = (keys(2), keys(3));
        let mut g = closed_group(&owner);
        let admin = member_actor(&owner);
        let put = ev(
            &owner,
            kinds::GROUP_PUT_USER,
            20,
            &[&["p", a.public_key()], &["p", b.public_key()]],
        );
        run(&mut g, &admin, &put).unwrap();
        assert_eq!(run(&mut g, &admin, &put), Err(GroupError::NoChange));

        let kick = ev(&owner, kinds::GROUP_REMOVE_USER, 21, &[&["p", a.public_key()]]);
        run(&mut g, &admin, &kick).unwrap();
        let left = ev(
            &owner,
            kinds::GROUP_REMOVE_USER,
            22,
            &[&["p", b.public_key()], &["self-removal"]],
        );
        run(&mut g, &admin, &left).unwrap();

        let rejoin_a = ev(&a, kinds::GROUP_JOIN_REQUEST, 23, &[&["code", "alpha"]]);
        assert_eq!(run(&mut g, &member_actor(&a), &rejoin_a), Err(GroupError::Removed));
        let rejoin_b = ev(&b, kinds::GROUP_JOIN_REQUEST, 24, &[&["code", "alpha"]]);
        assert!(run(&mut g, &member_actor(&b), &rejoin_b).is_ok());
    }

    #[test]
    fn roles_gate_moderation() {
        let owner = keys(1);
        let (mod_key, plain) = (keys(2), keys(3));
        let mut g = closed_group(&owner);
        let admin = member_actor(&owner);
        run(
            &mut g,
            &admin,
            &ev(
                &owner,
                kinds::GROUP_PUT_USER,
                20,
                &[&["p", mod_key.public_key(), ROLE_MODERATOR], &["p", plain.public_key()]],
            ),
        )
        .unwrap();
        let by_plain = ev(&plain, kinds::GROUP_CREATE_INVITE, 21, &[&["code", "x"]]);
        assert_eq!(run(&mut g, &member_actor(&plain), &by_plain), Err(GroupError::NoRole));
        let by_mod = ev(&mod_key, kinds::GROUP_CREATE_INVITE, 22, &[&["code", "x"]]);
        assert!(run(&mut g, &member_actor(&mod_key), &by_mod).is_ok());
        let promote = ev(
            &mod_key,
            kinds::GROUP_PUT_USER,
            23,
            &[&["p", plain.public_key(), ROLE_ADMIN]],
        );
        assert_eq!(run(&mut g, &member_actor(&mod_key), &promote), Err(GroupError::AdminOnly));
        let delete = ev(&mod_key, kinds::GROUP_DELETE, 24, &[]);
        assert_eq!(run(&mut g, &member_actor(&mod_key), &delete), Err(GroupError::AdminOnly));
        let delete = ev(&owner, kinds::GROUP_DELETE, 25, &[]);
        run(&mut g, &admin, &delete).unwrap();
        assert!(g.deleted && g.private && g.closed && g.members.is_empty());
    }

    #[test]
    fn private_groups_stay_private() {
        let owner = keys(1);
        let admin = member_actor(&owner);
        let mut g = Group::new("g1");
        run(&mut g, &admin, &ev(&owner, kinds::GROUP_CREATE, 10, &[])).unwrap();
        let open_private = ev(&owner, kinds::GROUP_EDIT_METADATA, 11, &[&["private"], &["open"]]);
        assert!(matches!(run(&mut g, &admin, &open_private), Err(GroupError::Visibility(_))));
        let private = ev(&owner, kinds::GROUP_EDIT_METADATA, 12, &[&["private"], &["closed"]]);
        run(&mut g, &admin, &private).unwrap();
        let public = ev(&owner, kinds::GROUP_EDIT_METADATA, 13, &[&["public"]]);
        assert!(matches!(run(&mut g, &admin, &public), Err(GroupError::Visibility(_))));
        assert!(!g.visible_to(&[]));
        assert!(g.visible_to(&[owner.public_key().to_string()]));
    }

    #[test]
    fn far_future_timestamps_are_not_stale() {
        let owner = keys(1);
        let joiner = keys(2);
        let g = closed_group(&owner);
        let join = ev(&joiner, kinds::GROUP_JOIN_REQUEST, u64::MAX - 1, &[&["code", "alpha"]]);
        let m = parse(&join).unwrap();
        assert!(g.authorize(&member_actor(&joiner), &join, &m.action, 1000, 60).is_ok());
    }

    #[test]
    fn stale_and_unordered_events_rejected() {
        let owner = keys(1);
        let admin = member_actor(&owner);
        let mut g = closed_group(&owner);
        let old = ev(&owner, kinds::GROUP_CREATE_INVITE, 12, &[&["code", "late"]]);
        let m = parse(&old).unwrap();
        assert_eq!(g.authorize(&admin, &old, &m.action, 1000, 60), Err(GroupError::Stale));

        let known = g.recent.back().unwrap().clone();
        let ok = ev(
            &owner,
            kinds::GROUP_CREATE_INVITE,
            30,
            &[&["code", "b"], &["previous", &known[..8]]],
        );
        assert!(run(&mut g, &admin, &ok).is_ok());
        let bad = ev(
            &owner,
            kinds::GROUP_CREATE_INVITE,
            31,
            &[&["code", "c"], &["previous", "ffffffff"]],
        );
        assert_eq!(run(&mut g, &admin, &bad), Err(GroupError::UnknownPrevious));
    }

    #[test]
    fn relay_key_bypasses_checks() {
        let owner = keys(1);
        let relay = keys(9);
        let mut g = closed_group(&owner);
        let joiner = keys(2);
        let put = ev(&relay, kinds::GROUP_PUT_USER, 1, &[&["p", joiner.public_key()]]);
        let actor = Actor {
            pubkey: relay.public_key(),
            is_relay: true,
            is_relay_member: true,
            is_relay_admin: true,
        };
        run(&mut g, &actor, &put).unwrap();
        assert!(g.is_member(joiner.public_key()));
    }

    #[test]
    fn snapshots_list_members_and_admins() {
        let owner = keys(1);
        let joiner = keys(2);
        let mut g = closed_group(&owner);
        run(
            &mut g,
            &member_actor(&owner),
            &ev(&owner, kinds::GROUP_PUT_USER, 20, &[&["p", joiner.public_key()]]),
        )
        .unwrap();
        let snaps = g.snapshots(100);
        assert_eq!(snaps.len(), 4);
        let relay = keys(9);
        let members = relay.sign(snaps[2].clone()).unwrap();
        assert_eq!(members.kind, kinds::GROUP_MEMBERS);
        assert_eq!(members.d_tag(), "g1");
        assert!(members.tag_values("p").any(|p| p == joiner.public_key()));
        let admins = relay.sign(snaps[1].clone()).unwrap();
        assert_eq!(admins.tag_values("p").count(), 1);
        let again = g.snapshots(100);
        let later = relay.sign(again[0].clone()).unwrap();
        assert_eq!(later.created_at, 101);
    }

    fn arb_history() -> impl Strategy<Value = Vec<(u8, u8, u8)>> {
        prop::collection::vec((0u8..4, 1u8..5, 0u8..3), 0..20)
    }

    proptest! {
        #[test]
        fn replay_order_does_not_matter(history in arb_history(), seed in any::<u64>()) {
            let owner = keys(1);
            let mut events = vec![ev(&owner, kinds::GROUP_CREATE, 1, &[])];
            for (i, (op, target, role)) in history.iter().enumerate() {
                let at = 2 + (i as u64 % 5);
                let target = keys(*target + 1);
                let role = [ROLE_ADMIN, ROLE_MODERATOR, ""][*role as usize];
                let e = match op {
                    0 => ev(&owner, kinds::GROUP_PUT_USER, at, &[&["p", target.public_key(), role]]),
                    1 => ev(&owner, kinds::GROUP_REMOVE_USER, at, &[&["p", target.public_key()]]),
                    2 => ev(&owner, kinds::GROUP_CREATE_INVITE, at, &[&["code", role]]),
                    _ => ev(&owner, kinds::GROUP_EDIT_METADATA, at, &[&["name", role]]),
                };
                events.push(e);
            }
            let parsed: Vec<(Event, Moderation)> = events
                .iter()
                .filter_map(|e| parse(e).ok().map(|m| (e.clone(), m)))
                .collect();
            let forward = Group::replay("g1", parsed.iter().map(|(e, m)| (e, m.clone())));
            let mut shuffled = parsed.clone();
            let n = shuffled.len();
            for i in 0..n {
                let j = ((seed >> (i % 64)) as usize ^ i.wrapping_mul(31)) % n;
                shuffled.swap(i, j);
            }
            let reordered = Group::replay("g1", shuffled.iter().map(|(e, m)| (e, m.clone())));
            prop_assert_eq!(forward, reordered);
        }
    }
}
