//! Promotion of well-received events into the `popular` and `topmost` layers.
//!
//! Every saved event that can be a reaction triggers a tally over the last
//! week of `main`: each referenced target collects the distinct keys that
//! reacted to it. Targets reaching the configured quorum are resolved (locally,
//! or from relay hints) and copied into the curated layers.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use tracing::{debug, error, info};

use crate::{
    config::RelaySettings,
    event::{is_hex64, kinds, Event},
    fetcher::EventFetcher,
    filter::Filter,
    membership::Membership,
    nip19::{self, Pointer},
    storage::{LayerName, Layers, SaveOutcome},
    zap,
};

/// Kinds counted as reactions.
pub const REACTION_KINDS: [u16; 7] = [
    kinds::TEXT_NOTE,
    kinds::REPOST,
    kinds::REACTION,
    kinds::COMMENT,
    kinds::NUTZAP,
    kinds::ZAP_RECEIPT,
    kinds::HIGHLIGHT,
];
/// Reaction kinds that do not count toward `topmost`.
const TEXT_REACTIONS: [u16; 2] = [kinds::TEXT_NOTE, kinds::COMMENT];
/// Reaction contents read as disapproval.
const DISSENT: [&str; 2] = ["⚠️", "-"];
/// Curation is off at or below this many members.
pub const MIN_MEMBERS: usize = 10;
/// Reactions older than this are not counted.
pub const WINDOW_SECS: u64 = 7 * 24 * 3600;
/// Relay hints tried per trigger, across all targets.
pub const MAX_HINTS: usize = 32;
/// Reactions read per target.
const SCAN_CAP: usize = 5_000;
const REFERENCE_TAGS: [&str; 3] = ["e", "a", "q"];

/// Something a reaction points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Id(String),
    /// `kind:pubkey:d`
    Address(String),
}

impl Target {
    fn parse(value: &str) -> Option<Self> {
        if is_hex64(value) {
            return Some(Target::Id(value.to_string()));
        }
        parse_address(value).map(|_| Target::Address(value.to_string()))
    }

    fn value(&self) -> &str {
        match self {
            Target::Id(v) | Target::Address(v) => v,
        }
    }

    fn filter(&self) -> Option<Filter> {
        match self {
            Target::Id(id) => Some(Filter::new().ids([id.clone()])),
            Target::Address(a) => {
                let (kind, author, d) = parse_address(a)?;
                Some(
                    Filter::new()
                        .kinds([kind])
                        .authors([author])
                        .tag("d", [d])
                        .limit(1),
                )
            }
        }
    }

    fn author_hint(&self) -> Option<&str> {
        match self {
            Target::Id(_) => None,
            Target::Address(a) => parse_address(a).map(|(_, author, _)| author),
        }
    }
}

fn parse_address(a: &str) -> Option<(u16, &str, &str)> {
    let mut parts = a.splitn(3, ':');
    let kind = parts.next()?.parse().ok()?;
    let author = parts.next()?;
    let d = parts.next()?;
    is_hex64(author).then_some((kind, author, d))
}

/// Targets referenced through `e`, `a` and `q` tags.
pub fn targets_of(ev: &Event) -> BTreeSet<Target> {
    let mut out = BTreeSet::new();
    for t in &ev.tags {
        let Some(v) = t.value() else { continue };
        let parsed = match t.name() {
            "e" => is_hex64(v).then(|| Target::Id(v.to_string())),
            "a" => parse_address(v).map(|_| Target::Address(v.to_string())),
            "q" => Target::parse(v),
            _ => None,
        };
        out.extend(parsed);
    }
    out
}

/// The event whose author casts the vote; zap receipts vote for their requester.
fn voting_event(reaction: &Event) -> Option<Event> {
    if reaction.kind == kinds::ZAP_RECEIPT {
        zap::embedded_request(reaction)
    } else {
        Some(reaction.clone())
    }
}

fn is_dissent(content: &str) -> bool {
    DISSENT.contains(&content.trim())
}

/// Distinct voters per target.
#[derive(Debug, Default)]
pub struct Tally {
    pub popular: HashMap<Target, HashSet<String>>,
    pub topmost: HashMap<Target, HashSet<String>>,
    /// Reactions read, kept for hint extraction.
    reactions: Vec<Arc<Event>>,
}

impl Tally {
    fn count(&mut self, reaction: Arc<Event>) {
        let Some(voter) = voting_event(&reaction) else {
            return;
        };
        if is_dissent(&voter.content) {
            return;
        }
        let counts_for_topmost = !TEXT_REACTIONS.contains(&reaction.kind);
        for target in targets_of(&voter) {
            if counts_for_topmost {
                self.topmost
                    .entry(target.clone())
                    .or_default()
                    .insert(voter.pubkey.clone());
            }
            self.popular
                .entry(target)
                .or_default()
                .insert(voter.pubkey.clone());
        }
        self.reactions.push(reaction);
    }

    pub fn votes(&self, target: &Target) -> (usize, usize) {
        (
            self.popular.get(target).map_or(0, HashSet::len),
            self.topmost.get(target).map_or(0, HashSet::len),
        )
    }
}

/// Read the last week of reactions to every target `trigger` references.
pub fn tally(layers: &Layers, trigger: &Event, now: u64) -> Tally {
    let main = layers.get(LayerName::Main);
    let since = now.saturating_sub(WINDOW_SECS);
    let mut seen = HashSet::new();
    let mut tally = Tally::default();
    let source = voting_event(trigger).unwrap_or_else(|| trigger.clone());
    for target in targets_of(&source) {
        let names: &[&str] = match target {
            Target::Id(_) => &["e", "q"],
            Target::Address(_) => &["a", "q"],
        };
        for name in names {
            let f = Filter::new()
                .kinds(REACTION_KINDS)
                .tag(name, [target.value()])
                .since(since);
            for reaction in main.query(&f, SCAN_CAP) {
                if seen.insert(reaction.id.clone()) {
                    tally.count(reaction);
                }
            }
        }
    }
    tally
}

/// Event carries, or reposts, a protected event.
fn is_protected_deep(ev: &Event) -> bool {
    if ev.is_protected() {
        return true;
    }
    matches!(ev.kind, kinds::REPOST | kinds::GENERIC_REPOST)
        && serde_json::from_str::<Event>(&ev.content)
            .map(|inner| inner.is_protected())
            .unwrap_or(false)
}

/// Copies well-received events into the curated layers.
pub struct Curator {
    layers: Layers,
    membership: Arc<Membership>,
    fetcher: Arc<dyn EventFetcher>,
}

impl Curator {
    pub fn new(layers: Layers, membership: Arc<Membership>, fetcher: Arc<dyn EventFetcher>) -> Self {
        Self {
            layers,
            membership,
            fetcher,
        }
    }

    /// Run the promotion pass for a freshly saved event.
    ///
    /// Returns the events newly written to `popular` or `topmost`.
    pub async fn on_saved(
        &self,
        settings: &RelaySettings,
        trigger: &Event,
        now: u64,
    ) -> Vec<(LayerName, Event)> {
        if !REACTION_KINDS.contains(&trigger.kind) {
            return Vec::new();
        }
        let members = self.membership.member_count();
        if members <= MIN_MEMBERS {
            return Vec::new();
        }
        let popular_needed = settings.popular.threshold(members) as usize;
        let topmost_needed = settings.topmost.threshold(members) as usize;
        let tally = tally(&self.layers, trigger, now);

        let mut budget = MAX_HINTS;
        let mut tried_hints: HashSet<String> = HashSet::new();
        let mut promoted = Vec::new();
        let mut candidates: Vec<&Target> = tally.popular.keys().collect();
        candidates.sort();
        for target in candidates {
            let (popular_votes, topmost_votes) = tally.votes(target);
            if popular_votes < popular_needed {
                continue;
            }
            let wants_topmost = topmost_votes >= topmost_needed;
            if self.already_promoted(target, wants_topmost) {
                continue;
            }
            let Some(ev) = self
                .resolve(target, &tally, &mut budget, &mut tried_hints)
                .await
            else {
                debug!(target = target.value(), "could not resolve promoted target");
                continue;
            };
            if is_protected_deep(&ev) {
                continue;
            }
            let mut layers = vec![LayerName::Popular];
            if wants_topmost {
                layers.push(LayerName::Topmost);
            }
            for name in layers {
                match self.layers.get(name).store(&ev) {
                    Ok(SaveOutcome::Saved) => {
                        info!(layer = %name, id = %ev.id, popular_votes, topmost_votes, "promoted");
                        promoted.push((name, ev.clone()));
                    }
                    Ok(_) => {}
                    Err(e) => error!(layer = %name, id = %ev.id, "promotion failed: {e}"),
                }
            }
        }
        promoted
    }

    fn already_promoted(&self, target: &Target, wants_topmost: bool) -> bool {
        let has = |name: LayerName| {
            let layer = self.layers.get(name);
            match target {
                Target::Id(id) => layer.contains(id),
                Target::Address(a) => layer.get_latest(a).is_some(),
            }
        };
        has(LayerName::Popular) && (!wants_topmost || has(LayerName::Topmost))
    }

    async fn resolve(
        &self,
        target: &Target,
        tally: &Tally,
        budget: &mut usize,
        tried: &mut HashSet<String>,
    ) -> Option<Event> {
        let main = self.layers.get(LayerName::Main);
        let local = match target {
            Target::Id(id) => main.get(id),
            Target::Address(a) => main.get_latest(a),
        };
        if let Some(ev) = local {
            return Some((*ev).clone());
        }
        let hints: Vec<String> = self
            .hints(target, tally)
            .into_iter()
            .filter(|h| !tried.contains(h))
            .take(*budget)
            .collect();
        if hints.is_empty() {
            return None;
        }
        *budget -= hints.len();
        tried.extend(hints.iter().cloned());
        let filter = target.filter()?;
        self.fetcher
            .fetch(&hints, &filter)
            .await
            .into_iter()
            .filter(|ev| match target {
                Target::Id(id) => ev.id == *id,
                Target::Address(a) => ev.address() == *a,
            })
            .max_by_key(|ev| ev.created_at)
    }

    /// Relay URLs that may hold `target`, deduplicated in discovery order.
    fn hints(&self, target: &Target, tally: &Tally) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut authors: Vec<String> = target.author_hint().map(str::to_string).into_iter().collect();
        let push = |url: &str, out: &mut Vec<String>| {
            let url = url.trim();
            if (url.starts_with("wss://") || url.starts_with("ws://"))
                && !out.iter().any(|u| u == url)
            {
                out.push(url.to_string());
            }
        };
        for reaction in &tally.reactions {
            let Some(voter) = voting_event(reaction) else { continue };
            for tag in voter.tags.iter().filter(|t| REFERENCE_TAGS.contains(&t.name())) {
                if tag.value() != Some(target.value()) {
                    continue;
                }
                if let Some(relay) = tag.get(2) {
                    push(relay, &mut out);
                }
                if let Some(pk) = tag.get(4).or_else(|| tag.get(3)).filter(|pk| is_hex64(pk)) {
                    authors.push(pk.to_string());
                }
            }
            for pointer in nip19::references(&voter.content) {
                let matches = match (&pointer, target) {
                    (Pointer::Event { id, author, .. }, Target::Id(t)) if id == t => {
                        authors.extend(author.clone());
                        true
                    }
                    (
                        Pointer::Address {
                            kind,
                            author,
                            identifier,
                            ..
                        },
                        Target::Address(t),
                    ) => format!("{kind}:{author}:{identifier}") == *t,
                    _ => false,
                };
                if matches {
                    for relay in pointer.relays() {
                        push(relay, &mut out);
                    }
                }
            }
        }
        for author in authors {
            for relay in self.outbox_relays(&author) {
                push(&relay, &mut out);
            }
        }
        out
    }

    /// Write relays from the author's relay list, when we hold it.
    fn outbox_relays(&self, author: &str) -> Vec<String> {
        let key = format!("{}:{}", kinds::RELAY_LIST, author);
        let Some(list) = self.layers.get(LayerName::Main).get_latest(&key) else {
            return Vec::new();
        };
        list.tags_named("r")
            .filter(|t| t.get(2).map_or(true, |m| m == "write"))
            .filter_map(|t| t.value().map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{EventTemplate, Keys},
        fetcher::MemoryFetcher,
        membership::{ActionType, ABSOLUTE_ROOT},
    };
    use tempfile::TempDir;

    const NOW: u64 = 1_700_000_000;

    struct Fixture {
        _dir: TempDir,
        layers: Layers,
        fetcher: Arc<MemoryFetcher>,
        curator: Curator,
        members: Vec<Keys>,
        settings: RelaySettings,
    }

    fn fixture(member_count: u8) -> Fixture {
        let dir = TempDir::new().unwrap();
        let layers = Layers::open(dir.path()).unwrap();
        let membership =
            Arc::new(Membership::load(dir.path().join("management.jsonl"), 4).unwrap());
        let members: Vec<Keys> = (1..=member_count)
            .map(|n| Keys::from_secret_hex(&hex::encode([n; 32])).unwrap())
            .collect();
        for k in &members {
            membership
                .add_action(ActionType::Invite, ABSOLUTE_ROOT, k.public_key())
                .unwrap();
        }
        let fetcher = Arc::new(MemoryFetcher::default());
        let curator = Curator::new(layers.clone(), membership, fetcher.clone());
        Fixture {
            _dir: dir,
            layers,
            fetcher,
            curator,
            members,
            settings: RelaySettings::default(),
        }
    }

    fn react(k: &Keys, target: &Event, content: &str, at: u64) -> Event {
        k.sign(
            EventTemplate::new(kinds::REACTION, at)
                .tag(["e", target.id.as_str()])
                .content(content),
        )
        .unwrap()
    }

    impl Fixture {
        fn main_save(&self, ev: &Event) {
            self.layers.get(LayerName::Main).store(ev).unwrap();
        }
    }

    #[tokio::test]
    async fn two_reactions_promote_to_popular() {
        let fx = fixture(20);
        let target = fx.members[0]
            .sign(EventTemplate::new(1, NOW - 100).content("hello"))
            .unwrap();
        fx.main_save(&target);
        let r1 = react(&fx.members[1], &target, "+", NOW - 50);
        fx.main_save(&r1);
        assert!(fx.curator.on_saved(&fx.settings, &r1, NOW).await.is_empty());

        let r2 = react(&fx.members[2], &target, "🤙", NOW - 40);
        fx.main_save(&r2);
        let promoted = fx.curator.on_saved(&fx.settings, &r2, NOW).await;
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].0, LayerName::Popular);
        let got: Vec<_> = fx
            .layers
            .get(LayerName::Popular)
            .query(&Filter::new().ids([target.id.clone()]), 10)
            .collect();
        assert_eq!(got.len(), 1);
        assert!(!fx.layers.get(LayerName::Topmost).contains(&target.id));

        let r3 = react(&fx.members[3], &target, "+", NOW - 30);
        fx.main_save(&r3);
        let promoted = fx.curator.on_saved(&fx.settings, &r3, NOW).await;
        assert_eq!(promoted, vec![(LayerName::Topmost, target.clone())]);
    }

    #[tokio::test]
    async fn zero_threshold_promotes_on_first_vote() {
        let mut fx = fixture(20);
        fx.settings.popular.percent = 0;
        fx.settings.topmost.percent = 0;
        assert_eq!(fx.settings.popular.threshold(20), 0);
        let target = fx.members[0].sign(EventTemplate::new(1, NOW - 100)).unwrap();
        fx.main_save(&target);
        let r = react(&fx.members[1], &target, "+", NOW - 10);
        fx.main_save(&r);
        let promoted = fx.curator.on_saved(&fx.settings, &r, NOW).await;
        assert_eq!(
            promoted,
            vec![
                (LayerName::Popular, target.clone()),
                (LayerName::Topmost, target.clone())
            ]
        );
    }

    #[tokio::test]
    async fn small_relays_do_not_curate() {
        let fx = fixture(10);
        let target = fx.members[0].sign(EventTemplate::new(1, NOW - 100)).unwrap();
        fx.main_save(&target);
        for k in &fx.members[1..5] {
            let r = react(k, &target, "+", NOW - 10);
            fx.main_save(&r);
            assert!(fx.curator.on_saved(&fx.settings, &r, NOW).await.is_empty());
        }
    }

    #[tokio::test]
    async fn dissent_and_replies_are_weighed() {
        let fx = fixture(20);
        let target = fx.members[0].sign(EventTemplate::new(1, NOW - 100)).unwrap();
        fx.main_save(&target);
        let r1 = react(&fx.members[1], &target, "-", NOW - 50);
        let r2 = react(&fx.members[2], &target, "⚠️", NOW - 40);
        let reply = fx.members[3]
            .sign(EventTemplate::new(1, NOW - 30).tag(["e", target.id.as_str()]).content("nice"))
            .unwrap();
        let old = react(&fx.members[4], &target, "+", NOW - WINDOW_SECS - 10);
        for ev in [&r1, &r2, &reply, &old] {
            fx.main_save(ev);
        }
        let tally = tally(&fx.layers, &reply, NOW);
        assert_eq!(tally.votes(&Target::Id(target.id.clone())), (1, 0));
    }

    #[tokio::test]
    async fn zap_receipts_vote_for_the_requester() {
        let fx = fixture(20);
        let target = fx.members[0].sign(EventTemplate::new(1, NOW - 100)).unwrap();
        fx.main_save(&target);
        let zapper = Keys::generate();
        for k in &fx.members[1..3] {
            let req = k
                .sign(EventTemplate::new(kinds::ZAP_REQUEST, NOW - 20).tag(["e", target.id.as_str()]))
                .unwrap();
            let receipt = zapper
                .sign(
                    EventTemplate::new(kinds::ZAP_RECEIPT, NOW - 10)
                        .tag(["e", target.id.as_str()])
                        .tag(["description", serde_json::to_string(&req).unwrap().as_str()]),
                )
                .unwrap();
            fx.main_save(&receipt);
        }
        let trigger = fx.members[5]
            .sign(EventTemplate::new(kinds::REACTION, NOW).tag(["e", target.id.as_str()]).content("-"))
            .unwrap();
        let t = tally(&fx.layers, &trigger, NOW);
        assert_eq!(t.votes(&Target::Id(target.id.clone())), (2, 2));
    }

    #[tokio::test]
    async fn remote_targets_resolved_through_hints() {
        let fx = fixture(20);
        let outsider = Keys::generate();
        let remote = outsider.sign(EventTemplate::new(1, NOW - 500)).unwrap();
        fx.fetcher.push(remote.clone());
        let mut last = None;
        for k in &fx.members[1..3] {
            let r = k
                .sign(
                    EventTemplate::new(kinds::REACTION, NOW - 10)
                        .tag(["e", remote.id.as_str(), "wss://elsewhere.example"]),
                )
                .unwrap();
            fx.main_save(&r);
            last = Some(r);
        }
        let promoted = fx.curator.on_saved(&fx.settings, &last.unwrap(), NOW).await;
        assert_eq!(promoted, vec![(LayerName::Popular, remote.clone())]);
    }

    #[tokio::test]
    async fn protected_targets_are_skipped() {
        let fx = fixture(20);
        let target = fx.members[0]
            .sign(EventTemplate::new(1, NOW - 100).tag(["-"]))
            .unwrap();
        fx.main_save(&target);
        let mut last = None;
        for k in &fx.members[1..4] {
            let r = react(k, &target, "+", NOW - 10);
            fx.main_save(&r);
            last = Some(r);
        }
        assert!(fx
            .curator
            .on_saved(&fx.settings, &last.unwrap(), NOW)
            .await
            .is_empty());
    }

    #[test]
    fn targets_from_tags() {
        let k = Keys::generate();
        let addr = format!("30023:{}:slug", k.public_key());
        let ev = k
            .sign(
                EventTemplate::new(1, 1)
                    .tag(["e", "ab".repeat(32).as_str()])
                    .tag(["a", addr.as_str()])
                    .tag(["q", "cd".repeat(32).as_str()])
                    .tag(["e", "short"]),
            )
            .unwrap();
        let t = targets_of(&ev);
        assert_eq!(t.len(), 3);
        assert!(t.contains(&Target::Address(addr)));
    }
}
