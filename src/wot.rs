//! Web of trust for the inbox: members' follows and their follows, as an xor filter.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};
use xorf::{Filter as _, Xor8};

use crate::{
    event::{is_hex64, kinds, Event},
    fetcher::EventFetcher,
    filter::Filter,
    storage::Layer,
};

/// Authors asked for per outbound follow-list request.
const FETCH_BATCH: usize = 500;

/// The 8 bytes after the first 8 of a key, read big-endian.
pub fn lane(pubkey: &str) -> Option<u64> {
    let bytes = hex::decode(pubkey.get(16..32)?).ok()?;
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

/// Probabilistic set of keys.
pub struct WotFilter {
    filter: Xor8,
    len: usize,
}

impl WotFilter {
    /// `None` when no valid key is given.
    pub fn build<'a>(keys: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let lanes: BTreeSet<u64> = keys.into_iter().filter_map(lane).collect();
        if lanes.is_empty() {
            return None;
        }
        let lanes: Vec<u64> = lanes.into_iter().collect();
        Some(Self {
            filter: Xor8::from(lanes.as_slice()),
            len: lanes.len(),
        })
    }

    pub fn contains(&self, pubkey: &str) -> bool {
        lane(pubkey).map_or(false, |l| self.filter.contains(&l))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Followed keys from a follow list.
fn follows(list: &Event) -> impl Iterator<Item = &str> {
    list.tag_values("p").filter(|p| is_hex64(p))
}

/// Latest follow list per author: local first, then from `relays`.
async fn follow_lists(
    authors: &[String],
    main: &Layer,
    fetcher: &dyn EventFetcher,
    relays: &[String],
) -> HashMap<String, Event> {
    let mut found: HashMap<String, Event> = HashMap::new();
    let mut missing = Vec::new();
    for author in authors {
        match main.get_latest(&format!("{}:{}", kinds::FOLLOW_LIST, author)) {
            Some(ev) => {
                found.insert(author.clone(), (*ev).clone());
            }
            None => missing.push(author.clone()),
        }
    }
    if relays.is_empty() {
        return found;
    }
    for chunk in missing.chunks(FETCH_BATCH) {
        let filter = Filter::new()
            .kinds([kinds::FOLLOW_LIST])
            .authors(chunk.iter().cloned());
        for ev in fetcher.fetch(relays, &filter).await {
            let newer = found
                .get(&ev.pubkey)
                .map_or(true, |cur| ev.created_at > cur.created_at);
            if newer {
                found.insert(ev.pubkey.clone(), ev);
            }
        }
    }
    found
}

/// Members, who they follow, and who those follow, minus `blocked`.
pub async fn two_hops(
    members: &[String],
    main: &Layer,
    fetcher: &dyn EventFetcher,
    relays: &[String],
    blocked: &[String],
) -> BTreeSet<String> {
    let allowed = |pk: &str| !blocked.iter().any(|b| b == pk);
    let mut network: BTreeSet<String> = members.iter().filter(|m| allowed(m)).cloned().collect();

    let first = follow_lists(members, main, fetcher, relays).await;
    let hop1: BTreeSet<String> = first
        .values()
        .flat_map(follows)
        .filter(|pk| allowed(pk))
        .map(str::to_string)
        .collect();
    debug!(members = members.len(), hop1 = hop1.len(), "first hop collected");

    let unexplored: Vec<String> = hop1.difference(&network).cloned().collect();
    network.extend(hop1);
    let second = follow_lists(&unexplored, main, fetcher, relays).await;
    network.extend(
        second
            .values()
            .flat_map(follows)
            .filter(|pk| allowed(pk))
            .map(str::to_string),
    );
    network
}

/// The current filter, swapped whole on rebuild.
#[derive(Default)]
pub struct Wot {
    current: RwLock<Option<Arc<WotFilter>>>,
}

impl Wot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_built(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn contains(&self, pubkey: &str) -> bool {
        self.current
            .read()
            .as_ref()
            .map_or(false, |f| f.contains(pubkey))
    }

    pub fn replace(&self, filter: Option<WotFilter>) {
        *self.current.write() = filter.map(Arc::new);
    }

    /// Recompute the network and swap in the new filter.
    pub async fn rebuild(
        &self,
        members: &[String],
        main: &Layer,
        fetcher: &dyn EventFetcher,
        relays: &[String],
        blocked: &[String],
    ) -> usize {
        let network = two_hops(members, main, fetcher, relays, blocked).await;
        let filter = WotFilter::build(network.iter().map(String::as_str));
        let size = filter.as_ref().map_or(0, WotFilter::len);
        self.replace(filter);
        info!(keys = size, "web of trust rebuilt");
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{EventTemplate, Keys},
        fetcher::MemoryFetcher,
        storage::LayerName,
    };
    use tempfile::TempDir;

    fn keys(n: u8) -> Keys {
        Keys::from_secret_hex(&hex::encode([n; 32])).unwrap()
    }

    fn follow_list(author: &Keys, follows: &[&Keys], at: u64) -> Event {
        let mut tpl = EventTemplate::new(kinds::FOLLOW_LIST, at);
        for f in follows {
            tpl = tpl.tag(["p", f.public_key()]);
        }
        author.sign(tpl).unwrap()
    }

    #[test]
    fn lane_reads_middle_bytes() {
        let pk = format!("{}{}{}", "00".repeat(8), "0102030405060708", "ff".repeat(16));
        assert_eq!(lane(&pk), Some(0x0102030405060708));
        assert_eq!(lane("abc"), None);
    }

    #[test]
    fn filter_has_no_false_negatives() {
        let ks: Vec<Keys> = (1..=50).map(keys).collect();
        let f = WotFilter::build(ks.iter().map(|k| k.public_key())).unwrap();
        assert_eq!(f.len(), 50);
        assert!(ks.iter().all(|k| f.contains(k.public_key())));
        assert!(WotFilter::build(std::iter::empty()).is_none());
    }

    #[tokio::test]
    async fn two_hops_local_and_remote() {
        let dir = TempDir::new().unwrap();
        let main = Layer::open(dir.path(), LayerName::Main).unwrap();
        let (member, friend, fof, far, banned) = (keys(1), keys(2), keys(3), keys(4), keys(5));
        main.store(&follow_list(&member, &[&friend, &banned], 10)).unwrap();
        let fetcher = MemoryFetcher::new(vec![
            follow_list(&friend, &[&far], 5),
            follow_list(&friend, &[&fof], 20),
            follow_list(&fof, &[&far], 20),
        ]);
        let relays = vec!["wss://relay.example".to_string()];
        let blocked = vec![banned.public_key().to_string()];
        let members = vec![member.public_key().to_string()];
        let net = two_hops(&members, &main, &fetcher, &relays, &blocked).await;
        assert!(net.contains(member.public_key()));
        assert!(net.contains(friend.public_key()));
        assert!(net.contains(fof.public_key()));
        assert!(!net.contains(banned.public_key()));
        // three hops out
        assert!(!net.contains(far.public_key()));

        let wot = Wot::new();
        assert!(!wot.contains(friend.public_key()));
        assert_eq!(wot.rebuild(&members, &main, &fetcher, &relays, &blocked).await, 3);
        assert!(wot.contains(fof.public_key()));
    }
}
