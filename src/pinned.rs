//! Featured event per layer, emitted ahead of the natural results of broad queries.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{
    config::RelaySettings,
    event::{kinds, Event, EventTemplate, Keys},
    filter::Filter,
    storage::{LayerName, Layers},
};

struct Pinned {
    original: Arc<Event>,
    /// Relay-signed repost for filters that exclude the original's kind.
    repost: Option<Arc<Event>>,
}

#[derive(Default)]
pub struct PinnedCache {
    pinned: RwLock<HashMap<LayerName, Pinned>>,
}

/// Kind-6 repost of a note, kind-16 generic repost of anything else.
pub fn repost_of(ev: &Event, relay: &Keys) -> Option<Event> {
    let content = serde_json::to_string(ev).ok()?;
    let mut tpl = if ev.kind == kinds::TEXT_NOTE {
        EventTemplate::new(kinds::REPOST, ev.created_at)
    } else {
        EventTemplate::new(kinds::GENERIC_REPOST, ev.created_at)
            .tag(["k", ev.kind.to_string().as_str()])
    };
    tpl = tpl
        .tag(["e", ev.id.as_str()])
        .tag(["p", ev.pubkey.as_str()])
        .content(content);
    relay.sign(tpl).ok()
}

impl PinnedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the configured events whose ids changed since the last call.
    pub fn refresh(&self, settings: &RelaySettings, layers: &Layers, relay: &Keys) {
        let mut pinned = self.pinned.write();
        pinned.retain(|layer, p| settings.pinned.get(layer) == Some(&p.original.id));
        for (layer, id) in &settings.pinned {
            if pinned.contains_key(layer) {
                continue;
            }
            match layers.get(*layer).get(id) {
                Some(original) => {
                    info!(layer = %layer, id = %id, "pinned event loaded");
                    let repost = repost_of(&original, relay).map(Arc::new);
                    pinned.insert(*layer, Pinned { original, repost });
                }
                None => warn!(layer = %layer, id = %id, "pinned event not found"),
            }
        }
    }

    pub fn get(&self, layer: LayerName) -> Option<Arc<Event>> {
        self.pinned.read().get(&layer).map(|p| p.original.clone())
    }

    /// The event to emit first for `filter` on `layer`, when the filter is broad enough.
    pub fn lead(&self, layer: LayerName, filter: &Filter) -> Option<Arc<Event>> {
        let pinned = self.pinned.read();
        let p = pinned.get(&layer)?;
        let trivial = filter.ids.is_none()
            && filter.authors.is_none()
            && filter.tags.is_empty()
            && filter.until.is_none()
            && filter.search.is_none()
            && filter.since.map_or(true, |s| s <= p.original.created_at)
            && filter.limit != Some(0);
        if !trivial {
            return None;
        }
        if filter.allows_kind(p.original.kind) {
            return Some(p.original.clone());
        }
        p.repost
            .as_ref()
            .filter(|r| filter.allows_kind(r.kind))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys(n: u8) -> Keys {
        Keys::from_secret_hex(&hex::encode([n; 32])).unwrap()
    }

    fn setup(kind: u16) -> (TempDir, Layers, Event, PinnedCache, Keys) {
        let dir = TempDir::new().unwrap();
        let layers = Layers::open(dir.path()).unwrap();
        let ev = keys(1).sign(EventTemplate::new(kind, 500).content("featured")).unwrap();
        layers.get(LayerName::Popular).save(&ev).unwrap();
        let mut settings = RelaySettings::default();
        settings.pinned.insert(LayerName::Popular, ev.id.clone());
        let relay = keys(9);
        let cache = PinnedCache::new();
        cache.refresh(&settings, &layers, &relay);
        (dir, layers, ev, cache, relay)
    }

    #[test]
    fn leads_only_broad_filters() {
        let (_dir, _layers, ev, cache, _) = setup(1);
        let lead = cache.lead(LayerName::Popular, &Filter::new()).unwrap();
        assert_eq!(lead.id, ev.id);
        assert!(cache.lead(LayerName::Main, &Filter::new()).is_none());
        assert!(cache.lead(LayerName::Popular, &Filter::new().authors(["ab"])).is_none());
        assert!(cache.lead(LayerName::Popular, &Filter::new().until(600)).is_none());
        assert!(cache.lead(LayerName::Popular, &Filter::new().since(501)).is_none());
        assert!(cache.lead(LayerName::Popular, &Filter::new().since(500)).is_some());
    }

    #[test]
    fn reposts_when_kind_excluded() {
        let (_dir, _layers, ev, cache, relay) = setup(1);
        let lead = cache.lead(LayerName::Popular, &Filter::new().kinds([6])).unwrap();
        assert_eq!(lead.kind, kinds::REPOST);
        assert_eq!(lead.pubkey, relay.public_key());
        assert_eq!(lead.created_at, ev.created_at);
        assert_eq!(lead.tag_value("e"), Some(ev.id.as_str()));
        assert!(lead.verify().is_ok());
        assert!(cache.lead(LayerName::Popular, &Filter::new().kinds([7])).is_none());

        let (_dir, _layers, article, cache, _) = setup(30023);
        let lead = cache.lead(LayerName::Popular, &Filter::new().kinds([16])).unwrap();
        assert_eq!(lead.kind, kinds::GENERIC_REPOST);
        assert_eq!(lead.tag_value("k"), Some("30023"));
        let inner: Event = serde_json::from_str(&lead.content).unwrap();
        assert_eq!(inner, article);
    }

    #[test]
    fn refresh_drops_unpinned() {
        let (_dir, layers, _ev, cache, relay) = setup(1);
        cache.refresh(&RelaySettings::default(), &layers, &relay);
        assert!(cache.get(LayerName::Popular).is_none());
    }
}
