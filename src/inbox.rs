//! Inbox storage split across a public layer and a private-message layer.

use std::sync::Arc;

use crate::{
    event::{is_secret_kind, Event, SECRET_KINDS},
    filter::Filter,
    storage::{EventIter, LayerName, Layers, MergeDesc, SaveOutcome, StoreError},
};

/// Filter pieces addressed to each side of the inbox.
#[derive(Debug, Default)]
pub struct Split {
    pub public: Option<Filter>,
    pub secret: Option<Filter>,
}

/// Divide a filter by secret kinds. A filter without `kinds` reads both sides.
pub fn split(filter: &Filter) -> Split {
    match &filter.kinds {
        None => {
            let mut secret = filter.clone();
            secret.kinds = Some(SECRET_KINDS.into_iter().collect());
            let mut public = filter.clone();
            public.kinds = None;
            Split {
                public: Some(public),
                secret: Some(secret),
            }
        }
        Some(kinds) => {
            let (sec, publ): (Vec<u16>, Vec<u16>) =
                kinds.iter().copied().partition(|k| is_secret_kind(*k));
            let side = |ks: Vec<u16>| {
                (!ks.is_empty()).then(|| {
                    let mut f = filter.clone();
                    f.kinds = Some(ks.into_iter().collect());
                    f
                })
            };
            Split {
                public: side(publ),
                secret: side(sec),
            }
        }
    }
}

/// Adapter presenting the two inbox layers as one store.
#[derive(Clone)]
pub struct InboxStore {
    layers: Layers,
}

impl InboxStore {
    pub fn new(layers: Layers) -> Self {
        Self { layers }
    }

    fn layer_for(kind: u16) -> LayerName {
        if is_secret_kind(kind) {
            LayerName::Secret
        } else {
            LayerName::Inbox
        }
    }

    pub fn store(&self, ev: &Event) -> Result<SaveOutcome, StoreError> {
        self.layers.get(Self::layer_for(ev.kind)).store(ev)
    }

    pub fn delete(&self, id: &str) -> Result<Option<Arc<Event>>, StoreError> {
        match self.layers.get(LayerName::Inbox).delete(id)? {
            Some(ev) => Ok(Some(ev)),
            None => self.layers.get(LayerName::Secret).delete(id),
        }
    }

    /// Secret-side results pass through `secret_gate` before they are merged.
    pub fn query<F>(&self, filter: &Filter, cap: usize, secret_gate: F) -> EventIter
    where
        F: Fn(&Event) -> bool + Send + 'static,
    {
        let parts = split(filter);
        let mut streams: Vec<EventIter> = Vec::new();
        if let Some(f) = parts.public {
            let mut public_only = self.layers.get(LayerName::Inbox).query(&f, cap);
            if f.kinds.is_none() {
                public_only = Box::new(public_only.filter(|e| !is_secret_kind(e.kind)));
            }
            streams.push(public_only);
        }
        if let Some(f) = parts.secret {
            let secret = self.layers.get(LayerName::Secret).query(&f, cap);
            streams.push(Box::new(secret.filter(move |e| secret_gate(e))));
        }
        let limit = cap.min(filter.limit.unwrap_or(usize::MAX));
        Box::new(MergeDesc::new(streams).take(limit))
    }

    /// Counts cover the public layer only.
    pub fn count(&self, filter: &Filter) -> usize {
        match split(filter).public {
            Some(f) => self.layers.get(LayerName::Inbox).count(&f),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventTemplate, Keys};
    use tempfile::TempDir;

    #[test]
    fn split_mixed_filter() {
        let f = Filter::new().kinds([1, 4, 1059]);
        let s = split(&f);
        assert_eq!(
            s.public.unwrap().kinds.unwrap().into_iter().collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(
            s.secret.unwrap().kinds.unwrap().into_iter().collect::<Vec<_>>(),
            vec![4, 1059]
        );
        let s = split(&Filter::new().kinds([14]));
        assert!(s.public.is_none());
        let s = split(&Filter::new());
        assert!(s.public.is_some() && s.secret.is_some());
    }

    #[test]
    fn routes_and_interleaves() {
        let dir = TempDir::new().unwrap();
        let layers = Layers::open(dir.path()).unwrap();
        let inbox = InboxStore::new(layers.clone());
        let k = Keys::from_secret_hex(&"01".repeat(32)).unwrap();
        let public = k.sign(EventTemplate::new(1, 10)).unwrap();
        let dm = k.sign(EventTemplate::new(4, 20)).unwrap();
        let older = k.sign(EventTemplate::new(1, 5)).unwrap();
        for ev in [&public, &dm, &older] {
            inbox.store(ev).unwrap();
        }
        assert!(layers.get(LayerName::Secret).contains(&dm.id));
        assert!(!layers.get(LayerName::Inbox).contains(&dm.id));

        let all: Vec<String> = inbox
            .query(&Filter::new(), 10, |_| true)
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(all, vec![dm.id.clone(), public.id.clone(), older.id.clone()]);

        let gated = inbox.query(&Filter::new(), 10, |_| false).count();
        assert_eq!(gated, 2);
        assert_eq!(inbox.count(&Filter::new()), 2);
        assert_eq!(inbox.count(&Filter::new().kinds([4])), 0);
    }
}
