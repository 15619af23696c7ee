//! File-backed event layers with an in-memory index.
//!
//! Every layer owns its own directory. Events are written one file per id under
//! `events/ab/cd/<id>.json` (atomically, through a temp file in the same
//! directory) and the index is rebuilt from that tree when the layer opens.

use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    fmt, fs,
    ops::Bound,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use serde_json::to_writer;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    event::{is_hex64, Event, KindClass},
    filter::Filter,
};

/// Lazily produced events in descending `created_at` order.
pub type EventIter = Box<dyn Iterator<Item = Arc<Event>> + Send>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("persist: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("walk: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("ephemeral events are never stored")]
    Ephemeral,
}

/// Names of the independent storage layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerName {
    Main,
    Internal,
    Inbox,
    Secret,
    Groups,
    Favorites,
    Popular,
    Topmost,
    Moderated,
    ModerationQueue,
    Scheduled,
    Personal,
}

impl LayerName {
    pub const ALL: [LayerName; 12] = [
        LayerName::Main,
        LayerName::Internal,
        LayerName::Inbox,
        LayerName::Secret,
        LayerName::Groups,
        LayerName::Favorites,
        LayerName::Popular,
        LayerName::Topmost,
        LayerName::Moderated,
        LayerName::ModerationQueue,
        LayerName::Scheduled,
        LayerName::Personal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LayerName::Main => "main",
            LayerName::Internal => "internal",
            LayerName::Inbox => "inbox",
            LayerName::Secret => "secret",
            LayerName::Groups => "groups",
            LayerName::Favorites => "favorites",
            LayerName::Popular => "popular",
            LayerName::Topmost => "topmost",
            LayerName::Moderated => "moderated",
            LayerName::ModerationQueue => "moderation-queue",
            LayerName::Scheduled => "scheduled",
            LayerName::Personal => "personal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == s)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for LayerName {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for LayerName {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        LayerName::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown layer `{s}`")))
    }
}

/// What `save`/`store` did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The same id is already present.
    Duplicate,
    /// A replaceable event at least as new is already present.
    Superseded,
}

type OrderKey = (Reverse<u64>, String);

#[derive(Default)]
struct Index {
    by_id: HashMap<String, Arc<Event>>,
    ordered: BTreeSet<OrderKey>,
    /// Replace key to the id currently holding it.
    latest: HashMap<String, String>,
}

impl Index {
    fn insert(&mut self, ev: Arc<Event>) {
        if let Some(key) = ev.replace_key() {
            self.latest.insert(key, ev.id.clone());
        }
        self.ordered.insert((Reverse(ev.created_at), ev.id.clone()));
        self.by_id.insert(ev.id.clone(), ev);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Event>> {
        let ev = self.by_id.remove(id)?;
        self.ordered.remove(&(Reverse(ev.created_at), ev.id.clone()));
        if let Some(key) = ev.replace_key() {
            if self.latest.get(&key).map(String::as_str) == Some(id) {
                self.latest.remove(&key);
            }
        }
        Some(ev)
    }
}

/// One independent keyspace of events.
#[derive(Clone)]
pub struct Layer {
    name: LayerName,
    root: PathBuf,
    index: Arc<RwLock<Index>>,
}

impl Layer {
    /// Open (creating when missing) the layer directory and load its events.
    pub fn open(root: &Path, name: LayerName) -> Result<Self, StoreError> {
        let root = root.join(name.as_str());
        let events_dir = root.join("events");
        fs::create_dir_all(&events_dir)?;
        let mut index = Index::default();
        for entry in walkdir::WalkDir::new(&events_dir) {
            let entry = entry?;
            if !entry.file_type().is_file()
                || entry.path().extension().map_or(true, |e| e != "json")
            {
                continue;
            }
            let data = fs::read_to_string(entry.path())?;
            match serde_json::from_str::<Event>(&data) {
                Ok(ev) => index.insert(Arc::new(ev)),
                Err(e) => warn!(layer = %name, path = %entry.path().display(), "skipping unreadable event: {e}"),
            }
        }
        debug!(layer = %name, events = index.by_id.len(), "layer opened");
        Ok(Self {
            name,
            root,
            index: Arc::new(RwLock::new(index)),
        })
    }

    pub fn name(&self) -> LayerName {
        self.name
    }

    pub fn len(&self) -> usize {
        self.index.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<Event>> {
        self.index.read().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.read().by_id.contains_key(id)
    }

    /// Latest event stored under a replace key (`kind:pubkey[:d]`).
    pub fn get_latest(&self, key: &str) -> Option<Arc<Event>> {
        let idx = self.index.read();
        idx.latest.get(key).and_then(|id| idx.by_id.get(id)).cloned()
    }

    /// Store a regular event, deduplicating by id.
    pub fn save(&self, ev: &Event) -> Result<SaveOutcome, StoreError> {
        let mut idx = self.index.write();
        if idx.by_id.contains_key(&ev.id) {
            return Ok(SaveOutcome::Duplicate);
        }
        self.write_file(ev)?;
        idx.insert(Arc::new(ev.clone()));
        Ok(SaveOutcome::Saved)
    }

    /// Store a replaceable or addressable event.
    ///
    /// Older versions sharing the replace key are deleted when the incoming
    /// timestamp is strictly greater; otherwise the incoming event is discarded.
    pub fn replace(&self, ev: &Event) -> Result<SaveOutcome, StoreError> {
        let Some(key) = ev.replace_key() else {
            return self.save(ev);
        };
        let mut idx = self.index.write();
        if idx.by_id.contains_key(&ev.id) {
            return Ok(SaveOutcome::Duplicate);
        }
        let previous = idx.latest.get(&key).and_then(|id| idx.by_id.get(id)).cloned();
        if let Some(prev) = &previous {
            if prev.created_at >= ev.created_at {
                return Ok(SaveOutcome::Superseded);
            }
        }
        self.write_file(ev)?;
        if let Some(prev) = previous {
            self.remove_file(&prev.id)?;
            idx.remove(&prev.id);
        }
        idx.insert(Arc::new(ev.clone()));
        Ok(SaveOutcome::Saved)
    }

    /// Route an event to `save` or `replace` according to its kind.
    pub fn store(&self, ev: &Event) -> Result<SaveOutcome, StoreError> {
        match ev.class() {
            KindClass::Ephemeral => Err(StoreError::Ephemeral),
            KindClass::Regular => self.save(ev),
            KindClass::Replaceable | KindClass::Addressable => self.replace(ev),
        }
    }

    /// Delete an event by id, returning it when it was present.
    pub fn delete(&self, id: &str) -> Result<Option<Arc<Event>>, StoreError> {
        let mut idx = self.index.write();
        if !idx.by_id.contains_key(id) {
            return Ok(None);
        }
        self.remove_file(id)?;
        Ok(idx.remove(id))
    }

    /// Matching events newest first, truncated to `min(cap, filter.limit)`.
    pub fn query(&self, filter: &Filter, cap: usize) -> EventIter {
        let remaining = cap
            .min(filter.limit.unwrap_or(usize::MAX))
            .min(filter.theoretical_limit());
        if remaining == 0 {
            return Box::new(std::iter::empty());
        }
        let source = match &filter.ids {
            Some(ids) => {
                let idx = self.index.read();
                let mut hits: Vec<Arc<Event>> = ids
                    .iter()
                    .filter_map(|id| idx.by_id.get(id).cloned())
                    .filter(|ev| filter.matches(ev))
                    .collect();
                hits.sort_by(|a, b| order(a).cmp(&order(b)));
                Source::Fixed(hits.into())
            }
            None => Source::Scan {
                index: self.index.clone(),
                cursor: filter
                    .until
                    .map(|u| Bound::Included((Reverse(u), String::new())))
                    .unwrap_or(Bound::Unbounded),
            },
        };
        Box::new(QueryIter {
            filter: filter.clone(),
            source,
            remaining,
        })
    }

    /// Number of stored events matching `filter`, ignoring its limit.
    pub fn count(&self, filter: &Filter) -> usize {
        let mut f = filter.clone();
        f.limit = None;
        self.query(&f, usize::MAX).count()
    }

    fn event_path(&self, id: &str) -> PathBuf {
        self.root
            .join("events")
            .join(&id[0..2])
            .join(&id[2..4])
            .join(format!("{}.json", id))
    }

    fn write_file(&self, ev: &Event) -> Result<(), StoreError> {
        if !is_hex64(&ev.id) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "event id is not 32 bytes of hex",
            )));
        }
        let path = self.event_path(&ev.id);
        let parent_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
        to_writer(&tmp, ev)?;
        tmp.persist(&path)?;
        Ok(())
    }

    fn remove_file(&self, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.event_path(id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn order(ev: &Event) -> (Reverse<u64>, &str) {
    (Reverse(ev.created_at), ev.id.as_str())
}

enum Source {
    Fixed(VecDeque<Arc<Event>>),
    Scan {
        index: Arc<RwLock<Index>>,
        cursor: Bound<OrderKey>,
    },
}

/// Pulls matching events one at a time; the index lock is held only per step.
struct QueryIter {
    filter: Filter,
    source: Source,
    remaining: usize,
}

/// Entries examined per lock acquisition.
const SCAN_BATCH: usize = 256;

impl Iterator for QueryIter {
    type Item = Arc<Event>;

    fn next(&mut self) -> Option<Arc<Event>> {
        if self.remaining == 0 {
            return None;
        }
        let found = match &mut self.source {
            Source::Fixed(queue) => queue.pop_front(),
            Source::Scan { index, cursor } => loop {
                let idx = index.read();
                let mut range = idx
                    .ordered
                    .range((cursor.clone(), Bound::Unbounded))
                    .take(SCAN_BATCH)
                    .peekable();
                if range.peek().is_none() {
                    break None;
                }
                let mut hit = None;
                for key in range {
                    *cursor = Bound::Excluded(key.clone());
                    if self.filter.since.map_or(false, |s| key.0 .0 < s) {
                        self.remaining = 0;
                        return None;
                    }
                    if let Some(ev) = idx.by_id.get(&key.1) {
                        if self.filter.matches(ev) {
                            hit = Some(ev.clone());
                            break;
                        }
                    }
                }
                if hit.is_some() {
                    break hit;
                }
            },
        };
        if found.is_some() {
            self.remaining -= 1;
        }
        found
    }
}

/// Merge several descending streams into one, dropping repeated ids.
pub struct MergeDesc {
    streams: Vec<std::iter::Peekable<EventIter>>,
    seen: HashSet<String>,
}

impl MergeDesc {
    pub fn new(streams: Vec<EventIter>) -> Self {
        Self {
            streams: streams.into_iter().map(Iterator::peekable).collect(),
            seen: HashSet::new(),
        }
    }
}

impl Iterator for MergeDesc {
    type Item = Arc<Event>;

    fn next(&mut self) -> Option<Arc<Event>> {
        loop {
            let mut best: Option<(usize, Arc<Event>)> = None;
            for (i, stream) in self.streams.iter_mut().enumerate() {
                let Some(ev) = stream.peek() else {
                    continue;
                };
                if best.as_ref().map_or(true, |(_, cur)| order(ev) < order(cur)) {
                    best = Some((i, ev.clone()));
                }
            }
            let (i, _) = best?;
            let ev = self.streams[i].next()?;
            if self.seen.insert(ev.id.clone()) {
                return Some(ev);
            }
        }
    }
}

/// Every layer, opened under one data directory.
#[derive(Clone)]
pub struct Layers {
    layers: Vec<Layer>,
}

impl Layers {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let layers = LayerName::ALL
            .into_iter()
            .map(|name| Layer::open(data_dir, name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { layers })
    }

    pub fn get(&self, name: LayerName) -> &Layer {
        &self.layers[name.index()]
    }

    /// Merged query across several layers.
    pub fn query(&self, names: &[LayerName], filter: &Filter, cap: usize) -> EventIter {
        let limit = cap.min(filter.limit.unwrap_or(usize::MAX));
        match names {
            [single] => self.get(*single).query(filter, cap),
            _ => Box::new(
                MergeDesc::new(
                    names
                        .iter()
                        .map(|n| self.get(*n).query(filter, cap))
                        .collect(),
                )
                .take(limit),
            ),
        }
    }
}
