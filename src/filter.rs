//! Subscription filters: parsing from the wire, in-memory matching and size estimates.
//!
//! Fields intersect; values inside one field are a union. Tag predicates arrive
//! as `"#x": [..]` keys where `x` is a single letter.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{classify, Event, KindClass};

/// Filters with more predicate values than this are refused.
pub const MAX_COMPLEXITY: usize = 1200;
/// Filters naming more tag keys than this are refused.
pub const MAX_TAG_KEYS: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter must be a JSON object")]
    NotObject,
    #[error("field `{0}` has the wrong type")]
    BadField(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<BTreeSet<String>>,
    pub authors: Option<BTreeSet<String>>,
    pub kinds: Option<BTreeSet<u16>>,
    /// Tag name (without `#`) to accepted values.
    pub tags: BTreeMap<String, BTreeSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Parse a wire filter object.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        let obj = val.as_object().ok_or(FilterError::NotObject)?;
        let mut filter = Filter::new();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_set(key, v)?),
                "authors" => filter.authors = Some(string_set(key, v)?),
                "kinds" => {
                    let arr = v
                        .as_array()
                        .ok_or_else(|| FilterError::BadField(key.clone()))?;
                    let mut kinds = BTreeSet::new();
                    for k in arr {
                        let k = k
                            .as_u64()
                            .and_then(|k| u16::try_from(k).ok())
                            .ok_or_else(|| FilterError::BadField(key.clone()))?;
                        kinds.insert(k);
                    }
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(number(key, v)?),
                "until" => filter.until = Some(number(key, v)?),
                "limit" => filter.limit = Some(number(key, v)? as usize),
                "search" => {
                    let s = v
                        .as_str()
                        .ok_or_else(|| FilterError::BadField(key.clone()))?;
                    filter.search = Some(s.to_string());
                }
                other => {
                    if let Some(name) = other.strip_prefix('#') {
                        if name.chars().count() == 1 {
                            filter.tags.insert(name.to_string(), string_set(key, v)?);
                        }
                    }
                }
            }
        }
        Ok(filter)
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), ids.iter().cloned().collect());
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), authors.iter().cloned().collect());
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), kinds.iter().copied().collect());
        }
        for (name, values) in &self.tags {
            obj.insert(format!("#{name}"), values.iter().cloned().collect());
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), since.into());
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), until.into());
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), limit.into());
        }
        if let Some(search) = &self.search {
            obj.insert("search".into(), search.clone().into());
        }
        Value::Object(obj)
    }

    /// Check whether `ev` satisfies every predicate.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if self.since.map_or(false, |s| ev.created_at < s) {
            return false;
        }
        if self.until.map_or(false, |u| ev.created_at > u) {
            return false;
        }
        for (name, values) in &self.tags {
            let hit = ev
                .tag_values(name)
                .any(|v| values.contains(v));
            if !hit {
                return false;
            }
        }
        true
    }

    /// Upper bound on how many events this filter can ever return.
    ///
    /// Zero means the filter is provably empty; `usize::MAX` means unbounded.
    pub fn theoretical_limit(&self) -> usize {
        if self.limit == Some(0) {
            return 0;
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return 0;
            }
        }
        if self.ids.as_ref().map_or(false, BTreeSet::is_empty)
            || self.authors.as_ref().map_or(false, BTreeSet::is_empty)
            || self.kinds.as_ref().map_or(false, BTreeSet::is_empty)
            || self.tags.values().any(BTreeSet::is_empty)
        {
            return 0;
        }
        if let Some(ids) = &self.ids {
            return ids.len();
        }
        if let (Some(authors), Some(kinds)) = (&self.authors, &self.kinds) {
            let all = |class| kinds.iter().all(|k| classify(*k) == class);
            if all(KindClass::Replaceable) {
                return authors.len() * kinds.len();
            }
            if all(KindClass::Addressable) {
                if let Some(d) = self.tags.get("d") {
                    return authors.len() * kinds.len() * d.len();
                }
            }
        }
        usize::MAX
    }

    /// Number of predicate values the filter carries.
    pub fn complexity(&self) -> usize {
        self.ids.as_ref().map_or(0, BTreeSet::len)
            + self.authors.as_ref().map_or(0, BTreeSet::len)
            + self.kinds.as_ref().map_or(0, BTreeSet::len)
            + self.tags.values().map(BTreeSet::len).sum::<usize>()
    }

    /// Values requested for tag `name`, when the filter selects by it.
    pub fn tag_selection(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.tags.get(name)
    }

    /// No id, author or tag predicates.
    pub fn is_broad(&self) -> bool {
        self.ids.is_none() && self.authors.is_none() && self.tags.is_empty()
    }

    /// The filter may select events of `kind`.
    pub fn allows_kind(&self, kind: u16) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn string_set(key: &str, v: &Value) -> Result<BTreeSet<String>, FilterError> {
    let arr = v
        .as_array()
        .ok_or_else(|| FilterError::BadField(key.to_string()))?;
    arr.iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .ok_or_else(|| FilterError::BadField(key.to_string()))
        })
        .collect()
}

fn number(key: &str, v: &Value) -> Result<u64, FilterError> {
    v.as_u64()
        .ok_or_else(|| FilterError::BadField(key.to_string()))
}
