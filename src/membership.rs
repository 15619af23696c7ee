//! Invitation graph backed by an append-only audit log.
//!
//! Each member keeps the list of keys that invited it. The graph in memory is
//! always the fold of `management.jsonl`: actions are validated, appended to the
//! log, and only then applied.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::event::{is_hex64, now};

/// Conceptual parent of every root member.
pub const ABSOLUTE_ROOT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("{0}")]
    Rejected(String),
    #[error("audit log io: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit log line {line} is corrupt: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Invite,
    Drop,
    Leave,
}

/// One audit log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub author: String,
    pub target: String,
    pub when: u64,
}

/// Parent pointers of every member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    parents: HashMap<String, Vec<String>>,
}

impl Graph {
    pub fn is_member(&self, pk: &str) -> bool {
        self.parents.get(pk).map_or(false, |p| !p.is_empty())
    }

    pub fn is_root(&self, pk: &str) -> bool {
        self.parents
            .get(pk)
            .map_or(false, |p| p.iter().any(|x| x == ABSOLUTE_ROOT))
    }

    /// True when `ancestor` is reachable by climbing parents from `target`.
    pub fn is_ancestor(&self, ancestor: &str, target: &str) -> bool {
        let mut stack: Vec<&str> = vec![target];
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(node) = stack.pop() {
            let Some(parents) = self.parents.get(node) else {
                continue;
            };
            for p in parents {
                if p == ancestor {
                    return true;
                }
                if seen.insert(p.as_str()) {
                    stack.push(p.as_str());
                }
            }
        }
        false
    }

    pub fn parents_of(&self, pk: &str) -> &[String] {
        self.parents.get(pk).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Members listing `pk` among their parents.
    pub fn children_of(&self, pk: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .parents
            .iter()
            .filter(|(_, ps)| ps.iter().any(|p| p == pk))
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }

    pub fn can_invite_more(&self, pk: &str, max_invites: usize) -> bool {
        if pk == ABSOLUTE_ROOT || self.is_root(pk) {
            return true;
        }
        let invited = self
            .parents
            .values()
            .filter(|ps| ps.iter().any(|p| p == pk))
            .count();
        invited < max_invites
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Members sorted by key, each with its parents.
    pub fn members(&self) -> Vec<(String, Vec<String>)> {
        let mut out: Vec<_> = self
            .parents
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort();
        out
    }

    /// Check an action against the current state without applying it.
    pub fn validate(&self, action: &Action, max_invites: usize) -> Result<(), String> {
        let Action {
            kind,
            author,
            target,
            ..
        } = action;
        if !is_hex64(author) || !is_hex64(target) {
            return Err("keys must be 32 bytes of lowercase hex".into());
        }
        match kind {
            ActionType::Invite => {
                if author != ABSOLUTE_ROOT && !self.is_member(author) {
                    return Err("only members can invite".into());
                }
                if target == ABSOLUTE_ROOT {
                    return Err("cannot invite the absolute root".into());
                }
                if author == target {
                    return Err("cannot invite yourself".into());
                }
                if !self.can_invite_more(author, max_invites) {
                    return Err(format!("invite limit of {max_invites} reached"));
                }
                if self.is_ancestor(target, author) {
                    return Err("cannot invite one of your own ancestors".into());
                }
                if self.parents_of(target).iter().any(|p| p == author) {
                    return Err("already invited".into());
                }
                Ok(())
            }
            ActionType::Drop => {
                if self.is_ancestor(author, target) {
                    Ok(())
                } else {
                    Err("can only drop members you are an ancestor of".into())
                }
            }
            ActionType::Leave => {
                if author == target {
                    Ok(())
                } else {
                    Err("only the member can leave".into())
                }
            }
        }
    }

    /// Apply a validated (or replayed) action.
    pub fn apply(&mut self, action: &Action) {
        let target = action.target.as_str();
        match action.kind {
            ActionType::Invite => {
                let parents = self.parents.entry(target.to_string()).or_default();
                if !parents.iter().any(|p| *p == action.author) {
                    parents.push(action.author.clone());
                }
            }
            ActionType::Drop => {
                let Some(current) = self.parents.get(target).cloned() else {
                    return;
                };
                let kept: Vec<String> = current
                    .into_iter()
                    .filter(|p| *p != action.author && self.reaches_root_avoiding(p, &action.author))
                    .collect();
                if kept.is_empty() {
                    self.parents.remove(target);
                    self.reap();
                } else {
                    self.parents.insert(target.to_string(), kept);
                }
            }
            ActionType::Leave => {
                if self.parents.remove(target).is_some() {
                    self.reap();
                }
            }
        }
    }

    /// True when some ancestor path from `node` reaches the absolute root without touching `avoid`.
    fn reaches_root_avoiding(&self, node: &str, avoid: &str) -> bool {
        if node == avoid {
            return false;
        }
        if node == ABSOLUTE_ROOT {
            return true;
        }
        let mut stack = vec![node];
        let mut seen: HashSet<&str> = HashSet::from([node]);
        while let Some(n) = stack.pop() {
            for p in self.parents_of(n) {
                if p == avoid {
                    continue;
                }
                if p == ABSOLUTE_ROOT {
                    return true;
                }
                if seen.insert(p.as_str()) {
                    stack.push(p.as_str());
                }
            }
        }
        false
    }

    /// Drop edges to removed members and remove members left without parents, until stable.
    fn reap(&mut self) {
        loop {
            let existing: HashSet<String> = self.parents.keys().cloned().collect();
            let mut orphans = Vec::new();
            for (node, parents) in self.parents.iter_mut() {
                parents.retain(|p| p == ABSOLUTE_ROOT || existing.contains(p));
                if parents.is_empty() {
                    orphans.push(node.clone());
                }
            }
            if orphans.is_empty() {
                return;
            }
            for o in orphans {
                self.parents.remove(&o);
            }
        }
    }
}

/// Fold an audit log file into a graph.
pub fn replay(path: &Path) -> Result<(Graph, usize), MembershipError> {
    let mut graph = Graph::default();
    let mut count = 0;
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((graph, 0)),
        Err(e) => return Err(e.into()),
    };
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let action: Action = serde_json::from_str(&line)
            .map_err(|source| MembershipError::Corrupt { line: i + 1, source })?;
        graph.apply(&action);
        count += 1;
    }
    Ok((graph, count))
}

struct State {
    graph: Graph,
    /// Log size already folded into `graph`.
    log_len: u64,
}

/// Thread-safe membership registry persisted to an audit log.
pub struct Membership {
    log_path: PathBuf,
    max_invites: RwLock<usize>,
    state: RwLock<State>,
}

impl Membership {
    /// Replay `log_path` and keep it open for appends.
    pub fn load(log_path: impl Into<PathBuf>, max_invites: usize) -> Result<Self, MembershipError> {
        let log_path = log_path.into();
        let (graph, actions) = replay(&log_path)?;
        let log_len = file_len(&log_path);
        info!(actions, members = graph.len(), "membership log replayed");
        Ok(Self {
            log_path,
            max_invites: RwLock::new(max_invites),
            state: RwLock::new(State { graph, log_len }),
        })
    }

    pub fn set_max_invites(&self, n: usize) {
        *self.max_invites.write() = n;
    }

    /// Validate, persist and apply an action.
    pub fn add_action(
        &self,
        kind: ActionType,
        author: &str,
        target: &str,
    ) -> Result<(), MembershipError> {
        let action = Action {
            kind,
            author: author.to_string(),
            target: target.to_string(),
            when: now(),
        };
        let max_invites = *self.max_invites.read();
        let mut state = self.state.write();
        state
            .graph
            .validate(&action, max_invites)
            .map_err(MembershipError::Rejected)?;
        if let Err(e) = self.append(&action) {
            warn!(error = %e, "audit log append failed, reloading");
            if let Ok((graph, _)) = replay(&self.log_path) {
                state.graph = graph;
            }
            state.log_len = file_len(&self.log_path);
            return Err(e.into());
        }
        state.graph.apply(&action);
        state.log_len = file_len(&self.log_path);
        info!(kind = ?action.kind, author = %action.author, target = %action.target, "membership changed");
        Ok(())
    }

    fn append(&self, action: &Action) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(action)?;
        line.push(b'\n');
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        f.write_all(&line)?;
        f.sync_data()
    }

    /// Re-read the log when another process appended to it.
    pub fn reload_if_changed(&self) -> Result<bool, MembershipError> {
        let len = file_len(&self.log_path);
        if len == self.state.read().log_len {
            return Ok(false);
        }
        let (graph, _) = replay(&self.log_path)?;
        let mut state = self.state.write();
        state.graph = graph;
        state.log_len = len;
        Ok(true)
    }

    pub fn is_member(&self, pk: &str) -> bool {
        self.state.read().graph.is_member(pk)
    }

    pub fn is_root(&self, pk: &str) -> bool {
        self.state.read().graph.is_root(pk)
    }

    pub fn is_ancestor(&self, ancestor: &str, target: &str) -> bool {
        self.state.read().graph.is_ancestor(ancestor, target)
    }

    pub fn can_invite_more(&self, pk: &str) -> bool {
        let max = *self.max_invites.read();
        self.state.read().graph.can_invite_more(pk, max)
    }

    pub fn member_count(&self) -> usize {
        self.state.read().graph.len()
    }

    pub fn members(&self) -> Vec<(String, Vec<String>)> {
        self.state.read().graph.members()
    }

    pub fn member_keys(&self) -> Vec<String> {
        self.members().into_iter().map(|(k, _)| k).collect()
    }

    /// Copy of the current graph.
    pub fn snapshot(&self) -> Graph {
        self.state.read().graph.clone()
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
