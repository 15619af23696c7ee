//! NIP-11 relay information documents, one per mount.

use serde::{Deserialize, Serialize};

use super::{conn::{MAX_FILTERS, MAX_SUB_ID}, Mount, QUERY_CAP};
use crate::{
    config::RelaySettings,
    policy::{MAX_CONTENT_LENGTH, MAX_INDEXABLE_TAGS},
};

const SOFTWARE: &str = "https://github.com/fiatjaf/pyramid";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInformation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Owner key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    /// Key the relay signs its own events with.
    #[serde(rename = "self")]
    pub self_pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub supported_nips: Vec<u16>,
    /// Accepted kinds; absent when every kind is accepted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_kinds: Vec<u16>,
    pub software: String,
    pub version: String,
    pub limitation: Limitation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limitation {
    pub max_subscriptions_filters: usize,
    pub max_subid_length: usize,
    pub max_limit: usize,
    pub max_event_tags: usize,
    pub max_content_length: usize,
    pub auth_required: bool,
    pub restricted_writes: bool,
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

impl RelayInformation {
    pub fn for_mount(mount: Mount, settings: &RelaySettings, relay_pubkey: &str) -> Self {
        let info = settings.mount_info(mount.as_str());
        let mut supported_nips = vec![1, 9, 11, 42, 45];
        match mount {
            Mount::Main => supported_nips.push(57),
            Mount::Groups => supported_nips.push(29),
            _ => {}
        }
        supported_nips.sort_unstable();
        Self {
            name: Some(non_empty(info.name).unwrap_or_else(|| format!("pyramid {mount}"))),
            description: non_empty(info.description),
            icon: non_empty(info.icon),
            pubkey: non_empty(settings.master.clone()),
            self_pubkey: relay_pubkey.to_string(),
            contact: non_empty(info.contact),
            supported_nips,
            supported_kinds: settings.allowed_kinds.clone(),
            software: SOFTWARE.into(),
            version: env!("CARGO_PKG_VERSION").into(),
            limitation: Limitation {
                max_subscriptions_filters: MAX_FILTERS,
                max_subid_length: MAX_SUB_ID,
                max_limit: QUERY_CAP,
                max_event_tags: MAX_INDEXABLE_TAGS,
                max_content_length: MAX_CONTENT_LENGTH,
                auth_required: mount.auth_required(),
                restricted_writes: mount != Mount::Inbox,
            },
        }
    }
}
