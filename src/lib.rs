//! Invitation-graph gated Nostr relay.
//!
//! Only keys invited into the membership tree may publish to the main relay.
//! Around it sit curated, moderated, private, scheduled and inbox sub-relays
//! and a closed-groups service, all served from one listener.

pub mod background;
pub mod config;
pub mod curation;
pub mod error;
pub mod event;
pub mod fetcher;
pub mod filter;
pub mod groups;
pub mod inbox;
pub mod limits;
pub mod membership;
pub mod nip19;
pub mod paywall;
pub mod pinned;
pub mod policy;
pub mod relay;
pub mod server;
pub mod shard;
pub mod storage;
pub mod wot;
pub mod zap;
