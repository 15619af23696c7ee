//! Nostr event model, kind classification, hashing and Schnorr signatures.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use secp256k1::{schnorr::Signature, Keypair, Message, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Kind numbers referenced by the relay.
pub mod kinds {
    pub const METADATA: u16 = 0;
    pub const TEXT_NOTE: u16 = 1;
    pub const FOLLOW_LIST: u16 = 3;
    pub const ENCRYPTED_DM: u16 = 4;
    pub const DELETION: u16 = 5;
    pub const REPOST: u16 = 6;
    pub const REACTION: u16 = 7;
    pub const SEAL: u16 = 13;
    pub const PRIVATE_DM: u16 = 14;
    pub const GENERIC_REPOST: u16 = 16;
    pub const GIFT_WRAP: u16 = 1059;
    pub const GIFT_WRAP_EPHEMERAL: u16 = 1060;
    pub const COMMENT: u16 = 1111;
    pub const REPORT: u16 = 1984;
    pub const GROUP_PUT_USER: u16 = 9000;
    pub const GROUP_REMOVE_USER: u16 = 9001;
    pub const GROUP_EDIT_METADATA: u16 = 9002;
    pub const GROUP_DELETE_EVENT: u16 = 9005;
    pub const GROUP_CREATE: u16 = 9007;
    pub const GROUP_DELETE: u16 = 9008;
    pub const GROUP_CREATE_INVITE: u16 = 9009;
    pub const GROUP_JOIN_REQUEST: u16 = 9021;
    pub const GROUP_LEAVE_REQUEST: u16 = 9022;
    pub const NUTZAP: u16 = 9321;
    pub const ZAP_REQUEST: u16 = 9734;
    pub const ZAP_RECEIPT: u16 = 9735;
    pub const HIGHLIGHT: u16 = 9802;
    pub const RELAY_LIST: u16 = 10002;
    pub const AUTH: u16 = 22242;
    pub const GROUP_METADATA: u16 = 39000;
    pub const GROUP_ADMINS: u16 = 39001;
    pub const GROUP_MEMBERS: u16 = 39002;
    pub const GROUP_ROLES: u16 = 39003;
}

/// Private direct-message kinds that the inbox keeps in its own layer.
pub const SECRET_KINDS: [u16; 5] = [
    kinds::ENCRYPTED_DM,
    kinds::SEAL,
    kinds::PRIVATE_DM,
    kinds::GIFT_WRAP,
    kinds::GIFT_WRAP_EPHEMERAL,
];

pub fn is_secret_kind(kind: u16) -> bool {
    SECRET_KINDS.contains(&kind)
}

/// Errors raised while hashing, signing or verifying events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("id mismatch")]
    IdMismatch,
    #[error("bad hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("bad signature or key: {0}")]
    Secp(#[from] secp256k1::Error),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – unique identifier for addressable events
/// - `h` – the closed group an event belongs to
/// - `-` – marks the event as protected
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// Tag name, or an empty string for an empty tag.
    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.get(1)
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).map(String::as_str)
    }

    /// Tags with a single-letter name are indexed by relays.
    pub fn is_indexable(&self) -> bool {
        let name = self.name();
        name.len() == 1 && name.chars().all(|c| c.is_ascii_alphabetic())
    }
}

/// Lifecycle class of an event, derived from its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Regular,
    Replaceable,
    Ephemeral,
    Addressable,
}

pub fn classify(kind: u16) -> KindClass {
    match kind {
        0 | 3 | 10000..=19999 => KindClass::Replaceable,
        20000..=29999 => KindClass::Ephemeral,
        30000..=39999 => KindClass::Addressable,
        _ => KindClass::Regular,
    }
}

/// Core Nostr event persisted on disk and served to clients.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "79be...",
///   "created_at": 1700000000,
///   "kind": 1,
///   "tags": [["t", "news"], ["d", "slug"]],
///   "content": "hello",
///   "sig": "dead..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u16,
    /// Arbitrary tags such as `d` (identifier) or `h` (group).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    pub fn class(&self) -> KindClass {
        classify(self.kind)
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == name)
            .and_then(|t| t.value())
    }

    /// Values of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == name)
            .filter_map(|t| t.value())
    }

    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.name() == name)
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name() == name)
    }

    /// Value of the `d` tag, empty when absent.
    pub fn d_tag(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }

    /// An event carrying a bare `["-"]` tag asks not to be republished by third parties.
    pub fn is_protected(&self) -> bool {
        self.tags
            .iter()
            .any(|t| t.name() == "-" && t.value().map_or(true, str::is_empty))
    }

    /// `kind:pubkey:d` coordinate used by `a` tags.
    pub fn address(&self) -> String {
        format!("{}:{}:{}", self.kind, self.pubkey, self.d_tag())
    }

    /// Key shared by all versions of a replaceable or addressable event.
    pub fn replace_key(&self) -> Option<String> {
        match self.class() {
            KindClass::Replaceable => Some(format!("{}:{}", self.kind, self.pubkey)),
            KindClass::Addressable => Some(self.address()),
            _ => None,
        }
    }

    /// Recompute the event hash from its fields.
    pub fn hash(&self) -> Result<[u8; 32], EventError> {
        event_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Verify the event's id and Schnorr signature.
    pub fn verify(&self) -> Result<(), EventError> {
        let hash = self.hash()?;
        if hex::encode(hash) != self.id {
            return Err(EventError::IdMismatch);
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let msg = Message::from_digest_slice(&hash)?;
        SECP256K1.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }
}

/// Compute the NIP-01 hash of the canonical `[0, pubkey, created_at, kind, tags, content]` array.
pub fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32], EventError> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Unsigned event body handed to [`Keys::sign`].
#[derive(Debug, Clone)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u16, created_at: u64) -> Self {
        Self {
            created_at,
            kind,
            tags: Vec::new(),
            content: String::new(),
        }
    }

    pub fn tag<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(Tag::new(parts));
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }
}

/// A secp256k1 keypair able to sign events.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    pubkey: String,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").field("pubkey", &self.pubkey).finish()
    }
}

impl Keys {
    pub fn from_secret_hex(secret: &str) -> Result<Self, EventError> {
        let bytes = hex::decode(secret.trim())?;
        let keypair = Keypair::from_seckey_slice(SECP256K1, &bytes)?;
        Ok(Self::from_keypair(keypair))
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut sk = [0u8; 32];
            rng.fill_bytes(&mut sk);
            if let Ok(keypair) = Keypair::from_seckey_slice(SECP256K1, &sk) {
                return Self::from_keypair(keypair);
            }
        }
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Self { keypair, pubkey }
    }

    pub fn public_key(&self) -> &str {
        &self.pubkey
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    pub fn sign(&self, template: EventTemplate) -> Result<Event, EventError> {
        let hash = event_hash(
            &self.pubkey,
            template.created_at,
            template.kind,
            &template.tags,
            &template.content,
        )?;
        let msg = Message::from_digest_slice(&hash)?;
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey: self.pubkey.clone(),
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

/// Current Unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// True when `s` is 64 lowercase hex characters.
pub fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
