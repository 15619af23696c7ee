//! Bech32 event pointers (`note`, `nevent`, `naddr`) and `nostr:` references in content.

use bech32::{Bech32, Hrp};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Nip19Error {
    #[error("bech32: {0}")]
    Bech32(String),
    #[error("unsupported prefix `{0}`")]
    Prefix(String),
    #[error("malformed TLV")]
    Tlv,
}

/// Where an event can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pointer {
    Event {
        id: String,
        relays: Vec<String>,
        author: Option<String>,
    },
    Address {
        kind: u16,
        author: String,
        identifier: String,
        relays: Vec<String>,
    },
}

impl Pointer {
    pub fn relays(&self) -> &[String] {
        match self {
            Pointer::Event { relays, .. } | Pointer::Address { relays, .. } => relays,
        }
    }
}

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

pub fn decode(s: &str) -> Result<Pointer, Nip19Error> {
    let (hrp, data) = bech32::decode(s).map_err(|e| Nip19Error::Bech32(e.to_string()))?;
    match hrp.as_str() {
        "note" => {
            if data.len() != 32 {
                return Err(Nip19Error::Tlv);
            }
            Ok(Pointer::Event {
                id: hex::encode(data),
                relays: Vec::new(),
                author: None,
            })
        }
        "nevent" => {
            let mut id = None;
            let mut relays = Vec::new();
            let mut author = None;
            for (t, v) in tlv(&data)? {
                match t {
                    TLV_SPECIAL if v.len() == 32 => id = Some(hex::encode(v)),
                    TLV_RELAY => relays.push(String::from_utf8_lossy(v).into_owned()),
                    TLV_AUTHOR if v.len() == 32 => author = Some(hex::encode(v)),
                    _ => {}
                }
            }
            Ok(Pointer::Event {
                id: id.ok_or(Nip19Error::Tlv)?,
                relays,
                author,
            })
        }
        "naddr" => {
            let mut identifier = None;
            let mut relays = Vec::new();
            let mut author = None;
            let mut kind = None;
            for (t, v) in tlv(&data)? {
                match t {
                    TLV_SPECIAL => identifier = Some(String::from_utf8_lossy(v).into_owned()),
                    TLV_RELAY => relays.push(String::from_utf8_lossy(v).into_owned()),
                    TLV_AUTHOR if v.len() == 32 => author = Some(hex::encode(v)),
                    TLV_KIND if v.len() == 4 => {
                        let k = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
                        kind = u16::try_from(k).ok();
                    }
                    _ => {}
                }
            }
            Ok(Pointer::Address {
                kind: kind.ok_or(Nip19Error::Tlv)?,
                author: author.ok_or(Nip19Error::Tlv)?,
                identifier: identifier.ok_or(Nip19Error::Tlv)?,
                relays,
            })
        }
        other => Err(Nip19Error::Prefix(other.to_string())),
    }
}

fn tlv(mut data: &[u8]) -> Result<Vec<(u8, &[u8])>, Nip19Error> {
    let mut out = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 {
            return Err(Nip19Error::Tlv);
        }
        let (t, len) = (data[0], data[1] as usize);
        let rest = &data[2..];
        if rest.len() < len {
            return Err(Nip19Error::Tlv);
        }
        out.push((t, &rest[..len]));
        data = &rest[len..];
    }
    Ok(out)
}

/// Encode an `nevent` with an optional relay hint.
pub fn encode_nevent(id: &str, relays: &[String]) -> Result<String, Nip19Error> {
    let id = hex::decode(id).map_err(|e| Nip19Error::Bech32(e.to_string()))?;
    let mut data = vec![TLV_SPECIAL, id.len() as u8];
    data.extend_from_slice(&id);
    for r in relays {
        data.push(TLV_RELAY);
        data.push(r.len() as u8);
        data.extend_from_slice(r.as_bytes());
    }
    let hrp = Hrp::parse("nevent").map_err(|e| Nip19Error::Bech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &data).map_err(|e| Nip19Error::Bech32(e.to_string()))
}

/// Hex public key from either hex or `npub` form.
pub fn public_key(s: &str) -> Result<String, Nip19Error> {
    let s = s.trim();
    let lower = s.to_ascii_lowercase();
    if crate::event::is_hex64(&lower) {
        return Ok(lower);
    }
    let (hrp, data) = bech32::decode(s).map_err(|e| Nip19Error::Bech32(e.to_string()))?;
    if hrp.as_str() != "npub" {
        return Err(Nip19Error::Prefix(hrp.as_str().to_string()));
    }
    if data.len() != 32 {
        return Err(Nip19Error::Tlv);
    }
    Ok(hex::encode(data))
}

/// Every decodable `nostr:` event pointer found in `content`.
pub fn references(content: &str) -> Vec<Pointer> {
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(start) = content[from..].find("nostr:") {
        let begin = from + start + "nostr:".len();
        let rest = &content[begin..];
        let end = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        if let Ok(p) = decode(&rest[..end]) {
            out.push(p);
        }
        from = begin + end;
    }
    out
}
