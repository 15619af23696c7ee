//! Reader-side paywall for protected events.
//!
//! A reader may see a paywalled event when one of their authenticated keys has
//! paid its author at least `amount_sats` over the last `period_days`.
//! Decisions are memoized per (author, reader) pair.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::PaywallSettings,
    event::{kinds, Event},
    filter::Filter,
    storage::Layer,
    zap,
};

type Fingerprint = [u8; 16];

/// First 8 bytes of each key, side by side.
fn fingerprint(author: &str, reader: &str) -> Fingerprint {
    let mut out = [0u8; 16];
    let fill = |dst: &mut [u8], key: &str| {
        if let Ok(bytes) = hex::decode(key.get(..16).unwrap_or(key)) {
            let n = bytes.len().min(8);
            dst[..n].copy_from_slice(&bytes[..n]);
        }
    };
    let (a, r) = out.split_at_mut(8);
    fill(a, author);
    fill(r, reader);
    out
}

/// True when the event falls under the paywall.
pub fn is_paywalled(settings: &PaywallSettings, ev: &Event) -> bool {
    settings.enabled()
        && ev.is_protected()
        && (settings.tag.is_empty() || ev.tag_values("t").any(|t| t == settings.tag))
}

/// Sats `payer` sent `receiver` at or after `since`, according to `main`.
pub fn paid(main: &Layer, payer: &str, receiver: &str, since: u64) -> u64 {
    let receipts = Filter::new()
        .kinds([kinds::ZAP_RECEIPT])
        .tag("p", [receiver])
        .since(since);
    let nutzaps = Filter::new()
        .kinds([kinds::NUTZAP])
        .authors([payer])
        .tag("p", [receiver])
        .since(since);
    main.query(&receipts, usize::MAX)
        .chain(main.query(&nutzaps, usize::MAX))
        .filter_map(|ev| zap::payment(&ev))
        .filter(|p| p.payer == payer && p.receiver == receiver)
        .map(|p| p.sats)
        .sum()
}

#[derive(Default)]
pub struct PaywallCache {
    memo: Mutex<HashMap<Fingerprint, bool>>,
}

impl PaywallCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any of `readers` may see events by `author`.
    pub fn can_read(
        &self,
        settings: &PaywallSettings,
        main: &Layer,
        author: &str,
        readers: &[String],
        now: u64,
    ) -> bool {
        if readers.iter().any(|r| r == author) {
            return true;
        }
        let since = now.saturating_sub(settings.period_days * 86_400);
        readers.iter().any(|reader| {
            let key = fingerprint(author, reader);
            if let Some(hit) = self.memo.lock().get(&key) {
                return *hit;
            }
            let ok = paid(main, reader, author, since) >= settings.amount_sats;
            self.memo.lock().insert(key, ok);
            ok
        })
    }

    /// Forget the decision for a pair after a fresh payment between them.
    pub fn invalidate(&self, payer: &str, receiver: &str) {
        self.memo.lock().remove(&fingerprint(receiver, payer));
    }

    /// Note a stored event; payments drop the cached decision for their pair.
    pub fn observe(&self, ev: &Event) {
        if let Some(p) = zap::payment(ev) {
            debug!(payer = %p.payer, receiver = %p.receiver, sats = p.sats, "payment seen");
            self.invalidate(&p.payer, &p.receiver);
        }
    }

    pub fn clear(&self) {
        self.memo.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.memo.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{EventTemplate, Keys},
        storage::LayerName,
    };
    use tempfile::TempDir;

    fn keys(n: u8) -> Keys {
        Keys::from_secret_hex(&hex::encode([n; 32])).unwrap()
    }

    fn settings() -> PaywallSettings {
        PaywallSettings {
            tag: String::new(),
            amount_sats: 100,
            period_days: 30,
        }
    }

    fn nutzap(payer: &Keys, receiver: &Keys, sats: u64, at: u64) -> Event {
        payer
            .sign(
                EventTemplate::new(kinds::NUTZAP, at)
                    .tag(["p", receiver.public_key()])
                    .tag(["amount", sats.to_string().as_str()]),
            )
            .unwrap()
    }

    fn receipt(zapper: &Keys, payer: &Keys, receiver: &Keys, msats: u64, at: u64) -> Event {
        zapper
            .sign(
                EventTemplate::new(kinds::ZAP_RECEIPT, at)
                    .tag(["p", receiver.public_key()])
                    .tag(["P", payer.public_key()])
                    .tag(["amount", msats.to_string().as_str()]),
            )
            .unwrap()
    }

    #[test]
    fn protected_and_tagged() {
        let k = keys(1);
        let plain = k.sign(EventTemplate::new(1, 1)).unwrap();
        let protected = k.sign(EventTemplate::new(1, 1).tag(["-"])).unwrap();
        let tagged = k
            .sign(EventTemplate::new(1, 1).tag(["-"]).tag(["t", "premium"]))
            .unwrap();
        let mut s = settings();
        assert!(!is_paywalled(&s, &plain));
        assert!(is_paywalled(&s, &protected));
        s.tag = "premium".into();
        assert!(!is_paywalled(&s, &protected));
        assert!(is_paywalled(&s, &tagged));
        s.amount_sats = 0;
        assert!(!is_paywalled(&s, &tagged));
    }

    #[test]
    fn payments_unlock_and_cache() {
        let dir = TempDir::new().unwrap();
        let main = Layer::open(dir.path(), LayerName::Main).unwrap();
        let (author, reader, zapper) = (keys(1), keys(2), keys(3));
        let cache = PaywallCache::new();
        let now = 10 * 86_400 * 30;
        let readers = vec![reader.public_key().to_string()];

        assert!(!cache.can_read(&settings(), &main, author.public_key(), &readers, now));
        assert_eq!(cache.len(), 1);

        let ev = nutzap(&reader, &author, 60, now - 10);
        main.save(&ev).unwrap();
        assert!(!cache.can_read(&settings(), &main, author.public_key(), &readers, now));
        cache.observe(&ev);
        assert!(cache.is_empty());

        let ev = receipt(&zapper, &reader, &author, 40_000, now - 5);
        main.save(&ev).unwrap();
        cache.observe(&ev);
        assert!(cache.can_read(&settings(), &main, author.public_key(), &readers, now));

        let stale = now + 31 * 86_400;
        cache.clear();
        assert!(!cache.can_read(&settings(), &main, author.public_key(), &readers, stale));
    }

    #[test]
    fn authors_read_their_own() {
        let dir = TempDir::new().unwrap();
        let main = Layer::open(dir.path(), LayerName::Main).unwrap();
        let author = keys(1);
        let readers = vec![author.public_key().to_string()];
        assert!(PaywallCache::new().can_read(&settings(), &main, author.public_key(), &readers, 0));
    }

    #[test]
    fn decision_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let main = Layer::open(dir.path(), LayerName::Main).unwrap();
        let (author, reader) = (keys(1), keys(2));
        main.save(&nutzap(&reader, &author, 150, 100)).unwrap();
        let readers = vec![reader.public_key().to_string()];
        let a = PaywallCache::new().can_read(&settings(), &main, author.public_key(), &readers, 200);
        let b = PaywallCache::new().can_read(&settings(), &main, author.public_key(), &readers, 200);
        assert!(a && b);
    }
}
