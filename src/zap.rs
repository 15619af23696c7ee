//! Payment records: zap receipts (kind 9735) and nutzaps (kind 9321).

use serde_json::Value;

use crate::event::{kinds, Event};

/// The zap request embedded in a receipt's `description` tag, when its signature holds.
pub fn embedded_request(receipt: &Event) -> Option<Event> {
    let description = receipt.tag_value("description")?;
    let req: Event = serde_json::from_str(description).ok()?;
    req.verify().ok()?;
    Some(req)
}

/// Amount in sats carried by a zap receipt.
///
/// Receipts state millisats, either on their own `amount` tag or on the embedded request.
pub fn receipt_amount_sats(receipt: &Event) -> u64 {
    let msats = receipt
        .tag_value("amount")
        .and_then(|a| a.parse::<u64>().ok())
        .or_else(|| {
            embedded_request(receipt)
                .and_then(|req| req.tag_value("amount").and_then(|a| a.parse().ok()))
        })
        .unwrap_or(0);
    msats / 1000
}

/// Amount in sats carried by a nutzap: the sum of its proofs, or its `amount` tag.
pub fn nutzap_amount_sats(ev: &Event) -> u64 {
    let proofs: u64 = ev
        .tag_values("proof")
        .filter_map(|p| serde_json::from_str::<Value>(p).ok())
        .filter_map(|p| p.get("amount").and_then(Value::as_u64))
        .sum();
    if proofs > 0 {
        return proofs;
    }
    ev.tag_value("amount")
        .and_then(|a| a.parse().ok())
        .unwrap_or(0)
}

/// A payment from `payer` to `receiver`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub payer: String,
    pub receiver: String,
    pub sats: u64,
    pub at: u64,
}

/// Read a payment out of a zap receipt or nutzap.
pub fn payment(ev: &Event) -> Option<Payment> {
    match ev.kind {
        kinds::ZAP_RECEIPT => {
            let payer = ev
                .tag_value("P")
                .map(str::to_string)
                .or_else(|| embedded_request(ev).map(|r| r.pubkey))?;
            Some(Payment {
                payer,
                receiver: ev.tag_value("p")?.to_string(),
                sats: receipt_amount_sats(ev),
                at: ev.created_at,
            })
        }
        kinds::NUTZAP => Some(Payment {
            payer: ev.pubkey.clone(),
            receiver: ev.tag_value("p")?.to_string(),
            sats: nutzap_amount_sats(ev),
            at: ev.created_at,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventTemplate, Keys};

    fn keys(n: u8) -> Keys {
        Keys::from_secret_hex(&hex::encode([n; 32])).unwrap()
    }

    #[test]
    fn receipt_amount_from_request() {
        let payer = keys(1);
        let req = payer
            .sign(EventTemplate::new(9734, 1000).tag(["amount", "21000"]))
            .unwrap();
        let receipt = keys(2)
            .sign(
                EventTemplate::new(9735, 1010)
                    .tag(["p", "ab"])
                    .tag(["description", serde_json::to_string(&req).unwrap().as_str()]),
            )
            .unwrap();
        assert_eq!(receipt_amount_sats(&receipt), 21);
        let p = payment(&receipt).unwrap();
        assert_eq!(p.payer, payer.public_key());
        assert_eq!(p.receiver, "ab");
        assert_eq!(p.sats, 21);
    }

    #[test]
    fn forged_requests_are_ignored() {
        let mut req = keys(1)
            .sign(EventTemplate::new(9734, 1000).tag(["amount", "21000"]))
            .unwrap();
        req.pubkey = keys(3).public_key().to_string();
        let receipt = keys(2)
            .sign(
                EventTemplate::new(9735, 1010)
                    .tag(["p", "ab"])
                    .tag(["description", serde_json::to_string(&req).unwrap().as_str()]),
            )
            .unwrap();
        assert!(embedded_request(&receipt).is_none());
        assert_eq!(receipt_amount_sats(&receipt), 0);
        assert!(payment(&receipt).is_none());
    }

    #[test]
    fn nutzap_sums_proofs() {
        let ev = keys(1)
            .sign(
                EventTemplate::new(9321, 5)
                    .tag(["p", "ab"])
                    .tag(["proof", r#"{"amount":8,"id":"x"}"#])
                    .tag(["proof", r#"{"amount":2,"id":"y"}"#]),
            )
            .unwrap();
        assert_eq!(nutzap_amount_sats(&ev), 10);
        assert_eq!(payment(&ev).unwrap().payer, keys(1).public_key());
    }
}
