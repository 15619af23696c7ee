//! Admission checks shared by every mount.
//!
//! A policy is a plain function from context and input to a [`Verdict`];
//! mounts compose them into ordered chains that stop at the first rejection.

use crate::{
    config::RelaySettings,
    error::{Reject, Verdict},
    event::{kinds, Event, KindClass},
    filter::{Filter, MAX_COMPLEXITY, MAX_TAG_KEYS},
    membership::Membership,
    storage::{LayerName, Layers},
    zap,
};

pub const MAX_CONTENT_LENGTH: usize = 10_000;
pub const MAX_INDEXABLE_TAGS: usize = 9;
pub const MAX_FOLLOW_LIST_TAGS: usize = 1200;
/// Allowed distance between `created_at` and the clock, in seconds.
pub const FRESHNESS_WINDOW: u64 = 60;

/// What a policy can look at.
pub struct Ctx<'a> {
    pub settings: &'a RelaySettings,
    pub membership: &'a Membership,
    pub layers: &'a Layers,
    /// Public key of the relay's own signing key.
    pub relay_pubkey: &'a str,
    /// Keys the connection has authenticated as.
    pub authed: &'a [String],
    pub now: u64,
}

impl Ctx<'_> {
    pub fn is_member(&self, pk: &str) -> bool {
        pk == self.relay_pubkey || self.membership.is_member(pk)
    }

    pub fn authed_member(&self) -> bool {
        self.authed.iter().any(|k| self.is_member(k))
    }

    pub fn is_master(&self, pk: &str) -> bool {
        !self.settings.master.is_empty() && self.settings.master == pk
    }
}

pub type EventPolicy = fn(&Ctx, &Event) -> Verdict;
pub type FilterPolicy = fn(&Ctx, &Filter) -> Verdict;

/// Checks every published event goes through before mount-specific rules.
pub const GENERIC_EVENT_CHAIN: &[EventPolicy] = &[
    content_size,
    indexable_tags,
    kind_whitelist,
    blocked_author,
    signature,
];

/// Checks every subscription filter goes through.
pub const GENERIC_FILTER_CHAIN: &[FilterPolicy] = &[filter_complexity, no_search];

pub fn run_events(chain: &[EventPolicy], ctx: &Ctx, ev: &Event) -> Verdict {
    chain.iter().try_for_each(|check| check(ctx, ev))
}

pub fn run_filters(chain: &[FilterPolicy], ctx: &Ctx, f: &Filter) -> Verdict {
    chain.iter().try_for_each(|check| check(ctx, f))
}

pub fn content_size(_: &Ctx, ev: &Event) -> Verdict {
    if ev.content.len() > MAX_CONTENT_LENGTH {
        return Err(Reject::invalid("content is too long"));
    }
    Ok(())
}

pub fn indexable_tags(_: &Ctx, ev: &Event) -> Verdict {
    let max = if ev.kind == kinds::FOLLOW_LIST {
        MAX_FOLLOW_LIST_TAGS
    } else {
        MAX_INDEXABLE_TAGS
    };
    if ev.tags.iter().filter(|t| t.is_indexable()).count() > max {
        return Err(Reject::invalid("too many indexable tags"));
    }
    Ok(())
}

pub fn kind_whitelist(ctx: &Ctx, ev: &Event) -> Verdict {
    if !ctx.settings.kind_allowed(ev.kind) {
        return Err(Reject::blocked(format!("kind {} is not accepted", ev.kind)));
    }
    Ok(())
}

pub fn blocked_author(ctx: &Ctx, ev: &Event) -> Verdict {
    if ctx.settings.is_blocked(&ev.pubkey) {
        return Err(Reject::blocked("you are banned from this relay"));
    }
    Ok(())
}

pub fn signature(_: &Ctx, ev: &Event) -> Verdict {
    ev.verify()
        .map_err(|e| Reject::invalid(format!("signature verification failed: {e}")))
}

/// Membership-gated admission for the main relay.
pub fn core_admit(ctx: &Ctx, ev: &Event) -> Verdict {
    if ev.class() == KindClass::Ephemeral {
        return Ok(());
    }
    if ctx.settings.require_current_timestamp
        && ctx.now.abs_diff(ev.created_at) > FRESHNESS_WINDOW
    {
        return Err(Reject::invalid("created_at is too far from the current time"));
    }
    match ev.kind {
        kinds::ZAP_RECEIPT => zap_receipt(ctx, ev),
        kinds::REPORT => report(ctx, ev),
        _ => {
            members_only(ctx, ev)?;
            if ev.kind == kinds::REACTION {
                reaction(ctx, ev)?;
            }
            Ok(())
        }
    }
}

pub fn members_only(ctx: &Ctx, ev: &Event) -> Verdict {
    if ctx.is_member(&ev.pubkey) {
        Ok(())
    } else {
        Err(Reject::blocked("not authorized"))
    }
}

/// A receipt is admitted for the member who requested the zap.
pub fn zap_receipt(ctx: &Ctx, ev: &Event) -> Verdict {
    let req = zap::embedded_request(ev)
        .ok_or_else(|| Reject::invalid("zap receipt without a valid zap request"))?;
    if req.kind != kinds::ZAP_REQUEST {
        return Err(Reject::invalid("embedded event is not a zap request"));
    }
    if !ctx.is_member(&req.pubkey) {
        return Err(Reject::blocked("zap request author is not a member"));
    }
    if req.created_at > ev.created_at || ev.created_at - req.created_at > FRESHNESS_WINDOW {
        return Err(Reject::invalid("zap request timestamp is out of range"));
    }
    Ok(())
}

/// Reports must point at something this relay holds.
pub fn report(ctx: &Ctx, ev: &Event) -> Verdict {
    let target_event = ev.tag_value("e");
    let target_key = ev.tag_value("p");
    if target_event.is_none() && target_key.is_none() {
        return Err(Reject::invalid("report without a target"));
    }
    if let Some(id) = target_event {
        if !ctx.layers.get(LayerName::Main).contains(id) {
            return Err(Reject::blocked("reported event is not on this relay"));
        }
    }
    if let Some(pk) = target_key {
        if !ctx.is_member(pk) {
            return Err(Reject::blocked("reported key is not a member"));
        }
    }
    Ok(())
}

pub fn reaction(_: &Ctx, ev: &Event) -> Verdict {
    if ev.has_tag("e") || ev.has_tag("a") {
        Ok(())
    } else {
        Err(Reject::invalid("reaction must reference an event"))
    }
}

pub fn filter_complexity(_: &Ctx, f: &Filter) -> Verdict {
    if f.complexity() > MAX_COMPLEXITY || f.tags.len() > MAX_TAG_KEYS {
        return Err(Reject::blocked("filter is too complex"));
    }
    Ok(())
}

pub fn no_search(_: &Ctx, f: &Filter) -> Verdict {
    if f.search.is_some() {
        return Err(Reject::blocked("search is not supported on this relay"));
    }
    Ok(())
}
