//! Sub-relays served under one listener, each with its own layers and rules.

use std::fmt;

use crate::{
    error::{Reject, Verdict},
    event::{is_hex64, is_secret_kind, kinds, Event, KindClass},
    filter::Filter,
    inbox,
    policy::{self, Ctx},
    storage::LayerName,
    wot::Wot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mount {
    Main,
    Internal,
    Favorites,
    Popular,
    Topmost,
    Moderated,
    Personal,
    Scheduled,
    Inbox,
    Groups,
}

impl Mount {
    pub const ALL: [Mount; 10] = [
        Mount::Main,
        Mount::Internal,
        Mount::Favorites,
        Mount::Popular,
        Mount::Topmost,
        Mount::Moderated,
        Mount::Personal,
        Mount::Scheduled,
        Mount::Inbox,
        Mount::Groups,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mount::Main => "main",
            Mount::Internal => "internal",
            Mount::Favorites => "favorites",
            Mount::Popular => "popular",
            Mount::Topmost => "topmost",
            Mount::Moderated => "moderated",
            Mount::Personal => "personal",
            Mount::Scheduled => "scheduled",
            Mount::Inbox => "inbox",
            Mount::Groups => "groups",
        }
    }

    /// Mount served at `/<path>`; the empty path is the main relay.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Some(Mount::Main);
        }
        Self::ALL
            .into_iter()
            .find(|m| *m != Mount::Main && m.as_str() == path)
    }

    pub fn path(self) -> String {
        match self {
            Mount::Main => "/".into(),
            m => format!("/{}", m.as_str()),
        }
    }

    /// Layer holding the mount's own events.
    pub fn layer(self) -> LayerName {
        match self {
            Mount::Main => LayerName::Main,
            Mount::Internal => LayerName::Internal,
            Mount::Favorites => LayerName::Favorites,
            Mount::Popular => LayerName::Popular,
            Mount::Topmost => LayerName::Topmost,
            Mount::Moderated => LayerName::Moderated,
            Mount::Personal => LayerName::Personal,
            Mount::Scheduled => LayerName::Scheduled,
            Mount::Inbox => LayerName::Inbox,
            Mount::Groups => LayerName::Groups,
        }
    }

    /// Layers a reader queries; members of the relay also see the moderation queue.
    pub fn read_layers(self, member: bool) -> Vec<LayerName> {
        match self {
            Mount::Moderated if member => vec![LayerName::Moderated, LayerName::ModerationQueue],
            Mount::Inbox => vec![LayerName::Inbox, LayerName::Secret],
            m => vec![m.layer()],
        }
    }

    /// Whether readers of this mount see events saved into `layer`.
    pub fn reads(self, layer: LayerName, member: bool) -> bool {
        self.read_layers(member).contains(&layer)
    }

    pub fn read_only(self) -> bool {
        matches!(self, Mount::Popular | Mount::Topmost)
    }

    pub fn auth_required(self) -> bool {
        matches!(self, Mount::Internal | Mount::Personal | Mount::Scheduled)
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an admitted event goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Store(LayerName),
    /// Delivered to live subscribers and never stored.
    Ephemeral,
    /// A member's verdict on a queued event.
    Moderate { target: String, approve: bool },
}

fn store_or_ephemeral(ev: &Event, layer: LayerName) -> Route {
    if ev.class() == KindClass::Ephemeral {
        Route::Ephemeral
    } else {
        Route::Store(layer)
    }
}

/// Mount-specific write rules run after the generic chain.
///
/// Groups are admitted by the group state machine and never reach this function.
pub fn admit(
    mount: Mount,
    ctx: &Ctx,
    wot: &Wot,
    queued: impl Fn(&str) -> bool,
    ev: &Event,
) -> Result<Route, Reject> {
    match mount {
        Mount::Main => {
            policy::core_admit(ctx, ev)?;
            Ok(store_or_ephemeral(ev, LayerName::Main))
        }
        Mount::Internal => {
            policy::members_only(ctx, ev)?;
            Ok(store_or_ephemeral(ev, LayerName::Internal))
        }
        Mount::Favorites => {
            policy::members_only(ctx, ev)?;
            if !matches!(ev.kind, kinds::REPOST | kinds::GENERIC_REPOST) {
                return Err(Reject::blocked("only reposts are accepted here"));
            }
            Ok(Route::Store(LayerName::Favorites))
        }
        Mount::Popular | Mount::Topmost => Err(Reject::blocked("this relay is curated automatically")),
        Mount::Moderated => {
            if ctx.is_member(&ev.pubkey) {
                if let Some(route) = moderation_verdict(ev, &queued) {
                    return Ok(route);
                }
                return Ok(store_or_ephemeral(ev, LayerName::Moderated));
            }
            if ev.class() == KindClass::Ephemeral {
                return Err(Reject::blocked("not authorized"));
            }
            Ok(Route::Store(LayerName::ModerationQueue))
        }
        Mount::Personal => {
            if !ctx.is_master(&ev.pubkey) {
                return Err(Reject::restricted("only the relay owner can write here"));
            }
            Ok(store_or_ephemeral(ev, LayerName::Personal))
        }
        Mount::Scheduled => {
            policy::members_only(ctx, ev)?;
            if ev.class() == KindClass::Ephemeral {
                return Err(Reject::invalid("ephemeral events cannot be scheduled"));
            }
            if ev.created_at <= ctx.now {
                return Err(Reject::invalid("created_at must be in the future"));
            }
            Ok(Route::Store(LayerName::Scheduled))
        }
        Mount::Inbox => {
            inbox_admit(ctx, wot, ev)?;
            Ok(store_or_ephemeral(ev, LayerName::Inbox))
        }
        Mount::Groups => Err(Reject::error("group events are routed to the group state machine")),
    }
}

/// A member's `+`/`-` reaction to an event waiting in the queue.
fn moderation_verdict(ev: &Event, queued: &impl Fn(&str) -> bool) -> Option<Route> {
    if ev.kind != kinds::REACTION {
        return None;
    }
    let approve = match ev.content.as_str() {
        "+" => true,
        "-" => false,
        _ => return None,
    };
    let target = ev.tag_values("e").filter(|id| is_hex64(id)).last()?;
    queued(target).then(|| Route::Moderate {
        target: target.to_string(),
        approve,
    })
}

fn tags_member(ctx: &Ctx, ev: &Event) -> bool {
    ev.tag_values("p").any(|p| ctx.is_member(p))
}

/// Directed messages for members, from their web of trust.
pub fn inbox_admit(ctx: &Ctx, wot: &Wot, ev: &Event) -> Verdict {
    if !tags_member(ctx, ev) {
        return Err(Reject::blocked("event must be addressed to a member of this relay"));
    }
    if is_secret_kind(ev.kind) {
        return Ok(());
    }
    if ev.tags_named("p").count() > ctx.settings.inbox.hellthread_limit {
        return Err(Reject::blocked("too many people tagged"));
    }
    if !ctx.is_member(&ev.pubkey) && !wot.contains(&ev.pubkey) {
        return Err(Reject::blocked("you are not in the web of trust of this relay"));
    }
    Ok(())
}

fn needs_auth(message: &str) -> Reject {
    Reject::auth_required(message)
}

/// Mount-specific subscription rules run after the generic filter chain.
pub fn gate_filter(mount: Mount, ctx: &Ctx, filter: &Filter) -> Verdict {
    match mount {
        Mount::Internal if !ctx.authed_member() => Err(if ctx.authed.is_empty() {
            needs_auth("this relay is only for members")
        } else {
            Reject::restricted("this relay is only for members")
        }),
        Mount::Personal if !ctx.authed.iter().any(|k| ctx.is_master(k)) => {
            Err(if ctx.authed.is_empty() {
                needs_auth("this relay belongs to its owner")
            } else {
                Reject::restricted("this relay belongs to its owner")
            })
        }
        Mount::Scheduled if ctx.authed.is_empty() => {
            Err(needs_auth("authenticate to see your scheduled events"))
        }
        Mount::Inbox
            if ctx.authed.is_empty()
                && filter.kinds.is_some()
                && inbox::split(filter).secret.is_some() =>
        {
            Err(needs_auth("private messages are only shown to their recipients"))
        }
        _ => Ok(()),
    }
}
