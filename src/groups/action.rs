//! Typed moderation actions parsed from group events.

use thiserror::Error;

use crate::event::{is_hex64, kinds, Event};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("missing group id")]
    MissingGroup,
    #[error("missing {0} tag")]
    MissingTag(&'static str),
    #[error("malformed {0} tag")]
    BadTag(&'static str),
    #[error("kind {0} is not a moderation action")]
    NotAction(u16),
}

/// Flags and fields an edit-metadata event sets; `None` leaves them as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataEdit {
    pub name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub private: Option<bool>,
    pub closed: Option<bool>,
    pub hidden: Option<bool>,
}

impl MetadataEdit {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateGroup,
    DeleteGroup,
    EditMetadata(MetadataEdit),
    /// Users with the roles they should hold.
    PutUser(Vec<(String, Vec<String>)>),
    RemoveUser(Vec<String>),
    DeleteEvent(Vec<String>),
    CreateInvite(String),
    JoinRequest { code: Option<String> },
    LeaveRequest,
}

impl Action {
    /// Whether the author needs a role in the group.
    pub fn is_moderation(&self) -> bool {
        !matches!(
            self,
            Action::CreateGroup | Action::JoinRequest { .. } | Action::LeaveRequest
        )
    }
}

/// A parsed action together with the group it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moderation {
    pub group: String,
    pub action: Action,
}

/// Kinds carrying group actions.
pub const ACTION_KINDS: [u16; 9] = [
    kinds::GROUP_PUT_USER,
    kinds::GROUP_REMOVE_USER,
    kinds::GROUP_EDIT_METADATA,
    kinds::GROUP_DELETE_EVENT,
    kinds::GROUP_CREATE,
    kinds::GROUP_DELETE,
    kinds::GROUP_CREATE_INVITE,
    kinds::GROUP_JOIN_REQUEST,
    kinds::GROUP_LEAVE_REQUEST,
];

pub fn is_action_kind(kind: u16) -> bool {
    ACTION_KINDS.contains(&kind)
}

/// Group id an event belongs to: its `h` tag, or `d` for group snapshots.
pub fn group_of(ev: &Event) -> Option<&str> {
    if (kinds::GROUP_METADATA..=kinds::GROUP_ROLES).contains(&ev.kind) {
        return ev.tag_value("d");
    }
    ev.tag_value("h").filter(|h| !h.is_empty())
}

fn keys(ev: &Event) -> Result<Vec<&str>, ActionError> {
    let keys: Vec<&str> = ev.tag_values("p").collect();
    if keys.is_empty() {
        return Err(ActionError::MissingTag("p"));
    }
    if keys.iter().any(|k| !is_hex64(k)) {
        return Err(ActionError::BadTag("p"));
    }
    Ok(keys)
}

fn metadata(ev: &Event) -> MetadataEdit {
    let mut edit = MetadataEdit::default();
    for tag in &ev.tags {
        match tag.name() {
            "name" => edit.name = tag.value().map(str::to_string),
            "about" => edit.about = tag.value().map(str::to_string),
            "picture" => edit.picture = tag.value().map(str::to_string),
            "private" => edit.private = Some(true),
            "public" => edit.private = Some(false),
            "closed" => edit.closed = Some(true),
            "open" => edit.closed = Some(false),
            "hidden" => edit.hidden = Some(true),
            "visible" => edit.hidden = Some(false),
            _ => {}
        }
    }
    edit
}

/// Parse the moderation action an event of an action kind carries.
pub fn parse(ev: &Event) -> Result<Moderation, ActionError> {
    let group = ev
        .tag_value("h")
        .filter(|h| !h.is_empty())
        .ok_or(ActionError::MissingGroup)?
        .to_string();
    let action = match ev.kind {
        kinds::GROUP_CREATE => Action::CreateGroup,
        kinds::GROUP_DELETE => Action::DeleteGroup,
        kinds::GROUP_EDIT_METADATA => Action::EditMetadata(metadata(ev)),
        kinds::GROUP_PUT_USER => {
            keys(ev)?;
            Action::PutUser(
                ev.tags_named("p")
                    .map(|t| {
                        let pk = t.get(1).unwrap_or_default().to_string();
                        let roles = t.0.iter().skip(2).filter(|r| !r.is_empty()).cloned().collect();
                        (pk, roles)
                    })
                    .collect(),
            )
        }
        kinds::GROUP_REMOVE_USER => {
            Action::RemoveUser(keys(ev)?.into_iter().map(str::to_string).collect())
        }
        kinds::GROUP_DELETE_EVENT => {
            let ids: Vec<String> = ev.tag_values("e").map(str::to_string).collect();
            if ids.is_empty() {
                return Err(ActionError::MissingTag("e"));
            }
            if ids.iter().any(|id| !is_hex64(id)) {
                return Err(ActionError::BadTag("e"));
            }
            Action::DeleteEvent(ids)
        }
        kinds::GROUP_CREATE_INVITE => {
            let code = ev
                .tag_value("code")
                .filter(|c| !c.is_empty())
                .ok_or(ActionError::MissingTag("code"))?;
            Action::CreateInvite(code.to_string())
        }
        kinds::GROUP_JOIN_REQUEST => Action::JoinRequest {
            code: ev.tag_value("code").map(str::to_string),
        },
        kinds::GROUP_LEAVE_REQUEST => Action::LeaveRequest,
        other => return Err(ActionError::NotAction(other)),
    };
    Ok(Moderation { group, action })
}
