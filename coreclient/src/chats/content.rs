// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed content of a rendered chat item.
//!
//! Stored as a JSON column; the `type` tag keeps the column readable and
//! forward-compatible. Unknown wire events surface as [`CIContent::RcvUnknown`]
//! so nothing a newer peer sends is lost.

use couriercommon::{messages::MsgContent, profile::GroupMemberRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchPhaseCI {
    Started,
    Confirmed,
    SecuredQueue,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RcvGroupEventCI {
    MemberAdded { member: String },
    MemberConnected,
    MemberLeft,
    MemberRole { member: String, role: GroupMemberRole },
    MemberDeleted { member: String },
    UserDeleted,
    GroupDeleted,
    GroupUpdated,
    InvitedViaGroupLink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SndGroupEventCI {
    MemberRole { member: String, role: GroupMemberRole },
    MemberDeleted { member: String },
    UserLeft,
    GroupUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatusCI {
    Pending,
    Missed,
    Rejected,
    Accepted,
    Negotiated,
    Ended,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CIContent {
    SndMsgContent {
        #[serde(rename = "msgContent")]
        msg_content: MsgContent,
    },
    RcvMsgContent {
        #[serde(rename = "msgContent")]
        msg_content: MsgContent,
    },
    SndDeleted,
    RcvDeleted,
    SndCall {
        status: CallStatusCI,
    },
    RcvCall {
        status: CallStatusCI,
    },
    RcvIntegrityError {
        err: String,
    },
    RcvGroupInvitation {
        #[serde(rename = "groupDisplayName")]
        group_display_name: String,
        role: GroupMemberRole,
    },
    SndGroupInvitation {
        #[serde(rename = "groupDisplayName")]
        group_display_name: String,
        role: GroupMemberRole,
    },
    RcvGroupEvent {
        #[serde(rename = "rcvGroupEvent")]
        event: RcvGroupEventCI,
    },
    SndGroupEvent {
        #[serde(rename = "sndGroupEvent")]
        event: SndGroupEventCI,
    },
    SndConnEvent {
        phase: SwitchPhaseCI,
    },
    RcvConnEvent {
        phase: SwitchPhaseCI,
    },
    FeatureNotice {
        feature: String,
        enabled: bool,
    },
    RcvUnknown {
        tag: String,
        json: Value,
    },
}

impl CIContent {
    /// Plain-text rendering stored next to the JSON for search.
    pub fn text(&self) -> String {
        match self {
            Self::SndMsgContent { msg_content } | Self::RcvMsgContent { msg_content } => {
                msg_content.text().to_owned()
            }
            Self::SndDeleted | Self::RcvDeleted => "deleted".to_owned(),
            Self::SndCall { status } | Self::RcvCall { status } => format!("call: {status:?}"),
            Self::RcvIntegrityError { err } => format!("integrity error: {err}"),
            Self::RcvGroupInvitation {
                group_display_name, ..
            } => format!("invitation to join group {group_display_name}"),
            Self::SndGroupInvitation {
                group_display_name, ..
            } => format!("invited to group {group_display_name}"),
            Self::RcvGroupEvent { event } => match event {
                RcvGroupEventCI::MemberAdded { member } => format!("added {member}"),
                RcvGroupEventCI::MemberConnected => "connected".to_owned(),
                RcvGroupEventCI::MemberLeft => "left".to_owned(),
                RcvGroupEventCI::MemberRole { member, role } => {
                    format!("changed role of {member} to {role}")
                }
                RcvGroupEventCI::MemberDeleted { member } => format!("removed {member}"),
                RcvGroupEventCI::UserDeleted => "removed you".to_owned(),
                RcvGroupEventCI::GroupDeleted => "deleted group".to_owned(),
                RcvGroupEventCI::GroupUpdated => "updated group profile".to_owned(),
                RcvGroupEventCI::InvitedViaGroupLink => "invited via group link".to_owned(),
            },
            Self::SndGroupEvent { event } => match event {
                SndGroupEventCI::MemberRole { member, role } => {
                    format!("you changed role of {member} to {role}")
                }
                SndGroupEventCI::MemberDeleted { member } => format!("you removed {member}"),
                SndGroupEventCI::UserLeft => "you left".to_owned(),
                SndGroupEventCI::GroupUpdated => "you updated group profile".to_owned(),
            },
            Self::SndConnEvent { phase } | Self::RcvConnEvent { phase } => {
                format!("address change: {phase:?}")
            }
            Self::FeatureNotice { feature, enabled } => {
                let state = if *enabled { "enabled" } else { "off" };
                format!("{feature}: {state}")
            }
            Self::RcvUnknown { tag, .. } => format!("unknown message type: {tag}"),
        }
    }

    pub fn msg_content(&self) -> Option<&MsgContent> {
        match self {
            Self::SndMsgContent { msg_content } | Self::RcvMsgContent { msg_content } => {
                Some(msg_content)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_json_round_trip() {
        let content = CIContent::RcvGroupEvent {
            event: RcvGroupEventCI::MemberRole {
                member: "bob".into(),
                role: GroupMemberRole::Admin,
            },
        };
        let json = serde_json::to_string(&content).unwrap();
        let back: CIContent = serde_json::from_str(&json).unwrap();
        assert_eq!(content, back);
    }

    #[test]
    fn unknown_content_keeps_payload() {
        let content = CIContent::RcvUnknown {
            tag: "x.new.thing".into(),
            json: serde_json::json!({ "a": 1 }),
        };
        let json = serde_json::to_string(&content).unwrap();
        let back: CIContent = serde_json::from_str(&json).unwrap();
        assert_eq!(content, back);
    }
}
