// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The chat event taxonomy.
//!
//! Every protocol message is a [`ChatMsgEvent`], identified on the wire by a
//! dotted tag. Events the decoder does not recognize are kept verbatim as
//! [`ChatMsgEvent::Unknown`] so they survive storage and can be rendered as
//! unknown chat items.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    identifiers::{ConnReqUri, GroupLinkId, MemberId, Probe, ProbeHash, SharedMsgId},
    profile::{GroupMemberRole, GroupProfile, Profile},
};

use super::content::{FileDescrPart, FileInvitation, MsgContainer, MsgContent};

/// Opaque call identifier chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMedia {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInvitationWire {
    #[serde(rename = "callType")]
    pub media: CallMedia,
    #[serde(rename = "callDhPubKey", skip_serializing_if = "Option::is_none")]
    pub dh_pub_key: Option<String>,
}

/// Opaque WebRTC session payload, relayed between peers unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebRtcSession(pub Value);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberIdRole {
    #[serde(rename = "memberId")]
    pub member_id: MemberId,
    pub role: GroupMemberRole,
}

/// Description of a group member, announced and introduced by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    #[serde(rename = "memberId")]
    pub member_id: MemberId,
    pub role: GroupMemberRole,
    pub profile: Profile,
}

/// The two connection requests a member prepares for an introduced peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroInvitation {
    #[serde(rename = "groupConnReq")]
    pub group_conn_req: ConnReqUri,
    #[serde(rename = "directConnReq", skip_serializing_if = "Option::is_none")]
    pub direct_conn_req: Option<ConnReqUri>,
}

/// Invitation to a group, sent over the direct contact connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvitation {
    #[serde(rename = "fromMember")]
    pub from_member: MemberIdRole,
    #[serde(rename = "invitedMember")]
    pub invited_member: MemberIdRole,
    #[serde(rename = "connRequest")]
    pub conn_request: ConnReqUri,
    #[serde(rename = "groupProfile")]
    pub group_profile: GroupProfile,
    #[serde(rename = "groupLinkId", skip_serializing_if = "Option::is_none")]
    pub group_link_id: Option<GroupLinkId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMsgEvent {
    MsgNew(MsgContainer),
    MsgUpdate {
        msg_id: SharedMsgId,
        content: MsgContent,
    },
    MsgDel {
        msg_id: SharedMsgId,
        member_id: Option<MemberId>,
    },
    MsgFileDescr {
        msg_id: SharedMsgId,
        file_descr: FileDescrPart,
    },
    MsgFileCancel {
        msg_id: SharedMsgId,
    },
    FileInv(FileInvitation),
    FileAcpt {
        file_name: String,
    },
    FileAcptInv {
        msg_id: SharedMsgId,
        file_conn_req: Option<ConnReqUri>,
        file_name: String,
    },
    FileCancel {
        msg_id: SharedMsgId,
    },
    Info(Profile),
    Contact(Profile),
    InfoProbe(Probe),
    InfoProbeCheck(ProbeHash),
    InfoProbeOk(Probe),
    GrpInv(GroupInvitation),
    GrpAcpt {
        member_id: MemberId,
    },
    GrpMemNew(MemberInfo),
    GrpMemIntro(MemberInfo),
    GrpMemInv {
        member_id: MemberId,
        intro_inv: IntroInvitation,
    },
    GrpMemFwd {
        member: MemberInfo,
        intro_inv: IntroInvitation,
    },
    GrpMemInfo {
        member_id: MemberId,
        profile: Profile,
    },
    GrpMemRole {
        member_id: MemberId,
        role: GroupMemberRole,
    },
    GrpMemDel {
        member_id: MemberId,
    },
    GrpLeave,
    GrpDel,
    GrpInfo(GroupProfile),
    CallInv {
        call_id: CallId,
        invitation: CallInvitationWire,
    },
    CallOffer {
        call_id: CallId,
        offer: WebRtcSession,
    },
    CallAnswer {
        call_id: CallId,
        answer: WebRtcSession,
    },
    CallExtra {
        call_id: CallId,
        extra: WebRtcSession,
    },
    CallEnd {
        call_id: CallId,
    },
    Ok,
    /// Forward-compatible passthrough of unrecognized tags.
    Unknown {
        tag: String,
        params: Value,
    },
    /// Binary inline file chunk (never JSON-encoded).
    FileChunk {
        chunk_no: u32,
        chunk: Vec<u8>,
    },
    /// Binary single-byte cancellation of an inline transfer.
    FileChunkCancel,
}

impl ChatMsgEvent {
    /// The dotted wire tag of this event.
    ///
    /// Binary events have no JSON tag; they are reported here for logging
    /// only.
    pub fn tag(&self) -> &str {
        match self {
            Self::MsgNew(_) => "x.msg.new",
            Self::MsgUpdate { .. } => "x.msg.update",
            Self::MsgDel { .. } => "x.msg.del",
            Self::MsgFileDescr { .. } => "x.msg.file.descr",
            Self::MsgFileCancel { .. } => "x.msg.file.cancel",
            Self::FileInv(_) => "x.file",
            Self::FileAcpt { .. } => "x.file.acpt",
            Self::FileAcptInv { .. } => "x.file.acpt.inv",
            Self::FileCancel { .. } => "x.file.cancel",
            Self::Info(_) => "x.info",
            Self::Contact(_) => "x.contact",
            Self::InfoProbe(_) => "x.info.probe",
            Self::InfoProbeCheck(_) => "x.info.probe.check",
            Self::InfoProbeOk(_) => "x.info.probe.ok",
            Self::GrpInv(_) => "x.grp.inv",
            Self::GrpAcpt { .. } => "x.grp.acpt",
            Self::GrpMemNew(_) => "x.grp.mem.new",
            Self::GrpMemIntro(_) => "x.grp.mem.intro",
            Self::GrpMemInv { .. } => "x.grp.mem.inv",
            Self::GrpMemFwd { .. } => "x.grp.mem.fwd",
            Self::GrpMemInfo { .. } => "x.grp.mem.info",
            Self::GrpMemRole { .. } => "x.grp.mem.role",
            Self::GrpMemDel { .. } => "x.grp.mem.del",
            Self::GrpLeave => "x.grp.leave",
            Self::GrpDel => "x.grp.del",
            Self::GrpInfo(_) => "x.grp.info",
            Self::CallInv { .. } => "x.call.inv",
            Self::CallOffer { .. } => "x.call.offer",
            Self::CallAnswer { .. } => "x.call.answer",
            Self::CallExtra { .. } => "x.call.extra",
            Self::CallEnd { .. } => "x.call.end",
            Self::Ok => "x.ok",
            Self::Unknown { tag, .. } => tag,
            Self::FileChunk { .. } => "F",
            Self::FileChunkCancel => "F.cancel",
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::FileChunk { .. } | Self::FileChunkCancel)
    }
}
