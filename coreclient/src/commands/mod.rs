// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The typed command surface of the controller.
//!
//! Commands arrive either through the textual protocol (see [`parser`]) or
//! constructed directly by an embedding application. API forms address
//! entities by database id; the user-friendly aliases use display names,
//! resolved by the dispatcher.

use std::path::PathBuf;

use courieragentclient::{DeviceToken, NetworkConfig, NtfMode, ProtocolServer};
use couriercommon::{
    identifiers::ConnReqUri,
    messages::{CallMedia, MsgContent, WebRtcSession},
    profile::{GroupMemberRole, GroupProfile, Preferences, Profile},
};

use crate::{
    chats::{ChatName, ChatRef, CIPagination},
    store::{ChatItemId, ContactId, FileId, GroupId, GroupMemberId, UserId},
};

pub mod parser;

/// Contact addressed by id (API forms) or display name (friendly forms).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactTarget {
    Id(ContactId),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupTarget {
    Id(GroupId),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Ref(ChatRef),
    Name(ChatName),
}

/// Message body of a send command.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedMessage {
    pub msg_content: MsgContent,
    pub file_path: Option<PathBuf>,
    pub quoted_item_id: Option<ChatItemId>,
}

impl ComposedMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            msg_content: MsgContent::Text(text.into()),
            file_path: None,
            quoted_item_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CIDeleteMode {
    Broadcast,
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    // chat lifecycle
    StartChat {
        subscribe: bool,
        expire: bool,
    },
    StopChat,
    ActivateChat,
    SuspendChat {
        drain_secs: u64,
    },
    ResubscribeAll,
    SetFilesFolder(PathBuf),
    SetTempFolder(PathBuf),
    StorageEncryption {
        current_key: Option<String>,
        new_key: Option<String>,
    },

    // user lifecycle
    CreateActiveUser {
        profile: Profile,
    },
    ListUsers,
    ShowActiveUser,
    SetActiveUser {
        user_id: UserId,
        view_pwd: Option<String>,
    },
    HideUser {
        user_id: UserId,
        view_pwd: String,
    },
    UnhideUser {
        user_id: UserId,
        view_pwd: String,
    },
    MuteUser {
        user_id: UserId,
    },
    UnmuteUser {
        user_id: UserId,
    },
    DeleteUser {
        user_id: UserId,
        view_pwd: Option<String>,
    },
    UpdateProfile {
        profile: Profile,
    },

    // reads
    GetChats,
    GetChat {
        chat_ref: ChatRef,
        pagination: CIPagination,
        search: Option<String>,
    },

    // messaging
    SendMessage {
        chat: ChatTarget,
        live: bool,
        ttl: Option<i64>,
        message: ComposedMessage,
    },
    UpdateChatItem {
        chat_ref: ChatRef,
        chat_item_id: ChatItemId,
        live: bool,
        msg_content: MsgContent,
    },
    DeleteChatItem {
        chat_ref: ChatRef,
        chat_item_id: ChatItemId,
        mode: CIDeleteMode,
    },

    // groups
    NewGroup {
        profile: GroupProfile,
    },
    AddMember {
        group: GroupTarget,
        contact: ContactTarget,
        role: GroupMemberRole,
    },
    JoinGroup {
        group: GroupTarget,
    },
    MemberRole {
        group: GroupTarget,
        group_member_id: GroupMemberId,
        role: GroupMemberRole,
    },
    RemoveMember {
        group: GroupTarget,
        group_member_id: GroupMemberId,
    },
    LeaveGroup {
        group: GroupTarget,
    },
    ListMembers {
        group: GroupTarget,
    },
    ListGroups,
    UpdateGroupProfile {
        group: GroupTarget,
        profile: GroupProfile,
    },
    CreateGroupLink {
        group: GroupTarget,
    },
    DeleteGroupLink {
        group: GroupTarget,
    },
    ShowGroupLink {
        group: GroupTarget,
    },

    // contacts & connections
    AddContact,
    Connect {
        conn_req: ConnReqUri,
    },
    AcceptContact {
        contact_request_id: i64,
    },
    RejectContact {
        contact_request_id: i64,
    },
    ListContacts,
    DeleteChat {
        chat: ChatTarget,
    },
    ClearChat {
        chat: ChatTarget,
    },
    SetContactAlias {
        contact_id: ContactId,
        alias: String,
    },
    SetContactPrefs {
        contact_id: ContactId,
        preferences: Preferences,
    },
    ContactInfo {
        contact: ContactTarget,
    },
    GetContactCode {
        contact: ContactTarget,
    },
    VerifyContact {
        contact: ContactTarget,
        code: Option<String>,
    },
    EnableContact {
        contact: ContactTarget,
    },
    SwitchContact {
        contact: ContactTarget,
    },
    SetChatNtfs {
        chat_ref: ChatRef,
        enable: bool,
    },

    // files
    SendFile {
        chat: ChatTarget,
        path: PathBuf,
    },
    ReceiveFile {
        file_id: FileId,
        path: Option<PathBuf>,
    },
    CancelFile {
        file_id: FileId,
    },
    FileStatus {
        file_id: FileId,
    },
    ForwardFile {
        chat: ChatTarget,
        file_id: FileId,
    },

    // calls
    SendCallInvitation {
        contact: ContactTarget,
        media: CallMedia,
    },
    RejectCall {
        contact: ContactTarget,
    },
    SendCallOffer {
        contact: ContactTarget,
        offer: WebRtcSession,
    },
    SendCallAnswer {
        contact: ContactTarget,
        answer: WebRtcSession,
    },
    SendCallExtra {
        contact: ContactTarget,
        extra: WebRtcSession,
    },
    EndCall {
        contact: ContactTarget,
    },

    // address
    CreateMyAddress,
    DeleteMyAddress,
    ShowMyAddress,
    AddressAutoAccept {
        enable: bool,
        incognito: bool,
        auto_reply: Option<MsgContent>,
    },

    // servers & settings
    GetUserServers {
        user_id: UserId,
    },
    SetUserServers {
        user_id: UserId,
        servers: Vec<ProtocolServer>,
    },
    TestServer {
        user_id: UserId,
        server: ProtocolServer,
    },
    SetChatItemTtl {
        user_id: UserId,
        ttl: Option<i64>,
    },
    GetChatItemTtl {
        user_id: UserId,
    },
    SetNetworkConfig(NetworkConfig),
    GetNetworkConfig,

    // notifications
    RegisterNtfToken {
        token: DeviceToken,
        mode: NtfMode,
    },
    VerifyNtfToken {
        token: DeviceToken,
        nonce: Vec<u8>,
        code: Vec<u8>,
    },
    DeleteNtfToken {
        token: DeviceToken,
    },
    GetNtfMessage {
        nonce: Vec<u8>,
        enc_payload: Vec<u8>,
    },

    // introspection
    GetAgentStats,
    DebugLocks,
}
