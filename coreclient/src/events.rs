// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Responses and view events.
//!
//! Commands return exactly one [`ChatResponse`]; everything the processor
//! and scheduler produce asynchronously arrives on the bounded view channel
//! as the same type. A slow view reader back-pressures the producers.

use std::collections::HashMap;

use courieragentclient::{
    NetworkConfig, NtfTokenStatus, ProtocolServer, ServerTestFailure, SwitchPhase,
};
use couriercommon::{
    identifiers::{AgentConnId, ConnReqUri},
    messages::{CallId, CallMedia, WebRtcSession},
};
use tokio::sync::mpsc;

use crate::{
    chats::{ChatItem, ChatPreview, ChatRef},
    contacts::{Contact, ContactRequest, UserContactLink},
    error::ChatError,
    groups::{Group, GroupMember},
    store::{ContactId, FileId},
    users::User,
};

/// Subscription outcome for one contact connection.
#[derive(Debug)]
pub struct ContactSubStatus {
    pub contact_id: ContactId,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum ChatResponse {
    CmdOk,

    // users & chat lifecycle
    ActiveUser(User),
    UsersList(Vec<User>),
    ChatStarted,
    ChatStopped,
    ChatSuspended,
    ContactSubSummary(Vec<ContactSubStatus>),

    // reads
    Chats(Vec<ChatPreview>),
    ChatItems {
        chat_ref: ChatRef,
        items: Vec<ChatItem>,
    },

    // messaging
    NewChatItem(ChatItem),
    ChatItemUpdated(ChatItem),
    ChatItemDeleted {
        deleted_item: ChatItem,
        to_item: Option<ChatItem>,
        by_user: bool,
        timed: bool,
    },

    // connections & contacts
    Invitation {
        conn_req: ConnReqUri,
    },
    SentConfirmation,
    SentInvitation,
    ContactsList(Vec<Contact>),
    ContactInfo {
        contact: Contact,
        rcv_servers: Vec<String>,
        snd_servers: Vec<String>,
    },
    ContactConnecting(Contact),
    ContactConnected(Contact),
    ContactUpdated(Contact),
    ContactAliasUpdated(Contact),
    ContactDeleted(ContactId),
    ContactsMerged {
        into_contact: Contact,
        merged_contact_id: ContactId,
    },
    ContactCode {
        contact_id: ContactId,
        code: String,
    },
    ConnectionVerified {
        verified: bool,
        code: String,
    },
    SwitchProgress {
        chat_ref: ChatRef,
        phase: SwitchPhase,
    },
    ConnectionDisabled {
        chat_ref: ChatRef,
    },
    ReceivedContactRequest(ContactRequest),
    AcceptingContactRequest(ContactRequest),
    ContactRequestRejected(i64),

    // address
    UserContactLinkCreated {
        conn_req: ConnReqUri,
    },
    UserContactLink(UserContactLink),
    UserContactLinkUpdated(UserContactLink),
    UserContactLinkDeleted,

    // groups
    GroupCreated(Group),
    GroupsList(Vec<Group>),
    GroupMembers {
        group: Group,
        members: Vec<GroupMember>,
    },
    SentGroupInvitation {
        group: Group,
        contact: Contact,
        member: GroupMember,
    },
    ReceivedGroupInvitation {
        group: Group,
        from_contact: ContactId,
    },
    UserAcceptedGroup(Group),
    UserJoinedGroup(Group),
    JoinedGroupMember {
        group: Group,
        member: GroupMember,
    },
    JoinedGroupMemberConnecting {
        group: Group,
        member: GroupMember,
    },
    ConnectedToGroupMember {
        group: Group,
        member: GroupMember,
    },
    MemberRole {
        group: Group,
        member: GroupMember,
    },
    DeletedMember {
        group: Group,
        member: GroupMember,
    },
    DeletedMemberUser(Group),
    LeftMember {
        group: Group,
        member: GroupMember,
    },
    LeftMemberUser(Group),
    GroupDeleted(Group),
    GroupDeletedUser(Group),
    GroupUpdated(Group),
    GroupLinkCreated {
        group: Group,
        conn_req: ConnReqUri,
    },
    GroupLink {
        conn_req: ConnReqUri,
    },
    GroupLinkDeleted,

    // files
    FileTransferStatus {
        meta: crate::files::FileTransferMeta,
        snd_transfers: Vec<crate::files::SndFileTransfer>,
        rcv_transfer: Option<crate::files::RcvFileTransfer>,
    },
    SndFileStart {
        file_id: FileId,
    },
    SndFileComplete {
        file_id: FileId,
    },
    SndFileCancelled {
        file_id: FileId,
    },
    SndFileRcvCancelled {
        file_id: FileId,
    },
    SndFileProgressXftp {
        file_id: FileId,
        sent: i64,
        total: i64,
    },
    SndFileCompleteXftp {
        file_id: FileId,
    },
    RcvFileAccepted(ChatItem),
    RcvFileStart {
        file_id: FileId,
    },
    RcvFileComplete {
        file_id: FileId,
        target_path: String,
    },
    RcvFileCancelled {
        file_id: FileId,
    },
    RcvFileSndCancelled {
        file_id: FileId,
    },
    RcvFileProgressXftp {
        file_id: FileId,
        received: i64,
        total: i64,
    },

    // calls
    CallInvitation {
        contact_id: ContactId,
        call_id: CallId,
        media: CallMedia,
    },
    CallOffer {
        contact_id: ContactId,
        call_id: CallId,
        offer: WebRtcSession,
    },
    CallAnswer {
        contact_id: ContactId,
        call_id: CallId,
        answer: WebRtcSession,
    },
    CallExtraInfo {
        contact_id: ContactId,
        extra: WebRtcSession,
    },
    CallEnded {
        contact_id: ContactId,
    },

    // settings, servers, notifications
    NetworkConfig(NetworkConfig),
    ChatItemTtl {
        ttl: Option<i64>,
    },
    UserServers {
        servers: Vec<ProtocolServer>,
    },
    ServerTestResult {
        server: ProtocolServer,
        failure: Option<ServerTestFailure>,
    },
    NtfToken {
        status: NtfTokenStatus,
    },
    NtfMessages {
        agent_conn_id: AgentConnId,
        count: usize,
    },

    // introspection
    AgentStats(HashMap<String, i64>),
    DebugLocks {
        chat_lock: Option<String>,
        agent_locks: Vec<String>,
    },

    // errors
    ChatCmdError(ChatError),
    ChatError(ChatError),
}

/// Bounded fan-out to the view layer.
#[derive(Debug, Clone)]
pub struct ChatEventSender {
    tx: mpsc::Sender<ChatResponse>,
}

impl ChatEventSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatResponse>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Delivers an event, waiting for channel space: a slow reader slows
    /// the producers instead of dropping events.
    pub(crate) async fn emit(&self, response: ChatResponse) {
        let _ = self.tx.send(response).await;
    }
}
