// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Events on direct contact connections.

use chrono::{Duration, Utc};
use courieragentclient::{AgentApi, AgentEvent};
use couriercommon::{
    identifiers::{Probe, ProbeHash, SharedMsgId},
    messages::{
        ChatMessage, ChatMsgEvent, FileInvitation, MsgContainer, MsgContent, QuotedMsg,
    },
    profile::Profile,
};
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use crate::{
    calls::{Call, CallState},
    chats::{
        CIContent, CIDirection, CIQuote, CITimed, ChatItem, ChatRef, NewChatItem,
        content::CallStatusCI,
    },
    connections::{ConnStatus, Connection},
    contacts::{Contact, ReceivedProbe, SentProbe, UserContactLink, unique_display_name},
    error::ChatError,
    events::ChatResponse,
    files::{
        FileProtocol, FileStatus, FileTransferMeta, NewFileMeta, NewRcvFile, RcvFileTransfer,
        SndFileTransfer,
        engine::unique_target_path,
    },
    groups::{Group, GroupMember, GroupMemberCategory, GroupMemberStatus, NewGroupMember},
    store::StoreError,
    users::User,
};

use super::{ChatController, RcvMessage};

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(super) async fn process_contact_event(
        &self,
        mut connection: Connection,
        event: AgentEvent,
    ) -> Result<(), ChatError> {
        let chat_ref = connection.contact_id.map(ChatRef::Direct);
        match event {
            AgentEvent::Confirmation {
                confirmation_id,
                conn_info,
            } => {
                let user = self.current_user()?;
                let message = ChatMessage::decode(&conn_info)?;
                match message.event {
                    ChatMsgEvent::Info(profile) => {
                        self.save_peer_profile(&user, &mut connection, profile).await?;
                    }
                    ChatMsgEvent::GrpMemInfo { member_id, profile } => {
                        // direct channel opened through a group introduction
                        self.save_peer_profile(&user, &mut connection, profile).await?;
                        debug!(%member_id, "direct connection from introduced member");
                    }
                    other => {
                        warn!(tag = other.tag(), "unexpected confirmation payload");
                    }
                }
                let reply = ChatMessage::new(None, ChatMsgEvent::Info(user.profile.clone()))
                    .encode(false)?;
                let corr_id = self
                    .reserve_corr_id(Some(user.user_id), Some(connection.conn_id), "allow")
                    .await?;
                self.agent()
                    .allow_connection(corr_id, &connection.agent_conn_id, &confirmation_id, reply)
                    .await?;
                connection
                    .update_status(self.pool(), ConnStatus::Accepted)
                    .await?;
                self.emit(ChatResponse::SentConfirmation).await;
                Ok(())
            }
            AgentEvent::Info { conn_info } => {
                let user = self.current_user()?;
                let message = ChatMessage::decode(&conn_info)?;
                if let ChatMsgEvent::Info(profile) = message.event {
                    self.save_peer_profile(&user, &mut connection, profile).await?;
                }
                Ok(())
            }
            AgentEvent::Connected => self.contact_connected(connection).await,
            AgentEvent::Msg { meta, body, .. } => {
                let Some(received) = self
                    .store_rcv_message(&connection, meta.agent_msg_id, &body)
                    .await?
                else {
                    return self.ack_rcv_message(&connection, meta.agent_msg_id).await;
                };
                let result = self
                    .handle_contact_message(&mut connection, received, meta.broker_ts)
                    .await;
                // a failing message must not leave the queue blocked
                self.ack_rcv_message(&connection, meta.agent_msg_id).await?;
                result
            }
            other => {
                self.process_common_conn_event(&mut connection, chat_ref, &other)
                    .await?;
                Ok(())
            }
        }
    }

    async fn contact_connected(&self, mut connection: Connection) -> Result<(), ChatError> {
        let user = self.current_user()?;
        connection
            .update_status(self.pool(), ConnStatus::Ready)
            .await?;
        let Some(contact_id) = connection.contact_id else {
            debug!(connection_id = connection.conn_id, "connected without contact");
            return Ok(());
        };
        let contact = Contact::load(self.pool(), contact_id).await?;
        info!(contact_id, "contact connected");
        self.emit(ChatResponse::ContactConnected(contact.clone())).await;
        self.feature_notice_items(&user, &contact).await?;

        // duplicate-identity detection once the same peer exists as a member
        if !connection.incognito()
            && GroupMember::any_for_contact(self.pool(), contact_id).await?
        {
            self.send_probe(&user, &contact, &connection).await?;
        }

        // address auto-accept extras: auto-reply and group-link admission
        if let Some(link_id) = connection.user_contact_link_id {
            let link = UserContactLink::load(self.pool(), link_id).await?;
            if let Some(auto_reply) = link.auto_reply.clone() {
                let container = MsgContainer::Simple(
                    couriercommon::messages::ExtMsgContent::plain(auto_reply.clone()),
                );
                let (message, body) = self
                    .create_snd_message(user.user_id, |_| ChatMsgEvent::MsgNew(container))
                    .await?;
                self.deliver_message(&connection, &message, body).await?;
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem {
                        shared_msg_id: message.shared_msg_id,
                        created_by_msg_id: Some(message.message_id),
                        ..NewChatItem::internal(
                            user.user_id,
                            ChatRef::Direct(contact_id),
                            CIDirection::Snd,
                            CIContent::SndMsgContent {
                                msg_content: auto_reply,
                            },
                        )
                    },
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
            }
            if let Some(group_id) = link.group_id {
                let group = Group::load(self.pool(), group_id).await?;
                if let Err(error) = self
                    .invite_link_contact_to_group(group, contact.clone(), &connection)
                    .await
                {
                    warn!(contact_id, %error, "group link admission failed");
                }
            }
        }
        Ok(())
    }

    async fn invite_link_contact_to_group(
        &self,
        group: Group,
        contact: Contact,
        connection: &Connection,
    ) -> Result<(), ChatError> {
        let user = self.current_user()?;
        let membership = GroupMember::load_membership(self.pool(), group.group_id).await?;
        let member = GroupMember::store(
            self.pool(),
            group.group_id,
            NewGroupMember {
                member_id: couriercommon::identifiers::MemberId::random(&mut OsRng),
                member_role: couriercommon::profile::GroupMemberRole::Member,
                member_status: GroupMemberStatus::Invited,
                member_category: GroupMemberCategory::InviteeMember,
                invited_by: Some(membership.group_member_id),
                profile: contact.profile.clone(),
                contact_id: Some(contact.contact_id),
            },
        )
        .await?;
        let (agent_conn_id, conn_req) = self
            .agent()
            .create_connection(user.agent_user_id, courieragentclient::ConnectionMode::Invitation)
            .await?;
        Connection::store(
            self.pool(),
            user.user_id,
            &agent_conn_id,
            ConnStatus::New,
            crate::connections::ConnType::GroupMember,
            crate::connections::NewConnection {
                group_member_id: Some(member.group_member_id),
                ..Default::default()
            },
        )
        .await?;
        let link = UserContactLink::load_for_group(self.pool(), group.group_id).await?;
        let invitation = couriercommon::messages::GroupInvitation {
            from_member: couriercommon::messages::MemberIdRole {
                member_id: membership.member_id,
                role: membership.member_role,
            },
            invited_member: couriercommon::messages::MemberIdRole {
                member_id: member.member_id,
                role: member.member_role,
            },
            conn_request: conn_req,
            group_profile: group.profile.clone(),
            group_link_id: link.and_then(|link| link.group_link_id),
        };
        let (message, body) = self
            .create_snd_message(user.user_id, |_| ChatMsgEvent::GrpInv(invitation))
            .await?;
        self.deliver_message(connection, &message, body).await?;
        Ok(())
    }

    pub(super) async fn handle_contact_message(
        &self,
        connection: &mut Connection,
        received: RcvMessage,
        broker_ts: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ChatError> {
        let user = self.current_user()?;
        let contact_id = connection
            .contact_id
            .ok_or_else(|| ChatError::Internal("message on unbound contact connection".into()))?;
        let contact = Contact::load(self.pool(), contact_id).await?;
        let chat_ref = ChatRef::Direct(contact_id);
        let shared_msg_id = received.chat_message.shared_msg_id;

        match received.chat_message.event {
            ChatMsgEvent::MsgNew(container) => {
                self.new_rcv_item(
                    &user,
                    chat_ref,
                    None,
                    &container,
                    shared_msg_id,
                    received.message.message_id,
                    broker_ts,
                )
                .await?;
                Contact::update_chat_ts(self.pool(), contact_id, Utc::now()).await?;
                Ok(())
            }
            ChatMsgEvent::MsgUpdate { msg_id, content } => {
                self.rcv_item_update(&user, chat_ref, None, msg_id, content, broker_ts)
                    .await
            }
            ChatMsgEvent::MsgDel { msg_id, .. } => {
                let full_delete = self
                    .direct_feature_enabled(&user, &contact, |p| p.full_delete)
                    .for_contact;
                self.rcv_item_delete(&user, chat_ref, None, msg_id, full_delete)
                    .await
            }
            ChatMsgEvent::MsgFileDescr { msg_id, file_descr } => {
                self.rcv_file_descr_part(&user, chat_ref, None, msg_id, file_descr)
                    .await
            }
            ChatMsgEvent::MsgFileCancel { msg_id } | ChatMsgEvent::FileCancel { msg_id } => {
                self.rcv_file_cancelled_by_sender(&user, chat_ref, None, msg_id)
                    .await
            }
            ChatMsgEvent::FileAcptInv {
                msg_id,
                file_conn_req,
                file_name,
            } => {
                self.snd_file_accepted(&user, chat_ref, msg_id, file_conn_req, file_name, connection)
                    .await
            }
            ChatMsgEvent::FileInv(invitation) => {
                // standalone file offer arrives as a file content message
                let container = MsgContainer::Simple(couriercommon::messages::ExtMsgContent {
                    content: MsgContent::File(invitation.file_name.clone()),
                    file: Some(invitation),
                    ttl: None,
                    live: None,
                });
                self.new_rcv_item(
                    &user,
                    chat_ref,
                    None,
                    &container,
                    shared_msg_id,
                    received.message.message_id,
                    broker_ts,
                )
                .await?;
                Ok(())
            }
            ChatMsgEvent::Info(profile) => {
                self.save_peer_profile(&user, connection, profile).await?;
                Ok(())
            }
            ChatMsgEvent::Contact(profile) => {
                self.save_peer_profile(&user, connection, profile).await?;
                Ok(())
            }
            ChatMsgEvent::InfoProbe(probe) => self.rcv_probe(&user, &contact, probe).await,
            ChatMsgEvent::InfoProbeCheck(hash) => {
                self.rcv_probe_check(&user, &contact, connection, hash).await
            }
            ChatMsgEvent::InfoProbeOk(probe) => self.rcv_probe_ok(&user, &contact, probe).await,
            ChatMsgEvent::GrpInv(invitation) => {
                self.rcv_group_invitation(&user, &contact, connection, invitation)
                    .await
            }
            ChatMsgEvent::CallInv {
                call_id,
                invitation,
            } => {
                self.rcv_call_invitation(&user, &contact, call_id, invitation)
                    .await
            }
            ChatMsgEvent::CallOffer { call_id, offer } => {
                let mut call = self.active_call(contact_id)?;
                if call.call_id != call_id || call.call_state != CallState::InvitationSent {
                    self.put_call(call);
                    debug!(contact_id, "call offer out of state; ignored");
                    return Ok(());
                }
                call.call_state = CallState::OfferReceived;
                call.upsert(self.pool()).await?;
                self.put_call(call);
                self.emit(ChatResponse::CallOffer {
                    contact_id,
                    call_id,
                    offer,
                })
                .await;
                Ok(())
            }
            ChatMsgEvent::CallAnswer { call_id, answer } => {
                let mut call = self.active_call(contact_id)?;
                if call.call_id != call_id || call.call_state != CallState::OfferSent {
                    self.put_call(call);
                    debug!(contact_id, "call answer out of state; ignored");
                    return Ok(());
                }
                call.call_state = CallState::Negotiated;
                call.upsert(self.pool()).await?;
                self.put_call(call);
                self.emit(ChatResponse::CallAnswer {
                    contact_id,
                    call_id,
                    answer,
                })
                .await;
                Ok(())
            }
            ChatMsgEvent::CallExtra { extra, .. } => {
                self.emit(ChatResponse::CallExtraInfo { contact_id, extra }).await;
                Ok(())
            }
            ChatMsgEvent::CallEnd { .. } => {
                self.inner()
                    .calls
                    .lock()
                    .expect("calls poisoned")
                    .remove(&contact_id);
                Call::delete(self.pool(), contact_id).await?;
                self.emit(ChatResponse::CallEnded { contact_id }).await;
                Ok(())
            }
            ChatMsgEvent::FileChunk { chunk_no, chunk } => {
                let msg_id = shared_msg_id.ok_or_else(|| {
                    ChatError::Internal("file chunk without shared message id".into())
                })?;
                self.rcv_inline_chunk(&user, chat_ref, None, msg_id, chunk_no, &chunk)
                    .await
            }
            ChatMsgEvent::FileChunkCancel => {
                debug!(contact_id, "inline cancel on messaging connection");
                Ok(())
            }
            ChatMsgEvent::Ok => Ok(()),
            ChatMsgEvent::Unknown { tag, params } => {
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem {
                        shared_msg_id,
                        item_ts: broker_ts,
                        ..NewChatItem::internal(
                            user.user_id,
                            chat_ref,
                            CIDirection::Rcv,
                            CIContent::RcvUnknown { tag, json: params },
                        )
                    },
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
                Ok(())
            }
            other => {
                debug!(tag = other.tag(), "event not permitted on contact connection");
                Ok(())
            }
        }
    }

    // profile & feature handling

    async fn save_peer_profile(
        &self,
        user: &User,
        connection: &mut Connection,
        profile: Profile,
    ) -> Result<(), ChatError> {
        match connection.contact_id {
            Some(contact_id) => {
                let mut contact = Contact::load(self.pool(), contact_id).await?;
                if contact.profile != profile {
                    contact.update_profile(self.pool(), &profile).await?;
                    self.emit(ChatResponse::ContactUpdated(contact)).await;
                }
            }
            None => {
                let contact = self
                    .with_transaction(async |txn| {
                        let name =
                            unique_display_name(txn.as_mut(), user.user_id, &profile.display_name)
                                .await?;
                        Contact::store(txn.as_mut(), user.user_id, &name, &profile).await
                    })
                    .await?;
                connection.set_contact_id(self.pool(), contact.contact_id).await?;
                self.emit(ChatResponse::ContactConnecting(contact)).await;
            }
        }
        Ok(())
    }

    async fn feature_notice_items(
        &self,
        user: &User,
        contact: &Contact,
    ) -> Result<(), ChatError> {
        let features = [
            ("timed messages", self.direct_feature_enabled(user, contact, |p| p.timed_messages)),
            ("full delete", self.direct_feature_enabled(user, contact, |p| p.full_delete)),
            ("voice", self.direct_feature_enabled(user, contact, |p| p.voice)),
        ];
        for (feature, enabled) in features {
            let item = ChatItem::store(
                self.pool(),
                &NewChatItem::internal(
                    user.user_id,
                    ChatRef::Direct(contact.contact_id),
                    CIDirection::Rcv,
                    CIContent::FeatureNotice {
                        feature: feature.to_owned(),
                        enabled: enabled.for_user,
                    },
                ),
            )
            .await?;
            self.emit(ChatResponse::NewChatItem(item)).await;
        }
        Ok(())
    }

    // received content items

    /// Creates the chat item of an incoming content message, including any
    /// attached file invitation, quote and timed-delete state.
    #[expect(clippy::too_many_arguments, reason = "single construction site")]
    pub(crate) async fn new_rcv_item(
        &self,
        user: &User,
        chat_ref: ChatRef,
        group_member_id: Option<i64>,
        container: &MsgContainer,
        shared_msg_id: Option<SharedMsgId>,
        message_id: i64,
        broker_ts: chrono::DateTime<chrono::Utc>,
    ) -> Result<ChatItem, ChatError> {
        let ext = container.ext_content();
        let file_id = match &ext.file {
            Some(invitation) => Some(
                self.create_rcv_file(user, chat_ref, invitation, ext.content.is_voice())
                    .await?,
            ),
            None => None,
        };
        let timed = ext.ttl.map(|ttl| CITimed {
            ttl,
            delete_at: Some(Utc::now() + Duration::seconds(ttl)),
        });
        let item = ChatItem::store(
            self.pool(),
            &NewChatItem {
                user_id: user.user_id,
                chat_ref,
                group_member_id,
                item_sent: CIDirection::Rcv,
                item_ts: broker_ts,
                shared_msg_id,
                content: CIContent::RcvMsgContent {
                    msg_content: ext.content.clone(),
                },
                file_id,
                quote: container.quote().map(rcv_quote),
                item_live: ext.live,
                timed,
                created_by_msg_id: Some(message_id),
            },
        )
        .await?;
        if item.timed.is_some() {
            self.schedule_timed_item(&item);
        }
        self.emit(ChatResponse::NewChatItem(item.clone())).await;
        Ok(item)
    }

    /// Applies a peer's edit; an unknown shared message id synthesizes a
    /// late item so subsequent deletes still resolve.
    pub(crate) async fn rcv_item_update(
        &self,
        user: &User,
        chat_ref: ChatRef,
        sender: Option<i64>,
        msg_id: SharedMsgId,
        content: MsgContent,
        broker_ts: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ChatError> {
        let found = ChatItem::load_by_shared_msg_id(
            self.pool(),
            user.user_id,
            chat_ref,
            sender,
            CIDirection::Rcv,
            &msg_id,
        )
        .await;
        match found {
            Ok(mut item) => {
                item.update_content(
                    self.pool(),
                    CIContent::RcvMsgContent {
                        msg_content: content,
                    },
                    None,
                )
                .await?;
                self.emit(ChatResponse::ChatItemUpdated(item)).await;
                Ok(())
            }
            Err(StoreError::ChatItemSharedMsgIdNotFound(_)) => {
                // out-of-order update: materialize a late item under this id
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem {
                        shared_msg_id: Some(msg_id),
                        group_member_id: sender,
                        item_ts: broker_ts,
                        ..NewChatItem::internal(
                            user.user_id,
                            chat_ref,
                            CIDirection::Rcv,
                            CIContent::RcvMsgContent {
                                msg_content: content,
                            },
                        )
                    },
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub(crate) async fn rcv_item_delete(
        &self,
        user: &User,
        chat_ref: ChatRef,
        sender: Option<i64>,
        msg_id: SharedMsgId,
        full_delete: bool,
    ) -> Result<(), ChatError> {
        let mut item = ChatItem::load_by_shared_msg_id(
            self.pool(),
            user.user_id,
            chat_ref,
            sender,
            CIDirection::Rcv,
            &msg_id,
        )
        .await?;
        self.inner().timed_tasks.cancel(chat_ref, item.chat_item_id);
        if full_delete {
            ChatItem::delete(self.pool(), item.chat_item_id).await?;
            self.emit(ChatResponse::ChatItemDeleted {
                deleted_item: item,
                to_item: None,
                by_user: false,
                timed: false,
            })
            .await;
        } else {
            item.mark_deleted(self.pool()).await?;
            let to_item = item.clone();
            self.emit(ChatResponse::ChatItemDeleted {
                deleted_item: item,
                to_item: Some(to_item),
                by_user: false,
                timed: false,
            })
            .await;
        }
        Ok(())
    }

    // incoming files

    /// Materializes the receive-transfer rows of a file invitation.
    pub(crate) async fn create_rcv_file(
        &self,
        user: &User,
        chat_ref: ChatRef,
        invitation: &FileInvitation,
        is_voice: bool,
    ) -> Result<i64, ChatError> {
        let (contact_id, group_id) = match chat_ref {
            ChatRef::Direct(contact_id) => (Some(contact_id), None),
            ChatRef::Group(group_id) => (None, Some(group_id)),
            ChatRef::ContactConnection(_) => (None, None),
        };
        let chunk_size = self.config().file_chunk_size;
        let protocol = if invitation.file_descr.is_some() {
            FileProtocol::Xftp
        } else {
            FileProtocol::Smp
        };
        let (meta, mut transfer) = self
            .with_transaction(async |txn| {
                let meta = FileTransferMeta::store(
                    txn.as_mut(),
                    NewFileMeta {
                        user_id: user.user_id,
                        contact_id,
                        group_id,
                        file_name: &invitation.file_name,
                        file_path: &invitation.file_name,
                        file_size: invitation.file_size,
                        chunk_size,
                        protocol,
                        file_inline: invitation.file_inline,
                    },
                )
                .await?;
                let transfer = RcvFileTransfer::store(
                    txn.as_mut(),
                    meta.file_id,
                    NewRcvFile {
                        file_conn_req: invitation
                            .file_conn_req
                            .as_ref()
                            .map(|req| req.0.as_str()),
                        file_inline: invitation.file_inline,
                        file_digest: invitation.file_digest.as_deref(),
                    },
                )
                .await?;
                Ok::<_, StoreError>((meta, transfer))
            })
            .await?;

        // voice messages offered inline are received without user action
        let auto_accept = self.config().inline_files.auto_accept_rcv(
            invitation.file_size,
            chunk_size,
            invitation.file_inline,
            is_voice,
        );
        if auto_accept {
            let mut meta = meta;
            let target = match self.files_folder() {
                Some(folder) => unique_target_path(&folder, &meta.file_name),
                None => std::path::PathBuf::from(&meta.file_name),
            };
            meta.set_file_path(self.pool(), &target.display().to_string())
                .await?;
            transfer
                .update_status(self.pool(), FileStatus::Accepted)
                .await?;
            self.emit(ChatResponse::RcvFileStart {
                file_id: meta.file_id,
            })
            .await;
            return Ok(meta.file_id);
        }
        Ok(meta.file_id)
    }

    /// Peer accepted our file offer.
    pub(super) async fn snd_file_accepted(
        &self,
        user: &User,
        chat_ref: ChatRef,
        msg_id: SharedMsgId,
        file_conn_req: Option<couriercommon::identifiers::ConnReqUri>,
        file_name: String,
        connection: &Connection,
    ) -> Result<(), ChatError> {
        let item = ChatItem::load_by_shared_msg_id(
            self.pool(),
            user.user_id,
            chat_ref,
            None,
            CIDirection::Snd,
            &msg_id,
        )
        .await?;
        let file_id = item
            .file_id
            .ok_or_else(|| ChatError::Internal("acceptance for item without file".into()))?;
        let meta = FileTransferMeta::load(self.pool(), file_id).await?;
        if meta.cancelled {
            debug!(file_id, "acceptance of a cancelled file; ignored");
            return Ok(());
        }
        debug!(file_id, file_name, "file invitation accepted");

        match file_conn_req {
            Some(conn_req) => {
                // receiver opened a dedicated transfer connection
                let conn_info = ChatMessage::new(None, ChatMsgEvent::Ok).encode(false)?;
                let agent_conn_id = self
                    .agent()
                    .join_connection(user.agent_user_id, false, &conn_req, conn_info)
                    .await?;
                let file_connection = Connection::store(
                    self.pool(),
                    user.user_id,
                    &agent_conn_id,
                    ConnStatus::Joined,
                    crate::connections::ConnType::SndFile,
                    crate::connections::NewConnection {
                        snd_file_id: Some(file_id),
                        ..Default::default()
                    },
                )
                .await?;
                SndFileTransfer::store(
                    self.pool(),
                    file_id,
                    file_connection.conn_id,
                    None,
                    FileStatus::Accepted,
                    None,
                )
                .await?;
                Ok(())
            }
            None => {
                // inline acceptance: stream on the messaging connection
                if SndFileTransfer::load(self.pool(), file_id, connection.conn_id)
                    .await?
                    .is_none()
                {
                    SndFileTransfer::store(
                        self.pool(),
                        file_id,
                        connection.conn_id,
                        None,
                        FileStatus::Accepted,
                        meta.file_inline,
                    )
                    .await?;
                }
                self.stream_inline_file(&meta, connection).await
            }
        }
    }

    // probes

    async fn send_probe(
        &self,
        user: &User,
        contact: &Contact,
        connection: &Connection,
    ) -> Result<(), ChatError> {
        let probe = Probe::random(&mut OsRng);
        SentProbe::store(self.pool(), user.user_id, contact.contact_id, &probe).await?;
        let (message, body) = self
            .create_snd_message(user.user_id, |_| ChatMsgEvent::InfoProbe(probe))
            .await?;
        self.deliver_message(connection, &message, body).await?;
        debug!(contact_id = contact.contact_id, "sent identity probe");
        Ok(())
    }

    async fn rcv_probe(
        &self,
        user: &User,
        from_contact: &Contact,
        probe: Probe,
    ) -> Result<(), ChatError> {
        ReceivedProbe::store(self.pool(), user.user_id, from_contact.contact_id, &probe).await?;
        let duplicates = Contact::load_by_profile(
            self.pool(),
            user.user_id,
            &from_contact.profile,
            from_contact.contact_id,
        )
        .await?;
        for duplicate in duplicates {
            let Some(connection) =
                Connection::load_for_contact(self.pool(), duplicate.contact_id).await?
            else {
                continue;
            };
            if connection.incognito() || !connection.conn_status.snd_usable() {
                continue;
            }
            let hash = ProbeHash::of(&probe);
            let (message, body) = self
                .create_snd_message(user.user_id, |_| ChatMsgEvent::InfoProbeCheck(hash.clone()))
                .await?;
            self.deliver_message(&connection, &message, body).await?;
            debug!(
                duplicate_contact = duplicate.contact_id,
                "matched probe by profile; sent check"
            );
            return Ok(());
        }
        Ok(())
    }

    async fn rcv_probe_check(
        &self,
        user: &User,
        from_contact: &Contact,
        connection: &Connection,
        hash: ProbeHash,
    ) -> Result<(), ChatError> {
        let Some((probed_contact_id, probe)) =
            SentProbe::match_hash(self.pool(), user.user_id, &hash).await?
        else {
            debug!("probe check without matching sent probe");
            return Ok(());
        };
        let (message, body) = self
            .create_snd_message(user.user_id, |_| ChatMsgEvent::InfoProbeOk(probe))
            .await?;
        self.deliver_message(connection, &message, body).await?;
        self.merge_matched_contacts(from_contact.contact_id, probed_contact_id)
            .await
    }

    async fn rcv_probe_ok(
        &self,
        user: &User,
        from_contact: &Contact,
        probe: Probe,
    ) -> Result<(), ChatError> {
        let Some(probed_contact_id) =
            ReceivedProbe::match_probe(self.pool(), user.user_id, &probe).await?
        else {
            debug!("probe confirmation without matching received probe");
            return Ok(());
        };
        self.merge_matched_contacts(from_contact.contact_id, probed_contact_id)
            .await
    }

    /// Merges the two contact rows of one peer, keeping the older row.
    async fn merge_matched_contacts(
        &self,
        first: i64,
        second: i64,
    ) -> Result<(), ChatError> {
        if first == second {
            return Ok(());
        }
        let (canonical_id, duplicate_id) = (first.min(second), first.max(second));
        self.with_transaction(async |txn| {
            Contact::merge_into(txn, canonical_id, duplicate_id).await
        })
        .await?;
        let into_contact = Contact::load(self.pool(), canonical_id).await?;
        info!(canonical_id, duplicate_id, "merged duplicate contact");
        self.emit(ChatResponse::ContactsMerged {
            into_contact,
            merged_contact_id: duplicate_id,
        })
        .await;
        Ok(())
    }

    // group invitations and calls

    async fn rcv_group_invitation(
        &self,
        user: &User,
        contact: &Contact,
        connection: &Connection,
        invitation: couriercommon::messages::GroupInvitation,
    ) -> Result<(), ChatError> {
        let group = self
            .with_transaction(async |txn| {
                let name = unique_display_name(
                    txn.as_mut(),
                    user.user_id,
                    &invitation.group_profile.display_name,
                )
                .await?;
                let mut group =
                    Group::store(txn.as_mut(), user.user_id, &name, &invitation.group_profile)
                        .await?;
                group
                    .set_inv_conn_req(txn.as_mut(), Some(invitation.conn_request.0.as_str()))
                    .await?;
                // the host's row and our own membership, as announced
                GroupMember::store(
                    txn.as_mut(),
                    group.group_id,
                    NewGroupMember {
                        member_id: invitation.from_member.member_id,
                        member_role: invitation.from_member.role,
                        member_status: GroupMemberStatus::Invited,
                        member_category: GroupMemberCategory::HostMember,
                        invited_by: None,
                        profile: contact.profile.clone(),
                        contact_id: Some(contact.contact_id),
                    },
                )
                .await?;
                GroupMember::store(
                    txn.as_mut(),
                    group.group_id,
                    NewGroupMember {
                        member_id: invitation.invited_member.member_id,
                        member_role: invitation.invited_member.role,
                        member_status: GroupMemberStatus::Invited,
                        member_category: GroupMemberCategory::UserMember,
                        invited_by: None,
                        profile: user.profile.clone(),
                        contact_id: None,
                    },
                )
                .await?;
                Ok::<_, StoreError>(group)
            })
            .await?;

        // joining via our own group link completes without user action
        let auto_join = invitation.group_link_id.is_some()
            && invitation.group_link_id == connection.group_link_id;
        if auto_join {
            let item = ChatItem::store(
                self.pool(),
                &NewChatItem::internal(
                    user.user_id,
                    ChatRef::Group(group.group_id),
                    CIDirection::Rcv,
                    CIContent::RcvGroupEvent {
                        event: crate::chats::content::RcvGroupEventCI::InvitedViaGroupLink,
                    },
                ),
            )
            .await?;
            self.emit(ChatResponse::NewChatItem(item)).await;
            let joined = self.api_join_group(group).await?;
            if let ChatResponse::UserAcceptedGroup(group) = joined {
                self.emit(ChatResponse::UserAcceptedGroup(group)).await;
            }
            return Ok(());
        }

        let item = ChatItem::store(
            self.pool(),
            &NewChatItem::internal(
                user.user_id,
                ChatRef::Direct(contact.contact_id),
                CIDirection::Rcv,
                CIContent::RcvGroupInvitation {
                    group_display_name: group.local_display_name.clone(),
                    role: invitation.invited_member.role,
                },
            ),
        )
        .await?;
        self.emit(ChatResponse::NewChatItem(item)).await;
        self.emit(ChatResponse::ReceivedGroupInvitation {
            group,
            from_contact: contact.contact_id,
        })
        .await;
        Ok(())
    }

    async fn rcv_call_invitation(
        &self,
        user: &User,
        contact: &Contact,
        call_id: couriercommon::messages::CallId,
        invitation: couriercommon::messages::CallInvitationWire,
    ) -> Result<(), ChatError> {
        let contact_id = contact.contact_id;
        // a fresh invitation replaces a stuck call
        let stuck = self
            .inner()
            .calls
            .lock()
            .expect("calls poisoned")
            .remove(&contact_id);
        if let Some(stuck) = stuck {
            debug!(contact_id, call_id = %stuck.call_id.0, "replacing stuck call");
            self.emit(ChatResponse::CallEnded { contact_id }).await;
        }
        let item = ChatItem::store(
            self.pool(),
            &NewChatItem::internal(
                user.user_id,
                ChatRef::Direct(contact_id),
                CIDirection::Rcv,
                CIContent::RcvCall {
                    status: CallStatusCI::Pending,
                },
            ),
        )
        .await?;
        let call = Call {
            user_id: user.user_id,
            contact_id,
            call_id: call_id.clone(),
            chat_item_id: Some(item.chat_item_id),
            call_state: CallState::InvitationReceived,
            call_ts: Utc::now(),
            media: invitation.media,
        };
        call.upsert(self.pool()).await?;
        self.put_call(call);
        self.emit(ChatResponse::NewChatItem(item)).await;
        self.emit(ChatResponse::CallInvitation {
            contact_id,
            call_id,
            media: invitation.media,
        })
        .await;
        Ok(())
    }

    fn active_call(&self, contact_id: i64) -> Result<Call, ChatError> {
        self.inner()
            .calls
            .lock()
            .expect("calls poisoned")
            .remove(&contact_id)
            .ok_or_else(|| crate::error::CommandError::CallNotFound(contact_id).into())
    }
}

/// Quote snapshot from the peer's perspective: their `sent` is our received.
pub(crate) fn rcv_quote(quote: &QuotedMsg) -> CIQuote {
    CIQuote {
        shared_msg_id: Some(quote.msg_ref.msg_id),
        sent: Some(!quote.msg_ref.sent),
        content: quote.content.clone(),
    }
}
