// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Events on group member connections, including the introduction protocol.
//!
//! When the host admits a new member it announces them to every existing
//! member (`x.grp.mem.new`), introduces them (`x.grp.mem.intro`), collects
//! the fresh connection requests (`x.grp.mem.inv`) and forwards them to the
//! new member (`x.grp.mem.fwd`). Handlers tolerate arbitrary interleaving
//! across connections by creating member rows lazily on first reference.

use courieragentclient::{AgentApi, AgentEvent, ConnectionMode};
use couriercommon::{
    messages::{ChatMessage, ChatMsgEvent, IntroInvitation, MemberInfo},
    profile::GroupMemberRole,
};

use tracing::{debug, info, warn};

use crate::{
    chats::{CIContent, CIDirection, ChatItem, ChatRef, NewChatItem, content::RcvGroupEventCI},
    connections::{ConnStatus, ConnType, Connection, NewConnection},
    error::ChatError,
    events::ChatResponse,
    groups::{Group, GroupMember, GroupMemberCategory, GroupMemberStatus, NewGroupMember},
    messages::{Message, PendingGroupMessage},
    store::StoreError,
    users::User,
};

use super::{ChatController, RcvMessage};

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(super) async fn process_group_member_event(
        &self,
        mut connection: Connection,
        event: AgentEvent,
    ) -> Result<(), ChatError> {
        let member_id = connection.group_member_id.ok_or_else(|| {
            ChatError::Internal("group connection without member binding".into())
        })?;
        let mut member = GroupMember::load(self.pool(), member_id).await?;
        let group = Group::load(self.pool(), member.group_id).await?;
        let chat_ref = ChatRef::Group(group.group_id);

        match event {
            AgentEvent::Confirmation {
                confirmation_id,
                conn_info,
            } => {
                let user = self.current_user()?;
                let membership =
                    GroupMember::load_membership(self.pool(), group.group_id).await?;
                let message = ChatMessage::decode(&conn_info)?;
                match message.event {
                    // invitee accepted our invitation on the fresh group
                    // connection
                    ChatMsgEvent::GrpAcpt { member_id } => {
                        if member_id != member.member_id {
                            warn!(%member_id, "acceptance with foreign member id");
                            return Ok(());
                        }
                        member
                            .advance_status(self.pool(), GroupMemberStatus::Accepted)
                            .await?;
                    }
                    // introduced member reached us on the intro connection
                    ChatMsgEvent::GrpMemInfo { member_id, profile } => {
                        if member_id != member.member_id {
                            warn!(%member_id, "member info with foreign member id");
                            return Ok(());
                        }
                        member.update_profile(self.pool(), &profile).await?;
                        member
                            .advance_status(self.pool(), GroupMemberStatus::IntroForwarded)
                            .await?;
                    }
                    other => {
                        warn!(tag = other.tag(), "unexpected group confirmation payload");
                        return Ok(());
                    }
                }
                let reply = ChatMessage::new(
                    None,
                    ChatMsgEvent::GrpMemInfo {
                        member_id: membership.member_id,
                        profile: user.profile.clone(),
                    },
                )
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
                if member
                    .advance_status(self.pool(), GroupMemberStatus::Connecting)
                    .await?
                {
                    self.emit(ChatResponse::JoinedGroupMemberConnecting {
                        group,
                        member,
                    })
                    .await;
                }
                Ok(())
            }
            AgentEvent::Connected => {
                connection
                    .update_status(self.pool(), ConnStatus::Ready)
                    .await?;
                self.group_member_connected(group, member, &connection).await
            }
            AgentEvent::Msg { meta, body, .. } => {
                let Some(received) = self
                    .store_rcv_message(&connection, meta.agent_msg_id, &body)
                    .await?
                else {
                    return self.ack_rcv_message(&connection, meta.agent_msg_id).await;
                };
                let result = self
                    .handle_group_message(&connection, &mut member, &group, received, meta.broker_ts)
                    .await;
                self.ack_rcv_message(&connection, meta.agent_msg_id).await?;
                result
            }
            other => {
                self.process_common_conn_event(&mut connection, Some(chat_ref), &other)
                    .await?;
                Ok(())
            }
        }
    }

    async fn group_member_connected(
        &self,
        group: Group,
        mut member: GroupMember,
        connection: &Connection,
    ) -> Result<(), ChatError> {
        let user = self.current_user()?;
        member
            .advance_status(self.pool(), GroupMemberStatus::Connected)
            .await?;
        info!(
            group_id = group.group_id,
            group_member_id = member.group_member_id,
            category = %member.member_category,
            "group member connected"
        );

        match member.member_category {
            GroupMemberCategory::InviteeMember => {
                // the member we invited joined: announce and introduce them
                // to every other connected member
                self.emit(ChatResponse::JoinedGroupMember {
                    group: group.clone(),
                    member: member.clone(),
                })
                .await;
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem::internal(
                        user.user_id,
                        ChatRef::Group(group.group_id),
                        CIDirection::Rcv,
                        CIContent::RcvGroupEvent {
                            event: RcvGroupEventCI::MemberConnected,
                        },
                    ),
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
                self.introduce_member(&user, &group, &member).await?;
            }
            GroupMemberCategory::HostMember => {
                let mut membership =
                    GroupMember::load_membership(self.pool(), group.group_id).await?;
                membership
                    .advance_status(self.pool(), GroupMemberStatus::Connected)
                    .await?;
                self.emit(ChatResponse::UserJoinedGroup(group.clone())).await;
            }
            GroupMemberCategory::PreMember => {
                // we joined an introduced member's connection: present
                // ourselves now that the channel is ready
                let membership =
                    GroupMember::load_membership(self.pool(), group.group_id).await?;
                let event = ChatMsgEvent::GrpMemInfo {
                    member_id: membership.member_id,
                    profile: user.profile.clone(),
                };
                let (message, body) = self.create_snd_message(user.user_id, |_| event).await?;
                self.deliver_message(connection, &message, body).await?;
                self.emit(ChatResponse::ConnectedToGroupMember {
                    group: group.clone(),
                    member: member.clone(),
                })
                .await;
            }
            GroupMemberCategory::PostMember => {
                self.emit(ChatResponse::ConnectedToGroupMember {
                    group: group.clone(),
                    member: member.clone(),
                })
                .await;
            }
            GroupMemberCategory::UserMember => {}
        }

        self.flush_pending_member_messages(&member, connection).await
    }

    /// Host side of steps 1 and 2: `x.grp.mem.new` and `x.grp.mem.intro` go
    /// to every other connected member.
    async fn introduce_member(
        &self,
        user: &User,
        group: &Group,
        new_member: &GroupMember,
    ) -> Result<(), ChatError> {
        let members = GroupMember::load_remote_members(self.pool(), group.group_id).await?;
        let new_member_info = MemberInfo {
            member_id: new_member.member_id,
            role: new_member.member_role,
            profile: new_member.profile.clone(),
        };
        for existing in &members {
            if existing.group_member_id == new_member.group_member_id
                || existing.member_status != GroupMemberStatus::Connected
            {
                continue;
            }
            let Some(connection) =
                Connection::load_for_group_member(self.pool(), existing.group_member_id).await?
            else {
                continue;
            };
            if !connection.conn_status.snd_usable() {
                continue;
            }
            let announce = ChatMsgEvent::GrpMemNew(new_member_info.clone());
            let (message, body) = self.create_snd_message(user.user_id, |_| announce).await?;
            self.deliver_message(&connection, &message, body).await?;

            let intro = ChatMsgEvent::GrpMemIntro(new_member_info.clone());
            let (message, body) = self.create_snd_message(user.user_id, |_| intro).await?;
            self.deliver_message(&connection, &message, body).await?;
            debug!(
                to = existing.group_member_id,
                new_member = new_member.group_member_id,
                "announced and introduced new member"
            );
        }
        Ok(())
    }

    /// Queued messages are flushed in insertion order, one delivery and one
    /// row deletion at a time, so a restart mid-flush drops nothing.
    async fn flush_pending_member_messages(
        &self,
        member: &GroupMember,
        connection: &Connection,
    ) -> Result<(), ChatError> {
        let pending =
            PendingGroupMessage::load_for_member(self.pool(), member.group_member_id).await?;
        for entry in pending {
            let message = Message::load(self.pool(), entry.message_id).await?;
            let body = message.msg_body.clone();
            self.deliver_message(connection, &message, body).await?;
            PendingGroupMessage::delete(self.pool(), entry.pending_group_message_id).await?;
        }
        Ok(())
    }

    async fn handle_group_message(
        &self,
        connection: &Connection,
        member: &mut GroupMember,
        group: &Group,
        received: RcvMessage,
        broker_ts: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ChatError> {
        let user = self.current_user()?;
        let chat_ref = ChatRef::Group(group.group_id);
        let shared_msg_id = received.chat_message.shared_msg_id;
        let membership = GroupMember::load_membership(self.pool(), group.group_id).await?;

        match received.chat_message.event {
            ChatMsgEvent::MsgNew(container) => {
                if member.member_role < GroupMemberRole::Author {
                    warn!(
                        group_member_id = member.group_member_id,
                        "content message from a member below author; dropped"
                    );
                    return Ok(());
                }
                self.new_rcv_item(
                    &user,
                    chat_ref,
                    Some(member.group_member_id),
                    &container,
                    shared_msg_id,
                    received.message.message_id,
                    broker_ts,
                )
                .await?;
                Group::update_chat_ts(self.pool(), group.group_id, chrono::Utc::now()).await?;
                Ok(())
            }
            ChatMsgEvent::MsgUpdate { msg_id, content } => {
                self.rcv_item_update(
                    &user,
                    chat_ref,
                    Some(member.group_member_id),
                    msg_id,
                    content,
                    broker_ts,
                )
                .await
            }
            ChatMsgEvent::MsgDel { msg_id, member_id } => {
                // only the author's own deletions resolve here
                if member_id.is_some_and(|sender| sender != member.member_id) {
                    debug!("delete referencing a different sender; ignored");
                    return Ok(());
                }
                self.rcv_item_delete(
                    &user,
                    chat_ref,
                    Some(member.group_member_id),
                    msg_id,
                    false,
                )
                .await
            }
            ChatMsgEvent::MsgFileDescr { msg_id, file_descr } => {
                self.rcv_file_descr_part(
                    &user,
                    chat_ref,
                    Some(member.group_member_id),
                    msg_id,
                    file_descr,
                )
                .await
            }
            ChatMsgEvent::MsgFileCancel { msg_id } | ChatMsgEvent::FileCancel { msg_id } => {
                self.rcv_file_cancelled_by_sender(
                    &user,
                    chat_ref,
                    Some(member.group_member_id),
                    msg_id,
                )
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
            ChatMsgEvent::GrpMemNew(info) => {
                if info.member_id == membership.member_id {
                    return Ok(());
                }
                if GroupMember::load_by_member_id(self.pool(), group.group_id, &info.member_id)
                    .await?
                    .is_some()
                {
                    debug!(member_id = %info.member_id, "announced member already known");
                    return Ok(());
                }
                let announced = GroupMember::store(
                    self.pool(),
                    group.group_id,
                    NewGroupMember {
                        member_id: info.member_id,
                        member_role: info.role,
                        member_status: GroupMemberStatus::Announced,
                        member_category: GroupMemberCategory::PostMember,
                        invited_by: Some(member.group_member_id),
                        profile: info.profile,
                        contact_id: None,
                    },
                )
                .await?;
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem::internal(
                        user.user_id,
                        chat_ref,
                        CIDirection::Rcv,
                        CIContent::RcvGroupEvent {
                            event: RcvGroupEventCI::MemberAdded {
                                member: announced.local_display_name.clone(),
                            },
                        },
                    ),
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
                Ok(())
            }
            ChatMsgEvent::GrpMemIntro(info) => {
                if member.member_category != GroupMemberCategory::HostMember {
                    warn!("introduction from a non-host member; dropped");
                    return Ok(());
                }
                self.intro_create_invitations(&user, group, member, info, connection)
                    .await
            }
            ChatMsgEvent::GrpMemInv {
                member_id,
                intro_inv,
            } => {
                // host: forward the collected connection requests to the new
                // member
                let Some(new_member) =
                    GroupMember::load_by_member_id(self.pool(), group.group_id, &member_id)
                        .await?
                else {
                    debug!(%member_id, "invitation for unknown member");
                    return Ok(());
                };
                let Some(new_member_conn) =
                    Connection::load_for_group_member(self.pool(), new_member.group_member_id)
                        .await?
                else {
                    debug!(%member_id, "new member has no usable connection yet");
                    return Ok(());
                };
                let forward = ChatMsgEvent::GrpMemFwd {
                    member: MemberInfo {
                        member_id: member.member_id,
                        role: member.member_role,
                        profile: member.profile.clone(),
                    },
                    intro_inv,
                };
                let (message, body) = self.create_snd_message(user.user_id, |_| forward).await?;
                self.deliver_message(&new_member_conn, &message, body).await?;
                Ok(())
            }
            ChatMsgEvent::GrpMemFwd {
                member: info,
                intro_inv,
            } => {
                self.intro_join_forwarded(&user, group, info, intro_inv).await
            }
            ChatMsgEvent::GrpMemInfo { member_id, profile } => {
                if member_id != member.member_id {
                    warn!(%member_id, "member info with foreign member id");
                    return Ok(());
                }
                member.update_profile(self.pool(), &profile).await?;
                Ok(())
            }
            ChatMsgEvent::GrpMemRole { member_id, role } => {
                if member.member_role < GroupMemberRole::Admin {
                    warn!("role change from a non-admin; dropped");
                    return Ok(());
                }
                let (target_name, updated) = if member_id == membership.member_id {
                    let mut membership = membership;
                    membership.update_role(self.pool(), role).await?;
                    ("you".to_owned(), membership)
                } else {
                    let Some(mut target) = GroupMember::load_by_member_id(
                        self.pool(),
                        group.group_id,
                        &member_id,
                    )
                    .await?
                    else {
                        debug!(%member_id, "role change for unknown member");
                        return Ok(());
                    };
                    if target.member_role > member.member_role {
                        warn!("role change above the sender's rank; dropped");
                        return Ok(());
                    }
                    target.update_role(self.pool(), role).await?;
                    (target.local_display_name.clone(), target)
                };
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem::internal(
                        user.user_id,
                        chat_ref,
                        CIDirection::Rcv,
                        CIContent::RcvGroupEvent {
                            event: RcvGroupEventCI::MemberRole {
                                member: target_name,
                                role,
                            },
                        },
                    ),
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
                self.emit(ChatResponse::MemberRole {
                    group: group.clone(),
                    member: updated,
                })
                .await;
                Ok(())
            }
            ChatMsgEvent::GrpMemDel { member_id } => {
                if member.member_role < GroupMemberRole::Admin {
                    warn!("member removal from a non-admin; dropped");
                    return Ok(());
                }
                if member_id == membership.member_id {
                    let mut membership = membership;
                    membership
                        .advance_status(self.pool(), GroupMemberStatus::Removed)
                        .await?;
                    let item = ChatItem::store(
                        self.pool(),
                        &NewChatItem::internal(
                            user.user_id,
                            chat_ref,
                            CIDirection::Rcv,
                            CIContent::RcvGroupEvent {
                                event: RcvGroupEventCI::UserDeleted,
                            },
                        ),
                    )
                    .await?;
                    self.emit(ChatResponse::NewChatItem(item)).await;
                    self.emit(ChatResponse::DeletedMemberUser(group.clone())).await;
                    return Ok(());
                }
                let Some(mut target) =
                    GroupMember::load_by_member_id(self.pool(), group.group_id, &member_id)
                        .await?
                else {
                    debug!(%member_id, "removal of unknown member");
                    return Ok(());
                };
                if target.member_role > member.member_role {
                    warn!("removal above the sender's rank; dropped");
                    return Ok(());
                }
                target
                    .advance_status(self.pool(), GroupMemberStatus::Removed)
                    .await?;
                self.delete_member_connection(&target).await?;
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem::internal(
                        user.user_id,
                        chat_ref,
                        CIDirection::Rcv,
                        CIContent::RcvGroupEvent {
                            event: RcvGroupEventCI::MemberDeleted {
                                member: target.local_display_name.clone(),
                            },
                        },
                    ),
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
                self.emit(ChatResponse::DeletedMember {
                    group: group.clone(),
                    member: target,
                })
                .await;
                Ok(())
            }
            ChatMsgEvent::GrpLeave => {
                member
                    .advance_status(self.pool(), GroupMemberStatus::Left)
                    .await?;
                self.delete_member_connection(member).await?;
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem::internal(
                        user.user_id,
                        chat_ref,
                        CIDirection::Rcv,
                        CIContent::RcvGroupEvent {
                            event: RcvGroupEventCI::MemberLeft,
                        },
                    ),
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
                self.emit(ChatResponse::LeftMember {
                    group: group.clone(),
                    member: member.clone(),
                })
                .await;
                Ok(())
            }
            ChatMsgEvent::GrpDel => {
                if member.member_role < GroupMemberRole::Owner {
                    warn!("group deletion from a non-owner; dropped");
                    return Ok(());
                }
                let members =
                    GroupMember::load_remote_members(self.pool(), group.group_id).await?;
                for mut remote in members {
                    remote
                        .advance_status(self.pool(), GroupMemberStatus::GroupDeleted)
                        .await?;
                }
                let mut membership = membership;
                membership
                    .advance_status(self.pool(), GroupMemberStatus::GroupDeleted)
                    .await?;
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem::internal(
                        user.user_id,
                        chat_ref,
                        CIDirection::Rcv,
                        CIContent::RcvGroupEvent {
                            event: RcvGroupEventCI::GroupDeleted,
                        },
                    ),
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
                self.emit(ChatResponse::GroupDeleted(group.clone())).await;
                Ok(())
            }
            ChatMsgEvent::GrpInfo(profile) => {
                if member.member_role < GroupMemberRole::Owner {
                    warn!("group profile change from a non-owner; dropped");
                    return Ok(());
                }
                let mut group = group.clone();
                group.update_profile(self.pool(), &profile).await?;
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem::internal(
                        user.user_id,
                        chat_ref,
                        CIDirection::Rcv,
                        CIContent::RcvGroupEvent {
                            event: RcvGroupEventCI::GroupUpdated,
                        },
                    ),
                )
                .await?;
                self.emit(ChatResponse::NewChatItem(item)).await;
                self.emit(ChatResponse::GroupUpdated(group)).await;
                Ok(())
            }
            ChatMsgEvent::FileChunk { chunk_no, chunk } => {
                let msg_id = shared_msg_id.ok_or_else(|| {
                    ChatError::Internal("file chunk without shared message id".into())
                })?;
                self.rcv_inline_chunk(
                    &user,
                    chat_ref,
                    Some(member.group_member_id),
                    msg_id,
                    chunk_no,
                    &chunk,
                )
                .await
            }
            ChatMsgEvent::Unknown { tag, params } => {
                let item = ChatItem::store(
                    self.pool(),
                    &NewChatItem {
                        shared_msg_id,
                        group_member_id: Some(member.group_member_id),
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
            ChatMsgEvent::Ok => Ok(()),
            other => {
                debug!(tag = other.tag(), "event not permitted on group connection");
                Ok(())
            }
        }
    }

    /// Step 3 on the introduced side: create the two fresh connections and
    /// hand their requests back to the host.
    async fn intro_create_invitations(
        &self,
        user: &User,
        group: &Group,
        host: &GroupMember,
        info: MemberInfo,
        host_connection: &Connection,
    ) -> Result<(), ChatError> {
        let mut new_member = match GroupMember::load_by_member_id(
            self.pool(),
            group.group_id,
            &info.member_id,
        )
        .await?
        {
            Some(existing) => existing,
            // the intro may overtake the announcement
            None => {
                GroupMember::store(
                    self.pool(),
                    group.group_id,
                    NewGroupMember {
                        member_id: info.member_id,
                        member_role: info.role,
                        member_status: GroupMemberStatus::Announced,
                        member_category: GroupMemberCategory::PostMember,
                        invited_by: Some(host.group_member_id),
                        profile: info.profile.clone(),
                        contact_id: None,
                    },
                )
                .await?
            }
        };

        let (group_conn_id, group_conn_req) = self
            .agent()
            .create_connection(user.agent_user_id, ConnectionMode::Invitation)
            .await?;
        let (direct_conn_id, direct_conn_req) = self
            .agent()
            .create_connection(user.agent_user_id, ConnectionMode::Invitation)
            .await?;
        self.with_transaction(async |txn| {
            Connection::store(
                txn.as_mut(),
                user.user_id,
                &group_conn_id,
                ConnStatus::New,
                ConnType::GroupMember,
                NewConnection {
                    group_member_id: Some(new_member.group_member_id),
                    ..Default::default()
                },
            )
            .await?;
            Connection::store(
                txn.as_mut(),
                user.user_id,
                &direct_conn_id,
                ConnStatus::New,
                ConnType::ContactDirect,
                NewConnection::default(),
            )
            .await?;
            Ok::<_, StoreError>(())
        })
        .await?;

        let event = ChatMsgEvent::GrpMemInv {
            member_id: info.member_id,
            intro_inv: IntroInvitation {
                group_conn_req,
                direct_conn_req: Some(direct_conn_req),
            },
        };
        let (message, body) = self.create_snd_message(user.user_id, |_| event).await?;
        self.deliver_message(host_connection, &message, body).await?;
        new_member
            .advance_status(self.pool(), GroupMemberStatus::IntroInvited)
            .await?;
        Ok(())
    }

    /// Steps 4 and 5 on the new member's side: join both forwarded
    /// connection requests.
    async fn intro_join_forwarded(
        &self,
        user: &User,
        group: &Group,
        info: MemberInfo,
        intro_inv: IntroInvitation,
    ) -> Result<(), ChatError> {
        let membership = GroupMember::load_membership(self.pool(), group.group_id).await?;
        let mut existing_member = match GroupMember::load_by_member_id(
            self.pool(),
            group.group_id,
            &info.member_id,
        )
        .await?
        {
            Some(member) => member,
            // forwarded introduction may arrive before the announcement
            None => {
                GroupMember::store(
                    self.pool(),
                    group.group_id,
                    NewGroupMember {
                        member_id: info.member_id,
                        member_role: info.role,
                        member_status: GroupMemberStatus::Announced,
                        member_category: GroupMemberCategory::PreMember,
                        invited_by: None,
                        profile: info.profile.clone(),
                        contact_id: None,
                    },
                )
                .await?
            }
        };
        existing_member
            .advance_status(self.pool(), GroupMemberStatus::IntroForwarded)
            .await?;

        let greeting = ChatMessage::new(
            None,
            ChatMsgEvent::GrpMemInfo {
                member_id: membership.member_id,
                profile: user.profile.clone(),
            },
        )
        .encode(false)?;

        let group_conn = self
            .agent()
            .join_connection(
                user.agent_user_id,
                true,
                &intro_inv.group_conn_req,
                greeting.clone(),
            )
            .await?;
        Connection::store(
            self.pool(),
            user.user_id,
            &group_conn,
            ConnStatus::Joined,
            ConnType::GroupMember,
            NewConnection {
                group_member_id: Some(existing_member.group_member_id),
                ..Default::default()
            },
        )
        .await?;

        if let Some(direct_conn_req) = &intro_inv.direct_conn_req {
            let direct_conn = self
                .agent()
                .join_connection(user.agent_user_id, true, direct_conn_req, greeting)
                .await?;
            Connection::store(
                self.pool(),
                user.user_id,
                &direct_conn,
                ConnStatus::Joined,
                ConnType::ContactDirect,
                NewConnection::default(),
            )
            .await?;
        }

        existing_member
            .advance_status(self.pool(), GroupMemberStatus::Connecting)
            .await?;
        Ok(())
    }
}
