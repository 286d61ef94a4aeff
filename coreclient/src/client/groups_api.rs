// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Group commands: creation, member management, joining, links.

use courieragentclient::{AgentApi, ConnectionMode};
use couriercommon::{
    identifiers::{GroupLinkId, MemberId},
    messages::{ChatMsgEvent, GroupInvitation, MemberIdRole},
    profile::{GroupMemberRole, GroupProfile},
};
use rand::rngs::OsRng;
use tracing::info;

use crate::{
    chats::{CIContent, CIDirection, ChatRef, NewChatItem, content::SndGroupEventCI},
    connections::{ConnStatus, ConnType, Connection, NewConnection},
    contacts::{Contact, UserContactLink, unique_display_name},
    error::{ChatError, CommandError},
    events::ChatResponse,
    groups::{
        Group, GroupMember, GroupMemberCategory, GroupMemberStatus, NewGroupMember,
    },
    store::{GroupMemberId, StoreError},
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(super) async fn api_new_group(
        &self,
        profile: GroupProfile,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let group = self
            .with_transaction(async |txn| {
                let name =
                    unique_display_name(txn.as_mut(), user.user_id, &profile.display_name).await?;
                let group = Group::store(txn.as_mut(), user.user_id, &name, &profile).await?;
                GroupMember::store(
                    txn.as_mut(),
                    group.group_id,
                    NewGroupMember {
                        member_id: MemberId::random(&mut OsRng),
                        member_role: GroupMemberRole::Owner,
                        member_status: GroupMemberStatus::Creator,
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
        info!(group_id = group.group_id, "created group");
        Ok(ChatResponse::GroupCreated(group))
    }

    pub(super) async fn api_add_member(
        &self,
        group: Group,
        contact: Contact,
        role: GroupMemberRole,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let membership = GroupMember::load_membership(self.pool(), group.group_id).await?;
        if membership.member_role < GroupMemberRole::Admin || role > membership.member_role {
            return Err(CommandError::GroupUserRole.into());
        }

        let connection = self.usable_contact_connection(&contact).await?;
        if connection.incognito() {
            return Err(CommandError::GroupIncognitoCantInvite.into());
        }

        let members = GroupMember::load_remote_members(self.pool(), group.group_id).await?;
        let existing = members
            .iter()
            .find(|member| member.contact_id == Some(contact.contact_id));
        let member = match existing {
            Some(member) if member.member_status == GroupMemberStatus::Invited => {
                // refresh the role and re-send the invitation
                let mut member = member.clone();
                member.update_role(self.pool(), role).await?;
                member
            }
            Some(member) => {
                return Err(CommandError::GroupDuplicateMember(
                    member.local_display_name.clone(),
                )
                .into());
            }
            None => {
                GroupMember::store(
                    self.pool(),
                    group.group_id,
                    NewGroupMember {
                        member_id: MemberId::random(&mut OsRng),
                        member_role: role,
                        member_status: GroupMemberStatus::Invited,
                        member_category: GroupMemberCategory::InviteeMember,
                        invited_by: Some(membership.group_member_id),
                        profile: contact.profile.clone(),
                        contact_id: Some(contact.contact_id),
                    },
                )
                .await?
            }
        };

        // the invitee joins the group through this fresh connection
        let (agent_conn_id, conn_req) = self
            .agent()
            .create_connection(user.agent_user_id, ConnectionMode::Invitation)
            .await?;
        Connection::store(
            self.pool(),
            user.user_id,
            &agent_conn_id,
            ConnStatus::New,
            ConnType::GroupMember,
            NewConnection {
                group_member_id: Some(member.group_member_id),
                ..Default::default()
            },
        )
        .await?;

        let invitation = GroupInvitation {
            from_member: MemberIdRole {
                member_id: membership.member_id,
                role: membership.member_role,
            },
            invited_member: MemberIdRole {
                member_id: member.member_id,
                role,
            },
            conn_request: conn_req,
            group_profile: group.profile.clone(),
            group_link_id: None,
        };
        let (snd_message, body) = self
            .create_snd_message(user.user_id, |_| ChatMsgEvent::GrpInv(invitation))
            .await?;
        self.deliver_message(&connection, &snd_message, body).await?;

        Ok(ChatResponse::SentGroupInvitation {
            group,
            contact,
            member,
        })
    }

    pub(super) async fn api_join_group(&self, group: Group) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let mut group = group;
        let conn_req = group
            .inv_conn_req
            .clone()
            .ok_or(CommandError::InvalidChatRef)?;
        let mut membership = GroupMember::load_membership(self.pool(), group.group_id).await?;

        let accept = ChatMsgEvent::GrpAcpt {
            member_id: membership.member_id,
        };
        let conn_info =
            couriercommon::messages::ChatMessage::new(None, accept).encode(false)?;
        let agent_conn_id = self
            .agent()
            .join_connection(
                user.agent_user_id,
                true,
                &couriercommon::identifiers::ConnReqUri(conn_req),
                conn_info,
            )
            .await?;

        // the host's member row owns the new group connection
        let members = GroupMember::load_remote_members(self.pool(), group.group_id).await?;
        let host = members
            .iter()
            .find(|m| m.member_category == GroupMemberCategory::HostMember);
        self.with_transaction(async |txn| {
            Connection::store(
                txn.as_mut(),
                user.user_id,
                &agent_conn_id,
                ConnStatus::Joined,
                ConnType::GroupMember,
                NewConnection {
                    group_member_id: host.map(|h| h.group_member_id),
                    ..Default::default()
                },
            )
            .await?;
            membership
                .advance_status(txn.as_mut(), GroupMemberStatus::Accepted)
                .await?;
            Ok::<_, StoreError>(())
        })
        .await?;
        group.set_inv_conn_req(self.pool(), None).await?;
        Ok(ChatResponse::UserAcceptedGroup(group))
    }

    pub(super) async fn api_member_role(
        &self,
        group: Group,
        group_member_id: GroupMemberId,
        role: GroupMemberRole,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let membership = GroupMember::load_membership(self.pool(), group.group_id).await?;
        let mut member = GroupMember::load(self.pool(), group_member_id).await?;
        // admins act only below their own rank
        if membership.member_role < GroupMemberRole::Admin
            || member.member_role > membership.member_role
            || role > membership.member_role
        {
            return Err(CommandError::GroupUserRole.into());
        }

        let event = ChatMsgEvent::GrpMemRole {
            member_id: member.member_id,
            role,
        };
        let members = GroupMember::load_remote_members(self.pool(), group.group_id).await?;
        let (snd_message, body) = self.create_snd_message(user.user_id, |_| event).await?;
        self.deliver_to_group(&members, &snd_message, &body).await?;

        member.update_role(self.pool(), role).await?;
        crate::chats::ChatItem::store(
            self.pool(),
            &NewChatItem::internal(
                user.user_id,
                ChatRef::Group(group.group_id),
                CIDirection::Snd,
                CIContent::SndGroupEvent {
                    event: SndGroupEventCI::MemberRole {
                        member: member.local_display_name.clone(),
                        role,
                    },
                },
            ),
        )
        .await?;
        Ok(ChatResponse::MemberRole { group, member })
    }

    pub(super) async fn api_remove_member(
        &self,
        group: Group,
        group_member_id: GroupMemberId,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let membership = GroupMember::load_membership(self.pool(), group.group_id).await?;
        let mut member = GroupMember::load(self.pool(), group_member_id).await?;
        if membership.member_role < GroupMemberRole::Admin
            || member.member_role > membership.member_role
        {
            return Err(CommandError::GroupUserRole.into());
        }

        let members = GroupMember::load_remote_members(self.pool(), group.group_id).await?;
        let event = ChatMsgEvent::GrpMemDel {
            member_id: member.member_id,
        };
        let (snd_message, body) = self.create_snd_message(user.user_id, |_| event).await?;
        self.deliver_to_group(&members, &snd_message, &body).await?;

        member
            .advance_status(self.pool(), GroupMemberStatus::Removed)
            .await?;
        self.delete_member_connection(&member).await?;
        crate::chats::ChatItem::store(
            self.pool(),
            &NewChatItem::internal(
                user.user_id,
                ChatRef::Group(group.group_id),
                CIDirection::Snd,
                CIContent::SndGroupEvent {
                    event: SndGroupEventCI::MemberDeleted {
                        member: member.local_display_name.clone(),
                    },
                },
            ),
        )
        .await?;
        Ok(ChatResponse::DeletedMember { group, member })
    }

    pub(super) async fn api_leave_group(&self, group: Group) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let mut membership = GroupMember::load_membership(self.pool(), group.group_id).await?;
        let members = GroupMember::load_remote_members(self.pool(), group.group_id).await?;

        let (snd_message, body) = self
            .create_snd_message(user.user_id, |_| ChatMsgEvent::GrpLeave)
            .await?;
        self.deliver_to_group(&members, &snd_message, &body).await?;

        membership
            .advance_status(self.pool(), GroupMemberStatus::Left)
            .await?;
        for member in &members {
            self.delete_member_connection(member).await?;
        }
        crate::chats::ChatItem::store(
            self.pool(),
            &NewChatItem::internal(
                user.user_id,
                ChatRef::Group(group.group_id),
                CIDirection::Snd,
                CIContent::SndGroupEvent {
                    event: SndGroupEventCI::UserLeft,
                },
            ),
        )
        .await?;
        Ok(ChatResponse::LeftMemberUser(group))
    }

    /// Owner-initiated group deletion: announce, drop connections, drop rows.
    pub(crate) async fn delete_group_as_user(
        &self,
        group: Group,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let membership = GroupMember::load_membership(self.pool(), group.group_id).await?;
        if membership.member_role < GroupMemberRole::Owner {
            return Err(CommandError::GroupUserRole.into());
        }
        let members = GroupMember::load_remote_members(self.pool(), group.group_id).await?;
        let (snd_message, body) = self
            .create_snd_message(user.user_id, |_| ChatMsgEvent::GrpDel)
            .await?;
        self.deliver_to_group(&members, &snd_message, &body).await?;
        for member in &members {
            self.delete_member_connection(member).await?;
        }
        self.with_transaction(async |txn| {
            Group::delete(txn.as_mut(), group.group_id).await?;
            Ok::<_, StoreError>(())
        })
        .await?;
        Ok(ChatResponse::GroupDeletedUser(group))
    }

    pub(super) async fn api_list_members(&self, group: Group) -> Result<ChatResponse, ChatError> {
        let members = GroupMember::load_remote_members(self.pool(), group.group_id).await?;
        Ok(ChatResponse::GroupMembers { group, members })
    }

    pub(super) async fn api_list_groups(&self) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        Ok(ChatResponse::GroupsList(
            Group::load_all(self.pool(), user.user_id).await?,
        ))
    }

    pub(super) async fn api_update_group_profile(
        &self,
        group: Group,
        profile: GroupProfile,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let membership = GroupMember::load_membership(self.pool(), group.group_id).await?;
        if membership.member_role < GroupMemberRole::Owner {
            return Err(CommandError::GroupUserRole.into());
        }
        let mut group = group;
        let members = GroupMember::load_remote_members(self.pool(), group.group_id).await?;
        let (snd_message, body) = self
            .create_snd_message(user.user_id, |_| ChatMsgEvent::GrpInfo(profile.clone()))
            .await?;
        self.deliver_to_group(&members, &snd_message, &body).await?;
        group.update_profile(self.pool(), &profile).await?;
        crate::chats::ChatItem::store(
            self.pool(),
            &NewChatItem::internal(
                user.user_id,
                ChatRef::Group(group.group_id),
                CIDirection::Snd,
                CIContent::SndGroupEvent {
                    event: SndGroupEventCI::GroupUpdated,
                },
            ),
        )
        .await?;
        Ok(ChatResponse::GroupUpdated(group))
    }

    pub(super) async fn api_create_group_link(
        &self,
        group: Group,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let membership = GroupMember::load_membership(self.pool(), group.group_id).await?;
        if membership.member_role < GroupMemberRole::Admin {
            return Err(CommandError::GroupUserRole.into());
        }
        let (agent_conn_id, conn_req) = self
            .agent()
            .create_connection(user.agent_user_id, ConnectionMode::Contact)
            .await?;
        let group_link_id = GroupLinkId::random(&mut OsRng);
        self.with_transaction(async |txn| {
            let link = UserContactLink::store(
                txn.as_mut(),
                user.user_id,
                &conn_req,
                Some(group.group_id),
                Some(group_link_id),
            )
            .await?;
            Connection::store(
                txn.as_mut(),
                user.user_id,
                &agent_conn_id,
                ConnStatus::New,
                ConnType::UserContact,
                NewConnection {
                    user_contact_link_id: Some(link.user_contact_link_id),
                    group_link_id: Some(group_link_id),
                    ..Default::default()
                },
            )
            .await?;
            Ok::<_, StoreError>(())
        })
        .await?;
        Ok(ChatResponse::GroupLinkCreated { group, conn_req })
    }

    pub(super) async fn api_delete_group_link(
        &self,
        group: Group,
    ) -> Result<ChatResponse, ChatError> {
        let link = UserContactLink::load_for_group(self.pool(), group.group_id)
            .await?
            .ok_or(StoreError::UserContactLinkNotFound)?;
        self.delete_contact_link(&link).await?;
        Ok(ChatResponse::GroupLinkDeleted)
    }

    pub(super) async fn api_show_group_link(
        &self,
        group: Group,
    ) -> Result<ChatResponse, ChatError> {
        let link = UserContactLink::load_for_group(self.pool(), group.group_id)
            .await?
            .ok_or(StoreError::UserContactLinkNotFound)?;
        Ok(ChatResponse::GroupLink {
            conn_req: link.conn_req_contact,
        })
    }

    /// Marks a member connection deleted and hands it to the agent.
    pub(crate) async fn delete_member_connection(
        &self,
        member: &GroupMember,
    ) -> Result<(), ChatError> {
        let Some(mut connection) =
            Connection::load_for_group_member(self.pool(), member.group_member_id).await?
        else {
            return Ok(());
        };
        connection
            .update_status(self.pool(), ConnStatus::Deleted)
            .await?;
        let corr_id = self
            .reserve_corr_id(Some(connection.user_id), Some(connection.conn_id), "delete_conn")
            .await?;
        self.agent()
            .delete_connection(corr_id, &connection.agent_conn_id)
            .await?;
        Ok(())
    }
}
