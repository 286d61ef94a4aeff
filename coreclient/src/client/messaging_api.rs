// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Messaging commands: reads, sends, edits and deletes.

use chrono::{Duration, Utc};
use courieragentclient::AgentApi;
use couriercommon::{
    messages::{
        ChatMsgEvent, ExtMsgContent, MsgContainer, MsgContent, MsgRef, QuotedMsg,
    },
    profile::{FeatureAllowed, FeatureEnabled, GroupMemberRole},
};
use tracing::warn;

use crate::{
    chats::{
        CIContent, CIDirection, CIPagination, CIQuote, CITimed, ChatItem, ChatPreview, ChatRef,
        NewChatItem,
    },
    commands::{CIDeleteMode, ComposedMessage},
    connections::Connection,
    contacts::Contact,
    error::{ChatError, CommandError},
    events::ChatResponse,
    groups::{Group, GroupMember},
    messages::PendingGroupMessage,
    store::{ChatItemId, StoreError},
    users::User,
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(super) async fn api_get_chats(&self) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let mut previews = Vec::new();
        for contact in Contact::load_all(self.pool(), user.user_id).await? {
            let chat_ref = ChatRef::Direct(contact.contact_id);
            let last_item = ChatItem::last_in_chat(self.pool(), user.user_id, chat_ref).await?;
            previews.push(ChatPreview {
                chat_ref,
                display_name: contact.local_display_name,
                chat_ts: contact.chat_ts,
                last_item,
            });
        }
        for group in Group::load_all(self.pool(), user.user_id).await? {
            let chat_ref = ChatRef::Group(group.group_id);
            let last_item = ChatItem::last_in_chat(self.pool(), user.user_id, chat_ref).await?;
            previews.push(ChatPreview {
                chat_ref,
                display_name: group.local_display_name,
                chat_ts: group.chat_ts,
                last_item,
            });
        }
        previews.sort_by(|a, b| b.chat_ts.cmp(&a.chat_ts));
        Ok(ChatResponse::Chats(previews))
    }

    pub(super) async fn api_get_chat(
        &self,
        chat_ref: ChatRef,
        pagination: CIPagination,
        search: Option<String>,
    ) -> Result<ChatResponse, ChatError> {
        if matches!(chat_ref, ChatRef::ContactConnection(_)) {
            return Err(CommandError::InvalidChatRef.into());
        }
        let user = self.current_user()?;
        let items = ChatItem::load_chat(
            self.pool(),
            user.user_id,
            chat_ref,
            pagination,
            search.as_deref(),
        )
        .await?;
        Ok(ChatResponse::ChatItems { chat_ref, items })
    }

    pub(super) async fn api_send_message(
        &self,
        chat_ref: ChatRef,
        live: bool,
        ttl: Option<i64>,
        message: ComposedMessage,
    ) -> Result<ChatResponse, ChatError> {
        match chat_ref {
            ChatRef::Direct(contact_id) => {
                self.send_direct_message(contact_id, live, ttl, message).await
            }
            ChatRef::Group(group_id) => {
                self.send_group_message(group_id, live, ttl, message).await
            }
            ChatRef::ContactConnection(_) => Err(CommandError::InvalidChatRef.into()),
        }
    }

    async fn send_direct_message(
        &self,
        contact_id: i64,
        live: bool,
        ttl: Option<i64>,
        message: ComposedMessage,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let contact = Contact::load(self.pool(), contact_id).await?;
        let connection = self.usable_contact_connection(&contact).await?;
        self.check_direct_features(&user, &contact, &message.msg_content, ttl)?;

        // attach a file offer when the composed message carries a path
        let (file_id, file_invitation) = match &message.file_path {
            Some(path) => {
                let (file_id, invitation) = self
                    .prepare_snd_file(
                        ChatRef::Direct(contact_id),
                        path,
                        1,
                        message.msg_content.is_voice(),
                        Some(&connection),
                    )
                    .await?;
                (Some(file_id), Some(invitation))
            }
            None => (None, None),
        };

        let quote = match message.quoted_item_id {
            Some(quoted_item_id) => Some(
                self.quoted_msg(ChatRef::Direct(contact_id), quoted_item_id, None)
                    .await?,
            ),
            None => None,
        };

        let ext = ExtMsgContent {
            content: message.msg_content.clone(),
            file: file_invitation,
            ttl,
            live: live.then_some(true),
        };
        let container = match quote.clone() {
            Some(quote) => MsgContainer::Quote {
                quote,
                content: ext,
            },
            None => MsgContainer::Simple(ext),
        };

        let (snd_message, body) = self
            .create_snd_message(user.user_id, |_| ChatMsgEvent::MsgNew(container))
            .await?;
        self.deliver_message(&connection, &snd_message, body).await?;

        let item = self
            .store_snd_item(
                &user,
                ChatRef::Direct(contact_id),
                snd_message.shared_msg_id,
                CIContent::SndMsgContent {
                    msg_content: message.msg_content,
                },
                file_id,
                quote.map(quote_snapshot),
                live,
                ttl,
                snd_message.message_id,
            )
            .await?;

        Contact::set_used(self.pool(), contact_id).await?;
        Contact::update_chat_ts(self.pool(), contact_id, Utc::now()).await?;

        // pre-accepted inline files start streaming right after the offer
        if let Some(file_id) = file_id {
            self.maybe_stream_inline_file(file_id, &connection).await?;
        }
        Ok(ChatResponse::NewChatItem(item))
    }

    async fn send_group_message(
        &self,
        group_id: i64,
        live: bool,
        ttl: Option<i64>,
        message: ComposedMessage,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let group = Group::load(self.pool(), group_id).await?;
        let membership = GroupMember::load_membership(self.pool(), group_id).await?;
        if membership.member_role < GroupMemberRole::Author {
            return Err(CommandError::GroupUserRole.into());
        }
        let members = GroupMember::load_remote_members(self.pool(), group_id).await?;

        let recipients = members
            .iter()
            .filter(|member| member.member_status.is_current())
            .count() as i64;
        let (file_id, file_invitation) = match &message.file_path {
            Some(path) => {
                let (file_id, invitation) = self
                    .prepare_snd_file(
                        ChatRef::Group(group_id),
                        path,
                        recipients.max(1),
                        message.msg_content.is_voice(),
                        None,
                    )
                    .await?;
                (Some(file_id), Some(invitation))
            }
            None => (None, None),
        };

        let quote = match message.quoted_item_id {
            Some(quoted_item_id) => Some(
                self.quoted_msg(
                    ChatRef::Group(group_id),
                    quoted_item_id,
                    Some(&membership),
                )
                .await?,
            ),
            None => None,
        };

        let ext = ExtMsgContent {
            content: message.msg_content.clone(),
            file: file_invitation,
            ttl,
            live: live.then_some(true),
        };
        let container = match quote.clone() {
            Some(quote) => MsgContainer::Quote {
                quote,
                content: ext,
            },
            None => MsgContainer::Simple(ext),
        };
        let (snd_message, body) = self
            .create_snd_message(user.user_id, |_| ChatMsgEvent::MsgNew(container))
            .await?;

        self.deliver_to_group(&members, &snd_message, &body).await?;

        let item = self
            .store_snd_item(
                &user,
                ChatRef::Group(group_id),
                snd_message.shared_msg_id,
                CIContent::SndMsgContent {
                    msg_content: message.msg_content,
                },
                file_id,
                quote.map(quote_snapshot),
                live,
                ttl,
                snd_message.message_id,
            )
            .await?;
        Group::update_chat_ts(self.pool(), group_id, Utc::now()).await?;
        Ok(ChatResponse::NewChatItem(item))
    }

    /// Delivers one prepared message to every current member; members whose
    /// connection is not usable yet get a pending row instead. Individual
    /// failures surface as view events and do not abort the batch.
    pub(crate) async fn deliver_to_group(
        &self,
        members: &[GroupMember],
        snd_message: &crate::messages::Message,
        body: &[u8],
    ) -> Result<(), ChatError> {
        for member in members {
            if !member.member_status.is_current() {
                continue;
            }
            let connection =
                Connection::load_for_group_member(self.pool(), member.group_member_id).await?;
            match connection {
                Some(connection)
                    if connection.conn_status.snd_usable()
                        && connection.auth_err_counter
                            < self.config().auth_err_disable_count =>
                {
                    if let Err(error) = self
                        .deliver_message(&connection, snd_message, body.to_vec())
                        .await
                    {
                        warn!(
                            group_member_id = member.group_member_id,
                            %error,
                            "group delivery failed"
                        );
                        self.emit(ChatResponse::ChatError(error)).await;
                    }
                }
                _ => {
                    PendingGroupMessage::store(
                        self.pool(),
                        member.group_member_id,
                        snd_message.message_id,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    pub(super) async fn api_update_chat_item(
        &self,
        chat_ref: ChatRef,
        chat_item_id: ChatItemId,
        live: bool,
        msg_content: MsgContent,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let mut item = ChatItem::load(self.pool(), chat_item_id).await?;
        if item.item_sent != CIDirection::Snd {
            return Err(CommandError::InvalidChatRef.into());
        }
        let shared_msg_id = item
            .shared_msg_id
            .ok_or_else(|| ChatError::Internal("chat item has no shared message id".into()))?;

        let event = ChatMsgEvent::MsgUpdate {
            msg_id: shared_msg_id,
            content: msg_content.clone(),
        };
        match chat_ref {
            ChatRef::Direct(contact_id) => {
                let contact = Contact::load(self.pool(), contact_id).await?;
                let connection = self.usable_contact_connection(&contact).await?;
                let (snd_message, body) =
                    self.create_snd_message(user.user_id, |_| event).await?;
                self.deliver_message(&connection, &snd_message, body).await?;
            }
            ChatRef::Group(group_id) => {
                let members = GroupMember::load_remote_members(self.pool(), group_id).await?;
                let (snd_message, body) =
                    self.create_snd_message(user.user_id, |_| event).await?;
                self.deliver_to_group(&members, &snd_message, &body).await?;
            }
            ChatRef::ContactConnection(_) => return Err(CommandError::InvalidChatRef.into()),
        }

        item.update_content(
            self.pool(),
            CIContent::SndMsgContent { msg_content },
            live.then_some(true),
        )
        .await?;
        Ok(ChatResponse::ChatItemUpdated(item))
    }

    pub(super) async fn api_delete_chat_item(
        &self,
        chat_ref: ChatRef,
        chat_item_id: ChatItemId,
        mode: CIDeleteMode,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let mut item = ChatItem::load(self.pool(), chat_item_id).await?;
        self.inner().timed_tasks.cancel(chat_ref, chat_item_id);

        // the item holds only a weak reference to its file: deleting the
        // item cancels the transfer, the file row goes later
        if let Some(file_id) = item.file_id {
            if let Err(error) = self.api_cancel_file(file_id).await {
                tracing::debug!(file_id, %error, "no transfer left to cancel");
            }
        }

        match mode {
            CIDeleteMode::Internal => {
                ChatItem::delete(self.pool(), chat_item_id).await?;
                Ok(ChatResponse::ChatItemDeleted {
                    deleted_item: item,
                    to_item: None,
                    by_user: true,
                    timed: false,
                })
            }
            CIDeleteMode::Broadcast => {
                if item.item_sent != CIDirection::Snd {
                    return Err(CommandError::InvalidChatRef.into());
                }
                let shared_msg_id = item.shared_msg_id.ok_or_else(|| {
                    ChatError::Internal("chat item has no shared message id".into())
                })?;

                let full_delete;
                match chat_ref {
                    ChatRef::Direct(contact_id) => {
                        let contact = Contact::load(self.pool(), contact_id).await?;
                        let connection = self.usable_contact_connection(&contact).await?;
                        full_delete = self
                            .direct_feature_enabled(&user, &contact, |p| p.full_delete)
                            .for_user;
                        let event = ChatMsgEvent::MsgDel {
                            msg_id: shared_msg_id,
                            member_id: None,
                        };
                        let (snd_message, body) =
                            self.create_snd_message(user.user_id, |_| event).await?;
                        self.deliver_message(&connection, &snd_message, body).await?;
                    }
                    ChatRef::Group(group_id) => {
                        let membership =
                            GroupMember::load_membership(self.pool(), group_id).await?;
                        let members =
                            GroupMember::load_remote_members(self.pool(), group_id).await?;
                        full_delete = false;
                        let event = ChatMsgEvent::MsgDel {
                            msg_id: shared_msg_id,
                            member_id: Some(membership.member_id),
                        };
                        let (snd_message, body) =
                            self.create_snd_message(user.user_id, |_| event).await?;
                        self.deliver_to_group(&members, &snd_message, &body).await?;
                    }
                    ChatRef::ContactConnection(_) => {
                        return Err(CommandError::InvalidChatRef.into());
                    }
                }

                if full_delete {
                    ChatItem::delete(self.pool(), chat_item_id).await?;
                    Ok(ChatResponse::ChatItemDeleted {
                        deleted_item: item,
                        to_item: None,
                        by_user: true,
                        timed: false,
                    })
                } else {
                    item.mark_deleted(self.pool()).await?;
                    let to_item = item.clone();
                    Ok(ChatResponse::ChatItemDeleted {
                        deleted_item: item,
                        to_item: Some(to_item),
                        by_user: true,
                        timed: false,
                    })
                }
            }
        }
    }

    // helpers

    pub(crate) async fn usable_contact_connection(
        &self,
        contact: &Contact,
    ) -> Result<Connection, ChatError> {
        let connection = Connection::load_for_contact(self.pool(), contact.contact_id)
            .await?
            .ok_or_else(|| {
                CommandError::ContactNotReady(contact.local_display_name.clone())
            })?;
        if !connection.conn_status.snd_usable() {
            return Err(
                CommandError::ContactNotReady(contact.local_display_name.clone()).into(),
            );
        }
        if connection.auth_err_counter >= self.config().auth_err_disable_count {
            return Err(
                CommandError::ContactDisabled(contact.local_display_name.clone()).into(),
            );
        }
        Ok(connection)
    }

    pub(crate) fn direct_feature_enabled(
        &self,
        user: &User,
        contact: &Contact,
        select: impl Fn(
            &couriercommon::profile::Preferences,
        ) -> Option<couriercommon::profile::FeaturePreference>,
    ) -> FeatureEnabled {
        let user_allowed = user
            .profile
            .preferences
            .as_ref()
            .and_then(&select)
            .map(|p| p.allow)
            .unwrap_or_default();
        let contact_allowed = contact
            .profile
            .preferences
            .as_ref()
            .and_then(&select)
            .map(|p| p.allow)
            .unwrap_or_default();
        FeatureEnabled::merge(user_allowed, contact_allowed)
    }

    fn check_direct_features(
        &self,
        user: &User,
        contact: &Contact,
        content: &MsgContent,
        ttl: Option<i64>,
    ) -> Result<(), ChatError> {
        if content.is_voice() {
            let voice = self.direct_feature_enabled(user, contact, |p| p.voice);
            if !voice.for_user {
                return Err(CommandError::FeatureNotAllowed("voice".into()).into());
            }
        }
        if ttl.is_some() {
            let timed = self.direct_feature_enabled(user, contact, |p| p.timed_messages);
            // `no` on either side blocks disappearing messages
            if !timed.for_user
                && user
                    .profile
                    .preferences
                    .as_ref()
                    .and_then(|p| p.timed_messages)
                    .map(|p| p.allow)
                    == Some(FeatureAllowed::No)
            {
                return Err(CommandError::FeatureNotAllowed("timed messages".into()).into());
            }
        }
        Ok(())
    }

    async fn quoted_msg(
        &self,
        chat_ref: ChatRef,
        quoted_item_id: ChatItemId,
        membership: Option<&GroupMember>,
    ) -> Result<QuotedMsg, ChatError> {
        let quoted = ChatItem::load(self.pool(), quoted_item_id)
            .await
            .map_err(|_| StoreError::QuotedChatItemNotFound)?;
        if quoted.chat_ref() != chat_ref {
            return Err(StoreError::QuotedChatItemNotFound.into());
        }
        let msg_id = quoted
            .shared_msg_id
            .ok_or(StoreError::QuotedChatItemNotFound)?;
        let content = quoted
            .content
            .msg_content()
            .cloned()
            .ok_or(StoreError::QuotedChatItemNotFound)?;
        let member_id = match (&quoted.item_sent, membership) {
            (CIDirection::Snd, Some(membership)) => Some(membership.member_id),
            (CIDirection::Rcv, _) => match quoted.group_member_id {
                Some(group_member_id) => Some(
                    GroupMember::load(self.pool(), group_member_id)
                        .await?
                        .member_id,
                ),
                None => None,
            },
            _ => None,
        };
        Ok(QuotedMsg {
            msg_ref: MsgRef {
                msg_id,
                sent_at: quoted.item_ts,
                sent: quoted.item_sent.sent(),
                member_id,
            },
            content,
        })
    }

    #[expect(clippy::too_many_arguments, reason = "builder-style internal helper")]
    async fn store_snd_item(
        &self,
        user: &User,
        chat_ref: ChatRef,
        shared_msg_id: Option<couriercommon::identifiers::SharedMsgId>,
        content: CIContent,
        file_id: Option<i64>,
        quote: Option<CIQuote>,
        live: bool,
        ttl: Option<i64>,
        created_by_msg_id: i64,
    ) -> Result<ChatItem, ChatError> {
        let now = Utc::now();
        let timed = ttl.map(|ttl| CITimed {
            ttl,
            delete_at: Some(now + Duration::seconds(ttl)),
        });
        let item = ChatItem::store(
            self.pool(),
            &NewChatItem {
                user_id: user.user_id,
                chat_ref,
                group_member_id: None,
                item_sent: CIDirection::Snd,
                item_ts: now,
                shared_msg_id,
                content,
                file_id,
                quote,
                item_live: live.then_some(true),
                timed,
                created_by_msg_id: Some(created_by_msg_id),
            },
        )
        .await?;
        if item.timed.is_some() {
            self.schedule_timed_item(&item);
        }
        Ok(item)
    }
}

fn quote_snapshot(quote: QuotedMsg) -> CIQuote {
    CIQuote {
        shared_msg_id: Some(quote.msg_ref.msg_id),
        sent: Some(quote.msg_ref.sent),
        content: quote.content,
    }
}
