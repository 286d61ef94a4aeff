// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Call commands: WebRTC negotiation relayed over the messaging connection.

use chrono::Utc;
use courieragentclient::AgentApi;
use couriercommon::messages::{
    CallId, CallInvitationWire, CallMedia, ChatMsgEvent, WebRtcSession,
};

use crate::{
    calls::{Call, CallState},
    chats::{CIContent, CIDirection, ChatItem, ChatRef, NewChatItem, content::CallStatusCI},
    contacts::Contact,
    error::{ChatError, CommandError},
    events::ChatResponse,
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(super) async fn api_send_call_invitation(
        &self,
        contact: Contact,
        media: CallMedia,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let connection = self.usable_contact_connection(&contact).await?;

        let call_id = CallId(hex::encode(rand::random::<[u8; 16]>()));
        let event = ChatMsgEvent::CallInv {
            call_id: call_id.clone(),
            invitation: CallInvitationWire {
                media,
                dh_pub_key: None,
            },
        };
        let (message, body) = self.create_snd_message(user.user_id, |_| event).await?;
        self.deliver_message(&connection, &message, body).await?;

        let item = ChatItem::store(
            self.pool(),
            &NewChatItem::internal(
                user.user_id,
                ChatRef::Direct(contact.contact_id),
                CIDirection::Snd,
                CIContent::SndCall {
                    status: CallStatusCI::Pending,
                },
            ),
        )
        .await?;

        let call = Call {
            user_id: user.user_id,
            contact_id: contact.contact_id,
            call_id,
            chat_item_id: Some(item.chat_item_id),
            call_state: CallState::InvitationSent,
            call_ts: Utc::now(),
            media,
        };
        call.upsert(self.pool()).await?;
        self.inner()
            .calls
            .lock()
            .expect("calls poisoned")
            .insert(contact.contact_id, call);
        Ok(ChatResponse::NewChatItem(item))
    }

    pub(super) async fn api_send_call_offer(
        &self,
        contact: Contact,
        offer: WebRtcSession,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let connection = self.usable_contact_connection(&contact).await?;
        let mut call = self.take_call(contact.contact_id)?;
        if call.call_state != CallState::InvitationReceived {
            self.put_call(call);
            return Err(CommandError::CallState.into());
        }

        let event = ChatMsgEvent::CallOffer {
            call_id: call.call_id.clone(),
            offer,
        };
        let (message, body) = self.create_snd_message(user.user_id, |_| event).await?;
        self.deliver_message(&connection, &message, body).await?;

        call.call_state = CallState::OfferSent;
        call.upsert(self.pool()).await?;
        self.put_call(call);
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_send_call_answer(
        &self,
        contact: Contact,
        answer: WebRtcSession,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let connection = self.usable_contact_connection(&contact).await?;
        let mut call = self.take_call(contact.contact_id)?;
        if call.call_state != CallState::OfferReceived {
            self.put_call(call);
            return Err(CommandError::CallState.into());
        }

        let event = ChatMsgEvent::CallAnswer {
            call_id: call.call_id.clone(),
            answer,
        };
        let (message, body) = self.create_snd_message(user.user_id, |_| event).await?;
        self.deliver_message(&connection, &message, body).await?;

        call.call_state = CallState::Negotiated;
        call.upsert(self.pool()).await?;
        self.put_call(call);
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_send_call_extra(
        &self,
        contact: Contact,
        extra: WebRtcSession,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let connection = self.usable_contact_connection(&contact).await?;
        let call = self.take_call(contact.contact_id)?;

        let event = ChatMsgEvent::CallExtra {
            call_id: call.call_id.clone(),
            extra,
        };
        self.put_call(call);
        let (message, body) = self.create_snd_message(user.user_id, |_| event).await?;
        self.deliver_message(&connection, &message, body).await?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_end_call(&self, contact: Contact) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let connection = self.usable_contact_connection(&contact).await?;
        let call = self.take_call(contact.contact_id)?;

        let event = ChatMsgEvent::CallEnd {
            call_id: call.call_id.clone(),
        };
        let (message, body) = self.create_snd_message(user.user_id, |_| event).await?;
        self.deliver_message(&connection, &message, body).await?;

        Call::delete(self.pool(), contact.contact_id).await?;
        self.emit(ChatResponse::CallEnded {
            contact_id: contact.contact_id,
        })
        .await;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_reject_call(
        &self,
        contact: Contact,
    ) -> Result<ChatResponse, ChatError> {
        let call = self.take_call(contact.contact_id)?;
        if call.call_state != CallState::InvitationReceived {
            self.put_call(call);
            return Err(CommandError::CallState.into());
        }
        Call::delete(self.pool(), contact.contact_id).await?;
        if let Some(chat_item_id) = call.chat_item_id {
            let mut item = ChatItem::load(self.pool(), chat_item_id).await?;
            item.update_content(
                self.pool(),
                CIContent::RcvCall {
                    status: CallStatusCI::Rejected,
                },
                None,
            )
            .await?;
        }
        Ok(ChatResponse::CmdOk)
    }

    // current-calls map helpers, serialized under the chat lock

    fn take_call(&self, contact_id: i64) -> Result<Call, ChatError> {
        self.inner()
            .calls
            .lock()
            .expect("calls poisoned")
            .remove(&contact_id)
            .ok_or_else(|| CommandError::CallNotFound(contact_id).into())
    }

    pub(crate) fn put_call(&self, call: Call) {
        self.inner()
            .calls
            .lock()
            .expect("calls poisoned")
            .insert(call.contact_id, call);
    }
}
