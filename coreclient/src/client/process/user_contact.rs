// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Events on the contact-address listener connection.

use chrono::Utc;
use courieragentclient::{AgentApi, AgentEvent};
use couriercommon::{
    identifiers::InvitationId,
    messages::{ChatMessage, ChatMsgEvent},
    profile::Profile,
};
use tracing::{info, warn};

use crate::{
    connections::{ConnStatus, ConnType, Connection, NewConnection},
    contacts::{Contact, ContactRequest, UserContactLink, unique_display_name},
    error::ChatError,
    events::ChatResponse,
    store::StoreError,
    users::User,
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(super) async fn process_user_contact_event(
        &self,
        mut connection: Connection,
        event: AgentEvent,
    ) -> Result<(), ChatError> {
        match event {
            AgentEvent::ContactRequest {
                invitation_id,
                conn_info,
            } => {
                let user = self.current_user()?;
                let message = ChatMessage::decode(&conn_info)?;
                let profile = match message.event {
                    ChatMsgEvent::Contact(profile) | ChatMsgEvent::Info(profile) => profile,
                    other => {
                        warn!(tag = other.tag(), "unexpected contact request payload");
                        return Ok(());
                    }
                };
                let link_id = connection.user_contact_link_id.ok_or_else(|| {
                    ChatError::Internal("address connection without link".into())
                })?;
                let link = UserContactLink::load(self.pool(), link_id).await?;

                if link.auto_accept {
                    self.auto_accept_request(&user, &link, &invitation_id, profile)
                        .await
                } else {
                    let request = self
                        .with_transaction(async |txn| {
                            let name = unique_display_name(
                                txn.as_mut(),
                                user.user_id,
                                &profile.display_name,
                            )
                            .await?;
                            ContactRequest::store(
                                txn.as_mut(),
                                user.user_id,
                                link_id,
                                &invitation_id,
                                &name,
                                &profile,
                            )
                            .await
                        })
                        .await?;
                    info!(
                        contact_request_id = request.contact_request_id,
                        "received contact request"
                    );
                    self.emit(ChatResponse::ReceivedContactRequest(request)).await;
                    Ok(())
                }
            }
            AgentEvent::Connected => {
                connection
                    .update_status(self.pool(), ConnStatus::Ready)
                    .await?;
                Ok(())
            }
            other => {
                self.process_common_conn_event(&mut connection, None, &other)
                    .await?;
                Ok(())
            }
        }
    }

    /// Address auto-accept: accept immediately, optionally behind a fresh
    /// incognito profile. The connected contact later gets the auto-reply
    /// and any group-link admission.
    async fn auto_accept_request(
        &self,
        user: &User,
        link: &UserContactLink,
        invitation_id: &InvitationId,
        peer_profile: Profile,
    ) -> Result<(), ChatError> {
        let (reply_profile, custom_user_profile_id) = if link.auto_accept_incognito {
            let incognito = incognito_profile();
            let profile_id = self.store_incognito_profile(user, &incognito).await?;
            (incognito, Some(profile_id))
        } else {
            (user.profile.clone(), None)
        };

        let conn_info =
            ChatMessage::new(None, ChatMsgEvent::Info(reply_profile)).encode(false)?;
        let agent_conn_id = self
            .agent()
            .accept_contact(user.agent_user_id, true, invitation_id, conn_info)
            .await?;

        let request = self
            .with_transaction(async |txn| {
                let name =
                    unique_display_name(txn.as_mut(), user.user_id, &peer_profile.display_name)
                        .await?;
                let contact =
                    Contact::store(txn.as_mut(), user.user_id, &name, &peer_profile).await?;
                Connection::store(
                    txn.as_mut(),
                    user.user_id,
                    &agent_conn_id,
                    ConnStatus::Accepted,
                    ConnType::ContactDirect,
                    NewConnection {
                        contact_id: Some(contact.contact_id),
                        user_contact_link_id: Some(link.user_contact_link_id),
                        custom_user_profile_id,
                        ..Default::default()
                    },
                )
                .await?;
                Ok::<_, StoreError>(ContactRequest {
                    contact_request_id: 0,
                    user_id: user.user_id,
                    user_contact_link_id: link.user_contact_link_id,
                    agent_invitation_id: invitation_id.clone(),
                    local_display_name: contact.local_display_name.clone(),
                    profile: peer_profile,
                    created_at: Utc::now(),
                })
            })
            .await?;
        info!("auto-accepted contact request");
        self.emit(ChatResponse::AcceptingContactRequest(request)).await;
        Ok(())
    }

    async fn store_incognito_profile(
        &self,
        user: &User,
        profile: &Profile,
    ) -> Result<i64, ChatError> {
        let profile_json =
            serde_json::to_string(profile).map_err(|e| StoreError::Internal(e.to_string()))?;
        let profile_id: i64 = sqlx::query_scalar(
            "INSERT INTO profiles (user_id, profile, created_at)
            VALUES (?, ?, ?)
            RETURNING profile_id",
        )
        .bind(user.user_id)
        .bind(profile_json)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(profile_id)
    }
}

/// A throwaway pseudonymous profile for incognito connections.
fn incognito_profile() -> Profile {
    let suffix: [u8; 4] = rand::random();
    Profile::new(format!("incognito_{}", hex::encode(suffix)))
}
