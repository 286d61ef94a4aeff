// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Contact and connection commands.

use courieragentclient::{AgentApi, ConnectionMode};
use couriercommon::{
    identifiers::ConnReqUri,
    messages::{ChatMessage, ChatMsgEvent},
    profile::Preferences,
};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::{
    chats::ChatRef,
    connections::{ConnStatus, ConnType, Connection, NewConnection},
    contacts::{Contact, ContactRequest, UserContactLink, unique_display_name},
    error::{ChatError, CommandError},
    events::ChatResponse,
    groups::Group,
    store::{ContactId, StoreError},
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    /// Creates a one-off invitation link for a new contact.
    pub(super) async fn api_add_contact(&self) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let (agent_conn_id, conn_req) = self
            .agent()
            .create_connection(user.agent_user_id, ConnectionMode::Invitation)
            .await?;
        Connection::store(
            self.pool(),
            user.user_id,
            &agent_conn_id,
            ConnStatus::New,
            ConnType::ContactDirect,
            NewConnection::default(),
        )
        .await?;
        Ok(ChatResponse::Invitation { conn_req })
    }

    /// Joins a peer's invitation or contact address.
    pub(super) async fn api_connect(
        &self,
        conn_req: ConnReqUri,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let conn_info =
            ChatMessage::new(None, ChatMsgEvent::Info(user.profile.clone())).encode(false)?;
        let agent_conn_id = self
            .agent()
            .join_connection(user.agent_user_id, true, &conn_req, conn_info)
            .await?;
        Connection::store(
            self.pool(),
            user.user_id,
            &agent_conn_id,
            ConnStatus::Joined,
            ConnType::ContactDirect,
            NewConnection::default(),
        )
        .await?;
        Ok(ChatResponse::SentConfirmation)
    }

    pub(super) async fn api_accept_contact(
        &self,
        contact_request_id: i64,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let request = ContactRequest::load(self.pool(), contact_request_id).await?;
        let conn_info =
            ChatMessage::new(None, ChatMsgEvent::Info(user.profile.clone())).encode(false)?;
        let agent_conn_id = self
            .agent()
            .accept_contact(
                user.agent_user_id,
                true,
                &request.agent_invitation_id,
                conn_info,
            )
            .await?;

        self.with_transaction(async |txn| {
            let name =
                unique_display_name(txn.as_mut(), user.user_id, &request.local_display_name)
                    .await?;
            let contact =
                Contact::store(txn.as_mut(), user.user_id, &name, &request.profile).await?;
            Connection::store(
                txn.as_mut(),
                user.user_id,
                &agent_conn_id,
                ConnStatus::Accepted,
                ConnType::ContactDirect,
                NewConnection {
                    contact_id: Some(contact.contact_id),
                    user_contact_link_id: Some(request.user_contact_link_id),
                    ..Default::default()
                },
            )
            .await?;
            ContactRequest::delete(txn.as_mut(), contact_request_id).await?;
            Ok::<_, StoreError>(())
        })
        .await?;
        info!(contact_request_id, "accepted contact request");
        Ok(ChatResponse::AcceptingContactRequest(request))
    }

    pub(super) async fn api_reject_contact(
        &self,
        contact_request_id: i64,
    ) -> Result<ChatResponse, ChatError> {
        let request = ContactRequest::load(self.pool(), contact_request_id).await?;
        let link = UserContactLink::load(self.pool(), request.user_contact_link_id).await?;
        let connection =
            Connection::load_for_user_contact_link(self.pool(), link.user_contact_link_id)
                .await?
                .ok_or_else(|| StoreError::ConnectionNotFound("user contact".into()))?;
        self.agent()
            .reject_contact(&connection.agent_conn_id, &request.agent_invitation_id)
            .await?;
        ContactRequest::delete(self.pool(), contact_request_id).await?;
        Ok(ChatResponse::ContactRequestRejected(contact_request_id))
    }

    pub(super) async fn api_list_contacts(&self) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        Ok(ChatResponse::ContactsList(
            Contact::load_all(self.pool(), user.user_id).await?,
        ))
    }

    pub(super) async fn api_delete_chat(
        &self,
        chat_ref: ChatRef,
    ) -> Result<ChatResponse, ChatError> {
        match chat_ref {
            ChatRef::Direct(contact_id) => self.delete_contact_chat(contact_id).await,
            ChatRef::Group(group_id) => {
                let group = Group::load(self.pool(), group_id).await?;
                self.delete_group_as_user(group).await
            }
            ChatRef::ContactConnection(conn_id) => {
                let mut connection = Connection::load(self.pool(), conn_id).await?;
                connection
                    .update_status(self.pool(), ConnStatus::Deleted)
                    .await?;
                let corr_id = self
                    .reserve_corr_id(Some(connection.user_id), Some(conn_id), "delete_conn")
                    .await?;
                self.agent()
                    .delete_connection(corr_id, &connection.agent_conn_id)
                    .await?;
                Ok(ChatResponse::CmdOk)
            }
        }
    }

    async fn delete_contact_chat(
        &self,
        contact_id: ContactId,
    ) -> Result<ChatResponse, ChatError> {
        let contact = Contact::load(self.pool(), contact_id).await?;
        if let Some(mut connection) =
            Connection::load_for_contact(self.pool(), contact_id).await?
        {
            connection
                .update_status(self.pool(), ConnStatus::Deleted)
                .await?;
            let corr_id = self
                .reserve_corr_id(
                    Some(contact.user_id),
                    Some(connection.conn_id),
                    "delete_conn",
                )
                .await?;
            self.agent()
                .delete_connection(corr_id, &connection.agent_conn_id)
                .await?;
        }
        self.with_transaction(async |txn| {
            Contact::delete(txn.as_mut(), contact_id).await?;
            Ok::<_, StoreError>(())
        })
        .await?;
        Ok(ChatResponse::ContactDeleted(contact_id))
    }

    pub(super) async fn api_clear_chat(
        &self,
        chat_ref: ChatRef,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let (column, id) = match chat_ref {
            ChatRef::Direct(contact_id) => ("contact_id", contact_id),
            ChatRef::Group(group_id) => ("group_id", group_id),
            ChatRef::ContactConnection(_) => return Err(CommandError::InvalidChatRef.into()),
        };
        sqlx::query(&format!(
            "DELETE FROM chat_items WHERE user_id = ? AND {column} = ?"
        ))
        .bind(user.user_id)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_set_contact_alias(
        &self,
        contact_id: ContactId,
        alias: String,
    ) -> Result<ChatResponse, ChatError> {
        let mut contact = Contact::load(self.pool(), contact_id).await?;
        contact.set_alias(self.pool(), alias).await?;
        Ok(ChatResponse::ContactAliasUpdated(contact))
    }

    pub(super) async fn api_set_contact_prefs(
        &self,
        contact_id: ContactId,
        preferences: Preferences,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let mut contact = Contact::load(self.pool(), contact_id).await?;
        contact
            .set_user_preferences(self.pool(), &preferences)
            .await?;

        // announce the per-contact overrides as our profile for this contact
        if let Some(connection) = Connection::load_for_contact(self.pool(), contact_id).await?
            && connection.conn_status.snd_usable()
        {
            let mut profile = user.profile.clone();
            profile.preferences = Some(preferences);
            let (message, body) = self
                .create_snd_message(user.user_id, |_| ChatMsgEvent::Info(profile))
                .await?;
            self.deliver_message(&connection, &message, body).await?;
        }
        Ok(ChatResponse::ContactUpdated(contact))
    }

    pub(super) async fn api_contact_info(
        &self,
        contact: Contact,
    ) -> Result<ChatResponse, ChatError> {
        let connection = Connection::load_for_contact(self.pool(), contact.contact_id).await?;
        let (rcv_servers, snd_servers) = match &connection {
            Some(connection) => {
                let servers = self
                    .agent()
                    .get_connection_servers(&connection.agent_conn_id)
                    .await?;
                (servers.rcv_servers, servers.snd_servers)
            }
            None => (Vec::new(), Vec::new()),
        };
        Ok(ChatResponse::ContactInfo {
            contact,
            rcv_servers,
            snd_servers,
        })
    }

    pub(super) async fn api_get_contact_code(
        &self,
        contact: Contact,
    ) -> Result<ChatResponse, ChatError> {
        let connection = self.usable_contact_connection(&contact).await?;
        let code = self.connection_code(&connection).await?;
        Ok(ChatResponse::ContactCode {
            contact_id: contact.contact_id,
            code,
        })
    }

    pub(super) async fn api_verify_contact(
        &self,
        contact: Contact,
        code: Option<String>,
    ) -> Result<ChatResponse, ChatError> {
        let mut connection = self.usable_contact_connection(&contact).await?;
        let expected = self.connection_code(&connection).await?;
        match code {
            Some(code) if normalize_code(&code) == normalize_code(&expected) => {
                connection
                    .set_conn_code(self.pool(), Some(expected.clone()))
                    .await?;
                Ok(ChatResponse::ConnectionVerified {
                    verified: true,
                    code: expected,
                })
            }
            Some(_) => {
                connection.set_conn_code(self.pool(), None).await?;
                Ok(ChatResponse::ConnectionVerified {
                    verified: false,
                    code: expected,
                })
            }
            None => {
                connection.set_conn_code(self.pool(), None).await?;
                Ok(ChatResponse::ConnectionVerified {
                    verified: false,
                    code: expected,
                })
            }
        }
    }

    pub(super) async fn api_enable_contact(
        &self,
        contact: Contact,
    ) -> Result<ChatResponse, ChatError> {
        let Some(mut connection) =
            Connection::load_for_contact(self.pool(), contact.contact_id).await?
        else {
            return Err(
                CommandError::ContactNotReady(contact.local_display_name.clone()).into(),
            );
        };
        connection.reset_auth_err_counter(self.pool()).await?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_switch_contact(
        &self,
        contact: Contact,
    ) -> Result<ChatResponse, ChatError> {
        let connection = self.usable_contact_connection(&contact).await?;
        self.agent()
            .switch_connection(&connection.agent_conn_id)
            .await?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_set_chat_ntfs(
        &self,
        chat_ref: ChatRef,
        enable: bool,
    ) -> Result<ChatResponse, ChatError> {
        match chat_ref {
            ChatRef::Direct(contact_id) => {
                if let Some(connection) =
                    Connection::load_for_contact(self.pool(), contact_id).await?
                {
                    self.agent()
                        .toggle_connection_ntfs(&connection.agent_conn_id, enable)
                        .await?;
                }
                Contact::set_ntfs(self.pool(), contact_id, enable).await?;
                Ok(ChatResponse::CmdOk)
            }
            ChatRef::Group(group_id) => {
                let members =
                    crate::groups::GroupMember::load_remote_members(self.pool(), group_id)
                        .await?;
                for member in members {
                    if let Some(connection) =
                        Connection::load_for_group_member(self.pool(), member.group_member_id)
                            .await?
                    {
                        self.agent()
                            .toggle_connection_ntfs(&connection.agent_conn_id, enable)
                            .await?;
                    }
                }
                Ok(ChatResponse::CmdOk)
            }
            ChatRef::ContactConnection(_) => Err(CommandError::InvalidChatRef.into()),
        }
    }

    /// Derives the human-comparable security code of a connection from the
    /// agent's ratchet associated-data hash.
    pub(crate) async fn connection_code(
        &self,
        connection: &Connection,
    ) -> Result<String, ChatError> {
        let hash = self
            .agent()
            .get_connection_ratchet_ad_hash(&connection.agent_conn_id)
            .await?;
        Ok(security_code(&hash))
    }
}

/// Renders a digest as grouped decimal digits.
fn security_code(hash: &[u8]) -> String {
    let digest = Sha256::digest(hash);
    let mut digits = String::with_capacity(30);
    for byte in digest.iter().take(10) {
        digits.push_str(&format!("{:03}", byte));
    }
    digits
        .as_bytes()
        .chunks(5)
        .map(|chunk| std::str::from_utf8(chunk).expect("digits are ASCII"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_code(code: &str) -> String {
    code.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_code_is_stable_and_grouped() {
        let code = security_code(&[1, 2, 3]);
        assert_eq!(code, security_code(&[1, 2, 3]));
        assert_ne!(code, security_code(&[1, 2, 4]));
        for group in code.split(' ') {
            assert_eq!(group.len(), 5);
            assert!(group.bytes().all(|b| b.is_ascii_digit()));
        }
    }
}
