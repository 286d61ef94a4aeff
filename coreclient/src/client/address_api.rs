// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The user's long-lived contact address.

use courieragentclient::{AgentApi, ConnectionMode};
use couriercommon::messages::MsgContent;
use tracing::warn;

use crate::{
    connections::{ConnStatus, ConnType, Connection, NewConnection},
    contacts::UserContactLink,
    error::ChatError,
    events::ChatResponse,
    store::StoreError,
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(super) async fn api_create_my_address(&self) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let (agent_conn_id, conn_req) = self
            .agent()
            .create_connection(user.agent_user_id, ConnectionMode::Contact)
            .await?;
        self.with_transaction(async |txn| {
            let link =
                UserContactLink::store(txn.as_mut(), user.user_id, &conn_req, None, None).await?;
            Connection::store(
                txn.as_mut(),
                user.user_id,
                &agent_conn_id,
                ConnStatus::New,
                ConnType::UserContact,
                NewConnection {
                    user_contact_link_id: Some(link.user_contact_link_id),
                    ..Default::default()
                },
            )
            .await?;
            Ok::<_, StoreError>(())
        })
        .await?;
        Ok(ChatResponse::UserContactLinkCreated { conn_req })
    }

    pub(super) async fn api_delete_my_address(&self) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let link = UserContactLink::load_for_user(self.pool(), user.user_id).await?;
        self.delete_contact_link(&link).await?;
        Ok(ChatResponse::UserContactLinkDeleted)
    }

    pub(super) async fn api_show_my_address(&self) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let link = UserContactLink::load_for_user(self.pool(), user.user_id).await?;
        Ok(ChatResponse::UserContactLink(link))
    }

    pub(super) async fn api_address_auto_accept(
        &self,
        enable: bool,
        incognito: bool,
        auto_reply: Option<MsgContent>,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let mut link = UserContactLink::load_for_user(self.pool(), user.user_id).await?;
        link.update_auto_accept(self.pool(), enable, incognito, auto_reply)
            .await?;
        Ok(ChatResponse::UserContactLinkUpdated(link))
    }

    /// Removes an address (or group link): the agent connection dies
    /// asynchronously, the rows go now.
    pub(crate) async fn delete_contact_link(
        &self,
        link: &UserContactLink,
    ) -> Result<(), ChatError> {
        if let Some(mut connection) =
            Connection::load_for_user_contact_link(self.pool(), link.user_contact_link_id)
                .await?
        {
            connection
                .update_status(self.pool(), ConnStatus::Deleted)
                .await?;
            let corr_id = self
                .reserve_corr_id(Some(link.user_id), Some(connection.conn_id), "delete_conn")
                .await?;
            if let Err(error) = self
                .agent()
                .delete_connection(corr_id, &connection.agent_conn_id)
                .await
            {
                warn!(%error, "failed to delete address connection");
            }
        }
        UserContactLink::delete(self.pool(), link.user_contact_link_id).await?;
        Ok(())
    }
}
