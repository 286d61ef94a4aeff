// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Settings, servers and push notification commands.

use courieragentclient::{AgentApi, DeviceToken, NetworkConfig, NtfMode, ProtocolServer};

use crate::{
    error::ChatError,
    events::ChatResponse,
    store::UserId,
    users::User,
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(super) async fn api_get_user_servers(
        &self,
        user_id: UserId,
    ) -> Result<ChatResponse, ChatError> {
        let user = User::load(self.pool(), user_id).await?;
        let servers = self.agent().get_protocol_servers(user.agent_user_id).await?;
        Ok(ChatResponse::UserServers { servers })
    }

    pub(super) async fn api_set_user_servers(
        &self,
        user_id: UserId,
        servers: Vec<ProtocolServer>,
    ) -> Result<ChatResponse, ChatError> {
        let user = User::load(self.pool(), user_id).await?;
        self.agent()
            .set_protocol_servers(user.agent_user_id, servers)
            .await?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_test_server(
        &self,
        user_id: UserId,
        server: ProtocolServer,
    ) -> Result<ChatResponse, ChatError> {
        let user = User::load(self.pool(), user_id).await?;
        let failure = self
            .agent()
            .test_protocol_server(user.agent_user_id, &server)
            .await?;
        Ok(ChatResponse::ServerTestResult { server, failure })
    }

    /// Sets (or clears) the item TTL; `0` addresses the active user, as the
    /// friendly `/ttl` forms do.
    pub(super) async fn api_set_chat_item_ttl(
        &self,
        user_id: UserId,
        ttl: Option<i64>,
    ) -> Result<ChatResponse, ChatError> {
        let user_id = if user_id == 0 {
            self.current_user()?.user_id
        } else {
            user_id
        };
        User::set_chat_item_ttl(self.pool(), user_id, ttl).await?;
        if let Ok(current) = self.current_user()
            && current.user_id == user_id
        {
            let refreshed = User::load(self.pool(), user_id).await?;
            self.set_current_user(Some(refreshed));
        }
        match ttl {
            Some(_) => self.ensure_expiration_worker(user_id).await,
            None => self.inner().expiration.pause(user_id),
        }
        Ok(ChatResponse::ChatItemTtl { ttl })
    }

    pub(super) async fn api_get_chat_item_ttl(
        &self,
        user_id: UserId,
    ) -> Result<ChatResponse, ChatError> {
        let user = User::load(self.pool(), user_id).await?;
        Ok(ChatResponse::ChatItemTtl {
            ttl: user.chat_item_ttl,
        })
    }

    pub(super) async fn api_set_network_config(
        &self,
        config: NetworkConfig,
    ) -> Result<ChatResponse, ChatError> {
        self.agent().set_network_config(config.clone()).await?;
        *self
            .inner()
            .network_config
            .lock()
            .expect("network config poisoned") = config.clone();
        Ok(ChatResponse::NetworkConfig(config))
    }

    pub(super) async fn api_get_network_config(&self) -> Result<ChatResponse, ChatError> {
        let config = self
            .inner()
            .network_config
            .lock()
            .expect("network config poisoned")
            .clone();
        Ok(ChatResponse::NetworkConfig(config))
    }

    pub(super) async fn api_register_ntf_token(
        &self,
        token: DeviceToken,
        mode: NtfMode,
    ) -> Result<ChatResponse, ChatError> {
        let status = self.agent().register_ntf_token(&token, mode).await?;
        Ok(ChatResponse::NtfToken { status })
    }

    pub(super) async fn api_verify_ntf_token(
        &self,
        token: DeviceToken,
        nonce: Vec<u8>,
        code: Vec<u8>,
    ) -> Result<ChatResponse, ChatError> {
        self.agent().verify_ntf_token(&token, nonce, code).await?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_delete_ntf_token(
        &self,
        token: DeviceToken,
    ) -> Result<ChatResponse, ChatError> {
        self.agent().delete_ntf_token(&token).await?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_get_ntf_message(
        &self,
        nonce: Vec<u8>,
        enc_payload: Vec<u8>,
    ) -> Result<ChatResponse, ChatError> {
        let (agent_conn_id, messages) = self
            .agent()
            .get_notification_message(nonce, enc_payload)
            .await?;
        Ok(ChatResponse::NtfMessages {
            agent_conn_id,
            count: messages.len(),
        })
    }
}
