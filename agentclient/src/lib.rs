// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client API to the messaging and file-transfer agent.
//!
//! The agent owns the queue-relayed encrypted connections and XFTP
//! transfers. This crate exposes one method per agent endpoint plus the
//! event types arriving on the agent's queue. Synchronous commands return
//! their result directly; asynchronous commands take a caller-chosen
//! correlation id and complete via an [`AgentEventEnvelope`] carrying it.

use std::{collections::HashMap, path::Path};

use couriercommon::identifiers::{
    AgentConnId, AgentMsgId, ConfirmationId, ConnReqUri, CorrId, InvitationId,
};

mod types;

#[cfg(feature = "test_utils")]
pub mod mock;

pub use types::*;

/// The agent command surface.
///
/// One method per endpoint. All methods may fail with an [`AgentError`].
#[allow(async_fn_in_trait, reason = "trait is only used in the workspace")]
#[trait_variant::make(AgentApi: Send)]
pub trait LocalAgentApi {
    // connection lifecycle

    async fn create_connection(
        &self,
        user_id: i64,
        mode: ConnectionMode,
    ) -> Result<(AgentConnId, ConnReqUri), AgentError>;

    /// Asynchronously creates an invitation connection; the URI arrives as an
    /// [`AgentEvent::Invitation`] correlated with `corr_id`.
    async fn create_connection_async(
        &self,
        corr_id: CorrId,
        user_id: i64,
        mode: ConnectionMode,
    ) -> Result<AgentConnId, AgentError>;

    async fn join_connection(
        &self,
        user_id: i64,
        enable_ntfs: bool,
        conn_req: &ConnReqUri,
        conn_info: Vec<u8>,
    ) -> Result<AgentConnId, AgentError>;

    async fn allow_connection(
        &self,
        corr_id: CorrId,
        conn_id: &AgentConnId,
        confirmation_id: &ConfirmationId,
        conn_info: Vec<u8>,
    ) -> Result<(), AgentError>;

    async fn accept_contact(
        &self,
        user_id: i64,
        enable_ntfs: bool,
        invitation_id: &InvitationId,
        conn_info: Vec<u8>,
    ) -> Result<AgentConnId, AgentError>;

    /// Asynchronous variant used by address auto-accept.
    async fn accept_contact_async(
        &self,
        corr_id: CorrId,
        enable_ntfs: bool,
        invitation_id: &InvitationId,
        conn_info: Vec<u8>,
    ) -> Result<AgentConnId, AgentError>;

    async fn reject_contact(
        &self,
        conn_id: &AgentConnId,
        invitation_id: &InvitationId,
    ) -> Result<(), AgentError>;

    /// Deletion is asynchronous; completion arrives as
    /// [`AgentEvent::ConnDeleted`].
    async fn delete_connection(
        &self,
        corr_id: CorrId,
        conn_id: &AgentConnId,
    ) -> Result<(), AgentError>;

    async fn delete_connections(&self, conn_ids: &[AgentConnId]) -> Result<(), AgentError>;

    // messaging

    async fn send_message(
        &self,
        conn_id: &AgentConnId,
        flags: MsgFlags,
        body: Vec<u8>,
    ) -> Result<AgentMsgId, AgentError>;

    async fn ack_message(
        &self,
        corr_id: CorrId,
        conn_id: &AgentConnId,
        agent_msg_id: AgentMsgId,
    ) -> Result<(), AgentError>;

    /// Starts rotating the connection's receive queue to fresh servers.
    async fn switch_connection(&self, conn_id: &AgentConnId) -> Result<(), AgentError>;

    // subscriptions

    async fn subscribe_connections(
        &self,
        conn_ids: Vec<AgentConnId>,
    ) -> Result<SubscriptionResults, AgentError>;

    async fn toggle_connection_ntfs(
        &self,
        conn_id: &AgentConnId,
        enable: bool,
    ) -> Result<(), AgentError>;

    async fn resume_agent_client(&self) -> Result<(), AgentError>;

    async fn disconnect_agent_client(&self) -> Result<(), AgentError>;

    async fn activate_agent(&self) -> Result<(), AgentError>;

    async fn suspend_agent(&self, drain_secs: u64) -> Result<(), AgentError>;

    // push notifications

    async fn register_ntf_token(
        &self,
        token: &DeviceToken,
        mode: NtfMode,
    ) -> Result<NtfTokenStatus, AgentError>;

    async fn verify_ntf_token(
        &self,
        token: &DeviceToken,
        nonce: Vec<u8>,
        code: Vec<u8>,
    ) -> Result<(), AgentError>;

    async fn delete_ntf_token(&self, token: &DeviceToken) -> Result<(), AgentError>;

    async fn get_notification_message(
        &self,
        nonce: Vec<u8>,
        enc_payload: Vec<u8>,
    ) -> Result<(AgentConnId, Vec<Vec<u8>>), AgentError>;

    // XFTP

    async fn xftp_send_file(
        &self,
        user_id: i64,
        path: &Path,
        recipient_count: usize,
    ) -> Result<SndFileId, AgentError>;

    async fn xftp_receive_file(
        &self,
        user_id: i64,
        descriptor: &str,
    ) -> Result<RcvFileId, AgentError>;

    async fn xftp_delete_snd_file(&self, snd_file_id: SndFileId) -> Result<(), AgentError>;

    async fn xftp_delete_rcv_file(&self, rcv_file_id: RcvFileId) -> Result<(), AgentError>;

    // introspection

    async fn get_connection_servers(
        &self,
        conn_id: &AgentConnId,
    ) -> Result<ConnectionServers, AgentError>;

    /// Hash of the connection's ratchet associated data, used to derive the
    /// human-comparable security code.
    async fn get_connection_ratchet_ad_hash(
        &self,
        conn_id: &AgentConnId,
    ) -> Result<Vec<u8>, AgentError>;

    async fn test_protocol_server(
        &self,
        user_id: i64,
        server: &ProtocolServer,
    ) -> Result<Option<ServerTestFailure>, AgentError>;

    async fn get_protocol_servers(
        &self,
        user_id: i64,
    ) -> Result<Vec<ProtocolServer>, AgentError>;

    async fn set_protocol_servers(
        &self,
        user_id: i64,
        servers: Vec<ProtocolServer>,
    ) -> Result<(), AgentError>;

    async fn set_network_config(&self, config: NetworkConfig) -> Result<(), AgentError>;

    async fn get_agent_stats(&self) -> Result<HashMap<String, i64>, AgentError>;

    async fn debug_agent_locks(&self) -> Result<Vec<String>, AgentError>;
}
