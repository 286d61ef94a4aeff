// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Event and error types of the agent boundary.
//!
//! The agent pushes events on a single queue as `(correlation id?, entity,
//! event)` triples; XFTP transfer progress arrives on the same queue tagged
//! with the agent-side file id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use couriercommon::identifiers::{
    AgentConnId, AgentMsgId, ConfirmationId, ConnReqUri, CorrId, InvitationId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Agent-side id of an XFTP upload.
pub type SndFileId = i64;
/// Agent-side id of an XFTP download.
pub type RcvFileId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// One-off invitation link, consumed by a single join.
    Invitation,
    /// Long-lived contact address accepting many requests.
    Contact,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFlags {
    pub notification: bool,
}

/// Broker-assigned metadata of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgMeta {
    pub agent_msg_id: AgentMsgId,
    pub broker_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    Rcv,
    Snd,
}

/// Phases of a queue rotation started with `switch_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPhase {
    Started,
    Confirmed,
    SecuredQueue,
    Completed,
}

/// The entity an agent event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEntity {
    Connection(AgentConnId),
    SndFile(SndFileId),
    RcvFile(RcvFileId),
    None,
}

/// One event popped from the agent queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEventEnvelope {
    pub corr_id: Option<CorrId>,
    pub entity: AgentEntity,
    pub event: AgentEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Peer sent its confirmation; the connection waits for `allow`.
    Confirmation {
        confirmation_id: ConfirmationId,
        conn_info: Vec<u8>,
    },
    /// Unsolicited peer information on an established connection.
    Info { conn_info: Vec<u8> },
    /// The connection is ready in both directions.
    Connected,
    /// The sending half of the connection is usable.
    SndReady,
    /// A contact request arrived on a contact-mode connection.
    ContactRequest {
        invitation_id: InvitationId,
        conn_info: Vec<u8>,
    },
    /// Invitation URI produced by an asynchronously created connection.
    Invitation { conn_req: ConnReqUri },
    /// An application message.
    Msg {
        meta: MsgMeta,
        flags: MsgFlags,
        body: Vec<u8>,
    },
    /// A previously sent message reached the broker.
    Sent { agent_msg_id: AgentMsgId },
    /// Queue rotation progress.
    Switch {
        direction: QueueDirection,
        phase: SwitchPhase,
    },
    /// Completion of an asynchronous command.
    CmdOk,
    /// Failure of an asynchronous command.
    CmdError { error: AgentError },
    /// Error tied to a specific received message.
    MsgError {
        agent_msg_id: AgentMsgId,
        error: AgentError,
    },
    /// Connection-level error outside any command.
    Error { error: AgentError },
    /// The agent finished deleting the connection.
    ConnDeleted,
    /// The connection's subscription went down and was restored.
    Up,
    /// XFTP upload progress.
    SndFileProgress { sent: i64, total: i64 },
    /// XFTP upload complete; one descriptor per recipient.
    SndFileDone { descriptors: Vec<String> },
    SndFileError { error: AgentError },
    /// XFTP download progress.
    RcvFileProgress { received: i64, total: i64 },
    /// XFTP download complete; the file sits at the staging path.
    RcvFileDone { staging_path: String },
    RcvFileError { error: AgentError },
}

impl AgentEvent {
    /// Short tag used to label the chat lock while the event is handled.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Confirmation { .. } => "CONF",
            Self::Info { .. } => "INFO",
            Self::Connected => "CON",
            Self::SndReady => "SND_READY",
            Self::ContactRequest { .. } => "REQ",
            Self::Invitation { .. } => "INV",
            Self::Msg { .. } => "MSG",
            Self::Sent { .. } => "SENT",
            Self::Switch { .. } => "SWITCH",
            Self::CmdOk => "OK",
            Self::CmdError { .. } => "ERR",
            Self::MsgError { .. } => "MERR",
            Self::Error { .. } => "ERR",
            Self::ConnDeleted => "DEL",
            Self::Up => "UP",
            Self::SndFileProgress { .. } => "SFPROG",
            Self::SndFileDone { .. } => "SFDONE",
            Self::SndFileError { .. } => "SFERR",
            Self::RcvFileProgress { .. } => "RFPROG",
            Self::RcvFileDone { .. } => "RFDONE",
            Self::RcvFileError { .. } => "RFERR",
        }
    }
}

/// Errors returned by the agent, as a closed sum.
///
/// `Smp(Auth)`, `Agent(Duplicate)` and `Conn(NotFound)` are load-bearing for
/// the controller; everything else is reported verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("SMP error: {0}")]
    Smp(SmpError),
    #[error("connection error: {0}")]
    Conn(ConnError),
    #[error("agent error: {0}")]
    Agent(AgentErrKind),
    #[error("XFTP error: {0}")]
    Xftp(String),
    #[error("command error: {0}")]
    Cmd(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("agent database error: {0}")]
    Database(String),
    #[error("crypto error: {0}")]
    Crypto(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmpError {
    #[error("AUTH")]
    Auth,
    #[error("QUOTA")]
    Quota,
    #[error("LARGE_MSG")]
    LargeMsg,
    #[error("internal: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnError {
    #[error("NOT_FOUND")]
    NotFound,
    #[error("DUPLICATE")]
    Duplicate,
    #[error("NOT_ACCEPTED")]
    NotAccepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentErrKind {
    #[error("DUPLICATE")]
    Duplicate,
    #[error("PROHIBITED")]
    Prohibited,
    #[error("VERSION")]
    Version,
}

impl AgentError {
    pub fn is_smp_auth(&self) -> bool {
        matches!(self, Self::Smp(SmpError::Auth))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Agent(AgentErrKind::Duplicate))
    }

    pub fn is_conn_not_found(&self) -> bool {
        matches!(self, Self::Conn(ConnError::NotFound))
    }
}

/// Result of subscribing a batch of connections.
pub type SubscriptionResults = HashMap<AgentConnId, Result<(), AgentError>>;

/// A protocol a relay server can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentProtocol {
    Smp,
    Xftp,
}

/// Server address including any embedded authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolServer {
    pub protocol: AgentProtocol,
    pub address: String,
}

/// The servers a connection currently uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionServers {
    pub rcv_servers: Vec<String>,
    pub snd_servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerTestStep {
    Connect,
    CreateQueue,
    SecureQueue,
    DeleteQueue,
    Disconnect,
}

/// A failed server self-test, reported with the step that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTestFailure {
    pub step: ServerTestStep,
    pub error: AgentError,
}

/// Transport configuration forwarded to the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "socksProxy", skip_serializing_if = "Option::is_none")]
    pub socks_proxy: Option<String>,
    #[serde(rename = "tcpTimeout", skip_serializing_if = "Option::is_none")]
    pub tcp_timeout_secs: Option<u64>,
    #[serde(rename = "logTlsErrors", default)]
    pub log_tls_errors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceToken(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NtfMode {
    Periodic,
    Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NtfTokenStatus {
    New,
    Registered,
    Confirmed,
    Active,
    Expired,
}
