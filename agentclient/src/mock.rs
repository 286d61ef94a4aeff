// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted in-memory agent for controller tests.
//!
//! Every command succeeds with generated identifiers and is recorded for
//! later inspection. Individual failures can be queued with
//! [`MockAgent::fail_next`].

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex},
};

use couriercommon::identifiers::{
    AgentConnId, AgentMsgId, ConfirmationId, ConnReqUri, CorrId, InvitationId,
};

use crate::{
    AgentApi, AgentError, ConnectionMode, ConnectionServers, DeviceToken, MsgFlags, NetworkConfig,
    NtfMode, NtfTokenStatus, ProtocolServer, RcvFileId, ServerTestFailure, SndFileId,
    SubscriptionResults,
};

/// A record of one command issued to the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCommand {
    CreateConnection {
        user_id: i64,
        mode: ConnectionMode,
    },
    CreateConnectionAsync {
        corr_id: CorrId,
        user_id: i64,
    },
    JoinConnection {
        conn_req: ConnReqUri,
        conn_info: Vec<u8>,
    },
    AllowConnection {
        corr_id: CorrId,
        conn_id: AgentConnId,
        conn_info: Vec<u8>,
    },
    AcceptContact {
        invitation_id: InvitationId,
        conn_info: Vec<u8>,
    },
    RejectContact {
        conn_id: AgentConnId,
        invitation_id: InvitationId,
    },
    DeleteConnection {
        corr_id: CorrId,
        conn_id: AgentConnId,
    },
    DeleteConnections {
        conn_ids: Vec<AgentConnId>,
    },
    SendMessage {
        conn_id: AgentConnId,
        flags: MsgFlags,
        body: Vec<u8>,
    },
    AckMessage {
        corr_id: CorrId,
        conn_id: AgentConnId,
        agent_msg_id: AgentMsgId,
    },
    SwitchConnection {
        conn_id: AgentConnId,
    },
    SubscribeConnections {
        conn_ids: Vec<AgentConnId>,
    },
    ToggleNtfs {
        conn_id: AgentConnId,
        enable: bool,
    },
    Resume,
    Disconnect,
    Activate,
    Suspend {
        drain_secs: u64,
    },
    RegisterNtfToken {
        token: DeviceToken,
        mode: NtfMode,
    },
    VerifyNtfToken {
        token: DeviceToken,
    },
    DeleteNtfToken {
        token: DeviceToken,
    },
    GetNotificationMessage,
    XftpSendFile {
        user_id: i64,
        path: String,
        recipient_count: usize,
    },
    XftpReceiveFile {
        user_id: i64,
        descriptor: String,
    },
    XftpDeleteSndFile {
        snd_file_id: SndFileId,
    },
    XftpDeleteRcvFile {
        rcv_file_id: RcvFileId,
    },
    TestProtocolServer {
        user_id: i64,
        server: ProtocolServer,
    },
    SetProtocolServers {
        user_id: i64,
        servers: Vec<ProtocolServer>,
    },
    SetNetworkConfig {
        config: NetworkConfig,
    },
}

#[derive(Debug, Default)]
struct MockAgentInner {
    next_conn: u64,
    next_file: i64,
    next_msg_ids: HashMap<AgentConnId, AgentMsgId>,
    commands: Vec<MockCommand>,
    queued_failures: VecDeque<AgentError>,
}

#[derive(Debug, Clone, Default)]
pub struct MockAgent {
    inner: Arc<Mutex<MockAgentInner>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error returned by the next command, in queue order.
    pub fn fail_next(&self, error: AgentError) {
        self.lock().queued_failures.push_back(error);
    }

    /// All commands recorded so far, in issue order.
    pub fn commands(&self) -> Vec<MockCommand> {
        self.lock().commands.clone()
    }

    /// Bodies of the messages sent on `conn_id`, in send order.
    pub fn sent_messages(&self, conn_id: &AgentConnId) -> Vec<Vec<u8>> {
        self.lock()
            .commands
            .iter()
            .filter_map(|command| match command {
                MockCommand::SendMessage {
                    conn_id: sent_on,
                    body,
                    ..
                } if sent_on == conn_id => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    /// The connection id the mock generated for the `n`-th created or joined
    /// connection (0-based).
    pub fn conn_id(n: u64) -> AgentConnId {
        AgentConnId(format!("mock-conn-{n}").into_bytes())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockAgentInner> {
        self.inner.lock().expect("mock agent poisoned")
    }

    fn record(&self, command: MockCommand) -> Result<(), AgentError> {
        let mut inner = self.lock();
        inner.commands.push(command);
        match inner.queued_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn fresh_conn_id(&self) -> AgentConnId {
        let mut inner = self.lock();
        let conn_id = Self::conn_id(inner.next_conn);
        inner.next_conn += 1;
        conn_id
    }

    fn fresh_file_id(&self) -> i64 {
        let mut inner = self.lock();
        inner.next_file += 1;
        inner.next_file
    }

    fn next_msg_id(&self, conn_id: &AgentConnId) -> AgentMsgId {
        let mut inner = self.lock();
        let next = inner.next_msg_ids.entry(conn_id.clone()).or_insert(0);
        *next += 1;
        *next
    }
}

impl AgentApi for MockAgent {
    async fn create_connection(
        &self,
        user_id: i64,
        mode: ConnectionMode,
    ) -> Result<(AgentConnId, ConnReqUri), AgentError> {
        self.record(MockCommand::CreateConnection { user_id, mode })?;
        let conn_id = self.fresh_conn_id();
        let conn_req = ConnReqUri(format!("mock://invitation/{conn_id}"));
        Ok((conn_id, conn_req))
    }

    async fn create_connection_async(
        &self,
        corr_id: CorrId,
        user_id: i64,
        _mode: ConnectionMode,
    ) -> Result<AgentConnId, AgentError> {
        self.record(MockCommand::CreateConnectionAsync { corr_id, user_id })?;
        Ok(self.fresh_conn_id())
    }

    async fn join_connection(
        &self,
        _user_id: i64,
        _enable_ntfs: bool,
        conn_req: &ConnReqUri,
        conn_info: Vec<u8>,
    ) -> Result<AgentConnId, AgentError> {
        self.record(MockCommand::JoinConnection {
            conn_req: conn_req.clone(),
            conn_info,
        })?;
        Ok(self.fresh_conn_id())
    }

    async fn allow_connection(
        &self,
        corr_id: CorrId,
        conn_id: &AgentConnId,
        _confirmation_id: &ConfirmationId,
        conn_info: Vec<u8>,
    ) -> Result<(), AgentError> {
        self.record(MockCommand::AllowConnection {
            corr_id,
            conn_id: conn_id.clone(),
            conn_info,
        })
    }

    async fn accept_contact(
        &self,
        _user_id: i64,
        _enable_ntfs: bool,
        invitation_id: &InvitationId,
        conn_info: Vec<u8>,
    ) -> Result<AgentConnId, AgentError> {
        self.record(MockCommand::AcceptContact {
            invitation_id: invitation_id.clone(),
            conn_info,
        })?;
        Ok(self.fresh_conn_id())
    }

    async fn accept_contact_async(
        &self,
        _corr_id: CorrId,
        _enable_ntfs: bool,
        invitation_id: &InvitationId,
        conn_info: Vec<u8>,
    ) -> Result<AgentConnId, AgentError> {
        self.record(MockCommand::AcceptContact {
            invitation_id: invitation_id.clone(),
            conn_info,
        })?;
        Ok(self.fresh_conn_id())
    }

    async fn reject_contact(
        &self,
        conn_id: &AgentConnId,
        invitation_id: &InvitationId,
    ) -> Result<(), AgentError> {
        self.record(MockCommand::RejectContact {
            conn_id: conn_id.clone(),
            invitation_id: invitation_id.clone(),
        })
    }

    async fn delete_connection(
        &self,
        corr_id: CorrId,
        conn_id: &AgentConnId,
    ) -> Result<(), AgentError> {
        self.record(MockCommand::DeleteConnection {
            corr_id,
            conn_id: conn_id.clone(),
        })
    }

    async fn delete_connections(&self, conn_ids: &[AgentConnId]) -> Result<(), AgentError> {
        self.record(MockCommand::DeleteConnections {
            conn_ids: conn_ids.to_vec(),
        })
    }

    async fn send_message(
        &self,
        conn_id: &AgentConnId,
        flags: MsgFlags,
        body: Vec<u8>,
    ) -> Result<AgentMsgId, AgentError> {
        self.record(MockCommand::SendMessage {
            conn_id: conn_id.clone(),
            flags,
            body,
        })?;
        Ok(self.next_msg_id(conn_id))
    }

    async fn ack_message(
        &self,
        corr_id: CorrId,
        conn_id: &AgentConnId,
        agent_msg_id: AgentMsgId,
    ) -> Result<(), AgentError> {
        self.record(MockCommand::AckMessage {
            corr_id,
            conn_id: conn_id.clone(),
            agent_msg_id,
        })
    }

    async fn switch_connection(&self, conn_id: &AgentConnId) -> Result<(), AgentError> {
        self.record(MockCommand::SwitchConnection {
            conn_id: conn_id.clone(),
        })
    }

    async fn subscribe_connections(
        &self,
        conn_ids: Vec<AgentConnId>,
    ) -> Result<SubscriptionResults, AgentError> {
        self.record(MockCommand::SubscribeConnections {
            conn_ids: conn_ids.clone(),
        })?;
        Ok(conn_ids
            .into_iter()
            .map(|conn_id| (conn_id, Ok(())))
            .collect())
    }

    async fn toggle_connection_ntfs(
        &self,
        conn_id: &AgentConnId,
        enable: bool,
    ) -> Result<(), AgentError> {
        self.record(MockCommand::ToggleNtfs {
            conn_id: conn_id.clone(),
            enable,
        })
    }

    async fn resume_agent_client(&self) -> Result<(), AgentError> {
        self.record(MockCommand::Resume)
    }

    async fn disconnect_agent_client(&self) -> Result<(), AgentError> {
        self.record(MockCommand::Disconnect)
    }

    async fn activate_agent(&self) -> Result<(), AgentError> {
        self.record(MockCommand::Activate)
    }

    async fn suspend_agent(&self, drain_secs: u64) -> Result<(), AgentError> {
        self.record(MockCommand::Suspend { drain_secs })
    }

    async fn register_ntf_token(
        &self,
        token: &DeviceToken,
        mode: NtfMode,
    ) -> Result<NtfTokenStatus, AgentError> {
        self.record(MockCommand::RegisterNtfToken {
            token: token.clone(),
            mode,
        })?;
        Ok(NtfTokenStatus::Registered)
    }

    async fn verify_ntf_token(
        &self,
        token: &DeviceToken,
        _nonce: Vec<u8>,
        _code: Vec<u8>,
    ) -> Result<(), AgentError> {
        self.record(MockCommand::VerifyNtfToken {
            token: token.clone(),
        })
    }

    async fn delete_ntf_token(&self, token: &DeviceToken) -> Result<(), AgentError> {
        self.record(MockCommand::DeleteNtfToken {
            token: token.clone(),
        })
    }

    async fn get_notification_message(
        &self,
        _nonce: Vec<u8>,
        _enc_payload: Vec<u8>,
    ) -> Result<(AgentConnId, Vec<Vec<u8>>), AgentError> {
        self.record(MockCommand::GetNotificationMessage)?;
        Ok((Self::conn_id(0), Vec::new()))
    }

    async fn xftp_send_file(
        &self,
        user_id: i64,
        path: &Path,
        recipient_count: usize,
    ) -> Result<SndFileId, AgentError> {
        self.record(MockCommand::XftpSendFile {
            user_id,
            path: path.display().to_string(),
            recipient_count,
        })?;
        Ok(self.fresh_file_id())
    }

    async fn xftp_receive_file(
        &self,
        user_id: i64,
        descriptor: &str,
    ) -> Result<RcvFileId, AgentError> {
        self.record(MockCommand::XftpReceiveFile {
            user_id,
            descriptor: descriptor.to_owned(),
        })?;
        Ok(self.fresh_file_id())
    }

    async fn xftp_delete_snd_file(&self, snd_file_id: SndFileId) -> Result<(), AgentError> {
        self.record(MockCommand::XftpDeleteSndFile { snd_file_id })
    }

    async fn xftp_delete_rcv_file(&self, rcv_file_id: RcvFileId) -> Result<(), AgentError> {
        self.record(MockCommand::XftpDeleteRcvFile { rcv_file_id })
    }

    async fn get_connection_servers(
        &self,
        _conn_id: &AgentConnId,
    ) -> Result<ConnectionServers, AgentError> {
        Ok(ConnectionServers {
            rcv_servers: vec!["smp://mock-rcv".to_owned()],
            snd_servers: vec!["smp://mock-snd".to_owned()],
        })
    }

    async fn get_connection_ratchet_ad_hash(
        &self,
        conn_id: &AgentConnId,
    ) -> Result<Vec<u8>, AgentError> {
        // Deterministic per connection so both test peers derive one code.
        Ok(conn_id.as_slice().iter().cycle().take(32).copied().collect())
    }

    async fn test_protocol_server(
        &self,
        user_id: i64,
        server: &ProtocolServer,
    ) -> Result<Option<ServerTestFailure>, AgentError> {
        self.record(MockCommand::TestProtocolServer {
            user_id,
            server: server.clone(),
        })?;
        Ok(None)
    }

    async fn get_protocol_servers(
        &self,
        _user_id: i64,
    ) -> Result<Vec<ProtocolServer>, AgentError> {
        Ok(vec![ProtocolServer {
            protocol: crate::AgentProtocol::Smp,
            address: "smp://mock".to_owned(),
        }])
    }

    async fn set_protocol_servers(
        &self,
        user_id: i64,
        servers: Vec<ProtocolServer>,
    ) -> Result<(), AgentError> {
        self.record(MockCommand::SetProtocolServers { user_id, servers })
    }

    async fn set_network_config(&self, config: NetworkConfig) -> Result<(), AgentError> {
        self.record(MockCommand::SetNetworkConfig { config })
    }

    async fn get_agent_stats(&self) -> Result<HashMap<String, i64>, AgentError> {
        let inner = self.lock();
        Ok(HashMap::from([(
            "commands".to_owned(),
            inner.commands.len() as i64,
        )]))
    }

    async fn debug_agent_locks(&self) -> Result<Vec<String>, AgentError> {
        Ok(Vec::new())
    }
}
