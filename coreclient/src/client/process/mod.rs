// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The event processor.
//!
//! Every agent event is handled under the chat lock, labelled with the
//! event tag. Events are routed to exactly one entity handler keyed on the
//! connection type. Handler errors are reported on the view channel; a
//! single failing connection never halts the processor.

use courieragentclient::{AgentApi, AgentEntity, AgentEvent, AgentEventEnvelope, SwitchPhase};
use couriercommon::{identifiers::CorrId, messages::ChatMessage};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    chats::{CIContent, CIDirection, ChatItem, ChatRef, NewChatItem, content::SwitchPhaseCI},
    connections::{ConnStatus, ConnType, Connection},
    error::ChatError,
    events::ChatResponse,
    messages::{Message, MsgDelivery},
    store::StoreError,
};

use super::ChatController;

mod contact;
mod files;
mod group_member;
mod user_contact;

/// A received message row paired with its decoded form.
pub(crate) struct RcvMessage {
    pub(crate) message: Message,
    pub(crate) chat_message: ChatMessage,
}

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    /// Reads the agent queue until it closes; the chat lock is labelled with
    /// each event's tag while it is being handled.
    pub fn spawn_agent_loop(
        &self,
        mut events: mpsc::Receiver<AgentEventEnvelope>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = events.recv().await {
                controller.process_agent_event(envelope).await;
            }
            debug!("agent event queue closed");
        })
    }

    /// Handles one agent event under the chat lock.
    pub async fn process_agent_event(&self, envelope: AgentEventEnvelope) {
        let label = format!("event {}", envelope.event.tag());
        let _lock = self.inner().chat_lock.hold(&label).await;
        if let Err(chat_error) = self.handle_agent_event(envelope).await {
            match &chat_error {
                ChatError::Agent(agent_error) if agent_error.is_duplicate() => {
                    debug!(error = %agent_error, "duplicate agent message");
                }
                ChatError::Store(StoreError::ConnectionNotFound(conn)) => {
                    info!(connection = %conn, "event for unknown connection");
                }
                _ => {
                    error!(error = %chat_error, "event handler failed");
                    self.emit(ChatResponse::ChatError(chat_error)).await;
                }
            }
        }
    }

    async fn handle_agent_event(&self, envelope: AgentEventEnvelope) -> Result<(), ChatError> {
        let AgentEventEnvelope {
            corr_id,
            entity,
            event,
        } = envelope;

        // command correlation: completions delete the pending row
        if let Some(corr_id) = &corr_id {
            match &event {
                AgentEvent::CmdOk => {
                    self.complete_command(corr_id).await?;
                    return Ok(());
                }
                AgentEvent::CmdError { error } => {
                    self.complete_command(corr_id).await?;
                    return Err(error.clone().into());
                }
                AgentEvent::Invitation { conn_req } => {
                    self.complete_command(corr_id).await?;
                    debug!(%conn_req, "invitation for async-created connection");
                    return Ok(());
                }
                _ => {}
            }
        }

        match entity {
            AgentEntity::Connection(agent_conn_id) => {
                let connection =
                    Connection::load_by_agent_conn_id(self.pool(), &agent_conn_id).await?;
                self.dispatch_connection_event(connection, event).await
            }
            AgentEntity::SndFile(snd_file_id) => {
                self.process_xftp_snd_event(snd_file_id, event).await
            }
            AgentEntity::RcvFile(rcv_file_id) => {
                self.process_xftp_rcv_event(rcv_file_id, event).await
            }
            AgentEntity::None => {
                debug!(tag = event.tag(), "unaddressed agent event");
                Ok(())
            }
        }
    }

    async fn dispatch_connection_event(
        &self,
        connection: Connection,
        event: AgentEvent,
    ) -> Result<(), ChatError> {
        match connection.conn_type {
            ConnType::ContactDirect => self.process_contact_event(connection, event).await,
            ConnType::GroupMember => self.process_group_member_event(connection, event).await,
            ConnType::SndFile => self.process_snd_file_conn_event(connection, event).await,
            ConnType::RcvFile => self.process_rcv_file_conn_event(connection, event).await,
            ConnType::UserContact => self.process_user_contact_event(connection, event).await,
        }
    }

    // helpers shared by the entity handlers

    /// Acknowledges a handled message asynchronously via a correlated
    /// command.
    pub(crate) async fn ack_rcv_message(
        &self,
        connection: &Connection,
        agent_msg_id: i64,
    ) -> Result<(), ChatError> {
        let corr_id = self
            .reserve_corr_id(Some(connection.user_id), Some(connection.conn_id), "ack")
            .await?;
        self.agent()
            .ack_message(corr_id, &connection.agent_conn_id, agent_msg_id)
            .await?;
        Ok(())
    }

    /// Decodes and records a received message.
    ///
    /// Returns `None` when the agent message id was seen before on this
    /// connection, making re-deliveries of acked messages idempotent.
    pub(crate) async fn store_rcv_message(
        &self,
        connection: &Connection,
        agent_msg_id: i64,
        body: &[u8],
    ) -> Result<Option<RcvMessage>, ChatError> {
        if MsgDelivery::exists(self.pool(), connection.conn_id, agent_msg_id).await? {
            debug!(
                connection_id = connection.conn_id,
                agent_msg_id, "re-delivered message; already handled"
            );
            return Ok(None);
        }
        let chat_message = ChatMessage::decode(body)?;
        let message = Message::store(
            self.pool(),
            connection.user_id,
            false,
            chat_message.event.tag(),
            body,
            chat_message.shared_msg_id,
        )
        .await?;
        MsgDelivery::store(
            self.pool(),
            message.message_id,
            connection.conn_id,
            agent_msg_id,
        )
        .await?;
        Ok(Some(RcvMessage {
            message,
            chat_message,
        }))
    }

    /// Common handling of events that look the same on every connection
    /// kind. Returns false when the event was not consumed.
    pub(crate) async fn process_common_conn_event(
        &self,
        connection: &mut Connection,
        chat_ref: Option<ChatRef>,
        event: &AgentEvent,
    ) -> Result<bool, ChatError> {
        match event {
            AgentEvent::SndReady => {
                connection
                    .update_status(self.pool(), ConnStatus::SndReady)
                    .await?;
                Ok(true)
            }
            AgentEvent::Sent { agent_msg_id } => {
                debug!(
                    connection_id = connection.conn_id,
                    agent_msg_id, "message reached the broker"
                );
                Ok(true)
            }
            AgentEvent::Switch { phase, .. } => {
                if let Some(chat_ref) = chat_ref {
                    self.emit(ChatResponse::SwitchProgress {
                        chat_ref,
                        phase: *phase,
                    })
                    .await;
                    if *phase != SwitchPhase::Confirmed {
                        let user = self.current_user()?;
                        let item = ChatItem::store(
                            self.pool(),
                            &NewChatItem::internal(
                                user.user_id,
                                chat_ref,
                                CIDirection::Snd,
                                CIContent::SndConnEvent {
                                    phase: switch_phase_ci(*phase),
                                },
                            ),
                        )
                        .await?;
                        self.emit(ChatResponse::NewChatItem(item)).await;
                    }
                }
                Ok(true)
            }
            AgentEvent::MsgError { error, .. } | AgentEvent::Error { error } => {
                if error.is_smp_auth() {
                    let counter = connection.increment_auth_err_counter(self.pool()).await?;
                    if counter >= self.config().auth_err_disable_count
                        && let Some(chat_ref) = chat_ref
                    {
                        warn!(connection_id = connection.conn_id, "connection disabled");
                        self.emit(ChatResponse::ConnectionDisabled { chat_ref }).await;
                    }
                } else if error.is_duplicate() {
                    debug!(connection_id = connection.conn_id, %error, "duplicate message");
                } else if error.is_conn_not_found() {
                    info!(connection_id = connection.conn_id, %error, "connection not found");
                } else {
                    self.emit(ChatResponse::ChatError(error.clone().into())).await;
                }
                Ok(true)
            }
            AgentEvent::ConnDeleted => {
                Connection::delete(self.pool(), connection.conn_id).await?;
                Ok(true)
            }
            AgentEvent::Up => {
                debug!(connection_id = connection.conn_id, "subscription restored");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub(crate) fn switch_phase_ci(phase: SwitchPhase) -> SwitchPhaseCI {
    match phase {
        SwitchPhase::Started => SwitchPhaseCI::Started,
        SwitchPhase::Confirmed => SwitchPhaseCI::Confirmed,
        SwitchPhase::SecuredQueue => SwitchPhaseCI::SecuredQueue,
        SwitchPhase::Completed => SwitchPhaseCI::Completed,
    }
}
