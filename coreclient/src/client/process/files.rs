// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Events on file connections and XFTP transfer events.

use courieragentclient::{AgentApi, AgentEvent};
use couriercommon::{
    identifiers::SharedMsgId,
    messages::{ChatMessage, ChatMsgEvent, FileDescrPart},
};
use tracing::{debug, info, warn};

use crate::{
    chats::{CIDirection, ChatItem, ChatRef},
    connections::{ConnStatus, Connection},
    error::ChatError,
    events::ChatResponse,
    files::{
        FileStatus, FileTransferMeta, RcvFileChunk, RcvFileTransfer, SndFileTransfer,
        engine::{self, AppendChunkResult},
    },
    users::User,
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    // dedicated send-file connections

    pub(super) async fn process_snd_file_conn_event(
        &self,
        mut connection: Connection,
        event: AgentEvent,
    ) -> Result<(), ChatError> {
        let file_id = connection
            .snd_file_id
            .ok_or_else(|| ChatError::Internal("file connection without file binding".into()))?;
        let meta = FileTransferMeta::load(self.pool(), file_id).await?;

        match event {
            AgentEvent::Confirmation {
                confirmation_id,
                conn_info,
            } => {
                let user = self.current_user()?;
                let message = ChatMessage::decode(&conn_info)?;
                if !matches!(
                    message.event,
                    ChatMsgEvent::FileAcpt { .. } | ChatMsgEvent::Ok
                ) {
                    warn!(tag = message.event.tag(), "unexpected file confirmation");
                }
                let reply = ChatMessage::new(None, ChatMsgEvent::Ok).encode(false)?;
                let corr_id = self
                    .reserve_corr_id(Some(user.user_id), Some(connection.conn_id), "allow")
                    .await?;
                self.agent()
                    .allow_connection(corr_id, &connection.agent_conn_id, &confirmation_id, reply)
                    .await?;
                connection
                    .update_status(self.pool(), ConnStatus::Accepted)
                    .await?;
                if let Some(mut transfer) =
                    SndFileTransfer::load(self.pool(), file_id, connection.conn_id).await?
                {
                    transfer
                        .update_status(self.pool(), FileStatus::Accepted)
                        .await?;
                }
                Ok(())
            }
            AgentEvent::Connected => {
                connection
                    .update_status(self.pool(), ConnStatus::Ready)
                    .await?;
                if let Some(mut transfer) =
                    SndFileTransfer::load(self.pool(), file_id, connection.conn_id).await?
                {
                    transfer
                        .update_status(self.pool(), FileStatus::Connected)
                        .await?;
                }
                if meta.cancelled {
                    debug!(file_id, "transfer connection for a cancelled file");
                    return Ok(());
                }
                self.stream_snd_file(&meta, &connection, false).await?;
                // the dedicated connection dies with the finished transfer
                let corr_id = self
                    .reserve_corr_id(Some(meta.user_id), Some(connection.conn_id), "delete_conn")
                    .await?;
                connection
                    .update_status(self.pool(), ConnStatus::Deleted)
                    .await?;
                self.agent()
                    .delete_connection(corr_id, &connection.agent_conn_id)
                    .await?;
                Ok(())
            }
            AgentEvent::Msg { meta: msg_meta, body, .. } => {
                let decoded = ChatMessage::decode(&body)?;
                if matches!(decoded.event, ChatMsgEvent::FileChunkCancel) {
                    if let Some(mut transfer) =
                        SndFileTransfer::load(self.pool(), file_id, connection.conn_id).await?
                    {
                        transfer
                            .update_status(self.pool(), FileStatus::Cancelled)
                            .await?;
                    }
                    self.inner().snd_file_handles.close(file_id);
                    self.emit(ChatResponse::SndFileRcvCancelled { file_id }).await;
                }
                self.ack_rcv_message(&connection, msg_meta.agent_msg_id).await
            }
            other => {
                self.process_common_conn_event(&mut connection, None, &other)
                    .await?;
                Ok(())
            }
        }
    }

    // dedicated receive-file connections

    pub(super) async fn process_rcv_file_conn_event(
        &self,
        mut connection: Connection,
        event: AgentEvent,
    ) -> Result<(), ChatError> {
        let file_id = connection
            .rcv_file_id
            .ok_or_else(|| ChatError::Internal("file connection without file binding".into()))?;

        match event {
            AgentEvent::Connected => {
                connection
                    .update_status(self.pool(), ConnStatus::Ready)
                    .await?;
                let mut transfer = RcvFileTransfer::load(self.pool(), file_id).await?;
                transfer
                    .update_status(self.pool(), FileStatus::Connected)
                    .await?;
                self.emit(ChatResponse::RcvFileStart { file_id }).await;
                Ok(())
            }
            AgentEvent::Msg { meta: msg_meta, body, .. } => {
                let decoded = ChatMessage::decode(&body)?;
                let result = match decoded.event {
                    ChatMsgEvent::FileChunk { chunk_no, chunk } => {
                        let meta = FileTransferMeta::load(self.pool(), file_id).await?;
                        let mut transfer = RcvFileTransfer::load(self.pool(), file_id).await?;
                        self.process_rcv_chunk(
                            &meta,
                            &mut transfer,
                            chunk_no as i64,
                            &chunk,
                            Some(&connection),
                        )
                        .await
                    }
                    ChatMsgEvent::FileChunkCancel => {
                        let mut meta = FileTransferMeta::load(self.pool(), file_id).await?;
                        let mut transfer = RcvFileTransfer::load(self.pool(), file_id).await?;
                        if transfer.file_status.may_become(FileStatus::Cancelled) {
                            self.cancel_rcv_file(&mut meta, &mut transfer).await?;
                            self.emit(ChatResponse::RcvFileSndCancelled { file_id }).await;
                        }
                        Ok(())
                    }
                    other => {
                        debug!(tag = other.tag(), "event not permitted on file connection");
                        Ok(())
                    }
                };
                self.ack_rcv_message(&connection, msg_meta.agent_msg_id).await?;
                result
            }
            other => {
                self.process_common_conn_event(&mut connection, None, &other)
                    .await?;
                Ok(())
            }
        }
    }

    /// Appends one received chunk, enforcing the assembly invariants, and
    /// finishes the transfer on the last chunk.
    pub(crate) async fn process_rcv_chunk(
        &self,
        meta: &FileTransferMeta,
        transfer: &mut RcvFileTransfer,
        chunk_no: i64,
        chunk: &[u8],
        connection: Option<&Connection>,
    ) -> Result<(), ChatError> {
        if transfer.file_status.is_terminal() {
            debug!(file_id = meta.file_id, "chunk for a finished transfer");
            return Ok(());
        }
        let received = RcvFileChunk::count(self.pool(), meta.file_id).await?;
        match engine::classify_chunk(meta, received, chunk_no, chunk.len())? {
            AppendChunkResult::Duplicate => Ok(()),
            AppendChunkResult::Appended { last } => {
                engine::append_chunk(&self.inner().rcv_file_handles, meta, chunk)?;
                RcvFileChunk::store(self.pool(), meta.file_id, chunk_no).await?;
                if last {
                    self.inner().rcv_file_handles.close(meta.file_id);
                    transfer
                        .update_status(self.pool(), FileStatus::Complete)
                        .await?;
                    RcvFileChunk::delete_for_file(self.pool(), meta.file_id).await?;
                    info!(file_id = meta.file_id, "file received");
                    self.emit(ChatResponse::RcvFileComplete {
                        file_id: meta.file_id,
                        target_path: meta.file_path.clone(),
                    })
                    .await;
                    if let Some(connection) = connection {
                        let mut connection = connection.clone();
                        let corr_id = self
                            .reserve_corr_id(
                                Some(meta.user_id),
                                Some(connection.conn_id),
                                "delete_conn",
                            )
                            .await?;
                        connection
                            .update_status(self.pool(), ConnStatus::Deleted)
                            .await?;
                        self.agent()
                            .delete_connection(corr_id, &connection.agent_conn_id)
                            .await?;
                    }
                }
                Ok(())
            }
        }
    }

    // shared receive-path helpers used by the contact and group handlers

    /// Inline chunk arriving on a messaging connection, located through the
    /// shared message id of its anchoring item.
    pub(super) async fn rcv_inline_chunk(
        &self,
        user: &User,
        chat_ref: ChatRef,
        sender: Option<i64>,
        msg_id: SharedMsgId,
        chunk_no: u32,
        chunk: &[u8],
    ) -> Result<(), ChatError> {
        let item = ChatItem::load_by_shared_msg_id(
            self.pool(),
            user.user_id,
            chat_ref,
            sender,
            CIDirection::Rcv,
            &msg_id,
        )
        .await?;
        let file_id = item
            .file_id
            .ok_or_else(|| ChatError::Internal("chunk for an item without file".into()))?;
        let meta = FileTransferMeta::load(self.pool(), file_id).await?;
        let mut transfer = RcvFileTransfer::load(self.pool(), file_id).await?;
        if transfer.file_status == FileStatus::New {
            debug!(file_id, "inline chunk before acceptance; dropped");
            return Ok(());
        }
        self.process_rcv_chunk(&meta, &mut transfer, chunk_no as i64, chunk, None)
            .await
    }

    /// One part of an XFTP descriptor; the complete flag triggers the
    /// agent download when the file was already accepted.
    pub(super) async fn rcv_file_descr_part(
        &self,
        user: &User,
        chat_ref: ChatRef,
        sender: Option<i64>,
        msg_id: SharedMsgId,
        part: FileDescrPart,
    ) -> Result<(), ChatError> {
        let item = ChatItem::load_by_shared_msg_id(
            self.pool(),
            user.user_id,
            chat_ref,
            sender,
            CIDirection::Rcv,
            &msg_id,
        )
        .await?;
        let file_id = item
            .file_id
            .ok_or_else(|| ChatError::Internal("descriptor for an item without file".into()))?;
        let meta = FileTransferMeta::load(self.pool(), file_id).await?;
        let mut transfer = RcvFileTransfer::load(self.pool(), file_id).await?;
        let complete = transfer
            .append_descr_part(self.pool(), part.part_no as i64, &part.text, part.complete)
            .await?;
        if complete.is_some() && transfer.file_status == FileStatus::Accepted {
            self.start_xftp_receive(&meta, &mut transfer).await?;
        }
        Ok(())
    }

    pub(super) async fn rcv_file_cancelled_by_sender(
        &self,
        user: &User,
        chat_ref: ChatRef,
        sender: Option<i64>,
        msg_id: SharedMsgId,
    ) -> Result<(), ChatError> {
        let item = ChatItem::load_by_shared_msg_id(
            self.pool(),
            user.user_id,
            chat_ref,
            sender,
            CIDirection::Rcv,
            &msg_id,
        )
        .await?;
        let Some(file_id) = item.file_id else {
            return Ok(());
        };
        let mut meta = FileTransferMeta::load(self.pool(), file_id).await?;
        let mut transfer = RcvFileTransfer::load(self.pool(), file_id).await?;
        if transfer.file_status.may_become(FileStatus::Cancelled) {
            self.cancel_rcv_file(&mut meta, &mut transfer).await?;
            self.emit(ChatResponse::RcvFileSndCancelled { file_id }).await;
        }
        Ok(())
    }

    // XFTP transfer events, tagged with the agent-side file id

    pub(super) async fn process_xftp_snd_event(
        &self,
        snd_file_id: i64,
        event: AgentEvent,
    ) -> Result<(), ChatError> {
        let Some(mut meta) =
            FileTransferMeta::load_by_agent_snd_file_id(self.pool(), snd_file_id).await?
        else {
            info!(snd_file_id, "upload event for unknown file");
            return Ok(());
        };
        match event {
            AgentEvent::SndFileProgress { sent, total } => {
                self.emit(ChatResponse::SndFileProgressXftp {
                    file_id: meta.file_id,
                    sent,
                    total,
                })
                .await;
                Ok(())
            }
            AgentEvent::SndFileDone { descriptors } => {
                if meta.cancelled {
                    debug!(file_id = meta.file_id, "upload finished after cancel");
                    return Ok(());
                }
                self.send_file_descriptions(&meta, descriptors).await
            }
            AgentEvent::SndFileError { error } => {
                warn!(file_id = meta.file_id, %error, "upload failed");
                self.cancel_snd_file(&mut meta).await?;
                Err(error.into())
            }
            other => {
                debug!(tag = other.tag(), "unexpected upload event");
                Ok(())
            }
        }
    }

    pub(super) async fn process_xftp_rcv_event(
        &self,
        rcv_file_id: i64,
        event: AgentEvent,
    ) -> Result<(), ChatError> {
        let Some(mut transfer) =
            RcvFileTransfer::load_by_agent_rcv_file_id(self.pool(), rcv_file_id).await?
        else {
            info!(rcv_file_id, "download event for unknown file");
            return Ok(());
        };
        let mut meta = FileTransferMeta::load(self.pool(), transfer.file_id).await?;
        match event {
            AgentEvent::RcvFileProgress { received, total } => {
                self.emit(ChatResponse::RcvFileProgressXftp {
                    file_id: meta.file_id,
                    received,
                    total,
                })
                .await;
                Ok(())
            }
            AgentEvent::RcvFileDone { staging_path } => {
                move_file(&staging_path, &meta.file_path).map_err(engine::FileError::Io)?;
                transfer
                    .update_status(self.pool(), FileStatus::Complete)
                    .await?;
                info!(file_id = meta.file_id, "file received via XFTP");
                self.emit(ChatResponse::RcvFileComplete {
                    file_id: meta.file_id,
                    target_path: meta.file_path.clone(),
                })
                .await;
                Ok(())
            }
            AgentEvent::RcvFileError { error } => {
                warn!(file_id = meta.file_id, %error, "download failed");
                self.cancel_rcv_file(&mut meta, &mut transfer).await?;
                Err(error.into())
            }
            other => {
                debug!(tag = other.tag(), "unexpected download event");
                Ok(())
            }
        }
    }
}

/// Renames the agent's staging file to its destination, copying across
/// filesystems when renaming is not possible.
fn move_file(from: &str, to: &str) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}
