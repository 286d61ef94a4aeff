// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File commands and the send-side orchestration of the file engine.

use std::path::{Path, PathBuf};

use courieragentclient::AgentApi;
use couriercommon::{
    identifiers::SharedMsgId,
    messages::{ChatMessage, ChatMsgEvent, FileInvitation, InlineFileMode, MsgContent},
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    chats::{ChatItem, ChatRef},
    commands::ComposedMessage,
    connections::{ConnStatus, ConnType, Connection, NewConnection},
    contacts::Contact,
    error::{ChatError, CommandError},
    events::ChatResponse,
    files::{
        FileProtocol, FileStatus, FileTransferMeta, NewFileMeta, RcvFileChunk, RcvFileTransfer,
        SndFileTransfer,
        engine::{self, unique_target_path},
    },
    store::{FileId, StoreError},
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    /// Registers an outgoing file and produces its invitation.
    ///
    /// Inline-eligible files go over SMP; everything else is handed to the
    /// agent as an XFTP upload.
    pub(crate) async fn prepare_snd_file(
        &self,
        chat_ref: ChatRef,
        path: &Path,
        recipients: i64,
        is_voice: bool,
        direct_connection: Option<&Connection>,
    ) -> Result<(FileId, FileInvitation), ChatError> {
        let user = self.current_user()?;
        let metadata = std::fs::metadata(path).map_err(engine::FileError::Io)?;
        let file_size = metadata.len() as i64;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        let chunk_size = self.config().file_chunk_size;
        let chunks = ((file_size as u64).div_ceil(chunk_size.max(1) as u64)) as i64;
        let inline = self
            .config()
            .inline_files
            .snd_mode(chunks, recipients, is_voice);
        let protocol = if inline.is_some() {
            FileProtocol::Smp
        } else {
            FileProtocol::Xftp
        };

        let (contact_id, group_id) = match chat_ref {
            ChatRef::Direct(contact_id) => (Some(contact_id), None),
            ChatRef::Group(group_id) => (None, Some(group_id)),
            ChatRef::ContactConnection(_) => {
                return Err(CommandError::InvalidChatRef.into());
            }
        };
        let mut meta = FileTransferMeta::store(
            self.pool(),
            NewFileMeta {
                user_id: user.user_id,
                contact_id,
                group_id,
                file_name: &file_name,
                file_path: &path.display().to_string(),
                file_size,
                chunk_size,
                protocol,
                file_inline: inline,
            },
        )
        .await?;

        match protocol {
            FileProtocol::Smp => {
                if let Some(connection) = direct_connection {
                    SndFileTransfer::store(
                        self.pool(),
                        meta.file_id,
                        connection.conn_id,
                        None,
                        FileStatus::New,
                        inline,
                    )
                    .await?;
                }
            }
            FileProtocol::Xftp => {
                let snd_file_id = self
                    .agent()
                    .xftp_send_file(user.agent_user_id, path, recipients as usize)
                    .await?;
                meta.set_agent_snd_file_id(self.pool(), snd_file_id).await?;
            }
        }

        let digest = hex::encode(Sha256::digest(std::fs::read(path).map_err(engine::FileError::Io)?));
        let invitation = FileInvitation {
            file_name,
            file_size,
            file_digest: Some(digest),
            file_conn_req: None,
            file_inline: inline,
            file_descr: None,
        };
        Ok((meta.file_id, invitation))
    }

    /// Streams every chunk of a pre-accepted inline file on the messaging
    /// connection and completes the transfer.
    pub(crate) async fn maybe_stream_inline_file(
        &self,
        file_id: FileId,
        connection: &Connection,
    ) -> Result<(), ChatError> {
        let meta = FileTransferMeta::load(self.pool(), file_id).await?;
        if meta.file_inline != Some(InlineFileMode::Sent) {
            return Ok(());
        }
        self.stream_inline_file(&meta, connection).await
    }

    pub(crate) async fn stream_inline_file(
        &self,
        meta: &FileTransferMeta,
        connection: &Connection,
    ) -> Result<(), ChatError> {
        self.stream_snd_file(meta, connection, true).await
    }

    /// Streams every chunk of a file; `inline` selects the frame flavour
    /// (messaging connection vs dedicated transfer connection).
    pub(crate) async fn stream_snd_file(
        &self,
        meta: &FileTransferMeta,
        connection: &Connection,
        inline: bool,
    ) -> Result<(), ChatError> {
        let item = ChatItem::load_by_file_id(self.pool(), meta.file_id).await?;
        let shared_msg_id = item.and_then(|item| item.shared_msg_id).ok_or_else(|| {
            ChatError::Internal("inline file without an anchoring chat item".into())
        })?;
        self.emit(ChatResponse::SndFileStart {
            file_id: meta.file_id,
        })
        .await;
        for chunk_no in 1..=meta.chunk_count() {
            let chunk = engine::read_chunk(&self.inner().snd_file_handles, meta, chunk_no)?;
            let frame = ChatMessage::new(
                Some(shared_msg_id),
                ChatMsgEvent::FileChunk {
                    chunk_no: chunk_no as u32,
                    chunk,
                },
            )
            .encode(inline)?;
            self.agent()
                .send_message(
                    &connection.agent_conn_id,
                    courieragentclient::MsgFlags { notification: false },
                    frame,
                )
                .await?;
        }
        self.inner().snd_file_handles.close(meta.file_id);
        if let Some(mut transfer) =
            SndFileTransfer::load(self.pool(), meta.file_id, connection.conn_id).await?
        {
            transfer
                .update_status(self.pool(), FileStatus::Complete)
                .await?;
        }
        self.emit(ChatResponse::SndFileComplete {
            file_id: meta.file_id,
        })
        .await;
        Ok(())
    }

    pub(super) async fn api_receive_file(
        &self,
        file_id: FileId,
        path: Option<PathBuf>,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        let mut meta = FileTransferMeta::load(self.pool(), file_id).await?;
        let mut transfer = RcvFileTransfer::load(self.pool(), file_id).await?;
        if transfer.file_status != FileStatus::New {
            return Err(CommandError::FileAlreadyReceiving.into());
        }

        // pick and reserve the destination path
        let target = match path {
            Some(path) => {
                if path.exists() {
                    return Err(CommandError::FileAlreadyExists(path).into());
                }
                path
            }
            None => match self.files_folder() {
                Some(folder) => unique_target_path(&folder, &meta.file_name),
                None => PathBuf::from(&meta.file_name),
            },
        };
        meta.set_file_path(self.pool(), &target.display().to_string())
            .await?;

        match (&transfer.file_conn_req, transfer.file_descr_complete) {
            // inline offer: accept over the existing messaging connection
            (None, false) if transfer.file_inline.is_some() => {
                let item = ChatItem::load_by_file_id(self.pool(), file_id)
                    .await?
                    .ok_or(StoreError::FileNotFound(file_id))?;
                let shared_msg_id = item.shared_msg_id.ok_or_else(|| {
                    ChatError::Internal("file item has no shared message id".into())
                })?;
                let contact =
                    Contact::load(self.pool(), meta.contact_id.ok_or_else(|| {
                        ChatError::Internal("inline file without contact".into())
                    })?)
                    .await?;
                let connection = self.usable_contact_connection(&contact).await?;
                let event = ChatMsgEvent::FileAcptInv {
                    msg_id: shared_msg_id,
                    file_conn_req: None,
                    file_name: meta.file_name.clone(),
                };
                let (message, body) = self
                    .create_snd_message(user.user_id, |_| event)
                    .await?;
                self.deliver_message(&connection, &message, body).await?;
                transfer
                    .update_status(self.pool(), FileStatus::Accepted)
                    .await?;
                Ok(ChatResponse::RcvFileAccepted(item))
            }
            // separate SMP connection offered by the sender
            (Some(conn_req), _) => {
                let conn_info = ChatMessage::new(
                    None,
                    ChatMsgEvent::FileAcpt {
                        file_name: meta.file_name.clone(),
                    },
                )
                .encode(false)?;
                let agent_conn_id = self
                    .agent()
                    .join_connection(
                        user.agent_user_id,
                        true,
                        &couriercommon::identifiers::ConnReqUri(conn_req.clone()),
                        conn_info,
                    )
                    .await?;
                Connection::store(
                    self.pool(),
                    user.user_id,
                    &agent_conn_id,
                    ConnStatus::Joined,
                    ConnType::RcvFile,
                    NewConnection {
                        rcv_file_id: Some(file_id),
                        ..Default::default()
                    },
                )
                .await?;
                transfer
                    .update_status(self.pool(), FileStatus::Accepted)
                    .await?;
                let item = ChatItem::load_by_file_id(self.pool(), file_id)
                    .await?
                    .ok_or(StoreError::FileNotFound(file_id))?;
                Ok(ChatResponse::RcvFileAccepted(item))
            }
            // XFTP: the descriptor may still be arriving
            (None, descr_complete) => {
                transfer
                    .update_status(self.pool(), FileStatus::Accepted)
                    .await?;
                if descr_complete {
                    self.start_xftp_receive(&meta, &mut transfer).await?;
                }
                let item = ChatItem::load_by_file_id(self.pool(), file_id)
                    .await?
                    .ok_or(StoreError::FileNotFound(file_id))?;
                Ok(ChatResponse::RcvFileAccepted(item))
            }
        }
    }

    /// Hands a fully assembled descriptor to the agent.
    pub(crate) async fn start_xftp_receive(
        &self,
        meta: &FileTransferMeta,
        transfer: &mut RcvFileTransfer,
    ) -> Result<(), ChatError> {
        let user = self.current_user()?;
        let descriptor = transfer
            .file_descr_text
            .clone()
            .ok_or_else(|| ChatError::Internal("descriptor text missing".into()))?;
        let rcv_file_id = self
            .agent()
            .xftp_receive_file(user.agent_user_id, &descriptor)
            .await?;
        transfer
            .set_agent_rcv_file_id(self.pool(), rcv_file_id)
            .await?;
        self.emit(ChatResponse::RcvFileStart {
            file_id: meta.file_id,
        })
        .await;
        Ok(())
    }

    pub(super) async fn api_cancel_file(
        &self,
        file_id: FileId,
    ) -> Result<ChatResponse, ChatError> {
        let mut meta = FileTransferMeta::load(self.pool(), file_id).await?;
        let rcv_transfer = RcvFileTransfer::load(self.pool(), file_id).await.ok();
        match rcv_transfer {
            Some(mut transfer) => {
                if !transfer.file_status.may_become(FileStatus::Cancelled) {
                    return Err(CommandError::FileCancel.into());
                }
                self.cancel_rcv_file(&mut meta, &mut transfer).await?;
                Ok(ChatResponse::RcvFileCancelled { file_id })
            }
            None => {
                if meta.cancelled {
                    return Err(CommandError::FileCancel.into());
                }
                self.cancel_snd_file(&mut meta).await?;
                Ok(ChatResponse::SndFileCancelled { file_id })
            }
        }
    }

    pub(crate) async fn cancel_snd_file(
        &self,
        meta: &mut FileTransferMeta,
    ) -> Result<(), ChatError> {
        meta.set_cancelled(self.pool()).await?;
        self.inner().snd_file_handles.close(meta.file_id);

        let transfers = SndFileTransfer::load_for_file(self.pool(), meta.file_id).await?;
        for mut transfer in transfers {
            if transfer.file_status.is_terminal() {
                continue;
            }
            let connection = Connection::load(self.pool(), transfer.connection_id).await.ok();
            if let Some(connection) = connection {
                match connection.conn_type {
                    ConnType::SndFile => {
                        // the dedicated transfer connection dies with the file
                        let corr_id = self
                            .reserve_corr_id(
                                Some(meta.user_id),
                                Some(connection.conn_id),
                                "delete_conn",
                            )
                            .await?;
                        if let Err(error) = self
                            .agent()
                            .delete_connection(corr_id, &connection.agent_conn_id)
                            .await
                        {
                            warn!(%error, "failed to delete file connection");
                        }
                    }
                    _ if transfer.file_inline.is_some() => {
                        let cancel =
                            ChatMessage::new(None, ChatMsgEvent::FileChunkCancel).encode(true)?;
                        if let Err(error) = self
                            .agent()
                            .send_message(
                                &connection.agent_conn_id,
                                courieragentclient::MsgFlags { notification: false },
                                cancel,
                            )
                            .await
                        {
                            warn!(%error, "failed to send inline cancel");
                        }
                    }
                    _ => {}
                }
            }
            transfer
                .update_status(self.pool(), FileStatus::Cancelled)
                .await?;
        }

        if meta.protocol == FileProtocol::Xftp
            && let Some(snd_file_id) = meta.agent_snd_file_id
        {
            if let Err(error) = self.agent().xftp_delete_snd_file(snd_file_id).await {
                warn!(%error, "failed to delete XFTP upload");
            }
        }
        Ok(())
    }

    pub(crate) async fn cancel_rcv_file(
        &self,
        meta: &mut FileTransferMeta,
        transfer: &mut RcvFileTransfer,
    ) -> Result<(), ChatError> {
        meta.set_cancelled(self.pool()).await?;
        self.inner().rcv_file_handles.close(meta.file_id);
        RcvFileChunk::delete_for_file(self.pool(), meta.file_id).await?;
        transfer
            .update_status(self.pool(), FileStatus::Cancelled)
            .await?;

        // a dedicated receive connection is deleted asynchronously
        let connections: Vec<Connection> = sqlx::query_as(
            "SELECT * FROM connections WHERE rcv_file_id = ? AND conn_status != 'deleted'",
        )
        .bind(meta.file_id)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::from)?;
        for mut connection in connections {
            connection
                .update_status(self.pool(), ConnStatus::Deleted)
                .await?;
            let corr_id = self
                .reserve_corr_id(Some(meta.user_id), Some(connection.conn_id), "delete_conn")
                .await?;
            if let Err(error) = self
                .agent()
                .delete_connection(corr_id, &connection.agent_conn_id)
                .await
            {
                warn!(%error, "failed to delete receive connection");
            }
        }

        if let Some(rcv_file_id) = transfer.agent_rcv_file_id {
            if let Err(error) = self.agent().xftp_delete_rcv_file(rcv_file_id).await {
                warn!(%error, "failed to delete XFTP download");
            }
        }
        debug!(file_id = meta.file_id, "cancelled file receive");
        Ok(())
    }

    pub(super) async fn api_file_status(
        &self,
        file_id: FileId,
    ) -> Result<ChatResponse, ChatError> {
        let meta = FileTransferMeta::load(self.pool(), file_id).await?;
        let snd_transfers = SndFileTransfer::load_for_file(self.pool(), file_id).await?;
        let rcv_transfer = RcvFileTransfer::load(self.pool(), file_id).await.ok();
        Ok(ChatResponse::FileTransferStatus {
            meta,
            snd_transfers,
            rcv_transfer,
        })
    }

    pub(super) async fn api_send_file(
        &self,
        chat_ref: ChatRef,
        path: PathBuf,
    ) -> Result<ChatResponse, ChatError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.api_send_message(
            chat_ref,
            false,
            None,
            ComposedMessage {
                msg_content: MsgContent::File(file_name),
                file_path: Some(path),
                quoted_item_id: None,
            },
        )
        .await
    }

    pub(super) async fn api_forward_file(
        &self,
        chat_ref: ChatRef,
        file_id: FileId,
    ) -> Result<ChatResponse, ChatError> {
        let meta = FileTransferMeta::load(self.pool(), file_id).await?;
        self.api_send_file(chat_ref, PathBuf::from(meta.file_path))
            .await
    }

    /// Transmits recipient descriptors produced by `SFDONE`, one
    /// `x.msg.file.descr` per part, and completes each transfer on full
    /// delivery.
    pub(crate) async fn send_file_descriptions(
        &self,
        meta: &FileTransferMeta,
        descriptors: Vec<String>,
    ) -> Result<(), ChatError> {
        let user = self.current_user()?;
        let item = ChatItem::load_by_file_id(self.pool(), meta.file_id).await?;
        let shared_msg_id: SharedMsgId = item
            .and_then(|item| item.shared_msg_id)
            .ok_or_else(|| ChatError::Internal("file item has no shared message id".into()))?;

        // recipient transfers pair 1:1 with the returned descriptors
        let transfers = self.xftp_recipient_transfers(meta).await?;
        let mut all_complete = true;
        for (mut transfer, descriptor) in transfers.into_iter().zip(descriptors) {
            transfer.set_descr(self.pool(), &descriptor).await?;
            let connection = Connection::load(self.pool(), transfer.connection_id).await?;
            let parts = engine::split_descr(&descriptor, self.config().xftp_descr_part_size);
            let mut delivered = true;
            for part in parts {
                let part_no = part.part_no as i64;
                let complete = part.complete;
                let event = ChatMsgEvent::MsgFileDescr {
                    msg_id: shared_msg_id,
                    file_descr: part,
                };
                let (message, body) = self.create_snd_message(user.user_id, |_| event).await?;
                if let Err(error) = self.deliver_message(&connection, &message, body).await {
                    warn!(connection_id = connection.conn_id, %error, "descriptor part delivery failed");
                    delivered = false;
                    break;
                }
                transfer
                    .set_descr_progress(self.pool(), part_no + 1, complete)
                    .await?;
            }
            if delivered {
                transfer
                    .update_status(self.pool(), FileStatus::Complete)
                    .await?;
            } else {
                all_complete = false;
            }
        }
        if all_complete {
            self.emit(ChatResponse::SndFileCompleteXftp {
                file_id: meta.file_id,
            })
            .await;
        }
        Ok(())
    }

    /// Send transfers for an XFTP file, created on demand against the
    /// recipients' messaging connections.
    async fn xftp_recipient_transfers(
        &self,
        meta: &FileTransferMeta,
    ) -> Result<Vec<SndFileTransfer>, ChatError> {
        let existing = SndFileTransfer::load_for_file(self.pool(), meta.file_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        let mut transfers = Vec::new();
        if let Some(contact_id) = meta.contact_id {
            let contact = Contact::load(self.pool(), contact_id).await?;
            let connection = self.usable_contact_connection(&contact).await?;
            transfers.push(
                SndFileTransfer::store(
                    self.pool(),
                    meta.file_id,
                    connection.conn_id,
                    None,
                    FileStatus::Connected,
                    None,
                )
                .await?,
            );
        } else if let Some(group_id) = meta.group_id {
            let members =
                crate::groups::GroupMember::load_remote_members(self.pool(), group_id).await?;
            for member in members {
                if !member.member_status.is_current() {
                    continue;
                }
                let Some(connection) =
                    Connection::load_for_group_member(self.pool(), member.group_member_id)
                        .await?
                else {
                    continue;
                };
                if !connection.conn_status.snd_usable() {
                    continue;
                }
                transfers.push(
                    SndFileTransfer::store(
                        self.pool(),
                        meta.file_id,
                        connection.conn_id,
                        Some(member.group_member_id),
                        FileStatus::Connected,
                        None,
                    )
                    .await?,
                );
            }
        }
        Ok(transfers)
    }
}
