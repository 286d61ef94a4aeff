// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File transfers.
//!
//! One metadata row per logical transfer; send transfers additionally keep a
//! row per recipient, receive transfers a single row with the invitation.
//! Completion is terminal; cancellation may precede completion but never
//! follow it.

use chrono::{DateTime, Utc};
use couriercommon::messages::{FileInvitation, InlineFileMode};

use crate::store::{ConnId, ContactId, FileId, GroupId, GroupMemberId, UserId};

pub mod engine;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display, strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileProtocol {
    Smp,
    Xftp,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display, strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileStatus {
    New,
    Accepted,
    Connected,
    Complete,
    Cancelled,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }

    /// Completion is terminal, cancellation never follows it.
    pub fn may_become(self, next: Self) -> bool {
        match self {
            Self::Complete => false,
            Self::Cancelled => next == Self::Cancelled,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferMeta {
    pub file_id: FileId,
    pub user_id: UserId,
    pub contact_id: Option<ContactId>,
    pub group_id: Option<GroupId>,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub chunk_size: i64,
    pub protocol: FileProtocol,
    pub file_inline: Option<InlineFileMode>,
    pub agent_snd_file_id: Option<i64>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl FileTransferMeta {
    pub fn chunk_count(&self) -> i64 {
        ((self.file_size as u64).div_ceil(self.chunk_size as u64)) as i64
    }
}

/// Per-recipient state of an outgoing transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SndFileTransfer {
    pub file_id: FileId,
    pub connection_id: ConnId,
    pub group_member_id: Option<GroupMemberId>,
    pub file_status: FileStatus,
    pub file_inline: Option<InlineFileMode>,
    pub file_descr: Option<String>,
    pub file_descr_part_no: i64,
    pub file_descr_complete: bool,
    pub created_at: DateTime<Utc>,
}

/// State of an incoming transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcvFileTransfer {
    pub file_id: FileId,
    pub file_status: FileStatus,
    pub file_conn_req: Option<String>,
    pub file_inline: Option<InlineFileMode>,
    pub file_digest: Option<String>,
    pub file_descr_text: Option<String>,
    pub file_descr_part_no: i64,
    pub file_descr_complete: bool,
    pub agent_rcv_file_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl RcvFileTransfer {
    pub fn invitation(&self, meta: &FileTransferMeta) -> FileInvitation {
        FileInvitation {
            file_name: meta.file_name.clone(),
            file_size: meta.file_size,
            file_digest: self.file_digest.clone(),
            file_conn_req: self
                .file_conn_req
                .clone()
                .map(couriercommon::identifiers::ConnReqUri),
            file_inline: self.file_inline,
            file_descr: None,
        }
    }
}

fn inline_to_str(inline: Option<InlineFileMode>) -> Option<&'static str> {
    inline.map(|mode| match mode {
        InlineFileMode::Offer => "offer",
        InlineFileMode::Sent => "sent",
    })
}

fn inline_from_str(raw: Option<String>) -> Option<InlineFileMode> {
    match raw.as_deref() {
        Some("offer") => Some(InlineFileMode::Offer),
        Some("sent") => Some(InlineFileMode::Sent),
        _ => None,
    }
}

mod persistence {
    use sqlx::{Row, SqliteExecutor, sqlite::SqliteRow};

    use crate::store::StoreError;

    use super::*;

    impl sqlx::FromRow<'_, SqliteRow> for FileTransferMeta {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            Ok(Self {
                file_id: row.try_get("file_id")?,
                user_id: row.try_get("user_id")?,
                contact_id: row.try_get("contact_id")?,
                group_id: row.try_get("group_id")?,
                file_name: row.try_get("file_name")?,
                file_path: row.try_get("file_path")?,
                file_size: row.try_get("file_size")?,
                chunk_size: row.try_get("chunk_size")?,
                protocol: row.try_get("protocol")?,
                file_inline: inline_from_str(row.try_get("file_inline")?),
                agent_snd_file_id: row.try_get("agent_snd_file_id")?,
                cancelled: row.try_get("cancelled")?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    impl sqlx::FromRow<'_, SqliteRow> for SndFileTransfer {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            Ok(Self {
                file_id: row.try_get("file_id")?,
                connection_id: row.try_get("connection_id")?,
                group_member_id: row.try_get("group_member_id")?,
                file_status: row.try_get("file_status")?,
                file_inline: inline_from_str(row.try_get("file_inline")?),
                file_descr: row.try_get("file_descr")?,
                file_descr_part_no: row.try_get("file_descr_part_no")?,
                file_descr_complete: row.try_get("file_descr_complete")?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    impl sqlx::FromRow<'_, SqliteRow> for RcvFileTransfer {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            Ok(Self {
                file_id: row.try_get("file_id")?,
                file_status: row.try_get("file_status")?,
                file_conn_req: row.try_get("file_conn_req")?,
                file_inline: inline_from_str(row.try_get("file_inline")?),
                file_digest: row.try_get("file_digest")?,
                file_descr_text: row.try_get("file_descr_text")?,
                file_descr_part_no: row.try_get("file_descr_part_no")?,
                file_descr_complete: row.try_get("file_descr_complete")?,
                agent_rcv_file_id: row.try_get("agent_rcv_file_id")?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    pub(crate) struct NewFileMeta<'a> {
        pub user_id: UserId,
        pub contact_id: Option<ContactId>,
        pub group_id: Option<GroupId>,
        pub file_name: &'a str,
        pub file_path: &'a str,
        pub file_size: i64,
        pub chunk_size: i64,
        pub protocol: FileProtocol,
        pub file_inline: Option<InlineFileMode>,
    }

    impl FileTransferMeta {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            new_file: NewFileMeta<'_>,
        ) -> Result<Self, StoreError> {
            Ok(sqlx::query_as::<_, FileTransferMeta>(
                "INSERT INTO files (
                    user_id, contact_id, group_id, file_name, file_path, file_size,
                    chunk_size, protocol, file_inline, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(new_file.user_id)
            .bind(new_file.contact_id)
            .bind(new_file.group_id)
            .bind(new_file.file_name)
            .bind(new_file.file_path)
            .bind(new_file.file_size)
            .bind(new_file.chunk_size)
            .bind(new_file.protocol)
            .bind(inline_to_str(new_file.file_inline))
            .bind(Utc::now())
            .fetch_one(executor)
            .await?)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            file_id: FileId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, FileTransferMeta>("SELECT * FROM files WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(executor)
                .await?
                .ok_or(StoreError::FileNotFound(file_id))
        }

        pub(crate) async fn load_by_agent_snd_file_id(
            executor: impl SqliteExecutor<'_>,
            agent_snd_file_id: i64,
        ) -> Result<Option<Self>, StoreError> {
            Ok(sqlx::query_as::<_, FileTransferMeta>(
                "SELECT * FROM files WHERE agent_snd_file_id = ?",
            )
            .bind(agent_snd_file_id)
            .fetch_optional(executor)
            .await?)
        }

        pub(crate) async fn set_agent_snd_file_id(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            agent_snd_file_id: i64,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE files SET agent_snd_file_id = ? WHERE file_id = ?")
                .bind(agent_snd_file_id)
                .bind(self.file_id)
                .execute(executor)
                .await?;
            self.agent_snd_file_id = Some(agent_snd_file_id);
            Ok(())
        }

        pub(crate) async fn set_cancelled(
            &mut self,
            executor: impl SqliteExecutor<'_>,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE files SET cancelled = 1 WHERE file_id = ?")
                .bind(self.file_id)
                .execute(executor)
                .await?;
            self.cancelled = true;
            Ok(())
        }

        pub(crate) async fn set_file_path(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            file_path: &str,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE files SET file_path = ? WHERE file_id = ?")
                .bind(file_path)
                .bind(self.file_id)
                .execute(executor)
                .await?;
            self.file_path = file_path.to_owned();
            Ok(())
        }
    }

    impl SndFileTransfer {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            file_id: FileId,
            connection_id: ConnId,
            group_member_id: Option<GroupMemberId>,
            file_status: FileStatus,
            file_inline: Option<InlineFileMode>,
        ) -> Result<Self, StoreError> {
            Ok(sqlx::query_as::<_, SndFileTransfer>(
                "INSERT INTO snd_file_transfers (
                    file_id, connection_id, group_member_id, file_status, file_inline,
                    created_at
                )
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(file_id)
            .bind(connection_id)
            .bind(group_member_id)
            .bind(file_status)
            .bind(inline_to_str(file_inline))
            .bind(Utc::now())
            .fetch_one(executor)
            .await?)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            file_id: FileId,
            connection_id: ConnId,
        ) -> Result<Option<Self>, StoreError> {
            Ok(sqlx::query_as::<_, SndFileTransfer>(
                "SELECT * FROM snd_file_transfers WHERE file_id = ? AND connection_id = ?",
            )
            .bind(file_id)
            .bind(connection_id)
            .fetch_optional(executor)
            .await?)
        }

        pub(crate) async fn load_for_file(
            executor: impl SqliteExecutor<'_>,
            file_id: FileId,
        ) -> Result<Vec<Self>, StoreError> {
            Ok(sqlx::query_as::<_, SndFileTransfer>(
                "SELECT * FROM snd_file_transfers WHERE file_id = ? ORDER BY connection_id",
            )
            .bind(file_id)
            .fetch_all(executor)
            .await?)
        }

        /// Updates the status honoring terminal-state rules; returns whether
        /// the row changed.
        pub(crate) async fn update_status(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            file_status: FileStatus,
        ) -> Result<bool, StoreError> {
            if !self.file_status.may_become(file_status) {
                return Ok(false);
            }
            sqlx::query(
                "UPDATE snd_file_transfers SET file_status = ?
                WHERE file_id = ? AND connection_id = ?",
            )
            .bind(file_status)
            .bind(self.file_id)
            .bind(self.connection_id)
            .execute(executor)
            .await?;
            self.file_status = file_status;
            Ok(true)
        }

        pub(crate) async fn set_descr(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            file_descr: &str,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "UPDATE snd_file_transfers SET file_descr = ?
                WHERE file_id = ? AND connection_id = ?",
            )
            .bind(file_descr)
            .bind(self.file_id)
            .bind(self.connection_id)
            .execute(executor)
            .await?;
            self.file_descr = Some(file_descr.to_owned());
            Ok(())
        }

        pub(crate) async fn set_descr_progress(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            part_no: i64,
            complete: bool,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "UPDATE snd_file_transfers
                SET file_descr_part_no = ?, file_descr_complete = ?
                WHERE file_id = ? AND connection_id = ?",
            )
            .bind(part_no)
            .bind(complete)
            .bind(self.file_id)
            .bind(self.connection_id)
            .execute(executor)
            .await?;
            self.file_descr_part_no = part_no;
            self.file_descr_complete = complete;
            Ok(())
        }
    }

    pub(crate) struct NewRcvFile<'a> {
        pub file_conn_req: Option<&'a str>,
        pub file_inline: Option<InlineFileMode>,
        pub file_digest: Option<&'a str>,
    }

    impl RcvFileTransfer {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            file_id: FileId,
            new_rcv: NewRcvFile<'_>,
        ) -> Result<Self, StoreError> {
            Ok(sqlx::query_as::<_, RcvFileTransfer>(
                "INSERT INTO rcv_file_transfers (
                    file_id, file_status, file_conn_req, file_inline, file_digest,
                    created_at
                )
                VALUES (?, 'new', ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(file_id)
            .bind(new_rcv.file_conn_req)
            .bind(inline_to_str(new_rcv.file_inline))
            .bind(new_rcv.file_digest)
            .bind(Utc::now())
            .fetch_one(executor)
            .await?)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            file_id: FileId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, RcvFileTransfer>(
                "SELECT * FROM rcv_file_transfers WHERE file_id = ?",
            )
            .bind(file_id)
            .fetch_optional(executor)
            .await?
            .ok_or(StoreError::FileNotFound(file_id))
        }

        pub(crate) async fn load_by_agent_rcv_file_id(
            executor: impl SqliteExecutor<'_>,
            agent_rcv_file_id: i64,
        ) -> Result<Option<Self>, StoreError> {
            Ok(sqlx::query_as::<_, RcvFileTransfer>(
                "SELECT * FROM rcv_file_transfers WHERE agent_rcv_file_id = ?",
            )
            .bind(agent_rcv_file_id)
            .fetch_optional(executor)
            .await?)
        }

        pub(crate) async fn update_status(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            file_status: FileStatus,
        ) -> Result<bool, StoreError> {
            if !self.file_status.may_become(file_status) {
                return Ok(false);
            }
            sqlx::query("UPDATE rcv_file_transfers SET file_status = ? WHERE file_id = ?")
                .bind(file_status)
                .bind(self.file_id)
                .execute(executor)
                .await?;
            self.file_status = file_status;
            Ok(true)
        }

        pub(crate) async fn set_agent_rcv_file_id(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            agent_rcv_file_id: i64,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE rcv_file_transfers SET agent_rcv_file_id = ? WHERE file_id = ?")
                .bind(agent_rcv_file_id)
                .bind(self.file_id)
                .execute(executor)
                .await?;
            self.agent_rcv_file_id = Some(agent_rcv_file_id);
            Ok(())
        }

        /// Appends one descriptor part, enforcing part order.
        ///
        /// Returns the full descriptor text once the complete part arrived.
        pub(crate) async fn append_descr_part(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            part_no: i64,
            text: &str,
            complete: bool,
        ) -> Result<Option<String>, StoreError> {
            if part_no != self.file_descr_part_no {
                return Err(StoreError::Internal(format!(
                    "descriptor part out of order: expected {}, got {part_no}",
                    self.file_descr_part_no
                )));
            }
            let mut descr = self.file_descr_text.clone().unwrap_or_default();
            descr.push_str(text);
            sqlx::query(
                "UPDATE rcv_file_transfers
                SET file_descr_text = ?, file_descr_part_no = ?, file_descr_complete = ?
                WHERE file_id = ?",
            )
            .bind(&descr)
            .bind(part_no + 1)
            .bind(complete)
            .bind(self.file_id)
            .execute(executor)
            .await?;
            self.file_descr_text = Some(descr.clone());
            self.file_descr_part_no = part_no + 1;
            self.file_descr_complete = complete;
            Ok(complete.then_some(descr))
        }
    }

    pub(crate) struct RcvFileChunk;

    impl RcvFileChunk {
        /// Records a received chunk number. Returns the number of chunks
        /// received so far including this one.
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            file_id: FileId,
            chunk_no: i64,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "INSERT INTO rcv_file_chunks (file_id, chunk_no, created_at)
                VALUES (?, ?, ?)",
            )
            .bind(file_id)
            .bind(chunk_no)
            .bind(Utc::now())
            .execute(executor)
            .await?;
            Ok(())
        }

        pub(crate) async fn count(
            executor: impl SqliteExecutor<'_>,
            file_id: FileId,
        ) -> Result<i64, StoreError> {
            Ok(
                sqlx::query_scalar("SELECT count(*) FROM rcv_file_chunks WHERE file_id = ?")
                    .bind(file_id)
                    .fetch_one(executor)
                    .await?,
            )
        }

        pub(crate) async fn delete_for_file(
            executor: impl SqliteExecutor<'_>,
            file_id: FileId,
        ) -> Result<(), StoreError> {
            sqlx::query("DELETE FROM rcv_file_chunks WHERE file_id = ?")
                .bind(file_id)
                .execute(executor)
                .await?;
            Ok(())
        }
    }
}

pub(crate) use persistence::{NewFileMeta, NewRcvFile, RcvFileChunk};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use FileStatus::*;
        assert!(New.may_become(Accepted));
        assert!(Accepted.may_become(Connected));
        assert!(Connected.may_become(Complete));
        assert!(Connected.may_become(Cancelled));

        // completion is terminal
        assert!(!Complete.may_become(Cancelled));
        assert!(!Complete.may_become(New));
        // cancellation never becomes completion
        assert!(!Cancelled.may_become(Complete));
    }

    #[test]
    fn chunk_count_rounds_up() {
        let meta = FileTransferMeta {
            file_id: 1,
            user_id: 1,
            contact_id: None,
            group_id: None,
            file_name: "f".into(),
            file_path: "f".into(),
            file_size: 40_000,
            chunk_size: 15_780,
            protocol: FileProtocol::Smp,
            file_inline: None,
            agent_snd_file_id: None,
            cancelled: false,
            created_at: Utc::now(),
        };
        assert_eq!(meta.chunk_count(), 3);
    }
}
