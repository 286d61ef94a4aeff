// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message envelope rows, decoupled from chat items.
//!
//! A message row keeps the encoded wire body; deliveries tie a message to a
//! connection and the agent's message id. At most one delivery exists per
//! `(connection, agent message id)` pair, which makes re-delivered messages
//! detectable.

use chrono::{DateTime, Utc};
use couriercommon::identifiers::SharedMsgId;

use crate::store::{ConnId, GroupMemberId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Message {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub msg_sent: bool,
    pub event_tag: String,
    pub msg_body: Vec<u8>,
    pub shared_msg_id: Option<SharedMsgId>,
    pub created_at: DateTime<Utc>,
}

/// A message queued for a group member whose connection is not usable yet.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingGroupMessage {
    pub pending_group_message_id: i64,
    pub group_member_id: GroupMemberId,
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
}

mod persistence {
    use sqlx::SqliteExecutor;

    use crate::store::StoreError;

    use super::*;

    impl Message {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            sent: bool,
            event_tag: &str,
            msg_body: &[u8],
            shared_msg_id: Option<SharedMsgId>,
        ) -> Result<Self, StoreError> {
            Ok(sqlx::query_as::<_, Message>(
                "INSERT INTO messages (
                    user_id, msg_sent, event_tag, msg_body, shared_msg_id, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(user_id)
            .bind(sent)
            .bind(event_tag)
            .bind(msg_body)
            .bind(shared_msg_id)
            .bind(Utc::now())
            .fetch_one(executor)
            .await?)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            message_id: MessageId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE message_id = ?")
                .bind(message_id)
                .fetch_optional(executor)
                .await?
                .ok_or(StoreError::Internal(format!(
                    "message {message_id} not found"
                )))
        }
    }

    pub(crate) struct MsgDelivery;

    impl MsgDelivery {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            message_id: MessageId,
            connection_id: ConnId,
            agent_msg_id: i64,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "INSERT OR IGNORE INTO msg_deliveries (
                    message_id, connection_id, agent_msg_id, created_at
                )
                VALUES (?, ?, ?, ?)",
            )
            .bind(message_id)
            .bind(connection_id)
            .bind(agent_msg_id)
            .bind(Utc::now())
            .execute(executor)
            .await?;
            Ok(())
        }

        /// Whether this agent message id was recorded on the connection
        /// before; used to suppress re-delivered messages.
        pub(crate) async fn exists(
            executor: impl SqliteExecutor<'_>,
            connection_id: ConnId,
            agent_msg_id: i64,
        ) -> Result<bool, StoreError> {
            let count: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM msg_deliveries
                WHERE connection_id = ? AND agent_msg_id = ?",
            )
            .bind(connection_id)
            .bind(agent_msg_id)
            .fetch_one(executor)
            .await?;
            Ok(count > 0)
        }
    }

    impl PendingGroupMessage {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            group_member_id: GroupMemberId,
            message_id: MessageId,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "INSERT INTO pending_group_messages (
                    group_member_id, message_id, created_at
                )
                VALUES (?, ?, ?)",
            )
            .bind(group_member_id)
            .bind(message_id)
            .bind(Utc::now())
            .execute(executor)
            .await?;
            Ok(())
        }

        /// Pending messages for a member, in insertion order.
        pub(crate) async fn load_for_member(
            executor: impl SqliteExecutor<'_>,
            group_member_id: GroupMemberId,
        ) -> Result<Vec<Self>, StoreError> {
            Ok(sqlx::query_as::<_, PendingGroupMessage>(
                "SELECT * FROM pending_group_messages
                WHERE group_member_id = ?
                ORDER BY pending_group_message_id",
            )
            .bind(group_member_id)
            .fetch_all(executor)
            .await?)
        }

        pub(crate) async fn delete(
            executor: impl SqliteExecutor<'_>,
            pending_group_message_id: i64,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "DELETE FROM pending_group_messages WHERE pending_group_message_id = ?",
            )
            .bind(pending_group_message_id)
            .execute(executor)
            .await?;
            Ok(())
        }
    }
}

pub(crate) use persistence::MsgDelivery;

#[cfg(test)]
mod tests {
    use couriercommon::profile::Profile;
    use sqlx::SqlitePool;

    use crate::users::User;

    use super::*;

    #[sqlx::test]
    async fn delivery_is_idempotent_per_agent_msg_id(pool: SqlitePool) {
        let user = User::store(&pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let message = Message::store(&pool, user.user_id, false, "x.msg.new", b"{}", None)
            .await
            .unwrap();

        assert!(!MsgDelivery::exists(&pool, 1, 100).await.unwrap());
        MsgDelivery::store(&pool, message.message_id, 1, 100)
            .await
            .unwrap();
        assert!(MsgDelivery::exists(&pool, 1, 100).await.unwrap());

        // second insert of the same pair is a no-op
        MsgDelivery::store(&pool, message.message_id, 1, 100)
            .await
            .unwrap();
    }

    #[sqlx::test]
    async fn pending_messages_flush_in_insertion_order(pool: SqlitePool) {
        let user = User::store(&pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let first = Message::store(&pool, user.user_id, true, "x.msg.new", b"1", None)
            .await
            .unwrap();
        let second = Message::store(&pool, user.user_id, true, "x.msg.new", b"2", None)
            .await
            .unwrap();

        PendingGroupMessage::store(&pool, 7, first.message_id)
            .await
            .unwrap();
        PendingGroupMessage::store(&pool, 7, second.message_id)
            .await
            .unwrap();

        let pending = PendingGroupMessage::load_for_member(&pool, 7).await.unwrap();
        assert_eq!(
            pending.iter().map(|p| p.message_id).collect::<Vec<_>>(),
            [first.message_id, second.message_id]
        );
    }
}
