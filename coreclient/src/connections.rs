// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Connections: the unit of addressing with the agent.
//!
//! Exactly one entity kind references a given connection. A connection's
//! life ends only via the `Deleted` status followed by the agent's
//! asynchronous deletion event.

use chrono::{DateTime, Utc};
use couriercommon::identifiers::{AgentConnId, GroupLinkId};

use crate::store::{ConnId, ContactId, FileId, GroupMemberId, UserId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display, strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnStatus {
    New,
    Joined,
    Requested,
    Accepted,
    SndReady,
    Ready,
    Deleted,
}

impl ConnStatus {
    /// Whether the sending half of the connection is usable.
    pub fn snd_usable(self) -> bool {
        matches!(self, Self::SndReady | Self::Ready)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display, strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnType {
    ContactDirect,
    GroupMember,
    SndFile,
    RcvFile,
    UserContact,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Connection {
    #[sqlx(rename = "connection_id")]
    pub conn_id: ConnId,
    pub user_id: UserId,
    pub agent_conn_id: AgentConnId,
    pub conn_status: ConnStatus,
    pub conn_type: ConnType,
    pub contact_id: Option<ContactId>,
    pub group_member_id: Option<GroupMemberId>,
    pub snd_file_id: Option<FileId>,
    pub rcv_file_id: Option<FileId>,
    pub user_contact_link_id: Option<i64>,
    pub custom_user_profile_id: Option<i64>,
    pub group_link_id: Option<GroupLinkId>,
    pub auth_err_counter: i64,
    pub conn_code: Option<String>,
    pub enable_ntfs: bool,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn incognito(&self) -> bool {
        self.custom_user_profile_id.is_some()
    }

    pub fn verified(&self) -> bool {
        self.conn_code.is_some()
    }
}

/// Entity binding of a freshly created connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewConnection {
    pub contact_id: Option<ContactId>,
    pub group_member_id: Option<GroupMemberId>,
    pub snd_file_id: Option<FileId>,
    pub rcv_file_id: Option<FileId>,
    pub user_contact_link_id: Option<i64>,
    pub custom_user_profile_id: Option<i64>,
    pub group_link_id: Option<GroupLinkId>,
}

mod persistence {
    use sqlx::SqliteExecutor;

    use crate::store::StoreError;

    use super::*;

    impl Connection {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            agent_conn_id: &AgentConnId,
            conn_status: ConnStatus,
            conn_type: ConnType,
            links: NewConnection,
        ) -> Result<Self, StoreError> {
            let now = Utc::now();
            Ok(sqlx::query_as::<_, Connection>(
                "INSERT INTO connections (
                    user_id, agent_conn_id, conn_status, conn_type,
                    contact_id, group_member_id, snd_file_id, rcv_file_id,
                    user_contact_link_id, custom_user_profile_id, group_link_id,
                    created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(user_id)
            .bind(agent_conn_id)
            .bind(conn_status)
            .bind(conn_type)
            .bind(links.contact_id)
            .bind(links.group_member_id)
            .bind(links.snd_file_id)
            .bind(links.rcv_file_id)
            .bind(links.user_contact_link_id)
            .bind(links.custom_user_profile_id)
            .bind(links.group_link_id)
            .bind(now)
            .fetch_one(executor)
            .await?)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            conn_id: ConnId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, Connection>("SELECT * FROM connections WHERE connection_id = ?")
                .bind(conn_id)
                .fetch_optional(executor)
                .await?
                .ok_or_else(|| StoreError::ConnectionNotFound(conn_id.to_string()))
        }

        pub(crate) async fn load_by_agent_conn_id(
            executor: impl SqliteExecutor<'_>,
            agent_conn_id: &AgentConnId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, Connection>("SELECT * FROM connections WHERE agent_conn_id = ?")
                .bind(agent_conn_id)
                .fetch_optional(executor)
                .await?
                .ok_or_else(|| StoreError::ConnectionNotFound(agent_conn_id.to_string()))
        }

        pub(crate) async fn load_for_contact(
            executor: impl SqliteExecutor<'_>,
            contact_id: ContactId,
        ) -> Result<Option<Self>, StoreError> {
            Ok(sqlx::query_as::<_, Connection>(
                "SELECT * FROM connections
                WHERE contact_id = ? AND conn_type = 'contact_direct'
                    AND conn_status != 'deleted'
                ORDER BY connection_id DESC
                LIMIT 1",
            )
            .bind(contact_id)
            .fetch_optional(executor)
            .await?)
        }

        pub(crate) async fn load_for_group_member(
            executor: impl SqliteExecutor<'_>,
            group_member_id: GroupMemberId,
        ) -> Result<Option<Self>, StoreError> {
            Ok(sqlx::query_as::<_, Connection>(
                "SELECT * FROM connections
                WHERE group_member_id = ? AND conn_status != 'deleted'
                ORDER BY connection_id DESC
                LIMIT 1",
            )
            .bind(group_member_id)
            .fetch_optional(executor)
            .await?)
        }

        pub(crate) async fn load_for_user_contact_link(
            executor: impl SqliteExecutor<'_>,
            user_contact_link_id: i64,
        ) -> Result<Option<Self>, StoreError> {
            Ok(sqlx::query_as::<_, Connection>(
                "SELECT * FROM connections
                WHERE user_contact_link_id = ? AND conn_status != 'deleted'
                ORDER BY connection_id DESC
                LIMIT 1",
            )
            .bind(user_contact_link_id)
            .fetch_optional(executor)
            .await?)
        }

        pub(crate) async fn load_all_to_subscribe(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
        ) -> Result<Vec<Self>, StoreError> {
            Ok(sqlx::query_as::<_, Connection>(
                "SELECT * FROM connections
                WHERE user_id = ? AND conn_status != 'deleted'",
            )
            .bind(user_id)
            .fetch_all(executor)
            .await?)
        }

        pub(crate) async fn update_status(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            conn_status: ConnStatus,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE connections SET conn_status = ? WHERE connection_id = ?")
                .bind(conn_status)
                .bind(self.conn_id)
                .execute(executor)
                .await?;
            self.conn_status = conn_status;
            Ok(())
        }

        pub(crate) async fn set_contact_id(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            contact_id: ContactId,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE connections SET contact_id = ? WHERE connection_id = ?")
                .bind(contact_id)
                .bind(self.conn_id)
                .execute(executor)
                .await?;
            self.contact_id = Some(contact_id);
            Ok(())
        }

        pub(crate) async fn set_conn_code(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            conn_code: Option<String>,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE connections SET conn_code = ? WHERE connection_id = ?")
                .bind(&conn_code)
                .bind(self.conn_id)
                .execute(executor)
                .await?;
            self.conn_code = conn_code;
            Ok(())
        }

        /// Bumps the SMP AUTH counter; returns the new value.
        pub(crate) async fn increment_auth_err_counter(
            &mut self,
            executor: impl SqliteExecutor<'_>,
        ) -> Result<i64, StoreError> {
            let counter: i64 = sqlx::query_scalar(
                "UPDATE connections
                SET auth_err_counter = auth_err_counter + 1
                WHERE connection_id = ?
                RETURNING auth_err_counter",
            )
            .bind(self.conn_id)
            .fetch_one(executor)
            .await?;
            self.auth_err_counter = counter;
            Ok(counter)
        }

        pub(crate) async fn reset_auth_err_counter(
            &mut self,
            executor: impl SqliteExecutor<'_>,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE connections SET auth_err_counter = 0 WHERE connection_id = ?")
                .bind(self.conn_id)
                .execute(executor)
                .await?;
            self.auth_err_counter = 0;
            Ok(())
        }

        pub(crate) async fn delete(
            executor: impl SqliteExecutor<'_>,
            conn_id: ConnId,
        ) -> Result<(), StoreError> {
            sqlx::query("DELETE FROM connections WHERE connection_id = ?")
                .bind(conn_id)
                .execute(executor)
                .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use couriercommon::profile::Profile;
    use sqlx::SqlitePool;

    use crate::users::User;

    use super::*;

    #[sqlx::test]
    async fn connection_round_trip(pool: SqlitePool) {
        let user = User::store(&pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let agent_conn_id = AgentConnId(vec![1, 2, 3]);
        let conn = Connection::store(
            &pool,
            user.user_id,
            &agent_conn_id,
            ConnStatus::New,
            ConnType::ContactDirect,
            NewConnection::default(),
        )
        .await
        .unwrap();

        let loaded = Connection::load_by_agent_conn_id(&pool, &agent_conn_id)
            .await
            .unwrap();
        assert_eq!(conn, loaded);
        assert_eq!(loaded.conn_status, ConnStatus::New);
        assert_eq!(loaded.conn_type, ConnType::ContactDirect);
    }

    #[sqlx::test]
    async fn auth_err_counter_increments(pool: SqlitePool) {
        let user = User::store(&pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let mut conn = Connection::store(
            &pool,
            user.user_id,
            &AgentConnId(vec![9]),
            ConnStatus::Ready,
            ConnType::ContactDirect,
            NewConnection::default(),
        )
        .await
        .unwrap();

        assert_eq!(conn.increment_auth_err_counter(&pool).await.unwrap(), 1);
        assert_eq!(conn.increment_auth_err_counter(&pool).await.unwrap(), 2);
        conn.reset_auth_err_counter(&pool).await.unwrap();
        assert_eq!(conn.auth_err_counter, 0);
    }
}
