// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local user profiles.
//!
//! At most one user is active at a time. Users may be hidden behind a view
//! password; at least one user without a view password must remain unless
//! none are left at all.

use chrono::{DateTime, Utc};
use couriercommon::profile::Profile;
use sha2::{Digest, Sha256};

use crate::store::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub agent_user_id: i64,
    pub local_display_name: String,
    pub profile: Profile,
    pub active_user: bool,
    pub show_ntfs: bool,
    pub view_pwd_hash: Option<UserPwdHash>,
    pub chat_item_ttl: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn hidden(&self) -> bool {
        self.view_pwd_hash.is_some()
    }

    /// Checks a view password against the stored salted hash.
    pub fn matches_view_pwd(&self, password: &str) -> bool {
        match &self.view_pwd_hash {
            Some(stored) => stored.hash == UserPwdHash::digest(&stored.salt, password),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPwdHash {
    pub hash: Vec<u8>,
    pub salt: Vec<u8>,
}

impl UserPwdHash {
    pub fn new(salt: Vec<u8>, password: &str) -> Self {
        let hash = Self::digest(&salt, password);
        Self { hash, salt }
    }

    fn digest(salt: &[u8], password: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hasher.finalize().to_vec()
    }
}

mod persistence {
    use sqlx::{Row, SqliteExecutor, sqlite::SqliteRow};

    use crate::store::{StoreError, is_unique_violation};

    use super::*;

    impl sqlx::FromRow<'_, SqliteRow> for User {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            let profile_json: String = row.try_get("profile")?;
            let profile = serde_json::from_str(&profile_json).map_err(|source| {
                sqlx::Error::ColumnDecode {
                    index: "profile".into(),
                    source: Box::new(source),
                }
            })?;
            let view_pwd_hash = match (
                row.try_get::<Option<Vec<u8>>, _>("view_pwd_hash")?,
                row.try_get::<Option<Vec<u8>>, _>("view_pwd_salt")?,
            ) {
                (Some(hash), Some(salt)) => Some(UserPwdHash { hash, salt }),
                _ => None,
            };
            Ok(Self {
                user_id: row.try_get("user_id")?,
                agent_user_id: row.try_get("agent_user_id")?,
                local_display_name: row.try_get("local_display_name")?,
                profile,
                active_user: row.try_get("active_user")?,
                show_ntfs: row.try_get("show_ntfs")?,
                view_pwd_hash,
                chat_item_ttl: row.try_get("chat_item_ttl")?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    impl User {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            agent_user_id: i64,
            profile: &Profile,
            active_user: bool,
        ) -> Result<Self, StoreError> {
            let now = Utc::now();
            let profile_json =
                serde_json::to_string(profile).map_err(|e| StoreError::Internal(e.to_string()))?;
            let user = sqlx::query_as::<_, User>(
                "INSERT INTO users
                    (agent_user_id, local_display_name, profile, active_user, created_at)
                VALUES (?, ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(agent_user_id)
            .bind(&profile.display_name)
            .bind(profile_json)
            .bind(active_user)
            .bind(now)
            .fetch_one(executor)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::DuplicateName
                } else {
                    error.into()
                }
            })?;
            Ok(user)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(executor)
                .await?
                .ok_or(StoreError::UserNotFound(user_id))
        }

        pub(crate) async fn load_by_name(
            executor: impl SqliteExecutor<'_>,
            local_display_name: &str,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE local_display_name = ?")
                .bind(local_display_name)
                .fetch_optional(executor)
                .await?
                .ok_or_else(|| StoreError::UserNotFoundByName(local_display_name.to_owned()))
        }

        pub(crate) async fn load_active(
            executor: impl SqliteExecutor<'_>,
        ) -> Result<Option<Self>, StoreError> {
            Ok(
                sqlx::query_as::<_, User>("SELECT * FROM users WHERE active_user = 1")
                    .fetch_optional(executor)
                    .await?,
            )
        }

        pub(crate) async fn load_all(
            executor: impl SqliteExecutor<'_>,
        ) -> Result<Vec<Self>, StoreError> {
            Ok(
                sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY user_id")
                    .fetch_all(executor)
                    .await?,
            )
        }

        /// Makes `user_id` the single active user.
        pub(crate) async fn set_active(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE users SET active_user = (user_id = ?)")
                .bind(user_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        pub(crate) async fn update_privacy(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            show_ntfs: bool,
            view_pwd: Option<&UserPwdHash>,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "UPDATE users
                SET show_ntfs = ?, view_pwd_hash = ?, view_pwd_salt = ?
                WHERE user_id = ?",
            )
            .bind(show_ntfs)
            .bind(view_pwd.map(|p| p.hash.clone()))
            .bind(view_pwd.map(|p| p.salt.clone()))
            .bind(user_id)
            .execute(executor)
            .await?;
            Ok(())
        }

        pub(crate) async fn set_chat_item_ttl(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            ttl: Option<i64>,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE users SET chat_item_ttl = ? WHERE user_id = ?")
                .bind(ttl)
                .bind(user_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        pub(crate) async fn update_profile(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            profile: &Profile,
        ) -> Result<(), StoreError> {
            let profile_json =
                serde_json::to_string(profile).map_err(|e| StoreError::Internal(e.to_string()))?;
            sqlx::query(
                "UPDATE users SET profile = ?, local_display_name = ? WHERE user_id = ?",
            )
            .bind(profile_json)
            .bind(&profile.display_name)
            .bind(user_id)
            .execute(executor)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::DuplicateName
                } else {
                    StoreError::from(error)
                }
            })?;
            Ok(())
        }

        pub(crate) async fn delete(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
        ) -> Result<(), StoreError> {
            sqlx::query("DELETE FROM users WHERE user_id = ?")
                .bind(user_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        pub(crate) async fn count(executor: impl SqliteExecutor<'_>) -> Result<i64, StoreError> {
            Ok(sqlx::query_scalar("SELECT count(*) FROM users")
                .fetch_one(executor)
                .await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use sqlx::SqlitePool;

    use super::*;

    #[sqlx::test]
    async fn duplicate_display_name_is_rejected(pool: SqlitePool) {
        let profile = Profile::new("alice");
        User::store(&pool, 1, &profile, true).await.unwrap();
        let error = User::store(&pool, 2, &profile, false).await.unwrap_err();
        assert!(matches!(error, crate::store::StoreError::DuplicateName));
    }

    #[sqlx::test]
    async fn load_by_name_resolves(pool: SqlitePool) {
        let stored = User::store(&pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let loaded = User::load_by_name(&pool, "alice").await.unwrap();
        assert_eq!(stored, loaded);
        assert!(User::load_by_name(&pool, "nobody").await.is_err());
    }

    #[sqlx::test]
    async fn only_one_active_user(pool: SqlitePool) {
        let alice = User::store(&pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let bob = User::store(&pool, 2, &Profile::new("bob"), false)
            .await
            .unwrap();

        User::set_active(&pool, bob.user_id).await.unwrap();
        let active = User::load_active(&pool).await.unwrap().unwrap();
        assert_eq!(active.user_id, bob.user_id);
        assert!(!User::load(&pool, alice.user_id).await.unwrap().active_user);
    }

    #[test]
    fn view_password_round_trip() {
        let pwd = UserPwdHash::new(vec![1, 2, 3], "secret");
        let user = User {
            user_id: 1,
            agent_user_id: 1,
            local_display_name: "alice".into(),
            profile: Profile::new("alice"),
            active_user: true,
            show_ntfs: true,
            view_pwd_hash: Some(pwd),
            chat_item_ttl: None,
            created_at: Utc::now(),
        };
        assert!(user.matches_view_pwd("secret"));
        assert!(!user.matches_view_pwd("wrong"));
    }
}
