// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Contacts, contact requests, the long-lived contact address and the
//! probe bookkeeping used for duplicate-contact detection.

use chrono::{DateTime, Utc};
use couriercommon::{
    identifiers::{ConnReqUri, GroupLinkId, InvitationId, Probe},
    messages::MsgContent,
    profile::{Preferences, Profile},
};

use crate::store::{ContactId, GroupId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub contact_id: ContactId,
    pub user_id: UserId,
    pub local_display_name: String,
    pub profile: Profile,
    pub local_alias: String,
    /// The local user's per-contact feature preference overrides.
    pub user_preferences: Option<Preferences>,
    pub contact_used: bool,
    pub enable_ntfs: bool,
    pub chat_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An incoming request on the user's contact address, awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRequest {
    pub contact_request_id: i64,
    pub user_id: UserId,
    pub user_contact_link_id: i64,
    pub agent_invitation_id: InvitationId,
    pub local_display_name: String,
    pub profile: Profile,
    pub created_at: DateTime<Utc>,
}

/// The user's long-lived contact address, optionally bound to a group link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContactLink {
    pub user_contact_link_id: i64,
    pub user_id: UserId,
    pub conn_req_contact: ConnReqUri,
    pub auto_accept: bool,
    pub auto_accept_incognito: bool,
    pub auto_reply: Option<MsgContent>,
    pub group_id: Option<GroupId>,
    pub group_link_id: Option<GroupLinkId>,
}

mod persistence {
    use sqlx::{Row, SqliteExecutor, sqlite::SqliteRow};

    use crate::store::{StoreError, is_unique_violation};

    use super::*;

    fn decode_json_column<T: serde::de::DeserializeOwned>(
        row: &SqliteRow,
        column: &'static str,
    ) -> sqlx::Result<T> {
        let raw: String = row.try_get(column)?;
        serde_json::from_str(&raw).map_err(|source| sqlx::Error::ColumnDecode {
            index: column.into(),
            source: Box::new(source),
        })
    }

    impl sqlx::FromRow<'_, SqliteRow> for Contact {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            Ok(Self {
                contact_id: row.try_get("contact_id")?,
                user_id: row.try_get("user_id")?,
                local_display_name: row.try_get("local_display_name")?,
                profile: decode_json_column(row, "profile")?,
                local_alias: row.try_get("local_alias")?,
                user_preferences: row
                    .try_get::<Option<String>, _>("user_preferences")?
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()
                    .map_err(|source| sqlx::Error::ColumnDecode {
                        index: "user_preferences".into(),
                        source: Box::new(source),
                    })?,
                contact_used: row.try_get("contact_used")?,
                enable_ntfs: row.try_get("enable_ntfs")?,
                chat_ts: row.try_get("chat_ts")?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    impl sqlx::FromRow<'_, SqliteRow> for ContactRequest {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            Ok(Self {
                contact_request_id: row.try_get("contact_request_id")?,
                user_id: row.try_get("user_id")?,
                user_contact_link_id: row.try_get("user_contact_link_id")?,
                agent_invitation_id: InvitationId(row.try_get("agent_invitation_id")?),
                local_display_name: row.try_get("local_display_name")?,
                profile: decode_json_column(row, "profile")?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    impl sqlx::FromRow<'_, SqliteRow> for UserContactLink {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            let auto_reply: Option<String> = row.try_get("auto_reply_content")?;
            let auto_reply = auto_reply
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|source| sqlx::Error::ColumnDecode {
                    index: "auto_reply_content".into(),
                    source: Box::new(source),
                })?;
            Ok(Self {
                user_contact_link_id: row.try_get("user_contact_link_id")?,
                user_id: row.try_get("user_id")?,
                conn_req_contact: ConnReqUri(row.try_get("conn_req_contact")?),
                auto_accept: row.try_get("auto_accept")?,
                auto_accept_incognito: row.try_get("auto_accept_incognito")?,
                auto_reply,
                group_id: row.try_get("group_id")?,
                group_link_id: row.try_get("group_link_id")?,
            })
        }
    }

    /// Picks a display name unique for the user, suffixing `_N` on
    /// collision.
    pub(crate) async fn unique_display_name(
        executor: impl SqliteExecutor<'_>,
        user_id: UserId,
        base: &str,
    ) -> Result<String, StoreError> {
        let taken: Vec<String> = sqlx::query_scalar(
            "SELECT local_display_name FROM contacts WHERE user_id = ?
            UNION SELECT local_display_name FROM groups WHERE user_id = ?",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(executor)
        .await?;
        if !taken.iter().any(|name| name == base) {
            return Ok(base.to_owned());
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}_{n}");
            if !taken.iter().any(|name| name == &candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    impl Contact {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            local_display_name: &str,
            profile: &Profile,
        ) -> Result<Self, StoreError> {
            let profile_json =
                serde_json::to_string(profile).map_err(|e| StoreError::Internal(e.to_string()))?;
            sqlx::query_as::<_, Contact>(
                "INSERT INTO contacts (user_id, local_display_name, profile, created_at)
                VALUES (?, ?, ?, ?)
                RETURNING *",
            )
            .bind(user_id)
            .bind(local_display_name)
            .bind(profile_json)
            .bind(Utc::now())
            .fetch_one(executor)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::DuplicateName
                } else {
                    error.into()
                }
            })
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            contact_id: ContactId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE contact_id = ?")
                .bind(contact_id)
                .fetch_optional(executor)
                .await?
                .ok_or(StoreError::ContactNotFound(contact_id))
        }

        pub(crate) async fn load_by_name(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            name: &str,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, Contact>(
                "SELECT * FROM contacts WHERE user_id = ? AND local_display_name = ?",
            )
            .bind(user_id)
            .bind(name)
            .fetch_optional(executor)
            .await?
            .ok_or_else(|| StoreError::ContactNotFoundByName(name.to_owned()))
        }

        pub(crate) async fn load_all(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
        ) -> Result<Vec<Self>, StoreError> {
            Ok(sqlx::query_as::<_, Contact>(
                "SELECT * FROM contacts WHERE user_id = ? ORDER BY contact_id",
            )
            .bind(user_id)
            .fetch_all(executor)
            .await?)
        }

        /// Contacts with the same offered profile, used to detect duplicate
        /// identities across direct and group channels.
        pub(crate) async fn load_by_profile(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            profile: &Profile,
            excluding: ContactId,
        ) -> Result<Vec<Self>, StoreError> {
            let contacts = Self::load_all(executor, user_id).await?;
            Ok(contacts
                .into_iter()
                .filter(|contact| {
                    contact.contact_id != excluding
                        && contact.profile.display_name == profile.display_name
                        && contact.profile.full_name == profile.full_name
                        && contact.profile.image == profile.image
                })
                .collect())
        }

        pub(crate) async fn update_profile(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            profile: &Profile,
        ) -> Result<(), StoreError> {
            let profile_json =
                serde_json::to_string(profile).map_err(|e| StoreError::Internal(e.to_string()))?;
            sqlx::query("UPDATE contacts SET profile = ? WHERE contact_id = ?")
                .bind(profile_json)
                .bind(self.contact_id)
                .execute(executor)
                .await?;
            self.profile = profile.clone();
            Ok(())
        }

        pub(crate) async fn set_alias(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            local_alias: String,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE contacts SET local_alias = ? WHERE contact_id = ?")
                .bind(&local_alias)
                .bind(self.contact_id)
                .execute(executor)
                .await?;
            self.local_alias = local_alias;
            Ok(())
        }

        pub(crate) async fn set_user_preferences(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            preferences: &Preferences,
        ) -> Result<(), StoreError> {
            let raw = serde_json::to_string(preferences)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            sqlx::query("UPDATE contacts SET user_preferences = ? WHERE contact_id = ?")
                .bind(raw)
                .bind(self.contact_id)
                .execute(executor)
                .await?;
            self.user_preferences = Some(preferences.clone());
            Ok(())
        }

        pub(crate) async fn set_used(
            executor: impl SqliteExecutor<'_>,
            contact_id: ContactId,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE contacts SET contact_used = 1 WHERE contact_id = ?")
                .bind(contact_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        pub(crate) async fn set_ntfs(
            executor: impl SqliteExecutor<'_>,
            contact_id: ContactId,
            enable_ntfs: bool,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE contacts SET enable_ntfs = ? WHERE contact_id = ?")
                .bind(enable_ntfs)
                .bind(contact_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        pub(crate) async fn update_chat_ts(
            executor: impl SqliteExecutor<'_>,
            contact_id: ContactId,
            chat_ts: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE contacts SET chat_ts = ? WHERE contact_id = ?")
                .bind(chat_ts)
                .bind(contact_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        pub(crate) async fn delete(
            executor: impl SqliteExecutor<'_>,
            contact_id: ContactId,
        ) -> Result<(), StoreError> {
            sqlx::query("DELETE FROM contacts WHERE contact_id = ?")
                .bind(contact_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        /// Rewrites every reference from the duplicate contact to the
        /// canonical one and removes the duplicate row. Runs inside the
        /// caller's transaction so no dangling references can be observed.
        pub(crate) async fn merge_into(
            txn: &mut sqlx::SqliteTransaction<'_>,
            canonical_id: ContactId,
            duplicate_id: ContactId,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE chat_items SET contact_id = ? WHERE contact_id = ?")
                .bind(canonical_id)
                .bind(duplicate_id)
                .execute(txn.as_mut())
                .await?;
            sqlx::query("UPDATE files SET contact_id = ? WHERE contact_id = ?")
                .bind(canonical_id)
                .bind(duplicate_id)
                .execute(txn.as_mut())
                .await?;
            sqlx::query("UPDATE group_members SET contact_id = ? WHERE contact_id = ?")
                .bind(canonical_id)
                .bind(duplicate_id)
                .execute(txn.as_mut())
                .await?;
            sqlx::query("UPDATE connections SET contact_id = ? WHERE contact_id = ?")
                .bind(canonical_id)
                .bind(duplicate_id)
                .execute(txn.as_mut())
                .await?;
            sqlx::query("DELETE FROM sent_probes WHERE contact_id = ?")
                .bind(duplicate_id)
                .execute(txn.as_mut())
                .await?;
            sqlx::query("DELETE FROM received_probes WHERE contact_id = ?")
                .bind(duplicate_id)
                .execute(txn.as_mut())
                .await?;
            sqlx::query("DELETE FROM contacts WHERE contact_id = ?")
                .bind(duplicate_id)
                .execute(txn.as_mut())
                .await?;
            Ok(())
        }
    }

    impl ContactRequest {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            user_contact_link_id: i64,
            agent_invitation_id: &InvitationId,
            local_display_name: &str,
            profile: &Profile,
        ) -> Result<Self, StoreError> {
            let profile_json =
                serde_json::to_string(profile).map_err(|e| StoreError::Internal(e.to_string()))?;
            Ok(sqlx::query_as::<_, ContactRequest>(
                "INSERT INTO contact_requests (
                    user_id, user_contact_link_id, agent_invitation_id,
                    local_display_name, profile, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(user_id)
            .bind(user_contact_link_id)
            .bind(&agent_invitation_id.0)
            .bind(local_display_name)
            .bind(profile_json)
            .bind(Utc::now())
            .fetch_one(executor)
            .await?)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            contact_request_id: i64,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, ContactRequest>(
                "SELECT * FROM contact_requests WHERE contact_request_id = ?",
            )
            .bind(contact_request_id)
            .fetch_optional(executor)
            .await?
            .ok_or(StoreError::ContactRequestNotFound(contact_request_id))
        }

        pub(crate) async fn delete(
            executor: impl SqliteExecutor<'_>,
            contact_request_id: i64,
        ) -> Result<(), StoreError> {
            sqlx::query("DELETE FROM contact_requests WHERE contact_request_id = ?")
                .bind(contact_request_id)
                .execute(executor)
                .await?;
            Ok(())
        }
    }

    impl UserContactLink {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            conn_req_contact: &ConnReqUri,
            group_id: Option<GroupId>,
            group_link_id: Option<GroupLinkId>,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, UserContactLink>(
                "INSERT INTO user_contact_links (
                    user_id, conn_req_contact, group_id, group_link_id, created_at
                )
                VALUES (?, ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(user_id)
            .bind(&conn_req_contact.0)
            .bind(group_id)
            .bind(group_link_id)
            .bind(Utc::now())
            .fetch_one(executor)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    if group_id.is_some() {
                        StoreError::DuplicateGroupLink
                    } else {
                        StoreError::DuplicateContactLink
                    }
                } else {
                    error.into()
                }
            })
        }

        pub(crate) async fn load_for_user(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, UserContactLink>(
                "SELECT * FROM user_contact_links WHERE user_id = ? AND group_id IS NULL",
            )
            .bind(user_id)
            .fetch_optional(executor)
            .await?
            .ok_or(StoreError::UserContactLinkNotFound)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            user_contact_link_id: i64,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, UserContactLink>(
                "SELECT * FROM user_contact_links WHERE user_contact_link_id = ?",
            )
            .bind(user_contact_link_id)
            .fetch_optional(executor)
            .await?
            .ok_or(StoreError::UserContactLinkNotFound)
        }

        pub(crate) async fn load_for_group(
            executor: impl SqliteExecutor<'_>,
            group_id: GroupId,
        ) -> Result<Option<Self>, StoreError> {
            Ok(sqlx::query_as::<_, UserContactLink>(
                "SELECT * FROM user_contact_links WHERE group_id = ?",
            )
            .bind(group_id)
            .fetch_optional(executor)
            .await?)
        }

        pub(crate) async fn update_auto_accept(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            auto_accept: bool,
            auto_accept_incognito: bool,
            auto_reply: Option<MsgContent>,
        ) -> Result<(), StoreError> {
            let auto_reply_json = auto_reply
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            sqlx::query(
                "UPDATE user_contact_links
                SET auto_accept = ?, auto_accept_incognito = ?, auto_reply_content = ?
                WHERE user_contact_link_id = ?",
            )
            .bind(auto_accept)
            .bind(auto_accept_incognito)
            .bind(auto_reply_json)
            .bind(self.user_contact_link_id)
            .execute(executor)
            .await?;
            self.auto_accept = auto_accept;
            self.auto_accept_incognito = auto_accept_incognito;
            self.auto_reply = auto_reply;
            Ok(())
        }

        pub(crate) async fn delete(
            executor: impl SqliteExecutor<'_>,
            user_contact_link_id: i64,
        ) -> Result<(), StoreError> {
            sqlx::query("DELETE FROM user_contact_links WHERE user_contact_link_id = ?")
                .bind(user_contact_link_id)
                .execute(executor)
                .await?;
            Ok(())
        }
    }

    pub(crate) struct SentProbe;

    impl SentProbe {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            contact_id: ContactId,
            probe: &Probe,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "INSERT OR REPLACE INTO sent_probes (user_id, contact_id, probe, created_at)
                VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(contact_id)
            .bind(probe)
            .bind(Utc::now())
            .execute(executor)
            .await?;
            Ok(())
        }

        /// Finds the contact whose sent probe hashes to `hash`.
        pub(crate) async fn match_hash(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            hash: &couriercommon::identifiers::ProbeHash,
        ) -> Result<Option<(ContactId, Probe)>, StoreError> {
            let rows: Vec<(ContactId, Probe)> =
                sqlx::query_as("SELECT contact_id, probe FROM sent_probes WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_all(executor)
                    .await?;
            Ok(rows.into_iter().find(|(_, probe)| {
                couriercommon::identifiers::ProbeHash::of(probe) == *hash
            }))
        }
    }

    pub(crate) struct ReceivedProbe;

    impl ReceivedProbe {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            contact_id: ContactId,
            probe: &Probe,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "INSERT INTO received_probes (user_id, contact_id, probe, created_at)
                VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(contact_id)
            .bind(probe)
            .bind(Utc::now())
            .execute(executor)
            .await?;
            Ok(())
        }

        /// The contact that previously sent `probe`, if any.
        pub(crate) async fn match_probe(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            probe: &Probe,
        ) -> Result<Option<ContactId>, StoreError> {
            Ok(sqlx::query_scalar(
                "SELECT contact_id FROM received_probes WHERE user_id = ? AND probe = ?",
            )
            .bind(user_id)
            .bind(probe)
            .fetch_optional(executor)
            .await?)
        }
    }
}

pub(crate) use persistence::{ReceivedProbe, SentProbe, unique_display_name};

#[cfg(test)]
mod tests {
    use couriercommon::identifiers::ProbeHash;
    use sqlx::SqlitePool;

    use crate::users::User;

    use super::*;

    async fn test_user(pool: &SqlitePool) -> User {
        User::store(pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap()
    }

    #[sqlx::test]
    async fn display_name_collision_gets_suffix(pool: SqlitePool) {
        let user = test_user(&pool).await;
        let profile = Profile::new("bob");
        let name = unique_display_name(&pool, user.user_id, "bob").await.unwrap();
        Contact::store(&pool, user.user_id, &name, &profile)
            .await
            .unwrap();

        let name = unique_display_name(&pool, user.user_id, "bob").await.unwrap();
        assert_eq!(name, "bob_1");
        Contact::store(&pool, user.user_id, &name, &profile)
            .await
            .unwrap();

        let name = unique_display_name(&pool, user.user_id, "bob").await.unwrap();
        assert_eq!(name, "bob_2");
    }

    #[sqlx::test]
    async fn sent_probe_matches_by_hash(pool: SqlitePool) {
        let user = test_user(&pool).await;
        let contact = Contact::store(&pool, user.user_id, "bob", &Profile::new("bob"))
            .await
            .unwrap();
        let probe = Probe::new([42; 16]);
        SentProbe::store(&pool, user.user_id, contact.contact_id, &probe)
            .await
            .unwrap();

        let matched = SentProbe::match_hash(&pool, user.user_id, &ProbeHash::of(&probe))
            .await
            .unwrap();
        assert_eq!(matched, Some((contact.contact_id, probe)));

        let no_match = SentProbe::match_hash(&pool, user.user_id, &ProbeHash::of(&Probe::new([1; 16])))
            .await
            .unwrap();
        assert_eq!(no_match, None);
    }

    #[sqlx::test]
    async fn second_contact_address_is_rejected(pool: SqlitePool) {
        let user = test_user(&pool).await;
        UserContactLink::store(&pool, user.user_id, &ConnReqUri("uri1".into()), None, None)
            .await
            .unwrap();
        let error =
            UserContactLink::store(&pool, user.user_id, &ConnReqUri("uri2".into()), None, None)
                .await
                .unwrap_err();
        assert!(matches!(error, crate::store::StoreError::DuplicateContactLink));
    }
}
