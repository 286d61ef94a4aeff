// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Groups and group members.
//!
//! Every group keeps a membership row for the local user next to the rows of
//! the remote participants. Member statuses advance monotonically through
//! the introduction pipeline and reverse only into the terminal states.

use chrono::{DateTime, Utc};
use couriercommon::{
    identifiers::MemberId,
    profile::{GroupMemberRole, GroupProfile, Profile},
};

use crate::store::{ContactId, GroupId, GroupMemberId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub local_display_name: String,
    pub profile: GroupProfile,
    /// Connection request of a received, not yet joined invitation.
    pub inv_conn_req: Option<String>,
    pub chat_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display, strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GroupMemberStatus {
    Invited,
    Accepted,
    Announced,
    IntroInvited,
    IntroForwarded,
    Connecting,
    Connected,
    Complete,
    Removed,
    Left,
    GroupDeleted,
    Creator,
}

impl GroupMemberStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Removed | Self::Left | Self::GroupDeleted)
    }

    /// Position in the introduction pipeline, when applicable.
    fn intro_rank(self) -> Option<u8> {
        match self {
            Self::Announced => Some(0),
            Self::IntroInvited => Some(1),
            Self::IntroForwarded => Some(2),
            Self::Connecting => Some(3),
            Self::Connected => Some(4),
            Self::Complete => Some(5),
            _ => None,
        }
    }

    /// Whether moving to `next` respects status monotonicity: the
    /// introduction pipeline never runs backwards, terminal states are
    /// always reachable.
    pub fn may_advance_to(self, next: Self) -> bool {
        if next.is_terminal() {
            return true;
        }
        match (self.intro_rank(), next.intro_rank()) {
            (Some(current), Some(next)) => next >= current,
            _ => true,
        }
    }

    /// Member counts as a current member for message fan-out.
    pub fn is_current(self) -> bool {
        !self.is_terminal() && !matches!(self, Self::Invited)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display, strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GroupMemberCategory {
    /// The local user's own membership row.
    UserMember,
    /// A member the local user invited directly.
    InviteeMember,
    /// The member that invited the local user.
    HostMember,
    /// Announced by the host, connection not yet established.
    PreMember,
    /// Introduced after the local user joined.
    PostMember,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub group_member_id: GroupMemberId,
    pub group_id: GroupId,
    pub member_id: MemberId,
    pub member_role: GroupMemberRole,
    pub member_status: GroupMemberStatus,
    pub member_category: GroupMemberCategory,
    pub invited_by: Option<GroupMemberId>,
    pub local_display_name: String,
    pub profile: Profile,
    pub contact_id: Option<ContactId>,
    pub created_at: DateTime<Utc>,
}

impl GroupMember {
    pub fn is_user_membership(&self) -> bool {
        self.member_category == GroupMemberCategory::UserMember
    }
}

/// Fields of a member row about to be created.
#[derive(Debug, Clone)]
pub struct NewGroupMember {
    pub member_id: MemberId,
    pub member_role: GroupMemberRole,
    pub member_status: GroupMemberStatus,
    pub member_category: GroupMemberCategory,
    pub invited_by: Option<GroupMemberId>,
    pub profile: Profile,
    pub contact_id: Option<ContactId>,
}

mod persistence {
    use sqlx::{Row, SqliteExecutor, sqlite::SqliteRow};

    use crate::store::{StoreError, is_unique_violation};

    use super::*;

    impl sqlx::FromRow<'_, SqliteRow> for Group {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            let profile_json: String = row.try_get("profile")?;
            let profile = serde_json::from_str(&profile_json).map_err(|source| {
                sqlx::Error::ColumnDecode {
                    index: "profile".into(),
                    source: Box::new(source),
                }
            })?;
            Ok(Self {
                group_id: row.try_get("group_id")?,
                user_id: row.try_get("user_id")?,
                local_display_name: row.try_get("local_display_name")?,
                profile,
                inv_conn_req: row.try_get("inv_conn_req")?,
                chat_ts: row.try_get("chat_ts")?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    impl sqlx::FromRow<'_, SqliteRow> for GroupMember {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            let profile_json: String = row.try_get("profile")?;
            let profile = serde_json::from_str(&profile_json).map_err(|source| {
                sqlx::Error::ColumnDecode {
                    index: "profile".into(),
                    source: Box::new(source),
                }
            })?;
            Ok(Self {
                group_member_id: row.try_get("group_member_id")?,
                group_id: row.try_get("group_id")?,
                member_id: row.try_get("member_id")?,
                member_role: row.try_get("member_role")?,
                member_status: row.try_get("member_status")?,
                member_category: row.try_get("member_category")?,
                invited_by: row.try_get("invited_by")?,
                local_display_name: row.try_get("local_display_name")?,
                profile,
                contact_id: row.try_get("contact_id")?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    impl Group {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            local_display_name: &str,
            profile: &GroupProfile,
        ) -> Result<Self, StoreError> {
            let profile_json =
                serde_json::to_string(profile).map_err(|e| StoreError::Internal(e.to_string()))?;
            sqlx::query_as::<_, Group>(
                "INSERT INTO groups (user_id, local_display_name, profile, created_at)
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
            group_id: GroupId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE group_id = ?")
                .bind(group_id)
                .fetch_optional(executor)
                .await?
                .ok_or(StoreError::GroupNotFound(group_id))
        }

        pub(crate) async fn load_by_name(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            name: &str,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, Group>(
                "SELECT * FROM groups WHERE user_id = ? AND local_display_name = ?",
            )
            .bind(user_id)
            .bind(name)
            .fetch_optional(executor)
            .await?
            .ok_or_else(|| StoreError::GroupNotFoundByName(name.to_owned()))
        }

        pub(crate) async fn load_all(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
        ) -> Result<Vec<Self>, StoreError> {
            Ok(
                sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE user_id = ? ORDER BY group_id")
                    .bind(user_id)
                    .fetch_all(executor)
                    .await?,
            )
        }

        pub(crate) async fn update_profile(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            profile: &GroupProfile,
        ) -> Result<(), StoreError> {
            let profile_json =
                serde_json::to_string(profile).map_err(|e| StoreError::Internal(e.to_string()))?;
            sqlx::query("UPDATE groups SET profile = ? WHERE group_id = ?")
                .bind(profile_json)
                .bind(self.group_id)
                .execute(executor)
                .await?;
            self.profile = profile.clone();
            Ok(())
        }

        pub(crate) async fn set_inv_conn_req(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            inv_conn_req: Option<&str>,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE groups SET inv_conn_req = ? WHERE group_id = ?")
                .bind(inv_conn_req)
                .bind(self.group_id)
                .execute(executor)
                .await?;
            self.inv_conn_req = inv_conn_req.map(str::to_owned);
            Ok(())
        }

        pub(crate) async fn update_chat_ts(
            executor: impl SqliteExecutor<'_>,
            group_id: GroupId,
            chat_ts: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE groups SET chat_ts = ? WHERE group_id = ?")
                .bind(chat_ts)
                .bind(group_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        pub(crate) async fn delete(
            executor: impl SqliteExecutor<'_>,
            group_id: GroupId,
        ) -> Result<(), StoreError> {
            sqlx::query("DELETE FROM groups WHERE group_id = ?")
                .bind(group_id)
                .execute(executor)
                .await?;
            Ok(())
        }
    }

    impl GroupMember {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            group_id: GroupId,
            member: NewGroupMember,
        ) -> Result<Self, StoreError> {
            let profile_json = serde_json::to_string(&member.profile)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            Ok(sqlx::query_as::<_, GroupMember>(
                "INSERT INTO group_members (
                    group_id, member_id, member_role, member_status, member_category,
                    invited_by, local_display_name, profile, contact_id, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(group_id)
            .bind(member.member_id)
            .bind(member.member_role)
            .bind(member.member_status)
            .bind(member.member_category)
            .bind(member.invited_by)
            .bind(&member.profile.display_name)
            .bind(profile_json)
            .bind(member.contact_id)
            .bind(Utc::now())
            .fetch_one(executor)
            .await?)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            group_member_id: GroupMemberId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, GroupMember>(
                "SELECT * FROM group_members WHERE group_member_id = ?",
            )
            .bind(group_member_id)
            .fetch_optional(executor)
            .await?
            .ok_or(StoreError::GroupMemberNotFound(group_member_id))
        }

        pub(crate) async fn load_by_member_id(
            executor: impl SqliteExecutor<'_>,
            group_id: GroupId,
            member_id: &MemberId,
        ) -> Result<Option<Self>, StoreError> {
            Ok(sqlx::query_as::<_, GroupMember>(
                "SELECT * FROM group_members WHERE group_id = ? AND member_id = ?",
            )
            .bind(group_id)
            .bind(member_id)
            .fetch_optional(executor)
            .await?)
        }

        /// The local user's own membership row.
        pub(crate) async fn load_membership(
            executor: impl SqliteExecutor<'_>,
            group_id: GroupId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, GroupMember>(
                "SELECT * FROM group_members
                WHERE group_id = ? AND member_category = 'user_member'",
            )
            .bind(group_id)
            .fetch_optional(executor)
            .await?
            .ok_or(StoreError::GroupMemberNotFound(group_id))
        }

        /// All remote members of the group.
        pub(crate) async fn load_remote_members(
            executor: impl SqliteExecutor<'_>,
            group_id: GroupId,
        ) -> Result<Vec<Self>, StoreError> {
            Ok(sqlx::query_as::<_, GroupMember>(
                "SELECT * FROM group_members
                WHERE group_id = ? AND member_category != 'user_member'
                ORDER BY group_member_id",
            )
            .bind(group_id)
            .fetch_all(executor)
            .await?)
        }

        /// Whether any group knows this contact as a member; used to decide
        /// probing after a direct connection comes up.
        pub(crate) async fn any_for_contact(
            executor: impl SqliteExecutor<'_>,
            contact_id: ContactId,
        ) -> Result<bool, StoreError> {
            let count: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM group_members WHERE contact_id = ?",
            )
            .bind(contact_id)
            .fetch_one(executor)
            .await?;
            Ok(count > 0)
        }

        /// Updates the status, honoring monotonicity. Returns whether the
        /// row changed.
        pub(crate) async fn advance_status(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            member_status: GroupMemberStatus,
        ) -> Result<bool, StoreError> {
            if !self.member_status.may_advance_to(member_status) {
                return Ok(false);
            }
            sqlx::query("UPDATE group_members SET member_status = ? WHERE group_member_id = ?")
                .bind(member_status)
                .bind(self.group_member_id)
                .execute(executor)
                .await?;
            self.member_status = member_status;
            Ok(true)
        }

        pub(crate) async fn update_role(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            member_role: GroupMemberRole,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE group_members SET member_role = ? WHERE group_member_id = ?")
                .bind(member_role)
                .bind(self.group_member_id)
                .execute(executor)
                .await?;
            self.member_role = member_role;
            Ok(())
        }

        pub(crate) async fn update_profile(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            profile: &Profile,
        ) -> Result<(), StoreError> {
            let profile_json =
                serde_json::to_string(profile).map_err(|e| StoreError::Internal(e.to_string()))?;
            sqlx::query("UPDATE group_members SET profile = ? WHERE group_member_id = ?")
                .bind(profile_json)
                .bind(self.group_member_id)
                .execute(executor)
                .await?;
            self.profile = profile.clone();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use sqlx::SqlitePool;

    use crate::users::User;

    use super::*;

    #[test]
    fn intro_statuses_never_reverse() {
        use GroupMemberStatus::*;
        assert!(Announced.may_advance_to(IntroInvited));
        assert!(IntroInvited.may_advance_to(IntroForwarded));
        assert!(IntroForwarded.may_advance_to(Connecting));
        assert!(Connecting.may_advance_to(Connected));
        assert!(Connected.may_advance_to(Connected));

        assert!(!Connected.may_advance_to(Announced));
        assert!(!IntroForwarded.may_advance_to(IntroInvited));

        // terminal transitions are always allowed
        assert!(Connected.may_advance_to(Removed));
        assert!(Announced.may_advance_to(GroupDeleted));
        assert!(IntroInvited.may_advance_to(Left));
    }

    #[sqlx::test]
    async fn duplicate_member_id_is_rejected(pool: SqlitePool) {
        let user = User::store(&pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let group = Group::store(&pool, user.user_id, "team", &GroupProfile::new("team"))
            .await
            .unwrap();

        let member = NewGroupMember {
            member_id: MemberId::new([7; 16]),
            member_role: GroupMemberRole::Member,
            member_status: GroupMemberStatus::Announced,
            member_category: GroupMemberCategory::PreMember,
            invited_by: None,
            profile: Profile::new("bob"),
            contact_id: None,
        };
        GroupMember::store(&pool, group.group_id, member.clone())
            .await
            .unwrap();
        assert!(GroupMember::store(&pool, group.group_id, member).await.is_err());
    }

    #[sqlx::test]
    async fn backwards_status_update_is_ignored(pool: SqlitePool) {
        let user = User::store(&pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let group = Group::store(&pool, user.user_id, "team", &GroupProfile::new("team"))
            .await
            .unwrap();
        let mut member = GroupMember::store(
            &pool,
            group.group_id,
            NewGroupMember {
                member_id: MemberId::new([7; 16]),
                member_role: GroupMemberRole::Member,
                member_status: GroupMemberStatus::Connecting,
                member_category: GroupMemberCategory::PostMember,
                invited_by: None,
                profile: Profile::new("bob"),
                contact_id: None,
            },
        )
        .await
        .unwrap();

        assert!(
            !member
                .advance_status(&pool, GroupMemberStatus::Announced)
                .await
                .unwrap()
        );
        assert_eq!(member.member_status, GroupMemberStatus::Connecting);

        assert!(
            member
                .advance_status(&pool, GroupMemberStatus::Connected)
                .await
                .unwrap()
        );
    }
}
