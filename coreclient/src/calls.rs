// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-flight call negotiation, one per contact.
//!
//! A new invitation replaces a stuck call after a disconnect status is
//! reported for the old one.

use chrono::{DateTime, Utc};
use couriercommon::messages::{CallId, CallMedia};

use crate::store::{ChatItemId, ContactId, UserId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display, strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallState {
    InvitationSent,
    InvitationReceived,
    OfferSent,
    OfferReceived,
    Negotiated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub user_id: UserId,
    pub contact_id: ContactId,
    pub call_id: CallId,
    pub chat_item_id: Option<ChatItemId>,
    pub call_state: CallState,
    pub call_ts: DateTime<Utc>,
    pub media: CallMedia,
}

mod persistence {
    use sqlx::{Row, SqliteExecutor, sqlite::SqliteRow};

    use crate::store::StoreError;

    use super::*;

    impl sqlx::FromRow<'_, SqliteRow> for Call {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            Ok(Self {
                user_id: row.try_get("user_id")?,
                contact_id: row.try_get("contact_id")?,
                call_id: CallId(row.try_get("call_id")?),
                chat_item_id: row.try_get("chat_item_id")?,
                call_state: row.try_get("call_state")?,
                call_ts: row.try_get("call_ts")?,
                // media is recoverable from the anchored chat item; audio is
                // the safe default for restored rows
                media: CallMedia::Audio,
            })
        }
    }

    impl Call {
        pub(crate) async fn upsert(
            &self,
            executor: impl SqliteExecutor<'_>,
        ) -> Result<(), StoreError> {
            sqlx::query(
                "INSERT INTO calls (
                    user_id, contact_id, call_id, chat_item_id, call_state, call_ts
                )
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (contact_id) DO UPDATE SET
                    call_id = excluded.call_id,
                    chat_item_id = excluded.chat_item_id,
                    call_state = excluded.call_state,
                    call_ts = excluded.call_ts",
            )
            .bind(self.user_id)
            .bind(self.contact_id)
            .bind(&self.call_id.0)
            .bind(self.chat_item_id)
            .bind(self.call_state)
            .bind(self.call_ts)
            .execute(executor)
            .await?;
            Ok(())
        }

        pub(crate) async fn delete(
            executor: impl SqliteExecutor<'_>,
            contact_id: ContactId,
        ) -> Result<(), StoreError> {
            sqlx::query("DELETE FROM calls WHERE contact_id = ?")
                .bind(contact_id)
                .execute(executor)
                .await?;
            Ok(())
        }
    }
}
