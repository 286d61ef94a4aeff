// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Chats and chat items.
//!
//! A chat item is a single rendered conversation entry, tied to the message
//! row that created it (where one exists) and optionally to a file transfer.
//! Items carry the peer-agreed shared message id so edits and deletes can be
//! resolved across both sides.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use couriercommon::{identifiers::SharedMsgId, messages::MsgContent};

use crate::store::{ChatItemId, ConnId, ContactId, GroupId, GroupMemberId, MessageId, UserId};

pub mod content;

pub use content::CIContent;

/// Reference to a conversation: `@` contact, `#` group, `:` a pending
/// contact connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatRef {
    Direct(ContactId),
    Group(GroupId),
    ContactConnection(ConnId),
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(id) => write!(f, "@{id}"),
            Self::Group(id) => write!(f, "#{id}"),
            Self::ContactConnection(id) => write!(f, ":{id}"),
        }
    }
}

impl FromStr for ChatRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_at_checked(1).ok_or("empty chat reference")?;
        let id: i64 = id.parse().map_err(|_| format!("invalid chat id: {id}"))?;
        match kind {
            "@" => Ok(Self::Direct(id)),
            "#" => Ok(Self::Group(id)),
            ":" => Ok(Self::ContactConnection(id)),
            _ => Err(format!("invalid chat reference: {s}")),
        }
    }
}

/// Name-based reference used by the friendly command forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatName {
    Direct(String),
    Group(String),
}

impl FromStr for ChatName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s.split_at_checked(1).ok_or("empty chat name")?;
        if name.is_empty() {
            return Err("empty chat name".to_owned());
        }
        match kind {
            "@" => Ok(Self::Direct(name.to_owned())),
            "#" => Ok(Self::Group(name.to_owned())),
            _ => Err(format!("invalid chat name: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CIDirection {
    Snd,
    Rcv,
}

impl CIDirection {
    pub fn sent(self) -> bool {
        matches!(self, Self::Snd)
    }
}

/// Disappearing-message state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CITimed {
    pub ttl: i64,
    pub delete_at: Option<DateTime<Utc>>,
}

/// Snapshot of a quoted item, denormalized into the quoting row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CIQuote {
    pub shared_msg_id: Option<SharedMsgId>,
    pub sent: Option<bool>,
    pub content: MsgContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatItem {
    pub chat_item_id: ChatItemId,
    pub user_id: UserId,
    pub contact_id: Option<ContactId>,
    pub group_id: Option<GroupId>,
    pub group_member_id: Option<GroupMemberId>,
    pub item_sent: CIDirection,
    pub item_ts: DateTime<Utc>,
    pub shared_msg_id: Option<SharedMsgId>,
    pub content: CIContent,
    pub item_text: String,
    pub file_id: Option<i64>,
    pub quote: Option<CIQuote>,
    pub item_edited: bool,
    pub item_deleted: bool,
    pub item_live: Option<bool>,
    pub timed: Option<CITimed>,
    pub created_by_msg_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

impl ChatItem {
    pub fn chat_ref(&self) -> ChatRef {
        match (self.contact_id, self.group_id) {
            (Some(contact_id), _) => ChatRef::Direct(contact_id),
            (_, Some(group_id)) => ChatRef::Group(group_id),
            _ => ChatRef::ContactConnection(0),
        }
    }
}

/// Fields of an item about to be inserted.
#[derive(Debug, Clone)]
pub struct NewChatItem {
    pub user_id: UserId,
    pub chat_ref: ChatRef,
    pub group_member_id: Option<GroupMemberId>,
    pub item_sent: CIDirection,
    pub item_ts: DateTime<Utc>,
    pub shared_msg_id: Option<SharedMsgId>,
    pub content: CIContent,
    pub file_id: Option<i64>,
    pub quote: Option<CIQuote>,
    pub item_live: Option<bool>,
    pub timed: Option<CITimed>,
    pub created_by_msg_id: Option<MessageId>,
}

impl NewChatItem {
    /// Internal item with no wire counterpart.
    pub fn internal(
        user_id: UserId,
        chat_ref: ChatRef,
        item_sent: CIDirection,
        content: CIContent,
    ) -> Self {
        Self {
            user_id,
            chat_ref,
            group_member_id: None,
            item_sent,
            item_ts: Utc::now(),
            shared_msg_id: None,
            content,
            file_id: None,
            quote: None,
            item_live: None,
            timed: None,
            created_by_msg_id: None,
        }
    }
}

/// Pagination of chat reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CIPagination {
    Last(i64),
    After(ChatItemId, i64),
    Before(ChatItemId, i64),
}

/// One entry in the chat list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPreview {
    pub chat_ref: ChatRef,
    pub display_name: String,
    pub chat_ts: Option<DateTime<Utc>>,
    pub last_item: Option<ChatItem>,
}

mod persistence {
    use sqlx::{Row, SqliteExecutor, sqlite::SqliteRow};

    use crate::store::StoreError;

    use super::*;

    impl sqlx::FromRow<'_, SqliteRow> for ChatItem {
        fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
            let content_json: String = row.try_get("content")?;
            let content = serde_json::from_str(&content_json).map_err(|source| {
                sqlx::Error::ColumnDecode {
                    index: "content".into(),
                    source: Box::new(source),
                }
            })?;
            let quote = match row.try_get::<Option<String>, _>("quoted_content")? {
                Some(raw) => {
                    let content =
                        serde_json::from_str(&raw).map_err(|source| sqlx::Error::ColumnDecode {
                            index: "quoted_content".into(),
                            source: Box::new(source),
                        })?;
                    Some(CIQuote {
                        shared_msg_id: row.try_get("quoted_shared_msg_id")?,
                        sent: row.try_get("quoted_sent")?,
                        content,
                    })
                }
                None => None,
            };
            let timed = row
                .try_get::<Option<i64>, _>("timed_ttl")?
                .map(|ttl| -> sqlx::Result<CITimed> {
                    Ok(CITimed {
                        ttl,
                        delete_at: row.try_get("timed_delete_at")?,
                    })
                })
                .transpose()?;
            let item_sent = if row.try_get::<bool, _>("item_sent")? {
                CIDirection::Snd
            } else {
                CIDirection::Rcv
            };
            Ok(Self {
                chat_item_id: row.try_get("chat_item_id")?,
                user_id: row.try_get("user_id")?,
                contact_id: row.try_get("contact_id")?,
                group_id: row.try_get("group_id")?,
                group_member_id: row.try_get("group_member_id")?,
                item_sent,
                item_ts: row.try_get("item_ts")?,
                shared_msg_id: row.try_get("shared_msg_id")?,
                content,
                item_text: row.try_get("item_text")?,
                file_id: row.try_get("file_id")?,
                quote,
                item_edited: row.try_get("item_edited")?,
                item_deleted: row.try_get("item_deleted")?,
                item_live: row.try_get("item_live")?,
                timed,
                created_by_msg_id: row.try_get("created_by_msg_id")?,
                created_at: row.try_get("created_at")?,
            })
        }
    }

    fn chat_columns(chat_ref: ChatRef) -> (Option<ContactId>, Option<GroupId>) {
        match chat_ref {
            ChatRef::Direct(contact_id) => (Some(contact_id), None),
            ChatRef::Group(group_id) => (None, Some(group_id)),
            ChatRef::ContactConnection(_) => (None, None),
        }
    }

    impl ChatItem {
        pub(crate) async fn store(
            executor: impl SqliteExecutor<'_>,
            new_item: &NewChatItem,
        ) -> Result<Self, StoreError> {
            let (contact_id, group_id) = chat_columns(new_item.chat_ref);
            let content_json = serde_json::to_string(&new_item.content)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let quoted_content_json = new_item
                .quote
                .as_ref()
                .map(|quote| serde_json::to_string(&quote.content))
                .transpose()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            Ok(sqlx::query_as::<_, ChatItem>(
                "INSERT INTO chat_items (
                    user_id, contact_id, group_id, group_member_id, item_sent, item_ts,
                    shared_msg_id, content, item_text, file_id,
                    quoted_shared_msg_id, quoted_sent, quoted_content,
                    item_live, timed_ttl, timed_delete_at, created_by_msg_id, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *",
            )
            .bind(new_item.user_id)
            .bind(contact_id)
            .bind(group_id)
            .bind(new_item.group_member_id)
            .bind(new_item.item_sent.sent())
            .bind(new_item.item_ts)
            .bind(new_item.shared_msg_id)
            .bind(content_json)
            .bind(new_item.content.text())
            .bind(new_item.file_id)
            .bind(new_item.quote.as_ref().and_then(|q| q.shared_msg_id))
            .bind(new_item.quote.as_ref().and_then(|q| q.sent))
            .bind(quoted_content_json)
            .bind(new_item.item_live)
            .bind(new_item.timed.map(|t| t.ttl))
            .bind(new_item.timed.and_then(|t| t.delete_at))
            .bind(new_item.created_by_msg_id)
            .bind(Utc::now())
            .fetch_one(executor)
            .await?)
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            chat_item_id: ChatItemId,
        ) -> Result<Self, StoreError> {
            sqlx::query_as::<_, ChatItem>("SELECT * FROM chat_items WHERE chat_item_id = ?")
                .bind(chat_item_id)
                .fetch_optional(executor)
                .await?
                .ok_or(StoreError::ChatItemNotFound(chat_item_id))
        }

        /// Resolves the item a peer refers to by shared message id.
        ///
        /// For group chats the sender disambiguates; for direct chats the
        /// direction does.
        pub(crate) async fn load_by_shared_msg_id(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            chat_ref: ChatRef,
            sender: Option<GroupMemberId>,
            item_sent: CIDirection,
            shared_msg_id: &SharedMsgId,
        ) -> Result<Self, StoreError> {
            let (contact_id, group_id) = chat_columns(chat_ref);
            let item = match (contact_id, group_id) {
                (Some(contact_id), _) => {
                    sqlx::query_as::<_, ChatItem>(
                        "SELECT * FROM chat_items
                        WHERE user_id = ? AND contact_id = ? AND item_sent = ?
                            AND shared_msg_id = ?",
                    )
                    .bind(user_id)
                    .bind(contact_id)
                    .bind(item_sent.sent())
                    .bind(shared_msg_id)
                    .fetch_optional(executor)
                    .await?
                }
                (_, Some(group_id)) => {
                    sqlx::query_as::<_, ChatItem>(
                        "SELECT * FROM chat_items
                        WHERE user_id = ? AND group_id = ?
                            AND COALESCE(group_member_id, 0) = COALESCE(?, 0)
                            AND shared_msg_id = ?",
                    )
                    .bind(user_id)
                    .bind(group_id)
                    .bind(sender)
                    .bind(shared_msg_id)
                    .fetch_optional(executor)
                    .await?
                }
                _ => None,
            };
            item.ok_or(StoreError::ChatItemSharedMsgIdNotFound(*shared_msg_id))
        }

        pub(crate) async fn load_chat(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            chat_ref: ChatRef,
            pagination: CIPagination,
            search: Option<&str>,
        ) -> Result<Vec<Self>, StoreError> {
            let (contact_id, group_id) = chat_columns(chat_ref);
            let chat_clause = if contact_id.is_some() {
                "contact_id = ?"
            } else {
                "group_id = ?"
            };
            let chat_id = contact_id.or(group_id).unwrap_or_default();
            let search_clause = if search.is_some() {
                "AND item_text LIKE '%' || ? || '%'"
            } else {
                ""
            };
            let (cursor_clause, ascending, limit) = match pagination {
                CIPagination::Last(n) => ("", false, n),
                CIPagination::After(_, n) => ("AND chat_item_id > ?", true, n),
                CIPagination::Before(_, n) => ("AND chat_item_id < ?", false, n),
            };
            let order = if ascending { "ASC" } else { "DESC" };
            let sql = format!(
                "SELECT * FROM chat_items
                WHERE user_id = ? AND {chat_clause} {search_clause} {cursor_clause}
                ORDER BY chat_item_id {order}
                LIMIT ?"
            );
            let mut query = sqlx::query_as::<_, ChatItem>(&sql)
                .bind(user_id)
                .bind(chat_id);
            if let Some(search) = search {
                query = query.bind(search);
            }
            match pagination {
                CIPagination::After(cursor, _) | CIPagination::Before(cursor, _) => {
                    query = query.bind(cursor);
                }
                CIPagination::Last(_) => {}
            }
            let mut items = query.bind(limit).fetch_all(executor).await?;
            if !ascending {
                items.reverse();
            }
            Ok(items)
        }

        pub(crate) async fn update_content(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            content: CIContent,
            item_live: Option<bool>,
        ) -> Result<(), StoreError> {
            let content_json = serde_json::to_string(&content)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let item_text = content.text();
            sqlx::query(
                "UPDATE chat_items
                SET content = ?, item_text = ?, item_edited = 1, item_live = ?
                WHERE chat_item_id = ?",
            )
            .bind(content_json)
            .bind(&item_text)
            .bind(item_live)
            .bind(self.chat_item_id)
            .execute(executor)
            .await?;
            self.content = content;
            self.item_text = item_text;
            self.item_edited = true;
            self.item_live = item_live;
            Ok(())
        }

        /// Soft delete: the row stays, content is replaced by a marker.
        pub(crate) async fn mark_deleted(
            &mut self,
            executor: impl SqliteExecutor<'_>,
        ) -> Result<(), StoreError> {
            sqlx::query("UPDATE chat_items SET item_deleted = 1 WHERE chat_item_id = ?")
                .bind(self.chat_item_id)
                .execute(executor)
                .await?;
            self.item_deleted = true;
            Ok(())
        }

        pub(crate) async fn delete(
            executor: impl SqliteExecutor<'_>,
            chat_item_id: ChatItemId,
        ) -> Result<(), StoreError> {
            sqlx::query("DELETE FROM chat_items WHERE chat_item_id = ?")
                .bind(chat_item_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        /// Items whose timed deletion is due before `deadline`.
        pub(crate) async fn load_timed_due_before(
            executor: impl SqliteExecutor<'_>,
            deadline: DateTime<Utc>,
        ) -> Result<Vec<Self>, StoreError> {
            Ok(sqlx::query_as::<_, ChatItem>(
                "SELECT * FROM chat_items
                WHERE timed_delete_at IS NOT NULL AND timed_delete_at <= ?",
            )
            .bind(deadline)
            .fetch_all(executor)
            .await?)
        }

        /// Deletes one batch of items older than `cutoff`; returns the ids
        /// deleted.
        pub(crate) async fn delete_batch_older_than(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            cutoff: DateTime<Utc>,
            batch: i64,
        ) -> Result<Vec<ChatItemId>, StoreError> {
            Ok(sqlx::query_scalar(
                "DELETE FROM chat_items
                WHERE chat_item_id IN (
                    SELECT chat_item_id FROM chat_items
                    WHERE user_id = ? AND item_ts < ?
                    ORDER BY chat_item_id
                    LIMIT ?
                )
                RETURNING chat_item_id",
            )
            .bind(user_id)
            .bind(cutoff)
            .bind(batch)
            .fetch_all(executor)
            .await?)
        }

        pub(crate) async fn load_by_file_id(
            executor: impl SqliteExecutor<'_>,
            file_id: i64,
        ) -> Result<Option<Self>, StoreError> {
            Ok(
                sqlx::query_as::<_, ChatItem>("SELECT * FROM chat_items WHERE file_id = ?")
                    .bind(file_id)
                    .fetch_optional(executor)
                    .await?,
            )
        }

        pub(crate) async fn last_in_chat(
            executor: impl SqliteExecutor<'_>,
            user_id: UserId,
            chat_ref: ChatRef,
        ) -> Result<Option<Self>, StoreError> {
            let (contact_id, group_id) = chat_columns(chat_ref);
            let chat_clause = if contact_id.is_some() {
                "contact_id = ?"
            } else {
                "group_id = ?"
            };
            let sql = format!(
                "SELECT * FROM chat_items
                WHERE user_id = ? AND {chat_clause}
                ORDER BY chat_item_id DESC
                LIMIT 1"
            );
            Ok(sqlx::query_as::<_, ChatItem>(&sql)
                .bind(user_id)
                .bind(contact_id.or(group_id).unwrap_or_default())
                .fetch_optional(executor)
                .await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use couriercommon::profile::Profile;
    use sqlx::SqlitePool;

    use crate::{contacts::Contact, store::StoreError, users::User};

    use super::*;

    async fn direct_chat(pool: &SqlitePool) -> (User, Contact) {
        let user = User::store(pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let contact = Contact::store(pool, user.user_id, "bob", &Profile::new("bob"))
            .await
            .unwrap();
        (user, contact)
    }

    fn text_item(user_id: i64, chat_ref: ChatRef, text: &str) -> NewChatItem {
        NewChatItem {
            user_id,
            chat_ref,
            group_member_id: None,
            item_sent: CIDirection::Snd,
            item_ts: Utc::now(),
            shared_msg_id: None,
            content: CIContent::SndMsgContent {
                msg_content: MsgContent::Text(text.to_owned()),
            },
            file_id: None,
            quote: None,
            item_live: None,
            timed: None,
            created_by_msg_id: None,
        }
    }

    #[sqlx::test]
    async fn pagination_windows(pool: SqlitePool) {
        let (user, contact) = direct_chat(&pool).await;
        let chat_ref = ChatRef::Direct(contact.contact_id);
        for n in 0..10 {
            ChatItem::store(&pool, &text_item(user.user_id, chat_ref, &format!("m{n}")))
                .await
                .unwrap();
        }

        let last = ChatItem::load_chat(&pool, user.user_id, chat_ref, CIPagination::Last(3), None)
            .await
            .unwrap();
        assert_eq!(
            last.iter().map(|i| i.item_text.as_str()).collect::<Vec<_>>(),
            ["m7", "m8", "m9"]
        );

        let pivot = last[0].chat_item_id;
        let before = ChatItem::load_chat(
            &pool,
            user.user_id,
            chat_ref,
            CIPagination::Before(pivot, 2),
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            before.iter().map(|i| i.item_text.as_str()).collect::<Vec<_>>(),
            ["m5", "m6"]
        );

        let after = ChatItem::load_chat(
            &pool,
            user.user_id,
            chat_ref,
            CIPagination::After(pivot, 2),
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            after.iter().map(|i| i.item_text.as_str()).collect::<Vec<_>>(),
            ["m8", "m9"]
        );

        let found = ChatItem::load_chat(
            &pool,
            user.user_id,
            chat_ref,
            CIPagination::Last(10),
            Some("m4"),
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].item_text, "m4");
    }

    #[sqlx::test]
    async fn shared_msg_id_is_unique_per_direction(pool: SqlitePool) {
        let (user, contact) = direct_chat(&pool).await;
        let chat_ref = ChatRef::Direct(contact.contact_id);
        let shared = SharedMsgId::new([1; 16]);

        let mut item = text_item(user.user_id, chat_ref, "first");
        item.shared_msg_id = Some(shared);
        ChatItem::store(&pool, &item).await.unwrap();

        // same direction, same id: rejected by the store
        let mut dup = text_item(user.user_id, chat_ref, "second");
        dup.shared_msg_id = Some(shared);
        assert!(ChatItem::store(&pool, &dup).await.is_err());

        // opposite direction is a different namespace
        let mut rcv = text_item(user.user_id, chat_ref, "third");
        rcv.shared_msg_id = Some(shared);
        rcv.item_sent = CIDirection::Rcv;
        ChatItem::store(&pool, &rcv).await.unwrap();
    }

    #[sqlx::test]
    async fn resolve_by_shared_msg_id(pool: SqlitePool) {
        let (user, contact) = direct_chat(&pool).await;
        let chat_ref = ChatRef::Direct(contact.contact_id);
        let shared = SharedMsgId::new([2; 16]);
        let mut item = text_item(user.user_id, chat_ref, "hello");
        item.shared_msg_id = Some(shared);
        let stored = ChatItem::store(&pool, &item).await.unwrap();

        let found = ChatItem::load_by_shared_msg_id(
            &pool,
            user.user_id,
            chat_ref,
            None,
            CIDirection::Snd,
            &shared,
        )
        .await
        .unwrap();
        assert_eq!(found.chat_item_id, stored.chat_item_id);

        let missing = ChatItem::load_by_shared_msg_id(
            &pool,
            user.user_id,
            chat_ref,
            None,
            CIDirection::Rcv,
            &shared,
        )
        .await;
        assert!(matches!(
            missing,
            Err(StoreError::ChatItemSharedMsgIdNotFound(_))
        ));
    }

    #[test]
    fn chat_ref_parses() {
        assert_eq!("@42".parse::<ChatRef>().unwrap(), ChatRef::Direct(42));
        assert_eq!("#7".parse::<ChatRef>().unwrap(), ChatRef::Group(7));
        assert_eq!(
            ":3".parse::<ChatRef>().unwrap(),
            ChatRef::ContactConnection(3)
        );
        assert!("42".parse::<ChatRef>().is_err());
        assert!("@".parse::<ChatRef>().is_err());
    }
}
