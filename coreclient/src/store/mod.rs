// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistence: pool setup, migrations and the transactional combinators.
//!
//! All multi-row mutations go through [`with_transaction`], which opens a
//! `BEGIN IMMEDIATE` transaction, commits on `Ok` and rolls back on `Err`.
//! Entity modules keep their SQL next to the entity in `mod persistence`
//! blocks.

use std::{
    path::Path,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use couriercommon::identifiers::SharedMsgId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sqlx::{
    SqlitePool, SqliteTransaction,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use thiserror::Error;
use tracing::info;

pub type UserId = i64;
pub type ContactId = i64;
pub type GroupId = i64;
pub type GroupMemberId = i64;
pub type ConnId = i64;
pub type ChatItemId = i64;
pub type MessageId = i64;
pub type FileId = i64;
pub type CmdId = i64;

/// What to do with pending migrations on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationPolicy {
    /// Fail when the database is not at the current version.
    Error,
    /// Run pending migrations forward.
    #[default]
    Yes,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate display name")]
    DuplicateName,
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("user {0} not found")]
    UserNotFoundByName(String),
    #[error("contact {0} not found")]
    ContactNotFound(ContactId),
    #[error("contact {0} not found")]
    ContactNotFoundByName(String),
    #[error("group {0} not found")]
    GroupNotFound(GroupId),
    #[error("group {0} not found")]
    GroupNotFoundByName(String),
    #[error("group member {0} not found")]
    GroupMemberNotFound(GroupMemberId),
    #[error("connection {0} not found")]
    ConnectionNotFound(String),
    #[error("chat item {0} not found")]
    ChatItemNotFound(ChatItemId),
    #[error("chat item with shared message id {0} not found")]
    ChatItemSharedMsgIdNotFound(SharedMsgId),
    #[error("quoted chat item not found")]
    QuotedChatItemNotFound,
    #[error("file {0} not found")]
    FileNotFound(FileId),
    #[error("command {0} not found")]
    CommandNotFound(String),
    #[error("contact request {0} not found")]
    ContactRequestNotFound(i64),
    #[error("user contact link not found")]
    UserContactLinkNotFound,
    #[error("duplicate contact address")]
    DuplicateContactLink,
    #[error("duplicate group link")]
    DuplicateGroupLink,
    #[error("call for contact {0} not found")]
    CallNotFound(ContactId),
    #[error("database is encrypted and the key was not accepted")]
    EncryptedDbNotOpen,
    #[error("database is behind the current schema version")]
    MigrationsPending,
    #[error("internal store error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::Internal(error.to_string())
    }
}

/// True when the error is a SQLite unique-constraint violation; call sites
/// map it to the entity-specific duplicate error.
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.is_unique_violation()
    )
}

/// Opens (and migrates) the controller database.
///
/// With a key, the database is encrypted via SQLCipher; a wrong key surfaces
/// as [`StoreError::EncryptedDbNotOpen`].
pub async fn open_store(
    path: &Path,
    key: Option<&str>,
    policy: MigrationPolicy,
) -> Result<SqlitePool, StoreError> {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let mut options =
        SqliteConnectOptions::from_str(&url).map_err(|e| StoreError::Internal(e.to_string()))?;
    if let Some(key) = key {
        options = options.pragma("key", format!("'{}'", key.replace('\'', "''")));
    }
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    // A wrong SQLCipher key fails on the first read of the schema.
    if sqlx::query_scalar::<_, i64>("SELECT count(*) FROM sqlite_master")
        .fetch_one(&pool)
        .await
        .is_err()
    {
        return Err(StoreError::EncryptedDbNotOpen);
    }

    run_migrations(&pool, policy).await?;
    Ok(pool)
}

/// In-memory database for tests and ephemeral profiles.
pub async fn open_memory_store() -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool, MigrationPolicy::Yes).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool, policy: MigrationPolicy) -> Result<(), StoreError> {
    let migrator = sqlx::migrate!("./migrations");
    match policy {
        MigrationPolicy::Yes => {
            migrator.run(pool).await?;
            info!("database migrations are up to date");
            Ok(())
        }
        MigrationPolicy::Error => {
            let applied: i64 =
                sqlx::query_scalar("SELECT count(*) FROM _sqlx_migrations WHERE success = 1")
                    .fetch_one(pool)
                    .await
                    .unwrap_or(0);
            if (applied as usize) < migrator.iter().count() {
                return Err(StoreError::MigrationsPending);
            }
            Ok(())
        }
    }
}

/// Executes a function with a transaction.
///
/// The transaction is committed if the function returns `Ok`, and rolled
/// back if the function returns `Err`.
pub(crate) async fn with_transaction<T: Send, E: From<sqlx::Error>>(
    pool: &SqlitePool,
    f: impl AsyncFnOnce(&mut SqliteTransaction<'_>) -> Result<T, E>,
) -> Result<T, E> {
    let mut txn = pool.begin_with("BEGIN IMMEDIATE").await?;
    let value = f(&mut txn).await?;
    txn.commit().await?;
    Ok(value)
}

/// Process-wide shared-message-id allocator.
///
/// Ids are an 8-byte random prefix (fresh per process, cryptographically
/// seeded) followed by a monotonically increasing 8-byte counter, so
/// concurrent sends can never collide within a conversation.
#[derive(Debug)]
pub struct SharedMsgIdAllocator {
    prefix: [u8; 8],
    counter: AtomicU64,
}

impl SharedMsgIdAllocator {
    pub fn new() -> Self {
        let mut rng = ChaCha20Rng::from_entropy();
        let mut prefix = [0u8; 8];
        rng.fill(&mut prefix);
        Self {
            prefix,
            counter: AtomicU64::new(rng.r#gen()),
        }
    }

    pub fn next_id(&self) -> SharedMsgId {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.prefix);
        bytes[8..].copy_from_slice(&count.to_be_bytes());
        SharedMsgId::new(bytes)
    }
}

impl Default for SharedMsgIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn allocator_never_repeats() {
        let allocator = SharedMsgIdAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(allocator.next_id()));
        }
    }

    #[sqlx::test]
    async fn migrations_apply(pool: SqlitePool) {
        let users: i64 = sqlx::query_scalar("SELECT count(*) FROM users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(users, 0);
    }
}
