// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-user expiration workers.
//!
//! A worker deletes items older than the user's TTL in batches, yielding
//! between batches so it never starves commands. The worker parks on its
//! flag when paused or when there is nothing left to delete.

use std::sync::{Arc, atomic::AtomicBool, atomic::Ordering};

use chrono::{Duration as ChronoDuration, Utc};
use courieragentclient::AgentApi;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::{chats::ChatItem, client::ChatController, store::UserId, users::User};

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    /// Starts workers for every user with a TTL configured.
    pub(crate) async fn start_expiration_workers(&self) -> Result<(), crate::error::ChatError> {
        for user in User::load_all(self.pool()).await? {
            if user.chat_item_ttl.is_some() {
                self.ensure_expiration_worker(user.user_id).await;
            }
        }
        Ok(())
    }

    /// Creates the worker on first TTL-enable; afterwards just wakes it.
    pub(crate) async fn ensure_expiration_worker(&self, user_id: UserId) {
        if self.inner().expiration.wake(user_id) {
            return;
        }
        let enabled = Arc::new(AtomicBool::new(true));
        let notify = Arc::new(Notify::new());
        let controller = self.clone();
        let worker_enabled = enabled.clone();
        let worker_notify = notify.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !worker_enabled.load(Ordering::Acquire) {
                    worker_notify.notified().await;
                    continue;
                }
                match controller.expire_batch(user_id).await {
                    Ok(deleted) if deleted > 0 => {
                        // yield between batches
                        tokio::time::sleep(controller.config().expire_yield).await;
                    }
                    Ok(_) => {
                        tokio::select! {
                            _ = worker_notify.notified() => {}
                            _ = tokio::time::sleep(controller.config().cleanup_interval) => {}
                        }
                    }
                    Err(err) => {
                        error!(user_id, error = %err, "expiration batch failed");
                        tokio::select! {
                            _ = worker_notify.notified() => {}
                            _ = tokio::time::sleep(controller.config().cleanup_interval) => {}
                        }
                    }
                }
            }
        });
        self.inner()
            .expiration
            .insert(user_id, enabled, notify, handle);
    }

    async fn expire_batch(&self, user_id: UserId) -> Result<usize, crate::error::ChatError> {
        let _lock = self.inner().chat_lock.hold("expire chat items").await;
        let user = User::load(self.pool(), user_id).await?;
        let Some(ttl) = user.chat_item_ttl else {
            self.inner().expiration.pause(user_id);
            return Ok(0);
        };
        let cutoff = Utc::now() - ChronoDuration::seconds(ttl);
        let deleted = ChatItem::delete_batch_older_than(
            self.pool(),
            user_id,
            cutoff,
            self.config().expire_batch_size,
        )
        .await?;
        if !deleted.is_empty() {
            debug!(user_id, count = deleted.len(), "expired chat items");
        }
        Ok(deleted.len())
    }
}
