// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-item timed deletion.

use chrono::Utc;
use courieragentclient::AgentApi;
use tracing::{debug, error};

use crate::{
    chats::{ChatItem, ChatRef},
    client::ChatController,
    events::ChatResponse,
    store::ChatItemId,
};

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    /// Starts (or keeps) the deletion task of a timed item.
    ///
    /// An already scheduled task stands unless the new deletion time is
    /// materially different.
    pub(crate) fn schedule_timed_item(&self, item: &ChatItem) {
        let Some(delete_at) = item.timed.and_then(|timed| timed.delete_at) else {
            return;
        };
        let chat_ref = item.chat_ref();
        let chat_item_id = item.chat_item_id;
        let controller = self.clone();
        self.inner()
            .timed_tasks
            .register(chat_ref, chat_item_id, delete_at, move || {
                tokio::spawn(async move {
                    let wait = (delete_at - Utc::now())
                        .to_std()
                        .unwrap_or_default();
                    tokio::time::sleep(wait).await;
                    if let Err(err) = controller.delete_timed_item(chat_ref, chat_item_id).await
                    {
                        error!(chat_item_id, error = %err, "timed delete failed");
                    }
                    controller
                        .inner()
                        .timed_tasks
                        .forget(chat_ref, chat_item_id);
                })
            });
    }

    async fn delete_timed_item(
        &self,
        chat_ref: ChatRef,
        chat_item_id: ChatItemId,
    ) -> Result<(), crate::error::ChatError> {
        let _lock = self.inner().chat_lock.hold("timed delete").await;
        let item = match ChatItem::load(self.pool(), chat_item_id).await {
            Ok(item) => item,
            Err(_) => {
                // already gone, e.g. the user deleted it first
                debug!(chat_item_id, "timed item already deleted");
                return Ok(());
            }
        };
        ChatItem::delete(self.pool(), chat_item_id).await?;
        debug!(chat_item_id, %chat_ref, "deleted timed item");
        self.emit(ChatResponse::ChatItemDeleted {
            deleted_item: item,
            to_item: None,
            by_user: false,
            timed: true,
        })
        .await;
        Ok(())
    }
}
