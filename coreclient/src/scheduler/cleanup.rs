// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The cleanup manager.
//!
//! Scans periodically for items whose timed deletion falls within the next
//! interval and hands each to a per-item delete task. Expired items missed
//! while the process was down are picked up on the first scan.

use chrono::Duration as ChronoDuration;
use courieragentclient::AgentApi;
use tracing::error;

use crate::{chats::ChatItem, client::ChatController};

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(crate) fn start_cleanup_manager(&self) {
        let controller = self.clone();
        let interval = self.config().cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = controller.cleanup_pass().await {
                    error!(error = %err, "cleanup manager pass failed");
                }
            }
        });
        self.inner().timed_tasks.set_manager(Some(handle));
    }

    pub(crate) fn stop_cleanup_manager(&self) {
        self.inner().timed_tasks.set_manager(None);
    }

    async fn cleanup_pass(&self) -> Result<(), crate::error::ChatError> {
        let _lock = self.inner().chat_lock.hold("cleanup manager").await;
        let horizon = chrono::Utc::now()
            + ChronoDuration::from_std(self.config().cleanup_interval)
                .unwrap_or_else(|_| ChronoDuration::minutes(30));
        let due = ChatItem::load_timed_due_before(self.pool(), horizon).await?;
        for item in due {
            self.schedule_timed_item(&item);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use courieragentclient::mock::MockAgent;
    use couriercommon::{messages::MsgContent, profile::Profile};

    use crate::{
        chats::{CIContent, CIDirection, CITimed, ChatItem, ChatRef, NewChatItem},
        client::ChatController,
        config::ChatConfig,
        contacts::Contact,
        events::ChatResponse,
        store::open_memory_store,
        users::User,
    };

    #[tokio::test(start_paused = true)]
    async fn restart_picks_up_already_expired_items() {
        let pool = open_memory_store().await.unwrap();
        let user = User::store(&pool, 1, &Profile::new("alice"), true)
            .await
            .unwrap();
        let user_id = user.user_id;
        let contact = Contact::store(&pool, user_id, "bob", &Profile::new("bob"))
            .await
            .unwrap();

        // the deletion time passed while the process was down
        let stale = ChatItem::store(
            &pool,
            &NewChatItem {
                timed: Some(CITimed {
                    ttl: 60,
                    delete_at: Some(Utc::now() - ChronoDuration::seconds(30)),
                }),
                ..NewChatItem::internal(
                    user_id,
                    ChatRef::Direct(contact.contact_id),
                    CIDirection::Snd,
                    CIContent::SndMsgContent {
                        msg_content: MsgContent::Text("stale".into()),
                    },
                )
            },
        )
        .await
        .unwrap();

        let agent = MockAgent::new();
        let (controller, mut events) =
            ChatController::new(pool.clone(), agent, ChatConfig::default());
        controller.set_current_user(Some(user));
        controller.start_cleanup_manager();

        let deleted = tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                match events.recv().await {
                    Some(ChatResponse::ChatItemDeleted {
                        deleted_item,
                        timed,
                        by_user,
                        ..
                    }) => break (deleted_item, timed, by_user),
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("expired item deleted within one cleanup interval");
        assert_eq!(deleted.0.chat_item_id, stale.chat_item_id);
        assert!(deleted.1);
        assert!(!deleted.2);

        assert!(ChatItem::load(&pool, stale.chat_item_id).await.is_err());
        controller.stop_cleanup_manager();
    }
}
