// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background work: the cleanup manager, per-user expiration workers and
//! per-item timed-delete tasks.
//!
//! All tasks call back into the controller under the chat lock. Stopping the
//! chat cancels everything here.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use tokio::{sync::Notify, task::JoinHandle};

use crate::{chats::ChatRef, store::{ChatItemId, UserId}};

mod cleanup;
mod expiration;
mod timed_delete;

/// Per-item timed-delete tasks, keyed by chat and item.
///
/// A task removes its own entry on exit; replacing a task happens only when
/// the new deletion time differs materially from the scheduled one.
#[derive(Debug, Default)]
pub(crate) struct TimedItemTasks {
    tasks: StdMutex<HashMap<(ChatRef, ChatItemId), TimedTask>>,
    manager: StdMutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct TimedTask {
    delete_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl TimedItemTasks {
    /// Registers a task unless one with an equivalent deadline is already
    /// tracked. Returns false when the existing task stands.
    pub(crate) fn register(
        &self,
        chat_ref: ChatRef,
        item_id: ChatItemId,
        delete_at: DateTime<Utc>,
        spawn: impl FnOnce() -> JoinHandle<()>,
    ) -> bool {
        let mut tasks = self.tasks.lock().expect("timed tasks poisoned");
        if let Some(existing) = tasks.get(&(chat_ref, item_id)) {
            let drift = (existing.delete_at - delete_at).num_seconds().abs();
            if drift < 1 {
                return false;
            }
            existing.handle.abort();
        }
        tasks.insert(
            (chat_ref, item_id),
            TimedTask {
                delete_at,
                handle: spawn(),
            },
        );
        true
    }

    /// Called by a task when it finishes, and by deletes that obsolete it.
    pub(crate) fn cancel(&self, chat_ref: ChatRef, item_id: ChatItemId) {
        if let Some(task) = self
            .tasks
            .lock()
            .expect("timed tasks poisoned")
            .remove(&(chat_ref, item_id))
        {
            task.handle.abort();
        }
    }

    /// Removes the map entry without aborting; used by the task itself.
    fn forget(&self, chat_ref: ChatRef, item_id: ChatItemId) {
        self.tasks
            .lock()
            .expect("timed tasks poisoned")
            .remove(&(chat_ref, item_id));
    }

    pub(crate) fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().expect("timed tasks poisoned");
        for (_, task) in tasks.drain() {
            task.handle.abort();
        }
    }

    fn set_manager(&self, handle: Option<JoinHandle<()>>) {
        let mut manager = self.manager.lock().expect("cleanup manager poisoned");
        if let Some(previous) = manager.take() {
            previous.abort();
        }
        *manager = handle;
    }
}

/// Flag-driven per-user expiration workers.
///
/// Workers are created on first TTL-enable and paused, not destroyed, on
/// suspend.
#[derive(Debug, Default)]
pub(crate) struct ExpirationWorkers {
    workers: StdMutex<HashMap<UserId, ExpirationHandle>>,
}

#[derive(Debug)]
struct ExpirationHandle {
    enabled: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl ExpirationWorkers {
    /// Returns the control pair of an existing worker, waking it.
    fn wake(&self, user_id: UserId) -> bool {
        let workers = self.workers.lock().expect("expiration workers poisoned");
        match workers.get(&user_id) {
            Some(worker) => {
                worker.enabled.store(true, Ordering::Release);
                worker.notify.notify_one();
                true
            }
            None => false,
        }
    }

    fn insert(
        &self,
        user_id: UserId,
        enabled: Arc<AtomicBool>,
        notify: Arc<Notify>,
        handle: JoinHandle<()>,
    ) {
        self.workers
            .lock()
            .expect("expiration workers poisoned")
            .insert(
                user_id,
                ExpirationHandle {
                    enabled,
                    notify,
                    handle,
                },
            );
    }

    pub(crate) fn pause(&self, user_id: UserId) {
        if let Some(worker) = self
            .workers
            .lock()
            .expect("expiration workers poisoned")
            .get(&user_id)
        {
            worker.enabled.store(false, Ordering::Release);
        }
    }

    pub(crate) fn pause_all(&self) {
        for worker in self
            .workers
            .lock()
            .expect("expiration workers poisoned")
            .values()
        {
            worker.enabled.store(false, Ordering::Release);
        }
    }

    pub(crate) fn resume_all(&self) {
        for worker in self
            .workers
            .lock()
            .expect("expiration workers poisoned")
            .values()
        {
            worker.enabled.store(true, Ordering::Release);
            worker.notify.notify_one();
        }
    }

    pub(crate) fn remove(&self, user_id: UserId) {
        if let Some(worker) = self
            .workers
            .lock()
            .expect("expiration workers poisoned")
            .remove(&user_id)
        {
            worker.handle.abort();
        }
    }
}
