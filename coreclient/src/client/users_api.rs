// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User lifecycle and chat lifecycle commands.

use courieragentclient::AgentApi;
use couriercommon::{messages::ChatMsgEvent, profile::Profile};
use tracing::{info, warn};

use crate::{
    connections::Connection,
    contacts::Contact,
    error::{ChatError, CommandError},
    events::{ChatResponse, ContactSubStatus},
    store::{StoreError, UserId},
    users::{User, UserPwdHash},
};

use super::ChatController;

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    pub(super) async fn api_create_user(&self, profile: Profile) -> Result<ChatResponse, ChatError> {
        let user = self
            .with_transaction(async |txn| {
                let agent_user_id = User::count(txn.as_mut()).await? + 1;
                let user = User::store(txn.as_mut(), agent_user_id, &profile, false).await?;
                User::set_active(txn.as_mut(), user.user_id).await?;
                Ok::<_, StoreError>(User {
                    active_user: true,
                    ..user
                })
            })
            .await?;
        info!(user_id = user.user_id, "created user");
        self.set_current_user(Some(user.clone()));
        Ok(ChatResponse::ActiveUser(user))
    }

    pub(super) async fn api_list_users(&self) -> Result<ChatResponse, ChatError> {
        let users = User::load_all(self.pool()).await?;
        // hidden users stay out of plain listings
        let visible = users.into_iter().filter(|user| !user.hidden()).collect();
        Ok(ChatResponse::UsersList(visible))
    }

    pub(super) async fn api_set_active_user(
        &self,
        user_id: UserId,
        view_pwd: Option<String>,
    ) -> Result<ChatResponse, ChatError> {
        let user = User::load(self.pool(), user_id).await?;
        if user.hidden() {
            let pwd = view_pwd.ok_or(CommandError::WrongViewPassword)?;
            if !user.matches_view_pwd(&pwd) {
                return Err(CommandError::WrongViewPassword.into());
            }
        }
        User::set_active(self.pool(), user_id).await?;
        let user = User::load(self.pool(), user_id).await?;
        self.set_current_user(Some(user.clone()));
        Ok(ChatResponse::ActiveUser(user))
    }

    pub(super) async fn api_hide_user(
        &self,
        user_id: UserId,
        view_pwd: Option<String>,
    ) -> Result<ChatResponse, ChatError> {
        let user = User::load(self.pool(), user_id).await?;
        if user.active_user {
            return Err(CommandError::CantHideActiveUser.into());
        }
        let unhidden = User::load_all(self.pool())
            .await?
            .iter()
            .filter(|u| !u.hidden())
            .count();
        if user.view_pwd_hash.is_none() && unhidden <= 1 {
            return Err(CommandError::CantHideLastUser.into());
        }
        let pwd = view_pwd.ok_or(CommandError::WrongViewPassword)?;
        let salt: [u8; 16] = rand::random();
        let hash = UserPwdHash::new(salt.to_vec(), &pwd);
        User::update_privacy(self.pool(), user_id, user.show_ntfs, Some(&hash)).await?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_unhide_user(
        &self,
        user_id: UserId,
        view_pwd: String,
    ) -> Result<ChatResponse, ChatError> {
        let user = User::load(self.pool(), user_id).await?;
        if !user.matches_view_pwd(&view_pwd) {
            return Err(CommandError::WrongViewPassword.into());
        }
        User::update_privacy(self.pool(), user_id, user.show_ntfs, None).await?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_mute_user(
        &self,
        user_id: UserId,
        show_ntfs: bool,
    ) -> Result<ChatResponse, ChatError> {
        let user = User::load(self.pool(), user_id).await?;
        User::update_privacy(
            self.pool(),
            user_id,
            show_ntfs,
            user.view_pwd_hash.as_ref(),
        )
        .await?;
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_delete_user(
        &self,
        user_id: UserId,
        view_pwd: Option<String>,
    ) -> Result<ChatResponse, ChatError> {
        let user = User::load(self.pool(), user_id).await?;
        if user.hidden() {
            let pwd = view_pwd.ok_or(CommandError::WrongViewPassword)?;
            if !user.matches_view_pwd(&pwd) {
                return Err(CommandError::WrongViewPassword.into());
            }
        }
        if User::count(self.pool()).await? <= 1 {
            return Err(CommandError::CantDeleteLastUser.into());
        }

        // hand the user's connections to the agent for asynchronous deletion
        let connections = Connection::load_all_to_subscribe(self.pool(), user_id).await?;
        let agent_conn_ids: Vec<_> = connections
            .iter()
            .map(|conn| conn.agent_conn_id.clone())
            .collect();
        if !agent_conn_ids.is_empty() {
            if let Err(error) = self.agent().delete_connections(&agent_conn_ids).await {
                warn!(%error, "failed to delete user connections from agent");
            }
        }

        let was_active = user.active_user;
        self.with_transaction(async |txn| {
            User::delete(txn.as_mut(), user_id).await?;
            Ok::<_, StoreError>(())
        })
        .await?;
        self.inner().expiration.remove(user_id);

        if was_active {
            let remaining = User::load_all(self.pool()).await?;
            let next = remaining.iter().find(|u| !u.hidden()).or(remaining.first());
            match next {
                Some(next) => {
                    User::set_active(self.pool(), next.user_id).await?;
                    let next = User::load(self.pool(), next.user_id).await?;
                    self.set_current_user(Some(next));
                }
                None => self.set_current_user(None),
            }
        }
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_update_profile(
        &self,
        profile: Profile,
    ) -> Result<ChatResponse, ChatError> {
        let user = self.current_user()?;
        User::update_profile(self.pool(), user.user_id, &profile).await?;
        let user = User::load(self.pool(), user.user_id).await?;
        self.set_current_user(Some(user.clone()));

        // announce the new profile to every connected contact
        let contacts = Contact::load_all(self.pool(), user.user_id).await?;
        for contact in contacts {
            let Some(connection) = Connection::load_for_contact(self.pool(), contact.contact_id)
                .await?
            else {
                continue;
            };
            if !connection.conn_status.snd_usable() || connection.incognito() {
                continue;
            }
            let profile = profile.clone();
            let result = async {
                let (message, body) = self
                    .create_snd_message(user.user_id, |_| ChatMsgEvent::Info(profile))
                    .await?;
                self.deliver_message(&connection, &message, body).await
            }
            .await;
            if let Err(error) = result {
                warn!(contact_id = contact.contact_id, %error, "failed to send profile update");
            }
        }
        Ok(ChatResponse::ActiveUser(user))
    }

    pub(super) async fn api_start_chat(
        &self,
        subscribe: bool,
        expire: bool,
    ) -> Result<ChatResponse, ChatError> {
        if self.is_running() {
            return Ok(ChatResponse::ChatStarted);
        }
        if let Some(active) = User::load_active(self.pool()).await? {
            self.set_current_user(Some(active));
        }
        self.set_running(true);

        if subscribe {
            let statuses = self.subscribe_all_connections().await?;
            self.emit(ChatResponse::ContactSubSummary(statuses)).await;
        }
        self.start_cleanup_manager();
        if expire {
            self.start_expiration_workers().await?;
        }
        info!("chat started");
        Ok(ChatResponse::ChatStarted)
    }

    pub(super) async fn api_stop_chat(&self) -> Result<ChatResponse, ChatError> {
        self.set_running(false);
        self.inner().timed_tasks.cancel_all();
        self.inner().expiration.pause_all();
        self.stop_cleanup_manager();
        self.inner().snd_file_handles.close_all();
        self.inner().rcv_file_handles.close_all();
        if let Err(error) = self.agent().disconnect_agent_client().await {
            warn!(%error, "agent disconnect failed");
        }
        info!("chat stopped");
        Ok(ChatResponse::ChatStopped)
    }

    pub(super) async fn api_activate_chat(&self) -> Result<ChatResponse, ChatError> {
        self.agent().activate_agent().await?;
        self.inner().expiration.resume_all();
        Ok(ChatResponse::CmdOk)
    }

    pub(super) async fn api_suspend_chat(
        &self,
        drain_secs: u64,
    ) -> Result<ChatResponse, ChatError> {
        self.inner().expiration.pause_all();
        self.agent().suspend_agent(drain_secs).await?;
        Ok(ChatResponse::ChatSuspended)
    }

    pub(super) async fn api_resubscribe_all(&self) -> Result<ChatResponse, ChatError> {
        let statuses = self.subscribe_all_connections().await?;
        Ok(ChatResponse::ContactSubSummary(statuses))
    }

    pub(super) async fn api_storage_encryption(
        &self,
        _current_key: Option<String>,
        new_key: Option<String>,
    ) -> Result<ChatResponse, ChatError> {
        let new_key = new_key.unwrap_or_default().replace('\'', "''");
        sqlx::query(&format!("PRAGMA rekey = '{new_key}'"))
            .execute(self.pool())
            .await
            .map_err(StoreError::from)?;
        Ok(ChatResponse::CmdOk)
    }

    async fn subscribe_all_connections(&self) -> Result<Vec<ContactSubStatus>, ChatError> {
        let user = self.current_user()?;
        let connections = Connection::load_all_to_subscribe(self.pool(), user.user_id).await?;
        if connections.is_empty() {
            return Ok(Vec::new());
        }
        let conn_ids: Vec<_> = connections
            .iter()
            .map(|conn| conn.agent_conn_id.clone())
            .collect();
        let results = self.agent().subscribe_connections(conn_ids).await?;
        let mut statuses = Vec::new();
        for connection in &connections {
            let Some(contact_id) = connection.contact_id else {
                continue;
            };
            let error = results
                .get(&connection.agent_conn_id)
                .and_then(|result| result.as_ref().err())
                .map(ToString::to_string);
            statuses.push(ContactSubStatus { contact_id, error });
        }
        Ok(statuses)
    }
}
