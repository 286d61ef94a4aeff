// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The chat controller.
//!
//! Every command and every agent event runs under a single serializing chat
//! lock; store transactions and agent calls suspend inside the critical
//! section. Commands return exactly one [`ChatResponse`]; asynchronous
//! notifications go to the view channel.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use courieragentclient::{AgentApi, MsgFlags, NetworkConfig};
use couriercommon::{
    identifiers::{CorrId, SharedMsgId},
    messages::{ChatMessage, ChatMsgEvent},
};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tracing::debug;

use crate::{
    calls::Call,
    chats::{ChatName, ChatRef},
    commands::{ChatCommand, ChatTarget, ContactTarget, GroupTarget, parser::parse_command},
    config::ChatConfig,
    connections::Connection,
    contacts::Contact,
    error::{ChatError, CommandError},
    events::{ChatEventSender, ChatResponse},
    files::engine::FileHandleCache,
    groups::Group,
    messages::{Message, MsgDelivery},
    scheduler::{ExpirationWorkers, TimedItemTasks},
    store::{self, ContactId, SharedMsgIdAllocator, StoreError, UserId},
    users::User,
};

mod address_api;
mod calls_api;
mod contacts_api;
mod files_api;
mod groups_api;
mod messaging_api;
pub mod process;
mod settings_api;
mod users_api;

/// The serializing chat lock, labelled for `/_debug locks`.
#[derive(Debug, Default)]
pub(crate) struct ChatLock {
    mutex: Mutex<()>,
    label: StdMutex<Option<String>>,
}

pub(crate) struct ChatLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    label: &'a StdMutex<Option<String>>,
}

impl ChatLock {
    pub(crate) async fn hold(&self, label: &str) -> ChatLockGuard<'_> {
        let guard = self.mutex.lock().await;
        *self.label.lock().expect("lock label poisoned") = Some(label.to_owned());
        ChatLockGuard {
            _guard: guard,
            label: &self.label,
        }
    }

    pub(crate) fn current_label(&self) -> Option<String> {
        self.label.lock().expect("lock label poisoned").clone()
    }
}

impl Drop for ChatLockGuard<'_> {
    fn drop(&mut self) {
        *self.label.lock().expect("lock label poisoned") = None;
    }
}

pub struct ChatController<A> {
    inner: Arc<ChatControllerInner<A>>,
}

impl<A> Clone for ChatController<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct ChatControllerInner<A> {
    pub(crate) pool: SqlitePool,
    pub(crate) agent: A,
    pub(crate) config: ChatConfig,
    pub(crate) chat_lock: ChatLock,
    pub(crate) current_user: StdRwLock<Option<User>>,
    pub(crate) events: ChatEventSender,
    pub(crate) msg_id_alloc: SharedMsgIdAllocator,
    pub(crate) calls: StdMutex<HashMap<ContactId, Call>>,
    pub(crate) snd_file_handles: FileHandleCache,
    pub(crate) rcv_file_handles: FileHandleCache,
    pub(crate) files_folder: StdMutex<Option<PathBuf>>,
    pub(crate) temp_dir: StdMutex<Option<PathBuf>>,
    pub(crate) network_config: StdMutex<NetworkConfig>,
    pub(crate) running: AtomicBool,
    pub(crate) timed_tasks: TimedItemTasks,
    pub(crate) expiration: ExpirationWorkers,
}

impl<A> ChatController<A>
where
    A: AgentApi + Send + Sync + 'static,
{
    /// Creates a controller over an open store and an agent; returns the
    /// view-event receiver alongside.
    pub fn new(
        pool: SqlitePool,
        agent: A,
        config: ChatConfig,
    ) -> (Self, mpsc::Receiver<ChatResponse>) {
        let (events, events_rx) = ChatEventSender::channel(config.tbq_size);
        let files_folder = StdMutex::new(config.files_folder.clone());
        let temp_dir = StdMutex::new(config.temp_dir.clone());
        let controller = Self {
            inner: Arc::new(ChatControllerInner {
                pool,
                agent,
                config,
                chat_lock: ChatLock::default(),
                current_user: StdRwLock::new(None),
                events,
                msg_id_alloc: SharedMsgIdAllocator::new(),
                calls: StdMutex::new(HashMap::new()),
                snd_file_handles: FileHandleCache::new(),
                rcv_file_handles: FileHandleCache::new(),
                files_folder,
                temp_dir,
                network_config: StdMutex::new(NetworkConfig::default()),
                running: AtomicBool::new(false),
                timed_tasks: TimedItemTasks::default(),
                expiration: ExpirationWorkers::default(),
            }),
        };
        (controller, events_rx)
    }

    pub(crate) fn inner(&self) -> &ChatControllerInner<A> {
        &self.inner
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub(crate) fn agent(&self) -> &A {
        &self.inner.agent
    }

    pub(crate) fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::Release);
    }

    /// Parses and executes one line of the textual protocol.
    pub async fn process_text(&self, line: &str) -> Result<ChatResponse, ChatError> {
        let command = parse_command(line)?;
        self.process_command(command).await
    }

    /// Executes a command under the chat lock and returns its single
    /// response. Errors are returned to the caller, not put on the view
    /// channel.
    pub async fn process_command(&self, command: ChatCommand) -> Result<ChatResponse, ChatError> {
        let _lock = self
            .inner
            .chat_lock
            .hold(&format!("command {}", command_label(&command)))
            .await;
        debug!(command = command_label(&command), "executing command");
        self.dispatch_command(command).await
    }

    async fn dispatch_command(&self, command: ChatCommand) -> Result<ChatResponse, ChatError> {
        use ChatCommand::*;
        match command {
            StartChat { subscribe, expire } => self.api_start_chat(subscribe, expire).await,
            StopChat => self.api_stop_chat().await,
            ActivateChat => self.api_activate_chat().await,
            SuspendChat { drain_secs } => self.api_suspend_chat(drain_secs).await,
            ResubscribeAll => self.api_resubscribe_all().await,
            SetFilesFolder(path) => {
                *self.inner.files_folder.lock().expect("files folder poisoned") = Some(path);
                Ok(ChatResponse::CmdOk)
            }
            SetTempFolder(path) => {
                *self.inner.temp_dir.lock().expect("temp dir poisoned") = Some(path);
                Ok(ChatResponse::CmdOk)
            }
            StorageEncryption {
                current_key,
                new_key,
            } => self.api_storage_encryption(current_key, new_key).await,

            CreateActiveUser { profile } => self.api_create_user(profile).await,
            ListUsers => self.api_list_users().await,
            ShowActiveUser => self.current_user().map(ChatResponse::ActiveUser),
            SetActiveUser { user_id, view_pwd } => {
                self.api_set_active_user(user_id, view_pwd).await
            }
            HideUser { user_id, view_pwd } => self.api_hide_user(user_id, Some(view_pwd)).await,
            UnhideUser { user_id, view_pwd } => self.api_unhide_user(user_id, view_pwd).await,
            MuteUser { user_id } => self.api_mute_user(user_id, false).await,
            UnmuteUser { user_id } => self.api_mute_user(user_id, true).await,
            DeleteUser { user_id, view_pwd } => self.api_delete_user(user_id, view_pwd).await,
            UpdateProfile { profile } => self.api_update_profile(profile).await,

            GetChats => self.api_get_chats().await,
            GetChat {
                chat_ref,
                pagination,
                search,
            } => self.api_get_chat(chat_ref, pagination, search).await,

            SendMessage {
                chat,
                live,
                ttl,
                message,
            } => {
                let chat_ref = self.resolve_chat(chat).await?;
                self.api_send_message(chat_ref, live, ttl, message).await
            }
            UpdateChatItem {
                chat_ref,
                chat_item_id,
                live,
                msg_content,
            } => {
                self.api_update_chat_item(chat_ref, chat_item_id, live, msg_content)
                    .await
            }
            DeleteChatItem {
                chat_ref,
                chat_item_id,
                mode,
            } => self.api_delete_chat_item(chat_ref, chat_item_id, mode).await,

            NewGroup { profile } => self.api_new_group(profile).await,
            AddMember {
                group,
                contact,
                role,
            } => {
                let group = self.resolve_group(group).await?;
                let contact = self.resolve_contact(contact).await?;
                self.api_add_member(group, contact, role).await
            }
            JoinGroup { group } => {
                let group = self.resolve_group(group).await?;
                self.api_join_group(group).await
            }
            MemberRole {
                group,
                group_member_id,
                role,
            } => {
                let group = self.resolve_group(group).await?;
                self.api_member_role(group, group_member_id, role).await
            }
            RemoveMember {
                group,
                group_member_id,
            } => {
                let group = self.resolve_group(group).await?;
                self.api_remove_member(group, group_member_id).await
            }
            LeaveGroup { group } => {
                let group = self.resolve_group(group).await?;
                self.api_leave_group(group).await
            }
            ListMembers { group } => {
                let group = self.resolve_group(group).await?;
                self.api_list_members(group).await
            }
            ListGroups => self.api_list_groups().await,
            UpdateGroupProfile { group, profile } => {
                let group = self.resolve_group(group).await?;
                self.api_update_group_profile(group, profile).await
            }
            CreateGroupLink { group } => {
                let group = self.resolve_group(group).await?;
                self.api_create_group_link(group).await
            }
            DeleteGroupLink { group } => {
                let group = self.resolve_group(group).await?;
                self.api_delete_group_link(group).await
            }
            ShowGroupLink { group } => {
                let group = self.resolve_group(group).await?;
                self.api_show_group_link(group).await
            }

            AddContact => self.api_add_contact().await,
            Connect { conn_req } => self.api_connect(conn_req).await,
            AcceptContact { contact_request_id } => {
                self.api_accept_contact(contact_request_id).await
            }
            RejectContact { contact_request_id } => {
                self.api_reject_contact(contact_request_id).await
            }
            ListContacts => self.api_list_contacts().await,
            DeleteChat { chat } => {
                let chat_ref = self.resolve_chat(chat).await?;
                self.api_delete_chat(chat_ref).await
            }
            ClearChat { chat } => {
                let chat_ref = self.resolve_chat(chat).await?;
                self.api_clear_chat(chat_ref).await
            }
            SetContactAlias { contact_id, alias } => {
                self.api_set_contact_alias(contact_id, alias).await
            }
            SetContactPrefs {
                contact_id,
                preferences,
            } => self.api_set_contact_prefs(contact_id, preferences).await,
            ContactInfo { contact } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_contact_info(contact).await
            }
            GetContactCode { contact } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_get_contact_code(contact).await
            }
            VerifyContact { contact, code } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_verify_contact(contact, code).await
            }
            EnableContact { contact } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_enable_contact(contact).await
            }
            SwitchContact { contact } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_switch_contact(contact).await
            }
            SetChatNtfs { chat_ref, enable } => self.api_set_chat_ntfs(chat_ref, enable).await,

            SendFile { chat, path } => {
                let chat_ref = self.resolve_chat(chat).await?;
                self.api_send_file(chat_ref, path).await
            }
            ReceiveFile { file_id, path } => self.api_receive_file(file_id, path).await,
            CancelFile { file_id } => self.api_cancel_file(file_id).await,
            FileStatus { file_id } => self.api_file_status(file_id).await,
            ForwardFile { chat, file_id } => {
                let chat_ref = self.resolve_chat(chat).await?;
                self.api_forward_file(chat_ref, file_id).await
            }

            SendCallInvitation { contact, media } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_send_call_invitation(contact, media).await
            }
            RejectCall { contact } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_reject_call(contact).await
            }
            SendCallOffer { contact, offer } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_send_call_offer(contact, offer).await
            }
            SendCallAnswer { contact, answer } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_send_call_answer(contact, answer).await
            }
            SendCallExtra { contact, extra } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_send_call_extra(contact, extra).await
            }
            EndCall { contact } => {
                let contact = self.resolve_contact(contact).await?;
                self.api_end_call(contact).await
            }

            CreateMyAddress => self.api_create_my_address().await,
            DeleteMyAddress => self.api_delete_my_address().await,
            ShowMyAddress => self.api_show_my_address().await,
            AddressAutoAccept {
                enable,
                incognito,
                auto_reply,
            } => self.api_address_auto_accept(enable, incognito, auto_reply).await,

            GetUserServers { user_id } => self.api_get_user_servers(user_id).await,
            SetUserServers { user_id, servers } => {
                self.api_set_user_servers(user_id, servers).await
            }
            TestServer { user_id, server } => self.api_test_server(user_id, server).await,
            SetChatItemTtl { user_id, ttl } => self.api_set_chat_item_ttl(user_id, ttl).await,
            GetChatItemTtl { user_id } => self.api_get_chat_item_ttl(user_id).await,
            SetNetworkConfig(config) => self.api_set_network_config(config).await,
            GetNetworkConfig => self.api_get_network_config().await,

            RegisterNtfToken { token, mode } => self.api_register_ntf_token(token, mode).await,
            VerifyNtfToken { token, nonce, code } => {
                self.api_verify_ntf_token(token, nonce, code).await
            }
            DeleteNtfToken { token } => self.api_delete_ntf_token(token).await,
            GetNtfMessage { nonce, enc_payload } => {
                self.api_get_ntf_message(nonce, enc_payload).await
            }

            GetAgentStats => Ok(ChatResponse::AgentStats(
                self.agent().get_agent_stats().await?,
            )),
            DebugLocks => {
                let agent_locks = self.agent().debug_agent_locks().await?;
                Ok(ChatResponse::DebugLocks {
                    chat_lock: self.inner.chat_lock.current_label(),
                    agent_locks,
                })
            }
        }
    }

    // shared helpers

    pub(crate) fn current_user(&self) -> Result<User, ChatError> {
        self.inner
            .current_user
            .read()
            .expect("current user poisoned")
            .clone()
            .ok_or(CommandError::NoActiveUser.into())
    }

    pub(crate) fn set_current_user(&self, user: Option<User>) {
        *self
            .inner
            .current_user
            .write()
            .expect("current user poisoned") = user;
    }

    pub(crate) async fn emit(&self, response: ChatResponse) {
        self.inner.events.emit(response).await;
    }

    pub(crate) async fn with_transaction<T: Send, E: From<sqlx::Error>>(
        &self,
        f: impl AsyncFnOnce(&mut sqlx::SqliteTransaction<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        store::with_transaction(&self.inner.pool, f).await
    }

    pub(crate) fn files_folder(&self) -> Option<PathBuf> {
        self.inner
            .files_folder
            .lock()
            .expect("files folder poisoned")
            .clone()
    }

    // target resolution

    pub(crate) async fn resolve_contact(
        &self,
        target: ContactTarget,
    ) -> Result<Contact, ChatError> {
        let user = self.current_user()?;
        let contact = match target {
            ContactTarget::Id(contact_id) => Contact::load(&self.inner.pool, contact_id).await?,
            ContactTarget::Name(name) => {
                Contact::load_by_name(&self.inner.pool, user.user_id, &name).await?
            }
        };
        Ok(contact)
    }

    pub(crate) async fn resolve_group(&self, target: GroupTarget) -> Result<Group, ChatError> {
        let user = self.current_user()?;
        let group = match target {
            GroupTarget::Id(group_id) => Group::load(&self.inner.pool, group_id).await?,
            GroupTarget::Name(name) => {
                Group::load_by_name(&self.inner.pool, user.user_id, &name).await?
            }
        };
        Ok(group)
    }

    pub(crate) async fn resolve_chat(&self, target: ChatTarget) -> Result<ChatRef, ChatError> {
        match target {
            ChatTarget::Ref(chat_ref) => Ok(chat_ref),
            ChatTarget::Name(ChatName::Direct(name)) => {
                let contact = self.resolve_contact(ContactTarget::Name(name)).await?;
                Ok(ChatRef::Direct(contact.contact_id))
            }
            ChatTarget::Name(ChatName::Group(name)) => {
                let group = self.resolve_group(GroupTarget::Name(name)).await?;
                Ok(ChatRef::Group(group.group_id))
            }
        }
    }

    /// Atomically reserves a shared message id, encodes the event produced
    /// for it and records the message row.
    pub(crate) async fn create_snd_message(
        &self,
        user_id: UserId,
        make_event: impl FnOnce(SharedMsgId) -> ChatMsgEvent + Send,
    ) -> Result<(Message, Vec<u8>), ChatError> {
        let shared_msg_id = self.inner.msg_id_alloc.next_id();
        let event = make_event(shared_msg_id);
        let chat_message = ChatMessage::new(Some(shared_msg_id), event);
        let body = chat_message.encode(false)?;
        let tag = chat_message.event.tag().to_owned();
        let message = self
            .with_transaction(async |txn| {
                Message::store(
                    txn.as_mut(),
                    user_id,
                    true,
                    &tag,
                    &body,
                    Some(shared_msg_id),
                )
                .await
            })
            .await?;
        Ok((message, body))
    }

    /// Sends an encoded message on a connection and records the delivery.
    pub(crate) async fn deliver_message(
        &self,
        connection: &Connection,
        message: &Message,
        body: Vec<u8>,
    ) -> Result<i64, ChatError> {
        let flags = MsgFlags { notification: true };
        let agent_msg_id = self
            .agent()
            .send_message(&connection.agent_conn_id, flags, body)
            .await?;
        MsgDelivery::store(
            &self.inner.pool,
            message.message_id,
            connection.conn_id,
            agent_msg_id,
        )
        .await?;
        Ok(agent_msg_id)
    }

    /// Creates a pending Command row and hands its id back as the agent
    /// correlation id.
    pub(crate) async fn reserve_corr_id(
        &self,
        user_id: Option<UserId>,
        connection_id: Option<i64>,
        command_tag: &str,
    ) -> Result<CorrId, ChatError> {
        let cmd_id: i64 = sqlx::query_scalar(
            "INSERT INTO commands (user_id, connection_id, command_tag, command_status, created_at)
            VALUES (?, ?, ?, 'pending', ?)
            RETURNING command_id",
        )
        .bind(user_id)
        .bind(connection_id)
        .bind(command_tag)
        .bind(chrono::Utc::now())
        .fetch_one(&self.inner.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(CorrId::from_cmd_id(cmd_id))
    }

    /// Completion of a correlated command deletes its row.
    pub(crate) async fn complete_command(&self, corr_id: &CorrId) -> Result<(), ChatError> {
        if let Some(cmd_id) = corr_id.cmd_id() {
            sqlx::query("DELETE FROM commands WHERE command_id = ?")
                .bind(cmd_id)
                .execute(&self.inner.pool)
                .await
                .map_err(StoreError::from)?;
        }
        Ok(())
    }
}

fn command_label(command: &ChatCommand) -> &'static str {
    use ChatCommand::*;
    match command {
        StartChat { .. } => "start",
        StopChat => "stop",
        ActivateChat => "activate",
        SuspendChat { .. } => "suspend",
        ResubscribeAll => "resubscribe",
        SetFilesFolder(_) => "files_folder",
        SetTempFolder(_) => "temp_folder",
        StorageEncryption { .. } => "db_encryption",
        CreateActiveUser { .. } => "create_user",
        ListUsers => "list_users",
        ShowActiveUser => "show_user",
        SetActiveUser { .. } => "set_user",
        HideUser { .. } => "hide_user",
        UnhideUser { .. } => "unhide_user",
        MuteUser { .. } => "mute_user",
        UnmuteUser { .. } => "unmute_user",
        DeleteUser { .. } => "delete_user",
        UpdateProfile { .. } => "update_profile",
        GetChats => "get_chats",
        GetChat { .. } => "get_chat",
        SendMessage { .. } => "send",
        UpdateChatItem { .. } => "update_item",
        DeleteChatItem { .. } => "delete_item",
        NewGroup { .. } => "new_group",
        AddMember { .. } => "add_member",
        JoinGroup { .. } => "join_group",
        MemberRole { .. } => "member_role",
        RemoveMember { .. } => "remove_member",
        LeaveGroup { .. } => "leave_group",
        ListMembers { .. } => "list_members",
        ListGroups => "list_groups",
        UpdateGroupProfile { .. } => "group_profile",
        CreateGroupLink { .. } => "create_link",
        DeleteGroupLink { .. } => "delete_link",
        ShowGroupLink { .. } => "show_link",
        AddContact => "add_contact",
        Connect { .. } => "connect",
        AcceptContact { .. } => "accept",
        RejectContact { .. } => "reject",
        ListContacts => "contacts",
        DeleteChat { .. } => "delete_chat",
        ClearChat { .. } => "clear_chat",
        SetContactAlias { .. } => "alias",
        SetContactPrefs { .. } => "prefs",
        ContactInfo { .. } => "info",
        GetContactCode { .. } => "code",
        VerifyContact { .. } => "verify",
        EnableContact { .. } => "enable",
        SwitchContact { .. } => "switch",
        SetChatNtfs { .. } => "chat_ntfs",
        SendFile { .. } => "send_file",
        ReceiveFile { .. } => "receive_file",
        CancelFile { .. } => "cancel_file",
        FileStatus { .. } => "file_status",
        ForwardFile { .. } => "forward_file",
        SendCallInvitation { .. } => "call_invite",
        RejectCall { .. } => "call_reject",
        SendCallOffer { .. } => "call_offer",
        SendCallAnswer { .. } => "call_answer",
        SendCallExtra { .. } => "call_extra",
        EndCall { .. } => "call_end",
        CreateMyAddress => "address",
        DeleteMyAddress => "delete_address",
        ShowMyAddress => "show_address",
        AddressAutoAccept { .. } => "auto_accept",
        GetUserServers { .. } => "get_servers",
        SetUserServers { .. } => "set_servers",
        TestServer { .. } => "test_server",
        SetChatItemTtl { .. } => "set_ttl",
        GetChatItemTtl { .. } => "get_ttl",
        SetNetworkConfig(_) => "set_network",
        GetNetworkConfig => "get_network",
        RegisterNtfToken { .. } => "ntf_register",
        VerifyNtfToken { .. } => "ntf_verify",
        DeleteNtfToken { .. } => "ntf_delete",
        GetNtfMessage { .. } => "ntf_message",
        GetAgentStats => "stats",
        DebugLocks => "debug_locks",
    }
}
