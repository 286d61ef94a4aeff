// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The textual command protocol.
//!
//! Commands are ASCII lines. API forms are prefixed `/_` and take numeric
//! ids plus JSON payloads; the user-friendly aliases use display names.

use std::path::PathBuf;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use courieragentclient::{AgentProtocol, DeviceToken, NetworkConfig, NtfMode, ProtocolServer};
use couriercommon::{
    identifiers::ConnReqUri,
    messages::{CallMedia, MsgContent},
    profile::{GroupMemberRole, GroupProfile},
};
use serde::Deserialize;

use crate::{
    chats::{ChatName, ChatRef, CIPagination},
    error::CommandError,
    store::GroupId,
};

use super::{
    ChatCommand, ChatTarget, CIDeleteMode, ComposedMessage, ContactTarget, GroupTarget,
};

/// Parses one command line.
pub fn parse_command(line: &str) -> Result<ChatCommand, CommandError> {
    let line = line.trim();
    let mut cursor = Cursor::new(line);
    let head = cursor.word().ok_or_else(|| syntax("empty command"))?;
    match head {
        "/_start" => parse_start(cursor),
        "/_stop" => Ok(ChatCommand::StopChat),
        "/_app" => parse_app(cursor),
        "/_resubscribe" => {
            cursor.expect_word("all")?;
            Ok(ChatCommand::ResubscribeAll)
        }
        "/_files_folder" => Ok(ChatCommand::SetFilesFolder(PathBuf::from(
            cursor.rest_nonempty()?,
        ))),
        "/_temp_folder" => Ok(ChatCommand::SetTempFolder(PathBuf::from(
            cursor.rest_nonempty()?,
        ))),
        "/_db" => parse_db(cursor),
        "/_create" => parse_create(cursor),
        "/_user" => parse_set_user(cursor),
        "/user" => Ok(ChatCommand::ShowActiveUser),
        "/users" => Ok(ChatCommand::ListUsers),
        "/_hide" => parse_hide_unhide(cursor, true),
        "/_unhide" => parse_hide_unhide(cursor, false),
        "/_mute" => {
            cursor.expect_word("user")?;
            Ok(ChatCommand::MuteUser {
                user_id: cursor.number()?,
            })
        }
        "/_unmute" => {
            cursor.expect_word("user")?;
            Ok(ChatCommand::UnmuteUser {
                user_id: cursor.number()?,
            })
        }
        "/_profile" => Ok(ChatCommand::UpdateProfile {
            profile: json_tail(cursor)?,
        }),
        "/_get" => parse_get(cursor),
        "/_send" => parse_send(cursor),
        "/_update" => parse_update(cursor),
        "/_delete" => parse_delete(cursor),
        "/_clear" => Ok(ChatCommand::ClearChat {
            chat: ChatTarget::Ref(chat_ref(cursor.required_word()?)?),
        }),
        "/_accept" => Ok(ChatCommand::AcceptContact {
            contact_request_id: cursor.number()?,
        }),
        "/_reject" => Ok(ChatCommand::RejectContact {
            contact_request_id: cursor.number()?,
        }),
        "/_group" => parse_new_group(cursor),
        "/_group_profile" => parse_group_profile(cursor),
        "/_add" => parse_add_member(cursor),
        "/_join" => Ok(ChatCommand::JoinGroup {
            group: GroupTarget::Id(group_id(cursor.required_word()?)?),
        }),
        "/_member" => parse_member_role(cursor),
        "/_remove" => {
            let group = GroupTarget::Id(group_id(cursor.required_word()?)?);
            Ok(ChatCommand::RemoveMember {
                group,
                group_member_id: cursor.number()?,
            })
        }
        "/_leave" => Ok(ChatCommand::LeaveGroup {
            group: GroupTarget::Id(group_id(cursor.required_word()?)?),
        }),
        "/_members" => Ok(ChatCommand::ListMembers {
            group: GroupTarget::Id(group_id(cursor.required_word()?)?),
        }),
        "/groups" => Ok(ChatCommand::ListGroups),
        "/_connect" | "/c" | "/connect" => match cursor.word() {
            Some(uri) => Ok(ChatCommand::Connect {
                conn_req: ConnReqUri(uri.to_owned()),
            }),
            None => Ok(ChatCommand::AddContact),
        },
        "/_contacts" | "/contacts" => Ok(ChatCommand::ListContacts),
        "/_set" => parse_set(cursor),
        "/_info" => Ok(ChatCommand::ContactInfo {
            contact: contact_id_target(cursor.required_word()?)?,
        }),
        "/_switch" => Ok(ChatCommand::SwitchContact {
            contact: contact_id_target(cursor.required_word()?)?,
        }),
        "/_enable" => Ok(ChatCommand::EnableContact {
            contact: contact_id_target(cursor.required_word()?)?,
        }),
        "/_code" => Ok(ChatCommand::GetContactCode {
            contact: contact_id_target(cursor.required_word()?)?,
        }),
        "/_verify" => {
            let contact = contact_id_target(cursor.required_word()?)?;
            let code = cursor.rest_opt().map(str::to_owned);
            Ok(ChatCommand::VerifyContact { contact, code })
        }
        "/_settings" => parse_chat_settings(cursor),
        "/_call" => parse_call(cursor),
        "/_address" => Ok(ChatCommand::CreateMyAddress),
        "/_delete_address" | "/delete_address" => Ok(ChatCommand::DeleteMyAddress),
        "/_show_address" | "/show_address" | "/address" => Ok(ChatCommand::ShowMyAddress),
        "/_auto_accept" | "/auto_accept" => parse_auto_accept(cursor),
        "/_server" => parse_server_test(cursor),
        "/_servers" => parse_servers(cursor),
        "/_ttl" => parse_api_ttl(cursor),
        "/ttl" => parse_friendly_ttl(cursor),
        "/_network" => parse_network(cursor),
        "/_ntf" => parse_ntf(cursor),
        "/_stats" => Ok(ChatCommand::GetAgentStats),
        "/_debug" => {
            cursor.expect_word("locks")?;
            Ok(ChatCommand::DebugLocks)
        }
        // friendly aliases
        "/j" | "/join" => Ok(ChatCommand::JoinGroup {
            group: GroupTarget::Name(group_name(cursor.required_word()?)?),
        }),
        "/g" | "/group" => {
            let name = cursor.rest_nonempty()?;
            Ok(ChatCommand::NewGroup {
                profile: GroupProfile::new(name),
            })
        }
        "/a" | "/add" => parse_add_member_friendly(cursor),
        "/f" | "/file" => {
            let chat = chat_target(cursor.required_word()?)?;
            Ok(ChatCommand::SendFile {
                chat,
                path: PathBuf::from(cursor.rest_nonempty()?),
            })
        }
        "/fr" | "/freceive" => {
            let file_id = cursor.number()?;
            let path = cursor.rest_opt().map(PathBuf::from);
            Ok(ChatCommand::ReceiveFile { file_id, path })
        }
        "/fc" | "/fcancel" => Ok(ChatCommand::CancelFile {
            file_id: cursor.number()?,
        }),
        "/fs" | "/fstatus" => Ok(ChatCommand::FileStatus {
            file_id: cursor.number()?,
        }),
        "/fforward" => {
            let chat = chat_target(cursor.required_word()?)?;
            Ok(ChatCommand::ForwardFile {
                chat,
                file_id: cursor.number()?,
            })
        }
        "/d" | "/delete" => Ok(ChatCommand::DeleteChat {
            chat: chat_target(cursor.required_word()?)?,
        }),
        "/code" => Ok(ChatCommand::GetContactCode {
            contact: contact_name_target(cursor.required_word()?)?,
        }),
        "/verify" => {
            let contact = contact_name_target(cursor.required_word()?)?;
            let code = cursor.rest_opt().map(str::to_owned);
            Ok(ChatCommand::VerifyContact { contact, code })
        }
        _ => Err(syntax(format!("unknown command: {head}"))),
    }
}

fn syntax(message: impl Into<String>) -> CommandError {
    CommandError::Syntax(message.into())
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn word(&mut self) -> Option<&'a str> {
        let rest = self.rest.trim_start();
        if rest.is_empty() {
            self.rest = rest;
            return None;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (word, rest) = rest.split_at(end);
        self.rest = rest;
        Some(word)
    }

    fn peek(&self) -> Option<&'a str> {
        let rest = self.rest.trim_start();
        if rest.is_empty() {
            return None;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        Some(&rest[..end])
    }

    fn required_word(&mut self) -> Result<&'a str, CommandError> {
        self.word().ok_or_else(|| syntax("missing argument"))
    }

    fn expect_word(&mut self, expected: &str) -> Result<(), CommandError> {
        match self.word() {
            Some(word) if word == expected => Ok(()),
            Some(word) => Err(syntax(format!("expected {expected}, got {word}"))),
            None => Err(syntax(format!("expected {expected}"))),
        }
    }

    fn number<T: std::str::FromStr>(&mut self) -> Result<T, CommandError> {
        let word = self.required_word()?;
        word.parse()
            .map_err(|_| syntax(format!("invalid number: {word}")))
    }

    fn rest_opt(self) -> Option<&'a str> {
        let rest = self.rest.trim();
        (!rest.is_empty()).then_some(rest)
    }

    fn rest_nonempty(self) -> Result<&'a str, CommandError> {
        self.rest_opt().ok_or_else(|| syntax("missing argument"))
    }
}

fn on_off(value: &str) -> Result<bool, CommandError> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(syntax(format!("expected on or off, got {value}"))),
    }
}

/// Splits a `key=value` word, checking the key.
fn kv<'a>(word: &'a str, key: &str) -> Result<&'a str, CommandError> {
    word.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| syntax(format!("expected {key}=..., got {word}")))
}

fn chat_ref(word: &str) -> Result<ChatRef, CommandError> {
    word.parse().map_err(syntax)
}

fn chat_target(word: &str) -> Result<ChatTarget, CommandError> {
    if word
        .get(1..)
        .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
    {
        Ok(ChatTarget::Ref(chat_ref(word)?))
    } else {
        Ok(ChatTarget::Name(
            word.parse::<ChatName>().map_err(syntax)?,
        ))
    }
}

fn group_id(word: &str) -> Result<GroupId, CommandError> {
    match chat_ref(word)? {
        ChatRef::Group(group_id) => Ok(group_id),
        _ => Err(syntax(format!("expected group reference, got {word}"))),
    }
}

fn group_name(word: &str) -> Result<String, CommandError> {
    Ok(word.strip_prefix('#').unwrap_or(word).to_owned())
}

fn contact_id_target(word: &str) -> Result<ContactTarget, CommandError> {
    match chat_ref(word)? {
        ChatRef::Direct(contact_id) => Ok(ContactTarget::Id(contact_id)),
        _ => Err(syntax(format!("expected contact reference, got {word}"))),
    }
}

fn contact_name_target(word: &str) -> Result<ContactTarget, CommandError> {
    let name = word.strip_prefix('@').unwrap_or(word);
    if name.is_empty() {
        return Err(syntax("empty contact name"));
    }
    Ok(ContactTarget::Name(name.to_owned()))
}

fn role(word: &str) -> Result<GroupMemberRole, CommandError> {
    word.parse()
        .map_err(|_| syntax(format!("invalid role: {word}")))
}

fn json_tail<T: serde::de::DeserializeOwned>(cursor: Cursor<'_>) -> Result<T, CommandError> {
    let raw = cursor.rest_nonempty()?;
    serde_json::from_str(raw).map_err(|error| syntax(format!("invalid JSON: {error}")))
}

fn base64_arg(word: &str) -> Result<Vec<u8>, CommandError> {
    BASE64
        .decode(word)
        .map_err(|_| syntax(format!("invalid base64: {word}")))
}

fn parse_start(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let mut subscribe = true;
    let mut expire = true;
    while let Some(word) = cursor.word() {
        if let Ok(value) = kv(word, "subscribe") {
            subscribe = on_off(value)?;
        } else {
            expire = on_off(kv(word, "expire")?)?;
        }
    }
    Ok(ChatCommand::StartChat { subscribe, expire })
}

fn parse_app(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    match cursor.required_word()? {
        "activate" => Ok(ChatCommand::ActivateChat),
        "suspend" => Ok(ChatCommand::SuspendChat {
            drain_secs: cursor.number()?,
        }),
        other => Err(syntax(format!("unknown app command: {other}"))),
    }
}

fn parse_db(cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    #[derive(Deserialize)]
    struct Keys {
        #[serde(rename = "currentKey")]
        current_key: Option<String>,
        #[serde(rename = "newKey")]
        new_key: Option<String>,
    }
    let mut cursor = cursor;
    cursor.expect_word("encryption")?;
    let keys: Keys = json_tail(cursor)?;
    Ok(ChatCommand::StorageEncryption {
        current_key: keys.current_key,
        new_key: keys.new_key,
    })
}

fn parse_create(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    match cursor.required_word()? {
        "user" => Ok(ChatCommand::CreateActiveUser {
            profile: json_tail(cursor)?,
        }),
        "link" => Ok(ChatCommand::CreateGroupLink {
            group: GroupTarget::Id(group_id(cursor.required_word()?)?),
        }),
        other => Err(syntax(format!("unknown create command: {other}"))),
    }
}

fn parse_set_user(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let user_id = cursor.number()?;
    let view_pwd = cursor.rest_opt().map(str::to_owned);
    Ok(ChatCommand::SetActiveUser { user_id, view_pwd })
}

fn parse_hide_unhide(mut cursor: Cursor<'_>, hide: bool) -> Result<ChatCommand, CommandError> {
    cursor.expect_word("user")?;
    let user_id = cursor.number()?;
    let view_pwd = cursor.rest_nonempty()?.to_owned();
    Ok(if hide {
        ChatCommand::HideUser { user_id, view_pwd }
    } else {
        ChatCommand::UnhideUser { user_id, view_pwd }
    })
}

fn parse_get(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    match cursor.required_word()? {
        "chats" => Ok(ChatCommand::GetChats),
        "chat" => {
            let chat_ref = chat_ref(cursor.required_word()?)?;
            let first = cursor.required_word()?;
            let pagination = if let Ok(count) = kv(first, "count") {
                CIPagination::Last(parse_i64(count)?)
            } else if let Ok(after) = kv(first, "after") {
                let count = parse_i64(kv(cursor.required_word()?, "count")?)?;
                CIPagination::After(parse_i64(after)?, count)
            } else if let Ok(before) = kv(first, "before") {
                let count = parse_i64(kv(cursor.required_word()?, "count")?)?;
                CIPagination::Before(parse_i64(before)?, count)
            } else {
                return Err(syntax(format!("invalid pagination: {first}")));
            };
            let search = match cursor.rest_opt() {
                Some(rest) => Some(kv(rest, "search")?.to_owned()),
                None => None,
            };
            Ok(ChatCommand::GetChat {
                chat_ref,
                pagination,
                search,
            })
        }
        "link" => Ok(ChatCommand::ShowGroupLink {
            group: GroupTarget::Id(group_id(cursor.required_word()?)?),
        }),
        other => Err(syntax(format!("unknown get command: {other}"))),
    }
}

fn parse_i64(raw: &str) -> Result<i64, CommandError> {
    raw.parse()
        .map_err(|_| syntax(format!("invalid number: {raw}")))
}

/// JSON body of `/_send ... json <payload>`.
#[derive(Deserialize)]
struct ComposedMessageJson {
    #[serde(rename = "filePath")]
    file_path: Option<PathBuf>,
    #[serde(rename = "quotedItemId")]
    quoted_item_id: Option<i64>,
    #[serde(rename = "msgContent")]
    msg_content: MsgContent,
}

fn parse_send(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let chat = ChatTarget::Ref(chat_ref(cursor.required_word()?)?);
    let live = on_off(kv(cursor.required_word()?, "live")?)?;
    let ttl = match cursor.peek() {
        Some(word) if word.starts_with("ttl=") => {
            let word = cursor.word().expect("peeked");
            Some(parse_i64(kv(word, "ttl")?)?)
        }
        _ => None,
    };
    let message = match cursor.required_word()? {
        "text" => ComposedMessage::text(cursor.rest_nonempty()?),
        "json" => {
            let body: ComposedMessageJson = json_tail(cursor)?;
            ComposedMessage {
                msg_content: body.msg_content,
                file_path: body.file_path,
                quoted_item_id: body.quoted_item_id,
            }
        }
        other => return Err(syntax(format!("expected text or json, got {other}"))),
    };
    Ok(ChatCommand::SendMessage {
        chat,
        live,
        ttl,
        message,
    })
}

fn parse_update(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    cursor.expect_word("item")?;
    let chat_ref = chat_ref(cursor.required_word()?)?;
    let chat_item_id = cursor.number()?;
    let live = on_off(kv(cursor.required_word()?, "live")?)?;
    let msg_content = match cursor.required_word()? {
        "text" => MsgContent::Text(cursor.rest_nonempty()?.to_owned()),
        "json" => json_tail(cursor)?,
        other => return Err(syntax(format!("expected text or json, got {other}"))),
    };
    Ok(ChatCommand::UpdateChatItem {
        chat_ref,
        chat_item_id,
        live,
        msg_content,
    })
}

fn parse_delete(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    match cursor.peek() {
        Some("item") => {
            cursor.word();
            let chat_ref = chat_ref(cursor.required_word()?)?;
            let chat_item_id = cursor.number()?;
            let mode = match cursor.required_word()? {
                "broadcast" => CIDeleteMode::Broadcast,
                "internal" => CIDeleteMode::Internal,
                other => return Err(syntax(format!("invalid delete mode: {other}"))),
            };
            Ok(ChatCommand::DeleteChatItem {
                chat_ref,
                chat_item_id,
                mode,
            })
        }
        Some("user") => {
            cursor.word();
            let user_id = cursor.number()?;
            let view_pwd = cursor.rest_opt().map(str::to_owned);
            Ok(ChatCommand::DeleteUser { user_id, view_pwd })
        }
        Some("link") => {
            cursor.word();
            Ok(ChatCommand::DeleteGroupLink {
                group: GroupTarget::Id(group_id(cursor.required_word()?)?),
            })
        }
        Some(_) => Ok(ChatCommand::DeleteChat {
            chat: ChatTarget::Ref(chat_ref(cursor.required_word()?)?),
        }),
        None => Err(syntax("missing argument")),
    }
}

fn parse_new_group(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let _user_id: i64 = cursor.number()?;
    Ok(ChatCommand::NewGroup {
        profile: json_tail(cursor)?,
    })
}

fn parse_group_profile(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let group = GroupTarget::Id(group_id(cursor.required_word()?)?);
    Ok(ChatCommand::UpdateGroupProfile {
        group,
        profile: json_tail(cursor)?,
    })
}

fn parse_add_member(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let group = GroupTarget::Id(group_id(cursor.required_word()?)?);
    let contact = ContactTarget::Id(cursor.number()?);
    let role = role(cursor.required_word()?)?;
    Ok(ChatCommand::AddMember {
        group,
        contact,
        role,
    })
}

fn parse_add_member_friendly(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let group = GroupTarget::Name(group_name(cursor.required_word()?)?);
    let contact = contact_name_target(cursor.required_word()?)?;
    let role = match cursor.word() {
        Some(word) => role(word)?,
        None => GroupMemberRole::Member,
    };
    Ok(ChatCommand::AddMember {
        group,
        contact,
        role,
    })
}

fn parse_member_role(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    cursor.expect_word("role")?;
    let group = GroupTarget::Id(group_id(cursor.required_word()?)?);
    let group_member_id = cursor.number()?;
    let role = role(cursor.required_word()?)?;
    Ok(ChatCommand::MemberRole {
        group,
        group_member_id,
        role,
    })
}

fn contact_id(word: &str) -> Result<i64, CommandError> {
    match chat_ref(word)? {
        ChatRef::Direct(contact_id) => Ok(contact_id),
        _ => Err(syntax(format!("expected contact reference, got {word}"))),
    }
}

fn parse_set(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    match cursor.required_word()? {
        "alias" => {
            let contact_id = contact_id(cursor.required_word()?)?;
            Ok(ChatCommand::SetContactAlias {
                contact_id,
                alias: cursor.rest_opt().unwrap_or_default().to_owned(),
            })
        }
        "prefs" => {
            let contact_id = contact_id(cursor.required_word()?)?;
            Ok(ChatCommand::SetContactPrefs {
                contact_id,
                preferences: json_tail(cursor)?,
            })
        }
        other => Err(syntax(format!("unknown set command: {other}"))),
    }
}

fn parse_chat_settings(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let chat_ref = chat_ref(cursor.required_word()?)?;
    let enable = on_off(kv(cursor.required_word()?, "ntfs")?)?;
    Ok(ChatCommand::SetChatNtfs { chat_ref, enable })
}

fn parse_call(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let verb = cursor.required_word()?;
    let contact = contact_id_target(cursor.required_word()?)?;
    match verb {
        "invite" => {
            let media = match cursor.required_word()? {
                "audio" => CallMedia::Audio,
                "video" => CallMedia::Video,
                other => return Err(syntax(format!("invalid call media: {other}"))),
            };
            Ok(ChatCommand::SendCallInvitation { contact, media })
        }
        "reject" => Ok(ChatCommand::RejectCall { contact }),
        "offer" => Ok(ChatCommand::SendCallOffer {
            contact,
            offer: json_tail(cursor)?,
        }),
        "answer" => Ok(ChatCommand::SendCallAnswer {
            contact,
            answer: json_tail(cursor)?,
        }),
        "extra" => Ok(ChatCommand::SendCallExtra {
            contact,
            extra: json_tail(cursor)?,
        }),
        "end" => Ok(ChatCommand::EndCall { contact }),
        other => Err(syntax(format!("unknown call command: {other}"))),
    }
}

fn parse_auto_accept(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let enable = on_off(cursor.required_word()?)?;
    let mut incognito = false;
    let mut auto_reply = None;
    while let Some(word) = cursor.peek() {
        if word.starts_with("incognito=") {
            let word = cursor.word().expect("peeked");
            incognito = on_off(kv(word, "incognito")?)?;
        } else if word == "json" {
            cursor.word();
            auto_reply = Some(json_tail(cursor)?);
            break;
        } else {
            return Err(syntax(format!("unexpected argument: {word}")));
        }
    }
    Ok(ChatCommand::AddressAutoAccept {
        enable,
        incognito,
        auto_reply,
    })
}

fn protocol(word: &str) -> Result<AgentProtocol, CommandError> {
    match word {
        "smp" => Ok(AgentProtocol::Smp),
        "xftp" => Ok(AgentProtocol::Xftp),
        other => Err(syntax(format!("invalid protocol: {other}"))),
    }
}

fn parse_server_test(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    cursor.expect_word("test")?;
    let user_id = cursor.number()?;
    let protocol = protocol(cursor.required_word()?)?;
    let address = cursor.rest_nonempty()?.to_owned();
    Ok(ChatCommand::TestServer {
        user_id,
        server: ProtocolServer { protocol, address },
    })
}

fn parse_servers(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let user_id = cursor.number()?;
    match cursor.rest_opt() {
        None => Ok(ChatCommand::GetUserServers { user_id }),
        Some(raw) => {
            let servers = serde_json::from_str(raw)
                .map_err(|error| syntax(format!("invalid JSON: {error}")))?;
            Ok(ChatCommand::SetUserServers { user_id, servers })
        }
    }
}

fn parse_api_ttl(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    if cursor.peek() == Some("get") {
        cursor.word();
        return Ok(ChatCommand::GetChatItemTtl {
            user_id: cursor.number()?,
        });
    }
    let user_id = cursor.number()?;
    let ttl = match cursor.required_word()? {
        "none" => None,
        raw => Some(parse_i64(raw)?),
    };
    Ok(ChatCommand::SetChatItemTtl { user_id, ttl })
}

fn parse_friendly_ttl(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let ttl = match cursor.required_word()? {
        "none" => None,
        "day" => Some(86_400),
        "week" => Some(7 * 86_400),
        "month" => Some(30 * 86_400),
        other => return Err(syntax(format!("invalid ttl: {other}"))),
    };
    // applies to the active user; resolved by the dispatcher
    Ok(ChatCommand::SetChatItemTtl { user_id: 0, ttl })
}

fn parse_network(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    let first = cursor.peek().ok_or_else(|| syntax("missing argument"))?;
    if first.starts_with('{') {
        return Ok(ChatCommand::SetNetworkConfig(json_tail(cursor)?));
    }
    let mut config = NetworkConfig::default();
    while let Some(word) = cursor.word() {
        if let Ok(socks) = kv(word, "socks") {
            config.socks_proxy = match socks {
                "off" => None,
                "on" => Some("localhost:9050".to_owned()),
                host_port => Some(host_port.to_owned()),
            };
        } else if let Ok(timeout) = kv(word, "timeout") {
            config.tcp_timeout_secs = Some(
                timeout
                    .parse()
                    .map_err(|_| syntax(format!("invalid timeout: {timeout}")))?,
            );
        } else {
            config.log_tls_errors = on_off(kv(word, "log")?)?;
        }
    }
    Ok(ChatCommand::SetNetworkConfig(config))
}

fn parse_ntf(mut cursor: Cursor<'_>) -> Result<ChatCommand, CommandError> {
    match cursor.required_word()? {
        "register" => {
            let token = DeviceToken(cursor.required_word()?.to_owned());
            let mode = match cursor.required_word()? {
                "periodic" => NtfMode::Periodic,
                "instant" => NtfMode::Instant,
                other => return Err(syntax(format!("invalid notification mode: {other}"))),
            };
            Ok(ChatCommand::RegisterNtfToken { token, mode })
        }
        "verify" => {
            let token = DeviceToken(cursor.required_word()?.to_owned());
            let nonce = base64_arg(cursor.required_word()?)?;
            let code = base64_arg(cursor.required_word()?)?;
            Ok(ChatCommand::VerifyNtfToken { token, nonce, code })
        }
        "delete" => Ok(ChatCommand::DeleteNtfToken {
            token: DeviceToken(cursor.required_word()?.to_owned()),
        }),
        "message" => {
            let nonce = base64_arg(cursor.required_word()?)?;
            let enc_payload = base64_arg(cursor.required_word()?)?;
            Ok(ChatCommand::GetNtfMessage { nonce, enc_payload })
        }
        other => Err(syntax(format!("unknown ntf command: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_command() {
        assert_eq!(
            parse_command("/_start subscribe=on expire=on").unwrap(),
            ChatCommand::StartChat {
                subscribe: true,
                expire: true
            }
        );
        assert_eq!(
            parse_command("/_start subscribe=off").unwrap(),
            ChatCommand::StartChat {
                subscribe: false,
                expire: true
            }
        );
    }

    #[test]
    fn send_text() {
        let command = parse_command("/_send @42 live=off text hi there").unwrap();
        assert_eq!(
            command,
            ChatCommand::SendMessage {
                chat: ChatTarget::Ref(ChatRef::Direct(42)),
                live: false,
                ttl: None,
                message: ComposedMessage::text("hi there"),
            }
        );
    }

    #[test]
    fn send_json_with_ttl() {
        let command = parse_command(
            r#"/_send #7 live=on ttl=60 json {"msgContent":{"type":"text","text":"hello"}}"#,
        )
        .unwrap();
        let ChatCommand::SendMessage {
            chat,
            live,
            ttl,
            message,
        } = command
        else {
            panic!("expected send command");
        };
        assert_eq!(chat, ChatTarget::Ref(ChatRef::Group(7)));
        assert!(live);
        assert_eq!(ttl, Some(60));
        assert_eq!(message.msg_content, MsgContent::Text("hello".into()));
    }

    #[test]
    fn update_and_delete_item() {
        assert_eq!(
            parse_command("/_update item @42 9 live=off text hello").unwrap(),
            ChatCommand::UpdateChatItem {
                chat_ref: ChatRef::Direct(42),
                chat_item_id: 9,
                live: false,
                msg_content: MsgContent::Text("hello".into()),
            }
        );
        assert_eq!(
            parse_command("/_delete item @42 9 broadcast").unwrap(),
            ChatCommand::DeleteChatItem {
                chat_ref: ChatRef::Direct(42),
                chat_item_id: 9,
                mode: CIDeleteMode::Broadcast,
            }
        );
        assert_eq!(
            parse_command("/_delete @42").unwrap(),
            ChatCommand::DeleteChat {
                chat: ChatTarget::Ref(ChatRef::Direct(42)),
            }
        );
    }

    #[test]
    fn get_chat_pagination() {
        assert_eq!(
            parse_command("/_get chat @1 count=20").unwrap(),
            ChatCommand::GetChat {
                chat_ref: ChatRef::Direct(1),
                pagination: CIPagination::Last(20),
                search: None,
            }
        );
        assert_eq!(
            parse_command("/_get chat #2 after=100 count=10 search=hello").unwrap(),
            ChatCommand::GetChat {
                chat_ref: ChatRef::Group(2),
                pagination: CIPagination::After(100, 10),
                search: Some("hello".into()),
            }
        );
    }

    #[test]
    fn group_commands() {
        assert_eq!(
            parse_command("/_add #5 3 admin").unwrap(),
            ChatCommand::AddMember {
                group: GroupTarget::Id(5),
                contact: ContactTarget::Id(3),
                role: GroupMemberRole::Admin,
            }
        );
        assert_eq!(
            parse_command("/_member role #5 12 observer").unwrap(),
            ChatCommand::MemberRole {
                group: GroupTarget::Id(5),
                group_member_id: 12,
                role: GroupMemberRole::Observer,
            }
        );
        assert_eq!(
            parse_command("/a team bob admin").unwrap(),
            ChatCommand::AddMember {
                group: GroupTarget::Name("team".into()),
                contact: ContactTarget::Name("bob".into()),
                role: GroupMemberRole::Admin,
            }
        );
    }

    #[test]
    fn ntf_and_server_commands() {
        assert_eq!(
            parse_command("/_ntf register tok123 instant").unwrap(),
            ChatCommand::RegisterNtfToken {
                token: DeviceToken("tok123".into()),
                mode: NtfMode::Instant,
            }
        );
        let command = parse_command("/_server test 1 smp smp://host:5223#keyhash").unwrap();
        assert_eq!(
            command,
            ChatCommand::TestServer {
                user_id: 1,
                server: ProtocolServer {
                    protocol: AgentProtocol::Smp,
                    address: "smp://host:5223#keyhash".into(),
                },
            }
        );
    }

    #[test]
    fn ttl_commands() {
        assert_eq!(
            parse_command("/_ttl 1 86400").unwrap(),
            ChatCommand::SetChatItemTtl {
                user_id: 1,
                ttl: Some(86_400),
            }
        );
        assert_eq!(
            parse_command("/_ttl 1 none").unwrap(),
            ChatCommand::SetChatItemTtl {
                user_id: 1,
                ttl: None,
            }
        );
        assert_eq!(
            parse_command("/ttl week").unwrap(),
            ChatCommand::SetChatItemTtl {
                user_id: 0,
                ttl: Some(7 * 86_400),
            }
        );
    }

    #[test]
    fn network_flags() {
        let ChatCommand::SetNetworkConfig(config) =
            parse_command("/_network socks=localhost:9051 timeout=15 log=on").unwrap()
        else {
            panic!("expected network command");
        };
        assert_eq!(config.socks_proxy.as_deref(), Some("localhost:9051"));
        assert_eq!(config.tcp_timeout_secs, Some(15));
        assert!(config.log_tls_errors);
    }

    #[test]
    fn friendly_forms() {
        assert_eq!(
            parse_command("/c mock://invitation/abc").unwrap(),
            ChatCommand::Connect {
                conn_req: ConnReqUri("mock://invitation/abc".into()),
            }
        );
        assert_eq!(parse_command("/c").unwrap(), ChatCommand::AddContact);
        assert_eq!(
            parse_command("/j team").unwrap(),
            ChatCommand::JoinGroup {
                group: GroupTarget::Name("team".into()),
            }
        );
        assert_eq!(
            parse_command("/f @bob /tmp/photo.jpg").unwrap(),
            ChatCommand::SendFile {
                chat: ChatTarget::Name(ChatName::Direct("bob".into())),
                path: PathBuf::from("/tmp/photo.jpg"),
            }
        );
        assert_eq!(
            parse_command("/fr 3 /tmp/saved").unwrap(),
            ChatCommand::ReceiveFile {
                file_id: 3,
                path: Some(PathBuf::from("/tmp/saved")),
            }
        );
        assert_eq!(
            parse_command("/code @bob").unwrap(),
            ChatCommand::GetContactCode {
                contact: ContactTarget::Name("bob".into()),
            }
        );
        assert_eq!(
            parse_command("/verify @bob 12345 67890").unwrap(),
            ChatCommand::VerifyContact {
                contact: ContactTarget::Name("bob".into()),
                code: Some("12345 67890".into()),
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_command("").is_err());
        assert!(parse_command("/nope").is_err());
        assert!(parse_command("/_send 42 live=off text hi").is_err());
        assert!(parse_command("/_send @42 live=maybe text hi").is_err());
        assert!(parse_command("/_delete item @42 nine broadcast").is_err());
    }
}
