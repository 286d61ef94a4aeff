// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The two wire encodings of [`ChatMessage`].
//!
//! JSON carries every event except inline file chunks:
//! `{ "msgId"?: <base64>, "event": <tag>, "params": <object> }`. Decoding is
//! table-driven on the tag; unrecognized tags decode to
//! [`ChatMsgEvent::Unknown`] with their params kept verbatim.
//!
//! File chunks use a compact binary frame: a header byte (`I` for inline
//! chunks with a 1-byte chunk number, `F` for chunks on a dedicated file
//! connection with a 4-byte big-endian chunk number), the 16-byte shared
//! message id, the chunk number and the chunk body. Transfer cancellation is
//! the distinguished single-byte frame `X`.
//!
//! Dispatch between the encodings is on the first body byte: `{` means JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::identifiers::SharedMsgId;

use super::{
    content::{ExtMsgContent, MsgContainer},
    events::ChatMsgEvent,
};

const BINARY_CHUNK_INLINE: u8 = b'I';
const BINARY_CHUNK: u8 = b'F';
const BINARY_CANCEL: u8 = b'X';

/// A single protocol message: the envelope agreed between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub shared_msg_id: Option<SharedMsgId>,
    pub event: ChatMsgEvent,
}

/// A decoding failure. Fatal to the single message, never to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid event params for {tag}: {reason}")]
    Params { tag: String, reason: String },
    #[error("invalid binary frame: {0}")]
    Frame(&'static str),
    #[error("event {0} has no JSON encoding")]
    BinaryOnly(&'static str),
    #[error("binary encoding requested for JSON event {0}")]
    JsonOnly(String),
}

#[derive(Serialize, Deserialize)]
struct AppMessageJson {
    #[serde(rename = "msgId", skip_serializing_if = "Option::is_none")]
    msg_id: Option<SharedMsgId>,
    event: String,
    params: Value,
}

impl ChatMessage {
    pub fn new(shared_msg_id: Option<SharedMsgId>, event: ChatMsgEvent) -> Self {
        Self {
            shared_msg_id,
            event,
        }
    }

    /// Encodes the message; `inline` selects the 1-byte chunk-number frame
    /// for binary file chunks and is ignored for JSON events.
    pub fn encode(&self, inline: bool) -> Result<Vec<u8>, ProtocolError> {
        match &self.event {
            ChatMsgEvent::FileChunk { chunk_no, chunk } => {
                let msg_id = self
                    .shared_msg_id
                    .ok_or(ProtocolError::Frame("file chunk without shared message id"))?;
                let mut buf = Vec::with_capacity(chunk.len() + 22);
                if inline {
                    buf.push(BINARY_CHUNK_INLINE);
                    buf.extend_from_slice(msg_id.as_bytes());
                    let no = u8::try_from(*chunk_no)
                        .map_err(|_| ProtocolError::Frame("inline chunk number out of range"))?;
                    buf.push(no);
                } else {
                    buf.push(BINARY_CHUNK);
                    buf.extend_from_slice(msg_id.as_bytes());
                    buf.extend_from_slice(&chunk_no.to_be_bytes());
                }
                buf.extend_from_slice(chunk);
                Ok(buf)
            }
            ChatMsgEvent::FileChunkCancel => Ok(vec![BINARY_CANCEL]),
            event => {
                let message = AppMessageJson {
                    msg_id: self.shared_msg_id,
                    event: event.tag().to_owned(),
                    params: event_params(event)?,
                };
                Ok(serde_json::to_vec(&message)?)
            }
        }
    }

    /// Decodes a message body, dispatching on the first byte.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match bytes.first() {
            Some(b'{') => {
                let message: AppMessageJson = serde_json::from_slice(bytes)?;
                let event = event_from_params(&message.event, message.params)?;
                Ok(Self {
                    shared_msg_id: message.msg_id,
                    event,
                })
            }
            Some(&BINARY_CANCEL) if bytes.len() == 1 => Ok(Self {
                shared_msg_id: None,
                event: ChatMsgEvent::FileChunkCancel,
            }),
            Some(&(header @ (BINARY_CHUNK_INLINE | BINARY_CHUNK))) => {
                let rest = &bytes[1..];
                let msg_id = SharedMsgId::from_slice(
                    rest.get(..16)
                        .ok_or(ProtocolError::Frame("truncated shared message id"))?,
                )
                .ok_or(ProtocolError::Frame("truncated shared message id"))?;
                let rest = &rest[16..];
                let (chunk_no, chunk) = if header == BINARY_CHUNK_INLINE {
                    let no = *rest
                        .first()
                        .ok_or(ProtocolError::Frame("truncated chunk number"))?;
                    (u32::from(no), &rest[1..])
                } else {
                    let no_bytes: [u8; 4] = rest
                        .get(..4)
                        .ok_or(ProtocolError::Frame("truncated chunk number"))?
                        .try_into()
                        .expect("slice length checked");
                    (u32::from_be_bytes(no_bytes), &rest[4..])
                };
                Ok(Self {
                    shared_msg_id: Some(msg_id),
                    event: ChatMsgEvent::FileChunk {
                        chunk_no,
                        chunk: chunk.to_vec(),
                    },
                })
            }
            _ => Err(ProtocolError::Frame("unrecognized message header")),
        }
    }
}

fn params_error<E: std::fmt::Display>(tag: &str) -> impl FnOnce(E) -> ProtocolError + '_ {
    move |error| ProtocolError::Params {
        tag: tag.to_owned(),
        reason: error.to_string(),
    }
}

fn event_params(event: &ChatMsgEvent) -> Result<Value, ProtocolError> {
    use ChatMsgEvent::*;
    let params = match event {
        MsgNew(container) => container_params(container),
        MsgUpdate { msg_id, content } => json!({ "msgId": msg_id, "content": content }),
        MsgDel { msg_id, member_id } => match member_id {
            Some(member_id) => json!({ "msgId": msg_id, "memberId": member_id }),
            None => json!({ "msgId": msg_id }),
        },
        MsgFileDescr { msg_id, file_descr } => {
            json!({ "msgId": msg_id, "fileDescr": file_descr })
        }
        MsgFileCancel { msg_id } => json!({ "msgId": msg_id }),
        FileInv(invitation) => json!({ "file": invitation }),
        FileAcpt { file_name } => json!({ "fileName": file_name }),
        FileAcptInv {
            msg_id,
            file_conn_req,
            file_name,
        } => {
            let mut object = json!({ "msgId": msg_id, "fileName": file_name });
            if let Some(conn_req) = file_conn_req {
                object["fileConnReq"] = json!(conn_req);
            }
            object
        }
        FileCancel { msg_id } => json!({ "msgId": msg_id }),
        Info(profile) => json!({ "profile": profile }),
        Contact(profile) => json!({ "profile": profile }),
        InfoProbe(probe) => json!({ "probe": probe }),
        InfoProbeCheck(hash) => json!({ "probeHash": hash }),
        InfoProbeOk(probe) => json!({ "probe": probe }),
        GrpInv(invitation) => json!({ "groupInvitation": invitation }),
        GrpAcpt { member_id } => json!({ "memberId": member_id }),
        GrpMemNew(member) => json!({ "memberInfo": member }),
        GrpMemIntro(member) => json!({ "memberInfo": member }),
        GrpMemInv {
            member_id,
            intro_inv,
        } => json!({ "memberId": member_id, "memberIntro": intro_inv }),
        GrpMemFwd { member, intro_inv } => {
            json!({ "memberInfo": member, "memberIntro": intro_inv })
        }
        GrpMemInfo { member_id, profile } => {
            json!({ "memberId": member_id, "profile": profile })
        }
        GrpMemRole { member_id, role } => json!({ "memberId": member_id, "role": role }),
        GrpMemDel { member_id } => json!({ "memberId": member_id }),
        GrpLeave | GrpDel | Ok => json!({}),
        GrpInfo(profile) => json!({ "groupProfile": profile }),
        CallInv {
            call_id,
            invitation,
        } => json!({ "callId": call_id, "invitation": invitation }),
        CallOffer { call_id, offer } => json!({ "callId": call_id, "offer": offer }),
        CallAnswer { call_id, answer } => json!({ "callId": call_id, "answer": answer }),
        CallExtra { call_id, extra } => json!({ "callId": call_id, "extra": extra }),
        CallEnd { call_id } => json!({ "callId": call_id }),
        Unknown { params, .. } => params.clone(),
        FileChunk { .. } => return Err(ProtocolError::BinaryOnly("F")),
        FileChunkCancel => return Err(ProtocolError::BinaryOnly("F.cancel")),
    };
    std::result::Result::Ok(params)
}

fn container_params(container: &MsgContainer) -> Value {
    let mut object = Map::new();
    let ext = container.ext_content();
    object.insert("content".into(), json!(ext.content));
    if let Some(file) = &ext.file {
        object.insert("file".into(), json!(file));
    }
    if let Some(ttl) = ext.ttl {
        object.insert("ttl".into(), json!(ttl));
    }
    if let Some(live) = ext.live {
        object.insert("live".into(), json!(live));
    }
    match container {
        MsgContainer::Quote { quote, .. } => {
            object.insert("quote".into(), json!(quote));
        }
        MsgContainer::Forward(_) => {
            object.insert("forward".into(), json!(true));
        }
        MsgContainer::Simple(_) => {}
    }
    Value::Object(object)
}

fn container_from_params(params: Value) -> Result<MsgContainer, ProtocolError> {
    let error = params_error("x.msg.new");
    let object = params
        .as_object()
        .ok_or_else(|| error("params is not an object"))?;
    let error = params_error("x.msg.new");
    let content = object
        .get("content")
        .cloned()
        .ok_or_else(|| error("missing content"))?;
    let error = params_error("x.msg.new");
    let ext = ExtMsgContent {
        content: content.try_into().map_err(error)?,
        file: object
            .get("file")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(params_error("x.msg.new"))?,
        ttl: object.get("ttl").and_then(Value::as_i64),
        live: object.get("live").and_then(Value::as_bool),
    };
    let container = if let Some(quote) = object.get("quote") {
        MsgContainer::Quote {
            quote: serde_json::from_value(quote.clone()).map_err(params_error("x.msg.new"))?,
            content: ext,
        }
    } else if object.get("forward").and_then(Value::as_bool) == Some(true) {
        MsgContainer::Forward(ext)
    } else {
        MsgContainer::Simple(ext)
    };
    Ok(container)
}

fn event_from_params(tag: &str, params: Value) -> Result<ChatMsgEvent, ProtocolError> {
    fn field<T: serde::de::DeserializeOwned>(
        tag: &str,
        params: &Value,
        name: &str,
    ) -> Result<T, ProtocolError> {
        let value = params
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::Params {
                tag: tag.to_owned(),
                reason: format!("missing field {name}"),
            })?;
        serde_json::from_value(value).map_err(|error| ProtocolError::Params {
            tag: tag.to_owned(),
            reason: error.to_string(),
        })
    }

    fn opt_field<T: serde::de::DeserializeOwned>(
        tag: &str,
        params: &Value,
        name: &str,
    ) -> Result<Option<T>, ProtocolError> {
        params
            .get(name)
            .filter(|value| !value.is_null())
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|error| ProtocolError::Params {
                tag: tag.to_owned(),
                reason: error.to_string(),
            })
    }

    use ChatMsgEvent::*;
    let event = match tag {
        "x.msg.new" => MsgNew(container_from_params(params)?),
        "x.msg.update" => MsgUpdate {
            msg_id: field(tag, &params, "msgId")?,
            content: field(tag, &params, "content")?,
        },
        "x.msg.del" => MsgDel {
            msg_id: field(tag, &params, "msgId")?,
            member_id: opt_field(tag, &params, "memberId")?,
        },
        "x.msg.file.descr" => MsgFileDescr {
            msg_id: field(tag, &params, "msgId")?,
            file_descr: field(tag, &params, "fileDescr")?,
        },
        "x.msg.file.cancel" => MsgFileCancel {
            msg_id: field(tag, &params, "msgId")?,
        },
        "x.file" => FileInv(field(tag, &params, "file")?),
        "x.file.acpt" => FileAcpt {
            file_name: field(tag, &params, "fileName")?,
        },
        "x.file.acpt.inv" => FileAcptInv {
            msg_id: field(tag, &params, "msgId")?,
            file_conn_req: opt_field(tag, &params, "fileConnReq")?,
            file_name: field(tag, &params, "fileName")?,
        },
        "x.file.cancel" => FileCancel {
            msg_id: field(tag, &params, "msgId")?,
        },
        "x.info" => Info(field(tag, &params, "profile")?),
        "x.contact" => Contact(field(tag, &params, "profile")?),
        "x.info.probe" => InfoProbe(field(tag, &params, "probe")?),
        "x.info.probe.check" => InfoProbeCheck(field(tag, &params, "probeHash")?),
        "x.info.probe.ok" => InfoProbeOk(field(tag, &params, "probe")?),
        "x.grp.inv" => GrpInv(field(tag, &params, "groupInvitation")?),
        "x.grp.acpt" => GrpAcpt {
            member_id: field(tag, &params, "memberId")?,
        },
        "x.grp.mem.new" => GrpMemNew(field(tag, &params, "memberInfo")?),
        "x.grp.mem.intro" => GrpMemIntro(field(tag, &params, "memberInfo")?),
        "x.grp.mem.inv" => GrpMemInv {
            member_id: field(tag, &params, "memberId")?,
            intro_inv: field(tag, &params, "memberIntro")?,
        },
        "x.grp.mem.fwd" => GrpMemFwd {
            member: field(tag, &params, "memberInfo")?,
            intro_inv: field(tag, &params, "memberIntro")?,
        },
        "x.grp.mem.info" => GrpMemInfo {
            member_id: field(tag, &params, "memberId")?,
            profile: field(tag, &params, "profile")?,
        },
        "x.grp.mem.role" => GrpMemRole {
            member_id: field(tag, &params, "memberId")?,
            role: field(tag, &params, "role")?,
        },
        "x.grp.mem.del" => GrpMemDel {
            member_id: field(tag, &params, "memberId")?,
        },
        "x.grp.leave" => GrpLeave,
        "x.grp.del" => GrpDel,
        "x.grp.info" => GrpInfo(field(tag, &params, "groupProfile")?),
        "x.call.inv" => CallInv {
            call_id: field(tag, &params, "callId")?,
            invitation: field(tag, &params, "invitation")?,
        },
        "x.call.offer" => CallOffer {
            call_id: field(tag, &params, "callId")?,
            offer: field(tag, &params, "offer")?,
        },
        "x.call.answer" => CallAnswer {
            call_id: field(tag, &params, "callId")?,
            answer: field(tag, &params, "answer")?,
        },
        "x.call.extra" => CallExtra {
            call_id: field(tag, &params, "callId")?,
            extra: field(tag, &params, "extra")?,
        },
        "x.call.end" => CallEnd {
            call_id: field(tag, &params, "callId")?,
        },
        "x.ok" => Ok,
        _ => Unknown {
            tag: tag.to_owned(),
            params,
        },
    };
    std::result::Result::Ok(event)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        identifiers::{MemberId, Probe, ProbeHash},
        messages::CallId,
        messages::content::{MsgContent, QuotedMsg},
        profile::{GroupMemberRole, Profile},
    };

    use super::*;

    fn round_trip(message: ChatMessage) {
        let bytes = message.encode(false).unwrap();
        let decoded = ChatMessage::decode(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn json_events_round_trip() {
        let msg_id = SharedMsgId::new([1; 16]);
        let member_id = MemberId::new([2; 16]);
        let probe = Probe::new([3; 16]);

        let events = vec![
            ChatMsgEvent::MsgNew(MsgContainer::Simple(ExtMsgContent {
                content: MsgContent::Text("hi".into()),
                file: None,
                ttl: Some(60),
                live: None,
            })),
            ChatMsgEvent::MsgUpdate {
                msg_id,
                content: MsgContent::Text("hello".into()),
            },
            ChatMsgEvent::MsgDel {
                msg_id,
                member_id: Some(member_id),
            },
            ChatMsgEvent::MsgFileCancel { msg_id },
            ChatMsgEvent::FileAcptInv {
                msg_id,
                file_conn_req: None,
                file_name: "voice.m4a".into(),
            },
            ChatMsgEvent::Info(Profile::new("alice")),
            ChatMsgEvent::InfoProbe(probe),
            ChatMsgEvent::InfoProbeCheck(ProbeHash::of(&probe)),
            ChatMsgEvent::InfoProbeOk(probe),
            ChatMsgEvent::GrpAcpt { member_id },
            ChatMsgEvent::GrpMemRole {
                member_id,
                role: GroupMemberRole::Admin,
            },
            ChatMsgEvent::GrpLeave,
            ChatMsgEvent::GrpDel,
            ChatMsgEvent::CallEnd {
                call_id: CallId("c1".into()),
            },
            ChatMsgEvent::Ok,
        ];
        for event in events {
            round_trip(ChatMessage::new(Some(msg_id), event));
        }
    }

    #[test]
    fn quoted_message_round_trips() {
        let msg_id = SharedMsgId::new([9; 16]);
        let quote = QuotedMsg {
            msg_ref: crate::messages::content::MsgRef {
                msg_id,
                sent_at: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                sent: true,
                member_id: None,
            },
            content: MsgContent::Text("original".into()),
        };
        round_trip(ChatMessage::new(
            Some(SharedMsgId::new([10; 16])),
            ChatMsgEvent::MsgNew(MsgContainer::Quote {
                quote,
                content: ExtMsgContent::plain(MsgContent::Text("reply".into())),
            }),
        ));
    }

    #[test]
    fn unknown_event_round_trips_to_itself() {
        let params = json!({ "answer": 42, "nested": { "a": [1, 2, 3] } });
        let message = ChatMessage::new(
            None,
            ChatMsgEvent::Unknown {
                tag: "x.future.feature".into(),
                params: params.clone(),
            },
        );
        let bytes = message.encode(false).unwrap();
        let decoded = ChatMessage::decode(&bytes).unwrap();
        let ChatMsgEvent::Unknown {
            tag,
            params: decoded_params,
        } = decoded.event
        else {
            panic!("expected unknown event");
        };
        assert_eq!(tag, "x.future.feature");
        assert_eq!(decoded_params, params);
    }

    #[test]
    fn binary_chunk_round_trips_both_widths() {
        let msg_id = SharedMsgId::new([5; 16]);
        let chunk = ChatMessage::new(
            Some(msg_id),
            ChatMsgEvent::FileChunk {
                chunk_no: 3,
                chunk: vec![0xAB; 100],
            },
        );

        let inline = chunk.encode(true).unwrap();
        assert_eq!(inline[0], b'I');
        assert_eq!(ChatMessage::decode(&inline).unwrap(), chunk);

        let separate = chunk.encode(false).unwrap();
        assert_eq!(separate[0], b'F');
        assert_eq!(ChatMessage::decode(&separate).unwrap(), chunk);
    }

    #[test]
    fn binary_cancel_is_single_byte() {
        let cancel = ChatMessage::new(None, ChatMsgEvent::FileChunkCancel);
        let bytes = cancel.encode(true).unwrap();
        assert_eq!(bytes, vec![b'X']);
        assert_eq!(ChatMessage::decode(&bytes).unwrap(), cancel);
    }

    #[test]
    fn inline_chunk_number_overflow_is_rejected() {
        let chunk = ChatMessage::new(
            Some(SharedMsgId::new([5; 16])),
            ChatMsgEvent::FileChunk {
                chunk_no: 300,
                chunk: vec![1],
            },
        );
        assert!(chunk.encode(true).is_err());
        assert!(chunk.encode(false).is_ok());
    }

    #[test]
    fn garbage_fails_without_panicking() {
        assert!(ChatMessage::decode(b"").is_err());
        assert!(ChatMessage::decode(b"Z123").is_err());
        assert!(ChatMessage::decode(b"{\"event\":12}").is_err());
        assert!(ChatMessage::decode(&[b'F', 1, 2]).is_err());
    }
}
