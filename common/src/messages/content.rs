// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message content carried inside `x.msg.new` containers.
//!
//! Content is a typed union keyed on the `type` field. Unknown content types
//! are preserved verbatim so messages from newer clients survive storage and
//! forwarding without data loss.

use serde::{Deserialize, Serialize, de::Error as _};
use serde_json::{Map, Value, json};

use crate::identifiers::{ConnReqUri, MemberId, SharedMsgId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgContent {
    Text(String),
    Link {
        text: String,
        preview: LinkPreview,
    },
    Image {
        text: String,
        image: String,
    },
    Video {
        text: String,
        image: String,
        duration: u32,
    },
    Voice {
        text: String,
        duration: u32,
    },
    File(String),
    Unknown {
        tag: String,
        json: Value,
    },
}

impl MsgContent {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(text)
            | Self::Link { text, .. }
            | Self::Image { text, .. }
            | Self::Video { text, .. }
            | Self::Voice { text, .. }
            | Self::File(text) => text,
            Self::Unknown { json, .. } => json
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        }
    }

    pub fn is_voice(&self) -> bool {
        matches!(self, Self::Voice { .. })
    }

    pub fn type_tag(&self) -> &str {
        match self {
            Self::Text(_) => "text",
            Self::Link { .. } => "link",
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Voice { .. } => "voice",
            Self::File(_) => "file",
            Self::Unknown { tag, .. } => tag,
        }
    }
}

impl Serialize for MsgContent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match self {
            Self::Text(text) => json!({ "type": "text", "text": text }),
            Self::Link { text, preview } => {
                json!({ "type": "link", "text": text, "preview": preview })
            }
            Self::Image { text, image } => {
                json!({ "type": "image", "text": text, "image": image })
            }
            Self::Video {
                text,
                image,
                duration,
            } => json!({ "type": "video", "text": text, "image": image, "duration": duration }),
            Self::Voice { text, duration } => {
                json!({ "type": "voice", "text": text, "duration": duration })
            }
            Self::File(text) => json!({ "type": "file", "text": text }),
            Self::Unknown { tag, json } => {
                let mut object = json.as_object().cloned().unwrap_or_default();
                object.insert("type".into(), Value::String(tag.clone()));
                Value::Object(object)
            }
        };
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MsgContent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::try_from(value).map_err(D::Error::custom)
    }
}

impl TryFrom<Value> for MsgContent {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let object = value
            .as_object()
            .ok_or_else(|| "content is not an object".to_owned())?;
        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "content has no type".to_owned())?;
        let text = || {
            object
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        let content = match tag {
            "text" => Self::Text(text()),
            "link" => {
                let preview = object
                    .get("preview")
                    .cloned()
                    .ok_or_else(|| "link content has no preview".to_owned())?;
                Self::Link {
                    text: text(),
                    preview: serde_json::from_value(preview).map_err(|e| e.to_string())?,
                }
            }
            "image" => Self::Image {
                text: text(),
                image: str_field(object, "image")?,
            },
            "video" => Self::Video {
                text: text(),
                image: str_field(object, "image")?,
                duration: u32_field(object, "duration")?,
            },
            "voice" => Self::Voice {
                text: text(),
                duration: u32_field(object, "duration")?,
            },
            "file" => Self::File(text()),
            _ => {
                let mut rest = object.clone();
                rest.remove("type");
                Self::Unknown {
                    tag: tag.to_owned(),
                    json: Value::Object(rest),
                }
            }
        };
        Ok(content)
    }
}

fn str_field(object: &Map<String, Value>, name: &str) -> Result<String, String> {
    object
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| format!("missing field {name}"))
}

fn u32_field(object: &Map<String, Value>, name: &str) -> Result<u32, String> {
    object
        .get(name)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| format!("missing field {name}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub uri: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// How an offered file is to be transmitted on the messaging connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InlineFileMode {
    /// Chunks follow only after the receiver accepts.
    Offer,
    /// Chunks are sent immediately after the invitation.
    Sent,
}

/// A file offer attached to a content message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInvitation {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "fileSize")]
    pub file_size: i64,
    #[serde(rename = "fileDigest", skip_serializing_if = "Option::is_none")]
    pub file_digest: Option<String>,
    #[serde(rename = "fileConnReq", skip_serializing_if = "Option::is_none")]
    pub file_conn_req: Option<ConnReqUri>,
    #[serde(rename = "fileInline", skip_serializing_if = "Option::is_none")]
    pub file_inline: Option<InlineFileMode>,
    #[serde(rename = "fileDescr", skip_serializing_if = "Option::is_none")]
    pub file_descr: Option<FileDescrPart>,
}

/// One part of an XFTP file descriptor, transmitted via `x.msg.file.descr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescrPart {
    #[serde(rename = "partNo")]
    pub part_no: u32,
    #[serde(rename = "fileDescrText")]
    pub text: String,
    #[serde(rename = "fileDescrComplete")]
    pub complete: bool,
}

/// Reference to a previously sent message, used in quotes and deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRef {
    #[serde(rename = "msgId")]
    pub msg_id: SharedMsgId,
    #[serde(rename = "sentAt")]
    pub sent_at: chrono::DateTime<chrono::Utc>,
    pub sent: bool,
    #[serde(rename = "memberId", skip_serializing_if = "Option::is_none")]
    pub member_id: Option<MemberId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedMsg {
    #[serde(rename = "msgRef")]
    pub msg_ref: MsgRef,
    pub content: MsgContent,
}

/// Extended content of a new message: body plus the optional file offer,
/// disappearing-message TTL and live-message flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtMsgContent {
    pub content: MsgContent,
    pub file: Option<FileInvitation>,
    pub ttl: Option<i64>,
    pub live: Option<bool>,
}

impl ExtMsgContent {
    pub fn plain(content: MsgContent) -> Self {
        Self {
            content,
            file: None,
            ttl: None,
            live: None,
        }
    }
}

/// Container shapes a new message can arrive in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgContainer {
    Simple(ExtMsgContent),
    Quote {
        quote: QuotedMsg,
        content: ExtMsgContent,
    },
    Forward(ExtMsgContent),
}

impl MsgContainer {
    pub fn ext_content(&self) -> &ExtMsgContent {
        match self {
            Self::Simple(ext) | Self::Forward(ext) | Self::Quote { content: ext, .. } => ext,
        }
    }

    pub fn quote(&self) -> Option<&QuotedMsg> {
        match self {
            Self::Quote { quote, .. } => Some(quote),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_content_round_trips_verbatim() {
        let raw = json!({ "type": "x.sticker", "text": "", "sticker": "abc" });
        let content: MsgContent = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(content, MsgContent::Unknown { ref tag, .. } if tag == "x.sticker"));
        assert_eq!(serde_json::to_value(&content).unwrap(), raw);
    }

    #[test]
    fn voice_content_round_trips() {
        let content = MsgContent::Voice {
            text: String::new(),
            duration: 12,
        };
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value, json!({ "type": "voice", "text": "", "duration": 12 }));
        assert_eq!(
            serde_json::from_value::<MsgContent>(value).unwrap(),
            content
        );
    }
}
