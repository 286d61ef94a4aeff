// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire protocol: message content, the event taxonomy and the codec.

mod codec;
mod content;
mod events;

pub use codec::{ChatMessage, ProtocolError};
pub use content::{
    ExtMsgContent, FileDescrPart, FileInvitation, InlineFileMode, LinkPreview, MsgContainer,
    MsgContent, MsgRef, QuotedMsg,
};
pub use events::{
    CallId, CallInvitationWire, CallMedia, ChatMsgEvent, GroupInvitation, IntroInvitation,
    MemberIdRole, MemberInfo, WebRtcSession,
};
