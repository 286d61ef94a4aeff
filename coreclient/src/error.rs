// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The controller's closed error sum.
//!
//! Command errors are rejected before any state mutation; store and agent
//! errors propagate from their layers. Event handlers catch their own
//! errors and report them on the view channel, so a single poisonous
//! connection never halts the processor.

use std::path::PathBuf;

use courieragentclient::AgentError;
use couriercommon::messages::ProtocolError;
use thiserror::Error;

use crate::{files::engine::FileError, store::StoreError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("command error: {0}")]
    Command(#[from] CommandError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("file error: {0}")]
    File(#[from] FileError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ChatError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ChatError>() {
            Ok(chat_error) => chat_error,
            Err(error) => Self::Internal(format!("{error:#}")),
        }
    }
}

/// Input validation and rule violations, raised before side effects.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("no active user")]
    NoActiveUser,
    #[error("chat is not started")]
    ChatNotStarted,
    #[error("the last user cannot be deleted")]
    CantDeleteLastUser,
    #[error("incorrect view password")]
    WrongViewPassword,
    #[error("the last visible user cannot be hidden")]
    CantHideLastUser,
    #[error("the active user cannot be hidden")]
    CantHideActiveUser,
    #[error("contact {0} is not ready")]
    ContactNotReady(String),
    #[error("contact {0} is disabled")]
    ContactDisabled(String),
    #[error("not allowed for this chat reference")]
    InvalidChatRef,
    #[error("insufficient group role")]
    GroupUserRole,
    #[error("{0} is already a group member")]
    GroupDuplicateMember(String),
    #[error("an incognito contact cannot be invited")]
    GroupIncognitoCantInvite,
    #[error("feature not allowed: {0}")]
    FeatureNotAllowed(String),
    #[error("file already exists: {0}")]
    FileAlreadyExists(PathBuf),
    #[error("file transfer is not in a cancellable state")]
    FileCancel,
    #[error("file is already being received")]
    FileAlreadyReceiving,
    #[error("no call with contact {0}")]
    CallNotFound(i64),
    #[error("call state does not permit this action")]
    CallState,
}
