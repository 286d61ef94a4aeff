// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The chat controller of the client component.
//!
//! Drives pairwise and group conversations over the queue-relayed messaging
//! substrate and the XFTP file-transfer substrate: user commands become
//! protocol actions, agent events update persistent state and surface as
//! view events. All work is linearized by a single chat lock.

pub mod calls;
pub mod chats;
pub mod client;
pub mod commands;
pub mod config;
pub mod connections;
pub mod contacts;
pub mod error;
pub mod events;
pub mod files;
pub mod groups;
pub mod messages;
pub mod scheduler;
pub mod store;
pub mod users;

pub use client::ChatController;
pub use commands::{ChatCommand, parser::parse_command};
pub use config::ChatConfig;
pub use error::{ChatError, CommandError};
pub use events::ChatResponse;
pub use store::{MigrationPolicy, StoreError, open_memory_store, open_store};
