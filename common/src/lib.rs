// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifiers, profiles and the wire protocol shared by the chat
//! controller, the agent client and tooling.

pub mod identifiers;
pub mod messages;
pub mod profile;
