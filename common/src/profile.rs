// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User and group profiles and the negotiated chat feature preferences.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A peer-visible user profile.
///
/// `display_name` is the name offered by the peer; the local side keeps its
/// own unique rendering of it next to the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "fullName", default)]
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Preferences>,
}

impl Profile {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            full_name: String::new(),
            image: None,
            preferences: None,
        }
    }
}

/// Feature preferences a user attaches to their profile.
///
/// Absent features are negotiated with their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(rename = "timedMessages", skip_serializing_if = "Option::is_none")]
    pub timed_messages: Option<FeaturePreference>,
    #[serde(rename = "fullDelete", skip_serializing_if = "Option::is_none")]
    pub full_delete: Option<FeaturePreference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<FeaturePreference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls: Option<FeaturePreference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturePreference {
    pub allow: FeatureAllowed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FeatureAllowed {
    Always,
    #[default]
    Yes,
    No,
}

/// A chat feature subject to pairwise negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum ChatFeature {
    TimedMessages,
    FullDelete,
    Voice,
    Calls,
}

/// Merged view of both sides' preferences for one feature.
///
/// A feature is enabled for a direction when that side allows it and the
/// other side at least accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureEnabled {
    pub for_user: bool,
    pub for_contact: bool,
}

impl FeatureEnabled {
    pub fn merge(user: FeatureAllowed, contact: FeatureAllowed) -> Self {
        use FeatureAllowed::*;
        match (user, contact) {
            (Always, No) => Self {
                for_user: false,
                for_contact: true,
            },
            (No, Always) => Self {
                for_user: true,
                for_contact: false,
            },
            (No, _) | (_, No) => Self {
                for_user: false,
                for_contact: false,
            },
            _ => Self {
                for_user: true,
                for_contact: true,
            },
        }
    }
}

/// Group profile, shared by the host with every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupProfile {
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "fullName", default)]
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(
        rename = "groupPreferences",
        skip_serializing_if = "Option::is_none"
    )]
    pub group_preferences: Option<GroupPreferences>,
}

impl GroupProfile {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            full_name: String::new(),
            image: None,
            group_preferences: None,
        }
    }
}

/// Per-group feature switches, controlled by owners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPreferences {
    #[serde(rename = "directMessages", skip_serializing_if = "Option::is_none")]
    pub direct_messages: Option<GroupFeaturePreference>,
    #[serde(rename = "fullDelete", skip_serializing_if = "Option::is_none")]
    pub full_delete: Option<GroupFeaturePreference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<GroupFeaturePreference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFeaturePreference {
    pub enable: GroupFeatureEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GroupFeatureEnabled {
    On,
    Off,
}

/// Group member roles, ordered by privilege.
///
/// Members below `Author` may not send content messages.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum GroupMemberRole {
    Observer,
    Author,
    Member,
    Admin,
    Owner,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(GroupMemberRole::Observer < GroupMemberRole::Author);
        assert!(GroupMemberRole::Author < GroupMemberRole::Member);
        assert!(GroupMemberRole::Member < GroupMemberRole::Admin);
        assert!(GroupMemberRole::Admin < GroupMemberRole::Owner);
    }

    #[test]
    fn feature_merge() {
        use FeatureAllowed::*;
        let enabled = FeatureEnabled::merge(Yes, Yes);
        assert!(enabled.for_user && enabled.for_contact);

        let enabled = FeatureEnabled::merge(No, Always);
        assert!(enabled.for_user);
        assert!(!enabled.for_contact);

        let enabled = FeatureEnabled::merge(No, Yes);
        assert!(!enabled.for_user && !enabled.for_contact);
    }

    #[test]
    fn role_parses_from_command_text() {
        assert_eq!(
            "admin".parse::<GroupMemberRole>().unwrap(),
            GroupMemberRole::Admin
        );
        assert_eq!(GroupMemberRole::Observer.to_string(), "observer");
    }
}
