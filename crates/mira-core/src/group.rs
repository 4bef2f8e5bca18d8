use serde::{Deserialize, Serialize};

use crate::jid::Jid;

/// Entry returned by the library's joined-groups listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedGroup {
    pub jid: Jid,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub jid: Jid,
    #[serde(default)]
    pub phone_number: Option<Jid>,
    #[serde(default)]
    pub lid: Option<Jid>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_super_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub jid: Jid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub is_announce: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub join_approval: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

/// Per-participant status from an update-participants call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantResult {
    pub jid: Jid,
    pub status: u16,
}

/// Three-way reading of a participant status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantOutcome {
    Joined,
    Invited,
    Failed(u16),
}

impl ParticipantOutcome {
    pub const INVITED_CODE: u16 = 401;

    pub fn from_status(status: u16) -> Self {
        match status {
            0 | 200 => Self::Joined,
            Self::INVITED_CODE => Self::Invited,
            code => Self::Failed(code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberAddMode {
    AllMembers,
    AdminsOnly,
}

/// Disappearing-messages timer choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EphemeralTimer {
    Off,
    Day,
    Week,
    Quarter,
}

impl EphemeralTimer {
    pub fn as_seconds(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::Day => 24 * 60 * 60,
            Self::Week => 7 * 24 * 60 * 60,
            Self::Quarter => 90 * 24 * 60 * 60,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Day => "24h",
            Self::Week => "7d",
            Self::Quarter => "90d",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "off" | "0" | "mati" => Some(Self::Off),
            "24h" | "1d" | "24" => Some(Self::Day),
            "7d" | "7" => Some(Self::Week),
            "90d" | "90" => Some(Self::Quarter),
            _ => None,
        }
    }
}

/// Settings the protocol accepts inside a create-group request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupSettings {
    #[serde(default)]
    pub announce: Option<bool>,
    #[serde(default)]
    pub locked: Option<bool>,
    #[serde(default)]
    pub join_approval: Option<bool>,
    #[serde(default)]
    pub ephemeral: Option<EphemeralTimer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub participants: Vec<Jid>,
    #[serde(default)]
    pub settings: CreateGroupSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_outcome_buckets() {
        assert_eq!(ParticipantOutcome::from_status(0), ParticipantOutcome::Joined);
        assert_eq!(ParticipantOutcome::from_status(200), ParticipantOutcome::Joined);
        assert_eq!(ParticipantOutcome::from_status(401), ParticipantOutcome::Invited);
        assert_eq!(ParticipantOutcome::from_status(403), ParticipantOutcome::Failed(403));
        assert_eq!(ParticipantOutcome::from_status(409), ParticipantOutcome::Failed(409));
    }

    #[test]
    fn test_ephemeral_parse() {
        assert_eq!(EphemeralTimer::parse("24h"), Some(EphemeralTimer::Day));
        assert_eq!(EphemeralTimer::parse(" 90D "), Some(EphemeralTimer::Quarter));
        assert_eq!(EphemeralTimer::parse("3d"), None);
        assert_eq!(EphemeralTimer::Week.as_seconds(), 604_800);
    }

    #[test]
    fn test_group_info_defaults() {
        let info: GroupInfo = serde_json::from_str(r#"{"jid":"1@g.us"}"#).unwrap();
        assert!(info.participants.is_empty());
        assert!(!info.is_announce);
    }
}
