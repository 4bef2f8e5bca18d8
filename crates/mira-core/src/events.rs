use serde::{Deserialize, Serialize};

use crate::group::{CreateGroupRequest, EphemeralTimer, MemberAddMode, ParticipantAction};
use crate::jid::Jid;

/// Commands sent to the protocol sidecar. Every account-scoped command
/// carries the numeric account id the sidecar uses to pick its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcCommand {
    StartAccount { account_id: i64, store_path: String },
    StopAccount { account_id: i64 },
    Logout { account_id: i64 },
    PairPhone { account_id: i64, phone: String },
    ListJoinedGroups { account_id: i64 },
    GetGroupInfo { account_id: i64, jid: Jid },
    GetInviteLink { account_id: i64, jid: Jid, reset: bool },
    SetGroupPhoto { account_id: i64, jid: Jid, jpeg_base64: String },
    SetGroupDescription { account_id: i64, jid: Jid, description: String },
    SetGroupAnnounce { account_id: i64, jid: Jid, announce: bool },
    SetGroupMemberAddMode { account_id: i64, jid: Jid, mode: MemberAddMode },
    SetGroupLocked { account_id: i64, jid: Jid, locked: bool },
    SetGroupEphemeral { account_id: i64, jid: Jid, timer: EphemeralTimer },
    SetGroupJoinApproval { account_id: i64, jid: Jid, enabled: bool },
    CreateGroup { account_id: i64, request: CreateGroupRequest },
    JoinGroupWithLink { account_id: i64, code: String },
    LeaveGroup { account_id: i64, jid: Jid },
    UpdateParticipants { account_id: i64, jid: Jid, participants: Vec<Jid>, action: ParticipantAction },
    SendText { account_id: i64, to: Jid, text: String },
    MarkRead { account_id: i64, chat: Jid, sender: Jid, message_ids: Vec<String> },
    LocalGroupJids { account_id: i64 },
    LocalContactNames { account_id: i64 },
    Shutdown,
}

impl IpcCommand {
    /// Command name and account for logging.
    pub fn describe(&self) -> (&'static str, Option<i64>) {
        match self {
            Self::StartAccount { account_id, .. } => ("StartAccount", Some(*account_id)),
            Self::StopAccount { account_id } => ("StopAccount", Some(*account_id)),
            Self::Logout { account_id } => ("Logout", Some(*account_id)),
            Self::PairPhone { account_id, .. } => ("PairPhone", Some(*account_id)),
            Self::ListJoinedGroups { account_id } => ("ListJoinedGroups", Some(*account_id)),
            Self::GetGroupInfo { account_id, .. } => ("GetGroupInfo", Some(*account_id)),
            Self::GetInviteLink { account_id, .. } => ("GetInviteLink", Some(*account_id)),
            Self::SetGroupPhoto { account_id, .. } => ("SetGroupPhoto", Some(*account_id)),
            Self::SetGroupDescription { account_id, .. } => ("SetGroupDescription", Some(*account_id)),
            Self::SetGroupAnnounce { account_id, .. } => ("SetGroupAnnounce", Some(*account_id)),
            Self::SetGroupMemberAddMode { account_id, .. } => ("SetGroupMemberAddMode", Some(*account_id)),
            Self::SetGroupLocked { account_id, .. } => ("SetGroupLocked", Some(*account_id)),
            Self::SetGroupEphemeral { account_id, .. } => ("SetGroupEphemeral", Some(*account_id)),
            Self::SetGroupJoinApproval { account_id, .. } => ("SetGroupJoinApproval", Some(*account_id)),
            Self::CreateGroup { account_id, .. } => ("CreateGroup", Some(*account_id)),
            Self::JoinGroupWithLink { account_id, .. } => ("JoinGroupWithLink", Some(*account_id)),
            Self::LeaveGroup { account_id, .. } => ("LeaveGroup", Some(*account_id)),
            Self::UpdateParticipants { account_id, .. } => ("UpdateParticipants", Some(*account_id)),
            Self::SendText { account_id, .. } => ("SendText", Some(*account_id)),
            Self::MarkRead { account_id, .. } => ("MarkRead", Some(*account_id)),
            Self::LocalGroupJids { account_id } => ("LocalGroupJids", Some(*account_id)),
            Self::LocalContactNames { account_id } => ("LocalContactNames", Some(*account_id)),
            Self::Shutdown => ("Shutdown", None),
        }
    }
}

/// Events pushed by the sidecar, either unsolicited or as a command result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcEvent {
    Ready { account_id: Option<i64> },
    PairingCode { account_id: i64, code: String },
    PairSuccess { account_id: i64, jid: Option<Jid> },
    Connected { account_id: i64, phone_number: Option<String> },
    Disconnected { account_id: i64, reason: String },
    LoggedOut { account_id: i64, reason: Option<String> },
    Error { account_id: Option<i64>, error: String },
    CommandResult {
        command_id: String,
        success: bool,
        data: Option<serde_json::Value>,
        error: Option<String>,
        code: Option<u16>,
    },
}
