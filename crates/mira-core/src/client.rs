use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::WaResult;
use crate::group::{
    CreateGroupRequest, EphemeralTimer, GroupInfo, JoinedGroup, MemberAddMode, ParticipantAction,
    ParticipantResult,
};
use crate::jid::Jid;

/// Operations the engine needs from a live WhatsApp session.
///
/// Implementations are shared behind `Arc<dyn WaClient>` and may be called
/// concurrently; each call is expected to be bounded by the caller.
#[async_trait]
pub trait WaClient: Send + Sync {
    fn account_id(&self) -> i64;

    fn is_connected(&self) -> bool;

    fn is_logged_in(&self) -> bool;

    async fn connect(&self) -> WaResult<()>;

    async fn disconnect(&self) -> WaResult<()>;

    async fn logout(&self) -> WaResult<()>;

    /// Requests a phone pairing code for `phone` (digits only).
    async fn pair_phone(&self, phone: &str) -> WaResult<String>;

    async fn list_joined_groups(&self) -> WaResult<Vec<JoinedGroup>>;

    async fn group_info(&self, jid: &Jid) -> WaResult<GroupInfo>;

    async fn invite_link(&self, jid: &Jid, reset: bool) -> WaResult<String>;

    async fn set_group_photo(&self, jid: &Jid, jpeg: Vec<u8>) -> WaResult<String>;

    async fn set_group_description(&self, jid: &Jid, description: &str) -> WaResult<()>;

    async fn set_group_announce(&self, jid: &Jid, announce: bool) -> WaResult<()>;

    async fn set_group_member_add_mode(&self, jid: &Jid, mode: MemberAddMode) -> WaResult<()>;

    async fn set_group_locked(&self, jid: &Jid, locked: bool) -> WaResult<()>;

    async fn set_group_ephemeral(&self, jid: &Jid, timer: EphemeralTimer) -> WaResult<()>;

    async fn set_group_join_approval(&self, jid: &Jid, enabled: bool) -> WaResult<()>;

    async fn create_group(&self, request: CreateGroupRequest) -> WaResult<GroupInfo>;

    /// Joins using the code part of an invite URL; returns the group JID.
    async fn join_group_with_link(&self, code: &str) -> WaResult<Jid>;

    async fn leave_group(&self, jid: &Jid) -> WaResult<()>;

    async fn update_participants(
        &self,
        jid: &Jid,
        participants: &[Jid],
        action: ParticipantAction,
    ) -> WaResult<Vec<ParticipantResult>>;

    /// Sends a text message and returns the message id.
    async fn send_text(&self, to: &Jid, text: &str) -> WaResult<String>;

    async fn mark_read(&self, chat: &Jid, sender: &Jid, message_ids: &[String]) -> WaResult<()>;

    /// Group JIDs known to the library's local chat-settings store.
    async fn local_group_jids(&self) -> WaResult<Vec<Jid>>;

    /// JID string to display name from the library's local contacts store.
    async fn local_contact_names(&self) -> WaResult<HashMap<String, String>>;
}

/// Builds live clients for registry accounts.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, account_id: i64, store_path: &Path) -> WaResult<Arc<dyn WaClient>>;
}
