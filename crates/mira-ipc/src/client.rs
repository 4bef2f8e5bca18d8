use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use mira_core::{
    ClientFactory, CreateGroupRequest, EphemeralTimer, GroupInfo, IpcCommand, Jid, JoinedGroup,
    MemberAddMode, ParticipantAction, ParticipantResult, WaClient, WaError, WaResult,
};

use crate::sidecar::{SessionFlags, SidecarManager};

/// Upper bound for a single sidecar round trip. Engine-level step timeouts
/// are usually tighter and win.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Deserialize)]
struct CodeReply {
    code: String,
}

#[derive(Deserialize)]
struct LinkReply {
    link: String,
}

#[derive(Deserialize)]
struct PictureReply {
    picture_id: String,
}

#[derive(Deserialize)]
struct JidReply {
    jid: Jid,
}

#[derive(Deserialize)]
struct MessageReply {
    message_id: String,
}

fn decode<T: DeserializeOwned>(data: Option<serde_json::Value>) -> WaResult<T> {
    let value = data.ok_or_else(|| WaError::Decode("empty result".to_string()))?;
    serde_json::from_value(value).map_err(|e| WaError::Decode(e.to_string()))
}

/// [`WaClient`] backed by one account session inside the sidecar.
pub struct SidecarClient {
    account_id: i64,
    store_path: String,
    manager: Arc<SidecarManager>,
    flags: Arc<SessionFlags>,
    timeout: Duration,
}

impl SidecarClient {
    pub async fn new(manager: Arc<SidecarManager>, account_id: i64, store_path: &Path) -> Self {
        let flags = manager.session_flags(account_id).await;
        Self {
            account_id,
            store_path: store_path.to_string_lossy().into_owned(),
            manager,
            flags,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    async fn call(&self, command: IpcCommand) -> WaResult<Option<serde_json::Value>> {
        Ok(self.manager.request(command, self.timeout).await?)
    }

    async fn call_unit(&self, command: IpcCommand) -> WaResult<()> {
        self.call(command).await.map(|_| ())
    }
}

#[async_trait]
impl WaClient for SidecarClient {
    fn account_id(&self) -> i64 {
        self.account_id
    }

    fn is_connected(&self) -> bool {
        self.flags.is_connected()
    }

    fn is_logged_in(&self) -> bool {
        self.flags.is_logged_in()
    }

    async fn connect(&self) -> WaResult<()> {
        self.manager.start().await?;
        self.call_unit(IpcCommand::StartAccount {
            account_id: self.account_id,
            store_path: self.store_path.clone(),
        })
        .await
    }

    async fn disconnect(&self) -> WaResult<()> {
        self.call_unit(IpcCommand::StopAccount {
            account_id: self.account_id,
        })
        .await
    }

    async fn logout(&self) -> WaResult<()> {
        self.call_unit(IpcCommand::Logout {
            account_id: self.account_id,
        })
        .await
    }

    async fn pair_phone(&self, phone: &str) -> WaResult<String> {
        let reply: CodeReply = decode(
            self.call(IpcCommand::PairPhone {
                account_id: self.account_id,
                phone: phone.to_string(),
            })
            .await?,
        )?;
        Ok(reply.code)
    }

    async fn list_joined_groups(&self) -> WaResult<Vec<JoinedGroup>> {
        decode(
            self.call(IpcCommand::ListJoinedGroups {
                account_id: self.account_id,
            })
            .await?,
        )
    }

    async fn group_info(&self, jid: &Jid) -> WaResult<GroupInfo> {
        decode(
            self.call(IpcCommand::GetGroupInfo {
                account_id: self.account_id,
                jid: jid.clone(),
            })
            .await?,
        )
    }

    async fn invite_link(&self, jid: &Jid, reset: bool) -> WaResult<String> {
        let reply: LinkReply = decode(
            self.call(IpcCommand::GetInviteLink {
                account_id: self.account_id,
                jid: jid.clone(),
                reset,
            })
            .await?,
        )?;
        Ok(reply.link)
    }

    async fn set_group_photo(&self, jid: &Jid, jpeg: Vec<u8>) -> WaResult<String> {
        let reply: PictureReply = decode(
            self.call(IpcCommand::SetGroupPhoto {
                account_id: self.account_id,
                jid: jid.clone(),
                jpeg_base64: STANDARD.encode(jpeg),
            })
            .await?,
        )?;
        Ok(reply.picture_id)
    }

    async fn set_group_description(&self, jid: &Jid, description: &str) -> WaResult<()> {
        self.call_unit(IpcCommand::SetGroupDescription {
            account_id: self.account_id,
            jid: jid.clone(),
            description: description.to_string(),
        })
        .await
    }

    async fn set_group_announce(&self, jid: &Jid, announce: bool) -> WaResult<()> {
        self.call_unit(IpcCommand::SetGroupAnnounce {
            account_id: self.account_id,
            jid: jid.clone(),
            announce,
        })
        .await
    }

    async fn set_group_member_add_mode(&self, jid: &Jid, mode: MemberAddMode) -> WaResult<()> {
        self.call_unit(IpcCommand::SetGroupMemberAddMode {
            account_id: self.account_id,
            jid: jid.clone(),
            mode,
        })
        .await
    }

    async fn set_group_locked(&self, jid: &Jid, locked: bool) -> WaResult<()> {
        self.call_unit(IpcCommand::SetGroupLocked {
            account_id: self.account_id,
            jid: jid.clone(),
            locked,
        })
        .await
    }

    async fn set_group_ephemeral(&self, jid: &Jid, timer: EphemeralTimer) -> WaResult<()> {
        self.call_unit(IpcCommand::SetGroupEphemeral {
            account_id: self.account_id,
            jid: jid.clone(),
            timer,
        })
        .await
    }

    async fn set_group_join_approval(&self, jid: &Jid, enabled: bool) -> WaResult<()> {
        self.call_unit(IpcCommand::SetGroupJoinApproval {
            account_id: self.account_id,
            jid: jid.clone(),
            enabled,
        })
        .await
    }

    async fn create_group(&self, request: CreateGroupRequest) -> WaResult<GroupInfo> {
        decode(
            self.call(IpcCommand::CreateGroup {
                account_id: self.account_id,
                request,
            })
            .await?,
        )
    }

    async fn join_group_with_link(&self, code: &str) -> WaResult<Jid> {
        let reply: JidReply = decode(
            self.call(IpcCommand::JoinGroupWithLink {
                account_id: self.account_id,
                code: code.to_string(),
            })
            .await?,
        )?;
        Ok(reply.jid)
    }

    async fn leave_group(&self, jid: &Jid) -> WaResult<()> {
        self.call_unit(IpcCommand::LeaveGroup {
            account_id: self.account_id,
            jid: jid.clone(),
        })
        .await
    }

    async fn update_participants(
        &self,
        jid: &Jid,
        participants: &[Jid],
        action: ParticipantAction,
    ) -> WaResult<Vec<ParticipantResult>> {
        decode(
            self.call(IpcCommand::UpdateParticipants {
                account_id: self.account_id,
                jid: jid.clone(),
                participants: participants.to_vec(),
                action,
            })
            .await?,
        )
    }

    async fn send_text(&self, to: &Jid, text: &str) -> WaResult<String> {
        let reply: MessageReply = decode(
            self.call(IpcCommand::SendText {
                account_id: self.account_id,
                to: to.clone(),
                text: text.to_string(),
            })
            .await?,
        )?;
        Ok(reply.message_id)
    }

    async fn mark_read(&self, chat: &Jid, sender: &Jid, message_ids: &[String]) -> WaResult<()> {
        self.call_unit(IpcCommand::MarkRead {
            account_id: self.account_id,
            chat: chat.clone(),
            sender: sender.clone(),
            message_ids: message_ids.to_vec(),
        })
        .await
    }

    async fn local_group_jids(&self) -> WaResult<Vec<Jid>> {
        decode(
            self.call(IpcCommand::LocalGroupJids {
                account_id: self.account_id,
            })
            .await?,
        )
    }

    async fn local_contact_names(&self) -> WaResult<HashMap<String, String>> {
        decode(
            self.call(IpcCommand::LocalContactNames {
                account_id: self.account_id,
            })
            .await?,
        )
    }
}

/// Hands out [`SidecarClient`]s that share one sidecar process.
pub struct SidecarFactory {
    manager: Arc<SidecarManager>,
}

impl SidecarFactory {
    pub fn new(manager: Arc<SidecarManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ClientFactory for SidecarFactory {
    async fn create(&self, account_id: i64, store_path: &Path) -> WaResult<Arc<dyn WaClient>> {
        self.manager.start().await?;
        let client = SidecarClient::new(self.manager.clone(), account_id, store_path).await;
        Ok(Arc::new(client))
    }
}
