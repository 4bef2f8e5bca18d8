//! In-memory doubles for the protocol client, the client factory and the
//! control channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mira_core::{
    ClientFactory, CreateGroupRequest, EphemeralTimer, GroupInfo, Jid, JoinedGroup, MemberAddMode,
    Participant, ParticipantAction, ParticipantResult, WaClient, WaError, WaResult,
};
use tokio::time::Instant;

use crate::channel::{Button, ChannelError, ControlChannel, RemoteFile};
use crate::progress::ProgressSink;

#[derive(Debug, Clone)]
pub struct Call {
    pub name: String,
    pub detail: String,
    pub at: Instant,
}

#[derive(Default)]
struct ClientState {
    connected: bool,
    logged_in: bool,
    reconnect_on_connect: bool,
    promote_on_update: bool,
    calls: Vec<Call>,
    failures: HashMap<String, (WaError, usize)>,
    joined: Vec<JoinedGroup>,
    local_jids: Vec<Jid>,
    local_names: HashMap<String, String>,
    infos: HashMap<String, GroupInfo>,
    statuses: HashMap<String, u16>,
    serial: u64,
}

pub struct MockClient {
    id: i64,
    state: Mutex<ClientState>,
}

impl MockClient {
    /// Connected and logged in.
    pub fn new(id: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(ClientState {
                connected: true,
                logged_in: true,
                ..ClientState::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().unwrap()
    }

    /// Logs the call and pops a scheduled failure, if any.
    fn record(&self, name: &str, detail: String) -> WaResult<()> {
        let mut state = self.state();
        state.calls.push(Call {
            name: name.to_string(),
            detail,
            at: Instant::now(),
        });
        if let Some((err, remaining)) = state.failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(err.clone());
            }
        }
        Ok(())
    }

    fn next_serial(&self) -> u64 {
        let mut state = self.state();
        state.serial += 1;
        state.serial
    }

    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.state().logged_in = logged_in;
    }

    pub fn reconnect_on_connect(&self, enabled: bool) {
        self.state().reconnect_on_connect = enabled;
    }

    pub fn promote_on_update(&self, enabled: bool) {
        self.state().promote_on_update = enabled;
    }

    /// The next `times` calls to `op` fail with `err`.
    pub fn fail_times(&self, op: &str, err: WaError, times: usize) {
        self.state().failures.insert(op.to_string(), (err, times));
    }

    pub fn set_joined_groups(&self, groups: Vec<JoinedGroup>) {
        self.state().joined = groups;
    }

    pub fn set_local_groups(&self, jids: Vec<Jid>, names: HashMap<String, String>) {
        let mut state = self.state();
        state.local_jids = jids;
        state.local_names = names;
    }

    pub fn set_group_info(&self, info: GroupInfo) {
        self.state().infos.insert(info.jid.to_string(), info);
    }

    pub fn set_participant_status(&self, phone: &str, status: u16) {
        self.state().statuses.insert(phone.to_string(), status);
    }

    pub fn count(&self, name: &str) -> usize {
        self.state().calls.iter().filter(|c| c.name == name).count()
    }

    pub fn calls_of(&self, name: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.name == name)
            .map(|c| c.detail.clone())
            .collect()
    }

    pub fn call_times(&self, name: &str) -> Vec<Instant> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.name == name)
            .map(|c| c.at)
            .collect()
    }

    pub fn call_names(&self) -> Vec<String> {
        self.state().calls.iter().map(|c| c.name.clone()).collect()
    }
}

#[async_trait]
impl WaClient for MockClient {
    fn account_id(&self) -> i64 {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn is_logged_in(&self) -> bool {
        self.state().logged_in
    }

    async fn connect(&self) -> WaResult<()> {
        self.record("connect", String::new())?;
        let mut state = self.state();
        if state.reconnect_on_connect {
            state.connected = true;
        }
        Ok(())
    }

    async fn disconnect(&self) -> WaResult<()> {
        self.record("disconnect", String::new())?;
        self.state().connected = false;
        Ok(())
    }

    async fn logout(&self) -> WaResult<()> {
        self.record("logout", String::new())?;
        let mut state = self.state();
        state.logged_in = false;
        state.connected = false;
        Ok(())
    }

    async fn pair_phone(&self, phone: &str) -> WaResult<String> {
        self.record("pair_phone", phone.to_string())?;
        Ok("ABCD-EFGH".to_string())
    }

    async fn list_joined_groups(&self) -> WaResult<Vec<JoinedGroup>> {
        self.record("list_joined_groups", String::new())?;
        Ok(self.state().joined.clone())
    }

    async fn group_info(&self, jid: &Jid) -> WaResult<GroupInfo> {
        self.record("group_info", jid.to_string())?;
        let info = self.state().infos.get(&jid.to_string()).cloned();
        Ok(info.unwrap_or_else(|| GroupInfo {
            jid: jid.clone(),
            name: format!("Group {}", jid.bare_user()),
            topic: None,
            participants: Vec::new(),
            is_announce: false,
            is_locked: false,
            join_approval: false,
        }))
    }

    async fn invite_link(&self, jid: &Jid, reset: bool) -> WaResult<String> {
        self.record("invite_link", format!("{jid} {reset}"))?;
        Ok(format!("https://chat.whatsapp.com/INV{}", jid.bare_user()))
    }

    async fn set_group_photo(&self, jid: &Jid, jpeg: Vec<u8>) -> WaResult<String> {
        self.record("set_group_photo", format!("{jid} {}", jpeg.len()))?;
        Ok(format!("photo-{}", self.next_serial()))
    }

    async fn set_group_description(&self, jid: &Jid, description: &str) -> WaResult<()> {
        self.record("set_group_description", format!("{jid} {description}"))
    }

    async fn set_group_announce(&self, jid: &Jid, announce: bool) -> WaResult<()> {
        self.record("set_group_announce", format!("{jid} {announce}"))
    }

    async fn set_group_member_add_mode(&self, jid: &Jid, mode: MemberAddMode) -> WaResult<()> {
        self.record("set_group_member_add_mode", format!("{jid} {mode:?}"))
    }

    async fn set_group_locked(&self, jid: &Jid, locked: bool) -> WaResult<()> {
        self.record("set_group_locked", format!("{jid} {locked}"))
    }

    async fn set_group_ephemeral(&self, jid: &Jid, timer: EphemeralTimer) -> WaResult<()> {
        self.record("set_group_ephemeral", format!("{jid} {}", timer.label()))
    }

    async fn set_group_join_approval(&self, jid: &Jid, enabled: bool) -> WaResult<()> {
        self.record("set_group_join_approval", format!("{jid} {enabled}"))
    }

    async fn create_group(&self, request: CreateGroupRequest) -> WaResult<GroupInfo> {
        self.record("create_group", request.name.clone())?;
        let jid = Jid::group(&format!("120363{}", self.next_serial()));
        let info = GroupInfo {
            jid: jid.clone(),
            name: request.name,
            topic: None,
            participants: request
                .participants
                .into_iter()
                .map(|jid| Participant {
                    jid,
                    phone_number: None,
                    lid: None,
                    is_admin: false,
                    is_super_admin: false,
                })
                .collect(),
            is_announce: request.settings.announce.unwrap_or(false),
            is_locked: request.settings.locked.unwrap_or(false),
            join_approval: request.settings.join_approval.unwrap_or(false),
        };
        self.state().infos.insert(jid.to_string(), info.clone());
        Ok(info)
    }

    async fn join_group_with_link(&self, code: &str) -> WaResult<Jid> {
        self.record("join_group_with_link", code.to_string())?;
        Ok(Jid::group(&format!("9{}", code.len())))
    }

    async fn leave_group(&self, jid: &Jid) -> WaResult<()> {
        self.record("leave_group", jid.to_string())
    }

    async fn update_participants(
        &self,
        jid: &Jid,
        participants: &[Jid],
        action: ParticipantAction,
    ) -> WaResult<Vec<ParticipantResult>> {
        let listed: Vec<String> = participants.iter().map(|p| p.to_string()).collect();
        self.record(
            "update_participants",
            format!("{jid} {action:?} {}", listed.join(",")),
        )?;

        let mut state = self.state();
        if state.promote_on_update
            && matches!(action, ParticipantAction::Promote | ParticipantAction::Demote)
        {
            let promote = action == ParticipantAction::Promote;
            if let Some(info) = state.infos.get_mut(&jid.to_string()) {
                for member in &mut info.participants {
                    if participants.iter().any(|p| p.bare_user() == member.jid.bare_user()) {
                        member.is_admin = promote;
                    }
                }
            }
        }

        Ok(participants
            .iter()
            .map(|p| ParticipantResult {
                jid: p.clone(),
                status: state.statuses.get(p.bare_user()).copied().unwrap_or(200),
            })
            .collect())
    }

    async fn send_text(&self, to: &Jid, text: &str) -> WaResult<String> {
        self.record("send_text", format!("{to} {text}"))?;
        Ok(format!("MSG{}", self.next_serial()))
    }

    async fn mark_read(&self, chat: &Jid, sender: &Jid, message_ids: &[String]) -> WaResult<()> {
        self.record(
            "mark_read",
            format!("{chat} {sender} {}", message_ids.join(",")),
        )
    }

    async fn local_group_jids(&self) -> WaResult<Vec<Jid>> {
        self.record("local_group_jids", String::new())?;
        Ok(self.state().local_jids.clone())
    }

    async fn local_contact_names(&self) -> WaResult<HashMap<String, String>> {
        self.record("local_contact_names", String::new())?;
        Ok(self.state().local_names.clone())
    }
}

/// Hands out fresh [`MockClient`]s and remembers them per account.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<HashMap<i64, Vec<Arc<MockClient>>>>,
    /// Applied to every client as it is created.
    offline: AtomicBool,
    scripted: Mutex<Vec<(String, WaError, usize)>>,
}

impl MockFactory {
    pub fn created(&self, account_id: i64) -> Vec<Arc<MockClient>> {
        self.created
            .lock()
            .unwrap()
            .get(&account_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn create_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every client created from now on fails `op` `times` times.
    pub fn fail_times(&self, op: &str, err: WaError, times: usize) {
        self.scripted
            .lock()
            .unwrap()
            .push((op.to_string(), err, times));
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn create(&self, account_id: i64, _store_path: &Path) -> WaResult<Arc<dyn WaClient>> {
        let client = MockClient::new(account_id);
        if self.offline.load(Ordering::SeqCst) {
            client.set_connected(false);
        }
        for (op, err, times) in self.scripted.lock().unwrap().iter() {
            client.fail_times(op, err.clone(), *times);
        }
        self.created
            .lock()
            .unwrap()
            .entry(account_id)
            .or_default()
            .push(client.clone());
        Ok(client)
    }
}

#[derive(Default)]
struct ChannelState {
    sent: Vec<(i64, String)>,
    buttons: Vec<(i64, String, Vec<Vec<Button>>)>,
    edits: Vec<(i64, i64, String)>,
    deleted: Vec<(i64, i64)>,
    documents: Vec<(i64, PathBuf, String)>,
    files: HashMap<String, Vec<u8>>,
    failing_downloads: usize,
    next_id: i64,
}

#[derive(Default)]
pub struct MockChannel {
    state: Mutex<ChannelState>,
    downloads: AtomicUsize,
}

impl MockChannel {
    fn state(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap()
    }

    fn next_id(state: &mut ChannelState) -> i64 {
        state.next_id += 1;
        state.next_id
    }

    pub fn put_file(&self, file_id: &str, bytes: Vec<u8>) {
        self.state().files.insert(file_id.to_string(), bytes);
    }

    /// The next `n` downloads fail with a transport error.
    pub fn fail_downloads(&self, n: usize) {
        self.state().failing_downloads = n;
    }

    pub fn sent_texts(&self, chat_id: i64) -> Vec<String> {
        self.state()
            .sent
            .iter()
            .filter(|(chat, _)| *chat == chat_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn button_texts(&self, chat_id: i64) -> Vec<String> {
        self.state()
            .buttons
            .iter()
            .filter(|(chat, _, _)| *chat == chat_id)
            .map(|(_, text, _)| text.clone())
            .collect()
    }

    pub fn edits(&self) -> Vec<String> {
        self.state().edits.iter().map(|(_, _, text)| text.clone()).collect()
    }

    pub fn deleted(&self) -> Vec<(i64, i64)> {
        self.state().deleted.clone()
    }

    pub fn documents(&self) -> Vec<(i64, PathBuf, String)> {
        self.state().documents.clone()
    }

    pub fn download_attempts(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlChannel for MockChannel {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, ChannelError> {
        let mut state = self.state();
        state.sent.push((chat_id, text.to_string()));
        Ok(Self::next_id(&mut state))
    }

    async fn send_buttons(
        &self,
        chat_id: i64,
        text: &str,
        rows: &[Vec<Button>],
    ) -> Result<i64, ChannelError> {
        let mut state = self.state();
        state.buttons.push((chat_id, text.to_string(), rows.to_vec()));
        Ok(Self::next_id(&mut state))
    }

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), ChannelError> {
        self.state().edits.push((chat_id, message_id, text.to_string()));
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ChannelError> {
        self.state().deleted.push((chat_id, message_id));
        Ok(())
    }

    async fn send_document(&self, chat_id: i64, path: &Path, caption: &str) -> Result<i64, ChannelError> {
        let mut state = self.state();
        state.documents.push((chat_id, path.to_path_buf(), caption.to_string()));
        Ok(Self::next_id(&mut state))
    }

    async fn file_info(&self, file_id: &str) -> Result<RemoteFile, ChannelError> {
        let state = self.state();
        let bytes = state.files.get(file_id).ok_or_else(|| ChannelError::Api {
            code: 400,
            description: "Bad Request: invalid file_id".to_string(),
        })?;
        Ok(RemoteFile {
            file_id: file_id.to_string(),
            file_path: format!("documents/{file_id}"),
            size: Some(bytes.len() as u64),
        })
    }

    async fn download(&self, file: &RemoteFile) -> Result<Vec<u8>, ChannelError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.failing_downloads > 0 {
            state.failing_downloads -= 1;
            return Err(ChannelError::Transport("connection reset".to_string()));
        }
        state
            .files
            .get(&file.file_id)
            .cloned()
            .ok_or_else(|| ChannelError::Transport("not found".to_string()))
    }
}

/// Collects progress text.
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn updates(&self) -> Vec<String> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn update(&self, text: &str) {
        self.updates.lock().unwrap().push(text.to_string());
    }
}
