//! Per-operator, per-feature conversations that collect a job's inputs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mira_core::{CreateGroupSettings, EphemeralTimer, MemberAddMode, ParticipantAction};
use mira_db::{GroupCatalog, GroupRecord};

use crate::broadcast::{AccountRef, CampaignPlan};
use crate::config::EngineConfig;
use crate::error::{Result, WorkerError};
use crate::ingest::{extract_invite_links, parse_bounded, parse_names, parse_phones};
use crate::metadata::visible_groups;
use crate::ops::{ParticipantMode, SettingChange};
use crate::photo::StagedPhoto;

/// Sentinel closing a "keep adding" phase.
pub const DONE_SENTINEL: &str = "/mulai";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Announce,
    AddMode,
    JoinApproval,
    Locked,
    Ephemeral,
    Description,
    Photo,
    AddMembers,
    RemoveMembers,
    Promote,
    Demote,
    Create,
    Join,
    Leave,
    Links,
    Broadcast,
}

impl Feature {
    pub const ALL: [Feature; 16] = [
        Feature::Announce,
        Feature::AddMode,
        Feature::JoinApproval,
        Feature::Locked,
        Feature::Ephemeral,
        Feature::Description,
        Feature::Photo,
        Feature::AddMembers,
        Feature::RemoveMembers,
        Feature::Promote,
        Feature::Demote,
        Feature::Create,
        Feature::Join,
        Feature::Leave,
        Feature::Links,
        Feature::Broadcast,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Announce => "announce",
            Self::AddMode => "add_mode",
            Self::JoinApproval => "approval",
            Self::Locked => "locked",
            Self::Ephemeral => "ephemeral",
            Self::Description => "description",
            Self::Photo => "photo",
            Self::AddMembers => "add_members",
            Self::RemoveMembers => "remove_members",
            Self::Promote => "promote",
            Self::Demote => "demote",
            Self::Create => "create",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Links => "links",
            Self::Broadcast => "broadcast",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Announce => "Atur kirim pesan",
            Self::AddMode => "Atur tambah anggota",
            Self::JoinApproval => "Atur persetujuan gabung",
            Self::Locked => "Atur edit info",
            Self::Ephemeral => "Pesan sementara",
            Self::Description => "Ganti deskripsi",
            Self::Photo => "Ganti foto",
            Self::AddMembers => "Tambah anggota",
            Self::RemoveMembers => "Keluarkan anggota",
            Self::Promote => "Jadikan admin",
            Self::Demote => "Cabut admin",
            Self::Create => "Buat grup",
            Self::Join => "Gabung grup",
            Self::Leave => "Keluar grup",
            Self::Links => "Ambil link grup",
            Self::Broadcast => "Broadcast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    BetweenGroups,
    BetweenNumbers,
    /// Stagger between broadcast accounts.
    Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateField {
    Announce,
    AddMode,
    JoinApproval,
    Locked,
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    /// on/off for the feature's own setting.
    Toggle,
    Ephemeral,
    Participants,
    MessageSource,
    TargetSource,
    Farewell,
    Create(CreateField),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    GroupNames,
    InviteLinks,
    Description,
    Farewell,
    BroadcastMessages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingGroupSelector,
    AwaitingNumbers,
    AwaitingDelay(DelayKind),
    AwaitingMode(ModeKind),
    AwaitingText(TextKind),
    AwaitingPhoto,
    AwaitingConfirmation,
    Running,
    Completed,
}

impl Phase {
    /// Phases that take operator input.
    pub fn is_collecting(self) -> bool {
        !matches!(self, Self::Idle | Self::Running | Self::Completed)
    }
}

#[derive(Debug, Clone)]
pub enum Input {
    Text(String),
    Document(Vec<u8>),
    Photo(Vec<u8>),
    /// Inline-button payload.
    Choice(String),
    Done,
}

impl Input {
    /// `/mulai` typed as text counts as `Done`.
    pub fn from_text(text: &str) -> Self {
        if text.trim().eq_ignore_ascii_case(DONE_SENTINEL) {
            Self::Done
        } else {
            Self::Text(text.to_string())
        }
    }

    fn answer(&self) -> Option<String> {
        match self {
            Self::Text(t) | Self::Choice(t) => Some(t.trim().to_lowercase()),
            _ => None,
        }
    }

    fn text(&self) -> Option<String> {
        match self {
            Self::Text(t) => Some(t.clone()),
            Self::Document(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }
}

/// Extra context for rendering a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptDetail {
    None,
    /// Manual broadcast messages: whose turn it is.
    Account {
        phone: String,
        index: usize,
        total: usize,
        can_finish: bool,
    },
    /// Collect phase: items so far.
    Collected(usize),
}

/// What the operator is told after an input.
pub enum Reply {
    Prompt {
        feature: Feature,
        phase: Phase,
        note: Option<String>,
        detail: PromptDetail,
    },
    Invalid {
        feature: Feature,
        phase: Phase,
        reason: String,
        detail: PromptDetail,
    },
    Confirm {
        feature: Feature,
        summary: Vec<String>,
    },
    Start(Plan),
    Cancelled(Feature),
}

/// A fully collected job, ready to run.
pub enum Plan {
    Settings {
        change: SettingChange,
        targets: Vec<GroupRecord>,
        delay: Duration,
    },
    Participants {
        action: ParticipantAction,
        targets: Vec<GroupRecord>,
        numbers: Vec<String>,
        mode: ParticipantMode,
        delay: Duration,
    },
    Create {
        names: Vec<String>,
        numbers: Vec<String>,
        settings: CreateGroupSettings,
        add_mode: Option<MemberAddMode>,
        delay: Duration,
    },
    Join {
        links: Vec<String>,
        delay: Duration,
    },
    Leave {
        targets: Vec<GroupRecord>,
        farewell: Option<String>,
        delay: Duration,
    },
    Links {
        targets: Vec<GroupRecord>,
        delay: Duration,
    },
    Broadcast(CampaignPlan),
}

impl Plan {
    pub fn feature_title(&self) -> String {
        match self {
            Self::Settings { change, .. } => change.title().to_string(),
            Self::Participants { action, .. } => match action {
                ParticipantAction::Add => Feature::AddMembers.title(),
                ParticipantAction::Remove => Feature::RemoveMembers.title(),
                ParticipantAction::Promote => Feature::Promote.title(),
                ParticipantAction::Demote => Feature::Demote.title(),
            }
            .to_string(),
            Self::Create { .. } => Feature::Create.title().to_string(),
            Self::Join { .. } => Feature::Join.title().to_string(),
            Self::Leave { .. } => Feature::Leave.title().to_string(),
            Self::Links { .. } => Feature::Links.title().to_string(),
            Self::Broadcast(_) => Feature::Broadcast.title().to_string(),
        }
    }
}

fn parse_switch(answer: &str) -> Option<bool> {
    match answer {
        "on" | "ya" | "yes" | "aktif" | "1" => Some(true),
        "off" | "tidak" | "no" | "nonaktif" | "0" => Some(false),
        _ => None,
    }
}

fn is_skip(answer: &str) -> bool {
    matches!(answer, "skip" | "lewati" | "-")
}

#[derive(Default)]
struct Draft {
    targets: Vec<GroupRecord>,
    numbers: Vec<String>,
    names: Vec<String>,
    links: Vec<String>,
    group_delay: Option<Duration>,
    number_delay: Option<Duration>,
    offset_delay: Option<Duration>,
    toggle: Option<bool>,
    add_mode: Option<MemberAddMode>,
    ephemeral: Option<EphemeralTimer>,
    one_by_one: bool,
    description: Option<String>,
    wants_farewell: bool,
    farewell: Option<String>,
    photo: Option<Arc<StagedPhoto>>,
    create: CreateGroupSettings,
    create_add_mode: Option<MemberAddMode>,
    accounts: Vec<AccountRef>,
    messages: HashMap<i64, Vec<String>>,
    next_account: usize,
    messages_from_file: bool,
    /// Broadcast only; other features take names or a file.
    targets_from_file: Option<bool>,
}

/// Lookups a conversation needs while handling input.
pub struct FsmContext<'a> {
    pub catalog: &'a GroupCatalog,
    pub config: &'a EngineConfig,
}

pub struct Conversation {
    pub feature: Feature,
    pub phase: Phase,
    draft: Draft,
}

impl Conversation {
    /// Starts a conversation. `accounts` lists the operator's accounts and is
    /// only used by broadcasts.
    pub fn new(feature: Feature, accounts: Vec<AccountRef>) -> (Self, Reply) {
        let mut conversation = Self {
            feature,
            phase: Phase::Idle,
            draft: Draft {
                accounts,
                ..Draft::default()
            },
        };
        let phase = conversation.sequence()[0];
        conversation.phase = phase;
        let reply = conversation.prompt(None);
        (conversation, reply)
    }

    /// Phases in order for this feature, given what is collected so far.
    fn sequence(&self) -> Vec<Phase> {
        use Phase::*;
        let delay = AwaitingDelay(DelayKind::BetweenGroups);
        match self.feature {
            Feature::Announce | Feature::AddMode | Feature::JoinApproval | Feature::Locked => {
                vec![AwaitingGroupSelector, AwaitingMode(ModeKind::Toggle), delay]
            }
            Feature::Ephemeral => {
                vec![AwaitingGroupSelector, AwaitingMode(ModeKind::Ephemeral), delay]
            }
            Feature::Description => vec![
                AwaitingGroupSelector,
                AwaitingText(TextKind::Description),
                delay,
            ],
            Feature::Photo => vec![AwaitingGroupSelector, AwaitingPhoto, delay],
            Feature::AddMembers | Feature::RemoveMembers => {
                let mut seq = vec![
                    AwaitingGroupSelector,
                    AwaitingNumbers,
                    delay,
                    AwaitingMode(ModeKind::Participants),
                ];
                if self.draft.one_by_one {
                    seq.push(AwaitingDelay(DelayKind::BetweenNumbers));
                }
                seq
            }
            Feature::Promote | Feature::Demote => {
                vec![AwaitingGroupSelector, AwaitingNumbers, delay]
            }
            Feature::Create => vec![
                AwaitingText(TextKind::GroupNames),
                AwaitingNumbers,
                AwaitingMode(ModeKind::Create(CreateField::Announce)),
                AwaitingMode(ModeKind::Create(CreateField::AddMode)),
                AwaitingMode(ModeKind::Create(CreateField::JoinApproval)),
                AwaitingMode(ModeKind::Create(CreateField::Locked)),
                AwaitingMode(ModeKind::Create(CreateField::Ephemeral)),
                delay,
            ],
            Feature::Join => vec![AwaitingText(TextKind::InviteLinks), delay],
            Feature::Leave => {
                let mut seq = vec![AwaitingGroupSelector, AwaitingMode(ModeKind::Farewell)];
                if self.draft.wants_farewell {
                    seq.push(AwaitingText(TextKind::Farewell));
                }
                seq.push(delay);
                seq
            }
            Feature::Links => vec![AwaitingGroupSelector, delay],
            Feature::Broadcast => vec![
                AwaitingDelay(DelayKind::Offset),
                delay,
                AwaitingMode(ModeKind::MessageSource),
                AwaitingText(TextKind::BroadcastMessages),
                AwaitingMode(ModeKind::TargetSource),
                AwaitingGroupSelector,
            ],
        }
    }

    /// Add/remove start as soon as their inputs are complete.
    fn needs_confirmation(&self) -> bool {
        !matches!(self.feature, Feature::AddMembers | Feature::RemoveMembers)
    }

    fn detail(&self) -> PromptDetail {
        match self.phase {
            Phase::AwaitingText(TextKind::BroadcastMessages) if !self.draft.messages_from_file => {
                let total = self.draft.accounts.len();
                let index = self.draft.next_account.min(total.saturating_sub(1));
                PromptDetail::Account {
                    phone: self
                        .draft
                        .accounts
                        .get(index)
                        .map(|a| a.phone.clone())
                        .unwrap_or_default(),
                    index,
                    total,
                    can_finish: self.every_account_has_message(),
                }
            }
            Phase::AwaitingText(TextKind::GroupNames) => {
                PromptDetail::Collected(self.draft.names.len())
            }
            Phase::AwaitingNumbers if self.feature == Feature::Create => {
                PromptDetail::Collected(self.draft.numbers.len())
            }
            _ => PromptDetail::None,
        }
    }

    fn prompt(&self, note: Option<String>) -> Reply {
        Reply::Prompt {
            feature: self.feature,
            phase: self.phase,
            note,
            detail: self.detail(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> Reply {
        Reply::Invalid {
            feature: self.feature,
            phase: self.phase,
            reason: reason.into(),
            detail: self.detail(),
        }
    }

    /// Moves past the current phase.
    fn advance(&mut self, note: Option<String>) -> Reply {
        let sequence = self.sequence();
        let next = sequence
            .iter()
            .position(|p| *p == self.phase)
            .and_then(|i| sequence.get(i + 1))
            .copied();

        match next {
            Some(phase) => {
                self.phase = phase;
                self.prompt(note)
            }
            None if self.needs_confirmation() => {
                self.phase = Phase::AwaitingConfirmation;
                Reply::Confirm {
                    feature: self.feature,
                    summary: self.summary(note),
                }
            }
            None => self.start(),
        }
    }

    fn start(&mut self) -> Reply {
        match self.build_plan() {
            Some(plan) => {
                self.phase = Phase::Running;
                Reply::Start(plan)
            }
            None => self.invalid("Data belum lengkap, ulangi dari awal dengan /cancel"),
        }
    }

    fn summary(&self, note: Option<String>) -> Vec<String> {
        let d = &self.draft;
        let mut lines = Vec::new();
        lines.extend(note);
        lines.push(format!("Fitur: {}", self.feature.title()));
        if !d.targets.is_empty() {
            lines.push(format!("Grup target: {}", d.targets.len()));
        }
        if !d.names.is_empty() {
            lines.push(format!("Grup baru: {}", d.names.len()));
        }
        if !d.links.is_empty() {
            lines.push(format!("Link: {}", d.links.len()));
        }
        if !d.numbers.is_empty() {
            lines.push(format!("Nomor: {}", d.numbers.len()));
        }
        if let Some(delay) = d.offset_delay {
            lines.push(format!("Jeda antar akun: {} detik", delay.as_secs()));
        }
        if let Some(delay) = d.group_delay {
            lines.push(format!("Jeda antar grup: {} detik", delay.as_secs()));
        }
        if self.feature == Feature::Broadcast {
            let ready = d.messages.values().filter(|m| !m.is_empty()).count();
            lines.push(format!("Akun dengan pesan: {ready}/{}", d.accounts.len()));
        }
        lines
    }

    fn every_account_has_message(&self) -> bool {
        !self.draft.accounts.is_empty()
            && self.draft.accounts.iter().all(|a| {
                self.draft
                    .messages
                    .get(&a.id)
                    .is_some_and(|m| !m.is_empty())
            })
    }

    pub async fn handle(&mut self, input: Input, ctx: &FsmContext<'_>) -> Reply {
        match self.phase {
            Phase::AwaitingGroupSelector => self.on_group_selector(input, ctx).await,
            Phase::AwaitingNumbers => self.on_numbers(input, ctx),
            Phase::AwaitingDelay(kind) => self.on_delay(kind, input, ctx),
            Phase::AwaitingMode(kind) => self.on_mode(kind, input),
            Phase::AwaitingText(kind) => self.on_text(kind, input, ctx),
            Phase::AwaitingPhoto => self.on_photo(input, ctx).await,
            Phase::AwaitingConfirmation => self.on_confirmation(input),
            Phase::Idle | Phase::Running | Phase::Completed => {
                self.invalid("Tidak ada input yang ditunggu")
            }
        }
    }

    async fn on_group_selector(&mut self, input: Input, ctx: &FsmContext<'_>) -> Reply {
        match (self.draft.targets_from_file, &input) {
            (Some(true), Input::Text(_)) => return self.invalid("Kirim file .txt berisi nama grup"),
            (Some(false), Input::Document(_)) => return self.invalid("Ketik nama grup, satu per baris"),
            _ => {}
        }
        let Some(text) = input.text() else {
            return self.invalid("Kirim nama grup (satu per baris) atau file .txt");
        };
        let names = parse_names(&text);
        if names.is_empty() {
            return self.invalid("Daftar nama grup kosong");
        }

        let everything = names.len() == 1 && matches!(names[0].to_lowercase().as_str(), "semua" | "all");
        let lookup = if everything {
            ctx.catalog.list_all().await.map(visible_groups)
        } else {
            ctx.catalog.search_exact_multi(&names).await
        };
        let found = match lookup {
            Ok(found) => found,
            Err(e) => return self.invalid(format!("Gagal membaca katalog grup: {e}")),
        };
        if found.is_empty() {
            return self.invalid("Tidak ada grup yang cocok. Coba /refresh lalu kirim ulang.");
        }

        let missing: Vec<String> = if everything {
            Vec::new()
        } else {
            names
                .iter()
                .filter(|n| !found.iter().any(|g| g.name.eq_ignore_ascii_case(n)))
                .cloned()
                .collect()
        };
        let mut note = format!("✅ {} grup ditemukan", found.len());
        if !missing.is_empty() {
            note.push_str(&format!(
                "\n⚠️ Tidak ditemukan ({}): {}",
                missing.len(),
                missing.join(", ")
            ));
        }
        self.draft.targets = found;
        self.advance(Some(note))
    }

    fn on_numbers(&mut self, input: Input, ctx: &FsmContext<'_>) -> Reply {
        let collecting = self.feature == Feature::Create;
        if collecting && matches!(input, Input::Done) {
            return self.advance(None);
        }
        let Some(text) = input.text() else {
            return self.invalid("Kirim nomor (satu per baris) atau file vCard");
        };

        let batch = parse_phones(&text, &ctx.config.country_code);
        if batch.is_empty() {
            return self.invalid("Tidak ada nomor valid (10-15 digit)");
        }
        let mut note = format!("✅ {} nomor valid", batch.valid.len());
        if !batch.invalid.is_empty() {
            note.push_str(&format!("\n⚠️ Diabaikan: {}", batch.invalid.join(", ")));
        }

        if collecting {
            for number in batch.valid {
                if !self.draft.numbers.contains(&number) {
                    self.draft.numbers.push(number);
                }
            }
            return self.prompt(Some(note));
        }
        self.draft.numbers = batch.valid;
        self.advance(Some(note))
    }

    fn on_delay(&mut self, kind: DelayKind, input: Input, ctx: &FsmContext<'_>) -> Reply {
        let max = ctx.config.max_delay_secs;
        let Some(secs) = input.answer().and_then(|a| parse_bounded(&a, 0, max)) else {
            return self.invalid(format!("Masukkan angka detik antara 0 dan {max}"));
        };
        let delay = Duration::from_secs(secs);
        match kind {
            DelayKind::BetweenGroups => self.draft.group_delay = Some(delay),
            DelayKind::BetweenNumbers => self.draft.number_delay = Some(delay),
            DelayKind::Offset => self.draft.offset_delay = Some(delay),
        }
        self.advance(None)
    }

    fn on_mode(&mut self, kind: ModeKind, input: Input) -> Reply {
        let Some(answer) = input.answer() else {
            return self.invalid("Pilih salah satu opsi");
        };

        match kind {
            ModeKind::Toggle => match parse_switch(&answer) {
                Some(on) => {
                    self.draft.toggle = Some(on);
                    if self.feature == Feature::AddMode {
                        self.draft.add_mode = Some(if on {
                            MemberAddMode::AllMembers
                        } else {
                            MemberAddMode::AdminsOnly
                        });
                    }
                }
                None => return self.invalid("Pilih on atau off"),
            },
            ModeKind::Ephemeral => match EphemeralTimer::parse(&answer) {
                Some(timer) => self.draft.ephemeral = Some(timer),
                None => return self.invalid("Pilih off, 24h, 7d atau 90d"),
            },
            ModeKind::Participants => match answer.as_str() {
                "batch" | "sekaligus" => self.draft.one_by_one = false,
                "one" | "satu" | "satu-satu" | "satu per satu" => self.draft.one_by_one = true,
                _ => return self.invalid("Pilih sekaligus atau satu-satu"),
            },
            ModeKind::MessageSource => match answer.as_str() {
                "file" => self.draft.messages_from_file = true,
                "manual" => {
                    self.draft.messages_from_file = false;
                    self.draft.next_account = 0;
                }
                _ => return self.invalid("Pilih file atau manual"),
            },
            ModeKind::TargetSource => match answer.as_str() {
                "file" => self.draft.targets_from_file = Some(true),
                "manual" => self.draft.targets_from_file = Some(false),
                _ => return self.invalid("Pilih file atau manual"),
            },
            ModeKind::Farewell => match parse_switch(&answer) {
                Some(wants) => self.draft.wants_farewell = wants,
                None => return self.invalid("Pilih ya atau tidak"),
            },
            ModeKind::Create(field) => {
                if !is_skip(&answer) {
                    if let Err(reason) = self.apply_create_field(field, &answer) {
                        return self.invalid(reason);
                    }
                }
            }
        }
        self.advance(None)
    }

    fn apply_create_field(&mut self, field: CreateField, answer: &str) -> std::result::Result<(), &'static str> {
        let settings = &mut self.draft.create;
        if field == CreateField::Ephemeral {
            settings.ephemeral = Some(EphemeralTimer::parse(answer).ok_or("Pilih off, 24h, 7d, 90d atau lewati")?);
            return Ok(());
        }
        let on = parse_switch(answer).ok_or("Pilih on, off atau lewati")?;
        match field {
            // "on" is the permissive choice throughout.
            CreateField::Announce => settings.announce = Some(!on),
            CreateField::Locked => settings.locked = Some(!on),
            CreateField::JoinApproval => settings.join_approval = Some(on),
            CreateField::AddMode => {
                self.draft.create_add_mode = Some(if on {
                    MemberAddMode::AllMembers
                } else {
                    MemberAddMode::AdminsOnly
                })
            }
            CreateField::Ephemeral => {}
        }
        Ok(())
    }

    fn on_text(&mut self, kind: TextKind, input: Input, ctx: &FsmContext<'_>) -> Reply {
        match kind {
            TextKind::GroupNames => {
                if matches!(input, Input::Done) {
                    if self.draft.names.is_empty() {
                        return self.invalid("Belum ada nama grup");
                    }
                    return self.advance(None);
                }
                let Some(text) = input.text() else {
                    return self.invalid("Kirim nama grup, satu per baris");
                };
                let names = parse_names(&text);
                if names.is_empty() {
                    return self.invalid("Daftar nama grup kosong");
                }
                self.draft.names.extend(names);
                self.prompt(None)
            }
            TextKind::InviteLinks => {
                let Some(text) = input.text() else {
                    return self.invalid("Kirim link undangan grup");
                };
                let links = extract_invite_links(&text);
                if links.is_empty() {
                    return self.invalid("Tidak ada link chat.whatsapp.com yang valid");
                }
                let note = format!("✅ {} link ditemukan", links.len());
                self.draft.links = links;
                self.advance(Some(note))
            }
            TextKind::Description => {
                let Some(text) = input.text() else {
                    return self.invalid("Kirim teks deskripsi");
                };
                let text = text.trim().to_string();
                let limit = ctx.config.description_limit;
                if text.is_empty() {
                    return self.invalid("Deskripsi kosong");
                }
                if text.len() > limit {
                    return self.invalid(format!("Deskripsi maksimal {limit} byte"));
                }
                self.draft.description = Some(text);
                self.advance(None)
            }
            TextKind::Farewell => {
                let Some(text) = input.text().filter(|t| !t.trim().is_empty()) else {
                    return self.invalid("Kirim teks pesan perpisahan");
                };
                self.draft.farewell = Some(text.trim().to_string());
                self.advance(None)
            }
            TextKind::BroadcastMessages => self.on_broadcast_messages(input),
        }
    }

    fn on_broadcast_messages(&mut self, input: Input) -> Reply {
        if self.draft.accounts.is_empty() {
            return self.invalid("Belum ada akun WhatsApp");
        }

        if self.draft.messages_from_file {
            let Some(text) = input.text() else {
                return self.invalid("Kirim file berisi pesan");
            };
            let messages = split_messages(&text);
            if messages.is_empty() {
                return self.invalid("File pesan kosong");
            }
            let count = messages.len();
            let accounts: Vec<i64> = self.draft.accounts.iter().map(|a| a.id).collect();
            self.draft.messages.clear();
            for (i, message) in messages.into_iter().enumerate() {
                let account = accounts[i % accounts.len()];
                self.draft.messages.entry(account).or_default().push(message);
            }
            return self.advance(Some(format!("✅ {count} pesan dibagi ke {} akun", accounts.len())));
        }

        if matches!(input, Input::Done) {
            if !self.every_account_has_message() {
                return self.invalid("Setiap akun butuh minimal satu pesan");
            }
            return self.advance(None);
        }
        let Some(text) = input.text().filter(|t| !t.trim().is_empty()) else {
            return self.invalid("Kirim teks pesan");
        };

        // A later turn overwrites the account's earlier message.
        let index = self.draft.next_account % self.draft.accounts.len();
        let account = self.draft.accounts[index].id;
        let replaced = self
            .draft
            .messages
            .insert(account, vec![text.trim().to_string()])
            .is_some();
        self.draft.next_account = (index + 1) % self.draft.accounts.len();
        let note = if replaced { "✅ Pesan diganti" } else { "✅ Pesan disimpan" };
        self.prompt(Some(note.to_string()))
    }

    async fn on_photo(&mut self, input: Input, ctx: &FsmContext<'_>) -> Reply {
        let bytes = match input {
            Input::Photo(bytes) | Input::Document(bytes) => bytes,
            _ => return self.invalid("Kirim foto atau file gambar"),
        };
        if bytes.is_empty() {
            return self.invalid("File kosong");
        }
        match StagedPhoto::prepare(bytes, ctx.config.photo_size).await {
            Ok(photo) => {
                self.draft.photo = Some(Arc::new(photo));
                self.advance(Some("✅ Foto siap".to_string()))
            }
            Err(e) => self.invalid(format!("Gambar tidak bisa dibaca: {e}")),
        }
    }

    fn on_confirmation(&mut self, input: Input) -> Reply {
        match input.answer().as_deref() {
            Some("ya" | "yes" | "confirm" | "mulai") => self.start(),
            Some("batal" | "no" | "tidak" | "cancel") => {
                self.phase = Phase::Completed;
                Reply::Cancelled(self.feature)
            }
            _ => self.invalid("Pilih ya untuk mulai atau batal"),
        }
    }

    fn build_plan(&mut self) -> Option<Plan> {
        let d = &mut self.draft;
        let delay = d.group_delay?;
        let plan = match self.feature {
            Feature::Announce => Plan::Settings {
                change: SettingChange::Announce(d.toggle?),
                targets: d.targets.clone(),
                delay,
            },
            Feature::AddMode => Plan::Settings {
                change: SettingChange::AddMode(d.add_mode?),
                targets: d.targets.clone(),
                delay,
            },
            Feature::JoinApproval => Plan::Settings {
                change: SettingChange::JoinApproval(d.toggle?),
                targets: d.targets.clone(),
                delay,
            },
            // "on" lets every member edit.
            Feature::Locked => Plan::Settings {
                change: SettingChange::Locked(!d.toggle?),
                targets: d.targets.clone(),
                delay,
            },
            Feature::Ephemeral => Plan::Settings {
                change: SettingChange::Ephemeral(d.ephemeral?),
                targets: d.targets.clone(),
                delay,
            },
            Feature::Description => Plan::Settings {
                change: SettingChange::Description(d.description.clone()?),
                targets: d.targets.clone(),
                delay,
            },
            Feature::Photo => Plan::Settings {
                change: SettingChange::Photo(d.photo.clone()?),
                targets: d.targets.clone(),
                delay,
            },
            Feature::AddMembers | Feature::RemoveMembers | Feature::Promote | Feature::Demote => {
                let action = match self.feature {
                    Feature::AddMembers => ParticipantAction::Add,
                    Feature::RemoveMembers => ParticipantAction::Remove,
                    Feature::Promote => ParticipantAction::Promote,
                    _ => ParticipantAction::Demote,
                };
                let mode = if d.one_by_one {
                    ParticipantMode::OneByOne(d.number_delay?)
                } else {
                    ParticipantMode::Batch
                };
                Plan::Participants {
                    action,
                    targets: d.targets.clone(),
                    numbers: d.numbers.clone(),
                    mode,
                    delay,
                }
            }
            Feature::Create => Plan::Create {
                names: d.names.clone(),
                numbers: d.numbers.clone(),
                settings: d.create.clone(),
                add_mode: d.create_add_mode,
                delay,
            },
            Feature::Join => Plan::Join {
                links: d.links.clone(),
                delay,
            },
            Feature::Leave => Plan::Leave {
                targets: d.targets.clone(),
                farewell: d.farewell.clone(),
                delay,
            },
            Feature::Links => Plan::Links {
                targets: d.targets.clone(),
                delay,
            },
            Feature::Broadcast => Plan::Broadcast(CampaignPlan {
                accounts: d.accounts.clone(),
                messages: d.messages.clone(),
                targets: d.targets.clone(),
                offset_delay: d.offset_delay?,
                group_delay: delay,
                vary_messages: true,
            }),
        };
        Some(plan)
    }
}

/// Paragraphs when the text uses blank-line separators, lines otherwise.
fn split_messages(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let paragraphs: Vec<String> = normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if paragraphs.len() > 1 {
        paragraphs
    } else {
        parse_names(&normalized)
    }
}

/// Every operator's conversations, keyed by feature.
///
/// At most one conversation per operator collects input at a time; others
/// may be running jobs.
#[derive(Default)]
pub struct Conversations {
    map: HashMap<(i64, Feature), Conversation>,
}

impl Conversations {
    pub fn begin(&mut self, operator: i64, feature: Feature, accounts: Vec<AccountRef>) -> Result<Reply> {
        if let Some(existing) = self.map.get(&(operator, feature)) {
            if existing.phase != Phase::Completed {
                return Err(WorkerError::Busy(format!(
                    "{} masih berjalan. Gunakan /stop atau /cancel dulu.",
                    feature.title()
                )));
            }
        }
        if let Some(collecting) = self.collecting_feature(operator) {
            return Err(WorkerError::Busy(format!(
                "Selesaikan {} dulu atau /cancel.",
                collecting.title()
            )));
        }

        let (conversation, reply) = Conversation::new(feature, accounts);
        self.map.insert((operator, feature), conversation);
        Ok(reply)
    }

    pub fn collecting_feature(&self, operator: i64) -> Option<Feature> {
        self.map
            .iter()
            .find(|((op, _), c)| *op == operator && c.phase.is_collecting())
            .map(|((_, f), _)| *f)
    }

    /// Removes the collecting conversation so it can be driven without
    /// holding the map; hand it back with [`Conversations::put`].
    pub fn take_collecting(&mut self, operator: i64) -> Option<Conversation> {
        let feature = self.collecting_feature(operator)?;
        self.map.remove(&(operator, feature))
    }

    /// Stores the conversation back unless it reached `Completed`.
    pub fn put(&mut self, operator: i64, conversation: Conversation) {
        if conversation.phase != Phase::Completed {
            self.map.insert((operator, conversation.feature), conversation);
        }
    }

    pub fn finish(&mut self, operator: i64, feature: Feature) {
        self.map.remove(&(operator, feature));
    }

    /// Abandons the collecting conversation, if any.
    pub fn cancel(&mut self, operator: i64) -> Option<Feature> {
        self.take_collecting(operator).map(|c| c.feature)
    }

    pub fn clear(&mut self, operator: i64) {
        self.map.retain(|(op, _), _| *op != operator);
    }

    pub fn active(&self, operator: i64) -> Vec<(Feature, Phase)> {
        let mut active: Vec<_> = self
            .map
            .iter()
            .filter(|((op, _), _)| *op == operator)
            .map(|((_, f), c)| (*f, c.phase))
            .collect();
        active.sort_by_key(|(f, _)| f.key());
        active
    }
}
