//! Bulk verbs run by the pacer, one group (or name, or link) per step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mira_core::{
    CreateGroupRequest, CreateGroupSettings, EphemeralTimer, Jid, MemberAddMode, Participant,
    ParticipantAction, ParticipantOutcome, ParticipantResult, WaClient, WaError, WaResult,
};
use mira_db::{GroupCatalog, GroupRecord};
use tracing::{debug, warn};

use crate::ingest::invite_code;
use crate::metadata::synthesized_name;
use crate::pacer::TargetOp;
use crate::photo::StagedPhoto;
use crate::report::{Failure, StepReport};
use crate::retry::{ErrorClass, classify};
use crate::stop::StopFlag;

pub const STATUS_MISMATCH: &str = "status tidak sesuai";
pub const NOT_A_MEMBER: &str = "bukan anggota grup";

fn group_jid(record: &GroupRecord) -> WaResult<Jid> {
    record.jid.parse()
}

/// One group setting applied to every target.
#[derive(Clone)]
pub enum SettingChange {
    /// `true`: every member may send messages.
    Announce(bool),
    AddMode(MemberAddMode),
    JoinApproval(bool),
    /// `true`: only admins may edit group info.
    Locked(bool),
    Ephemeral(EphemeralTimer),
    Description(String),
    Photo(Arc<StagedPhoto>),
}

impl SettingChange {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Announce(_) => "Atur siapa yang bisa kirim pesan",
            Self::AddMode(_) => "Atur siapa yang bisa menambah anggota",
            Self::JoinApproval(_) => "Atur persetujuan bergabung",
            Self::Locked(_) => "Atur siapa yang bisa edit info grup",
            Self::Ephemeral(_) => "Atur pesan sementara",
            Self::Description(_) => "Ganti deskripsi grup",
            Self::Photo(_) => "Ganti foto grup",
        }
    }

    pub async fn apply(&self, client: &dyn WaClient, jid: &Jid) -> WaResult<()> {
        match self {
            // Announce mode on means only admins may send.
            Self::Announce(all_members) => client.set_group_announce(jid, !all_members).await,
            Self::AddMode(mode) => client.set_group_member_add_mode(jid, *mode).await,
            Self::JoinApproval(enabled) => client.set_group_join_approval(jid, *enabled).await,
            Self::Locked(locked) => client.set_group_locked(jid, *locked).await,
            Self::Ephemeral(timer) => client.set_group_ephemeral(jid, *timer).await,
            Self::Description(text) => client.set_group_description(jid, text).await,
            Self::Photo(photo) => {
                let bytes = photo
                    .bytes()
                    .await
                    .map_err(|e| WaError::remote(e.to_string()))?;
                client.set_group_photo(jid, bytes).await.map(|_| ())
            }
        }
    }
}

pub struct SettingsOp {
    pub change: SettingChange,
    pub timeout: Duration,
}

#[async_trait]
impl TargetOp<GroupRecord> for SettingsOp {
    fn label(&self, target: &GroupRecord) -> String {
        target.name.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn apply(&self, client: &Arc<dyn WaClient>, target: &GroupRecord) -> WaResult<StepReport> {
        let jid = group_jid(target)?;
        self.change.apply(client.as_ref(), &jid).await?;
        Ok(StepReport::success())
    }
}

/// Every spelling of a phone number the protocol might hand back.
pub fn phone_variations(raw: &str, country_code: &str) -> Vec<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Vec::new();
    }

    let mut out = vec![digits.clone()];
    if let Some(local) = digits.strip_prefix(country_code) {
        out.push(local.to_string());
        out.push(format!("0{local}"));
    } else if let Some(local) = digits.strip_prefix('0') {
        out.push(local.to_string());
        out.push(format!("{country_code}{local}"));
    } else {
        out.push(format!("{country_code}{digits}"));
    }
    out
}

/// Admin flag per phone variation, built from a fresh participant list.
#[derive(Debug, Default)]
pub struct PhoneIndex {
    admins: HashMap<String, bool>,
    country_code: String,
}

impl PhoneIndex {
    pub fn build(participants: &[Participant], country_code: &str) -> Self {
        let mut admins = HashMap::new();
        for p in participants {
            let admin = p.is_admin || p.is_super_admin;
            let ids = std::iter::once(&p.jid)
                .chain(p.phone_number.as_ref())
                .chain(p.lid.as_ref());
            for id in ids {
                for variation in phone_variations(id.bare_user(), country_code) {
                    admins.insert(variation, admin);
                }
            }
        }
        Self {
            admins,
            country_code: country_code.to_string(),
        }
    }

    pub fn admin_flag(&self, number: &str) -> Option<bool> {
        phone_variations(number, &self.country_code)
            .iter()
            .find_map(|v| self.admins.get(v).copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantMode {
    /// One protocol call per group with every number.
    Batch,
    /// One call per number, waiting between numbers.
    OneByOne(Duration),
}

pub struct ParticipantsOp {
    pub action: ParticipantAction,
    pub numbers: Vec<String>,
    pub mode: ParticipantMode,
    pub timeout: Duration,
    pub verify_delay: Duration,
    pub country_code: String,
    pub stop: StopFlag,
}

impl ParticipantsOp {
    fn tally_statuses(group: &str, results: &[ParticipantResult], step: &mut StepReport) {
        for result in results {
            match ParticipantOutcome::from_status(result.status) {
                ParticipantOutcome::Joined => step.success += 1,
                ParticipantOutcome::Invited => step.invited += 1,
                ParticipantOutcome::Failed(code) => step.failures.push(Failure::new(
                    format!("{group} / {}", result.jid.bare_user()),
                    format!("kode {code}"),
                )),
            }
        }
    }

    async fn membership(
        &self,
        client: &dyn WaClient,
        jid: &Jid,
        target: &GroupRecord,
    ) -> WaResult<StepReport> {
        let mut step = StepReport::default();
        match self.mode {
            ParticipantMode::Batch => {
                let jids: Vec<Jid> = self.numbers.iter().map(|n| Jid::user(n)).collect();
                let results = client.update_participants(jid, &jids, self.action).await?;
                Self::tally_statuses(&target.name, &results, &mut step);
            }
            ParticipantMode::OneByOne(delay) => {
                for (i, number) in self.numbers.iter().enumerate() {
                    match client
                        .update_participants(jid, &[Jid::user(number)], self.action)
                        .await
                    {
                        Ok(results) => Self::tally_statuses(&target.name, &results, &mut step),
                        Err(e) if classify(&e) == ErrorClass::Permanent => return Err(e),
                        Err(e) => step
                            .failures
                            .push(Failure::new(format!("{} / {number}", target.name), e.to_string())),
                    }
                    if i + 1 < self.numbers.len() && !self.stop.sleep(delay).await {
                        break;
                    }
                }
            }
        }
        Ok(step)
    }

    async fn admin_change(
        &self,
        client: &dyn WaClient,
        jid: &Jid,
        target: &GroupRecord,
    ) -> WaResult<StepReport> {
        let jids: Vec<Jid> = self.numbers.iter().map(|n| Jid::user(n)).collect();
        match client.update_participants(jid, &jids, self.action).await {
            Ok(results) => debug!(group = %target.name, count = results.len(), "Admin change sent"),
            Err(e) if classify(&e) == ErrorClass::Permanent => return Err(e),
            // The participant list below is the source of truth.
            Err(e) => warn!(group = %target.name, error = %e, "Admin change reported an error"),
        }

        tokio::time::sleep(self.verify_delay).await;
        let info = client.group_info(jid).await?;
        let index = PhoneIndex::build(&info.participants, &self.country_code);
        let desired = self.action == ParticipantAction::Promote;

        let mut step = StepReport::default();
        for number in &self.numbers {
            let label = format!("{} / {number}", target.name);
            match index.admin_flag(number) {
                Some(flag) if flag == desired => step.success += 1,
                Some(_) => step.failures.push(Failure::new(label, STATUS_MISMATCH)),
                None => step.failures.push(Failure::new(label, NOT_A_MEMBER)),
            }
        }
        Ok(step)
    }
}

#[async_trait]
impl TargetOp<GroupRecord> for ParticipantsOp {
    fn label(&self, target: &GroupRecord) -> String {
        target.name.clone()
    }

    fn timeout(&self) -> Duration {
        match self.mode {
            ParticipantMode::Batch => self.timeout + self.verify_delay,
            ParticipantMode::OneByOne(delay) => {
                let n = self.numbers.len().max(1) as u32;
                self.timeout * n + delay * (n - 1)
            }
        }
    }

    async fn apply(&self, client: &Arc<dyn WaClient>, target: &GroupRecord) -> WaResult<StepReport> {
        let jid = group_jid(target)?;
        match self.action {
            ParticipantAction::Add | ParticipantAction::Remove => {
                self.membership(client.as_ref(), &jid, target).await
            }
            ParticipantAction::Promote | ParticipantAction::Demote => {
                self.admin_change(client.as_ref(), &jid, target).await
            }
        }
    }
}

/// Creates one group per name, then applies what creation cannot carry.
pub struct CreateOp {
    pub numbers: Vec<String>,
    pub settings: CreateGroupSettings,
    pub add_mode: Option<MemberAddMode>,
    pub catalog: Arc<GroupCatalog>,
    pub create_timeout: Duration,
    pub post_timeout: Duration,
}

#[async_trait]
impl TargetOp<String> for CreateOp {
    fn label(&self, target: &String) -> String {
        target.clone()
    }

    fn timeout(&self) -> Duration {
        self.create_timeout + self.post_timeout * 2
    }

    async fn apply(&self, client: &Arc<dyn WaClient>, name: &String) -> WaResult<StepReport> {
        let request = CreateGroupRequest {
            name: name.clone(),
            participants: self.numbers.iter().map(|n| Jid::user(n)).collect(),
            settings: self.settings.clone(),
        };
        let info = client.create_group(request).await?;

        if let Some(mode) = self.add_mode {
            match tokio::time::timeout(
                self.post_timeout,
                client.set_group_member_add_mode(&info.jid, mode),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(group = %name, error = %e, "Add-mode after create failed"),
                Err(_) => warn!(group = %name, "Add-mode after create timed out"),
            }
        }

        let link = match tokio::time::timeout(self.post_timeout, client.invite_link(&info.jid, false))
            .await
        {
            Ok(Ok(link)) => Some(link),
            Ok(Err(e)) => {
                debug!(group = %name, error = %e, "Invite link unavailable");
                None
            }
            Err(_) => None,
        };

        if let Err(e) = self.catalog.save(&info.jid.to_string(), name).await {
            warn!(group = %name, error = %e, "Failed to record created group");
        }

        let line = match link {
            Some(link) => format!("{name} — {link}"),
            None => format!("{name} — {}", info.jid),
        };
        Ok(StepReport::success().with_line(line))
    }
}

pub struct JoinOp {
    pub catalog: Arc<GroupCatalog>,
    pub timeout: Duration,
}

#[async_trait]
impl TargetOp<String> for JoinOp {
    fn label(&self, target: &String) -> String {
        target.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn apply(&self, client: &Arc<dyn WaClient>, link: &String) -> WaResult<StepReport> {
        let Some(code) = invite_code(link) else {
            return Ok(StepReport::fail(link, "link tidak valid"));
        };
        let jid = client.join_group_with_link(code).await?;
        let name = match client.group_info(&jid).await {
            Ok(info) if !info.name.trim().is_empty() => info.name,
            _ => synthesized_name(&jid.to_string()),
        };
        if let Err(e) = self.catalog.save(&jid.to_string(), &name).await {
            warn!(group = %name, error = %e, "Failed to record joined group");
        }
        Ok(StepReport::success().with_line(format!("{name} — {link}")))
    }
}

pub struct LeaveOp {
    pub farewell: Option<String>,
    pub catalog: Arc<GroupCatalog>,
    pub timeout: Duration,
}

#[async_trait]
impl TargetOp<GroupRecord> for LeaveOp {
    fn label(&self, target: &GroupRecord) -> String {
        target.name.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout * 2
    }

    async fn apply(&self, client: &Arc<dyn WaClient>, target: &GroupRecord) -> WaResult<StepReport> {
        let jid = group_jid(target)?;
        if let Some(text) = &self.farewell {
            if let Err(e) = client.send_text(&jid, text).await {
                warn!(group = %target.name, error = %e, "Farewell message failed");
            }
        }
        client.leave_group(&jid).await?;
        if let Err(e) = self.catalog.remove(&target.jid).await {
            warn!(group = %target.name, error = %e, "Failed to drop left group from catalog");
        }
        Ok(StepReport::success())
    }
}

pub struct LinksOp {
    pub timeout: Duration,
}

#[async_trait]
impl TargetOp<GroupRecord> for LinksOp {
    fn label(&self, target: &GroupRecord) -> String {
        target.name.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn apply(&self, client: &Arc<dyn WaClient>, target: &GroupRecord) -> WaResult<StepReport> {
        let jid = group_jid(target)?;
        let link = client.invite_link(&jid, false).await?;
        Ok(StepReport::success().with_line(format!("{} — {link}", target.name)))
    }
}
