//! Operator-facing text and keyboards.

use std::fmt::Write;

use mira_core::format_phone_number;
use mira_worker::{
    Button, CreateField, DelayKind, EngineStatus, Feature, GroupRecord, ModeKind, Phase,
    PromptDetail, Reply, TextKind, WorkerEvent,
};

use crate::commands::{choice_data, command_data, feature_data};

/// A message with optional inline buttons.
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub text: String,
    pub rows: Vec<Vec<Button>>,
}

impl Rendered {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            rows: Vec::new(),
        }
    }

    fn with_rows(mut self, rows: Vec<Vec<Button>>) -> Self {
        self.rows = rows;
        self
    }
}

const MENU_LAYOUT: &[&[Feature]] = &[
    &[Feature::Announce, Feature::AddMode],
    &[Feature::JoinApproval, Feature::Locked],
    &[Feature::Ephemeral, Feature::Description],
    &[Feature::Photo, Feature::Links],
    &[Feature::AddMembers, Feature::RemoveMembers],
    &[Feature::Promote, Feature::Demote],
    &[Feature::Create, Feature::Join],
    &[Feature::Leave, Feature::Broadcast],
];

pub fn menu() -> Rendered {
    let mut rows: Vec<Vec<Button>> = MENU_LAYOUT
        .iter()
        .map(|row| {
            row.iter()
                .map(|f| Button::new(f.title(), feature_data(*f)))
                .collect()
        })
        .collect();
    rows.push(vec![
        Button::new("📊 Status", command_data("status")),
        Button::new("🔄 Refresh grup", command_data("refresh")),
    ]);
    Rendered::text("🤖 Mira\nPilih fitur:").with_rows(rows)
}

pub fn help() -> Rendered {
    Rendered::text(
        "Perintah:\n\
         /pair <nomor> - hubungkan akun WhatsApp\n\
         /use <nomor> - pilih akun aktif\n\
         /status - akun dan proses berjalan\n\
         /groups [kata] - daftar atau cari grup\n\
         /refresh - muat ulang daftar grup\n\
         /stop - hentikan proses berjalan\n\
         /cancel - batalkan input fitur\n\
         /logout - keluarkan akun aktif\n\
         /reset - hapus semua akun\n\
         /menu - tampilkan menu fitur",
    )
}

fn switch_row() -> Vec<Button> {
    vec![Button::new("On", choice_data("on")), Button::new("Off", choice_data("off"))]
}

fn ephemeral_row() -> Vec<Button> {
    ["off", "24h", "7d", "90d"]
        .iter()
        .map(|v| Button::new(*v, choice_data(v)))
        .collect()
}

fn skip_row() -> Vec<Button> {
    vec![Button::new("Lewati", choice_data("lewati"))]
}

fn toggle_question(feature: Feature) -> &'static str {
    match feature {
        Feature::Announce => "Izinkan semua anggota mengirim pesan?",
        Feature::AddMode => "Izinkan semua anggota menambah anggota?",
        Feature::JoinApproval => "Wajibkan persetujuan admin untuk bergabung?",
        Feature::Locked => "Izinkan semua anggota mengedit info grup?",
        _ => "Aktifkan?",
    }
}

fn create_question(field: CreateField) -> &'static str {
    match field {
        CreateField::Announce => "Grup baru: semua anggota boleh mengirim pesan?",
        CreateField::AddMode => "Grup baru: semua anggota boleh menambah anggota?",
        CreateField::JoinApproval => "Grup baru: wajib persetujuan admin untuk bergabung?",
        CreateField::Locked => "Grup baru: semua anggota boleh mengedit info grup?",
        CreateField::Ephemeral => "Grup baru: pesan sementara?",
    }
}

fn prompt_body(feature: Feature, phase: Phase, detail: &PromptDetail) -> Rendered {
    match phase {
        Phase::AwaitingGroupSelector => Rendered::text(
            "Kirim nama grup target, satu per baris, atau file .txt.\nKetik semua untuk memilih semua grup.",
        ),
        Phase::AwaitingNumbers => match detail {
            PromptDetail::Collected(n) => Rendered::text(format!(
                "Kirim nomor anggota (teks atau file vCard).\nTerkumpul: {n} nomor. Ketik /mulai jika selesai."
            )),
            _ => Rendered::text("Kirim nomor, satu per baris, atau file vCard."),
        },
        Phase::AwaitingDelay(kind) => {
            let what = match kind {
                DelayKind::BetweenGroups => "Jeda antar grup",
                DelayKind::BetweenNumbers => "Jeda antar nomor",
                DelayKind::Offset => "Jeda mulai antar akun",
            };
            Rendered::text(format!("{what} dalam detik (0-300)?"))
        }
        Phase::AwaitingMode(kind) => mode_prompt(feature, kind),
        Phase::AwaitingText(kind) => text_prompt(kind, detail),
        Phase::AwaitingPhoto => Rendered::text("Kirim foto grup (gambar atau file)."),
        Phase::AwaitingConfirmation => Rendered::text("Mulai?"),
        Phase::Idle | Phase::Running | Phase::Completed => Rendered::text("⏳ Sedang diproses"),
    }
}

fn mode_prompt(feature: Feature, kind: ModeKind) -> Rendered {
    match kind {
        ModeKind::Toggle => Rendered::text(toggle_question(feature)).with_rows(vec![switch_row()]),
        ModeKind::Ephemeral => {
            Rendered::text("Durasi pesan sementara?").with_rows(vec![ephemeral_row()])
        }
        ModeKind::Participants => Rendered::text("Tambahkan nomor sekaligus atau satu per satu?")
            .with_rows(vec![vec![
                Button::new("Sekaligus", choice_data("sekaligus")),
                Button::new("Satu-satu", choice_data("satu")),
            ]]),
        ModeKind::MessageSource => Rendered::text("Sumber pesan broadcast?").with_rows(vec![vec![
            Button::new("📄 File", choice_data("file")),
            Button::new("✍️ Manual", choice_data("manual")),
        ]]),
        ModeKind::TargetSource => Rendered::text("Sumber grup target?").with_rows(vec![vec![
            Button::new("📄 File", choice_data("file")),
            Button::new("✍️ Manual", choice_data("manual")),
        ]]),
        ModeKind::Farewell => Rendered::text("Kirim pesan perpisahan sebelum keluar?").with_rows(
            vec![vec![
                Button::new("Ya", choice_data("ya")),
                Button::new("Tidak", choice_data("tidak")),
            ]],
        ),
        ModeKind::Create(CreateField::Ephemeral) => {
            Rendered::text(create_question(CreateField::Ephemeral))
                .with_rows(vec![ephemeral_row(), skip_row()])
        }
        ModeKind::Create(field) => {
            Rendered::text(create_question(field)).with_rows(vec![switch_row(), skip_row()])
        }
    }
}

fn text_prompt(kind: TextKind, detail: &PromptDetail) -> Rendered {
    match kind {
        TextKind::GroupNames => {
            let n = match detail {
                PromptDetail::Collected(n) => *n,
                _ => 0,
            };
            Rendered::text(format!(
                "Kirim nama grup baru, satu per baris.\nTerkumpul: {n} nama. Ketik /mulai jika selesai."
            ))
        }
        TextKind::InviteLinks => {
            Rendered::text("Kirim link undangan (chat.whatsapp.com), teks atau file .txt.")
        }
        TextKind::Description => Rendered::text("Kirim teks deskripsi grup (maks. 1024 byte)."),
        TextKind::Farewell => Rendered::text("Kirim teks pesan perpisahan."),
        TextKind::BroadcastMessages => match detail {
            PromptDetail::Account {
                phone,
                index,
                total,
                can_finish,
            } => {
                let mut text = format!("Kirim pesan untuk akun {phone} ({}/{total}).", index + 1);
                if *can_finish {
                    text.push_str(
                        "\nSemua akun sudah punya pesan. Kirim lagi untuk mengganti, atau ketik /mulai untuk lanjut.",
                    );
                }
                Rendered::text(text)
            }
            _ => Rendered::text(
                "Kirim file .txt berisi pesan. Pisahkan pesan dengan baris kosong.",
            ),
        },
    }
}

pub fn reply(reply: &Reply) -> Rendered {
    match reply {
        Reply::Prompt {
            feature,
            phase,
            note,
            detail,
        } => {
            let mut body = prompt_body(*feature, *phase, detail);
            if let Some(note) = note {
                body.text = format!("{note}\n\n{}", body.text);
            }
            body
        }
        Reply::Invalid {
            feature,
            phase,
            reason,
            detail,
        } => {
            let mut body = prompt_body(*feature, *phase, detail);
            body.text = format!("⚠️ {reason}\n\n{}", body.text);
            body
        }
        Reply::Confirm { summary, .. } => {
            let mut text = summary.join("\n");
            text.push_str("\n\nMulai sekarang?");
            Rendered::text(text).with_rows(vec![vec![
                Button::new("▶️ Mulai", choice_data("ya")),
                Button::new("✖️ Batal", choice_data("batal")),
            ]])
        }
        Reply::Start(plan) => Rendered::text(format!("▶️ {} dimulai", plan.feature_title())),
        Reply::Cancelled(feature) => Rendered::text(format!("✖️ {} dibatalkan", feature.title())),
    }
}

pub fn status(status: &EngineStatus) -> String {
    if status.accounts.is_empty() {
        return "Belum ada akun. Gunakan /pair <nomor>.".to_string();
    }

    let mut text = String::from("📊 Status\n");
    for account in &status.accounts {
        let marker = if account.current { "👉" } else { "•" };
        let link = match (account.logged_in, account.connected) {
            (true, true) => "🟢 terhubung",
            (true, false) => "🟡 terputus",
            (false, _) => "🔴 belum login",
        };
        let _ = write!(
            text,
            "\n{marker} {} {link}, {} grup",
            format_phone_number(&account.account.phone),
            account.groups
        );
    }

    if !status.conversations.is_empty() {
        text.push_str("\n\nFitur aktif:");
        for (feature, phase) in &status.conversations {
            let state = match phase {
                Phase::Running => "berjalan",
                _ => "menunggu input",
            };
            let _ = write!(text, "\n• {} ({state})", feature.title());
        }
    }

    for campaign in &status.campaigns {
        let sent: usize = campaign.accounts.iter().map(|a| a.sent).sum();
        let failed: usize = campaign.accounts.iter().map(|a| a.failed).sum();
        let _ = write!(
            text,
            "\n\n📢 Broadcast: putaran {}, {} grup, terkirim {sent}, gagal {failed}",
            campaign.loop_count, campaign.targets
        );
    }
    text
}

/// Group listing; `None` when it is too long for one message and should be
/// sent as a file.
pub fn groups(groups: &[GroupRecord], keyword: Option<&str>, limit: usize) -> Option<String> {
    let head = match keyword {
        Some(k) => format!("🔎 Grup cocok \"{k}\": {}", groups.len()),
        None => format!("👥 Grup: {}", groups.len()),
    };
    if groups.is_empty() {
        return Some(format!("{head}\nTidak ada grup. Coba /refresh."));
    }
    if groups.len() > limit {
        return None;
    }
    let mut text = head;
    for (i, group) in groups.iter().enumerate() {
        let _ = write!(text, "\n{}. {}", i + 1, group.name);
    }
    Some(text)
}

/// Plain listing for the spilled file.
pub fn groups_file(groups: &[GroupRecord]) -> String {
    groups
        .iter()
        .map(|g| format!("{}\t{}", g.name, g.jid))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Chat-facing notice for an engine event, with the operator to notify.
pub fn event(event: &WorkerEvent) -> Option<(i64, String)> {
    match event {
        WorkerEvent::PairSuccess { operator, phone, .. } => {
            Some((*operator, format!("✅ {phone} berhasil ditautkan")))
        }
        WorkerEvent::LoggedOut { operator, phone, .. } => Some((
            *operator,
            format!("🚪 {phone} keluar dari WhatsApp. Data akun dihapus, gunakan /pair untuk menautkan ulang."),
        )),
        WorkerEvent::Disconnected {
            operator, reason, ..
        } => Some((*operator, format!("🔴 Koneksi WhatsApp terputus: {reason}"))),
        WorkerEvent::GroupsRefreshed {
            operator, count, ..
        } => Some((*operator, format!("🔄 {count} grup tersimpan"))),
        // Pairing codes are answered directly by /pair.
        WorkerEvent::PairingCode { .. }
        | WorkerEvent::SidecarReady
        | WorkerEvent::Connected { .. }
        | WorkerEvent::JobFinished { .. }
        | WorkerEvent::Error { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> GroupRecord {
        GroupRecord::new(format!("{name}@g.us"), name)
    }

    #[test]
    fn test_menu_covers_every_feature() {
        let menu = menu();
        for feature in Feature::ALL {
            let data = feature_data(feature);
            assert!(menu.rows.iter().flatten().any(|b| b.data == data), "{feature:?}");
        }
    }

    #[test]
    fn test_invalid_reply_repeats_prompt() {
        let rendered = reply(&Reply::Invalid {
            feature: Feature::Announce,
            phase: Phase::AwaitingMode(ModeKind::Toggle),
            reason: "Pilih on atau off".into(),
            detail: PromptDetail::None,
        });
        assert!(rendered.text.starts_with("⚠️ Pilih on atau off"));
        assert!(rendered.text.contains("mengirim pesan"));
        assert_eq!(rendered.rows[0].len(), 2);
    }

    #[test]
    fn test_broadcast_prompt_names_account() {
        let rendered = reply(&Reply::Prompt {
            feature: Feature::Broadcast,
            phase: Phase::AwaitingText(TextKind::BroadcastMessages),
            note: None,
            detail: PromptDetail::Account {
                phone: "628111".into(),
                index: 1,
                total: 3,
                can_finish: true,
            },
        });
        assert!(rendered.text.contains("628111 (2/3)"));
        assert!(rendered.text.contains("/mulai"));
    }

    #[test]
    fn test_group_listing_spills_when_long() {
        let list = vec![group("A"), group("B")];
        let text = groups(&list, Some("a"), 10).unwrap();
        assert!(text.contains("1. A"));
        assert!(groups(&list, None, 1).is_none());
        assert_eq!(groups_file(&list), "A\tA@g.us\nB\tB@g.us");
    }

    #[test]
    fn test_events_address_operator() {
        let (chat, text) = event(&WorkerEvent::PairSuccess {
            operator: 5,
            account_id: 1,
            phone: "628111".into(),
        })
        .unwrap();
        assert_eq!(chat, 5);
        assert!(text.contains("628111"));
        assert!(event(&WorkerEvent::SidecarReady).is_none());
    }
}
