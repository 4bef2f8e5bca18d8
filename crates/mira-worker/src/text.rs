//! Operator-facing text produced while jobs run.

use std::fmt::Write;
use std::time::Duration;

use crate::broadcast::{CampaignReport, CampaignStats};
use crate::error::{ErrorKind, WorkerError};
use crate::report::{Interruption, JobReport, SpillOutput, Tally};
use crate::retry::{Hint, hint_for};

pub fn progress(name: &str, done: usize, total: usize, tally: &Tally) -> String {
    let percent = if total == 0 { 100 } else { done * 100 / total };
    let mut text = format!("⏳ {name}\nProgres: {done}/{total} ({percent}%)\n✅ Berhasil: {}", tally.success);
    if tally.invited > 0 {
        let _ = write!(text, "\n📨 Diundang: {}", tally.invited);
    }
    let _ = write!(text, "\n❌ Gagal: {}", tally.failed());
    text
}

pub fn interrupted(name: &str, done: usize, total: usize, reason: &Interruption) -> String {
    let why = match reason {
        Interruption::Stopped => "dihentikan oleh operator".to_string(),
        Interruption::SessionLost => "dihentikan: sesi WhatsApp terputus".to_string(),
        Interruption::Permanent(err) => format!("dihentikan: {err}"),
        Interruption::RateLimited { error, .. } => format!("dihentikan: dibatasi WhatsApp ({error})"),
    };
    let mut text = format!("⛔ {name} {why}\nDiproses: {done}/{total}");
    if let Interruption::RateLimited { wait_minutes, .. } = reason {
        text.push('\n');
        text.push_str(&hint(Hint::WaitMinutes(*wait_minutes)));
    }
    text
}

pub fn hint(hint: Hint) -> String {
    match hint {
        Hint::WaitMinutes(minutes) => format!("💡 Tunggu sekitar {minutes} menit lalu coba lagi."),
        Hint::RePair => "💡 Perangkat terlepas. Pasangkan ulang dengan /pair <nomor>.".to_string(),
        Hint::RestartPhoneApp => "💡 Tutup lalu buka kembali aplikasi WhatsApp di HP.".to_string(),
    }
}

/// Error line for the operator, with a remedy when one applies.
pub fn failure(err: &WorkerError, rate_limit_backoff: &[Duration]) -> String {
    let mut text = format!("❌ {err}");
    if let Some(remedy) = err.as_wa().and_then(|e| hint_for(e, rate_limit_backoff)) {
        text.push('\n');
        text.push_str(&hint(remedy));
    }
    text
}

/// Error reply by kind: input problems re-prompt, access problems refuse,
/// everything else gets a remedy when one applies.
pub fn error_reply(err: &WorkerError, rate_limit_backoff: &[Duration]) -> String {
    match err.kind() {
        ErrorKind::Validation => format!("⚠️ {err}"),
        ErrorKind::Connection => format!("❌ Gagal mengunduh file: {err}\nFitur dibatalkan."),
        ErrorKind::Invariant => "⛔ Nomor atau akun ini tidak bisa dipakai oleh Anda.".to_string(),
        _ => failure(err, rate_limit_backoff),
    }
}

pub fn pairing_code(phone: &str, code: &str) -> String {
    format!(
        "🔑 Kode pairing untuk {phone}: {code}\nBuka WhatsApp > Perangkat tertaut > Tautkan dengan nomor telepon."
    )
}

/// Final message of a job. Lists at most `max_failures` failures; the rest
/// are counted.
pub fn summary(report: &JobReport, max_failures: usize) -> String {
    let tally = &report.tally;
    let head = match &report.interruption {
        None => "✅ Selesai",
        Some(_) => "⚠️ Berhenti sebelum selesai",
    };

    let mut text = format!(
        "{head}: {}\n\nTarget: {}/{}\n✅ Berhasil: {}",
        report.title, report.processed, report.total, tally.success
    );
    if tally.invited > 0 {
        let _ = write!(text, "\n📨 Diundang: {}", tally.invited);
    }
    let _ = write!(text, "\n❌ Gagal: {}", tally.failed());

    if let Some(reason) = &report.interruption {
        let _ = write!(
            text,
            "\n\n{}",
            interrupted(&report.title, report.processed, report.total, reason)
        );
    }

    if !tally.failures.is_empty() {
        text.push_str("\n\nGagal:");
        for failure in tally.failures.iter().take(max_failures) {
            let _ = write!(text, "\n• {} — {}", failure.target, failure.reason);
        }
        let hidden = tally.failures.len().saturating_sub(max_failures);
        if hidden > 0 {
            let _ = write!(text, "\n…dan {hidden} lainnya");
        }
    }

    match &report.output {
        SpillOutput::Inline(lines) if !lines.is_empty() => {
            text.push_str("\n\nHasil:\n");
            text.push_str(&lines.join("\n"));
        }
        SpillOutput::File { lines, .. } => {
            let _ = write!(text, "\n\n📎 {lines} hasil dikirim sebagai file.");
        }
        SpillOutput::Inline(_) => {}
    }

    text
}

pub fn campaign_progress(stats: &CampaignStats) -> String {
    let mut text = format!(
        "📢 Broadcast berjalan\nPutaran: {}\nGrup target: {}",
        stats.loop_count, stats.targets
    );
    for account in &stats.accounts {
        let flag = if account.disabled {
            "⛔"
        } else if account.connected {
            "🟢"
        } else {
            "🔴"
        };
        let _ = write!(
            text,
            "\n{flag} {}: terkirim {}, gagal {}",
            account.phone, account.sent, account.failed
        );
    }
    text
}

pub fn campaign_summary(report: &CampaignReport) -> String {
    let stats = &report.stats;
    let head = if report.timed_out {
        "⏰ Broadcast berhenti: batas waktu tercapai"
    } else {
        "✅ Broadcast dihentikan"
    };
    let sent: usize = stats.accounts.iter().map(|a| a.sent).sum();
    let failed: usize = stats.accounts.iter().map(|a| a.failed).sum();

    let mut text = format!(
        "{head}\n\nPutaran: {}\nGrup target: {}\n✅ Terkirim: {sent}\n❌ Gagal: {failed}",
        stats.loop_count, stats.targets
    );
    for account in &stats.accounts {
        let _ = write!(
            text,
            "\n• {}: {} terkirim ke {} grup, {} gagal{}",
            account.phone,
            account.sent,
            account.groups,
            account.failed,
            if account.disabled { " (dinonaktifkan)" } else { "" }
        );
    }
    if !report.dropped.is_empty() {
        let _ = write!(text, "\n\n⚠️ Tidak ikut: {}", report.dropped.join(", "));
    }
    text
}
