//! Routes Telegram updates to the engine and renders its answers.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use mira_worker::{
    ControlChannel, Feature, Incoming, MiraEngine, Response, WorkerError, WorkerEvent, error_reply,
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::commands::{Callback, Command};
use crate::config::BotConfig;
use crate::render::{self, Rendered};
use crate::telegram::{Message, TelegramChannel, Update};

const POLL_TIMEOUT_SECS: u64 = 30;
/// Group listings longer than this go out as a file.
const GROUP_LIST_LIMIT: usize = 50;

pub struct Bot {
    engine: Arc<MiraEngine>,
    telegram: Arc<TelegramChannel>,
    config: BotConfig,
}

impl Bot {
    pub fn new(engine: Arc<MiraEngine>, telegram: Arc<TelegramChannel>, config: BotConfig) -> Self {
        Self {
            engine,
            telegram,
            config,
        }
    }

    /// Polls until the process shuts down. Updates are handled one at a time
    /// in arrival order.
    pub async fn run(&self) {
        let mut offset = 0;
        let mut failures: u32 = 0;
        loop {
            match self.telegram.get_updates(offset, POLL_TIMEOUT_SECS).await {
                Ok(updates) => {
                    failures = 0;
                    for update in updates {
                        offset = update.update_id + 1;
                        self.handle_update(update).await;
                    }
                }
                Err(e) => {
                    failures += 1;
                    let wait = Duration::from_secs(u64::from(failures.min(6)) * 5);
                    warn!(error = %e, wait_secs = wait.as_secs(), "getUpdates failed");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Delivers engine notices to the operators they concern.
    pub async fn forward_events(&self, mut events: mpsc::Receiver<WorkerEvent>) {
        while let Some(event) = events.recv().await {
            match &event {
                WorkerEvent::SidecarReady => info!("Sidecar ready"),
                WorkerEvent::JobFinished { operator, title } => {
                    info!(operator, title = %title, "Job finished")
                }
                WorkerEvent::Error { account_id, error } => {
                    warn!(account_id = ?account_id, error = %error, "Engine error")
                }
                _ => debug!(?event, "Engine event"),
            }
            if let Some((chat, text)) = render::event(&event) {
                self.say(chat, &text).await;
            }
        }
    }

    async fn say(&self, chat: i64, text: &str) {
        if let Err(e) = self.telegram.send_message(chat, text).await {
            warn!(chat, error = %e, "Failed to send message");
        }
    }

    async fn show(&self, chat: i64, rendered: Rendered) {
        let result = if rendered.rows.is_empty() {
            self.telegram.send_message(chat, &rendered.text).await
        } else {
            self.telegram
                .send_buttons(chat, &rendered.text, &rendered.rows)
                .await
        };
        if let Err(e) = result {
            warn!(chat, error = %e, "Failed to send reply");
        }
    }

    fn allowed(&self, user_id: i64) -> bool {
        if self.config.is_admin(user_id) {
            return true;
        }
        warn!(target: "audit", user_id, "Rejected update from unknown user");
        false
    }

    #[instrument(skip_all, fields(update_id = update.update_id))]
    async fn handle_update(&self, update: Update) {
        if let Some(query) = update.callback_query {
            self.telegram.answer_callback(&query.id).await;
            if query.from.is_bot || !self.allowed(query.from.id) {
                return;
            }
            let operator = query.from.id;
            let chat = query.message.map(|m| m.chat.id).unwrap_or(operator);
            match query.data.as_deref().and_then(Callback::parse) {
                Some(Callback::Feature(feature)) => self.start_feature(operator, chat, feature).await,
                Some(Callback::Choice(value)) => self.feed(operator, chat, Incoming::Choice(value)).await,
                Some(Callback::Command(command)) => self.command(operator, chat, command).await,
                None => debug!(data = ?query.data, "Unknown callback"),
            }
            return;
        }

        if let Some(message) = update.message {
            let Some(from) = message.from.as_ref() else {
                return;
            };
            if from.is_bot || !self.allowed(from.id) {
                if !from.is_bot {
                    self.say(message.chat.id, "⛔ Akses ditolak").await;
                }
                return;
            }
            let operator = from.id;
            self.message(operator, message).await;
        }
    }

    async fn message(&self, operator: i64, message: Message) {
        let chat = message.chat.id;

        if let Some(document) = message.document {
            let incoming = Incoming::Document {
                file_id: document.file_id,
            };
            return self.feed(operator, chat, incoming).await;
        }

        if let Some(photo) = message
            .photo
            .and_then(|sizes| sizes.into_iter().max_by_key(|p| p.width * p.height))
        {
            let incoming = Incoming::Photo {
                file_id: photo.file_id,
            };
            return self.feed(operator, chat, incoming).await;
        }

        let Some(text) = message.text.or(message.caption) else {
            return;
        };
        match Command::parse(&text) {
            Some(command) => self.command(operator, chat, command).await,
            None => self.feed(operator, chat, Incoming::Text(text)).await,
        }
    }

    #[instrument(skip(self))]
    async fn command(&self, operator: i64, chat: i64, command: Command) {
        match command {
            Command::Menu => self.show(chat, render::menu()).await,
            Command::Help => self.show(chat, render::help()).await,
            Command::Unknown(name) => {
                self.say(chat, &format!("Perintah /{name} tidak dikenal. Lihat /help."))
                    .await
            }
            Command::Pair(None) => self.say(chat, "Format: /pair <nomor>").await,
            Command::Pair(Some(phone)) => {
                self.say(chat, "⏳ Meminta kode pairing...").await;
                self.engine.begin_pair(operator, chat, phone);
            }
            Command::Logout => match self.engine.logout(operator).await {
                Ok(account) => self.say(chat, &format!("🚪 {} dikeluarkan", account.phone)).await,
                Err(e) => self.error(chat, &e).await,
            },
            Command::Reset => match self.engine.reset(operator).await {
                Ok(removed) => self.say(chat, &format!("🧹 {removed} akun dihapus")).await,
                Err(e) => self.error(chat, &e).await,
            },
            Command::Use(None) => self.say(chat, "Format: /use <nomor>").await,
            Command::Use(Some(phone)) => match self.engine.use_account(operator, &phone).await {
                Ok(account) => self.say(chat, &format!("👉 Akun aktif: {}", account.phone)).await,
                Err(e) => self.error(chat, &e).await,
            },
            Command::Status => match self.engine.status(operator).await {
                Ok(status) => self.say(chat, &render::status(&status)).await,
                Err(e) => self.error(chat, &e).await,
            },
            Command::Groups(keyword) => self.groups(operator, chat, keyword.as_deref()).await,
            Command::Refresh => {
                self.say(chat, "⏳ Memuat ulang daftar grup...").await;
                self.engine.begin_refresh(operator, chat);
            }
            Command::Stop => match self.engine.stop(operator).await {
                0 => self.say(chat, "Tidak ada proses berjalan").await,
                n => self.say(chat, &format!("⛔ Menghentikan {n} proses...")).await,
            },
            Command::Cancel => match self.engine.cancel(operator).await {
                Some(feature) => self.say(chat, &format!("✖️ {} dibatalkan", feature.title())).await,
                None => self.say(chat, "Tidak ada input yang ditunggu").await,
            },
            Command::Done => {
                self.feed(operator, chat, Incoming::Text(mira_worker::DONE_SENTINEL.to_string()))
                    .await
            }
            Command::Feature(feature) => self.start_feature(operator, chat, feature).await,
        }
    }

    async fn start_feature(&self, operator: i64, chat: i64, feature: Feature) {
        match self.engine.start_feature(operator, feature).await {
            Ok(reply) => self.show(chat, render::reply(&reply)).await,
            Err(e) => self.error(chat, &e).await,
        }
    }

    async fn feed(&self, operator: i64, chat: i64, incoming: Incoming) {
        match self.engine.handle_input(operator, chat, incoming).await {
            Ok(Response::Reply(reply)) => self.show(chat, render::reply(&reply)).await,
            Ok(Response::Started { title, .. }) => {
                self.say(chat, &format!("▶️ {title} dimulai. Ketik /stop untuk menghentikan."))
                    .await
            }
            Ok(Response::Idle) => self.say(chat, "Pilih fitur dari /menu").await,
            Err(e) => self.error(chat, &e).await,
        }
    }

    async fn groups(&self, operator: i64, chat: i64, keyword: Option<&str>) {
        let groups = match self.engine.list_groups(operator, keyword).await {
            Ok(groups) => groups,
            Err(e) => return self.error(chat, &e).await,
        };
        if let Some(text) = render::groups(&groups, keyword, GROUP_LIST_LIMIT) {
            return self.say(chat, &text).await;
        }

        let caption = format!("👥 {} grup", groups.len());
        let sent = match write_listing(&render::groups_file(&groups)) {
            Ok(file) => self
                .telegram
                .send_document(chat, file.path(), &caption)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            warn!(chat, error = %e, "Failed to send group listing");
            self.say(chat, &format!("❌ Gagal mengirim daftar grup: {e}")).await;
        }
    }

    async fn error(&self, chat: i64, err: &WorkerError) {
        let text = error_reply(err, &self.engine.config().rate_limit_backoff);
        self.say(chat, &text).await;
    }
}

fn write_listing(content: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("grup-")
        .suffix(".txt")
        .tempfile()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}
