//! Looping multi-account campaigns.
//!
//! Each loop spawns one worker per ready account. Worker `k` starts after
//! `k × offset_delay` and walks the targets in order, sending one randomly
//! chosen message per group. When every worker has finished, each account
//! marks its peers' fresh messages as read.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mira_core::{Jid, WaClient, WaError};
use mira_db::GroupRecord;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{Result, WorkerError};
use crate::progress::ProgressSink;
use crate::registry::SessionRegistry;
use crate::resolver::ensure_connected;
use crate::retry::{ErrorClass, RetryPolicy, classify};
use crate::stop::StopFlag;
use crate::text;

/// Zero-width and spacing glyphs mixed into messages.
const VARIATIONS: &[&str] = &["\u{200B}", "\u{200C}", "\u{2060}", " "];
const TRAILING: &[&str] = &[".", "!", "…"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRef {
    pub id: i64,
    pub phone: String,
}

/// Everything collected for a campaign before it starts.
#[derive(Debug, Clone)]
pub struct CampaignPlan {
    pub accounts: Vec<AccountRef>,
    pub messages: HashMap<i64, Vec<String>>,
    pub targets: Vec<GroupRecord>,
    pub offset_delay: Duration,
    pub group_delay: Duration,
    pub vary_messages: bool,
}

/// Where a campaign gets its clients.
#[async_trait]
pub trait CampaignClients: Send + Sync {
    /// The registered client, created on demand.
    async fn obtain(&self, account_id: i64) -> Result<Arc<dyn WaClient>>;

    /// The registered client, if any.
    async fn current(&self, account_id: i64) -> Option<Arc<dyn WaClient>>;
}

#[async_trait]
impl CampaignClients for SessionRegistry {
    async fn obtain(&self, account_id: i64) -> Result<Arc<dyn WaClient>> {
        match self.get_client(account_id).await {
            Some(client) => Ok(client),
            None => self.create_client(account_id).await,
        }
    }

    async fn current(&self, account_id: i64) -> Option<Arc<dyn WaClient>> {
        self.get_client(account_id).await
    }
}

/// Deterministic cosmetic variation of `base` for one account and loop.
///
/// Picks a glyph, a position (start, middle or end) and occasionally a
/// trailing punctuation mark. Returns `base` unchanged if the insertion
/// point is not a character boundary.
pub fn vary_message(base: &str, account_id: i64, loop_index: u64) -> String {
    let hash = blake3::hash(format!("{base}\u{1F}{account_id}\u{1F}{loop_index}").as_bytes());
    let bytes = hash.as_bytes();

    let glyph = VARIATIONS[bytes[0] as usize % VARIATIONS.len()];
    let at = match bytes[1] % 3 {
        0 => 0,
        1 => base
            .char_indices()
            .nth(base.chars().count() / 2)
            .map(|(i, _)| i)
            .unwrap_or(base.len()),
        _ => base.len(),
    };
    if !base.is_char_boundary(at) {
        return base.to_string();
    }

    let mut out = String::with_capacity(base.len() + 8);
    out.push_str(&base[..at]);
    out.push_str(glyph);
    out.push_str(&base[at..]);
    if bytes[2] % 4 == 0 {
        out.push_str(TRAILING[bytes[3] as usize % TRAILING.len()]);
    }
    out
}

#[derive(Debug, Clone)]
pub struct AccountStats {
    pub account_id: i64,
    pub phone: String,
    pub connected: bool,
    pub disabled: bool,
    pub sent: usize,
    pub failed: usize,
    /// Groups holding a message from this account.
    pub groups: usize,
}

#[derive(Debug, Clone)]
pub struct CampaignStats {
    pub loop_count: u64,
    pub targets: usize,
    pub running: bool,
    pub accounts: Vec<AccountStats>,
}

#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub stats: CampaignStats,
    /// Accounts left out at start: no messages or no connection.
    pub dropped: Vec<String>,
    pub timed_out: bool,
}

#[derive(Default)]
struct CampaignState {
    ready: Vec<AccountRef>,
    loop_count: u64,
    running: bool,
    sent: HashMap<i64, usize>,
    failed: HashMap<i64, usize>,
    /// Latest message id per account and group.
    last_sent: HashMap<i64, HashMap<String, String>>,
    /// Sends since the last cross-account read.
    fresh: HashMap<i64, HashMap<String, String>>,
    connected: HashMap<i64, bool>,
    disabled: HashSet<i64>,
}

impl CampaignState {
    fn record_success(&mut self, account_id: i64, group: &str, message_id: String) {
        *self.sent.entry(account_id).or_default() += 1;
        self.last_sent
            .entry(account_id)
            .or_default()
            .insert(group.to_string(), message_id.clone());
        self.fresh
            .entry(account_id)
            .or_default()
            .insert(group.to_string(), message_id);
    }
}

struct Timings {
    retry: RetryPolicy,
    step_timeout: Duration,
    ready_wait: Duration,
    mark_read_delay: Duration,
    mark_read_timeout: Duration,
    loop_pause: Duration,
    watchdog: Duration,
    progress_interval: Duration,
}

pub struct Campaign {
    plan: CampaignPlan,
    timings: Timings,
    stop: StopFlag,
    state: Mutex<CampaignState>,
}

impl Campaign {
    pub fn new(plan: CampaignPlan, config: &EngineConfig, stop: StopFlag) -> Arc<Self> {
        Arc::new(Self {
            plan,
            timings: Timings {
                retry: RetryPolicy::new(config.retry_backoff.clone(), config.rate_limit_backoff.clone()),
                step_timeout: config.step_timeout,
                ready_wait: config.broadcast_ready_wait,
                mark_read_delay: config.mark_read_delay,
                mark_read_timeout: config.mark_read_timeout,
                loop_pause: config.loop_pause,
                watchdog: config.broadcast_watchdog,
                progress_interval: config.broadcast_progress_interval,
            },
            stop,
            state: Mutex::new(CampaignState::default()),
        })
    }

    pub async fn stats(&self) -> CampaignStats {
        let state = self.state.lock().await;
        CampaignStats {
            loop_count: state.loop_count,
            targets: self.plan.targets.len(),
            running: state.running,
            accounts: state
                .ready
                .iter()
                .map(|a| AccountStats {
                    account_id: a.id,
                    phone: a.phone.clone(),
                    connected: state.connected.get(&a.id).copied().unwrap_or(false),
                    disabled: state.disabled.contains(&a.id),
                    sent: state.sent.get(&a.id).copied().unwrap_or(0),
                    failed: state.failed.get(&a.id).copied().unwrap_or(0),
                    groups: state.last_sent.get(&a.id).map_or(0, HashMap::len),
                })
                .collect(),
        }
    }

    /// Accounts that have messages and come online within the ready wait.
    async fn ready_accounts(&self, clients: &dyn CampaignClients) -> (Vec<AccountRef>, Vec<String>) {
        let mut ready = Vec::new();
        let mut dropped = Vec::new();

        for account in &self.plan.accounts {
            let has_messages = self
                .plan
                .messages
                .get(&account.id)
                .is_some_and(|m| !m.is_empty());
            if !has_messages {
                info!(account_id = account.id, "Account has no messages, skipping");
                dropped.push(account.phone.clone());
                continue;
            }

            let client = match clients.obtain(account.id).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(account_id = account.id, error = %e, "Account client unavailable, skipping");
                    dropped.push(account.phone.clone());
                    continue;
                }
            };
            if ensure_connected(client.as_ref(), self.timings.ready_wait).await.is_err() {
                warn!(account_id = account.id, "Account not connected, skipping");
                dropped.push(account.phone.clone());
                continue;
            }
            ready.push(account.clone());
        }
        (ready, dropped)
    }

    /// Runs until stopped, until every account is disabled, or until the
    /// watchdog fires.
    #[instrument(skip_all, fields(accounts = self.plan.accounts.len(), targets = self.plan.targets.len()))]
    pub async fn run(
        self: Arc<Self>,
        clients: Arc<dyn CampaignClients>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<CampaignReport> {
        let (ready, dropped) = self.ready_accounts(clients.as_ref()).await;
        if ready.is_empty() {
            return Err(WorkerError::validation("Tidak ada akun yang siap untuk broadcast"));
        }
        {
            let mut state = self.state.lock().await;
            for account in &ready {
                state.connected.insert(account.id, true);
            }
            state.ready = ready.clone();
            state.running = true;
        }
        info!(ready = ready.len(), dropped = dropped.len(), "Campaign started");

        let ticker_done = StopFlag::new();
        let ticker = tokio::spawn({
            let campaign = self.clone();
            let sink = sink.clone();
            let done = ticker_done.clone();
            async move {
                let mut interval = tokio::time::interval(campaign.timings.progress_interval);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let stats = campaign.stats().await;
                            sink.update(&text::campaign_progress(&stats)).await;
                        }
                        _ = done.stopped() => break,
                    }
                }
            }
        });

        let timed_out = tokio::time::timeout(self.timings.watchdog, self.clone().run_loops(&ready, &clients))
            .await
            .is_err();
        if timed_out {
            warn!("Campaign watchdog elapsed");
        }

        ticker_done.stop();
        if let Err(e) = ticker.await {
            debug!(error = %e, "Progress ticker ended abnormally");
        }
        self.state.lock().await.running = false;

        let stats = self.stats().await;
        info!(loops = stats.loop_count, "Campaign finished");
        Ok(CampaignReport {
            stats,
            dropped,
            timed_out,
        })
    }

    async fn run_loops(self: Arc<Self>, ready: &[AccountRef], clients: &Arc<dyn CampaignClients>) {
        loop {
            if self.stop.is_stopped() {
                break;
            }
            let loop_index = {
                let mut state = self.state.lock().await;
                if ready.iter().all(|a| state.disabled.contains(&a.id)) {
                    warn!("Every account disabled, ending campaign");
                    break;
                }
                state.loop_count += 1;
                state.loop_count
            };
            debug!(loop_index, "Campaign loop started");

            let mut workers = JoinSet::new();
            for (k, account) in ready.iter().enumerate() {
                workers.spawn(self.clone().worker(k, account.clone(), clients.clone(), loop_index));
            }
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Campaign worker panicked");
                }
            }

            self.cross_read(ready, clients).await;

            if !self.stop.sleep(self.timings.loop_pause).await {
                break;
            }
        }
    }

    async fn worker(
        self: Arc<Self>,
        position: usize,
        account: AccountRef,
        clients: Arc<dyn CampaignClients>,
        loop_index: u64,
    ) {
        let Some(messages) = self.plan.messages.get(&account.id) else {
            return;
        };
        if !self.stop.sleep(self.plan.offset_delay * position as u32).await {
            return;
        }

        for (i, target) in self.plan.targets.iter().enumerate() {
            if i > 0 && !self.stop.sleep(self.plan.group_delay).await {
                return;
            }
            if self.stop.is_stopped() || self.state.lock().await.disabled.contains(&account.id) {
                return;
            }

            let Ok(jid) = target.jid.parse::<Jid>() else {
                warn!(group = %target.jid, "Skipping malformed group jid");
                continue;
            };
            let Some(client) = clients.current(account.id).await else {
                let mut state = self.state.lock().await;
                state.connected.insert(account.id, false);
                *state.failed.entry(account.id).or_default() += 1;
                continue;
            };

            let Some(base) = messages.choose(&mut OsRng) else {
                return;
            };
            let text = if self.plan.vary_messages {
                vary_message(base, account.id, loop_index)
            } else {
                base.clone()
            };

            let step_timeout = self.timings.step_timeout;
            let client = &client;
            let (jid, text) = (&jid, &text);
            let result = self
                .timings
                .retry
                .run(&target.name, Some(&self.stop), move || async move {
                    match tokio::time::timeout(step_timeout, client.send_text(jid, text)).await {
                        Ok(result) => result,
                        Err(_) => Err(WaError::Timeout("context deadline exceeded".to_string())),
                    }
                })
                .await;

            let mut state = self.state.lock().await;
            state.connected.insert(account.id, client.is_connected());
            match result {
                Ok(message_id) => state.record_success(account.id, &target.jid, message_id),
                Err(e) => {
                    *state.failed.entry(account.id).or_default() += 1;
                    if classify(&e) == ErrorClass::Permanent {
                        warn!(account_id = account.id, error = %e, "Permanent error, disabling account for this campaign");
                        state.disabled.insert(account.id);
                        return;
                    }
                    warn!(account_id = account.id, group = %target.name, error = %e, "Broadcast send failed");
                }
            }
        }
    }

    /// Every account marks its peers' messages from this loop as read.
    /// Fire-and-forget; failures are only logged.
    async fn cross_read(&self, ready: &[AccountRef], clients: &Arc<dyn CampaignClients>) {
        let (fresh, disabled) = {
            let mut state = self.state.lock().await;
            (std::mem::take(&mut state.fresh), state.disabled.clone())
        };

        for reader in ready.iter().filter(|a| !disabled.contains(&a.id)) {
            for author in ready.iter().filter(|a| a.id != reader.id) {
                let Some(sent) = fresh.get(&author.id) else {
                    continue;
                };
                let sender = Jid::user(&author.phone);
                for (group, message_id) in sent {
                    let Ok(chat) = group.parse::<Jid>() else {
                        continue;
                    };
                    let clients = clients.clone();
                    let sender = sender.clone();
                    let message_id = message_id.clone();
                    let reader_id = reader.id;
                    let delay = self.timings.mark_read_delay;
                    let limit = self.timings.mark_read_timeout;

                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let Some(client) = clients.current(reader_id).await else {
                            return;
                        };
                        let ids = [message_id];
                        match tokio::time::timeout(limit, client.mark_read(&chat, &sender, &ids)).await {
                            Ok(Ok(())) => debug!(account_id = reader_id, chat = %chat, "Marked peer message read"),
                            Ok(Err(e)) => warn!(account_id = reader_id, error = %e, "Mark-read failed"),
                            Err(_) => warn!(account_id = reader_id, "Mark-read timed out"),
                        }
                    });
                }
            }
        }
    }
}
