use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mira_core::IpcEvent;
use mira_db::{Account, GroupRecord};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::broadcast::{AccountRef, Campaign, CampaignClients, CampaignStats};
use crate::channel::ControlChannel;
use crate::config::EngineConfig;
use crate::download::download_file;
use crate::error::{ErrorKind, Result, WorkerError};
use crate::events::WorkerEvent;
use crate::fsm::{Conversations, Feature, FsmContext, Input, Phase, Plan, Reply};
use crate::ingest::normalize_phone;
use crate::metadata::{self, RefreshGuard, visible_groups};
use crate::ops::{CreateOp, JoinOp, LeaveOp, LinksOp, ParticipantsOp, SettingsOp};
use crate::pacer::{Job, Pacer};
use crate::progress::ProgressMessage;
use crate::registry::SessionRegistry;
use crate::report::{Interruption, JobReport, SpillOutput};
use crate::resolver::Resolver;
use crate::retry::{RetryPolicy, hint_for};
use crate::stop::StopFlag;
use crate::text;

/// Operator input as it arrives from the control channel. Attachments are
/// still remote.
#[derive(Debug, Clone)]
pub enum Incoming {
    Text(String),
    Choice(String),
    Document { file_id: String },
    Photo { file_id: String },
}

pub enum Response {
    Reply(Reply),
    /// A job was launched in the background.
    Started { feature: Feature, title: String },
    /// No conversation is waiting for input.
    Idle,
}

pub struct PairOutcome {
    pub account: Account,
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct AccountStatus {
    pub account: Account,
    pub current: bool,
    pub connected: bool,
    pub logged_in: bool,
    pub groups: i64,
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub accounts: Vec<AccountStatus>,
    pub conversations: Vec<(Feature, Phase)>,
    pub campaigns: Vec<CampaignStats>,
}

struct RunningJob {
    stop: StopFlag,
    campaign: Option<Arc<Campaign>>,
}

/// Entry point for the front-end: accounts, conversations and background
/// jobs for every operator.
pub struct MiraEngine {
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    channel: Arc<dyn ControlChannel>,
    conversations: Mutex<Conversations>,
    jobs: Mutex<HashMap<(i64, Feature), RunningJob>>,
    refresh_guard: RefreshGuard,
    event_tx: mpsc::Sender<WorkerEvent>,
    event_rx: Option<mpsc::Receiver<WorkerEvent>>,
}

impl MiraEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<SessionRegistry>,
        channel: Arc<dyn ControlChannel>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1000);
        Self {
            config,
            registry,
            channel,
            conversations: Mutex::new(Conversations::default()),
            jobs: Mutex::new(HashMap::new()),
            refresh_guard: RefreshGuard::default(),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<WorkerEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    async fn emit(&self, event: WorkerEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("Worker event receiver dropped");
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.retry_backoff.clone(),
            self.config.rate_limit_backoff.clone(),
        )
    }

    /// Forwards sidecar events and restores stored sessions.
    pub async fn start(self: &Arc<Self>, mut ipc_rx: mpsc::Receiver<IpcEvent>) -> Result<usize> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = ipc_rx.recv().await {
                engine.handle_ipc_event(event).await;
            }
            debug!("Sidecar event stream ended");
        });

        let restored = self.registry.restore_sessions().await?;
        info!(restored, "Stored sessions restored");
        Ok(restored)
    }

    async fn owner_of(&self, account_id: i64) -> Option<Account> {
        match self.registry.account(account_id).await {
            Ok(account) => Some(account),
            Err(e) => {
                debug!(account_id, error = %e, "Event for unknown account");
                None
            }
        }
    }

    pub async fn handle_ipc_event(self: &Arc<Self>, event: IpcEvent) {
        match event {
            IpcEvent::Ready { account_id: None } => self.emit(WorkerEvent::SidecarReady).await,
            IpcEvent::Ready {
                account_id: Some(id),
            } => debug!(account_id = id, "Sidecar session ready"),

            IpcEvent::PairingCode { account_id, code } => {
                if let Some(account) = self.owner_of(account_id).await {
                    self.emit(WorkerEvent::PairingCode {
                        operator: account.owner,
                        account_id,
                        code,
                    })
                    .await;
                }
            }

            IpcEvent::PairSuccess { account_id, .. } => {
                if let Some(account) = self.owner_of(account_id).await {
                    info!(account_id, "Pairing completed");
                    self.emit(WorkerEvent::PairSuccess {
                        operator: account.owner,
                        account_id,
                        phone: account.phone,
                    })
                    .await;
                }
            }

            IpcEvent::Connected { account_id, .. } => {
                if let Some(account) = self.owner_of(account_id).await {
                    self.emit(WorkerEvent::Connected {
                        operator: account.owner,
                        account_id,
                    })
                    .await;
                    self.spawn_refresh(account);
                }
            }

            IpcEvent::Disconnected { account_id, reason } => {
                if let Some(account) = self.owner_of(account_id).await {
                    warn!(account_id, reason = %reason, "Session disconnected");
                    self.emit(WorkerEvent::Disconnected {
                        operator: account.owner,
                        account_id,
                        reason,
                    })
                    .await;
                }
            }

            IpcEvent::LoggedOut { account_id, reason } => {
                let Some(account) = self.owner_of(account_id).await else {
                    return;
                };
                warn!(account_id, reason = ?reason, "Session logged out remotely");
                if let Err(e) = self.registry.remove(account.owner, account_id).await {
                    error!(account_id, error = %e, "Failed to clean up logged-out account");
                }
                self.emit(WorkerEvent::LoggedOut {
                    operator: account.owner,
                    account_id,
                    phone: account.phone,
                })
                .await;
            }

            IpcEvent::Error { account_id, error } => {
                warn!(account_id = ?account_id, error = %error, "Sidecar reported an error");
                self.emit(WorkerEvent::Error { account_id, error }).await;
            }

            IpcEvent::CommandResult { .. } => {}
        }
    }

    /// Registers the number for the operator and requests a pairing code,
    /// waiting out rate limits.
    #[instrument(skip(self))]
    pub async fn pair(&self, operator: i64, raw_phone: &str) -> Result<PairOutcome> {
        let phone = normalize_phone(raw_phone, &self.config.country_code)
            .ok_or_else(|| WorkerError::validation("Nomor tidak valid (10-15 digit)"))?;
        let account = self.registry.add(&phone, operator).await?;
        let client = self.registry.client(account.id).await?;
        if let Err(e) = client.connect().await {
            debug!(account_id = account.id, error = %e, "Connect before pairing failed");
        }

        let client = &client;
        let digits = phone.as_str();
        let code = self
            .retry_policy()
            .run("pair", None, move || client.pair_phone(digits))
            .await?;
        info!(account_id = account.id, "Pairing code issued");
        Ok(PairOutcome { account, code })
    }

    /// Runs [`MiraEngine::pair`] in the background and sends the code, or the
    /// error, to `chat`. Rate-limit waits can take minutes.
    pub fn begin_pair(self: &Arc<Self>, operator: i64, chat: i64, raw_phone: String) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let reply = match engine.pair(operator, &raw_phone).await {
                Ok(outcome) => text::pairing_code(&outcome.account.phone, &outcome.code),
                Err(e) => {
                    warn!(operator, error = %e, "Pairing failed");
                    text::error_reply(&e, &engine.config.rate_limit_backoff)
                }
            };
            engine.say(chat, &reply).await;
        })
    }

    /// Logs out the operator's current account and deletes its stores.
    pub async fn logout(&self, operator: i64) -> Result<Account> {
        let account = self
            .registry
            .current_account(operator)
            .await?
            .ok_or(WorkerError::NoAccount)?;
        self.stop(operator).await;
        self.registry.remove(operator, account.id).await?;
        Ok(account)
    }

    /// Removes every account of the operator and forgets their conversations.
    pub async fn reset(&self, operator: i64) -> Result<usize> {
        self.stop(operator).await;
        self.conversations.lock().await.clear(operator);

        let accounts = self.registry.accounts_of(operator).await?;
        for account in &accounts {
            self.registry.remove(operator, account.id).await?;
        }
        info!(operator, removed = accounts.len(), "Operator reset");
        Ok(accounts.len())
    }

    pub async fn use_account(&self, operator: i64, raw_phone: &str) -> Result<Account> {
        let phone = normalize_phone(raw_phone, &self.config.country_code)
            .ok_or_else(|| WorkerError::validation("Nomor tidak valid"))?;
        let account = self
            .registry
            .accounts_of(operator)
            .await?
            .into_iter()
            .find(|a| a.phone == phone)
            .ok_or_else(|| WorkerError::validation("Nomor belum terhubung. Gunakan /pair dulu."))?;
        self.registry.set_current(operator, account.id).await?;
        Ok(account)
    }

    pub async fn status(&self, operator: i64) -> Result<EngineStatus> {
        let current = self.registry.current_account(operator).await?.map(|a| a.id);
        let mut accounts = Vec::new();
        for account in self.registry.accounts_of(operator).await? {
            let client = self.registry.get_client(account.id).await;
            let groups = match self.registry.catalog(account.id).await {
                Ok(catalog) => catalog.count().await.unwrap_or(0),
                Err(e) => {
                    debug!(account_id = account.id, error = %e, "Catalog unavailable");
                    0
                }
            };
            accounts.push(AccountStatus {
                current: current == Some(account.id),
                connected: client.as_ref().is_some_and(|c| c.is_connected()),
                logged_in: client.as_ref().is_some_and(|c| c.is_logged_in()),
                groups,
                account,
            });
        }

        let conversations = self.conversations.lock().await.active(operator);
        let running: Vec<Arc<Campaign>> = self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|((op, _), _)| *op == operator)
            .filter_map(|(_, job)| job.campaign.clone())
            .collect();
        let mut campaigns = Vec::new();
        for campaign in running {
            campaigns.push(campaign.stats().await);
        }

        Ok(EngineStatus {
            accounts,
            conversations,
            campaigns,
        })
    }

    /// Catalog of the current account: everything, or a keyword search.
    pub async fn list_groups(&self, operator: i64, keyword: Option<&str>) -> Result<Vec<GroupRecord>> {
        let account = self
            .registry
            .current_account(operator)
            .await?
            .ok_or(WorkerError::NoAccount)?;
        let catalog = self.registry.catalog(account.id).await?;
        let records = match keyword.map(str::trim).filter(|k| !k.is_empty()) {
            Some(keyword) => catalog.search_flexible(keyword).await?,
            None => catalog.list_all().await?,
        };
        Ok(visible_groups(records))
    }

    /// Manual refresh of the current account's catalog.
    pub async fn refresh(&self, operator: i64) -> Result<usize> {
        let account = self
            .registry
            .current_account(operator)
            .await?
            .ok_or(WorkerError::NoAccount)?;
        let _ticket = self
            .refresh_guard
            .try_begin(account.id)
            .ok_or_else(|| WorkerError::Busy("Refresh grup masih berjalan".to_string()))?;

        let count = self.refresh_account(&account).await?;
        self.emit(WorkerEvent::GroupsRefreshed {
            operator,
            account_id: account.id,
            count,
        })
        .await;
        Ok(count)
    }

    /// Runs [`MiraEngine::refresh`] in the background. The count arrives as
    /// `GroupsRefreshed`; errors go to `chat`.
    pub fn begin_refresh(self: &Arc<Self>, operator: i64, chat: i64) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.refresh(operator).await {
                warn!(operator, error = %e, "Manual refresh failed");
                engine
                    .say(chat, &text::error_reply(&e, &engine.config.rate_limit_backoff))
                    .await;
            }
        })
    }

    async fn refresh_account(&self, account: &Account) -> Result<usize> {
        let client = self.registry.client(account.id).await?;
        let catalog = self.registry.catalog(account.id).await?;
        metadata::refresh(client.as_ref(), &catalog, self.config.list_groups_timeout).await
    }

    fn spawn_refresh(self: &Arc<Self>, account: Account) {
        let engine = self.clone();
        tokio::spawn(async move {
            let Some(_ticket) = engine.refresh_guard.try_begin(account.id) else {
                debug!(account_id = account.id, "Refresh already running");
                return;
            };
            match engine.refresh_account(&account).await {
                Ok(count) => {
                    engine
                        .emit(WorkerEvent::GroupsRefreshed {
                            operator: account.owner,
                            account_id: account.id,
                            count,
                        })
                        .await
                }
                Err(e) => warn!(account_id = account.id, error = %e, "Background refresh failed"),
            }
        });
    }

    /// Refreshes every connected account every `every`, skipping accounts
    /// with a refresh in flight.
    pub fn spawn_periodic_refresh(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                engine.refresh_all().await;
            }
        })
    }

    #[instrument(skip(self))]
    async fn refresh_all(&self) {
        let accounts = match self.registry.all_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "Periodic refresh could not list accounts");
                return;
            }
        };
        for account in accounts {
            let Some(client) = self.registry.get_client(account.id).await else {
                continue;
            };
            if !client.is_connected() {
                continue;
            }
            let Some(_ticket) = self.refresh_guard.try_begin(account.id) else {
                debug!(account_id = account.id, "Skipping periodic refresh, one is in flight");
                continue;
            };
            if let Err(e) = self.refresh_account(&account).await {
                warn!(account_id = account.id, error = %e, "Periodic refresh failed");
            }
        }
    }

    /// Raises the stop flag of every running job of the operator.
    pub async fn stop(&self, operator: i64) -> usize {
        let jobs = self.jobs.lock().await;
        let mut stopped = 0;
        for ((op, feature), job) in jobs.iter() {
            if *op == operator {
                info!(operator, feature = feature.key(), "Stopping job");
                job.stop.stop();
                stopped += 1;
            }
        }
        stopped
    }

    pub async fn cancel(&self, operator: i64) -> Option<Feature> {
        self.conversations.lock().await.cancel(operator)
    }

    pub async fn running_jobs(&self, operator: i64) -> Vec<Feature> {
        self.jobs
            .lock()
            .await
            .keys()
            .filter(|(op, _)| *op == operator)
            .map(|(_, feature)| *feature)
            .collect()
    }

    pub async fn start_feature(&self, operator: i64, feature: Feature) -> Result<Reply> {
        self.registry
            .current_account(operator)
            .await?
            .ok_or(WorkerError::NoAccount)?;
        let accounts = campaign_accounts(self.registry.accounts_of(operator).await?);
        self.conversations
            .lock()
            .await
            .begin(operator, feature, accounts)
    }

    async fn materialize(&self, incoming: Incoming) -> Result<Input> {
        let backoff = &self.config.download_backoff;
        Ok(match incoming {
            Incoming::Text(text) => Input::from_text(&text),
            Incoming::Choice(data) => Input::Choice(data),
            Incoming::Document { file_id } => {
                Input::Document(download_file(self.channel.as_ref(), &file_id, backoff).await?)
            }
            Incoming::Photo { file_id } => {
                Input::Photo(download_file(self.channel.as_ref(), &file_id, backoff).await?)
            }
        })
    }

    /// Feeds operator input to the conversation that is waiting for it.
    /// A download failure abandons the conversation; other errors keep it.
    pub async fn handle_input(self: &Arc<Self>, operator: i64, chat: i64, incoming: Incoming) -> Result<Response> {
        let Some(mut conversation) = self.conversations.lock().await.take_collecting(operator) else {
            return Ok(Response::Idle);
        };

        let prepared = async {
            let input = self.materialize(incoming).await?;
            let account = self
                .registry
                .current_account(operator)
                .await?
                .ok_or(WorkerError::NoAccount)?;
            let catalog = self.registry.catalog(account.id).await?;
            Ok::<_, WorkerError>((input, catalog))
        }
        .await;
        let (input, catalog) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if e.kind() == ErrorKind::Connection {
                    warn!(operator, feature = conversation.feature.key(), error = %e, "Download failed, abandoning conversation");
                } else {
                    self.conversations.lock().await.put(operator, conversation);
                }
                return Err(e);
            }
        };

        let ctx = FsmContext {
            catalog: &catalog,
            config: &self.config,
        };
        let reply = conversation.handle(input, &ctx).await;
        let feature = conversation.feature;
        self.conversations.lock().await.put(operator, conversation);

        match reply {
            Reply::Start(plan) => {
                let title = plan.feature_title();
                self.launch(operator, chat, feature, plan).await;
                Ok(Response::Started { feature, title })
            }
            other => Ok(Response::Reply(other)),
        }
    }

    async fn launch(self: &Arc<Self>, operator: i64, chat: i64, feature: Feature, plan: Plan) {
        let stop = StopFlag::new();
        let campaign = match &plan {
            Plan::Broadcast(campaign) => Some(Campaign::new(campaign.clone(), &self.config, stop.clone())),
            _ => None,
        };
        self.jobs.lock().await.insert(
            (operator, feature),
            RunningJob {
                stop: stop.clone(),
                campaign: campaign.clone(),
            },
        );

        let engine = self.clone();
        tokio::spawn(async move {
            let title = plan.feature_title();
            let outcome = match campaign {
                Some(campaign) => engine.run_campaign(chat, campaign).await,
                None => engine.run_plan(operator, chat, plan, stop).await,
            };
            if let Err(e) = outcome {
                warn!(operator, feature = feature.key(), error = %e, "Job failed");
                engine.say(chat, &text::failure(&e, &engine.config.rate_limit_backoff)).await;
            }

            engine.jobs.lock().await.remove(&(operator, feature));
            engine.conversations.lock().await.finish(operator, feature);
            engine.emit(WorkerEvent::JobFinished { operator, title }).await;
        });
    }

    async fn say(&self, chat: i64, text: &str) {
        if let Err(e) = self.channel.send_message(chat, text).await {
            warn!(chat, error = %e, "Failed to send message");
        }
    }

    fn pacer(&self, stop: StopFlag) -> Pacer {
        Pacer {
            retry: self.retry_policy(),
            stop,
            progress_interval: self.config.progress_interval,
            spill_threshold: self.config.spill_threshold,
        }
    }

    #[instrument(skip(self, plan, stop), fields(job = %plan.feature_title()))]
    async fn run_plan(&self, operator: i64, chat: i64, plan: Plan, stop: StopFlag) -> Result<()> {
        let account = self
            .registry
            .current_account(operator)
            .await?
            .ok_or(WorkerError::NoAccount)?;
        let client = self.registry.client(account.id).await?;
        let catalog = self.registry.catalog(account.id).await?;
        let resolver = Resolver::new(self.registry.clone(), operator, self.config.connect_wait);
        let progress = ProgressMessage::new(self.channel.clone(), chat);
        let pacer = self.pacer(stop.clone());
        let config = &self.config;
        let title = plan.feature_title();

        let report = match plan {
            Plan::Settings {
                change,
                targets,
                delay,
            } => {
                let job = Job {
                    name: title,
                    targets,
                    delay,
                };
                let op = SettingsOp {
                    change,
                    timeout: config.step_timeout,
                };
                pacer.run(job, &resolver, client, &op, &progress).await
            }
            Plan::Participants {
                action,
                targets,
                numbers,
                mode,
                delay,
            } => {
                let job = Job {
                    name: title,
                    targets,
                    delay,
                };
                let op = ParticipantsOp {
                    action,
                    numbers,
                    mode,
                    timeout: config.step_timeout,
                    verify_delay: config.verify_delay,
                    country_code: config.country_code.clone(),
                    stop,
                };
                pacer.run(job, &resolver, client, &op, &progress).await
            }
            Plan::Create {
                names,
                numbers,
                settings,
                add_mode,
                delay,
            } => {
                let job = Job {
                    name: title,
                    targets: names,
                    delay,
                };
                let op = CreateOp {
                    numbers,
                    settings,
                    add_mode,
                    catalog,
                    create_timeout: config.create_timeout,
                    post_timeout: config.post_create_timeout,
                };
                pacer.run(job, &resolver, client, &op, &progress).await
            }
            Plan::Join { links, delay } => {
                let job = Job {
                    name: title,
                    targets: links,
                    delay,
                };
                let op = JoinOp {
                    catalog,
                    timeout: config.step_timeout,
                };
                pacer.run(job, &resolver, client, &op, &progress).await
            }
            Plan::Leave {
                targets,
                farewell,
                delay,
            } => {
                let job = Job {
                    name: title,
                    targets,
                    delay,
                };
                let op = LeaveOp {
                    farewell,
                    catalog,
                    timeout: config.step_timeout,
                };
                pacer.run(job, &resolver, client, &op, &progress).await
            }
            Plan::Links { targets, delay } => {
                let job = Job {
                    name: title,
                    targets,
                    delay,
                };
                let op = LinksOp {
                    timeout: config.step_timeout,
                };
                pacer.run(job, &resolver, client, &op, &progress).await
            }
            Plan::Broadcast(plan) => {
                let campaign = Campaign::new(plan, config, stop);
                return self.run_campaign(chat, campaign).await;
            }
        };

        progress.clear().await;
        self.deliver(chat, report).await;
        Ok(())
    }

    async fn deliver(&self, chat: i64, report: JobReport) {
        let mut summary = text::summary(&report, self.config.max_failures_shown);
        if let Some(Interruption::Permanent(err)) = &report.interruption {
            if let Some(remedy) = hint_for(err, &self.config.rate_limit_backoff) {
                summary.push_str("\n\n");
                summary.push_str(&text::hint(remedy));
            }
        }
        self.say(chat, &summary).await;

        if let SpillOutput::File { path, lines } = &report.output {
            let caption = format!("{}: {lines} hasil", report.title);
            if let Err(e) = self.channel.send_document(chat, path, &caption).await {
                warn!(chat, error = %e, "Failed to send result file");
            }
        }
    }

    async fn run_campaign(&self, chat: i64, campaign: Arc<Campaign>) -> Result<()> {
        let progress = Arc::new(ProgressMessage::new(self.channel.clone(), chat));
        let clients: Arc<dyn CampaignClients> = self.registry.clone();
        let report = campaign.run(clients, progress.clone()).await;
        progress.clear().await;
        let report = report?;
        self.say(chat, &text::campaign_summary(&report)).await;
        Ok(())
    }
}

fn campaign_accounts(accounts: Vec<Account>) -> Vec<AccountRef> {
    accounts
        .into_iter()
        .map(|a| AccountRef {
            id: a.id,
            phone: a.phone,
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Hint;
    use crate::testing::{MockChannel, MockFactory};
    use mira_core::WaError;
    use mira_db::MiraDb;

    struct Harness {
        engine: Arc<MiraEngine>,
        factory: Arc<MockFactory>,
        channel: Arc<MockChannel>,
        _dir: tempfile::TempDir,
    }

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry_backoff: ms(&[1, 2, 4]),
            rate_limit_backoff: ms(&[30, 60, 120]),
            download_backoff: ms(&[1, 2, 4]),
            connect_wait: Duration::from_millis(100),
            ..EngineConfig::default()
        }
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MiraDb::new(dir.path()).await.unwrap());
        let factory = Arc::new(MockFactory::default());
        let channel = Arc::new(MockChannel::default());
        let registry = Arc::new(SessionRegistry::new(
            db,
            factory.clone(),
            dir.path().to_path_buf(),
        ));
        let engine = Arc::new(MiraEngine::new(fast_config(), registry, channel.clone()));
        Harness {
            engine,
            factory,
            channel,
            _dir: dir,
        }
    }

    async fn wait_idle(engine: &MiraEngine, operator: i64) {
        while !engine.running_jobs(operator).await.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn answer(h: &Harness, text: &str) -> Response {
        h.engine
            .handle_input(7, 70, Incoming::Text(text.to_string()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pair_registers_and_returns_code() {
        let h = harness().await;
        let outcome = h.engine.pair(7, "0811-2345-6789").await.unwrap();
        assert_eq!(outcome.code, "ABCD-EFGH");
        assert_eq!(outcome.account.phone, "6281123456789");

        let client = &h.factory.created(outcome.account.id)[0];
        assert_eq!(client.calls_of("pair_phone"), vec!["6281123456789"]);
    }

    #[tokio::test]
    async fn test_pair_rejects_bad_number() {
        let h = harness().await;
        let err = h.engine.pair(7, "12345").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.engine.status(7).await.unwrap().accounts.is_empty());
    }

    #[tokio::test]
    async fn test_pair_waits_out_rate_limit() {
        let h = harness().await;
        h.factory
            .fail_times("pair_phone", WaError::remote("429 rate-overlimit"), 3);

        let start = std::time::Instant::now();
        let outcome = h.engine.pair(7, "6281123456789").await.unwrap();
        assert_eq!(outcome.code, "ABCD-EFGH");
        assert!(start.elapsed() >= Duration::from_millis(210));
        assert_eq!(
            h.factory.created(outcome.account.id)[0].count("pair_phone"),
            4
        );
    }

    #[tokio::test]
    async fn test_pair_rate_limit_exhausted_gives_wait_hint() {
        let h = harness().await;
        h.factory
            .fail_times("pair_phone", WaError::remote("429 rate-overlimit"), 4);

        let err = h.engine.pair(7, "6281123456789").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        let hint = hint_for(err.as_wa().unwrap(), &h.engine.config().rate_limit_backoff);
        assert_eq!(hint, Some(Hint::WaitMinutes(1)));
    }

    #[tokio::test]
    async fn test_background_pair_leaves_engine_responsive() {
        let h = harness().await;
        h.factory
            .fail_times("pair_phone", WaError::remote("429 rate-overlimit"), 2);

        let handle = h.engine.begin_pair(7, 70, "6281123456789".to_string());
        // Backoff still pending; other commands are served meanwhile.
        assert!(h.channel.sent_texts(70).is_empty());
        assert_eq!(h.engine.stop(7).await, 0);

        handle.await.unwrap();
        let sent = h.channel.sent_texts(70);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("ABCD-EFGH"));
    }

    #[tokio::test]
    async fn test_background_pair_reports_errors() {
        let h = harness().await;
        h.engine
            .begin_pair(7, 70, "12".to_string())
            .await
            .unwrap();
        let sent = h.channel.sent_texts(70);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("⚠️"));
    }

    #[tokio::test]
    async fn test_background_refresh_reports_busy() {
        let h = harness().await;
        let account = h.engine.pair(7, "6281123456789").await.unwrap().account;
        let _held = h.engine.refresh_guard.try_begin(account.id).unwrap();

        h.engine.begin_refresh(7, 70).await.unwrap();
        let sent = h.channel.sent_texts(70);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("masih berjalan"));
    }

    #[tokio::test]
    async fn test_same_phone_for_other_operator_is_refused() {
        let h = harness().await;
        h.engine.pair(7, "6281123456789").await.unwrap();
        let err = h.engine.pair(8, "6281123456789").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert!(h.engine.status(8).await.unwrap().accounts.is_empty());
    }

    #[tokio::test]
    async fn test_feature_needs_an_account() {
        let h = harness().await;
        let err = h.engine.start_feature(7, Feature::Links).await.err().unwrap();
        assert!(matches!(err, WorkerError::NoAccount));
    }

    #[tokio::test]
    async fn test_links_job_end_to_end() {
        let h = harness().await;
        let account = h.engine.pair(7, "6281123456789").await.unwrap().account;
        let catalog = h.engine.registry().catalog(account.id).await.unwrap();
        catalog.save("11@g.us", "Alpha").await.unwrap();
        catalog.save("22@g.us", "Beta").await.unwrap();

        h.engine.start_feature(7, Feature::Links).await.unwrap();
        assert!(matches!(answer(&h, "Alpha\nBeta").await, Response::Reply(Reply::Prompt { .. })));
        assert!(matches!(answer(&h, "0").await, Response::Reply(Reply::Confirm { .. })));
        let response = h
            .engine
            .handle_input(7, 70, Incoming::Choice("ya".into()))
            .await
            .unwrap();
        assert!(matches!(
            response,
            Response::Started {
                feature: Feature::Links,
                ..
            }
        ));

        wait_idle(&h.engine, 7).await;
        let sent = h.channel.sent_texts(70);
        let summary = sent.last().unwrap();
        assert!(summary.contains("Selesai"));
        assert!(summary.contains("Alpha — https://chat.whatsapp.com/INV11"));
        assert!(summary.contains("Beta — https://chat.whatsapp.com/INV22"));
        assert_eq!(h.channel.deleted().len(), 1);

        // The conversation is gone once the job ends.
        assert!(h.engine.status(7).await.unwrap().conversations.is_empty());
        assert!(matches!(answer(&h, "lagi").await, Response::Idle));
    }

    #[tokio::test]
    async fn test_stop_interrupts_running_job() {
        let h = harness().await;
        let account = h.engine.pair(7, "6281123456789").await.unwrap().account;
        let catalog = h.engine.registry().catalog(account.id).await.unwrap();
        for i in 0..5 {
            catalog
                .save(&format!("{i}@g.us"), &format!("Grup {i}"))
                .await
                .unwrap();
        }

        h.engine.start_feature(7, Feature::Links).await.unwrap();
        answer(&h, "semua").await;
        answer(&h, "1").await;
        answer(&h, "ya").await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.engine.stop(7).await, 1);
        wait_idle(&h.engine, 7).await;

        let summary = h.channel.sent_texts(70).last().unwrap().clone();
        assert!(summary.contains("dihentikan"));
        assert!(summary.contains("2/5"));
        let client = &h.factory.created(account.id)[0];
        assert_eq!(client.count("invite_link"), 2);
    }

    #[tokio::test]
    async fn test_download_failure_abandons_conversation() {
        let h = harness().await;
        h.engine.pair(7, "6281123456789").await.unwrap();
        h.engine.start_feature(7, Feature::Join).await.unwrap();

        let err = h
            .engine
            .handle_input(
                7,
                70,
                Incoming::Document {
                    file_id: "missing".into(),
                },
            )
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(matches!(answer(&h, "x").await, Response::Idle));
    }

    #[tokio::test]
    async fn test_invalid_input_keeps_conversation() {
        let h = harness().await;
        h.engine.pair(7, "6281123456789").await.unwrap();
        h.engine.start_feature(7, Feature::Links).await.unwrap();

        assert!(matches!(
            answer(&h, "Tidak Ada").await,
            Response::Reply(Reply::Invalid { .. })
        ));
        let status = h.engine.status(7).await.unwrap();
        assert_eq!(
            status.conversations,
            vec![(Feature::Links, Phase::AwaitingGroupSelector)]
        );

        assert_eq!(h.engine.cancel(7).await, Some(Feature::Links));
        assert!(h.engine.status(7).await.unwrap().conversations.is_empty());
    }

    #[tokio::test]
    async fn test_manual_refresh_is_exclusive() {
        let h = harness().await;
        let account = h.engine.pair(7, "6281123456789").await.unwrap().account;

        let ticket = h.engine.refresh_guard.try_begin(account.id).unwrap();
        let err = h.engine.refresh(7).await.err().unwrap();
        assert!(matches!(err, WorkerError::Busy(_)));
        drop(ticket);
        assert_eq!(h.engine.refresh(7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_removes_every_account() {
        let h = harness().await;
        h.engine.pair(7, "6281111111111").await.unwrap();
        h.engine.pair(7, "6282222222222").await.unwrap();
        h.engine.start_feature(7, Feature::Links).await.unwrap();

        assert_eq!(h.engine.reset(7).await.unwrap(), 2);
        let status = h.engine.status(7).await.unwrap();
        assert!(status.accounts.is_empty());
        assert!(status.conversations.is_empty());
    }

    #[tokio::test]
    async fn test_use_account_switches_current() {
        let h = harness().await;
        let first = h.engine.pair(7, "6281111111111").await.unwrap().account;
        h.engine.pair(7, "6282222222222").await.unwrap();

        h.engine.use_account(7, "081111111111").await.unwrap();
        let status = h.engine.status(7).await.unwrap();
        let current: Vec<_> = status.accounts.iter().filter(|a| a.current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].account.id, first.id);

        assert!(h.engine.use_account(7, "6283333333333").await.is_err());
    }

    #[tokio::test]
    async fn test_remote_logout_removes_account() {
        let mut h = harness().await;
        let mut events = Arc::get_mut(&mut h.engine)
            .unwrap()
            .take_event_receiver()
            .unwrap();
        let account = h.engine.pair(7, "6281123456789").await.unwrap().account;

        h.engine
            .handle_ipc_event(IpcEvent::LoggedOut {
                account_id: account.id,
                reason: Some("device_removed".into()),
            })
            .await;

        assert!(h.engine.status(7).await.unwrap().accounts.is_empty());
        match events.recv().await.unwrap() {
            WorkerEvent::LoggedOut { operator, phone, .. } => {
                assert_eq!(operator, 7);
                assert_eq!(phone, "6281123456789");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
