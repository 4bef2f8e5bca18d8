/// Session and job lifecycle notices for the front-end. Each carries the
/// owning operator so the bot can address the right chat.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    SidecarReady,
    PairingCode { operator: i64, account_id: i64, code: String },
    PairSuccess { operator: i64, account_id: i64, phone: String },
    Connected { operator: i64, account_id: i64 },
    Disconnected { operator: i64, account_id: i64, reason: String },
    LoggedOut { operator: i64, account_id: i64, phone: String },
    GroupsRefreshed { operator: i64, account_id: i64, count: usize },
    JobFinished { operator: i64, title: String },
    Error { account_id: Option<i64>, error: String },
}
