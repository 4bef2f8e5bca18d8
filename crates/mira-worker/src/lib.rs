mod broadcast;
mod channel;
mod config;
mod download;
mod engine;
mod error;
mod events;
mod fsm;
mod ingest;
mod metadata;
mod ops;
mod pacer;
mod paths;
mod photo;
mod progress;
mod registry;
mod report;
mod resolver;
mod retry;
mod stop;
mod text;

#[cfg(test)]
mod testing;

pub use broadcast::{AccountRef, AccountStats, CampaignReport, CampaignStats};
pub use channel::{Button, ChannelError, ControlChannel, RemoteFile};
pub use config::EngineConfig;
pub use engine::{AccountStatus, EngineStatus, Incoming, MiraEngine, PairOutcome, Response};
pub use error::{ErrorKind, Result, WorkerError};
pub use events::WorkerEvent;
pub use fsm::{
    CreateField, DONE_SENTINEL, DelayKind, Feature, ModeKind, Phase, Plan, PromptDetail, Reply, TextKind,
};
pub use registry::SessionRegistry;
pub use retry::{Hint, hint_for};
pub use text::error_reply;

pub use mira_db::{Account, GroupRecord};
