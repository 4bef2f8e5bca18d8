use std::sync::Arc;
use std::time::Duration;

use mira_core::WaClient;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::registry::SessionRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Makes one reconnect attempt and waits up to `wait` for the session.
pub async fn ensure_connected(client: &dyn WaClient, wait: Duration) -> Result<()> {
    if client.is_connected() {
        return Ok(());
    }

    let deadline = Instant::now() + wait;
    match tokio::time::timeout(wait, client.connect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(account_id = client.account_id(), error = %e, "Reconnect attempt failed"),
        Err(_) => debug!(account_id = client.account_id(), "Reconnect attempt timed out"),
    }

    while Instant::now() < deadline {
        if client.is_connected() {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    if client.is_connected() {
        Ok(())
    } else {
        Err(WorkerError::ConnectionUnavailable)
    }
}

/// Picks the client for each step of a long job, so a job follows the
/// operator's freshest session instead of the one it started with.
#[derive(Clone)]
pub struct Resolver {
    registry: Arc<SessionRegistry>,
    operator: i64,
    connect_wait: Duration,
}

impl Resolver {
    pub fn new(registry: Arc<SessionRegistry>, operator: i64, connect_wait: Duration) -> Self {
        Self {
            registry,
            operator,
            connect_wait,
        }
    }

    /// `None` means the job must stop: no usable session remains.
    pub async fn resolve(
        &self,
        fallback: &Arc<dyn WaClient>,
        process: &str,
        index: usize,
        total: usize,
    ) -> Option<Arc<dyn WaClient>> {
        let client = match self.registry.current_client(self.operator).await {
            Ok(Some(client)) => client,
            Ok(None) => fallback.clone(),
            Err(e) => {
                warn!(process, error = %e, "Registry lookup failed, using fallback client");
                fallback.clone()
            }
        };

        if !client.is_logged_in() {
            warn!(process, index, total, account_id = client.account_id(), "Session logged out, stopping");
            return None;
        }

        match ensure_connected(client.as_ref(), self.connect_wait).await {
            Ok(()) => Some(client),
            Err(_) => {
                warn!(process, index, total, account_id = client.account_id(), "Session unavailable, stopping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer::{Job, Pacer, TargetOp};
    use crate::report::{Interruption, StepReport};
    use crate::retry::RetryPolicy;
    use crate::stop::StopFlag;
    use crate::testing::{MockClient, MockFactory, RecordingSink};
    use async_trait::async_trait;
    use mira_core::{Jid, WaResult};
    use mira_db::MiraDb;

    const OPERATOR: i64 = 7;

    /// What happens to the operator's session right after a target is sent.
    enum Twist {
        None,
        Replace,
        LogOut,
    }

    struct SendOp {
        registry: Arc<SessionRegistry>,
        factory: Arc<MockFactory>,
        account_id: i64,
        twist_after: &'static str,
        twist: Twist,
    }

    #[async_trait]
    impl TargetOp<String> for SendOp {
        fn label(&self, target: &String) -> String {
            target.clone()
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn apply(&self, client: &Arc<dyn WaClient>, target: &String) -> WaResult<StepReport> {
            client.send_text(&Jid::group(target), target).await?;
            if target == self.twist_after {
                match self.twist {
                    Twist::None => {}
                    Twist::Replace => {
                        self.registry.create_client(self.account_id).await.unwrap();
                    }
                    Twist::LogOut => self.factory.created(self.account_id)[0].set_logged_in(false),
                }
            }
            Ok(StepReport::success())
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        factory: Arc<MockFactory>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MiraDb::new(dir.path()).await.unwrap());
        let factory = Arc::new(MockFactory::default());
        let registry = Arc::new(SessionRegistry::new(db, factory.clone(), dir.path().to_path_buf()));
        Fixture {
            registry,
            factory,
            _dir: dir,
        }
    }

    fn pacer() -> Pacer {
        Pacer {
            retry: RetryPolicy::new(vec![Duration::from_millis(1)], vec![Duration::from_millis(30)]),
            stop: StopFlag::new(),
            progress_interval: Duration::from_secs(10),
            spill_threshold: 50,
        }
    }

    fn job(n: usize) -> Job<String> {
        Job {
            name: "test".into(),
            targets: (0..n).map(|i| i.to_string()).collect(),
            delay: Duration::from_millis(1),
        }
    }

    fn resolver(f: &Fixture) -> Resolver {
        Resolver::new(f.registry.clone(), OPERATOR, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_job_follows_replaced_client() {
        let f = fixture().await;
        let account = f.registry.add("6281111111111", OPERATOR).await.unwrap();
        let first = f.registry.client(account.id).await.unwrap();
        let op = SendOp {
            registry: f.registry.clone(),
            factory: f.factory.clone(),
            account_id: account.id,
            twist_after: "1",
            twist: Twist::Replace,
        };

        let report = pacer()
            .run(job(5), &resolver(&f), first, &op, &RecordingSink::default())
            .await;

        assert!(report.interruption.is_none());
        assert_eq!(report.tally.success, 5);
        let created = f.factory.created(account.id);
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].calls_of("send_text").len(), 2);
        assert_eq!(created[1].calls_of("send_text").len(), 3);
    }

    #[tokio::test]
    async fn test_fallback_used_without_current_session() {
        let f = fixture().await;
        let fallback = MockClient::new(50);
        let op = SendOp {
            registry: f.registry.clone(),
            factory: f.factory.clone(),
            account_id: 50,
            twist_after: "",
            twist: Twist::None,
        };

        let report = pacer()
            .run(job(3), &resolver(&f), fallback.clone(), &op, &RecordingSink::default())
            .await;

        assert!(report.interruption.is_none());
        assert_eq!(fallback.count("send_text"), 3);
    }

    #[tokio::test]
    async fn test_logged_out_session_stops_job() {
        let f = fixture().await;
        let account = f.registry.add("6281111111111", OPERATOR).await.unwrap();
        let client = f.registry.client(account.id).await.unwrap();
        let op = SendOp {
            registry: f.registry.clone(),
            factory: f.factory.clone(),
            account_id: account.id,
            twist_after: "1",
            twist: Twist::LogOut,
        };

        let report = pacer()
            .run(job(5), &resolver(&f), client, &op, &RecordingSink::default())
            .await;

        assert!(matches!(report.interruption, Some(Interruption::SessionLost)));
        assert_eq!(report.processed, 2);
        assert_eq!(f.factory.created(account.id)[0].count("send_text"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_reconnects() {
        let client = MockClient::new(1);
        client.set_connected(false);
        client.reconnect_on_connect(true);

        ensure_connected(client.as_ref(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.count("connect"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_gives_up_after_window() {
        let client = MockClient::new(1);
        client.set_connected(false);

        let start = Instant::now();
        let err = ensure_connected(client.as_ref(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ConnectionUnavailable));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(client.count("connect"), 1);
    }
}
