use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mira_core::{WaClient, WaError, WaResult};
use tracing::{info, instrument, warn};

use crate::progress::{Cadence, ProgressSink};
use crate::report::{Failure, Interruption, JobReport, ResultSpill, SpillOutput, StepReport, Tally};
use crate::resolver::Resolver;
use crate::retry::{ErrorClass, RetryPolicy, classify, wait_minutes};
use crate::stop::StopFlag;
use crate::text;

/// Per-target work of a job.
#[async_trait]
pub trait TargetOp<T: Sync>: Send + Sync {
    fn label(&self, target: &T) -> String;

    /// Bound for one attempt of `apply`.
    fn timeout(&self) -> Duration;

    async fn apply(&self, client: &Arc<dyn WaClient>, target: &T) -> WaResult<StepReport>;
}

/// Source of the client for each step.
#[async_trait]
pub trait ClientSource: Send + Sync {
    async fn resolve(
        &self,
        fallback: &Arc<dyn WaClient>,
        process: &str,
        index: usize,
        total: usize,
    ) -> Option<Arc<dyn WaClient>>;
}

#[async_trait]
impl ClientSource for Resolver {
    async fn resolve(
        &self,
        fallback: &Arc<dyn WaClient>,
        process: &str,
        index: usize,
        total: usize,
    ) -> Option<Arc<dyn WaClient>> {
        Resolver::resolve(self, fallback, process, index, total).await
    }
}

pub struct Job<T> {
    pub name: String,
    pub targets: Vec<T>,
    pub delay: Duration,
}

/// Runs jobs one target at a time with pacing, retries and progress.
pub struct Pacer {
    pub retry: RetryPolicy,
    pub stop: StopFlag,
    pub progress_interval: Duration,
    pub spill_threshold: usize,
}

impl Pacer {
    #[instrument(skip_all, fields(job = %job.name, total = job.targets.len()))]
    pub async fn run<T, O>(
        &self,
        job: Job<T>,
        source: &dyn ClientSource,
        fallback: Arc<dyn WaClient>,
        op: &O,
        sink: &dyn ProgressSink,
    ) -> JobReport
    where
        T: Sync,
        O: TargetOp<T>,
    {
        let total = job.targets.len();
        let mut cadence = Cadence::for_job(total, job.delay, self.progress_interval);
        let mut tally = Tally::default();
        let mut spill = ResultSpill::new(self.spill_threshold);
        let mut processed = 0;
        let mut interruption = None;

        info!("Job started");

        for (index, target) in job.targets.iter().enumerate() {
            if self.stop.is_stopped() {
                interruption = Some(Interruption::Stopped);
                break;
            }

            let Some(client) = source.resolve(&fallback, &job.name, index, total).await else {
                interruption = Some(Interruption::SessionLost);
                break;
            };

            let label = op.label(target);
            let step_timeout = op.timeout();
            let client = &client;
            let result = self
                .retry
                .run(&label, Some(&self.stop), move || async move {
                    match tokio::time::timeout(step_timeout, op.apply(client, target)).await {
                        Ok(result) => result,
                        Err(_) => Err(WaError::Timeout("context deadline exceeded".to_string())),
                    }
                })
                .await;
            processed += 1;

            let mut fatal = None;
            match result {
                Ok(mut step) => {
                    for line in step.lines.drain(..) {
                        if let Err(e) = spill.push(line) {
                            warn!(error = %e, "Failed to write result line");
                        }
                    }
                    tally.absorb(&mut step);
                }
                Err(err) => {
                    warn!(target = %label, error = %err, "Step failed");
                    tally.failures.push(Failure::new(&label, err.to_string()));
                    match classify(&err) {
                        ErrorClass::Permanent => fatal = Some(Interruption::Permanent(err)),
                        // A raised stop flag cut the backoff short; the stop check below ends the job.
                        ErrorClass::RateLimited if !self.stop.is_stopped() => {
                            fatal = Some(Interruption::RateLimited {
                                error: err,
                                wait_minutes: wait_minutes(&self.retry.rate_limit),
                            })
                        }
                        _ => {}
                    }
                }
            }

            if fatal.is_some() || cadence.should_emit(processed, total) {
                sink.update(&text::progress(&job.name, processed, total, &tally))
                    .await;
            }
            if let Some(reason) = fatal {
                interruption = Some(reason);
                break;
            }

            if index + 1 < total && !self.stop.sleep(job.delay).await {
                interruption = Some(Interruption::Stopped);
                break;
            }
        }

        if let Some(reason) = &interruption {
            warn!(processed, ?reason, "Job interrupted");
            sink.update(&text::interrupted(&job.name, processed, total, reason))
                .await;
        } else {
            info!(
                success = tally.success,
                invited = tally.invited,
                failed = tally.failed(),
                "Job finished"
            );
        }

        let output = spill.finish().unwrap_or_else(|e| {
            warn!(error = %e, "Result file unavailable");
            SpillOutput::Inline(Vec::new())
        });

        JobReport {
            title: job.name,
            total,
            processed,
            tally,
            interruption,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockClient, RecordingSink};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct FixedSource(Mutex<Option<Arc<dyn WaClient>>>);

    impl FixedSource {
        fn new(client: Arc<dyn WaClient>) -> Self {
            Self(Mutex::new(Some(client)))
        }

        fn drop_session(&self) {
            *self.0.lock().unwrap() = None;
        }
    }

    #[async_trait]
    impl ClientSource for FixedSource {
        async fn resolve(
            &self,
            _fallback: &Arc<dyn WaClient>,
            _process: &str,
            _index: usize,
            _total: usize,
        ) -> Option<Arc<dyn WaClient>> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Sends the target text; fails for targets listed in `failing`.
    struct SendOp {
        failing: HashSet<String>,
        lose_session_at: Option<(usize, Arc<FixedSource>)>,
    }

    #[async_trait]
    impl TargetOp<String> for SendOp {
        fn label(&self, target: &String) -> String {
            target.clone()
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(15)
        }

        async fn apply(&self, client: &Arc<dyn WaClient>, target: &String) -> WaResult<StepReport> {
            client.send_text(&mira_core::Jid::group(target), target).await?;
            if let Some((at, source)) = &self.lose_session_at {
                if target == &at.to_string() {
                    source.drop_session();
                }
            }
            if self.failing.contains(target) {
                return Err(WaError::remote("item-not-found"));
            }
            Ok(StepReport::success().with_line(format!("{target} ok")))
        }
    }

    fn pacer() -> Pacer {
        Pacer {
            retry: RetryPolicy::new(
                vec![
                    Duration::from_secs(1),
                    Duration::from_secs(2),
                    Duration::from_secs(4),
                ],
                vec![Duration::from_secs(30)],
            ),
            stop: StopFlag::new(),
            progress_interval: Duration::from_secs(10),
            spill_threshold: 50,
        }
    }

    fn job(n: usize, delay: Duration) -> Job<String> {
        Job {
            name: "test".into(),
            targets: (0..n).map(|i| i.to_string()).collect(),
            delay,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_and_tally() {
        let client = MockClient::new(1);
        let source = FixedSource::new(client.clone());
        let sink = RecordingSink::default();
        let op = SendOp {
            failing: ["2".to_string()].into_iter().collect(),
            lose_session_at: None,
        };

        let start = Instant::now();
        let report = pacer()
            .run(job(5, Duration::from_secs(3)), &source, client.clone(), &op, &sink)
            .await;

        assert_eq!(start.elapsed(), Duration::from_secs(12));
        assert_eq!(report.processed, 5);
        assert_eq!(report.tally.success, 4);
        assert_eq!(report.tally.failed(), 1);
        assert_eq!(report.tally.failures[0].target, "2");
        assert!(report.interruption.is_none());
        assert_eq!(client.count("send_text"), 5);
        // Final step always reports.
        assert!(sink.updates().last().unwrap().contains("5/5"));
        match report.output {
            SpillOutput::Inline(lines) => assert_eq!(lines.len(), 4),
            SpillOutput::File { .. } => panic!("unexpected spill"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_then_counted() {
        let client = MockClient::new(1);
        client.fail_times("send_text", WaError::Timeout("context deadline exceeded".into()), 10);
        let source = FixedSource::new(client.clone());
        let sink = RecordingSink::default();
        let op = SendOp {
            failing: HashSet::new(),
            lose_session_at: None,
        };

        let start = Instant::now();
        let report = pacer()
            .run(job(2, Duration::ZERO), &source, client.clone(), &op, &sink)
            .await;

        // First target: 4 attempts, 7s of backoff. Second: 4 more failures, then the budget is spent.
        assert_eq!(report.tally.failed(), 2);
        assert!(report.interruption.is_none());
        assert_eq!(client.count("send_text"), 8);
        assert_eq!(start.elapsed(), Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loss_stops_further_calls() {
        let client = MockClient::new(1);
        let source = Arc::new(FixedSource::new(client.clone()));
        let sink = RecordingSink::default();
        let op = SendOp {
            failing: HashSet::new(),
            lose_session_at: Some((3, source.clone())),
        };

        let report = pacer()
            .run(job(10, Duration::from_secs(1)), source.as_ref(), client.clone(), &op, &sink)
            .await;

        assert!(matches!(report.interruption, Some(Interruption::SessionLost)));
        assert_eq!(report.processed, 4);
        assert_eq!(client.count("send_text"), 4);
        assert!(sink.updates().last().unwrap().contains("dihentikan"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_aborts() {
        let client = MockClient::new(1);
        client.fail_times("send_text", WaError::remote("401 unauthorized"), 1);
        let source = FixedSource::new(client.clone());
        let sink = RecordingSink::default();
        let op = SendOp {
            failing: HashSet::new(),
            lose_session_at: None,
        };

        let report = pacer()
            .run(job(5, Duration::from_secs(1)), &source, client.clone(), &op, &sink)
            .await;

        assert!(matches!(report.interruption, Some(Interruption::Permanent(_))));
        assert_eq!(client.count("send_text"), 1);
        assert_eq!(report.tally.failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rate_limit_aborts_job() {
        let client = MockClient::new(1);
        client.fail_times("send_text", WaError::remote("429 rate-overlimit"), 100);
        let source = FixedSource::new(client.clone());
        let sink = RecordingSink::default();
        let op = SendOp {
            failing: HashSet::new(),
            lose_session_at: None,
        };

        let start = Instant::now();
        let report = pacer()
            .run(job(5, Duration::from_secs(1)), &source, client.clone(), &op, &sink)
            .await;

        assert!(matches!(
            report.interruption,
            Some(Interruption::RateLimited { wait_minutes: 1, .. })
        ));
        assert_eq!(report.processed, 1);
        assert_eq!(report.tally.failed(), 1);
        // One 30s wait, then the second attempt fails too.
        assert_eq!(client.count("send_text"), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        let last = sink.updates().last().cloned().unwrap();
        assert!(last.contains("1/5"));
        assert!(last.contains("Tunggu sekitar 1 menit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_rate_limit_wait_is_a_stop() {
        let client = MockClient::new(1);
        client.fail_times("send_text", WaError::remote("429 rate-overlimit"), 100);
        let source = FixedSource::new(client.clone());
        let sink = RecordingSink::default();
        let op = SendOp {
            failing: HashSet::new(),
            lose_session_at: None,
        };
        let pacer = pacer();
        let stop = pacer.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            stop.stop();
        });

        let report = pacer
            .run(job(5, Duration::from_secs(1)), &source, client.clone(), &op, &sink)
            .await;

        assert!(matches!(report.interruption, Some(Interruption::Stopped)));
        assert_eq!(client.count("send_text"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flag_ends_job_between_steps() {
        let client = MockClient::new(1);
        let source = FixedSource::new(client.clone());
        let sink = RecordingSink::default();
        let op = SendOp {
            failing: HashSet::new(),
            lose_session_at: None,
        };
        let pacer = pacer();
        let stop = pacer.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4500)).await;
            stop.stop();
        });

        let report = pacer
            .run(job(10, Duration::from_secs(2)), &source, client.clone(), &op, &sink)
            .await;

        assert!(matches!(report.interruption, Some(Interruption::Stopped)));
        assert_eq!(report.processed, 3);
    }
}
