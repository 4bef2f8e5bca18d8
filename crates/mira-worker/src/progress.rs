use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::ControlChannel;

/// Receives rendered progress text.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update(&self, text: &str);
}

/// One control-channel message, sent once and edited afterwards.
pub struct ProgressMessage {
    channel: Arc<dyn ControlChannel>,
    chat_id: i64,
    message_id: Mutex<Option<i64>>,
}

impl ProgressMessage {
    pub fn new(channel: Arc<dyn ControlChannel>, chat_id: i64) -> Self {
        Self {
            channel,
            chat_id,
            message_id: Mutex::new(None),
        }
    }

    /// Deletes the progress message, if one was sent.
    pub async fn clear(&self) {
        let id = self.message_id.lock().await.take();
        if let Some(id) = id {
            if let Err(e) = self.channel.delete_message(self.chat_id, id).await {
                debug!(error = %e, "Failed to delete progress message");
            }
        }
    }
}

#[async_trait]
impl ProgressSink for ProgressMessage {
    async fn update(&self, text: &str) {
        let mut message_id = self.message_id.lock().await;
        match *message_id {
            Some(id) => {
                if let Err(e) = self.channel.edit_message(self.chat_id, id, text).await {
                    debug!(error = %e, "Failed to edit progress message");
                }
            }
            None => match self.channel.send_message(self.chat_id, text).await {
                Ok(id) => *message_id = Some(id),
                Err(e) => debug!(error = %e, "Failed to send progress message"),
            },
        }
    }
}

/// Decides when a job step is worth reporting.
#[derive(Debug)]
pub struct Cadence {
    every: usize,
    min_interval: Duration,
    last_emit: Instant,
}

impl Cadence {
    /// Every 3 steps for large or slow jobs, every 5 otherwise.
    pub fn for_job(total: usize, delay: Duration, min_interval: Duration) -> Self {
        let every = if total > 100 || delay >= Duration::from_secs(10) {
            3
        } else {
            5
        };
        Self {
            every,
            min_interval,
            last_emit: Instant::now(),
        }
    }

    /// `done` counts finished steps, starting at 1.
    pub fn should_emit(&mut self, done: usize, total: usize) -> bool {
        let due = done == total
            || done % self.every == 0
            || self.last_emit.elapsed() >= self.min_interval;
        if due {
            self.last_emit = Instant::now();
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    #[tokio::test]
    async fn test_progress_reuses_one_message() {
        let channel = Arc::new(MockChannel::default());
        let progress = ProgressMessage::new(channel.clone(), 7);

        progress.update("1/3").await;
        progress.update("2/3").await;
        progress.update("3/3").await;
        progress.clear().await;

        assert_eq!(channel.sent_texts(7), vec!["1/3"]);
        assert_eq!(channel.edits().len(), 2);
        assert_eq!(channel.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_thresholds() {
        let emitted = |total: usize, delay: Duration| -> Vec<usize> {
            let mut cadence = Cadence::for_job(total, delay, Duration::from_secs(3600));
            (1..=total.min(12))
                .filter(|i| cadence.should_emit(*i, total))
                .collect()
        };
        assert_eq!(emitted(20, Duration::from_secs(2)), vec![5, 10]);
        assert_eq!(emitted(101, Duration::from_secs(1)), vec![3, 6, 9, 12]);
        assert_eq!(emitted(5, Duration::from_secs(10)), vec![3, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_time_floor() {
        let mut cadence = Cadence::for_job(20, Duration::ZERO, Duration::from_secs(10));
        assert!(!cadence.should_emit(1, 20));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cadence.should_emit(2, 20));
        assert!(!cadence.should_emit(3, 20));
    }
}
