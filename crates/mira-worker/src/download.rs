use std::time::Duration;

use crate::channel::ControlChannel;
use crate::error::{Result, WorkerError};
use crate::retry::RetryPolicy;

/// Fetches the file descriptor, then the bytes; each stage retried on its own
/// with `backoff`.
pub async fn download_file(
    channel: &dyn ControlChannel,
    file_id: &str,
    backoff: &[Duration],
) -> Result<Vec<u8>> {
    let policy = RetryPolicy::new(backoff.to_vec(), backoff.to_vec());
    let file = policy
        .run("file info", None, move || channel.file_info(file_id))
        .await
        .map_err(|e| WorkerError::Download(format!("file info: {e}")))?;
    let file = &file;
    let bytes = policy
        .run("file bytes", None, move || channel.download(file))
        .await
        .map_err(|e| WorkerError::Download(format!("file bytes: {e}")))?;
    if bytes.is_empty() {
        return Err(WorkerError::validation("File kosong"));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    fn backoff() -> Vec<Duration> {
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_each_stage() {
        let channel = MockChannel::default();
        channel.put_file("f1", b"0811\n0822".to_vec());
        channel.fail_downloads(2);

        let start = tokio::time::Instant::now();
        let bytes = download_file(&channel, "f1", &backoff()).await.unwrap();
        assert_eq!(bytes, b"0811\n0822");
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(channel.download_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_schedule() {
        let channel = MockChannel::default();
        channel.put_file("f1", b"x".to_vec());
        channel.fail_downloads(10);

        let err = download_file(&channel, "f1", &backoff()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Download(_)));
        assert_eq!(channel.download_attempts(), 4);
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_retried() {
        let channel = MockChannel::default();
        let err = download_file(&channel, "missing", &backoff()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Download(_)));
        assert_eq!(channel.download_attempts(), 0);
    }

    #[tokio::test]
    async fn test_empty_file_is_validation_error() {
        let channel = MockChannel::default();
        channel.put_file("f2", Vec::new());
        let err = download_file(&channel, "f2", &[]).await.unwrap_err();
        assert!(matches!(err, WorkerError::Validation(_)));
    }
}
