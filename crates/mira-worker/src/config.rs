use std::time::Duration;

/// Engine tunables. `Default` carries the production values; tests shrink them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix used when normalising local phone numbers.
    pub country_code: String,

    /// Waits between attempts for transient protocol failures.
    pub retry_backoff: Vec<Duration>,
    /// Waits between attempts when the platform signals a rate limit.
    pub rate_limit_backoff: Vec<Duration>,
    /// Waits between attempts for each control-channel download stage.
    pub download_backoff: Vec<Duration>,

    /// How long `ensure_connected` waits after a reconnect attempt.
    pub connect_wait: Duration,
    /// How long a campaign waits for each account to come online.
    pub broadcast_ready_wait: Duration,

    pub list_groups_timeout: Duration,
    /// Default bound for a single per-target step.
    pub step_timeout: Duration,
    pub create_timeout: Duration,
    /// Bound for the member-add-mode call right after creating a group.
    pub post_create_timeout: Duration,
    pub verify_delay: Duration,

    pub mark_read_delay: Duration,
    pub mark_read_timeout: Duration,
    pub loop_pause: Duration,
    pub broadcast_watchdog: Duration,
    pub broadcast_progress_interval: Duration,

    /// Minimum spacing between progress edits regardless of step count.
    pub progress_interval: Duration,
    /// Result lines beyond which output goes to a file.
    pub spill_threshold: usize,
    pub max_failures_shown: usize,

    pub max_delay_secs: u64,
    pub description_limit: usize,
    pub photo_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            country_code: "62".to_string(),
            retry_backoff: secs(&[1, 2, 4]),
            rate_limit_backoff: secs(&[30, 60, 120]),
            download_backoff: secs(&[1, 2, 4]),
            connect_wait: Duration::from_secs(10),
            broadcast_ready_wait: Duration::from_secs(5),
            list_groups_timeout: Duration::from_secs(30),
            step_timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(60),
            post_create_timeout: Duration::from_secs(15),
            verify_delay: Duration::from_millis(500),
            mark_read_delay: Duration::from_secs(2),
            mark_read_timeout: Duration::from_secs(10),
            loop_pause: Duration::from_secs(5),
            broadcast_watchdog: Duration::from_secs(24 * 60 * 60),
            broadcast_progress_interval: Duration::from_secs(5),
            progress_interval: Duration::from_secs(10),
            spill_threshold: 50,
            max_failures_shown: 20,
            max_delay_secs: 300,
            description_limit: 1024,
            photo_size: 640,
        }
    }
}

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_secs).collect()
}
