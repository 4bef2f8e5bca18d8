use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mira_db::MiraDb;
use mira_worker::EngineConfig;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("MIRA_ADMIN_IDS has no valid operator id")]
    NoAdmins,

    #[error("No data directory available: {0}")]
    DataDir(#[from] mira_db::DbError),
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub token: String,
    pub admins: Vec<i64>,
    pub data_dir: PathBuf,
    pub sidecar_dir: PathBuf,
    pub refresh_every: Duration,
    pub broadcast_watchdog: Duration,
    pub country_code: String,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let token = get("MIRA_BOT_TOKEN")
            .or_else(|| get("TELEGRAM_BOT_TOKEN"))
            .ok_or(ConfigError::Missing("MIRA_BOT_TOKEN"))?;

        let raw_admins = get("MIRA_ADMIN_IDS").ok_or(ConfigError::Missing("MIRA_ADMIN_IDS"))?;
        let admins: Vec<i64> = raw_admins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match s.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(value = s, "Ignoring unparsable admin id");
                    None
                }
            })
            .collect();
        if admins.is_empty() {
            return Err(ConfigError::NoAdmins);
        }

        let data_dir = match get("MIRA_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => MiraDb::default_data_dir()?,
        };
        let sidecar_dir = get("MIRA_SIDECAR_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("sidecar"));

        let refresh_minutes: u64 = parse_or("MIRA_REFRESH_MINUTES", get("MIRA_REFRESH_MINUTES"), 30);
        let watchdog_hours: u64 = parse_or(
            "MIRA_BROADCAST_WATCHDOG_HOURS",
            get("MIRA_BROADCAST_WATCHDOG_HOURS"),
            24,
        );

        let country_code = match get("MIRA_COUNTRY_CODE") {
            Some(code) if code.chars().all(|c| c.is_ascii_digit()) => code,
            Some(code) => {
                warn!(value = %code, "MIRA_COUNTRY_CODE must be digits, using 62");
                "62".to_string()
            }
            None => "62".to_string(),
        };

        Ok(Self {
            token,
            admins,
            data_dir,
            sidecar_dir,
            refresh_every: Duration::from_secs(refresh_minutes.max(1) * 60),
            broadcast_watchdog: Duration::from_secs(watchdog_hours.max(1) * 60 * 60),
            country_code,
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            country_code: self.country_code.clone(),
            broadcast_watchdog: self.broadcast_watchdog,
            ..EngineConfig::default()
        }
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Unparsable value, using default");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<BotConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BotConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("MIRA_ADMIN_IDS", "11, 22,x"),
            ("MIRA_DATA_DIR", "/tmp/mira"),
        ])
        .unwrap();
        assert_eq!(config.token, "123:abc");
        assert_eq!(config.admins, vec![11, 22]);
        assert_eq!(config.sidecar_dir, PathBuf::from("sidecar"));
        assert_eq!(config.refresh_every, Duration::from_secs(30 * 60));
        assert_eq!(config.broadcast_watchdog, Duration::from_secs(24 * 3600));
        assert_eq!(config.engine_config().country_code, "62");
        assert!(config.is_admin(22));
        assert!(!config.is_admin(33));
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = load(&[
            ("MIRA_BOT_TOKEN", "t"),
            ("MIRA_ADMIN_IDS", "1"),
            ("MIRA_DATA_DIR", "/tmp/mira"),
            ("MIRA_REFRESH_MINUTES", "soon"),
            ("MIRA_BROADCAST_WATCHDOG_HOURS", "2"),
            ("MIRA_COUNTRY_CODE", "+1"),
        ])
        .unwrap();
        assert_eq!(config.refresh_every, Duration::from_secs(30 * 60));
        assert_eq!(config.engine_config().broadcast_watchdog, Duration::from_secs(7200));
        assert_eq!(config.country_code, "62");
    }

    #[test]
    fn test_required_values() {
        assert!(matches!(
            load(&[("MIRA_ADMIN_IDS", "1")]),
            Err(ConfigError::Missing("MIRA_BOT_TOKEN"))
        ));
        assert!(matches!(
            load(&[("MIRA_BOT_TOKEN", "t"), ("MIRA_ADMIN_IDS", "abc")]),
            Err(ConfigError::NoAdmins)
        ));
    }
}
