use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Companion files SQLite may leave next to a database.
const SIDE_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

/// On-disk stores of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub wa_store: PathBuf,
    pub bot_data: PathBuf,
}

impl StorePaths {
    /// `<data>/sessions/wa_<owner>_<phone>.db` and `bot_<owner>_<phone>.db`.
    pub fn for_account(data_dir: &Path, owner: i64, phone: &str) -> Self {
        let dir = data_dir.join("sessions");
        Self {
            wa_store: dir.join(format!("wa_{owner}_{phone}.db")),
            bot_data: dir.join(format!("bot_{owner}_{phone}.db")),
        }
    }
}

/// Removes a database file and its companions. Missing files are fine.
pub async fn remove_store_files(path: &Path) -> std::io::Result<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in SIDE_SUFFIXES {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        candidates.push(PathBuf::from(name));
    }

    for candidate in candidates {
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => debug!(path = %candidate.display(), "Removed store file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_encodes_owner_and_phone() {
        let paths = StorePaths::for_account(Path::new("/data"), 42, "628111");
        assert_eq!(paths.wa_store, PathBuf::from("/data/sessions/wa_42_628111.db"));
        assert_eq!(paths.bot_data, PathBuf::from("/data/sessions/bot_42_628111.db"));
    }

    #[tokio::test]
    async fn test_remove_deletes_companions() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("bot_1_62.db");
        for name in ["bot_1_62.db", "bot_1_62.db-wal", "bot_1_62.db-shm", "other.db"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        remove_store_files(&main).await.unwrap();

        assert!(!main.exists());
        assert!(!dir.path().join("bot_1_62.db-wal").exists());
        assert!(!dir.path().join("bot_1_62.db-shm").exists());
        assert!(dir.path().join("other.db").exists());
        // Second call on missing files is a no-op.
        remove_store_files(&main).await.unwrap();
    }
}
