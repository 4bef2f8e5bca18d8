use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use crate::error::{DbError, Result};
use crate::escape::{LIKE_ESCAPE, contains_pattern};
use crate::models::GroupRecord;
use crate::natural::sort_groups;
use crate::schema::CATALOG_SCHEMA;

/// Persistent `{jid -> name}` catalog of one account's groups.
pub struct GroupCatalog {
    pool: Pool<Sqlite>,
}

impl GroupCatalog {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(CATALOG_SCHEMA).execute(&pool).await?;
        tracing::debug!(path = %path.display(), "Group catalog opened");

        Ok(Self { pool })
    }

    /// Single-connection in-memory catalog, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql(CATALOG_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Closes the pool so the store files can be removed.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn save(&self, jid: &str, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DbError::InvalidName(jid.to_string()));
        }

        sqlx::query(
            r#"INSERT INTO groups (jid, name, last_seen_at) VALUES (?, ?, ?)
               ON CONFLICT(jid) DO UPDATE SET
                 name = excluded.name,
                 last_seen_at = excluded.last_seen_at"#,
        )
        .bind(jid)
        .bind(name)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Writes the whole map in one transaction. Entries with an empty name are
    /// skipped; returns the number of rows written.
    pub async fn save_many(&self, groups: &HashMap<String, String>) -> Result<usize> {
        let now = now();
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for (jid, name) in groups {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            sqlx::query(
                r#"INSERT INTO groups (jid, name, last_seen_at) VALUES (?, ?, ?)
                   ON CONFLICT(jid) DO UPDATE SET
                     name = excluded.name,
                     last_seen_at = excluded.last_seen_at"#,
            )
            .bind(jid)
            .bind(name)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            written += 1;
        }

        tx.commit().await?;
        tracing::debug!(written, "Group catalog batch saved");
        Ok(written)
    }

    pub async fn get(&self, jid: &str) -> Result<Option<GroupRecord>> {
        Ok(
            sqlx::query_as::<_, GroupRecord>("SELECT * FROM groups WHERE jid = ?")
                .bind(jid)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Case-insensitive equality on name, ordered by JID.
    pub async fn search_exact(&self, name: &str) -> Result<Vec<GroupRecord>> {
        Ok(sqlx::query_as::<_, GroupRecord>(
            "SELECT * FROM groups WHERE name = ? COLLATE NOCASE ORDER BY jid",
        )
        .bind(name.trim())
        .fetch_all(&self.pool)
        .await?)
    }

    /// Exact search for every name in order; each JID appears once, at the
    /// position of the first name that matched it.
    pub async fn search_exact_multi(&self, names: &[String]) -> Result<Vec<GroupRecord>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for name in names {
            for record in self.search_exact(name).await? {
                if seen.insert(record.jid.clone()) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    /// Case-insensitive substring match with LIKE metacharacters escaped.
    pub async fn search_flexible(&self, keyword: &str) -> Result<Vec<GroupRecord>> {
        let pattern = contains_pattern(keyword.trim());
        let sql = format!(
            "SELECT * FROM groups WHERE name LIKE ? ESCAPE '{}'",
            LIKE_ESCAPE
        );
        let mut rows = sqlx::query_as::<_, GroupRecord>(&sql)
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
        sort_groups(&mut rows);
        Ok(rows)
    }

    /// Every record, naturally ordered by name.
    pub async fn list_all(&self) -> Result<Vec<GroupRecord>> {
        let mut rows = sqlx::query_as::<_, GroupRecord>("SELECT * FROM groups")
            .fetch_all(&self.pool)
            .await?;
        sort_groups(&mut rows);
        Ok(rows)
    }

    /// Snapshot as a map, used when merging with fresh metadata.
    pub async fn snapshot(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT jid, name FROM groups")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM groups")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn remove(&self, jid: &str) -> Result<()> {
        sqlx::query("DELETE FROM groups WHERE jid = ?")
            .bind(jid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
