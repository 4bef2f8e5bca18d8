use directories::ProjectDirs;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};

use crate::error::{DbError, Result};
use crate::models::Account;
use crate::schema::REGISTRY_SCHEMA;

/// Account registry: which operator owns which phone, and where its stores live.
pub struct MiraDb {
    pool: Pool<Sqlite>,
}

impl MiraDb {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("registry.db");

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&db_url).await?;

        sqlx::raw_sql("PRAGMA foreign_keys = ON;").execute(&pool).await?;
        sqlx::raw_sql(REGISTRY_SCHEMA).execute(&pool).await?;

        tracing::info!("Registry initialized at: {}", db_path.display());

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql("PRAGMA foreign_keys = ON;").execute(&pool).await?;
        sqlx::raw_sql(REGISTRY_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Default data directory when none is configured.
    pub fn default_data_dir() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("id", "mira", "mira").ok_or(DbError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Inserts the account, or returns the existing row for the same
    /// `(owner, phone)`. A phone already linked by a different owner is refused.
    pub async fn add_account(
        &self,
        phone: &str,
        owner: i64,
        wa_store_path: &str,
        bot_data_path: &str,
    ) -> Result<Account> {
        if let Some(existing) = self.account_by_phone(phone).await? {
            if existing.owner != owner {
                return Err(DbError::PhoneOwnedElsewhere {
                    phone: phone.to_string(),
                });
            }
            return Ok(existing);
        }

        let now = chrono::Utc::now().timestamp();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO accounts (phone, owner, wa_store_path, bot_data_path, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(phone)
        .bind(owner)
        .bind(wa_store_path)
        .bind(bot_data_path)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        self.get_account(id).await
    }

    pub async fn get_account(&self, id: i64) -> Result<Account> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::AccountNotFound(id.to_string()))
    }

    pub async fn account_by_phone(&self, phone: &str) -> Result<Option<Account>> {
        Ok(
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE phone = ? ORDER BY id LIMIT 1")
                .bind(phone)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn accounts_by_owner(&self, owner: i64) -> Result<Vec<Account>> {
        Ok(
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE owner = ? ORDER BY id")
                .bind(owner)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(sqlx::query_as::<_, Account>("SELECT * FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn set_current(&self, owner: i64, account_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO current_accounts (owner, account_id) VALUES (?, ?)
             ON CONFLICT(owner) DO UPDATE SET account_id = excluded.account_id",
        )
        .bind(owner)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn current_account_id(&self, owner: i64) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT account_id FROM current_accounts WHERE owner = ?")
                .bind(owner)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn delete_account(&self, account_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM current_accounts WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_is_idempotent_per_owner() {
        let db = MiraDb::new_in_memory().await.unwrap();
        let first = db.add_account("62811", 10, "wa.db", "bot.db").await.unwrap();
        let again = db.add_account("62811", 10, "wa.db", "bot.db").await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(db.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_phone_owned_by_other_operator_is_refused() {
        let db = MiraDb::new_in_memory().await.unwrap();
        db.add_account("62811", 10, "wa.db", "bot.db").await.unwrap();
        let err = db.add_account("62811", 20, "wa2.db", "bot2.db").await.unwrap_err();
        assert!(matches!(err, DbError::PhoneOwnedElsewhere { .. }));
    }

    #[tokio::test]
    async fn test_current_pointer_follows_deletes() {
        let db = MiraDb::new_in_memory().await.unwrap();
        let a = db.add_account("62811", 10, "wa.db", "bot.db").await.unwrap();
        let b = db.add_account("62822", 10, "wa2.db", "bot2.db").await.unwrap();
        db.set_current(10, a.id).await.unwrap();
        db.set_current(10, b.id).await.unwrap();
        assert_eq!(db.current_account_id(10).await.unwrap(), Some(b.id));

        db.delete_account(b.id).await.unwrap();
        assert_eq!(db.current_account_id(10).await.unwrap(), None);
        assert_eq!(db.accounts_by_owner(10).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_missing_account() {
        let db = MiraDb::new_in_memory().await.unwrap();
        assert!(matches!(
            db.get_account(99).await,
            Err(DbError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_backed_registry() {
        let dir = tempfile::tempdir().unwrap();
        let db = MiraDb::new(dir.path()).await.unwrap();
        db.add_account("62833", 1, "wa.db", "bot.db").await.unwrap();
        assert!(dir.path().join("registry.db").exists());
    }
}
