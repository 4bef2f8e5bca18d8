use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mira_core::{ClientFactory, WaClient};
use mira_db::{Account, DbError, GroupCatalog, MiraDb};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{Result, WorkerError};
use crate::paths::{StorePaths, remove_store_files};

/// Single owner of live client handles and per-account catalogs.
///
/// Locks guard map lookups only; connecting, logging out and opening
/// stores happen after the guard is released.
pub struct SessionRegistry {
    db: Arc<MiraDb>,
    factory: Arc<dyn ClientFactory>,
    data_dir: PathBuf,
    sessions: RwLock<HashMap<i64, Arc<dyn WaClient>>>,
    catalogs: Mutex<HashMap<i64, Arc<GroupCatalog>>>,
}

impl SessionRegistry {
    pub fn new(db: Arc<MiraDb>, factory: Arc<dyn ClientFactory>, data_dir: PathBuf) -> Self {
        Self {
            db,
            factory,
            data_dir,
            sessions: RwLock::new(HashMap::new()),
            catalogs: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Registers `phone` for `owner` and makes it the owner's current account.
    pub async fn add(&self, phone: &str, owner: i64) -> Result<Account> {
        let paths = StorePaths::for_account(&self.data_dir, owner, phone);
        if let Some(dir) = paths.wa_store.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let account = match self
            .db
            .add_account(
                phone,
                owner,
                &paths.wa_store.to_string_lossy(),
                &paths.bot_data.to_string_lossy(),
            )
            .await
        {
            Ok(account) => account,
            Err(err @ DbError::PhoneOwnedElsewhere { .. }) => {
                warn!(target: "audit", operator = owner, phone, "Refused phone linked by another operator");
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        self.db.set_current(owner, account.id).await?;
        info!(account_id = account.id, operator = owner, "Account registered");
        Ok(account)
    }

    pub async fn account(&self, account_id: i64) -> Result<Account> {
        self.db.get_account(account_id).await.map_err(|e| match e {
            DbError::AccountNotFound(_) => WorkerError::AccountNotFound(account_id),
            other => other.into(),
        })
    }

    /// The account, provided `operator` owns it.
    pub async fn owned_account(&self, operator: i64, account_id: i64) -> Result<Account> {
        let account = self.account(account_id).await?;
        if account.owner != operator {
            warn!(target: "audit", operator, account_id, "Rejected access to foreign account");
            return Err(WorkerError::NotOwner {
                operator,
                account_id,
            });
        }
        Ok(account)
    }

    pub async fn accounts_of(&self, operator: i64) -> Result<Vec<Account>> {
        Ok(self.db.accounts_by_owner(operator).await?)
    }

    pub async fn all_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.db.list_accounts().await?)
    }

    /// The operator's current account, falling back to their oldest one.
    pub async fn current_account(&self, operator: i64) -> Result<Option<Account>> {
        if let Some(id) = self.db.current_account_id(operator).await? {
            match self.account(id).await {
                Ok(account) if account.owner == operator => return Ok(Some(account)),
                Ok(_) | Err(WorkerError::AccountNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(self.accounts_of(operator).await?.into_iter().next())
    }

    pub async fn set_current(&self, operator: i64, account_id: i64) -> Result<()> {
        self.owned_account(operator, account_id).await?;
        self.db.set_current(operator, account_id).await?;
        Ok(())
    }

    /// Builds a fresh client for the account, replacing any previous one.
    pub async fn create_client(&self, account_id: i64) -> Result<Arc<dyn WaClient>> {
        let account = self.account(account_id).await?;
        let client = self
            .factory
            .create(account_id, Path::new(&account.wa_store_path))
            .await?;

        let previous = self
            .sessions
            .write()
            .await
            .insert(account_id, client.clone());
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &client) {
                if let Err(e) = previous.disconnect().await {
                    warn!(account_id, error = %e, "Failed to disconnect replaced client");
                }
            }
        }
        Ok(client)
    }

    pub async fn get_client(&self, account_id: i64) -> Option<Arc<dyn WaClient>> {
        self.sessions.read().await.get(&account_id).cloned()
    }

    /// Existing client, or a newly created one.
    pub async fn client(&self, account_id: i64) -> Result<Arc<dyn WaClient>> {
        match self.get_client(account_id).await {
            Some(client) => Ok(client),
            None => self.create_client(account_id).await,
        }
    }

    /// Live client of the operator's current account, if one exists.
    pub async fn current_client(&self, operator: i64) -> Result<Option<Arc<dyn WaClient>>> {
        match self.current_account(operator).await? {
            Some(account) => Ok(self.get_client(account.id).await),
            None => Ok(None),
        }
    }

    pub async fn catalog(&self, account_id: i64) -> Result<Arc<GroupCatalog>> {
        if let Some(catalog) = self.catalogs.lock().await.get(&account_id) {
            return Ok(catalog.clone());
        }

        let account = self.account(account_id).await?;
        let opened = Arc::new(GroupCatalog::open(Path::new(&account.bot_data_path)).await?);

        let mut catalogs = self.catalogs.lock().await;
        let catalog = catalogs.entry(account_id).or_insert(opened).clone();
        Ok(catalog)
    }

    /// Logs the account out, drops its session and deletes its stores.
    pub async fn remove(&self, operator: i64, account_id: i64) -> Result<()> {
        let account = self.owned_account(operator, account_id).await?;

        let client = self.sessions.write().await.remove(&account_id);
        if let Some(client) = client {
            if let Err(e) = client.logout().await {
                warn!(account_id, error = %e, "Logout failed, removing stores anyway");
            }
            if let Err(e) = client.disconnect().await {
                warn!(account_id, error = %e, "Disconnect failed");
            }
        }

        let catalog = self.catalogs.lock().await.remove(&account_id);
        if let Some(catalog) = catalog {
            catalog.close().await;
        }

        remove_store_files(Path::new(&account.wa_store_path)).await?;
        remove_store_files(Path::new(&account.bot_data_path)).await?;
        self.db.delete_account(account_id).await?;

        info!(account_id, operator, "Account removed");
        Ok(())
    }

    /// Creates and connects a client for every stored account.
    pub async fn restore_sessions(&self) -> Result<usize> {
        let mut restored = 0;
        for account in self.all_accounts().await? {
            match self.client(account.id).await {
                Ok(client) => {
                    if let Err(e) = client.connect().await {
                        warn!(account_id = account.id, error = %e, "Failed to reconnect stored session");
                    } else {
                        restored += 1;
                    }
                }
                Err(e) => warn!(account_id = account.id, error = %e, "Failed to restore session"),
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFactory;

    async fn registry() -> (SessionRegistry, Arc<MockFactory>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MiraDb::new(dir.path()).await.unwrap());
        let factory = Arc::new(MockFactory::default());
        let registry = SessionRegistry::new(db, factory.clone(), dir.path().to_path_buf());
        (registry, factory, dir)
    }

    #[tokio::test]
    async fn test_add_sets_current() {
        let (registry, _, _dir) = registry().await;
        let first = registry.add("628111", 1).await.unwrap();
        let second = registry.add("628222", 1).await.unwrap();

        let current = registry.current_account(1).await.unwrap().unwrap();
        assert_eq!(current.id, second.id);

        registry.set_current(1, first.id).await.unwrap();
        let current = registry.current_account(1).await.unwrap().unwrap();
        assert_eq!(current.id, first.id);
    }

    #[tokio::test]
    async fn test_foreign_access_is_rejected() {
        let (registry, _, _dir) = registry().await;
        let account = registry.add("628111", 1).await.unwrap();

        let err = registry.set_current(2, account.id).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotOwner { .. }));

        let err = registry.add("628111", 2).await.unwrap_err();
        assert!(matches!(err, WorkerError::Db(DbError::PhoneOwnedElsewhere { .. })));

        let err = registry.remove(2, account.id).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn test_create_client_replaces_previous() {
        let (registry, factory, _dir) = registry().await;
        let account = registry.add("628111", 1).await.unwrap();

        let first = registry.create_client(account.id).await.unwrap();
        let second = registry.create_client(account.id).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        let current = registry.current_client(1).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(factory.created(account.id).len(), 2);
        assert_eq!(factory.created(account.id)[0].count("disconnect"), 1);
    }

    #[tokio::test]
    async fn test_remove_logs_out_and_deletes_stores() {
        let (registry, factory, _dir) = registry().await;
        let account = registry.add("628111", 1).await.unwrap();
        registry.create_client(account.id).await.unwrap();

        let catalog = registry.catalog(account.id).await.unwrap();
        catalog.save("1@g.us", "Alpha").await.unwrap();
        drop(catalog);
        tokio::fs::write(&account.wa_store_path, b"device").await.unwrap();

        registry.remove(1, account.id).await.unwrap();

        let mock = factory.created(account.id)[0].clone();
        assert_eq!(mock.count("logout"), 1);
        assert!(!Path::new(&account.wa_store_path).exists());
        assert!(!Path::new(&account.bot_data_path).exists());
        assert!(registry.get_client(account.id).await.is_none());
        assert!(registry.current_account(1).await.unwrap().is_none());
    }
}
