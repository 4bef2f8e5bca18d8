/// Registry store: one per installation.
pub const REGISTRY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    phone TEXT NOT NULL,
    owner INTEGER NOT NULL,
    wa_store_path TEXT NOT NULL,
    bot_data_path TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE(owner, phone)
);

CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner);
CREATE INDEX IF NOT EXISTS idx_accounts_phone ON accounts(phone);

CREATE TABLE IF NOT EXISTS current_accounts (
    owner INTEGER PRIMARY KEY NOT NULL,
    account_id INTEGER NOT NULL,
    FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
);
"#;

/// Bot data store: one per account, next to the device store.
pub const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS groups (
    jid TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    last_seen_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_groups_name ON groups(name COLLATE NOCASE);
"#;
