use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub phone: String,
    pub owner: i64,
    pub wa_store_path: String,
    pub bot_data_path: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupRecord {
    pub jid: String,
    pub name: String,
    pub last_seen_at: i64,
}

impl GroupRecord {
    pub fn new(jid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            name: name.into(),
            last_seen_at: 0,
        }
    }
}
