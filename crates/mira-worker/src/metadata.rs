use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mira_core::{WaClient, is_group_jid, user_part};
use mira_db::{GroupCatalog, GroupRecord, sort_groups};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;

/// `Group <user-part>`, used when the protocol gives no name.
pub fn synthesized_name(jid: &str) -> String {
    format!("Group {}", user_part(jid))
}

fn is_synthesized(jid: &str, name: &str) -> bool {
    name == synthesized_name(jid)
}

/// Names that carry no information: the jid itself or its user part.
pub fn is_placeholder(jid: &str, name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name == jid || name == user_part(jid)
}

/// Operator-facing listing: placeholders dropped, natural order.
pub fn visible_groups(records: Vec<GroupRecord>) -> Vec<GroupRecord> {
    let mut visible: Vec<GroupRecord> = records
        .into_iter()
        .filter(|g| !is_placeholder(&g.jid, &g.name))
        .collect();
    sort_groups(&mut visible);
    visible
}

/// Collects `{jid → name}` for every joined group.
///
/// Uses the live listing when connected. Otherwise, or when the listing
/// fails, rebuilds from the library's local stores merged with the catalog.
pub async fn fetch_groups(
    client: &dyn WaClient,
    catalog: &GroupCatalog,
    list_timeout: Duration,
) -> Result<HashMap<String, String>> {
    if client.is_connected() {
        match tokio::time::timeout(list_timeout, client.list_joined_groups()).await {
            Ok(Ok(groups)) => {
                let named = groups
                    .into_iter()
                    .map(|g| (g.jid.to_string(), g.name))
                    .filter(|(jid, _)| is_group_jid(jid))
                    .map(|(jid, name)| {
                        let name = if name.trim().is_empty() {
                            synthesized_name(&jid)
                        } else {
                            name
                        };
                        (jid, name)
                    })
                    .collect();
                return Ok(named);
            }
            Ok(Err(e)) => warn!(error = %e, "Joined-group listing failed, using local stores"),
            Err(_) => warn!("Joined-group listing timed out, using local stores"),
        }
    }

    let (jids, names) = tokio::join!(client.local_group_jids(), client.local_contact_names());
    let jids = jids?;
    let names = names.unwrap_or_else(|e| {
        debug!(error = %e, "Local contact names unavailable");
        HashMap::new()
    });
    let prior = catalog.snapshot().await?;

    Ok(merge_local(
        jids.iter().map(|j| j.to_string()).filter(|j| is_group_jid(j)),
        &names,
        &prior,
    ))
}

/// Catalog wins when it has a real name; then the contacts store; then the
/// catalog's synthesized name; finally a fresh one.
fn merge_local(
    jids: impl Iterator<Item = String>,
    names: &HashMap<String, String>,
    prior: &HashMap<String, String>,
) -> HashMap<String, String> {
    jids.map(|jid| {
        let from_catalog = prior
            .get(&jid)
            .filter(|n| !is_placeholder(&jid, n) && !is_synthesized(&jid, n));
        let from_contacts = names.get(&jid).filter(|n| !is_placeholder(&jid, n));
        let name = from_catalog
            .or(from_contacts)
            .or_else(|| prior.get(&jid).filter(|n| !is_placeholder(&jid, n)))
            .cloned()
            .unwrap_or_else(|| synthesized_name(&jid));
        (jid, name)
    })
    .collect()
}

/// Fetches and persists the group list. Returns the number written.
#[instrument(skip_all, fields(account_id = client.account_id()))]
pub async fn refresh(
    client: &dyn WaClient,
    catalog: &GroupCatalog,
    list_timeout: Duration,
) -> Result<usize> {
    let groups = fetch_groups(client, catalog, list_timeout).await?;
    let saved = catalog.save_many(&groups).await?;
    info!(count = saved, "Group catalog refreshed");
    Ok(saved)
}

/// Accounts with a refresh in flight. The periodic refresh skips them.
#[derive(Debug, Clone, Default)]
pub struct RefreshGuard {
    active: Arc<Mutex<HashSet<i64>>>,
}

/// Released on drop.
pub struct RefreshTicket {
    active: Arc<Mutex<HashSet<i64>>>,
    account_id: i64,
}

impl RefreshGuard {
    fn lock(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_begin(&self, account_id: i64) -> Option<RefreshTicket> {
        self.lock().insert(account_id).then(|| RefreshTicket {
            active: self.active.clone(),
            account_id,
        })
    }
}

impl Drop for RefreshTicket {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.account_id);
    }
}
