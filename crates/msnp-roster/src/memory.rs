//! In-memory implementation of the RosterStore trait.
//!
//! This is primarily for testing. Nothing survives the process.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use msnp_core::{GroupId, Handle};

use crate::error::Result;
use crate::model::{Group, SyncTokens};
use crate::traits::{ContactRecord, RosterSnapshot, RosterStore};

/// In-memory roster store.
#[derive(Debug, Default)]
pub struct MemoryRosterStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    contacts: BTreeMap<Handle, ContactRecord>,
    groups: BTreeMap<GroupId, Group>,
    tokens: Option<SyncTokens>,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the store.
    pub fn with_snapshot(snapshot: RosterSnapshot) -> Self {
        Self {
            inner: RwLock::new(Inner {
                contacts: snapshot
                    .contacts
                    .into_iter()
                    .map(|record| (record.handle.clone(), record))
                    .collect(),
                groups: snapshot.groups.into_iter().map(|g| (g.id, g)).collect(),
                tokens: Some(snapshot.tokens),
            }),
        }
    }
}

#[async_trait]
impl RosterStore for MemoryRosterStore {
    async fn load(&self) -> Result<RosterSnapshot> {
        let inner = self.inner.read().await;
        Ok(RosterSnapshot {
            contacts: inner.contacts.values().cloned().collect(),
            groups: inner.groups.values().cloned().collect(),
            tokens: inner.tokens.clone().unwrap_or_else(SyncTokens::initial),
        })
    }

    async fn save(&self, snapshot: &RosterSnapshot) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.contacts = snapshot
            .contacts
            .iter()
            .map(|record| (record.handle.clone(), record.clone()))
            .collect();
        inner.groups = snapshot.groups.iter().map(|g| (g.id, g.clone())).collect();
        inner.tokens = Some(snapshot.tokens.clone());
        Ok(())
    }

    async fn upsert_contact(&self, record: &ContactRecord) -> Result<()> {
        self.inner
            .write()
            .await
            .contacts
            .insert(record.handle.clone(), record.clone());
        Ok(())
    }

    async fn remove_contact(&self, handle: &Handle) -> Result<()> {
        self.inner.write().await.contacts.remove(handle);
        Ok(())
    }

    async fn upsert_group(&self, group: &Group) -> Result<()> {
        self.inner.write().await.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn remove_group(&self, id: GroupId) -> Result<()> {
        self.inner.write().await.groups.remove(&id);
        Ok(())
    }

    async fn sync_tokens(&self) -> Result<SyncTokens> {
        Ok(self
            .inner
            .read()
            .await
            .tokens
            .clone()
            .unwrap_or_else(SyncTokens::initial))
    }

    async fn set_sync_tokens(&self, tokens: &SyncTokens) -> Result<()> {
        self.inner.write().await.tokens = Some(tokens.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msnp_core::ListFlags;

    #[tokio::test]
    async fn test_empty_store_has_initial_tokens() {
        let store = MemoryRosterStore::new();
        assert_eq!(store.sync_tokens().await.unwrap(), SyncTokens::initial());
        assert!(store.load().await.unwrap().contacts.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_remove_contact() {
        let store = MemoryRosterStore::new();
        let record = ContactRecord {
            handle: Handle::new("a@b.com"),
            display_name: "A".into(),
            groups: vec![GroupId(0)],
            lists: ListFlags(1),
        };
        store.upsert_contact(&record).await.unwrap();
        assert_eq!(store.load().await.unwrap().contacts, vec![record.clone()]);

        store.remove_contact(&record.handle).await.unwrap();
        assert!(store.load().await.unwrap().contacts.is_empty());
    }
}
