//! SQLite implementation of the RosterStore trait.
//!
//! Uses rusqlite with bundled SQLite, wrapped in async via
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use msnp_core::{GroupId, Handle, ListFlags};

use crate::error::{Result, RosterError};
use crate::migration;
use crate::model::{Group, SyncTokens};
use crate::traits::{ContactRecord, RosterSnapshot, RosterStore};

/// SQLite-backed roster store.
///
/// Thread-safe via internal Mutex.
#[derive(Clone)]
pub struct SqliteRosterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRosterStore {
    /// Open (and migrate) a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                RosterError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| RosterError::Task(e.to_string()))?
    }
}

fn encode_groups(groups: &[GroupId]) -> Result<Vec<u8>> {
    let ids: Vec<u32> = groups.iter().map(|g| g.0).collect();
    let mut buf = Vec::new();
    ciborium::into_writer(&ids, &mut buf).map_err(|e| RosterError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_groups(bytes: &[u8]) -> Result<Vec<GroupId>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<u32> =
        ciborium::from_reader(bytes).map_err(|e| RosterError::Serialization(e.to_string()))?;
    Ok(ids.into_iter().map(GroupId).collect())
}

fn insert_contact(conn: &Connection, record: &ContactRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO contacts (handle, display_name, lists, groups) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(handle) DO UPDATE SET
            display_name = excluded.display_name,
            lists = excluded.lists,
            groups = excluded.groups",
        params![
            record.handle.as_str(),
            record.display_name,
            record.lists.bits(),
            encode_groups(&record.groups)?
        ],
    )?;
    Ok(())
}

fn insert_group(conn: &Connection, group: &Group) -> Result<()> {
    conn.execute(
        "INSERT INTO groups (group_id, name) VALUES (?1, ?2)
         ON CONFLICT(group_id) DO UPDATE SET name = excluded.name",
        params![group.id.0, group.name],
    )?;
    Ok(())
}

fn write_tokens(conn: &Connection, tokens: &SyncTokens) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_tokens (id, last_change, last_sync) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
            last_change = excluded.last_change,
            last_sync = excluded.last_sync",
        params![tokens.last_change, tokens.last_sync],
    )?;
    Ok(())
}

fn read_tokens(conn: &Connection) -> Result<SyncTokens> {
    let tokens = conn
        .query_row(
            "SELECT last_change, last_sync FROM sync_tokens WHERE id = 1",
            [],
            |row| Ok(SyncTokens::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(tokens.unwrap_or_else(SyncTokens::initial))
}

#[async_trait]
impl RosterStore for SqliteRosterStore {
    async fn load(&self) -> Result<RosterSnapshot> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT handle, display_name, lists, groups FROM contacts ORDER BY handle")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u8>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?;

            let mut contacts = Vec::new();
            for row in rows {
                let (handle, display_name, lists, groups) = row?;
                contacts.push(ContactRecord {
                    handle: Handle::new(handle),
                    display_name,
                    groups: decode_groups(&groups)?,
                    lists: ListFlags::from_bits(lists),
                });
            }

            let mut stmt = conn.prepare("SELECT group_id, name FROM groups ORDER BY group_id")?;
            let groups = stmt
                .query_map([], |row| {
                    Ok(Group::new(GroupId(row.get(0)?), row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(RosterSnapshot {
                contacts,
                groups,
                tokens: read_tokens(conn)?,
            })
        })
        .await
    }

    async fn save(&self, snapshot: &RosterSnapshot) -> Result<()> {
        let snapshot = snapshot.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM contacts", [])?;
            tx.execute("DELETE FROM groups", [])?;
            for record in &snapshot.contacts {
                insert_contact(&tx, record)?;
            }
            for group in &snapshot.groups {
                insert_group(&tx, group)?;
            }
            write_tokens(&tx, &snapshot.tokens)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn upsert_contact(&self, record: &ContactRecord) -> Result<()> {
        let record = record.clone();
        self.blocking(move |conn| insert_contact(conn, &record)).await
    }

    async fn remove_contact(&self, handle: &Handle) -> Result<()> {
        let handle = handle.clone();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM contacts WHERE handle = ?1", params![handle.as_str()])?;
            Ok(())
        })
        .await
    }

    async fn upsert_group(&self, group: &Group) -> Result<()> {
        let group = group.clone();
        self.blocking(move |conn| insert_group(conn, &group)).await
    }

    async fn remove_group(&self, id: GroupId) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute("DELETE FROM groups WHERE group_id = ?1", params![id.0])?;
            Ok(())
        })
        .await
    }

    async fn sync_tokens(&self) -> Result<SyncTokens> {
        self.blocking(|conn| read_tokens(conn)).await
    }

    async fn set_sync_tokens(&self, tokens: &SyncTokens) -> Result<()> {
        let tokens = tokens.clone();
        self.blocking(move |conn| write_tokens(conn, &tokens)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(handle: &str, groups: &[u32]) -> ContactRecord {
        ContactRecord {
            handle: Handle::new(handle),
            display_name: handle.split('@').next().unwrap_or_default().to_string(),
            groups: groups.iter().copied().map(GroupId).collect(),
            lists: ListFlags(3),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = SqliteRosterStore::open_memory().unwrap();
        let snapshot = RosterSnapshot {
            contacts: vec![record("alice@example.com", &[0, 2]), record("bob@example.com", &[])],
            groups: vec![Group::new(GroupId(0), "~"), Group::new(GroupId(2), "Work")],
            tokens: SyncTokens::new("2003-01-01T00:00:00.000-08:00", "17"),
        };
        store.save(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_tokens_default_to_initial() {
        let store = SqliteRosterStore::open_memory().unwrap();
        assert_eq!(store.sync_tokens().await.unwrap(), SyncTokens::initial());

        let tokens = SyncTokens::new("a", "b");
        store.set_sync_tokens(&tokens).await.unwrap();
        assert_eq!(store.sync_tokens().await.unwrap(), tokens);
    }

    #[tokio::test]
    async fn test_incremental_updates() {
        let store = SqliteRosterStore::open_memory().unwrap();
        store.upsert_contact(&record("carol@example.com", &[1])).await.unwrap();
        store.upsert_contact(&record("carol@example.com", &[1, 4])).await.unwrap();
        store.upsert_group(&Group::new(GroupId(4), "Gym")).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.contacts.len(), 1);
        assert_eq!(loaded.contacts[0].groups, vec![GroupId(1), GroupId(4)]);

        store.remove_contact(&Handle::new("carol@example.com")).await.unwrap();
        store.remove_group(GroupId(4)).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert!(loaded.contacts.is_empty());
        assert!(loaded.groups.is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.db");
        {
            let store = SqliteRosterStore::open(&path).unwrap();
            store.upsert_contact(&record("dave@example.com", &[0])).await.unwrap();
        }
        let store = SqliteRosterStore::open(&path).unwrap();
        assert_eq!(store.load().await.unwrap().contacts.len(), 1);
    }
}
