//! Durable relay state: the SQLite tables are the source of truth, the
//! in-memory registry only tracks live subscribers.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::Message;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    app_id     TEXT NOT NULL,
    channel_id INTEGER NOT NULL,
    side       TEXT NOT NULL,
    phase      TEXT NOT NULL,
    body       TEXT NOT NULL,
    \"when\"     REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_by_channel
    ON messages (app_id, channel_id);
CREATE TABLE IF NOT EXISTS allocations (
    app_id     TEXT NOT NULL,
    channel_id INTEGER NOT NULL,
    side       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS allocations_unique
    ON allocations (app_id, channel_id, side);
";

pub(crate) struct Store {
    db: Connection,
}

impl Store {
    /// Open (or create) the database; `None` keeps everything in memory.
    pub fn open(path: Option<&Path>) -> rusqlite::Result<Store> {
        let db = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        db.execute_batch(SCHEMA)?;
        Ok(Store { db })
    }

    pub fn insert_message(
        &mut self,
        app_id: &str,
        channel_id: u32,
        side: &str,
        phase: &str,
        body: &str,
        when: f64,
    ) -> rusqlite::Result<()> {
        self.db.execute(
            "INSERT INTO messages (app_id, channel_id, side, phase, body, \"when\")
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![app_id, channel_id, side, phase, body, when],
        )?;
        Ok(())
    }

    /// Claim the channel for `side`. Set semantics: re-asserting an existing
    /// claim is a no-op.
    pub fn insert_allocation(
        &mut self,
        app_id: &str,
        channel_id: u32,
        side: &str,
    ) -> rusqlite::Result<()> {
        self.db.execute(
            "INSERT OR IGNORE INTO allocations (app_id, channel_id, side) VALUES (?1, ?2, ?3)",
            params![app_id, channel_id, side],
        )?;
        Ok(())
    }

    /// Full channel history, oldest first. Rowid breaks timestamp ties so
    /// replay order is stable.
    pub fn messages(&self, app_id: &str, channel_id: u32) -> rusqlite::Result<Vec<Message>> {
        let mut statement = self.db.prepare(
            "SELECT phase, body FROM messages
             WHERE app_id = ?1 AND channel_id = ?2
             ORDER BY \"when\" ASC, rowid ASC",
        )?;
        let rows = statement.query_map(params![app_id, channel_id], |row| {
            Ok(Message {
                phase: row.get(0)?,
                body: row.get(1)?,
            })
        })?;
        rows.collect()
    }

    pub fn allocated_channels(&self, app_id: &str) -> rusqlite::Result<Vec<u32>> {
        let mut statement = self.db.prepare(
            "SELECT DISTINCT channel_id FROM allocations
             WHERE app_id = ?1 ORDER BY channel_id ASC",
        )?;
        let rows = statement.query_map(params![app_id], |row| row.get(0))?;
        rows.collect()
    }

    pub fn app_ids(&self) -> rusqlite::Result<Vec<String>> {
        let mut statement = self
            .db
            .prepare("SELECT DISTINCT app_id FROM allocations")?;
        let rows = statement.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    /// Drop `side`'s claim and report how many claims remain on the channel.
    pub fn remove_allocation(
        &mut self,
        app_id: &str,
        channel_id: u32,
        side: &str,
    ) -> rusqlite::Result<i64> {
        self.db.execute(
            "DELETE FROM allocations WHERE app_id = ?1 AND channel_id = ?2 AND side = ?3",
            params![app_id, channel_id, side],
        )?;
        self.db.query_row(
            "SELECT COUNT(*) FROM allocations WHERE app_id = ?1 AND channel_id = ?2",
            params![app_id, channel_id],
            |row| row.get(0),
        )
    }

    /// Delete all claims and messages of the channel in one transaction.
    pub fn delete_channel(&mut self, app_id: &str, channel_id: u32) -> rusqlite::Result<()> {
        let tx = self.db.transaction()?;
        tx.execute(
            "DELETE FROM allocations WHERE app_id = ?1 AND channel_id = ?2",
            params![app_id, channel_id],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE app_id = ?1 AND channel_id = ?2",
            params![app_id, channel_id],
        )?;
        tx.commit()
    }

    /// Timestamp of the channel's newest message, if it has any.
    pub fn newest_message(
        &self,
        app_id: &str,
        channel_id: u32,
    ) -> rusqlite::Result<Option<f64>> {
        self.db
            .query_row(
                "SELECT \"when\" FROM messages
                 WHERE app_id = ?1 AND channel_id = ?2
                 ORDER BY \"when\" DESC LIMIT 1",
                params![app_id, channel_id],
                |row| row.get(0),
            )
            .optional()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> Store {
        Store::open(None).unwrap()
    }

    #[test]
    fn test_message_order_is_stable_for_equal_timestamps() {
        let mut store = store();
        store.insert_message("app", 1, "s1", "pake", "aa", 5.0).unwrap();
        store.insert_message("app", 1, "s2", "pake", "bb", 5.0).unwrap();
        store.insert_message("app", 1, "s1", "data", "cc", 4.0).unwrap();
        let bodies: Vec<String> = store
            .messages("app", 1)
            .unwrap()
            .into_iter()
            .map(|message| message.body)
            .collect();
        assert_eq!(bodies, vec!["cc", "aa", "bb"]);
    }

    #[test]
    fn test_allocations_have_set_semantics() {
        let mut store = store();
        store.insert_allocation("app", 3, "s1").unwrap();
        store.insert_allocation("app", 3, "s1").unwrap();
        store.insert_allocation("app", 3, "s2").unwrap();
        assert_eq!(store.allocated_channels("app").unwrap(), vec![3]);

        assert_eq!(store.remove_allocation("app", 3, "s1").unwrap(), 1);
        assert_eq!(store.remove_allocation("app", 3, "s2").unwrap(), 0);
    }

    #[test]
    fn test_channels_are_scoped_by_app() {
        let mut store = store();
        store.insert_allocation("app1", 3, "s1").unwrap();
        store.insert_allocation("app2", 4, "s1").unwrap();
        assert_eq!(store.allocated_channels("app1").unwrap(), vec![3]);
        assert_eq!(store.allocated_channels("app2").unwrap(), vec![4]);
        let mut apps = store.app_ids().unwrap();
        apps.sort();
        assert_eq!(apps, vec!["app1", "app2"]);
    }

    #[test]
    fn test_delete_channel_removes_messages_and_allocations() {
        let mut store = store();
        store.insert_allocation("app", 3, "s1").unwrap();
        store.insert_message("app", 3, "s1", "pake", "aa", 1.0).unwrap();
        store.delete_channel("app", 3).unwrap();
        assert!(store.allocated_channels("app").unwrap().is_empty());
        assert!(store.messages("app", 3).unwrap().is_empty());
    }

    #[test]
    fn test_newest_message() {
        let mut store = store();
        assert_eq!(store.newest_message("app", 3).unwrap(), None);
        store.insert_message("app", 3, "s1", "pake", "aa", 1.0).unwrap();
        store.insert_message("app", 3, "s1", "data", "bb", 9.0).unwrap();
        assert_eq!(store.newest_message("app", 3).unwrap(), Some(9.0));
    }
}
