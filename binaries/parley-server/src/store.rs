use std::path::Path;
use std::time::Duration;

use smol_str::SmolStr;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use thiserror::Error;

use parley_structs::timestamp::Timestamp;

/// The durable half of a replica: the account directory and the
/// append-only message log, in one SQLite file.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// A row with the same key already exists.
    #[error("duplicate key")]
    Duplicate,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// One row of the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub from: SmolStr,
    pub to: SmolStr,
    pub text: String,
    pub sent: Timestamp,
}

impl Store {
    /// Opens the database, creating the file and schema if missing.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users(\
                 name TEXT PRIMARY KEY,\
                 password TEXT NOT NULL\
             )",
        )
        .execute(&self.pool)
        .await?;
        // No foreign keys on "from"/"to": replicated messages may arrive
        // before the users they reference.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages(\
                 \"from\" TEXT,\
                 \"to\" TEXT,\
                 text TEXT NOT NULL,\
                 sent DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),\
                 UNIQUE (\"from\", \"to\", sent)\
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS timestamps ON messages (sent ASC)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fails with [`StoreError::Duplicate`] if the name is taken.
    pub async fn insert_user(&self, name: &str, password: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users(name, password) VALUES(?, ?)")
            .bind(name)
            .bind(password)
            .execute(&self.pool)
            .await
            .map_err(into_store_error)?;
        Ok(())
    }

    /// Removes the user and every message they sent or received.
    pub async fn delete_user(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE \"from\" = ? OR \"to\" = ?")
            .bind(name)
            .bind(name)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM users WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The credential check behind every authenticated call.
    pub async fn exists_user(&self, name: &str, password: &str) -> Result<bool, StoreError> {
        let row =
            sqlx::query_scalar::<_, i64>("SELECT 1 FROM users WHERE name = ? AND password = ? LIMIT 1")
                .bind(name)
                .bind(password)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn has_user(&self, name: &str) -> Result<bool, StoreError> {
        let row = sqlx::query_scalar::<_, i64>("SELECT 1 FROM users WHERE name = ? LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Names matching a shell-style glob (`*`, `?`, `[...]`).
    pub async fn list_users(&self, glob: &str) -> Result<Vec<SmolStr>, StoreError> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM users WHERE name GLOB ?")
            .bind(glob)
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().map(SmolStr::from).collect())
    }

    pub async fn scan_users(&self) -> Result<Vec<(SmolStr, String)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT name, password FROM users")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, password)| (SmolStr::from(name), password))
            .collect())
    }

    /// Appends one message under the caller-assigned key. A second append
    /// with the same `(from, to, sent)` fails with
    /// [`StoreError::Duplicate`].
    pub async fn append_message(
        &self,
        from: &str,
        to: &str,
        text: &str,
        sent: &Timestamp,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO messages(\"from\", \"to\", text, sent) VALUES(?, ?, ?, ?)")
            .bind(from)
            .bind(to)
            .bind(text)
            .bind(sent.as_str())
            .execute(&self.pool)
            .await
            .map_err(into_store_error)?;
        Ok(())
    }

    /// The whole log, oldest first. This is what state transfer walks.
    pub async fn scan_messages(&self) -> Result<Vec<MessageRow>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT \"from\", \"to\", text, sent FROM messages ORDER BY sent ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MessageRow::from).collect())
    }

    /// Every message the user sent or received, oldest first. This is
    /// what login replay walks.
    pub async fn scan_messages_for(&self, name: &str) -> Result<Vec<MessageRow>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT \"from\", \"to\", text, sent FROM messages \
             WHERE \"to\" = ? OR \"from\" = ? ORDER BY sent ASC",
        )
        .bind(name)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MessageRow::from).collect())
    }
}

impl From<(String, String, String, String)> for MessageRow {
    fn from((from, to, text, sent): (String, String, String, String)) -> Self {
        Self {
            from: SmolStr::from(from),
            to: SmolStr::from(to),
            text,
            sent: Timestamp::from(sent),
        }
    }
}

fn into_store_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
        _ => StoreError::Sqlx(err),
    }
}

#[cfg(test)]
mod tests {
    use super::{Store, StoreError};
    use parley_structs::timestamp::Timestamp;

    async fn scratch() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("create scratch dir");
        let store = Store::open(&dir.path().join("chat.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn user_roundtrip() {
        let (_dir, store) = scratch().await;
        store.insert_user("alice", "pw").await.expect("insert");
        assert!(store.exists_user("alice", "pw").await.expect("exists"));
        assert!(!store.exists_user("alice", "wrong").await.expect("exists"));
        assert!(!store.exists_user("bob", "pw").await.expect("exists"));
        assert!(store.has_user("alice").await.expect("has"));

        let taken = store.insert_user("alice", "other").await;
        assert!(matches!(taken, Err(StoreError::Duplicate)));

        store.delete_user("alice").await.expect("delete");
        assert!(!store.exists_user("alice", "pw").await.expect("exists"));
    }

    #[tokio::test]
    async fn glob_listing() {
        let (_dir, store) = scratch().await;
        for name in ["Alice", "Alvin", "Bob"] {
            store.insert_user(name, "pw").await.expect("insert");
        }
        let mut matched = store.list_users("Al*").await.expect("list");
        matched.sort();
        assert_eq!(matched, vec!["Alice", "Alvin"]);
        assert_eq!(store.list_users("*").await.expect("list").len(), 3);
        assert_eq!(store.list_users("?ob").await.expect("list"), vec!["Bob"]);
    }

    #[tokio::test]
    async fn append_is_keyed_by_from_to_sent() {
        let (_dir, store) = scratch().await;
        let sent = Timestamp::from("2026-03-01T12:00:00.000Z");
        store
            .append_message("alice", "bob", "hi", &sent)
            .await
            .expect("append");
        let duplicate = store.append_message("alice", "bob", "again", &sent).await;
        assert!(matches!(duplicate, Err(StoreError::Duplicate)));
        // Same instant, different participants: a different key.
        store
            .append_message("bob", "alice", "hello", &sent)
            .await
            .expect("append");
        assert_eq!(store.scan_messages().await.expect("scan").len(), 2);
    }

    #[tokio::test]
    async fn scans_are_ordered_by_sent() {
        let (_dir, store) = scratch().await;
        let stamps = [
            "2026-03-01T12:00:00.003Z",
            "2026-03-01T12:00:00.001Z",
            "2026-03-01T12:00:00.002Z",
        ];
        for stamp in stamps {
            store
                .append_message("alice", "bob", stamp, &Timestamp::from(stamp))
                .await
                .expect("append");
        }
        let scanned = store.scan_messages().await.expect("scan");
        let sents: Vec<&str> = scanned.iter().map(|row| row.sent.as_str()).collect();
        assert_eq!(
            sents,
            vec![
                "2026-03-01T12:00:00.001Z",
                "2026-03-01T12:00:00.002Z",
                "2026-03-01T12:00:00.003Z",
            ]
        );
    }

    #[tokio::test]
    async fn replay_scan_covers_both_directions() {
        let (_dir, store) = scratch().await;
        let rows = [
            ("alice", "bob", "2026-03-01T12:00:00.001Z"),
            ("bob", "alice", "2026-03-01T12:00:00.002Z"),
            ("bob", "carol", "2026-03-01T12:00:00.003Z"),
        ];
        for (from, to, sent) in rows {
            store
                .append_message(from, to, "x", &Timestamp::from(sent))
                .await
                .expect("append");
        }
        let replay = store.scan_messages_for("alice").await.expect("scan");
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].from, "alice");
        assert_eq!(replay[1].to, "alice");
    }

    #[tokio::test]
    async fn delete_user_cascades_messages() {
        let (_dir, store) = scratch().await;
        store.insert_user("alice", "pw").await.expect("insert");
        store.insert_user("bob", "pw").await.expect("insert");
        store
            .append_message("alice", "bob", "hi", &Timestamp::from("2026-03-01T12:00:00.001Z"))
            .await
            .expect("append");
        store
            .append_message("bob", "alice", "yo", &Timestamp::from("2026-03-01T12:00:00.002Z"))
            .await
            .expect("append");
        store
            .append_message("bob", "carol", "hm", &Timestamp::from("2026-03-01T12:00:00.003Z"))
            .await
            .expect("append");

        store.delete_user("alice").await.expect("delete");
        let remaining = store.scan_messages().await.expect("scan");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].to, "carol");
    }
}
