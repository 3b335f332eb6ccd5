use std::path::Path;
use std::sync::Mutex;

use corazon_protocol::{UiMessage, Usage};
use rusqlite::{params, Connection, OptionalExtension};

use super::types::{ThreadConfig, ThreadCursor, ThreadSummary};
use super::{normalize_item_parts, ThreadStore};
use crate::now_millis;

/// SQLite-backed thread store.
///
/// Uses a `Mutex<Connection>` for thread-safe interior mutability.
/// The database is created/migrated on `open()`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a sqlite database at the given path.
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| format!("sqlite dir: {e}"))?;
        }
        let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| format!("sqlite wal: {e}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS threads (
                id                        TEXT PRIMARY KEY,
                title                     TEXT,
                model                     TEXT,
                working_directory         TEXT,
                created_at                INTEGER NOT NULL,
                updated_at                INTEGER NOT NULL,
                total_input_tokens        INTEGER NOT NULL DEFAULT 0,
                total_cached_input_tokens INTEGER NOT NULL DEFAULT 0,
                total_output_tokens       INTEGER NOT NULL DEFAULT 0,
                turn_count                INTEGER NOT NULL DEFAULT 0,
                last_usage_json           TEXT,
                active_run_id             TEXT
            );

            CREATE TABLE IF NOT EXISTS messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id    TEXT NOT NULL,
                seq          INTEGER NOT NULL,
                message_json TEXT NOT NULL,
                created_at   INTEGER NOT NULL,
                FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE,
                UNIQUE (thread_id, seq)
            );

            CREATE INDEX IF NOT EXISTS threads_updated_at_idx
                ON threads (updated_at DESC, id DESC);
            CREATE INDEX IF NOT EXISTS messages_thread_seq_idx
                ON messages (thread_id, seq);
            ",
        )
        .map_err(|e| format!("migrate: {e}"))?;

        for (column, ddl) in [
            ("model", "ALTER TABLE threads ADD COLUMN model TEXT"),
            (
                "working_directory",
                "ALTER TABLE threads ADD COLUMN working_directory TEXT",
            ),
            (
                "active_run_id",
                "ALTER TABLE threads ADD COLUMN active_run_id TEXT",
            ),
        ] {
            if let Err(e) = conn.execute(ddl, []) {
                let msg = e.to_string().to_lowercase();
                if !msg.contains("duplicate column") {
                    return Err(format!("migrate add threads.{column}: {e}"));
                }
            }
        }

        Ok(())
    }
}

fn ensure_thread_row(conn: &Connection, thread_id: &str, now: i64) -> Result<(), String> {
    conn.execute(
        "INSERT INTO threads (id, created_at, updated_at)
         VALUES (?1, ?2, ?2)
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        params![thread_id, now],
    )
    .map_err(|e| format!("ensure_thread: {e}"))?;
    Ok(())
}

impl ThreadStore for SqliteStore {
    fn ensure_thread(&self, thread_id: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        ensure_thread_row(&conn, thread_id, now_millis())
    }

    fn set_title(&self, thread_id: &str, title: &str) -> Result<i64, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let now = now_millis();
        ensure_thread_row(&conn, thread_id, now)?;
        conn.execute(
            "UPDATE threads SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now, thread_id],
        )
        .map_err(|e| format!("set_title: {e}"))?;
        Ok(now)
    }

    fn get_title(&self, thread_id: &str) -> Result<Option<String>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let title = conn
            .query_row(
                "SELECT title FROM threads WHERE id = ?1",
                params![thread_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(|e| format!("get_title: {e}"))?;
        Ok(title.flatten())
    }

    fn set_model(&self, thread_id: &str, model: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let now = now_millis();
        ensure_thread_row(&conn, thread_id, now)?;
        conn.execute(
            "UPDATE threads SET model = ?1, updated_at = ?2 WHERE id = ?3",
            params![model, now, thread_id],
        )
        .map_err(|e| format!("set_model: {e}"))?;
        Ok(())
    }

    fn set_working_directory(
        &self,
        thread_id: &str,
        working_directory: &str,
    ) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let now = now_millis();
        ensure_thread_row(&conn, thread_id, now)?;
        conn.execute(
            "UPDATE threads SET working_directory = ?1, updated_at = ?2 WHERE id = ?3",
            params![working_directory, now, thread_id],
        )
        .map_err(|e| format!("set_working_directory: {e}"))?;
        Ok(())
    }

    fn get_thread_config(&self, thread_id: &str) -> Result<Option<ThreadConfig>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        conn.query_row(
            "SELECT model, working_directory FROM threads WHERE id = ?1",
            params![thread_id],
            |row| {
                Ok(ThreadConfig {
                    model: row.get(0)?,
                    working_directory: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(|e| format!("get_thread_config: {e}"))
    }

    fn record_usage(&self, thread_id: &str, usage: &Usage) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let now = now_millis();
        let usage_json =
            serde_json::to_string(usage).map_err(|e| format!("record_usage serialize: {e}"))?;
        conn.execute(
            "INSERT INTO threads (
                id, created_at, updated_at,
                total_input_tokens, total_cached_input_tokens, total_output_tokens,
                turn_count, last_usage_json
             )
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT(id) DO UPDATE SET
                updated_at = excluded.updated_at,
                total_input_tokens = total_input_tokens + excluded.total_input_tokens,
                total_cached_input_tokens =
                    total_cached_input_tokens + excluded.total_cached_input_tokens,
                total_output_tokens = total_output_tokens + excluded.total_output_tokens,
                turn_count = turn_count + 1,
                last_usage_json = excluded.last_usage_json",
            params![
                thread_id,
                now,
                usage.input_tokens as i64,
                usage.cached_input_tokens as i64,
                usage.output_tokens as i64,
                usage_json,
            ],
        )
        .map_err(|e| format!("record_usage: {e}"))?;
        Ok(())
    }

    fn save_messages(&self, thread_id: &str, messages: &[UiMessage]) -> Result<(), String> {
        let mut normalized = messages.to_vec();
        normalize_item_parts(&mut normalized);
        let encoded = normalized
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("save_messages serialize: {e}"))?;

        let mut conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let now = now_millis();
        let tx = conn
            .transaction()
            .map_err(|e| format!("save_messages begin: {e}"))?;
        ensure_thread_row(&tx, thread_id, now)?;
        tx.execute("DELETE FROM messages WHERE thread_id = ?1", params![thread_id])
            .map_err(|e| format!("save_messages delete: {e}"))?;
        {
            let mut insert = tx
                .prepare(
                    "INSERT INTO messages (thread_id, seq, message_json, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(|e| format!("save_messages prepare: {e}"))?;
            for (seq, json) in encoded.iter().enumerate() {
                insert
                    .execute(params![thread_id, seq as i64, json, now])
                    .map_err(|e| format!("save_messages insert: {e}"))?;
            }
        }
        tx.commit().map_err(|e| format!("save_messages commit: {e}"))?;
        Ok(())
    }

    fn load_messages(&self, thread_id: &str) -> Result<Option<Vec<UiMessage>>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let mut stmt = conn
            .prepare("SELECT message_json FROM messages WHERE thread_id = ?1 ORDER BY seq ASC")
            .map_err(|e| format!("load_messages prepare: {e}"))?;
        let rows = stmt
            .query_map(params![thread_id], |row| row.get::<_, String>(0))
            .map_err(|e| format!("load_messages query: {e}"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("load_messages collect: {e}"))?;

        if rows.is_empty() {
            return Ok(None);
        }
        let mut messages = Vec::with_capacity(rows.len());
        for raw in rows {
            match serde_json::from_str::<UiMessage>(&raw) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    tracing::warn!(%thread_id, error = %e, "discarding undecodable transcript");
                    return Ok(None);
                }
            }
        }
        normalize_item_parts(&mut messages);
        Ok(Some(messages))
    }

    fn get_active_run(&self, thread_id: &str) -> Result<Option<String>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let run_id = conn
            .query_row(
                "SELECT active_run_id FROM threads WHERE id = ?1",
                params![thread_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(|e| format!("get_active_run: {e}"))?;
        Ok(run_id.flatten())
    }

    fn set_active_run(&self, thread_id: &str, run_id: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let now = now_millis();
        ensure_thread_row(&conn, thread_id, now)?;
        conn.execute(
            "UPDATE threads SET active_run_id = ?1 WHERE id = ?2",
            params![run_id, thread_id],
        )
        .map_err(|e| format!("set_active_run: {e}"))?;
        Ok(())
    }

    fn clear_active_run(&self, thread_id: &str, run_id: &str) -> Result<bool, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let changed = conn
            .execute(
                "UPDATE threads SET active_run_id = NULL
                 WHERE id = ?1 AND active_run_id = ?2",
                params![thread_id, run_id],
            )
            .map_err(|e| format!("clear_active_run: {e}"))?;
        Ok(changed > 0)
    }

    fn list_threads(
        &self,
        limit: usize,
        cursor: Option<&ThreadCursor>,
    ) -> Result<Vec<ThreadSummary>, String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        let limit = limit.clamp(1, 200) as i64;
        let mut stmt = conn
            .prepare(
                "SELECT id, title, model, working_directory, created_at, updated_at,
                        turn_count, total_input_tokens, total_cached_input_tokens,
                        total_output_tokens
                 FROM threads
                 WHERE ?1 IS NULL OR updated_at < ?1 OR (updated_at = ?1 AND id < ?2)
                 ORDER BY updated_at DESC, id DESC
                 LIMIT ?3",
            )
            .map_err(|e| format!("list_threads prepare: {e}"))?;

        let (cursor_updated_at, cursor_id) = match cursor {
            Some(c) => (Some(c.updated_at), Some(c.id.as_str())),
            None => (None, None),
        };
        let rows = stmt
            .query_map(params![cursor_updated_at, cursor_id, limit], |row| {
                Ok(ThreadSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    model: row.get(2)?,
                    working_directory: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                    turn_count: row.get::<_, i64>(6)? as u64,
                    total_input_tokens: row.get::<_, i64>(7)? as u64,
                    total_cached_input_tokens: row.get::<_, i64>(8)? as u64,
                    total_output_tokens: row.get::<_, i64>(9)? as u64,
                })
            })
            .map_err(|e| format!("list_threads query: {e}"))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("list_threads collect: {e}"))
    }

    fn delete_thread(&self, thread_id: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("lock: {e}"))?;
        conn.execute("DELETE FROM messages WHERE thread_id = ?1", params![thread_id])
            .map_err(|e| format!("delete_thread messages: {e}"))?;
        conn.execute("DELETE FROM threads WHERE id = ?1", params![thread_id])
            .map_err(|e| format!("delete_thread: {e}"))?;
        Ok(())
    }
}
