use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::prompts::{is_prompt_id, prompt_id, PromptPair};

/// A persisted prompt and the images generated for it, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    #[serde(alias = "prompt")]
    pub prompt_text: String,
    #[serde(default)]
    pub positive_prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub created_at: String,
    #[serde(alias = "last_used")]
    pub last_used_at: String,
    #[serde(default)]
    pub images: Vec<String>,
}

impl HistoryRecord {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn prompt_pair(&self) -> PromptPair {
        PromptPair::new(&self.positive_prompt, &self.negative_prompt)
    }

    /// Composite `promptId/filename` paths for every image on the record.
    pub fn image_paths(&self) -> Vec<String> {
        self.images
            .iter()
            .map(|filename| format!("{}/{}", self.id, filename))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_prompts: usize,
    pub total_images: usize,
}

/// Durable prompt → images record store.
pub trait HistoryStore: Send + Sync {
    /// Creates the record for `prompt_text` or, when it already exists, only
    /// refreshes its `last_used_at`. Returns the prompt id either way.
    fn upsert(&self, prompt_text: &str, pair: &PromptPair, width: u32, height: u32)
        -> Result<String>;
    fn append_image(&self, prompt_id: &str, filename: &str) -> Result<()>;
    /// Returns whether the filename was on the record.
    fn remove_image(&self, prompt_id: &str, filename: &str) -> Result<bool>;
    fn get(&self, prompt_id: &str) -> Result<Option<HistoryRecord>>;
    /// Returns whether a record was deleted.
    fn delete(&self, prompt_id: &str) -> Result<bool>;
    /// All records, most recently used first.
    fn list(&self) -> Result<Vec<HistoryRecord>>;

    fn stats(&self) -> Result<HistoryStats> {
        let records = self.list()?;
        Ok(HistoryStats {
            total_prompts: records.len(),
            total_images: records.iter().map(HistoryRecord::image_count).sum(),
        })
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prompts (
    id              TEXT PRIMARY KEY,
    prompt_text     TEXT NOT NULL,
    positive_prompt TEXT NOT NULL DEFAULT '',
    negative_prompt TEXT NOT NULL DEFAULT '',
    width           INTEGER NOT NULL,
    height          INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    last_used_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS images (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    prompt_id   TEXT NOT NULL REFERENCES prompts(id) ON DELETE CASCADE,
    filename    TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_prompts_last_used ON prompts(last_used_at DESC);
CREATE INDEX IF NOT EXISTS idx_images_prompt_id ON images(prompt_id);
";

const PROMPT_COLUMNS: &str =
    "id, prompt_text, positive_prompt, negative_prompt, width, height, created_at, last_used_at";

/// What [`SqliteHistoryStore::import_legacy_json`] did with each record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub images: usize,
}

/// [`HistoryStore`] backed by a SQLite database with one `prompts` row per
/// prompt and one `images` row per file, in insertion order.
#[derive(Debug)]
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed opening history database {}", path.display()))?;
        let store = Self::with_connection(conn)?;
        tracing::debug!(path = %path.display(), "history store opened");
        Ok(store)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)
            .context("failed initialising history schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("history store lock poisoned"))
    }

    /// Copies the records of a legacy `history.json` array into the database.
    /// Records whose id is already stored are left alone.
    pub fn import_legacy_json(&self, path: impl AsRef<Path>) -> Result<ImportSummary> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let records: Vec<HistoryRecord> = if raw.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("malformed history file {}", path.display()))?
        };

        let mut summary = ImportSummary::default();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for record in &records {
            if !is_prompt_id(&record.id) {
                tracing::warn!(id = %record.id, "skipping legacy record with invalid id");
                summary.skipped += 1;
                continue;
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO prompts (id, prompt_text, positive_prompt, negative_prompt,
                     width, height, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.prompt_text,
                    record.positive_prompt,
                    record.negative_prompt,
                    record.width,
                    record.height,
                    record.created_at,
                    record.last_used_at,
                ],
            )?;
            if inserted == 0 {
                summary.skipped += 1;
                continue;
            }
            for filename in &record.images {
                tx.execute(
                    "INSERT INTO images (prompt_id, filename, created_at) VALUES (?1, ?2, ?3)",
                    params![record.id, filename, record.last_used_at],
                )?;
            }
            summary.imported += 1;
            summary.images += record.images.len();
        }
        tx.commit()?;
        tracing::info!(
            imported = summary.imported,
            skipped = summary.skipped,
            images = summary.images,
            "legacy history imported"
        );
        Ok(summary)
    }
}

fn prompt_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        prompt_text: row.get(1)?,
        positive_prompt: row.get(2)?,
        negative_prompt: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        created_at: row.get(6)?,
        last_used_at: row.get(7)?,
        images: Vec::new(),
    })
}

fn images_of(conn: &Connection, prompt_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT filename FROM images WHERE prompt_id = ?1 ORDER BY id ASC")?;
    let rows = stmt.query_map([prompt_id], |row| row.get(0))?;
    rows.collect()
}

impl HistoryStore for SqliteHistoryStore {
    fn upsert(
        &self,
        prompt_text: &str,
        pair: &PromptPair,
        width: u32,
        height: u32,
    ) -> Result<String> {
        let id = prompt_id(prompt_text);
        let now = now_utc_iso();
        let conn = self.lock()?;
        let refreshed = conn.execute(
            "UPDATE prompts SET last_used_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        if refreshed == 0 {
            conn.execute(
                "INSERT INTO prompts (id, prompt_text, positive_prompt, negative_prompt,
                     width, height, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![id, prompt_text, pair.positive, pair.negative, width, height, now],
            )?;
            tracing::info!(prompt_id = %id, "history record created");
        }
        Ok(id)
    }

    fn append_image(&self, prompt_id: &str, filename: &str) -> Result<()> {
        let now = now_utc_iso();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let touched = tx.execute(
            "UPDATE prompts SET last_used_at = ?1 WHERE id = ?2",
            params![now, prompt_id],
        )?;
        if touched == 0 {
            bail!("no history record for prompt {prompt_id}");
        }
        tx.execute(
            "INSERT INTO images (prompt_id, filename, created_at) VALUES (?1, ?2, ?3)",
            params![prompt_id, filename, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove_image(&self, prompt_id: &str, filename: &str) -> Result<bool> {
        let removed = self.lock()?.execute(
            "DELETE FROM images WHERE prompt_id = ?1 AND filename = ?2",
            params![prompt_id, filename],
        )?;
        Ok(removed > 0)
    }

    fn get(&self, prompt_id: &str) -> Result<Option<HistoryRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {PROMPT_COLUMNS} FROM prompts WHERE id = ?1"),
                [prompt_id],
                prompt_from_row,
            )
            .optional()?;
        let Some(mut record) = record else {
            return Ok(None);
        };
        record.images = images_of(&conn, prompt_id)?;
        Ok(Some(record))
    }

    fn delete(&self, prompt_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM images WHERE prompt_id = ?1", [prompt_id])?;
        let removed = tx.execute("DELETE FROM prompts WHERE id = ?1", [prompt_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<HistoryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROMPT_COLUMNS} FROM prompts ORDER BY last_used_at DESC"
        ))?;
        let mut records = stmt
            .query_map([], prompt_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for record in &mut records {
            record.images = images_of(&conn, &record.id)?;
        }
        Ok(records)
    }

    fn stats(&self) -> Result<HistoryStats> {
        let conn = self.lock()?;
        let total_prompts: i64 = conn.query_row("SELECT COUNT(*) FROM prompts", [], |row| row.get(0))?;
        let total_images: i64 = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(HistoryStats {
            total_prompts: usize::try_from(total_prompts)?,
            total_images: usize::try_from(total_images)?,
        })
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
