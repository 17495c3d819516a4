use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};

/// Persisted index of cached byte ranges.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub url: String,
    pub range_start: u64,
    pub range_length: u64,
    pub size_bytes: u64,
    /// Logical access stamp, strictly increasing across the store's lifetime.
    pub last_access: u64,
    pub inserted_seq: u64,
    pub file_path: String,
    pub checksum: String,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("storage: open in-memory database")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn upsert_entry(&self, row: &IndexRow) -> Result<()> {
        if row.url.is_empty() {
            bail!("storage: entry url required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO cache_entries (url, range_start, range_length, size_bytes, last_access, inserted_seq, file_path, checksum, stored_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT(url, range_start, range_length) DO UPDATE SET
  size_bytes = excluded.size_bytes,
  last_access = excluded.last_access,
  inserted_seq = excluded.inserted_seq,
  file_path = excluded.file_path,
  checksum = excluded.checksum,
  stored_at = excluded.stored_at
"#,
            params![
                row.url,
                to_sql_int(row.range_start),
                to_sql_int(row.range_length),
                to_sql_int(row.size_bytes),
                to_sql_int(row.last_access),
                to_sql_int(row.inserted_seq),
                row.file_path,
                row.checksum,
                row.stored_at.timestamp(),
            ],
        )
        .context("storage: upsert cache entry")?;
        Ok(())
    }

    pub fn touch_entry(
        &self,
        url: &str,
        range_start: u64,
        range_length: u64,
        last_access: u64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
UPDATE cache_entries SET last_access = ?4
WHERE url = ?1 AND range_start = ?2 AND range_length = ?3 AND last_access < ?4
"#,
            params![
                url,
                to_sql_int(range_start),
                to_sql_int(range_length),
                to_sql_int(last_access),
            ],
        )
        .context("storage: touch cache entry")?;
        Ok(())
    }

    /// All rows in eviction order (least recently used first).
    pub fn list_entries(&self) -> Result<Vec<IndexRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT url, range_start, range_length, size_bytes, last_access, inserted_seq, file_path, checksum, stored_at
FROM cache_entries
ORDER BY last_access ASC, inserted_seq ASC
"#,
        )?;
        let rows = stmt
            .query_map([], index_row_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn total_size(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    pub fn delete_entry(&self, url: &str, range_start: u64, range_length: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM cache_entries WHERE url = ?1 AND range_start = ?2 AND range_length = ?3",
            params![url, to_sql_int(range_start), to_sql_int(range_length)],
        )
        .context("storage: delete cache entry")?;
        Ok(())
    }

    pub fn delete_by_url(&self, url: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM cache_entries WHERE url = ?1", params![url])
            .context("storage: delete cache entries by url")?;
        Ok(removed)
    }
}

// SQLite integers are signed; cache sizes and stamps never approach i64::MAX.
fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn index_row_from_row(row: &Row<'_>) -> rusqlite::Result<IndexRow> {
    let stored: i64 = row.get(8)?;
    Ok(IndexRow {
        url: row.get(0)?,
        range_start: row.get::<_, i64>(1)?.max(0) as u64,
        range_length: row.get::<_, i64>(2)?.max(0) as u64,
        size_bytes: row.get::<_, i64>(3)?.max(0) as u64,
        last_access: row.get::<_, i64>(4)?.max(0) as u64,
        inserted_seq: row.get::<_, i64>(5)?.max(0) as u64,
        file_path: row.get(6)?,
        checksum: row.get(7)?,
        stored_at: Utc
            .timestamp_opt(stored, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS cache_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  url TEXT NOT NULL,
  range_start INTEGER NOT NULL,
  range_length INTEGER NOT NULL,
  size_bytes INTEGER NOT NULL,
  last_access INTEGER NOT NULL,
  inserted_seq INTEGER NOT NULL,
  file_path TEXT NOT NULL,
  checksum TEXT NOT NULL,
  stored_at INTEGER NOT NULL,
  UNIQUE(url, range_start, range_length)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_last_access ON cache_entries(last_access, inserted_seq);
CREATE INDEX IF NOT EXISTS idx_cache_entries_url ON cache_entries(url);
"#,
    ]
}

// The index sits beside the blobs it describes.
fn default_path() -> Option<PathBuf> {
    crate::config::CacheConfig::default()
        .dir
        .map(|dir| dir.join("index.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(url: &str, start: u64, access: u64, seq: u64) -> IndexRow {
        IndexRow {
            url: url.to_string(),
            range_start: start,
            range_length: 4,
            size_bytes: 4,
            last_access: access,
            inserted_seq: seq,
            file_path: format!("/tmp/{url}-{start}.bin"),
            checksum: "00".into(),
            stored_at: Utc::now(),
        }
    }

    #[test]
    fn open_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.db");
        let store = Store::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
        store.close().unwrap();
    }

    #[test]
    fn rows_survive_reopen_in_lru_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let store = Store::open(Options {
                path: Some(path.clone()),
            })
            .unwrap();
            store.upsert_entry(&row("a", 0, 5, 1)).unwrap();
            store.upsert_entry(&row("b", 0, 2, 2)).unwrap();
            store.upsert_entry(&row("c", 0, 2, 3)).unwrap();
            store.close().unwrap();
        }
        let store = Store::open(Options { path: Some(path) }).unwrap();
        let urls: Vec<_> = store
            .list_entries()
            .unwrap()
            .into_iter()
            .map(|r| r.url)
            .collect();
        assert_eq!(urls, vec!["b", "c", "a"]);
        assert_eq!(store.total_size().unwrap(), 12);
    }

    #[test]
    fn touch_only_moves_forward() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_entry(&row("a", 0, 5, 1)).unwrap();
        store.touch_entry("a", 0, 4, 3).unwrap();
        assert_eq!(store.list_entries().unwrap()[0].last_access, 5);
        store.touch_entry("a", 0, 4, 9).unwrap();
        assert_eq!(store.list_entries().unwrap()[0].last_access, 9);
    }

    #[test]
    fn delete_by_url_removes_every_range() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_entry(&row("a", 0, 1, 1)).unwrap();
        store.upsert_entry(&row("a", 4, 2, 2)).unwrap();
        store.upsert_entry(&row("b", 0, 3, 3)).unwrap();
        assert_eq!(store.delete_by_url("a").unwrap(), 2);
        assert_eq!(store.delete_by_url("missing").unwrap(), 0);
        assert_eq!(store.list_entries().unwrap().len(), 1);
    }
}
