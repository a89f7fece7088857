//! Persistent lookup cache backed by SQLite.
//!
//! Maps a query fingerprint to a resolved ASIN or an explicit not-found
//! tombstone. Tombstones carry a shorter TTL than positive entries: absence
//! is more likely to change (new editions appear) than presence.
//!
//! The opener never fails a process start over cache state: a legacy
//! flat-file cache is migrated in place (original kept as a `.legacy.bak`),
//! and a file that is neither a SQLite database nor a legacy cache is deleted
//! and recreated. Runtime I/O errors surface as [`CacheError::Unavailable`]
//! so the orchestrator can continue uncached.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::Asin;

/// Current on-disk schema version (`PRAGMA user_version`).
const SCHEMA_VERSION: i32 = 2;

/// First 16 bytes of every SQLite database file.
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// TTLs applied to entries carried over from a legacy flat-file cache, which
/// recorded no timestamps of its own.
const MIGRATED_POSITIVE_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);
const MIGRATED_TOMBSTONE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum CacheError {
    /// The store is unreachable or an operation on it failed. Non-fatal:
    /// lookups proceed without caching.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

/// A non-expired cache row. `asin == None` is a tombstone: the query was
/// exhausted before and found nothing.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub asin: Option<Asin>,
    pub source: Option<String>,
    pub confidence: f64,
}

/// Operational counters for the diagnostic surface.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entry_count: u64,
    pub size_bytes: u64,
    /// Hits / (hits + misses) since this handle was opened.
    pub hit_rate: f64,
}

/// SQLite-backed fingerprint -> ASIN cache. Single writer per handle; SQLite
/// WAL mode covers concurrent readers and crash-safety.
pub struct AsinCache {
    conn: Mutex<Connection>,
    path: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AsinCache {
    /// Open (or create) the cache at `path`.
    ///
    /// Recovery ladder, in order: a well-formed database is opened and its
    /// schema migrated to the current version; a legacy flat-file cache is
    /// converted (original renamed to `<file>.legacy.bak`); anything else is
    /// deleted and a fresh store created. Only filesystem-level failures
    /// (e.g. an unwritable directory) error out.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match Self::classify(path)? {
            StoreFormat::Missing => {}
            StoreFormat::Sqlite => {}
            StoreFormat::Legacy(entries) => {
                let backup = legacy_backup_path(path);
                std::fs::rename(path, &backup)?;
                log::info!(
                    "migrating legacy cache ({} entries), original kept at {}",
                    entries.len(),
                    backup.display()
                );
                let cache = Self::create(path)?;
                cache.insert_legacy(&entries)?;
                return Ok(cache);
            }
            StoreFormat::Corrupt => {
                log::warn!(
                    "cache file {} is not a database, recreating it",
                    path.display()
                );
                std::fs::remove_file(path)?;
            }
        }

        match Self::create(path) {
            Ok(cache) => Ok(cache),
            // Magic bytes were present but the file is still unusable
            // (truncated database, hostile schema). Recreate once.
            Err(first) if path.exists() => {
                log::warn!(
                    "cache file {} failed structural validation, recreating it",
                    path.display()
                );
                std::fs::remove_file(path)?;
                Self::create(path).map_err(|_| first)
            }
            Err(e) => Err(e),
        }
    }

    /// Default cache location under the per-user data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("asinscout")
            .join("asin-cache.db")
    }

    fn create(path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Sniff the on-disk format without committing to an open.
    fn classify(path: &Path) -> Result<StoreFormat, CacheError> {
        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreFormat::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        let mut magic = [0u8; 16];
        let n = file.read(&mut magic)?;
        if n == 0 {
            // Zero-byte file: SQLite treats it as a fresh database.
            return Ok(StoreFormat::Sqlite);
        }
        if n == 16 && &magic == SQLITE_MAGIC {
            return Ok(StoreFormat::Sqlite);
        }

        match parse_legacy(path) {
            Some(entries) => Ok(StoreFormat::Legacy(entries)),
            None => Ok(StoreFormat::Corrupt),
        }
    }

    fn insert_legacy(&self, entries: &[(String, Option<String>)]) -> Result<(), CacheError> {
        let now = now_millis();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (key, asin) in entries {
            // Re-validate on the way in; a legacy file may hold junk values.
            let asin = asin.as_deref().and_then(|a| Asin::parse(a).ok());
            let ttl = match asin {
                Some(_) => MIGRATED_POSITIVE_TTL,
                None => MIGRATED_TOMBSTONE_TTL,
            };
            tx.execute(
                "INSERT OR REPLACE INTO asin_cache
                 (key, asin, source, confidence, created_at, expires_at)
                 VALUES (?1, ?2, 'legacy-cache', 0.0, ?3, ?4)",
                params![
                    key,
                    asin.as_ref().map(Asin::as_str),
                    now,
                    now + ttl.as_millis() as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Look up a fingerprint. Expired rows read as a miss; their physical
    /// deletion is deferred to [`sweep_expired`](Self::sweep_expired).
    pub fn get(&self, key: &str) -> Result<Option<CacheHit>, CacheError> {
        self.get_at(key, now_millis())
    }

    pub(crate) fn get_at(&self, key: &str, now_ms: i64) -> Result<Option<CacheHit>, CacheError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT asin, source, confidence FROM asin_cache
                 WHERE key = ?1 AND expires_at > ?2",
                params![key, now_ms],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        match row {
            Some((asin, source, confidence)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CacheHit {
                    asin: asin.as_deref().and_then(|a| Asin::parse(a).ok()),
                    source,
                    confidence,
                }))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Insert or replace an entry. `asin == None` writes a tombstone.
    pub fn put(
        &self,
        key: &str,
        asin: Option<&Asin>,
        source: Option<&str>,
        confidence: f64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.put_at(key, asin, source, confidence, ttl, now_millis())
    }

    pub(crate) fn put_at(
        &self,
        key: &str,
        asin: Option<&Asin>,
        source: Option<&str>,
        confidence: f64,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO asin_cache
             (key, asin, source, confidence, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key,
                asin.map(Asin::as_str),
                source,
                confidence,
                now_ms,
                now_ms + ttl.as_millis() as i64
            ],
        )?;
        Ok(())
    }

    /// Delete expired rows. Returns how many were removed.
    pub fn sweep_expired(&self) -> Result<u64, CacheError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM asin_cache WHERE expires_at <= ?1",
            params![now_millis()],
        )?;
        Ok(removed as u64)
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM asin_cache", [])?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let conn = self.lock()?;
        let entry_count: u64 = conn.query_row("SELECT COUNT(*) FROM asin_cache", [], |r| r.get(0))?;
        let size_bytes: u64 = conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |r| r.get(0),
        )?;
        drop(conn);

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        Ok(CacheStats {
            entry_count,
            size_bytes,
            hit_rate,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".into()))
    }
}

impl std::fmt::Debug for AsinCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsinCache")
            .field("path", &self.path)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

enum StoreFormat {
    Missing,
    Sqlite,
    /// Parsed legacy entries: fingerprint -> ASIN or null (tombstone).
    Legacy(Vec<(String, Option<String>)>),
    Corrupt,
}

/// The pre-SQLite cache was a single JSON object mapping fingerprints to an
/// ASIN string or `null`. Anything else is not a legacy cache.
fn parse_legacy(path: &Path) -> Option<Vec<(String, Option<String>)>> {
    let text = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    let map = value.as_object()?;
    let mut entries = Vec::with_capacity(map.len());
    for (key, v) in map {
        let asin = match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            _ => return None,
        };
        entries.push((key.clone(), asin));
    }
    Some(entries)
}

fn legacy_backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".legacy.bak");
    path.with_file_name(name)
}

/// Run pending schema migrations. Each step is a pure `vN -> vN+1` function
/// over an open connection; `PRAGMA user_version` records progress.
fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    if version > SCHEMA_VERSION {
        // Downgrade from a future version: treat as structural invalidity.
        return Err(rusqlite::Error::InvalidQuery);
    }
    if version < 1 {
        migrate_v0_to_v1(conn)?;
    }
    if version < 2 {
        migrate_v1_to_v2(conn)?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

fn migrate_v0_to_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS asin_cache (
             key        TEXT PRIMARY KEY,
             asin       TEXT,
             created_at INTEGER NOT NULL,
             expires_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_asin_cache_expires
             ON asin_cache(expires_at);",
    )
}

/// v2 records which adapter produced each entry and at what confidence, so a
/// cache hit can reproduce the original result verbatim.
fn migrate_v1_to_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "ALTER TABLE asin_cache ADD COLUMN source TEXT;
         ALTER TABLE asin_cache ADD COLUMN confidence REAL NOT NULL DEFAULT 0.0;",
    )
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
