//! Vista persistence: the key-value contract behind the catalog plus two backends.
//! Keep code tiny and predictable; the repository owns all catalog semantics.

#![forbid(unsafe_code)]

use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Minimal storage contract consumed by the catalog repository.
///
/// Implementations are accessed sequentially from the dispatch loop; concurrent
/// readers must only ever observe whole values.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
    fn scan_all(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

/// SQLite-backed store. Simple, synchronous.
pub struct SqliteBackend {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteBackend {
    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS catalog (
                id   TEXT PRIMARY KEY NOT NULL,
                body BLOB NOT NULL
            )",
            [],
        )
        .context("creating catalog table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "sqlite backend opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

impl KvBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare_cached("SELECT body FROM catalog WHERE id = ?1")?;
        let mut rows = stmt.query([key])?;
        let out = match rows.next()? {
            Some(row) => Some(row.get::<_, Vec<u8>>(0)?),
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO catalog(id, body) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            (key, value),
        )
        .with_context(|| format!("writing catalog entry {}", key))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM catalog WHERE id = ?1", [key])
            .with_context(|| format!("deleting catalog entry {}", key))?;
        counter!("persist_delete_total", 1u64);
        Ok(())
    }

    fn scan_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT id, body FROM catalog")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?));
        }
        histogram!("persist_scan_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

/// Volatile map backend; contents are lost on restart.
#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<FxHashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.map.read().map(|m| m.len()).unwrap_or(0) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.map.read().map_err(|_| anyhow!("memory backend lock poisoned"))?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut map = self.map.write().map_err(|_| anyhow!("memory backend lock poisoned"))?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.map.write().map_err(|_| anyhow!("memory backend lock poisoned"))?;
        map.remove(key);
        Ok(())
    }

    fn scan_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.map.read().map_err(|_| anyhow!("memory backend lock poisoned"))?;
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".vista");
        let _ = std::fs::create_dir_all(&p);
        p.push("catalog.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "catalog.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(b: &dyn KvBackend) {
        assert_eq!(b.get("a").unwrap(), None);
        b.put("a", b"one").unwrap();
        b.put("b", b"two").unwrap();
        b.put("a", b"uno").unwrap();
        assert_eq!(b.get("a").unwrap().as_deref(), Some(&b"uno"[..]));

        let mut all = b.scan_all().unwrap();
        all.sort();
        assert_eq!(all, vec![("a".to_string(), b"uno".to_vec()), ("b".to_string(), b"two".to_vec())]);

        b.delete("a").unwrap();
        b.delete("a").unwrap();
        assert_eq!(b.get("a").unwrap(), None);
        assert_eq!(b.scan_all().unwrap().len(), 1);
    }

    #[test]
    fn memory_backend_contract() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn sqlite_backend_contract() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        exercise(&SqliteBackend::open(path.to_str().unwrap()).unwrap());
    }

    #[test]
    fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        let path = path.to_str().unwrap();
        SqliteBackend::open(path).unwrap().put("k", b"v").unwrap();
        let again = SqliteBackend::open(path).unwrap();
        assert_eq!(again.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    }
}
