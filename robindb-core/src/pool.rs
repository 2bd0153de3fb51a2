//! Reference-counted open-database pool
//!
//! A process-wide registry keyed by canonical path, guaranteeing at
//! most one open container per database. Capacity is a counting
//! semaphore; each entry carries its own monitor, so opens of
//! different paths proceed in parallel and only same-path callers
//! wait on one another.

use crate::backend::BackendType;
use crate::db::{canonical_path, RrdDb};
use crate::def::RrdDef;
use crate::{Result, RrdError};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::info;

/// Counting semaphore bounding the number of open databases
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    fn reset(&self, permits: usize) {
        *self.permits.lock() = permits;
        self.available.notify_all();
    }
}

#[derive(Default)]
struct EntryState {
    db: Option<Arc<Mutex<RrdDb>>>,
    count: usize,
    /// Set once the entry's database closed; holders of a stale
    /// entry handle must re-lookup
    dead: bool,
}

#[derive(Default)]
struct PoolEntry {
    state: Mutex<EntryState>,
}

/// Reference-counted, capacity-bounded registry of open databases
pub struct RrdDbPool {
    entries: Mutex<HashMap<PathBuf, Arc<PoolEntry>>>,
    semaphore: Semaphore,
    capacity: AtomicUsize,
    open_count: AtomicUsize,
    backend_type: BackendType,
}

static INSTANCE: OnceLock<RrdDbPool> = OnceLock::new();

impl RrdDbPool {
    /// The process-wide pool, capacity
    /// [`crate::config::DEFAULT_POOL_CAPACITY`]
    pub fn instance() -> &'static RrdDbPool {
        INSTANCE.get_or_init(|| RrdDbPool::new(crate::config::DEFAULT_POOL_CAPACITY))
    }

    /// A pool with its own capacity, using file storage
    pub fn new(capacity: usize) -> Self {
        Self::with_backend(capacity, BackendType::default())
    }

    /// A pool opening databases on the given backend
    pub fn with_backend(capacity: usize, backend_type: BackendType) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            semaphore: Semaphore::new(capacity),
            capacity: AtomicUsize::new(capacity),
            open_count: AtomicUsize::new(0),
            backend_type,
        }
    }

    fn entry_for(&self, canonical: &Path) -> Arc<PoolEntry> {
        let mut entries = self.entries.lock();
        entries
            .entry(canonical.to_path_buf())
            .or_default()
            .clone()
    }

    fn remove_entry(&self, canonical: &Path, entry: &Arc<PoolEntry>) {
        let mut entries = self.entries.lock();
        if entries
            .get(canonical)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(canonical);
        }
    }

    fn request_with(
        &self,
        canonical: PathBuf,
        fail_if_open: bool,
        open: impl Fn() -> Result<RrdDb>,
    ) -> Result<Arc<Mutex<RrdDb>>> {
        loop {
            let entry = self.entry_for(&canonical);
            let mut state = entry.state.lock();
            if state.dead {
                continue;
            }
            if let Some(db) = state.db.clone() {
                if fail_if_open {
                    return Err(RrdError::AlreadyOpen(canonical.display().to_string()));
                }
                state.count += 1;
                return Ok(db);
            }
            // may block until another database is released
            self.semaphore.acquire();
            match open() {
                Ok(db) => {
                    let db = Arc::new(Mutex::new(db));
                    state.db = Some(db.clone());
                    state.count = 1;
                    self.open_count.fetch_add(1, Ordering::SeqCst);
                    info!("Pool opened {:?}", canonical);
                    return Ok(db);
                }
                Err(e) => {
                    self.semaphore.release();
                    state.dead = true;
                    self.remove_entry(&canonical, &entry);
                    return Err(e);
                }
            }
        }
    }

    /// Obtain a handle for an existing database, opening it on first
    /// request. Blocks when the pool is at capacity.
    pub fn request(&self, path: impl AsRef<Path>) -> Result<Arc<Mutex<RrdDb>>> {
        let path = path.as_ref();
        let canonical = canonical_path(path);
        self.request_with(canonical, false, || {
            RrdDb::open_with(path, false, &self.backend_type)
        })
    }

    /// Create a database and register the handle. Fails with
    /// AlreadyOpen when the definition's path is live in the pool.
    pub fn request_create(&self, def: &RrdDef) -> Result<Arc<Mutex<RrdDb>>> {
        let canonical = canonical_path(def.path());
        self.request_with(canonical, true, || {
            RrdDb::create_with(def, &self.backend_type)
        })
    }

    /// Import a database from an XML dump and register the handle.
    /// Fails with AlreadyOpen when the path is live in the pool.
    pub fn request_import(
        &self,
        path: impl AsRef<Path>,
        xml: &str,
    ) -> Result<Arc<Mutex<RrdDb>>> {
        let path = path.as_ref();
        let canonical = canonical_path(path);
        self.request_with(canonical, true, || {
            RrdDb::restore_with(path, xml, &self.backend_type)
        })
    }

    /// Return a handle obtained from this pool. The database closes
    /// when its last outstanding handle is released.
    pub fn release(&self, db: &Arc<Mutex<RrdDb>>) -> Result<()> {
        let canonical = db.lock().canonical_path().to_path_buf();
        let entry = self
            .entries
            .lock()
            .get(&canonical)
            .cloned()
            .ok_or_else(|| {
                RrdError::InvalidState(format!("Releasing unknown handle: {:?}", canonical))
            })?;
        let mut state = entry.state.lock();
        let is_current = state
            .db
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, db));
        if !is_current || state.count == 0 {
            return Err(RrdError::InvalidState(format!(
                "Releasing unknown handle: {:?}",
                canonical
            )));
        }
        state.count -= 1;
        if state.count == 0 {
            let db = state.db.take().expect("checked above");
            state.dead = true;
            let close_result = db.lock().close();
            self.open_count.fetch_sub(1, Ordering::SeqCst);
            self.remove_entry(&canonical, &entry);
            self.semaphore.release();
            info!("Pool closed {:?}", canonical);
            close_result?;
        }
        Ok(())
    }

    /// Maximum number of simultaneously open databases
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Replace the capacity; only allowed while the pool is empty
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        let entries = self.entries.lock();
        if !entries.is_empty() {
            return Err(RrdError::InvalidState(
                "Capacity can only be changed on an empty pool".to_string(),
            ));
        }
        self.semaphore.reset(capacity);
        self.capacity.store(capacity, Ordering::SeqCst);
        Ok(())
    }

    /// Number of currently open databases
    pub fn open_file_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Canonical paths of the currently registered databases
    pub fn open_files(&self) -> Vec<PathBuf> {
        self.entries.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::{ArcDef, DsDef};
    use crate::types::ConsolFun;
    use crate::FetchRequest;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_def(path: &Path) -> RrdDef {
        let mut def = RrdDef::new(path, 1_000_000_000, 300);
        def.add_datasource(DsDef::from_spec("DS:x:GAUGE:600:U:U").unwrap())
            .unwrap();
        def.add_archive(ArcDef::from_spec("RRA:AVERAGE:0.5:1:10").unwrap())
            .unwrap();
        def
    }

    #[test]
    fn test_same_path_shares_one_container() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.rrd");
        let pool = RrdDbPool::new(10);

        let first = pool.request_create(&test_def(&path)).unwrap();
        let second = pool.request(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.open_file_count(), 1);

        pool.release(&first).unwrap();
        assert_eq!(pool.open_file_count(), 1);
        assert!(!second.lock().is_closed());

        pool.release(&second).unwrap();
        assert_eq!(pool.open_file_count(), 0);
        assert!(pool.open_files().is_empty());
    }

    #[test]
    fn test_create_on_live_path_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.rrd");
        let pool = RrdDbPool::new(10);

        let handle = pool.request_create(&test_def(&path)).unwrap();
        assert!(matches!(
            pool.request_create(&test_def(&path)),
            Err(RrdError::AlreadyOpen(_))
        ));
        pool.release(&handle).unwrap();

        // once released, the path may be recreated
        let handle = pool.request_create(&test_def(&path)).unwrap();
        pool.release(&handle).unwrap();
    }

    #[test]
    fn test_capacity_blocks_until_release() {
        let temp_dir = TempDir::new().unwrap();
        let path_a = temp_dir.path().join("a.rrd");
        let path_b = temp_dir.path().join("b.rrd");
        RrdDb::create(&test_def(&path_a)).unwrap().close().unwrap();
        RrdDb::create(&test_def(&path_b)).unwrap().close().unwrap();

        let pool = RrdDbPool::new(1);
        let first = pool.request(&path_a).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let second = pool.request(&path_b).unwrap();
                done_tx.send(()).unwrap();
                pool.release(&second).unwrap();
            });
            // the second request is parked on the capacity semaphore
            assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
            pool.release(&first).unwrap();
            assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        });
        assert_eq!(pool.open_file_count(), 0);
    }

    #[test]
    fn test_set_capacity_requires_empty_pool() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.rrd");
        let pool = RrdDbPool::new(5);

        let handle = pool.request_create(&test_def(&path)).unwrap();
        assert!(matches!(
            pool.set_capacity(1),
            Err(RrdError::InvalidState(_))
        ));
        pool.release(&handle).unwrap();

        pool.set_capacity(1).unwrap();
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_release_of_unknown_handle_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.rrd");
        let pool = RrdDbPool::new(5);

        let foreign = Arc::new(Mutex::new(RrdDb::create(&test_def(&path)).unwrap()));
        assert!(matches!(
            pool.release(&foreign),
            Err(RrdError::InvalidState(_))
        ));
    }

    #[test]
    fn test_pooled_handle_is_usable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.rrd");
        let pool = RrdDbPool::new(5);

        let handle = pool.request_create(&test_def(&path)).unwrap();
        {
            let mut db = handle.lock();
            let mut sample = db.create_sample(1_000_000_300).unwrap();
            sample.set_value("x", 1.5).unwrap();
            sample.update().unwrap();
        }
        pool.release(&handle).unwrap();

        let handle = pool.request(&path).unwrap();
        {
            let mut db = handle.lock();
            let request =
                FetchRequest::new(ConsolFun::Average, 1_000_000_000, 1_000_000_300, 300)
                    .unwrap();
            let data = db.fetch(&request).unwrap();
            assert!((data.values(0)[1] - 1.5).abs() < 1e-9);
        }
        pool.release(&handle).unwrap();
    }
}
