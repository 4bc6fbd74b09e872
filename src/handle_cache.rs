//! Per-repository writer and searcher handles.
//!
//! Tantivy allows a single `IndexWriter` per index directory, so the cache
//! owns at most one writer per [`IndexLocation`] and hands out shared
//! [`WriterHandle`]s. Searchers are point-in-time snapshots; they are evicted
//! after every commit that readers must observe. A location with no cached
//! writer is read through a standalone reader, so searching never takes the
//! index's writer lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Searcher};
use tracing::{debug, warn};

use crate::{
    data_dir::IndexLocation,
    error::{Error, Result},
    tantivy_index::{self, IndexSession, SchemaFields},
};

/// An open writer bound to one repository's index.
pub struct WriterHandle {
    location: IndexLocation,
    index: Index,
    fields: SchemaFields,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
}

impl WriterHandle {
    fn open(
        location: IndexLocation,
        index: Index,
        memory_budget: usize,
    ) -> Result<Self> {
        let fields = SchemaFields::resolve(&index.schema())?;
        let writer: IndexWriter = index.writer(memory_budget)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            location,
            index,
            fields,
            reader,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn fields(&self) -> SchemaFields {
        self.fields
    }

    /// Run `f` with exclusive access to the writer.
    ///
    /// Writes from different threads are serialized here. `f` must not call
    /// back into the [`IndexCache`].
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut IndexSession<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = lock(&self.writer, "index writer")?;
        let writer = guard.as_mut().ok_or_else(|| {
            Error::WriterClosed(self.location.root().to_path_buf())
        })?;
        let mut session = IndexSession::new(writer, self.fields);
        f(&mut session)
    }

    /// Run `f` and commit once if it succeeds. On any failure, including a
    /// failed commit, pending changes are rolled back.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut IndexSession<'_>) -> Result<T>,
    ) -> Result<T> {
        self.write(|session| {
            let outcome = f(session).and_then(|value| {
                session.commit()?;
                Ok(value)
            });
            if outcome.is_err()
                && let Err(e) = session.rollback()
            {
                warn!(
                    index = %self.location.root().display(),
                    error = %e,
                    "rollback failed"
                );
            }
            outcome
        })
    }

    /// A fresh snapshot reflecting the last commit.
    fn snapshot(&self) -> Result<Searcher> {
        self.reader.reload()?;
        Ok(self.reader.searcher())
    }

    /// Commit pending changes and release the writer.
    fn close(&self) -> Result<()> {
        let taken = lock(&self.writer, "index writer")?.take();
        if let Some(mut writer) = taken {
            writer.commit()?;
            writer.wait_merging_threads()?;
        }
        Ok(())
    }

    /// Release the writer, dropping anything uncommitted.
    fn discard(&self) -> Result<()> {
        drop(lock(&self.writer, "index writer")?.take());
        Ok(())
    }
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct CacheState {
    writers: HashMap<IndexLocation, Arc<WriterHandle>>,
    readers: HashMap<IndexLocation, IndexReader>,
    searchers: HashMap<IndexLocation, Searcher>,
}

impl CacheState {
    fn forget(&mut self, location: &IndexLocation) {
        self.readers.remove(location);
        self.searchers.remove(location);
    }
}

/// Process-wide cache of open writers and searchers, keyed by storage
/// location. Construct one and share it; call [`IndexCache::close_all`]
/// before exit so pending commits are flushed.
pub struct IndexCache {
    memory_budget: usize,
    state: Mutex<CacheState>,
    exclusive: Mutex<HashMap<IndexLocation, Arc<Mutex<()>>>>,
}

impl IndexCache {
    pub fn new(memory_budget: usize) -> Self {
        Self {
            memory_budget,
            state: Mutex::new(CacheState::default()),
            exclusive: Mutex::new(HashMap::new()),
        }
    }

    /// Get the writer for `location`.
    ///
    /// With `force_create`, or when no index exists on disk, any cached
    /// writer is closed, the index is recreated empty and a new writer is
    /// cached. Otherwise the cached writer is reused or opened.
    pub fn get_writer(
        &self,
        location: &IndexLocation,
        force_create: bool,
    ) -> Result<Arc<WriterHandle>> {
        let mut state = lock(&self.state, "index cache")?;
        let dir = location.index_dir();

        if force_create || !tantivy_index::index_exists(&dir)? {
            if let Some(old) = state.writers.remove(location) {
                old.close()?;
            }
            state.forget(location);

            debug!(index = %dir.display(), "creating empty index");
            let index = tantivy_index::create_index(&dir)?;
            let handle = Arc::new(WriterHandle::open(
                location.clone(),
                index,
                self.memory_budget,
            )?);
            state.writers.insert(location.clone(), handle.clone());
            return Ok(handle);
        }

        if let Some(handle) = state.writers.get(location) {
            return Ok(handle.clone());
        }

        let index = tantivy_index::open_index(&dir)?;
        let handle = Arc::new(WriterHandle::open(
            location.clone(),
            index,
            self.memory_budget,
        )?);
        state.writers.insert(location.clone(), handle.clone());
        Ok(handle)
    }

    /// Get a searcher for `location`, reusing the cached snapshot when there
    /// is one. Does not commit.
    ///
    /// The snapshot comes from the cached writer when this process holds one,
    /// otherwise from a read-only reader that leaves the writer lock free
    /// for other processes. A missing index is created empty first.
    pub fn get_searcher(&self, location: &IndexLocation) -> Result<Searcher> {
        {
            let state = lock(&self.state, "index cache")?;
            if let Some(searcher) = state.searchers.get(location) {
                return Ok(searcher.clone());
            }
        }

        if !tantivy_index::index_exists(&location.index_dir())? {
            self.get_writer(location, false)?;
        }

        // Snapshot while holding the lock so an invalidation that follows a
        // commit cannot be overtaken by a stale insert.
        let mut state = lock(&self.state, "index cache")?;
        if let Some(searcher) = state.searchers.get(location) {
            return Ok(searcher.clone());
        }
        let searcher = match state.writers.get(location) {
            Some(handle) => handle.snapshot()?,
            None => {
                let reader = match state.readers.get(location) {
                    Some(reader) => reader.clone(),
                    None => {
                        let reader = open_reader(location)?;
                        state.readers.insert(location.clone(), reader.clone());
                        reader
                    }
                };
                reader.reload()?;
                reader.searcher()
            }
        };
        state.searchers.insert(location.clone(), searcher.clone());
        Ok(searcher)
    }

    /// Evict the cached searcher so the next read sees fresh commits.
    pub fn invalidate_searcher(&self, location: &IndexLocation) -> Result<()> {
        lock(&self.state, "index cache")?.searchers.remove(location);
        Ok(())
    }

    /// Close any handles for `location` without committing and remove its
    /// index directory.
    pub fn drop_index(&self, location: &IndexLocation) -> Result<()> {
        let mut state = lock(&self.state, "index cache")?;
        if let Some(old) = state.writers.remove(location) {
            old.discard()?;
        }
        state.forget(location);

        let dir = location.index_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Run `f` while holding the single-owner token for `location`.
    ///
    /// Every write-and-commit sequence against a repository goes through
    /// here, so two indexing calls for the same repository never interleave.
    pub fn exclusive<T>(
        &self,
        location: &IndexLocation,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let token = lock(&self.exclusive, "repository locks")?
            .entry(location.clone())
            .or_default()
            .clone();
        let _guard = lock(&token, "repository lock")?;
        f()
    }

    /// Close every cached writer (committing pending changes) and drop every
    /// cached searcher.
    pub fn close_all(&self) -> Result<()> {
        let mut state = lock(&self.state, "index cache")?;
        let mut first_error = None;

        for (location, handle) in state.writers.drain() {
            if let Err(e) = handle.close() {
                warn!(
                    index = %location.root().display(),
                    error = %e,
                    "failed to close index writer"
                );
                first_error.get_or_insert(e);
            }
        }
        state.readers.clear();
        state.searchers.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    fn cached_searchers(&self) -> usize {
        self.state.lock().unwrap().searchers.len()
    }

    #[cfg(test)]
    fn cached_writers(&self) -> usize {
        self.state.lock().unwrap().writers.len()
    }
}

impl std::fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCache").finish_non_exhaustive()
    }
}

fn open_reader(location: &IndexLocation) -> Result<IndexReader> {
    let index = tantivy_index::open_index(&location.index_dir())?;
    debug!(index = %location.root().display(), "opening read-only reader");
    Ok(index
        .reader_builder()
        .reload_policy(ReloadPolicy::Manual)
        .try_into()?)
}

fn lock<'a, T>(
    mutex: &'a Mutex<T>,
    what: &str,
) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|e| Error::LockPoisoned(format!("{what}: {e}")))
}
