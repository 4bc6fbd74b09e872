//! Per-repository branch cursors.
//!
//! Each repository's storage location holds a `cursor.redb` file recording
//! the index schema version and, for every indexed branch, the last commit
//! reflected in the index. The file is opened only for the duration of a
//! single read or write.

use std::{collections::BTreeMap, sync::Mutex};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, info, warn};

use crate::{
    branch_key::BranchKey,
    data_dir::IndexLocation,
    error::{Error, Result},
    tantivy_index,
};

/// Bump whenever the index schema or document layout changes. A mismatch
/// forces a full rebuild.
pub const SCHEMA_VERSION: u64 = 1;

const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
/// branch key -> (branch name, last indexed commit)
const BRANCHES: TableDefinition<&str, (&str, &str)> =
    TableDefinition::new("branches");

const SCHEMA_VERSION_KEY: &str = "schema_version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchCursor {
    pub name: String,
    pub last_commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorRecord {
    pub schema_version: Option<u64>,
    pub branches: BTreeMap<BranchKey, BranchCursor>,
}

impl CursorRecord {
    /// An empty record stamped with the current schema version.
    pub fn current() -> Self {
        Self {
            schema_version: Some(SCHEMA_VERSION),
            branches: BTreeMap::new(),
        }
    }

    pub fn set_branch(&mut self, name: &str, last_commit: &str) {
        self.branches.insert(
            BranchKey::new(name),
            BranchCursor {
                name: name.to_string(),
                last_commit: last_commit.to_string(),
            },
        );
    }

    pub fn branch(&self, name: &str) -> Option<&BranchCursor> {
        self.branches.get(&BranchKey::new(name))
    }
}

/// Why a repository does or does not need a full rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorStatus {
    Current,
    /// Never indexed: no cursor file.
    Missing,
    /// The record exists but was written by a different schema version, or
    /// carries none.
    Stale { found: Option<u64> },
    /// The cursor file exists but could not be read.
    Unreadable(String),
}

#[derive(Debug, Default)]
pub struct CursorStore {
    // redb refuses to open the same file twice in one process.
    io: Mutex<()>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the record for `location`. Missing or unreadable records load as
    /// empty, which forces a rebuild.
    pub fn load(&self, location: &IndexLocation) -> CursorRecord {
        match self.read(location) {
            Ok(Some(record)) => record,
            Ok(None) => CursorRecord::default(),
            Err(e) => {
                warn!(
                    cursor = %location.cursor_db().display(),
                    error = %e,
                    "unreadable cursor record, treating as empty"
                );
                CursorRecord::default()
            }
        }
    }

    /// Replace the stored record with `record`.
    pub fn save(
        &self,
        location: &IndexLocation,
        record: &CursorRecord,
    ) -> Result<()> {
        let _io = self.lock()?;
        std::fs::create_dir_all(location.root())?;
        let db = Database::create(location.cursor_db())?;

        let txn = db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            match record.schema_version {
                Some(version) => {
                    meta.insert(SCHEMA_VERSION_KEY, version)?;
                }
                None => {
                    meta.remove(SCHEMA_VERSION_KEY)?;
                }
            }
        }
        txn.delete_table(BRANCHES)?;
        {
            let mut branches = txn.open_table(BRANCHES)?;
            for (key, cursor) in &record.branches {
                branches.insert(
                    key.as_str(),
                    (cursor.name.as_str(), cursor.last_commit.as_str()),
                )?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Record that `branch` is indexed up to `last_commit`.
    pub fn update_branch(
        &self,
        location: &IndexLocation,
        branch: &str,
        last_commit: &str,
    ) -> Result<()> {
        let _io = self.lock()?;
        std::fs::create_dir_all(location.root())?;
        let db = Database::create(location.cursor_db())?;

        let key = BranchKey::new(branch);
        let txn = db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
            let mut branches = txn.open_table(BRANCHES)?;
            branches.insert(key.as_str(), (branch, last_commit))?;
        }
        txn.commit()?;
        debug!(branch, key = key.short(), commit = last_commit, "cursor advanced");
        Ok(())
    }

    /// Forget the cursors for branches that no longer exist.
    pub fn remove_branches(
        &self,
        location: &IndexLocation,
        keys: &[BranchKey],
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let _io = self.lock()?;
        let db = Database::create(location.cursor_db())?;
        let txn = db.begin_write()?;
        {
            let mut branches = txn.open_table(BRANCHES)?;
            for key in keys {
                branches.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn status(&self, location: &IndexLocation) -> CursorStatus {
        match self.read(location) {
            Ok(None) => CursorStatus::Missing,
            Ok(Some(record)) if record.schema_version == Some(SCHEMA_VERSION) => {
                CursorStatus::Current
            }
            Ok(Some(record)) => CursorStatus::Stale {
                found: record.schema_version,
            },
            Err(e) => CursorStatus::Unreadable(e.to_string()),
        }
    }

    /// True when the repository must be rebuilt from scratch.
    ///
    /// Any doubt about the stored state (no record, a different schema
    /// version, an unreadable file, or a missing index directory) answers
    /// yes. Each cause is logged separately.
    pub fn should_reindex(&self, location: &IndexLocation) -> bool {
        let name = location.root().display();
        match self.status(location) {
            CursorStatus::Current => {}
            CursorStatus::Missing => {
                info!(repository = %name, "no cursor record, full rebuild");
                return true;
            }
            CursorStatus::Stale { found } => {
                info!(
                    repository = %name,
                    found = ?found,
                    expected = SCHEMA_VERSION,
                    "index schema changed, full rebuild"
                );
                return true;
            }
            CursorStatus::Unreadable(error) => {
                warn!(
                    repository = %name,
                    error = %error,
                    "cursor record unreadable, full rebuild"
                );
                return true;
            }
        }

        match tantivy_index::index_exists(&location.index_dir()) {
            Ok(true) => false,
            Ok(false) => {
                info!(repository = %name, "index missing, full rebuild");
                true
            }
            Err(e) => {
                warn!(
                    repository = %name,
                    error = %e,
                    "cannot inspect index directory, full rebuild"
                );
                true
            }
        }
    }

    /// Remove the cursor file. Callers delete the index directory first, so
    /// an interrupted delete still leaves [`Self::should_reindex`] true.
    pub fn delete(&self, location: &IndexLocation) -> Result<()> {
        let _io = self.lock()?;
        let path = location.cursor_db();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn read(&self, location: &IndexLocation) -> Result<Option<CursorRecord>> {
        let _io = self.lock()?;
        let path = location.cursor_db();
        if !path.exists() {
            return Ok(None);
        }

        let db = Database::open(&path)?;
        let txn = db.begin_read()?;
        let mut record = CursorRecord::default();

        match txn.open_table(META) {
            Ok(meta) => {
                record.schema_version =
                    meta.get(SCHEMA_VERSION_KEY)?.map(|v| v.value());
            }
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(e.into()),
        }

        match txn.open_table(BRANCHES) {
            Ok(branches) => {
                for entry in branches.iter()? {
                    let (key, value) = entry?;
                    let (name, last_commit) = value.value();
                    record.branches.insert(
                        BranchKey::from_stored(key.value()),
                        BranchCursor {
                            name: name.to_string(),
                            last_commit: last_commit.to_string(),
                        },
                    );
                }
            }
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Some(record))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.io
            .lock()
            .map_err(|e| Error::LockPoisoned(format!("cursor store: {e}")))
    }
}
