use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The GITINDEX_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/gitindex/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("GITINDEX_DATA_DIR") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("gitindex")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join("config.redb")
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join("indexes")
    }

    /// Storage location for one repository's index and cursor record.
    ///
    /// Does not touch the filesystem.
    pub fn location(&self, repository: &str) -> IndexLocation {
        IndexLocation::new(self.indexes_dir().join(repository))
    }
}

/// Directory owning a single repository's on-disk index state.
///
/// The tantivy index lives in `tantivy/` and the branch cursor record sits
/// next to it in `cursor.redb`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexLocation {
    root: PathBuf,
}

impl IndexLocation {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("tantivy")
    }

    pub fn cursor_db(&self) -> PathBuf {
        self.root.join("cursor.redb")
    }
}

/// Check that a repository name can be used as a relative storage path.
///
/// Names may contain `/` (e.g. `group/project.git`) but must not be absolute
/// or escape the indexes directory.
pub fn validate_repository_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid repository name: '{name}'")))
    }
}
