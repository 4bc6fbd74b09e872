use std::{path::Path, sync::Arc};

use crate::{
    config_db::ConfigDb,
    error::Result,
    git::GitRepository,
    vcs::SourceRepository,
};

/// Maps repository names to live repository handles.
pub trait RepositoryResolver {
    /// Every name known to the resolver, ordered.
    fn repository_names(&self) -> Result<Vec<String>>;

    /// Open `name`. `Ok(None)` when the name is not registered.
    fn open(&self, name: &str) -> Result<Option<Box<dyn SourceRepository>>>;
}

/// Resolves names registered in `config.redb` to git repositories on disk.
#[derive(Debug, Clone)]
pub struct RepositoryRegistry {
    config_db: Arc<ConfigDb>,
}

impl RepositoryRegistry {
    pub fn new(config_db: Arc<ConfigDb>) -> Self {
        Self { config_db }
    }
}

impl RepositoryResolver for RepositoryRegistry {
    fn repository_names(&self) -> Result<Vec<String>> {
        Ok(self
            .config_db
            .list_repositories()?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    fn open(&self, name: &str) -> Result<Option<Box<dyn SourceRepository>>> {
        let Some(path) = self.config_db.get_repository(name)? else {
            return Ok(None);
        };
        let repo = GitRepository::open(name, Path::new(&path))?;
        Ok(Some(Box::new(repo)))
    }
}
