//! gitindex - keeps full-text indexes of git repositories in sync and
//! searches across them.
//!
//! Every registered repository gets its own [Tantivy](https://github.com/quickwit-oss/tantivy)
//! index holding commits, files per branch and tracker issues. A small cursor
//! record per repository remembers the last indexed commit of every branch so
//! that updates only replay what changed since.
//!
//! # Quick start
//!
//! ```no_run
//! use std::{path::Path, sync::Arc};
//!
//! use gitindex::{DataDir, GitRepository, IndexCache, IndexSettings, Synchronizer};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let settings = IndexSettings::default();
//! let cache = Arc::new(IndexCache::new(settings.writer_memory));
//! let sync = Synchronizer::new(data_dir.clone(), cache.clone(), &settings).unwrap();
//!
//! let repo = GitRepository::open("app.git", Path::new("/srv/git/app.git")).unwrap();
//! sync.index_repository(&repo, false);
//!
//! let hits = gitindex::search::search(
//!     &cache,
//!     &data_dir,
//!     "parser",
//!     10,
//!     &["app.git".to_string()],
//! )
//! .unwrap();
//! for hit in &hits {
//!     println!("{} {} {}", hit.repository, hit.kind, hit.id);
//! }
//! cache.close_all().unwrap();
//! ```

pub mod branch_key;
pub mod config_db;
pub mod cursor;
pub mod data_dir;
pub mod document;
pub mod error;
pub mod git;
pub mod handle_cache;
pub mod registry;
pub mod scheduler;
pub mod search;
pub mod settings;
pub mod sync;
pub mod tantivy_index;
pub mod vcs;

#[cfg(test)]
mod testing;

pub use config_db::ConfigDb;
pub use cursor::{CursorStatus, CursorStore};
pub use data_dir::{DataDir, IndexLocation};
pub use error::{Error, Result};
pub use git::GitRepository;
pub use handle_cache::IndexCache;
pub use registry::{RepositoryRegistry, RepositoryResolver};
pub use scheduler::{IndexScheduler, PassSummary};
pub use search::SearchResult;
pub use settings::IndexSettings;
pub use sync::{IndexResult, Synchronizer};
