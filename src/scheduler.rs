//! Background indexing queue.
//!
//! Repository names are queued by [`IndexScheduler::enqueue`] (for example
//! after a push) and drained by [`IndexScheduler::run_pass`]. The first pass,
//! and every pass in polling mode, queues every known repository.
//! [`IndexScheduler::spawn`] drives passes on a tokio interval.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    registry::RepositoryResolver,
    settings::IndexSettings,
    sync::Synchronizer,
};

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub indexed: usize,
    /// Names that could not be resolved to a repository.
    pub skipped: usize,
    pub failed: usize,
}

impl PassSummary {
    pub fn total(&self) -> usize {
        self.indexed + self.skipped + self.failed
    }
}

pub struct IndexScheduler {
    synchronizer: Arc<Synchronizer>,
    resolver: Arc<dyn RepositoryResolver + Send + Sync>,
    queue: Mutex<VecDeque<String>>,
    first_run: AtomicBool,
    enabled: bool,
    polling: bool,
    interval: Duration,
}

impl IndexScheduler {
    pub fn new(
        synchronizer: Arc<Synchronizer>,
        resolver: Arc<dyn RepositoryResolver + Send + Sync>,
        settings: &IndexSettings,
    ) -> Self {
        Self {
            synchronizer,
            resolver,
            queue: Mutex::new(VecDeque::new()),
            first_run: AtomicBool::new(true),
            enabled: settings.enabled,
            polling: settings.polling,
            interval: settings.interval,
        }
    }

    /// Queue `repository` for the next pass. Returns `false` without
    /// queueing when indexing is disabled.
    pub fn enqueue(&self, repository: &str) -> Result<bool> {
        if !self.enabled {
            debug!(repository, "indexing disabled, not queueing");
            return Ok(false);
        }
        self.queue()?.push_back(repository.to_string());
        Ok(true)
    }

    pub fn has_empty_queue(&self) -> Result<bool> {
        Ok(self.queue()?.is_empty())
    }

    /// Drain the queue, indexing each repository at most once.
    ///
    /// A name that cannot be resolved is logged and skipped; the rest of the
    /// queue is still processed.
    pub fn run_pass(&self) -> Result<PassSummary> {
        if !self.enabled {
            return Ok(PassSummary::default());
        }

        let first = self.first_run.swap(false, Ordering::SeqCst);
        if first || self.polling {
            let names = self.resolver.repository_names()?;
            self.queue()?.extend(names);
        }

        let start = Instant::now();
        let mut processed: HashSet<String> = HashSet::new();
        let mut summary = PassSummary::default();

        loop {
            let Some(name) = self.queue()?.pop_front() else {
                break;
            };
            if !processed.insert(name.clone()) {
                continue;
            }

            let repo = match self.resolver.open(&name) {
                Ok(Some(repo)) => repo,
                Ok(None) => {
                    warn!(repository = %name, "repository not found, skipping");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(
                        repository = %name,
                        error = %e,
                        "cannot open repository, skipping"
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            let result = self.synchronizer.index_repository(repo.as_ref(), false);
            if result.success {
                summary.indexed += 1;
            } else {
                summary.failed += 1;
            }
        }

        if summary.total() > 0 {
            info!(
                indexed = summary.indexed,
                skipped = summary.skipped,
                failed = summary.failed,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "indexing pass complete"
            );
        }
        Ok(summary)
    }

    /// Run passes every configured interval until `shutdown` is cancelled.
    ///
    /// Passes run on the blocking pool. A pass in progress when `shutdown`
    /// fires runs to completion.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.enabled {
                info!("indexing disabled, scheduler not started");
                return;
            }

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.interval.as_secs(),
                polling = self.polling,
                "indexing scheduler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let scheduler = self.clone();
                        let pass = tokio::task::spawn_blocking(move || {
                            scheduler.run_pass()
                        });
                        match pass.await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!(error = %e, "indexing pass failed"),
                            Err(e) => error!(error = %e, "indexing pass panicked"),
                        }
                    }
                }
            }
            info!("indexing scheduler stopped");
        })
    }

    fn queue(&self) -> Result<MutexGuard<'_, VecDeque<String>>> {
        self.queue
            .lock()
            .map_err(|e| Error::LockPoisoned(format!("index queue: {e}")))
    }
}

impl std::fmt::Debug for IndexScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexScheduler")
            .field("enabled", &self.enabled)
            .field("polling", &self.polling)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        data_dir::DataDir,
        handle_cache::IndexCache,
        testing::FakeRepository,
        vcs::SourceRepository,
    };

    #[derive(Default)]
    struct FakeResolver {
        repos: Mutex<BTreeMap<String, FakeRepository>>,
        opened: Mutex<Vec<String>>,
    }

    impl FakeResolver {
        fn add(&self, repo: FakeRepository) {
            let name = repo.name().to_string();
            self.repos.lock().unwrap().insert(name, repo);
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    impl RepositoryResolver for FakeResolver {
        fn repository_names(&self) -> Result<Vec<String>> {
            Ok(self.repos.lock().unwrap().keys().cloned().collect())
        }

        fn open(
            &self,
            name: &str,
        ) -> Result<Option<Box<dyn SourceRepository>>> {
            self.opened.lock().unwrap().push(name.to_string());
            Ok(self
                .repos
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .map(|r| Box::new(r) as Box<dyn SourceRepository>))
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        sync: Arc<Synchronizer>,
        resolver: Arc<FakeResolver>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
            let cache = Arc::new(IndexCache::new(15_000_000));
            let sync = Arc::new(
                Synchronizer::new(data_dir, cache, &IndexSettings::default())
                    .unwrap(),
            );
            let resolver = Arc::new(FakeResolver::default());
            for name in ["a.git", "b.git"] {
                let mut repo = FakeRepository::new(name);
                repo.commit_files("main", &[("readme.md", Some(name))], "init");
                resolver.add(repo);
            }
            Self {
                _tmp: tmp,
                sync,
                resolver,
            }
        }

        fn scheduler(&self, settings: &IndexSettings) -> Arc<IndexScheduler> {
            Arc::new(IndexScheduler::new(
                self.sync.clone(),
                self.resolver.clone(),
                settings,
            ))
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = self.sync.cache().close_all();
        }
    }

    #[test]
    fn first_pass_indexes_everything_once() {
        let fx = Fixture::new();
        let scheduler = fx.scheduler(&IndexSettings::default());

        let summary = scheduler.run_pass().unwrap();
        assert_eq!(summary.indexed, 2);
        assert!(!fx.sync.should_reindex("a.git"));
        assert!(!fx.sync.should_reindex("b.git"));

        // Without polling, later passes only see explicit requests.
        assert_eq!(scheduler.run_pass().unwrap(), PassSummary::default());
    }

    #[test]
    fn repeated_requests_are_deduplicated() {
        let fx = Fixture::new();
        let scheduler = fx.scheduler(&IndexSettings::default());
        scheduler.run_pass().unwrap();
        let before = fx.resolver.opened().len();

        assert!(scheduler.enqueue("a.git").unwrap());
        assert!(scheduler.enqueue("a.git").unwrap());
        assert!(scheduler.enqueue("a.git").unwrap());
        assert!(!scheduler.has_empty_queue().unwrap());

        let summary = scheduler.run_pass().unwrap();
        assert_eq!(summary.indexed, 1);
        assert_eq!(fx.resolver.opened()[before..], ["a.git".to_string()]);
        assert!(scheduler.has_empty_queue().unwrap());
    }

    #[test]
    fn polling_requeues_every_pass() {
        let fx = Fixture::new();
        let settings = IndexSettings {
            polling: true,
            ..IndexSettings::default()
        };
        let scheduler = fx.scheduler(&settings);

        assert_eq!(scheduler.run_pass().unwrap().indexed, 2);
        assert_eq!(scheduler.run_pass().unwrap().indexed, 2);
    }

    #[test]
    fn unknown_repository_is_skipped() {
        let fx = Fixture::new();
        let scheduler = fx.scheduler(&IndexSettings::default());
        scheduler.enqueue("ghost.git").unwrap();

        let summary = scheduler.run_pass().unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.indexed, 2);
    }

    #[test]
    fn disabled_scheduler_ignores_requests() {
        let fx = Fixture::new();
        let settings = IndexSettings {
            enabled: false,
            ..IndexSettings::default()
        };
        let scheduler = fx.scheduler(&settings);

        assert!(!scheduler.enqueue("a.git").unwrap());
        assert!(scheduler.has_empty_queue().unwrap());
        assert_eq!(scheduler.run_pass().unwrap(), PassSummary::default());
        assert!(fx.sync.should_reindex("a.git"));
    }

    #[tokio::test]
    async fn driver_runs_until_cancelled() {
        let fx = Fixture::new();
        let settings = IndexSettings {
            interval: Duration::from_millis(20),
            ..IndexSettings::default()
        };
        let scheduler = fx.scheduler(&settings);
        let shutdown = CancellationToken::new();
        let handle = scheduler.clone().spawn(shutdown.clone());

        let deadline = Instant::now() + Duration::from_secs(30);
        while fx.sync.should_reindex("b.git") {
            assert!(Instant::now() < deadline, "driver never indexed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();
        assert!(scheduler.has_empty_queue().unwrap());
    }
}
