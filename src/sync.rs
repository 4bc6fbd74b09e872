//! Keeps each repository's index in step with its history.
//!
//! A repository is either rebuilt from scratch ([`Synchronizer::reindex`]) or
//! brought forward from its branch cursors ([`Synchronizer::update_index`]).
//! Both run under the repository's exclusive token so a scheduled pass and a
//! direct call never write the same index at once.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use tracing::{debug, error, info, warn};

use crate::{
    branch_key::BranchKey,
    cursor::{CursorRecord, CursorStore},
    data_dir::{DataDir, IndexLocation},
    document::{
        DocumentKey, blob_document, commit_document, is_excluded_extension,
        issue_document,
    },
    error::Result,
    handle_cache::IndexCache,
    settings::{BranchFilter, IndexSettings},
    tantivy_index::{self, IndexSession},
    vcs::{
        BranchRef, ChangeKind, CommitInfo, ISSUES_BRANCH, Issue,
        SourceRepository,
    },
};

/// Outcome of one repository pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexResult {
    pub success: bool,
    /// Commit documents written (rebuild) or commits applied (update).
    pub commit_count: usize,
}

impl IndexResult {
    fn succeeded(commit_count: usize) -> Self {
        Self {
            success: true,
            commit_count,
        }
    }

    fn failed() -> Self {
        Self {
            success: false,
            commit_count: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RebuildStats {
    commits: usize,
    blobs: usize,
    branches: usize,
    issues: usize,
}

/// Annotated tag names keyed by the hash they point at.
type TagLookup = HashMap<String, Vec<String>>;

fn tag_lookup(repo: &dyn SourceRepository) -> Result<TagLookup> {
    let mut tags: TagLookup = HashMap::new();
    for tag in repo.annotated_tags()? {
        tags.entry(tag.target).or_default().push(tag.name);
    }
    Ok(tags)
}

fn tags_for<'a>(tags: &'a TagLookup, hash: &str) -> &'a [String] {
    tags.get(hash).map(Vec::as_slice).unwrap_or_default()
}

/// For each of `hashes`, the first of `live` whose history reaches it.
/// Hashes no live branch reaches are absent from the result.
fn commit_homes(
    repo: &dyn SourceRepository,
    live: &[BranchRef],
    hashes: &BTreeSet<String>,
) -> Result<BTreeMap<String, String>> {
    let mut homes = BTreeMap::new();
    for branch in live {
        if homes.len() == hashes.len() {
            break;
        }
        for commit in repo.history(&branch.tip, None)? {
            if hashes.contains(&commit.hash) {
                homes
                    .entry(commit.hash)
                    .or_insert_with(|| branch.name.clone());
            }
        }
    }
    Ok(homes)
}

/// Issue commits carry a two-character marker before the issue id in their
/// summary, e.g. `"# 42"`.
fn issue_id(summary: &str) -> Option<String> {
    let id: String = summary.chars().skip(2).collect();
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

pub struct Synchronizer {
    data_dir: DataDir,
    cache: Arc<IndexCache>,
    cursors: CursorStore,
    excluded_extensions: BTreeSet<String>,
    branch_filter: BranchFilter,
}

impl Synchronizer {
    pub fn new(
        data_dir: DataDir,
        cache: Arc<IndexCache>,
        settings: &IndexSettings,
    ) -> Result<Self> {
        Ok(Self {
            data_dir,
            cache,
            cursors: CursorStore::new(),
            excluded_extensions: settings.excluded_extensions.clone(),
            branch_filter: settings.branch_filter()?,
        })
    }

    pub fn cache(&self) -> &Arc<IndexCache> {
        &self.cache
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn location(&self, repository: &str) -> IndexLocation {
        self.data_dir.location(repository)
    }

    pub fn should_reindex(&self, repository: &str) -> bool {
        self.cursors.should_reindex(&self.location(repository))
    }

    /// Bring `repo`'s index up to date, rebuilding when forced or when the
    /// stored state cannot be trusted.
    pub fn index_repository(
        &self,
        repo: &dyn SourceRepository,
        force_rebuild: bool,
    ) -> IndexResult {
        match repo.has_commits() {
            Ok(true) => {}
            Ok(false) => {
                info!(repository = repo.name(), "repository is empty, skipping");
                return IndexResult::succeeded(0);
            }
            Err(e) => {
                error!(
                    repository = repo.name(),
                    error = %e,
                    "cannot inspect repository"
                );
                return IndexResult::failed();
            }
        }

        if force_rebuild || self.should_reindex(repo.name()) {
            self.reindex(repo)
        } else {
            self.update_index(repo)
        }
    }

    /// Discard the repository's index and cursors and rebuild both.
    ///
    /// On failure nothing is persisted to the cursor record, so the next
    /// pass rebuilds again.
    pub fn reindex(&self, repo: &dyn SourceRepository) -> IndexResult {
        let start = Instant::now();
        let location = self.location(repo.name());

        match self
            .cache
            .exclusive(&location, || self.rebuild(repo, &location))
        {
            Ok(stats) => {
                info!(
                    repository = repo.name(),
                    commits = stats.commits,
                    files = stats.blobs,
                    branches = stats.branches,
                    issues = stats.issues,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "built index"
                );
                IndexResult::succeeded(stats.commits)
            }
            Err(e) => {
                error!(
                    repository = repo.name(),
                    error = %e,
                    "full rebuild failed"
                );
                IndexResult::failed()
            }
        }
    }

    /// Apply every commit made since the stored cursors, then drop documents
    /// of branches that no longer exist.
    pub fn update_index(&self, repo: &dyn SourceRepository) -> IndexResult {
        let start = Instant::now();
        let location = self.location(repo.name());

        match self
            .cache
            .exclusive(&location, || self.update(repo, &location))
        {
            Ok(count) => {
                if count > 0 {
                    info!(
                        repository = repo.name(),
                        commits = count,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "updated index"
                    );
                } else {
                    debug!(repository = repo.name(), "index already current");
                }
                IndexResult::succeeded(count)
            }
            Err(e) => {
                error!(
                    repository = repo.name(),
                    error = %e,
                    "incremental update failed"
                );
                IndexResult::failed()
            }
        }
    }

    /// Apply a single commit on `branch` to the index, e.g. right after a
    /// push. Branch cursors are not touched; the next
    /// [`Self::update_index`] replays from the stored cursor.
    ///
    /// Returns `false` when the branch is excluded from indexing.
    pub fn index_commit(
        &self,
        repo: &dyn SourceRepository,
        branch: &str,
        hash: &str,
    ) -> Result<bool> {
        let location = self.location(repo.name());
        self.cache.exclusive(&location, || {
            let commit = repo.commit(hash)?;
            let tags = tag_lookup(repo)?;
            self.apply_commit(
                repo,
                &location,
                branch,
                &commit,
                tags_for(&tags, hash),
            )
        })
    }

    /// Replace the indexed document for `issue`.
    pub fn index_issue(
        &self,
        repo: &dyn SourceRepository,
        issue: &Issue,
    ) -> Result<()> {
        let location = self.location(repo.name());
        self.cache.exclusive(&location, || {
            self.write_issue(&location, repo.name(), issue)
        })
    }

    /// Remove the repository's index, cursor record and storage directory.
    pub fn delete_index(&self, repository: &str) -> Result<()> {
        let location = self.location(repository);
        self.cache.exclusive(&location, || {
            self.delete_all(&location)?;
            if location.root().exists() {
                std::fs::remove_dir_all(location.root())?;
            }
            Ok(())
        })
    }

    /// Index directory first, cursor second: an interrupted delete leaves
    /// either no index or no cursor, and both force a rebuild.
    fn delete_all(&self, location: &IndexLocation) -> Result<()> {
        self.cache.drop_index(location)?;
        self.cursors.delete(location)
    }

    fn rebuild(
        &self,
        repo: &dyn SourceRepository,
        location: &IndexLocation,
    ) -> Result<RebuildStats> {
        self.delete_all(location)?;
        let writer = self.cache.get_writer(location, true)?;
        let tags = tag_lookup(repo)?;
        let branches = repo.branches()?;

        let mut record = CursorRecord::current();
        let stats = writer.transaction(|session| {
            self.write_everything(repo, session, &branches, &tags, &mut record)
        })?;

        self.cursors.save(location, &record)?;
        self.cache.invalidate_searcher(location)?;
        Ok(stats)
    }

    fn write_everything(
        &self,
        repo: &dyn SourceRepository,
        session: &mut IndexSession<'_>,
        branches: &[BranchRef],
        tags: &TagLookup,
        record: &mut CursorRecord,
    ) -> Result<RebuildStats> {
        let name = repo.name();
        let mut stats = RebuildStats::default();
        let mut seen: HashSet<String> = HashSet::new();

        for branch in branches {
            if branch.name == ISSUES_BRANCH
                || self.branch_filter.is_excluded(&branch.name)
            {
                debug!(repository = name, branch = %branch.name, "branch excluded");
                continue;
            }
            record.set_branch(&branch.name, &branch.tip);
            stats.branches += 1;

            let tip = repo.commit(&branch.tip)?;
            for path in repo.tree_paths(&branch.tip)? {
                let content = self.read_content(repo, &branch.tip, &path)?;
                session.add(&blob_document(
                    name,
                    &branch.name,
                    &path,
                    content.as_deref(),
                    &tip,
                    &self.excluded_extensions,
                ))?;
                stats.blobs += 1;
            }

            for commit in repo.history(&branch.tip, None)? {
                if !seen.insert(commit.hash.clone()) {
                    continue;
                }
                session.add(&commit_document(
                    name,
                    &branch.name,
                    &commit,
                    tags_for(tags, &commit.hash),
                ))?;
                stats.commits += 1;
            }
            debug!(
                repository = name,
                branch = %branch.name,
                commits = stats.commits,
                "branch indexed"
            );
        }

        if let Some(tracker) = repo.issues() {
            for issue in tracker.issues()? {
                session.add(&issue_document(name, &issue))?;
                stats.issues += 1;
            }
            // Every issue is now current, so incremental passes only need
            // issue commits made after this point.
            if let Some(branch) = branches.iter().find(|b| b.name == ISSUES_BRANCH)
            {
                record.set_branch(&branch.name, &branch.tip);
            }
        }

        Ok(stats)
    }

    fn update(
        &self,
        repo: &dyn SourceRepository,
        location: &IndexLocation,
    ) -> Result<usize> {
        let record = self.cursors.load(location);
        let tags = tag_lookup(repo)?;

        // Every known branch is presumed deleted until it is seen.
        let mut deleted: BTreeMap<String, BranchKey> = record
            .branches
            .iter()
            .map(|(key, cursor)| (cursor.name.clone(), key.clone()))
            .collect();
        let mut live: Vec<BranchRef> = Vec::new();
        let mut count = 0;

        for branch in repo.branches()? {
            deleted.remove(&branch.name);
            let skip = if branch.name == ISSUES_BRANCH {
                repo.issues().is_none()
            } else {
                self.branch_filter.is_excluded(&branch.name)
            };
            if skip {
                continue;
            }
            if branch.name != ISSUES_BRANCH {
                live.push(branch.clone());
            }

            let since = record
                .branch(&branch.name)
                .map(|cursor| cursor.last_commit.as_str());
            if since == Some(branch.tip.as_str()) {
                continue;
            }

            let mut commits = repo.history(&branch.tip, since)?;
            commits.reverse();
            for commit in &commits {
                self.apply_commit(
                    repo,
                    location,
                    &branch.name,
                    commit,
                    tags_for(&tags, &commit.hash),
                )?;
            }
            count += commits.len();

            self.cursors
                .update_branch(location, &branch.name, &branch.tip)?;
            debug!(
                repository = repo.name(),
                branch = %branch.name,
                commits = commits.len(),
                "branch updated"
            );
        }

        if !deleted.is_empty() {
            self.drop_deleted_branches(repo, location, &deleted, &live, &tags)?;
            let keys: Vec<BranchKey> = deleted.into_values().collect();
            self.cursors.remove_branches(location, &keys)?;
        }

        Ok(count)
    }

    /// Drop the file documents of `deleted` branches. Commits labelled with
    /// one of them move to the first live branch that still reaches them and
    /// are removed when none does.
    fn drop_deleted_branches(
        &self,
        repo: &dyn SourceRepository,
        location: &IndexLocation,
        deleted: &BTreeMap<String, BranchKey>,
        live: &[BranchRef],
        tags: &TagLookup,
    ) -> Result<()> {
        let name = repo.name();
        let searcher = self.cache.get_searcher(location)?;
        let mut labelled: BTreeSet<String> = BTreeSet::new();
        for branch in deleted.keys() {
            labelled.extend(tantivy_index::commits_on_branch(&searcher, branch)?);
        }
        let homes = commit_homes(repo, live, &labelled)?;

        let mut rehomed = Vec::new();
        for (hash, home) in &homes {
            let commit = repo.commit(hash)?;
            rehomed.push(commit_document(name, home, &commit, tags_for(tags, hash)));
        }
        let orphaned: Vec<DocumentKey> = labelled
            .iter()
            .filter(|hash| !homes.contains_key(*hash))
            .map(|hash| DocumentKey::commit(name, hash))
            .collect();

        let writer = self.cache.get_writer(location, false)?;
        writer.transaction(|session| {
            for branch in deleted.keys() {
                session.delete_branch_files(branch)?;
            }
            for doc in &rehomed {
                session.replace(doc)?;
            }
            for key in &orphaned {
                session.delete(key);
            }
            Ok(())
        })?;
        self.cache.invalidate_searcher(location)?;

        for branch in deleted.keys() {
            info!(repository = name, branch = %branch, "removed deleted branch");
        }
        debug!(
            repository = name,
            moved = rehomed.len(),
            removed = orphaned.len(),
            "relabelled commits of deleted branches"
        );
        Ok(())
    }

    /// Apply one commit: issue commits refresh their issue, ordinary commits
    /// replace the blobs they touched and their own commit document. Each
    /// call commits the writer once.
    fn apply_commit(
        &self,
        repo: &dyn SourceRepository,
        location: &IndexLocation,
        branch: &str,
        commit: &CommitInfo,
        tags: &[String],
    ) -> Result<bool> {
        if branch == ISSUES_BRANCH {
            return self.apply_issue_commit(repo, location, commit);
        }
        if self.branch_filter.is_excluded(branch) {
            return Ok(false);
        }

        let name = repo.name();
        let mut blobs = Vec::new();
        for change in repo.changed_paths(&commit.hash)? {
            let replacement = match change.kind {
                ChangeKind::Deleted => None,
                ChangeKind::Added | ChangeKind::Modified => {
                    let content =
                        self.read_content(repo, &commit.hash, &change.path)?;
                    Some(blob_document(
                        name,
                        branch,
                        &change.path,
                        content.as_deref(),
                        commit,
                        &self.excluded_extensions,
                    ))
                }
            };
            blobs.push((DocumentKey::blob(name, branch, &change.path), replacement));
        }
        // A commit already indexed from another branch keeps that label.
        let searcher = self.cache.get_searcher(location)?;
        let label = tantivy_index::stored_branch(
            &searcher,
            &DocumentKey::commit(name, &commit.hash),
        )?;
        let commit_doc = commit_document(
            name,
            label.as_deref().unwrap_or(branch),
            commit,
            tags,
        );

        let writer = self.cache.get_writer(location, false)?;
        writer.transaction(|session| {
            for (key, replacement) in &blobs {
                session.delete(key);
                if let Some(doc) = replacement {
                    session.add(doc)?;
                }
            }
            session.replace(&commit_doc)
        })?;
        self.cache.invalidate_searcher(location)?;

        debug!(
            repository = name,
            branch,
            commit = %commit.hash,
            files = blobs.len(),
            "commit applied"
        );
        Ok(true)
    }

    fn apply_issue_commit(
        &self,
        repo: &dyn SourceRepository,
        location: &IndexLocation,
        commit: &CommitInfo,
    ) -> Result<bool> {
        let Some(id) = issue_id(&commit.summary) else {
            warn!(
                repository = repo.name(),
                commit = %commit.hash,
                "issue commit without an issue id"
            );
            return Ok(false);
        };
        let Some(tracker) = repo.issues() else {
            return Ok(false);
        };

        match tracker.issue(&id)? {
            Some(issue) => self.write_issue(location, repo.name(), &issue)?,
            None => {
                let key = DocumentKey::issue(repo.name(), &id);
                let writer = self.cache.get_writer(location, false)?;
                writer.transaction(|session| {
                    session.delete(&key);
                    Ok(())
                })?;
                self.cache.invalidate_searcher(location)?;
                debug!(repository = repo.name(), issue = %id, "issue removed");
            }
        }
        Ok(true)
    }

    fn write_issue(
        &self,
        location: &IndexLocation,
        repository: &str,
        issue: &Issue,
    ) -> Result<()> {
        let doc = issue_document(repository, issue);
        let writer = self.cache.get_writer(location, false)?;
        writer.transaction(|session| session.replace(&doc))?;
        self.cache.invalidate_searcher(location)
    }

    /// Blob bytes worth indexing, or `None` for excluded extensions.
    fn read_content(
        &self,
        repo: &dyn SourceRepository,
        commit: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>> {
        if is_excluded_extension(path, &self.excluded_extensions) {
            return Ok(None);
        }
        repo.read_blob(commit, path)
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cursor::SCHEMA_VERSION,
        document::ObjectType,
        search::{SearchResult, search},
        testing::{FakeIssues, FakeRepository, issue},
    };

    struct Harness {
        _tmp: tempfile::TempDir,
        sync: Synchronizer,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_settings(IndexSettings::default())
        }

        fn with_settings(settings: IndexSettings) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
            let cache = Arc::new(IndexCache::new(15_000_000));
            let sync = Synchronizer::new(data_dir, cache, &settings).unwrap();
            Self { _tmp: tmp, sync }
        }

        fn search(&self, text: &str) -> Vec<SearchResult> {
            search(
                self.sync.cache(),
                self.sync.data_dir(),
                text,
                100,
                &["app.git".to_string()],
            )
            .unwrap()
        }

        fn ids(&self, text: &str, kind: ObjectType) -> Vec<String> {
            let mut ids: Vec<_> = self
                .search(text)
                .into_iter()
                .filter(|r| r.kind == kind)
                .map(|r| r.id)
                .collect();
            ids.sort();
            ids
        }

        /// Every hit for `text` as (kind, id, branch), sorted.
        fn documents(
            &self,
            text: &str,
        ) -> Vec<(ObjectType, String, Option<String>)> {
            let mut docs: Vec<_> = self
                .search(text)
                .into_iter()
                .map(|r| (r.kind, r.id, r.branch))
                .collect();
            docs.sort();
            docs
        }

        fn cursor(&self, branch: &str) -> Option<String> {
            self.sync
                .cursors()
                .load(&self.sync.location("app.git"))
                .branch(branch)
                .map(|c| c.last_commit.clone())
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = self.sync.cache().close_all();
        }
    }

    #[test]
    fn issue_id_strips_marker() {
        assert_eq!(issue_id("# 42").as_deref(), Some("42"));
        assert_eq!(issue_id("#:abc ").as_deref(), Some("abc"));
        assert_eq!(issue_id("#"), None);
        assert_eq!(issue_id("#  "), None);
    }

    #[test]
    fn readme_scenario() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        let c1 = repo.commit_files(
            "main",
            &[("readme.md", Some("hello world"))],
            "Add readme for the world",
        );

        assert!(h.sync.should_reindex("app.git"));
        let result = h.sync.index_repository(&repo, false);
        assert_eq!(result, IndexResult::succeeded(1));
        assert_eq!(h.cursor("refs/heads/main").as_deref(), Some(c1.as_str()));
        assert_eq!(h.ids("world", ObjectType::Blob), vec!["readme.md"]);
        assert_eq!(h.ids("readme", ObjectType::Commit), vec![c1.clone()]);

        let c2 = repo.commit_files(
            "main",
            &[("readme.md", Some("hello lucene"))],
            "Mention lucene",
        );
        assert!(h.sync.index_commit(&repo, "refs/heads/main", &c2).unwrap());
        // Direct indexing never moves the cursor.
        assert_eq!(h.cursor("refs/heads/main").as_deref(), Some(c1.as_str()));
        assert!(h.ids("world", ObjectType::Blob).is_empty());
        assert_eq!(h.ids("lucene", ObjectType::Blob), vec!["readme.md"]);

        assert!(!h.sync.should_reindex("app.git"));
        let result = h.sync.index_repository(&repo, false);
        assert_eq!(result, IndexResult::succeeded(1));
        assert_eq!(h.cursor("refs/heads/main").as_deref(), Some(c2.as_str()));

        assert_eq!(h.ids("lucene", ObjectType::Blob), vec!["readme.md"]);
        assert_eq!(h.ids("lucene", ObjectType::Commit), vec![c2]);
        assert!(h.ids("world", ObjectType::Blob).is_empty());
        assert_eq!(h.ids("world", ObjectType::Commit), vec![c1]);
        // Exactly one blob survives both applications of C2.
        assert_eq!(h.search(r#"id:"readme.md""#).len(), 1);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("alpha"))], "one");
        repo.commit_files("main", &[("b.txt", Some("beta"))], "two");
        repo.branch_from("dev", "main");
        repo.commit_files("dev", &[("c.txt", Some("gamma"))], "three");

        let first = h.sync.reindex(&repo);
        let record = h.sync.cursors().load(&h.sync.location("app.git"));
        let docs = h.search("*").len();

        let second = h.sync.reindex(&repo);
        assert_eq!(first, second);
        // Shared history is indexed once.
        assert_eq!(second.commit_count, 3);
        assert_eq!(h.sync.cursors().load(&h.sync.location("app.git")), record);
        assert_eq!(h.search("*").len(), docs);
        assert_eq!(record.schema_version, Some(SCHEMA_VERSION));
    }

    #[test]
    fn rerun_without_new_commits_applies_nothing() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("alpha"))], "one");
        h.sync.reindex(&repo);

        repo.commit_files("main", &[("a.txt", Some("alpha two"))], "two");
        assert_eq!(h.sync.update_index(&repo).commit_count, 1);
        assert_eq!(h.cursor("refs/heads/main").as_deref(), Some(repo.tip("main")));
        assert_eq!(h.sync.update_index(&repo), IndexResult::succeeded(0));
    }

    #[test]
    fn incremental_matches_rebuild() {
        let incremental = Harness::new();
        let rebuilt = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files(
            "main",
            &[("src/lib.rs", Some("fn parse() {}")), ("notes.txt", Some("draft"))],
            "initial",
        );
        incremental.sync.reindex(&repo);

        repo.commit_files("main", &[("notes.txt", None)], "drop notes");
        repo.branch_from("feature", "main");
        repo.commit_files(
            "feature",
            &[("src/lib.rs", Some("fn parse() {} fn render() {}"))],
            "render",
        );
        repo.commit_files("main", &[("docs/guide.md", Some("render guide"))], "docs");

        assert!(incremental.sync.update_index(&repo).success);
        assert!(rebuilt.sync.reindex(&repo).success);

        // Shared commits are labelled with whichever branch reached them
        // first, which differs between the two paths.
        let unlabelled = |h: &Harness, query: &str| {
            let mut docs: Vec<_> = h
                .documents(query)
                .into_iter()
                .map(|(kind, id, branch)| match kind {
                    ObjectType::Commit => (kind, id, None),
                    _ => (kind, id, branch),
                })
                .collect();
            docs.sort();
            docs
        };
        for query in ["render", "parse", "draft", "guide", "*"] {
            assert_eq!(
                unlabelled(&incremental, query),
                unlabelled(&rebuilt, query),
                "query {query}"
            );
        }

        // Either label is fine as long as the branch still exists.
        let live = [Some("refs/heads/main"), Some("refs/heads/feature")];
        for h in [&incremental, &rebuilt] {
            for hit in h.search("*") {
                if hit.kind == ObjectType::Commit {
                    assert!(live.contains(&hit.branch.as_deref()), "{hit:?}");
                }
            }
        }
    }

    #[test]
    fn fast_forwarded_branch_deletion_keeps_history() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        let base = repo.commit_files("main", &[("a.txt", Some("base"))], "base");
        h.sync.reindex(&repo);

        repo.branch_from("feature", "main");
        let work = repo.commit_files(
            "feature",
            &[("b.txt", Some("feature work"))],
            "feature work",
        );
        assert!(h.sync.update_index(&repo).success);

        repo.reset_branch("main", &work);
        assert!(h.sync.update_index(&repo).success);
        repo.delete_branch("feature");
        assert!(h.sync.update_index(&repo).success);

        let main = Some("refs/heads/main".to_string());
        let mut commits: Vec<_> = h
            .search("*")
            .into_iter()
            .filter(|r| r.kind == ObjectType::Commit)
            .map(|r| (r.id, r.branch))
            .collect();
        commits.sort();
        assert_eq!(commits, vec![(base, main.clone()), (work, main)]);
        assert_eq!(h.ids("work", ObjectType::Blob), vec!["b.txt"]);

        let rebuilt = Harness::new();
        rebuilt.sync.reindex(&repo);
        assert_eq!(h.documents("*"), rebuilt.documents("*"));
    }

    #[test]
    fn unreachable_commits_leave_with_their_branch() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("base"))], "base");
        repo.branch_from("spike", "main");
        let spike =
            repo.commit_files("spike", &[("s.txt", Some("dead end"))], "dead end");
        h.sync.reindex(&repo);
        assert_eq!(h.ids("dead", ObjectType::Commit), vec![spike]);

        repo.delete_branch("spike");
        assert!(h.sync.update_index(&repo).success);
        assert!(h.ids("dead", ObjectType::Commit).is_empty());
        assert_eq!(h.ids("base", ObjectType::Commit).len(), 1);
    }

    #[test]
    fn concurrent_direct_and_incremental_indexing() {
        let h = Arc::new(Harness::new());
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("log.txt", Some("entry zero"))], "zero");
        h.sync.reindex(&repo);

        let mut hashes = Vec::new();
        for n in ["one", "two", "three"] {
            let content = format!("entry {n}");
            hashes.push(repo.commit_files(
                "main",
                &[("log.txt", Some(content.as_str()))],
                n,
            ));
        }
        let tip = repo.tip("main").to_string();

        let direct = {
            let h = h.clone();
            let repo = repo.clone();
            std::thread::spawn(move || {
                h.sync.index_commit(&repo, "refs/heads/main", &tip).unwrap()
            })
        };
        let incremental = {
            let h = h.clone();
            let repo = repo.clone();
            std::thread::spawn(move || h.sync.update_index(&repo))
        };
        assert!(direct.join().unwrap());
        assert_eq!(incremental.join().unwrap(), IndexResult::succeeded(3));

        let blobs: Vec<_> = h
            .search(r#"id:"log.txt""#)
            .into_iter()
            .filter(|r| r.kind == ObjectType::Blob)
            .collect();
        assert_eq!(blobs.len(), 1);
        assert_eq!(h.ids("three", ObjectType::Blob), vec!["log.txt"]);
        assert!(h.ids("one", ObjectType::Blob).is_empty());

        let commits = h.ids("*", ObjectType::Commit);
        assert_eq!(commits.len(), 4);
        for hash in &hashes {
            assert!(commits.contains(hash), "missing {hash}");
        }
        assert_eq!(h.cursor("refs/heads/main").as_deref(), Some(repo.tip("main")));
    }

    #[test]
    fn deleted_branch_documents_are_removed() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("shared"))], "base");
        repo.branch_from("topic", "main");
        repo.commit_files("topic", &[("topic.txt", Some("experimental"))], "topic work");
        h.sync.reindex(&repo);
        assert_eq!(h.ids("experimental", ObjectType::Blob), vec!["topic.txt"]);

        repo.delete_branch("topic");
        assert!(h.sync.update_index(&repo).success);

        assert!(
            h.search("*")
                .iter()
                .all(|r| r.branch.as_deref() != Some("refs/heads/topic"))
        );
        assert!(h.ids("experimental", ObjectType::Blob).is_empty());
        assert!(h.cursor("refs/heads/topic").is_none());
        assert_eq!(h.ids("shared", ObjectType::Blob), vec!["a.txt"]);
    }

    #[test]
    fn file_modified_twice_leaves_one_blob() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("config.toml", Some("version one"))], "v1");
        h.sync.reindex(&repo);

        repo.commit_files("main", &[("config.toml", Some("version two"))], "v2");
        repo.commit_files("main", &[("config.toml", Some("version three"))], "v3");
        assert_eq!(h.sync.update_index(&repo).commit_count, 2);

        let blobs: Vec<_> = h
            .search(r#"id:"config.toml""#)
            .into_iter()
            .filter(|r| r.kind == ObjectType::Blob)
            .collect();
        assert_eq!(blobs.len(), 1);
        assert_eq!(h.ids("three", ObjectType::Blob), vec!["config.toml"]);
        assert!(h.ids("two", ObjectType::Blob).is_empty());
    }

    #[test]
    fn excluded_extension_keeps_metadata_only() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_raw(
            "main",
            vec![(
                "assets/logo.png".to_string(),
                Some(b"pixels and more pixels".to_vec()),
            )],
            "logo",
        );
        h.sync.reindex(&repo);

        assert!(h.ids("pixels", ObjectType::Blob).is_empty());
        assert_eq!(
            h.ids(r#"id:"assets/logo.png""#, ObjectType::Blob),
            vec!["assets/logo.png"]
        );
    }

    #[test]
    fn tags_label_commits() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        let c1 = repo.commit_files("main", &[("a.txt", Some("a"))], "release prep");
        repo.tag("v1.0", &c1);
        h.sync.reindex(&repo);

        let results = h.search("release");
        let commit = results
            .iter()
            .find(|r| r.kind == ObjectType::Commit)
            .unwrap();
        assert_eq!(commit.labels, vec!["v1.0"]);
    }

    #[test]
    fn excluded_branches_are_skipped() {
        let mut settings = IndexSettings::default();
        settings.excluded_branches.push("refs/heads/wip/*".to_string());
        let h = Harness::with_settings(settings);

        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("stable"))], "base");
        repo.branch_from("wip/spike", "main");
        repo.commit_files("wip/spike", &[("spike.txt", Some("scratch"))], "spike");
        h.sync.reindex(&repo);

        assert!(h.ids("scratch", ObjectType::Blob).is_empty());
        assert!(h.cursor("refs/heads/wip/spike").is_none());

        repo.commit_files("wip/spike", &[("more.txt", Some("scratch"))], "more");
        h.sync.update_index(&repo);
        assert!(h.ids("scratch", ObjectType::Blob).is_empty());
        assert!(
            !h.sync
                .index_commit(&repo, "refs/heads/wip/spike", repo.tip("wip/spike"))
                .unwrap()
        );
    }

    #[test]
    fn issues_are_indexed_and_refreshed() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("code"))], "base");
        let mut issues = FakeIssues::default();
        issues.insert(issue("1", "Crash on startup", "segfault in init"));
        repo.set_issues(issues);
        repo.touch_issue("1");

        h.sync.reindex(&repo);
        assert_eq!(h.ids("segfault", ObjectType::Issue), vec!["1"]);
        // The issues branch itself is never indexed as code.
        assert!(h.ids("*", ObjectType::Blob).iter().all(|id| id == "a.txt"));
        assert_eq!(
            h.cursor(ISSUES_BRANCH).as_deref(),
            Some(repo.tip(ISSUES_BRANCH))
        );

        repo.issues_mut()
            .insert(issue("1", "Crash on startup", "null pointer in init"));
        repo.issues_mut().insert(issue("2", "Slow search", "takes minutes"));
        repo.touch_issue("1");
        repo.touch_issue("2");
        h.sync.update_index(&repo);

        assert!(h.ids("segfault", ObjectType::Issue).is_empty());
        assert_eq!(h.ids("pointer", ObjectType::Issue), vec!["1"]);
        assert_eq!(h.ids("minutes", ObjectType::Issue), vec!["2"]);

        repo.issues_mut().remove("2");
        let removal = repo.touch_issue("2");
        assert!(h.sync.index_commit(&repo, ISSUES_BRANCH, &removal).unwrap());
        assert!(h.ids("minutes", ObjectType::Issue).is_empty());
    }

    #[test]
    fn index_issue_replaces_document() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("a"))], "base");
        h.sync.reindex(&repo);

        h.sync
            .index_issue(&repo, &issue("7", "Typo", "speling mistake"))
            .unwrap();
        h.sync
            .index_issue(&repo, &issue("7", "Typo", "spelling fixed"))
            .unwrap();

        assert!(h.ids("speling", ObjectType::Issue).is_empty());
        assert_eq!(h.ids("fixed", ObjectType::Issue), vec!["7"]);
    }

    #[test]
    fn empty_repository_is_skipped() {
        let h = Harness::new();
        let repo = FakeRepository::new("app.git");

        assert_eq!(h.sync.index_repository(&repo, false), IndexResult::succeeded(0));
        assert!(!h.sync.location("app.git").index_dir().exists());
    }

    #[test]
    fn failed_rebuild_persists_no_cursor() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("a"))], "base");
        // A branch pointing at a commit that does not exist.
        repo.reset_branch("broken", "ffffffffffffffffffffffffffffffffffffffff");

        let result = h.sync.reindex(&repo);
        assert!(!result.success);
        assert!(h.cursor("refs/heads/main").is_none());
        assert!(h.sync.should_reindex("app.git"));

        repo.delete_branch("broken");
        assert!(h.sync.index_repository(&repo, false).success);
        assert!(!h.sync.should_reindex("app.git"));
    }

    #[test]
    fn force_rebuild_discards_stale_documents() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("original"))], "base");
        h.sync.reindex(&repo);

        // Rewrite history so the cursor commit vanishes from the branch.
        let mut rewritten = FakeRepository::new("app.git");
        rewritten.commit_files("main", &[("b.txt", Some("replacement"))], "new root");

        assert!(h.sync.index_repository(&rewritten, true).success);
        assert!(h.ids("original", ObjectType::Blob).is_empty());
        assert_eq!(h.ids("replacement", ObjectType::Blob), vec!["b.txt"]);
    }

    #[test]
    fn delete_index_removes_storage() {
        let h = Harness::new();
        let mut repo = FakeRepository::new("app.git");
        repo.commit_files("main", &[("a.txt", Some("a"))], "base");
        h.sync.reindex(&repo);

        let location = h.sync.location("app.git");
        h.sync.delete_index("app.git").unwrap();
        assert!(!location.root().exists());
        assert!(h.sync.should_reindex("app.git"));
        assert!(h.sync.cursors().load(&location).branches.is_empty());
        assert!(!location.cursor_db().exists());
    }
}
