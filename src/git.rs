use std::path::Path;

use git2::{
    BranchType, Commit, Delta, ErrorCode, FileMode, ObjectType, Oid,
    Repository, Sort, TreeWalkMode, TreeWalkResult,
};
use tracing::warn;

use crate::{
    error::Result,
    vcs::{
        BranchRef, ChangeKind, CommitInfo, ISSUES_BRANCH, IssueTracker,
        PathChange, SourceRepository, TagRef,
    },
};

/// A repository on disk read through libgit2.
pub struct GitRepository {
    name: String,
    repo: Repository,
    issues: Option<Box<dyn IssueTracker>>,
}

impl GitRepository {
    /// Open the repository at `path` (bare or with a work tree) under the
    /// given index name.
    pub fn open(name: &str, path: &Path) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            repo: Repository::open(path)?,
            issues: None,
        })
    }

    /// Attach an issue tracker. It is only consulted while the repository
    /// has an issues branch.
    pub fn with_issues(mut self, tracker: Box<dyn IssueTracker>) -> Self {
        self.issues = Some(tracker);
        self
    }

    fn has_issues_branch(&self) -> bool {
        self.repo.find_reference(ISSUES_BRANCH).is_ok()
    }

    fn find_commit(&self, hash: &str) -> Result<Commit<'_>> {
        Ok(self.repo.find_commit(Oid::from_str(hash)?)?)
    }
}

fn commit_info(commit: &Commit<'_>) -> CommitInfo {
    let author = commit.author();
    let committer = commit.committer();
    CommitInfo {
        hash: commit.id().to_string(),
        author: String::from_utf8_lossy(author.name_bytes()).into_owned(),
        committer: String::from_utf8_lossy(committer.name_bytes())
            .into_owned(),
        time: commit.time().seconds(),
        summary: commit.summary().unwrap_or_default().to_string(),
        message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
    }
}

impl SourceRepository for GitRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_commits(&self) -> Result<bool> {
        match self.repo.head() {
            Ok(_) => Ok(true),
            // HEAD may name a branch that was never created while other
            // branches hold commits.
            Err(e)
                if matches!(
                    e.code(),
                    ErrorCode::UnbornBranch | ErrorCode::NotFound
                ) =>
            {
                Ok(!self.branches()?.is_empty())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn branches(&self) -> Result<Vec<BranchRef>> {
        let mut branches = Vec::new();
        for entry in self.repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            let reference = branch.get();
            let Some(name) = reference.name() else {
                warn!(repository = %self.name, "skipping branch with non-UTF-8 name");
                continue;
            };
            let tip = reference.peel_to_commit()?.id().to_string();
            branches.push(BranchRef {
                name: name.to_string(),
                tip,
            });
        }
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    fn annotated_tags(&self) -> Result<Vec<TagRef>> {
        let mut tags = Vec::new();
        for name in self.repo.tag_names(None)?.iter().flatten() {
            let reference =
                self.repo.find_reference(&format!("refs/tags/{name}"))?;
            let Some(oid) = reference.target() else {
                continue;
            };
            // Lightweight tags point straight at a commit.
            let object = self.repo.find_object(oid, None)?;
            if let Some(tag) = object.as_tag() {
                tags.push(TagRef {
                    name: tag.name().unwrap_or(name).to_string(),
                    target: tag.target_id().to_string(),
                });
            }
        }
        Ok(tags)
    }

    fn history(
        &self,
        tip: &str,
        since: Option<&str>,
    ) -> Result<Vec<CommitInfo>> {
        let mut walk = self.repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        walk.push(Oid::from_str(tip)?)?;

        if let Some(since) = since {
            let hidden = Oid::from_str(since).and_then(|oid| {
                self.repo.find_commit(oid)?;
                walk.hide(oid)
            });
            if let Err(e) = hidden {
                warn!(
                    repository = %self.name,
                    commit = since,
                    error = %e,
                    "cursor commit no longer exists, walking full history"
                );
            }
        }

        let mut commits = Vec::new();
        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            commits.push(commit_info(&commit));
        }
        Ok(commits)
    }

    fn commit(&self, hash: &str) -> Result<CommitInfo> {
        Ok(commit_info(&self.find_commit(hash)?))
    }

    fn changed_paths(&self, commit: &str) -> Result<Vec<PathChange>> {
        let commit = self.find_commit(commit)?;
        let tree = commit.tree()?;
        let parent_tree = match commit.parent_count() {
            0 => None,
            _ => Some(commit.parent(0)?.tree()?),
        };
        let diff =
            self.repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let (file, kind) = match delta.status() {
                Delta::Added | Delta::Copied => {
                    (delta.new_file(), ChangeKind::Added)
                }
                Delta::Deleted => (delta.old_file(), ChangeKind::Deleted),
                Delta::Modified | Delta::Typechange | Delta::Renamed => {
                    (delta.new_file(), ChangeKind::Modified)
                }
                _ => continue,
            };
            if file.mode() == FileMode::Commit {
                continue;
            }
            if let Some(path) = file.path() {
                changes.push(PathChange {
                    path: path.to_string_lossy().into_owned(),
                    kind,
                });
            }
        }
        Ok(changes)
    }

    fn tree_paths(&self, commit: &str) -> Result<Vec<String>> {
        let tree = self.find_commit(commit)?.tree()?;
        let mut paths = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob)
                && let Some(name) = entry.name()
            {
                paths.push(format!("{root}{name}"));
            }
            TreeWalkResult::Ok
        })?;
        paths.sort();
        Ok(paths)
    }

    fn read_blob(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.find_commit(commit)?.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Ok(None);
        }
        let blob = self.repo.find_blob(entry.id())?;
        Ok(Some(blob.content().to_vec()))
    }

    fn issues(&self) -> Option<&dyn IssueTracker> {
        if self.has_issues_branch() {
            self.issues.as_deref()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("name", &self.name)
            .field("path", &self.repo.path())
            .finish_non_exhaustive()
    }
}
