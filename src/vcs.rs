//! Interfaces to the version-control and issue-tracking collaborators.
//!
//! The synchronizer only ever talks to repositories through
//! [`SourceRepository`]; [`crate::git::GitRepository`] is the production
//! implementation.

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Branch that stores issue records. It is never indexed as code; its commits
/// are interpreted as issue updates instead.
pub const ISSUES_BRANCH: &str = "refs/heads/gb-issues";

/// A local branch and the commit it currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    /// Fully-qualified ref name, e.g. `refs/heads/main`.
    pub name: String,
    pub tip: String,
}

/// An annotated tag and the hash of the object it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRef {
    pub name: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub committer: String,
    /// Commit time as seconds since the Unix epoch.
    pub time: i64,
    /// First line of the message.
    pub summary: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// A path touched by a commit, relative to its first parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub path: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub id: String,
    pub reporter: String,
    pub created: DateTime<Utc>,
    pub summary: String,
    /// Full rendering of the issue (description plus comments).
    pub body: String,
    pub labels: Vec<String>,
    pub attachments: Vec<Attachment>,
}

pub trait IssueTracker {
    /// Resolve an issue by id. `Ok(None)` when it no longer exists.
    fn issue(&self, id: &str) -> Result<Option<Issue>>;

    fn issues(&self) -> Result<Vec<Issue>>;
}

pub trait SourceRepository {
    /// Repository name as stored in every indexed document.
    fn name(&self) -> &str;

    fn has_commits(&self) -> Result<bool>;

    /// Local branches ordered by name.
    fn branches(&self) -> Result<Vec<BranchRef>>;

    /// Annotated tags only; lightweight tags are not reported.
    fn annotated_tags(&self) -> Result<Vec<TagRef>>;

    /// Commits reachable from `tip`, newest first.
    ///
    /// With `since`, commits reachable from `since` (including itself) are
    /// left out.
    fn history(&self, tip: &str, since: Option<&str>)
    -> Result<Vec<CommitInfo>>;

    fn commit(&self, hash: &str) -> Result<CommitInfo>;

    /// Paths changed by `commit` relative to its first parent. A root commit
    /// reports every path as added.
    fn changed_paths(&self, commit: &str) -> Result<Vec<PathChange>>;

    /// Every file path in the tree of `commit`.
    fn tree_paths(&self, commit: &str) -> Result<Vec<String>>;

    /// Raw content of `path` in the tree of `commit`, `None` when the path
    /// is not a blob there.
    fn read_blob(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>>;

    /// Issue records, present only when the repository has an issues branch.
    fn issues(&self) -> Option<&dyn IssueTracker> {
        None
    }
}
