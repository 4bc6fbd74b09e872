//! In-memory repositories for exercising the synchronizer without git.

use std::collections::{BTreeMap, HashMap};

use chrono::{TimeZone, Utc};

use crate::{
    error::{Error, Result},
    vcs::{
        BranchRef, ChangeKind, CommitInfo, ISSUES_BRANCH, Issue, IssueTracker,
        PathChange, SourceRepository, TagRef,
    },
};

type Tree = BTreeMap<String, Vec<u8>>;

#[derive(Clone)]
struct FakeCommit {
    info: CommitInfo,
    parent: Option<String>,
    tree: Tree,
}

/// A repository with linear per-branch history held in memory.
///
/// Hashes are deterministic (`0000…0001`, `0000…0002`, …) and every commit
/// is one minute after the previous one.
#[derive(Clone)]
pub struct FakeRepository {
    name: String,
    commits: HashMap<String, FakeCommit>,
    branches: BTreeMap<String, String>,
    tags: Vec<TagRef>,
    issues: Option<FakeIssues>,
    counter: u64,
}

pub fn full_ref(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("refs/heads/{branch}")
    }
}

impl FakeRepository {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            commits: HashMap::new(),
            branches: BTreeMap::new(),
            tags: Vec::new(),
            issues: None,
            counter: 0,
        }
    }

    /// Commit text files to `branch`. `None` deletes the path.
    pub fn commit_files(
        &mut self,
        branch: &str,
        files: &[(&str, Option<&str>)],
        message: &str,
    ) -> String {
        let changes = files
            .iter()
            .map(|(path, content)| {
                (path.to_string(), content.map(|c| c.as_bytes().to_vec()))
            })
            .collect();
        self.commit_raw(branch, changes, message)
    }

    pub fn commit_raw(
        &mut self,
        branch: &str,
        changes: Vec<(String, Option<Vec<u8>>)>,
        message: &str,
    ) -> String {
        let branch = full_ref(branch);
        let parent = self.branches.get(&branch).cloned();
        let mut tree = parent
            .as_ref()
            .map(|p| self.commits[p].tree.clone())
            .unwrap_or_default();
        for (path, content) in changes {
            match content {
                Some(bytes) => {
                    tree.insert(path, bytes);
                }
                None => {
                    tree.remove(&path);
                }
            }
        }

        self.counter += 1;
        let hash = format!("{:040x}", self.counter);
        let info = CommitInfo {
            hash: hash.clone(),
            author: "Ada".to_string(),
            committer: "Grace".to_string(),
            time: 1_700_000_000 + self.counter as i64 * 60,
            summary: message.lines().next().unwrap_or_default().to_string(),
            message: message.to_string(),
        };
        self.commits.insert(hash.clone(), FakeCommit { info, parent, tree });
        self.branches.insert(branch, hash.clone());
        hash
    }

    /// Create `branch` pointing at the current tip of `from`.
    pub fn branch_from(&mut self, branch: &str, from: &str) {
        let tip = self.branches[&full_ref(from)].clone();
        self.branches.insert(full_ref(branch), tip);
    }

    pub fn delete_branch(&mut self, branch: &str) {
        self.branches.remove(&full_ref(branch));
    }

    /// Point `branch` at an arbitrary existing commit.
    pub fn reset_branch(&mut self, branch: &str, hash: &str) {
        self.branches.insert(full_ref(branch), hash.to_string());
    }

    pub fn tag(&mut self, name: &str, target: &str) {
        self.tags.push(TagRef {
            name: name.to_string(),
            target: target.to_string(),
        });
    }

    pub fn tip(&self, branch: &str) -> &str {
        &self.branches[&full_ref(branch)]
    }

    pub fn set_issues(&mut self, issues: FakeIssues) {
        self.issues = Some(issues);
    }

    pub fn issues_mut(&mut self) -> &mut FakeIssues {
        self.issues.get_or_insert_with(FakeIssues::default)
    }

    /// Record a change to issue `id` on the issues branch.
    pub fn touch_issue(&mut self, id: &str) -> String {
        self.commit_raw(
            ISSUES_BRANCH,
            vec![(format!("{id}/ticket"), Some(id.as_bytes().to_vec()))],
            &format!("# {id}"),
        )
    }

    fn get(&self, hash: &str) -> Result<&FakeCommit> {
        self.commits.get(hash).ok_or_else(|| Error::NotFound {
            kind: "commit",
            name: hash.to_string(),
        })
    }
}

impl SourceRepository for FakeRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_commits(&self) -> Result<bool> {
        Ok(!self.commits.is_empty())
    }

    fn branches(&self) -> Result<Vec<BranchRef>> {
        Ok(self
            .branches
            .iter()
            .map(|(name, tip)| BranchRef {
                name: name.clone(),
                tip: tip.clone(),
            })
            .collect())
    }

    fn annotated_tags(&self) -> Result<Vec<TagRef>> {
        Ok(self.tags.clone())
    }

    fn history(
        &self,
        tip: &str,
        since: Option<&str>,
    ) -> Result<Vec<CommitInfo>> {
        let stop = since.filter(|s| self.commits.contains_key(*s));
        let mut out = Vec::new();
        let mut next = Some(tip.to_string());
        while let Some(hash) = next {
            if Some(hash.as_str()) == stop {
                break;
            }
            let commit = self.get(&hash)?;
            out.push(commit.info.clone());
            next = commit.parent.clone();
        }
        Ok(out)
    }

    fn commit(&self, hash: &str) -> Result<CommitInfo> {
        Ok(self.get(hash)?.info.clone())
    }

    fn changed_paths(&self, commit: &str) -> Result<Vec<PathChange>> {
        let commit = self.get(commit)?;
        let empty = Tree::new();
        let before = match &commit.parent {
            Some(parent) => &self.get(parent)?.tree,
            None => &empty,
        };

        let mut changes = Vec::new();
        for (path, content) in &commit.tree {
            let kind = match before.get(path) {
                None => ChangeKind::Added,
                Some(old) if old != content => ChangeKind::Modified,
                Some(_) => continue,
            };
            changes.push(PathChange {
                path: path.clone(),
                kind,
            });
        }
        for path in before.keys() {
            if !commit.tree.contains_key(path) {
                changes.push(PathChange {
                    path: path.clone(),
                    kind: ChangeKind::Deleted,
                });
            }
        }
        Ok(changes)
    }

    fn tree_paths(&self, commit: &str) -> Result<Vec<String>> {
        Ok(self.get(commit)?.tree.keys().cloned().collect())
    }

    fn read_blob(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(commit)?.tree.get(path).cloned())
    }

    fn issues(&self) -> Option<&dyn IssueTracker> {
        if self.branches.contains_key(ISSUES_BRANCH) {
            self.issues.as_ref().map(|i| i as &dyn IssueTracker)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeIssues {
    issues: BTreeMap<String, Issue>,
}

impl FakeIssues {
    pub fn insert(&mut self, issue: Issue) {
        self.issues.insert(issue.id.clone(), issue);
    }

    pub fn remove(&mut self, id: &str) {
        self.issues.remove(id);
    }
}

impl IssueTracker for FakeIssues {
    fn issue(&self, id: &str) -> Result<Option<Issue>> {
        Ok(self.issues.get(id).cloned())
    }

    fn issues(&self) -> Result<Vec<Issue>> {
        Ok(self.issues.values().cloned().collect())
    }
}

pub fn issue(id: &str, summary: &str, body: &str) -> Issue {
    Issue {
        id: id.to_string(),
        reporter: "ada".to_string(),
        created: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        summary: summary.to_string(),
        body: body.to_string(),
        labels: vec!["bug".to_string()],
        attachments: Vec::new(),
    }
}
