use std::collections::BTreeSet;

use serde::Serialize;

use crate::vcs::{CommitInfo, ISSUES_BRANCH, Issue};

/// The kinds of objects that can be indexed and queried.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Commit,
    Blob,
    Issue,
}

impl ObjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Blob => "blob",
            Self::Issue => "issue",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "commit" => Some(Self::Commit),
            "blob" => Some(Self::Blob),
            "issue" => Some(Self::Issue),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flat, engine-independent document ready to be written to an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDocument {
    pub kind: ObjectType,
    pub repository: String,
    /// Commit hash, file path or issue id.
    pub id: String,
    pub branch: Option<String>,
    /// Seconds since the Unix epoch, truncated to the minute.
    pub date: i64,
    pub author: String,
    pub committer: Option<String>,
    pub summary: Option<String>,
    /// Searchable text. Never stored.
    pub content: Option<String>,
    pub labels: Vec<String>,
    pub attachments: Vec<String>,
}

impl IndexDocument {
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(
            self.kind,
            &self.repository,
            self.branch.as_deref(),
            &self.id,
        )
    }
}

/// Identity of a document within one index generation.
///
/// Serialized as `"kind\0repository\0branch\0id"`. Commits are identified by
/// hash alone, so their key carries an empty branch even when the stored
/// document records the branch it was reached through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(
        kind: ObjectType,
        repository: &str,
        branch: Option<&str>,
        id: &str,
    ) -> Self {
        let branch = match kind {
            ObjectType::Commit => "",
            ObjectType::Blob | ObjectType::Issue => branch.unwrap_or(""),
        };
        Self(format!("{}\0{repository}\0{branch}\0{id}", kind.as_str()))
    }

    pub fn commit(repository: &str, hash: &str) -> Self {
        Self::new(ObjectType::Commit, repository, None, hash)
    }

    pub fn blob(repository: &str, branch: &str, path: &str) -> Self {
        Self::new(ObjectType::Blob, repository, Some(branch), path)
    }

    pub fn issue(repository: &str, id: &str) -> Self {
        Self::new(ObjectType::Issue, repository, Some(ISSUES_BRANCH), id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Truncate a timestamp to minute resolution.
pub fn truncate_to_minute(secs: i64) -> i64 {
    secs - secs.rem_euclid(60)
}

/// True when the file name's extension is in the exclusion set.
///
/// Only the final path component is inspected and the comparison is
/// case-insensitive. Files without an extension are never excluded.
pub fn is_excluded_extension(path: &str, excluded: &BTreeSet<String>) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => excluded.contains(ext),
        _ => false,
    }
}

/// Build the document for a commit.
///
/// `tags` are the names of annotated tags pointing at this commit.
pub fn commit_document(
    repository: &str,
    branch: &str,
    commit: &CommitInfo,
    tags: &[String],
) -> IndexDocument {
    IndexDocument {
        kind: ObjectType::Commit,
        repository: repository.to_string(),
        id: commit.hash.clone(),
        branch: Some(branch.to_string()),
        date: truncate_to_minute(commit.time),
        author: commit.committer.clone(),
        committer: None,
        summary: Some(commit.summary.clone()),
        content: Some(commit.message.clone()),
        labels: tags.to_vec(),
        attachments: Vec::new(),
    }
}

/// Build the document for a file at the tip of a branch.
///
/// Content is only attached when the extension is not excluded and the bytes
/// decode as UTF-8; otherwise the document carries metadata alone.
pub fn blob_document(
    repository: &str,
    branch: &str,
    path: &str,
    content: Option<&[u8]>,
    tip: &CommitInfo,
    excluded: &BTreeSet<String>,
) -> IndexDocument {
    let content = if is_excluded_extension(path, excluded) {
        None
    } else {
        content.and_then(|bytes| std::str::from_utf8(bytes).ok())
    };

    IndexDocument {
        kind: ObjectType::Blob,
        repository: repository.to_string(),
        id: path.to_string(),
        branch: Some(branch.to_string()),
        date: truncate_to_minute(tip.time),
        author: tip.author.clone(),
        committer: Some(tip.committer.clone()),
        summary: None,
        content: content.map(str::to_string),
        labels: vec![branch.to_string()],
        attachments: Vec::new(),
    }
}

pub fn issue_document(repository: &str, issue: &Issue) -> IndexDocument {
    IndexDocument {
        kind: ObjectType::Issue,
        repository: repository.to_string(),
        id: issue.id.clone(),
        branch: Some(ISSUES_BRANCH.to_string()),
        date: truncate_to_minute(issue.created.timestamp()),
        author: issue.reporter.clone(),
        committer: None,
        summary: Some(issue.summary.clone()),
        content: Some(issue.body.clone()),
        labels: issue.labels.clone(),
        attachments: issue
            .attachments
            .iter()
            .map(|a| a.name.to_lowercase())
            .collect(),
    }
}
