use sha2::{Digest, Sha256};

/// A stable key derived from a fully-qualified branch name.
///
/// Ref names can contain characters that are awkward in a key-value store
/// (`/`, `.`, unicode), so the cursor record is keyed by the hex digest of
/// the name instead. The display name is kept alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchKey(String);

impl BranchKey {
    pub fn new(branch: &str) -> Self {
        let digest = Sha256::digest(branch.as_bytes());
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(hex)
    }

    /// Wrap a key read back from storage.
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The short hex string for human display.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
