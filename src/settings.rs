use std::{collections::BTreeSet, time::Duration};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
    vcs::ISSUES_BRANCH,
};

/// Setting keys understood by [`IndexSettings::load`].
pub mod keys {
    pub const ENABLED: &str = "indexing.enabled";
    pub const POLLING: &str = "indexing.polling";
    pub const INTERVAL_SECS: &str = "indexing.interval_secs";
    pub const EXCLUDED_EXTENSIONS: &str = "index.excluded_extensions";
    pub const EXCLUDED_BRANCHES: &str = "index.excluded_branches";
    pub const WRITER_MEMORY: &str = "index.writer_memory";

    pub const ALL: &[&str] = &[
        ENABLED,
        POLLING,
        INTERVAL_SECS,
        EXCLUDED_EXTENSIONS,
        EXCLUDED_BRANCHES,
        WRITER_MEMORY,
    ];
}

/// File extensions whose content is never fed to the full-text index.
pub const DEFAULT_EXCLUDED_EXTENSIONS: &[&str] = &[
    "7z", "arc", "arj", "bin", "bmp", "dll", "doc", "docx", "exe", "gif", "gz",
    "jar", "jpg", "lib", "lzh", "odg", "pdf", "ppt", "png", "so", "swf", "xcf",
    "xls", "xlsx", "zip",
];

/// Tantivy refuses writer budgets below this.
pub const MIN_WRITER_MEMORY: usize = 15_000_000;
const DEFAULT_WRITER_MEMORY: usize = 50_000_000;
const DEFAULT_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub enabled: bool,
    pub polling: bool,
    pub interval: Duration,
    pub excluded_extensions: BTreeSet<String>,
    pub excluded_branches: Vec<String>,
    pub writer_memory: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            polling: false,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            excluded_extensions: DEFAULT_EXCLUDED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_branches: vec![ISSUES_BRANCH.to_string()],
            writer_memory: DEFAULT_WRITER_MEMORY,
        }
    }
}

impl IndexSettings {
    /// Load settings from the config database, falling back to defaults for
    /// anything unset.
    pub fn load(config_db: &ConfigDb) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(v) = config_db.get_setting(keys::ENABLED)? {
            settings.enabled = parse_bool(keys::ENABLED, &v)?;
        }
        if let Some(v) = config_db.get_setting(keys::POLLING)? {
            settings.polling = parse_bool(keys::POLLING, &v)?;
        }
        if let Some(v) = config_db.get_setting(keys::INTERVAL_SECS)? {
            let secs: u64 = parse_number(keys::INTERVAL_SECS, &v)?;
            if secs == 0 {
                return Err(Error::Config(format!(
                    "{} must be at least 1",
                    keys::INTERVAL_SECS
                )));
            }
            settings.interval = Duration::from_secs(secs);
        }
        if let Some(v) = config_db.get_setting(keys::EXCLUDED_EXTENSIONS)? {
            settings.excluded_extensions = split_list(&v)
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect();
        }
        if let Some(v) = config_db.get_setting(keys::EXCLUDED_BRANCHES)? {
            settings.excluded_branches =
                split_list(&v).map(str::to_string).collect();
        }
        if let Some(v) = config_db.get_setting(keys::WRITER_MEMORY)? {
            let bytes: usize = parse_number(keys::WRITER_MEMORY, &v)?;
            settings.writer_memory = bytes.max(MIN_WRITER_MEMORY);
        }

        // Fail early on bad globs rather than at the first indexing pass.
        settings.branch_filter()?;
        Ok(settings)
    }

    /// Compile the excluded branch patterns.
    pub fn branch_filter(&self) -> Result<BranchFilter> {
        BranchFilter::new(&self.excluded_branches)
    }
}

/// Matches fully-qualified branch names against the exclusion globs.
#[derive(Debug, Clone)]
pub struct BranchFilter {
    set: GlobSet,
}

impl BranchFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                Error::Config(format!(
                    "invalid branch pattern '{pattern}': {e}"
                ))
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| {
            Error::Config(format!("invalid branch patterns: {e}"))
        })?;
        Ok(Self { set })
    }

    pub fn is_excluded(&self, branch: &str) -> bool {
        self.set.is_match(branch)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(Error::Config(format!(
            "{key} expects a boolean, got '{other}'"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!("{key} expects a number, got '{value}'"))
    })
}
