use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "gitindex",
    about = "Keep full-text indexes of git repositories in sync and search them"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage indexed repositories
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },
    /// Index one or all repositories now
    Index(IndexArgs),
    /// Search across repositories
    Search(SearchArgs),
    /// Keep indexes up to date until interrupted
    Watch,
    /// Show index state per repository
    Status(StatusArgs),
    /// Manage settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Repo subcommands --

#[derive(Debug, Subcommand)]
pub enum RepoAction {
    /// Register a git repository
    Add {
        /// Path to the repository (bare or with a work tree)
        path: PathBuf,
        /// Name the repository is indexed and searched under
        #[arg(long)]
        name: String,
    },
    /// Unregister a repository and delete its index
    Remove {
        /// Name of the repository to remove
        name: String,
    },
    /// List registered repositories
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Index only this repository
    pub name: Option<String>,

    /// Discard the existing index and rebuild from scratch
    #[arg(long)]
    pub rebuild: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Search only within this repository (repeatable)
    #[arg(short = 'r', long = "repo")]
    pub repositories: Vec<String>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Store a setting
    Set { key: String, value: String },
    /// Print a setting
    Get { key: String },
    /// List stored settings
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "gitindex",
            &mut std::io::stdout(),
        );
    }
}
