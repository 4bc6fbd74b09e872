use std::{path::Path, sync::Arc};

use clap::Parser;
use gitindex::{
    ConfigDb, CursorStatus, DataDir, Error, GitRepository, IndexCache,
    IndexScheduler, IndexSettings, RepositoryRegistry, Result, Synchronizer,
    data_dir::validate_repository_name, search, settings,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction, RepoAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("GITINDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// Everything a command that touches indexes needs.
struct Context {
    data_dir: DataDir,
    config_db: Arc<ConfigDb>,
    settings: IndexSettings,
    cache: Arc<IndexCache>,
    sync: Arc<Synchronizer>,
}

impl Context {
    fn open(data_dir: DataDir, config_db: Arc<ConfigDb>) -> Result<Self> {
        let settings = IndexSettings::load(&config_db)?;
        let cache = Arc::new(IndexCache::new(settings.writer_memory));
        let sync = Arc::new(Synchronizer::new(
            data_dir.clone(),
            cache.clone(),
            &settings,
        )?);
        Ok(Self {
            data_dir,
            config_db,
            settings,
            cache,
            sync,
        })
    }

    /// Flush and release every open writer.
    fn close(&self) -> Result<()> {
        self.cache.close_all()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = Arc::new(ConfigDb::open(&data_dir.config_db())?);

    match cli.command {
        Command::Repo { action } => match action {
            RepoAction::Add { path, name } => {
                repo_add(&config_db, &path, &name)?;
            }
            RepoAction::Remove { name } => {
                let ctx = Context::open(data_dir, config_db)?;
                let result = repo_remove(&ctx, &name);
                ctx.close()?;
                result?;
            }
            RepoAction::List { json } => {
                repo_list(&config_db, json)?;
            }
        },
        Command::Index(args) => {
            let ctx = Context::open(data_dir, config_db)?;
            let result = cmd_index(&ctx, args.name.as_deref(), args.rebuild);
            ctx.close()?;
            result?;
        }
        Command::Search(args) => {
            let ctx = Context::open(data_dir, config_db)?;
            let repositories = if args.repositories.is_empty() {
                registered_names(&ctx.config_db)?
            } else {
                args.repositories.clone()
            };
            let results = search::search(
                &ctx.cache,
                &ctx.data_dir,
                &args.query,
                args.count,
                &repositories,
            );
            ctx.close()?;
            let results = results?;

            if args.json {
                search::format_json(&results, &args.query)?;
            } else {
                search::format_human(&results);
            }
        }
        Command::Watch => {
            let ctx = Context::open(data_dir, config_db)?;
            let result = cmd_watch(&ctx);
            ctx.close()?;
            result?;
        }
        Command::Status(args) => {
            cmd_status(&config_db, &data_dir, args.json)?;
        }
        Command::Config { action } => match action {
            ConfigAction::Set { key, value } => {
                config_set(&config_db, &key, &value)?;
            }
            ConfigAction::Get { key } => {
                config_get(&config_db, &key)?;
            }
            ConfigAction::List { json } => {
                config_list(&config_db, json)?;
            }
        },
        Command::Completions(_) => {}
    }

    Ok(())
}

fn registered_names(config_db: &ConfigDb) -> Result<Vec<String>> {
    Ok(config_db
        .list_repositories()?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

fn repo_add(config_db: &ConfigDb, path: &Path, name: &str) -> Result<()> {
    validate_repository_name(name)?;

    if config_db.get_repository(name)?.is_some() {
        return Err(Error::Config(format!(
            "repository '{name}' already exists"
        )));
    }

    let abs_path = path.canonicalize().map_err(|e| {
        Error::Config(format!("cannot resolve path {}: {e}", path.display()))
    })?;

    // Fail early on anything libgit2 cannot open.
    GitRepository::open(name, &abs_path)?;

    let abs_str = abs_path.to_str().ok_or_else(|| {
        Error::Config(format!("path is not valid UTF-8: {}", abs_path.display()))
    })?;
    config_db.set_repository(name, abs_str)?;

    println!("Added repository '{name}' -> {}", abs_path.display());
    Ok(())
}

fn repo_remove(ctx: &Context, name: &str) -> Result<()> {
    if ctx.config_db.get_repository(name)?.is_none() {
        return Err(Error::NotFound {
            kind: "repository",
            name: name.to_string(),
        });
    }

    ctx.sync.delete_index(name)?;
    ctx.config_db.remove_repository(name)?;

    println!("Removed repository '{name}'");
    Ok(())
}

fn repo_list(config_db: &ConfigDb, json: bool) -> Result<()> {
    let repositories = config_db.list_repositories()?;

    if json {
        let list: Vec<_> = repositories
            .iter()
            .map(|(name, path)| json!({ "name": name, "path": path }))
            .collect();
        println!("{}", serde_json::to_string(&list)?);
    } else if repositories.is_empty() {
        println!("No repositories registered.");
    } else {
        for (name, path) in &repositories {
            println!("{name}\t{path}");
        }
    }
    Ok(())
}

fn cmd_index(ctx: &Context, name: Option<&str>, rebuild: bool) -> Result<()> {
    let repositories: Vec<(String, String)> = if let Some(name) = name {
        let path = ctx.config_db.get_repository(name)?.ok_or_else(|| {
            Error::NotFound {
                kind: "repository",
                name: name.to_string(),
            }
        })?;
        vec![(name.to_string(), path)]
    } else {
        ctx.config_db.list_repositories()?
    };

    if repositories.is_empty() {
        eprintln!("No repositories to index.");
        return Ok(());
    }

    let mut failed = Vec::new();
    for (name, path) in &repositories {
        let repo = match GitRepository::open(name, Path::new(path)) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(repository = %name, error = %e, "cannot open repository");
                failed.push(name.clone());
                continue;
            }
        };

        eprintln!("Indexing '{name}'...");
        let result = ctx.sync.index_repository(&repo, rebuild);
        if result.success {
            eprintln!("  {} commit(s) indexed", result.commit_count);
        } else {
            failed.push(name.clone());
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "indexing failed for: {}",
            failed.join(", ")
        )))
    }
}

fn cmd_watch(ctx: &Context) -> Result<()> {
    if !ctx.settings.enabled {
        eprintln!(
            "Indexing is disabled; enable it with `gitindex config set {} true`.",
            settings::keys::ENABLED
        );
        return Ok(());
    }

    let resolver = Arc::new(RepositoryRegistry::new(ctx.config_db.clone()));
    let scheduler =
        Arc::new(IndexScheduler::new(ctx.sync.clone(), resolver, &ctx.settings));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let shutdown = CancellationToken::new();
        let driver = scheduler.spawn(shutdown.clone());

        tokio::signal::ctrl_c().await?;
        info!("interrupt received, stopping");
        shutdown.cancel();

        if let Err(e) = driver.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
        Ok::<(), Error>(())
    })
}

fn cmd_status(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    json: bool,
) -> Result<()> {
    let repositories = config_db.list_repositories()?;
    let cursors = gitindex::CursorStore::new();

    let mut entries = Vec::new();
    for (name, path) in &repositories {
        let location = data_dir.location(name);
        let state = match cursors.status(&location) {
            CursorStatus::Current => "current".to_string(),
            CursorStatus::Missing => "not indexed".to_string(),
            CursorStatus::Stale { found } => match found {
                Some(v) => format!("stale (schema {v})"),
                None => "stale (no schema)".to_string(),
            },
            CursorStatus::Unreadable(e) => format!("unreadable: {e}"),
        };
        let record = cursors.load(&location);
        let branches: Vec<(String, String)> = record
            .branches
            .values()
            .map(|c| (c.name.clone(), c.last_commit.clone()))
            .collect();
        entries.push((name, path, state, branches));
    }

    if json {
        let list: Vec<_> = entries
            .iter()
            .map(|(name, path, state, branches)| {
                let branches: Vec<_> = branches
                    .iter()
                    .map(|(b, c)| json!({ "branch": b, "last_commit": c }))
                    .collect();
                json!({
                    "name": name,
                    "path": path,
                    "state": state,
                    "branches": branches,
                })
            })
            .collect();
        let out = json!({
            "data_dir": data_dir.root().display().to_string(),
            "repositories": list,
        });
        println!("{}", serde_json::to_string(&out)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Repositories: {}", entries.len());
        for (name, path, state, branches) in &entries {
            println!("  {name}: {path} [{state}]");
            for (branch, commit) in branches {
                println!("    {branch} @ {}", &commit[..commit.len().min(10)]);
            }
        }
    }
    Ok(())
}

fn config_set(config_db: &ConfigDb, key: &str, value: &str) -> Result<()> {
    if !settings::keys::ALL.contains(&key) {
        return Err(Error::Config(format!(
            "unknown setting '{key}' (known: {})",
            settings::keys::ALL.join(", ")
        )));
    }
    let previous = config_db.get_setting(key)?;
    config_db.set_setting(key, value)?;

    // Reject values the typed loader would refuse, keeping the old one.
    if let Err(e) = IndexSettings::load(config_db) {
        match previous {
            Some(old) => config_db.set_setting(key, &old)?,
            None => {
                config_db.remove_setting(key)?;
            }
        }
        return Err(e);
    }
    println!("{key} = {value}");
    Ok(())
}

fn config_get(config_db: &ConfigDb, key: &str) -> Result<()> {
    match config_db.get_setting(key)? {
        Some(value) => println!("{value}"),
        None => {
            return Err(Error::NotFound {
                kind: "setting",
                name: key.to_string(),
            });
        }
    }
    Ok(())
}

fn config_list(config_db: &ConfigDb, json: bool) -> Result<()> {
    let settings = config_db.list_settings()?;

    if json {
        let map: serde_json::Map<String, serde_json::Value> = settings
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        println!("{}", serde_json::to_string(&map)?);
    } else if settings.is_empty() {
        println!("No settings stored; defaults apply.");
    } else {
        for (key, value) in &settings {
            println!("{key}\t{value}");
        }
    }
    Ok(())
}
