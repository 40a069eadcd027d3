use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tessera_repl::marker::read_marker;
use tessera_repl::{SearchSystem, TickOutcome};
use tessera_store::{
    shard_for_id, Document, EntityType, Generation, Query, SearchConfig, ShardingAlgorithm,
};

#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(about = "Sharded search directories with master/slave snapshot replication", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "TESSERA_CONFIG", default_value = "tessera.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every refresh scheduler until interrupted.
    Serve,
    /// Show every directory with its published and applied generations.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print the directory an identifier is assigned to.
    Route {
        #[arg(short, long)]
        entity: String,
        #[arg(short, long)]
        id: String,
    },
    /// Publish every master directory once.
    Publish,
    /// Run one replication tick on every slave directory.
    Sync,
    /// Add a document and commit it.
    Index {
        #[arg(short, long)]
        entity: String,
        #[arg(short, long)]
        id: String,
        /// Fields as `name=value`.
        fields: Vec<String>,
    },
    /// Query one or more entity types.
    Search {
        #[arg(short, long, required = true)]
        entity: Vec<String>,
        /// e.g. `name:mouse OR color:blue`; `*` matches everything.
        query: String,
        /// Fail when any directory could not be read.
        #[arg(long)]
        strict: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = SearchConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        match self.command {
            Command::Route { ref entity, ref id } => route(&config, entity, id),
            Command::Serve => serve(&config).await,
            Command::Status { json } => status(&config, json),
            Command::Publish => publish(&config).await,
            Command::Sync => sync(&config).await,
            Command::Index {
                ref entity,
                ref id,
                ref fields,
            } => index(&config, entity, id, fields),
            Command::Search {
                ref entity,
                ref query,
                strict,
            } => search(&config, entity, query, strict).await,
        }
    }
}

/// Resolves the directory of `id` from the configuration alone, opening nothing.
pub fn route_name(config: &SearchConfig, entity: &str, id: &str) -> Result<String> {
    let plan = config
        .resolve()?
        .into_iter()
        .find(|p| p.sharding.entity_type().as_str() == entity)
        .with_context(|| format!("unknown entity type {}", entity))?;
    let names = plan.sharding.index_names();
    let name = match plan.sharding.algorithm() {
        ShardingAlgorithm::NotSharded => &names[0],
        ShardingAlgorithm::IdHash => {
            &names[shard_for_id(id, plan.sharding.shard_count()).as_index()]
        }
    };
    Ok(name.clone())
}

fn route(config: &SearchConfig, entity: &str, id: &str) -> Result<()> {
    println!("{}", route_name(config, entity, id)?);
    Ok(())
}

async fn serve(config: &SearchConfig) -> Result<()> {
    let system = SearchSystem::build(config)?;
    let started = system.start();
    tracing::info!(schedulers = started, "serving, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    system.shutdown().await;
    print!("{}", system.metrics_text());
    Ok(())
}

fn status(config: &SearchConfig, as_json: bool) -> Result<()> {
    let system = SearchSystem::build(config)?;

    let mut published: BTreeMap<String, Option<Generation>> = BTreeMap::new();
    for master in system.masters() {
        let root = master.publish_root().to_path_buf();
        published.insert(name_of(&root), read_marker(&root)?);
    }
    for slave in system.slaves() {
        let root = slave.replicator().publish_root().to_path_buf();
        published.insert(name_of(&root), read_marker(&root)?);
    }

    let statuses = system.statuses();
    if as_json {
        let rows: Vec<_> = statuses
            .iter()
            .map(|s| {
                json!({
                    "name": s.name,
                    "kind": s.kind.as_str(),
                    "initialized": s.initialized,
                    "committed_version": s.committed_version,
                    "published_generation": published.get(&s.name).copied().flatten().map(|g| g.as_u64()),
                    "local_generation": s.generation.map(|g| g.as_u64()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<22} {:<6} {:>8} {:>10} {:>8}",
        "DIRECTORY", "KIND", "READY", "VERSION", "PUBLISHED", "LOCAL"
    );
    for s in statuses {
        let dash = || "-".to_string();
        println!(
            "{:<24} {:<22} {:<6} {:>8} {:>10} {:>8}",
            s.name,
            s.kind.as_str(),
            if s.initialized { "yes" } else { "no" },
            s.committed_version.map(|v| v.to_string()).unwrap_or_else(dash),
            published
                .get(&s.name)
                .copied()
                .flatten()
                .map(|g| g.to_string())
                .unwrap_or_else(dash),
            s.generation.map(|g| g.to_string()).unwrap_or_else(dash),
        );
    }
    Ok(())
}

fn name_of(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn publish(config: &SearchConfig) -> Result<()> {
    let system = SearchSystem::build(config)?;
    let results = system.publish_all().await;
    if results.is_empty() {
        println!("no master directories configured");
    }
    let mut failed = 0;
    for (name, result) in results {
        match result {
            Ok(generation) => println!("{}: published generation {}", name, generation),
            Err(e) => {
                failed += 1;
                println!("{}: FAILED: {}", name, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} publish(es) failed", failed);
    }
    Ok(())
}

async fn sync(config: &SearchConfig) -> Result<()> {
    let system = SearchSystem::build(config)?;
    let results = system.sync_all().await;
    if results.is_empty() {
        println!("no slave directories configured");
    }
    let mut failed = 0;
    for (name, result) in results {
        match result {
            Ok(TickOutcome::NothingPublished) => println!("{}: nothing published yet", name),
            Ok(TickOutcome::UpToDate(g)) => println!("{}: up to date at generation {}", name, g),
            Ok(TickOutcome::Applied { from, to }) => {
                println!("{}: generation {} -> {}", name, from, to)
            }
            Err(e) => {
                failed += 1;
                println!("{}: FAILED: {}", name, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} director(y/ies) failed to sync", failed);
    }
    Ok(())
}

fn index(config: &SearchConfig, entity: &str, id: &str, fields: &[String]) -> Result<()> {
    let mut doc = Document::new(entity, id);
    for field in fields {
        let (name, value) = field
            .split_once('=')
            .with_context(|| format!("field {:?} is not name=value", field))?;
        doc = doc.with_field(name, value);
    }

    let system = SearchSystem::build(config)?;
    let directory = system.index(doc)?;
    system.commit()?;
    println!("{}", directory);
    Ok(())
}

async fn search(config: &SearchConfig, entities: &[String], query: &str, strict: bool) -> Result<()> {
    let parsed = Query::parse(query).with_context(|| format!("cannot parse query {:?}", query))?;
    let entity_types: Vec<EntityType> = entities.iter().map(|e| EntityType::new(e.as_str())).collect();

    let system = SearchSystem::build(config)?;
    let outcome = system.search(&entity_types, &parsed).await?;

    for failure in &outcome.failures {
        eprintln!("warning: {} unavailable: {}", failure.directory, failure.error);
    }
    if strict && outcome.is_partial() {
        return outcome.into_strict().map(|_| ()).map_err(Into::into);
    }

    for hit in &outcome.hits {
        let fields: Vec<String> = hit
            .document
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "[{}] {}#{} {}",
            hit.directory,
            hit.document.entity_type,
            hit.document.id,
            fields.join(" ")
        );
    }
    println!("{} hit(s)", outcome.len());
    Ok(())
}
