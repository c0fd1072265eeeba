//! Mneme CLI - temporal knowledge graph engine

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mneme_core::analytics::{FindPathsOptions, GraphStatisticsOptions, NodeAnalyticsOptions};
use mneme_core::config::Config;
use mneme_core::domain::knowledge::{Entity, KnowledgeGraph, Relation, RelationKey};
use mneme_core::manager::{AdvancedSearchOptions, KnowledgeGraphManager};
use mneme_core::storage::{EntityOutcome, ObservationAddition, RelationOutcome};
use mneme_core::tools::ToolRouter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mneme")]
#[command(author, version, about = "Temporal, semantically searchable knowledge graph", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an entity, or add observations to an existing one
    CreateEntity {
        name: String,
        entity_type: String,
        /// Observation to record (repeatable)
        #[arg(short, long = "observation")]
        observations: Vec<String>,
    },

    /// Add observations to an existing entity
    AddObservation {
        name: String,
        #[arg(required = true)]
        contents: Vec<String>,
    },

    /// Create a relation between two entities
    Relate {
        from: String,
        relation_type: String,
        to: String,
        #[arg(long)]
        strength: Option<f64>,
        #[arg(long)]
        confidence: Option<f64>,
    },

    /// Delete entities and their relations
    DeleteEntity {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Search entities
    Search {
        query: String,
        /// Keyword matching only
        #[arg(long, conflicts_with = "hybrid")]
        keyword: bool,
        /// Combine vector and keyword scores
        #[arg(long)]
        hybrid: bool,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        min_similarity: Option<f32>,
        /// Restrict to these entity types (repeatable)
        #[arg(short = 't', long = "type")]
        entity_types: Vec<String>,
    },

    /// Show entities by name with the relations among them
    Open {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Print the whole graph
    Graph,

    /// Graph statistics
    Stats {
        /// Include centrality and path length metrics
        #[arg(long)]
        advanced: bool,
    },

    /// Centrality and neighborhood of one entity
    Node { name: String },

    /// Find paths between two entities
    Paths {
        from: String,
        to: String,
        /// bfs, dfs, dijkstra or astar
        #[arg(short, long, default_value = "bfs")]
        algorithm: String,
        #[arg(long, default_value_t = 5)]
        max_depth: usize,
        /// Collect every path up to --max-paths
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 10)]
        max_paths: usize,
        /// Traverse relations in both directions
        #[arg(long)]
        bidirectional: bool,
    },

    /// Entities with embeddings similar to this one
    Similar {
        name: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Version history of an entity
    History { name: String },

    /// The graph as it stood at an epoch-millisecond timestamp
    At { timestamp: i64 },

    /// Call a tool by name with JSON arguments
    Tool {
        name: String,
        /// JSON object of arguments
        #[arg(default_value = "{}")]
        args: String,
    },

    /// List tool names
    Tools,

    /// Process embedding jobs until interrupted
    Worker {
        /// Process the backlog once and exit
        #[arg(long)]
        once: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "mneme=warn,mneme_core=warn"
    } else {
        "mneme=info,mneme_core=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    // config commands must work even when the graph cannot be opened
    if let Commands::Config { action } = cli.command {
        return cmd_config(action, &config_path, cli.quiet);
    }

    let config = Config::load_from(&config_path)?;
    let manager = Arc::new(
        KnowledgeGraphManager::from_config(&config)
            .await
            .context("Failed to open knowledge graph")?,
    );
    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::CreateEntity {
            name,
            entity_type,
            observations,
        } => cmd_create_entity(&manager, &out, name, entity_type, observations).await,

        Commands::AddObservation { name, contents } => {
            let results = manager
                .add_observations(vec![ObservationAddition {
                    entity_name: name,
                    contents,
                }])
                .await?;
            out.emit(&results, || {
                for result in &results {
                    println!(
                        "Added {} observation(s) to '{}'",
                        result.added_observations.len(),
                        result.entity_name
                    );
                }
            })
        }

        Commands::Relate {
            from,
            relation_type,
            to,
            strength,
            confidence,
        } => {
            let mut relation = Relation::new(from, to, relation_type);
            relation.strength = strength;
            relation.confidence = confidence;
            cmd_relate(&manager, &out, relation).await
        }

        Commands::DeleteEntity { names } => {
            manager.delete_entities(&names).await?;
            out.emit(&names, || println!("Deleted {}", names.join(", ")))
        }

        Commands::Search {
            query,
            keyword,
            hybrid,
            limit,
            offset,
            min_similarity,
            entity_types,
        } => {
            let options = AdvancedSearchOptions {
                semantic_search: !keyword,
                hybrid_search: hybrid,
                min_similarity,
                entity_types,
                limit,
                offset,
                ..AdvancedSearchOptions::default()
            };
            let results = manager.advanced_search(&query, options).await?;
            out.emit(&results, || {
                if results.results.is_empty() {
                    println!("No matches.");
                    return;
                }
                println!(
                    "{} of {} match(es) [{}]",
                    results.results.len(),
                    results.total,
                    results.search_method.as_str()
                );
                for hit in &results.results {
                    println!(
                        "  {:.3}  {} ({})",
                        hit.score, hit.entity.name, hit.entity.entity_type
                    );
                }
            })
        }

        Commands::Open { names } => {
            let graph = manager.open_nodes(&names).await?;
            out.emit(&graph, || print_graph(&graph))
        }

        Commands::Graph => {
            let graph = manager.read_graph().await?;
            out.emit(&graph, || print_graph(&graph))
        }

        Commands::Stats { advanced } => {
            let options = GraphStatisticsOptions {
                include_advanced: advanced,
                ..GraphStatisticsOptions::default()
            };
            let stats = manager.get_graph_statistics(options).await?;
            out.emit(&stats, || {
                println!("Entities:  {}", stats.total_entities);
                println!("Relations: {}", stats.total_relations);
                println!("Density:   {:.4}", stats.graph_density);
                println!("Avg. connections: {:.2}", stats.average_connections);
                for (entity_type, count) in &stats.entity_types {
                    println!("  {}: {}", entity_type, count);
                }
                if !stats.isolated_entities.is_empty() {
                    println!("Isolated: {}", stats.isolated_entities.join(", "));
                }
            })
        }

        Commands::Node { name } => {
            let analytics = manager
                .get_node_analytics(&name, NodeAnalyticsOptions::default())
                .await?;
            out.emit(&analytics, || {
                println!("{} ({})", analytics.name, analytics.entity_type);
                if let Some(centrality) = &analytics.centrality {
                    println!(
                        "  degree {} (in {}, out {})",
                        centrality.degree, centrality.in_degree, centrality.out_degree
                    );
                    println!("  closeness   {:.4}", centrality.closeness_centrality);
                    println!("  betweenness {:.4}", centrality.betweenness_centrality);
                }
                if let Some(clustering) = &analytics.clustering {
                    println!("  clustering  {:.4}", clustering.clustering_coefficient);
                }
                for neighbor in analytics.neighbors.iter().flatten() {
                    println!("  ~ {}", neighbor.name);
                }
            })
        }

        Commands::Paths {
            from,
            to,
            algorithm,
            max_depth,
            all,
            max_paths,
            bidirectional,
        } => {
            let options = FindPathsOptions {
                algorithm: algorithm.parse()?,
                max_depth,
                find_all_paths: all,
                max_paths,
                bidirectional,
                ..FindPathsOptions::default()
            };
            let result = manager.find_paths(&from, &to, options).await?;
            out.emit(&result, || {
                if result.paths.is_empty() {
                    println!("No path from '{}' to '{}'.", from, to);
                }
                for path in &result.paths {
                    println!("  ({} hops) {}", path.length, path.entities.join(" -> "));
                }
                if result.timed_out {
                    println!("Search timed out; results may be incomplete.");
                }
            })
        }

        Commands::Similar { name, limit } => {
            let hits = manager.find_similar_entities(&name, limit, None).await?;
            out.emit(&hits, || {
                if hits.is_empty() {
                    println!("No similar entities.");
                }
                for hit in &hits {
                    println!("  {:.3}  {}", hit.score, hit.entity.name);
                }
            })
        }

        Commands::History { name } => {
            let history = manager.get_entity_history(&name).await?;
            out.emit(&history, || {
                for version in &history {
                    println!(
                        "  v{} @ {}: {} observation(s)",
                        version.version,
                        version.updated_at,
                        version.observations.len()
                    );
                }
            })
        }

        Commands::At { timestamp } => {
            let graph = manager.get_graph_at_time(timestamp).await?;
            out.emit(&graph, || print_graph(&graph))
        }

        Commands::Tool { name, args } => {
            let args: Value = serde_json::from_str(&args)
                .with_context(|| format!("Tool arguments are not valid JSON: {}", args))?;
            let router = ToolRouter::new(Arc::clone(&manager));
            let result = router.dispatch(&name, args).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }

        Commands::Tools => {
            for name in ToolRouter::tool_names() {
                println!("{}", name);
            }
            Ok(())
        }

        Commands::Worker { once } => cmd_worker(&manager, &config, &out, once).await,

        Commands::Config { action } => cmd_config(action, &config_path, cli.quiet),
    }
}

// ============================================================================
// Output
// ============================================================================

struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    /// JSON prints `value`; text runs `text` unless quiet
    fn emit<T: serde::Serialize>(&self, value: &T, text: impl FnOnce()) -> anyhow::Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Text if !self.quiet => text(),
            OutputFormat::Text => {}
        }
        Ok(())
    }
}

fn print_graph(graph: &KnowledgeGraph) {
    if graph.is_empty() {
        println!("Graph is empty.");
        return;
    }
    for entity in &graph.entities {
        println!("{} ({})", entity.name, entity.entity_type);
        for observation in &entity.observations {
            println!("  - {}", observation);
        }
    }
    if !graph.relations.is_empty() {
        println!();
        for relation in &graph.relations {
            println!("{} -[{}]-> {}", relation.from, relation.relation_type, relation.to);
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_create_entity(
    manager: &KnowledgeGraphManager,
    out: &Output,
    name: String,
    entity_type: String,
    observations: Vec<String>,
) -> anyhow::Result<()> {
    let entity = Entity::new(name, entity_type).with_observations(observations);
    let results = manager.create_entities(vec![entity]).await?;

    if let Some(result) = results.first()
        && let EntityOutcome::Rejected { reason } = &result.outcome
    {
        anyhow::bail!("Entity '{}' rejected: {}", result.name, reason);
    }
    out.emit(&results, || {
        for result in &results {
            let status = match result.outcome {
                EntityOutcome::Created => "created",
                EntityOutcome::Updated => "updated",
                EntityOutcome::Unchanged => "unchanged",
                EntityOutcome::Rejected { .. } => "rejected",
            };
            println!("Entity '{}' {}", result.name, status);
        }
    })
}

async fn cmd_relate(
    manager: &KnowledgeGraphManager,
    out: &Output,
    relation: Relation,
) -> anyhow::Result<()> {
    let key: RelationKey = relation.key();
    let results = manager.create_relations(vec![relation]).await?;

    if let Some(result) = results.first()
        && let RelationOutcome::Rejected { reason } = &result.outcome
    {
        anyhow::bail!("Relation {} rejected: {}", key, reason);
    }
    out.emit(&results, || {
        for result in &results {
            match result.outcome {
                RelationOutcome::AlreadyExists => {
                    println!("Relation {} already exists", result.relation)
                }
                _ => println!("Relation {} created", result.relation),
            }
        }
    })
}

async fn cmd_worker(
    manager: &KnowledgeGraphManager,
    config: &Config,
    out: &Output,
    once: bool,
) -> anyhow::Result<()> {
    let jobs = manager
        .embedding_jobs()
        .cloned()
        .context("No embedding service configured")?;
    let scheduled = manager.schedule_missing_embeddings().await?;

    if once {
        let mut total = 0;
        loop {
            let report = jobs.process_jobs(jobs.batch_size()).await;
            total += report.successful;
            if report.failed > 0 {
                warn!(failed = report.failed, "Some embedding jobs failed");
            }
            if report.processed == 0 || report.remaining == 0 {
                break;
            }
        }
        let status = jobs.queue_status().await;
        return out.emit(&status, || {
            println!("Embedded {} of {} queued entities", total, scheduled);
        });
    }

    let cancel = CancellationToken::new();
    let interval = Duration::from_secs(config.embedding.process_interval_secs.max(1));
    let worker = jobs.spawn_worker(interval, cancel.clone());
    info!(scheduled, "Embedding worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    cancel.cancel();
    worker.await.context("Embedding worker panicked")?;

    let status = jobs.queue_status().await;
    out.emit(&status, || {
        println!(
            "Stopped. {} completed, {} failed, {} pending",
            status.completed, status.failed, status.pending
        );
    })
}

fn cmd_config(action: ConfigAction, path: &Path, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load_from(path)?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load_from(path)?;
            config.set(&key, &value)?;
            config.save_to(path)?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load_from(path)?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::default().save_to(path)?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => println!("{}", path.display()),
    }
    Ok(())
}
