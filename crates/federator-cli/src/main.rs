//! Federator CLI - federated knowledge-graph query orchestrator

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use federator_core::config::{Config, RetrievalMode};
use federator_core::message::Envelope;
use federator_core::{Federator, new_job_id};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "federator")]
#[command(
    author,
    version,
    about = "Federated knowledge-graph query orchestrator",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

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
    /// Answer a query read from a JSON file
    Query {
        /// Path to the query envelope
        file: PathBuf,
        /// Job id to record status under (generated if omitted)
        #[arg(long)]
        job_id: Option<String>,
        /// Neither read nor write the result cache
        #[arg(long)]
        bypass_cache: bool,
        /// Recompute and replace any cached answer
        #[arg(long)]
        overwrite_cache: bool,
        /// Write the response envelope to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the status of a job
    Status {
        /// Job id
        job_id: String,
    },

    /// Preview the sub-queries a creative query expands into
    Expand {
        /// Path to the query envelope
        file: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show config file path
    Path,
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Write a default config file if none exists
    Init {
        /// Replace an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout stays parseable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("federator=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Query {
            file,
            job_id,
            bypass_cache,
            overwrite_cache,
            output,
        } => {
            let options = QueryOptions {
                job_id,
                bypass_cache,
                overwrite_cache,
                output,
            };
            cmd_query(&file, options, cli.format, cli.quiet).await
        }

        Commands::Status { job_id } => cmd_status(&job_id, cli.format, cli.quiet).await,

        Commands::Expand { file } => cmd_expand(&file, cli.format, cli.quiet).await,

        Commands::Config { action } => cmd_config(action, cli.format, cli.quiet),
    }
}

struct QueryOptions {
    job_id: Option<String>,
    bypass_cache: bool,
    overwrite_cache: bool,
    output: Option<PathBuf>,
}

fn read_envelope(path: &Path) -> anyhow::Result<Envelope> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read query file: {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse query file: {}", path.display()))
}

fn apply_cache_flags(envelope: &mut Envelope, bypass_cache: bool, overwrite_cache: bool) {
    if bypass_cache {
        envelope.bypass_cache = true;
    }
    if overwrite_cache {
        envelope
            .parameters
            .get_or_insert_with(Default::default)
            .insert("overwrite_cache".to_string(), Value::Bool(true));
    }
}

async fn open_federator() -> anyhow::Result<Federator> {
    build_federator(Config::load()?).await
}

async fn build_federator(config: Config) -> anyhow::Result<Federator> {
    debug!(retrieval = %config.retrieval.base_url, "Loaded configuration");
    Ok(Federator::from_config(config).await?)
}

/// Batched retrieval answers through callbacks, and this process has no
/// listener to receive them
fn ensure_direct_retrieval(config: &Config) -> anyhow::Result<()> {
    match config.retrieval.mode {
        RetrievalMode::Direct => Ok(()),
        RetrievalMode::Batched => Err(anyhow!(
            "retrieval.mode is batched, which needs a callback listener at {}. \
             The CLI cannot receive callbacks; run `federator config set retrieval.mode direct`.",
            config.retrieval.callback_host
        )),
    }
}

async fn cmd_query(
    file: &Path,
    options: QueryOptions,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let mut envelope = read_envelope(file)?;
    apply_cache_flags(&mut envelope, options.bypass_cache, options.overwrite_cache);

    let config = Config::load()?;
    ensure_direct_retrieval(&config)?;
    let federator = build_federator(config).await?;
    let job_id = options.job_id.unwrap_or_else(new_job_id);
    info!(job_id = %job_id, "Running query");

    let (answer, status) = match federator.execute(envelope, &job_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            return Err(anyhow!(
                "Query rejected ({} {}): {}",
                e.http_status(),
                e.code(),
                e
            ));
        }
    };

    let response = serde_json::to_string_pretty(&answer)?;
    if let Some(path) = &options.output {
        fs::write(path, &response)
            .with_context(|| format!("Failed to write response: {}", path.display()))?;
    }

    match format {
        OutputFormat::Json => {
            if options.output.is_some() {
                let summary = json!({
                    "job_id": job_id,
                    "status": status,
                    "results": answer.result_count(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", response);
            }
        }
        OutputFormat::Text => {
            if !quiet {
                println!("Job:     {}", job_id);
                println!("Status:  {}", status);
                println!("Results: {}", answer.result_count());
                for entry in &answer.logs {
                    println!(
                        "  [{}] {}",
                        entry.level.as_deref().unwrap_or("INFO"),
                        entry.message
                    );
                }
            }
            match &options.output {
                Some(path) => {
                    if !quiet {
                        println!("Response written to {}", path.display());
                    }
                }
                None => println!("{}", response),
            }
        }
    }

    if status != 200 {
        return Err(anyhow!("Query finished with status {}", status));
    }
    Ok(())
}

async fn cmd_status(job_id: &str, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let federator = open_federator().await?;
    let report = federator.status(job_id).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("{}: {}", job_id, report.status);
            if !quiet {
                println!("{}", report.description);
                for entry in &report.logs {
                    println!(
                        "  {} [{}] {}",
                        entry.timestamp,
                        entry.level.as_deref().unwrap_or("INFO"),
                        entry.message
                    );
                }
            }
        }
    }
    Ok(())
}

async fn cmd_expand(file: &Path, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let envelope = read_envelope(file)?;
    let federator = open_federator().await?;
    let queries = federator
        .expand(&envelope)
        .map_err(|e| anyhow!("Cannot expand query ({}): {}", e.code(), e))?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&queries)?),
        OutputFormat::Text => {
            if !quiet {
                println!("{} sub-queries", queries.len());
            }
            for (i, query) in queries.iter().enumerate() {
                let edges: Vec<String> = query
                    .query_graph()
                    .map(|qg| {
                        qg.edges
                            .iter()
                            .map(|(id, edge)| {
                                format!(
                                    "{}: {} -[{}]-> {}",
                                    id,
                                    edge.subject,
                                    edge.first_predicate().unwrap_or("?"),
                                    edge.object
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                println!("query_{}  {}", i + 1, edges.join(", "));
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Text => print!("{}", toml::to_string_pretty(&config)?),
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            match format {
                OutputFormat::Json => {
                    let map: serde_json::Map<String, Value> = items
                        .into_iter()
                        .map(|(k, v)| (k, Value::String(v)))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
                OutputFormat::Text => {
                    for (key, value) in items {
                        println!("{} = {}", key, value);
                    }
                }
            }
        }
        ConfigAction::Init { force } => {
            let path = Config::config_path()?;
            if path.exists() && !force {
                return Err(anyhow!(
                    "Config file already exists: {} (use --force to replace it)",
                    path.display()
                ));
            }
            Config::default().save()?;
            if !quiet {
                println!("Wrote default configuration to {}", path.display());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_query_flags_parse() {
        let cli = Cli::try_parse_from([
            "federator",
            "query",
            "q.json",
            "--job-id",
            "abc",
            "--bypass-cache",
            "--format",
            "json",
        ])
        .unwrap();
        assert!(cli.format == OutputFormat::Json);
        match cli.command {
            Commands::Query {
                file,
                job_id,
                bypass_cache,
                overwrite_cache,
                output,
            } => {
                assert_eq!(file, PathBuf::from("q.json"));
                assert_eq!(job_id.as_deref(), Some("abc"));
                assert!(bypass_cache);
                assert!(!overwrite_cache);
                assert!(output.is_none());
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn test_query_requires_direct_retrieval() {
        let mut config = Config::default();
        let err = ensure_direct_retrieval(&config).unwrap_err();
        assert!(err.to_string().contains("retrieval.mode direct"));

        config.retrieval.mode = RetrievalMode::Direct;
        assert!(ensure_direct_retrieval(&config).is_ok());
    }

    #[test]
    fn test_cache_flags_applied() {
        let mut envelope = Envelope::default();
        apply_cache_flags(&mut envelope, false, true);
        assert!(!envelope.bypass_cache);
        assert!(envelope.overwrite_cache());

        apply_cache_flags(&mut envelope, true, false);
        assert!(envelope.bypass_cache);
    }
}
