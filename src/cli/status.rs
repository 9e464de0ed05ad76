use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use super::project::{Project, ProjectArgs};
use super::OutputConfig;
use crate::config::Config;
use crate::storage::{Query, Table};
use crate::vector::IndexStats;

#[derive(Args)]
pub struct StatusArgs {
    #[command(flatten)]
    project: ProjectArgs,
}

#[derive(Serialize)]
struct StatusOutput {
    status: String,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    store: Option<StoreCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<IndexStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedder: Option<String>,
}

#[derive(Serialize)]
struct StoreCounts {
    backend: String,
    bugs: usize,
    solutions: usize,
    clusters: usize,
}

pub async fn run(args: StatusArgs, output: OutputConfig) -> Result<()> {
    let root = args
        .project
        .path
        .canonicalize()
        .with_context(|| format!("Invalid path: {}", args.project.path.display()))?;

    if !Config::config_path(&root).exists() {
        if output.json {
            let json_output = StatusOutput {
                status: "not_initialized".to_string(),
                path: root.display().to_string(),
                store: None,
                index: None,
                embedder: None,
            };
            println!("{}", serde_json::to_string_pretty(&json_output)?);
        } else if !output.quiet {
            println!(
                "{} FixForge not initialized in {}",
                "!".yellow(),
                root.display()
            );
            println!("Run `fixforge init` to initialize.");
        }
        return Ok(());
    }

    let project = Project::open(&root)?;
    let store = project.open_store()?;
    let all = Query::new();
    let counts = StoreCounts {
        backend: store.backend_name().to_string(),
        bugs: store.query(Table::Bugs, &all).await?.len(),
        solutions: store.query(Table::Solutions, &all).await?.len(),
        clusters: store.query(Table::Clusters, &all).await?.len(),
    };

    // An unreachable index is reported, not fatal
    let index = match project.open_index().await {
        Ok(index) => match index.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!("Could not read index stats: {e}");
                None
            }
        },
        Err(e) => {
            tracing::warn!("Could not open index: {e:#}");
            None
        }
    };

    let embedder = format!("{:?}", project.config.embedding.backend).to_lowercase();

    if output.json {
        let json_output = StatusOutput {
            status: "ready".to_string(),
            path: root.display().to_string(),
            store: Some(counts),
            index,
            embedder: Some(embedder),
        };
        println!("{}", serde_json::to_string_pretty(&json_output)?);
    } else if !output.quiet {
        println!("{} FixForge status for {}\n", "✓".green(), root.display());
        println!("  Store:      {}", counts.backend.cyan());
        println!("  Bugs:       {}", counts.bugs);
        println!("  Solutions:  {}", counts.solutions);
        println!("  Clusters:   {}", counts.clusters);
        match &index {
            Some(stats) => {
                let total = stats
                    .total_vectors
                    .map_or_else(|| "unknown".to_string(), |n| n.to_string());
                println!("  Index:      {} ({})", stats.name.cyan(), stats.backend);
                println!("  Vectors:    {total}");
            }
            None => println!("  Index:      {}", "unavailable".red()),
        }
        println!("  Embedder:   {embedder}");
    }

    Ok(())
}
