use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use super::project::{Project, ProjectArgs};
use super::OutputConfig;
use crate::types::{ClusterPosition, ClusterRecord};

#[derive(Args)]
pub struct ClustersArgs {
    #[command(subcommand)]
    command: ClustersCommand,

    #[command(flatten)]
    project: ProjectArgs,
}

#[derive(Subcommand)]
enum ClustersCommand {
    /// Recompute clusters over the bug corpus
    Rebuild {
        /// Number of clusters (defaults to clusters.k)
        #[arg(long, short = 'k')]
        k: Option<usize>,

        /// Only cluster bugs with this status (defaults to clusters.status)
        #[arg(long)]
        status: Option<String>,
    },

    /// List stored clusters
    List,

    /// Save a layout position for a cluster
    Place {
        cluster_id: u32,
        x: f64,
        y: f64,
    },
}

pub async fn run(args: ClustersArgs, output: OutputConfig) -> Result<()> {
    let project = Project::open(&args.project.path)?;
    let tracker = project.tracker().await?;

    match args.command {
        ClustersCommand::Rebuild { k, status } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, stopping cluster rebuild");
                    on_signal.cancel();
                }
            });

            let clusters = tracker
                .rebuild_clusters(k, status.as_deref(), &cancel)
                .await
                .context("Cluster rebuild failed")?;

            if output.json {
                println!("{}", serde_json::to_string_pretty(&clusters)?);
            } else if !output.quiet {
                let total: usize = clusters.iter().map(|c| c.size).sum();
                println!(
                    "{} Built {} clusters over {} bugs",
                    "✓".green(),
                    clusters.len(),
                    total
                );
                print_clusters(&clusters, output.verbose);
            }
        }
        ClustersCommand::List => {
            let clusters = tracker.list_clusters().await.context("Failed to load clusters")?;
            if output.json {
                println!("{}", serde_json::to_string_pretty(&clusters)?);
            } else if !output.quiet {
                if clusters.is_empty() {
                    println!(
                        "No clusters yet. Run {} first.",
                        "fixforge clusters rebuild".cyan()
                    );
                } else {
                    print_clusters(&clusters, output.verbose);
                }
            }
        }
        ClustersCommand::Place { cluster_id, x, y } => {
            tracker
                .save_positions(&[ClusterPosition { cluster_id, x, y }])
                .await
                .with_context(|| format!("Failed to place cluster {cluster_id}"))?;
            if output.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ClusterPosition { cluster_id, x, y })?
                );
            } else if !output.quiet {
                println!("{} Cluster {} placed at ({x}, {y})", "✓".green(), cluster_id);
            }
        }
    }

    Ok(())
}

fn print_clusters(clusters: &[ClusterRecord], verbose: bool) {
    for cluster in clusters {
        let position = match (cluster.x, cluster.y) {
            (Some(x), Some(y)) => format!(" @ ({x}, {y})"),
            _ => String::new(),
        };
        println!(
            "  [{}] {} {}{}",
            cluster.cluster_id,
            cluster.display_label().bold(),
            format!("({} bugs)", cluster.size).dimmed(),
            position
        );
        if verbose {
            if let Some(updated) = cluster.last_updated {
                println!("      updated {}", updated.to_rfc3339());
            }
        }
    }
}
