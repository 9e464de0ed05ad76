use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::project::{Project, ProjectArgs};
use super::OutputConfig;

#[derive(Args)]
pub struct ReindexArgs {
    /// Count bugs without writing to the index
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    project: ProjectArgs,
}

pub async fn run(args: ReindexArgs, output: OutputConfig) -> Result<()> {
    let project = Project::open(&args.project.path)?;
    let tracker = project.tracker().await?;
    let show_progress = !output.quiet && !output.json;
    let report = tracker
        .reindex(args.dry_run, show_progress)
        .await
        .context("Reindex failed")?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !output.quiet {
        if args.dry_run {
            println!("{} Would index {} bugs", "~".yellow(), report.succeeded);
        } else {
            println!("{} Indexed {} bugs", "✓".green(), report.succeeded);
            if output.verbose {
                let stats = tracker.index_stats().await.context("Failed to read index stats")?;
                if let Some(total) = stats.total_vectors {
                    println!("  {} now holds {total} vectors", stats.name);
                }
            }
        }
        if !report.failed.is_empty() {
            println!(
                "{} {} failed: {}",
                "!".yellow(),
                report.failed.len(),
                report.failed.join(", ")
            );
        }
    }

    if report.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} bugs could not be indexed", report.failed.len())
    }
}
