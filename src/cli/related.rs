use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::project::{Project, ProjectArgs};
use super::OutputConfig;

#[derive(Args)]
pub struct RelatedArgs {
    /// Bug to find related solved bugs for
    bug_id: String,

    #[command(flatten)]
    project: ProjectArgs,
}

pub async fn run(args: RelatedArgs, output: OutputConfig) -> Result<()> {
    let project = Project::open(&args.project.path)?;
    let tracker = project.tracker().await?;
    let related = tracker
        .related(&args.bug_id)
        .await
        .with_context(|| format!("Failed to find bugs related to {}", args.bug_id))?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&related)?);
        return Ok(());
    }
    if output.quiet {
        return Ok(());
    }

    if related.top_suggestions.is_empty() {
        println!("{} No related solved bugs for {}", "!".yellow(), args.bug_id);
    } else {
        let marker = if related.has_related {
            "✓".green()
        } else {
            "~".yellow()
        };
        println!(
            "{} {} related solved bug(s) for {}:\n",
            marker,
            related.top_suggestions.len(),
            args.bug_id.cyan()
        );
        for bug in &related.top_suggestions {
            println!(
                "  {} {} {}",
                bug.id.cyan(),
                format!("({:.2}%)", bug.similarity).dimmed(),
                bug.title.bold()
            );
            if output.verbose && !bug.description.is_empty() {
                println!("      {}", bug.description);
            }
        }
    }

    if !related.clusters.is_empty() {
        println!("\n{}", "Clusters:".bold());
        for cluster in &related.clusters {
            println!("  [{}] {} ({} bugs)", cluster.id, cluster.label, cluster.size);
        }
    }

    Ok(())
}
