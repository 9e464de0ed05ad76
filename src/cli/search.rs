use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use super::project::{Project, ProjectArgs};
use super::OutputConfig;
use crate::tracker::SearchHit;
use crate::types::BugStatus;

#[derive(Args)]
pub struct SearchArgs {
    /// The search query
    query: String,

    /// Maximum number of results (at most 50)
    #[arg(long, short = 'n', default_value = "10")]
    limit: usize,

    /// Only bugs with this severity
    #[arg(long)]
    severity: Option<String>,

    /// Only bugs with this status (open, in-progress, solved, needs-review)
    #[arg(long)]
    status: Option<BugStatus>,

    #[command(flatten)]
    project: ProjectArgs,
}

/// JSON output format for search results
#[derive(Serialize)]
struct SearchOutput<'a> {
    query: &'a str,
    limit: usize,
    count: usize,
    results: &'a [SearchHit],
}

pub async fn run(args: SearchArgs, output: OutputConfig) -> Result<()> {
    let project = Project::open(&args.project.path)?;
    let tracker = project.tracker().await?;
    let hits = tracker
        .semantic_search(&args.query, args.limit, args.severity.as_deref(), args.status)
        .await
        .context("Search failed")?;

    if output.json {
        let json_output = SearchOutput {
            query: &args.query,
            limit: args.limit,
            count: hits.len(),
            results: &hits,
        };
        println!("{}", serde_json::to_string_pretty(&json_output)?);
        return Ok(());
    }
    if output.quiet {
        return Ok(());
    }

    if hits.is_empty() {
        println!("No results found for: {}", args.query.cyan());
        return Ok(());
    }

    println!(
        "{} Found {} results for: {}\n",
        "✓".green(),
        hits.len(),
        args.query.cyan()
    );
    for hit in &hits {
        println!(
            "{}. {} {} {}",
            hit.rank,
            hit.bug_id.cyan(),
            hit.title.bold(),
            format!("({:.2}%)", hit.similarity).dimmed()
        );
        println!(
            "   {} · {} · {} solution(s)",
            hit.severity, hit.status, hit.solution_count
        );
    }

    Ok(())
}
