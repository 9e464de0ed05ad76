use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use super::project::{Project, ProjectArgs};
use super::OutputConfig;
use crate::tracker::SubmitOutcome;
use crate::types::NewBug;

#[derive(Args)]
pub struct SubmitArgs {
    /// Short summary of the bug
    #[arg(long)]
    title: String,

    /// What happens and how to reproduce it
    #[arg(long)]
    description: String,

    #[arg(long, default_value = "Low")]
    severity: String,

    #[arg(long, default_value = "Web")]
    client_type: String,

    #[arg(long)]
    category: Option<String>,

    /// Tag, repeatable or comma separated
    #[arg(long = "tag", value_delimiter = ',')]
    tags: Vec<String>,

    /// File with the code that triggers the bug
    #[arg(long)]
    code: Option<PathBuf>,

    /// Language of the attached code
    #[arg(long)]
    language: Option<String>,

    /// Screenshot URL
    #[arg(long)]
    screenshot: Option<String>,

    #[arg(long)]
    screenshot_notes: Option<String>,

    /// Submitting user id
    #[arg(long)]
    user: Option<String>,

    #[command(flatten)]
    project: ProjectArgs,
}

pub async fn run(args: SubmitArgs, output: OutputConfig) -> Result<()> {
    let project = Project::open(&args.project.path)?;

    let code = match &args.code {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read code file: {}", path.display()))?,
        ),
        None => None,
    };

    let tracker = project.tracker().await?;
    let outcome = tracker
        .submit_bug(NewBug {
            title: args.title,
            description: args.description,
            category: args.category,
            severity: args.severity,
            client_type: args.client_type,
            tags: args.tags,
            user_id: args.user,
            code,
            code_language: args.language,
            screenshot: args.screenshot,
            screenshot_notes: args.screenshot_notes,
        })
        .await
        .context("Failed to submit bug")?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    if output.quiet {
        match &outcome {
            SubmitOutcome::Created { bug_id } | SubmitOutcome::Duplicate { bug_id, .. } => {
                println!("{bug_id}");
            }
        }
        return Ok(());
    }

    match outcome {
        SubmitOutcome::Created { bug_id } => {
            println!("{} Created bug {}", "✓".green(), bug_id.cyan());
        }
        SubmitOutcome::Duplicate {
            bug_id,
            similarity,
            has_solutions,
            solution_count,
        } => {
            println!(
                "{} Duplicate of {} ({:.2}% similar)",
                "!".yellow(),
                bug_id.cyan(),
                similarity
            );
            if has_solutions {
                println!("  {solution_count} solution(s) available");
            } else {
                println!("  No solutions yet");
            }
        }
    }

    Ok(())
}
