use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use super::project::{Project, ProjectArgs};
use super::OutputConfig;
use crate::types::NewSolution;

#[derive(Args)]
pub struct SolveArgs {
    /// Bug the solution fixes
    bug_id: String,

    /// Why the fix works
    #[arg(long)]
    explanation: String,

    #[arg(long, default_value = "")]
    title: String,

    /// File with the fixed code
    #[arg(long)]
    code: Option<PathBuf>,

    /// File with a unified diff
    #[arg(long)]
    patch: Option<PathBuf>,

    /// Display name; "Anonymous" when omitted
    #[arg(long)]
    author: Option<String>,

    #[arg(long)]
    user: Option<String>,

    /// Mark the solution as produced by the generation service
    #[arg(long)]
    from_ai: bool,

    #[command(flatten)]
    project: ProjectArgs,
}

fn read_optional(path: Option<&PathBuf>) -> Result<Option<String>> {
    path.map(|p| {
        std::fs::read_to_string(p).with_context(|| format!("Failed to read {}", p.display()))
    })
    .transpose()
}

pub async fn run(args: SolveArgs, output: OutputConfig) -> Result<()> {
    let project = Project::open(&args.project.path)?;
    let code = read_optional(args.code.as_ref())?.unwrap_or_default();
    let patch = read_optional(args.patch.as_ref())?;

    let tracker = project.tracker().await?;
    let solution = tracker
        .add_solution(NewSolution {
            bug_id: args.bug_id.clone(),
            title: args.title,
            explanation: args.explanation,
            code,
            patch,
            user_id: args.user,
            author: args.author,
            from_ai: args.from_ai,
        })
        .await
        .with_context(|| format!("Failed to add solution to {}", args.bug_id))?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&solution)?);
    } else if !output.quiet {
        println!(
            "{} Solution {} recorded, {} marked Solved",
            "✓".green(),
            solution.id.dimmed(),
            solution.bug_id.cyan()
        );
    }

    Ok(())
}
