use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use super::project::{Project, ProjectArgs};
use super::OutputConfig;
use crate::search::RagCase;

#[derive(Args)]
pub struct ContextArgs {
    /// Bug to build context for
    bug_id: String,

    /// Print the full generation prompt instead of the cases
    #[arg(long)]
    prompt: bool,

    #[command(flatten)]
    project: ProjectArgs,
}

#[derive(Serialize)]
struct ContextOutput<'a> {
    bug_id: &'a str,
    count: usize,
    cases: &'a [RagCase],
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

pub async fn run(args: ContextArgs, output: OutputConfig) -> Result<()> {
    let project = Project::open(&args.project.path)?;
    let tracker = project.tracker().await?;
    let (bug, context, prompt) = tracker
        .prompt_for(&args.bug_id)
        .await
        .with_context(|| format!("Failed to build context for {}", args.bug_id))?;

    if output.json {
        let json_output = ContextOutput {
            bug_id: &bug.id,
            count: context.len(),
            cases: &context.cases,
            prompt: args.prompt.then_some(prompt.as_str()),
        };
        println!("{}", serde_json::to_string_pretty(&json_output)?);
        return Ok(());
    }

    if args.prompt {
        println!("{prompt}");
        return Ok(());
    }
    if output.quiet {
        return Ok(());
    }

    if context.is_empty() {
        println!("{} No similar solved bugs for {}", "!".yellow(), bug.id);
        return Ok(());
    }
    println!(
        "{} {} similar solved bug(s) for {}:\n",
        "✓".green(),
        context.len(),
        bug.id.cyan()
    );
    for (i, case) in context.cases.iter().enumerate() {
        println!(
            "{}. {} {}",
            i + 1,
            case.bug_id.cyan(),
            format!("({:.1}% similar)", case.similarity_percentage).dimmed()
        );
        for line in case.solution_excerpt.lines() {
            println!("    {line}");
        }
        println!();
    }

    Ok(())
}
