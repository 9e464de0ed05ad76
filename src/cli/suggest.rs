use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::project::{Project, ProjectArgs};
use super::OutputConfig;

#[derive(Args)]
pub struct SuggestArgs {
    /// Bug to suggest a fix for
    bug_id: String,

    /// Also print the prompt sent to the model
    #[arg(long)]
    show_prompt: bool,

    #[command(flatten)]
    project: ProjectArgs,
}

pub async fn run(args: SuggestArgs, output: OutputConfig) -> Result<()> {
    let project = Project::open(&args.project.path)?;
    let tracker = project.tracker().await?;
    let suggestion = tracker
        .suggest_fix(&args.bug_id)
        .await
        .with_context(|| format!("Failed to generate a fix for {}", args.bug_id))?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&suggestion)?);
        return Ok(());
    }

    if args.show_prompt {
        println!("{}\n{}\n", "Prompt:".bold(), suggestion.prompt.dimmed());
    }
    if !output.quiet {
        println!(
            "{} Suggestion from {} using {} similar case(s)\n",
            "✓".green(),
            suggestion.model_used.cyan(),
            suggestion.rag_context_count
        );
    }
    println!("{}", suggestion.suggestion);

    Ok(())
}
