mod clusters;
mod context;
mod init;
mod project;
mod reindex;
mod related;
mod search;
mod solve;
mod status;
mod submit;
mod suggest;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::error::Error;

#[derive(Parser)]
#[command(name = "fixforge")]
#[command(about = "Duplicate detection, retrieval and clustering for bug reports")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Show detailed progress
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize fixforge in a directory
    Init(init::InitArgs),

    /// Submit a bug report, checking for duplicates first
    Submit(submit::SubmitArgs),

    /// Record a solution and mark the bug solved
    Solve(solve::SolveArgs),

    /// Show solved bugs similar to a bug, and the current clusters
    Related(related::RelatedArgs),

    /// Show the retrieval context or generation prompt for a bug
    Context(context::ContextArgs),

    /// Ask the generation service for a fix
    Suggest(suggest::SuggestArgs),

    /// Semantic search over bug reports
    Search(search::SearchArgs),

    /// Build, list and position bug clusters
    Clusters(clusters::ClustersArgs),

    /// Push every stored bug into the vector index
    Reindex(reindex::ReindexArgs),

    /// Show store and index status
    Status(status::StatusArgs),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let output = OutputConfig {
            json: self.json,
            quiet: self.quiet,
            verbose: self.verbose,
        };

        let result = match self.command {
            Commands::Init(args) => init::run(args, output).await,
            Commands::Submit(args) => submit::run(args, output).await,
            Commands::Solve(args) => solve::run(args, output).await,
            Commands::Related(args) => related::run(args, output).await,
            Commands::Context(args) => context::run(args, output).await,
            Commands::Suggest(args) => suggest::run(args, output).await,
            Commands::Search(args) => search::run(args, output).await,
            Commands::Clusters(args) => clusters::run(args, output).await,
            Commands::Reindex(args) => reindex::run(args, output).await,
            Commands::Status(args) => status::run(args, output).await,
        };

        if let (true, Err(err)) = (output.json, &result) {
            println!("{}", error_json(err));
        }
        result
    }
}

/// JSON body printed on stdout when a `--json` command fails
fn error_json(err: &anyhow::Error) -> serde_json::Value {
    let core = err.chain().find_map(|cause| cause.downcast_ref::<Error>());
    serde_json::json!({
        "error": core.map_or("command_failed", Error::status_code),
        "message": format!("{err:#}"),
        "retryable": core.is_some_and(Error::is_retryable),
    })
}

/// Output configuration passed to all commands
#[derive(Debug, Clone, Copy)]
pub struct OutputConfig {
    pub json: bool,
    pub quiet: bool,
    pub verbose: bool,
}
