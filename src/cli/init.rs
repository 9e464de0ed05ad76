use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

use super::OutputConfig;
use crate::config::{Config, EmbeddingBackend, IndexBackend, StoreBackend};
use crate::storage::SqliteStore;
use crate::vector::LocalIndex;

#[derive(Args)]
pub struct InitArgs {
    /// Directory to initialize (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Record store backend
    #[arg(long, value_enum, default_value = "sqlite")]
    store: StoreBackend,

    /// Vector index backend
    #[arg(long, value_enum, default_value = "local")]
    index: IndexBackend,

    /// Embedding backend
    #[arg(long, value_enum, default_value = "onnx")]
    embedder: EmbeddingBackend,

    /// Overwrite existing configuration and local data
    #[arg(long)]
    force: bool,
}

#[derive(Serialize)]
struct InitOutput {
    status: String,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vectors: Option<String>,
}

pub async fn run(args: InitArgs, output: OutputConfig) -> Result<()> {
    let root = args
        .path
        .canonicalize()
        .with_context(|| format!("Invalid path: {}", args.path.display()))?;

    let data_dir = Config::data_dir(&root);
    let config_path = Config::config_path(&root);
    let db_path = Config::db_path(&root);
    let vectors_path = Config::vectors_path(&root);

    if config_path.exists() && !args.force {
        if output.json {
            let json_output = InitOutput {
                status: "already_initialized".to_string(),
                path: data_dir.display().to_string(),
                config: Some(config_path.display().to_string()),
                database: None,
                vectors: None,
            };
            println!("{}", serde_json::to_string_pretty(&json_output)?);
        } else {
            bail!(
                "FixForge already initialized in {}. Use --force to reinitialize.",
                data_dir.display()
            );
        }
        return Ok(());
    }

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    let mut config = Config::default();
    config.store.backend = args.store;
    config.index.backend = args.index;
    config.embedding.backend = args.embedder;
    config.save(&config_path)?;

    if output.verbose && !output.quiet && !output.json {
        println!("  Creating config: {}", config_path.display());
    }

    let database = if args.store == StoreBackend::Sqlite {
        if args.force && db_path.exists() {
            std::fs::remove_file(&db_path).with_context(|| {
                format!("Failed to remove existing database: {}", db_path.display())
            })?;
        }
        SqliteStore::open(&db_path).with_context(|| {
            format!("Failed to initialize SQLite database: {}", db_path.display())
        })?;
        if output.verbose && !output.quiet && !output.json {
            println!("  Creating database: {}", db_path.display());
        }
        Some(db_path.display().to_string())
    } else {
        None
    };

    let vectors = if args.index == IndexBackend::Local {
        if args.force && vectors_path.exists() {
            std::fs::remove_file(&vectors_path).with_context(|| {
                format!(
                    "Failed to remove existing vector index: {}",
                    vectors_path.display()
                )
            })?;
        }
        LocalIndex::open(&vectors_path).with_context(|| {
            format!("Failed to initialize vector index: {}", vectors_path.display())
        })?;
        if output.verbose && !output.quiet && !output.json {
            println!("  Creating vector index: {}", vectors_path.display());
        }
        Some(vectors_path.display().to_string())
    } else {
        None
    };

    if output.json {
        let json_output = InitOutput {
            status: "initialized".to_string(),
            path: data_dir.display().to_string(),
            config: Some(config_path.display().to_string()),
            database,
            vectors,
        };
        println!("{}", serde_json::to_string_pretty(&json_output)?);
    } else if !output.quiet {
        println!(
            "{} FixForge initialized in {}",
            "✓".green(),
            data_dir.display()
        );
        println!("  Config:   {}", config_path.display());
        if let Some(database) = &database {
            println!("  Database: {database}");
        }
        if let Some(vectors) = &vectors {
            println!("  Vectors:  {vectors}");
        }
        println!("\nNext steps:");
        println!("  {} to file a bug", "fixforge submit --title ... --description ...".cyan());
        println!("  {} to search bugs", "fixforge search <query>".cyan());
    }

    Ok(())
}
