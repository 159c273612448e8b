// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::EngineConfig;

/// Fabstir Retrieval Engine CLI
#[derive(Parser, Debug)]
#[command(name = "retrieval-cli")]
#[command(version)]
#[command(about = "Ingest, query and maintain hybrid retrieval indexes", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "RETRIEVAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory (overrides the configuration file)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest embedding records from a JSON-lines file
    Ingest(commands::IngestArgs),

    /// Run a hybrid query and print fused results or a context bundle
    Query(commands::QueryArgs),

    /// Delete every embedding stored under an id
    Delete(commands::DeleteArgs),

    /// Rebuild one index, or all of them
    Rebuild(commands::RebuildArgs),

    /// Show store and index counters
    Stats,
}

impl Cli {
    /// Configuration from `--config` (or defaults), then environment, then flags
    pub fn load_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        config.apply_env();
        if let Some(dir) = &self.data_dir {
            config.index.data_dir = Some(dir.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

/// Execute CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    match cli.command {
        Commands::Ingest(args) => commands::ingest(config, args).await,
        Commands::Query(args) => commands::query(config, args).await,
        Commands::Delete(args) => commands::delete(config, args).await,
        Commands::Rebuild(args) => commands::rebuild(config, args).await,
        Commands::Stats => commands::stats(config).await,
    }
}
