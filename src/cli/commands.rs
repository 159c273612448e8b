// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{anyhow, Context, Result};
use clap::Args;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engine::RetrievalEngine;
use crate::rag::{HybridQuery, MetadataFilter};
use crate::vector::types::{EmbeddingRecord, Metadata, Modality};

/// Arguments for the ingest command
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// JSON-lines file, one record per line:
    /// `{"id"?, "modality", "collection", "vector", "metadata"?}`
    pub file: PathBuf,

    /// Stop at the first rejected record instead of skipping it
    #[arg(long)]
    pub strict: bool,
}

/// Arguments for the query command
#[derive(Args, Debug)]
pub struct QueryArgs {
    /// JSON file holding the query: an array of floats, or
    /// `{"vector": [...], "modality_vectors": {"image_text": [...]}}`
    #[arg(long)]
    pub vector_file: PathBuf,

    /// Number of fused results
    #[arg(long)]
    pub k: Option<usize>,

    /// Restrict to these collections (repeatable)
    #[arg(long)]
    pub collection: Vec<String>,

    /// Restrict to these modalities (repeatable)
    #[arg(long)]
    pub modality: Vec<Modality>,

    /// Metadata filter as JSON, e.g. '{"owner": {"$eq": "alice"}}'
    #[arg(long)]
    pub filter: Option<String>,

    /// Search-time candidate list size
    #[arg(long)]
    pub ef: Option<usize>,

    /// Print a composed context bundle instead of raw results
    #[arg(long)]
    pub compose: bool,

    /// Character budget for --compose
    #[arg(long)]
    pub budget: Option<usize>,
}

/// Arguments for the delete command
#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub id: String,

    /// Only delete the embedding for this modality
    #[arg(long)]
    pub modality: Option<Modality>,
}

/// Arguments for the rebuild command
#[derive(Args, Debug)]
pub struct RebuildArgs {
    #[arg(long, requires = "collection")]
    pub modality: Option<Modality>,

    #[arg(long, requires = "modality")]
    pub collection: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IngestLine {
    /// Generated when absent
    #[serde(default)]
    id: Option<String>,
    modality: Modality,
    collection: String,
    vector: Vec<f32>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QueryFile {
    Vector(Vec<f32>),
    Detailed {
        #[serde(default)]
        vector: Option<Vec<f32>>,
        #[serde(default)]
        modality_vectors: BTreeMap<Modality, Vec<f32>>,
    },
}

async fn open_engine(config: EngineConfig) -> Result<RetrievalEngine> {
    if config.index.data_dir.is_none() {
        warn!("No data directory configured; changes will not outlive this process");
    }
    Ok(RetrievalEngine::open(config).await?)
}

pub async fn ingest(config: EngineConfig, args: IngestArgs) -> Result<()> {
    let engine = open_engine(config).await?;
    let file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("cannot open {}", args.file.display()))?;

    let mut lines = BufReader::new(file).lines();
    let (mut accepted, mut rejected, mut line_no) = (0usize, 0usize, 0usize);
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let outcome = match serde_json::from_str::<IngestLine>(&line) {
            Ok(parsed) => {
                let id = parsed
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let mut record =
                    EmbeddingRecord::new(id, parsed.modality, parsed.collection, parsed.vector);
                record.metadata = parsed.metadata;
                engine.put(record).await.map_err(anyhow::Error::from)
            }
            Err(e) => Err(anyhow::Error::from(e)),
        };
        match outcome {
            Ok(()) => accepted += 1,
            Err(e) if args.strict => return Err(e.context(format!("line {}", line_no))),
            Err(e) => {
                rejected += 1;
                warn!("Skipping line {}: {}", line_no, e);
            }
        }
    }

    let snapshots = engine.persist().await?;
    info!(
        "✅ Ingested {} records ({} rejected), {} index snapshots written",
        accepted, rejected, snapshots
    );
    println!("ingested: {}  rejected: {}", accepted, rejected);
    Ok(())
}

pub async fn query(config: EngineConfig, args: QueryArgs) -> Result<()> {
    let engine = open_engine(config).await?;

    let raw = tokio::fs::read_to_string(&args.vector_file)
        .await
        .with_context(|| format!("cannot read {}", args.vector_file.display()))?;
    let mut query = match serde_json::from_str::<QueryFile>(&raw)? {
        QueryFile::Vector(vector) => HybridQuery::new(vector),
        QueryFile::Detailed {
            vector,
            modality_vectors,
        } => HybridQuery {
            vector,
            modality_vectors,
            ..Default::default()
        },
    };
    query.k = args.k;
    query.ef = args.ef;
    query.collections = args.collection;
    if !args.modality.is_empty() {
        query.modalities = Some(args.modality);
    }
    if let Some(filter) = &args.filter {
        let value: serde_json::Value =
            serde_json::from_str(filter).map_err(|e| anyhow!("invalid --filter JSON: {}", e))?;
        query.filter = MetadataFilter::from_json(&value)?;
    }

    let results = engine.retrieve(&query).await?;
    if args.compose {
        let bundle = engine.compose(&results, args.budget);
        println!("{}", bundle.render());
    } else {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    Ok(())
}

pub async fn delete(config: EngineConfig, args: DeleteArgs) -> Result<()> {
    let engine = open_engine(config).await?;
    let removed = match args.modality {
        Some(modality) => engine.delete_modality(&args.id, modality).await?,
        None => engine.delete(&args.id).await?,
    };
    engine.persist().await?;
    println!("deleted {} embeddings for {}", removed, args.id);
    Ok(())
}

pub async fn rebuild(config: EngineConfig, args: RebuildArgs) -> Result<()> {
    let engine = open_engine(config).await?;
    match (args.modality, args.collection) {
        (Some(modality), Some(collection)) => {
            let generation = engine.rebuild(modality, &collection)?;
            println!("rebuilt {}/{} (generation {})", modality, collection, generation);
        }
        _ => {
            let count = engine.rebuild_all()?;
            println!("rebuilt {} indexes", count);
        }
    }
    engine.persist().await?;
    Ok(())
}

pub async fn stats(config: EngineConfig) -> Result<()> {
    let engine = open_engine(config).await?;
    let stats = engine.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
