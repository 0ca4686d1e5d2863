//! Commands that read or edit the encoding store directly.

use anyhow::{bail, Context, Result};
use rollcall_core::{FeatureVector, NearestNeighbor};
use rollcall_engine::source::{validate_subject_id, DirectorySource, ReferenceSource};
use rollcall_engine::{Config, EncodingStore};

async fn open_store(config: &Config) -> Result<EncodingStore> {
    EncodingStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open encoding store {}", config.db_path.display()))
}

pub async fn status(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let stats = store.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Store:          {}", config.db_path.display());
        println!("Reference dir:  {}", config.face_db_dir.display());
        println!(
            "Schema version: {}",
            stats.schema_version.as_deref().unwrap_or("(empty)")
        );
        println!("Subjects:       {}", stats.subjects);
        println!("Vectors:        {}", stats.vectors);
        match stats.dimension {
            Some(d) => println!("Dimension:      {d}"),
            None => println!("Dimension:      (not fixed)"),
        }
        println!(
            "Last refresh:   {}",
            stats.last_refresh.as_deref().unwrap_or("never")
        );
    }

    store.close().await?;
    Ok(())
}

pub async fn list(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let subjects = store.list_subjects().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&subjects)?);
    } else if subjects.is_empty() {
        println!("No subjects enrolled.");
    } else {
        println!("{:<24} {:>8} {:>6}  UPDATED", "SUBJECT", "VECTORS", "DIM");
        for s in &subjects {
            println!(
                "{:<24} {:>8} {:>6}  {}",
                s.subject_id, s.vector_count, s.dimension, s.updated_at
            );
        }
    }

    store.close().await?;
    Ok(())
}

pub async fn remove(config: &Config, subject_id: &str) -> Result<()> {
    validate_subject_id(subject_id)?;

    let store = open_store(config).await?;
    let removed_row = store.remove_subject(subject_id).await?;
    let images = DirectorySource::new(&config.face_db_dir).remove(subject_id)?;
    store.close().await?;

    if !removed_row && images == 0 {
        bail!("subject '{subject_id}' not found");
    }
    println!("Removed {subject_id} ({images} reference image(s)).");
    Ok(())
}

pub async fn reset(config: &Config, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to delete all encodings without --yes");
    }
    let store = open_store(config).await?;
    store.clear().await?;
    store.close().await?;
    tracing::info!(path = %config.db_path.display(), "encoding store cleared");
    println!("Encoding store cleared. Reference images were left in place.");
    Ok(())
}

/// Parse a query vector from inline JSON or `@file`.
fn parse_query(raw: &str) -> Result<FeatureVector> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read query file {path}"))?,
        None => raw.to_string(),
    };
    let values: Vec<f32> =
        serde_json::from_str(&text).context("query must be a JSON array of numbers")?;
    let vector = FeatureVector::new(values);
    if vector.dim() == 0 || !vector.is_finite() {
        bail!("query vector is empty or contains non-finite values");
    }
    Ok(vector)
}

pub async fn match_query(
    config: &Config,
    raw_query: &str,
    threshold: Option<f32>,
    json: bool,
) -> Result<()> {
    let query = parse_query(raw_query)?;
    let threshold = threshold.unwrap_or(config.similarity_threshold);

    let store = open_store(config).await?;
    let cache = store
        .load()
        .await
        .context("encoding store unreadable")?
        .unwrap_or_default();
    store.close().await?;

    if let Some(dim) = cache.dimension {
        if dim != query.dim() {
            bail!(
                "query has {} dimensions, stored encodings have {dim}",
                query.dim()
            );
        }
    }

    let result = NearestNeighbor::new(config.distance_metric).best_match(&query, &cache.records, threshold);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.matched {
        println!(
            "Match: {} (similarity {:.4}, threshold {threshold:.2})",
            result.subject_id.as_deref().unwrap_or("?"),
            result.similarity
        );
    } else {
        println!(
            "No match (best similarity {:.4}, threshold {threshold:.2})",
            result.similarity
        );
    }
    Ok(())
}
