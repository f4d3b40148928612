//! Embed stage: one dense vector per extraction with usable text.
//!
//! Ingestion embeddings always use the SEMANTIC_SIMILARITY task type. The
//! input combines grant metadata, the summary and as much of the full text
//! as fits the client-side budget. Heavily throttled; the external quota is
//! small.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::queue::{InProcessQueue, TaskQueue};
use super::throttle::StageThrottle;
use super::{with_deadlines, StageStats, TaskDeadlines};
use crate::config::Settings;
use crate::models::{Extraction, Stage};
use crate::repository::Store;
use crate::services::embeddings::{prepare_text_for_embedding, EmbeddingClient, TaskType};

/// Generate embeddings for up to `limit` extractions. With `reprocess`,
/// existing embeddings are dropped and regenerated.
pub async fn run_embed_batch(
    store: Arc<Store>,
    embeddings: Arc<EmbeddingClient>,
    settings: &Settings,
    limit: u32,
    reprocess: bool,
) -> anyhow::Result<StageStats> {
    let extractions = if reprocess {
        store.extractions_with_text(limit)?
    } else {
        store.extractions_needing_embedding(limit)?
    };
    if extractions.is_empty() {
        info!("No extractions need embeddings");
        return Ok(StageStats::default());
    }
    info!(
        "Embedding batch of {} extractions (reprocess: {})",
        extractions.len(),
        reprocess
    );

    let deadlines = TaskDeadlines::from_settings(settings);
    let throttle = Arc::new(StageThrottle::per_minute(settings.embed_rate_per_min));
    let queue = Arc::new(InProcessQueue::new(extractions));

    let mut handles = Vec::with_capacity(settings.embed_workers);
    for _ in 0..settings.embed_workers {
        let store = store.clone();
        let embeddings = embeddings.clone();
        let throttle = throttle.clone();
        let queue = queue.clone();

        handles.push(tokio::spawn(async move {
            let mut stats = StageStats::default();
            while let Some(extraction) = queue.pop().await {
                stats.processed += 1;
                match embed_one(&store, &embeddings, &extraction, &throttle, deadlines, reprocess)
                    .await
                {
                    ItemOutcome::Completed => stats.completed += 1,
                    ItemOutcome::Skipped => stats.skipped += 1,
                    ItemOutcome::Failed => stats.failed += 1,
                }
            }
            stats
        }));
    }

    let mut stats = StageStats::default();
    for handle in handles {
        stats.absorb(&handle.await?);
    }

    info!(
        "Embed batch done: processed={} completed={} skipped={} failed={}",
        stats.processed, stats.completed, stats.skipped, stats.failed
    );
    Ok(stats)
}

enum ItemOutcome {
    Completed,
    Skipped,
    Failed,
}

async fn embed_one(
    store: &Store,
    embeddings: &EmbeddingClient,
    extraction: &Extraction,
    throttle: &StageThrottle,
    deadlines: TaskDeadlines,
    reprocess: bool,
) -> ItemOutcome {
    let external_id = extraction.external_id.clone();

    // Dedup: one embedding per extraction
    match store.embedding_exists_for_extraction(extraction.id) {
        Ok(true) if reprocess => {
            if let Err(e) = store.delete_embedding(extraction.id) {
                error!("Failed to drop embedding for {}: {}", external_id, e);
                return ItemOutcome::Failed;
            }
        }
        Ok(true) => {
            info!("Embedding already exists for {}, skipping", external_id);
            return ItemOutcome::Skipped;
        }
        Ok(false) => {}
        Err(e) => {
            error!("Lookup failed for {}: {}", external_id, e);
            return ItemOutcome::Failed;
        }
    }

    // Enrich the input with grant metadata when available
    let grant = store.get_grant(extraction.grant_id).ok().flatten();
    let metadata: Vec<(&str, Option<&str>)> = match &grant {
        Some(grant) => vec![
            ("titulo", grant.titulo.as_deref()),
            ("organismo", grant.organismo.as_deref()),
            ("ambito", grant.ambito.as_deref()),
        ],
        None => Vec::new(),
    };

    let text = prepare_text_for_embedding(
        extraction
            .summary_preview
            .as_deref()
            .or(extraction.extracted_summary.as_deref()),
        extraction.extracted_text.as_deref(),
        &metadata,
    );
    if text.len() < 50 {
        warn!("Text too short to embed for {}", external_id);
        return ItemOutcome::Skipped;
    }

    throttle.acquire().await;

    let result = with_deadlines(
        deadlines,
        &format!("embed task {external_id}"),
        embeddings.embed(&text, TaskType::SemanticSimilarity),
    )
    .await;

    let vector = match result {
        Ok(vector) => vector,
        Err(error) => {
            error!("Embedding failed for {}: {}", external_id, error);
            return ItemOutcome::Failed;
        }
    };

    match store.create_embedding(
        extraction.id,
        &vector,
        embeddings.model(),
        embeddings.dimensions(),
        Some(text.len()),
    ) {
        Ok(embedding) => {
            let _ = store.touch_stage(extraction.staging_id, Stage::Embed);
            info!(
                "Embedding {} stored for {} ({} dimensions)",
                embedding.id, external_id, embedding.dimensions
            );
            ItemOutcome::Completed
        }
        Err(e) if e.is_unique_violation() => {
            info!("Embedding raced into place for {}, skipping", external_id);
            ItemOutcome::Skipped
        }
        Err(e) => {
            error!("Failed to store embedding for {}: {}", external_id, e);
            ItemOutcome::Failed
        }
    }
}
