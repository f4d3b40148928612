//! LLM stage: fill the structured field schema of existing extractions.
//!
//! Selects extractions whose model tag differs from the target (the tag is
//! the version marker, so re-runs with a new model are permitted), asks the
//! LLM for summary and fields, applies the deterministic normalizer and
//! overwrites the extraction in one transaction. Throttled to the external
//! quota.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::queue::{InProcessQueue, TaskQueue};
use super::throttle::StageThrottle;
use super::{with_deadlines, StageStats, TaskDeadlines};
use crate::config::Settings;
use crate::models::{Extraction, ExtractionFields, Stage};
use crate::repository::Store;
use crate::services::llm::LlmClient;
use crate::services::normalizer::FieldNormalizer;
use crate::services::pdf::strip_markdown_header;

/// Process up to `limit` extractions through the LLM.
pub async fn run_llm_batch(
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    settings: &Settings,
    limit: u32,
    force_reprocess: bool,
) -> anyhow::Result<StageStats> {
    let extractions = store.extractions_needing_llm(llm.model(), force_reprocess, limit)?;
    if extractions.is_empty() {
        info!("No extractions need LLM processing");
        return Ok(StageStats::default());
    }
    if force_reprocess {
        warn!("Force reprocess enabled for {} extractions", extractions.len());
    }
    info!("LLM batch of {} extractions", extractions.len());

    let deadlines = TaskDeadlines::from_settings(settings);
    let throttle = Arc::new(StageThrottle::per_minute(settings.llm_rate_per_min));
    let queue = Arc::new(InProcessQueue::new(extractions));

    let mut handles = Vec::with_capacity(settings.llm_workers);
    for _ in 0..settings.llm_workers {
        let store = store.clone();
        let llm = llm.clone();
        let throttle = throttle.clone();
        let queue = queue.clone();

        handles.push(tokio::spawn(async move {
            let mut stats = StageStats::default();
            while let Some(extraction) = queue.pop().await {
                stats.processed += 1;
                match process_extraction(&store, &llm, &extraction, &throttle, deadlines).await {
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
        "LLM batch done: processed={} completed={} skipped={} failed={}",
        stats.processed, stats.completed, stats.skipped, stats.failed
    );
    Ok(stats)
}

enum ItemOutcome {
    Completed,
    Skipped,
    Failed,
}

/// Text to feed the LLM: the markdown artifact without its header when
/// available, the stored text otherwise.
fn load_text(extraction: &Extraction) -> Option<String> {
    if let Some(path) = &extraction.markdown_path {
        if let Ok(markdown) = std::fs::read_to_string(path) {
            let body = strip_markdown_header(&markdown).to_string();
            if !body.is_empty() {
                return Some(body);
            }
        }
    }
    extraction.extracted_text.clone()
}

async fn process_extraction(
    store: &Store,
    llm: &LlmClient,
    extraction: &Extraction,
    throttle: &StageThrottle,
    deadlines: TaskDeadlines,
) -> ItemOutcome {
    let external_id = extraction.external_id.clone();

    let Some(text) = load_text(extraction) else {
        warn!("No text available for {}", external_id);
        let _ = store.set_extraction_error(extraction.id, "No text available for LLM processing");
        return ItemOutcome::Skipped;
    };

    if text.trim().len() < 50 {
        // Too little text to extract anything; stamp the tag so the
        // selector stops offering the row
        info!("Text too short for LLM processing: {}", external_id);
        let result = store.upsert_extraction_fields(
            extraction.id,
            None,
            None,
            &ExtractionFields::default(),
            llm.model(),
            Some(0.0),
            Some("Text too short for LLM processing"),
        );
        if let Err(e) = result {
            error!("Failed to mark short extraction {}: {}", external_id, e);
            return ItemOutcome::Failed;
        }
        return ItemOutcome::Skipped;
    }

    throttle.acquire().await;

    let result = with_deadlines(
        deadlines,
        &format!("llm task {external_id}"),
        llm.process(&text, &external_id),
    )
    .await;

    let output = match result {
        Ok(output) => output,
        Err(error) => {
            // Model tag untouched: the row stays selectable for a re-run
            error!("LLM processing failed for {}: {}", external_id, error);
            let _ = store.set_extraction_error(extraction.id, &error.to_string());
            return ItemOutcome::Failed;
        }
    };

    let mut fields = ExtractionFields::from_json(&output.fields);
    FieldNormalizer::new().normalize_all(&mut fields);

    let parse_failed = output
        .fields
        .as_object()
        .map(|map| map.is_empty())
        .unwrap_or(true);
    // An unparseable fields response keeps the old model tag so the stage
    // can be re-run later
    let (model, error) = if parse_failed {
        (
            extraction.extraction_model.as_str(),
            Some("LLM returned no parseable fields"),
        )
    } else {
        (llm.model(), None)
    };

    let result = store.upsert_extraction_fields(
        extraction.id,
        if output.summary.is_empty() {
            None
        } else {
            Some(&output.summary)
        },
        Some(&text),
        &fields,
        model,
        Some(output.confidence),
        error,
    );

    match result {
        Ok(_) => {
            let _ = store.touch_stage(extraction.staging_id, Stage::Llm);
            if parse_failed {
                ItemOutcome::Failed
            } else {
                ItemOutcome::Completed
            }
        }
        Err(e) => {
            error!("Failed to persist LLM output for {}: {}", external_id, e);
            ItemOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn extraction_with(markdown_path: Option<String>, text: Option<String>) -> Extraction {
        Extraction {
            id: 1,
            grant_id: 1,
            staging_id: 1,
            external_id: "x".to_string(),
            extracted_text: text,
            extracted_summary: None,
            summary_preview: None,
            markdown_path,
            page_count: None,
            word_count: None,
            is_scanned: false,
            fields: ExtractionFields::default(),
            extraction_model: "lopdf".to_string(),
            extraction_confidence: None,
            extraction_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_load_text_prefers_markdown_body() {
        let dir = tempfile::tempdir().unwrap();
        let md_path = dir.path().join("doc.md");
        std::fs::write(
            &md_path,
            "# doc\n\n**Pages**: 1\n\n---\n\nCuerpo del artefacto.\n",
        )
        .unwrap();

        let extraction = extraction_with(
            Some(md_path.display().to_string()),
            Some("texto almacenado".to_string()),
        );
        assert_eq!(load_text(&extraction).as_deref(), Some("Cuerpo del artefacto."));
    }

    #[test]
    fn test_load_text_falls_back_to_stored_text() {
        let extraction = extraction_with(
            Some("/nonexistent/path.md".to_string()),
            Some("texto almacenado".to_string()),
        );
        assert_eq!(load_text(&extraction).as_deref(), Some("texto almacenado"));
        let extraction = extraction_with(None, None);
        assert_eq!(load_text(&extraction), None);
    }
}
