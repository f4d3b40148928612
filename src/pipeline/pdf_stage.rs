//! PDF stage: claim pending items, download and extract their documents.
//!
//! Workers claim items through the CAS transition (`pending` →
//! `processing`), run the document processor and persist the extraction
//! together with the final status in one transaction. Items whose grant
//! already has an extraction finish as completed skips; items without a
//! PDF URL are skipped; non-PDF downloads are skipped without an
//! extraction row.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::queue::{InProcessQueue, TaskQueue};
use super::retry::RetryPolicy;
use super::{task_retry_policy, with_deadlines, DeadlineError, StageStats, TaskDeadlines};
use crate::config::Settings;
use crate::models::{ProcessingStatus, Stage, StagingItem};
use crate::repository::{NewExtraction, Store};
use crate::services::pdf::{PdfError, PdfProcessor, EXTRACTION_METHOD};

/// Claim up to `limit` pending items and process them with the configured
/// worker pool. Returns the combined counters.
pub async fn run_pdf_batch(
    store: Arc<Store>,
    processor: Arc<PdfProcessor>,
    settings: &Settings,
    limit: u32,
) -> anyhow::Result<StageStats> {
    // Redeliver items a crashed worker left behind; their retry budget is
    // untouched because those attempts never completed.
    let released = store.release_stale_processing(chrono::Duration::seconds(
        settings.hard_deadline_secs as i64 * 2,
    ))?;
    if released > 0 {
        warn!("Released {} stale processing items back to pending", released);
    }

    let items = store.claim_pending(Stage::Pdf, limit)?;
    if items.is_empty() {
        info!("No staging items ready for PDF processing");
        return Ok(StageStats::default());
    }
    info!("Processing batch of {} PDFs", items.len());

    let deadlines = TaskDeadlines::from_settings(settings);
    let policy = task_retry_policy(settings);
    let max_retries = settings.max_task_retries;
    let queue = Arc::new(InProcessQueue::new(items));

    let mut handles = Vec::with_capacity(settings.pdf_workers);
    for _ in 0..settings.pdf_workers {
        let store = store.clone();
        let processor = processor.clone();
        let queue = queue.clone();
        let policy = policy.clone();

        handles.push(tokio::spawn(async move {
            let mut stats = StageStats::default();
            while let Some(item) = queue.pop().await {
                stats.processed += 1;
                match process_item(&store, &processor, &item, deadlines, &policy, max_retries)
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
        "PDF batch done: processed={} completed={} skipped={} failed={}",
        stats.processed, stats.completed, stats.skipped, stats.failed
    );
    Ok(stats)
}

enum ItemOutcome {
    Completed,
    Skipped,
    Failed,
}

async fn process_item(
    store: &Store,
    processor: &PdfProcessor,
    item: &StagingItem,
    deadlines: TaskDeadlines,
    policy: &RetryPolicy,
    max_retries: u32,
) -> ItemOutcome {
    let external_id = item.external_id.clone();

    let grant = match resolve_grant(store, item) {
        Ok(Some(grant)) => grant,
        Ok(None) => {
            error!("Grant not found for staging item {}", external_id);
            finalize(store, item, ProcessingStatus::Failed, Some("Grant not found"));
            return ItemOutcome::Failed;
        }
        Err(e) => {
            error!("Lookup failed for {}: {}", external_id, e);
            finalize(store, item, ProcessingStatus::Failed, Some(&e.to_string()));
            return ItemOutcome::Failed;
        }
    };

    // Dedup: one extraction per grant
    match store.extraction_exists_for_grant(grant.id) {
        Ok(true) => {
            info!("Extraction already exists for {}, skipping", external_id);
            finalize(store, item, ProcessingStatus::Completed, None);
            return ItemOutcome::Skipped;
        }
        Ok(false) => {}
        Err(e) => {
            finalize(store, item, ProcessingStatus::Failed, Some(&e.to_string()));
            return ItemOutcome::Failed;
        }
    }

    let Some(pdf_url) = item.pdf_url.clone() else {
        warn!("No PDF URL for {}, skipping", external_id);
        finalize(store, item, ProcessingStatus::Skipped, Some("No PDF URL"));
        return ItemOutcome::Skipped;
    };

    // Attempt loop over the item's persisted retry budget
    let mut attempt = item.retry_count;
    loop {
        let result = with_deadlines(
            deadlines,
            &format!("pdf task {external_id}"),
            processor.process(&pdf_url, &external_id),
        )
        .await;

        match result {
            Ok(artifact) => {
                let extraction_error = if artifact.text.is_empty() {
                    Some("No text extracted (scanned PDF?)".to_string())
                } else {
                    None
                };
                let new = NewExtraction {
                    grant_id: grant.id,
                    staging_id: item.id,
                    external_id: external_id.clone(),
                    extracted_text: Some(artifact.text.clone()),
                    markdown_path: Some(artifact.markdown_path.display().to_string()),
                    page_count: Some(artifact.page_count),
                    word_count: Some(artifact.word_count),
                    is_scanned: artifact.is_scanned,
                    extraction_model: EXTRACTION_METHOD.to_string(),
                    extraction_error,
                };
                return match store.complete_pdf_stage(&new) {
                    Ok(_) => ItemOutcome::Completed,
                    Err(e) if e.is_unique_violation() => {
                        // Raced another worker: the extraction exists, done
                        finalize(store, item, ProcessingStatus::Completed, None);
                        ItemOutcome::Skipped
                    }
                    Err(e) => {
                        error!("Failed to persist extraction for {}: {}", external_id, e);
                        finalize(store, item, ProcessingStatus::Failed, Some(&e.to_string()));
                        ItemOutcome::Failed
                    }
                };
            }
            Err(DeadlineError::Task(PdfError::NotPdf(reason))) => {
                warn!("Not a PDF for {}: {}", external_id, reason);
                finalize(store, item, ProcessingStatus::Skipped, Some(&reason));
                return ItemOutcome::Skipped;
            }
            Err(DeadlineError::Task(PdfError::TooLarge { size, max })) => {
                let message = format!("PDF too large: {size} bytes (max {max})");
                finalize(store, item, ProcessingStatus::Failed, Some(&message));
                return ItemOutcome::Failed;
            }
            Err(error) => {
                let message = error.to_string();
                let count = match store.record_attempt_failure(item.id, &message) {
                    Ok(count) => count,
                    Err(e) => {
                        error!("Failed to record attempt for {}: {}", external_id, e);
                        finalize(store, item, ProcessingStatus::Failed, Some(&message));
                        return ItemOutcome::Failed;
                    }
                };
                if count >= max_retries {
                    error!(
                        "Retries exhausted for {} after {} attempts: {}",
                        external_id, count, message
                    );
                    finalize(store, item, ProcessingStatus::Failed, Some(&message));
                    return ItemOutcome::Failed;
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "Attempt {}/{} failed for {} ({}), retrying in {:?}",
                    count, max_retries, external_id, message, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn resolve_grant(
    store: &Store,
    item: &StagingItem,
) -> crate::repository::Result<Option<crate::models::Grant>> {
    match item.grant_id {
        Some(grant_id) => store.get_grant(grant_id),
        None => store.get_grant_by_external_id(&item.external_id),
    }
}

/// Final status transition out of `processing`.
fn finalize(store: &Store, item: &StagingItem, to: ProcessingStatus, error: Option<&str>) {
    let result = store.transition_status(
        item.id,
        &[ProcessingStatus::Processing],
        to,
        Stage::Pdf,
        error,
    );
    match result {
        Ok(true) => {}
        Ok(false) => warn!(
            "Item {} no longer owned by this worker, transition to {} dropped",
            item.external_id,
            to.as_str()
        ),
        Err(e) => error!("Status transition failed for {}: {}", item.external_id, e),
    }
}
