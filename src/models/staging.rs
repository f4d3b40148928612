//! Staging items track each grant's progress through the pipeline.
//!
//! A staging item is created by the fetch stage with status `pending` and
//! advanced by whichever worker currently owns it. Terminal states are
//! `completed`, `failed` and `skipped`; a human-driven requeue can move a
//! terminal item back to `pending` with a fresh retry budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of a staging item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Fetched from the API, not yet processed.
    Pending,
    /// Currently owned by a worker.
    Processing,
    /// Successfully processed.
    Completed,
    /// Failed after the retry budget was exhausted.
    Failed,
    /// Refused by a stage (duplicate, no PDF URL).
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Terminal states are never advanced by the pipeline itself.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Pipeline stage identifiers, recorded as `last_stage` on staging items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Pdf,
    Llm,
    Embed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Pdf => "pdf",
            Self::Llm => "llm",
            Self::Embed => "embed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fetch" => Some(Self::Fetch),
            "pdf" => Some(Self::Pdf),
            "llm" => Some(Self::Llm),
            "embed" => Some(Self::Embed),
            _ => None,
        }
    }
}

/// The pipeline cursor for one grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingItem {
    /// Database row ID.
    pub id: i64,
    /// The registry's own identifier for the grant (numeroConvocatoria).
    pub external_id: String,
    /// Current lifecycle status.
    pub status: ProcessingStatus,
    /// Groups items produced by one fetch invocation.
    pub batch_id: Option<String>,
    /// Number of completed-and-failed attempts for the current stage.
    pub retry_count: u32,
    /// Which pipeline stage last touched this item.
    pub last_stage: Option<Stage>,
    /// Last error message, if any.
    pub error_message: Option<String>,
    /// URL of the authoritative PDF, cached from the grant.
    pub pdf_url: Option<String>,
    /// SHA-256 hex of `pdf_url`, for duplicate detection.
    pub pdf_url_hash: Option<String>,
    /// Linked grant row, once the grant has been persisted.
    pub grant_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the item reaches `completed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StagingItem {
    /// SHA-256 hex of a PDF URL.
    pub fn hash_pdf_url(url: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }
}
