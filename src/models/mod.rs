//! Data models for the ingestion pipeline.

mod embedding;
mod extraction;
mod grant;
mod staging;

pub use embedding::{cosine_similarity, decode_vector, encode_vector, Embedding};
pub use extraction::{Extraction, ExtractionFields};
pub use grant::{Grant, GrantDocument};
pub use staging::{ProcessingStatus, Stage, StagingItem};
