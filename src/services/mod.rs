//! Service layer: document processing, LLM extraction, normalization,
//! embeddings and the synchronous search path.

pub mod embeddings;
pub mod json_repair;
pub mod llm;
pub mod normalizer;
pub mod pdf;
pub mod search;

pub use embeddings::{EmbeddingClient, EmbeddingError, TaskType};
pub use llm::{LlmClient, LlmConfig, LlmError, LlmExtraction};
pub use normalizer::FieldNormalizer;
pub use pdf::{PdfArtifact, PdfError, PdfProcessor};
pub use search::VectorSearcher;
