//! Document processor: download, content-address, extract, emit markdown.
//!
//! Given a PDF URL the processor downloads the bytes (bounded size, retry
//! on transient errors), verifies the PDF magic, stores the file under a
//! content-addressed name, extracts text page by page and writes a markdown
//! artifact next to the downloads. PDFs with no extractable text layer are
//! flagged as scanned but still produce an artifact so downstream stages
//! keep running.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::retry::{retry_with_policy, RetryClass, RetryPolicy};
use crate::storage::{markdown_path_for, pdf_storage_path, sha256_hex};

/// Fewer than this many characters per page marks a PDF as scanned.
const SCANNED_CHARS_PER_PAGE: f64 = 100.0;

/// Method tag recorded on extractions until the llm stage replaces it.
pub const EXTRACTION_METHOD: &str = "lopdf";

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("not a PDF: {0}")]
    NotPdf(String),
    #[error("PDF too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("text extraction failed: {0}")]
    Extract(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PdfError {
    fn retry_class(&self) -> RetryClass {
        match self {
            PdfError::Download(_) => RetryClass::Retryable,
            _ => RetryClass::Fatal,
        }
    }
}

/// Result of processing one PDF.
#[derive(Debug, Clone)]
pub struct PdfArtifact {
    pub pdf_path: PathBuf,
    pub markdown_path: PathBuf,
    /// SHA-256 of the PDF bytes.
    pub content_hash: String,
    pub file_size: u64,
    /// Cleaned full text, empty for scanned PDFs.
    pub text: String,
    pub page_count: u32,
    pub word_count: u32,
    pub is_scanned: bool,
    /// True when an existing file with the same hash was reused.
    pub reused: bool,
}

/// Downloads and processes grant PDFs.
pub struct PdfProcessor {
    client: reqwest::Client,
    downloads_dir: PathBuf,
    max_size_bytes: u64,
    retry_policy: RetryPolicy,
}

impl PdfProcessor {
    pub fn new(
        downloads_dir: &Path,
        max_size_mib: u64,
        timeout: Duration,
    ) -> Result<Self, PdfError> {
        std::fs::create_dir_all(downloads_dir)?;
        std::fs::create_dir_all(downloads_dir.join("markdown"))?;
        let client = reqwest::Client::builder()
            .user_agent(format!("subvenia/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| PdfError::Download(e.to_string()))?;
        Ok(Self {
            client,
            downloads_dir: downloads_dir.to_path_buf(),
            max_size_bytes: max_size_mib * 1024 * 1024,
            retry_policy: RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(10)),
        })
    }

    /// Download, store and extract one PDF.
    pub async fn process(&self, pdf_url: &str, external_id: &str) -> Result<PdfArtifact, PdfError> {
        let bytes = self.download(pdf_url, external_id).await?;
        let content_hash = sha256_hex(&bytes);
        let pdf_path = pdf_storage_path(&self.downloads_dir, external_id, &content_hash);

        // Same hash in the name means same content: reuse the earlier file
        let reused = pdf_path.exists();
        if reused {
            debug!("PDF already on disk, reusing: {}", pdf_path.display());
        } else {
            if let Some(parent) = pdf_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&pdf_path, &bytes)?;
        }

        let file_size = bytes.len() as u64;
        let (text, page_count, is_scanned) = extract_text(bytes).await?;
        if is_scanned {
            warn!(
                "PDF for {} appears to be scanned ({} pages, no text layer)",
                external_id, page_count
            );
        }

        let word_count = text.split_whitespace().count() as u32;
        let markdown_path = markdown_path_for(&pdf_path);
        if let Some(parent) = markdown_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let markdown = render_markdown(&pdf_path, &text, page_count, word_count, is_scanned);
        std::fs::write(&markdown_path, markdown)?;

        info!(
            "Processed PDF for {}: {} pages, {} words (scanned: {})",
            external_id, page_count, word_count, is_scanned
        );

        Ok(PdfArtifact {
            pdf_path,
            markdown_path,
            content_hash,
            file_size,
            text,
            page_count,
            word_count,
            is_scanned,
            reused,
        })
    }

    async fn download(&self, pdf_url: &str, external_id: &str) -> Result<Vec<u8>, PdfError> {
        let parsed = url::Url::parse(pdf_url)
            .map_err(|e| PdfError::NotPdf(format!("invalid URL {pdf_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PdfError::NotPdf(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }

        retry_with_policy(&self.retry_policy, PdfError::retry_class, |_attempt| async move {
            debug!("Downloading PDF for {} from {}", external_id, pdf_url);
            let response = self
                .client
                .get(pdf_url)
                .send()
                .await
                .map_err(|e| PdfError::Download(e.to_string()))?;

            let status = response.status();
            if status.is_server_error() {
                return Err(PdfError::Download(format!("HTTP {status}")));
            }
            if !status.is_success() {
                return Err(PdfError::NotPdf(format!("HTTP {status} for {pdf_url}")));
            }

            if let Some(length) = response.content_length() {
                if length > self.max_size_bytes {
                    return Err(PdfError::TooLarge {
                        size: length,
                        max: self.max_size_bytes,
                    });
                }
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| PdfError::Download(e.to_string()))?;

            if bytes.is_empty() {
                return Err(PdfError::NotPdf("empty response body".to_string()));
            }
            if bytes.len() as u64 > self.max_size_bytes {
                return Err(PdfError::TooLarge {
                    size: bytes.len() as u64,
                    max: self.max_size_bytes,
                });
            }
            validate_pdf_bytes(&bytes)?;
            Ok(bytes.to_vec())
        })
        .await
    }
}

/// Reject bodies that do not start with the PDF magic bytes.
pub fn validate_pdf_bytes(bytes: &[u8]) -> Result<(), PdfError> {
    if !bytes.starts_with(b"%PDF") {
        return Err(PdfError::NotPdf(
            "content does not start with %PDF".to_string(),
        ));
    }
    Ok(())
}

/// Extract text page by page. Returns (cleaned text, page count, scanned
/// flag). Parsing runs on a blocking thread, it is CPU-bound.
async fn extract_text(bytes: Vec<u8>) -> Result<(String, u32, bool), PdfError> {
    tokio::task::spawn_blocking(move || {
        let doc =
            lopdf::Document::load_mem(&bytes).map_err(|e| PdfError::Extract(e.to_string()))?;

        let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
        let page_count = page_numbers.len() as u32;
        if page_count == 0 {
            return Err(PdfError::Extract("PDF has no pages".to_string()));
        }

        let mut pages_text = Vec::with_capacity(page_numbers.len());
        let mut total_chars = 0usize;
        for page_number in page_numbers {
            // Pages that fail individually degrade to empty text
            let page_text = doc.extract_text(&[page_number]).unwrap_or_default();
            total_chars += page_text.trim().len();
            pages_text.push(page_text);
        }

        let avg_chars = total_chars as f64 / page_count as f64;
        let is_scanned = avg_chars < SCANNED_CHARS_PER_PAGE;

        let full_text = if is_scanned {
            String::new()
        } else {
            clean_text(&pages_text.join("\n\n"))
        };

        Ok((full_text, page_count, is_scanned))
    })
    .await
    .map_err(|e| PdfError::Extract(format!("extraction task panicked: {e}")))?
}

/// Normalize extracted whitespace: strip per-line trailing space, drop form
/// feeds, collapse runs of blank lines and repeated spaces.
pub fn clean_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let no_form_feeds = text.replace('\u{c}', "\n");

    let mut lines: Vec<String> = Vec::new();
    for line in no_form_feeds.lines() {
        let mut collapsed = String::with_capacity(line.len());
        let mut last_was_space = false;
        for c in line.trim().chars() {
            if c == ' ' {
                if !last_was_space {
                    collapsed.push(' ');
                }
                last_was_space = true;
            } else {
                collapsed.push(c);
                last_was_space = false;
            }
        }
        lines.push(collapsed);
    }

    // Collapse runs of blank lines into a single separator
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut blank_run = 0usize;
    for line in &lines {
        if line.is_empty() {
            blank_run += 1;
            if blank_run == 1 {
                out.push("");
            }
        } else {
            blank_run = 0;
            out.push(line);
        }
    }

    out.join("\n").trim().to_string()
}

/// Markdown artifact: a short metadata header followed by the text. The llm
/// stage strips everything up to the first `---` separator.
pub fn render_markdown(
    pdf_path: &Path,
    text: &str,
    page_count: u32,
    word_count: u32,
    is_scanned: bool,
) -> String {
    let stem = pdf_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let file_name = pdf_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());

    format!(
        "# {stem}\n\n\
         **Source PDF**: {file_name}\n\
         **Pages**: {page_count}\n\
         **Words**: {word_count}\n\
         **Extraction Method**: {EXTRACTION_METHOD}\n\
         **Is Scanned**: {is_scanned}\n\n\
         ---\n\n\
         {text}\n"
    )
}

/// Strip the metadata header from a markdown artifact, returning the body.
pub fn strip_markdown_header(markdown: &str) -> &str {
    match markdown.split_once("---") {
        Some((_, body)) => body.trim_start_matches(['-', '\n', '\r']).trim(),
        None => markdown.trim(),
    }
}
