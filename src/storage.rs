//! Storage helpers for downloaded PDFs and markdown artifacts.
//!
//! The downloads directory is a flat, content-addressed tree: filenames
//! carry the grant's sanitized external id plus a hash prefix, so concurrent
//! writers never clash and retries recognise existing artifacts by name.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Sanitize an external id for use as a filename: replaces characters that
/// are invalid on common filesystems and caps the length at 100 characters.
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    sanitized.truncate(100);
    sanitized
}

/// Content-addressed path for a downloaded PDF:
/// `{downloads}/{sanitized_id}_{hash[..8]}.pdf`.
pub fn pdf_storage_path(downloads_dir: &Path, external_id: &str, content_hash: &str) -> PathBuf {
    let filename = format!(
        "{}_{}.pdf",
        sanitize_filename(external_id),
        &content_hash[..8]
    );
    downloads_dir.join(filename)
}

/// Path of the markdown artifact for a stored PDF:
/// `{downloads}/markdown/{stem}.md`.
pub fn markdown_path_for(pdf_path: &Path) -> PathBuf {
    let stem = pdf_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    pdf_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("markdown")
        .join(format!("{stem}.md"))
}

/// Count and total size of stored PDFs, for the stats surface.
pub fn download_stats(downloads_dir: &Path) -> (usize, u64) {
    let mut count = 0usize;
    let mut bytes = 0u64;
    if let Ok(entries) = std::fs::read_dir(downloads_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "pdf").unwrap_or(false) {
                count += 1;
                if let Ok(meta) = entry.metadata() {
                    bytes += meta.len();
                }
            }
        }
    }
    (count, bytes)
}
