//! Client for the grants registry HTTP API.
//!
//! Three operations: paginated search, per-grant detail, document download,
//! plus a lazy forward pager. Network-class errors retry with exponential
//! backoff (3 attempts); HTTP 429 honours Retry-After with a 60 second
//! default; every request has a bounded timeout.

pub mod schema;

pub use schema::{DocumentoRef, GrantDetail, SearchItem, SearchResponse};

use std::collections::VecDeque;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::pipeline::retry::{retry_with_policy, RetryClass, RetryPolicy};

/// Maximum page size accepted by the registry.
pub const MAX_PAGE_SIZE: u32 = 100;

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-class failure: connect, timeout, body read.
    #[error("transport error: {0}")]
    Transport(String),
    /// Non-success HTTP status other than 429.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// HTTP 429 with the delay the server asked for.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// Payload failed open-schema validation.
    #[error("schema error: {0}")]
    Schema(String),
    /// A document download that did not yield a PDF.
    #[error("not a PDF: {0}")]
    NotPdf(String),
}

impl ApiError {
    /// Retry classification used by every registry call.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            ApiError::Transport(_) => RetryClass::Retryable,
            ApiError::Http { status, .. } if *status >= 500 => RetryClass::Retryable,
            ApiError::RateLimited { retry_after } => RetryClass::RetryAfter(*retry_after),
            _ => RetryClass::Fatal,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        ApiError::Transport(error.to_string())
    }
}

/// Controlled search filter set.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Purpose code, e.g. "11" for culture.
    pub finalidad: Option<String>,
    /// Comma-separated beneficiary type codes, e.g. "3,2".
    pub tipos_beneficiario: Option<String>,
    /// Only currently-open grants.
    pub abierto: Option<bool>,
}

/// Registry API client.
#[derive(Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
    retry_policy: RetryPolicy,
}

impl RegistryClient {
    /// Create a client against the given base URL with a request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("subvenia/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One GET against an endpoint, no retries. Returns the raw JSON value.
    async fn request_once(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, ApiError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self.client.get(&url).query(params).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ApiError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status: status.as_u16(),
                message: message.chars().take(300).collect(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Schema(format!("invalid JSON: {e}")))
    }

    /// GET with retry and rate-limit handling.
    async fn request_json(
        &self,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<serde_json::Value, ApiError> {
        retry_with_policy(
            &self.retry_policy,
            ApiError::retry_class,
            |_attempt| self.request_once(endpoint, &params),
        )
        .await
    }

    /// Paginated search. `size` is capped at the registry's maximum of 100.
    pub async fn search(
        &self,
        filter: &SearchFilter,
        page: u32,
        size: u32,
    ) -> Result<SearchResponse, ApiError> {
        let mut params = vec![
            ("page", page.to_string()),
            ("size", size.min(MAX_PAGE_SIZE).to_string()),
        ];
        if let Some(finalidad) = &filter.finalidad {
            params.push(("finalidad", finalidad.clone()));
        }
        if let Some(tipos) = &filter.tipos_beneficiario {
            params.push(("tiposBeneficiario", tipos.clone()));
        }
        if let Some(abierto) = filter.abierto {
            params.push(("abierto", abierto.to_string()));
        }

        let value = self.request_json("convocatorias/busqueda", params).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Schema(e.to_string()))
    }

    /// Full metadata for one grant, including its documents array. The
    /// requested id is injected when the wire payload omits it.
    pub async fn get_detail(&self, external_id: &str) -> Result<GrantDetail, ApiError> {
        let params = vec![("numConv", external_id.to_string())];
        let mut value = self.request_json("convocatorias", params).await?;

        if value.get("numeroConvocatoria").is_none() {
            if let Some(obj) = value.as_object_mut() {
                obj.insert(
                    "numeroConvocatoria".to_string(),
                    serde_json::Value::String(external_id.to_string()),
                );
            }
        }

        let mut detail: GrantDetail =
            serde_json::from_value(value.clone()).map_err(|e| ApiError::Schema(e.to_string()))?;
        detail.raw = value;
        Ok(detail)
    }

    /// Download a PDF document by id. Fails when the response is not a PDF.
    pub async fn download_document(&self, document_id: i64) -> Result<Vec<u8>, ApiError> {
        retry_with_policy(&self.retry_policy, ApiError::retry_class, |_attempt| async move {
            let url = format!("{}/convocatorias/documentos", self.base_url);
            let response = self
                .client
                .get(&url)
                .query(&[("idDocumento", document_id.to_string())])
                .send()
                .await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                return Err(ApiError::RateLimited {
                    retry_after: Duration::from_secs(retry_after),
                });
            }
            if !status.is_success() {
                return Err(ApiError::Http {
                    status: status.as_u16(),
                    message: format!("document {document_id}"),
                });
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !content_type.starts_with("application/pdf") {
                return Err(ApiError::NotPdf(format!(
                    "document {document_id} has Content-Type {content_type}"
                )));
            }

            let bytes = response.bytes().await?;
            if !bytes.starts_with(b"%PDF") {
                return Err(ApiError::NotPdf(format!(
                    "document {document_id} body lacks the PDF magic"
                )));
            }
            Ok(bytes.to_vec())
        })
        .await
    }

    /// Probe total element and page counts for a filter with a minimal
    /// single-item fetch.
    pub async fn statistics(&self, filter: &SearchFilter) -> Result<(u64, u32), ApiError> {
        let response = self.search(filter, 0, 1).await?;
        Ok((response.total_elements, response.total_pages))
    }

    /// Lazy forward pager over all items matching a filter.
    pub fn iterate(&self, filter: SearchFilter, max_items: Option<usize>) -> SearchPager<'_> {
        SearchPager {
            client: self,
            filter,
            page: 0,
            size: MAX_PAGE_SIZE,
            max_items,
            yielded: 0,
            total_pages: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

/// Lazy, finite, non-restartable forward pager. Pages are fetched on
/// demand; iteration stops at `max_items` or when the server runs out of
/// pages.
pub struct SearchPager<'a> {
    client: &'a RegistryClient,
    filter: SearchFilter,
    page: u32,
    size: u32,
    max_items: Option<usize>,
    yielded: usize,
    total_pages: Option<u32>,
    buffer: VecDeque<SearchItem>,
    exhausted: bool,
}

impl SearchPager<'_> {
    /// Next item, or None when the sequence is finished.
    pub async fn next(&mut self) -> Result<Option<SearchItem>, ApiError> {
        if let Some(max) = self.max_items {
            if self.yielded >= max {
                return Ok(None);
            }
        }

        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_next_page().await?;
        }

        match self.buffer.pop_front() {
            Some(item) => {
                self.yielded += 1;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn fetch_next_page(&mut self) -> Result<(), ApiError> {
        if let Some(total) = self.total_pages {
            // Zero-indexed pages: the last page is totalPages - 1
            if self.page >= total {
                self.exhausted = true;
                return Ok(());
            }
        }

        let response = self
            .client
            .search(&self.filter, self.page, self.size)
            .await?;
        self.total_pages = Some(response.total_pages);

        if response.content.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        self.buffer.extend(response.content);
        self.page += 1;
        if self.page >= response.total_pages {
            self.exhausted = true;
        }
        Ok(())
    }
}
