//! Configuration for the ingestion pipeline.
//!
//! Settings come from environment variables (a `.env` file is loaded by the
//! entry point before anything reads them). There is no global settings
//! singleton: a `Settings` value is constructed once at startup and passed
//! down through the pipeline context.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default base URL of the grants registry API.
pub const DEFAULT_API_BASE_URL: &str = "https://www.infosubvenciones.es/bdnstrans/api";

/// Default Gemini generation model (acts as the extraction version tag).
pub const DEFAULT_LLM_MODEL: &str = "gemini-2.0-flash";

/// Default Gemini embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

/// Dimensions produced by the default embedding model.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 768;

/// Errors raised while assembling the configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value}")]
    InvalidVar { var: &'static str, value: String },
}

/// Application settings, resolved once from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root data directory; database and downloads live under it.
    pub data_dir: PathBuf,
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Directory for downloaded PDFs (markdown artifacts in a sibling dir).
    pub downloads_dir: PathBuf,

    /// Base URL of the grants registry API.
    pub api_base_url: String,
    /// Per-request timeout for the registry API, seconds.
    pub api_timeout_secs: u64,

    /// Maximum accepted PDF size in MiB.
    pub pdf_max_size_mib: u64,

    /// Gemini API key. Required for the llm and embed stages and for search.
    pub gemini_api_key: Option<String>,
    /// Generation model name; doubles as the extraction version tag.
    pub llm_model: String,
    /// Embedding model name.
    pub embedding_model: String,
    /// Expected embedding dimensions.
    pub embedding_dimensions: usize,

    /// Worker pool sizes per stage.
    pub pdf_workers: usize,
    pub llm_workers: usize,
    pub embed_workers: usize,

    /// Stage throttles, requests per minute (0 = unthrottled).
    pub llm_rate_per_min: u32,
    pub embed_rate_per_min: u32,

    /// Per-task retry budget.
    pub max_task_retries: u32,
    /// Soft task deadline in seconds (logged when exceeded).
    pub soft_deadline_secs: u64,
    /// Hard task deadline in seconds (task aborted and retried).
    pub hard_deadline_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            database_path: data_dir.join("subvenia.db"),
            downloads_dir: data_dir.join("downloads"),
            data_dir,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_timeout_secs: 30,
            pdf_max_size_mib: 30,
            gemini_api_key: None,
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            pdf_workers: 8,
            llm_workers: 4,
            embed_workers: 2,
            llm_rate_per_min: 100,
            embed_rate_per_min: 15,
            max_task_retries: 3,
            soft_deadline_secs: 300,
            hard_deadline_secs: 600,
        }
    }
}

impl Settings {
    /// Load settings from the environment, applying defaults for anything
    /// not set. `data_dir` overrides the `SUBVENIA_DATA_DIR` variable.
    pub fn from_env(data_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        let data_dir = match data_dir {
            Some(dir) => dir.to_path_buf(),
            None => env_var("SUBVENIA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
        };
        settings.database_path = env_var("SUBVENIA_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("subvenia.db"));
        settings.downloads_dir = env_var("SUBVENIA_DOWNLOADS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("downloads"));
        settings.data_dir = data_dir;

        if let Some(url) = env_var("SUBVENIA_API_BASE_URL") {
            settings.api_base_url = url.trim_end_matches('/').to_string();
        }
        settings.api_timeout_secs =
            parse_var("SUBVENIA_API_TIMEOUT_SECS", settings.api_timeout_secs)?;
        settings.pdf_max_size_mib =
            parse_var("SUBVENIA_PDF_MAX_SIZE_MIB", settings.pdf_max_size_mib)?;

        settings.gemini_api_key = env_var("GEMINI_API_KEY");
        if let Some(model) = env_var("GEMINI_MODEL") {
            settings.llm_model = model;
        }
        if let Some(model) = env_var("GEMINI_EMBEDDING_MODEL") {
            settings.embedding_model = model;
        }
        settings.embedding_dimensions =
            parse_var("SUBVENIA_EMBEDDING_DIMENSIONS", settings.embedding_dimensions)?;

        settings.pdf_workers = parse_var("SUBVENIA_PDF_WORKERS", settings.pdf_workers)?;
        settings.llm_workers = parse_var("SUBVENIA_LLM_WORKERS", settings.llm_workers)?;
        settings.embed_workers = parse_var("SUBVENIA_EMBED_WORKERS", settings.embed_workers)?;
        settings.llm_rate_per_min =
            parse_var("SUBVENIA_LLM_RATE_PER_MIN", settings.llm_rate_per_min)?;
        settings.embed_rate_per_min =
            parse_var("SUBVENIA_EMBED_RATE_PER_MIN", settings.embed_rate_per_min)?;
        settings.max_task_retries =
            parse_var("SUBVENIA_MAX_TASK_RETRIES", settings.max_task_retries)?;
        settings.soft_deadline_secs =
            parse_var("SUBVENIA_SOFT_DEADLINE_SECS", settings.soft_deadline_secs)?;
        settings.hard_deadline_secs =
            parse_var("SUBVENIA_HARD_DEADLINE_SECS", settings.hard_deadline_secs)?;

        Ok(settings)
    }

    /// API key, or a fatal configuration error when missing.
    pub fn require_gemini_key(&self) -> Result<&str, ConfigError> {
        self.gemini_api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingVar("GEMINI_API_KEY"))
    }

    /// Directory where markdown artifacts are written.
    pub fn markdown_dir(&self) -> PathBuf {
        self.downloads_dir.join("markdown")
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env_var(name) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
            var: name,
            value: raw,
        }),
        None => Ok(default),
    }
}
