//! Registry store: durable persistence for the four pipeline entities.
//!
//! SQLite-backed. The store holds only the database path and opens a
//! connection per call; WAL mode keeps concurrent readers and a single
//! writer happy. Work claiming uses `BEGIN IMMEDIATE` compare-and-set
//! updates so at most one worker owns an item in `processing`.

mod embedding;
mod extraction;
pub(crate) mod grant;
mod staging;
mod stats;
mod vector;

pub use extraction::NewExtraction;
pub use stats::{PipelineStats, SearchStats};
pub use vector::{EstadoFilter, SearchFilters, SearchHit};

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Whether the error is a UNIQUE constraint violation. The pipeline
    /// treats these as idempotent duplicates, not failures.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            RepositoryError::Database(e) => e.to_string().contains("UNIQUE constraint failed"),
            RepositoryError::Conflict(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub(crate) fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Parse an optional ISO date column.
pub(crate) fn parse_date_opt(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

/// Convert a rusqlite Result<T> to Result<Option<T>>, treating
/// QueryReturnedNoRows as None.
pub(crate) fn to_option<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Serialize a JSON-ish column value, defaulting to the given literal.
pub(crate) fn to_json_string<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Parse a JSON text column into a deserializable value, tolerating NULL.
pub(crate) fn from_json_opt<T: serde::de::DeserializeOwned + Default>(s: Option<String>) -> T {
    s.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

/// Create a database connection with settings tuned for concurrent workers.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // WAL mode persists, so this is effectively a one-time setting per database
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
        PRAGMA cache_size = -64000;
        PRAGMA temp_store = MEMORY;
    "#,
    )?;

    Ok(conn)
}

/// SQLite-backed registry store.
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Open (or create) the store and apply the schema.
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            -- Grant metadata fetched from the registry API
            CREATE TABLE IF NOT EXISTS grants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT NOT NULL UNIQUE,

                codigo TEXT,
                titulo TEXT,
                descripcion TEXT,
                objeto TEXT,

                organismo TEXT,
                organismo_id TEXT,
                departamento TEXT,
                tipo_administracion TEXT,
                nivel_administracion TEXT,
                nivel1 TEXT,
                nivel2 TEXT,
                nivel3 TEXT,

                finalidad TEXT,
                finalidad_descripcion TEXT,
                ambito TEXT,
                sectores TEXT NOT NULL DEFAULT '[]',
                sectores_normalizados TEXT NOT NULL DEFAULT '[]',
                regiones TEXT NOT NULL DEFAULT '[]',
                region_nuts TEXT NOT NULL DEFAULT '[]',

                tipos_beneficiario TEXT NOT NULL DEFAULT '[]',
                beneficiarios_normalizados TEXT NOT NULL DEFAULT '[]',
                beneficiarios_descripcion TEXT,
                requisitos_beneficiarios TEXT,

                fecha_publicacion TEXT,
                fecha_inicio_solicitud TEXT,
                fecha_fin_solicitud TEXT,
                fecha_resolucion TEXT,
                abierto INTEGER NOT NULL DEFAULT 0,
                is_open_now INTEGER,

                importe_total TEXT,
                importe_minimo TEXT,
                importe_maximo TEXT,
                porcentaje_financiacion TEXT,

                forma_solicitud TEXT,
                lugar_presentacion TEXT,
                tramite_electronico INTEGER NOT NULL DEFAULT 0,
                url_tramite TEXT,

                documentos TEXT NOT NULL DEFAULT '[]',
                tiene_pdf INTEGER NOT NULL DEFAULT 0,
                pdf_url TEXT,
                pdf_nombre TEXT,
                pdf_id_documento TEXT,
                pdf_url_hash TEXT,

                bases_reguladoras TEXT,
                normativa TEXT NOT NULL DEFAULT '[]',
                compatibilidades TEXT,
                contacto TEXT,
                observaciones TEXT,

                raw_payload TEXT NOT NULL DEFAULT 'null',
                fuente TEXT NOT NULL DEFAULT 'infosubvenciones',

                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_grants_organismo ON grants(organismo);
            CREATE INDEX IF NOT EXISTS idx_grants_fecha_fin ON grants(fecha_fin_solicitud);
            CREATE INDEX IF NOT EXISTS idx_grants_finalidad ON grants(finalidad);

            -- Pipeline cursor, one row per grant
            CREATE TABLE IF NOT EXISTS staging_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'skipped')),
                batch_id TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_stage TEXT,
                error_message TEXT,
                pdf_url TEXT,
                pdf_url_hash TEXT,
                grant_id INTEGER REFERENCES grants(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_staging_status ON staging_items(status);
            CREATE INDEX IF NOT EXISTS idx_staging_batch ON staging_items(batch_id);

            -- Per-grant text artifact and LLM output
            CREATE TABLE IF NOT EXISTS extractions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                grant_id INTEGER NOT NULL UNIQUE REFERENCES grants(id) ON DELETE CASCADE,
                staging_id INTEGER NOT NULL UNIQUE REFERENCES staging_items(id) ON DELETE CASCADE,
                external_id TEXT NOT NULL,
                extracted_text TEXT,
                extracted_summary TEXT,
                summary_preview TEXT,
                markdown_path TEXT,
                page_count INTEGER,
                word_count INTEGER,
                is_scanned INTEGER NOT NULL DEFAULT 0,
                fields TEXT NOT NULL DEFAULT '{}',
                extraction_model TEXT NOT NULL,
                extraction_confidence REAL,
                extraction_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_extractions_external ON extractions(external_id);
            CREATE INDEX IF NOT EXISTS idx_extractions_model ON extractions(extraction_model);

            -- One dense vector per extraction
            CREATE TABLE IF NOT EXISTS embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                extraction_id INTEGER NOT NULL UNIQUE REFERENCES extractions(id) ON DELETE CASCADE,
                vector BLOB NOT NULL,
                model_name TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                text_length INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
        )?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_all_tables() {
        let (_dir, store) = test_util::temp_store();
        let conn = store.connect().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(
            tables,
            vec!["embeddings", "extractions", "grants", "staging_items"]
        );
    }

    #[test]
    fn test_parse_datetime_fallback() {
        assert_eq!(parse_datetime("garbage"), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_parse_date_opt() {
        assert_eq!(
            parse_date_opt(Some("2025-12-05".to_string())),
            NaiveDate::from_ymd_opt(2025, 12, 5)
        );
        assert_eq!(parse_date_opt(Some("05/12/2025".to_string())), None);
        assert_eq!(parse_date_opt(None), None);
    }
}
