//! Extraction persistence and the stage selector queries.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use super::{from_json_opt, parse_datetime, to_json_string, to_option, RepositoryError, Result, Store};
use crate::models::{Extraction, ExtractionFields};

fn row_to_extraction(row: &Row) -> rusqlite::Result<Extraction> {
    Ok(Extraction {
        id: row.get("id")?,
        grant_id: row.get("grant_id")?,
        staging_id: row.get("staging_id")?,
        external_id: row.get("external_id")?,
        extracted_text: row.get("extracted_text")?,
        extracted_summary: row.get("extracted_summary")?,
        summary_preview: row.get("summary_preview")?,
        markdown_path: row.get("markdown_path")?,
        page_count: row.get::<_, Option<i64>>("page_count")?.map(|v| v as u32),
        word_count: row.get::<_, Option<i64>>("word_count")?.map(|v| v as u32),
        is_scanned: row.get::<_, i64>("is_scanned")? != 0,
        fields: from_json_opt(row.get("fields")?),
        extraction_model: row.get("extraction_model")?,
        extraction_confidence: row.get("extraction_confidence")?,
        extraction_error: row.get("extraction_error")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Extraction>> {
    to_option(conn.query_row(
        "SELECT * FROM extractions WHERE id = ?",
        params![id],
        row_to_extraction,
    ))
}

/// Input for creating the text-only extraction the pdf stage produces.
#[derive(Debug, Clone)]
pub struct NewExtraction {
    pub grant_id: i64,
    pub staging_id: i64,
    pub external_id: String,
    pub extracted_text: Option<String>,
    pub markdown_path: Option<String>,
    pub page_count: Option<u32>,
    pub word_count: Option<u32>,
    pub is_scanned: bool,
    /// Method tag until the llm stage replaces it with the model name.
    pub extraction_model: String,
    pub extraction_error: Option<String>,
}

impl Store {
    /// Create an extraction and finalize its staging item in one
    /// transaction. Fails with a conflict when the grant already has one.
    pub fn complete_pdf_stage(&self, new: &NewExtraction) -> Result<Extraction> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Extraction> = (|| {
            let existing: Option<i64> = to_option(conn.query_row(
                "SELECT id FROM extractions WHERE grant_id = ?",
                params![new.grant_id],
                |row| row.get(0),
            ))?;
            if existing.is_some() {
                return Err(RepositoryError::Conflict(format!(
                    "extraction already exists for grant {}",
                    new.grant_id
                )));
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                r#"
                INSERT INTO extractions
                    (grant_id, staging_id, external_id, extracted_text, markdown_path,
                     page_count, word_count, is_scanned, fields, extraction_model,
                     extraction_error, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '{}', ?9, ?10, ?11, ?11)
                "#,
                params![
                    new.grant_id,
                    new.staging_id,
                    new.external_id,
                    new.extracted_text,
                    new.markdown_path,
                    new.page_count.map(|v| v as i64),
                    new.word_count.map(|v| v as i64),
                    new.is_scanned as i64,
                    new.extraction_model,
                    new.extraction_error,
                    now,
                ],
            )?;
            let extraction_id = conn.last_insert_rowid();

            // Same transaction: the staging item only advances once the
            // extraction is durable (late acknowledgement).
            conn.execute(
                r#"
                UPDATE staging_items
                SET status = 'completed', last_stage = 'pdf', error_message = NULL,
                    completed_at = ?2, updated_at = ?2
                WHERE id = ?1 AND status = 'processing'
                "#,
                params![new.staging_id, now],
            )?;

            get_by_id(&conn, extraction_id)?.ok_or_else(|| {
                RepositoryError::NotFound(format!("extraction {extraction_id}"))
            })
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// Overwrite the LLM output of an extraction: summary, field record,
    /// confidence and model tag. When the owning grant has no normalized
    /// sector list yet, it is back-filled from the inferred sectors inside
    /// the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_extraction_fields(
        &self,
        extraction_id: i64,
        summary: Option<&str>,
        text: Option<&str>,
        fields: &ExtractionFields,
        model: &str,
        confidence: Option<f64>,
        error: Option<&str>,
    ) -> Result<Extraction> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Extraction> = (|| {
            let now = Utc::now().to_rfc3339();
            let preview = summary.map(|s| truncate_chars(s, 500));
            let fields_json = to_json_string(fields)?;
            let changed = conn.execute(
                r#"
                UPDATE extractions
                SET extracted_summary = ?2,
                    summary_preview = ?3,
                    extracted_text = COALESCE(?4, extracted_text),
                    fields = ?5,
                    extraction_model = ?6,
                    extraction_confidence = ?7,
                    extraction_error = ?8,
                    updated_at = ?9
                WHERE id = ?1
                "#,
                params![
                    extraction_id,
                    summary,
                    preview,
                    text,
                    fields_json,
                    model,
                    confidence,
                    error,
                    now
                ],
            )?;
            if changed != 1 {
                return Err(RepositoryError::NotFound(format!(
                    "extraction {extraction_id}"
                )));
            }

            if !fields.sectores_inferidos.is_empty() {
                let grant_id: i64 = conn.query_row(
                    "SELECT grant_id FROM extractions WHERE id = ?",
                    params![extraction_id],
                    |row| row.get(0),
                )?;
                let current: String = conn.query_row(
                    "SELECT sectores_normalizados FROM grants WHERE id = ?",
                    params![grant_id],
                    |row| row.get(0),
                )?;
                let current: Vec<String> =
                    serde_json::from_str(&current).unwrap_or_default();
                if current.is_empty() {
                    conn.execute(
                        "UPDATE grants SET sectores_normalizados = ?2, updated_at = ?3 WHERE id = ?1",
                        params![grant_id, to_json_string(&fields.sectores_inferidos)?, now],
                    )?;
                }
            }

            get_by_id(&conn, extraction_id)?.ok_or_else(|| {
                RepositoryError::NotFound(format!("extraction {extraction_id}"))
            })
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// Record an extraction-stage error without touching the model tag, so
    /// the llm stage can pick the row up again later.
    pub fn set_extraction_error(&self, extraction_id: i64, error: &str) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE extractions SET extraction_error = ?2, updated_at = ?3 WHERE id = ?1",
            params![extraction_id, error, now],
        )?;
        Ok(())
    }

    pub fn get_extraction(&self, id: i64) -> Result<Option<Extraction>> {
        let conn = self.connect()?;
        get_by_id(&conn, id)
    }

    pub fn get_extraction_by_grant(&self, grant_id: i64) -> Result<Option<Extraction>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM extractions WHERE grant_id = ?",
            params![grant_id],
            row_to_extraction,
        ))
    }

    pub fn extraction_exists_for_grant(&self, grant_id: i64) -> Result<bool> {
        Ok(self.get_extraction_by_grant(grant_id)?.is_some())
    }

    /// Selector for the llm stage: extractions whose model tag differs from
    /// the target (or every extraction with text when forcing).
    pub fn extractions_needing_llm(
        &self,
        target_model: &str,
        force: bool,
        limit: u32,
    ) -> Result<Vec<Extraction>> {
        let conn = self.connect()?;
        let sql = if force {
            r#"
            SELECT * FROM extractions
            WHERE extracted_text IS NOT NULL AND length(trim(extracted_text)) > 0
            ORDER BY id ASC LIMIT ?2
            "#
        } else {
            r#"
            SELECT * FROM extractions
            WHERE extraction_model != ?1
              AND extracted_text IS NOT NULL AND length(trim(extracted_text)) > 0
            ORDER BY id ASC LIMIT ?2
            "#
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![target_model, limit], row_to_extraction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Selector for the embed stage: extractions with usable text and no
    /// embedding row yet.
    pub fn extractions_needing_embedding(&self, limit: u32) -> Result<Vec<Extraction>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT x.* FROM extractions x
            LEFT JOIN embeddings e ON e.extraction_id = x.id
            WHERE e.id IS NULL
              AND x.extracted_text IS NOT NULL
              AND length(trim(x.extracted_text)) >= 50
            ORDER BY x.id ASC LIMIT ?1
            "#,
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_extraction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every extraction with usable text, for embedding regeneration.
    pub fn extractions_with_text(&self, limit: u32) -> Result<Vec<Extraction>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM extractions
            WHERE extracted_text IS NOT NULL AND length(trim(extracted_text)) >= 50
            ORDER BY id ASC LIMIT ?1
            "#,
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_extraction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_extractions(&self) -> Result<i64> {
        let conn = self.connect()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM extractions", [], |row| row.get(0))?)
    }

    pub fn count_extraction_errors(&self) -> Result<i64> {
        let conn = self.connect()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM extractions WHERE extraction_error IS NOT NULL",
            [],
            |row| row.get(0),
        )?)
    }
}

/// Truncate a string to at most `max` characters on a char boundary.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::super::grant::test_fixtures::sample_grant;
    use super::super::test_util::temp_store;
    use super::*;
    use crate::models::{ProcessingStatus, Stage};

    fn seeded(store: &Store, external_id: &str) -> (i64, i64) {
        let grant = store.upsert_grant(&sample_grant(external_id)).unwrap();
        let (staging, _) = store
            .upsert_staging(external_id, Some("b1"), grant.pdf_url.as_deref(), Some(grant.id))
            .unwrap();
        store
            .transition_status(
                staging.id,
                &[ProcessingStatus::Pending],
                ProcessingStatus::Processing,
                Stage::Pdf,
                None,
            )
            .unwrap();
        (grant.id, staging.id)
    }

    fn text_extraction(grant_id: i64, staging_id: i64, external_id: &str) -> NewExtraction {
        NewExtraction {
            grant_id,
            staging_id,
            external_id: external_id.to_string(),
            extracted_text: Some("ORDEN de 15 de enero de 2024 por la que se convocan ayudas para proyectos culturales en la provincia.".to_string()),
            markdown_path: Some("downloads/markdown/doc.md".to_string()),
            page_count: Some(7),
            word_count: Some(18),
            is_scanned: false,
            extraction_model: "lopdf".to_string(),
            extraction_error: None,
        }
    }

    #[test]
    fn test_complete_pdf_stage_creates_and_finalizes() {
        let (_dir, store) = temp_store();
        let (grant_id, staging_id) = seeded(&store, "872189");

        let extraction = store
            .complete_pdf_stage(&text_extraction(grant_id, staging_id, "872189"))
            .unwrap();
        assert!(extraction.id > 0);
        assert_eq!(extraction.word_count, Some(18));

        let staging = store.get_staging(staging_id).unwrap().unwrap();
        assert_eq!(staging.status, ProcessingStatus::Completed);
        assert_eq!(staging.last_stage, Some(Stage::Pdf));
    }

    #[test]
    fn test_one_extraction_per_grant() {
        let (_dir, store) = temp_store();
        let (grant_id, staging_id) = seeded(&store, "1");
        store
            .complete_pdf_stage(&text_extraction(grant_id, staging_id, "1"))
            .unwrap();

        let err = store
            .complete_pdf_stage(&text_extraction(grant_id, staging_id, "1"))
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(store.count_extractions().unwrap(), 1);
    }

    #[test]
    fn test_llm_selector_respects_model_tag() {
        let (_dir, store) = temp_store();
        let (grant_id, staging_id) = seeded(&store, "2");
        let extraction = store
            .complete_pdf_stage(&text_extraction(grant_id, staging_id, "2"))
            .unwrap();

        let pending = store
            .extractions_needing_llm("gemini-2.0-flash", false, 10)
            .unwrap();
        assert_eq!(pending.len(), 1);

        store
            .upsert_extraction_fields(
                extraction.id,
                Some("Resumen de la convocatoria de ayudas."),
                None,
                &ExtractionFields::default(),
                "gemini-2.0-flash",
                Some(0.8),
                None,
            )
            .unwrap();

        assert!(store
            .extractions_needing_llm("gemini-2.0-flash", false, 10)
            .unwrap()
            .is_empty());
        // force reprocess sees it again
        assert_eq!(
            store
                .extractions_needing_llm("gemini-2.0-flash", true, 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_sector_backfill_only_when_grant_empty() {
        let (_dir, store) = temp_store();
        let (grant_id, staging_id) = seeded(&store, "3");
        let extraction = store
            .complete_pdf_stage(&text_extraction(grant_id, staging_id, "3"))
            .unwrap();

        let fields = ExtractionFields::from_json(&serde_json::json!({
            "sectores_inferidos": ["Cultura y artes", "Turismo"]
        }));
        store
            .upsert_extraction_fields(
                extraction.id,
                Some("Resumen suficientemente largo para el registro."),
                None,
                &fields,
                "gemini-2.0-flash",
                Some(0.8),
                None,
            )
            .unwrap();

        let grant = store.get_grant(grant_id).unwrap().unwrap();
        assert_eq!(grant.sectores_normalizados, vec!["Cultura y artes", "Turismo"]);

        // A grant that already carries normalized sectors keeps them
        let mut with_sectors = sample_grant("4");
        with_sectors.sectores_normalizados = vec!["Deporte".to_string()];
        let grant = store.upsert_grant(&with_sectors).unwrap();
        let (staging, _) = store
            .upsert_staging("4", None, None, Some(grant.id))
            .unwrap();
        store
            .transition_status(
                staging.id,
                &[ProcessingStatus::Pending],
                ProcessingStatus::Processing,
                Stage::Pdf,
                None,
            )
            .unwrap();
        let extraction = store
            .complete_pdf_stage(&text_extraction(grant.id, staging.id, "4"))
            .unwrap();
        store
            .upsert_extraction_fields(
                extraction.id,
                None,
                None,
                &fields,
                "gemini-2.0-flash",
                Some(0.7),
                None,
            )
            .unwrap();
        let grant = store.get_grant(grant.id).unwrap().unwrap();
        assert_eq!(grant.sectores_normalizados, vec!["Deporte"]);
    }

    #[test]
    fn test_embedding_selector_requires_text() {
        let (_dir, store) = temp_store();
        let (grant_id, staging_id) = seeded(&store, "5");
        let mut new = text_extraction(grant_id, staging_id, "5");
        new.extracted_text = Some("corto".to_string());
        store.complete_pdf_stage(&new).unwrap();

        // Too little text: the embed stage never sees it
        assert!(store.extractions_needing_embedding(10).unwrap().is_empty());
    }

    #[test]
    fn test_summary_preview_truncation() {
        let (_dir, store) = temp_store();
        let (grant_id, staging_id) = seeded(&store, "6");
        let extraction = store
            .complete_pdf_stage(&text_extraction(grant_id, staging_id, "6"))
            .unwrap();
        let long_summary = "á".repeat(900);
        let updated = store
            .upsert_extraction_fields(
                extraction.id,
                Some(&long_summary),
                None,
                &ExtractionFields::default(),
                "gemini-2.0-flash",
                Some(0.8),
                None,
            )
            .unwrap();
        assert_eq!(updated.summary_preview.unwrap().chars().count(), 500);
    }
}
