//! Embedding persistence.

use chrono::Utc;
use rusqlite::{params, Row};

use super::{parse_datetime, to_option, RepositoryError, Result, Store};
use crate::models::{decode_vector, encode_vector, Embedding};

pub(crate) fn row_to_embedding(row: &Row) -> rusqlite::Result<Embedding> {
    let blob: Vec<u8> = row.get("vector")?;
    Ok(Embedding {
        id: row.get("id")?,
        extraction_id: row.get("extraction_id")?,
        vector: decode_vector(&blob),
        model_name: row.get("model_name")?,
        dimensions: row.get::<_, i64>("dimensions")? as usize,
        text_length: row
            .get::<_, Option<i64>>("text_length")?
            .map(|v| v as usize),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

impl Store {
    /// Store a vector for an extraction. Unique per extraction; the
    /// declared dimensions must match the vector length.
    pub fn create_embedding(
        &self,
        extraction_id: i64,
        vector: &[f32],
        model_name: &str,
        dimensions: usize,
        text_length: Option<usize>,
    ) -> Result<Embedding> {
        if vector.len() != dimensions {
            return Err(RepositoryError::Conflict(format!(
                "vector length {} does not match declared dimensions {}",
                vector.len(),
                dimensions
            )));
        }

        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO embeddings
                (extraction_id, vector, model_name, dimensions, text_length, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                extraction_id,
                encode_vector(vector),
                model_name,
                dimensions as i64,
                text_length.map(|v| v as i64),
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        to_option(conn.query_row(
            "SELECT * FROM embeddings WHERE id = ?",
            params![id],
            row_to_embedding,
        ))?
        .ok_or_else(|| RepositoryError::NotFound(format!("embedding {id}")))
    }

    pub fn get_embedding_by_extraction(&self, extraction_id: i64) -> Result<Option<Embedding>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM embeddings WHERE extraction_id = ?",
            params![extraction_id],
            row_to_embedding,
        ))
    }

    pub fn embedding_exists_for_extraction(&self, extraction_id: i64) -> Result<bool> {
        Ok(self.get_embedding_by_extraction(extraction_id)?.is_some())
    }

    /// Drop the embedding of an extraction so the embed stage regenerates it.
    pub fn delete_embedding(&self, extraction_id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "DELETE FROM embeddings WHERE extraction_id = ?",
            params![extraction_id],
        )?;
        Ok(changed == 1)
    }

    pub fn count_embeddings(&self) -> Result<i64> {
        let conn = self.connect()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::grant::test_fixtures::sample_grant;
    use super::super::test_util::temp_store;
    use crate::models::{ProcessingStatus, Stage};
    use crate::repository::{NewExtraction, Store};

    pub(crate) fn seeded_extraction(store: &Store, external_id: &str) -> i64 {
        let grant = store.upsert_grant(&sample_grant(external_id)).unwrap();
        let (staging, _) = store
            .upsert_staging(external_id, None, None, Some(grant.id))
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
        store
            .complete_pdf_stage(&NewExtraction {
                grant_id: grant.id,
                staging_id: staging.id,
                external_id: external_id.to_string(),
                extracted_text: Some(
                    "Texto de la convocatoria con contenido suficiente para el embedding."
                        .to_string(),
                ),
                markdown_path: None,
                page_count: Some(1),
                word_count: Some(10),
                is_scanned: false,
                extraction_model: "lopdf".to_string(),
                extraction_error: None,
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_create_and_fetch_embedding() {
        let (_dir, store) = temp_store();
        let extraction_id = seeded_extraction(&store, "1");

        let embedding = store
            .create_embedding(extraction_id, &[0.1, 0.2, 0.3], "text-embedding-004", 3, Some(70))
            .unwrap();
        assert_eq!(embedding.dimensions, 3);
        assert_eq!(embedding.vector, vec![0.1, 0.2, 0.3]);

        let fetched = store
            .get_embedding_by_extraction(extraction_id)
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, embedding.id);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let (_dir, store) = temp_store();
        let extraction_id = seeded_extraction(&store, "2");
        let err = store
            .create_embedding(extraction_id, &[0.1, 0.2], "text-embedding-004", 768, None)
            .unwrap_err();
        assert!(matches!(err, crate::repository::RepositoryError::Conflict(_)));
    }

    #[test]
    fn test_one_embedding_per_extraction() {
        let (_dir, store) = temp_store();
        let extraction_id = seeded_extraction(&store, "3");
        store
            .create_embedding(extraction_id, &[1.0, 0.0], "m", 2, None)
            .unwrap();
        let err = store
            .create_embedding(extraction_id, &[0.0, 1.0], "m", 2, None)
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn test_delete_embedding_reopens_selector() {
        let (_dir, store) = temp_store();
        let extraction_id = seeded_extraction(&store, "4");
        store
            .create_embedding(extraction_id, &[1.0, 0.0], "m", 2, None)
            .unwrap();
        assert!(store.extractions_needing_embedding(10).unwrap().is_empty());

        assert!(store.delete_embedding(extraction_id).unwrap());
        assert_eq!(store.extractions_needing_embedding(10).unwrap().len(), 1);
    }
}
