//! Vector similarity search over stored embeddings.
//!
//! Embeddings are decoded from their BLOB form and scored with cosine
//! similarity in process; metadata filters are pushed down into SQL so only
//! candidate rows are scanned. Scores are `1 - cosine_distance`, clamped to
//! [0, 1] and rounded to four decimals; ordering is score descending with
//! ties broken by grant id descending.

use chrono::{NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Row};
use serde::{Deserialize, Serialize};

use super::{parse_date_opt, Result, Store};
use crate::models::{cosine_similarity, decode_vector, ExtractionFields};

/// Open/closed filter over the solicitation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstadoFilter {
    /// Window contains today.
    Abierta,
    /// Window closed before today.
    Cerrada,
    /// Window opens after today.
    Proxima,
}

/// Metadata filters applied alongside vector similarity. Predicates
/// AND-compose.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Substring match on the granting organisation (grant or extraction).
    pub organismo: Option<String>,
    /// Scope match (grant ambito or extraction geographic scope).
    pub ambito: Option<String>,
    /// Exact purpose code.
    pub finalidad: Option<String>,
    /// Publication date range.
    pub fecha_desde: Option<NaiveDate>,
    pub fecha_hasta: Option<NaiveDate>,
    /// Open/closed status relative to today.
    pub estado: Option<EstadoFilter>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.organismo.is_none()
            && self.ambito.is_none()
            && self.finalidad.is_none()
            && self.fecha_desde.is_none()
            && self.fecha_hasta.is_none()
            && self.estado.is_none()
    }
}

/// One ranked search result, enriched with grant and extraction metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub embedding_id: i64,
    pub extraction_id: i64,
    pub grant_id: i64,
    pub external_id: String,
    /// Similarity score in [0, 1], rounded to four decimals.
    pub similarity: f64,
    pub titulo: Option<String>,
    pub organismo: Option<String>,
    pub ambito: Option<String>,
    pub finalidad: Option<String>,
    pub summary: Option<String>,
    pub bases_reguladoras: Option<String>,
    pub fecha_publicacion: Option<NaiveDate>,
    pub fecha_inicio_solicitud: Option<NaiveDate>,
    pub fecha_fin_solicitud: Option<NaiveDate>,
}

struct Candidate {
    hit: SearchHit,
    vector: Vec<f32>,
}

fn row_to_candidate(row: &Row) -> rusqlite::Result<Candidate> {
    let fields: Option<String> = row.get("fields")?;
    let fields: ExtractionFields = fields
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let blob: Vec<u8> = row.get("vector")?;
    let summary_preview: Option<String> = row.get("summary_preview")?;
    let extracted_summary: Option<String> = row.get("extracted_summary")?;
    Ok(Candidate {
        vector: decode_vector(&blob),
        hit: SearchHit {
            embedding_id: row.get("embedding_id")?,
            extraction_id: row.get("extraction_id")?,
            grant_id: row.get("grant_id")?,
            external_id: row.get("external_id")?,
            similarity: 0.0,
            titulo: fields
                .titulo
                .clone()
                .or_else(|| row.get("titulo").ok().flatten()),
            organismo: fields
                .organismo
                .clone()
                .or_else(|| row.get("organismo").ok().flatten()),
            ambito: fields
                .ambito_geografico
                .clone()
                .or_else(|| row.get("ambito").ok().flatten()),
            finalidad: row.get("finalidad")?,
            summary: summary_preview.or(extracted_summary),
            bases_reguladoras: row.get("bases_reguladoras")?,
            fecha_publicacion: parse_date_opt(row.get("fecha_publicacion")?),
            fecha_inicio_solicitud: parse_date_opt(row.get("fecha_inicio_solicitud")?),
            fecha_fin_solicitud: parse_date_opt(row.get("fecha_fin_solicitud")?),
        },
    })
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

impl Store {
    /// Cosine similarity search with optional metadata filters. Returns at
    /// most `limit` hits with score >= `min_similarity`, best first.
    pub fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f64,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        self.vector_search_excluding(query, limit, min_similarity, filters, None)
    }

    /// Grants most similar to the given one, the reference grant excluded.
    pub fn find_similar(
        &self,
        grant_id: i64,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<SearchHit>> {
        let Some(extraction) = self.get_extraction_by_grant(grant_id)? else {
            return Ok(Vec::new());
        };
        let Some(reference) = self.get_embedding_by_extraction(extraction.id)? else {
            return Ok(Vec::new());
        };
        self.vector_search_excluding(
            &reference.vector,
            limit,
            min_similarity,
            &SearchFilters::default(),
            Some(grant_id),
        )
    }

    fn vector_search_excluding(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f64,
        filters: &SearchFilters,
        exclude_grant_id: Option<i64>,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.connect()?;

        let mut sql = String::from(
            r#"
            SELECT e.id AS embedding_id, e.vector,
                   x.id AS extraction_id, x.summary_preview, x.extracted_summary, x.fields,
                   g.id AS grant_id, g.external_id, g.titulo, g.organismo, g.ambito,
                   g.finalidad, g.bases_reguladoras, g.fecha_publicacion,
                   g.fecha_inicio_solicitud, g.fecha_fin_solicitud
            FROM embeddings e
            JOIN extractions x ON e.extraction_id = x.id
            JOIN grants g ON x.grant_id = g.id
            WHERE 1 = 1
            "#,
        );
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(organismo) = &filters.organismo {
            sql.push_str(
                " AND (g.organismo LIKE '%' || ? || '%' \
                  OR json_extract(x.fields, '$.organismo') LIKE '%' || ? || '%')",
            );
            params.push(SqlValue::from(organismo.clone()));
            params.push(SqlValue::from(organismo.clone()));
        }
        if let Some(ambito) = &filters.ambito {
            sql.push_str(
                " AND (g.ambito = ? \
                  OR json_extract(x.fields, '$.ambito_geografico') LIKE '%' || ? || '%')",
            );
            params.push(SqlValue::from(ambito.clone()));
            params.push(SqlValue::from(ambito.clone()));
        }
        if let Some(finalidad) = &filters.finalidad {
            sql.push_str(" AND g.finalidad = ?");
            params.push(SqlValue::from(finalidad.clone()));
        }
        if let Some(desde) = filters.fecha_desde {
            sql.push_str(" AND g.fecha_publicacion >= ?");
            params.push(SqlValue::from(desde.to_string()));
        }
        if let Some(hasta) = filters.fecha_hasta {
            sql.push_str(" AND g.fecha_publicacion <= ?");
            params.push(SqlValue::from(hasta.to_string()));
        }
        if let Some(estado) = filters.estado {
            let today = Utc::now().date_naive().to_string();
            match estado {
                EstadoFilter::Abierta => {
                    sql.push_str(
                        " AND g.fecha_inicio_solicitud <= ? AND g.fecha_fin_solicitud >= ?",
                    );
                    params.push(SqlValue::from(today.clone()));
                    params.push(SqlValue::from(today));
                }
                EstadoFilter::Cerrada => {
                    sql.push_str(" AND g.fecha_fin_solicitud < ?");
                    params.push(SqlValue::from(today));
                }
                EstadoFilter::Proxima => {
                    sql.push_str(" AND g.fecha_inicio_solicitud > ?");
                    params.push(SqlValue::from(today));
                }
            }
        }
        if let Some(grant_id) = exclude_grant_id {
            sql.push_str(" AND g.id != ?");
            params.push(SqlValue::from(grant_id));
        }

        let mut stmt = conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(params_from_iter(params), row_to_candidate)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|candidate| {
                let similarity =
                    round4(f64::from(cosine_similarity(query, &candidate.vector)).clamp(0.0, 1.0));
                if similarity >= min_similarity {
                    let mut hit = candidate.hit;
                    hit.similarity = similarity;
                    Some(hit)
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.grant_id.cmp(&a.grant_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::super::grant::test_fixtures::sample_grant;
    use super::super::test_util::temp_store;
    use super::*;
    use crate::models::{ProcessingStatus, Stage};
    use crate::repository::NewExtraction;

    /// Seed a grant + extraction + embedding with the given 2-d vector.
    fn seed_vector(store: &Store, external_id: &str, vector: &[f32]) -> i64 {
        let mut grant = sample_grant(external_id);
        grant.fecha_inicio_solicitud = NaiveDate::from_ymd_opt(2020, 1, 1);
        grant.fecha_fin_solicitud = NaiveDate::from_ymd_opt(2099, 12, 31);
        grant.fecha_publicacion = NaiveDate::from_ymd_opt(2025, 6, 1);
        let grant = store.upsert_grant(&grant).unwrap();
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
        let extraction = store
            .complete_pdf_stage(&NewExtraction {
                grant_id: grant.id,
                staging_id: staging.id,
                external_id: external_id.to_string(),
                extracted_text: Some(
                    "Convocatoria de ayudas con texto suficiente para generar embedding."
                        .to_string(),
                ),
                markdown_path: None,
                page_count: Some(1),
                word_count: Some(10),
                is_scanned: false,
                extraction_model: "lopdf".to_string(),
                extraction_error: None,
            })
            .unwrap();
        store
            .create_embedding(extraction.id, vector, "test-model", vector.len(), None)
            .unwrap();
        grant.id
    }

    /// Unit vector at `theta` radians from the x axis, so the cosine
    /// distance to (1, 0) is exactly 1 - cos(theta).
    fn at_angle(theta: f32) -> [f32; 2] {
        [theta.cos(), theta.sin()]
    }

    #[test]
    fn test_search_ordering_and_threshold() {
        let (_dir, store) = temp_store();
        // Cosine distances from the query: 0.1, 0.3, 0.7
        let g1 = seed_vector(&store, "e1", &at_angle(0.9f32.acos()));
        let g2 = seed_vector(&store, "e2", &at_angle(0.7f32.acos()));
        let g3 = seed_vector(&store, "e3", &at_angle(0.3f32.acos()));

        let query = [1.0f32, 0.0];
        let hits = store
            .vector_search(&query, 2, 0.4, &SearchFilters::default())
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].grant_id, g1);
        assert_eq!(hits[1].grant_id, g2);
        assert!(hits[0].similarity > hits[1].similarity);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.similarity)));

        // Scores: ~0.9 and ~0.7; the 0.3 vector is below the threshold
        assert!(hits.iter().all(|h| h.grant_id != g3));
    }

    #[test]
    fn test_exact_match_threshold() {
        let (_dir, store) = temp_store();
        let exact = seed_vector(&store, "x1", &[0.6, 0.8]);
        seed_vector(&store, "x2", &[0.8, 0.6]);

        let hits = store
            .vector_search(&[0.6, 0.8], 10, 1.0, &SearchFilters::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].grant_id, exact);
        assert_eq!(hits[0].similarity, 1.0);
    }

    #[test]
    fn test_find_similar_excludes_self() {
        let (_dir, store) = temp_store();
        let g1 = seed_vector(&store, "s1", &at_angle(0.9f32.acos()));
        let g2 = seed_vector(&store, "s2", &at_angle(0.7f32.acos()));
        let g3 = seed_vector(&store, "s3", &at_angle(0.3f32.acos()));

        let hits = store.find_similar(g1, 2, 0.0).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.grant_id != g1));
        // Nearest neighbours in angular order
        assert_eq!(hits[0].grant_id, g2);
        assert_eq!(hits[1].grant_id, g3);
    }

    #[test]
    fn test_find_similar_without_embedding() {
        let (_dir, store) = temp_store();
        let grant = store.upsert_grant(&sample_grant("lonely")).unwrap();
        assert!(store.find_similar(grant.id, 5, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_organismo_filter() {
        let (_dir, store) = temp_store();
        seed_vector(&store, "f1", &[1.0, 0.0]);

        let mut filters = SearchFilters::default();
        filters.organismo = Some("Jerez".to_string());
        let hits = store.vector_search(&[1.0, 0.0], 10, 0.0, &filters).unwrap();
        assert_eq!(hits.len(), 1);

        filters.organismo = Some("Sevilla".to_string());
        let hits = store.vector_search(&[1.0, 0.0], 10, 0.0, &filters).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_estado_filter_composition() {
        let (_dir, store) = temp_store();
        seed_vector(&store, "open1", &[1.0, 0.0]);

        let mut filters = SearchFilters::default();
        filters.estado = Some(EstadoFilter::Abierta);
        filters.finalidad = Some("11".to_string());
        assert_eq!(
            store
                .vector_search(&[1.0, 0.0], 10, 0.0, &filters)
                .unwrap()
                .len(),
            1
        );

        // AND-composition: a non-matching finalidad removes the hit
        filters.finalidad = Some("14".to_string());
        assert!(store
            .vector_search(&[1.0, 0.0], 10, 0.0, &filters)
            .unwrap()
            .is_empty());

        let mut filters = SearchFilters::default();
        filters.estado = Some(EstadoFilter::Cerrada);
        assert!(store
            .vector_search(&[1.0, 0.0], 10, 0.0, &filters)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_tie_break_by_grant_id_desc() {
        let (_dir, store) = temp_store();
        let g1 = seed_vector(&store, "t1", &[1.0, 0.0]);
        let g2 = seed_vector(&store, "t2", &[1.0, 0.0]);
        assert!(g2 > g1);

        let hits = store
            .vector_search(&[1.0, 0.0], 10, 0.0, &SearchFilters::default())
            .unwrap();
        assert_eq!(hits[0].grant_id, g2);
        assert_eq!(hits[1].grant_id, g1);
    }

    #[test]
    fn test_hit_uses_extraction_fields_first() {
        let (_dir, store) = temp_store();
        let grant_id = seed_vector(&store, "m1", &[1.0, 0.0]);
        let extraction = store.get_extraction_by_grant(grant_id).unwrap().unwrap();
        let fields = crate::models::ExtractionFields::from_json(&serde_json::json!({
            "titulo": "Título del PDF",
            "organismo": "Organismo del PDF"
        }));
        store
            .upsert_extraction_fields(
                extraction.id,
                Some("Resumen largo de prueba para la convocatoria."),
                None,
                &fields,
                "gemini-2.0-flash",
                Some(0.8),
                None,
            )
            .unwrap();

        let hits = store
            .vector_search(&[1.0, 0.0], 1, 0.0, &SearchFilters::default())
            .unwrap();
        assert_eq!(hits[0].titulo.as_deref(), Some("Título del PDF"));
        assert_eq!(hits[0].organismo.as_deref(), Some("Organismo del PDF"));
        assert!(hits[0].summary.as_deref().unwrap().starts_with("Resumen"));
    }
}
