//! End-to-end properties of the pipeline over a real (temporary) store:
//! idempotence laws, the 1:1:1 entity chain, lifecycle transitions and
//! search ordering.

use std::sync::Arc;

use subvenia::models::{ProcessingStatus, Stage};
use subvenia::pipeline::fetch::{grant_from_detail, select_pdf_pointer};
use subvenia::repository::{NewExtraction, SearchFilters, Store};
use tempfile::TempDir;

const BASE: &str = "https://www.infosubvenciones.es/bdnstrans/api";

fn temp_store() -> (TempDir, Arc<Store>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(&dir.path().join("pipeline.db")).unwrap());
    (dir, store)
}

fn detail(external_id: &str) -> subvenia::api::GrantDetail {
    serde_json::from_value(serde_json::json!({
        "numeroConvocatoria": external_id,
        "titulo": format!("Convocatoria {external_id}"),
        "organismo": "Ayuntamiento de Jerez",
        "finalidad": "11",
        "abierto": true,
        "fechaInicioSolicitud": "2020-01-01",
        "fechaFinSolicitud": "2099-12-31",
        "documentos": [
            {"idDocumento": 1362058, "nombreFic": "convocatoria.pdf",
             "urlDescarga": format!("https://example.org/{external_id}.pdf")}
        ]
    }))
    .unwrap()
}

/// Simulate the fetch stage for one grant without the network.
fn stage_fetch(store: &Store, external_id: &str) -> (i64, i64) {
    let detail = detail(external_id);
    let pdf = select_pdf_pointer(&detail, BASE);
    let grant = store.upsert_grant(&grant_from_detail(&detail, &pdf)).unwrap();
    let (staging, _) = store
        .upsert_staging(external_id, Some("b1"), pdf.url.as_deref(), Some(grant.id))
        .unwrap();
    (grant.id, staging.id)
}

/// Simulate a successful pdf stage for one staged grant.
fn stage_pdf(store: &Store, grant_id: i64, staging_id: i64, external_id: &str) -> i64 {
    assert!(store
        .transition_status(
            staging_id,
            &[ProcessingStatus::Pending],
            ProcessingStatus::Processing,
            Stage::Pdf,
            None,
        )
        .unwrap());
    store
        .complete_pdf_stage(&NewExtraction {
            grant_id,
            staging_id,
            external_id: external_id.to_string(),
            extracted_text: Some(
                "ORDEN por la que se convocan ayudas destinadas a proyectos culturales; \
                 la cuantía máxima será de 50.000 euros."
                    .to_string(),
            ),
            markdown_path: None,
            page_count: Some(7),
            word_count: Some(19),
            is_scanned: false,
            extraction_model: "lopdf".to_string(),
            extraction_error: None,
        })
        .unwrap()
        .id
}

#[test]
fn ingest_is_idempotent() {
    let (_dir, store) = temp_store();

    let (grant_id, staging_id) = stage_fetch(&store, "872189");

    // Second ingest of the same id: same rows, nothing new
    let (grant_id_2, staging_id_2) = {
        let detail = detail("872189");
        let pdf = select_pdf_pointer(&detail, BASE);
        let grant = store.upsert_grant(&grant_from_detail(&detail, &pdf)).unwrap();
        let (staging, inserted) = store
            .upsert_staging("872189", Some("b1"), pdf.url.as_deref(), Some(grant.id))
            .unwrap();
        assert!(!inserted, "re-ingest must not insert");
        (grant.id, staging.id)
    };
    assert_eq!(grant_id, grant_id_2);
    assert_eq!(staging_id, staging_id_2);

    let conn_stats = store.pipeline_stats().unwrap();
    assert_eq!(conn_stats.grants, 1);
    assert_eq!(conn_stats.staging_by_status, vec![("pending".to_string(), 1)]);
}

#[test]
fn pdf_stage_rerun_does_not_duplicate_extraction() {
    let (_dir, store) = temp_store();
    let (grant_id, staging_id) = stage_fetch(&store, "1");
    stage_pdf(&store, grant_id, staging_id, "1");

    // Requeue and try the stage again: the unique grant constraint holds
    store.requeue("1").unwrap();
    assert!(store
        .transition_status(
            staging_id,
            &[ProcessingStatus::Pending],
            ProcessingStatus::Processing,
            Stage::Pdf,
            None,
        )
        .unwrap());
    let err = store
        .complete_pdf_stage(&NewExtraction {
            grant_id,
            staging_id,
            external_id: "1".to_string(),
            extracted_text: Some("Texto repetido de longitud suficiente para la prueba.".to_string()),
            markdown_path: None,
            page_count: Some(1),
            word_count: Some(8),
            is_scanned: false,
            extraction_model: "lopdf".to_string(),
            extraction_error: None,
        })
        .unwrap_err();
    assert!(err.is_unique_violation());
    assert_eq!(store.pipeline_stats().unwrap().extractions, 1);
}

#[test]
fn completed_items_with_pdf_have_extractions() {
    let (_dir, store) = temp_store();
    for id in ["a", "b", "c"] {
        let (grant_id, staging_id) = stage_fetch(&store, id);
        stage_pdf(&store, grant_id, staging_id, id);
    }

    // Invariant: completed staging item with a PDF URL implies extraction
    for id in ["a", "b", "c"] {
        let item = store.get_staging_by_external_id(id).unwrap().unwrap();
        assert_eq!(item.status, ProcessingStatus::Completed);
        assert!(item.pdf_url.is_some());
        let grant = store.get_grant_by_external_id(id).unwrap().unwrap();
        assert!(store.get_extraction_by_grant(grant.id).unwrap().is_some());
    }
}

#[test]
fn embedding_chain_is_one_to_one() {
    let (_dir, store) = temp_store();
    let (grant_id, staging_id) = stage_fetch(&store, "chain");
    let extraction_id = stage_pdf(&store, grant_id, staging_id, "chain");

    let embedding = store
        .create_embedding(extraction_id, &[0.6, 0.8], "test-model", 2, Some(100))
        .unwrap();
    assert_eq!(embedding.dimensions, embedding.vector.len());

    // Second embedding for the same extraction violates uniqueness
    assert!(store
        .create_embedding(extraction_id, &[1.0, 0.0], "test-model", 2, None)
        .unwrap_err()
        .is_unique_violation());

    // Deleting the grant cascades through extraction and embedding
    assert!(store.delete_grant(grant_id).unwrap());
    assert!(store.get_extraction(extraction_id).unwrap().is_none());
    assert!(store
        .get_embedding_by_extraction(extraction_id)
        .unwrap()
        .is_none());
    // The staging item survives; it references the grant by business key
    assert!(store.get_staging_by_external_id("chain").unwrap().is_some());
}

#[test]
fn search_ordering_and_similarity_window() {
    let (_dir, store) = temp_store();

    // Three embeddings at cosine distances 0.1, 0.3, 0.7 from the query
    let mut grant_ids = Vec::new();
    for (external_id, similarity) in [("e1", 0.9f32), ("e2", 0.7f32), ("e3", 0.3f32)] {
        let (grant_id, staging_id) = stage_fetch(&store, external_id);
        let extraction_id = stage_pdf(&store, grant_id, staging_id, external_id);
        let angle = similarity.acos();
        store
            .create_embedding(
                extraction_id,
                &[angle.cos(), angle.sin()],
                "test-model",
                2,
                None,
            )
            .unwrap();
        grant_ids.push(grant_id);
    }

    let query = [1.0f32, 0.0];
    let hits = store
        .vector_search(&query, 2, 0.4, &SearchFilters::default())
        .unwrap();
    assert_eq!(
        hits.iter().map(|h| h.grant_id).collect::<Vec<_>>(),
        vec![grant_ids[0], grant_ids[1]]
    );
    assert!(hits[0].similarity >= hits[1].similarity);
    assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.similarity)));

    // find_similar never returns the reference grant
    let similar = store.find_similar(grant_ids[0], 2, 0.0).unwrap();
    assert_eq!(
        similar.iter().map(|h| h.grant_id).collect::<Vec<_>>(),
        vec![grant_ids[1], grant_ids[2]]
    );
}

#[test]
fn requeue_resets_lifecycle() {
    let (_dir, store) = temp_store();
    let (_, staging_id) = stage_fetch(&store, "fail");

    assert!(store
        .transition_status(
            staging_id,
            &[ProcessingStatus::Pending],
            ProcessingStatus::Processing,
            Stage::Pdf,
            None,
        )
        .unwrap());
    store
        .record_attempt_failure(staging_id, "Download error: HTTP 500")
        .unwrap();
    assert!(store
        .transition_status(
            staging_id,
            &[ProcessingStatus::Processing],
            ProcessingStatus::Failed,
            Stage::Pdf,
            Some("Download error: HTTP 500"),
        )
        .unwrap());

    // The failure is visible to the operator surface
    let failed = store.failed_items(10).unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("HTTP 500"));

    // Requeue resets status and retry budget
    assert!(store.requeue("fail").unwrap());
    let item = store.get_staging_by_external_id("fail").unwrap().unwrap();
    assert_eq!(item.status, ProcessingStatus::Pending);
    assert_eq!(item.retry_count, 0);
}

#[test]
fn scanned_pdf_produces_extraction_without_embedding_candidate() {
    let (_dir, store) = temp_store();
    let (grant_id, staging_id) = stage_fetch(&store, "scan");
    assert!(store
        .transition_status(
            staging_id,
            &[ProcessingStatus::Pending],
            ProcessingStatus::Processing,
            Stage::Pdf,
            None,
        )
        .unwrap());
    store
        .complete_pdf_stage(&NewExtraction {
            grant_id,
            staging_id,
            external_id: "scan".to_string(),
            extracted_text: Some(String::new()),
            markdown_path: None,
            page_count: Some(4),
            word_count: Some(0),
            is_scanned: true,
            extraction_model: "lopdf".to_string(),
            extraction_error: Some("No text extracted (scanned PDF?)".to_string()),
        })
        .unwrap();

    let item = store.get_staging_by_external_id("scan").unwrap().unwrap();
    assert_eq!(item.status, ProcessingStatus::Completed);
    let extraction = store.get_extraction_by_grant(grant_id).unwrap().unwrap();
    assert!(extraction.is_scanned);
    assert_eq!(extraction.word_count, Some(0));

    // The embed selector never offers it
    assert!(store.extractions_needing_embedding(10).unwrap().is_empty());
}
