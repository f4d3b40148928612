//! Fetch stage: pull grant metadata from the registry into the store.
//!
//! For each search hit the stage fetches the full detail, upserts the
//! grant row, selects the authoritative PDF pointer and creates the
//! staging item that drives the rest of the pipeline. Items already staged
//! count as duplicates; their grant row is still refreshed.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::api::{DocumentoRef, GrantDetail, RegistryClient, SearchFilter};
use crate::models::{Grant, GrantDocument, ProcessingStatus, Stage, StagingItem};
use crate::repository::Store;

/// One ingest invocation.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub filter: SearchFilter,
    pub batch_id: String,
    pub max_items: Option<usize>,
}

/// Counters returned by the fetch stage.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FetchStats {
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub errors: usize,
}

/// The selected primary-PDF pointer for a grant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdfPointer {
    pub tiene_pdf: bool,
    pub url: Option<String>,
    pub nombre: Option<String>,
    pub id_documento: Option<String>,
}

/// Run one fetch: page through the search results, persist grants and
/// staging items. Per-item errors are recorded and never abort the batch.
pub async fn run_fetch(
    store: &Store,
    client: &RegistryClient,
    request: &FetchRequest,
) -> anyhow::Result<FetchStats> {
    info!(
        "Starting fetch: batch={} max_items={:?}",
        request.batch_id, request.max_items
    );

    let mut stats = FetchStats::default();
    let mut pager = client.iterate(request.filter.clone(), request.max_items);

    while let Some(item) = pager.next().await? {
        let external_id = item.external_id().to_string();
        stats.fetched += 1;

        let already_staged = store.get_staging_by_external_id(&external_id)?.is_some();
        if already_staged {
            stats.duplicates += 1;
        }

        match ingest_one(store, client, &external_id, &request.batch_id, already_staged).await {
            Ok(inserted) => {
                if inserted {
                    stats.inserted += 1;
                }
            }
            Err(e) => {
                error!("Error processing {}: {}", external_id, e);
                stats.errors += 1;
                record_fetch_failure(store, &external_id, &request.batch_id, &e.to_string());
            }
        }
    }

    info!(
        "Fetch completed: fetched={} inserted={} duplicates={} errors={}",
        stats.fetched, stats.inserted, stats.duplicates, stats.errors
    );
    Ok(stats)
}

/// Fetch the detail for one grant, upsert it and (unless already staged)
/// create its staging item. Returns whether a new staging row was created.
async fn ingest_one(
    store: &Store,
    client: &RegistryClient,
    external_id: &str,
    batch_id: &str,
    already_staged: bool,
) -> anyhow::Result<bool> {
    debug!("Fetching detail for {}", external_id);
    let detail = client.get_detail(external_id).await?;
    let pdf = select_pdf_pointer(&detail, client.base_url());
    let grant = grant_from_detail(&detail, &pdf);
    let grant = store.upsert_grant(&grant)?;

    // A re-fetch refreshes the grant but leaves existing staging untouched
    if already_staged {
        return Ok(false);
    }

    let (_, inserted) =
        store.upsert_staging(external_id, Some(batch_id), pdf.url.as_deref(), Some(grant.id))?;
    Ok(inserted)
}

fn record_fetch_failure(store: &Store, external_id: &str, batch_id: &str, error: &str) {
    let result = store
        .upsert_staging(external_id, Some(batch_id), None, None)
        .and_then(|(item, _)| {
            store.transition_status(
                item.id,
                &[ProcessingStatus::Pending, ProcessingStatus::Processing],
                ProcessingStatus::Failed,
                Stage::Fetch,
                Some(error),
            )
        });
    if let Err(e) = result {
        error!("Failed to record fetch failure for {}: {}", external_id, e);
    }
}

// The pointer selection and conversion below are pure so they stay easy to
// test against recorded payloads.

/// Select the authoritative PDF for a grant.
///
/// Walk the documents array looking for a URL that classifies as PDF; when
/// the API gave an id but no URL, synthesize the download endpoint. When no
/// document URL classified as PDF at all, fall back to the registry's
/// grant-level PDF endpoint.
pub fn select_pdf_pointer(detail: &GrantDetail, base_url: &str) -> PdfPointer {
    for doc in &detail.documentos {
        let url = match doc.url() {
            Some(url) => url.to_string(),
            None => match doc.document_id() {
                Some(id) => format!("{base_url}/convocatorias/documentos?idDocumento={id}"),
                None => continue,
            },
        };
        if looks_like_pdf(&url) {
            return PdfPointer {
                tiene_pdf: true,
                url: Some(url),
                nombre: doc.nombre().map(|s| s.to_string()),
                id_documento: doc.document_id().map(|id| id.to_string()),
            };
        }
    }

    if let Some(id) = detail.id {
        let url = format!("{base_url}/convocatorias/pdf?id={id}&vpd=GE");
        return PdfPointer {
            tiene_pdf: true,
            url: Some(url),
            nombre: None,
            id_documento: Some(id.to_string()),
        };
    }

    PdfPointer::default()
}

fn looks_like_pdf(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.ends_with(".pdf") || lower.contains("pdf")
}

/// Map beneficiary descriptions onto the controlled bucket set.
pub fn normalize_beneficiarios(candidates: &[String]) -> Vec<String> {
    const BUCKETS: &[(&str, &[&str])] = &[
        ("Autonomo", &["autónomo", "autonom", "persona física que desarrolla"]),
        ("Empresa", &["pyme", "microempresa", "empresa", "sociedad", "gran empresa"]),
        (
            "Entidad local",
            &[
                "ayuntamiento",
                "diputación",
                "diputacion",
                "cabildo",
                "consell",
                "entidad local",
                "corporación local",
                "corporacion local",
                "municip",
                "comarca",
            ],
        ),
        (
            "ONG",
            &[
                "fundación",
                "fundacion",
                "asociación",
                "asociacion",
                "ong",
                "sin ánimo de lucro",
                "sin animo de lucro",
            ],
        ),
        ("Universidad", &["universidad", "centro universit", "campus"]),
        ("Cooperativa", &["cooperativa"]),
        (
            "Organismo público",
            &[
                "organismo",
                "ente público",
                "ente publico",
                "empresa pública",
                "empresa publica",
            ],
        ),
    ];

    let mut buckets: Vec<String> = Vec::new();
    for candidate in candidates {
        let lower = candidate.to_lowercase();
        for (bucket, keywords) in BUCKETS {
            if keywords.iter().any(|k| lower.contains(k)) {
                let bucket = bucket.to_string();
                if !buckets.contains(&bucket) {
                    buckets.push(bucket);
                }
            }
        }
    }
    buckets.sort();
    buckets
}

/// Extract NUTS codes from region strings like "ES51 - CATALUÑA".
pub fn parse_region_codes(regiones: &[String]) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    for region in regiones {
        let code = match region.split_once(" - ") {
            Some((code, _)) => code.trim().to_string(),
            None => {
                let trimmed = region.trim();
                if is_nuts_code(trimmed) {
                    trimmed.to_string()
                } else {
                    continue;
                }
            }
        };
        if !code.is_empty() && !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

fn is_nuts_code(s: &str) -> bool {
    let letters = s.chars().take_while(|c| c.is_ascii_uppercase()).count();
    (2..=3).contains(&letters)
        && s.len() > letters
        && s[letters..].chars().all(|c| c.is_ascii_digit())
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    // Dates arrive as plain ISO dates or full timestamps
    let prefix = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

/// Derived open flag: whether today falls inside the solicitation window.
fn is_open_now(inicio: Option<NaiveDate>, fin: Option<NaiveDate>) -> Option<bool> {
    let today = Utc::now().date_naive();
    match (inicio, fin) {
        (Some(inicio), Some(fin)) => Some(inicio <= today && today <= fin),
        (Some(inicio), None) => Some(inicio <= today),
        (None, Some(fin)) => Some(today <= fin),
        (None, None) => None,
    }
}

/// Convert an API detail payload into a grant row.
pub fn grant_from_detail(detail: &GrantDetail, pdf: &PdfPointer) -> Grant {
    let external_id = detail
        .numero_convocatoria
        .clone()
        .unwrap_or_else(|| detail.id.map(|id| id.to_string()).unwrap_or_default());

    let (nivel1, nivel2, nivel3) = detail.admin_levels();

    // Sector labels: the API's own list first, the productos fallback next
    let sectores = if !detail.sectores.is_empty() {
        detail.sectores.clone()
    } else {
        sector_labels_from_productos(detail.sectores_productos.as_ref())
    };

    let mut beneficiary_candidates = detail.tipos_beneficiario.clone();
    if let Some(serde_json::Value::Array(items)) = &detail.tipos_beneficiarios_raw {
        for item in items {
            if let Some(value) = item
                .get("descripcion")
                .or_else(|| item.get("nombre"))
                .or_else(|| item.get("tipo"))
                .and_then(|v| v.as_str())
            {
                beneficiary_candidates.push(value.to_string());
            }
        }
    }

    let fecha_publicacion = parse_date(detail.fecha_publicacion.as_deref())
        .or_else(|| parse_date(detail.fecha_recepcion.as_deref()));
    let fecha_inicio = parse_date(detail.fecha_inicio_solicitud.as_deref());
    let fecha_fin = parse_date(detail.fecha_fin_solicitud.as_deref());

    let documentos = detail
        .documentos
        .iter()
        .map(|doc: &DocumentoRef| GrantDocument {
            id: doc.document_id(),
            nombre: doc.nombre().map(|s| s.to_string()),
            url: doc.url().map(|s| s.to_string()),
        })
        .collect();

    Grant {
        id: 0,
        external_id,
        codigo: detail.codigo.clone(),
        titulo: detail.titulo.clone(),
        descripcion: detail.descripcion.clone(),
        objeto: detail.objeto.clone(),
        organismo: detail.organismo.clone(),
        organismo_id: detail.organismo_id.clone(),
        departamento: detail.departamento.clone(),
        tipo_administracion: detail.tipo_administracion.clone(),
        nivel_administracion: detail.nivel_administracion.clone(),
        nivel1,
        nivel2,
        nivel3,
        finalidad: detail.finalidad.clone(),
        finalidad_descripcion: detail.finalidad_descripcion.clone(),
        ambito: detail.ambito.clone(),
        sectores: sectores.clone(),
        sectores_normalizados: dedupe(sectores),
        regiones: detail.regiones.clone(),
        region_nuts: parse_region_codes(&detail.regiones),
        tipos_beneficiario: detail.tipos_beneficiario.clone(),
        beneficiarios_normalizados: normalize_beneficiarios(&beneficiary_candidates),
        beneficiarios_descripcion: detail.beneficiarios_descripcion.clone(),
        requisitos_beneficiarios: detail.requisitos_beneficiarios.clone(),
        fecha_publicacion,
        fecha_inicio_solicitud: fecha_inicio,
        fecha_fin_solicitud: fecha_fin,
        fecha_resolucion: parse_date(detail.fecha_resolucion.as_deref()),
        abierto: detail.abierto.unwrap_or(false),
        is_open_now: is_open_now(fecha_inicio, fecha_fin),
        importe_total: detail.importe_total.clone(),
        importe_minimo: detail.importe_minimo.clone(),
        importe_maximo: detail.importe_maximo.clone(),
        porcentaje_financiacion: detail.porcentaje_financiacion.clone(),
        forma_solicitud: detail.forma_solicitud.clone(),
        lugar_presentacion: detail.lugar_presentacion.clone(),
        tramite_electronico: detail.tramite_electronico.unwrap_or(false),
        url_tramite: detail.url_tramite.clone(),
        documentos,
        tiene_pdf: pdf.tiene_pdf,
        pdf_url: pdf.url.clone(),
        pdf_nombre: pdf.nombre.clone(),
        pdf_id_documento: pdf.id_documento.clone(),
        pdf_url_hash: pdf.url.as_deref().map(StagingItem::hash_pdf_url),
        bases_reguladoras: detail.bases_reguladoras.clone(),
        normativa: detail
            .normativa
            .clone()
            .unwrap_or(serde_json::Value::Array(Vec::new())),
        compatibilidades: detail.compatibilidades.clone(),
        contacto: detail.contacto.clone(),
        observaciones: detail.observaciones.clone(),
        raw_payload: if detail.raw.is_null() {
            serde_json::to_value(detail).unwrap_or(serde_json::Value::Null)
        } else {
            detail.raw.clone()
        },
        fuente: "infosubvenciones".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn sector_labels_from_productos(productos: Option<&serde_json::Value>) -> Vec<String> {
    let Some(serde_json::Value::Array(items)) = productos else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Object(obj) => ["descripcion", "nombre", "codigo"]
                .iter()
                .find_map(|key| obj.get(*key))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => None,
        })
        .collect()
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = Vec::new();
    for item in items {
        if !item.is_empty() && !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detail_from(value: serde_json::Value) -> GrantDetail {
        serde_json::from_value(value).unwrap()
    }

    const BASE: &str = "https://www.infosubvenciones.es/bdnstrans/api";

    #[test]
    fn test_pdf_pointer_prefers_document_url() {
        let detail = detail_from(json!({
            "numeroConvocatoria": "872189",
            "documentos": [
                {"idDocumento": 9, "nombreFic": "anexo.docx", "urlDescarga": "https://x/anexo.docx"},
                {"idDocumento": 10, "nombreFic": "convocatoria.pdf", "urlDescarga": "https://x/convocatoria.pdf"}
            ]
        }));
        let pdf = select_pdf_pointer(&detail, BASE);
        assert!(pdf.tiene_pdf);
        assert_eq!(pdf.url.as_deref(), Some("https://x/convocatoria.pdf"));
        assert_eq!(pdf.nombre.as_deref(), Some("convocatoria.pdf"));
        assert_eq!(pdf.id_documento.as_deref(), Some("10"));
    }

    #[test]
    fn test_pdf_pointer_synthesizes_document_endpoint() {
        let detail = detail_from(json!({
            "numeroConvocatoria": "1",
            "documentos": [{"idDocumento": 1362058, "nombreFic": "bases.pdf"}]
        }));
        let pdf = select_pdf_pointer(&detail, BASE);
        assert_eq!(
            pdf.url.as_deref(),
            Some("https://www.infosubvenciones.es/bdnstrans/api/convocatorias/documentos?idDocumento=1362058")
        );
    }

    #[test]
    fn test_pdf_pointer_falls_back_to_grant_endpoint() {
        // Documents exist but none classifies as PDF: the fallback runs
        let detail = detail_from(json!({
            "numeroConvocatoria": "1",
            "id": 445566,
            "documentos": [{"idDocumento": 9, "urlDescarga": "https://x/anexo.docx"}]
        }));
        let pdf = select_pdf_pointer(&detail, BASE);
        assert!(pdf.tiene_pdf);
        assert_eq!(
            pdf.url.as_deref(),
            Some("https://www.infosubvenciones.es/bdnstrans/api/convocatorias/pdf?id=445566&vpd=GE")
        );
        assert_eq!(pdf.id_documento.as_deref(), Some("445566"));
    }

    #[test]
    fn test_pdf_pointer_absent() {
        let detail = detail_from(json!({"numeroConvocatoria": "1"}));
        let pdf = select_pdf_pointer(&detail, BASE);
        assert!(!pdf.tiene_pdf);
        assert_eq!(pdf.url, None);
    }

    #[test]
    fn test_normalize_beneficiarios_buckets() {
        let buckets = normalize_beneficiarios(&[
            "PYMES y grandes empresas".to_string(),
            "Ayuntamientos de la provincia".to_string(),
            "Asociaciones sin ánimo de lucro".to_string(),
        ]);
        assert_eq!(buckets, vec!["Empresa", "Entidad local", "ONG"]);
        assert!(normalize_beneficiarios(&[]).is_empty());
    }

    #[test]
    fn test_parse_region_codes() {
        let codes = parse_region_codes(&[
            "ES51 - CATALUÑA".to_string(),
            "ES612".to_string(),
            "ES51 - CATALUÑA".to_string(),
            "sin código".to_string(),
        ]);
        assert_eq!(codes, vec!["ES51", "ES612"]);
    }

    #[test]
    fn test_grant_from_detail_full() {
        let detail = detail_from(json!({
            "numeroConvocatoria": "872189",
            "titulo": "Ayudas a proyectos de flamenco",
            "organismo": "Ayuntamiento de Jerez",
            "finalidad": 11,
            "abierto": true,
            "fechaPublicacion": "2025-11-02T00:00:00Z",
            "fechaInicioSolicitud": "2020-01-01",
            "fechaFinSolicitud": "2099-12-31",
            "sectores": [],
            "sectoresProductos": [{"descripcion": "Cultura"}],
            "regiones": ["ES612 - CÁDIZ"],
            "tiposBeneficiario": ["Fundaciones culturales"],
            "documentos": [
                {"idDocumento": 10, "nombreFic": "convocatoria.pdf", "urlDescarga": "https://x/c.pdf"}
            ],
            "campoDesconocido": "se conserva"
        }));
        let pdf = select_pdf_pointer(&detail, BASE);
        let grant = grant_from_detail(&detail, &pdf);

        assert_eq!(grant.external_id, "872189");
        assert_eq!(grant.finalidad.as_deref(), Some("11"));
        assert_eq!(grant.sectores, vec!["Cultura"]);
        assert_eq!(grant.region_nuts, vec!["ES612"]);
        assert_eq!(grant.beneficiarios_normalizados, vec!["ONG"]);
        assert_eq!(
            grant.fecha_publicacion,
            NaiveDate::from_ymd_opt(2025, 11, 2)
        );
        assert_eq!(grant.is_open_now, Some(true));
        assert!(grant.tiene_pdf);
        assert!(grant.pdf_url_hash.is_some());
        // Verbatim payload keeps unknown wire fields
        assert_eq!(grant.raw_payload["campoDesconocido"], json!("se conserva"));
        assert_eq!(grant.documentos.len(), 1);
    }

    #[test]
    fn test_is_open_now_combinations() {
        let past = NaiveDate::from_ymd_opt(2000, 1, 1);
        let future = NaiveDate::from_ymd_opt(2099, 1, 1);
        assert_eq!(is_open_now(past, future), Some(true));
        assert_eq!(is_open_now(past, past), Some(false));
        assert_eq!(is_open_now(future, None), Some(false));
        assert_eq!(is_open_now(None, future), Some(true));
        assert_eq!(is_open_now(None, None), None);
    }
}
