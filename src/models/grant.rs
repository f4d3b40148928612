//! Grant metadata as fetched from the registry API.
//!
//! The registry calls these *convocatorias*; field names keep the registry's
//! Spanish vocabulary so the stored rows line up with the wire payloads.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a grant's documents array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantDocument {
    pub id: Option<i64>,
    pub nombre: Option<String>,
    pub url: Option<String>,
}

/// Structured grant metadata from the source API, plus derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    /// Database row ID.
    pub id: i64,
    /// Registry identifier (numeroConvocatoria), unique in the source.
    pub external_id: String,

    // Identification
    pub codigo: Option<String>,
    pub titulo: Option<String>,
    pub descripcion: Option<String>,
    pub objeto: Option<String>,

    // Administrative hierarchy
    pub organismo: Option<String>,
    pub organismo_id: Option<String>,
    pub departamento: Option<String>,
    pub tipo_administracion: Option<String>,
    pub nivel_administracion: Option<String>,
    pub nivel1: Option<String>,
    pub nivel2: Option<String>,
    pub nivel3: Option<String>,

    // Classification
    pub finalidad: Option<String>,
    pub finalidad_descripcion: Option<String>,
    pub ambito: Option<String>,
    pub sectores: Vec<String>,
    /// Normalized sector labels; source of truth when non-empty.
    pub sectores_normalizados: Vec<String>,
    pub regiones: Vec<String>,
    /// NUTS codes parsed out of `regiones` entries like "ES51 - CATALUÑA".
    pub region_nuts: Vec<String>,

    // Beneficiaries
    pub tipos_beneficiario: Vec<String>,
    pub beneficiarios_normalizados: Vec<String>,
    pub beneficiarios_descripcion: Option<String>,
    pub requisitos_beneficiarios: Option<String>,

    // Dates
    pub fecha_publicacion: Option<NaiveDate>,
    pub fecha_inicio_solicitud: Option<NaiveDate>,
    pub fecha_fin_solicitud: Option<NaiveDate>,
    pub fecha_resolucion: Option<NaiveDate>,
    /// Open flag as reported by the API.
    pub abierto: bool,
    /// Derived: whether the solicitation window contained the fetch date.
    pub is_open_now: Option<bool>,

    // Amounts (kept as registry strings, may carry currency text)
    pub importe_total: Option<String>,
    pub importe_minimo: Option<String>,
    pub importe_maximo: Option<String>,
    pub porcentaje_financiacion: Option<String>,

    // Application
    pub forma_solicitud: Option<String>,
    pub lugar_presentacion: Option<String>,
    pub tramite_electronico: bool,
    pub url_tramite: Option<String>,

    // Documents and the selected primary-PDF pointer
    pub documentos: Vec<GrantDocument>,
    pub tiene_pdf: bool,
    pub pdf_url: Option<String>,
    pub pdf_nombre: Option<String>,
    pub pdf_id_documento: Option<String>,
    pub pdf_url_hash: Option<String>,

    // Additional info
    pub bases_reguladoras: Option<String>,
    pub normativa: Value,
    pub compatibilidades: Option<String>,
    pub contacto: Option<Value>,
    pub observaciones: Option<String>,

    /// Full API response, kept verbatim.
    pub raw_payload: Value,
    /// Data source tag.
    pub fuente: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Grant {
    /// Whether the grant carries any documents.
    pub fn has_documents(&self) -> bool {
        !self.documentos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_grant() -> Grant {
        Grant {
            id: 0,
            external_id: "872189".to_string(),
            codigo: None,
            titulo: None,
            descripcion: None,
            objeto: None,
            organismo: None,
            organismo_id: None,
            departamento: None,
            tipo_administracion: None,
            nivel_administracion: None,
            nivel1: None,
            nivel2: None,
            nivel3: None,
            finalidad: None,
            finalidad_descripcion: None,
            ambito: None,
            sectores: Vec::new(),
            sectores_normalizados: Vec::new(),
            regiones: Vec::new(),
            region_nuts: Vec::new(),
            tipos_beneficiario: Vec::new(),
            beneficiarios_normalizados: Vec::new(),
            beneficiarios_descripcion: None,
            requisitos_beneficiarios: None,
            fecha_publicacion: None,
            fecha_inicio_solicitud: None,
            fecha_fin_solicitud: None,
            fecha_resolucion: None,
            abierto: false,
            is_open_now: None,
            importe_total: None,
            importe_minimo: None,
            importe_maximo: None,
            porcentaje_financiacion: None,
            forma_solicitud: None,
            lugar_presentacion: None,
            tramite_electronico: false,
            url_tramite: None,
            documentos: Vec::new(),
            tiene_pdf: false,
            pdf_url: None,
            pdf_nombre: None,
            pdf_id_documento: None,
            pdf_url_hash: None,
            bases_reguladoras: None,
            normativa: Value::Array(Vec::new()),
            compatibilidades: None,
            contacto: None,
            observaciones: None,
            raw_payload: Value::Null,
            fuente: "infosubvenciones".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_has_documents() {
        let mut grant = blank_grant();
        assert!(!grant.has_documents());
        grant.documentos.push(GrantDocument {
            id: Some(1362058),
            nombre: Some("convocatoria.pdf".to_string()),
            url: None,
        });
        assert!(grant.has_documents());
    }
}
