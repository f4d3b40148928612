//! Wire types for the grants registry API.
//!
//! The registry's payloads are an open schema: required fields are
//! enforced, everything else is optional and anything unknown is preserved
//! in a flattened map so the verbatim payload survives a round trip.
//! Numeric identifiers show up both as numbers and as strings depending on
//! the endpoint, so scalar fields are deserialized leniently.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Accept strings, numbers and booleans where the schema says string.
fn de_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(scalar_to_string))
}

/// A required scalar rendered as a string; anything else is a schema error.
fn de_req_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    scalar_to_string(value).ok_or_else(|| serde::de::Error::custom("expected a scalar identifier"))
}

/// Accept an array of strings or of objects carrying a descripcion/nombre.
fn de_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(mut obj) => ["descripcion", "nombre", "codigo"]
                    .iter()
                    .find_map(|key| obj.remove(*key))
                    .and_then(scalar_to_string),
                other => scalar_to_string(other),
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// One item of a paginated search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    #[serde(rename = "numeroConvocatoria", deserialize_with = "de_req_string")]
    pub numero_convocatoria: String,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub titulo: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub organismo: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub finalidad: Option<String>,
    #[serde(default)]
    pub abierto: Option<bool>,
    #[serde(rename = "fechaPublicacion", default, deserialize_with = "de_opt_string")]
    pub fecha_publicacion: Option<String>,
    /// Unknown wire fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SearchItem {
    /// The registry id of this item.
    pub fn external_id(&self) -> &str {
        &self.numero_convocatoria
    }
}

/// Paginated response of `/convocatorias/busqueda`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub content: Vec<SearchItem>,
    #[serde(rename = "totalElements", default)]
    pub total_elements: u64,
    #[serde(rename = "totalPages", default)]
    pub total_pages: u32,
    #[serde(default)]
    pub size: u32,
    /// Current page number, zero-indexed.
    #[serde(default)]
    pub number: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of a detail response's documents array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentoRef {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "idDocumento", default)]
    pub id_documento: Option<i64>,
    #[serde(rename = "nombreFic", default, deserialize_with = "de_opt_string")]
    pub nombre_fic: Option<String>,
    #[serde(rename = "nombreDocumento", default, deserialize_with = "de_opt_string")]
    pub nombre_documento: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub descripcion: Option<String>,
    #[serde(rename = "tipoDocumento", default, deserialize_with = "de_opt_string")]
    pub tipo_documento: Option<String>,
    #[serde(rename = "urlDescarga", default, deserialize_with = "de_opt_string")]
    pub url_descarga: Option<String>,
    #[serde(rename = "urlDocumento", default, deserialize_with = "de_opt_string")]
    pub url_documento: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DocumentoRef {
    /// Preferred download URL, when the API provided one.
    pub fn url(&self) -> Option<&str> {
        self.url_documento.as_deref().or(self.url_descarga.as_deref())
    }

    /// Document id under either of its wire names.
    pub fn document_id(&self) -> Option<i64> {
        self.id_documento.or(self.id)
    }

    /// Display name under either of its wire names.
    pub fn nombre(&self) -> Option<&str> {
        self.nombre_documento
            .as_deref()
            .or(self.nombre_fic.as_deref())
    }
}

/// Detail response of `/convocatorias?numConv=…`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantDetail {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "numeroConvocatoria", default, deserialize_with = "de_opt_string")]
    pub numero_convocatoria: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub codigo: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub titulo: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub descripcion: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub objeto: Option<String>,

    #[serde(default, deserialize_with = "de_opt_string")]
    pub organismo: Option<String>,
    #[serde(rename = "organismoId", default, deserialize_with = "de_opt_string")]
    pub organismo_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub departamento: Option<String>,
    #[serde(rename = "tipoAdministracion", default, deserialize_with = "de_opt_string")]
    pub tipo_administracion: Option<String>,
    #[serde(rename = "nivelAdministracion", default, deserialize_with = "de_opt_string")]
    pub nivel_administracion: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub nivel1: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub nivel2: Option<String>,
    /// Organ descriptor object; may carry nivel1/nivel2/nivel3.
    #[serde(default)]
    pub organo: Option<Value>,

    #[serde(default, deserialize_with = "de_opt_string")]
    pub finalidad: Option<String>,
    #[serde(rename = "finalidadDescripcion", default, deserialize_with = "de_opt_string")]
    pub finalidad_descripcion: Option<String>,
    #[serde(default, deserialize_with = "de_string_list")]
    pub sectores: Vec<String>,
    #[serde(rename = "sectoresProductos", default)]
    pub sectores_productos: Option<Value>,
    #[serde(default, deserialize_with = "de_string_list")]
    pub regiones: Vec<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub ambito: Option<String>,

    #[serde(rename = "tiposBeneficiario", default, deserialize_with = "de_string_list")]
    pub tipos_beneficiario: Vec<String>,
    #[serde(rename = "tiposBeneficiarios", default)]
    pub tipos_beneficiarios_raw: Option<Value>,
    #[serde(rename = "beneficiariosDescripcion", default, deserialize_with = "de_opt_string")]
    pub beneficiarios_descripcion: Option<String>,
    #[serde(rename = "requisitosBeneficiarios", default, deserialize_with = "de_opt_string")]
    pub requisitos_beneficiarios: Option<String>,

    #[serde(rename = "fechaPublicacion", default, deserialize_with = "de_opt_string")]
    pub fecha_publicacion: Option<String>,
    #[serde(rename = "fechaRecepcion", default, deserialize_with = "de_opt_string")]
    pub fecha_recepcion: Option<String>,
    #[serde(rename = "fechaInicioSolicitud", default, deserialize_with = "de_opt_string")]
    pub fecha_inicio_solicitud: Option<String>,
    #[serde(rename = "fechaFinSolicitud", default, deserialize_with = "de_opt_string")]
    pub fecha_fin_solicitud: Option<String>,
    #[serde(rename = "fechaResolucion", default, deserialize_with = "de_opt_string")]
    pub fecha_resolucion: Option<String>,
    #[serde(default)]
    pub abierto: Option<bool>,

    #[serde(rename = "importeTotal", default, deserialize_with = "de_opt_string")]
    pub importe_total: Option<String>,
    #[serde(rename = "importeMinimo", default, deserialize_with = "de_opt_string")]
    pub importe_minimo: Option<String>,
    #[serde(rename = "importeMaximo", default, deserialize_with = "de_opt_string")]
    pub importe_maximo: Option<String>,
    #[serde(rename = "porcentajeFinanciacion", default, deserialize_with = "de_opt_string")]
    pub porcentaje_financiacion: Option<String>,

    #[serde(rename = "formaSolicitud", default, deserialize_with = "de_opt_string")]
    pub forma_solicitud: Option<String>,
    #[serde(rename = "lugarPresentacion", default, deserialize_with = "de_opt_string")]
    pub lugar_presentacion: Option<String>,
    #[serde(rename = "tramiteElectronico", default)]
    pub tramite_electronico: Option<bool>,
    #[serde(rename = "urlTramite", default, deserialize_with = "de_opt_string")]
    pub url_tramite: Option<String>,

    #[serde(default)]
    pub documentos: Vec<DocumentoRef>,

    #[serde(rename = "basesReguladoras", default, deserialize_with = "de_opt_string")]
    pub bases_reguladoras: Option<String>,
    #[serde(default)]
    pub normativa: Option<Value>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub compatibilidades: Option<String>,
    #[serde(default)]
    pub contacto: Option<Value>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub observaciones: Option<String>,

    /// Unknown wire fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// The untouched wire payload, attached by the client after parsing.
    #[serde(skip)]
    pub raw: Value,
}

impl GrantDetail {
    /// Administrative hierarchy levels, preferring the top-level fields and
    /// falling back to the organ descriptor.
    pub fn admin_levels(&self) -> (Option<String>, Option<String>, Option<String>) {
        let from_organo = |key: &str| -> Option<String> {
            self.organo
                .as_ref()
                .and_then(|o| o.get(key))
                .cloned()
                .and_then(scalar_to_string)
        };
        (
            self.nivel1.clone().or_else(|| from_organo("nivel1")),
            self.nivel2.clone().or_else(|| from_organo("nivel2")),
            from_organo("nivel3"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_search_response_parses_and_preserves_extra() {
        let payload = json!({
            "content": [
                {
                    "numeroConvocatoria": "872189",
                    "titulo": "Ayudas culturales",
                    "abierto": true,
                    "campoNuevo": {"x": 1}
                }
            ],
            "totalElements": 1234,
            "totalPages": 13,
            "size": 100,
            "number": 0,
            "first": true
        });
        let response: SearchResponse = serde_json::from_value(payload).unwrap();
        assert_eq!(response.total_elements, 1234);
        assert_eq!(response.total_pages, 13);
        assert_eq!(response.content.len(), 1);
        assert_eq!(response.content[0].external_id(), "872189");
        assert!(response.content[0].extra.contains_key("campoNuevo"));
        assert!(response.extra.contains_key("first"));
    }

    #[test]
    fn test_numeric_external_id_coerced() {
        let item: SearchItem =
            serde_json::from_value(json!({"numeroConvocatoria": 872189})).unwrap();
        assert_eq!(item.external_id(), "872189");
    }

    #[test]
    fn test_documento_url_preference() {
        let doc: DocumentoRef = serde_json::from_value(json!({
            "idDocumento": 1362058,
            "nombreFic": "convocatoria.pdf",
            "urlDescarga": "https://example.org/descarga",
            "urlDocumento": "https://example.org/doc.pdf"
        }))
        .unwrap();
        assert_eq!(doc.url(), Some("https://example.org/doc.pdf"));
        assert_eq!(doc.document_id(), Some(1362058));
        assert_eq!(doc.nombre(), Some("convocatoria.pdf"));
    }

    #[test]
    fn test_detail_sector_objects_flattened() {
        let detail: GrantDetail = serde_json::from_value(json!({
            "numeroConvocatoria": "1",
            "sectores": [{"descripcion": "Cultura", "codigo": "R"}, "Turismo"],
            "regiones": ["ES612 - CÁDIZ"],
            "finalidad": 11
        }))
        .unwrap();
        assert_eq!(detail.sectores, vec!["Cultura", "Turismo"]);
        assert_eq!(detail.regiones, vec!["ES612 - CÁDIZ"]);
        assert_eq!(detail.finalidad.as_deref(), Some("11"));
    }

    #[test]
    fn test_admin_levels_fall_back_to_organo() {
        let detail: GrantDetail = serde_json::from_value(json!({
            "numeroConvocatoria": "1",
            "organo": {"nivel1": "Andalucía", "nivel2": "Ayuntamiento de Jerez", "nivel3": "Cultura"}
        }))
        .unwrap();
        let (n1, n2, n3) = detail.admin_levels();
        assert_eq!(n1.as_deref(), Some("Andalucía"));
        assert_eq!(n2.as_deref(), Some("Ayuntamiento de Jerez"));
        assert_eq!(n3.as_deref(), Some("Cultura"));
    }

    #[test]
    fn test_missing_required_content_defaults_empty() {
        let response: SearchResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.content.is_empty());
        assert_eq!(response.total_pages, 0);
    }
}
