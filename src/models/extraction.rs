//! LLM-derived structured view of a grant.
//!
//! An `Extraction` holds the text artifact produced by the pdf stage plus
//! the fixed field schema filled in by the llm stage. The field record is
//! deserialized from the model's JSON with an explicit key whitelist -
//! unknown keys are dropped, malformed values degrade to `None` instead of
//! failing the whole record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Stored artifact and field data for one grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    /// Database row ID.
    pub id: i64,
    /// Owning grant; at most one extraction per grant.
    pub grant_id: i64,
    /// Staging item that produced this extraction.
    pub staging_id: i64,
    /// Denormalized registry identifier, for joins and logging.
    pub external_id: String,

    /// Full text extracted from the PDF.
    pub extracted_text: Option<String>,
    /// LLM-generated Spanish summary.
    pub extracted_summary: Option<String>,
    /// First 500 characters of the summary.
    pub summary_preview: Option<String>,
    /// Path to the markdown artifact on disk.
    pub markdown_path: Option<String>,
    pub page_count: Option<u32>,
    pub word_count: Option<u32>,
    /// True when the PDF had no extractable text layer.
    pub is_scanned: bool,

    /// The typed field record produced by the llm stage.
    pub fields: ExtractionFields,

    /// Name of the model that produced `fields`; acts as a version tag.
    /// Set to the text-extraction method name until the llm stage runs.
    pub extraction_model: String,
    pub extraction_confidence: Option<f64>,
    pub extraction_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Extraction {
    /// Whether the llm stage already ran with the given model tag.
    pub fn processed_with(&self, model: &str) -> bool {
        self.extraction_model == model
    }

    /// Whether there is enough text to feed downstream stages.
    pub fn has_text(&self) -> bool {
        self.extracted_text
            .as_deref()
            .map(|t| t.trim().len() >= 50)
            .unwrap_or(false)
    }
}

/// The fixed extraction schema. Keys mirror the Spanish vocabulary of the
/// registry documents; arrays with model-defined inner shape are carried as
/// raw JSON values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionFields {
    // Basic info
    #[serde(deserialize_with = "de_opt_string")]
    pub titulo: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub organismo: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub ambito_geografico: Option<String>,

    // Purpose
    #[serde(deserialize_with = "de_opt_string")]
    pub objeto: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub finalidad_pdf: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub finalidad_descripcion_pdf: Option<String>,

    // Beneficiary (nominative grants)
    #[serde(deserialize_with = "de_opt_string")]
    pub beneficiario_nombre: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub beneficiario_cif: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub proyecto_nombre: Option<String>,

    // Beneficiary types (raw + normalized)
    #[serde(deserialize_with = "de_opt_string")]
    pub tipos_beneficiario_raw: Option<String>,
    #[serde(deserialize_with = "de_string_vec")]
    pub tipos_beneficiario_normalized: Vec<String>,

    // Sectors (raw + inferred)
    #[serde(deserialize_with = "de_opt_string")]
    pub sectores_raw: Option<String>,
    #[serde(deserialize_with = "de_string_vec")]
    pub sectores_inferidos: Vec<String>,

    // Instrument and procedure
    #[serde(deserialize_with = "de_opt_string")]
    pub instrumentos_raw: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub instrumento_normalizado: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub procedimiento: Option<String>,

    // Region
    #[serde(deserialize_with = "de_opt_string")]
    pub region_mencionada: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub region_nuts: Option<String>,

    // Signatories: [{nombre, dni, cargo}]
    pub firmantes: Option<Value>,

    // CSV verification
    #[serde(deserialize_with = "de_opt_string")]
    pub csv_codigo: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub url_verificacion: Option<String>,

    // Compliance
    pub memoria_obligatoria: Option<Value>,
    #[serde(deserialize_with = "de_opt_bool")]
    pub es_compatible_otras_ayudas: Option<bool>,

    // Administrative inference (raw + normalized)
    #[serde(deserialize_with = "de_opt_string")]
    pub tipo_administracion_raw: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub nivel_administracion_raw: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub ambito_raw: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub tipo_administracion_normalizado: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub nivel_administracion_normalizado: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub ambito_normalizado: Option<String>,

    // Beneficiary details from the PDF
    #[serde(deserialize_with = "de_opt_string")]
    pub beneficiarios_descripcion_pdf: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub requisitos_beneficiarios_pdf: Option<String>,

    // Financial
    #[serde(deserialize_with = "de_opt_string")]
    pub gastos_subvencionables: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub cuantia_subvencion: Option<String>,
    #[serde(deserialize_with = "de_opt_f64")]
    pub cuantia_min: Option<f64>,
    #[serde(deserialize_with = "de_opt_f64")]
    pub cuantia_max: Option<f64>,
    #[serde(deserialize_with = "de_opt_string")]
    pub intensidad_ayuda: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub compatibilidad_otras_ayudas: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub importe_total_pdf: Option<String>,
    #[serde(deserialize_with = "de_opt_f64")]
    pub importe_maximo_pdf: Option<f64>,

    // Deadlines and execution
    #[serde(deserialize_with = "de_opt_string")]
    pub plazo_ejecucion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub plazo_justificacion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub fecha_inicio_ejecucion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub fecha_fin_ejecucion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub plazo_resolucion: Option<String>,

    // Justification requirements
    #[serde(deserialize_with = "de_opt_string")]
    pub forma_justificacion: Option<String>,
    pub documentacion_requerida: Option<Value>,
    #[serde(deserialize_with = "de_opt_string")]
    pub sistema_evaluacion: Option<String>,

    // Payment and guarantees
    #[serde(deserialize_with = "de_opt_string")]
    pub forma_pago: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub pago_anticipado: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub garantias: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub exige_aval: Option<String>,

    // Obligations and conditions
    #[serde(deserialize_with = "de_opt_string")]
    pub obligaciones_beneficiario: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub publicidad_requerida: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub subcontratacion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub modificaciones_permitidas: Option<String>,

    // Specific requirements
    #[serde(deserialize_with = "de_opt_string")]
    pub requisitos_tecnicos: Option<String>,
    pub criterios_valoracion: Option<Value>,
    pub documentos_fase_solicitud: Option<Value>,

    // Application and submission from the PDF
    #[serde(deserialize_with = "de_opt_string")]
    pub forma_solicitud_pdf: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub lugar_presentacion_pdf: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub url_tramite_pdf: Option<String>,

    // Regulations
    #[serde(deserialize_with = "de_opt_string")]
    pub bases_reguladoras_pdf: Option<String>,
    pub normativa_pdf: Option<Value>,

    // Raw source fragments (kept for review and debugging)
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_objeto: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_finalidad: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_ambito: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_beneficiarios: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_requisitos_beneficiarios: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_importe_total: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_importe_maximo: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_porcentaje_financiacion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_forma_solicitud: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_lugar_presentacion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_bases_reguladoras: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_normativa: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_gastos_subvencionables: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_forma_justificacion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_plazo_ejecucion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_plazo_justificacion: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_forma_pago: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_compatibilidad: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_publicidad: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_garantias: Option<String>,
    #[serde(deserialize_with = "de_opt_string")]
    pub raw_subcontratacion: Option<String>,
}

impl ExtractionFields {
    /// Build a field record from a parsed LLM response. Unknown keys are
    /// ignored; values of unexpected type degrade to `None`/empty.
    pub fn from_json(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// True when no field carries data.
    pub fn is_empty(&self) -> bool {
        serde_json::to_value(self)
            .map(|v| match v {
                Value::Object(map) => map.values().all(|v| match v {
                    Value::Null => true,
                    Value::Array(a) => a.is_empty(),
                    _ => false,
                }),
                _ => false,
            })
            .unwrap_or(false)
    }
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
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

/// Accept any scalar where a string is expected; arrays/objects become None.
fn de_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(scalar_to_string))
}

/// Accept a number or a numeric string (commas tolerated as separators).
fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }))
}

/// Accept a bool or a Spanish/English yes-no string.
fn de_opt_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Bool(b) => Some(b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "sí" | "si" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }))
}

/// Accept an array of scalars or a comma-separated string.
fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items.into_iter().filter_map(scalar_to_string).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => Vec::new(),
    })
}
