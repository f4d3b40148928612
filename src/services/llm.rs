//! LLM client for grant summarization and structured field extraction.
//!
//! Talks to a Gemini-style generateContent endpoint. Two calls per grant:
//! a bounded Spanish summary and a fields call that must return only a JSON
//! object with the fixed extraction schema. Responses go through the JSON
//! recovery chain; an irrecoverable fields response degrades to an empty
//! object with confidence zero instead of failing the task.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::json_repair::recover_json;
use crate::pipeline::retry::{retry_with_policy, RetryClass, RetryPolicy};

/// Prompt for the Spanish summary call. `{content}` is replaced with the
/// (truncated) PDF text.
const SUMMARY_PROMPT: &str = r#"Eres un asistente experto en subvenciones españolas.

Analiza el siguiente texto extraído de una convocatoria de ayudas y genera un resumen en español.

REQUISITOS:
- Máximo 500 palabras
- Escribe en español
- Sé conciso pero completo
- Enfócate en: objetivo, beneficiarios, cuantías, plazos, requisitos
- No inventes información que no esté en el texto
- Si falta información importante, indícalo claramente

TEXTO DE LA CONVOCATORIA:
{content}

RESUMEN EN ESPAÑOL:"#;

/// Prompt for the structured fields call. The key list is the extraction
/// schema; the model must answer with a single JSON object.
const FIELDS_PROMPT: &str = r#"Eres un asistente experto en análisis de subvenciones españolas.

Extrae la siguiente información del texto de la convocatoria y devuélvela en formato JSON.

CAMPOS A EXTRAER:

**Información Básica:**
1. titulo: Título de la convocatoria (texto breve)
2. organismo: Organismo convocante (texto breve)
3. ambito_geografico: Ámbito geográfico (ej: "Nacional", "Madrid")

**Propósito / Finalidad:**
4. objeto: Oración completa del propósito (busca "OBJETO", "tiene por objeto")
5. finalidad_pdf: Propósito/finalidad en 1-2 oraciones
6. finalidad_descripcion_pdf: Descripción detallada de la finalidad y actividades financiadas

**Información del Beneficiario:**
7. beneficiario_nombre: Nombre del beneficiario específico si es subvención nominativa
8. beneficiario_cif: CIF/NIF del beneficiario (solo el código, ej: "G48261150")
9. proyecto_nombre: Nombre del proyecto o actividad específica
10. tipos_beneficiario_raw: Tipo de entidad del beneficiario (ej: "Fundación Pública Local", "Ayuntamiento")
11. beneficiarios_descripcion_pdf: Párrafo completo sobre quién puede recibir la ayuda
12. requisitos_beneficiarios_pdf: Requisitos y condiciones de los beneficiarios

**Sectores (inferir de las actividades):**
13. sectores_raw: Palabras clave relacionadas con sectores (ej: "flamenco, artes escénicas, cultura")

**Instrumentos y Procedimiento:**
14. instrumentos_raw: Texto literal del tipo de instrumento (busca: "subvención directa", "vía convenio")
15. instrumento_normalizado: Uno de: "Subvención directa nominativa", "Subvención concurrencia competitiva", "Convenio", "Concesión directa"
16. procedimiento: Uno de: "Concesión directa", "Concurrencia competitiva", "Convenio"

**Región:**
17. region_mencionada: Regiones, provincias o municipios mencionados (ej: "Cádiz, Jerez de la Frontera")

**Firmantes:**
18. firmantes: Array de firmantes. Formato: [{"nombre": "...", "dni": "...", "cargo": "..."}]

**Verificación CSV:**
19. csv_codigo: Código Seguro de Verificación (busca "CSV" en pie de página)
20. url_verificacion: URL de verificación del documento

**Administración (inferencia):**
21. tipo_administracion_raw: Tipo de administración del organismo (Ayuntamiento, Diputación, Junta, Ministerio)
22. nivel_administracion_raw: Nivel específico (municipal, provincial, autonómico, estatal)
23. ambito_raw: Ámbito geográfico literal (busca "ámbito provincial", "ámbito estatal")

**Memoria y Compatibilidad:**
24. memoria_obligatoria: Array de documentos/informes obligatorios de la justificación
25. es_compatible_otras_ayudas: Boolean - ¿Es compatible con otras subvenciones?

**Detalles Financieros:**
26. importe_total_pdf: Importe total/presupuesto total (texto con unidades)
27. importe_maximo_pdf: Importe máximo por beneficiario (número en euros)
28. gastos_subvencionables: Gastos que se pueden subvencionar
29. cuantia_subvencion: Cuantía de la subvención (texto descriptivo)
30. cuantia_min: Cuantía mínima en euros (número, solo el valor numérico)
31. cuantia_max: Cuantía máxima en euros (número, solo el valor numérico)
32. intensidad_ayuda: Porcentaje de financiación (ej: "80%")
33. compatibilidad_otras_ayudas: Compatibilidad con otras ayudas (texto)

**Solicitud y Presentación:**
34. forma_solicitud_pdf: Cómo presentar la solicitud (presencial, electrónica, ambas)
35. lugar_presentacion_pdf: Dónde presentar (Registro General, sede electrónica)
36. url_tramite_pdf: URL de la sede electrónica o formulario de solicitud

**Normativa:**
37. bases_reguladoras_pdf: Referencias a bases reguladoras (BOE/BOP nº, fecha)
38. normativa_pdf: Array de leyes y decretos. Formato: ["Ley 38/2003", "Real Decreto 887/2006"]

**Plazos y Ejecución:**
39. plazo_ejecucion: Plazo para ejecutar el proyecto
40. plazo_justificacion: Plazo para justificar gastos
41. fecha_inicio_ejecucion: Fecha inicio ejecución (formato YYYY-MM-DD o null)
42. fecha_fin_ejecucion: Fecha fin ejecución (formato YYYY-MM-DD o null)
43. plazo_resolucion: Plazo de resolución

**Requisitos de Justificación:**
44. forma_justificacion: Cómo justificar los gastos
45. documentacion_requerida: Documentos requeridos (array de strings o null)
46. sistema_evaluacion: Sistema de evaluación

**Pago y Garantías:**
47. forma_pago: Forma de pago
48. pago_anticipado: Porcentaje de pago anticipado (ej: "50%")
49. garantias: Garantías requeridas
50. exige_aval: Requiere aval bancario ("Sí", "No", o null)

**Obligaciones y Condiciones:**
51. obligaciones_beneficiario: Obligaciones del beneficiario
52. publicidad_requerida: Requisitos de publicidad
53. subcontratacion: Reglas de subcontratación
54. modificaciones_permitidas: Modificaciones permitidas

**Requisitos Específicos:**
55. requisitos_tecnicos: Requisitos técnicos
56. criterios_valoracion: Criterios de evaluación (array de objetos con criterio y puntos, o null)
57. documentos_fase_solicitud: Documentos necesarios para solicitar (array de strings o null)

**CAMPOS RAW (texto literal sin procesar):**
58. raw_objeto, 59. raw_finalidad, 60. raw_ambito, 61. raw_beneficiarios,
62. raw_requisitos_beneficiarios, 63. raw_importe_total, 64. raw_importe_maximo,
65. raw_porcentaje_financiacion, 66. raw_forma_solicitud, 67. raw_lugar_presentacion,
68. raw_bases_reguladoras, 69. raw_normativa, 70. raw_gastos_subvencionables,
71. raw_forma_justificacion, 72. raw_plazo_ejecucion, 73. raw_plazo_justificacion,
74. raw_forma_pago, 75. raw_compatibilidad, 76. raw_publicidad, 77. raw_garantias,
78. raw_subcontratacion: copia el texto literal completo de esa sección del PDF

IMPORTANTE:
- Si un campo no está en el texto, pon null
- Para cuantia_min, cuantia_max, importe_maximo_pdf: extrae SOLO el número en euros
- Para fechas, usa formato YYYY-MM-DD si es posible
- Para arrays usa formato JSON array
- Para es_compatible_otras_ayudas, usa true/false (boolean)
- Sé preciso y cita textualmente cuando sea posible
- NO inventes información que no está en el texto; si hay incertidumbre, pon null

TEXTO DE LA CONVOCATORIA:
{content}

Responde SOLO con el JSON, sin texto adicional:"#;

/// Spanish domain terms whose presence in a summary raises confidence.
const QUALITY_TERMS: [&str; 7] = [
    "beneficiarios",
    "cuantía",
    "plazo",
    "requisitos",
    "objetivo",
    "ayuda",
    "subvención",
];

/// Character budget for the summary call input.
const SUMMARY_INPUT_CHARS: usize = 10_000;
/// Character budget for the fields call input.
const FIELDS_INPUT_CHARS: usize = 20_000;
/// Summaries shorter than this are rejected as useless.
const MIN_SUMMARY_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    #[error("Parse error: {0}")]
    Parse(String),
}

impl LlmError {
    fn retry_class(&self) -> RetryClass {
        match self {
            LlmError::Connection(_) | LlmError::Api(_) => RetryClass::Retryable,
            LlmError::RateLimited(delay) => RetryClass::RetryAfter(*delay),
            LlmError::Parse(_) => RetryClass::Fatal,
        }
    }
}

/// Configuration for the LLM client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API endpoint base (default: the public Gemini REST endpoint).
    pub endpoint: String,
    pub api_key: String,
    /// Model name; doubles as the extraction version tag.
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl LlmConfig {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature: 0.2,
            max_output_tokens: 8192,
        }
    }
}

/// Combined result of the two LLM calls for one grant.
#[derive(Debug, Clone)]
pub struct LlmExtraction {
    pub summary: String,
    /// Parsed fields object; empty object when recovery failed.
    pub fields: Value,
    pub confidence: f64,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "topK")]
    top_k: u32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

/// Client for the text-generation endpoint.
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            config,
            client,
            retry_policy: RetryPolicy::new(3, Duration::from_secs(4), Duration::from_secs(60)),
        }
    }

    /// The model tag this client stamps on extractions.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Generate the Spanish summary. Returns an empty summary with zero
    /// confidence when the input or the response is too short to be useful.
    pub async fn generate_summary(
        &self,
        text: &str,
        external_id: &str,
    ) -> Result<(String, f64), LlmError> {
        if text.trim().len() < MIN_SUMMARY_CHARS {
            warn!("Text too short for summary: {}", external_id);
            return Ok((String::new(), 0.0));
        }

        let prompt = SUMMARY_PROMPT.replace("{content}", truncate_chars(text, SUMMARY_INPUT_CHARS));
        debug!("Generating summary for {}", external_id);
        let response = self.generate(&prompt).await?;
        let summary = response.trim().to_string();

        if summary.len() < MIN_SUMMARY_CHARS {
            warn!("Summary too short for {}: {} chars", external_id, summary.len());
            return Ok((String::new(), 0.0));
        }

        let confidence = estimate_confidence(&summary);
        info!(
            "Summary for {}: {} chars, confidence {:.2}",
            external_id,
            summary.len(),
            confidence
        );
        Ok((summary, confidence))
    }

    /// Extract the structured field object. Irrecoverable JSON yields an
    /// empty object rather than an error.
    pub async fn extract_fields(&self, text: &str, external_id: &str) -> Result<Value, LlmError> {
        if text.trim().len() < MIN_SUMMARY_CHARS {
            warn!("Text too short for field extraction: {}", external_id);
            return Ok(Value::Object(Default::default()));
        }

        let prompt = FIELDS_PROMPT.replace("{content}", truncate_chars(text, FIELDS_INPUT_CHARS));
        debug!("Extracting fields for {}", external_id);
        let response = self.generate(&prompt).await?;

        match recover_json(&response) {
            Some(Value::Object(map)) => {
                info!("Extracted {} fields for {}", map.len(), external_id);
                Ok(Value::Object(map))
            }
            Some(other) => {
                warn!(
                    "Fields response for {} was JSON but not an object ({})",
                    external_id,
                    json_kind(&other)
                );
                Ok(Value::Object(Default::default()))
            }
            None => {
                warn!(
                    "Could not recover JSON from fields response for {} (first 200 chars: {})",
                    external_id,
                    truncate_chars(&response, 200)
                );
                Ok(Value::Object(Default::default()))
            }
        }
    }

    /// Complete processing for one grant: summary plus fields. Confidence
    /// drops to zero when the fields object came back empty.
    pub async fn process(&self, text: &str, external_id: &str) -> Result<LlmExtraction, LlmError> {
        let (summary, confidence) = self.generate_summary(text, external_id).await?;
        let fields = self.extract_fields(text, external_id).await?;
        let confidence = match &fields {
            Value::Object(map) if map.is_empty() => 0.0,
            _ => confidence,
        };
        Ok(LlmExtraction {
            summary,
            fields,
            confidence,
        })
    }

    /// One generateContent call with retry.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        retry_with_policy(&self.retry_policy, LlmError::retry_class, |_attempt| async move {
            let url = format!(
                "{}/models/{}:generateContent",
                self.config.endpoint, self.config.model
            );
            let request = GenerateRequest {
                contents: vec![Content {
                    parts: vec![Part {
                        text: prompt.to_string(),
                    }],
                }],
                generation_config: GenerationConfig {
                    temperature: self.config.temperature,
                    top_p: 0.8,
                    top_k: 40,
                    max_output_tokens: self.config.max_output_tokens,
                },
            };

            let response = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.config.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| LlmError::Connection(e.to_string()))?;

            let status = response.status();
            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                return Err(LlmError::RateLimited(Duration::from_secs(retry_after)));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Api(format!(
                    "HTTP {status}: {}",
                    truncate_chars(&body, 300)
                )));
            }

            let parsed: GenerateResponse = response
                .json()
                .await
                .map_err(|e| LlmError::Parse(e.to_string()))?;

            let text: String = parsed
                .candidates
                .into_iter()
                .next()
                .and_then(|c| c.content)
                .map(|c| {
                    c.parts
                        .into_iter()
                        .map(|p| p.text)
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();

            if text.trim().is_empty() {
                return Err(LlmError::Api("empty model response".to_string()));
            }
            Ok(text)
        })
        .await
    }
}

/// Confidence heuristic over a generated summary: base 0.7, adjusted for
/// length, plus up to 0.2 for Spanish domain-term coverage, capped at 0.95.
pub fn estimate_confidence(summary: &str) -> f64 {
    if summary.len() < MIN_SUMMARY_CHARS {
        return 0.0;
    }

    let mut confidence = 0.7;
    if (200..=3000).contains(&summary.len()) {
        confidence += 0.1;
    } else if summary.len() > 5000 {
        confidence -= 0.1;
    }

    let lower = summary.to_lowercase();
    let matches = QUALITY_TERMS
        .iter()
        .filter(|term| lower.contains(*term))
        .count();
    confidence += (matches as f64 / QUALITY_TERMS.len() as f64) * 0.2;

    confidence.min(0.95)
}

/// UTF-8 safe prefix of at most `max` bytes.
fn truncate_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
