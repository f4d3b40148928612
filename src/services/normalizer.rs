//! Deterministic post-normalization of LLM-extracted fields.
//!
//! Pure keyword-table lookups: sectors, instruments, procedures,
//! administration type/level, scope, beneficiary types and region-to-NUTS
//! codes. Running after the LLM keeps the tables tweakable without
//! reprocessing PDFs; results are versioned through the extraction model
//! tag so re-runs with a new tag are permitted.

use crate::models::ExtractionFields;

/// Sector keyword table: label, then the keywords that imply it.
const SECTOR_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "Cultura y artes",
        &[
            "flamenco",
            "artes escénicas",
            "teatro",
            "danza",
            "música",
            "cultura",
            "cultural",
            "artístico",
            "patrimonio cultural",
            "museo",
            "exposición",
            "festival",
            "concierto",
        ],
    ),
    (
        "Turismo",
        &[
            "turismo",
            "turístico",
            "hotelero",
            "hostelería",
            "alojamiento turístico",
            "promoción turística",
        ],
    ),
    (
        "Comercio",
        &[
            "comercio",
            "comercial",
            "venta",
            "tienda",
            "establecimiento comercial",
            "pyme comercial",
            "pequeño comercio",
        ],
    ),
    (
        "Industria",
        &[
            "industria",
            "industrial",
            "fabricación",
            "manufactura",
            "producción industrial",
        ],
    ),
    (
        "Tecnología e innovación",
        &[
            "tecnología",
            "tecnológico",
            "innovación",
            "i+d+i",
            "investigación",
            "desarrollo tecnológico",
            "digitalización",
            "transformación digital",
        ],
    ),
    (
        "Medio ambiente",
        &[
            "medio ambiente",
            "ambiental",
            "sostenibilidad",
            "energía renovable",
            "eficiencia energética",
            "economía circular",
            "reciclaje",
        ],
    ),
    (
        "Agricultura y ganadería",
        &[
            "agricultura",
            "agrícola",
            "ganadería",
            "ganadero",
            "rural",
            "desarrollo rural",
            "agropecuario",
        ],
    ),
    (
        "Servicios sociales",
        &[
            "social",
            "servicios sociales",
            "asistencia social",
            "dependencia",
            "mayores",
            "discapacidad",
            "inclusión social",
        ],
    ),
    (
        "Educación y formación",
        &[
            "educación",
            "educativo",
            "formación",
            "capacitación",
            "enseñanza",
            "escolar",
            "académico",
        ],
    ),
    (
        "Deporte",
        &[
            "deporte",
            "deportivo",
            "actividad física",
            "instalación deportiva",
        ],
    ),
];

const INSTRUMENT_MAPPINGS: &[(&str, &[&str])] = &[
    (
        "Subvención directa nominativa",
        &[
            "subvención directa nominativa",
            "subvención nominativa",
            "concesión nominativa",
            "nominativa",
        ],
    ),
    (
        "Subvención concurrencia competitiva",
        &[
            "concurrencia competitiva",
            "convocatoria pública",
            "régimen de concurrencia",
        ],
    ),
    (
        "Convenio",
        &["convenio", "convenio de colaboración", "acuerdo", "vía convenio"],
    ),
    ("Concesión directa", &["concesión directa", "directa"]),
];

const PROCEDURE_MAPPINGS: &[(&str, &[&str])] = &[
    (
        "Concesión directa",
        &[
            "concesión directa",
            "directa",
            "sin concurrencia",
            "procedimiento directo",
        ],
    ),
    (
        "Concurrencia competitiva",
        &["concurrencia competitiva", "competitivo", "convocatoria pública"],
    ),
    ("Convenio", &["convenio", "vía convenio"]),
];

const TIPO_ADMIN_MAPPINGS: &[(&str, &[&str])] = &[
    (
        "Local",
        &[
            "ayuntamiento",
            "municipio",
            "concejo",
            "cabildo",
            "corporación municipal",
            "consistorio",
        ],
    ),
    (
        "Provincial",
        &[
            "diputación",
            "diputación provincial",
            "cabildo insular",
            "fundación provincial",
        ],
    ),
    (
        "Autonómica",
        &[
            "comunidad autónoma",
            "junta de",
            "generalitat",
            "gobierno de",
            "xunta de",
            "gobierno vasco",
            "gobierno autonómico",
        ],
    ),
    (
        "Estatal",
        &[
            "ministerio",
            "estado",
            "gobierno de españa",
            "administración general del estado",
            "secretaría de estado",
        ],
    ),
];

const NIVEL_ADMIN_MAPPINGS: &[(&str, &[&str])] = &[
    ("Municipal", &["ayuntamiento", "municipio", "concejo", "consistorio"]),
    ("Provincial", &["diputación", "provincia", "cabildo insular"]),
    (
        "Autonómico",
        &["autonómica", "comunidad autónoma", "autonomía", "autonómico"],
    ),
    ("Estatal", &["estado", "estatal", "nacional", "ministerio"]),
    (
        "Internacional",
        &["internacional", "europeo", "unión europea", "comisión europea"],
    ),
];

const AMBITO_MAPPINGS: &[(&str, &[&str])] = &[
    (
        "Local",
        &[
            "ámbito local",
            "ámbito municipal",
            "municipio de",
            "en el término municipal",
        ],
    ),
    (
        "Provincial",
        &[
            "ámbito provincial",
            "en la provincia de",
            "la provincia de",
            "provincial",
        ],
    ),
    (
        "Autonómico",
        &["ámbito autonómico", "comunidad autónoma", "autonómico"],
    ),
    (
        "Estatal",
        &[
            "ámbito estatal",
            "ámbito nacional",
            "todo el territorio español",
            "estatal",
        ],
    ),
    ("Internacional", &["ámbito internacional", "internacional", "europeo"]),
];

/// Closed beneficiary-type set.
const BENEFICIARY_TYPE_MAPPINGS: &[(&str, &[&str])] = &[
    (
        "Fundación",
        &[
            "fundación",
            "fundación pública",
            "fundación privada",
            "fundación pública local",
        ],
    ),
    (
        "Asociación",
        &[
            "asociación",
            "asociación sin ánimo de lucro",
            "asociación cultural",
            "asociación deportiva",
        ],
    ),
    (
        "Ayuntamiento",
        &["ayuntamiento", "municipio", "corporación local"],
    ),
    (
        "Empresa",
        &[
            "empresa",
            "sociedad",
            "pyme",
            "emprendedor",
            "pequeña empresa",
            "mediana empresa",
        ],
    ),
    (
        "Universidad",
        &["universidad", "centro universitario", "institución académica"],
    ),
    (
        "ONG",
        &["ong", "organización no gubernamental", "sin ánimo de lucro"],
    ),
    ("Cooperativa", &["cooperativa", "sociedad cooperativa"]),
    ("Cámara de Comercio", &["cámara de comercio", "cámara oficial"]),
    ("Autónomo", &["autónomo", "autónoma", "trabajador por cuenta propia"]),
    ("Entidad local", &["entidad local", "diputación", "cabildo", "comarca"]),
    (
        "Organismo público",
        &["organismo público", "ente público", "empresa pública", "organismo autónomo"],
    ),
];

/// Spanish regions and provinces to NUTS codes. NUTS-3 provinces are listed
/// before the NUTS-2 communities that contain them; lookups pick the most
/// specific (longest) matching code.
const REGION_NUTS_MAPPINGS: &[(&str, &[&str])] = &[
    // Provinces (NUTS-3)
    ("ES611", &["Almería", "Almeria"]),
    ("ES612", &["Cádiz", "Cadiz"]),
    ("ES613", &["Granada"]),
    ("ES614", &["Córdoba", "Cordoba"]),
    ("ES615", &["Huelva"]),
    ("ES616", &["Jaén", "Jaen"]),
    ("ES617", &["Málaga", "Malaga"]),
    ("ES618", &["Sevilla", "Seville"]),
    ("ES300", &["Madrid"]),
    ("ES511", &["Barcelona"]),
    ("ES512", &["Girona", "Gerona"]),
    ("ES513", &["Lleida", "Lérida"]),
    ("ES514", &["Tarragona"]),
    ("ES521", &["Alicante", "Alacant"]),
    ("ES522", &["Castellón", "Castellon", "Castelló"]),
    ("ES523", &["Valencia", "València"]),
    ("ES211", &["Álava", "Araba", "Alava"]),
    ("ES212", &["Gipuzkoa", "Guipúzcoa", "Guipuzcoa"]),
    ("ES213", &["Bizkaia", "Vizcaya"]),
    // Autonomous communities (NUTS-2)
    ("ES61", &["Andalucía", "Andalucia"]),
    ("ES24", &["Aragón", "Aragon"]),
    ("ES12", &["Asturias", "Principado de Asturias"]),
    ("ES53", &["Islas Baleares", "Baleares", "Illes Balears"]),
    ("ES70", &["Canarias", "Islas Canarias"]),
    ("ES13", &["Cantabria"]),
    ("ES42", &["Castilla-La Mancha", "Castilla La Mancha"]),
    ("ES41", &["Castilla y León", "Castilla Leon"]),
    ("ES51", &["Cataluña", "Catalunya", "Catalonia"]),
    ("ES43", &["Extremadura"]),
    ("ES11", &["Galicia"]),
    ("ES30", &["Comunidad de Madrid"]),
    ("ES62", &["Murcia", "Región de Murcia"]),
    ("ES22", &["Navarra", "Comunidad Foral de Navarra"]),
    ("ES21", &["País Vasco", "Euskadi", "Pais Vasco"]),
    ("ES23", &["La Rioja", "Rioja"]),
    ("ES52", &["Comunitat Valenciana", "Comunidad Valenciana"]),
    ("ES63", &["Ceuta"]),
    ("ES64", &["Melilla"]),
];

fn first_match(table: &[(&'static str, &[&str])], raw: &str) -> Option<&'static str> {
    let lower = raw.to_lowercase();
    table
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
        .map(|(label, _)| *label)
}

fn all_matches(table: &[(&'static str, &[&str])], raw: &str) -> Vec<String> {
    let lower = raw.to_lowercase();
    let mut labels: Vec<String> = table
        .iter()
        .filter(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
        .map(|(label, _)| label.to_string())
        .collect();
    labels.sort();
    labels
}

/// Rule-based normalizer for raw extracted fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldNormalizer;

impl FieldNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Infer standardized sector labels from raw keywords.
    pub fn normalize_sectors(&self, sectores_raw: Option<&str>) -> Vec<String> {
        sectores_raw
            .map(|raw| all_matches(SECTOR_KEYWORDS, raw))
            .unwrap_or_default()
    }

    /// Normalize the instrument type, preferring the LLM's own suggestion
    /// when it maps cleanly, then falling back to the raw text.
    pub fn normalize_instrument(
        &self,
        instrumentos_raw: Option<&str>,
        instrumento_llm: Option<&str>,
    ) -> Option<String> {
        if let Some(llm) = instrumento_llm {
            if let Some(label) = first_match(INSTRUMENT_MAPPINGS, llm) {
                return Some(label.to_string());
            }
        }
        if let Some(raw) = instrumentos_raw {
            if let Some(label) = first_match(INSTRUMENT_MAPPINGS, raw) {
                return Some(label.to_string());
            }
        }
        instrumento_llm.map(|s| s.to_string())
    }

    /// Normalize the concession procedure.
    pub fn normalize_procedure(
        &self,
        procedimiento_llm: Option<&str>,
        instrumentos_raw: Option<&str>,
    ) -> Option<String> {
        if let Some(llm) = procedimiento_llm {
            if let Some(label) = first_match(PROCEDURE_MAPPINGS, llm) {
                return Some(label.to_string());
            }
        }
        if let Some(raw) = instrumentos_raw {
            if let Some(label) = first_match(PROCEDURE_MAPPINGS, raw) {
                return Some(label.to_string());
            }
        }
        procedimiento_llm.map(|s| s.to_string())
    }

    /// Map raw beneficiary-type text onto the closed label set.
    pub fn normalize_beneficiary_types(&self, tipos_raw: Option<&str>) -> Vec<String> {
        tipos_raw
            .map(|raw| all_matches(BENEFICIARY_TYPE_MAPPINGS, raw))
            .unwrap_or_default()
    }

    /// Infer the most specific NUTS code from mentioned regions.
    pub fn infer_nuts_code(&self, region_mencionada: Option<&str>) -> Option<String> {
        let raw = region_mencionada?;
        let lower = raw.to_lowercase();

        let mut best: Option<&str> = None;
        for (code, names) in REGION_NUTS_MAPPINGS {
            if names.iter().any(|name| lower.contains(&name.to_lowercase())) {
                match best {
                    // Longer code = more specific region
                    Some(current) if current.len() >= code.len() => {}
                    _ => best = Some(code),
                }
            }
        }
        best.map(|s| s.to_string())
    }

    pub fn normalize_tipo_admin(&self, raw: Option<&str>) -> Option<String> {
        raw.and_then(|r| first_match(TIPO_ADMIN_MAPPINGS, r))
            .map(|s| s.to_string())
    }

    pub fn normalize_nivel_admin(&self, raw: Option<&str>) -> Option<String> {
        raw.and_then(|r| first_match(NIVEL_ADMIN_MAPPINGS, r))
            .map(|s| s.to_string())
    }

    pub fn normalize_ambito(&self, raw: Option<&str>) -> Option<String> {
        raw.and_then(|r| first_match(AMBITO_MAPPINGS, r))
            .map(|s| s.to_string())
    }

    /// Apply every rule to a field record in place.
    pub fn normalize_all(&self, fields: &mut ExtractionFields) {
        fields.sectores_inferidos = self.normalize_sectors(fields.sectores_raw.as_deref());
        fields.instrumento_normalizado = self.normalize_instrument(
            fields.instrumentos_raw.as_deref(),
            fields.instrumento_normalizado.as_deref(),
        );
        fields.procedimiento = self.normalize_procedure(
            fields.procedimiento.as_deref(),
            fields.instrumentos_raw.as_deref(),
        );
        fields.tipos_beneficiario_normalized =
            self.normalize_beneficiary_types(fields.tipos_beneficiario_raw.as_deref());
        fields.region_nuts = self.infer_nuts_code(fields.region_mencionada.as_deref());
        fields.tipo_administracion_normalizado =
            self.normalize_tipo_admin(fields.tipo_administracion_raw.as_deref());
        fields.nivel_administracion_normalizado =
            self.normalize_nivel_admin(fields.nivel_administracion_raw.as_deref());
        fields.ambito_normalizado = self.normalize_ambito(fields.ambito_raw.as_deref());
    }
}
