//! Grant persistence: upsert-by-business-key and lookups.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use super::{from_json_opt, parse_date_opt, to_json_string, to_option, Result, Store};
use crate::models::Grant;

fn row_to_grant(row: &Row) -> rusqlite::Result<Grant> {
    Ok(Grant {
        id: row.get("id")?,
        external_id: row.get("external_id")?,
        codigo: row.get("codigo")?,
        titulo: row.get("titulo")?,
        descripcion: row.get("descripcion")?,
        objeto: row.get("objeto")?,
        organismo: row.get("organismo")?,
        organismo_id: row.get("organismo_id")?,
        departamento: row.get("departamento")?,
        tipo_administracion: row.get("tipo_administracion")?,
        nivel_administracion: row.get("nivel_administracion")?,
        nivel1: row.get("nivel1")?,
        nivel2: row.get("nivel2")?,
        nivel3: row.get("nivel3")?,
        finalidad: row.get("finalidad")?,
        finalidad_descripcion: row.get("finalidad_descripcion")?,
        ambito: row.get("ambito")?,
        sectores: from_json_opt(row.get("sectores")?),
        sectores_normalizados: from_json_opt(row.get("sectores_normalizados")?),
        regiones: from_json_opt(row.get("regiones")?),
        region_nuts: from_json_opt(row.get("region_nuts")?),
        tipos_beneficiario: from_json_opt(row.get("tipos_beneficiario")?),
        beneficiarios_normalizados: from_json_opt(row.get("beneficiarios_normalizados")?),
        beneficiarios_descripcion: row.get("beneficiarios_descripcion")?,
        requisitos_beneficiarios: row.get("requisitos_beneficiarios")?,
        fecha_publicacion: parse_date_opt(row.get("fecha_publicacion")?),
        fecha_inicio_solicitud: parse_date_opt(row.get("fecha_inicio_solicitud")?),
        fecha_fin_solicitud: parse_date_opt(row.get("fecha_fin_solicitud")?),
        fecha_resolucion: parse_date_opt(row.get("fecha_resolucion")?),
        abierto: row.get::<_, i64>("abierto")? != 0,
        is_open_now: row
            .get::<_, Option<i64>>("is_open_now")?
            .map(|v| v != 0),
        importe_total: row.get("importe_total")?,
        importe_minimo: row.get("importe_minimo")?,
        importe_maximo: row.get("importe_maximo")?,
        porcentaje_financiacion: row.get("porcentaje_financiacion")?,
        forma_solicitud: row.get("forma_solicitud")?,
        lugar_presentacion: row.get("lugar_presentacion")?,
        tramite_electronico: row.get::<_, i64>("tramite_electronico")? != 0,
        url_tramite: row.get("url_tramite")?,
        documentos: from_json_opt(row.get("documentos")?),
        tiene_pdf: row.get::<_, i64>("tiene_pdf")? != 0,
        pdf_url: row.get("pdf_url")?,
        pdf_nombre: row.get("pdf_nombre")?,
        pdf_id_documento: row.get("pdf_id_documento")?,
        pdf_url_hash: row.get("pdf_url_hash")?,
        bases_reguladoras: row.get("bases_reguladoras")?,
        normativa: from_json_opt(row.get("normativa")?),
        compatibilidades: row.get("compatibilidades")?,
        contacto: row
            .get::<_, Option<String>>("contacto")?
            .and_then(|s| serde_json::from_str(&s).ok()),
        observaciones: row.get("observaciones")?,
        raw_payload: from_json_opt(row.get("raw_payload")?),
        fuente: row.get("fuente")?,
        created_at: super::parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: super::parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

fn get_by_external_id(conn: &Connection, external_id: &str) -> Result<Option<Grant>> {
    to_option(conn.query_row(
        "SELECT * FROM grants WHERE external_id = ?",
        params![external_id],
        row_to_grant,
    ))
}

impl Store {
    /// Insert or update a grant by its registry id, preserving the row id
    /// and `created_at`. A re-fetch updates but never duplicates.
    pub fn upsert_grant(&self, grant: &Grant) -> Result<Grant> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();

        let existing_id: Option<i64> = to_option(conn.query_row(
            "SELECT id FROM grants WHERE external_id = ?",
            params![grant.external_id],
            |row| row.get(0),
        ))?;

        let sectores = to_json_string(&grant.sectores)?;
        let sectores_norm = to_json_string(&grant.sectores_normalizados)?;
        let regiones = to_json_string(&grant.regiones)?;
        let region_nuts = to_json_string(&grant.region_nuts)?;
        let tipos_beneficiario = to_json_string(&grant.tipos_beneficiario)?;
        let beneficiarios_norm = to_json_string(&grant.beneficiarios_normalizados)?;
        let documentos = to_json_string(&grant.documentos)?;
        let normativa = to_json_string(&grant.normativa)?;
        let contacto = grant
            .contacto
            .as_ref()
            .map(|c| to_json_string(c))
            .transpose()?;
        let raw_payload = to_json_string(&grant.raw_payload)?;

        let values = params![
            grant.external_id,
            grant.codigo,
            grant.titulo,
            grant.descripcion,
            grant.objeto,
            grant.organismo,
            grant.organismo_id,
            grant.departamento,
            grant.tipo_administracion,
            grant.nivel_administracion,
            grant.nivel1,
            grant.nivel2,
            grant.nivel3,
            grant.finalidad,
            grant.finalidad_descripcion,
            grant.ambito,
            sectores,
            sectores_norm,
            regiones,
            region_nuts,
            tipos_beneficiario,
            beneficiarios_norm,
            grant.beneficiarios_descripcion,
            grant.requisitos_beneficiarios,
            grant.fecha_publicacion.map(|d| d.to_string()),
            grant.fecha_inicio_solicitud.map(|d| d.to_string()),
            grant.fecha_fin_solicitud.map(|d| d.to_string()),
            grant.fecha_resolucion.map(|d| d.to_string()),
            grant.abierto as i64,
            grant.is_open_now.map(|v| v as i64),
            grant.importe_total,
            grant.importe_minimo,
            grant.importe_maximo,
            grant.porcentaje_financiacion,
            grant.forma_solicitud,
            grant.lugar_presentacion,
            grant.tramite_electronico as i64,
            grant.url_tramite,
            documentos,
            grant.tiene_pdf as i64,
            grant.pdf_url,
            grant.pdf_nombre,
            grant.pdf_id_documento,
            grant.pdf_url_hash,
            grant.bases_reguladoras,
            normativa,
            grant.compatibilidades,
            contacto,
            grant.observaciones,
            raw_payload,
            grant.fuente,
            now,
        ];

        match existing_id {
            Some(id) => {
                let mut sql = String::from("UPDATE grants SET ");
                for (i, col) in GRANT_COLUMNS.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str(&format!("{col} = ?{}", i + 1));
                }
                sql.push_str(&format!(
                    ", updated_at = ?{} WHERE id = {id}",
                    GRANT_COLUMNS.len() + 1
                ));
                conn.execute(&sql, values)?;
            }
            None => {
                let cols = GRANT_COLUMNS.join(", ");
                let placeholders = (1..=GRANT_COLUMNS.len())
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "INSERT INTO grants ({cols}, created_at, updated_at) VALUES ({placeholders}, ?{n}, ?{n})",
                    n = GRANT_COLUMNS.len() + 1
                );
                conn.execute(&sql, values)?;
            }
        }

        Ok(get_by_external_id(&conn, &grant.external_id)?
            .expect("row upserted above must exist"))
    }

    pub fn get_grant(&self, id: i64) -> Result<Option<Grant>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM grants WHERE id = ?",
            params![id],
            row_to_grant,
        ))
    }

    pub fn get_grant_by_external_id(&self, external_id: &str) -> Result<Option<Grant>> {
        let conn = self.connect()?;
        get_by_external_id(&conn, external_id)
    }

    /// Delete a grant. Cascades to its extraction and embedding; the
    /// staging item keeps its business-key reference.
    pub fn delete_grant(&self, id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute("DELETE FROM grants WHERE id = ?", params![id])?;
        Ok(changed == 1)
    }
}

/// Column order shared by the grant INSERT and UPDATE statements.
const GRANT_COLUMNS: &[&str] = &[
    "external_id",
    "codigo",
    "titulo",
    "descripcion",
    "objeto",
    "organismo",
    "organismo_id",
    "departamento",
    "tipo_administracion",
    "nivel_administracion",
    "nivel1",
    "nivel2",
    "nivel3",
    "finalidad",
    "finalidad_descripcion",
    "ambito",
    "sectores",
    "sectores_normalizados",
    "regiones",
    "region_nuts",
    "tipos_beneficiario",
    "beneficiarios_normalizados",
    "beneficiarios_descripcion",
    "requisitos_beneficiarios",
    "fecha_publicacion",
    "fecha_inicio_solicitud",
    "fecha_fin_solicitud",
    "fecha_resolucion",
    "abierto",
    "is_open_now",
    "importe_total",
    "importe_minimo",
    "importe_maximo",
    "porcentaje_financiacion",
    "forma_solicitud",
    "lugar_presentacion",
    "tramite_electronico",
    "url_tramite",
    "documentos",
    "tiene_pdf",
    "pdf_url",
    "pdf_nombre",
    "pdf_id_documento",
    "pdf_url_hash",
    "bases_reguladoras",
    "normativa",
    "compatibilidades",
    "contacto",
    "observaciones",
    "raw_payload",
    "fuente",
];
