use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;

/// Per-batch letter tally reported by every ingestion path and stamped into
/// the audit metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counts {
    pub a: i64,
    pub d: i64,
    pub dash: i64,
    pub pendiente: i64,
    pub tot: i64,
}

impl Counts {
    pub fn bump(&mut self, letra: Option<&str>) {
        match letra {
            Some("A") => self.a += 1,
            Some("D") => self.d += 1,
            Some("-") => self.dash += 1,
            _ => self.pendiente += 1,
        }
        self.tot += 1;
    }

    pub fn to_json(&self) -> Value {
        json!({
            "A": self.a,
            "D": self.d,
            "-": self.dash,
            "Pendiente": self.pendiente,
            "tot_registros": self.tot,
        })
    }
}

/// Char-based truncation; identity fields share a 255 limit with the
/// original store.
pub fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Insert-if-absent provisioning for the wide path: existing students keep
/// their name/email, only missing ones are created.
pub fn ensure_student_basic(
    conn: &Connection,
    documento: &str,
    nombre: &str,
    apellido: &str,
    correo: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO estudiantes(documento, nombre, apellido, correo)
         VALUES(?1, ?2, ?3, ?4)
         ON CONFLICT(documento) DO NOTHING",
        (
            truncate(documento, 255),
            truncate(nombre, 255),
            truncate(apellido, 255),
            truncate(correo, 255),
        ),
    )?;
    Ok(())
}

/// Upsert provisioning for the narrow and single-column paths: the incoming
/// name wins, the email only fills in when provided.
pub fn ensure_student_refresh(
    conn: &Connection,
    documento: &str,
    nombre: &str,
    correo: Option<&str>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO estudiantes(documento, nombre, correo)
         VALUES(?1, ?2, ?3)
         ON CONFLICT(documento) DO UPDATE SET
           nombre = excluded.nombre,
           correo = COALESCE(excluded.correo, estudiantes.correo),
           updated_at = CURRENT_TIMESTAMP",
        (
            truncate(documento, 255),
            truncate(nombre, 255),
            correo.map(|c| truncate(c, 255)),
        ),
    )?;
    Ok(())
}

/// Cohort assignment is set-once: a student already in a ficha never moves.
pub fn assign_ficha_if_unset(conn: &Connection, documento: &str, ficha_id: i64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE estudiantes SET ficha_id = ?1
         WHERE documento = ?2 AND (ficha_id IS NULL OR ficha_id = 0)",
        (ficha_id, documento),
    )?;
    Ok(())
}

/// Identity re-key for the wide path, where documents are emails and emails
/// change. If exactly one existing student carries this name+surname, the
/// old document differs from the new one, and the new document is free, the
/// student and their evidence rows migrate to the new document. Any
/// ambiguity means no action.
pub fn rekey_student_by_name(
    conn: &Connection,
    nombre: &str,
    apellido: &str,
    new_doc: &str,
) -> anyhow::Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT documento FROM estudiantes
         WHERE LOWER(nombre) = LOWER(?1) AND LOWER(apellido) = LOWER(?2)
         LIMIT 2",
    )?;
    let matches: Vec<String> = stmt
        .query_map((nombre, apellido), |r| r.get(0))?
        .collect::<Result<_, _>>()?;
    if matches.len() != 1 {
        return Ok(None);
    }
    let old_doc = &matches[0];
    if old_doc == new_doc {
        return Ok(None);
    }
    let new_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM estudiantes WHERE documento = ?1",
            [new_doc],
            |r| r.get(0),
        )
        .optional()?;
    if new_exists.is_some() {
        return Ok(None);
    }

    conn.execute(
        "UPDATE evidencias SET documento = ?1, updated_at = CURRENT_TIMESTAMP
         WHERE documento = ?2",
        (new_doc, old_doc),
    )?;
    conn.execute(
        "UPDATE estudiantes SET documento = ?1, correo = ?1, updated_at = CURRENT_TIMESTAMP
         WHERE documento = ?2",
        (new_doc, old_doc),
    )?;
    Ok(Some(old_doc.clone()))
}

/// Passive evidence-definition provisioning for one (materia, batch): new
/// definitions are created inactive, appended after the materia's existing
/// display order, and never updated once present.
pub struct DefinitionEnsurer {
    materia_id: i64,
    ficha_id: Option<i64>,
    docente_id: Option<i64>,
    next_orden: i64,
    seen: HashSet<String>,
}

impl DefinitionEnsurer {
    pub fn new(
        conn: &Connection,
        materia_id: i64,
        ficha_id: Option<i64>,
        docente_id: Option<i64>,
    ) -> anyhow::Result<Self> {
        let next_orden: i64 = conn.query_row(
            "SELECT COUNT(*) FROM evidencia_definicion WHERE materia_id = ?1",
            [materia_id],
            |r| r.get(0),
        )?;
        Ok(DefinitionEnsurer {
            materia_id,
            ficha_id,
            docente_id,
            next_orden,
            seen: HashSet::new(),
        })
    }

    pub fn ensure(&mut self, conn: &Connection, nombre: &str) -> anyhow::Result<()> {
        if self.seen.contains(nombre) {
            return Ok(());
        }
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM evidencia_definicion WHERE materia_id = ?1 AND nombre = ?2",
                (self.materia_id, nombre),
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_none() {
            conn.execute(
                "INSERT INTO evidencia_definicion(nombre, ficha_id, materia_id, docente_id, activa, orden)
                 VALUES(?1, ?2, ?3, ?4, 0, ?5)
                 ON CONFLICT(materia_id, nombre) DO NOTHING",
                (
                    nombre,
                    self.ficha_id,
                    self.materia_id,
                    self.docente_id,
                    self.next_orden,
                ),
            )?;
            self.next_orden += 1;
        }
        self.seen.insert(nombre.to_string());
        Ok(())
    }
}

/// Narrow-form evidence upsert. Returns true when the row was inserted,
/// false when an existing row was updated; the signal comes from the
/// statement itself (inserts leave updated_at NULL, updates set it).
pub fn upsert_evidencia(
    conn: &Connection,
    documento: &str,
    evidencia_nombre: &str,
    letra: Option<&str>,
    estado: &str,
) -> anyhow::Result<bool> {
    let inserted: bool = conn.query_row(
        "INSERT INTO evidencias(documento, evidencia_nombre, letra, estado)
         VALUES(?1, ?2, ?3, ?4)
         ON CONFLICT(documento, evidencia_nombre) DO UPDATE SET
           letra = excluded.letra,
           estado = excluded.estado,
           updated_at = CURRENT_TIMESTAMP
         RETURNING (updated_at IS NULL)",
        (
            truncate(documento, 255),
            truncate(evidencia_nombre, 255),
            letra,
            estado,
        ),
        |r| r.get(0),
    )?;
    Ok(inserted)
}

pub struct CalRow<'a> {
    pub materia_id: i64,
    pub ficha_id: Option<i64>,
    pub estudiante_nombre: &'a str,
    pub estudiante_documento: &'a str,
    /// "" means a subject-level record with no specific evidence.
    pub evidencia_nombre: &'a str,
    pub trimestre: i64,
    pub nota: Option<f64>,
    pub letra: Option<&'a str>,
    pub estado: &'a str,
    pub observaciones: Option<&'a str>,
    pub fecha_carga: &'a str,
    pub cargado_por: Option<i64>,
}

/// Detailed-form upsert on the natural key
/// (materia, documento, evidencia, trimestre). Same inserted/updated signal
/// as [`upsert_evidencia`].
pub fn upsert_calificacion(conn: &Connection, row: &CalRow) -> anyhow::Result<bool> {
    let inserted: bool = conn.query_row(
        "INSERT INTO calificaciones(
           materia_id, ficha_id, estudiante_nombre, estudiante_documento,
           evidencia_nombre, trimestre, nota, letra, estado, observaciones,
           fecha_carga, cargado_por)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(materia_id, estudiante_documento, evidencia_nombre, trimestre)
         DO UPDATE SET
           ficha_id = excluded.ficha_id,
           estudiante_nombre = excluded.estudiante_nombre,
           nota = excluded.nota,
           letra = excluded.letra,
           estado = excluded.estado,
           observaciones = excluded.observaciones,
           cargado_por = excluded.cargado_por,
           fecha_carga = excluded.fecha_carga,
           updated_at = CURRENT_TIMESTAMP
         RETURNING (updated_at IS NULL)",
        (
            row.materia_id,
            row.ficha_id,
            row.estudiante_nombre,
            row.estudiante_documento,
            row.evidencia_nombre,
            row.trimestre,
            row.nota,
            row.letra,
            row.estado,
            row.observaciones,
            row.fecha_carga,
            row.cargado_por,
        ),
        |r| r.get(0),
    )?;
    Ok(inserted)
}

/// Wide-batch precondition: students already assigned to a different ficha.
/// Any hit aborts the batch before a single row is touched.
pub fn ficha_conflicts(
    conn: &Connection,
    documentos: &[String],
    ficha_id: i64,
) -> anyhow::Result<Vec<(String, i64)>> {
    if documentos.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = std::iter::repeat("?")
        .take(documentos.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT documento, ficha_id FROM estudiantes
         WHERE documento IN ({}) AND ficha_id IS NOT NULL AND ficha_id <> 0 AND ficha_id <> ?",
        placeholders
    );
    let mut bind: Vec<SqlValue> = documentos
        .iter()
        .map(|d| SqlValue::Text(d.clone()))
        .collect();
    bind.push(SqlValue::Integer(ficha_id));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(bind), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
