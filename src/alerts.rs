use crate::mail::OutgoingEmail;
use rusqlite::{Connection, OptionalExtension};

/// Default number of '-'/ungraded evidence rows that lands a student in the
/// pending digest.
pub const FALTAS_THRESHOLD: i64 = 5;

pub struct PendingResumen {
    pub estudiante: String,
    pub faltas: i64,
}

/// Students whose missing-submission count against *active* evidence
/// definitions meets the threshold, worst first. Inactive definitions never
/// count: an evidence nobody opened yet is not a fault.
pub fn fetch_pendientes(
    conn: &Connection,
    threshold: i64,
    limit: i64,
) -> anyhow::Result<Vec<PendingResumen>> {
    let mut stmt = conn.prepare(
        "SELECT e.documento,
                SUM(CASE WHEN e.letra = '-' OR e.letra IS NULL THEN 1 ELSE 0 END) AS faltas
         FROM evidencias e
         JOIN evidencia_definicion d ON d.nombre = e.evidencia_nombre AND d.activa
         GROUP BY e.documento
         HAVING faltas >= ?1
         ORDER BY faltas DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map((threshold, limit), |r| {
        Ok(PendingResumen {
            estudiante: r.get(0)?,
            faltas: r.get(1)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn build_pendientes_email(
    resumenes: &[PendingResumen],
    destinatarios: Vec<String>,
    threshold: i64,
) -> OutgoingEmail {
    let body = if resumenes.is_empty() {
        "No hay estudiantes con evidencias pendientes sobre el umbral actual.".to_string()
    } else {
        let mut lines = vec![
            format!("Resumen de evidencias pendientes (umbral >= {})", threshold),
            String::new(),
        ];
        for r in resumenes {
            lines.push(format!("- {}: {} faltas", r.estudiante, r.faltas));
        }
        lines.join("\n")
    };
    OutgoingEmail {
        to: destinatarios,
        subject: "Alerta de evidencias pendientes".to_string(),
        body,
    }
}

pub struct FailingRow {
    pub documento: String,
    pub nombre: String,
    pub apellido: String,
    pub correo: Option<String>,
    pub reprobadas: i64,
}

impl FailingRow {
    /// Students without a stored email get notices addressed to their
    /// document, which in the wide world is the email anyway.
    pub fn destinatario(&self) -> String {
        match self.correo.as_deref() {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => self.documento.clone(),
        }
    }
}

/// Per-student counts of failing ('D') evidence rows within a ficha,
/// optionally counting missing submissions ('-') too, worst first. Scoped to
/// an existing materia.
pub fn failing_counts(
    conn: &Connection,
    materia_id: i64,
    ficha_id: i64,
    include_pending: bool,
) -> anyhow::Result<Vec<FailingRow>> {
    let letra_filter = if include_pending {
        "e.letra IN ('D', '-')"
    } else {
        "e.letra = 'D'"
    };
    let sql = format!(
        "SELECT e.documento, s.nombre, s.apellido, s.correo, COUNT(*) AS d_count
         FROM evidencias e
         JOIN estudiantes s ON s.documento = e.documento
         WHERE {} AND s.ficha_id = ?1
           AND EXISTS (SELECT 1 FROM materias m WHERE m.id = ?2)
         GROUP BY e.documento, s.nombre, s.apellido, s.correo
         ORDER BY d_count DESC, e.documento",
        letra_filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map((ficha_id, materia_id), |r| {
        Ok(FailingRow {
            documento: r.get(0)?,
            nombre: r.get(1)?,
            apellido: r.get(2)?,
            correo: r.get(3)?,
            reprobadas: r.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Diagnostic letter tally for one ficha: (ficha_id, letra, count) rows.
pub fn diagnostic_counts(
    conn: &Connection,
    materia_id: i64,
    ficha_id: i64,
    include_pending: bool,
) -> anyhow::Result<Vec<(i64, String, i64)>> {
    let letra_filter = if include_pending {
        "e.letra IN ('D', '-')"
    } else {
        "e.letra = 'D'"
    };
    let sql = format!(
        "SELECT s.ficha_id, e.letra, COUNT(*) AS cnt
         FROM evidencias e
         JOIN estudiantes s ON s.documento = e.documento
         WHERE s.ficha_id = ?1
           AND EXISTS (SELECT 1 FROM materias m WHERE m.id = ?2)
           AND {}
         GROUP BY s.ficha_id, e.letra
         ORDER BY e.letra",
        letra_filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map((ficha_id, materia_id), |r| {
        Ok((r.get(0)?, r.get(1)?, r.get(2)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Recipient directory for escalations and digests: every active
/// coordinator/teacher profile.
pub fn active_staff_emails(conn: &Connection) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT email FROM users
         WHERE activo AND rol IN ('Coordinador', 'Docente')
         ORDER BY email",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub struct MateriaRef {
    pub id: i64,
    pub codigo: Option<String>,
    pub nombre: Option<String>,
}

pub fn materia_ref(conn: &Connection, materia_id: i64) -> anyhow::Result<MateriaRef> {
    let found = conn
        .query_row(
            "SELECT id, codigo, nombre FROM materias WHERE id = ?1",
            [materia_id],
            |r| {
                Ok(MateriaRef {
                    id: r.get(0)?,
                    codigo: r.get(1)?,
                    nombre: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(found.unwrap_or(MateriaRef {
        id: materia_id,
        codigo: None,
        nombre: None,
    }))
}

fn materia_line(materia: &MateriaRef) -> String {
    format!(
        "Materia: {} - {}",
        materia.codigo.as_deref().unwrap_or("-"),
        materia.nombre.as_deref().unwrap_or("-")
    )
}

/// Notify tier: the student alone hears about it.
pub fn build_student_notice(row: &FailingRow, ficha_id: i64, materia: &MateriaRef) -> OutgoingEmail {
    OutgoingEmail {
        to: vec![row.destinatario()],
        subject: "Alerta de rendimiento: evidencias reprobadas".to_string(),
        body: format!(
            "Hola {}, acumulas {} evidencias reprobadas en la ficha {}.\n{}\nPor favor contacta a tu docente para apoyo.",
            row.nombre,
            row.reprobadas,
            ficha_id,
            materia_line(materia)
        ),
    }
}

/// Escalation tier: the student plus every active coordinator/teacher.
pub fn build_escalation_notice(
    row: &FailingRow,
    ficha_id: i64,
    materia: &MateriaRef,
    staff: &[String],
) -> OutgoingEmail {
    let mut to = vec![row.destinatario()];
    to.extend(staff.iter().cloned());
    OutgoingEmail {
        to,
        subject: "[CRÍTICO] Reprobaciones acumuladas".to_string(),
        body: format!(
            "Estudiante {} {} acumula {} evidencias reprobadas en la ficha {}.\n{}\nSe requiere intervención.",
            row.nombre,
            row.apellido,
            row.reprobadas,
            ficha_id,
            materia_line(materia)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_says_so() {
        let email = build_pendientes_email(&[], vec!["c@x.edu".to_string()], 5);
        assert_eq!(email.subject, "Alerta de evidencias pendientes");
        assert!(email.body.contains("No hay estudiantes"));
    }

    #[test]
    fn digest_lists_students_with_their_counts() {
        let resumenes = vec![
            PendingResumen {
                estudiante: "ana@x.edu".to_string(),
                faltas: 7,
            },
            PendingResumen {
                estudiante: "beto@x.edu".to_string(),
                faltas: 5,
            },
        ];
        let email = build_pendientes_email(&resumenes, vec![], 5);
        assert!(email.body.starts_with("Resumen de evidencias pendientes (umbral >= 5)"));
        assert!(email.body.contains("- ana@x.edu: 7 faltas"));
        assert!(email.body.contains("- beto@x.edu: 5 faltas"));
    }

    #[test]
    fn escalation_reaches_student_and_staff() {
        let row = FailingRow {
            documento: "ana@x.edu".to_string(),
            nombre: "Ana".to_string(),
            apellido: "Pérez".to_string(),
            correo: None,
            reprobadas: 6,
        };
        let materia = MateriaRef {
            id: 3,
            codigo: Some("MAT-101".to_string()),
            nombre: Some("Matemáticas".to_string()),
        };
        let staff = vec!["coord@x.edu".to_string()];
        let email = build_escalation_notice(&row, 12, &materia, &staff);
        assert_eq!(email.to, vec!["ana@x.edu", "coord@x.edu"]);
        assert_eq!(email.subject, "[CRÍTICO] Reprobaciones acumuladas");
        assert!(email.body.contains("Ana Pérez acumula 6 evidencias reprobadas en la ficha 12."));
        assert!(email.body.contains("Materia: MAT-101 - Matemáticas"));
        assert!(email.body.contains("Se requiere intervención."));
    }

    #[test]
    fn student_notice_goes_to_the_student_only() {
        let row = FailingRow {
            documento: "123".to_string(),
            nombre: "Beto".to_string(),
            apellido: "Ruiz".to_string(),
            correo: Some("beto@x.edu".to_string()),
            reprobadas: 3,
        };
        let materia = MateriaRef {
            id: 3,
            codigo: None,
            nombre: None,
        };
        let email = build_student_notice(&row, 8, &materia);
        assert_eq!(email.to, vec!["beto@x.edu"]);
        assert!(email.body.starts_with("Hola Beto, acumulas 3 evidencias reprobadas"));
        assert!(email.body.contains("Materia: - - -"));
    }
}
