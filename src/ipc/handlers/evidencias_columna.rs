use crate::audit::{self, Actor, Event};
use crate::grades;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{self, CalRow, Counts, DefinitionEnsurer};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// One row of the single-column payload after synonym folding.
struct Fila {
    documento: String,
    nombre: String,
    correo: String,
    letra: Option<&'static str>,
    estado: &'static str,
}

fn field(row: &serde_json::Value, key: &str) -> String {
    row.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn estado_for(letra: Option<&str>) -> &'static str {
    match letra {
        Some("A") => "Aprobado",
        Some("D") => "Reprobado",
        Some("-") => "No entregó",
        _ => "Pendiente",
    }
}

fn handle_upload_columna(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let evidencia_nombre = req
        .params
        .get("evidenciaNombre")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if evidencia_nombre.is_empty() {
        return err(&req.id, "bad_params", "evidencia_nombre requerido", None);
    }
    let rows = match req.params.get("rows").and_then(|v| v.as_array()) {
        Some(r) if !r.is_empty() => r,
        _ => return err(&req.id, "bad_params", "rows vacío", None),
    };
    let materia_id = req
        .params
        .get("materiaId")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let ficha_id_param = req
        .params
        .get("fichaId")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let mut errores: Vec<String> = Vec::new();

    // Missing fichas degrade to an unassigned upload instead of rejecting.
    let mut resolved_ficha_id: Option<i64> = None;
    if ficha_id_param > 0 {
        match conn
            .query_row(
                "SELECT id FROM fichas WHERE id = ?1",
                [ficha_id_param],
                |r| r.get::<_, i64>(0),
            )
            .optional()
        {
            Ok(Some(id)) => resolved_ficha_id = Some(id),
            Ok(None) => errores.push(format!(
                "Ficha id={ficha_id_param} no existe; se continúa sin asignar ficha"
            )),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    let materia_valid = if materia_id > 0 {
        match conn
            .query_row("SELECT 1 FROM materias WHERE id = ?1", [materia_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
        {
            Ok(found) => found.is_some(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    } else {
        false
    };

    let mut filas: Vec<Fila> = Vec::new();
    let mut counts = Counts::default();
    for r in rows {
        let documento_raw = field(r, "documento");
        let correo = field(r, "correo");
        let estudiante = field(r, "estudiante");
        let valor = field(r, "valor");
        let documento = if documento_raw.is_empty() {
            correo.clone()
        } else {
            documento_raw
        };
        if documento.is_empty() {
            errores.push("Documento vacío en fila".to_string());
            continue;
        }
        let letra = match grades::fold_valor(&valor) {
            Some("") => None,
            Some(l) => Some(l),
            None => {
                errores.push(format!("Valor inválido '{valor}' para {documento}"));
                None
            }
        };
        counts.bump(letra);
        let nombre = if estudiante.is_empty() {
            correo.clone()
        } else {
            estudiante
        };
        filas.push(Fila {
            documento,
            nombre,
            correo,
            letra,
            estado: estado_for(letra),
        });
    }

    let actor = Actor::from_params(&req.params);
    let batch_id = Uuid::new_v4().to_string();
    let fecha = chrono::Local::now().date_naive().to_string();
    let mut inserted = 0i64;
    let (mut detalle_inserted, mut detalle_updated) = (0i64, 0i64);

    if !filas.is_empty() {
        let mut tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        if materia_valid {
            let ensured = DefinitionEnsurer::new(&tx, materia_id, resolved_ficha_id, None)
                .and_then(|mut ens| ens.ensure(&tx, &evidencia_nombre));
            if let Err(e) = ensured {
                log::warn!(
                    "definición '{}' no asegurada para materia {}: {}",
                    evidencia_nombre,
                    materia_id,
                    e
                );
            }
        }
        for f in &filas {
            let sp_result = tx.savepoint();
            if sp_result.is_err() {
                let e = sp_result.err().unwrap();
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "batch_failed",
                    format!("Error guardando registros (stage=savepoint): {e}"),
                    None,
                );
            }
            let sp = sp_result.unwrap();
            let correo_opt = (!f.correo.is_empty()).then_some(f.correo.as_str());
            let result = (|| -> anyhow::Result<Option<bool>> {
                reconcile::ensure_student_refresh(&sp, &f.documento, &f.nombre, correo_opt)?;
                if let Some(fid) = resolved_ficha_id {
                    reconcile::assign_ficha_if_unset(&sp, &f.documento, fid)?;
                }
                reconcile::upsert_evidencia(&sp, &f.documento, &evidencia_nombre, f.letra, f.estado)?;
                if materia_valid {
                    let row = CalRow {
                        materia_id,
                        ficha_id: resolved_ficha_id,
                        estudiante_nombre: &f.nombre,
                        estudiante_documento: &f.documento,
                        evidencia_nombre: &evidencia_nombre,
                        trimestre: 1,
                        nota: None,
                        letra: f.letra,
                        estado: f.estado,
                        observaciones: None,
                        fecha_carga: &fecha,
                        cargado_por: actor.id,
                    };
                    let was_insert = reconcile::upsert_calificacion(&sp, &row)?;
                    return Ok(Some(was_insert));
                }
                Ok(None)
            })();
            match result {
                Ok(detalle) => {
                    if let Err(e) = sp.commit() {
                        errores.push(format!("Error guardando {}: {e}", f.documento));
                        continue;
                    }
                    inserted += 1;
                    match detalle {
                        Some(true) => detalle_inserted += 1,
                        Some(false) => detalle_updated += 1,
                        None => {}
                    }
                }
                Err(e) => errores.push(format!("Error guardando {}: {e}", f.documento)),
            }
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_commit_failed", e.to_string(), None);
        }
    }

    let ficha_numero: Option<String> = resolved_ficha_id.and_then(|id| {
        conn.query_row("SELECT numero FROM fichas WHERE id = ?1", [id], |r| {
            r.get(0)
        })
        .optional()
        .ok()
        .flatten()
    });
    audit::record_event(
        conn,
        &actor,
        Event {
            accion: "upload",
            modulo: "evidencias",
            entidad_tipo: Some("ficha"),
            entidad_id: resolved_ficha_id.map(|id| id.to_string()),
            detalles: Some(json!(format!(
                "Carga por columna '{evidencia_nombre}'. Registros: {}",
                counts.tot
            ))),
            metadata: Some(json!({
                "modo": "single-column",
                "evidencia_nombre": evidencia_nombre,
                "ficha_numero": ficha_numero,
                "ficha_id": resolved_ficha_id,
                "materia_id": materia_valid.then_some(materia_id),
                "counts": counts.to_json(),
                "insertados": inserted,
                "batch_id": batch_id,
            })),
        },
    );
    log::info!(
        "upload columna: evidencia={} registros={} insertados={}",
        evidencia_nombre,
        counts.tot,
        inserted
    );

    ok(
        &req.id,
        json!({
            "success": errores.is_empty(),
            "insertados": inserted,
            "detalle": { "inserted": detalle_inserted, "updated": detalle_updated },
            "errores": errores.iter().take(50).collect::<Vec<_>>(),
            "counts": counts.to_json(),
            "batchId": batch_id,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evidencias.uploadColumna" => Some(handle_upload_columna(state, req)),
        _ => None,
    }
}
