use crate::audit::{self, Actor, Event};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{self, Counts, DefinitionEnsurer};
use crate::resolve;
use crate::sheet::{normalize_header, Table};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

/// One grade cell flattened out of the wide sheet. `letra: None` covers both
/// blank and unrecognized cells; both persist as Pendiente.
struct Registro {
    documento: String,
    nombre: String,
    apellido: String,
    correo: String,
    evidencia: String,
    letra: Option<&'static str>,
    estado: &'static str,
}

fn derive_estado(letra: Option<&str>) -> &'static str {
    match letra {
        Some("A") => "Aprobado",
        Some("D") => "Reprobado",
        Some("-") => "No entregó",
        _ => "Pendiente",
    }
}

fn handle_upload_wide(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let Some(table_param) = req.params.get("table") else {
        return err(&req.id, "bad_params", "missing params.table", None);
    };
    let table = match Table::from_params(table_param) {
        Ok(t) => t,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if table.is_empty() {
        return err(&req.id, "structural_error", "Archivo vacío", None);
    }
    let dry_run = req
        .params
        .get("dryRun")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let filename = req
        .params
        .get("filename")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let normalized: Vec<String> = table.columns.iter().map(|c| normalize_header(c)).collect();
    let ident = resolve::map_identity_columns(&table, &normalized);

    let mut core_missing: Vec<&str> = Vec::new();
    if ident.correo.is_none() {
        core_missing.push("correo");
    }
    if ident.nombre.is_none() {
        core_missing.push("nombre");
    }
    let (Some(correo_col), Some(nombre_col)) = (ident.correo, ident.nombre) else {
        return err(
            &req.id,
            "structural_error",
            format!(
                "Columnas identificadoras faltantes (requiere correo y nombre): {}. Columnas disponibles normalizadas: {}",
                core_missing.join(", "),
                normalized.join(", ")
            ),
            None,
        );
    };

    let evid_cols = resolve::evidencia_columns(&normalized);
    if evid_cols.is_empty() {
        return err(
            &req.id,
            "structural_error",
            format!(
                "No se encontraron columnas de evidencias '(Letra)'. Columnas vistas: {}",
                normalized.join(", ")
            ),
            None,
        );
    }

    // Emails are the forced identifier; any cedula column is ignored.
    let column_mapping = json!({
        "documento": normalized[correo_col],
        "nombre": normalized[nombre_col],
        "apellido": ident.apellido.map(|i| normalized[i].clone()),
        "correo": normalized[correo_col],
    });

    let mut registros: Vec<Registro> = Vec::new();
    let mut preview: Vec<serde_json::Value> = Vec::new();
    let mut errores: Vec<String> = Vec::new();
    let mut counts = Counts::default();

    for i in 0..table.rows.len() {
        let fila = i + 2;
        let correo = table.cell(i, correo_col);
        let nombre = table.cell(i, nombre_col);
        let apellido = ident
            .apellido
            .map(|c| table.cell(i, c))
            .unwrap_or_default();
        let documento = correo.clone();
        if documento.is_empty() {
            errores.push(format!("Fila {fila}: documento vacío"));
            continue;
        }
        if preview.len() < 5 {
            preview.push(json!({
                "documento": documento,
                "nombre": nombre,
                "apellido": apellido,
                "correo": correo,
            }));
        }
        for (col, evid_name) in &evid_cols {
            let raw = table.cell(i, *col).to_uppercase();
            let letra = match raw.as_str() {
                "A" => Some("A"),
                "D" => Some("D"),
                "-" => Some("-"),
                "" => None,
                _ => {
                    errores.push(format!(
                        "Fila {fila} Col '{}': valor inválido '{raw}' (permitido A,D,-, vacío)",
                        normalized[*col]
                    ));
                    None
                }
            };
            counts.bump(letra);
            registros.push(Registro {
                documento: documento.clone(),
                nombre: nombre.clone(),
                apellido: apellido.clone(),
                correo: correo.clone(),
                evidencia: evid_name.clone(),
                letra,
                estado: derive_estado(letra),
            });
        }
    }

    // The target ficha must exist already; uploads never create one.
    let ficha_numero = match req
        .params
        .get("fichaNumero")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
    {
        Some(v) if !v.is_empty() => v,
        _ => {
            return err(
                &req.id,
                "structural_error",
                "Debe ingresar el número de ficha antes de cargar el archivo",
                None,
            )
        }
    };
    let ficha = conn
        .query_row(
            "SELECT id, numero, nombre, estado FROM fichas WHERE LOWER(numero) = LOWER(?1) LIMIT 1",
            [&ficha_numero],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional();
    let (ficha_id, ficha_numero_db, ficha_nombre, ficha_estado) = match ficha {
        Ok(Some(f)) => f,
        Ok(None) => {
            return err(
                &req.id,
                "structural_error",
                format!("La ficha '{ficha_numero}' no existe en la base de datos"),
                Some(json!({ "fichaNumero": ficha_numero })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut invalid_docs: BTreeSet<String> = BTreeSet::new();
    for r in &registros {
        if r.documento.chars().count() > 255 {
            invalid_docs.insert(r.documento.clone());
        }
    }
    if !invalid_docs.is_empty() {
        errores.push(format!(
            "Documentos inválidos detectados: {}",
            invalid_docs.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
        registros.retain(|r| r.documento.chars().count() <= 255);
    }

    if dry_run {
        return ok(
            &req.id,
            json!({
                "success": errores.is_empty(),
                "dryRun": true,
                "total": counts.tot,
                "detalle": counts.to_json(),
                "errores": errores.iter().take(50).collect::<Vec<_>>(),
                "columnMapping": column_mapping,
                "evidenciaCols": evid_cols.iter().map(|(i, _)| normalized[*i].clone()).collect::<Vec<_>>(),
                "identityPreview": preview,
                "cedulaIgnorada": true,
                "ficha": {
                    "id": ficha_id,
                    "numero": ficha_numero_db,
                    "nombre": ficha_nombre,
                    "estado": ficha_estado,
                },
                "fichaNumero": ficha_numero,
                "fichaIdResuelto": ficha_id,
            }),
        );
    }

    let materia_id = req
        .params
        .get("materiaId")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let docente_id = req
        .params
        .get("docenteId")
        .and_then(|v| v.as_i64())
        .filter(|&d| d > 0);
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
    if materia_id > 0 && !materia_valid {
        errores.push(format!(
            "Materia especificada (id={materia_id}) no existe; se omite la creación de definiciones de evidencias"
        ));
    }

    let actor = Actor::from_params(&req.params);
    let batch_id = Uuid::new_v4().to_string();
    let (mut inserted, mut updated) = (0i64, 0i64);

    if !registros.is_empty() {
        let documentos: Vec<String> = registros
            .iter()
            .map(|r| r.documento.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        match reconcile::ficha_conflicts(conn, &documentos, ficha_id) {
            Ok(conflicts) if !conflicts.is_empty() => {
                let detalles: Vec<String> = conflicts
                    .iter()
                    .map(|(doc, fid)| format!("{doc} (ficha_id={fid})"))
                    .collect();
                return err(
                    &req.id,
                    "structural_error",
                    format!(
                        "Conflictos de ficha: algunos estudiantes ya pertenecen a otra ficha. Registros: {}",
                        detalles.join(", ")
                    ),
                    Some(json!({ "conflictos": detalles })),
                );
            }
            Ok(_) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }

        let mut tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        let mut ensurer = if materia_valid {
            match DefinitionEnsurer::new(&tx, materia_id, Some(ficha_id), docente_id) {
                Ok(e) => Some(e),
                Err(e) => {
                    let _ = tx.rollback();
                    return err(
                        &req.id,
                        "batch_failed",
                        format!("Error guardando registros (stage=evidencia_def_base): {e}"),
                        None,
                    );
                }
            }
        } else {
            None
        };

        for r in &registros {
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
            if let Some(ens) = ensurer.as_mut() {
                if let Err(e) = ens.ensure(&sp, &r.evidencia) {
                    errores.push(format!(
                        "Advertencia al asegurar definición '{}': {e}",
                        r.evidencia
                    ));
                    continue;
                }
            }
            if let Err(e) =
                reconcile::rekey_student_by_name(&sp, &r.nombre, &r.apellido, &r.documento)
            {
                errores.push(format!(
                    "Advertencia heurística de correo para '{}': {e}",
                    r.documento
                ));
                continue;
            }
            if let Err(e) = reconcile::ensure_student_basic(
                &sp,
                &r.documento,
                &r.nombre,
                &r.apellido,
                &r.correo,
            ) {
                errores.push(format!(
                    "Fallo al insertar estudiante documento={}: {e}",
                    r.documento
                ));
                continue;
            }
            if let Err(e) = reconcile::assign_ficha_if_unset(&sp, &r.documento, ficha_id) {
                log::warn!("asignación de ficha fallida para {}: {}", r.documento, e);
            }
            match reconcile::upsert_evidencia(&sp, &r.documento, &r.evidencia, r.letra, r.estado) {
                Ok(was_insert) => {
                    if let Err(e) = sp.commit() {
                        errores.push(format!(
                            "Fallo al guardar evidencia '{}' para {}: {e}",
                            r.evidencia, r.documento
                        ));
                        continue;
                    }
                    if was_insert {
                        inserted += 1;
                    } else {
                        updated += 1;
                    }
                }
                Err(e) => {
                    errores.push(format!(
                        "Fallo al guardar evidencia '{}' para {}: {e}",
                        r.evidencia, r.documento
                    ));
                }
            }
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_commit_failed", e.to_string(), None);
        }

        audit::record_event(
            conn,
            &actor,
            Event {
                accion: "upload",
                modulo: "evidencias",
                entidad_tipo: Some("ficha"),
                entidad_id: Some(ficha_id.to_string()),
                detalles: Some(json!(format!(
                    "Carga de evidencias wide. Registros: {}",
                    registros.len()
                ))),
                metadata: Some(json!({
                    "ficha_numero": ficha_numero,
                    "ficha_id": ficha_id,
                    "materia_id": materia_id,
                    "docente_id": docente_id,
                    "counts": counts.to_json(),
                    "modo": "wide",
                    "batch_id": batch_id,
                    "filename": filename,
                })),
            },
        );
        log::info!(
            "upload evidencias wide: ficha={} registros={} inserted={} updated={}",
            ficha_numero,
            registros.len(),
            inserted,
            updated
        );
    }

    ok(
        &req.id,
        json!({
            "success": errores.is_empty(),
            "insertados": inserted + updated,
            "detalle": { "inserted": inserted, "updated": updated },
            "errores": errores.iter().take(50).collect::<Vec<_>>(),
            "counts": counts.to_json(),
            "fichaId": ficha_id,
            "fichaNumero": ficha_numero,
            "batchId": batch_id,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evidencias.uploadWide" => Some(handle_upload_wide(state, req)),
        _ => None,
    }
}
