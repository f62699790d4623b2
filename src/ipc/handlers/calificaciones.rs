use crate::audit::{self, Actor, Event};
use crate::grades::{self, GradePolicy};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{self, CalRow, Counts};
use crate::resolve::{self, RefMaps};
use crate::sheet::{cell_str, Table};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const REQUIRED_CORE: &[&str] = &["estudiante_nombre", "estudiante_documento", "trimestre"];
const ID_VARIANTS: &[&str] = &["materia_id", "materia_codigo"];
const FICHA_VARIANTS: &[&str] = &["ficha_id", "ficha_numero"];
const OPTIONAL_COLUMNS: &[&str] = &["estado", "observaciones"];

const ESTADOS: &[&str] = &["Aprobado", "Reprobado", "Cursando"];

/// Header lookup over the detailed-form sheet. Headers match
/// case-insensitively; the grade may arrive under `nota` or, in older
/// files, `letra` (consulted only when `nota` is absent).
struct Narrow<'a> {
    table: &'a Table,
    cols: HashMap<String, usize>,
}

impl<'a> Narrow<'a> {
    fn new(table: &'a Table) -> Self {
        let mut cols = HashMap::new();
        for (i, c) in table.columns.iter().enumerate() {
            cols.entry(c.trim().to_lowercase()).or_insert(i);
        }
        Narrow { table, cols }
    }

    fn has(&self, key: &str) -> bool {
        self.cols.contains_key(key)
    }

    fn cell(&self, row: usize, key: &str) -> String {
        self.cols
            .get(key)
            .map(|&i| self.table.cell(row, i))
            .unwrap_or_default()
    }

    fn nota_raw(&self, row: usize) -> String {
        if self.has("nota") {
            self.cell(row, "nota")
        } else {
            self.cell(row, "letra")
        }
    }

    fn validate_columns(&self) -> (Vec<String>, Vec<String>) {
        let mut missing: Vec<String> = REQUIRED_CORE
            .iter()
            .filter(|c| !self.has(c))
            .map(|c| c.to_string())
            .collect();
        if !self.has("nota") && !self.has("letra") {
            missing.push("(nota|letra)".to_string());
        }
        if !ID_VARIANTS.iter().any(|v| self.has(v)) {
            missing.push("(materia_id|materia_codigo)".to_string());
        }
        if !FICHA_VARIANTS.iter().any(|v| self.has(v)) {
            missing.push("(ficha_id|ficha_numero)".to_string());
        }
        let allowed: HashSet<&str> = REQUIRED_CORE
            .iter()
            .chain(ID_VARIANTS)
            .chain(FICHA_VARIANTS)
            .chain(OPTIONAL_COLUMNS)
            .copied()
            .chain(["nota", "letra"])
            .collect();
        let unexpected: Vec<String> = self
            .table
            .columns
            .iter()
            .filter(|c| !allowed.contains(c.trim().to_lowercase().as_str()))
            .cloned()
            .collect();
        (missing, unexpected)
    }
}

fn derive_letra(nota: Option<f64>, stored: Option<&str>, policy: &GradePolicy) -> Option<String> {
    if let Some(l) = stored {
        if !l.trim().is_empty() {
            return Some(l.to_string());
        }
    }
    nota.map(|n| {
        if n >= policy.nota_min_aprobacion {
            "A".to_string()
        } else {
            "F".to_string()
        }
    })
}

/// Estado written for one row: the token's own status wins; a blank token
/// falls back to the sheet's estado column (or Cursando); an unrecognized
/// token is parked as Pendiente.
fn resolve_estado(g: &grades::NormalizedGrade, estado_cell: &str) -> String {
    match g.estado {
        Some(e) => e.as_str().to_string(),
        None if g.reconocido => {
            if estado_cell.is_empty() {
                "Cursando".to_string()
            } else {
                estado_cell.to_string()
            }
        }
        None => "Pendiente".to_string(),
    }
}

fn tally_letter(estado: &str) -> Option<&'static str> {
    match estado {
        "Aprobado" => Some("A"),
        "Reprobado" => Some("D"),
        "No entregó" => Some("-"),
        _ => None,
    }
}

fn persist_row(conn: &Connection, row: &CalRow) -> anyhow::Result<bool> {
    reconcile::ensure_student_refresh(conn, row.estudiante_documento, row.estudiante_nombre, None)?;
    reconcile::upsert_calificacion(conn, row)
}

fn handle_upload(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        return err(&req.id, "structural_error", "El archivo está vacío", None);
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

    let sheet = Narrow::new(&table);
    let (missing, unexpected) = sheet.validate_columns();
    if !missing.is_empty() {
        return err(
            &req.id,
            "structural_error",
            format!("Columnas faltantes: {}", missing.join(", ")),
            Some(json!({ "missing": missing, "unexpectedColumns": unexpected })),
        );
    }

    let policy = match setup::grading_policy(conn) {
        Ok(p) => p,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Malformed data rejects the whole batch; warnings ride along.
    let mut validation_errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    for i in 0..table.rows.len() {
        let fila = i + 2;
        match sheet.cell(i, "trimestre").parse::<i64>() {
            Ok(t) if (1..=4).contains(&t) => {}
            _ => validation_errors.push(format!("Fila {fila}: trimestre fuera de rango (1-4)")),
        }
        if sheet.cell(i, "estudiante_nombre").is_empty() {
            validation_errors.push(format!("Fila {fila}: estudiante_nombre vacío"));
        }
        if sheet.cell(i, "estudiante_documento").is_empty() {
            validation_errors.push(format!("Fila {fila}: estudiante_documento vacío"));
        }
        let raw = sheet.nota_raw(i);
        if raw.is_empty() {
            continue;
        }
        let g = grades::normalize(&raw, &policy);
        if g.letra.is_none() {
            if let Some(n) = g.nota {
                if !(0.0..=5.0).contains(&n) {
                    validation_errors.push(format!("Fila {fila}: nota fuera de rango (0-5)"));
                }
            }
        }
        if !g.reconocido {
            warnings.push(format!(
                "Fila {fila}: nota no reconocida '{raw}' (se guarda Pendiente)"
            ));
        }
    }
    if !validation_errors.is_empty() {
        if dry_run {
            return ok(
                &req.id,
                json!({
                    "success": false,
                    "dryRun": true,
                    "errors": validation_errors.iter().take(50).collect::<Vec<_>>(),
                    "unexpectedColumns": unexpected,
                }),
            );
        }
        let shown: Vec<&String> = validation_errors.iter().take(25).collect();
        return err(
            &req.id,
            "validation_failed",
            shown
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("; "),
            Some(json!({ "errors": shown })),
        );
    }

    let maps: RefMaps = match resolve::prefetch_ref_maps(conn) {
        Ok(m) => m,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut resolution_errors: Vec<String> = Vec::new();
    let mut resolved: Vec<(i64, i64, usize)> = Vec::new();
    for i in 0..table.rows.len() {
        let fila = i + 2;
        let Some(materia_id) = resolve::resolve_ref(
            &sheet.cell(i, "materia_id"),
            &sheet.cell(i, "materia_codigo"),
            &maps.materias,
        ) else {
            resolution_errors.push(format!("Fila {fila}: materia no encontrada"));
            continue;
        };
        let Some(ficha_id) = resolve::resolve_ref(
            &sheet.cell(i, "ficha_id"),
            &sheet.cell(i, "ficha_numero"),
            &maps.fichas,
        ) else {
            resolution_errors.push(format!("Fila {fila}: ficha no encontrada"));
            continue;
        };
        resolved.push((materia_id, ficha_id, i));
    }

    if dry_run {
        return ok(
            &req.id,
            json!({
                "success": true,
                "dryRun": true,
                "rowsTotal": table.rows.len(),
                "resolvable": resolved.len(),
                "resolutionErrors": resolution_errors.iter().take(50).collect::<Vec<_>>(),
                "unexpectedColumns": unexpected,
                "warnings": warnings.iter().take(50).collect::<Vec<_>>(),
            }),
        );
    }
    if resolved.is_empty() {
        let shown: Vec<&str> = resolution_errors.iter().take(25).map(|s| s.as_str()).collect();
        return err(
            &req.id,
            "no_rows_resolved",
            format!("No se pudo resolver ninguna fila: {}", shown.join("; ")),
            Some(json!({ "resolutionErrors": shown })),
        );
    }

    let actor = Actor::from_params(&req.params);
    let fecha = chrono::Local::now().date_naive().to_string();
    let batch_id = Uuid::new_v4().to_string();
    let mut counts = Counts::default();
    let mut row_errors: Vec<String> = Vec::new();
    let (mut processed, mut inserted, mut updated) = (0i64, 0i64, 0i64);

    let mut tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for &(materia_id, ficha_id, i) in &resolved {
        let fila = i + 2;
        processed += 1;

        let nombre = sheet.cell(i, "estudiante_nombre");
        let documento = sheet.cell(i, "estudiante_documento");
        let raw = sheet.nota_raw(i);
        let g = grades::normalize(&raw, &policy);
        let estado_cell = sheet.cell(i, "estado");
        let estado = resolve_estado(&g, &estado_cell);
        let observaciones = sheet.cell(i, "observaciones");

        let cal = CalRow {
            materia_id,
            ficha_id: Some(ficha_id),
            estudiante_nombre: &nombre,
            estudiante_documento: &documento,
            evidencia_nombre: "",
            trimestre: sheet.cell(i, "trimestre").parse::<i64>().unwrap_or(0),
            nota: g.nota,
            letra: g.letra,
            estado: &estado,
            observaciones: if observaciones.is_empty() {
                None
            } else {
                Some(&observaciones)
            },
            fecha_carga: &fecha,
            cargado_por: actor.id,
        };

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
        match persist_row(&sp, &cal) {
            Ok(was_insert) => {
                if let Err(e) = sp.commit() {
                    row_errors.push(format!("Fila {fila}: {e}"));
                    continue;
                }
                if was_insert {
                    inserted += 1;
                } else {
                    updated += 1;
                }
                counts.bump(tally_letter(&estado));
            }
            Err(e) => {
                // savepoint drop rolls this row back, the batch continues
                row_errors.push(format!("Fila {fila}: {e}"));
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
            accion: "upload_calificaciones",
            modulo: "calificaciones",
            entidad_tipo: Some("upload_batch"),
            entidad_id: Some(batch_id.clone()),
            detalles: Some(json!({
                "processed": processed,
                "inserted": inserted,
                "updated": updated,
                "filename": filename,
            })),
            metadata: Some(json!({
                "counts": counts.to_json(),
                "batch_id": batch_id,
            })),
        },
    );
    log::info!(
        "upload_calificaciones: processed={} inserted={} updated={} batch={}",
        processed,
        inserted,
        updated,
        batch_id
    );

    ok(
        &req.id,
        json!({
            "success": true,
            "stats": {
                "processed": processed,
                "inserted": inserted,
                "updated": updated,
                "resolutionErrors": resolution_errors.iter().take(50).collect::<Vec<_>>(),
                "unexpectedColumns": unexpected,
                "warnings": warnings.iter().take(50).collect::<Vec<_>>(),
                "rowErrors": row_errors.iter().take(50).collect::<Vec<_>>(),
            },
            "counts": counts.to_json(),
            "batchId": batch_id,
            "filename": filename,
        }),
    )
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let Some(materia_id) = req.params.get("materiaId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing materiaId", None);
    };
    let ficha_id = req.params.get("fichaId").and_then(|v| v.as_i64());
    let nombre = match req.params.get("estudianteNombre").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing estudianteNombre", None),
    };
    let documento = match req
        .params
        .get("estudianteDocumento")
        .and_then(|v| v.as_str())
    {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing estudianteDocumento", None),
    };
    let evidencia = req
        .params
        .get("evidenciaNombre")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let trimestre = match req.params.get("trimestre").and_then(|v| v.as_i64()) {
        Some(t) if (1..=4).contains(&t) => t,
        _ => return err(&req.id, "bad_params", "trimestre fuera de rango (1-4)", None),
    };
    let estado_param = req.params.get("estado").and_then(|v| v.as_str());
    if let Some(e) = estado_param {
        if !ESTADOS.contains(&e) {
            return err(
                &req.id,
                "bad_params",
                "estado debe ser Aprobado, Reprobado o Cursando",
                None,
            );
        }
    }
    let observaciones = req
        .params
        .get("observaciones")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let policy = match setup::grading_policy(conn) {
        Ok(p) => p,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let raw = req
        .params
        .get("nota")
        .or_else(|| req.params.get("letra"))
        .map(cell_str)
        .unwrap_or_default();
    let g = grades::normalize(&raw, &policy);
    if g.letra.is_none() {
        if let Some(n) = g.nota {
            if !(0.0..=5.0).contains(&n) {
                return err(&req.id, "bad_params", "nota fuera de rango (0-5)", None);
            }
        }
    }
    let estado = resolve_estado(&g, estado_param.unwrap_or(""));

    let materia_known: bool = match conn.query_row(
        "SELECT 1 FROM materias WHERE id = ?1",
        [materia_id],
        |r| r.get::<_, i64>(0),
    ) {
        Ok(_) => true,
        Err(rusqlite::Error::QueryReturnedNoRows) => false,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !materia_known {
        return err(
            &req.id,
            "not_found",
            "Materia no encontrada",
            Some(json!({ "materiaId": materia_id })),
        );
    }

    let actor = Actor::from_params(&req.params);
    let fecha = chrono::Local::now().date_naive().to_string();
    let cal = CalRow {
        materia_id,
        ficha_id,
        estudiante_nombre: &nombre,
        estudiante_documento: &documento,
        evidencia_nombre: &evidencia,
        trimestre,
        nota: g.nota,
        letra: g.letra,
        estado: &estado,
        observaciones: observaciones.as_deref(),
        fecha_carga: &fecha,
        cargado_por: actor.id,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let result = (|| -> anyhow::Result<(bool, i64)> {
        reconcile::ensure_student_refresh(&tx, &documento, &nombre, None)?;
        if !evidencia.is_empty() {
            let mut ensurer = reconcile::DefinitionEnsurer::new(&tx, materia_id, ficha_id, None)?;
            ensurer.ensure(&tx, &evidencia)?;
        }
        let was_insert = reconcile::upsert_calificacion(&tx, &cal)?;
        let id: i64 = tx.query_row(
            "SELECT id FROM calificaciones
             WHERE materia_id = ?1 AND estudiante_documento = ?2
               AND evidencia_nombre = ?3 AND trimestre = ?4",
            (materia_id, &documento, &evidencia, trimestre),
            |r| r.get(0),
        )?;
        Ok((was_insert, id))
    })();
    let (was_insert, cal_id) = match result {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "calificaciones" })),
            );
        }
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    audit::record_event(
        conn,
        &actor,
        Event {
            accion: "crear_calificacion",
            modulo: "calificaciones",
            entidad_tipo: Some("calificacion"),
            entidad_id: Some(cal_id.to_string()),
            detalles: Some(json!({
                "materia_id": materia_id,
                "ficha_id": ficha_id,
                "trimestre": trimestre,
            })),
            metadata: None,
        },
    );

    ok(
        &req.id,
        json!({
            "calificacion": {
                "id": cal_id,
                "materiaId": materia_id,
                "fichaId": ficha_id,
                "estudianteNombre": nombre,
                "estudianteDocumento": documento,
                "evidenciaNombre": evidencia,
                "trimestre": trimestre,
                "nota": g.nota,
                "letra": derive_letra(g.nota, g.letra, &policy),
                "estado": estado,
                "observaciones": observaciones,
                "fechaCarga": fecha,
            },
            "inserted": was_insert,
        }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let policy = match setup::grading_policy(conn) {
        Ok(p) => p,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(200)
        .clamp(1, 1000);

    let mut filters: Vec<&str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(materia_id) = req.params.get("materiaId").and_then(|v| v.as_i64()) {
        filters.push("materia_id = ?");
        bind.push(SqlValue::Integer(materia_id));
    }
    if let Some(ficha_id) = req.params.get("fichaId").and_then(|v| v.as_i64()) {
        filters.push("ficha_id = ?");
        bind.push(SqlValue::Integer(ficha_id));
    }
    if let Some(trimestre) = req.params.get("trimestre").and_then(|v| v.as_i64()) {
        filters.push("trimestre = ?");
        bind.push(SqlValue::Integer(trimestre));
    }
    if let Some(documento) = req.params.get("documento").and_then(|v| v.as_str()) {
        filters.push("estudiante_documento = ?");
        bind.push(SqlValue::Text(documento.trim().to_string()));
    }
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", filters.join(" AND "))
    };
    bind.push(SqlValue::Integer(limit));

    let sql = format!(
        "SELECT id, materia_id, ficha_id, estudiante_nombre, estudiante_documento,
                evidencia_nombre, trimestre, nota, letra, estado, observaciones, fecha_carga
         FROM calificaciones {where_clause}
         ORDER BY estudiante_nombre, trimestre
         LIMIT ?"
    );
    let rows = conn.prepare(&sql).and_then(|mut stmt| {
        stmt.query_map(params_from_iter(bind), |row| {
            let nota: Option<f64> = row.get(7)?;
            let letra: Option<String> = row.get(8)?;
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "materiaId": row.get::<_, i64>(1)?,
                "fichaId": row.get::<_, Option<i64>>(2)?,
                "estudianteNombre": row.get::<_, String>(3)?,
                "estudianteDocumento": row.get::<_, String>(4)?,
                "evidenciaNombre": row.get::<_, String>(5)?,
                "trimestre": row.get::<_, i64>(6)?,
                "nota": nota,
                "letra": derive_letra(nota, letra.as_deref(), &policy),
                "estado": row.get::<_, String>(9)?,
                "observaciones": row.get::<_, Option<String>>(10)?,
                "fechaCarga": row.get::<_, Option<String>>(11)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    });
    match rows {
        Ok(calificaciones) => ok(&req.id, json!({ "calificaciones": calificaciones })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_export_rows(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let policy = match setup::grading_policy(conn) {
        Ok(p) => p,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut filters: Vec<&str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(materia_id) = req.params.get("materiaId").and_then(|v| v.as_i64()) {
        filters.push("materia_id = ?");
        bind.push(SqlValue::Integer(materia_id));
    }
    if let Some(ficha_id) = req.params.get("fichaId").and_then(|v| v.as_i64()) {
        filters.push("ficha_id = ?");
        bind.push(SqlValue::Integer(ficha_id));
    }
    if let Some(trimestre) = req.params.get("trimestre").and_then(|v| v.as_i64()) {
        filters.push("trimestre = ?");
        bind.push(SqlValue::Integer(trimestre));
    }
    if let Some(estado) = req.params.get("estado").and_then(|v| v.as_str()) {
        filters.push("estado = ?");
        bind.push(SqlValue::Text(estado.to_string()));
    }
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", filters.join(" AND "))
    };

    let sql = format!(
        "SELECT materia_id, ficha_id, estudiante_nombre, estudiante_documento,
                trimestre, nota, letra, estado, observaciones, fecha_carga
         FROM calificaciones {where_clause}
         ORDER BY materia_id, estudiante_nombre, trimestre"
    );
    let rows = conn.prepare(&sql).and_then(|mut stmt| {
        stmt.query_map(params_from_iter(bind), |row| {
            let nota: Option<f64> = row.get(5)?;
            let letra: Option<String> = row.get(6)?;
            Ok(json!([
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                nota,
                derive_letra(nota, letra.as_deref(), &policy),
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ]))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    });
    let rows = match rows {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if rows.is_empty() {
        return err(
            &req.id,
            "not_found",
            "No hay calificaciones para exportar",
            None,
        );
    }

    ok(
        &req.id,
        json!({
            "columns": [
                "materia_id",
                "ficha_id",
                "estudiante_nombre",
                "estudiante_documento",
                "trimestre",
                "nota",
                "letra",
                "estado",
                "observaciones",
                "fecha_carga",
            ],
            "rows": rows,
            "sheetName": "Calificaciones",
            "filename": "calificaciones_export.xlsx",
        }),
    )
}

fn handle_template(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let usar_codigos = req
        .params
        .get("usarCodigos")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let materias = conn
        .prepare("SELECT id, codigo FROM materias ORDER BY codigo")
        .and_then(|mut stmt| {
            stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?)))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        });
    let materias = match materias {
        Ok(m) => m,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let fichas = conn
        .prepare("SELECT id, numero FROM fichas ORDER BY numero")
        .and_then(|mut stmt| {
            stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?)))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        });
    let fichas = match fichas {
        Ok(f) => f,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let columns: Vec<&str> = vec![
        if usar_codigos { "materia_codigo" } else { "materia_id" },
        if usar_codigos { "ficha_numero" } else { "ficha_id" },
        "estudiante_nombre",
        "estudiante_documento",
        "trimestre",
        "nota",
        "estado",
        "observaciones",
    ];

    let mut rows: Vec<serde_json::Value> = Vec::new();
    for (materia_id, codigo) in materias.iter().take(10) {
        for (ficha_id, numero) in fichas.iter().take(3) {
            let materia_cell = if usar_codigos {
                json!(codigo.clone().unwrap_or_default())
            } else {
                json!(materia_id)
            };
            let ficha_cell = if usar_codigos {
                json!(numero.clone().unwrap_or_default())
            } else {
                json!(ficha_id)
            };
            rows.push(json!([
                materia_cell,
                ficha_cell,
                "Nombre Estudiante",
                "123456789",
                1,
                "A",
                "Aprobado",
                "",
            ]));
        }
    }
    if rows.is_empty() {
        rows.push(json!([
            if usar_codigos { json!("CODIGO") } else { json!(1) },
            if usar_codigos { json!("NUMERO") } else { json!(1) },
            "Nombre Estudiante",
            "Documento",
            1,
            "A",
            "Cursando",
            "",
        ]));
    }

    let filename = if usar_codigos {
        "plantilla_calificaciones_codigos.xlsx"
    } else {
        "plantilla_calificaciones_ids.xlsx"
    };
    ok(
        &req.id,
        json!({
            "columns": columns,
            "rows": rows,
            "sheetName": "calificaciones",
            "filename": filename,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calificaciones.upload" => Some(handle_upload(state, req)),
        "calificaciones.create" => Some(handle_create(state, req)),
        "calificaciones.list" => Some(handle_list(state, req)),
        "calificaciones.exportRows" => Some(handle_export_rows(state, req)),
        "calificaciones.template" => Some(handle_template(state, req)),
        _ => None,
    }
}
