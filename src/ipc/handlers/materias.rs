use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_materias_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    let codigo = match req.params.get("codigo").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing codigo", None),
    };
    let nombre = match req.params.get("nombre").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing nombre", None),
    };
    let creditos = req.params.get("creditos").and_then(|v| v.as_i64());
    let horas_semana = req.params.get("horasSemana").and_then(|v| v.as_i64());
    let ficha_id = req.params.get("fichaId").and_then(|v| v.as_i64());
    let docente_id = req.params.get("docenteId").and_then(|v| v.as_i64());
    let competencia = req
        .params
        .get("competencia")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let existing: Option<i64> = match conn
        .query_row("SELECT id FROM materias WHERE codigo = ?1", [&codigo], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing.is_some() {
        return err(
            &req.id,
            "conflict",
            "El código de materia ya existe",
            Some(json!({ "codigo": codigo })),
        );
    }

    if let Err(e) = conn.execute(
        "INSERT INTO materias(codigo, nombre, creditos, horas_semana, ficha_id, docente_id, competencia)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        (
            &codigo,
            &nombre,
            creditos,
            horas_semana,
            ficha_id,
            docente_id,
            competencia.as_deref(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "materias" })),
        );
    }

    ok(
        &req.id,
        json!({
            "id": conn.last_insert_rowid(),
            "codigo": codigo,
            "nombre": nombre,
            "fichaId": ficha_id,
            "docenteId": docente_id
        }),
    )
}

fn handle_materias_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    let ficha_id = req.params.get("fichaId").and_then(|v| v.as_i64());
    let sql = if ficha_id.is_some() {
        "SELECT id, codigo, nombre, creditos, horas_semana, ficha_id, docente_id, estado, competencia
         FROM materias WHERE ficha_id = ?1 ORDER BY codigo"
    } else {
        "SELECT id, codigo, nombre, creditos, horas_semana, ficha_id, docente_id, estado, competencia
         FROM materias ORDER BY codigo"
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": row.get::<_, i64>(0)?,
            "codigo": row.get::<_, String>(1)?,
            "nombre": row.get::<_, String>(2)?,
            "creditos": row.get::<_, Option<i64>>(3)?,
            "horasSemana": row.get::<_, Option<i64>>(4)?,
            "fichaId": row.get::<_, Option<i64>>(5)?,
            "docenteId": row.get::<_, Option<i64>>(6)?,
            "estado": row.get::<_, String>(7)?,
            "competencia": row.get::<_, Option<String>>(8)?
        }))
    };

    let rows = match ficha_id {
        Some(fid) => stmt
            .query_map([fid], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };

    match rows {
        Ok(materias) => ok(&req.id, json!({ "materias": materias })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "materias.create" => Some(handle_materias_create(state, req)),
        "materias.list" => Some(handle_materias_list(state, req)),
        _ => None,
    }
}
