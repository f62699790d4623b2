use crate::cache::cache_key;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;

/// Param-key → column pairs `definiciones.update` accepts; anything else in
/// the payload is ignored. Explicit JSON null clears the column.
const UPDATABLE: &[(&str, &str)] = &[
    ("nombre", "nombre"),
    ("activa", "activa"),
    ("semanaActivacion", "semana_activacion"),
    ("fechaActivacion", "fecha_activacion"),
    ("tipo", "tipo"),
    ("peso", "peso"),
    ("porcentaje", "porcentaje"),
    ("orden", "orden"),
    ("docenteId", "docente_id"),
];

fn to_sql(value: &serde_json::Value) -> Option<SqlValue> {
    match value {
        serde_json::Value::Null => Some(SqlValue::Null),
        serde_json::Value::Bool(b) => Some(SqlValue::Integer(*b as i64)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        serde_json::Value::String(s) => Some(SqlValue::Text(s.clone())),
        _ => None,
    }
}

fn pct(part: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (part as f64 * 10_000.0 / total as f64).round() / 100.0
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(200)
        .clamp(1, 1000);

    let mut filters: Vec<&str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(documento) = req.params.get("documento").and_then(|v| v.as_str()) {
        filters.push("documento = ?");
        bind.push(SqlValue::Text(documento.trim().to_string()));
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
    bind.push(SqlValue::Integer(limit));

    let sql = format!(
        "SELECT id, documento, evidencia_nombre, letra, estado, created_at, updated_at
         FROM evidencias {where_clause}
         ORDER BY documento, evidencia_nombre
         LIMIT ?"
    );
    let rows = conn.prepare(&sql).and_then(|mut stmt| {
        stmt.query_map(params_from_iter(bind), |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "documento": row.get::<_, String>(1)?,
                "evidenciaNombre": row.get::<_, String>(2)?,
                "letra": row.get::<_, Option<String>>(3)?,
                "estado": row.get::<_, String>(4)?,
                "createdAt": row.get::<_, String>(5)?,
                "updatedAt": row.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    });
    match rows {
        Ok(evidencias) => ok(&req.id, json!({ "evidencias": evidencias })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    }
    let ficha_id = req.params.get("fichaId").and_then(|v| v.as_i64());
    let key = cache_key(
        "evidencias_stats",
        &[(
            "fichaId",
            ficha_id.map_or(String::new(), |v| v.to_string()),
        )],
    );
    if let Some(hit) = state.cache.get(&key) {
        return ok(&req.id, hit);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    let counts = "COALESCE(SUM(CASE WHEN e.letra = 'A' THEN 1 ELSE 0 END), 0),
                  COALESCE(SUM(CASE WHEN e.letra IN ('F', 'D') THEN 1 ELSE 0 END), 0),
                  COALESCE(SUM(CASE WHEN e.letra = '-' THEN 1 ELSE 0 END), 0),
                  COALESCE(SUM(CASE WHEN e.letra IS NULL THEN 1 ELSE 0 END), 0),
                  COUNT(*)";
    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(String, i64, i64, i64, i64, i64)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    };
    let rows = match ficha_id {
        Some(fid) => {
            let sql = format!(
                "SELECT e.evidencia_nombre, {counts}
                 FROM evidencias e
                 JOIN estudiantes s ON s.documento = e.documento
                 WHERE s.ficha_id = ?
                 GROUP BY e.evidencia_nombre
                 ORDER BY e.evidencia_nombre"
            );
            conn.prepare(&sql).and_then(|mut stmt| {
                stmt.query_map([fid], map_row)
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            })
        }
        None => {
            let sql = format!(
                "SELECT e.evidencia_nombre, {counts}
                 FROM evidencias e
                 GROUP BY e.evidencia_nombre
                 ORDER BY e.evidencia_nombre"
            );
            conn.prepare(&sql).and_then(|mut stmt| {
                stmt.query_map([], map_row)
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            })
        }
    };
    let rows = match rows {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let stats: Vec<serde_json::Value> = rows
        .iter()
        .map(|(nombre, aprobados, reprobados, no_entregaron, pendientes, total)| {
            json!({
                "evidencia": nombre,
                "aprobados": aprobados,
                "reprobados": reprobados,
                "noEntregaron": no_entregaron,
                "pendientes": pendientes,
                "total": total,
                "porcentajes": {
                    "aprobados": pct(*aprobados, *total),
                    "reprobados": pct(*reprobados, *total),
                    "noEntregaron": pct(*no_entregaron, *total),
                },
            })
        })
        .collect();
    let result = json!({ "success": true, "stats": stats, "fichaId": ficha_id });
    state.cache.put(key, result.clone());
    ok(&req.id, result)
}

fn handle_template(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    }
    // Either a list of evidencia names or a column count in the old style.
    let param = req.params.get("evidencias");
    let names: Vec<String> = if let Some(items) = param.and_then(|v| v.as_array()) {
        items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    } else {
        let n = param.and_then(|v| v.as_i64()).unwrap_or(2).clamp(1, 50);
        (1..=n).map(|i| format!("Evidencia {i}")).collect()
    };
    if names.is_empty() {
        return err(&req.id, "bad_params", "evidencias vacío", None);
    }

    let mut columns: Vec<String> = vec!["Correo".into(), "Nombre".into(), "Apellido".into()];
    columns.extend(names.iter().map(|n| format!("{n} (Letra)")));
    let mut example: Vec<serde_json::Value> =
        vec![json!("estudiante1@correo.edu"), json!("Juan"), json!("Pérez")];
    example.extend(names.iter().map(|_| json!("A")));

    ok(
        &req.id,
        json!({
            "columns": columns,
            "rows": [example],
            "sheetName": "Plantilla",
            "filename": "plantilla_evidencias.xlsx",
        }),
    )
}

fn def_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, i64>(0)?,
        "nombre": row.get::<_, String>(1)?,
        "fichaId": row.get::<_, Option<i64>>(2)?,
        "materiaId": row.get::<_, i64>(3)?,
        "docenteId": row.get::<_, Option<i64>>(4)?,
        "activa": row.get::<_, i64>(5)? != 0,
        "semanaActivacion": row.get::<_, Option<i64>>(6)?,
        "fechaActivacion": row.get::<_, Option<String>>(7)?,
        "tipo": row.get::<_, Option<String>>(8)?,
        "peso": row.get::<_, Option<f64>>(9)?,
        "porcentaje": row.get::<_, Option<f64>>(10)?,
        "orden": row.get::<_, i64>(11)?,
    }))
}

fn handle_definiciones_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
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
    if let Some(docente_id) = req.params.get("docenteId").and_then(|v| v.as_i64()) {
        filters.push("docente_id = ?");
        bind.push(SqlValue::Integer(docente_id));
    }
    if let Some(activa) = req.params.get("activa").and_then(|v| v.as_bool()) {
        filters.push("activa = ?");
        bind.push(SqlValue::Integer(activa as i64));
    }
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", filters.join(" AND "))
    };

    let sql = format!(
        "SELECT id, nombre, ficha_id, materia_id, docente_id, activa,
                semana_activacion, fecha_activacion, tipo, peso, porcentaje, orden
         FROM evidencia_definicion {where_clause}
         ORDER BY orden, nombre"
    );
    let rows = conn.prepare(&sql).and_then(|mut stmt| {
        stmt.query_map(params_from_iter(bind), def_row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    });
    match rows {
        Ok(definiciones) => ok(&req.id, json!({ "definiciones": definiciones })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_definiciones_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let Some(id) = req.params.get("id").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing id", None);
    };

    let mut sets: Vec<String> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    for (param, column) in UPDATABLE {
        if let Some(value) = req.params.get(*param) {
            let Some(sql_value) = to_sql(value) else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("valor no escalar para {param}"),
                    None,
                );
            };
            sets.push(format!("{column} = ?"));
            bind.push(sql_value);
        }
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "Nada para actualizar", None);
    }
    bind.push(SqlValue::Integer(id));

    let sql = format!(
        "UPDATE evidencia_definicion SET {}
         WHERE id = ?
         RETURNING id, nombre, ficha_id, materia_id, docente_id, activa,
                   semana_activacion, fecha_activacion, tipo, peso, porcentaje, orden",
        sets.join(", ")
    );
    match conn
        .query_row(&sql, params_from_iter(bind), def_row_json)
        .optional()
    {
        Ok(Some(definicion)) => ok(&req.id, json!({ "definicion": definicion })),
        Ok(None) => err(
            &req.id,
            "not_found",
            "Definición no encontrada",
            Some(json!({ "id": id })),
        ),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evidencias.list" => Some(handle_list(state, req)),
        "evidencias.stats" => Some(handle_stats(state, req)),
        "evidencias.template" => Some(handle_template(state, req)),
        "definiciones.list" => Some(handle_definiciones_list(state, req)),
        "definiciones.update" => Some(handle_definiciones_update(state, req)),
        _ => None,
    }
}
