use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::params_from_iter;
use serde_json::json;

fn handle_estudiantes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    let mut filters: Vec<&str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(fid) = req.params.get("fichaId").and_then(|v| v.as_i64()) {
        filters.push("s.ficha_id = ?");
        bind.push(SqlValue::Integer(fid));
    }
    if let Some(q) = req.params.get("q").and_then(|v| v.as_str()) {
        let q = q.trim();
        if !q.is_empty() {
            filters.push(
                "(s.documento LIKE ? OR s.nombre LIKE ? OR s.apellido LIKE ? OR s.correo LIKE ?)",
            );
            let pattern = format!("%{}%", q);
            for _ in 0..4 {
                bind.push(SqlValue::Text(pattern.clone()));
            }
        }
    }
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", filters.join(" AND "))
    };

    let sql = format!(
        "SELECT s.documento, s.nombre, s.apellido, s.correo, s.ficha_id, f.numero
         FROM estudiantes s
         LEFT JOIN fichas f ON f.id = s.ficha_id
         {} ORDER BY s.nombre, s.apellido",
        where_clause
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(params_from_iter(bind), |row| {
            Ok(json!({
                "documento": row.get::<_, String>(0)?,
                "nombre": row.get::<_, String>(1)?,
                "apellido": row.get::<_, String>(2)?,
                "correo": row.get::<_, Option<String>>(3)?,
                "fichaId": row.get::<_, Option<i64>>(4)?,
                "fichaNumero": row.get::<_, Option<String>>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(estudiantes) => ok(&req.id, json!({ "estudiantes": estudiantes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "estudiantes.list" => Some(handle_estudiantes_list(state, req)),
        _ => None,
    }
}
