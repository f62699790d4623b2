use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;

const ROLES: &[&str] = &["Administrador", "Coordinador", "Docente"];

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    let nombre = match req.params.get("nombre").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing nombre", None),
    };
    let email = match req.params.get("email").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_lowercase(),
        _ => return err(&req.id, "bad_params", "missing email", None),
    };
    let rol = match req.params.get("rol").and_then(|v| v.as_str()) {
        Some(v) if ROLES.contains(&v.trim()) => v.trim().to_string(),
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                "rol must be one of: Administrador, Coordinador, Docente",
                None,
            )
        }
        None => return err(&req.id, "bad_params", "missing rol", None),
    };
    let activo = req
        .params
        .get("activo")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let existing: Option<i64> = match conn
        .query_row("SELECT id FROM users WHERE email = ?1", [&email], |r| {
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
            "El email ya está registrado",
            Some(json!({ "email": email })),
        );
    }

    if let Err(e) = conn.execute(
        "INSERT INTO users(nombre, email, rol, activo) VALUES(?1, ?2, ?3, ?4)",
        (&nombre, &email, &rol, activo as i64),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(
        &req.id,
        json!({
            "id": conn.last_insert_rowid(),
            "nombre": nombre,
            "email": email,
            "rol": rol,
            "activo": activo
        }),
    )
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    let mut filters: Vec<&str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(rol) = req.params.get("rol").and_then(|v| v.as_str()) {
        filters.push("rol = ?");
        bind.push(SqlValue::Text(rol.to_string()));
    }
    if let Some(activo) = req.params.get("activo").and_then(|v| v.as_bool()) {
        filters.push("activo = ?");
        bind.push(SqlValue::Integer(activo as i64));
    }
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", filters.join(" AND "))
    };

    let sql = format!(
        "SELECT id, nombre, email, rol, activo FROM users {} ORDER BY nombre",
        where_clause
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(params_from_iter(bind), |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "nombre": row.get::<_, String>(1)?,
                "email": row.get::<_, String>(2)?,
                "rol": row.get::<_, String>(3)?,
                "activo": row.get::<_, i64>(4)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        _ => None,
    }
}
