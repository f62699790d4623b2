use crate::audit::{self, Actor};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

const ESTADOS: &[&str] = &["Activa", "Inactiva", "Finalizada"];

fn handle_fichas_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    let numero = match req.params.get("numero").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing numero", None),
    };
    let nombre = match req.params.get("nombre").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing nombre", None),
    };
    let estado = req
        .params
        .get("estado")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "Activa".to_string());
    if !ESTADOS.contains(&estado.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "estado must be one of: Activa, Inactiva, Finalizada",
            None,
        );
    }
    let coordinador_id = req.params.get("coordinadorId").and_then(|v| v.as_i64());

    let existing: Option<i64> = match conn
        .query_row("SELECT id FROM fichas WHERE numero = ?1", [&numero], |r| {
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
            "El número de ficha ya existe",
            Some(json!({ "numero": numero })),
        );
    }

    if let Err(e) = conn.execute(
        "INSERT INTO fichas(numero, nombre, estado, coordinador_id) VALUES(?1, ?2, ?3, ?4)",
        (&numero, &nombre, &estado, coordinador_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "fichas" })),
        );
    }
    let ficha_id = conn.last_insert_rowid();

    let actor = Actor::from_params(&req.params);
    audit::record_event(
        conn,
        &actor,
        audit::Event {
            accion: "create",
            modulo: "fichas",
            entidad_tipo: Some("ficha"),
            entidad_id: Some(ficha_id.to_string()),
            detalles: Some(json!(format!("Ficha {} creada", numero))),
            metadata: None,
        },
    );

    ok(
        &req.id,
        json!({
            "id": ficha_id,
            "numero": numero,
            "nombre": nombre,
            "estado": estado,
            "coordinadorId": coordinador_id
        }),
    )
}

fn handle_fichas_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT
           f.id,
           f.numero,
           f.nombre,
           f.estado,
           f.coordinador_id,
           (SELECT COUNT(*) FROM estudiantes s WHERE s.ficha_id = f.id) AS estudiantes
         FROM fichas f
         ORDER BY f.numero",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "numero": row.get::<_, String>(1)?,
                "nombre": row.get::<_, String>(2)?,
                "estado": row.get::<_, String>(3)?,
                "coordinadorId": row.get::<_, Option<i64>>(4)?,
                "estudiantes": row.get::<_, i64>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(fichas) => ok(&req.id, json!({ "fichas": fichas })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fichas.create" => Some(handle_fichas_create(state, req)),
        "fichas.list" => Some(handle_fichas_list(state, req)),
        _ => None,
    }
}
