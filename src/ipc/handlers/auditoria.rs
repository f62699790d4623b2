use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_uploads_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(50)
        .clamp(1, 500);

    match audit::uploads_history(conn, limit) {
        Ok(uploads) => ok(&req.id, json!({ "uploads": uploads })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let accion = req.params.get("accion").and_then(|v| v.as_str());
    let modulo = req.params.get("modulo").and_then(|v| v.as_str());
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(100)
        .clamp(1, 1000);

    match audit::list(conn, accion, modulo, limit) {
        Ok(events) => ok(&req.id, json!({ "events": events })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.uploadsHistory" => Some(handle_uploads_history(state, req)),
        "audit.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
