use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &AppState, req: &Request) -> serde_json::Value {
    let workspace = state
        .workspace
        .as_ref()
        .map(|p| p.to_string_lossy().to_string());
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": workspace
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = match req.params.get("path").and_then(|v| v.as_str()) {
        Some(p) => PathBuf::from(p),
        None => return err(&req.id, "bad_params", "missing params.path", None),
    };

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };

    log::info!("workspace opened at {}", path.to_string_lossy());
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    // A different database may live under the new path.
    state.cache.clear();
    ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
}

fn handle_db_health(state: &AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    match conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)) {
        Ok(1) => ok(&req.id, json!({ "ok": true })),
        Ok(other) => err(
            &req.id,
            "db_query_failed",
            format!("unexpected probe result: {}", other),
            None,
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "db.health" => Some(handle_db_health(state, req)),
        _ => None,
    }
}
