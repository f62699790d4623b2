use crate::audit::{self, Actor};
use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn required_path(params: &serde_json::Value, key: &str) -> Option<PathBuf> {
    let raw = params.get(key)?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(PathBuf::from(raw))
}

fn handle_backup(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(out) = required_path(&req.params, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    // Flush WAL pages so the copied file is complete on its own.
    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let summary = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(s) => s,
        Err(e) => {
            let details = json!({ "path": out.to_string_lossy() });
            return err(&req.id, "io_error", e.to_string(), Some(details));
        }
    };

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out.to_string_lossy(),
            "bundleFormat": summary.bundle_format,
            "entryCount": summary.entry_count,
            "sha256": summary.sha256
        }),
    )
}

fn handle_restore(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(src) = required_path(&req.params, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    if !src.is_file() {
        let details = json!({ "path": src.to_string_lossy() });
        return err(&req.id, "not_found", "bundle file not found", Some(details));
    }

    // Close the connection; the database file is about to be swapped.
    state.db = None;

    let report = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(r) => r,
        Err(e) => {
            let details = json!({ "path": src.to_string_lossy() });
            return err(&req.id, "io_error", e.to_string(), Some(details));
        }
    };

    let conn = match db::open_db(&workspace_path) {
        Ok(conn) => conn,
        Err(e) => return err(&req.id, "db_open_failed", e.to_string(), None),
    };
    state.db = Some(conn);
    state.cache.clear();

    ok(
        &req.id,
        json!({
            "ok": true,
            "workspacePath": workspace_path.to_string_lossy(),
            "bundleFormatDetected": report.bundle_format_detected,
            "sha256Verified": report.sha256_verified
        }),
    )
}

fn handle_clear_data(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let keep_users = req
        .params
        .get("keepUsers")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Dependency order; audit_logs and settings survive the wipe.
    let mut tables: Vec<&str> = vec![
        "calificaciones",
        "evidencias",
        "evidencia_definicion",
        "estudiantes",
        "materias",
        "fichas",
    ];
    if !keep_users {
        tables.push("users");
    }

    let mut deleted = serde_json::Map::new();
    for table in &tables {
        match tx.execute(&format!("DELETE FROM {}", table), []) {
            Ok(n) => {
                deleted.insert(table.to_string(), json!(n));
            }
            Err(e) => {
                let _ = tx.rollback();
                let details = json!({ "table": table });
                return err(&req.id, "db_delete_failed", e.to_string(), Some(details));
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let actor = Actor::from_params(&req.params);
    audit::record_event(
        conn,
        &actor,
        audit::Event {
            accion: "clear_data",
            modulo: "maintenance",
            entidad_tipo: Some("workspace"),
            entidad_id: None,
            detalles: Some(json!({ "keepUsers": keep_users, "deleted": deleted })),
            metadata: None,
        },
    );

    ok(
        &req.id,
        json!({ "ok": true, "keepUsers": keep_users, "deleted": deleted }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "maintenance.backup" => Some(handle_backup(state, req)),
        "maintenance.restore" => Some(handle_restore(state, req)),
        "maintenance.clearData" => Some(handle_clear_data(state, req)),
        _ => None,
    }
}
