use serde_json::{json, Map, Value};

/// Success envelope: `{"id", "ok": true, "result"}`.
pub fn ok(id: &str, result: Value) -> Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

/// Failure envelope: `{"id", "ok": false, "error": {"code", "message"[, "details"]}}`.
///
/// Codes the daemon emits: `bad_json` for unparseable lines, `bad_params`
/// for shape and validation failures, `no_workspace` before
/// `workspace.select`, `not_found` and `conflict` for entity lookups,
/// `structural_error` when a whole sheet is rejected, `not_implemented`
/// for unknown methods, and `db_*`/`io_error` for storage failures.
pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = Map::new();
    error.insert("code".into(), Value::String(code.into()));
    error.insert("message".into(), Value::String(message.into()));
    if let Some(d) = details {
        error.insert("details".into(), d);
    }
    json!({
        "id": id,
        "ok": false,
        "error": Value::Object(error)
    })
}
