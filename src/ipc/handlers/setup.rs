use crate::db;
use crate::grades::GradePolicy;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Alerts,
    Notify,
}

impl SetupSection {
    const ALL: [(&'static str, SetupSection); 3] = [
        ("grading", SetupSection::Grading),
        ("alerts", SetupSection::Alerts),
        ("notify", SetupSection::Notify),
    ];

    fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, section)| *section)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Grading => "grading",
            Self::Alerts => "alerts",
            Self::Notify => "notify",
        }
    }

    fn settings_key(self) -> String {
        format!("setup.{}", self.name())
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "notaA": 5.0,
            "notaF": 2.0,
            "notaMinAprobacion": 3.0
        }),
        SetupSection::Alerts => json!({
            "studentThreshold": 3,
            "escalationThreshold": 5,
            "includePending": true
        }),
        SetupSection::Notify => json!({
            "enabled": false
        }),
    }
}

fn put_bool(obj: &mut Map<String, Value>, k: &str, v: &Value) -> Result<(), String> {
    let b = v.as_bool().ok_or_else(|| format!("{} must be boolean", k))?;
    obj.insert(k.to_string(), Value::Bool(b));
    Ok(())
}

fn apply_grading_field(obj: &mut Map<String, Value>, k: &str, v: &Value) -> Result<(), String> {
    match k {
        "notaA" | "notaF" | "notaMinAprobacion" => {
            let n = v.as_f64().ok_or_else(|| format!("{} must be numeric", k))?;
            if !(0.0..=5.0).contains(&n) {
                return Err(format!("{} must be in 0..=5", k));
            }
            obj.insert(k.to_string(), Value::from(n));
            Ok(())
        }
        _ => Err(format!("unknown grading field: {}", k)),
    }
}

fn apply_alerts_field(obj: &mut Map<String, Value>, k: &str, v: &Value) -> Result<(), String> {
    match k {
        "studentThreshold" | "escalationThreshold" => {
            let n = v.as_i64().ok_or_else(|| format!("{} must be integer", k))?;
            if !(1..=100).contains(&n) {
                return Err(format!("{} must be in 1..=100", k));
            }
            obj.insert(k.to_string(), Value::from(n));
            Ok(())
        }
        "includePending" => put_bool(obj, k, v),
        _ => Err(format!("unknown alerts field: {}", k)),
    }
}

fn apply_notify_field(obj: &mut Map<String, Value>, k: &str, v: &Value) -> Result<(), String> {
    match k {
        "enabled" => put_bool(obj, k, v),
        _ => Err(format!("unknown notify field: {}", k)),
    }
}

/// The A band must sit strictly above the F band or letter scoring inverts.
fn check_grading_consistency(section: &Value) -> Result<(), String> {
    let nota_a = section.get("notaA").and_then(|v| v.as_f64()).unwrap_or(5.0);
    let nota_f = section.get("notaF").and_then(|v| v.as_f64()).unwrap_or(2.0);
    if nota_a <= nota_f {
        return Err("notaA must be greater than notaF".to_string());
    }
    Ok(())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => apply_grading_field(obj, k, v)?,
            SetupSection::Alerts => apply_alerts_field(obj, k, v)?,
            SetupSection::Notify => apply_notify_field(obj, k, v)?,
        }
    }
    if matches!(section, SetupSection::Grading) {
        check_grading_consistency(current)?;
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    let saved = db::settings_get_json(conn, &section.settings_key())?;
    if let Some(saved_obj) = saved.as_ref().and_then(|v| v.as_object()) {
        // Re-validate saved values; malformed history must not block reads.
        let _ = merge_section_patch(section, &mut current, saved_obj);
    }
    Ok(current)
}

/// Letter mapping loaded at the start of every ingestion batch.
pub fn grading_policy(conn: &rusqlite::Connection) -> anyhow::Result<GradePolicy> {
    let section = load_section(conn, SetupSection::Grading)?;
    Ok(GradePolicy::from_section(&section))
}

pub struct AlertDefaults {
    pub student_threshold: i64,
    pub escalation_threshold: i64,
    pub include_pending: bool,
}

pub fn alert_defaults(conn: &rusqlite::Connection) -> anyhow::Result<AlertDefaults> {
    let section = load_section(conn, SetupSection::Alerts)?;
    Ok(AlertDefaults {
        student_threshold: section
            .get("studentThreshold")
            .and_then(|v| v.as_i64())
            .unwrap_or(3),
        escalation_threshold: section
            .get("escalationThreshold")
            .and_then(|v| v.as_i64())
            .unwrap_or(5),
        include_pending: section
            .get("includePending")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    })
}

pub fn notify_enabled(conn: &rusqlite::Connection) -> anyhow::Result<bool> {
    let section = load_section(conn, SetupSection::Notify)?;
    Ok(section
        .get("enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let mut out = Map::new();
    for (name, section) in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(name.to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let section_raw = match req.params.get("section").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return err(&req.id, "bad_params", "missing section", None),
    };
    let section = match SetupSection::parse(section_raw) {
        Some(s) => s,
        None => return err(&req.id, "bad_params", "unknown section", None),
    };
    let patch = match req.params.get("patch").and_then(|v| v.as_object()) {
        Some(p) => p,
        None => return err(&req.id, "bad_params", "patch must be an object", None),
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, &section.settings_key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "ok": true, "section": section_raw, "value": current }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "setup.get" => handle_setup_get(state, req),
        "setup.update" => handle_setup_update(state, req),
        _ => return None,
    };
    Some(resp)
}
