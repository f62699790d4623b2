use crate::alerts;
use crate::audit::{self, Actor};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::types::{AppState, Request};
use crate::mail::{EmailSender, NotifySink};
use serde_json::json;

fn handle_evaluar(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };

    let Some(materia_id) = req.params.get("materiaId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing materiaId", None);
    };
    let Some(ficha_id) = req.params.get("fichaId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing fichaId", None);
    };

    let defaults = match setup::alert_defaults(conn) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let student_threshold = req
        .params
        .get("studentThreshold")
        .and_then(|v| v.as_i64())
        .filter(|&t| t >= 1)
        .unwrap_or(defaults.student_threshold);
    let escalation_threshold = req
        .params
        .get("escalationThreshold")
        .and_then(|v| v.as_i64())
        .filter(|&t| t >= 1)
        .unwrap_or(defaults.escalation_threshold);
    let include_pending = req
        .params
        .get("includePending")
        .and_then(|v| v.as_bool())
        .unwrap_or(defaults.include_pending);

    let materia = match alerts::materia_ref(conn, materia_id) {
        Ok(m) => m,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match alerts::failing_counts(conn, materia_id, ficha_id, include_pending) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let staff = match alerts::active_staff_emails(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enabled = match setup::notify_enabled(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let sink = NotifySink { enabled };

    let mut attempts = Vec::new();
    let mut sent_any = false;
    for row in &rows {
        let (email, escalation) = if row.reprobadas >= escalation_threshold {
            (
                alerts::build_escalation_notice(row, ficha_id, &materia, &staff),
                true,
            )
        } else if row.reprobadas >= student_threshold {
            (alerts::build_student_notice(row, ficha_id, &materia), false)
        } else {
            continue;
        };
        let sent = sink.send(&email);
        sent_any = sent_any || sent;
        attempts.push(json!({
            "documento": row.documento,
            "to": email.to,
            "count": row.reprobadas,
            "escalation": escalation,
            "sent": sent
        }));
    }

    let actor = Actor::from_params(&req.params);
    audit::record_event(
        conn,
        &actor,
        audit::Event {
            accion: "absence_threshold_emails",
            modulo: "maintenance",
            entidad_tipo: Some("absence_batch"),
            entidad_id: None,
            detalles: Some(json!({
                "rows": rows.len(),
                "sent": sent_any,
                "materia_id": materia_id,
                "ficha_id": ficha_id
            })),
            metadata: None,
        },
    );

    let row_objs: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            json!({
                "documento": r.documento,
                "nombre": r.nombre,
                "apellido": r.apellido,
                "correo": r.correo,
                "reprobadas": r.reprobadas
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "success": true,
            "rows": row_objs,
            "attempts": attempts,
            "sentAny": sent_any,
            "enabled": enabled,
            "thresholds": {
                "student": student_threshold,
                "escalation": escalation_threshold,
                "includePending": include_pending
            }
        }),
    )
}

fn handle_contar(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let Some(materia_id) = req.params.get("materiaId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing materiaId", None);
    };
    let Some(ficha_id) = req.params.get("fichaId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing fichaId", None);
    };
    let include_pending = req
        .params
        .get("includePending")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let counts = match alerts::diagnostic_counts(conn, materia_id, ficha_id, include_pending) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let counts: Vec<serde_json::Value> = counts
        .iter()
        .map(|(fid, letra, cnt)| json!({ "fichaId": fid, "letra": letra, "cnt": cnt }))
        .collect();

    ok(
        &req.id,
        json!({
            "success": true,
            "counts": counts,
            "includePending": include_pending
        }),
    )
}

fn handle_pendientes(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    let threshold = req
        .params
        .get("threshold")
        .and_then(|v| v.as_i64())
        .filter(|&t| t >= 1)
        .unwrap_or(alerts::FALTAS_THRESHOLD);
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(50)
        .clamp(1, 200);
    let dry_run = req
        .params
        .get("dryRun")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let resumenes = match alerts::fetch_pendientes(conn, threshold, limit) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let destinatarios = match alerts::active_staff_emails(conn) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enabled = match setup::notify_enabled(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let email = alerts::build_pendientes_email(&resumenes, destinatarios.clone(), threshold);

    let pendientes: Vec<serde_json::Value> = resumenes
        .iter()
        .map(|r| json!({ "estudiante": r.estudiante, "faltas": r.faltas }))
        .collect();

    if dry_run {
        return ok(
            &req.id,
            json!({
                "success": true,
                "pendientes": pendientes,
                "emailPreview": {
                    "to": email.to,
                    "subject": email.subject,
                    "body": email.body
                },
                "enabled": enabled
            }),
        );
    }

    let sink = NotifySink { enabled };
    let sent = sink.send(&email);

    let actor = Actor::from_params(&req.params);
    audit::record_event(
        conn,
        &actor,
        audit::Event {
            accion: "trigger_pending_evidencias_email",
            modulo: "maintenance",
            entidad_tipo: Some("email_batch"),
            entidad_id: None,
            detalles: Some(json!({
                "destinatarios": destinatarios.len(),
                "sent": sent,
                "pendientes": resumenes.len()
            })),
            metadata: None,
        },
    );

    ok(
        &req.id,
        json!({
            "success": true,
            "sent": sent,
            "email": { "to": email.to, "subject": email.subject },
            "pendientes": pendientes,
            "enabled": enabled
        }),
    )
}

fn handle_mail_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "no workspace selected", None);
    };
    match setup::notify_enabled(conn) {
        Ok(enabled) => ok(&req.id, json!({ "enabled": enabled })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "alertas.evaluar" => Some(handle_evaluar(state, req)),
        "alertas.contar" => Some(handle_contar(state, req)),
        "alertas.pendientes" => Some(handle_pendientes(state, req)),
        "mail.status" => Some(handle_mail_status(state, req)),
        _ => None,
    }
}
