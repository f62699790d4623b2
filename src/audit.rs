use log::warn;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};

/// Identity claims forwarded by the transport after it verified the caller's
/// token. Absent or malformed claims mean an anonymous actor; that is
/// permitted everywhere.
#[derive(Debug, Default, Clone)]
pub struct Actor {
    pub id: Option<i64>,
    pub email: Option<String>,
    pub rol: Option<String>,
}

impl Actor {
    pub fn from_params(params: &Value) -> Actor {
        let Some(a) = params.get("actor") else {
            return Actor::default();
        };
        Actor {
            id: a.get("id").and_then(|v| v.as_i64()),
            email: a
                .get("email")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            rol: a.get("rol").and_then(|v| v.as_str()).map(|s| s.to_string()),
        }
    }
}

pub struct Event<'a> {
    pub accion: &'a str,
    pub modulo: &'a str,
    pub entidad_tipo: Option<&'a str>,
    pub entidad_id: Option<String>,
    pub detalles: Option<Value>,
    pub metadata: Option<Value>,
}

/// Fire-and-forget: audit failures are logged to stderr, never propagated,
/// so a broken audit table cannot fail an upload that already committed.
pub fn record_event(conn: &Connection, actor: &Actor, event: Event) {
    let detalles = event.detalles.map(render);
    let metadata = event.metadata.map(render);
    let res = conn.execute(
        "INSERT INTO audit_logs(user_id, user_email, user_rol, accion, modulo,
                                entidad_tipo, entidad_id, detalles, metadata)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        (
            actor.id,
            actor.email.as_deref(),
            actor.rol.as_deref(),
            event.accion,
            event.modulo,
            event.entidad_tipo,
            event.entidad_id.as_deref(),
            detalles.as_deref(),
            metadata.as_deref(),
        ),
    );
    if let Err(e) = res {
        warn!("audit write failed (accion={}): {}", event.accion, e);
    }
}

fn render(v: Value) -> String {
    match v {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Newest-first history of evidence uploads (wide and single-column), with
/// the counts map pulled back out of the stored metadata.
pub fn uploads_history(conn: &Connection, limit: i64) -> anyhow::Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, created_at, metadata, detalles FROM audit_logs
         WHERE accion = 'upload' AND modulo = 'evidencias'
         ORDER BY created_at DESC, id DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], |r| {
        Ok((
            r.get::<_, i64>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, Option<String>>(2)?,
            r.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, fecha, metadata_raw, detalles) = row?;
        let metadata: Value = metadata_raw
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(Value::Null);
        let counts = metadata.get("counts").cloned().unwrap_or_else(|| json!({}));
        let registros = counts.get("tot_registros").cloned().unwrap_or(Value::Null);
        out.push(json!({
            "id": id,
            "fecha": fecha,
            "fichaNumero": metadata.get("ficha_numero").cloned().unwrap_or(Value::Null),
            "fichaId": metadata.get("ficha_id").cloned().unwrap_or(Value::Null),
            "materiaId": metadata.get("materia_id").cloned().unwrap_or(Value::Null),
            "detalles": detalles,
            "modo": metadata.get("modo").cloned().unwrap_or(Value::Null),
            "evidenciaNombre": metadata.get("evidencia_nombre").cloned().unwrap_or(Value::Null),
            "counts": counts,
            "registros": registros,
        }));
    }
    Ok(out)
}

/// Bounded newest-first read over the append-only log.
pub fn list(
    conn: &Connection,
    accion: Option<&str>,
    modulo: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<Value>> {
    let mut filters: Vec<&str> = Vec::new();
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(a) = accion {
        filters.push("accion = ?");
        bind.push(SqlValue::Text(a.to_string()));
    }
    if let Some(m) = modulo {
        filters.push("modulo = ?");
        bind.push(SqlValue::Text(m.to_string()));
    }
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", filters.join(" AND "))
    };
    bind.push(SqlValue::Integer(limit));

    let sql = format!(
        "SELECT id, user_id, user_email, user_rol, accion, modulo,
                entidad_tipo, entidad_id, detalles, metadata, created_at
         FROM audit_logs {} ORDER BY created_at DESC, id DESC LIMIT ?",
        where_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(bind), |r| {
        Ok(json!({
            "id": r.get::<_, i64>(0)?,
            "userId": r.get::<_, Option<i64>>(1)?,
            "userEmail": r.get::<_, Option<String>>(2)?,
            "userRol": r.get::<_, Option<String>>(3)?,
            "accion": r.get::<_, String>(4)?,
            "modulo": r.get::<_, Option<String>>(5)?,
            "entidadTipo": r.get::<_, Option<String>>(6)?,
            "entidadId": r.get::<_, Option<String>>(7)?,
            "detalles": r.get::<_, Option<String>>(8)?,
            "metadata": r.get::<_, Option<String>>(9)?,
            "createdAt": r.get::<_, String>(10)?,
        }))
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
