use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("academia.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Imports hold the write lock for the whole batch; concurrent openers
    // (e.g. a second daemon on the same workspace) wait instead of failing.
    conn.busy_timeout(Duration::from_millis(5000))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fichas(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            numero TEXT NOT NULL UNIQUE,
            nombre TEXT NOT NULL,
            estado TEXT NOT NULL DEFAULT 'Activa',
            coordinador_id INTEGER,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS materias(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            codigo TEXT NOT NULL UNIQUE,
            nombre TEXT NOT NULL,
            creditos INTEGER,
            horas_semana INTEGER,
            ficha_id INTEGER,
            docente_id INTEGER,
            estado TEXT NOT NULL DEFAULT 'Activa',
            competencia TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT,
            FOREIGN KEY(ficha_id) REFERENCES fichas(id)
        )",
        [],
    )?;
    ensure_materias_competencia(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_materias_ficha ON materias(ficha_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            nombre TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            rol TEXT NOT NULL,
            activo INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Students are keyed by their document string, not a surrogate id; the
    // grade tables reference the document loosely (no FK) because the re-key
    // heuristic moves a student and their narrow rows to a new document.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS estudiantes(
            documento TEXT PRIMARY KEY,
            nombre TEXT NOT NULL,
            apellido TEXT NOT NULL DEFAULT '',
            correo TEXT,
            ficha_id INTEGER,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT,
            FOREIGN KEY(ficha_id) REFERENCES fichas(id)
        )",
        [],
    )?;
    ensure_estudiantes_apellido(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_estudiantes_ficha ON estudiantes(ficha_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evidencia_definicion(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            nombre TEXT NOT NULL,
            ficha_id INTEGER,
            materia_id INTEGER NOT NULL,
            docente_id INTEGER,
            activa INTEGER NOT NULL DEFAULT 0,
            semana_activacion INTEGER,
            fecha_activacion TEXT,
            tipo TEXT,
            peso REAL,
            porcentaje REAL,
            orden INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY(materia_id) REFERENCES materias(id),
            UNIQUE(materia_id, nombre)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evidencia_definicion_materia
         ON evidencia_definicion(materia_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evidencias(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            documento TEXT NOT NULL,
            evidencia_nombre TEXT NOT NULL,
            letra TEXT,
            estado TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT,
            UNIQUE(documento, evidencia_nombre)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evidencias_documento ON evidencias(documento)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calificaciones(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            materia_id INTEGER NOT NULL,
            ficha_id INTEGER,
            estudiante_nombre TEXT NOT NULL,
            estudiante_documento TEXT NOT NULL,
            evidencia_nombre TEXT NOT NULL DEFAULT '',
            trimestre INTEGER NOT NULL,
            nota REAL,
            letra TEXT,
            estado TEXT NOT NULL,
            observaciones TEXT,
            fecha_carga TEXT,
            cargado_por INTEGER,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT,
            FOREIGN KEY(materia_id) REFERENCES materias(id),
            FOREIGN KEY(ficha_id) REFERENCES fichas(id)
        )",
        [],
    )?;
    // Older workspaces carried subject-level grades only; the evidence-name
    // column joined the natural key later. '' means "no specific evidence"
    // so the unique index stays enforceable (NULLs are distinct in SQLite).
    ensure_calificaciones_evidencia_nombre(&conn)?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_calificaciones_natural_key
         ON calificaciones(materia_id, estudiante_documento, evidencia_nombre, trimestre)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calificaciones_documento
         ON calificaciones(estudiante_documento)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calificaciones_ficha ON calificaciones(ficha_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_logs(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER,
            user_email TEXT,
            user_rol TEXT,
            accion TEXT NOT NULL,
            modulo TEXT,
            entidad_tipo TEXT,
            entidad_id TEXT,
            detalles TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_logs_accion_modulo
         ON audit_logs(accion, modulo)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_materias_competencia(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "materias", "competencia")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE materias ADD COLUMN competencia TEXT", [])?;
    Ok(())
}

fn ensure_estudiantes_apellido(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "estudiantes", "apellido")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE estudiantes ADD COLUMN apellido TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

fn ensure_calificaciones_evidencia_nombre(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "calificaciones", "evidencia_nombre")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE calificaciones ADD COLUMN evidencia_nombre TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    // Malformed historical values read as absent; the next update rewrites them.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}
