use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let p = std::env::temp_dir().join(format!("{}-{}", prefix, nanos));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_academd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn academd");
    let stdin = child.stdin.take().expect("stdin pipe");
    let stdout = child.stdout.take().expect("stdout pipe");
    (child, stdin, BufReader::new(stdout))
}

fn call(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let msg = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", msg).expect("write request");
    stdin.flush().expect("flush request");

    let mut reply = String::new();
    reader.read_line(&mut reply).expect("read response line");
    assert!(!reply.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value =
        serde_json::from_str(reply.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn call_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = call(stdin, reader, id, method, params);
    let ok = value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    assert!(ok, "{} failed: {}", method, value);
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

const COLUMNS: &[&str] = &[
    "materia_codigo",
    "ficha_numero",
    "estudiante_nombre",
    "estudiante_documento",
    "trimestre",
    "nota",
];

#[test]
fn unresolvable_rows_are_skipped_and_reported() {
    let workspace = temp_dir("academd-cal-partial");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fichas.create",
        json!({ "numero": "2824901", "nombre": "ADSI" }),
    );
    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "3",
        "materias.create",
        json!({ "codigo": "MAT-101", "nombre": "Matemáticas" }),
    );

    let resp = call_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calificaciones.upload",
        json!({ "table": {
            "columns": COLUMNS,
            "rows": [
                ["MAT-101", "2824901", "Ana Pérez", "1001", 1, "A"],
                ["NOPE-999", "2824901", "Beto Ruiz", "1002", 1, "A"],
                ["MAT-101", "9999999", "Caro Díaz", "1003", 1, "A"],
                ["MAT-101", "2824901", "Dana Gil", "1004", 1, "F"]
            ]
        }}),
    );
    // Two rows resolve, two report; the resolvable ones still commit.
    assert_eq!(resp["stats"]["processed"], json!(2));
    assert_eq!(resp["stats"]["inserted"], json!(2));
    let errors = resp["stats"]["resolutionErrors"]
        .as_array()
        .expect("resolution errors");
    assert_eq!(errors.len(), 2);
    assert!(errors[0]
        .as_str()
        .unwrap_or("")
        .contains("Fila 3: materia no encontrada"));
    assert!(errors[1]
        .as_str()
        .unwrap_or("")
        .contains("Fila 4: ficha no encontrada"));

    let listed = call_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calificaciones.list",
        json!({}),
    );
    let rows = listed
        .get("calificaciones")
        .and_then(|v| v.as_array())
        .expect("rows");
    assert_eq!(rows.len(), 2);
    let docs: Vec<&str> = rows
        .iter()
        .filter_map(|r| r.get("estudianteDocumento").and_then(|v| v.as_str()))
        .collect();
    assert!(docs.contains(&"1001"));
    assert!(docs.contains(&"1004"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn batch_with_no_resolvable_rows_is_rejected() {
    let workspace = temp_dir("academd-cal-norows");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    // Catalog left empty on purpose: nothing can resolve.
    let resp = call(
        &mut stdin,
        &mut reader,
        "2",
        "calificaciones.upload",
        json!({ "table": {
            "columns": COLUMNS,
            "rows": [
                ["MAT-101", "2824901", "Ana Pérez", "1001", 1, "A"],
                ["MAT-101", "2824901", "Beto Ruiz", "1002", 1, "F"]
            ]
        }}),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp["error"]["code"].as_str(),
        Some("no_rows_resolved"),
        "unexpected error: {}",
        resp
    );
    let errors = resp["error"]["details"]["resolutionErrors"]
        .as_array()
        .expect("resolution errors");
    assert_eq!(errors.len(), 2);

    let listed = call_ok(
        &mut stdin,
        &mut reader,
        "3",
        "calificaciones.list",
        json!({}),
    );
    assert_eq!(
        listed
            .get("calificaciones")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn trusted_ids_and_numeric_text_cells_resolve() {
    let workspace = temp_dir("academd-cal-trustedids");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ficha = call_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fichas.create",
        json!({ "numero": "2824901", "nombre": "ADSI" }),
    );
    let ficha_id = ficha.get("id").and_then(|v| v.as_i64()).expect("ficha id");
    let materia = call_ok(
        &mut stdin,
        &mut reader,
        "3",
        "materias.create",
        json!({ "codigo": "MAT-101", "nombre": "Matemáticas" }),
    );
    let materia_id = materia.get("id").and_then(|v| v.as_i64()).expect("materia id");

    // Spreadsheets hand ids over as floats ("1.0"); both id columns accept
    // that form.
    let resp = call_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calificaciones.upload",
        json!({ "table": {
            "columns": [
                "materia_id", "ficha_id", "estudiante_nombre",
                "estudiante_documento", "trimestre", "nota"
            ],
            "rows": [
                [format!("{}.0", materia_id), ficha_id, "Ana Pérez", "1001", 1, "A"]
            ]
        }}),
    );
    assert_eq!(resp["stats"]["processed"], json!(1));
    assert_eq!(resp["stats"]["inserted"], json!(1));

    let listed = call_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calificaciones.list",
        json!({ "materiaId": materia_id }),
    );
    let rows = listed
        .get("calificaciones")
        .and_then(|v| v.as_array())
        .expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["fichaId"], json!(ficha_id));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
