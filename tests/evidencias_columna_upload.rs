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

fn error_code(value: &serde_json::Value) -> &str {
    value["error"]["code"].as_str().unwrap_or("")
}

fn error_message(value: &serde_json::Value) -> &str {
    value["error"]["message"].as_str().unwrap_or("")
}

#[test]
fn missing_name_or_rows_reject_as_bad_params() {
    let workspace = temp_dir("academd-columna-params");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let resp = call(&mut stdin, &mut reader, "2", "evidencias.uploadColumna", json!({}));
    assert_eq!(error_code(&resp), "bad_params");
    assert!(error_message(&resp).contains("evidencia_nombre requerido"));

    let resp = call(
        &mut stdin,
        &mut reader,
        "3",
        "evidencias.uploadColumna",
        json!({ "evidenciaNombre": "Taller 1" }),
    );
    assert_eq!(error_code(&resp), "bad_params");
    assert!(error_message(&resp).contains("rows vacío"));

    let resp = call(
        &mut stdin,
        &mut reader,
        "4",
        "evidencias.uploadColumna",
        json!({ "evidenciaNombre": "Taller 1", "rows": [] }),
    );
    assert_eq!(error_code(&resp), "bad_params");
    assert!(error_message(&resp).contains("rows vacío"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn synonym_values_fold_and_invalid_values_persist_as_pendiente() {
    let workspace = temp_dir("academd-columna-fold");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let result = call_ok(
        &mut stdin,
        &mut reader,
        "2",
        "evidencias.uploadColumna",
        json!({
            "evidenciaNombre": "Taller 1",
            "rows": [
                { "documento": "1001", "estudiante": "Ana Pérez", "valor": "Aprobado" },
                { "documento": "1002", "estudiante": "Beto Ruiz", "valor": "reprobado" },
                { "documento": "1003", "estudiante": "Caro Díaz", "valor": "No entregó" },
                { "documento": "1004", "estudiante": "Dana Gil", "valor": "" },
                { "documento": "1005", "estudiante": "Eli Mora", "valor": "tal vez" }
            ]
        }),
    );
    // The junk token is reported but its row still lands as Pendiente.
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["insertados"], json!(5));
    let counts = &result["counts"];
    assert_eq!(counts["A"], json!(1));
    assert_eq!(counts["D"], json!(1));
    assert_eq!(counts["-"], json!(1));
    assert_eq!(counts["Pendiente"], json!(2));
    assert_eq!(counts["tot_registros"], json!(5));
    // No materia was linked, so the calificaciones mirror stays untouched.
    assert_eq!(result["detalle"]["inserted"], json!(0));
    assert_eq!(result["detalle"]["updated"], json!(0));
    let errores = result["errores"].as_array().expect("errores");
    assert_eq!(errores.len(), 1);
    assert!(errores[0]
        .as_str()
        .unwrap_or("")
        .contains("Valor inválido 'tal vez' para 1005"));
    assert!(!result["batchId"].as_str().unwrap_or("").is_empty());

    let listed = call_ok(&mut stdin, &mut reader, "3", "evidencias.list", json!({}));
    let rows = listed
        .get("evidencias")
        .and_then(|v| v.as_array())
        .expect("evidencias");
    assert_eq!(rows.len(), 5);
    let by_doc = |doc: &str| -> &serde_json::Value {
        rows.iter()
            .find(|r| r["documento"] == json!(doc))
            .unwrap_or_else(|| panic!("row for {doc}"))
    };
    assert_eq!(by_doc("1001")["letra"], json!("A"));
    assert_eq!(by_doc("1001")["estado"], json!("Aprobado"));
    assert_eq!(by_doc("1002")["letra"], json!("D"));
    assert_eq!(by_doc("1003")["letra"], json!("-"));
    assert_eq!(by_doc("1003")["estado"], json!("No entregó"));
    assert_eq!(by_doc("1004")["estado"], json!("Pendiente"));
    assert!(by_doc("1005")["letra"].is_null());
    assert_eq!(by_doc("1005")["estado"], json!("Pendiente"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn correo_stands_in_for_missing_documento_and_nombre() {
    let workspace = temp_dir("academd-columna-correo");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let result = call_ok(
        &mut stdin,
        &mut reader,
        "2",
        "evidencias.uploadColumna",
        json!({
            "evidenciaNombre": "Foro 1",
            "rows": [
                { "correo": "fabi@x.edu", "valor": "A" },
                { "valor": "A" }
            ]
        }),
    );
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["insertados"], json!(1));
    assert_eq!(result["counts"]["tot_registros"], json!(1));
    let errores = result["errores"].as_array().expect("errores");
    assert!(errores
        .iter()
        .any(|e| e.as_str().unwrap_or("").contains("Documento vacío en fila")));

    let students = call_ok(&mut stdin, &mut reader, "3", "estudiantes.list", json!({}));
    let students = students
        .get("estudiantes")
        .and_then(|v| v.as_array())
        .expect("estudiantes");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["documento"], json!("fabi@x.edu"));
    assert_eq!(students[0]["nombre"], json!("fabi@x.edu"));
    assert_eq!(students[0]["correo"], json!("fabi@x.edu"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn linked_materia_mirrors_rows_and_provisions_definition() {
    let workspace = temp_dir("academd-columna-materia");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let materia = call_ok(
        &mut stdin,
        &mut reader,
        "2",
        "materias.create",
        json!({ "codigo": "MAT-101", "nombre": "Matemáticas" }),
    );
    let materia_id = materia.get("id").and_then(|v| v.as_i64()).expect("materia id");
    let ficha = call_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fichas.create",
        json!({ "numero": "2824901", "nombre": "ADSI" }),
    );
    let ficha_id = ficha.get("id").and_then(|v| v.as_i64()).expect("ficha id");

    let payload = json!({
        "evidenciaNombre": "Taller 1",
        "materiaId": materia_id,
        "fichaId": ficha_id,
        "rows": [
            { "documento": "1001", "estudiante": "Ana Pérez", "valor": "A" },
            { "documento": "1002", "estudiante": "Beto Ruiz", "valor": "D" }
        ]
    });
    let result = call_ok(
        &mut stdin,
        &mut reader,
        "4",
        "evidencias.uploadColumna",
        payload.clone(),
    );
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["insertados"], json!(2));
    assert_eq!(result["detalle"]["inserted"], json!(2));
    assert_eq!(result["detalle"]["updated"], json!(0));

    let cals = call_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calificaciones.list",
        json!({ "materiaId": materia_id }),
    );
    let cals = cals
        .get("calificaciones")
        .and_then(|v| v.as_array())
        .expect("calificaciones");
    assert_eq!(cals.len(), 2);
    let ana = cals
        .iter()
        .find(|c| c["estudianteDocumento"] == json!("1001"))
        .expect("ana mirror");
    assert_eq!(ana["evidenciaNombre"], json!("Taller 1"));
    assert_eq!(ana["trimestre"], json!(1));
    assert!(ana["nota"].is_null());
    assert_eq!(ana["letra"], json!("A"));
    assert_eq!(ana["estado"], json!("Aprobado"));
    assert_eq!(ana["fichaId"], json!(ficha_id));

    let defs = call_ok(
        &mut stdin,
        &mut reader,
        "6",
        "definiciones.list",
        json!({ "materiaId": materia_id }),
    );
    let defs = defs
        .get("definiciones")
        .and_then(|v| v.as_array())
        .expect("definiciones");
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0]["nombre"], json!("Taller 1"));
    assert_eq!(defs[0]["activa"], json!(false));

    let students = call_ok(&mut stdin, &mut reader, "7", "estudiantes.list", json!({}));
    let students = students
        .get("estudiantes")
        .and_then(|v| v.as_array())
        .expect("estudiantes");
    assert!(students.iter().all(|s| s["fichaId"] == json!(ficha_id)));

    // Same batch again: the mirror flips to updates, nothing duplicates.
    let again = call_ok(
        &mut stdin,
        &mut reader,
        "8",
        "evidencias.uploadColumna",
        payload,
    );
    assert_eq!(again["detalle"]["inserted"], json!(0));
    assert_eq!(again["detalle"]["updated"], json!(2));
    let cals = call_ok(
        &mut stdin,
        &mut reader,
        "9",
        "calificaciones.list",
        json!({ "materiaId": materia_id }),
    );
    assert_eq!(
        cals.get("calificaciones")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_ficha_degrades_to_unassigned_upload() {
    let workspace = temp_dir("academd-columna-ficha");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let result = call_ok(
        &mut stdin,
        &mut reader,
        "2",
        "evidencias.uploadColumna",
        json!({
            "evidenciaNombre": "Foro 1",
            "fichaId": 999,
            "rows": [{ "documento": "1001", "estudiante": "Ana Pérez", "valor": "A" }]
        }),
    );
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["insertados"], json!(1));
    let errores = result["errores"].as_array().expect("errores");
    assert!(errores.iter().any(|e| e
        .as_str()
        .unwrap_or("")
        .contains("Ficha id=999 no existe; se continúa sin asignar ficha")));

    let students = call_ok(&mut stdin, &mut reader, "3", "estudiantes.list", json!({}));
    let students = students
        .get("estudiantes")
        .and_then(|v| v.as_array())
        .expect("estudiantes");
    assert_eq!(students.len(), 1);
    assert!(students[0]["fichaId"].is_null());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
