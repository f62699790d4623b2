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

fn grade_table() -> serde_json::Value {
    json!({
        "columns": [
            "materia_codigo", "ficha_numero", "estudiante_nombre",
            "estudiante_documento", "trimestre", "nota", "estado", "observaciones"
        ],
        "rows": [
            ["MAT-101", "2824901", "Ana Pérez", "1001", 1, "A", "", ""],
            ["MAT-101", "2824901", "Beto Ruiz", "1002", 1, "2,5", "", ""],
            ["MAT-101", "2824901", "Caro Díaz", "1003", 1, "-", "", ""],
            ["MAT-101", "2824901", "Dana Gil", "1004", 1, "", "", ""]
        ]
    })
}

#[test]
fn upload_persists_and_reupload_updates_in_place() {
    let workspace = temp_dir("academd-cal-upload");
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
    let materia = call_ok(
        &mut stdin,
        &mut reader,
        "3",
        "materias.create",
        json!({ "codigo": "MAT-101", "nombre": "Matemáticas" }),
    );
    let materia_id = materia.get("id").and_then(|v| v.as_i64()).expect("materia id");

    let first = call_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calificaciones.upload",
        json!({ "table": grade_table(), "filename": "notas.xlsx" }),
    );
    assert_eq!(first["stats"]["processed"], json!(4));
    assert_eq!(first["stats"]["inserted"], json!(4));
    assert_eq!(first["stats"]["updated"], json!(0));
    assert_eq!(first["counts"]["A"], json!(1));
    assert_eq!(first["counts"]["D"], json!(1));
    assert_eq!(first["counts"]["-"], json!(1));
    assert_eq!(first["counts"]["Pendiente"], json!(1));
    assert_eq!(first["counts"]["tot_registros"], json!(4));
    assert!(first
        .get("batchId")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false));

    // Same natural keys arrive again: rows update, none duplicate.
    let second = call_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calificaciones.upload",
        json!({ "table": grade_table() }),
    );
    assert_eq!(second["stats"]["inserted"], json!(0));
    assert_eq!(second["stats"]["updated"], json!(4));
    assert_eq!(second["counts"]["tot_registros"], json!(4));

    let listed = call_ok(
        &mut stdin,
        &mut reader,
        "6",
        "calificaciones.list",
        json!({ "materiaId": materia_id }),
    );
    let rows = listed
        .get("calificaciones")
        .and_then(|v| v.as_array())
        .expect("calificaciones array");
    assert_eq!(rows.len(), 4);

    let by_doc = |doc: &str| {
        rows.iter()
            .find(|r| r.get("estudianteDocumento").and_then(|v| v.as_str()) == Some(doc))
            .cloned()
            .unwrap_or_else(|| panic!("row for documento {}", doc))
    };
    let ana = by_doc("1001");
    assert_eq!(ana["nota"], json!(5.0));
    assert_eq!(ana["letra"], json!("A"));
    assert_eq!(ana["estado"], json!("Aprobado"));

    let beto = by_doc("1002");
    assert_eq!(beto["nota"], json!(2.5));
    assert_eq!(beto["letra"], json!("F"));
    assert_eq!(beto["estado"], json!("Reprobado"));

    let caro = by_doc("1003");
    assert_eq!(caro["nota"], json!(null));
    assert_eq!(caro["letra"], json!("-"));
    assert_eq!(caro["estado"], json!("No entregó"));

    let dana = by_doc("1004");
    assert_eq!(dana["nota"], json!(null));
    assert_eq!(dana["estado"], json!("Cursando"));

    // Ingestion provisioned the students on the side.
    let students = call_ok(&mut stdin, &mut reader, "7", "estudiantes.list", json!({}));
    let students = students
        .get("estudiantes")
        .and_then(|v| v.as_array())
        .expect("estudiantes array");
    assert_eq!(students.len(), 4);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn changed_grade_overwrites_previous_value() {
    let workspace = temp_dir("academd-cal-overwrite");
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
    let materia = call_ok(
        &mut stdin,
        &mut reader,
        "3",
        "materias.create",
        json!({ "codigo": "MAT-101", "nombre": "Matemáticas" }),
    );
    let materia_id = materia.get("id").and_then(|v| v.as_i64()).expect("materia id");

    let columns = json!([
        "materia_codigo", "ficha_numero", "estudiante_nombre",
        "estudiante_documento", "trimestre", "nota"
    ]);
    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calificaciones.upload",
        json!({ "table": {
            "columns": columns,
            "rows": [["MAT-101", "2824901", "Ana Pérez", "1001", 1, "4,5"]]
        }}),
    );
    let corrected = call_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calificaciones.upload",
        json!({ "table": {
            "columns": columns,
            "rows": [["MAT-101", "2824901", "Ana Pérez", "1001", 1, "1,0"]]
        }}),
    );
    assert_eq!(corrected["stats"]["updated"], json!(1));

    let listed = call_ok(
        &mut stdin,
        &mut reader,
        "6",
        "calificaciones.list",
        json!({ "materiaId": materia_id, "documento": "1001" }),
    );
    let rows = listed
        .get("calificaciones")
        .and_then(|v| v.as_array())
        .expect("calificaciones array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["nota"], json!(1.0));
    assert_eq!(rows[0]["estado"], json!("Reprobado"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn export_rows_cover_uploaded_grades_with_derived_letters() {
    let workspace = temp_dir("academd-cal-export");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Nothing uploaded yet: the exporter refuses instead of producing an
    // empty sheet.
    let empty = call(
        &mut stdin,
        &mut reader,
        "2",
        "calificaciones.exportRows",
        json!({}),
    );
    assert_eq!(empty.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        empty
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fichas.create",
        json!({ "numero": "2824901", "nombre": "ADSI" }),
    );
    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "4",
        "materias.create",
        json!({ "codigo": "MAT-101", "nombre": "Matemáticas" }),
    );
    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calificaciones.upload",
        json!({ "table": grade_table() }),
    );

    let export = call_ok(
        &mut stdin,
        &mut reader,
        "6",
        "calificaciones.exportRows",
        json!({}),
    );
    let columns = export
        .get("columns")
        .and_then(|v| v.as_array())
        .expect("export columns");
    assert_eq!(columns[0], json!("materia_id"));
    assert_eq!(export["filename"], json!("calificaciones_export.xlsx"));
    let rows = export
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("export rows");
    assert_eq!(rows.len(), 4);
    // Row cells follow the column order; letra is derived for numeric rows.
    let beto = rows
        .iter()
        .find(|r| r.get(3).and_then(|v| v.as_str()) == Some("1002"))
        .expect("beto row");
    assert_eq!(beto[5], json!(2.5));
    assert_eq!(beto[6], json!("F"));

    let filtered = call_ok(
        &mut stdin,
        &mut reader,
        "7",
        "calificaciones.exportRows",
        json!({ "estado": "Aprobado" }),
    );
    let filtered_rows = filtered
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("filtered rows");
    assert_eq!(filtered_rows.len(), 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn template_reflects_registered_catalog() {
    let workspace = temp_dir("academd-cal-template");
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

    let with_codes = call_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calificaciones.template",
        json!({}),
    );
    let columns = with_codes
        .get("columns")
        .and_then(|v| v.as_array())
        .expect("template columns");
    assert_eq!(columns[0], json!("materia_codigo"));
    assert_eq!(columns[1], json!("ficha_numero"));
    let rows = with_codes
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("template rows");
    assert_eq!(rows[0][0], json!("MAT-101"));
    assert_eq!(rows[0][1], json!("2824901"));

    let with_ids = call_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calificaciones.template",
        json!({ "usarCodigos": false }),
    );
    let columns = with_ids
        .get("columns")
        .and_then(|v| v.as_array())
        .expect("template columns");
    assert_eq!(columns[0], json!("materia_id"));
    assert_eq!(with_ids["filename"], json!("plantilla_calificaciones_ids.xlsx"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
