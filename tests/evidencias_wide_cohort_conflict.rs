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

#[test]
fn upload_into_another_cohort_is_rejected_before_writing() {
    let workspace = temp_dir("academd-wide-conflict");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ficha_a = call_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fichas.create",
        json!({ "numero": "1111111", "nombre": "ADSI Mañana" }),
    );
    let ficha_a_id = ficha_a.get("id").and_then(|v| v.as_i64()).expect("ficha a id");
    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fichas.create",
        json!({ "numero": "2222222", "nombre": "ADSI Tarde" }),
    );

    // Ana lands in the first cohort through a normal upload.
    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "4",
        "evidencias.uploadWide",
        json!({
            "fichaNumero": "1111111",
            "table": {
                "columns": ["Correo", "Nombre", "Guía 1 (Letra)"],
                "rows": [["ana@x.edu", "Ana Pérez", "A"]]
            }
        }),
    );

    let crossed = json!({
        "columns": ["Correo", "Nombre", "Guía 2 (Letra)"],
        "rows": [
            ["ana@x.edu", "Ana Pérez", "D"],
            ["beto@x.edu", "Beto Ruiz", "A"]
        ]
    });

    // A dry run reports shape and counts; membership is a write-time check.
    let preview = call_ok(
        &mut stdin,
        &mut reader,
        "5",
        "evidencias.uploadWide",
        json!({ "fichaNumero": "2222222", "dryRun": true, "table": crossed }),
    );
    assert_eq!(preview["success"], json!(true));

    let resp = call(
        &mut stdin,
        &mut reader,
        "6",
        "evidencias.uploadWide",
        json!({ "fichaNumero": "2222222", "table": crossed }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("structural_error"));
    let message = resp["error"]["message"].as_str().unwrap_or("");
    assert!(message.contains("Conflictos de ficha"));
    assert!(message.contains(&format!("ana@x.edu (ficha_id={})", ficha_a_id)));
    let conflictos = resp["error"]["details"]["conflictos"]
        .as_array()
        .expect("conflictos");
    assert_eq!(conflictos.len(), 1);

    // Nothing from the rejected batch landed: no second evidence, no second
    // student, ana still in her cohort.
    let listed = call_ok(&mut stdin, &mut reader, "7", "evidencias.list", json!({}));
    let rows = listed
        .get("evidencias")
        .and_then(|v| v.as_array())
        .expect("evidencias");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["evidenciaNombre"], json!("guia 1"));

    let students = call_ok(&mut stdin, &mut reader, "8", "estudiantes.list", json!({}));
    let students = students
        .get("estudiantes")
        .and_then(|v| v.as_array())
        .expect("estudiantes");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["fichaId"], json!(ficha_a_id));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reupload_into_same_cohort_is_not_a_conflict() {
    let workspace = temp_dir("academd-wide-samecohort");
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
        json!({ "numero": "1111111", "nombre": "ADSI" }),
    );

    let table = json!({
        "columns": ["Correo", "Nombre", "Guía 1 (Letra)"],
        "rows": [["ana@x.edu", "Ana Pérez", "A"]]
    });
    let _ = call_ok(
        &mut stdin,
        &mut reader,
        "3",
        "evidencias.uploadWide",
        json!({ "fichaNumero": "1111111", "table": table }),
    );
    let again = call_ok(
        &mut stdin,
        &mut reader,
        "4",
        "evidencias.uploadWide",
        json!({ "fichaNumero": "1111111", "table": table }),
    );
    assert_eq!(again["success"], json!(true));
    assert_eq!(again["detalle"]["updated"], json!(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
