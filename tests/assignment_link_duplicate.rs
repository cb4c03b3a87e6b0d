use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(resp: &serde_json::Value) -> &str {
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
}

#[test]
fn second_link_of_same_pair_is_rejected() {
    let workspace = temp_dir("gradebook-duplink");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Biology" }),
    );
    let class_id = class.get("classId").and_then(|v| v.as_str()).expect("classId");
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assignments.create",
        json!({
            "title": "Homework 1",
            "category": "homework",
            "questions": [{ "points": 5.0 }, { "points": 5.0 }]
        }),
    );
    let assignment_id = assignment
        .get("assignmentId")
        .and_then(|v| v.as_str())
        .expect("assignmentId");

    let link = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.linkToClass",
        json!({ "classId": class_id, "assignmentId": assignment_id }),
    );
    assert_eq!(link.get("totalPoints").and_then(|v| v.as_f64()), Some(10.0));

    let dup = request(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.linkToClass",
        json!({ "classId": class_id, "assignmentId": assignment_id }),
    );
    assert_eq!(error_code(&dup), "duplicate_link");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn negative_question_points_are_rejected() {
    let workspace = temp_dir("gradebook-negpoints");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "assignments.create",
        json!({
            "title": "Bad Quiz",
            "category": "quiz",
            "questions": [{ "points": 5.0 }, { "points": -1.0 }]
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn zero_question_template_links_with_zero_total() {
    let workspace = temp_dir("gradebook-emptytemplate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Philosophy" }),
    );
    let class_id = class.get("classId").and_then(|v| v.as_str()).expect("classId");
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assignments.create",
        json!({ "title": "Empty Assignment", "category": "homework", "questions": [] }),
    );
    let assignment_id = assignment
        .get("assignmentId")
        .and_then(|v| v.as_str())
        .expect("assignmentId");

    let link = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.linkToClass",
        json!({ "classId": class_id, "assignmentId": assignment_id }),
    );
    assert_eq!(link.get("totalPoints").and_then(|v| v.as_f64()), Some(0.0));

    let questions = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.questions",
        json!({ "assignmentId": assignment_id }),
    );
    assert_eq!(
        questions
            .get("questions")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn link_total_is_fixed_at_link_time() {
    // The stored total is a snapshot; re-linking to a second class after the
    // fact still sums the template's current questions, but the first link
    // keeps its original total.
    let workspace = temp_dir("gradebook-snapshot");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_a = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Chemistry A" }),
    );
    let class_a_id = class_a
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId");
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assignments.create",
        json!({
            "title": "Test 1",
            "category": "test",
            "questions": [{ "points": 10.0 }, { "points": 15.0 }]
        }),
    );
    let assignment_id = assignment
        .get("assignmentId")
        .and_then(|v| v.as_str())
        .expect("assignmentId");

    let link = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.linkToClass",
        json!({ "classId": class_a_id, "assignmentId": assignment_id }),
    );
    assert_eq!(link.get("totalPoints").and_then(|v| v.as_f64()), Some(25.0));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.listForClass",
        json!({ "classId": class_a_id, "category": "test" }),
    );
    let assignments = listed
        .get("assignments")
        .and_then(|v| v.as_array())
        .expect("assignments");
    assert_eq!(assignments.len(), 1);
    assert_eq!(
        assignments[0].get("totalPoints").and_then(|v| v.as_f64()),
        Some(25.0)
    );

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.listForClass",
        json!({ "classId": class_a_id, "category": "quiz" }),
    );
    assert_eq!(
        filtered
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
}
