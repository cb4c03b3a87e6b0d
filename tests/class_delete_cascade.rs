use rusqlite::Connection;
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

fn request_ok(
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

fn count(conn: &Connection, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    conn.query_row(&sql, [], |r| r.get(0)).expect("count")
}

#[test]
fn deleting_a_class_removes_every_dependent_record() {
    let workspace = temp_dir("gradebook-cascade");
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
        json!({ "name": "Geography", "termStart": "2025-09-01", "termEnd": "2026-01-31" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "studentNumber": "S555", "firstName": "Hannah", "lastName": "Ivers" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "roster.enroll",
        json!({ "classId": class_id, "studentId": student_id }),
    );

    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.create",
        json!({
            "title": "Quiz 2",
            "category": "quiz",
            "questions": [{ "points": 5.0 }]
        }),
    );
    let assignment_id = assignment
        .get("assignmentId")
        .and_then(|v| v.as_str())
        .expect("assignmentId")
        .to_string();
    let question_id = assignment
        .get("questionIds")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .expect("question id")
        .to_string();
    let link = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.linkToClass",
        json!({ "classId": class_id, "assignmentId": assignment_id, "dueDate": "2025-10-15" }),
    );
    let link_id = link
        .get("classAssignmentId")
        .and_then(|v| v.as_str())
        .expect("classAssignmentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "weights.set",
        json!({ "classId": class_id, "category": "quiz", "weight": 1.0 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "scores.recordFull",
        json!({
            "studentId": student_id,
            "classAssignmentId": link_id,
            "scores": [{ "questionId": question_id, "points": 5.0 }],
            "seconds": 600
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classes.delete",
        json!({ "classId": class_id }),
    );

    drop(stdin);
    let _ = child.wait();

    let conn = Connection::open(workspace.join("gradebook.sqlite3")).expect("open db");
    assert_eq!(count(&conn, "classes"), 0);
    assert_eq!(count(&conn, "roster"), 0);
    assert_eq!(count(&conn, "class_assignments"), 0);
    assert_eq!(count(&conn, "category_weights"), 0);
    assert_eq!(count(&conn, "assignment_times"), 0);
    assert_eq!(count(&conn, "question_scores"), 0);

    // The reusable template and the student outlive the class.
    assert_eq!(count(&conn, "assignments"), 1);
    assert_eq!(count(&conn, "assignment_questions"), 1);
    assert_eq!(count(&conn, "students"), 1);
}

#[test]
fn unlinking_keeps_the_template_but_drops_scores_and_times() {
    let workspace = temp_dir("gradebook-unlink");
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
        json!({ "name": "English" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "studentNumber": "S111", "firstName": "Daisy", "lastName": "Miller" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "roster.enroll",
        json!({ "classId": class_id, "studentId": student_id }),
    );

    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.create",
        json!({ "title": "Essay 1", "category": "homework", "questions": [{ "points": 20.0 }] }),
    );
    let assignment_id = assignment
        .get("assignmentId")
        .and_then(|v| v.as_str())
        .expect("assignmentId")
        .to_string();
    let question_id = assignment
        .get("questionIds")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .expect("question id")
        .to_string();
    let link = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.linkToClass",
        json!({ "classId": class_id, "assignmentId": assignment_id }),
    );
    let link_id = link
        .get("classAssignmentId")
        .and_then(|v| v.as_str())
        .expect("classAssignmentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "scores.recordFull",
        json!({
            "studentId": student_id,
            "classAssignmentId": link_id,
            "scores": [{ "questionId": question_id, "points": 18.0 }],
            "seconds": 3600
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "assignments.unlink",
        json!({ "classAssignmentId": link_id }),
    );

    drop(stdin);
    let _ = child.wait();

    let conn = Connection::open(workspace.join("gradebook.sqlite3")).expect("open db");
    let count = |table: &str| -> i64 {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        conn.query_row(&sql, [], |r| r.get(0)).expect("count")
    };
    assert_eq!(count("class_assignments"), 0);
    assert_eq!(count("assignment_times"), 0);
    assert_eq!(count("question_scores"), 0);
    assert_eq!(count("assignments"), 1);
    assert_eq!(count("assignment_questions"), 1);
    assert_eq!(count("roster"), 1);
}
