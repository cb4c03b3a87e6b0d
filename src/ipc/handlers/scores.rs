use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

/// One row per (student, question); re-recording the same question
/// overwrites in place. Values are stored as given: scores above the
/// question's point value (or below zero) are a caller policy, not ours.
fn upsert_score(
    conn: &Connection,
    student_id: &str,
    question_id: &str,
    points: f64,
) -> Result<(), HandlerErr> {
    let score_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO question_scores(id, student_id, question_id, points)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id, question_id) DO UPDATE SET
           points = excluded.points",
        (&score_id, student_id, question_id, points),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "question_scores" })),
    })?;
    Ok(())
}

fn upsert_time(
    conn: &Connection,
    class_assignment_id: &str,
    student_id: &str,
    seconds: i64,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO assignment_times(class_assignment_id, student_id, seconds)
         VALUES(?, ?, ?)
         ON CONFLICT(class_assignment_id, student_id) DO UPDATE SET
           seconds = excluded.seconds",
        (class_assignment_id, student_id, seconds),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "assignment_times" })),
    })?;
    Ok(())
}

fn require_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }
    Ok(())
}

fn lookup_link(
    conn: &Connection,
    class_assignment_id: &str,
) -> Result<(String, String), HandlerErr> {
    let link: Option<(String, String)> = conn
        .query_row(
            "SELECT class_id, assignment_id FROM class_assignments WHERE id = ?",
            [class_assignment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    link.ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "class assignment not found".to_string(),
        details: None,
    })
}

fn assignment_total(
    conn: &Connection,
    student_id: &str,
    assignment_id: &str,
) -> Result<f64, HandlerErr> {
    // Missing score rows contribute 0 via the LEFT JOIN.
    conn.query_row(
        "SELECT COALESCE(SUM(qs.points), 0)
         FROM assignment_questions q
         LEFT JOIN question_scores qs
           ON qs.question_id = q.id AND qs.student_id = ?
         WHERE q.assignment_id = ?",
        (student_id, assignment_id),
        |r| r.get(0),
    )
    .map_err(db_err)
}

fn handle_scores_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let question_id = match req.params.get("questionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing questionId", None),
    };
    let points = match req.params.get("points").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing numeric points", None),
    };

    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }
    let question_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignment_questions WHERE id = ?",
            [&question_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if question_exists.is_none() {
        return err(&req.id, "not_found", "question not found", None);
    }

    if let Err(e) = upsert_score(conn, &student_id, &question_id, points) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "points": points }))
}

fn handle_scores_record_full(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let link_id = match req.params.get("classAssignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classAssignmentId", None),
    };
    let entries = match req.params.get("scores").and_then(|v| v.as_array()) {
        Some(v) => v.clone(),
        None => return err(&req.id, "bad_params", "missing scores array", None),
    };
    let seconds = match req.params.get("seconds") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Some(n),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "seconds must be a non-negative integer",
                    None,
                )
            }
        },
    };

    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }
    let (class_id, assignment_id) = match lookup_link(conn, &link_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Scores belong to an enrollment; recording against a class the student
    // is not on the roster of is an integrity failure.
    let enrolled: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM roster WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrolled.is_none() {
        return err(
            &req.id,
            "not_enrolled",
            "student is not enrolled in this class",
            None,
        );
    }

    let mut parsed: Vec<(String, f64)> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let Some(question_id) = entry.get("questionId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                "each score needs a questionId",
                Some(json!({ "index": i })),
            );
        };
        let Some(points) = entry.get("points").and_then(|v| v.as_f64()) else {
            return err(
                &req.id,
                "bad_params",
                "each score needs a numeric points value",
                Some(json!({ "index": i })),
            );
        };

        let belongs: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM assignment_questions WHERE id = ? AND assignment_id = ?",
                (question_id, &assignment_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if belongs.is_none() {
            return err(
                &req.id,
                "not_found",
                "question does not belong to this assignment",
                Some(json!({ "questionId": question_id })),
            );
        }
        parsed.push((question_id.to_string(), points));
    }

    // One transaction so a partial failure cannot leave the recorded total
    // out of step with the per-question rows.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    for (question_id, points) in &parsed {
        if let Err(e) = upsert_score(&tx, &student_id, question_id, *points) {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    }
    if let Some(seconds) = seconds {
        if let Err(e) = upsert_time(&tx, &link_id, &student_id, seconds) {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    }

    let total = match assignment_total(&tx, &student_id, &assignment_id) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "classAssignmentId": link_id,
            "assignmentTotal": total,
            "recorded": parsed.len()
        }),
    )
}

fn handle_scores_for_assignment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let link_id = match req.params.get("classAssignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classAssignmentId", None),
    };

    let (_, assignment_id) = match lookup_link(conn, &link_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Nothing recorded yet is an empty list, not an error; callers treat a
    // missing row as 0.
    let mut stmt = match conn.prepare(
        "SELECT q.id, q.question_number, q.point_value, qs.points
         FROM assignment_questions q
         JOIN question_scores qs
           ON qs.question_id = q.id AND qs.student_id = ?
         WHERE q.assignment_id = ?
         ORDER BY q.question_number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&student_id, &assignment_id), |row| {
            let question_id: String = row.get(0)?;
            let question_number: i64 = row.get(1)?;
            let point_value: f64 = row.get(2)?;
            let points: f64 = row.get(3)?;
            Ok(json!({
                "questionId": question_id,
                "questionNumber": question_number,
                "pointValue": point_value,
                "points": points
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(scores) => ok(&req.id, json!({ "scores": scores })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_time_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let link_id = match req.params.get("classAssignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classAssignmentId", None),
    };
    let seconds = match req.params.get("seconds").and_then(|v| v.as_i64()) {
        Some(v) if v >= 0 => v,
        _ => {
            return err(
                &req.id,
                "bad_params",
                "seconds must be a non-negative integer",
                None,
            )
        }
    };

    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }
    if let Err(e) = lookup_link(conn, &link_id) {
        return e.response(&req.id);
    }

    if let Err(e) = upsert_time(conn, &link_id, &student_id, seconds) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "seconds": seconds }))
}

fn handle_time_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let link_id = match req.params.get("classAssignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classAssignmentId", None),
    };

    let seconds: Option<i64> = match conn
        .query_row(
            "SELECT seconds FROM assignment_times
             WHERE class_assignment_id = ? AND student_id = ?",
            (&link_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "seconds": seconds.unwrap_or(0) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.record" => Some(handle_scores_record(state, req)),
        "scores.recordFull" => Some(handle_scores_record_full(state, req)),
        "scores.forAssignment" => Some(handle_scores_for_assignment(state, req)),
        "time.record" => Some(handle_time_record(state, req)),
        "time.get" => Some(handle_time_get(state, req)),
        _ => None,
    }
}
