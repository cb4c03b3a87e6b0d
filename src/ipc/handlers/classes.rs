use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_date_param(
    req: &Request,
    key: &str,
) -> Result<Option<String>, (String, serde_json::Value)> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err((
                    format!("{} must be a string", key),
                    json!({ "param": key }),
                ));
            };
            match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                Ok(_) => Ok(Some(s.to_string())),
                Err(_) => Err((
                    format!("{} must be an ISO date (YYYY-MM-DD)", key),
                    json!({ "param": key, "value": s }),
                )),
            }
        }
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let term_start = match parse_date_param(req, "termStart") {
        Ok(v) => v,
        Err((msg, details)) => return err(&req.id, "bad_params", msg, Some(details)),
    };
    let term_end = match parse_date_param(req, "termEnd") {
        Ok(v) => v,
        Err((msg, details)) => return err(&req.id, "bad_params", msg, Some(details)),
    };
    if let (Some(start), Some(end)) = (&term_start, &term_end) {
        // ISO dates compare correctly as strings once both parsed.
        if end < start {
            return err(
                &req.id,
                "validation_failed",
                "termEnd must not be earlier than termStart",
                Some(json!({ "termStart": start, "termEnd": end })),
            );
        }
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, term_start, term_end) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &term_start, &term_end),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Include basic counts so the UI can show a useful dashboard.
    // Use correlated subqueries to avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.term_start,
           c.term_end,
           (SELECT COUNT(*) FROM roster r WHERE r.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM class_assignments ca WHERE ca.class_id = c.id) AS assignment_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let term_start: Option<String> = row.get(2)?;
            let term_end: Option<String> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            let assignment_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "termStart": term_start,
                "termEnd": term_end,
                "studentCount": student_count,
                "assignmentCount": assignment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    // Scores are scoped to this class through both the roster and the
    // question -> template -> link chain, so scores a second class still
    // reads through a shared template survive.
    if let Err(e) = tx.execute(
        "DELETE FROM question_scores
         WHERE student_id IN (SELECT student_id FROM roster WHERE class_id = ?)
           AND question_id IN (
             SELECT q.id
             FROM assignment_questions q
             JOIN class_assignments ca ON ca.assignment_id = q.assignment_id
             WHERE ca.class_id = ?
           )",
        [&class_id, &class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "question_scores" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM assignment_times
         WHERE class_assignment_id IN (SELECT id FROM class_assignments WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignment_times" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM category_weights WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "category_weights" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM class_assignments WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "class_assignments" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM roster WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "roster" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_roster_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let student_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    // Idempotent: re-enrolling hands back the existing roster entry. This is
    // deliberately asymmetric with assignments.linkToClass, which rejects
    // duplicates.
    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM roster WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(roster_id) = existing {
        return ok(&req.id, json!({ "rosterId": roster_id, "created": false }));
    }

    let roster_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO roster(id, class_id, student_id) VALUES(?, ?, ?)",
        (&roster_id, &class_id, &student_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "roster" })),
        );
    }

    ok(&req.id, json!({ "rosterId": roster_id, "created": true }))
}

fn handle_roster_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT r.id, s.id, s.student_number, s.first_name, s.last_name
         FROM roster r
         JOIN students s ON s.id = r.student_id
         WHERE r.class_id = ?
         ORDER BY s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&class_id], |row| {
            let roster_id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let student_number: String = row.get(2)?;
            let first_name: String = row.get(3)?;
            let last_name: String = row.get(4)?;
            Ok(json!({
                "rosterId": roster_id,
                "studentId": student_id,
                "studentNumber": student_number,
                "firstName": first_name,
                "lastName": last_name
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        "roster.enroll" => Some(handle_roster_enroll(state, req)),
        "roster.list" => Some(handle_roster_list(state, req)),
        _ => None,
    }
}
