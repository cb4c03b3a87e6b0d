use crate::grades::Category;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_category_param(req: &Request) -> Result<Category, serde_json::Value> {
    let Some(raw) = req.params.get("category").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "bad_params", "missing category", None));
    };
    match Category::parse(raw) {
        Some(cat) => Ok(cat),
        None => Err(err(
            &req.id,
            "bad_params",
            "category must be one of: quiz, test, homework",
            Some(json!({ "category": raw })),
        )),
    }
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing title", None),
    };
    if title.is_empty() {
        return err(&req.id, "bad_params", "title must not be empty", None);
    }
    let category = match parse_category_param(req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    // A template with zero questions is valid (total points 0 at link time).
    let questions = match req.params.get("questions") {
        None => Vec::new(),
        Some(v) => {
            let Some(arr) = v.as_array() else {
                return err(&req.id, "bad_params", "questions must be an array", None);
            };
            let mut parsed: Vec<(String, f64)> = Vec::with_capacity(arr.len());
            for (i, q) in arr.iter().enumerate() {
                let prompt = q
                    .get("prompt")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let Some(points) = q.get("points").and_then(|v| v.as_f64()) else {
                    return err(
                        &req.id,
                        "bad_params",
                        "each question needs a numeric points value",
                        Some(json!({ "index": i })),
                    );
                };
                if points < 0.0 {
                    return err(
                        &req.id,
                        "validation_failed",
                        "question point values must not be negative",
                        Some(json!({ "index": i, "points": points })),
                    );
                }
                parsed.push((prompt, points));
            }
            parsed
        }
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO assignments(id, title, category) VALUES(?, ?, ?)",
        (&assignment_id, &title, category.as_str()),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }

    let mut question_ids: Vec<String> = Vec::with_capacity(questions.len());
    for (i, (prompt, points)) in questions.iter().enumerate() {
        let question_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO assignment_questions(id, assignment_id, question_number, prompt, point_value)
             VALUES(?, ?, ?, ?, ?)",
            (&question_id, &assignment_id, (i + 1) as i64, prompt, points),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "assignment_questions" })),
            );
        }
        question_ids.push(question_id);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "assignmentId": assignment_id,
            "title": title,
            "category": category,
            "questionIds": question_ids
        }),
    )
}

fn handle_assignments_link_to_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let assignment_id = match req.params.get("assignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assignmentId", None),
    };
    let due_date = match req.params.get("dueDate") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(s) = v.as_str() else {
                return err(&req.id, "bad_params", "dueDate must be a string", None);
            };
            if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
                return err(
                    &req.id,
                    "bad_params",
                    "dueDate must be an ISO date (YYYY-MM-DD)",
                    Some(json!({ "dueDate": s })),
                );
            }
            Some(s.to_string())
        }
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

    let assignment_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assignment_exists.is_none() {
        return err(&req.id, "not_found", "assignment not found", None);
    }

    // Re-linking the same pair is an error, never a silent upsert.
    let already: Option<String> = match conn
        .query_row(
            "SELECT id FROM class_assignments WHERE class_id = ? AND assignment_id = ?",
            (&class_id, &assignment_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(existing) = already {
        return err(
            &req.id,
            "duplicate_link",
            "assignment is already linked to this class",
            Some(json!({ "classAssignmentId": existing })),
        );
    }

    // Snapshot of the template's current point total; later question edits
    // do not flow back into this link.
    let total_points: f64 = match conn.query_row(
        "SELECT COALESCE(SUM(point_value), 0)
         FROM assignment_questions
         WHERE assignment_id = ?",
        [&assignment_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let link_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_assignments(id, class_id, assignment_id, due_date, total_points)
         VALUES(?, ?, ?, ?, ?)",
        (&link_id, &class_id, &assignment_id, &due_date, total_points),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "class_assignments" })),
        );
    }

    ok(
        &req.id,
        json!({
            "classAssignmentId": link_id,
            "totalPoints": total_points,
            "dueDate": due_date
        }),
    )
}

fn handle_assignments_unlink(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let link_id = match req.params.get("classAssignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classAssignmentId", None),
    };

    let link: Option<(String, String)> = match conn
        .query_row(
            "SELECT class_id, assignment_id FROM class_assignments WHERE id = ?",
            [&link_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_id, assignment_id)) = link else {
        return err(&req.id, "not_found", "class assignment not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Scores relevant to this link are the ones of this class's students on
    // this template's questions.
    if let Err(e) = tx.execute(
        "DELETE FROM question_scores
         WHERE student_id IN (SELECT student_id FROM roster WHERE class_id = ?)
           AND question_id IN (
             SELECT id FROM assignment_questions WHERE assignment_id = ?
           )",
        [&class_id, &assignment_id],
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
        "DELETE FROM assignment_times WHERE class_assignment_id = ?",
        [&link_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignment_times" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM class_assignments WHERE id = ?", [&link_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "class_assignments" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_assignments_questions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let assignment_id = match req.params.get("assignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assignmentId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "assignment not found", None);
    }

    let mut stmt = match conn.prepare(
        "SELECT id, question_number, prompt, point_value
         FROM assignment_questions
         WHERE assignment_id = ?
         ORDER BY question_number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&assignment_id], |row| {
            let id: String = row.get(0)?;
            let question_number: i64 = row.get(1)?;
            let prompt: String = row.get(2)?;
            let point_value: f64 = row.get(3)?;
            Ok(json!({
                "questionId": id,
                "questionNumber": question_number,
                "prompt": prompt,
                "pointValue": point_value
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(questions) => ok(&req.id, json!({ "questions": questions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_list_for_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let category = match req.params.get("category") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(raw) = v.as_str() else {
                return err(&req.id, "bad_params", "category must be a string", None);
            };
            match Category::parse(raw) {
                Some(cat) => Some(cat),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "category must be one of: quiz, test, homework",
                        Some(json!({ "category": raw })),
                    )
                }
            }
        }
    };

    let sql = "SELECT ca.id, a.id, a.title, a.category, ca.due_date, ca.total_points
               FROM class_assignments ca
               JOIN assignments a ON a.id = ca.assignment_id
               WHERE ca.class_id = ?
               ORDER BY ca.due_date IS NULL, ca.due_date, a.title";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&class_id], |row| {
            let link_id: String = row.get(0)?;
            let assignment_id: String = row.get(1)?;
            let title: String = row.get(2)?;
            let category: String = row.get(3)?;
            let due_date: Option<String> = row.get(4)?;
            let total_points: f64 = row.get(5)?;
            Ok((link_id, assignment_id, title, category, due_date, total_points))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let assignments: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|(_, _, _, cat, _, _)| match category {
            Some(wanted) => Category::parse(cat) == Some(wanted),
            None => true,
        })
        .map(
            |(link_id, assignment_id, title, category, due_date, total_points)| {
                json!({
                    "classAssignmentId": link_id,
                    "assignmentId": assignment_id,
                    "title": title,
                    "category": category,
                    "dueDate": due_date,
                    "totalPoints": total_points
                })
            },
        )
        .collect();

    ok(&req.id, json!({ "assignments": assignments }))
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let assignment_id = match req.params.get("assignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assignmentId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "assignment not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM question_scores
         WHERE question_id IN (
           SELECT id FROM assignment_questions WHERE assignment_id = ?
         )",
        [&assignment_id],
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
         WHERE class_assignment_id IN (
           SELECT id FROM class_assignments WHERE assignment_id = ?
         )",
        [&assignment_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignment_times" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM class_assignments WHERE assignment_id = ?",
        [&assignment_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "class_assignments" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM assignment_questions WHERE assignment_id = ?",
        [&assignment_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignment_questions" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.linkToClass" => Some(handle_assignments_link_to_class(state, req)),
        "assignments.unlink" => Some(handle_assignments_unlink(state, req)),
        "assignments.questions" => Some(handle_assignments_questions(state, req)),
        "assignments.listForClass" => Some(handle_assignments_list_for_class(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        _ => None,
    }
}
