use crate::grades::{self, Category, GradeContext};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn parse_pair(req: &Request) -> Result<(String, String), serde_json::Value> {
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return Err(err(&req.id, "bad_params", "missing classId", None)),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return Err(err(&req.id, "bad_params", "missing studentId", None)),
    };
    Ok((class_id, student_id))
}

fn handle_grades_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (class_id, student_id) = match parse_pair(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let ctx = GradeContext {
        conn,
        class_id: &class_id,
        student_id: &student_id,
    };
    match grades::compute_grade_report(&ctx) {
        Ok(report) => match serde_json::to_value(&report) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_grades_final(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (class_id, student_id) = match parse_pair(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let ctx = GradeContext {
        conn,
        class_id: &class_id,
        student_id: &student_id,
    };
    match grades::compute_grade_report(&ctx) {
        Ok(report) => ok(
            &req.id,
            json!({ "weightedPercentage": report.weighted_percentage }),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_grades_raw_total(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (class_id, student_id) = match parse_pair(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let ctx = GradeContext {
        conn,
        class_id: &class_id,
        student_id: &student_id,
    };
    match grades::compute_grade_report(&ctx) {
        Ok(report) => ok(
            &req.id,
            json!({ "weightedRawTotal": report.weighted_raw_total }),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_grades_category_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (class_id, student_id) = match parse_pair(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let category = match req.params.get("category").and_then(|v| v.as_str()) {
        Some(raw) => match Category::parse(raw) {
            Some(cat) => cat,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "category must be one of: quiz, test, homework",
                    Some(json!({ "category": raw })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing category", None),
    };

    let ctx = GradeContext {
        conn,
        class_id: &class_id,
        student_id: &student_id,
    };
    match grades::compute_category_score(&ctx, category) {
        Ok(percent) => ok(&req.id, json!({ "category": category, "percent": percent })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

/// One row per enrolled student: the per-category percentages plus the
/// weighted final. This is the whole final-grade table in a single request.
fn handle_grades_class_table(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.student_number, s.first_name, s.last_name
         FROM roster r
         JOIN students s ON s.id = r.student_id
         WHERE r.class_id = ?
         ORDER BY s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = stmt
        .query_map([&class_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let students = match students {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut rows = Vec::with_capacity(students.len());
    for (student_id, student_number, first_name, last_name) in students {
        let ctx = GradeContext {
            conn,
            class_id: &class_id,
            student_id: &student_id,
        };
        let report = match grades::compute_grade_report(&ctx) {
            Ok(r) => r,
            Err(e) => return err(&req.id, &e.code, e.message, e.details),
        };

        let mut categories = serde_json::Map::new();
        for t in &report.per_category {
            categories.insert(
                t.category.as_str().to_string(),
                json!({ "percent": t.percent, "weight": t.weight }),
            );
        }
        rows.push(json!({
            "studentId": student_id,
            "studentNumber": student_number,
            "firstName": first_name,
            "lastName": last_name,
            "categories": categories,
            "weightedPercentage": report.weighted_percentage,
            "weightedRawTotal": report.weighted_raw_total
        }));
    }

    ok(&req.id, json!({ "rows": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.report" => Some(handle_grades_report(state, req)),
        "grades.final" => Some(handle_grades_final(state, req)),
        "grades.rawTotal" => Some(handle_grades_raw_total(state, req)),
        "grades.categoryScore" => Some(handle_grades_category_score(state, req)),
        "grades.classTable" => Some(handle_grades_class_table(state, req)),
        _ => None,
    }
}
