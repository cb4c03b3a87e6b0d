use crate::grades::Category;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn parse_category(req: &Request) -> Result<Category, serde_json::Value> {
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

fn handle_weights_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let category = match parse_category(req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let weight = match req.params.get("weight").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing numeric weight", None),
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

    if let Err(e) = conn.execute(
        "INSERT INTO category_weights(class_id, category, weight)
         VALUES(?, ?, ?)
         ON CONFLICT(class_id, category) DO UPDATE SET weight = excluded.weight",
        (&class_id, category.as_str(), weight),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "category_weights" })),
        );
    }

    ok(&req.id, json!({ "category": category, "weight": weight }))
}

fn handle_weights_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let category = match parse_category(req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    // Absence is not an error; an unconfigured category weighs 0.
    let weight: Option<f64> = match conn
        .query_row(
            "SELECT weight FROM category_weights WHERE class_id = ? AND category = ?",
            (&class_id, category.as_str()),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({ "category": category, "weight": weight.unwrap_or(0.0) }),
    )
}

fn handle_weights_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT category, weight FROM category_weights WHERE class_id = ? ORDER BY category",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&class_id], |row| {
            let category: String = row.get(0)?;
            let weight: f64 = row.get(1)?;
            Ok(json!({ "category": category, "weight": weight }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(weights) => ok(&req.id, json!({ "weights": weights })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "weights.set" => Some(handle_weights_set(state, req)),
        "weights.get" => Some(handle_weights_get(state, req)),
        "weights.list" => Some(handle_weights_list(state, req)),
        _ => None,
    }
}
