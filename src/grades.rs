use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Closed set of assignment categories. Adding a category means extending
/// this enum (and CATEGORIES) in one place; the free-form strings of older
/// gradebooks are rejected at the IPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Quiz,
    Test,
    Homework,
}

pub const CATEGORIES: [Category; 3] = [Category::Quiz, Category::Test, Category::Homework];

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Quiz => "quiz",
            Category::Test => "test",
            Category::Homework => "homework",
        }
    }

    pub fn parse(s: &str) -> Option<Category> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quiz" => Some(Category::Quiz),
            "test" => Some(Category::Test),
            "homework" => Some(Category::Homework),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GradeError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GradeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradeContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub student_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentTotal {
    pub class_assignment_id: String,
    pub assignment_id: String,
    pub title: String,
    pub category: Category,
    pub due_date: Option<String>,
    pub total_points: f64,
    pub points_earned: f64,
    pub seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryTotal {
    pub category: Category,
    pub earned: f64,
    pub max_points: f64,
    pub weight: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeReport {
    pub class_id: String,
    pub student_id: String,
    #[serde(rename = "perAssignment")]
    pub per_assignment: Vec<AssignmentTotal>,
    #[serde(rename = "perCategory")]
    pub per_category: Vec<CategoryTotal>,
    pub weighted_percentage: f64,
    pub weighted_raw_total: f64,
}

/// Percentage for one category: earned over max. A category with nothing
/// linked (max 0) reads as 0, not as a division error.
pub fn category_percent(earned: f64, max_points: f64) -> f64 {
    if max_points > 0.0 {
        100.0 * earned / max_points
    } else {
        0.0
    }
}

/// Weighted final grade as a percentage.
///
/// Only categories with linked assignments (max > 0) enter the sum and the
/// weight denominator; an unused category's configured weight must not drag
/// the grade down. Scores are taken as stored, so out-of-range inputs
/// produce out-of-range outputs.
pub fn weighted_percentage(totals: &[CategoryTotal]) -> f64 {
    let mut sum = 0.0_f64;
    let mut total_weight = 0.0_f64;
    for t in totals {
        if t.max_points <= 0.0 {
            continue;
        }
        sum += (t.earned / t.max_points) * t.weight;
        total_weight += t.weight;
    }
    if total_weight > 0.0 {
        sum / total_weight * 100.0
    } else {
        0.0
    }
}

/// Raw mode: absolute points earned per category, each multiplied by its
/// configured weight. Answers "weighted points", not "percentage"; the two
/// are deliberately separate operations.
pub fn weighted_raw_total(totals: &[CategoryTotal]) -> f64 {
    totals.iter().map(|t| t.earned * t.weight).sum()
}

fn require_enrollment(ctx: &GradeContext<'_>) -> Result<(), GradeError> {
    let class_exists: Option<i64> = ctx
        .conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [ctx.class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;
    if class_exists.is_none() {
        return Err(GradeError::new("not_found", "class not found"));
    }

    let student_exists: Option<i64> = ctx
        .conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ?",
            [ctx.student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;
    if student_exists.is_none() {
        return Err(GradeError::new("not_found", "student not found"));
    }

    let enrolled: Option<i64> = ctx
        .conn
        .query_row(
            "SELECT 1 FROM roster WHERE class_id = ? AND student_id = ?",
            (ctx.class_id, ctx.student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;
    if enrolled.is_none() {
        return Err(GradeError::new(
            "not_enrolled",
            "student is not enrolled in this class",
        ));
    }
    Ok(())
}

pub fn weights_for_class(
    conn: &Connection,
    class_id: &str,
) -> Result<HashMap<Category, f64>, GradeError> {
    let mut stmt = conn
        .prepare("SELECT category, weight FROM category_weights WHERE class_id = ?")
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;

    let mut weights = HashMap::new();
    for (raw, weight) in rows {
        if let Some(cat) = Category::parse(&raw) {
            weights.insert(cat, weight);
        }
    }
    Ok(weights)
}

fn load_assignment_totals(ctx: &GradeContext<'_>) -> Result<Vec<AssignmentTotal>, GradeError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT ca.id, ca.assignment_id, a.title, a.category, ca.due_date, ca.total_points
             FROM class_assignments ca
             JOIN assignments a ON a.id = ca.assignment_id
             WHERE ca.class_id = ?
             ORDER BY ca.due_date IS NULL, ca.due_date, a.title",
        )
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;
    let links = stmt
        .query_map([ctx.class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, f64>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;

    // One aggregate pass for this student's earned points per linked
    // assignment. Missing score rows simply never show up here and read 0.
    let mut earned_by_link: HashMap<String, f64> = HashMap::new();
    let mut earned_stmt = ctx
        .conn
        .prepare(
            "SELECT ca.id, COALESCE(SUM(qs.points), 0)
             FROM class_assignments ca
             JOIN assignment_questions q ON q.assignment_id = ca.assignment_id
             LEFT JOIN question_scores qs
               ON qs.question_id = q.id AND qs.student_id = ?
             WHERE ca.class_id = ?
             GROUP BY ca.id",
        )
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;
    let earned_rows = earned_stmt
        .query_map((ctx.student_id, ctx.class_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;
    for (link_id, earned) in earned_rows {
        earned_by_link.insert(link_id, earned);
    }

    let mut seconds_by_link: HashMap<String, i64> = HashMap::new();
    let mut time_stmt = ctx
        .conn
        .prepare(
            "SELECT t.class_assignment_id, t.seconds
             FROM assignment_times t
             JOIN class_assignments ca ON ca.id = t.class_assignment_id
             WHERE ca.class_id = ? AND t.student_id = ?",
        )
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;
    let time_rows = time_stmt
        .query_map((ctx.class_id, ctx.student_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| GradeError::new("db_query_failed", e.to_string()))?;
    for (link_id, seconds) in time_rows {
        seconds_by_link.insert(link_id, seconds);
    }

    let mut totals = Vec::with_capacity(links.len());
    for (link_id, assignment_id, title, raw_category, due_date, total_points) in links {
        let Some(category) = Category::parse(&raw_category) else {
            return Err(GradeError::new(
                "bad_category",
                format!("unknown category in store: {}", raw_category),
            ));
        };
        let points_earned = earned_by_link.get(&link_id).copied().unwrap_or(0.0);
        let seconds = seconds_by_link.get(&link_id).copied().unwrap_or(0);
        totals.push(AssignmentTotal {
            class_assignment_id: link_id,
            assignment_id,
            title,
            category,
            due_date,
            total_points,
            points_earned,
            seconds,
        });
    }
    Ok(totals)
}

fn roll_up_categories(
    per_assignment: &[AssignmentTotal],
    weights: &HashMap<Category, f64>,
) -> Vec<CategoryTotal> {
    let mut earned: HashMap<Category, f64> = HashMap::new();
    let mut max: HashMap<Category, f64> = HashMap::new();
    for a in per_assignment {
        *earned.entry(a.category).or_insert(0.0) += a.points_earned;
        *max.entry(a.category).or_insert(0.0) += a.total_points;
    }

    CATEGORIES
        .iter()
        .map(|&cat| {
            let earned = earned.get(&cat).copied().unwrap_or(0.0);
            let max_points = max.get(&cat).copied().unwrap_or(0.0);
            CategoryTotal {
                category: cat,
                earned,
                max_points,
                weight: weights.get(&cat).copied().unwrap_or(0.0),
                percent: category_percent(earned, max_points),
            }
        })
        .collect()
}

/// Full roll-up for one enrollment: per-assignment totals, per-category
/// totals, and both weighted grades. Stateless; recomputed on every call
/// from the current store snapshot.
pub fn compute_grade_report(ctx: &GradeContext<'_>) -> Result<GradeReport, GradeError> {
    require_enrollment(ctx)?;

    let per_assignment = load_assignment_totals(ctx)?;
    let weights = weights_for_class(ctx.conn, ctx.class_id)?;
    let per_category = roll_up_categories(&per_assignment, &weights);

    let weighted_percentage = weighted_percentage(&per_category);
    let weighted_raw_total = weighted_raw_total(&per_category);

    Ok(GradeReport {
        class_id: ctx.class_id.to_string(),
        student_id: ctx.student_id.to_string(),
        per_assignment,
        per_category,
        weighted_percentage,
        weighted_raw_total,
    })
}

/// The gradebook-table column value: this student's percentage in one
/// category, independent of any weighting.
pub fn compute_category_score(
    ctx: &GradeContext<'_>,
    category: Category,
) -> Result<f64, GradeError> {
    let report = compute_grade_report(ctx)?;
    Ok(report
        .per_category
        .iter()
        .find(|t| t.category == category)
        .map(|t| t.percent)
        .unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(category: Category, earned: f64, max_points: f64, weight: f64) -> CategoryTotal {
        CategoryTotal {
            category,
            earned,
            max_points,
            weight,
            percent: category_percent(earned, max_points),
        }
    }

    #[test]
    fn full_marks_single_category_is_100() {
        // Math101: one quiz out of 20, full marks, weights 0.2/0.3/0.5 but
        // homework/test have nothing linked.
        let totals = vec![
            total(Category::Quiz, 20.0, 20.0, 0.2),
            total(Category::Homework, 0.0, 0.0, 0.3),
            total(Category::Test, 0.0, 0.0, 0.5),
        ];
        assert!((weighted_percentage(&totals) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_scores_single_category_is_0() {
        let totals = vec![
            total(Category::Quiz, 0.0, 20.0, 0.2),
            total(Category::Homework, 0.0, 0.0, 0.3),
            total(Category::Test, 0.0, 0.0, 0.5),
        ];
        assert_eq!(weighted_percentage(&totals), 0.0);
    }

    #[test]
    fn two_categories_blend_by_weight() {
        // 10/20 quiz at 0.4 plus 50/50 test at 0.6 => 80.
        let totals = vec![
            total(Category::Quiz, 10.0, 20.0, 0.4),
            total(Category::Test, 50.0, 50.0, 0.6),
        ];
        assert!((weighted_percentage(&totals) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn empty_category_weight_does_not_enter_denominator() {
        let with_unused = vec![
            total(Category::Quiz, 15.0, 20.0, 0.4),
            total(Category::Homework, 0.0, 0.0, 0.6),
        ];
        let without = vec![total(Category::Quiz, 15.0, 20.0, 0.4)];
        assert_eq!(
            weighted_percentage(&with_unused),
            weighted_percentage(&without)
        );
    }

    #[test]
    fn no_weights_at_all_yields_zero() {
        let totals = vec![total(Category::Quiz, 18.0, 20.0, 0.0)];
        assert_eq!(weighted_percentage(&totals), 0.0);
    }

    #[test]
    fn weights_need_not_sum_to_one() {
        // Same ratio of weights as 0.4/0.6 scaled by 5; the normalized
        // result must not change.
        let totals = vec![
            total(Category::Quiz, 10.0, 20.0, 2.0),
            total(Category::Test, 50.0, 50.0, 3.0),
        ];
        assert!((weighted_percentage(&totals) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn unclamped_scores_can_exceed_100() {
        // Scores above a question's point value pass through untouched.
        let totals = vec![total(Category::Quiz, 25.0, 20.0, 1.0)];
        assert!(weighted_percentage(&totals) > 100.0);
    }

    #[test]
    fn raw_total_multiplies_earned_by_weight() {
        let totals = vec![
            total(Category::Quiz, 20.0, 20.0, 0.2),
            total(Category::Homework, 10.0, 30.0, 0.3),
        ];
        assert!((weighted_raw_total(&totals) - (20.0 * 0.2 + 10.0 * 0.3)).abs() < 1e-9);
    }

    #[test]
    fn raw_total_ignores_missing_weight() {
        let totals = vec![total(Category::Test, 40.0, 50.0, 0.0)];
        assert_eq!(weighted_raw_total(&totals), 0.0);
    }

    #[test]
    fn category_percent_guards_zero_max() {
        assert_eq!(category_percent(0.0, 0.0), 0.0);
        assert!((category_percent(5.0, 10.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn category_parse_is_case_insensitive_and_closed() {
        assert_eq!(Category::parse("Quiz"), Some(Category::Quiz));
        assert_eq!(Category::parse(" homework "), Some(Category::Homework));
        assert_eq!(Category::parse("project"), None);
        assert_eq!(Category::parse(""), None);
    }
}
