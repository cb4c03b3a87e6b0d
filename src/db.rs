use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            term_start TEXT,
            term_end TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_number TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS roster(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(class_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_roster_class ON roster(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_roster_student ON roster(student_id)",
        [],
    )?;

    // Reusable templates. Category is the lowercase enum string
    // (quiz/test/homework); handlers reject anything else on the way in.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            category TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_questions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            question_number INTEGER NOT NULL,
            prompt TEXT NOT NULL DEFAULT '',
            point_value REAL NOT NULL,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            UNIQUE(assignment_id, question_number)
        )",
        [],
    )?;
    // Workspaces created before prompts were stored lack the column.
    ensure_questions_prompt(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignment_questions_assignment
         ON assignment_questions(assignment_id)",
        [],
    )?;

    // total_points is fixed at link time: the sum of the template's question
    // point values when the link was created. Editing questions afterwards
    // does NOT update existing links.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_assignments(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            assignment_id TEXT NOT NULL,
            due_date TEXT,
            total_points REAL NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            UNIQUE(class_id, assignment_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_assignments_class
         ON class_assignments(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_assignments_assignment
         ON class_assignments(assignment_id)",
        [],
    )?;

    // One row per (student, question); re-recording overwrites in place.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS question_scores(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            points REAL NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(question_id) REFERENCES assignment_questions(id),
            UNIQUE(student_id, question_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_question_scores_student
         ON question_scores(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_question_scores_question
         ON question_scores(question_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_times(
            class_assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            seconds INTEGER NOT NULL,
            PRIMARY KEY(class_assignment_id, student_id),
            FOREIGN KEY(class_assignment_id) REFERENCES class_assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignment_times_student
         ON assignment_times(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS category_weights(
            class_id TEXT NOT NULL,
            category TEXT NOT NULL,
            weight REAL NOT NULL,
            PRIMARY KEY(class_id, category),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_questions_prompt(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assignment_questions", "prompt")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE assignment_questions ADD COLUMN prompt TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
