//! SQLite persistence layer.
//!
//! Stores durable subject records (local identities) and site sessions.
//! Uses WAL mode for concurrent reads during writes.

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

/// A durable local identity.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectRow {
    pub id: i64,
    pub email: String,
    /// `reader` by default; `administrator` and `editor` exist so the
    /// exchange path can refuse them.
    pub role: String,
    /// Token-subject binding. Set once on first successful verification,
    /// immutable afterwards.
    pub external_sub: Option<String>,
    /// Unix timestamp of registration.
    pub registered_at: i64,
}

impl SubjectRow {
    pub fn is_elevated(&self) -> bool {
        matches!(self.role.as_str(), "administrator" | "editor")
    }
}

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &str) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> SqlResult<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS subjects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL DEFAULT 'reader',
                external_sub TEXT,
                registered_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                subject_id INTEGER NOT NULL REFERENCES subjects(id),
                created_at INTEGER NOT NULL
            );",
        )
    }

    pub fn find_subject_by_email(&self, email: &str) -> SqlResult<Option<SubjectRow>> {
        self.conn
            .query_row(
                "SELECT id, email, role, external_sub, registered_at
                 FROM subjects WHERE email = ?1",
                params![email],
                row_to_subject,
            )
            .optional()
    }

    pub fn find_subject_by_id(&self, id: i64) -> SqlResult<Option<SubjectRow>> {
        self.conn
            .query_row(
                "SELECT id, email, role, external_sub, registered_at
                 FROM subjects WHERE id = ?1",
                params![id],
                row_to_subject,
            )
            .optional()
    }

    pub fn insert_subject(&self, email: &str, role: &str, registered_at: i64) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO subjects (email, role, registered_at) VALUES (?1, ?2, ?3)",
            params![email, role, registered_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// First write wins: the binding is immutable once set.
    pub fn bind_external_sub(&self, subject_id: i64, sub: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE subjects SET external_sub = ?1
             WHERE id = ?2 AND external_sub IS NULL",
            params![sub, subject_id],
        )?;
        Ok(())
    }

    pub fn set_role(&self, subject_id: i64, role: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE subjects SET role = ?1 WHERE id = ?2",
            params![role, subject_id],
        )?;
        Ok(())
    }

    pub fn insert_session(&self, token: &str, subject_id: i64, created_at: i64) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO sessions (token, subject_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, subject_id, created_at],
        )?;
        Ok(())
    }

    pub fn subject_for_session(&self, token: &str) -> SqlResult<Option<SubjectRow>> {
        self.conn
            .query_row(
                "SELECT s.id, s.email, s.role, s.external_sub, s.registered_at
                 FROM sessions n JOIN subjects s ON s.id = n.subject_id
                 WHERE n.token = ?1",
                params![token],
                row_to_subject,
            )
            .optional()
    }
}

fn row_to_subject(row: &rusqlite::Row<'_>) -> SqlResult<SubjectRow> {
    Ok(SubjectRow {
        id: row.get(0)?,
        email: row.get(1)?,
        role: row.get(2)?,
        external_sub: row.get(3)?,
        registered_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_roundtrip_and_unique_email() {
        let db = Db::open_in_memory().unwrap();
        let id = db.insert_subject("reader@example.com", "reader", 1000).unwrap();
        let row = db.find_subject_by_email("reader@example.com").unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.role, "reader");
        assert_eq!(row.external_sub, None);
        assert!(db.insert_subject("reader@example.com", "reader", 1001).is_err());
    }

    #[test]
    fn external_sub_binding_is_immutable() {
        let db = Db::open_in_memory().unwrap();
        let id = db.insert_subject("reader@example.com", "reader", 1000).unwrap();
        db.bind_external_sub(id, "sub-1").unwrap();
        db.bind_external_sub(id, "sub-2").unwrap();
        let row = db.find_subject_by_id(id).unwrap().unwrap();
        assert_eq!(row.external_sub.as_deref(), Some("sub-1"));
    }

    #[test]
    fn session_lookup() {
        let db = Db::open_in_memory().unwrap();
        let id = db.insert_subject("reader@example.com", "reader", 1000).unwrap();
        db.insert_session("tok-1", id, 2000).unwrap();
        let row = db.subject_for_session("tok-1").unwrap().unwrap();
        assert_eq!(row.id, id);
        assert!(db.subject_for_session("tok-2").unwrap().is_none());
    }
}
