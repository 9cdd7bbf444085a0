//! Label metadata in SQLite.

use identikit_core::{Label, LabelMetadata, MetadataStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS label_metadata (
    label       TEXT PRIMARY KEY NOT NULL,
    title       TEXT,
    case_ref    TEXT,
    sex         TEXT,
    age         TEXT,
    address     TEXT,
    notes       TEXT,
    updated_at  TEXT NOT NULL
);
";

const COLUMNS: &str = "label, title, case_ref, sex, age, address, notes, updated_at";

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

pub struct SqliteMetadata {
    conn: Connection,
}

impl SqliteMetadata {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self { conn })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(String, LabelMetadata)> {
        Ok((
            row.get(0)?,
            LabelMetadata {
                title: row.get(1)?,
                case_ref: row.get(2)?,
                sex: row.get(3)?,
                age: row.get(4)?,
                address: row.get(5)?,
                notes: row.get(6)?,
                updated_at: row.get(7)?,
            },
        ))
    }
}

impl MetadataStore for SqliteMetadata {
    fn get(&self, label: &Label) -> Result<Option<LabelMetadata>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM label_metadata WHERE label = ?1"),
                params![label.as_str()],
                Self::from_row,
            )
            .optional()
            .map(|row| row.map(|(_, md)| md))
            .map_err(db_err)
    }

    fn upsert(
        &mut self,
        label: &Label,
        update: &LabelMetadata,
    ) -> Result<LabelMetadata, StoreError> {
        let mut merged = self.get(label)?.unwrap_or_default();
        merged.merge(update);
        merged.updated_at = Some(chrono::Utc::now().to_rfc3339());

        self.conn
            .execute(
                "INSERT INTO label_metadata (label, title, case_ref, sex, age, address, notes, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(label) DO UPDATE SET
                    title = excluded.title,
                    case_ref = excluded.case_ref,
                    sex = excluded.sex,
                    age = excluded.age,
                    address = excluded.address,
                    notes = excluded.notes,
                    updated_at = excluded.updated_at",
                params![
                    label.as_str(),
                    merged.title,
                    merged.case_ref,
                    merged.sex,
                    merged.age,
                    merged.address,
                    merged.notes,
                    merged.updated_at,
                ],
            )
            .map_err(db_err)?;
        tracing::debug!(%label, "metadata stored");
        Ok(merged)
    }

    fn delete(&mut self, label: &Label) -> Result<(), StoreError> {
        self.conn
            .execute(
                "DELETE FROM label_metadata WHERE label = ?1",
                params![label.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn all(&self) -> Result<BTreeMap<Label, LabelMetadata>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM label_metadata"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], Self::from_row).map_err(db_err)?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (name, md) = row.map_err(db_err)?;
            match Label::new(&name) {
                Ok(label) => {
                    out.insert(label, md);
                }
                Err(e) => tracing::warn!(label = %name, error = %e, "skipping metadata row"),
            }
        }
        Ok(out)
    }
}
