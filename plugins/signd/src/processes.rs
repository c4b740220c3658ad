pub use crate::model::{NewProcess, Process};
use crate::{db::DbPool, housekeeping::MappingStore};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, file_id, process_id, user_id, target_dir, finished_pdf_path";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Process> {
    Ok(Process {
        id: row.get(0)?,
        file_id: row.get(1)?,
        process_id: row.get(2)?,
        user_id: row.get(3)?,
        target_dir: row.get(4)?,
        finished_pdf_path: row.get(5)?,
    })
}

/// Record a new process and return the stored row.
pub fn insert(conn: &Connection, new: &NewProcess) -> Result<Process> {
    conn.execute(
        "INSERT INTO processes (file_id, process_id, user_id, target_dir) VALUES (?1, ?2, ?3, ?4)",
        params![new.file_id, new.process_id, new.user_id, new.target_dir],
    )?;
    Ok(Process {
        id: conn.last_insert_rowid(),
        file_id: new.file_id,
        process_id: new.process_id.clone(),
        user_id: new.user_id.clone(),
        target_dir: new.target_dir.clone(),
        finished_pdf_path: None,
    })
}

/// All processes for a file, newest first.
pub fn find_by_file_id(conn: &Connection, file_id: i64) -> Result<Vec<Process>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM processes WHERE file_id = ?1 ORDER BY id DESC"
    ))?;
    let rows = stmt
        .query_map([file_id], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_all(conn: &Connection) -> Result<Vec<Process>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM processes"))?;
    let rows = stmt
        .query_map([], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Look up a process by its remote id.
pub fn find_by_process_id(conn: &Connection, process_id: &str) -> Result<Option<Process>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM processes WHERE process_id = ?1 ORDER BY id DESC LIMIT 1"
    ))?;
    let row = stmt.query_row([process_id], from_row).optional()?;
    Ok(row)
}

/// Remember where the signed PDF was stored.
pub fn set_finished_pdf_path(conn: &Connection, id: i64, path: &str) -> Result<()> {
    conn.execute(
        "UPDATE processes SET finished_pdf_path = ?1 WHERE id = ?2",
        params![path, id],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM processes WHERE id = ?1", [id])?;
    Ok(())
}

/// Pool-backed access to the mapping table.
#[derive(Clone)]
pub struct ProcessRepo {
    pool: DbPool,
}

impl ProcessRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn insert(&self, new: &NewProcess) -> Result<Process> {
        insert(&*self.pool.get()?, new)
    }

    pub fn find_by_file_id(&self, file_id: i64) -> Result<Vec<Process>> {
        find_by_file_id(&*self.pool.get()?, file_id)
    }

    pub fn find_by_process_id(&self, process_id: &str) -> Result<Option<Process>> {
        find_by_process_id(&*self.pool.get()?, process_id)
    }

    pub fn set_finished_pdf_path(&self, id: i64, path: &str) -> Result<()> {
        set_finished_pdf_path(&*self.pool.get()?, id, path)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        delete(&*self.pool.get()?, id)
    }
}

impl MappingStore for ProcessRepo {
    fn find_all(&self) -> Result<Vec<Process>> {
        find_all(&*self.pool.get()?)
    }

    fn delete(&self, process: &Process) -> Result<()> {
        delete(&*self.pool.get()?, process.id)
    }
}
