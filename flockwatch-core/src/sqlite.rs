use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};

/// Location and open mode of one SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteHandle {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteHandle {
    pub fn new(path: impl AsRef<Path>, read_only: bool, create_if_missing: bool) -> Self {
        let mut flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !read_only && create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Self {
            path: path.as_ref().to_path_buf(),
            flags,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags)?;
        let writable = !self.flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY);
        configure_connection(&conn, writable)?;
        Ok(conn)
    }
}

pub fn configure_connection(conn: &Connection, writable: bool) -> rusqlite::Result<()> {
    if writable {
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    }
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}
