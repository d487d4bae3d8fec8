use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info};

use crate::models::{PhotoRecord, Pin};

/// SQLite-backed store for pins and their photo albums.
///
/// All mutation goes through [`Store::with_txn`], which commits the whole
/// batch or rolls it back on the first error. Reads outside a transaction
/// auto-commit per statement. The connection is guarded by a mutex so the
/// store can be shared across async tasks; SQLite access is serialized.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open journal database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        info!("running store migrations");
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS pins (
                id         TEXT PRIMARY KEY,
                latitude   REAL NOT NULL,
                longitude  REAL NOT NULL,
                page       INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS photos (
                id         TEXT PRIMARY KEY,
                remote_url TEXT NOT NULL,
                image_data BLOB,
                pin_id     TEXT NOT NULL REFERENCES pins(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_photos_pin ON photos(pin_id);
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("store mutex poisoned"))
    }

    /// Run a batch of mutations as one unit of work. The transaction commits
    /// when the closure returns `Ok` and rolls back on `Err`, leaving prior
    /// state intact.
    pub fn with_txn<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let txn = conn.transaction()?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().context("failed to commit unit of work")?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls it back.
                debug!(%err, "rolling back unit of work");
                Err(err)
            }
        }
    }

    pub fn insert_pin(&self, pin: &Pin) -> Result<()> {
        let conn = self.lock()?;
        insert_pin(&conn, pin)
    }

    pub fn list_pins(&self) -> Result<Vec<Pin>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, latitude, longitude, page, created_at
             FROM pins ORDER BY created_at, id",
        )?;
        let pins = stmt
            .query_map([], row_to_pin)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pins)
    }

    pub fn get_pin(&self, pin_id: &str) -> Result<Option<Pin>> {
        let conn = self.lock()?;
        let pin = conn
            .query_row(
                "SELECT id, latitude, longitude, page, created_at
                 FROM pins WHERE id = ?1",
                params![pin_id],
                row_to_pin,
            )
            .optional()?;
        Ok(pin)
    }

    pub fn photos_for_pin(&self, pin_id: &str) -> Result<Vec<PhotoRecord>> {
        let conn = self.lock()?;
        photos_for_pin(&conn, pin_id)
    }

    pub fn get_photo(&self, photo_id: &str) -> Result<Option<PhotoRecord>> {
        let conn = self.lock()?;
        let photo = conn
            .query_row(
                "SELECT id, remote_url, image_data, pin_id
                 FROM photos WHERE id = ?1",
                params![photo_id],
                row_to_photo,
            )
            .optional()?;
        Ok(photo)
    }

    /// Delete a pin, cascading to its photos. Returns `false` if no such pin.
    pub fn delete_pin(&self, pin_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM pins WHERE id = ?1", params![pin_id])?;
        Ok(changed > 0)
    }

    /// Delete a single photo. Returns `false` if no such photo.
    pub fn delete_photo(&self, photo_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM photos WHERE id = ?1", params![photo_id])?;
        Ok(changed > 0)
    }

    pub fn pin_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM pins", [], |row| row.get(0))?)
    }

    pub fn photo_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))?)
    }
}

// Row-level operations usable both standalone and inside `with_txn` (a
// `Transaction` derefs to `Connection`).

pub fn insert_pin(conn: &Connection, pin: &Pin) -> Result<()> {
    conn.execute(
        "INSERT INTO pins (id, latitude, longitude, page) VALUES (?1, ?2, ?3, ?4)",
        params![pin.id, pin.latitude, pin.longitude, pin.page],
    )
    .with_context(|| format!("failed to insert pin {}", pin.id))?;
    Ok(())
}

/// Attach a photo to a pin, creating the record if the id is new. An existing
/// photo keeps its URL and cached bytes and is re-pointed at the given pin,
/// so repeated syncs never duplicate an id.
pub fn attach_photo(conn: &Connection, photo_id: &str, remote_url: &str, pin_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO photos (id, remote_url, pin_id) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET pin_id = excluded.pin_id",
        params![photo_id, remote_url, pin_id],
    )?;
    Ok(())
}

pub fn delete_photos_for_pin(conn: &Connection, pin_id: &str) -> Result<usize> {
    let deleted = conn.execute("DELETE FROM photos WHERE pin_id = ?1", params![pin_id])?;
    Ok(deleted)
}

pub fn set_page(conn: &Connection, pin_id: &str, page: u32) -> Result<()> {
    conn.execute(
        "UPDATE pins SET page = ?1 WHERE id = ?2",
        params![page, pin_id],
    )?;
    Ok(())
}

pub fn set_image_data(conn: &Connection, photo_id: &str, data: &[u8]) -> Result<()> {
    conn.execute(
        "UPDATE photos SET image_data = ?1 WHERE id = ?2",
        params![data, photo_id],
    )?;
    Ok(())
}

pub fn photos_for_pin(conn: &Connection, pin_id: &str) -> Result<Vec<PhotoRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, remote_url, image_data, pin_id
         FROM photos WHERE pin_id = ?1 ORDER BY id",
    )?;
    let photos = stmt
        .query_map(params![pin_id], row_to_photo)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(photos)
}

fn row_to_pin(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pin> {
    Ok(Pin {
        id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        page: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_photo(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhotoRecord> {
    Ok(PhotoRecord {
        id: row.get(0)?,
        remote_url: row.get(1)?,
        image_data: row.get(2)?,
        pin_id: row.get(3)?,
    })
}
