//! The on-disk identifier catalog.
//!
//! A catalog directory is shared by arbitrarily many concurrent compiler
//! processes. It contains one `manager.db` arbitrating *job slots* and one
//! `debuginfo<slot>.db` per slot holding the three identifier relations
//! (file names, function names, basic blocks). A slot is held by exactly one
//! process at a time; because the slot forms the top 16 bits of every
//! identifier a process emits, two processes can never mint the same
//! identifier.
//!
//! Claiming and releasing slots is serialised by an advisory whole-file lock
//! on `manager.db`. The claim itself is still a conditional update: even
//! under the lock the loop must tolerate a row it saw being taken by someone
//! else, so a failed claim simply re-enters the loop.
//!
//! Durability of the slot-scoped relations is relaxed (`synchronous=OFF`):
//! the catalog can be rebuilt by recompiling, so throughput wins.

use crate::{errors::CatalogError, ids};
use rusqlite::{Connection, OptionalExtension, params};
use std::{
    collections::HashMap,
    env,
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    process,
};

/// The environment variable naming the catalog directory.
pub const DATABASE_DIR_ENV: &str = "TREC_DATABASE_DIR";

const MANAGER_DB: &str = "manager.db";

const SQL_CREATE_MANAGER: &str = "
    CREATE TABLE IF NOT EXISTS MANAGER (
        ID INTEGER PRIMARY KEY AUTOINCREMENT,
        PID INTEGER);";

const SQL_CREATE_RELATIONS: &str = "
    CREATE TABLE IF NOT EXISTS FILENAMES (
        ID INTEGER PRIMARY KEY AUTOINCREMENT,
        NAME TEXT);
    CREATE TABLE IF NOT EXISTS FUNCNAMES (
        ID INTEGER PRIMARY KEY AUTOINCREMENT,
        NAME TEXT);
    CREATE TABLE IF NOT EXISTS BBLS (
        ID INTEGER PRIMARY KEY AUTOINCREMENT,
        FID INTEGER,
        LINESTART INTEGER,
        LINEEND INTEGER);";

/// An exclusive advisory lock over the manager store.
///
/// Claim and release both run under this lock; it is dropped (and with it
/// the `flock`) as soon as the manager transaction is over, so the lock is
/// never held while a translation unit is being instrumented.
struct ManagerLock {
    file: File,
}

impl ManagerLock {
    fn acquire(path: &Path) -> Result<Self, CatalogError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(CatalogError::SlotLock(io::Error::last_os_error()));
        }
        Ok(Self { file })
    }
}

impl Drop for ManagerLock {
    fn drop(&mut self) {
        // Closing the descriptor would drop the lock anyway; being explicit
        // costs nothing and survives refactoring.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// A claimed job slot plus the slot-scoped identifier relations.
pub struct Catalog {
    dir: PathBuf,
    slot: u16,
    conn: Connection,
    file_ids: HashMap<String, u32>,
    func_ids: HashMap<String, u32>,
    released: bool,
}

impl Catalog {
    /// Open the catalog in the directory named by `TREC_DATABASE_DIR`.
    pub fn from_env() -> Result<Self, CatalogError> {
        match env::var_os(DATABASE_DIR_ENV) {
            Some(dir) => Self::open(Path::new(&dir)),
            None => Err(CatalogError::EnvMissing(DATABASE_DIR_ENV)),
        }
    }

    /// Open the catalog in `dir`, claiming a job slot for this process.
    ///
    /// If this process already holds a slot (a second engine in the same
    /// compiler invocation), the same slot is returned.
    pub fn open(dir: &Path) -> Result<Self, CatalogError> {
        let slot = {
            let _lock = ManagerLock::acquire(&dir.join(MANAGER_DB))?;
            let mconn = Connection::open(dir.join(MANAGER_DB))?;
            mconn.execute_batch(SQL_CREATE_MANAGER)?;
            claim_slot(&mconn, process::id())?
        };

        let conn = Connection::open(dir.join(format!("debuginfo{slot}.db")))?;
        conn.execute_batch("PRAGMA synchronous=OFF;")?;
        conn.execute_batch(SQL_CREATE_RELATIONS)?;

        Ok(Self {
            dir: dir.to_owned(),
            slot,
            conn,
            file_ids: HashMap::new(),
            func_ids: HashMap::new(),
            released: false,
        })
    }

    /// The slot this catalog holds; the top 16 bits of every identifier it
    /// hands out.
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Begin the per-function batch of identifier allocations.
    pub fn begin_batch(&self) -> Result<(), CatalogError> {
        self.conn.execute_batch("BEGIN;")?;
        Ok(())
    }

    /// Commit the per-function batch.
    pub fn commit_batch(&self) -> Result<(), CatalogError> {
        self.conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    /// The key of `name` in the FILENAMES relation, inserting it if new.
    pub fn file_id(&mut self, name: &str) -> Result<u32, CatalogError> {
        if let Some(&id) = self.file_ids.get(name) {
            return Ok(id);
        }
        let id = intern(&self.conn, "FILENAMES", name)?;
        self.file_ids.insert(name.to_owned(), id);
        Ok(id)
    }

    /// The key of `name` in the FUNCNAMES relation, inserting it if new.
    pub fn func_id(&mut self, name: &str) -> Result<u32, CatalogError> {
        if let Some(&id) = self.func_ids.get(name) {
            return Ok(id);
        }
        let id = intern(&self.conn, "FUNCNAMES", name)?;
        self.func_ids.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Append a basic-block row and return its composed identifier.
    pub fn record_basic_block(
        &mut self,
        fid: u64,
        line_start: u32,
        line_end: u32,
    ) -> Result<u64, CatalogError> {
        self.conn.execute(
            "INSERT INTO BBLS (FID, LINESTART, LINEEND) VALUES (?1, ?2, ?3)",
            params![fid as i64, line_start, line_end],
        )?;
        let bb_id = self.conn.last_insert_rowid();
        ids::compose_bbid(self.slot, bb_id as u64)
    }

    /// Hand the slot back so another process can claim it.
    pub fn release(mut self) -> Result<(), CatalogError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), CatalogError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let _lock = ManagerLock::acquire(&self.dir.join(MANAGER_DB))?;
        let mconn = Connection::open(self.dir.join(MANAGER_DB))?;
        mconn.execute(
            "UPDATE MANAGER SET PID=NULL WHERE ID=?1",
            [i64::from(self.slot)],
        )?;
        Ok(())
    }
}

impl Drop for Catalog {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            eprintln!("trec: failed to release catalog slot {}: {e}", self.slot);
        }
    }
}

/// Find or create a manager row owned by `pid` and return its key.
///
/// Runs under the manager lock. The conditional `UPDATE` keeps the loop
/// correct even if a competing process takes the null-owner row we just saw:
/// zero rows changed sends us round again.
fn claim_slot(conn: &Connection, pid: u32) -> Result<u16, CatalogError> {
    let owned: Option<i64> = conn
        .query_row("SELECT ID FROM MANAGER WHERE PID=?1", [pid], |r| r.get(0))
        .optional()?;
    if let Some(id) = owned {
        return slot_from_row(id);
    }

    loop {
        let free: Option<i64> = conn
            .query_row(
                "SELECT ID FROM MANAGER WHERE PID IS NULL LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        match free {
            Some(id) => {
                let n = conn.execute(
                    "UPDATE MANAGER SET PID=?1 WHERE ID=?2 AND PID IS NULL",
                    params![pid, id],
                )?;
                if n == 1 {
                    return slot_from_row(id);
                }
                // Someone stole the row between the SELECT and the UPDATE.
            }
            None => {
                conn.execute("INSERT INTO MANAGER (PID) VALUES (NULL)", [])?;
            }
        }
    }
}

fn slot_from_row(id: i64) -> Result<u16, CatalogError> {
    u16::try_from(id).map_err(|_| CatalogError::IdOverflow {
        what: "slot",
        value: id as u64,
        max: u64::from(u16::MAX),
    })
}

/// `SELECT`-or-`INSERT` a name into one of the two name relations.
fn intern(conn: &Connection, table: &str, name: &str) -> Result<u32, CatalogError> {
    // Table names cannot be bound as parameters; both callers pass one of
    // the two fixed relation names.
    let existing: Option<i64> = conn
        .query_row(
            &format!("SELECT ID FROM {table} WHERE NAME=?1"),
            [name],
            |r| r.get(0),
        )
        .optional()?;
    let id = match existing {
        Some(id) => id,
        None => {
            conn.execute(&format!("INSERT INTO {table} (NAME) VALUES (?1)"), [name])?;
            conn.last_insert_rowid()
        }
    };
    u32::try_from(id).map_err(|_| CatalogError::IdOverflow {
        what: "name_id",
        value: id as u64,
        max: u64::from(u32::MAX),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn names_are_interned_once() {
        let dir = TempDir::new().unwrap();
        let mut cat = Catalog::open(dir.path()).unwrap();
        let a = cat.file_id("/src/a.c").unwrap();
        let b = cat.file_id("/src/b.c").unwrap();
        assert_ne!(a, b);
        assert_eq!(cat.file_id("/src/a.c").unwrap(), a);

        let f = cat.func_id("main: 1").unwrap();
        assert_eq!(cat.func_id("main: 1").unwrap(), f);
        assert_ne!(cat.func_id("main: 9").unwrap(), f);
    }

    #[test]
    fn interning_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let a = {
            let mut cat = Catalog::open(dir.path()).unwrap();
            cat.file_id("/src/a.c").unwrap()
        };
        // The slot was released on drop, so we get the same slot and the
        // same relation file back.
        let mut cat = Catalog::open(dir.path()).unwrap();
        assert_eq!(cat.file_id("/src/a.c").unwrap(), a);
    }

    #[test]
    fn basic_blocks_append() {
        let dir = TempDir::new().unwrap();
        let mut cat = Catalog::open(dir.path()).unwrap();
        let fid = ids::compose_fid(cat.slot(), 1, 1).unwrap();
        let b1 = cat.record_basic_block(fid, 10, 12).unwrap();
        let b2 = cat.record_basic_block(fid, 13, 20).unwrap();
        assert_ne!(b1, b2);
        assert_eq!(ids::slot_of(b1), cat.slot());
        assert_eq!(ids::bb_of(b2), ids::bb_of(b1) + 1);
    }

    #[test]
    fn released_slots_are_reclaimed() {
        let dir = TempDir::new().unwrap();
        let slot = {
            let cat = Catalog::open(dir.path()).unwrap();
            cat.slot()
        };
        let cat = Catalog::open(dir.path()).unwrap();
        assert_eq!(cat.slot(), slot);
        cat.release().unwrap();
    }

    #[test]
    fn concurrent_opens_get_distinct_slots() {
        // Slots are keyed by process id, so within one test process we
        // exercise the arbitration by handing each thread its own claim
        // loop against a distinct fake pid.
        let dir = TempDir::new().unwrap();
        {
            let _lock = ManagerLock::acquire(&dir.path().join(MANAGER_DB)).unwrap();
        }
        let mut handles = Vec::new();
        for fake_pid in 1..=4u32 {
            let path = dir.path().join(MANAGER_DB);
            handles.push(thread::spawn(move || {
                let _lock = ManagerLock::acquire(&path).unwrap();
                let conn = Connection::open(&path).unwrap();
                conn.execute_batch(SQL_CREATE_MANAGER).unwrap();
                claim_slot(&conn, fake_pid).unwrap()
            }));
        }
        let mut slots: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 4);
    }
}
