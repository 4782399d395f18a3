//! Response store: captured responses keyed by `(test_id, side)` plus the
//! last result of every test, persisted in SQLite.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DiffError, LookupError, StoreError};
use crate::http::StoredResponse;
use crate::route::Side;
use crate::testing::{TestDiff, TestState};

const DATA_DIR: &str = ".routediff";
const DB_FILE: &str = "responses.db";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS responses (
     test_id TEXT NOT NULL,
     side TEXT NOT NULL,
     response_json TEXT NOT NULL,
     updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
     PRIMARY KEY (test_id, side)
   );
   CREATE TABLE IF NOT EXISTS tests (
     test_id TEXT PRIMARY KEY,
     name TEXT NOT NULL,
     ignore_body_json TEXT NOT NULL,
     ignore_header_json TEXT NOT NULL,
     state TEXT NOT NULL,
     failure_reason TEXT,
     updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
   );";

/// Last known result of a test, kept next to its responses so lookups by id
/// can re-apply the ignore lists it ran with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub test_id: String,
    pub name: String,
    pub ignore_body: Vec<String>,
    pub ignore_header: Vec<String>,
    pub state: TestState,
    pub failure_reason: Option<String>,
}

pub struct ResponseStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl ResponseStore {
    /// `.routediff/responses.db` below the current directory.
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(DATA_DIR)
            .join(DB_FILE)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path).map_err(StoreError::Open)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::query("set journal mode"))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::Open)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(StoreError::query("initialize schema"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Replaces whatever was stored for this test and side.
    pub fn put(&self, test_id: &str, side: Side, response: &StoredResponse) -> Result<(), StoreError> {
        let response_json = serde_json::to_string(response).map_err(|source| {
            StoreError::Serialize {
                what: "response",
                source,
            }
        })?;

        self.conn()?
            .execute(
                "INSERT INTO responses (test_id, side, response_json, updated_at)
                 VALUES (?1, ?2, ?3, strftime('%s','now'))
                 ON CONFLICT(test_id, side)
                 DO UPDATE SET
                   response_json = excluded.response_json,
                   updated_at = excluded.updated_at;",
                params![test_id, side.as_str(), response_json],
            )
            .map_err(StoreError::query("save response"))?;
        debug!(test_id, %side, "stored response");
        Ok(())
    }

    pub fn get(&self, test_id: &str, side: Side) -> Result<Option<StoredResponse>, StoreError> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT response_json FROM responses WHERE test_id = ?1 AND side = ?2 LIMIT 1;",
                params![test_id, side.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::query("load response"))?;

        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|source| StoreError::Deserialize {
                what: "response",
                source,
            })
        })
        .transpose()
    }

    pub fn put_record(&self, record: &TestRecord) -> Result<(), StoreError> {
        let serialize = |list: &[String]| {
            serde_json::to_string(list).map_err(|source| StoreError::Serialize {
                what: "ignore list",
                source,
            })
        };
        let ignore_body = serialize(&record.ignore_body)?;
        let ignore_header = serialize(&record.ignore_header)?;

        self.conn()?
            .execute(
                "INSERT INTO tests (test_id, name, ignore_body_json, ignore_header_json,
                                    state, failure_reason, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, strftime('%s','now'))
                 ON CONFLICT(test_id)
                 DO UPDATE SET
                   name = excluded.name,
                   ignore_body_json = excluded.ignore_body_json,
                   ignore_header_json = excluded.ignore_header_json,
                   state = excluded.state,
                   failure_reason = excluded.failure_reason,
                   updated_at = excluded.updated_at;",
                params![
                    record.test_id,
                    record.name,
                    ignore_body,
                    ignore_header,
                    record.state.as_str(),
                    record.failure_reason,
                ],
            )
            .map_err(StoreError::query("save test record"))?;
        Ok(())
    }

    pub fn get_record(&self, test_id: &str) -> Result<Option<TestRecord>, StoreError> {
        let row: Option<(String, String, String, String, Option<String>)> = self
            .conn()?
            .query_row(
                "SELECT name, ignore_body_json, ignore_header_json, state, failure_reason
                 FROM tests WHERE test_id = ?1 LIMIT 1;",
                params![test_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()
            .map_err(StoreError::query("load test record"))?;

        let Some((name, ignore_body, ignore_header, state, failure_reason)) = row else {
            return Ok(None);
        };
        let parse_list = |raw: &str| -> Result<Vec<String>, StoreError> {
            serde_json::from_str(raw).map_err(|source| StoreError::Deserialize {
                what: "ignore list",
                source,
            })
        };
        let state = serde_json::from_value(serde_json::Value::String(state)).map_err(|source| {
            StoreError::Deserialize {
                what: "test state",
                source,
            }
        })?;

        Ok(Some(TestRecord {
            test_id: test_id.to_string(),
            name,
            ignore_body: parse_list(&ignore_body)?,
            ignore_header: parse_list(&ignore_header)?,
            state,
            failure_reason,
        }))
    }

    /// All test ids with at least one stored response, sorted.
    pub fn test_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut statement = conn
            .prepare("SELECT DISTINCT test_id FROM responses ORDER BY test_id;")
            .map_err(StoreError::query("list tests"))?;
        let ids = statement
            .query_map([], |row| row.get(0))
            .map_err(StoreError::query("list tests"))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(StoreError::query("list tests"))?;
        Ok(ids)
    }

    /// Resolves a user-supplied id prefix to exactly one stored test.
    pub fn lookup_by_prefix(&self, prefix: &str) -> Result<String, LookupError> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() {
            return Err(LookupError::NotFound { prefix });
        }

        let candidates: Vec<String> = {
            let conn = self.conn()?;
            let mut statement = conn
                .prepare(
                    "SELECT DISTINCT test_id FROM responses
                     WHERE substr(test_id, 1, length(?1)) = ?1
                     ORDER BY test_id;",
                )
                .map_err(StoreError::query("look up test id"))?;
            let rows = statement
                .query_map(params![prefix], |row| row.get(0))
                .map_err(StoreError::query("look up test id"))?
                .collect::<Result<Vec<String>, _>>()
                .map_err(StoreError::query("look up test id"))?;
            rows
        };

        match candidates.len() {
            0 => Err(LookupError::NotFound { prefix }),
            1 => Ok(candidates.into_iter().next().unwrap_or_default()),
            _ => Err(LookupError::Ambiguous { prefix, candidates }),
        }
    }

    /// Deletes every stored response and record. Returns how many responses
    /// were removed.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM responses;", [])
            .map_err(StoreError::query("delete responses"))?;
        conn.execute("DELETE FROM tests;", [])
            .map_err(StoreError::query("delete test records"))?;
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM responses;", [], |row| row.get(0))
            .map_err(StoreError::query("count responses"))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Loads both sides of the test matching `prefix` and diffs them with the
    /// ignore lists it last ran with.
    pub fn diff_by_id(&self, prefix: &str) -> Result<(String, TestDiff), DiffError> {
        let test_id = self.lookup_by_prefix(prefix)?;
        let (ignore_body, ignore_header) = match self.get_record(&test_id)? {
            Some(record) => (record.ignore_body, record.ignore_header),
            None => (Vec::new(), Vec::new()),
        };

        let left = self.require(&test_id, Side::Left)?;
        let right = self.require(&test_id, Side::Right)?;
        let diff = TestDiff::between(&left, &right, &ignore_body, &ignore_header)?;
        Ok((test_id, diff))
    }

    fn require(&self, test_id: &str, side: Side) -> Result<StoredResponse, DiffError> {
        self.get(test_id, side)?
            .ok_or_else(|| DiffError::MissingResponse {
                test_id: test_id.to_string(),
                side,
            })
    }
}
