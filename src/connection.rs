//! Safe wrapper around `libpq-sys` for both the replication socket and the
//! pooled catalog connections used to resolve primary keys.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Mutex;

use libpq_sys::*;

use crate::errors::{ReplicationError, ReplicationResult};

/// A single libpq connection. Used both for `START_REPLICATION`/CopyBoth
/// and for the plain-query catalog lookups in [`crate::relation`].
pub struct PgConnection {
    conn: *mut PGconn,
}

// A `PGconn` is never touched concurrently: the catalog pool dedups by slot
// id, and each slot has exactly one session driving its connection at a time.
unsafe impl Send for PgConnection {}
unsafe impl Sync for PgConnection {}

impl PgConnection {
    pub fn connect(conninfo: &str) -> ReplicationResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(ReplicationError::connection(
                "failed to allocate libpq connection object",
            ));
        }

        if unsafe { PQstatus(conn) } != ConnStatusType::CONNECTION_OK {
            let message = error_message(conn).unwrap_or_else(|| "unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(ReplicationError::connection(format!(
                "connection failed: {message}"
            )));
        }

        Ok(Self { conn })
    }

    /// Run a plain (non-replication) query and collect the result rows.
    pub fn execute(&self, query: &str) -> ReplicationResult<QueryResult> {
        let c_query = CString::new(query)?;
        let raw = unsafe { PQexec(self.conn, c_query.as_ptr()) };
        if raw.is_null() {
            let message = error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::catalog(format!(
                "query execution failed: {message}"
            )));
        }
        let result = QueryResult { raw };
        if !result.is_ok() {
            let message = error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::catalog(format!(
                "query returned error status: {message}"
            )));
        }
        Ok(result)
    }

    /// Issue `START_REPLICATION` and enter CopyBoth mode.
    pub fn start_replication(&self, query: &str) -> ReplicationResult<()> {
        let result = self.execute_raw_allow_copy(query)?;
        match result.status() {
            ExecStatusType::PGRES_COPY_BOTH => Ok(()),
            _ => {
                let message =
                    error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                Err(ReplicationError::connection(format!(
                    "START_REPLICATION did not enter CopyBoth mode: {message}"
                )))
            }
        }
    }

    fn execute_raw_allow_copy(&self, query: &str) -> ReplicationResult<QueryResult> {
        let c_query = CString::new(query)?;
        let raw = unsafe { PQexec(self.conn, c_query.as_ptr()) };
        if raw.is_null() {
            let message = error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::connection(format!(
                "query execution failed: {message}"
            )));
        }
        Ok(QueryResult { raw })
    }

    /// Blocking read of one CopyData row. `Ok(None)` means the COPY stream
    /// ended (server closed it cleanly); `Err` covers both libpq-level
    /// failures and a non-ok final result status.
    pub fn get_copy_data(&self) -> ReplicationResult<Option<Vec<u8>>> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let len = unsafe { PQgetCopyData(self.conn, &mut buffer, 0) };

        match len {
            -2 => {
                let message =
                    error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                Err(ReplicationError::connection(message))
            }
            -1 => {
                let final_result = QueryResult {
                    raw: unsafe { PQgetResult(self.conn) },
                };
                if !final_result.is_ok() {
                    let message =
                        error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                    return Err(ReplicationError::connection(message));
                }
                Ok(None)
            }
            0 => Ok(None),
            len => {
                if buffer.is_null() {
                    return Err(ReplicationError::connection(
                        "libpq returned a null copy-data buffer",
                    ));
                }
                let data = unsafe {
                    std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec()
                };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(Some(data))
            }
        }
    }

    pub fn put_copy_data(&self, data: &[u8]) -> ReplicationResult<()> {
        let sent = unsafe {
            PQputCopyData(
                self.conn,
                data.as_ptr() as *const std::os::raw::c_char,
                data.len() as i32,
            )
        };
        if sent != 1 {
            let message = error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(ReplicationError::connection(format!(
                "failed to send copy data: {message}"
            )));
        }
        Ok(())
    }

    pub fn flush(&self) -> ReplicationResult<()> {
        if unsafe { PQflush(self.conn) } != 0 {
            return Err(ReplicationError::connection("failed to flush connection"));
        }
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let ptr = PQerrorMessage(conn);
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }
}

/// Result of a plain (non-COPY) query.
pub struct QueryResult {
    raw: *mut PGresult,
}

impl QueryResult {
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.raw) }
    }

    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.raw) }
    }

    pub fn nfields(&self) -> i32 {
        unsafe { PQnfields(self.raw) }
    }

    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        let ptr = unsafe { PQgetvalue(self.raw, row, col) };
        if ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(ptr).to_string_lossy().into_owned()) }
        }
    }

    /// All rows as `Vec<String>` (single-column queries, e.g. `pg_index`).
    pub fn rows(&self) -> Vec<Vec<String>> {
        let rows = self.ntuples();
        let cols = self.nfields();
        (0..rows)
            .map(|r| {
                (0..cols)
                    .map(|c| self.getvalue(r, c).unwrap_or_default())
                    .collect()
            })
            .collect()
    }
}

impl Drop for QueryResult {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { PQclear(self.raw) };
        }
    }
}

/// Process-wide pool of catalog connections, deduplicated by slot id, per
/// the "Shared resources" note: the replication socket is never pooled,
/// only the side catalog connection used for `pg_index` lookups.
#[derive(Default)]
pub struct CatalogPool {
    connections: Mutex<HashMap<String, std::sync::Arc<PgConnection>>>,
}

impl CatalogPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_connect(
        &self,
        slot_id: &str,
        conninfo: &str,
    ) -> ReplicationResult<std::sync::Arc<PgConnection>> {
        let mut connections = self.connections.lock().unwrap();
        if let Some(existing) = connections.get(slot_id) {
            return Ok(existing.clone());
        }
        let connection = std::sync::Arc::new(PgConnection::connect(conninfo)?);
        connections.insert(slot_id.to_string(), connection.clone());
        Ok(connection)
    }
}
