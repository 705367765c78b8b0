//! Log of multi-step schema operations.
//!
//! A row is written before the first step and updated after each one, inside
//! the same transaction as the step. On store open, rows still present are
//! resumed from the step after the recorded one.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use smartsql_core::IndexSpec;

use crate::error::{StoreError, StoreResult};

pub const LONG_OPERATIONS_STATUS_TABLE: &str = "long_operations_status";

pub(crate) const CREATE_LONG_OPERATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS long_operations_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    details TEXT,
    status TEXT NOT NULL,
    created INTEGER NOT NULL,
    lastModified INTEGER NOT NULL
)";

/// Kinds of long operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongOperationType {
    AlterSoup,
}

impl LongOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LongOperationType::AlterSoup => "AlterSoup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AlterSoup" => Some(LongOperationType::AlterSoup),
            _ => None,
        }
    }
}

/// Steps of an alter soup, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlterSoupStep {
    Starting,
    RenameOldSoupTable,
    DropOldIndexes,
    RegisterSoupUsingTableName,
    CopyTable,
    ReIndexSoup,
    DropOldTable,
    Cleanup,
}

impl AlterSoupStep {
    pub const ALL: [AlterSoupStep; 8] = [
        AlterSoupStep::Starting,
        AlterSoupStep::RenameOldSoupTable,
        AlterSoupStep::DropOldIndexes,
        AlterSoupStep::RegisterSoupUsingTableName,
        AlterSoupStep::CopyTable,
        AlterSoupStep::ReIndexSoup,
        AlterSoupStep::DropOldTable,
        AlterSoupStep::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlterSoupStep::Starting => "STARTING",
            AlterSoupStep::RenameOldSoupTable => "RENAME_OLD_SOUP_TABLE",
            AlterSoupStep::DropOldIndexes => "DROP_OLD_INDEXES",
            AlterSoupStep::RegisterSoupUsingTableName => "REGISTER_SOUP_USING_TABLE_NAME",
            AlterSoupStep::CopyTable => "COPY_TABLE",
            AlterSoupStep::ReIndexSoup => "RE_INDEX_SOUP",
            AlterSoupStep::DropOldTable => "DROP_OLD_TABLE",
            AlterSoupStep::Cleanup => "CLEANUP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|step| step.as_str() == s)
    }

    pub fn next(&self) -> Option<Self> {
        let pos = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(pos + 1).copied()
    }
}

/// Everything needed to run (or resume) an alter soup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterSoupDetails {
    pub soup_name: String,
    pub soup_table_name: String,
    pub old_index_specs: Vec<IndexSpec>,
    pub new_index_specs: Vec<IndexSpec>,
    pub old_external_storage: bool,
    pub new_external_storage: bool,
    pub re_index_data: bool,
}

impl AlterSoupDetails {
    pub fn old_table_name(&self) -> String {
        format!("{}_old", self.soup_table_name)
    }
}

/// A row of the long operations table
#[derive(Debug, Clone)]
pub struct LongOperation {
    pub id: i64,
    pub op_type: LongOperationType,
    pub details: AlterSoupDetails,
    pub status: AlterSoupStep,
}

pub(crate) fn log_start(conn: &Connection, details: &AlterSoupDetails) -> StoreResult<i64> {
    let now = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO long_operations_status (type, details, status, created, lastModified) \
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![
            LongOperationType::AlterSoup.as_str(),
            serde_json::to_string(details)?,
            AlterSoupStep::Starting.as_str(),
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_status(conn: &Connection, id: i64, step: AlterSoupStep) -> StoreResult<()> {
    conn.execute(
        "UPDATE long_operations_status SET status = ?1, lastModified = ?2 WHERE id = ?3",
        params![step.as_str(), chrono::Utc::now().timestamp_millis(), id],
    )?;
    Ok(())
}

pub(crate) fn delete(conn: &Connection, id: i64) -> StoreResult<()> {
    conn.execute("DELETE FROM long_operations_status WHERE id = ?1", [id])?;
    Ok(())
}

/// Pending operations in creation order
pub(crate) fn load_all(conn: &Connection) -> StoreResult<Vec<LongOperation>> {
    let mut stmt =
        conn.prepare("SELECT id, type, details, status FROM long_operations_status ORDER BY id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, op_type, details, status)| {
            let op_type = LongOperationType::parse(&op_type).ok_or_else(|| {
                StoreError::LongOperation(format!("unknown operation type '{}'", op_type))
            })?;
            let status = AlterSoupStep::parse(&status).ok_or_else(|| {
                StoreError::LongOperation(format!("unknown alter soup step '{}'", status))
            })?;
            let details: AlterSoupDetails =
                serde_json::from_str(details.as_deref().unwrap_or("null"))?;
            Ok(LongOperation {
                id,
                op_type,
                details,
                status,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::OptionalExtension;

    fn status_of(conn: &Connection, id: i64) -> StoreResult<Option<AlterSoupStep>> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM long_operations_status WHERE id = ?1",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(status.and_then(|s| AlterSoupStep::parse(&s)))
    }

    fn details() -> AlterSoupDetails {
        AlterSoupDetails {
            soup_name: "people".to_string(),
            soup_table_name: "TABLE_1".to_string(),
            old_index_specs: vec![IndexSpec::string("name").with_column("TABLE_1_0")],
            new_index_specs: vec![IndexSpec::string("name"), IndexSpec::integer("age")],
            old_external_storage: false,
            new_external_storage: false,
            re_index_data: true,
        }
    }

    #[test]
    fn test_step_order() {
        let mut step = AlterSoupStep::Starting;
        let mut seen = vec![step];
        while let Some(next) = step.next() {
            assert!(next > step);
            seen.push(next);
            step = next;
        }
        assert_eq!(seen, AlterSoupStep::ALL.to_vec());
        assert_eq!(AlterSoupStep::Cleanup.next(), None);
        assert_eq!(
            AlterSoupStep::parse("COPY_TABLE"),
            Some(AlterSoupStep::CopyTable)
        );
    }

    #[test]
    fn test_log_lifecycle() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_LONG_OPERATIONS_TABLE).unwrap();

        let id = log_start(&conn, &details()).unwrap();
        update_status(&conn, id, AlterSoupStep::CopyTable).unwrap();

        let ops = load_all(&conn).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, LongOperationType::AlterSoup);
        assert_eq!(ops[0].status, AlterSoupStep::CopyTable);
        assert_eq!(ops[0].details, details());
        assert_eq!(ops[0].details.old_table_name(), "TABLE_1_old");

        delete(&conn, id).unwrap();
        assert!(load_all(&conn).unwrap().is_empty());
        assert_eq!(status_of(&conn, id).unwrap(), None);
    }
}
