//! The local replica file, exclusively owned by the replication-manager
//! process. Syncer workers open read-only snapshots of the same file.
//!
//! This crate covers the `_zero.*` bookkeeping tables and their schema
//! migrations; the replicated user tables themselves are written by the
//! external replicator and are out of scope here.

mod schema;

use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use parking_lot::Mutex;
use replication::{
    BackfillRequest,
    ColumnSpec,
    TableId,
    TableMetadata,
    TableSpec,
};
use rusqlite::{
    params,
    Connection,
    OptionalExtension,
};

pub use schema::{
    SchemaCheck,
    LATEST_SCHEMA_VERSION,
};

/// A single SQLite connection; rusqlite does not allow concurrent use, and
/// the replication-manager is the only writer anyway.
pub struct Replica {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    conn: Connection,
    newly_created: bool,
}

impl Replica {
    /// Open (or create) the replica file and bring its schema up to date.
    /// When the on-disk schema cannot be migrated incrementally, the file is
    /// deleted and rebuilt from scratch: the change-source can always
    /// re-derive the replica from upstream.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_owned();
        let newly_created = !path.exists();
        let conn = Connection::open(&path)?;
        match schema::check_schema(&conn)? {
            SchemaCheck::UpToDate | SchemaCheck::MigrationsNeeded => {
                let mut replica = Self::from_conn(conn, newly_created);
                replica.migrate()?;
                Ok(replica)
            },
            SchemaCheck::ResetRequired { found } => {
                tracing::warn!(
                    "Replica at {} has schema version {found}; resetting",
                    path.display()
                );
                drop(conn);
                Self::reset(&path)?;
                let conn = Connection::open(&path)?;
                let mut replica = Self::from_conn(conn, true);
                replica.migrate()?;
                Ok(replica)
            },
        }
    }

    /// In-memory replica for tests and tooling.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut replica = Self::from_conn(conn, true);
        replica.migrate()?;
        Ok(replica)
    }

    fn from_conn(conn: Connection, newly_created: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                newly_created,
            })),
        }
    }

    fn reset(path: &PathBuf) -> anyhow::Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            match std::fs::remove_file(PathBuf::from(file)) {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn migrate(&mut self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let Inner {
            ref mut conn,
            newly_created,
        } = *inner;
        schema::apply_migrations(conn, newly_created)
    }

    pub fn newly_created(&self) -> bool {
        self.inner.lock().newly_created
    }

    pub fn schema_version(&self) -> anyhow::Result<u32> {
        let inner = self.inner.lock();
        schema::current_version(&inner.conn)
    }

    /// Last acked mutation id for `(client_group_id, client_id)`, if the
    /// client is known.
    pub fn last_mutation_id(
        &self,
        client_group_id: &str,
        client_id: &str,
    ) -> anyhow::Result<Option<u64>> {
        let inner = self.inner.lock();
        let lmid = inner
            .conn
            .query_row(
                r#"SELECT "lastMutationID" FROM "_zero.clients"
                   WHERE "clientGroupID" = ?1 AND "clientID" = ?2"#,
                params![client_group_id, client_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(lmid.map(|v| v as u64))
    }

    pub fn set_last_mutation_id(
        &self,
        client_group_id: &str,
        client_id: &str,
        lmid: u64,
    ) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"INSERT INTO "_zero.clients" ("clientGroupID", "clientID", "lastMutationID")
               VALUES (?1, ?2, ?3)
               ON CONFLICT ("clientGroupID", "clientID")
               DO UPDATE SET "lastMutationID" = ?3"#,
            params![client_group_id, client_id, lmid as i64],
        )?;
        Ok(())
    }

    pub fn set_table_metadata(
        &self,
        table: &TableId,
        metadata: &TableMetadata,
    ) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"INSERT INTO "_zero.tableMetadata" ("schema", "table", "metadata")
               VALUES (?1, ?2, ?3)
               ON CONFLICT ("schema", "table") DO UPDATE SET "metadata" = ?3"#,
            params![
                table.schema,
                table.name,
                serde_json::to_string(metadata)?
            ],
        )?;
        Ok(())
    }

    pub fn table_metadata(&self, table: &TableId) -> anyhow::Result<Option<TableMetadata>> {
        let inner = self.inner.lock();
        let metadata = inner
            .conn
            .query_row(
                r#"SELECT "metadata" FROM "_zero.tableMetadata"
                   WHERE "schema" = ?1 AND "table" = ?2"#,
                params![table.schema, table.name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        metadata
            .map(|m| serde_json::from_str(&m).map_err(Into::into))
            .transpose()
    }

    /// Track a column whose data still needs loading. `backfill` is the
    /// watermark bound recorded by the replicator, or empty for "from
    /// scratch".
    pub fn set_column_backfill(
        &self,
        table: &TableId,
        column: &str,
        column_id: u64,
        backfill: Option<&str>,
    ) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"INSERT INTO "_zero.column_metadata"
                   ("schema", "table", "column", "columnID", "backfill")
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT ("schema", "table", "column")
               DO UPDATE SET "columnID" = ?4, "backfill" = ?5"#,
            params![table.schema, table.name, column, column_id as i64, backfill],
        )?;
        Ok(())
    }

    pub fn clear_column_backfill(&self, table: &TableId, column: &str) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"UPDATE "_zero.column_metadata" SET "backfill" = NULL
               WHERE "schema" = ?1 AND "table" = ?2 AND "column" = ?3"#,
            params![table.schema, table.name, column],
        )?;
        Ok(())
    }

    /// Forget a dropped column entirely, including any pending backfill
    /// marker.
    pub fn drop_column(&self, table: &TableId, column: &str) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"DELETE FROM "_zero.column_metadata"
               WHERE "schema" = ?1 AND "table" = ?2 AND "column" = ?3"#,
            params![table.schema, table.name, column],
        )?;
        Ok(())
    }

    /// Re-key a column's metadata after an upstream rename.
    pub fn rename_column(
        &self,
        table: &TableId,
        old_name: &str,
        new_name: &str,
    ) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"UPDATE "_zero.column_metadata" SET "column" = ?4
               WHERE "schema" = ?1 AND "table" = ?2 AND "column" = ?3"#,
            params![table.schema, table.name, old_name, new_name],
        )?;
        Ok(())
    }

    /// Drop all of a table's metadata and column bookkeeping.
    pub fn drop_table(&self, table: &TableId) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"DELETE FROM "_zero.column_metadata" WHERE "schema" = ?1 AND "table" = ?2"#,
            params![table.schema, table.name],
        )?;
        inner.conn.execute(
            r#"DELETE FROM "_zero.tableMetadata" WHERE "schema" = ?1 AND "table" = ?2"#,
            params![table.schema, table.name],
        )?;
        Ok(())
    }

    /// Re-key all of a table's metadata and column bookkeeping after an
    /// upstream rename.
    pub fn rename_table(&self, table: &TableId, new: &TableId) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"UPDATE "_zero.column_metadata" SET "schema" = ?3, "table" = ?4
               WHERE "schema" = ?1 AND "table" = ?2"#,
            params![table.schema, table.name, new.schema, new.name],
        )?;
        inner.conn.execute(
            r#"UPDATE "_zero.tableMetadata" SET "schema" = ?3, "table" = ?4
               WHERE "schema" = ?1 AND "table" = ?2"#,
            params![table.schema, table.name, new.schema, new.name],
        )?;
        Ok(())
    }

    /// The backfills to seed the manager with at startup: every column still
    /// marked pending, grouped per table, with the table's row-key metadata
    /// attached.
    pub fn pending_backfills(&self) -> anyhow::Result<Vec<BackfillRequest>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            r#"SELECT c."schema", c."table", c."column", c."columnID", t."metadata"
               FROM "_zero.column_metadata" c
               LEFT JOIN "_zero.tableMetadata" t
                 ON c."schema" = t."schema" AND c."table" = t."table"
               WHERE c."backfill" IS NOT NULL
               ORDER BY c."schema", c."table", c."column""#,
        )?;
        let mut requests: Vec<BackfillRequest> = Vec::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        for row in rows {
            let (schema, table, column, column_id, metadata) = row?;
            let metadata: Option<TableMetadata> = metadata
                .map(|m| serde_json::from_str(&m))
                .transpose()?;
            let id = TableId::new(schema.clone(), table.clone());
            match requests.last_mut().filter(|r| r.table_id() == id) {
                Some(request) => {
                    request
                        .columns
                        .insert(column, ColumnSpec { id: column_id as u64 });
                },
                None => {
                    requests.push(BackfillRequest {
                        table: TableSpec {
                            schema,
                            name: table,
                            metadata,
                        },
                        columns: [(column, ColumnSpec { id: column_id as u64 })]
                            .into_iter()
                            .collect(),
                    });
                },
            }
        }
        Ok(requests)
    }

    /// Append one change-log entry. `pos` orders entries within a
    /// transaction's watermark.
    pub fn append_change_log(
        &self,
        watermark: &str,
        pos: u64,
        table: Option<&TableId>,
        change: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"INSERT INTO "_zero.changeLog2" ("watermark", "pos", "schema", "table", "change")
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                watermark,
                pos as i64,
                table.map(|t| t.schema.as_str()).unwrap_or(""),
                table.map(|t| t.name.as_str()).unwrap_or(""),
                serde_json::to_string(change)?
            ],
        )?;
        Ok(())
    }

    /// The highest watermark recorded in the change log, i.e. where the
    /// change stream resumes after a restart.
    pub fn last_watermark(&self) -> anyhow::Result<Option<String>> {
        let inner = self.inner.lock();
        let watermark = inner
            .conn
            .query_row(
                r#"SELECT MAX("watermark") FROM "_zero.changeLog2""#,
                [],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(watermark)
    }

    /// Append a structured runtime event (resets, migrations, failovers) for
    /// after-the-fact debugging.
    pub fn record_runtime_event(&self, event: &str, detail: &serde_json::Value) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.conn.execute(
            r#"INSERT INTO "_zero.runtime_events" ("timestamp", "event", "detail")
               VALUES (strftime('%s', 'now'), ?1, ?2)"#,
            params![event, serde_json::to_string(detail)?],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use replication::{
        TableId,
        TableMetadata,
    };
    use serde_json::json;

    use crate::{
        schema,
        Replica,
        SchemaCheck,
        LATEST_SCHEMA_VERSION,
    };

    #[test]
    fn test_fresh_replica_migrates_to_latest() -> anyhow::Result<()> {
        let replica = Replica::open_in_memory()?;
        assert!(replica.newly_created());
        assert_eq!(replica.schema_version()?, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn test_future_schema_version_requires_reset() -> anyhow::Result<()> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.pragma_update(None, "user_version", LATEST_SCHEMA_VERSION + 1)?;
        assert_eq!(
            schema::check_schema(&conn)?,
            SchemaCheck::ResetRequired {
                found: LATEST_SCHEMA_VERSION + 1
            }
        );
        Ok(())
    }

    #[test]
    fn test_reset_on_open_rebuilds_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("replica.db");
        {
            let conn = rusqlite::Connection::open(&path)?;
            conn.pragma_update(None, "user_version", LATEST_SCHEMA_VERSION + 5)?;
        }
        let replica = Replica::open(&path)?;
        assert!(replica.newly_created());
        assert_eq!(replica.schema_version()?, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn test_last_mutation_id_round_trip() -> anyhow::Result<()> {
        let replica = Replica::open_in_memory()?;
        assert_eq!(replica.last_mutation_id("g1", "c1")?, None);
        replica.set_last_mutation_id("g1", "c1", 1)?;
        replica.set_last_mutation_id("g1", "c1", 2)?;
        assert_eq!(replica.last_mutation_id("g1", "c1")?, Some(2));
        assert_eq!(replica.last_mutation_id("g1", "c2")?, None);
        Ok(())
    }

    #[test]
    fn test_pending_backfills_grouped_per_table() -> anyhow::Result<()> {
        let replica = Replica::open_in_memory()?;
        let issue = TableId::new("public", "issue");
        let comment = TableId::new("public", "comment");
        let metadata: TableMetadata = serde_json::from_value(json!({
            "rowKey": {"id": "int8"},
        }))?;
        replica.set_table_metadata(&issue, &metadata)?;
        replica.set_table_metadata(&comment, &metadata)?;
        replica.set_column_backfill(&issue, "title", 1, Some(""))?;
        replica.set_column_backfill(&issue, "owner", 2, Some(""))?;
        replica.set_column_backfill(&comment, "body", 3, Some(""))?;
        // A column that already finished loading is not re-requested.
        replica.set_column_backfill(&comment, "author", 4, None)?;

        let requests = replica.pending_backfills()?;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].table_id(), comment);
        assert_eq!(
            requests[0].columns.keys().collect::<Vec<_>>(),
            vec!["body"]
        );
        assert_eq!(requests[1].table_id(), issue);
        assert_eq!(
            requests[1].columns.keys().collect::<Vec<_>>(),
            vec!["owner", "title"]
        );
        assert!(requests[1].has_row_key());

        replica.clear_column_backfill(&issue, "title")?;
        replica.clear_column_backfill(&issue, "owner")?;
        let requests = replica.pending_backfills()?;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].table_id(), comment);
        Ok(())
    }

    #[test]
    fn test_runtime_events_recorded() -> anyhow::Result<()> {
        let replica = Replica::open_in_memory()?;
        replica.record_runtime_event("reset", &json!({"reason": "schema"}))?;
        Ok(())
    }
}
