//! Ordered incremental migrations for the `_zero.*` bookkeeping tables.
//!
//! The schema version is kept in SQLite's `user_version` pragma. A replica
//! whose version is newer than this binary knows, or that predates the
//! oldest incremental migration we still carry, cannot be migrated in place
//! and must be reset (deleted and re-derived from upstream).

use rusqlite::Connection;

pub const LATEST_SCHEMA_VERSION: u32 = 8;

/// Versions below this have no incremental path; the replica is rebuilt.
const OLDEST_MIGRATABLE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCheck {
    UpToDate,
    MigrationsNeeded,
    ResetRequired { found: u32 },
}

pub fn current_version(conn: &Connection) -> anyhow::Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_version(conn: &Connection, version: u32) -> anyhow::Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

pub fn check_schema(conn: &Connection) -> anyhow::Result<SchemaCheck> {
    let version = current_version(conn)?;
    let check = if version == LATEST_SCHEMA_VERSION {
        SchemaCheck::UpToDate
    } else if version == 0 || (OLDEST_MIGRATABLE_VERSION..LATEST_SCHEMA_VERSION).contains(&version)
    {
        SchemaCheck::MigrationsNeeded
    } else {
        SchemaCheck::ResetRequired { found: version }
    };
    Ok(check)
}

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&rusqlite::Transaction) -> anyhow::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        apply: |tx| {
            tx.execute_batch(
                r#"
                CREATE TABLE "_zero.clients" (
                    "clientGroupID" TEXT NOT NULL,
                    "clientID" TEXT NOT NULL,
                    "lastMutationID" INTEGER NOT NULL,
                    "userID" TEXT,
                    PRIMARY KEY ("clientGroupID", "clientID")
                );
                CREATE TABLE "_zero.changeLog" (
                    "watermark" TEXT NOT NULL,
                    "pos" INTEGER NOT NULL,
                    "change" TEXT NOT NULL,
                    PRIMARY KEY ("watermark", "pos")
                );
                "#,
            )?;
            Ok(())
        },
    },
    Migration {
        version: 2,
        name: "runtime-events",
        apply: |tx| {
            tx.execute_batch(
                r#"
                CREATE TABLE "_zero.runtime_events" (
                    "timestamp" INTEGER NOT NULL,
                    "event" TEXT NOT NULL,
                    "detail" TEXT
                );
                "#,
            )?;
            Ok(())
        },
    },
    Migration {
        version: 3,
        name: "table-metadata",
        apply: |tx| {
            tx.execute_batch(
                r#"
                CREATE TABLE "_zero.tableMetadata" (
                    "schema" TEXT NOT NULL,
                    "table" TEXT NOT NULL,
                    "metadata" TEXT NOT NULL,
                    PRIMARY KEY ("schema", "table")
                );
                "#,
            )?;
            Ok(())
        },
    },
    Migration {
        version: 4,
        name: "column-metadata",
        apply: |tx| {
            tx.execute_batch(
                r#"
                CREATE TABLE "_zero.column_metadata" (
                    "schema" TEXT NOT NULL,
                    "table" TEXT NOT NULL,
                    "column" TEXT NOT NULL,
                    "columnID" INTEGER NOT NULL,
                    "metadata" TEXT,
                    "backfill" TEXT,
                    PRIMARY KEY ("schema", "table", "column")
                );
                "#,
            )?;
            Ok(())
        },
    },
    Migration {
        version: 5,
        name: "change-log-2",
        apply: |tx| {
            // The original change log keyed on (watermark, pos) only; the
            // replacement carries the table so truncations can prune it.
            tx.execute_batch(
                r#"
                CREATE TABLE "_zero.changeLog2" (
                    "watermark" TEXT NOT NULL,
                    "pos" INTEGER NOT NULL,
                    "schema" TEXT NOT NULL,
                    "table" TEXT NOT NULL,
                    "change" TEXT NOT NULL,
                    PRIMARY KEY ("watermark", "pos")
                );
                DROP TABLE "_zero.changeLog";
                "#,
            )?;
            Ok(())
        },
    },
    Migration {
        version: 6,
        // Version placeholder: the backfill bookkeeping originally planned
        // here shipped incomplete and was redone in v8. Kept as a no-op so
        // the version sequence stays contiguous for replicas that already
        // stamped it.
        name: "backfill-bookkeeping-placeholder",
        apply: |_tx| Ok(()),
    },
    Migration {
        version: 7,
        name: "column-metadata-backfill-index",
        apply: |tx| {
            tx.execute_batch(
                r#"
                CREATE INDEX "_zero.column_metadata_backfill"
                    ON "_zero.column_metadata" ("backfill")
                    WHERE "backfill" IS NOT NULL;
                "#,
            )?;
            Ok(())
        },
    },
    Migration {
        version: 8,
        name: "populate-column-backfill",
        apply: |tx| {
            // Columns created before backfill tracking existed have a NULL
            // marker even when their table never finished loading. Re-mark
            // every column of tables that have metadata but no change-log
            // entries, so the backfill manager picks them up.
            tx.execute(
                r#"
                UPDATE "_zero.column_metadata" SET "backfill" = ''
                WHERE "backfill" IS NULL
                  AND NOT EXISTS (
                    SELECT 1 FROM "_zero.changeLog2" l
                    WHERE l."schema" = "_zero.column_metadata"."schema"
                      AND l."table" = "_zero.column_metadata"."table"
                  )
                "#,
                [],
            )?;
            Ok(())
        },
    },
];

/// Apply every migration past the current version, each in its own
/// transaction, stamping `user_version` as it goes.
pub fn apply_migrations(conn: &mut Connection, newly_created: bool) -> anyhow::Result<()> {
    let start = current_version(conn)?;
    for migration in MIGRATIONS {
        if migration.version <= start {
            continue;
        }
        let tx = conn.transaction()?;
        (migration.apply)(&tx)?;
        tx.commit()?;
        set_version(conn, migration.version)?;
        if !newly_created {
            tracing::info!(
                "Applied replica migration v{} ({})",
                migration.version,
                migration.name
            );
        }
    }
    Ok(())
}
