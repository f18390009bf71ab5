//! The logical change-stream model: everything that flows from the upstream
//! reader and the backfill streamer to the downstream replicator.

use std::{
    collections::BTreeMap,
    fmt,
};

use common::watermark::Watermark;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

/// Identity of a table: `(schema, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Replication-level metadata for a table. `row_key` maps key column names
/// to their type descriptors; an empty map marks a table without a usable
/// row key, which cannot stream backfill rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    #[serde(default)]
    pub row_key: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    pub schema: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TableMetadata>,
}

impl TableSpec {
    pub fn id(&self) -> TableId {
        TableId::new(self.schema.clone(), self.name.clone())
    }

    pub fn row_key_columns(&self) -> impl Iterator<Item = &String> {
        self.metadata
            .iter()
            .flat_map(|metadata| metadata.row_key.keys())
    }
}

/// Column descriptor inside a backfill request: just the upstream column id,
/// which survives renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub id: u64,
}

/// A table (and the subset of its columns) whose data still needs to be
/// loaded into the replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub table: TableSpec,
    pub columns: BTreeMap<String, ColumnSpec>,
}

impl BackfillRequest {
    pub fn table_id(&self) -> TableId {
        self.table.id()
    }

    pub fn has_row_key(&self) -> bool {
        self.table.row_key_columns().next().is_some()
    }
}

/// A batch of rows at a snapshot watermark, produced by the backfill
/// streamer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillChunk {
    pub table: TableId,
    pub columns: Vec<String>,
    pub watermark: Watermark,
    pub rows: Vec<Vec<JsonValue>>,
}

/// Terminal message of a backfill stream: the named columns are now loaded
/// up to `watermark`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillCompleted {
    pub table: TableId,
    pub watermark: Watermark,
    pub columns: Vec<String>,
    pub row_key_columns: Vec<String>,
}

/// A single data entry inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DataChange {
    Insert {
        table: TableId,
        row: JsonValue,
    },
    Update {
        table: TableId,
        row: JsonValue,
        /// Set when the update moved the row to a new key. The replicator
        /// models this as delete-old + insert-new, which invalidates any
        /// backfill snapshot taken before this transaction.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_row_key: Option<JsonValue>,
    },
    Delete {
        table: TableId,
        row_key: JsonValue,
    },
    Truncate {
        table: TableId,
    },
    CreateTable {
        table: TableSpec,
        /// Columns to load, when the new table is already populated
        /// upstream.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backfill: Option<BTreeMap<String, ColumnSpec>>,
    },
    DropTable {
        table: TableId,
    },
    RenameTable {
        table: TableId,
        new: TableId,
    },
    UpdateTableMetadata {
        table: TableId,
        metadata: TableMetadata,
    },
    AddColumn {
        table: TableSpec,
        column: String,
        spec: ColumnSpec,
        /// Present when the new column needs its data loaded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backfill: Option<ColumnSpec>,
    },
    DropColumn {
        table: TableId,
        column: String,
    },
    UpdateColumn {
        table: TableId,
        old_name: String,
        new_name: String,
        spec: ColumnSpec,
    },
    CreateIndex {
        table: TableId,
        name: String,
    },
    DropIndex {
        table: TableId,
        name: String,
    },
    Backfill(BackfillChunk),
    BackfillCompleted(BackfillCompleted),
    /// Relation metadata refresh from the change source.
    Relation {
        table: TableSpec,
    },
}

/// Out-of-band progress report from the change source. Only acked statuses
/// are forwarded downstream; the rest exist to advance listener watermarks
/// without churn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub watermark: Watermark,
    #[serde(default)]
    pub ack: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChangeStreamMessage {
    Begin { watermark: Watermark },
    Commit { watermark: Watermark },
    Data(DataChange),
    Status(StatusMessage),
    Rollback,
}

impl ChangeStreamMessage {
    pub fn begin(watermark: Watermark) -> Self {
        ChangeStreamMessage::Begin { watermark }
    }

    pub fn commit(watermark: Watermark) -> Self {
        ChangeStreamMessage::Commit { watermark }
    }
}
