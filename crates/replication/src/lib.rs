//! The replication-manager core: the multiplexed change stream and the
//! backfill scheduler that stacks snapshot loads on top of it.

pub mod backfill;
pub mod message;
pub mod multiplexer;

mod metrics;

#[cfg(test)]
mod tests;

pub use backfill::{
    BackfillEvent,
    BackfillManager,
    BackfillStreamer,
    MissingRowKeyError,
    SchemaIncompatibilityError,
};
pub use message::{
    BackfillChunk,
    BackfillCompleted,
    BackfillRequest,
    ChangeStreamMessage,
    ColumnSpec,
    DataChange,
    StatusMessage,
    TableId,
    TableMetadata,
    TableSpec,
};
pub use multiplexer::ChangeStreamMultiplexer;
