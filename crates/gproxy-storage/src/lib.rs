pub mod entities;
pub mod db;
pub mod mirror;
pub mod seaorm;
pub mod sinks;
pub mod snapshot;
pub mod storage;

pub use mirror::{MirroringStorage, RemoteMirror, RemoteMirrorConfig};
pub use seaorm::SeaOrmStorage;
pub use sinks::DbEventSink;
pub use snapshot::{
    CredentialQuotaStateRow, CredentialRow, GlobalConfigRow, ModelConfigRow, ProviderQuotaRow,
    ProviderRow, StorageSnapshot, UserKeyRow, UserRow,
};
pub use storage::{
    LogCursor, LogQueryFilter, LogQueryResult, LogRecord, LogRecordKind, Storage, StorageError,
    StorageResult, UsageAggregate, UsageAggregateFilter,
};
