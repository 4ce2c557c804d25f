/// Per-device identity tag.
pub mod device;
/// JSON document helpers.
pub mod document;
/// Device key-value storage.
pub mod kv;
/// Family-partitioned local game records.
pub mod local_store;
/// Summary projections stored alongside full records.
pub mod models;
/// Remote document store contract and backends.
pub mod remote;
/// Remote storage errors.
pub mod storage;
/// Pending remote mutations.
pub mod sync_queue;
