//! Snapshot metadata: named, queryable markers attached to a point in the
//! log stream (C10, C11).

pub mod cache;
pub mod engine;
pub mod record;
pub mod sector;

pub use engine::{snapshot_data_initialize, SnapshotEngine};
pub use record::{SnapshotRecord, INVALID_SNAPSHOT_ID, MAX_SNAPSHOT_ID, SNAPSHOT_NAME_MAX_LEN};
pub use sector::{SnapshotSector, SECTOR_TYPE_SNAPSHOT};
