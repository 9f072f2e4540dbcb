//! A block-level write-ahead-log overlay for a data block device.
//!
//! Every write directed at a walb device is first appended as a *log pack*
//! to a dedicated log device arranged as a circular ring buffer, then
//! asynchronously applied to the data device. A crash-consistent redo
//! procedure replays outstanding log packs after restart. Named snapshots
//! of lsid checkpoints live in a bounded on-device metadata region.
//!
//! See [`control::WalbControl`] for the assembled-device entry point.

pub mod block;
pub mod checksum;
pub mod control;
pub mod error;
pub mod log_pack;
pub mod log_record;
pub mod redo;
pub mod ring;
pub mod sector;
pub mod sector_array;
pub mod snapshot;
pub mod super_sector;
pub mod walblog;

pub use control::{format_ldev, StartParams, WalbControl};
pub use error::{WalbError, WalbResult};
pub use super_sector::{SuperSector, INVALID_LSID, MAX_LSID};
