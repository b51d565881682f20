//! Member cloud sync for HiCal.
//!
//! [`CloudSyncEngine`] reconciles the local [`hical_events::EventStore`] with a
//! [`CloudBackend`]: last modification wins, deletions travel as tombstones,
//! and only one sync runs at a time.

pub mod backend;
pub mod engine;
pub mod http;
pub mod memory;
pub mod state;

pub use backend::{
    BackupReceipt, BackupSnapshot, CloudBackend, PullResponse, RemoteChange, UploadAck,
};
pub use engine::{CloudSyncEngine, SyncReport, SyncStats};
pub use http::HttpCloudBackend;
pub use memory::MemoryCloudBackend;
pub use state::{SyncStateStore, SyncStatus};
