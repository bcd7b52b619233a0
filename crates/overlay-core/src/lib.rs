pub mod config;
pub mod error;
pub mod file_store;
pub mod logging;
pub mod memory_store;
pub mod model;
pub mod store;

pub use config::Settings;
pub use error::{StoreError, StoreResult};
pub use file_store::FileOverlayStore;
pub use memory_store::MemoryOverlayStore;
pub use model::{
    ChangeType, NewSnapshot, Overlay, OverlayStatus, Owner, Snapshot, SnapshotFilter,
    SnapshotStatus,
};
pub use store::OverlayStore;
