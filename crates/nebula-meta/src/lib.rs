pub mod error;
pub mod etcd;
pub mod events;
pub mod memory;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use etcd::EtcdMetaStore;
pub use events::{Event, EventRecorder, EventType, MetaEventRecorder};
pub use memory::MemoryMetaStore;
pub use store::{ResourceStore, UpdateOutcome};
pub use types::{CasOutcome, KvEntry, MetaStore, WatchEvent, WatchStream};
