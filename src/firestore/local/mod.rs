mod local_serializer;
pub mod local_store;
pub mod storage;
mod target_data;

#[doc(inline)]
pub use local_store::{DocumentMap, LocalStore, LocalWriteResult};
#[doc(inline)]
pub use storage::{FileStorage, MemoryStorage, StorageBackend, StorageTransaction, StorageWrite};
pub use target_data::{TargetData, TargetPurpose};
