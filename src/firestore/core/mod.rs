pub mod query;
pub mod sync_engine;
mod target_id_generator;
pub mod view;

pub use query::{Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query};
pub use sync_engine::{ListenerId, SnapshotSender, SyncEngine, SyncEngineSettings, WriteCallback};
pub use target_id_generator::TargetIdGenerator;
pub use view::{
    ChangeType, DocumentViewChange, LimboDocumentChange, View, ViewChange, ViewDocumentChanges,
    ViewSnapshot,
};
