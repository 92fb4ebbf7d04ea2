mod database_id;
mod document;
mod document_key;
mod field_path;
mod mutation;
mod resource_path;
mod timestamp;
mod user;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState};
pub use document_key::DocumentKey;
pub use field_path::FieldPath;
pub use mutation::{
    BatchId, FieldTransform, Mutation, MutationBatch, MutationBatchResult, MutationKind,
    MutationResult, Precondition, TransformOperation,
};
pub use resource_path::ResourcePath;
pub use timestamp::{SnapshotVersion, Timestamp};
pub use user::User;

pub type TargetId = i32;
