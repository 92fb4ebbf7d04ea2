pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use api::{ClientComponents, ClientSettings, FirestoreClient, PendingWrite, QuerySubscription};
pub use self::core::{Query, ViewSnapshot};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
