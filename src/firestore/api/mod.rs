mod client;
mod settings;
mod subscription;

pub use client::FirestoreClient;
pub use settings::{ClientComponents, ClientSettings};
pub use subscription::{PendingWrite, QuerySubscription};
