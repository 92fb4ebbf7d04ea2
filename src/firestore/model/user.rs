use std::fmt::{Display, Formatter};

/// Identity that owns a partition of the mutation queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Stable key used to partition persisted state per user.
    pub fn storage_key(&self) -> String {
        match &self.uid {
            Some(uid) => format!("uid:{uid}"),
            None => "anonymous".to_string(),
        }
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{uid}"),
            None => write!(f, "<anonymous>"),
        }
    }
}
