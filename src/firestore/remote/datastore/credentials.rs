use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::User;

/// Called with the current user whenever the signed-in identity or its token changes.
pub type CredentialChangeListener = Arc<dyn Fn(User) + Send + Sync>;

#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Forces the next `get_token` to fetch a fresh token.
    fn invalidate_token(&self);

    fn current_user(&self) -> User;

    /// Replaces the identity-change listener; `None` detaches it.
    fn set_change_listener(&self, listener: Option<CredentialChangeListener>);
}

#[derive(Default)]
struct StaticCredentialsState {
    user: User,
    token: Option<String>,
    invalidations: usize,
    listener: Option<CredentialChangeListener>,
}

/// In-process credentials whose user and token are set by the embedding application.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    inner: Arc<Mutex<StaticCredentialsState>>,
}

impl StaticCredentials {
    pub fn new(user: User, token: Option<String>) -> Self {
        let credentials = Self::default();
        if let Ok(mut state) = credentials.inner.lock() {
            state.user = user;
            state.token = token;
        }
        credentials
    }

    pub fn unauthenticated() -> Self {
        Self::default()
    }

    /// Switches identity or token, notifying the listener when either changed.
    pub fn set_user(&self, user: User, token: Option<String>) {
        let notify = match self.inner.lock() {
            Ok(mut state) => {
                let changed = state.user != user || state.token != token;
                state.user = user.clone();
                state.token = token;
                if changed {
                    state.listener.clone()
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        // Called outside the lock so the listener may read the credentials back.
        if let Some(listener) = notify {
            listener(user);
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.inner
            .lock()
            .map(|state| state.invalidations)
            .unwrap_or_default()
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .ok()
            .and_then(|state| state.token.clone()))
    }

    fn invalidate_token(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.invalidations += 1;
        }
    }

    fn current_user(&self) -> User {
        self.inner
            .lock()
            .map(|state| state.user.clone())
            .unwrap_or_default()
    }

    fn set_change_listener(&self, listener: Option<CredentialChangeListener>) {
        if let Ok(mut state) = self.inner.lock() {
            state.listener = listener;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn listener_fires_on_identity_or_token_change() {
        let credentials = StaticCredentials::new(User::new("alice"), Some("t1".into()));
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&calls);
        credentials.set_change_listener(Some(Arc::new(move |_user| {
            observed.fetch_add(1, Ordering::SeqCst);
        })));

        credentials.set_user(User::new("alice"), Some("t1".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        credentials.set_user(User::new("alice"), Some("t2".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(credentials.get_token().await.unwrap().as_deref(), Some("t2"));

        credentials.set_user(User::new("bob"), None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(credentials.current_user(), User::new("bob"));
    }

    #[test]
    fn counts_invalidations() {
        let credentials = StaticCredentials::unauthenticated();
        credentials.invalidate_token();
        credentials.invalidate_token();
        assert_eq!(credentials.invalidation_count(), 2);
        assert!(!credentials.current_user().is_authenticated());
    }
}
