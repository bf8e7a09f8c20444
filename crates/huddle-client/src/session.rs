use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};
use uuid::Uuid;

use huddle_types::User;

use crate::backend::Backend;
use crate::error::{ClientError, Result};

/// The authenticated connection shared by every view.
///
/// Cloning is cheap. Views only read through it; `sign_out` is the one
/// operation that tears it down.
pub struct Session<B> {
    inner: Arc<SessionInner<B>>,
}

struct SessionInner<B> {
    backend: B,
    user: User,
    signed_out: AtomicBool,
}

impl<B> Clone for Session<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B, user: User) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                backend,
                user,
                signed_out: AtomicBool::new(false),
            }),
        }
    }

    /// Asks the backend who is signed in and wraps it in a session.
    pub async fn establish(backend: B) -> Result<Self> {
        let user = backend.current_user().await?;
        info!("Session established for {}", user.id);
        Ok(Self::new(backend, user))
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn user(&self) -> &User {
        &self.inner.user
    }

    pub fn user_id(&self) -> Uuid {
        self.inner.user.id
    }

    pub fn is_signed_in(&self) -> bool {
        !self.inner.signed_out.load(Ordering::Acquire)
    }

    /// Fails with `NotSignedIn` once `sign_out` has succeeded.
    pub fn ensure_signed_in(&self) -> Result<()> {
        if self.is_signed_in() { Ok(()) } else { Err(ClientError::NotSignedIn) }
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.ensure_signed_in()?;
        if let Err(e) = self.inner.backend.sign_out().await {
            error!("Error signing out: {}", e);
            return Err(e);
        }
        self.inner.signed_out.store(true, Ordering::Release);
        info!("Signed out {}", self.inner.user.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, MemoryWorld};

    #[tokio::test]
    async fn establish_asks_backend_for_user() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let session = Session::establish(world.connect(&alice)).await.unwrap();
        assert_eq!(session.user_id(), alice.id);
        assert_eq!(session.user().email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn sign_out_is_shared_by_clones() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let session: Session<MemoryBackend> = Session::new(world.connect(&alice), alice);
        let view = session.clone();

        session.sign_out().await.unwrap();
        assert!(!view.is_signed_in());
        assert!(matches!(view.ensure_signed_in(), Err(ClientError::NotSignedIn)));
        assert!(matches!(session.sign_out().await, Err(ClientError::NotSignedIn)));
    }

    #[tokio::test]
    async fn failed_sign_out_keeps_session() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let session = Session::new(world.connect(&alice), alice);
        session.backend().fail_next("logout failed");
        assert!(session.sign_out().await.is_err());
        assert!(session.is_signed_in());
    }
}
