//! Identity/session collaborator port.

use quillchat_model::UserId;
use std::sync::{Arc, RwLock};

/// Source of the locally-authenticated user, if any.
///
/// Mutating engine operations fail fast with `Unauthenticated` when this
/// returns `None`.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;
}

/// Identity provider backed by a swappable in-memory session slot.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentity {
    user: Arc<RwLock<Option<UserId>>>,
}

impl StaticIdentity {
    pub fn signed_in(user: UserId) -> Self {
        Self {
            user: Arc::new(RwLock::new(Some(user))),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user: UserId) {
        if let Ok(mut slot) = self.user.write() {
            *slot = Some(user);
        }
    }

    pub fn sign_out(&self) {
        if let Ok(mut slot) = self.user.write() {
            *slot = None;
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<UserId> {
        // A poisoned slot reads as signed-out.
        self.user.read().ok().and_then(|slot| *slot)
    }
}
