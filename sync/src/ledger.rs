//! Generic optimistic apply/commit/rollback engine, independent of any
//! presentation layer.

use quillchat_model::ActionId;
use std::collections::HashMap;

/// Human-readable messaging attached to a pending action.
#[derive(Debug, Clone, Default)]
pub struct ActionNotices {
    pub on_success: String,
    pub on_failure: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Re-using an in-flight action id is a programmer error, not a
    /// user-facing condition.
    #[error("action {0} is already pending")]
    AlreadyPending(ActionId),
    #[error("action {0} is not pending")]
    NotPending(ActionId),
}

struct Entry<S> {
    rollback: Box<dyn FnOnce(&mut S) + Send>,
    notices: ActionNotices,
}

/// Tracks optimistic mutations over a state `S`.
///
/// `begin` applies the forward transform immediately and records its exact
/// inverse. `commit` discards the entry: the optimistic state is the final
/// state, there is no replacement swap. `roll_back` applies the inverse to
/// the state as it exists at failure time, so unrelated pending actions
/// applied in between are preserved — inverses must target their own
/// mutation by identity, not by snapshot.
pub struct OptimisticLedger<S> {
    pending: HashMap<ActionId, Entry<S>>,
}

impl<S> Default for OptimisticLedger<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> OptimisticLedger<S> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Apply `apply` to `state` and track `rollback` under `id`.
    pub fn begin<F, R>(
        &mut self,
        id: ActionId,
        notices: ActionNotices,
        state: &mut S,
        apply: F,
        rollback: R,
    ) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut S),
        R: FnOnce(&mut S) + Send + 'static,
    {
        if self.pending.contains_key(&id) {
            return Err(LedgerError::AlreadyPending(id));
        }
        apply(state);
        self.pending.insert(
            id,
            Entry {
                rollback: Box::new(rollback),
                notices,
            },
        );
        Ok(())
    }

    /// Confirmation arrived: drop the pending entry and hand back the
    /// success notice.
    pub fn commit(&mut self, id: ActionId) -> Result<ActionNotices, LedgerError> {
        self.pending
            .remove(&id)
            .map(|entry| entry.notices)
            .ok_or(LedgerError::NotPending(id))
    }

    /// The action failed: run its inverse against the current state and
    /// hand back the failure notice.
    pub fn roll_back(&mut self, id: ActionId, state: &mut S) -> Result<ActionNotices, LedgerError> {
        let entry = self.pending.remove(&id).ok_or(LedgerError::NotPending(id))?;
        (entry.rollback)(state);
        Ok(entry.notices)
    }

    pub fn is_pending(&self, id: ActionId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
