//! Error taxonomy for the synchronization engine.

use crate::bus::BusError;
use crate::store::StoreError;
use quillchat_model::ActionId;

/// Errors surfaced to the host by engine operations.
///
/// A stale read-mark is deliberately absent: writing an older watermark is
/// silently skipped, never reported.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("message store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("no authenticated user")]
    Unauthenticated,
    #[error("action {0} is already pending")]
    AlreadyPending(ActionId),
    #[error("event bus error: {0}")]
    Bus(#[from] BusError),
    #[error("conversation is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
