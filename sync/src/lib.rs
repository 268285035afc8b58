pub mod bus;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod presence;
pub mod store;
pub mod window;

pub use bus::{BusError, BusPool, EventBus, MemoryBus, Topic};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use engine::{ConversationHandle, ConversationSnapshot, SyncEngine};
pub use error::SyncError;
pub use identity::{IdentityProvider, StaticIdentity};
pub use store::{MessageStore, PageCursor, StoreError};
pub use window::PageRequest;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
