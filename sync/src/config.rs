use std::env;
use std::time::Duration;

/// Runtime configuration for one conversation engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages fetched per history page.
    pub page_size: usize,
    /// Backstop poll cadence; push delivery remains the primary path.
    pub poll_interval: Duration,
    /// Window after the last typing refresh before a peer drops to idle.
    pub typing_expiry: Duration,
    /// Minimum spacing between locally-broadcast typing-start events.
    pub typing_debounce: Duration,
    /// Keystroke silence after which a typing-stop event is broadcast.
    pub typing_pause: Duration,
    /// Coalescing window for read-mark writes to the store.
    pub read_mark_debounce: Duration,
    /// Capacity of the per-conversation command mailbox.
    pub mailbox_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            poll_interval: Duration::from_secs(15),
            typing_expiry: Duration::from_millis(3000),
            typing_debounce: Duration::from_millis(1000),
            typing_pause: Duration::from_millis(2000),
            read_mark_debounce: Duration::from_millis(500),
            mailbox_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Build from `QUILLCHAT_*` environment variables; anything unset or
    /// unparseable falls back to its default.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            page_size: parse_env("QUILLCHAT_PAGE_SIZE").unwrap_or(defaults.page_size),
            poll_interval: env_ms("QUILLCHAT_POLL_INTERVAL_MS", defaults.poll_interval),
            typing_expiry: env_ms("QUILLCHAT_TYPING_EXPIRY_MS", defaults.typing_expiry),
            typing_debounce: env_ms("QUILLCHAT_TYPING_DEBOUNCE_MS", defaults.typing_debounce),
            typing_pause: env_ms("QUILLCHAT_TYPING_PAUSE_MS", defaults.typing_pause),
            read_mark_debounce: env_ms(
                "QUILLCHAT_READ_MARK_DEBOUNCE_MS",
                defaults.read_mark_debounce,
            ),
            mailbox_capacity: parse_env("QUILLCHAT_MAILBOX_CAPACITY")
                .unwrap_or(defaults.mailbox_capacity),
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_ms(name: &str, default: Duration) -> Duration {
    parse_env(name).map(Duration::from_millis).unwrap_or(default)
}
