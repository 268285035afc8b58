//! Ephemeral typing presence: who is typing now, with self-expiring
//! entries, plus the outbound keystroke throttle.
//!
//! Presence is lossy by contract. Stop events may never arrive, so expiry
//! is the only authoritative clear mechanism; nothing here is persisted.

use quillchat_model::UserId;
use std::collections::HashMap;
use std::time::Duration;

/// Per-conversation set of typing peers keyed by last refresh time.
#[derive(Debug)]
pub struct PresenceTracker {
    expiry_ms: i64,
    last_seen: HashMap<UserId, i64>,
}

impl PresenceTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry_ms: expiry.as_millis() as i64,
            last_seen: HashMap::new(),
        }
    }

    /// Typing-start observed (first event or refresh): resets the entry's
    /// expiry window.
    pub fn observe_start(&mut self, user: UserId, now_ms: i64) {
        self.last_seen.insert(user, now_ms);
    }

    /// Explicit stop observed.
    pub fn observe_stop(&mut self, user: UserId) -> bool {
        self.last_seen.remove(&user).is_some()
    }

    /// Drop entries whose window has elapsed; returns who expired.
    pub fn sweep(&mut self, now_ms: i64) -> Vec<UserId> {
        let expiry = self.expiry_ms;
        let expired: Vec<UserId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now_ms - **seen >= expiry)
            .map(|(user, _)| *user)
            .collect();
        for user in &expired {
            self.last_seen.remove(user);
        }
        expired
    }

    /// Users currently shown as typing. An entry past its window is never
    /// reported, even before the next sweep.
    pub fn typing_users(&self, now_ms: i64) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now_ms - **seen < self.expiry_ms)
            .map(|(user, _)| *user)
            .collect();
        users.sort_by_key(|u| u.0);
        users
    }

    pub fn is_typing(&self, user: UserId, now_ms: i64) -> bool {
        self.last_seen
            .get(&user)
            .map(|seen| now_ms - *seen < self.expiry_ms)
            .unwrap_or(false)
    }

    /// Earliest moment any entry expires; the runtime sleeps until then.
    pub fn next_deadline_ms(&self) -> Option<i64> {
        self.last_seen
            .values()
            .map(|seen| *seen + self.expiry_ms)
            .min()
    }

    /// Bulk clear on conversation close.
    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}

/// Coalesces local keystrokes into at most one typing-start broadcast per
/// debounce window and exactly one stop broadcast after a pause.
#[derive(Debug)]
pub struct TypingThrottle {
    debounce_ms: i64,
    pause_ms: i64,
    last_start_ms: Option<i64>,
    stop_deadline_ms: Option<i64>,
}

impl TypingThrottle {
    pub fn new(debounce: Duration, pause: Duration) -> Self {
        Self {
            debounce_ms: debounce.as_millis() as i64,
            pause_ms: pause.as_millis() as i64,
            last_start_ms: None,
            stop_deadline_ms: None,
        }
    }

    /// Record a keystroke; true when a start broadcast should go out now.
    pub fn keystroke(&mut self, now_ms: i64) -> bool {
        self.stop_deadline_ms = Some(now_ms + self.pause_ms);
        let emit = match self.last_start_ms {
            None => true,
            Some(last) => now_ms - last >= self.debounce_ms,
        };
        if emit {
            self.last_start_ms = Some(now_ms);
        }
        emit
    }

    /// Check the pause deadline; true when a stop broadcast should go out.
    pub fn poll_stop(&mut self, now_ms: i64) -> bool {
        match self.stop_deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Force a stop (message sent, conversation closing); true when a stop
    /// broadcast is owed.
    pub fn flush_stop(&mut self) -> bool {
        let active = self.stop_deadline_ms.is_some();
        self.reset();
        active
    }

    pub fn next_deadline_ms(&self) -> Option<i64> {
        self.stop_deadline_ms
    }

    fn reset(&mut self) {
        self.last_start_ms = None;
        self.stop_deadline_ms = None;
    }
}
