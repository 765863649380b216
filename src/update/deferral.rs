//! Per-device "remind me later". In memory only.
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

pub const DEFAULT_DEFERRAL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct DeferralStore {
    window: Duration,
    until: HashMap<String, DateTime<Utc>>,
}

impl Default for DeferralStore {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_DEFERRAL_HOURS))
    }
}

impl DeferralStore {
    pub fn new(window: Duration) -> Self {
        Self { window, until: HashMap::new() }
    }

    pub fn defer(&mut self, uid: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let until = now + self.window;
        log::info!("Update prompts for {} suppressed until {}", uid, until);
        self.until.insert(uid.to_string(), until);
        until
    }

    /// End of the suppression window for `uid`, if one is still open.
    pub fn suppressed_until(&self, uid: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.until.get(uid).copied().filter(|until| *until > now)
    }

    pub fn clear(&mut self, uid: &str) {
        self.until.remove(uid);
    }
}
