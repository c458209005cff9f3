//! Debounce and cooldown decision

use std::time::Duration;
use tokio::time::Instant;

/// Accepts a detection only after `debounce_samples` consecutive present
/// samples and at least `cooldown` since the previously accepted detection.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    cooldown: Duration,
    debounce_samples: u32,
    streak: u32,
    last_accepted: Option<Instant>,
}

impl CooldownGate {
    pub fn new(cooldown: Duration, debounce_samples: u32) -> Self {
        Self {
            cooldown,
            debounce_samples: debounce_samples.max(1),
            streak: 0,
            last_accepted: None,
        }
    }

    /// Feed one sample taken at `now`; true when it yields an accepted detection
    pub fn observe(&mut self, present: bool, now: Instant) -> bool {
        if !present {
            self.streak = 0;
            return false;
        }

        self.streak = self.streak.saturating_add(1);
        if self.streak < self.debounce_samples {
            return false;
        }

        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }

        self.last_accepted = Some(now);
        true
    }

    /// Forget the current presence streak (after a read failure)
    pub fn break_streak(&mut self) {
        self.streak = 0;
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn last_accepted(&self) -> Option<Instant> {
        self.last_accepted
    }
}
