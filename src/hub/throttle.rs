//! Per-user sliding-window rate limiter for inbound events.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::db::models::UserId;

pub struct ThrottleGuard {
    /// `None` disables throttling.
    limit: Option<usize>,
    window: Duration,
    recent: DashMap<UserId, VecDeque<Instant>>,
}

impl ThrottleGuard {
    /// `limit <= 0` turns the guard into a pass-through.
    pub fn new(limit: i64, window: Duration) -> Self {
        Self {
            limit: usize::try_from(limit).ok().filter(|l| *l > 0),
            window,
            recent: DashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.limit.is_some()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn allow(&self, user_id: UserId) -> bool {
        self.allow_at(user_id, Instant::now())
    }

    /// Accepts and records the event iff fewer than `limit` events from this
    /// user fall inside `(now - window, now]`. Rejections are not recorded.
    pub fn allow_at(&self, user_id: UserId, now: Instant) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };

        let mut stamps = self.recent.entry(user_id).or_default();
        while let Some(&oldest) = stamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= limit {
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Drop state for users with nothing left inside the window.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    pub fn prune_idle_at(&self, now: Instant) -> usize {
        let before = self.recent.len();
        self.recent.retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|&last| now.saturating_duration_since(last) < self.window)
        });
        before - self.recent.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.recent.len()
    }
}
