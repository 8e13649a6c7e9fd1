use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::hierarchy::BatchStats;

const MAX_ALERTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertVariant {
    Info,
    Success,
    Warning,
    Danger,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: u64,
    pub variant: AlertVariant,
    pub title: String,
    pub message: String,
    pub expires_at: Option<Instant>,
}

/// Newest-last queue of user-facing messages.
#[derive(Debug, Default)]
pub struct AlertQueue {
    alerts: VecDeque<Alert>,
    next_id: u64,
}

impl AlertQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        variant: AlertVariant,
        title: impl Into<String>,
        message: impl Into<String>,
        auto_close: Option<(Instant, Duration)>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.alerts.push_back(Alert {
            id,
            variant,
            title: title.into(),
            message: message.into(),
            expires_at: auto_close.map(|(now, after)| now + after),
        });
        while self.alerts.len() > MAX_ALERTS {
            self.alerts.pop_front();
        }
        id
    }

    pub fn dismiss(&mut self, id: u64) {
        self.alerts.retain(|alert| alert.id != id);
    }

    /// Drops expired alerts and returns the next deadline, if any.
    pub fn prune(&mut self, now: Instant) -> Option<Instant> {
        self.alerts
            .retain(|alert| alert.expires_at.map_or(true, |deadline| deadline > now));
        self.alerts.iter().filter_map(|alert| alert.expires_at).min()
    }

    /// The `count` most recent alerts, newest first.
    pub fn newest(&self, count: usize) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().rev().take(count)
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

pub fn batch_summary(stats: &BatchStats, failed: usize) -> String {
    let mut text = format!(
        "Added {} {}, skipped {} {}",
        stats.added,
        plural(stats.added, "file", "files"),
        stats.duplicates,
        plural(stats.duplicates, "duplicate", "duplicates"),
    );
    if failed > 0 {
        text.push_str(&format!(", {failed} failed"));
    }
    text
}

/// Success when everything landed, warning when anything was lost.
pub fn batch_variant(stats: &BatchStats, failed: usize) -> AlertVariant {
    match (stats.added, failed) {
        (0, 0) => AlertVariant::Info,
        (0, _) => AlertVariant::Danger,
        (_, 0) => AlertVariant::Success,
        _ => AlertVariant::Warning,
    }
}

fn plural(count: usize, one: &'static str, many: &'static str) -> &'static str {
    if count == 1 {
        one
    } else {
        many
    }
}
