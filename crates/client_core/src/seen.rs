use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use shared::domain::{Message, MessageId, ProfileId, SeenRecord};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityChange {
    Entered,
    Unchanged,
    Left,
}

/// Decides which rendered messages count as seen by the viewer, and makes sure each one is
/// acknowledged at most once while the conversation stays open.
pub struct SeenTracker {
    viewer: ProfileId,
    visible_fraction: f32,
    dwell: Duration,
    visible_since: HashMap<MessageId, Instant>,
    acknowledged: HashMap<MessageId, SeenRecord>,
}

impl SeenTracker {
    pub fn new(viewer: ProfileId, visible_fraction: f32, dwell: Duration) -> Self {
        Self {
            viewer,
            visible_fraction: visible_fraction.clamp(0.0, 1.0),
            dwell,
            visible_since: HashMap::new(),
            acknowledged: HashMap::new(),
        }
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    /// Records the rendered fraction of `id` currently inside the viewport.
    pub fn observe(&mut self, id: &MessageId, fraction: f32, now: Instant) -> VisibilityChange {
        let visible = fraction >= self.visible_fraction && fraction > 0.0;
        match (visible, self.visible_since.contains_key(id)) {
            (true, false) => {
                self.visible_since.insert(id.clone(), now);
                VisibilityChange::Entered
            }
            (false, true) => {
                self.visible_since.remove(id);
                VisibilityChange::Left
            }
            _ => VisibilityChange::Unchanged,
        }
    }

    /// True once `id` has stayed visible for the whole dwell time without leaving.
    pub fn dwell_elapsed(&self, id: &MessageId, now: Instant) -> bool {
        self.visible_since
            .get(id)
            .is_some_and(|since| now.saturating_duration_since(*since) >= self.dwell)
    }

    pub fn is_eligible(&self, message: &Message) -> bool {
        message.sender_id != self.viewer
            && !message.seen
            && !message.id.is_provisional()
            && !self.acknowledged.contains_key(&message.id)
    }

    /// Marks `message` acknowledged if it qualifies right now. A returned record obliges the
    /// caller to send exactly one receipt; the id never qualifies again until [`reset`].
    ///
    /// [`reset`]: SeenTracker::reset
    pub fn claim(&mut self, message: &Message, now: Instant) -> Option<SeenRecord> {
        if !self.is_eligible(message) || !self.dwell_elapsed(&message.id, now) {
            return None;
        }
        self.visible_since.remove(&message.id);
        let record = SeenRecord {
            message_id: message.id.clone(),
            observed_by: self.viewer.clone(),
            observed_at: Utc::now(),
        };
        self.acknowledged.insert(message.id.clone(), record.clone());
        Some(record)
    }

    pub fn is_acknowledged(&self, id: &MessageId) -> bool {
        self.acknowledged.contains_key(id)
    }

    pub fn record(&self, id: &MessageId) -> Option<&SeenRecord> {
        self.acknowledged.get(id)
    }

    pub fn reset(&mut self) {
        self.visible_since.clear();
        self.acknowledged.clear();
    }
}
