//! Presence membership tracking.
//!
//! For every presence-enabled channel the tracker holds the set of member
//! identifiers currently attached. The set is seeded from a transport
//! snapshot on subscribe and updated from enter/leave events afterwards;
//! both updates are idempotent, duplicate enters and leaves of absent
//! members are no-ops.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::transport::{PresenceAction, PresenceEvent};

/// A membership change on one channel, published to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub channel: String,
    pub action: PresenceAction,
    pub client_id: String,
}

/// Tracks channel membership sets.
pub struct PresenceTracker {
    members: DashMap<String, HashSet<String>>,
    changes_tx: broadcast::Sender<PresenceChange>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(64);
        Self {
            members: DashMap::new(),
            changes_tx,
        }
    }

    /// Replace a channel's membership with a snapshot from the transport.
    pub fn seed(&self, channel: &str, snapshot: Vec<String>) {
        let count = snapshot.len();
        self.members
            .insert(channel.to_string(), snapshot.into_iter().collect());
        tracing::debug!(channel = %channel, members = count, "Presence seeded");
    }

    /// Apply an enter/leave event from the channel's stream.
    pub fn apply(&self, channel: &str, event: PresenceEvent) {
        match event.action {
            PresenceAction::Enter => self.enter(channel, &event.client_id),
            PresenceAction::Leave => self.leave(channel, &event.client_id),
        }
    }

    /// Add a member. Duplicate enters are no-ops and not rebroadcast.
    pub fn enter(&self, channel: &str, client_id: &str) {
        let added = self
            .members
            .entry(channel.to_string())
            .or_default()
            .insert(client_id.to_string());

        if added {
            self.notify(channel, PresenceAction::Enter, client_id);
        }
    }

    /// Remove a member. Leaving when absent is a no-op, never an error.
    pub fn leave(&self, channel: &str, client_id: &str) {
        let removed = self
            .members
            .get_mut(channel)
            .map(|mut set| set.remove(client_id))
            .unwrap_or(false);

        if removed {
            self.notify(channel, PresenceAction::Leave, client_id);
        }
    }

    /// Drop the membership set when its channel is unsubscribed.
    pub fn forget(&self, channel: &str) {
        self.members.remove(channel);
    }

    /// Current members of a channel, sorted for stable observation.
    pub fn members(&self, channel: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .members
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.members.get(channel).map(|set| set.len()).unwrap_or(0)
    }

    /// Subscribe to membership changes.
    pub fn changes(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes_tx.subscribe()
    }

    fn notify(&self, channel: &str, action: PresenceAction, client_id: &str) {
        tracing::debug!(channel = %channel, client_id = %client_id, action = ?action, "Presence changed");
        let _ = self.changes_tx.send(PresenceChange {
            channel: channel.to_string(),
            action,
            client_id: client_id.to_string(),
        });
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_replaces_membership() {
        let tracker = PresenceTracker::new();
        tracker.enter("presence:pit", "stale");

        tracker.seed(
            "presence:pit",
            vec!["engineer-1".to_string(), "engineer-2".to_string()],
        );

        assert_eq!(tracker.members("presence:pit"), vec!["engineer-1", "engineer-2"]);
    }

    #[test]
    fn test_enter_is_idempotent() {
        let tracker = PresenceTracker::new();

        tracker.enter("presence:pit", "engineer-1");
        tracker.enter("presence:pit", "engineer-1");

        assert_eq!(tracker.member_count("presence:pit"), 1);
    }

    #[test]
    fn test_leave_absent_member_is_noop() {
        let tracker = PresenceTracker::new();

        tracker.leave("presence:pit", "ghost");
        assert_eq!(tracker.member_count("presence:pit"), 0);

        tracker.enter("presence:pit", "engineer-1");
        tracker.leave("presence:pit", "engineer-1");
        tracker.leave("presence:pit", "engineer-1");
        assert_eq!(tracker.member_count("presence:pit"), 0);
    }

    #[test]
    fn test_changes_broadcast_skips_noops() {
        let tracker = PresenceTracker::new();
        let mut changes = tracker.changes();

        tracker.enter("presence:pit", "engineer-1");
        tracker.enter("presence:pit", "engineer-1");
        tracker.leave("presence:pit", "engineer-1");

        assert_eq!(
            changes.try_recv().unwrap(),
            PresenceChange {
                channel: "presence:pit".to_string(),
                action: PresenceAction::Enter,
                client_id: "engineer-1".to_string(),
            }
        );
        assert_eq!(
            changes.try_recv().unwrap().action,
            PresenceAction::Leave
        );
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_forget_drops_channel() {
        let tracker = PresenceTracker::new();
        tracker.enter("presence:pit", "engineer-1");

        tracker.forget("presence:pit");

        assert_eq!(tracker.member_count("presence:pit"), 0);
    }
}
