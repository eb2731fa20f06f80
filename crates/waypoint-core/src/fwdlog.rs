//! Per-bundle forwarding log
//!
//! An append-only record of what the node decided to do with a bundle on
//! each link, and how that turned out. The daemon consults it to decide
//! retransmission, custody timer validity, and report generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome state of a forwarding decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardingState {
    /// Queued on the link, not yet handed to the convergence layer
    Queued,
    /// Handed to the convergence layer, transmission in progress
    InFlight,
    /// Fully transmitted (acknowledged for reliable links)
    Transmitted,
    /// Delivered to a local registration
    Delivered,
    /// Cancelled before transmission completed
    Cancelled,
    /// Transmission failed
    Failed,
}

/// What the router asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForwardingAction {
    /// Forward the (single) copy of the bundle
    #[default]
    Forward,
    /// Send a copy, keeping the bundle pending for other links
    Copy,
}

/// One forwarding decision and its current outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingEntry {
    /// Link the bundle was queued on (or registration endpoint for delivery)
    pub link: String,
    /// Forward vs copy semantics
    pub action: ForwardingAction,
    /// Current outcome state
    pub state: ForwardingState,
    /// When the entry was created or last updated
    pub timestamp: DateTime<Utc>,
}

/// The append-only forwarding log of a bundle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardingLog {
    entries: Vec<ForwardingEntry>,
}

impl ForwardingLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry for a new forwarding decision
    pub fn add_entry(&mut self, link: &str, action: ForwardingAction, state: ForwardingState) {
        self.entries.push(ForwardingEntry {
            link: link.to_string(),
            action,
            state,
            timestamp: Utc::now(),
        });
    }

    /// Update the most recent entry for `link` to a new state
    ///
    /// Returns false if the log has no entry for that link.
    pub fn update(&mut self, link: &str, state: ForwardingState) -> bool {
        for entry in self.entries.iter_mut().rev() {
            if entry.link == link {
                entry.state = state;
                entry.timestamp = Utc::now();
                return true;
            }
        }
        false
    }

    /// The latest state recorded for `link`
    pub fn state_for(&self, link: &str) -> Option<ForwardingState> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.link == link)
            .map(|e| e.state)
    }

    /// Count entries currently in any of the given states
    pub fn count_in(&self, states: &[ForwardingState]) -> usize {
        self.entries
            .iter()
            .filter(|e| states.contains(&e.state))
            .count()
    }

    /// Whether `link` has an entry that is in-flight or transmitted
    ///
    /// This is the condition under which a custody timer for the link is
    /// allowed to stay armed.
    pub fn has_transmission_on(&self, link: &str) -> bool {
        matches!(
            self.state_for(link),
            Some(ForwardingState::InFlight) | Some(ForwardingState::Transmitted)
        )
    }

    /// All entries, oldest first
    pub fn entries(&self) -> &[ForwardingEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_update() {
        let mut log = ForwardingLog::new();
        log.add_entry("link-a", ForwardingAction::Forward, ForwardingState::Queued);

        assert_eq!(log.state_for("link-a"), Some(ForwardingState::Queued));
        assert!(log.update("link-a", ForwardingState::InFlight));
        assert_eq!(log.state_for("link-a"), Some(ForwardingState::InFlight));
        assert!(!log.update("link-b", ForwardingState::InFlight));
    }

    #[test]
    fn test_latest_entry_wins() {
        let mut log = ForwardingLog::new();
        log.add_entry("link-a", ForwardingAction::Forward, ForwardingState::Failed);
        log.add_entry("link-a", ForwardingAction::Forward, ForwardingState::Queued);

        assert_eq!(log.state_for("link-a"), Some(ForwardingState::Queued));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_count_in() {
        let mut log = ForwardingLog::new();
        log.add_entry("a", ForwardingAction::Copy, ForwardingState::Queued);
        log.add_entry("b", ForwardingAction::Copy, ForwardingState::Transmitted);
        log.add_entry("c", ForwardingAction::Copy, ForwardingState::Transmitted);

        assert_eq!(log.count_in(&[ForwardingState::Transmitted]), 2);
        assert_eq!(
            log.count_in(&[ForwardingState::Queued, ForwardingState::Transmitted]),
            3
        );
    }

    #[test]
    fn test_has_transmission_on() {
        let mut log = ForwardingLog::new();
        log.add_entry("a", ForwardingAction::Forward, ForwardingState::Queued);
        assert!(!log.has_transmission_on("a"));

        log.update("a", ForwardingState::InFlight);
        assert!(log.has_transmission_on("a"));

        log.update("a", ForwardingState::Cancelled);
        assert!(!log.has_transmission_on("a"));
    }
}
