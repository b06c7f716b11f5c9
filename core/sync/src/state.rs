//! Connectivity state machine for one app session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Last known connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectivityState {
    /// Not probed yet this session.
    Unknown,
    Online,
    Offline,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Unknown => "unknown",
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// A change of connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
    pub at: DateTime<Utc>,
}

impl Transition {
    /// Whether this transition should trigger a queue drain.
    pub fn is_online_edge(&self) -> bool {
        self.to == ConnectivityState::Online && self.from != ConnectivityState::Online
    }
}

/// In-memory tracker of connectivity observations.
///
/// `Unknown -> Online`, `Unknown -> Offline` and `Online <-> Offline` are
/// the only edges; repeated observations of the same state are not
/// transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityTracker {
    state: ConnectivityState,
    last_transition: Option<Transition>,
    last_checked: Option<DateTime<Utc>>,
    transitions: u64,
}

impl ConnectivityTracker {
    pub fn new() -> Self {
        Self {
            state: ConnectivityState::Unknown,
            last_transition: None,
            last_checked: None,
            transitions: 0,
        }
    }

    /// Record a probe result; returns the transition it caused, if any.
    pub fn observe(&mut self, online: bool) -> Option<Transition> {
        let now = Utc::now();
        self.last_checked = Some(now);

        let next = if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        if next == self.state {
            return None;
        }

        let transition = Transition {
            from: self.state,
            to: next,
            at: now,
        };
        self.state = next;
        self.last_transition = Some(transition);
        self.transitions += 1;
        Some(transition)
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn last_transition(&self) -> Option<Transition> {
        self.last_transition
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.last_checked
    }

    /// Number of transitions observed this session.
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }
}

impl Default for ConnectivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unknown() {
        let tracker = ConnectivityTracker::new();
        assert_eq!(tracker.state(), ConnectivityState::Unknown);
        assert!(tracker.last_checked().is_none());
    }

    #[test]
    fn test_unknown_to_online_is_online_edge() {
        let mut tracker = ConnectivityTracker::new();
        let transition = tracker.observe(true).unwrap();
        assert_eq!(transition.from, ConnectivityState::Unknown);
        assert!(transition.is_online_edge());
    }

    #[test]
    fn test_repeated_observation_is_not_transition() {
        let mut tracker = ConnectivityTracker::new();
        tracker.observe(false);
        assert!(tracker.observe(false).is_none());
        assert_eq!(tracker.transition_count(), 1);
        assert!(tracker.last_checked().is_some());
    }

    #[test]
    fn test_offline_online_cycle() {
        let mut tracker = ConnectivityTracker::new();
        assert!(!tracker.observe(false).unwrap().is_online_edge());
        assert!(tracker.observe(true).unwrap().is_online_edge());
        assert!(tracker.observe(true).is_none());
        let back = tracker.observe(false).unwrap();
        assert_eq!(back.from, ConnectivityState::Online);
        assert!(!back.is_online_edge());
        assert_eq!(tracker.transition_count(), 3);
    }
}
