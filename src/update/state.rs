//! Per-channel update state machine and the events it publishes

use serde::{Deserialize, Serialize};

use super::download::DownloadProgress;
use super::manifest::{UpdateChannel, UpdateStrategy};
use crate::core::error::ErrorKind;

/// State of one channel's update cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum UpdateState {
    /// No cycle in progress
    #[default]
    Idle,
    /// Manifest accepted, nothing downloaded yet
    Notify,
    DownloadPackage,
    DownloadPackageFailed,
    DownloadSignature,
    DownloadSignatureFailed,
    VerifySignature,
    VerifySignatureFailed,
    VerifyPackage,
    VerifyPackageFailed,
    /// Verified artifact waiting for installation
    Ready,
    Done,
    /// The user finishes installation out-of-band
    ManualInstall,
    /// Progress abandoned; safe to restart from `Notify`
    UpdateIncomplete,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Notify => "notify",
            UpdateState::DownloadPackage => "downloadPackage",
            UpdateState::DownloadPackageFailed => "downloadPackageFailed",
            UpdateState::DownloadSignature => "downloadSignature",
            UpdateState::DownloadSignatureFailed => "downloadSignatureFailed",
            UpdateState::VerifySignature => "verifySignature",
            UpdateState::VerifySignatureFailed => "verifySignatureFailed",
            UpdateState::VerifyPackage => "verifyPackage",
            UpdateState::VerifyPackageFailed => "verifyPackageFailed",
            UpdateState::Ready => "ready",
            UpdateState::Done => "done",
            UpdateState::ManualInstall => "manualInstall",
            UpdateState::UpdateIncomplete => "updateIncomplete",
        }
    }

    /// Next stage on success, if any
    pub fn next(&self) -> Option<UpdateState> {
        match self {
            UpdateState::Notify => Some(UpdateState::DownloadPackage),
            UpdateState::DownloadPackage => Some(UpdateState::DownloadSignature),
            UpdateState::DownloadSignature => Some(UpdateState::VerifySignature),
            UpdateState::VerifySignature => Some(UpdateState::VerifyPackage),
            UpdateState::VerifyPackage => Some(UpdateState::Ready),
            UpdateState::Ready => Some(UpdateState::Done),
            _ => None,
        }
    }

    /// Failure state paired with an in-flight stage
    pub fn failure_state(&self) -> Option<UpdateState> {
        match self {
            UpdateState::DownloadPackage => Some(UpdateState::DownloadPackageFailed),
            UpdateState::DownloadSignature => Some(UpdateState::DownloadSignatureFailed),
            UpdateState::VerifySignature => Some(UpdateState::VerifySignatureFailed),
            UpdateState::VerifyPackage => Some(UpdateState::VerifyPackageFailed),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            UpdateState::DownloadPackageFailed
                | UpdateState::DownloadSignatureFailed
                | UpdateState::VerifySignatureFailed
                | UpdateState::VerifyPackageFailed
        )
    }

    /// A cycle in this state is over; only `begin` or `reset` move on
    pub fn is_terminal(&self) -> bool {
        self.is_failed()
            || matches!(
                self,
                UpdateState::Done | UpdateState::ManualInstall | UpdateState::UpdateIncomplete
            )
    }

    /// A cycle in this state holds the channel
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, UpdateState::Idle) && !self.is_terminal()
    }

    /// Whether the coordinator may move from `self` to `to`
    pub fn can_transition_to(&self, to: UpdateState) -> bool {
        if to == UpdateState::Idle {
            return true;
        }
        if to == UpdateState::Notify {
            return matches!(self, UpdateState::Idle) || self.is_terminal();
        }
        if self.next() == Some(to) || self.failure_state() == Some(to) {
            return true;
        }
        match to {
            // Cancellation or an abandoned install
            UpdateState::UpdateIncomplete => self.is_in_flight(),
            UpdateState::ManualInstall => matches!(self, UpdateState::Ready),
            _ => false,
        }
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message delivered on the coordinator's event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpdateEvent {
    StateChanged {
        channel: UpdateChannel,
        from: UpdateState,
        to: UpdateState,
        strategy: UpdateStrategy,
    },
    Progress {
        channel: UpdateChannel,
        progress: DownloadProgress,
    },
    Failed {
        channel: UpdateChannel,
        state: UpdateState,
        kind: ErrorKind,
        message: String,
    },
}

impl UpdateEvent {
    pub fn channel(&self) -> UpdateChannel {
        match self {
            UpdateEvent::StateChanged { channel, .. }
            | UpdateEvent::Progress { channel, .. }
            | UpdateEvent::Failed { channel, .. } => *channel,
        }
    }
}

/// Last failure recorded on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

/// Synchronous view of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSnapshot {
    pub channel: UpdateChannel,
    pub state: UpdateState,
    pub version: Option<String>,
    pub strategy: UpdateStrategy,
    pub progress: Option<DownloadProgress>,
    pub last_error: Option<UpdateFailure>,
}

impl UpdateSnapshot {
    pub fn idle(channel: UpdateChannel) -> Self {
        Self {
            channel,
            state: UpdateState::Idle,
            version: None,
            strategy: UpdateStrategy::default(),
            progress: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_strictly_forward() {
        let mut state = UpdateState::Notify;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            state = next;
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                UpdateState::Notify,
                UpdateState::DownloadPackage,
                UpdateState::DownloadSignature,
                UpdateState::VerifySignature,
                UpdateState::VerifyPackage,
                UpdateState::Ready,
                UpdateState::Done,
            ]
        );
    }

    #[test]
    fn test_failure_states_are_terminal() {
        for stage in [
            UpdateState::DownloadPackage,
            UpdateState::DownloadSignature,
            UpdateState::VerifySignature,
            UpdateState::VerifyPackage,
        ] {
            let failed = stage.failure_state().unwrap();
            assert!(stage.can_transition_to(failed));
            assert!(failed.is_failed());
            assert!(failed.is_terminal());
            // A failed cycle restarts from notify, never resumes a stage
            assert!(!failed.can_transition_to(stage));
            assert!(failed.can_transition_to(UpdateState::Notify));
        }
    }

    #[test]
    fn test_no_skipping_stages() {
        assert!(!UpdateState::Notify.can_transition_to(UpdateState::Ready));
        assert!(!UpdateState::DownloadPackage.can_transition_to(UpdateState::VerifyPackage));
        assert!(!UpdateState::VerifySignatureFailed.can_transition_to(UpdateState::VerifyPackage));
        assert!(!UpdateState::Ready.can_transition_to(UpdateState::Notify));
    }

    #[test]
    fn test_in_flight_states() {
        assert!(!UpdateState::Idle.is_in_flight());
        assert!(UpdateState::Notify.is_in_flight());
        assert!(UpdateState::Ready.is_in_flight());
        assert!(!UpdateState::Done.is_in_flight());
        assert!(!UpdateState::UpdateIncomplete.is_in_flight());
        assert!(UpdateState::DownloadPackage.can_transition_to(UpdateState::UpdateIncomplete));
        assert!(UpdateState::Ready.can_transition_to(UpdateState::ManualInstall));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(UpdateState::DownloadPackageFailed.to_string(), "downloadPackageFailed");
        let json = serde_json::to_string(&UpdateState::ManualInstall).unwrap();
        assert_eq!(json, "\"manualInstall\"");
    }

    #[test]
    fn test_event_serialization() {
        let event = UpdateEvent::Failed {
            channel: UpdateChannel::Bundle,
            state: UpdateState::VerifyPackageFailed,
            kind: ErrorKind::HashMismatch,
            message: "hash".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["kind"], "hashMismatch");
        assert_eq!(event.channel(), UpdateChannel::Bundle);
    }
}
