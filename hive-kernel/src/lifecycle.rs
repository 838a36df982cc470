/**
 * LIFECYCLE - Machines à états explicites des participants et des tâches
 *
 * RÔLE : Remplace l'enchaînement implicite des étapes de script par une table de
 * transitions pilotée uniquement par ce qui est observé sur le bus.
 *
 * FONCTIONNEMENT :
 * - `ParticipantStatus::on(event)` : starting → ready → in_progress → completed|failed|stale
 * - `TaskStatus::on(event)` : pending → claimed → in_progress → completed|failed
 * - toute transition absente des tables est une `TransitionError`
 */

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Starting,
    Ready,
    InProgress,
    Completed,
    Failed,
    Stale,
}

impl ParticipantStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stale => "stale",
        }
    }

    pub fn on(self, event: ParticipantEvent) -> Result<Self, TransitionError> {
        PARTICIPANT_TRANSITIONS
            .iter()
            .find(|(from, ev, _)| *from == self && *ev == event)
            .map(|(_, _, to)| *to)
            .ok_or_else(|| TransitionError::new(self.as_str(), event.as_str()))
    }
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantEvent {
    /// node_announce visible sur le bus
    Announced,
    /// notre claim a la plus petite position pour la tâche
    ClaimWon,
    TaskFinished,
    TaskFailed,
    /// plus aucune tâche non terminale
    WorkExhausted,
    /// erreur sans remède protocolaire (panne bus, timeout)
    Fatal,
    HeartbeatExpired,
    /// message reçu d'un participant marqué stale
    Resumed,
}

impl ParticipantEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Announced => "announced",
            Self::ClaimWon => "claim_won",
            Self::TaskFinished => "task_finished",
            Self::TaskFailed => "task_failed",
            Self::WorkExhausted => "work_exhausted",
            Self::Fatal => "fatal",
            Self::HeartbeatExpired => "heartbeat_expired",
            Self::Resumed => "resumed",
        }
    }
}

use ParticipantEvent as PE;
use ParticipantStatus as PS;

const PARTICIPANT_TRANSITIONS: &[(ParticipantStatus, ParticipantEvent, ParticipantStatus)] = &[
    (PS::Starting, PE::Announced, PS::Ready),
    (PS::Ready, PE::ClaimWon, PS::InProgress),
    (PS::InProgress, PE::TaskFinished, PS::Ready),
    (PS::InProgress, PE::TaskFailed, PS::Ready),
    (PS::Ready, PE::WorkExhausted, PS::Completed),
    (PS::Starting, PE::Fatal, PS::Failed),
    (PS::Ready, PE::Fatal, PS::Failed),
    (PS::InProgress, PE::Fatal, PS::Failed),
    (PS::Starting, PE::HeartbeatExpired, PS::Stale),
    (PS::Ready, PE::HeartbeatExpired, PS::Stale),
    (PS::InProgress, PE::HeartbeatExpired, PS::Stale),
    (PS::Stale, PE::Resumed, PS::Ready),
    (PS::Stale, PE::Fatal, PS::Failed),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// claimed ou in_progress : compte dans le plafond `instances.max`
    pub fn is_active(self) -> bool {
        matches!(self, Self::Claimed | Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn on(self, event: TaskEvent) -> Result<Self, TransitionError> {
        // une republication remplace tout l'état d'assignation précédent
        if event == TaskEvent::Republished {
            return Ok(Self::Pending);
        }
        TASK_TRANSITIONS
            .iter()
            .find(|(from, ev, _)| *from == self && *ev == event)
            .map(|(_, _, to)| *to)
            .ok_or_else(|| TransitionError::new(self.as_str(), event.as_str()))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    ClaimAccepted,
    Started,
    Finished,
    Failed,
    Republished,
}

impl TaskEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaimAccepted => "claim_accepted",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Republished => "republished",
        }
    }

    /// Traduit le statut de tâche rapporté par un participant en événement.
    pub fn from_reported(status: TaskStatus) -> Option<Self> {
        match status {
            TaskStatus::InProgress => Some(Self::Started),
            TaskStatus::Completed => Some(Self::Finished),
            TaskStatus::Failed => Some(Self::Failed),
            TaskStatus::Pending | TaskStatus::Claimed => None,
        }
    }
}

use TaskEvent as TE;
use TaskStatus as TS;

const TASK_TRANSITIONS: &[(TaskStatus, TaskEvent, TaskStatus)] = &[
    (TS::Pending, TE::ClaimAccepted, TS::Claimed),
    (TS::Claimed, TE::Started, TS::InProgress),
    (TS::InProgress, TE::Started, TS::InProgress),
    (TS::Claimed, TE::Finished, TS::Completed),
    (TS::InProgress, TE::Finished, TS::Completed),
    (TS::Claimed, TE::Failed, TS::Failed),
    (TS::InProgress, TE::Failed, TS::Failed),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition from '{from}' on '{event}'")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: &'static str,
}

impl TransitionError {
    fn new(from: &'static str, event: &'static str) -> Self {
        Self { from, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_happy_path() {
        let s = ParticipantStatus::Starting
            .on(PE::Announced)
            .and_then(|s| s.on(PE::ClaimWon))
            .and_then(|s| s.on(PE::TaskFinished))
            .and_then(|s| s.on(PE::WorkExhausted))
            .unwrap();
        assert_eq!(s, ParticipantStatus::Completed);
    }

    #[test]
    fn terminal_states_reject_everything() {
        for event in [PE::Announced, PE::ClaimWon, PE::Fatal, PE::HeartbeatExpired, PE::Resumed] {
            assert!(ParticipantStatus::Completed.on(event).is_err());
            assert!(ParticipantStatus::Failed.on(event).is_err());
        }
    }

    #[test]
    fn claim_requires_ready() {
        let err = ParticipantStatus::Starting.on(PE::ClaimWon).unwrap_err();
        assert_eq!(err.from, "starting");
        assert_eq!(err.event, "claim_won");
    }

    #[test]
    fn stale_participant_can_resume() {
        let s = ParticipantStatus::InProgress.on(PE::HeartbeatExpired).unwrap();
        assert_eq!(s, ParticipantStatus::Stale);
        assert_eq!(s.on(PE::Resumed).unwrap(), ParticipantStatus::Ready);
    }

    #[test]
    fn task_lifecycle_and_republish() {
        let t = TaskStatus::Pending
            .on(TE::ClaimAccepted)
            .and_then(|t| t.on(TE::Started))
            .and_then(|t| t.on(TE::Started))
            .unwrap();
        assert_eq!(t, TaskStatus::InProgress);
        assert_eq!(t.on(TE::Republished).unwrap(), TaskStatus::Pending);
        assert_eq!(TaskStatus::Completed.on(TE::Republished).unwrap(), TaskStatus::Pending);
        assert!(TaskStatus::Pending.on(TE::Finished).is_err());
        assert!(TaskStatus::Completed.on(TE::Started).is_err());
    }
}
