/**
 * HEALTH MONITOR - Liveness dérivée du journal
 *
 * RÔLE : Décider qu'un participant est « stale » à partir de son dernier message.
 * Détection consultative : elle déclenche une réassignation, jamais un arrêt.
 *
 * FONCTIONNEMENT :
 * - lastSeen = message le plus récent (tout type) du participant
 * - stale ssi now - lastSeen.observedAt > seuil (strict, 300s par défaut)
 * - les heartbeats sont dus aux jalons de progression 0/25/50/75/100%
 */

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::message::{HealthSample, LogPosition, Message, ParticipantId};

pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

/// Jalons de progression déclenchant un heartbeat.
pub const MILESTONES: [u8; 5] = [0, 25, 50, 75, 100];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastSeen {
    pub position: LogPosition,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Liveness {
    pub participant_id: ParticipantId,
    pub last_position: LogPosition,
    pub last_seen_at: DateTime<Utc>,
    pub age_secs: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMonitor {
    threshold: Duration,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_THRESHOLD)
    }
}

impl HealthMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn is_stale(&self, last_seen_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let threshold = chrono::Duration::from_std(self.threshold).unwrap_or_else(|_| chrono::Duration::weeks(52_000));
        now.signed_duration_since(last_seen_at) > threshold
    }

    /// Dernier message vu par participant.
    pub fn last_seen(messages: &[Message]) -> BTreeMap<ParticipantId, LastSeen> {
        let mut seen: BTreeMap<ParticipantId, LastSeen> = BTreeMap::new();
        for m in messages {
            let candidate = LastSeen {
                position: m.position,
                observed_at: m.observed_at,
            };
            seen.entry(m.sender.clone())
                .and_modify(|s| {
                    if candidate.position > s.position {
                        *s = candidate;
                    }
                })
                .or_insert(candidate);
        }
        seen
    }

    pub fn sweep(&self, messages: &[Message], now: DateTime<Utc>) -> Vec<Liveness> {
        Self::last_seen(messages)
            .into_iter()
            .map(|(participant_id, seen)| Liveness {
                stale: self.is_stale(seen.observed_at, now),
                age_secs: now.signed_duration_since(seen.observed_at).num_seconds(),
                participant_id,
                last_position: seen.position,
                last_seen_at: seen.observed_at,
            })
            .collect()
    }

    pub fn stale_participants(&self, messages: &[Message], now: DateTime<Utc>) -> BTreeSet<ParticipantId> {
        self.sweep(messages, now)
            .into_iter()
            .filter(|l| l.stale)
            .map(|l| l.participant_id)
            .collect()
    }
}

/// Suit les jalons déjà signalés pour une tâche.
#[derive(Debug, Clone, Default)]
pub struct MilestoneTracker {
    reported: usize,
}

impl MilestoneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plus haut jalon franchi depuis le dernier appel, s'il y en a un nouveau.
    pub fn crossed(&mut self, percent: u8) -> Option<u8> {
        let reached = MILESTONES.iter().take_while(|m| **m <= percent).count();
        if reached > self.reported {
            self.reported = reached;
            Some(MILESTONES[reached - 1])
        } else {
            None
        }
    }
}

/// Source d'échantillons cpu/mémoire joints aux heartbeats.
pub trait HealthProbe: Send + Sync {
    fn sample(&mut self) -> HealthSample;
}

/// Sonde à valeur fixe (tests, environnements sans métriques).
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub HealthSample);

impl HealthProbe for StaticProbe {
    fn sample(&mut self) -> HealthSample {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ParticipantStatus;
    use crate::message::{MessageBody, Role, StatusReport};

    fn hb(sender: &str, position: u64, at: DateTime<Utc>) -> Message {
        Message {
            position: LogPosition(position),
            observed_at: at,
            sender: sender.into(),
            body: MessageBody::Heartbeat(StatusReport::new(ParticipantStatus::Ready, Role::Worker)),
        }
    }

    #[test]
    fn staleness_is_strict() {
        let monitor = HealthMonitor::default();
        let last = Utc::now();
        assert!(!monitor.is_stale(last, last + chrono::Duration::seconds(300)));
        assert!(monitor.is_stale(last, last + chrono::Duration::seconds(301)));
    }

    #[test]
    fn most_recent_message_counts() {
        let t0 = Utc::now();
        let msgs = vec![
            hb("w1", 1, t0),
            hb("w2", 2, t0),
            hb("w1", 3, t0 + chrono::Duration::seconds(200)),
        ];
        let now = t0 + chrono::Duration::seconds(350);
        let stale = HealthMonitor::default().stale_participants(&msgs, now);
        assert_eq!(stale.into_iter().collect::<Vec<_>>(), vec!["w2".to_string()]);

        let seen = HealthMonitor::last_seen(&msgs);
        assert_eq!(seen["w1"].position, LogPosition(3));
    }

    #[test]
    fn milestones_fire_once_each() {
        let mut m = MilestoneTracker::new();
        assert_eq!(m.crossed(0), Some(0));
        assert_eq!(m.crossed(10), None);
        assert_eq!(m.crossed(60), Some(50));
        assert_eq!(m.crossed(74), None);
        assert_eq!(m.crossed(100), Some(100));
        assert_eq!(m.crossed(100), None);
    }
}
