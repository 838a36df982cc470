/**
 * LEADER ELECTION - Élection par fenêtre de stabilisation sur le bus
 *
 * RÔLE : Désigner un unique leader parmi des participants démarrés en même
 * temps, sans autre canal que le journal.
 *
 * FONCTIONNEMENT :
 * 1. chaque candidat append un `leader_claim`
 * 2. attente de la fenêtre de stabilisation
 * 3. lecture de tous les claims : le plus petit (observedAt, position, id) gagne
 * 4. aucun claim visible => nouvelle manche avec une fenêtre doublée
 * 5. le gagnant relit après une courte fenêtre de réconciliation et abdique
 *    si un claim mieux classé est apparu entre-temps
 *
 * Convergence probabiliste : deux participants qui lisent des préfixes
 * différents du journal peuvent diverger, la réconciliation réduit la fenêtre.
 */

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::context::{Candidate, ParticipantContext};
use crate::error::{HiveError, Result};
use crate::message::{LeaderClaim, LogPosition, Message, MessageBody, ParticipantId, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    pub settle_window: Duration,
    /// 0 désactive la réconciliation
    pub reconcile_window: Duration,
    pub max_rounds: u32,
    /// false : le participant ne revendique pas, il se contente de lire le résultat
    pub candidate: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            settle_window: Duration::from_secs(3),
            reconcile_window: Duration::from_secs(1),
            max_rounds: 4,
            candidate: true,
        }
    }
}

/// Claim de leadership tel que vu sur le bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRef {
    pub participant_id: ParticipantId,
    pub observed_at: DateTime<Utc>,
    pub position: LogPosition,
}

impl Ord for ClaimRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.observed_at
            .cmp(&other.observed_at)
            .then(self.position.cmp(&other.position))
            .then_with(|| self.participant_id.cmp(&other.participant_id))
    }
}

impl PartialOrd for ClaimRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Gagnant parmi les `leader_claim` visibles, départagés sur l'horodatage hôte.
pub fn resolve_leader(messages: &[Message]) -> Option<ClaimRef> {
    messages
        .iter()
        .filter(|m| matches!(m.body, MessageBody::LeaderClaim(_)))
        .map(|m| ClaimRef {
            participant_id: m.sender.clone(),
            observed_at: m.observed_at,
            position: m.position,
        })
        .min()
}

#[derive(Debug, Clone)]
pub struct ElectionOutcome {
    pub leader: ClaimRef,
    pub role: Role,
    pub rounds: u32,
    pub abdicated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LeaderElection {
    config: ElectionConfig,
}

impl LeaderElection {
    pub fn new(config: ElectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub async fn run(&self, candidate: &Candidate) -> Result<ElectionOutcome> {
        let mut window = self.config.settle_window;
        let mut claimed = false;

        for round in 1..=self.config.max_rounds {
            if self.config.candidate && !claimed {
                let body = MessageBody::LeaderClaim(LeaderClaim {
                    participant_id: candidate.id.clone(),
                    observed_at: candidate.clock.now(),
                });
                let position = candidate.bus.append(&candidate.id, &body).await?;
                info!("[election] {} claimed leadership at {}", candidate.id, position);
                claimed = true;
            }

            tokio::time::sleep(window).await;
            let messages = candidate.bus.read_all().await?;
            let Some(winner) = resolve_leader(&messages) else {
                warn!("[election] round {}: no claim visible after {:?}, widening window",
                      round, window);
                window = window.saturating_mul(2);
                continue;
            };

            if winner.participant_id != candidate.id || self.config.reconcile_window.is_zero() {
                return Ok(self.outcome(candidate, winner, round, false));
            }
            return self.reconcile(candidate, winner, round).await;
        }

        Err(HiveError::ElectionNonConvergence {
            rounds: self.config.max_rounds,
        })
    }

    async fn reconcile(&self, candidate: &Candidate, won: ClaimRef, round: u32) -> Result<ElectionOutcome> {
        tokio::time::sleep(self.config.reconcile_window).await;
        let messages = candidate.bus.read_all().await?;
        match resolve_leader(&messages) {
            Some(better) if better < won => {
                warn!("[election] {} abdicates: earlier claim from {} at {} became visible",
                      candidate.id, better.participant_id, better.position);
                Ok(self.outcome(candidate, better, round, true))
            }
            _ => Ok(self.outcome(candidate, won, round, false)),
        }
    }

    fn outcome(&self, candidate: &Candidate, leader: ClaimRef, rounds: u32, abdicated: bool) -> ElectionOutcome {
        let role = if leader.participant_id == candidate.id {
            Role::Leader
        } else {
            Role::Worker
        };
        info!("[election] {} -> {} (leader: {}, round {})",
              candidate.id, role, leader.participant_id, rounds);
        ElectionOutcome {
            leader,
            role,
            rounds,
            abdicated,
        }
    }

    /// Élection complète puis construction du contexte avec le rôle figé.
    pub async fn elect(&self, candidate: Candidate) -> Result<(ParticipantContext, ElectionOutcome)> {
        let outcome = self.run(&candidate).await?;
        Ok((candidate.into_context(outcome.role), outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, SharedBus};
    use crate::clock;
    use std::sync::Arc;

    fn claim(id: &str, position: u64, observed_at: DateTime<Utc>) -> Message {
        Message {
            position: LogPosition(position),
            observed_at,
            sender: id.into(),
            body: MessageBody::LeaderClaim(LeaderClaim {
                participant_id: id.into(),
                observed_at,
            }),
        }
    }

    #[test]
    fn earliest_observed_at_wins() {
        let t = Utc::now();
        let msgs = vec![
            claim("a", 1, t + chrono::Duration::seconds(1)),
            claim("b", 2, t),
        ];
        assert_eq!(resolve_leader(&msgs).unwrap().participant_id, "b");
    }

    #[test]
    fn ties_break_on_position_then_id() {
        let t = Utc::now();
        let msgs = vec![claim("z", 5, t), claim("a", 7, t)];
        assert_eq!(resolve_leader(&msgs).unwrap().participant_id, "z");

        let a = ClaimRef { participant_id: "a".into(), observed_at: t, position: LogPosition(3) };
        let b = ClaimRef { participant_id: "b".into(), observed_at: t, position: LogPosition(3) };
        assert!(a < b);
    }

    #[test]
    fn no_claims_no_leader() {
        assert!(resolve_leader(&[]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_candidates_agree() {
        let bus: SharedBus = Arc::new(MemoryBus::new());
        let election = LeaderElection::default();
        let candidates: Vec<Candidate> = ["w1", "w2", "w3"]
            .into_iter()
            .map(|id| Candidate::new(id, bus.clone(), clock::system()))
            .collect();

        let (a, b, c) = tokio::join!(
            election.run(&candidates[0]),
            election.run(&candidates[1]),
            election.run(&candidates[2]),
        );
        let outcomes = [a.unwrap(), b.unwrap(), c.unwrap()];
        let leader = &outcomes[0].leader.participant_id;
        assert!(outcomes.iter().all(|o| &o.leader.participant_id == leader));
        assert_eq!(outcomes.iter().filter(|o| o.role == Role::Leader).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_without_claims_gives_up() {
        let bus: SharedBus = Arc::new(MemoryBus::new());
        let election = LeaderElection::new(ElectionConfig {
            candidate: false,
            max_rounds: 3,
            ..Default::default()
        });
        let err = election
            .run(&Candidate::new("obs", bus, clock::system()))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::ElectionNonConvergence { rounds: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn late_earlier_claim_triggers_abdication() {
        let mem = MemoryBus::new();
        let bus: SharedBus = Arc::new(mem.clone());
        let election = LeaderElection::default();
        let me = Candidate::new("late", bus, clock::system());

        let task = tokio::spawn(async move { election.run(&me).await });
        // laisse le claim de `late` atterrir et la fenêtre s'écouler
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let earlier = Utc::now() - chrono::Duration::minutes(5);
        mem.insert_at(
            LogPosition(2),
            earlier,
            "early",
            &MessageBody::LeaderClaim(LeaderClaim { participant_id: "early".into(), observed_at: earlier }),
        )
        .unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.abdicated);
        assert_eq!(outcome.role, Role::Worker);
        assert_eq!(outcome.leader.participant_id, "early");
    }
}
