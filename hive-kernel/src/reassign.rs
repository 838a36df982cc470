/**
 * REASSIGNMENT CONTROLLER - Republication des tâches orphelines (leader)
 *
 * RÔLE : À chaque sweep, remettre en jeu les tâches dont le détenteur est stale,
 * et retenter les tâches échouées tant que le budget de tentatives le permet.
 *
 * FONCTIONNEMENT :
 * - claimed / in_progress + assignee stale => republication `reassigned`
 * - failed + attempts < max_attempts => republication `retry`
 * - une tâche completed n'est jamais republiée
 * - une publication par tâche, pour que la raison reste lisible dans le journal
 */

use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::context::ParticipantContext;
use crate::error::{HiveError, Result};
use crate::health::HealthMonitor;
use crate::lifecycle::TaskStatus;
use crate::message::{ParticipantId, PublishReason, TaskSpec};
use crate::tasks::{TaskBoard, TaskDistributor, DEFAULT_MAX_ATTEMPTS};

#[derive(Debug, Clone, PartialEq)]
pub struct Republication {
    pub task: TaskSpec,
    pub reason: PublishReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub stale: BTreeSet<ParticipantId>,
    pub republished: Vec<Republication>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReassignmentController {
    max_attempts: u32,
}

impl Default for ReassignmentController {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS }
    }
}

impl ReassignmentController {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Décisions pures à partir de l'état projeté et des participants stale.
    pub fn plan(&self, board: &TaskBoard, stale: &BTreeSet<ParticipantId>) -> Vec<Republication> {
        board
            .tasks()
            .into_iter()
            .filter_map(|task| match (task.status, task.assignee.as_ref()) {
                (TaskStatus::Claimed | TaskStatus::InProgress, Some(holder)) if stale.contains(holder) => {
                    Some(Republication {
                        task: task.to_spec(),
                        reason: PublishReason::Reassigned {
                            previous_assignee: holder.clone(),
                        },
                    })
                }
                (TaskStatus::Failed, _) if task.attempts < self.max_attempts => Some(Republication {
                    task: task.to_spec(),
                    reason: PublishReason::Retry {
                        attempt: task.attempts + 1,
                    },
                }),
                _ => None,
            })
            .collect()
    }

    /// Un sweep complet : lecture, détection, republication.
    pub async fn sweep(
        &self,
        ctx: &ParticipantContext,
        monitor: &HealthMonitor,
        distributor: &TaskDistributor,
    ) -> Result<SweepReport> {
        if !ctx.is_leader() {
            return Err(HiveError::NotLeader);
        }
        let messages = ctx.read_all().await?;
        let stale = monitor.stale_participants(&messages, ctx.now());
        let board = TaskBoard::fold(&messages);
        let plan = self.plan(&board, &stale);

        for rep in &plan {
            match &rep.reason {
                PublishReason::Reassigned { previous_assignee } => {
                    warn!("[reassign] {} held by stale {}, republishing", rep.task.id, previous_assignee)
                }
                other => info!("[reassign] republishing {} ({:?})", rep.task.id, other),
            }
            distributor
                .publish(ctx, vec![rep.task.clone()], rep.reason.clone())
                .await?;
        }

        Ok(SweepReport {
            stale,
            republished: plan,
        })
    }
}
