/**
 * TASKS - Publication des tâches et protocole de claim optimiste
 *
 * RÔLE : Le leader publie la liste ; les workers la réclament en concurrence.
 * L'état d'une tâche n'existe nulle part ailleurs que dans le journal :
 * `TaskBoard::fold` le recalcule à chaque lecture.
 *
 * RÈGLES DE FOLD (ordre des positions) :
 * - task_publish : la tâche redevient `pending`, sans assignee, attempts += 1
 * - task_claim : valide ssi postérieur à la dernière publication de la tâche
 *   et premier claim depuis celle-ci (plus petite position gagne)
 * - progress/heartbeat : seul l'assignee courant fait avancer la tâche, via
 *   la table de transitions ; les transitions illégales sont ignorées
 */

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

use crate::context::ParticipantContext;
use crate::error::{HiveError, Result};
use crate::lifecycle::{TaskEvent, TaskStatus};
use crate::message::{
    LogPosition, Message, MessageBody, ParticipantId, PublishReason, TaskClaim, TaskId, TaskPublish,
    TaskSpec,
};

/// Tentatives par tâche (publication initiale comprise) avant abandon.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// État courant d'une tâche, projeté depuis le journal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub required_skills: Vec<String>,
    pub priority: u8,
    pub estimated_hours: f32,
    pub dependencies: BTreeSet<TaskId>,
    pub status: TaskStatus,
    pub assignee: Option<ParticipantId>,
    pub progress_percent: u8,
    /// nombre de publications (initiale + republications)
    pub attempts: u32,
    pub published_at: LogPosition,
    pub claimed_at: Option<LogPosition>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    order: usize,
}

impl TaskState {
    fn from_spec(spec: &TaskSpec, order: usize, m: &Message) -> Self {
        Self {
            id: spec.id.clone(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            required_skills: spec.required_skills.clone(),
            priority: spec.priority,
            estimated_hours: spec.estimated_hours,
            dependencies: spec.dependencies.clone(),
            status: TaskStatus::Pending,
            assignee: None,
            progress_percent: 0,
            attempts: 1,
            published_at: m.position,
            claimed_at: None,
            updated_at: m.observed_at,
            order,
        }
    }

    fn republish(&mut self, spec: &TaskSpec, m: &Message) {
        self.title = spec.title.clone();
        self.description = spec.description.clone();
        self.required_skills = spec.required_skills.clone();
        self.priority = spec.priority;
        self.estimated_hours = spec.estimated_hours;
        self.dependencies = spec.dependencies.clone();
        self.status = TaskStatus::Pending;
        self.assignee = None;
        self.progress_percent = 0;
        self.attempts += 1;
        self.published_at = m.position;
        self.claimed_at = None;
        self.updated_at = m.observed_at;
    }

    /// Spécification à republier (état remis à `pending`).
    pub fn to_spec(&self) -> TaskSpec {
        TaskSpec {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            required_skills: self.required_skills.clone(),
            priority: self.priority,
            estimated_hours: self.estimated_hours,
            dependencies: self.dependencies.clone(),
            status: TaskStatus::Pending,
        }
    }

    /// Échec sans nouvelle publication possible.
    pub fn failed_for_good(&self, max_attempts: u32) -> bool {
        self.status == TaskStatus::Failed && self.attempts >= max_attempts
    }

    /// Tâche sans compétence requise, participant généraliste, ou intersection non vide.
    pub fn matches_skills(&self, skills: &[String]) -> bool {
        self.required_skills.is_empty()
            || skills.is_empty()
            || self.required_skills.iter().any(|s| skills.contains(s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub pending: usize,
    pub claimed: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.in_progress + self.completed + self.failed
    }
}

/// Projection de toutes les tâches connues.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskBoard {
    tasks: BTreeMap<TaskId, TaskState>,
}

impl TaskBoard {
    pub fn fold(messages: &[Message]) -> Self {
        let mut board = Self::default();
        for m in messages {
            board.apply(m);
        }
        board
    }

    /// Applique un message ; les messages doivent arriver par position croissante.
    pub fn apply(&mut self, m: &Message) {
        match &m.body {
            MessageBody::TaskPublish(publish) => {
                for spec in &publish.tasks {
                    let order = self.tasks.len();
                    self.tasks
                        .entry(spec.id.clone())
                        .and_modify(|t| t.republish(spec, m))
                        .or_insert_with(|| TaskState::from_spec(spec, order, m));
                }
            }
            MessageBody::TaskClaim(claim) => self.apply_claim(claim, m),
            MessageBody::Progress(report) | MessageBody::Heartbeat(report) => {
                let Some(progress) = &report.task else { return };
                let Some(task) = self.tasks.get_mut(&progress.id) else { return };
                let holds_claim = task.assignee.as_deref() == Some(m.sender.as_str())
                    && task.claimed_at.is_some_and(|c| c < m.position);
                if !holds_claim {
                    return;
                }
                if let Some(event) = TaskEvent::from_reported(progress.status) {
                    match task.status.on(event) {
                        Ok(next) => task.status = next,
                        Err(e) => {
                            debug!("[tasks] {} ignored report from {}: {}", task.id, m.sender, e);
                            return;
                        }
                    }
                }
                task.progress_percent = progress.progress_percent.min(100);
                task.updated_at = m.observed_at;
            }
            MessageBody::LeaderClaim(_) | MessageBody::NodeAnnounce(_) => {}
        }
    }

    fn apply_claim(&mut self, claim: &TaskClaim, m: &Message) {
        let Some(task) = self.tasks.get_mut(&claim.task_id) else {
            return;
        };
        if m.position <= task.published_at || task.claimed_at.is_some() {
            return;
        }
        if let Ok(next) = task.status.on(TaskEvent::ClaimAccepted) {
            task.status = next;
            task.assignee = Some(m.sender.clone());
            task.claimed_at = Some(m.position);
            task.updated_at = m.observed_at;
        }
    }

    pub fn get(&self, id: &str) -> Option<&TaskState> {
        self.tasks.get(id)
    }

    /// Tâches dans l'ordre de première publication.
    pub fn tasks(&self) -> Vec<&TaskState> {
        let mut tasks: Vec<&TaskState> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.order);
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn assignee(&self, id: &str) -> Option<&str> {
        self.tasks.get(id).and_then(|t| t.assignee.as_deref())
    }

    pub fn active_count(&self) -> usize {
        self.tasks.values().filter(|t| t.status.is_active()).count()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for t in self.tasks.values() {
            match t.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Claimed => counts.claimed += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Progression globale : moyenne des progressions, une tâche terminée compte 100.
    pub fn progress_percent(&self) -> u8 {
        if self.tasks.is_empty() {
            return 0;
        }
        let sum: u32 = self
            .tasks
            .values()
            .map(|t| if t.status.is_terminal() { 100 } else { u32::from(t.progress_percent) })
            .sum();
        (sum / self.tasks.len() as u32) as u8
    }

    /// Tâches `pending` qui ne démarreront jamais : une dépendance, directe ou
    /// transitive, a définitivement échoué.
    pub fn blocked(&self, max_attempts: u32) -> BTreeSet<TaskId> {
        let mut blocked = BTreeSet::new();
        loop {
            let before = blocked.len();
            for t in self.tasks.values() {
                if t.status != TaskStatus::Pending || blocked.contains(&t.id) {
                    continue;
                }
                let dead = t.dependencies.iter().any(|d| {
                    blocked.contains(d)
                        || self.tasks.get(d).is_some_and(|dep| dep.failed_for_good(max_attempts))
                });
                if dead {
                    blocked.insert(t.id.clone());
                }
            }
            if blocked.len() == before {
                return blocked;
            }
        }
    }

    /// Plus rien à faire : chaque tâche est `completed`, `failed` sans nouvelle
    /// tentative possible, ou bloquée derrière un tel échec.
    pub fn is_settled(&self, max_attempts: u32) -> bool {
        let blocked = self.blocked(max_attempts);
        !self.tasks.is_empty()
            && self.tasks.values().all(|t| match t.status {
                TaskStatus::Completed => true,
                TaskStatus::Failed => t.failed_for_good(max_attempts),
                TaskStatus::Pending => blocked.contains(&t.id),
                _ => false,
            })
    }

    /// Tâches réclamables par un participant, priorité décroissante puis ordre de publication.
    pub fn eligible_for(&self, skills: &[String]) -> Vec<&TaskState> {
        let mut eligible: Vec<&TaskState> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.dependencies.iter().all(|d| {
                    self.tasks
                        .get(d)
                        .is_some_and(|dep| dep.status == TaskStatus::Completed)
                })
            })
            .filter(|t| t.matches_skills(skills))
            .collect();
        eligible.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
        eligible
    }

    /// Tâches actives que le journal attribue à `participant`.
    pub fn claimed_by(&self, participant: &str) -> Vec<&TaskState> {
        self.tasks()
            .into_iter()
            .filter(|t| t.status.is_active() && t.assignee.as_deref() == Some(participant))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Won,
    /// un claim antérieur existe (ou la tâche n'était plus `pending`)
    Lost { winner: Option<ParticipantId> },
    /// une publication plus récente a invalidé notre claim
    Superseded,
    /// notre propre claim n'est pas devenu visible à temps
    Unconfirmed,
}

#[derive(Debug, Clone)]
pub struct TaskDistributor {
    claim_settle: Duration,
    max_active: usize,
    max_rescans: u32,
}

impl Default for TaskDistributor {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 10)
    }
}

impl TaskDistributor {
    pub fn new(claim_settle: Duration, max_active: usize) -> Self {
        Self {
            claim_settle,
            max_active,
            max_rescans: 3,
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Append d'un `task_publish` ; réservé au leader.
    pub async fn publish(
        &self,
        ctx: &ParticipantContext,
        tasks: Vec<TaskSpec>,
        reason: PublishReason,
    ) -> Result<LogPosition> {
        if !ctx.is_leader() {
            return Err(HiveError::NotLeader);
        }
        let tasks: Vec<TaskSpec> = tasks
            .into_iter()
            .map(|t| TaskSpec {
                status: TaskStatus::Pending,
                ..t
            })
            .collect();
        let count = tasks.len();
        let position = ctx
            .append(&MessageBody::TaskPublish(TaskPublish { tasks, reason }))
            .await?;
        info!("[tasks] {} published {} task(s) at {}", ctx.id(), count, position);
        Ok(position)
    }

    /// Prochaine tâche à réclamer, `None` si le plafond de tâches actives est atteint.
    pub fn pick<'a>(&self, board: &'a TaskBoard, skills: &[String]) -> Option<&'a TaskState> {
        if board.active_count() >= self.max_active {
            debug!("[tasks] {} active task(s), cap reached", board.active_count());
            return None;
        }
        board.eligible_for(skills).into_iter().next()
    }

    /// Claim puis vérification après la fenêtre de stabilisation.
    pub async fn claim(&self, ctx: &ParticipantContext, task_id: &str) -> Result<ClaimOutcome> {
        let position = ctx
            .append(&MessageBody::TaskClaim(TaskClaim {
                task_id: task_id.to_string(),
                participant_id: ctx.id().to_string(),
                observed_at: ctx.now(),
            }))
            .await?;
        debug!("[tasks] {} claimed {} at {}", ctx.id(), task_id, position);

        for scan in 0..=self.max_rescans {
            tokio::time::sleep(self.claim_settle).await;
            let messages = ctx.read_all().await?;
            if !messages.iter().any(|m| m.position == position) {
                debug!("[tasks] own claim {} not visible yet (scan {})", position, scan);
                continue;
            }
            let board = TaskBoard::fold(&messages);
            let Some(task) = board.get(task_id) else {
                return Ok(ClaimOutcome::Lost { winner: None });
            };
            let outcome = if task.published_at > position {
                ClaimOutcome::Superseded
            } else if task.claimed_at == Some(position) {
                ClaimOutcome::Won
            } else {
                ClaimOutcome::Lost {
                    winner: task.assignee.clone(),
                }
            };
            info!("[tasks] claim {} by {}: {:?}", task_id, ctx.id(), outcome);
            return Ok(outcome);
        }
        Ok(ClaimOutcome::Unconfirmed)
    }
}
