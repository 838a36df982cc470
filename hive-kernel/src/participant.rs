/**
 * PARTICIPANT - Boucle coopérative d'un processus (leader ou worker)
 *
 * RÔLE : Enchaîner élection, annonce puis boucle de rôle, dans une seule tâche
 * async : lire, décider, éventuellement append, dormir.
 *
 * FONCTIONNEMENT :
 * - élection => rôle figé => `node_announce` (rôle + compétences)
 * - leader : composition + publication des tâches, puis sweep périodique
 *   (staleness, réassignation, heartbeat) jusqu'à ce que tout soit réglé
 * - worker : attente de la publication, reprise de ses tâches ou claim,
 *   exécution via `TaskRunner`, heartbeats aux jalons et en attente
 * - sortie : statut final `completed` / `failed` publié sur le bus
 *
 * Le statut du participant suit `lifecycle::ParticipantStatus` ; toute
 * transition illégale remonte en erreur.
 */

use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, WorkItem};
use crate::config::HiveConfig;
use crate::context::{Candidate, ParticipantContext};
use crate::election::{ElectionConfig, LeaderElection};
use crate::error::{HiveError, Result};
use crate::health::{HealthMonitor, HealthProbe, MilestoneTracker, StaticProbe};
use crate::lifecycle::{ParticipantEvent, ParticipantStatus, TaskStatus};
use crate::message::{
    MessageBody, NodeAnnounce, ParticipantId, PublishReason, Role, StatusReport, TaskId, TaskProgress,
    MAX_OUTPUT_LINES,
};
use crate::planner::{self, Strategy};
use crate::reassign::ReassignmentController;
use crate::tasks::{ClaimOutcome, TaskBoard, TaskDistributor, TaskState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed { reason: String },
}

/// Exécute réellement une tâche (code externe opaque pour le protocole).
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &TaskState, progress: &mut ProgressReporter<'_>) -> Result<TaskOutcome>;
}

/// Canal de remontée d'un `TaskRunner` : heartbeat à chaque jalon franchi,
/// lignes de sortie conservées pour l'aperçu borné.
pub struct ProgressReporter<'a> {
    ctx: &'a ParticipantContext,
    probe: &'a mut dyn HealthProbe,
    task: TaskProgress,
    milestones: MilestoneTracker,
    output: VecDeque<String>,
}

impl<'a> ProgressReporter<'a> {
    fn new(ctx: &'a ParticipantContext, probe: &'a mut dyn HealthProbe, task: &TaskState) -> Self {
        Self {
            ctx,
            probe,
            task: TaskProgress {
                id: task.id.clone(),
                description: task.title.clone(),
                progress_percent: 0,
                status: TaskStatus::InProgress,
            },
            milestones: MilestoneTracker::new(),
            output: VecDeque::with_capacity(MAX_OUTPUT_LINES),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    pub fn percent(&self) -> u8 {
        self.task.progress_percent
    }

    /// Met à jour la progression ; append un heartbeat si un jalon est franchi.
    pub async fn report(&mut self, percent: u8) -> Result<()> {
        let percent = percent.min(100).max(self.task.progress_percent);
        self.task.progress_percent = percent;
        if let Some(milestone) = self.milestones.crossed(percent) {
            debug!("[participant] {} reached {}% on {}", self.ctx.id(), milestone, self.task.id);
            let report = self.status_report(ParticipantStatus::InProgress);
            self.ctx.append(&MessageBody::Heartbeat(report)).await?;
        }
        Ok(())
    }

    pub fn output(&mut self, line: impl Into<String>) {
        if self.output.len() == MAX_OUTPUT_LINES {
            self.output.pop_front();
        }
        self.output.push_back(line.into());
    }

    fn status_report(&mut self, status: ParticipantStatus) -> StatusReport {
        StatusReport::new(status, self.ctx.role())
            .with_task(self.task.clone())
            .with_health(self.probe.sample())
            .with_output(self.output.iter().cloned())
    }

    /// Message `progress` de fin de tâche.
    async fn finish(&mut self, outcome: &TaskOutcome) -> Result<()> {
        if *outcome == TaskOutcome::Completed {
            self.report(100).await?;
            self.task.status = TaskStatus::Completed;
        } else {
            self.task.status = TaskStatus::Failed;
        }
        let report = self.status_report(ParticipantStatus::Ready);
        self.ctx.append(&MessageBody::Progress(report)).await?;
        Ok(())
    }
}

/// Délais et paramètres de la boucle, dérivés de `HiveConfig`.
#[derive(Debug, Clone)]
pub struct ParticipantSettings {
    pub election: ElectionConfig,
    pub claim_settle: Duration,
    pub max_active: usize,
    pub stale_threshold: Duration,
    pub sweep_interval: Duration,
    pub poll_interval: Duration,
    pub idle_heartbeat: Duration,
    pub publish_timeout: Duration,
    pub run_timeout: Duration,
    pub max_attempts: u32,
    pub leader_works: bool,
    pub strategy: Strategy,
}

impl From<&HiveConfig> for ParticipantSettings {
    fn from(config: &HiveConfig) -> Self {
        let c = &config.coordination;
        Self {
            election: c.election(),
            claim_settle: c.claim_settle(),
            max_active: config.instances.max,
            stale_threshold: c.stale_threshold(),
            sweep_interval: c.sweep_interval(),
            poll_interval: c.poll_interval(),
            idle_heartbeat: c.idle_heartbeat(),
            publish_timeout: c.publish_timeout(),
            run_timeout: c.run_timeout(),
            max_attempts: c.max_attempts,
            leader_works: c.leader_works,
            strategy: config.planner.strategy,
        }
    }
}

impl Default for ParticipantSettings {
    fn default() -> Self {
        Self::from(&HiveConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub participant: ParticipantId,
    pub role: Role,
    pub leader: ParticipantId,
    pub status: ParticipantStatus,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
}

pub struct Participant {
    settings: ParticipantSettings,
    skills: Vec<String>,
    agent: Option<String>,
    runner: Arc<dyn TaskRunner>,
    probe: Box<dyn HealthProbe>,
    work_item: Option<WorkItem>,
    status: ParticipantStatus,
    completed: usize,
    failed: usize,
    /// (tâche, numéro de publication) déjà exécutés ; le journal peut tarder à
    /// refléter notre propre fin de tâche
    finished: BTreeSet<(TaskId, u32)>,
    last_append: Instant,
}

impl Participant {
    pub fn new(settings: ParticipantSettings, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            settings,
            skills: Vec::new(),
            agent: None,
            runner,
            probe: Box::new(StaticProbe::default()),
            work_item: None,
            status: ParticipantStatus::Starting,
            completed: 0,
            failed: 0,
            finished: BTreeSet::new(),
            last_append: Instant::now(),
        }
    }

    pub fn with_skills(mut self, agent: Option<String>, skills: Vec<String>) -> Self {
        self.agent = agent;
        self.skills = skills;
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Remplace le work item lu sur le bus (description fournie par l'opérateur).
    pub fn with_work_item(mut self, item: WorkItem) -> Self {
        self.work_item = Some(item);
        self
    }

    pub fn status(&self) -> ParticipantStatus {
        self.status
    }

    fn transition(&mut self, event: ParticipantEvent) -> Result<()> {
        self.status = self.status.on(event)?;
        Ok(())
    }

    fn distributor(&self) -> TaskDistributor {
        TaskDistributor::new(self.settings.claim_settle, self.settings.max_active)
    }

    pub async fn run(mut self, candidate: Candidate) -> Result<RunSummary> {
        let election = LeaderElection::new(self.settings.election.clone());
        let (ctx, outcome) = election.elect(candidate).await?;

        ctx.append(&MessageBody::NodeAnnounce(NodeAnnounce {
            role: ctx.role(),
            skills: self.skills.clone(),
            agent: self.agent.clone(),
        }))
        .await?;
        self.last_append = Instant::now();
        self.transition(ParticipantEvent::Announced)?;
        info!("[participant] {} ready as {} (skills: {:?})", ctx.id(), ctx.role(), self.skills);

        let result = if ctx.is_leader() {
            self.lead(&ctx).await
        } else {
            self.work(&ctx).await
        };

        if let Err(e) = &result {
            error!("[participant] {} stopping: {}", ctx.id(), e);
            self.status = self.status.on(ParticipantEvent::Fatal).unwrap_or(ParticipantStatus::Failed);
        }
        let farewell = StatusReport::new(self.status, ctx.role()).with_health(self.probe.sample());
        if let Err(e) = ctx.append(&MessageBody::Heartbeat(farewell)).await {
            warn!("[participant] {} could not post final status: {}", ctx.id(), e);
        }

        result.map(|()| RunSummary {
            participant: ctx.id().to_string(),
            role: ctx.role(),
            leader: outcome.leader.participant_id,
            status: self.status,
            tasks_completed: self.completed,
            tasks_failed: self.failed,
        })
    }

    async fn heartbeat(&mut self, ctx: &ParticipantContext) -> Result<()> {
        let report = StatusReport::new(self.status, ctx.role()).with_health(self.probe.sample());
        ctx.append(&MessageBody::Heartbeat(report)).await?;
        self.last_append = Instant::now();
        Ok(())
    }

    async fn work_item(&self, ctx: &ParticipantContext) -> Result<WorkItem> {
        if let Some(item) = &self.work_item {
            return Ok(item.clone());
        }
        Ok(ctx.bus().work_item().await?.unwrap_or_else(|| {
            warn!("[participant] no work item available, planning from an empty description");
            WorkItem {
                title: "work item".into(),
                body: String::new(),
            }
        }))
    }

    async fn lead(&mut self, ctx: &ParticipantContext) -> Result<()> {
        let distributor = self.distributor();
        let monitor = HealthMonitor::new(self.settings.stale_threshold);
        let controller = ReassignmentController::new(self.settings.max_attempts);

        let item = self.work_item(ctx).await?;
        let specs = planner::compose(&item, self.settings.strategy);
        info!("[participant] planned {} task(s) with {} strategy", specs.len(), self.settings.strategy);
        distributor.publish(ctx, specs, PublishReason::Initial).await?;
        self.last_append = Instant::now();

        let deadline = Instant::now() + self.settings.run_timeout;
        loop {
            if self.settings.leader_works {
                let board = TaskBoard::fold(&ctx.read_all().await?);
                self.work_step(ctx, &board, &distributor).await?;
            }
            tokio::time::sleep(self.settings.sweep_interval).await;

            let report = controller.sweep(ctx, &monitor, &distributor).await?;
            if !report.republished.is_empty() {
                info!("[participant] sweep republished {} task(s), stale: {:?}",
                      report.republished.len(), report.stale);
            }
            self.heartbeat(ctx).await?;

            let board = TaskBoard::fold(&ctx.read_all().await?);
            if board.is_settled(self.settings.max_attempts) {
                let counts = board.counts();
                info!("[participant] all tasks settled ({} completed, {} failed)", counts.completed, counts.failed);
                return self.transition(ParticipantEvent::WorkExhausted);
            }
            if Instant::now() >= deadline {
                return Err(HiveError::RunTimeout(self.settings.run_timeout));
            }
        }
    }

    async fn work(&mut self, ctx: &ParticipantContext) -> Result<()> {
        let distributor = self.distributor();
        let started = Instant::now();
        let deadline = started + self.settings.run_timeout;

        loop {
            let board = TaskBoard::fold(&ctx.read_all().await?);
            if board.is_empty() {
                if started.elapsed() >= self.settings.publish_timeout {
                    return Err(HiveError::NoTaskList(self.settings.publish_timeout));
                }
            } else if board.is_settled(self.settings.max_attempts) {
                info!("[participant] {} found nothing left to do", ctx.id());
                return self.transition(ParticipantEvent::WorkExhausted);
            } else if self.work_step(ctx, &board, &distributor).await? {
                continue;
            }

            if self.last_append.elapsed() >= self.settings.idle_heartbeat {
                self.heartbeat(ctx).await?;
            }
            if Instant::now() >= deadline {
                return Err(HiveError::RunTimeout(self.settings.run_timeout));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Reprend une tâche attribuée, sinon tente un claim. `true` si du travail a été fait
    /// ou si un claim perdu justifie un nouveau scan immédiat.
    async fn work_step(
        &mut self,
        ctx: &ParticipantContext,
        board: &TaskBoard,
        distributor: &TaskDistributor,
    ) -> Result<bool> {
        let resumable = board
            .claimed_by(ctx.id())
            .into_iter()
            .find(|t| !self.finished.contains(&(t.id.clone(), t.attempts)));
        if let Some(task) = resumable {
            info!("[participant] {} resuming {}", ctx.id(), task.id);
            self.execute(ctx, task).await?;
            return Ok(true);
        }

        let Some(task) = distributor.pick(board, &self.skills) else {
            return Ok(false);
        };
        let task_id = task.id.clone();
        match distributor.claim(ctx, &task_id).await? {
            ClaimOutcome::Won => {
                self.last_append = Instant::now();
                let fresh = TaskBoard::fold(&ctx.read_all().await?);
                let task = fresh.get(&task_id).cloned().unwrap_or_else(|| task.clone());
                self.execute(ctx, &task).await?;
                Ok(true)
            }
            other => {
                info!("[participant] {} backs off {}: {:?}", ctx.id(), task_id, other);
                self.last_append = Instant::now();
                Ok(true)
            }
        }
    }

    async fn execute(&mut self, ctx: &ParticipantContext, task: &TaskState) -> Result<()> {
        self.transition(ParticipantEvent::ClaimWon)?;
        let runner = self.runner.clone();
        let outcome = {
            let mut reporter = ProgressReporter::new(ctx, self.probe.as_mut(), task);
            reporter.report(0).await?;
            let outcome = match runner.run(task, &mut reporter).await {
                Ok(outcome) => outcome,
                Err(HiveError::Bus(e)) => return Err(e.into()),
                Err(e) => TaskOutcome::Failed { reason: e.to_string() },
            };
            reporter.finish(&outcome).await?;
            outcome
        };
        self.finished.insert((task.id.clone(), task.attempts));
        self.last_append = Instant::now();

        match outcome {
            TaskOutcome::Completed => {
                info!("[participant] {} completed {}", ctx.id(), task.id);
                self.completed += 1;
                self.transition(ParticipantEvent::TaskFinished)
            }
            TaskOutcome::Failed { reason } => {
                warn!("[participant] {} failed {}: {}", ctx.id(), task.id, reason);
                self.failed += 1;
                self.transition(ParticipantEvent::TaskFailed)
            }
        }
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("status", &self.status)
            .field("skills", &self.skills)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, MessageBus, SharedBus};
    use crate::clock::{SharedClock, TokioClock};

    struct Instant100;

    #[async_trait]
    impl TaskRunner for Instant100 {
        async fn run(&self, _task: &TaskState, progress: &mut ProgressReporter<'_>) -> Result<TaskOutcome> {
            progress.output("step 1");
            progress.report(50).await?;
            progress.output("step 2");
            Ok(TaskOutcome::Completed)
        }
    }

    fn fast_settings() -> ParticipantSettings {
        ParticipantSettings {
            sweep_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            strategy: Strategy::Single,
            leader_works: true,
            ..ParticipantSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lone_leader_does_the_work_itself() {
        let clock: SharedClock = Arc::new(TokioClock::anchored(chrono::Utc::now()));
        let mem = MemoryBus::with_clock(clock.clone()).with_work_item("Ship it", "");
        let bus: SharedBus = Arc::new(mem.clone());

        let summary = Participant::new(fast_settings(), Arc::new(Instant100))
            .run(Candidate::new("solo", bus.clone(), clock))
            .await
            .unwrap();
        assert_eq!(summary.role, Role::Leader);
        assert_eq!(summary.status, ParticipantStatus::Completed);
        assert_eq!(summary.tasks_completed, 1);

        let messages = bus.read_all().await.unwrap();
        let board = TaskBoard::fold(&messages);
        assert_eq!(board.get("task-1").unwrap().status, TaskStatus::Completed);
        let milestones: Vec<u8> = messages
            .iter()
            .filter_map(|m| match &m.body {
                MessageBody::Heartbeat(r) => r.task.as_ref().map(|t| t.progress_percent),
                _ => None,
            })
            .collect();
        assert_eq!(milestones, vec![0, 50, 100]);
        match &messages.last().unwrap().body {
            MessageBody::Heartbeat(r) => assert_eq!(r.status, ParticipantStatus::Completed),
            other => panic!("unexpected final message {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_moves_onto_its_own_task() {
        let clock: SharedClock = Arc::new(TokioClock::anchored(chrono::Utc::now()));
        let bus: SharedBus = Arc::new(MemoryBus::with_clock(clock.clone()).with_work_item("Ship it", ""));
        let participant = Participant::new(fast_settings(), Arc::new(Instant100))
            .with_probe(Box::new(StaticProbe(crate::message::HealthSample { cpu_percent: 3.0, memory_mb: 64 })));

        let summary = tokio::spawn(participant.run(Candidate::new("solo", bus, clock)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.tasks_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_gives_up_without_a_task_list() {
        let clock: SharedClock = Arc::new(TokioClock::anchored(chrono::Utc::now()));
        let bus: SharedBus = Arc::new(MemoryBus::with_clock(clock.clone()));
        let settings = ParticipantSettings {
            election: ElectionConfig { candidate: false, ..ElectionConfig::default() },
            publish_timeout: Duration::from_secs(30),
            ..fast_settings()
        };
        // un leader fantôme qui ne publie jamais
        bus.append(
            "ghost",
            &MessageBody::LeaderClaim(crate::message::LeaderClaim {
                participant_id: "ghost".into(),
                observed_at: clock.now(),
            }),
        )
        .await
        .unwrap();

        let err = Participant::new(settings, Arc::new(Instant100))
            .run(Candidate::new("w1", bus.clone(), clock))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::NoTaskList(_)));

        let last = bus.read_all().await.unwrap().pop().unwrap();
        assert_eq!(last.sender, "w1");
        assert!(matches!(last.body, MessageBody::Heartbeat(ref r) if r.status == ParticipantStatus::Failed));
    }
}
