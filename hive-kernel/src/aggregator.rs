/**
 * STATE AGGREGATOR - Projection du journal en SystemSnapshot
 *
 * RÔLE : Replier le flux brut en un état structuré pour les consommateurs
 * externes (API REST, MQTT, abonnés en process). Le snapshot est dérivé, jamais
 * autoritaire : il ne contredit jamais le journal.
 *
 * FONCTIONNEMENT :
 * - fold dans l'ordre des positions, « le plus récent gagne » par entité
 * - par défaut relecture complète à chaque cycle ; en mode incrémental, seules les
 *   entrées au-delà du checkpoint sont repliées, et toute entrée apparue sous le
 *   checkpoint après coup déclenche une relecture complète
 * - tâches bloquées : `pending` derrière une dépendance définitivement échouée
 * - push : `SnapshotHub` (watch) ; pull : `SnapshotHub::fetch`
 */

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::{BusError, MessageBus, SharedBus};
use crate::clock::SharedClock;
use crate::election::ClaimRef;
use crate::health::HealthMonitor;
use crate::lifecycle::ParticipantStatus;
use crate::message::{
    HealthSample, LogPosition, Message, MessageBody, ParticipantId, Role, StatusReport, TaskId,
    TaskProgress,
};
use crate::status::ServiceStatus;
use crate::tasks::{TaskBoard, TaskCounts, TaskState, DEFAULT_MAX_ATTEMPTS};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: ParticipantId,
    pub role: Option<Role>,
    pub status: ParticipantStatus,
    pub stale: bool,
    /// statut final (completed / failed) publié à la sortie
    pub departed: bool,
    pub agent: Option<String>,
    pub skills: Vec<String>,
    pub last_heartbeat_position: Option<LogPosition>,
    pub last_seen_position: LogPosition,
    pub last_seen_at: DateTime<Utc>,
    pub health: Option<HealthSample>,
    pub current_task: Option<TaskProgress>,
    pub recent_output_lines: Vec<String>,
}

impl ParticipantView {
    fn new(m: &Message) -> Self {
        Self {
            id: m.sender.clone(),
            role: None,
            status: ParticipantStatus::Starting,
            stale: false,
            departed: false,
            agent: None,
            skills: Vec::new(),
            last_heartbeat_position: None,
            last_seen_position: m.position,
            last_seen_at: m.observed_at,
            health: None,
            current_task: None,
            recent_output_lines: Vec::new(),
        }
    }

    fn apply_report(&mut self, report: &StatusReport) {
        self.status = report.status;
        self.role = Some(report.role);
        self.current_task = report.task.clone();
        if report.health.is_some() {
            self.health = report.health;
        }
        if !report.recent_output_lines.is_empty() {
            self.recent_output_lines = report.recent_output_lines.clone();
        }
        self.departed = report.status.is_terminal();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    /// dernière position repliée
    pub as_of: LogPosition,
    pub generated_at: DateTime<Utc>,
    pub leader: Option<ParticipantId>,
    pub participants: BTreeMap<ParticipantId, ParticipantView>,
    pub tasks: Vec<TaskState>,
    pub counts: TaskCounts,
    /// tâches `pending` qui ne pourront plus démarrer
    pub blocked: Vec<TaskId>,
    pub progress_percent: u8,
    pub messages: usize,
}

impl SystemSnapshot {
    pub fn empty(generated_at: DateTime<Utc>) -> Self {
        Self {
            as_of: LogPosition::ORIGIN,
            generated_at,
            leader: None,
            participants: BTreeMap::new(),
            tasks: Vec::new(),
            counts: TaskCounts::default(),
            blocked: Vec::new(),
            progress_percent: 0,
            messages: 0,
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskState> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn stale_participants(&self) -> impl Iterator<Item = &ParticipantView> {
        self.participants.values().filter(|p| p.stale)
    }
}

/// Accumulateur du fold ; réutilisable entre deux cycles en mode incrémental.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    checkpoint: LogPosition,
    leader: Option<ClaimRef>,
    participants: BTreeMap<ParticipantId, ParticipantView>,
    board: TaskBoard,
    messages: usize,
    max_attempts: u32,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self {
            checkpoint: LogPosition::ORIGIN,
            leader: None,
            participants: BTreeMap::new(),
            board: TaskBoard::default(),
            messages: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn checkpoint(&self) -> LogPosition {
        self.checkpoint
    }

    /// Nombre de messages repliés jusqu'ici.
    pub fn folded(&self) -> usize {
        self.messages
    }

    /// Ignore tout message déjà couvert par le checkpoint.
    pub fn apply(&mut self, m: &Message) {
        if m.position <= self.checkpoint {
            return;
        }
        self.checkpoint = m.position;
        self.messages += 1;

        let view = self
            .participants
            .entry(m.sender.clone())
            .or_insert_with(|| ParticipantView::new(m));
        view.last_seen_position = m.position;
        view.last_seen_at = m.observed_at;

        match &m.body {
            MessageBody::LeaderClaim(_) => {
                let claim = ClaimRef {
                    participant_id: m.sender.clone(),
                    observed_at: m.observed_at,
                    position: m.position,
                };
                if self.leader.as_ref().map_or(true, |current| claim < *current) {
                    self.leader = Some(claim);
                }
            }
            MessageBody::NodeAnnounce(announce) => {
                view.role = Some(announce.role);
                view.skills = announce.skills.clone();
                view.agent = announce.agent.clone();
                if view.status == ParticipantStatus::Starting {
                    view.status = ParticipantStatus::Ready;
                }
            }
            MessageBody::Heartbeat(report) => {
                view.last_heartbeat_position = Some(m.position);
                view.apply_report(report);
            }
            MessageBody::Progress(report) => view.apply_report(report),
            MessageBody::TaskPublish(_) | MessageBody::TaskClaim(_) => {}
        }
        self.board.apply(m);
    }

    /// Trie puis applique un lot.
    pub fn extend<'a, I>(&mut self, messages: I)
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut batch: Vec<&Message> = messages.into_iter().collect();
        batch.sort_by_key(|m| m.position);
        for m in batch {
            self.apply(m);
        }
    }

    pub fn build(&self, now: DateTime<Utc>, monitor: &HealthMonitor) -> SystemSnapshot {
        let participants = self
            .participants
            .iter()
            .map(|(id, view)| {
                let mut view = view.clone();
                view.stale = monitor.is_stale(view.last_seen_at, now);
                if view.stale && !view.status.is_terminal() {
                    view.status = ParticipantStatus::Stale;
                }
                (id.clone(), view)
            })
            .collect();

        SystemSnapshot {
            as_of: self.checkpoint,
            generated_at: now,
            leader: self.leader.as_ref().map(|c| c.participant_id.clone()),
            participants,
            tasks: self.board.tasks().into_iter().cloned().collect(),
            counts: self.board.counts(),
            blocked: self.board.blocked(self.max_attempts).into_iter().collect(),
            progress_percent: self.board.progress_percent(),
            messages: self.messages,
        }
    }
}

/// Relecture complète d'une séquence de messages.
pub fn replay(messages: &[Message], now: DateTime<Utc>, monitor: &HealthMonitor) -> SystemSnapshot {
    let mut builder = SnapshotBuilder::new();
    builder.extend(messages);
    builder.build(now, monitor)
}

/// Dernier snapshot publié : push via `subscribe`, pull via `fetch`.
#[derive(Debug, Clone)]
pub struct SnapshotHub {
    tx: Arc<watch::Sender<Arc<SystemSnapshot>>>,
}

impl SnapshotHub {
    pub fn new(initial: SystemSnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, snapshot: SystemSnapshot) -> Arc<SystemSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.tx.send_replace(snapshot.clone());
        snapshot
    }

    pub fn fetch(&self) -> Arc<SystemSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SystemSnapshot>> {
        self.tx.subscribe()
    }
}

/// Cycle d'agrégation : lecture du bus, fold, publication dans le hub.
pub struct Aggregator {
    bus: SharedBus,
    clock: SharedClock,
    monitor: HealthMonitor,
    hub: SnapshotHub,
    incremental: bool,
    max_attempts: u32,
    builder: Mutex<SnapshotBuilder>,
}

impl Aggregator {
    pub fn new(bus: SharedBus, clock: SharedClock, monitor: HealthMonitor) -> Self {
        let hub = SnapshotHub::new(SystemSnapshot::empty(clock.now()));
        Self {
            bus,
            clock,
            monitor,
            hub,
            incremental: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            builder: Mutex::new(SnapshotBuilder::new()),
        }
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    /// Plafond de tentatives utilisé pour repérer les tâches bloquées.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self.builder = Mutex::new(SnapshotBuilder::new().with_max_attempts(max_attempts));
        self
    }

    pub fn hub(&self) -> SnapshotHub {
        self.hub.clone()
    }

    pub async fn refresh(&self) -> Result<Arc<SystemSnapshot>, BusError> {
        let messages = self.bus.read_all().await?;
        let snapshot = if self.incremental {
            let mut builder = self.builder.lock();
            let checkpoint = builder.checkpoint();
            let below = messages.iter().filter(|m| m.position <= checkpoint).count();
            if below != builder.folded() {
                warn!("[aggregator] {} entr(ies) surfaced below checkpoint {}, replaying",
                      below.saturating_sub(builder.folded()), checkpoint);
                *builder = SnapshotBuilder::new().with_max_attempts(self.max_attempts);
            }
            builder.extend(&messages);
            builder.build(self.clock.now(), &self.monitor)
        } else {
            let mut builder = SnapshotBuilder::new().with_max_attempts(self.max_attempts);
            builder.extend(&messages);
            builder.build(self.clock.now(), &self.monitor)
        };
        debug!("[aggregator] snapshot as of {} ({} messages, {} tasks)",
               snapshot.as_of, snapshot.messages, snapshot.tasks.len());
        Ok(self.hub.publish(snapshot))
    }

    /// Boucle périodique ; une erreur de lecture n'arrête pas l'agrégation.
    pub fn spawn(self: Arc<Self>, every: Duration, status: ServiceStatus) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.refresh().await {
                    Ok(_) => status.record_refresh(),
                    Err(e) => {
                        warn!("[aggregator] refresh failed: {}", e);
                        status.record_failure(e);
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("incremental", &self.incremental)
            .field("checkpoint", &self.builder.lock().checkpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, MessageBus};
    use crate::clock;
    use crate::lifecycle::TaskStatus;
    use crate::message::{LeaderClaim, NodeAnnounce, PublishReason, TaskClaim, TaskPublish, TaskSpec};

    fn msg(position: u64, at: DateTime<Utc>, sender: &str, body: MessageBody) -> Message {
        Message { position: LogPosition(position), observed_at: at, sender: sender.into(), body }
    }

    fn stream(t: DateTime<Utc>) -> Vec<Message> {
        vec![
            msg(1, t, "w1", MessageBody::LeaderClaim(LeaderClaim { participant_id: "w1".into(), observed_at: t })),
            msg(2, t, "w2", MessageBody::NodeAnnounce(NodeAnnounce { role: Role::Worker, skills: vec!["api".into()], agent: None })),
            msg(
                3,
                t + chrono::Duration::seconds(10),
                "w2",
                MessageBody::Heartbeat(
                    StatusReport::new(ParticipantStatus::InProgress, Role::Worker)
                        .with_health(HealthSample { cpu_percent: 12.5, memory_mb: 512 })
                        .with_output(["compiling", "done"]),
                ),
            ),
            msg(4, t + chrono::Duration::seconds(20), "w2", MessageBody::Heartbeat(StatusReport::new(ParticipantStatus::Ready, Role::Worker))),
        ]
    }

    #[test]
    fn most_recent_report_wins_but_keeps_last_known_health() {
        let t = Utc::now();
        let snap = replay(&stream(t), t + chrono::Duration::seconds(30), &HealthMonitor::default());
        let w2 = &snap.participants["w2"];
        assert_eq!(w2.status, ParticipantStatus::Ready);
        assert_eq!(w2.last_heartbeat_position, Some(LogPosition(4)));
        assert_eq!(w2.health.unwrap().memory_mb, 512);
        assert_eq!(w2.recent_output_lines, vec!["compiling", "done"]);
        assert_eq!(w2.skills, vec!["api"]);
        assert_eq!(snap.leader.as_deref(), Some("w1"));
        assert_eq!(snap.as_of, LogPosition(4));
    }

    #[test]
    fn silent_participants_show_as_stale() {
        let t = Utc::now();
        let snap = replay(&stream(t), t + chrono::Duration::seconds(305), &HealthMonitor::default());
        assert_eq!(snap.participants["w1"].status, ParticipantStatus::Stale);
        assert!(snap.participants["w1"].stale);
        assert!(!snap.participants["w2"].stale);
        assert_eq!(snap.stale_participants().count(), 1);
    }

    #[test]
    fn incremental_fold_equals_full_replay() {
        let t = Utc::now();
        let all = stream(t);
        let now = t + chrono::Duration::seconds(60);
        let monitor = HealthMonitor::default();

        let mut builder = SnapshotBuilder::new();
        builder.extend(&all[..2]);
        builder.extend(&all[1..]);
        assert_eq!(builder.build(now, &monitor), replay(&all, now, &monitor));
        assert_eq!(replay(&all, now, &monitor), replay(&all, now, &monitor));
    }

    #[test]
    fn tasks_behind_a_dead_dependency_are_reported_blocked() {
        let t = Utc::now();
        let spec = |id: &str, deps: &[&str]| TaskSpec {
            id: id.into(),
            title: id.into(),
            description: String::new(),
            required_skills: Vec::new(),
            priority: 5,
            estimated_hours: 1.0,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            status: TaskStatus::Pending,
        };
        let failed = StatusReport::new(ParticipantStatus::Ready, Role::Worker).with_task(TaskProgress {
            id: "task-1".into(),
            description: String::new(),
            progress_percent: 20,
            status: TaskStatus::Failed,
        });
        let log = vec![
            msg(1, t, "lead", MessageBody::TaskPublish(TaskPublish {
                tasks: vec![spec("task-1", &[]), spec("task-2", &["task-1"])],
                reason: PublishReason::Initial,
            })),
            msg(2, t, "w1", MessageBody::TaskClaim(TaskClaim {
                task_id: "task-1".into(),
                participant_id: "w1".into(),
                observed_at: t,
            })),
            msg(3, t, "w1", MessageBody::Progress(failed)),
        ];
        let monitor = HealthMonitor::default();

        let retrying = replay(&log, t, &monitor);
        assert!(retrying.blocked.is_empty());

        let mut builder = SnapshotBuilder::new().with_max_attempts(1);
        builder.extend(&log);
        let snap = builder.build(t, &monitor);
        assert_eq!(snap.blocked, vec!["task-2".to_string()]);
        assert_eq!(snap.counts.pending, 1);
        assert_eq!(serde_json::to_value(&snap).unwrap()["blocked"][0], "task-2");
    }

    #[tokio::test]
    async fn refresh_pushes_to_subscribers() {
        let bus = MemoryBus::new();
        bus.append("w1", &MessageBody::LeaderClaim(LeaderClaim { participant_id: "w1".into(), observed_at: Utc::now() }))
            .await
            .unwrap();
        let aggregator = Aggregator::new(Arc::new(bus.clone()), clock::system(), HealthMonitor::default());
        let mut rx = aggregator.hub().subscribe();

        aggregator.refresh().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().leader.as_deref(), Some("w1"));
        assert_eq!(aggregator.hub().fetch().counts.total(), 0);
        assert_eq!(aggregator.hub().fetch().tasks.iter().filter(|t| t.status == TaskStatus::Pending).count(), 0);
    }
}
