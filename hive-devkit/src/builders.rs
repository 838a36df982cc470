/*!
Construction de journaux de scénario

Chaque entrée est placée à une position et à un horodatage explicites
(secondes depuis l'origine du scénario), ce qui permet de rejouer exactement
les cas de course : claims concurrents, horloges décalées, silences.
*/

use chrono::{DateTime, Duration, Utc};
use hive_kernel::bus::{BusError, MemoryBus};
use hive_kernel::lifecycle::{ParticipantStatus, TaskStatus};
use hive_kernel::message::{
    LeaderClaim, LogPosition, Message, MessageBody, NodeAnnounce, PublishReason, Role, StatusReport,
    TaskClaim, TaskProgress, TaskPublish, TaskSpec,
};

/// Spécification de tâche minimale : sans dépendances, priorité 5.
pub fn spec(id: &str, skills: &[&str]) -> TaskSpec {
    TaskSpec {
        id: id.into(),
        title: format!("Task {id}"),
        description: format!("work for {id}"),
        required_skills: skills.iter().map(|s| s.to_string()).collect(),
        priority: 5,
        estimated_hours: 1.0,
        dependencies: Default::default(),
        status: TaskStatus::Pending,
    }
}

#[derive(Debug, Clone)]
struct Entry {
    position: LogPosition,
    observed_at: DateTime<Utc>,
    sender: String,
    body: MessageBody,
}

#[derive(Debug, Clone)]
pub struct ScenarioBuilder {
    origin: DateTime<Utc>,
    entries: Vec<Entry>,
}

impl ScenarioBuilder {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            entries: Vec::new(),
        }
    }

    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    /// Instant `secs` secondes après l'origine.
    pub fn at(&self, secs: i64) -> DateTime<Utc> {
        self.origin + Duration::seconds(secs)
    }

    pub fn entry(mut self, position: u64, secs: i64, sender: &str, body: MessageBody) -> Self {
        self.entries.push(Entry {
            position: LogPosition(position),
            observed_at: self.at(secs),
            sender: sender.into(),
            body,
        });
        self
    }

    pub fn leader_claim(self, position: u64, secs: i64, id: &str) -> Self {
        let observed_at = self.at(secs);
        self.entry(
            position,
            secs,
            id,
            MessageBody::LeaderClaim(LeaderClaim {
                participant_id: id.into(),
                observed_at,
            }),
        )
    }

    pub fn announce(self, position: u64, secs: i64, id: &str, role: Role, skills: &[&str]) -> Self {
        self.entry(
            position,
            secs,
            id,
            MessageBody::NodeAnnounce(NodeAnnounce {
                role,
                skills: skills.iter().map(|s| s.to_string()).collect(),
                agent: None,
            }),
        )
    }

    pub fn publish(self, position: u64, secs: i64, leader: &str, tasks: Vec<TaskSpec>) -> Self {
        self.publish_with(position, secs, leader, tasks, PublishReason::Initial)
    }

    pub fn publish_with(
        self,
        position: u64,
        secs: i64,
        leader: &str,
        tasks: Vec<TaskSpec>,
        reason: PublishReason,
    ) -> Self {
        self.entry(
            position,
            secs,
            leader,
            MessageBody::TaskPublish(TaskPublish { tasks, reason }),
        )
    }

    pub fn claim(self, position: u64, secs: i64, participant: &str, task_id: &str) -> Self {
        let observed_at = self.at(secs);
        self.entry(
            position,
            secs,
            participant,
            MessageBody::TaskClaim(TaskClaim {
                task_id: task_id.into(),
                participant_id: participant.into(),
                observed_at,
            }),
        )
    }

    /// Rapport `progress` sur une tâche (statut participant `in_progress`).
    pub fn progress(self, position: u64, secs: i64, participant: &str, task_id: &str, percent: u8, status: TaskStatus) -> Self {
        let report = StatusReport::new(ParticipantStatus::InProgress, Role::Worker).with_task(TaskProgress {
            id: task_id.into(),
            description: format!("Task {task_id}"),
            progress_percent: percent,
            status,
        });
        self.entry(position, secs, participant, MessageBody::Progress(report))
    }

    pub fn heartbeat(self, position: u64, secs: i64, participant: &str, status: ParticipantStatus) -> Self {
        self.entry(
            position,
            secs,
            participant,
            MessageBody::Heartbeat(StatusReport::new(status, Role::Worker)),
        )
    }

    /// Messages triés par position, tels qu'un lecteur les décoderait.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .entries
            .iter()
            .map(|e| Message {
                position: e.position,
                observed_at: e.observed_at,
                sender: e.sender.clone(),
                body: e.body.clone(),
            })
            .collect();
        messages.sort_by_key(|m| m.position);
        messages
    }

    /// Écrit le scénario dans un bus mémoire (les appends suivants prennent la suite).
    pub fn into_bus(self, bus: &MemoryBus) -> Result<(), BusError> {
        for e in &self.entries {
            bus.insert_at(e.position, e.observed_at, &e.sender, &e.body)?;
        }
        log::debug!("📜 scenario of {} entries loaded", self.entries.len());
        Ok(())
    }
}
