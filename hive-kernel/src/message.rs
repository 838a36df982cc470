/**
 * MESSAGES - Somme fermée des six types de messages du protocole
 *
 * RÔLE : Définit le contenu des commentaires échangés sur le bus et leur codec.
 * Le décodage se fait une seule fois, à la frontière du bus.
 *
 * FORMAT D'UN COMMENTAIRE : ligne marqueur `<!-- hive:v1 -->`, ligne lisible
 * (ex: "🎯 **leader_claim** from `run-42-1`"), puis un bloc json contenant
 * l'enveloppe `{"v":1,"participantId":...,"message":{"kind":...}}`.
 *
 * Les commentaires sans marqueur (humains) sont ignorés ; ceux qui portent le
 * marqueur mais ne se décodent pas sont sautés et loggés.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

use crate::lifecycle::{ParticipantStatus, TaskStatus};

pub type ParticipantId = String;
pub type TaskId = String;

/// Taille max de l'aperçu de sortie transporté dans un heartbeat/progress
pub const MAX_OUTPUT_LINES: usize = 20;

const MARKER: &str = "<!-- hive:v1 -->";
const ENVELOPE_VERSION: u32 = 1;

/// Position attribuée par l'hôte à l'append ; définit l'ordre total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub const ORIGIN: LogPosition = LogPosition(0);

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    LeaderClaim,
    NodeAnnounce,
    TaskPublish,
    TaskClaim,
    Progress,
    Heartbeat,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeaderClaim => "leader_claim",
            Self::NodeAnnounce => "node_announce",
            Self::TaskPublish => "task_publish",
            Self::TaskClaim => "task_claim",
            Self::Progress => "progress",
            Self::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Leader => "leader",
            Role::Worker => "worker",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderClaim {
    pub participant_id: ParticipantId,
    /// horloge locale du candidat, informative : l'ordre utilise l'horodatage de l'hôte
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAnnounce {
    pub role: Role,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub estimated_hours: f32,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// toujours `pending` dans une publication : la tâche redevient disponible
    #[serde(default)]
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishReason {
    #[default]
    Initial,
    Reassigned {
        #[serde(rename = "previousAssignee")]
        previous_assignee: ParticipantId,
    },
    Retry {
        attempt: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPublish {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub reason: PublishReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskClaim {
    pub task_id: TaskId,
    pub participant_id: ParticipantId,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub cpu_percent: f32,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub id: TaskId,
    pub description: String,
    pub progress_percent: u8,
    pub status: TaskStatus,
}

/// Payload commun de `heartbeat` et `progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: ParticipantStatus,
    pub role: Role,
    #[serde(default)]
    pub task: Option<TaskProgress>,
    #[serde(default)]
    pub health: Option<HealthSample>,
    #[serde(default)]
    pub recent_output_lines: Vec<String>,
}

impl StatusReport {
    pub fn new(status: ParticipantStatus, role: Role) -> Self {
        Self {
            status,
            role,
            task: None,
            health: None,
            recent_output_lines: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskProgress) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_health(mut self, health: HealthSample) -> Self {
        self.health = Some(health);
        self
    }

    /// Garde uniquement les `MAX_OUTPUT_LINES` dernières lignes.
    pub fn with_output<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.len() > MAX_OUTPUT_LINES {
            lines.drain(..lines.len() - MAX_OUTPUT_LINES);
        }
        self.recent_output_lines = lines;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    LeaderClaim(LeaderClaim),
    NodeAnnounce(NodeAnnounce),
    TaskPublish(TaskPublish),
    TaskClaim(TaskClaim),
    Progress(StatusReport),
    Heartbeat(StatusReport),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::LeaderClaim(_) => MessageKind::LeaderClaim,
            Self::NodeAnnounce(_) => MessageKind::NodeAnnounce,
            Self::TaskPublish(_) => MessageKind::TaskPublish,
            Self::TaskClaim(_) => MessageKind::TaskClaim,
            Self::Progress(_) => MessageKind::Progress,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
        }
    }

    pub fn status_report(&self) -> Option<&StatusReport> {
        match self {
            Self::Progress(r) | Self::Heartbeat(r) => Some(r),
            _ => None,
        }
    }

    /// Ligne lisible affichée au-dessus du JSON dans le commentaire.
    fn summary(&self, sender: &str) -> String {
        match self {
            Self::LeaderClaim(_) => format!("🎯 **leader_claim** from `{sender}`"),
            Self::NodeAnnounce(a) => format!("📡 **node_announce** `{sender}` as {}", a.role),
            Self::TaskPublish(p) => format!("📋 **task_publish** {} task(s) by `{sender}`", p.tasks.len()),
            Self::TaskClaim(c) => format!("🙋 **task_claim** `{}` by `{sender}`", c.task_id),
            Self::Progress(r) => match &r.task {
                Some(t) => format!("📊 **progress** `{sender}` {} {}%", t.id, t.progress_percent),
                None => format!("📊 **progress** `{sender}` {}", r.status),
            },
            Self::Heartbeat(r) => format!("💓 **heartbeat** `{sender}` {}", r.status),
        }
    }
}

/// Message décodé, tel que vu par un lecteur du bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub position: LogPosition,
    pub observed_at: DateTime<Utc>,
    pub sender: ParticipantId,
    pub body: MessageBody,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Entrée brute stockée par l'hôte (texte du commentaire + métadonnées d'append).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub position: LogPosition,
    pub observed_at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("marker present but no ```json envelope")]
    MissingEnvelope,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("payload participant '{payload}' does not match sender '{sender}'")]
    SenderMismatch { sender: String, payload: String },
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a> {
    v: u32,
    participant_id: &'a str,
    message: &'a MessageBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    v: u32,
    participant_id: ParticipantId,
    message: MessageBody,
}

pub fn encode(sender: &str, body: &MessageBody) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(&EnvelopeRef {
        v: ENVELOPE_VERSION,
        participant_id: sender,
        message: body,
    })?;
    Ok(format!("{MARKER}\n{}\n\n```json\n{json}\n```", body.summary(sender)))
}

/// `Ok(None)` : commentaire étranger au protocole.
pub fn decode(entry: &RawEntry) -> Result<Option<Message>, DecodeError> {
    let text = entry.text.trim_start();
    let Some(rest) = text.strip_prefix(MARKER) else {
        return Ok(None);
    };
    let start = rest.find("```json").ok_or(DecodeError::MissingEnvelope)? + "```json".len();
    let len = rest[start..].find("```").ok_or(DecodeError::MissingEnvelope)?;
    let envelope: Envelope = serde_json::from_str(rest[start..start + len].trim())?;

    if envelope.v != ENVELOPE_VERSION {
        return Err(DecodeError::UnsupportedVersion(envelope.v));
    }
    let claimed_by = match &envelope.message {
        MessageBody::LeaderClaim(c) => Some(&c.participant_id),
        MessageBody::TaskClaim(c) => Some(&c.participant_id),
        _ => None,
    };
    if let Some(payload) = claimed_by {
        if *payload != envelope.participant_id {
            return Err(DecodeError::SenderMismatch {
                sender: envelope.participant_id,
                payload: payload.clone(),
            });
        }
    }

    Ok(Some(Message {
        position: entry.position,
        observed_at: entry.observed_at,
        sender: envelope.participant_id,
        body: envelope.message,
    }))
}

/// Décode un lot d'entrées, triées par position ; les entrées corrompues sont sautées.
pub fn decode_entries<'a, I>(entries: I) -> Vec<Message>
where
    I: IntoIterator<Item = &'a RawEntry>,
{
    let mut messages: Vec<Message> = entries
        .into_iter()
        .filter_map(|entry| match decode(entry) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[bus] skipping malformed message at {}: {}", entry.position, e);
                None
            }
        })
        .collect();
    messages.sort_by_key(|m| m.position);
    messages
}
