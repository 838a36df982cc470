/*!
Test Harness pour runs multi-participants

Un bus mémoire partagé, une horloge liée au temps tokio (compatible
`start_paused`) et des helpers pour lancer des participants en parallèle
puis inspecter le journal obtenu.
*/

use anyhow::{ensure, Result};
use async_trait::async_trait;
use hive_kernel::bus::{MemoryBus, MessageBus, SharedBus};
use hive_kernel::clock::{SharedClock, TokioClock};
use hive_kernel::election::resolve_leader;
use hive_kernel::participant::{Participant, ParticipantSettings, ProgressReporter, RunSummary, TaskOutcome, TaskRunner};
use hive_kernel::tasks::{TaskBoard, TaskState};
use hive_kernel::{Candidate, HiveError, Message, MessageBody};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct TestHarness {
    pub clock: SharedClock,
    pub bus: MemoryBus,
}

impl TestHarness {
    /// À appeler dans un runtime tokio : l'horloge s'ancre sur l'instant tokio courant.
    pub fn new() -> Self {
        env_logger::try_init().ok();
        let clock: SharedClock = Arc::new(TokioClock::anchored(chrono::Utc::now()));
        Self {
            bus: MemoryBus::with_clock(clock.clone()),
            clock,
        }
    }

    pub fn with_work_item(mut self, title: &str, body: &str) -> Self {
        self.bus = self.bus.with_work_item(title, body);
        self
    }

    pub fn shared_bus(&self) -> SharedBus {
        Arc::new(self.bus.clone())
    }

    pub fn candidate(&self, id: &str) -> Candidate {
        Candidate::new(id, self.shared_bus(), self.clock.clone())
    }

    /// Lance un participant dans sa propre tâche tokio.
    pub fn spawn(
        &self,
        id: &str,
        settings: ParticipantSettings,
        skills: &[&str],
        runner: Arc<dyn TaskRunner>,
    ) -> JoinHandle<Result<RunSummary, HiveError>> {
        let participant = Participant::new(settings, runner)
            .with_skills(None, skills.iter().map(|s| s.to_string()).collect());
        let candidate = self.candidate(id);
        log::info!("🐝 spawning participant {}", id);
        tokio::spawn(participant.run(candidate))
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.bus.read_all().await.unwrap_or_default()
    }

    pub async fn board(&self) -> TaskBoard {
        TaskBoard::fold(&self.messages().await)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Déroulé d'une tâche : jalons de progression espacés de `step`, puis issue.
#[derive(Debug, Clone)]
pub struct Script {
    pub steps: Vec<u8>,
    pub step: Duration,
    pub outcome: TaskOutcome,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            steps: vec![50],
            step: Duration::from_secs(10),
            outcome: TaskOutcome::Completed,
        }
    }
}

/// `TaskRunner` de test : script par tâche (ou par défaut) et journal des exécutions.
#[derive(Default)]
pub struct ScriptedRunner {
    default: Script,
    per_task: BTreeMap<String, Script>,
    runs: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task_id: &str, script: Script) -> Self {
        self.per_task.insert(task_id.into(), script);
        self
    }

    /// Identifiants des tâches exécutées, dans l'ordre de démarrage.
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, task: &TaskState, progress: &mut ProgressReporter<'_>) -> Result<TaskOutcome, HiveError> {
        self.runs.lock().unwrap().push(task.id.clone());
        let script = self.per_task.get(&task.id).unwrap_or(&self.default).clone();
        for percent in script.steps {
            tokio::time::sleep(script.step).await;
            progress.output(format!("{} at {}%", task.id, percent));
            progress.report(percent).await?;
        }
        Ok(script.outcome)
    }
}

/// Tous les participants ont-ils élu le même leader ?
pub fn assert_single_leader(summaries: &[RunSummary]) -> Result<String> {
    let leaders: Vec<&str> = summaries.iter().map(|s| s.leader.as_str()).collect();
    ensure!(!leaders.is_empty(), "no summaries");
    ensure!(leaders.iter().all(|l| *l == leaders[0]), "split brain: {:?}", leaders);
    Ok(leaders[0].to_string())
}

/// Le leader résolu depuis le journal doit être celui sur lequel tous se sont accordés.
pub fn assert_log_leader(messages: &[Message], expected: &str) -> Result<()> {
    let claim = resolve_leader(messages).ok_or_else(|| anyhow::anyhow!("no leader claim in log"))?;
    ensure!(claim.participant_id == expected, "log says {}, run says {}", claim.participant_id, expected);
    Ok(())
}

/// Nombre de `task_publish` (initiale + republications).
pub fn count_task_publishes(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m.body, MessageBody::TaskPublish(_)))
        .count()
}
