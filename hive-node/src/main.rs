//! Hive Node - participant process of a coordinated run
//!
//! One process per participant, typically one CI job per instance:
//! - joins the leader election on the work item's comment log
//! - as leader: plans, publishes and supervises the task list
//! - as worker: claims tasks and runs them through the configured command
//! - prints a JSON run report on stdout when it exits
//!
//! Environment:
//! - `HIVE_PARTICIPANT_ID`: explicit identity (else derived from `GITHUB_RUN_ID`
//!   and `HIVE_INSTANCE`, else random)
//! - `HIVE_AGENT` / `HIVE_INSTANCE`: selects the agent profile (skills)
//! - `HIVE_TASK`: overrides the work item text used for planning

mod execution;
mod metrics;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use execution::CommandRunner;
use hive_kernel::bus::{GithubIssueBus, RetryPolicy, RetryingBus, WorkItem};
use hive_kernel::participant::{Participant, ParticipantSettings, RunSummary};
use hive_kernel::{clock, config, Candidate, ParticipantStatus, Role, SharedBus};
use metrics::SysinfoProbe;

/// Final report (one JSON line) consumed by the CI workflow.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport {
    participant_id: String,
    role: Role,
    leader: String,
    status: ParticipantStatus,
    tasks_completed: usize,
    tasks_failed: usize,
    finished_at: DateTime<Utc>,
}

impl From<RunSummary> for RunReport {
    fn from(s: RunSummary) -> Self {
        Self {
            participant_id: s.participant,
            role: s.role,
            leader: s.leader,
            status: s.status,
            tasks_completed: s.tasks_completed,
            tasks_failed: s.tasks_failed,
            finished_at: Utc::now(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn participant_id(explicit: Option<String>, run_id: Option<String>, instance: Option<usize>) -> String {
    if let Some(id) = explicit {
        return id;
    }
    match (run_id, instance) {
        (Some(run), Some(i)) => format!("run-{}-{}", run, i),
        (Some(run), None) => format!("run-{}-{}", run, short_uuid()),
        _ => format!("node-{}", short_uuid()),
    }
}

fn short_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `HIVE_TASK` : première ligne = titre, le reste = description.
fn work_item_override(raw: &str) -> WorkItem {
    let mut lines = raw.lines();
    let title = lines.next().unwrap_or_default().trim().to_string();
    let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    WorkItem { title, body }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let conf = config::load().await.context("loading hive config")?;
    conf.validate().context("validating hive config")?;

    let instance = match env_var("HIVE_INSTANCE") {
        Some(raw) => Some(raw.parse::<usize>().with_context(|| format!("HIVE_INSTANCE={raw:?} is not a number"))?),
        None => None,
    };
    let id = participant_id(env_var("HIVE_PARTICIPANT_ID"), env_var("GITHUB_RUN_ID"), instance);
    let agent_name = env_var("HIVE_AGENT");
    let agent = conf.agent_for(agent_name.as_deref(), instance).cloned();
    if agent.is_none() && agent_name.is_some() {
        warn!("[node] unknown agent {:?}, running as generalist", agent_name);
    }

    let Some(github) = conf.github.clone() else {
        bail!("no `github` section in config: nothing to coordinate on");
    };
    let Some(runner_conf) = conf.runner.as_ref() else {
        bail!("no `runner` section in config: nodes need a command to execute tasks");
    };

    let bus: SharedBus = Arc::new(RetryingBus::new(
        GithubIssueBus::new(github).context("building GitHub bus")?,
        RetryPolicy::default(),
    ));

    let mut participant = Participant::new(ParticipantSettings::from(&conf), Arc::new(CommandRunner::from(runner_conf)))
        .with_probe(Box::new(SysinfoProbe::new()));
    if let Some(agent) = agent {
        info!("[node] {} runs as {} ({:?})", id, agent.name, agent.skills);
        participant = participant.with_skills(Some(agent.name), agent.skills);
    }
    if let Some(raw) = env_var("HIVE_TASK") {
        participant = participant.with_work_item(work_item_override(&raw));
    }

    let summary = participant
        .run(Candidate::new(id.clone(), bus, clock::system()))
        .await
        .with_context(|| format!("participant {} failed", id))?;
    info!(
        "[node] {} done as {}: {} completed, {} failed",
        summary.participant, summary.role, summary.tasks_completed, summary.tasks_failed
    );

    let report = RunReport::from(summary);
    println!("{}", serde_json::to_string(&report)?);
    if report.status == ParticipantStatus::Failed {
        bail!("participant ended in failed state");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_precedence() {
        assert_eq!(participant_id(Some("w7".into()), Some("99".into()), Some(2)), "w7");
        assert_eq!(participant_id(None, Some("99".into()), Some(2)), "run-99-2");
        assert!(participant_id(None, Some("99".into()), None).starts_with("run-99-"));
        let random = participant_id(None, None, Some(1));
        assert!(random.starts_with("node-"));
        assert_eq!(random.len(), "node-".len() + 8);
    }

    #[test]
    fn task_override_splits_title_and_body() {
        let item = work_item_override("Add login\n\n- form\n- api\n");
        assert_eq!(item.title, "Add login");
        assert_eq!(item.body, "- form\n- api");
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = RunReport::from(RunSummary {
            participant: "w1".into(),
            role: Role::Worker,
            leader: "l".into(),
            status: ParticipantStatus::Completed,
            tasks_completed: 2,
            tasks_failed: 0,
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["participantId"], "w1");
        assert_eq!(json["role"], "worker");
        assert_eq!(json["tasksCompleted"], 2);
    }
}
