/**
 * CONFIG - Chargement de la configuration YAML du run
 *
 * RÔLE : Un seul fichier (`.hive/config.yaml`, ou $HIVE_CONFIG) partagé par le
 * service snapshot et les participants.
 *
 * FONCTIONNEMENT :
 * - fichier absent ou vide => valeurs par défaut
 * - fichier invalide => `ConfigError` (pas de repli silencieux)
 * - `${VAR}` dans le token GitHub est remplacé par la variable d'environnement
 *
 * CLÉS LUES PAR LE PROTOCOLE : `instances.max` (plafond de tâches actives) et
 * `agents[].skills` (éligibilité des claims). Le reste règle les délais et surfaces.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::election::ElectionConfig;
use crate::planner::Strategy;

pub const CONFIG_ENV: &str = "HIVE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = ".hive/config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("environment variable {0} referenced by config is not set")]
    MissingEnv(String),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiveConfig {
    #[serde(default)]
    pub github: Option<GithubConf>,
    #[serde(default)]
    pub instances: InstancesConf,
    #[serde(default)]
    pub workflow: WorkflowConf,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConf>,
    #[serde(default)]
    pub coordination: CoordinationConf,
    #[serde(default)]
    pub planner: PlannerConf,
    #[serde(default)]
    pub aggregator: AggregatorConf,
    #[serde(default)]
    pub mqtt: Option<MqttConf>,
    #[serde(default)]
    pub runner: Option<RunnerConf>,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            github: None,
            instances: InstancesConf::default(),
            workflow: WorkflowConf::default(),
            agents: default_agents(),
            coordination: CoordinationConf::default(),
            planner: PlannerConf::default(),
            aggregator: AggregatorConf::default(),
            mqtt: None,
            runner: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubConf {
    pub owner: String,
    pub repo: String,
    pub issue: u64,
    #[serde(default = "default_token")]
    pub token: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_token() -> Option<String> {
    Some("${GITHUB_TOKEN}".into())
}

fn default_api_url() -> String {
    "https://api.github.com".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancesConf {
    pub default: usize,
    pub max: usize,
}

impl Default for InstancesConf {
    fn default() -> Self {
        Self { default: 5, max: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConf {
    #[serde(default = "default_workflow_file")]
    pub file: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_workflow_file() -> String {
    ".github/workflows/hive.yml".into()
}

fn default_concurrency() -> usize {
    5
}

impl Default for WorkflowConf {
    fn default() -> Self {
        Self {
            file: default_workflow_file(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConf {
    pub name: String,
    #[serde(default)]
    pub skills: Vec<String>,
}

fn default_agents() -> Vec<AgentConf> {
    let agent = |name: &str, skills: &[&str]| AgentConf {
        name: name.into(),
        skills: skills.iter().map(|s| s.to_string()).collect(),
    };
    vec![
        agent("frontend-specialist", &["react", "typescript", "css"]),
        agent("backend-specialist", &["api", "database", "performance"]),
        agent("test-specialist", &["testing", "e2e", "unit-test"]),
    ]
}

/// Délais du protocole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConf {
    pub settle_window_secs: u64,
    pub reconcile_window_ms: u64,
    pub max_election_rounds: u32,
    pub candidate: bool,
    pub claim_settle_ms: u64,
    pub stale_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub idle_heartbeat_secs: u64,
    pub publish_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub max_attempts: u32,
    pub leader_works: bool,
}

impl Default for CoordinationConf {
    fn default() -> Self {
        Self {
            settle_window_secs: 3,
            reconcile_window_ms: 1000,
            max_election_rounds: 4,
            candidate: true,
            claim_settle_ms: 1000,
            stale_threshold_secs: 300,
            sweep_interval_secs: 30,
            poll_interval_secs: 10,
            idle_heartbeat_secs: 120,
            publish_timeout_secs: 600,
            run_timeout_secs: 3600,
            max_attempts: 3,
            leader_works: false,
        }
    }
}

impl CoordinationConf {
    pub fn election(&self) -> ElectionConfig {
        ElectionConfig {
            settle_window: Duration::from_secs(self.settle_window_secs),
            reconcile_window: Duration::from_millis(self.reconcile_window_ms),
            max_rounds: self.max_election_rounds,
            candidate: self.candidate,
        }
    }

    pub fn claim_settle(&self) -> Duration {
        Duration::from_millis(self.claim_settle_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_heartbeat(&self) -> Duration {
        Duration::from_secs(self.idle_heartbeat_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlannerConf {
    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConf {
    pub interval_secs: u64,
    pub listen: String,
    /// replay depuis le dernier checkpoint au lieu d'une relecture complète
    pub incremental: bool,
}

impl Default for AggregatorConf {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            listen: "0.0.0.0:8080".into(),
            incremental: false,
        }
    }
}

impl AggregatorConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConf {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "hive/snapshot@v1".into()
}

/// Commande externe qui exécute réellement une tâche.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConf {
    pub command: String,
    #[serde(default = "default_runner_timeout")]
    pub timeout_secs: u64,
}

fn default_runner_timeout() -> u64 {
    3600
}

impl HiveConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config: HiveConfig = serde_yaml::from_str(txt)?;
        config.resolve()?;
        Ok(config)
    }

    fn resolve(&mut self) -> Result<(), ConfigError> {
        if let Some(github) = &mut self.github {
            github.token = match github.token.take().map(|raw| expand_env(&raw)) {
                Some(Ok(token)) => (!token.is_empty()).then_some(token),
                Some(Err(ConfigError::MissingEnv(var))) => {
                    warn!("[config] {var} not set, GitHub requests will be anonymous");
                    None
                }
                Some(Err(e)) => return Err(e),
                None => None,
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.coordination;
        if !(2..=5).contains(&c.settle_window_secs) {
            return Err(ConfigError::Invalid {
                key: "coordination.settle_window_secs",
                reason: format!("{} not in 2..=5", c.settle_window_secs),
            });
        }
        if self.instances.max == 0 || self.instances.default > self.instances.max {
            return Err(ConfigError::Invalid {
                key: "instances",
                reason: format!("default {} / max {}", self.instances.default, self.instances.max),
            });
        }
        if c.max_election_rounds == 0 || c.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "coordination",
                reason: "max_election_rounds and max_attempts must be >= 1".into(),
            });
        }
        Ok(())
    }

    /// Profil d'agent : par nom s'il est donné, sinon round-robin sur l'index d'instance.
    pub fn agent_for(&self, name: Option<&str>, instance: Option<usize>) -> Option<&AgentConf> {
        if let Some(name) = name {
            return self.agents.iter().find(|a| a.name == name);
        }
        match instance {
            Some(i) if !self.agents.is_empty() => self.agents.get(i % self.agents.len()),
            _ => None,
        }
    }
}

/// Remplace chaque `${VAR}` par la valeur de la variable d'environnement.
pub fn expand_env(raw: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let var = &after[..end];
        let value = std::env::var(var).map_err(|_| ConfigError::MissingEnv(var.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

pub async fn load_from(path: &Path) -> Result<HiveConfig, ConfigError> {
    if !path.exists() {
        warn!("[config] {} absent, using defaults", path.display());
        return Ok(HiveConfig::default());
    }
    let txt = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let config = HiveConfig::from_yaml(&txt)?;
    info!("[config] loaded {}", path.display());
    Ok(config)
}

/// Chemin pris dans $HIVE_CONFIG, `.hive/config.yaml` sinon.
pub async fn load() -> Result<HiveConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_from(Path::new(&path)).await
}
