use std::time::Duration;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::lifecycle::TransitionError;

/// Erreurs remontées à l'opérateur : seules les conditions sans remède protocolaire
/// (panne totale du bus, élection non convergente, timeouts de run) arrivent ici.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("no leader emerged after {rounds} election rounds")]
    ElectionNonConvergence { rounds: u32 },
    #[error("operation reserved to the leader")]
    NotLeader,
    #[error("no task list published within {0:?}")]
    NoTaskList(Duration),
    #[error("run did not settle within {0:?}")]
    RunTimeout(Duration),
    #[error("task runner failed: {0}")]
    Runner(String),
}

pub type Result<T, E = HiveError> = std::result::Result<T, E>;
