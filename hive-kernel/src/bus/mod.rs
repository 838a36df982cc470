/**
 * MESSAGE BUS - Abstraction du journal append-only partagé
 *
 * RÔLE : Seul canal de communication entre participants. `append` renvoie la
 * position attribuée par l'hôte ; `read_all` / `read_since` renvoient les messages
 * décodés dans l'ordre des positions.
 *
 * CONTRAT :
 * - aucun message n'est jamais modifié ni supprimé
 * - un message peut ne pas être visible immédiatement par les autres lecteurs
 *   (pas de read-after-write synchrone entre participants)
 * - les entrées corrompues sont sautées et loggées au décodage
 *
 * IMPLÉMENTATIONS : `MemoryBus` (arène locale), `GithubIssueBus` (commentaires
 * d'issue), `RetryingBus` (backoff exponentiel autour d'un autre bus).
 */

pub mod github;
pub mod memory;
pub mod retry;

pub use github::GithubIssueBus;
pub use memory::MemoryBus;
pub use retry::{RetryPolicy, RetryingBus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::message::{LogPosition, Message, MessageBody};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// transitoire : réseau, 5xx, rate limit
    #[error("bus unreachable: {0}")]
    Unreachable(String),
    #[error("bus outage after {attempts} attempts: {last}")]
    Outage { attempts: u32, last: String },
    #[error("append rejected by host: {0}")]
    Rejected(String),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Unreachable(_))
    }
}

/// Description du work item auquel le journal est attaché (titre + corps de l'issue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn append(&self, sender: &str, body: &MessageBody) -> Result<LogPosition, BusError>;

    /// Messages de position strictement supérieure à `after`.
    async fn read_since(&self, after: LogPosition) -> Result<Vec<Message>, BusError>;

    async fn read_all(&self) -> Result<Vec<Message>, BusError> {
        self.read_since(LogPosition::ORIGIN).await
    }

    async fn work_item(&self) -> Result<Option<WorkItem>, BusError> {
        Ok(None)
    }
}

pub type SharedBus = Arc<dyn MessageBus>;

#[async_trait]
impl<B: MessageBus + ?Sized> MessageBus for Arc<B> {
    async fn append(&self, sender: &str, body: &MessageBody) -> Result<LogPosition, BusError> {
        (**self).append(sender, body).await
    }

    async fn read_since(&self, after: LogPosition) -> Result<Vec<Message>, BusError> {
        (**self).read_since(after).await
    }

    async fn read_all(&self) -> Result<Vec<Message>, BusError> {
        (**self).read_all().await
    }

    async fn work_item(&self) -> Result<Option<WorkItem>, BusError> {
        (**self).work_item().await
    }
}
