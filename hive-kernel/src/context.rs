use chrono::{DateTime, Utc};
use std::fmt;

use crate::bus::{BusError, MessageBus, SharedBus};
use crate::clock::SharedClock;
use crate::message::{LogPosition, Message, MessageBody, ParticipantId, Role};

/// Participant avant élection : identité, bus et horloge, pas encore de rôle.
#[derive(Clone)]
pub struct Candidate {
    pub id: ParticipantId,
    pub bus: SharedBus,
    pub clock: SharedClock,
}

impl Candidate {
    pub fn new(id: impl Into<ParticipantId>, bus: SharedBus, clock: SharedClock) -> Self {
        Self {
            id: id.into(),
            bus,
            clock,
        }
    }

    pub fn into_context(self, role: Role) -> ParticipantContext {
        ParticipantContext {
            id: self.id,
            role,
            bus: self.bus,
            clock: self.clock,
        }
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate").field("id", &self.id).finish()
    }
}

/// Contexte explicite d'un participant élu : passé à chaque composant
/// au lieu d'un état global « instance courante ». Le rôle ne change plus.
#[derive(Clone)]
pub struct ParticipantContext {
    id: ParticipantId,
    role: Role,
    bus: SharedBus,
    clock: SharedClock,
}

impl ParticipantContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub async fn append(&self, body: &MessageBody) -> Result<LogPosition, BusError> {
        self.bus.append(&self.id, body).await
    }

    pub async fn read_all(&self) -> Result<Vec<Message>, BusError> {
        self.bus.read_all().await
    }
}

impl fmt::Debug for ParticipantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantContext")
            .field("id", &self.id)
            .field("role", &self.role)
            .finish()
    }
}
