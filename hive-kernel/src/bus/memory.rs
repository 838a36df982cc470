use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use super::{BusError, MessageBus, WorkItem};
use crate::clock::{self, SharedClock};
use crate::message::{self, LogPosition, Message, MessageBody, RawEntry};

/// Modèle local du journal : arène append-only indexée par position.
/// Les clones partagent la même arène (un bus, plusieurs participants).
#[derive(Clone)]
pub struct MemoryBus {
    arena: Arc<Mutex<Arena>>,
    clock: SharedClock,
    work_item: Option<WorkItem>,
}

#[derive(Debug, Default)]
struct Arena {
    /// toujours triées par position
    entries: Vec<RawEntry>,
    next: u64,
}

impl Arena {
    fn push(&mut self, observed_at: DateTime<Utc>, text: String) -> LogPosition {
        self.next = self.next.max(self.entries.last().map_or(0, |e| e.position.value())) + 1;
        let position = LogPosition(self.next);
        self.entries.push(RawEntry {
            position,
            observed_at,
            text,
        });
        position
    }

    fn insert(&mut self, entry: RawEntry) {
        let idx = self.entries.partition_point(|e| e.position < entry.position);
        self.entries.insert(idx, entry);
    }

    fn since(&self, after: LogPosition) -> &[RawEntry] {
        let idx = self.entries.partition_point(|e| e.position <= after);
        &self.entries[idx..]
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            arena: Arc::new(Mutex::new(Arena::default())),
            clock,
            work_item: None,
        }
    }

    pub fn with_work_item(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        self.work_item = Some(WorkItem {
            title: title.into(),
            body: body.into(),
        });
        self
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// Append d'un texte arbitraire (commentaire humain, entrée corrompue...).
    pub fn append_raw(&self, text: impl Into<String>) -> LogPosition {
        let now = self.clock.now();
        self.arena.lock().push(now, text.into())
    }

    /// Insère un message à une position et une heure imposées (scénarios rejoués).
    pub fn insert_at(
        &self,
        position: LogPosition,
        observed_at: DateTime<Utc>,
        sender: &str,
        body: &MessageBody,
    ) -> Result<(), BusError> {
        let text = message::encode(sender, body)?;
        self.arena.lock().insert(RawEntry {
            position,
            observed_at,
            text,
        });
        Ok(())
    }

    pub fn entries(&self) -> Vec<RawEntry> {
        self.arena.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.arena.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lecture décodée de la fenêtre `(after, upto]`, utilisée par les stubs à visibilité retardée.
    pub fn read_window(&self, after: LogPosition, upto: LogPosition) -> Vec<Message> {
        let arena = self.arena.lock();
        let visible: Vec<&RawEntry> = arena
            .since(after)
            .iter()
            .take_while(|e| e.position <= upto)
            .collect();
        message::decode_entries(visible)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus").field("entries", &self.len()).finish()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn append(&self, sender: &str, body: &MessageBody) -> Result<LogPosition, BusError> {
        let text = message::encode(sender, body)?;
        let now = self.clock.now();
        Ok(self.arena.lock().push(now, text))
    }

    async fn read_since(&self, after: LogPosition) -> Result<Vec<Message>, BusError> {
        let arena = self.arena.lock();
        Ok(message::decode_entries(arena.since(after)))
    }

    async fn work_item(&self) -> Result<Option<WorkItem>, BusError> {
        Ok(self.work_item.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ParticipantStatus;
    use crate::message::{Role, StatusReport};

    fn heartbeat() -> MessageBody {
        MessageBody::Heartbeat(StatusReport::new(ParticipantStatus::Ready, Role::Worker))
    }

    #[tokio::test]
    async fn positions_are_monotonic_and_shared_between_clones() {
        let bus = MemoryBus::new();
        let other = bus.clone();
        let a = bus.append("w1", &heartbeat()).await.unwrap();
        let b = other.append("w2", &heartbeat()).await.unwrap();
        assert!(b > a);
        assert_eq!(bus.read_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn read_since_is_exclusive() {
        let bus = MemoryBus::new();
        let first = bus.append("w1", &heartbeat()).await.unwrap();
        bus.append("w2", &heartbeat()).await.unwrap();
        let later = bus.read_since(first).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].sender, "w2");
    }

    #[tokio::test]
    async fn foreign_and_corrupt_entries_are_skipped() {
        let bus = MemoryBus::new();
        bus.append_raw("just a human comment");
        bus.append_raw("<!-- hive:v1 -->\n```json\n{\"v\":1}\n```");
        bus.append("w1", &heartbeat()).await.unwrap();
        let all = bus.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].position, LogPosition(3));
    }

    #[tokio::test]
    async fn inserted_entries_keep_position_order() {
        let bus = MemoryBus::new();
        let t = Utc::now();
        bus.insert_at(LogPosition(12), t, "w2", &heartbeat()).unwrap();
        bus.insert_at(LogPosition(9), t, "w3", &heartbeat()).unwrap();
        let next = bus.append("w1", &heartbeat()).await.unwrap();
        assert_eq!(next, LogPosition(13));
        let senders: Vec<String> = bus.read_all().await.unwrap().into_iter().map(|m| m.sender).collect();
        assert_eq!(senders, vec!["w3", "w2", "w1"]);
    }
}
