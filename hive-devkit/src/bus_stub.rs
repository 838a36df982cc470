/*!
Bus mémoire instable pour tests sans GitHub

Enveloppe un `MemoryBus` partagé et permet de simuler ce que le vrai fil de
commentaires fait subir aux participants :
- pannes transitoires (`fail_next`) : les N prochains appels échouent
- visibilité retardée (`freeze`) : ce lecteur ne voit plus rien au-delà
  de la dernière position connue, jusqu'à `thaw`
*/

use async_trait::async_trait;
use hive_kernel::bus::{BusError, MemoryBus, MessageBus, WorkItem};
use hive_kernel::message::{LogPosition, Message, MessageBody};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct FlakyBus {
    inner: MemoryBus,
    failures: Arc<AtomicU32>,
    frozen_at: Arc<Mutex<Option<LogPosition>>>,
    calls: Arc<AtomicU32>,
}

impl FlakyBus {
    pub fn new(inner: MemoryBus) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicU32::new(0)),
            frozen_at: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn inner(&self) -> &MemoryBus {
        &self.inner
    }

    /// Les `n` prochains appels (append ou lecture) renvoient `Unreachable`.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Fige la vue de ce lecteur sur la dernière position actuellement présente.
    pub fn freeze(&self) {
        let last = self
            .inner
            .entries()
            .last()
            .map_or(LogPosition::ORIGIN, |e| e.position);
        log::debug!("🧊 view frozen at {}", last);
        *self.frozen_at.lock().unwrap() = Some(last);
    }

    pub fn thaw(&self) {
        *self.frozen_at.lock().unwrap() = None;
    }

    /// Nombre total d'appels reçus, pannes comprises.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), BusError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            log::debug!("💥 simulated bus outage");
            return Err(BusError::Unreachable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for FlakyBus {
    async fn append(&self, sender: &str, body: &MessageBody) -> Result<LogPosition, BusError> {
        self.gate()?;
        self.inner.append(sender, body).await
    }

    async fn read_since(&self, after: LogPosition) -> Result<Vec<Message>, BusError> {
        self.gate()?;
        let frozen = *self.frozen_at.lock().unwrap();
        match frozen {
            Some(upto) => Ok(self.inner.read_window(after, upto)),
            None => self.inner.read_since(after).await,
        }
    }

    async fn work_item(&self) -> Result<Option<WorkItem>, BusError> {
        self.inner.work_item().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_kernel::message::LeaderClaim;

    fn claim(id: &str) -> MessageBody {
        MessageBody::LeaderClaim(LeaderClaim {
            participant_id: id.into(),
            observed_at: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn failures_are_consumed_one_call_at_a_time() {
        let bus = FlakyBus::new(MemoryBus::new());
        bus.fail_next(2);
        assert!(bus.append("a", &claim("a")).await.is_err());
        assert!(bus.read_all().await.unwrap_err().is_transient());
        assert_eq!(bus.append("a", &claim("a")).await.unwrap(), LogPosition(1));
        assert_eq!(bus.calls(), 3);
    }

    #[tokio::test]
    async fn frozen_view_hides_later_appends() {
        let shared = MemoryBus::new();
        let laggy = FlakyBus::new(shared.clone());
        shared.append("a", &claim("a")).await.unwrap();
        laggy.freeze();
        shared.append("b", &claim("b")).await.unwrap();

        assert_eq!(laggy.read_all().await.unwrap().len(), 1);
        assert_eq!(shared.read_all().await.unwrap().len(), 2);
        laggy.thaw();
        assert_eq!(laggy.read_all().await.unwrap().len(), 2);
    }
}
