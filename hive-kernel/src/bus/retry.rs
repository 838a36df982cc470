use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::{BusError, MessageBus, WorkItem};
use crate::message::{LogPosition, Message, MessageBody};

/// Backoff exponentiel appliqué aux erreurs transitoires du bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Délai avant la tentative `attempt + 1` (attempt >= 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, BusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Err(e) if e.is_transient() => {
                    if attempt >= self.max_attempts {
                        return Err(BusError::Outage {
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    let delay = self.backoff(attempt);
                    warn!("[bus] {} failed (attempt {}/{}): {} - retrying in {:?}",
                          op, attempt, self.max_attempts, e, delay);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Enveloppe un bus et rejoue les erreurs transitoires.
/// Un append rejoué après un timeout peut être dupliqué sur l'hôte : le
/// protocole le tolère (claims et annonces sont idempotents par ordre de position).
#[derive(Debug, Clone)]
pub struct RetryingBus<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: MessageBus> RetryingBus<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: MessageBus> MessageBus for RetryingBus<B> {
    async fn append(&self, sender: &str, body: &MessageBody) -> Result<LogPosition, BusError> {
        self.policy
            .run("append", || self.inner.append(sender, body))
            .await
    }

    async fn read_since(&self, after: LogPosition) -> Result<Vec<Message>, BusError> {
        self.policy
            .run("read", || self.inner.read_since(after))
            .await
    }

    async fn work_item(&self) -> Result<Option<WorkItem>, BusError> {
        self.policy.run("work_item", || self.inner.work_item()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Bus qui échoue `failures` fois avant de déléguer.
    struct Flaky {
        inner: MemoryBus,
        failures: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl MessageBus for Flaky {
        async fn append(&self, sender: &str, body: &MessageBody) -> Result<LogPosition, BusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(BusError::Unreachable("503".into()));
            }
            self.inner.append(sender, body).await
        }

        async fn read_since(&self, after: LogPosition) -> Result<Vec<Message>, BusError> {
            self.inner.read_since(after).await
        }
    }

    fn flaky(failures: u32) -> (RetryingBus<Flaky>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let bus = Flaky {
            inner: MemoryBus::new(),
            failures: AtomicU32::new(failures),
            calls: calls.clone(),
        };
        (RetryingBus::new(bus, RetryPolicy::default()), calls)
    }

    fn body() -> MessageBody {
        use crate::lifecycle::ParticipantStatus;
        use crate::message::{Role, StatusReport};
        MessageBody::Heartbeat(StatusReport::new(ParticipantStatus::Ready, Role::Worker))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_secs(1));
        assert_eq!(p.backoff(4), Duration::from_secs(4));
        assert_eq!(p.backoff(20), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_absorbed() {
        let (bus, calls) = flaky(3);
        let pos = bus.append("w1", &body()).await.unwrap();
        assert_eq!(pos, LogPosition(1));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_an_outage() {
        let (bus, calls) = flaky(10);
        let err = bus.append("w1", &body()).await.unwrap_err();
        assert!(matches!(err, BusError::Outage { attempts: 5, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(!err.is_transient());
    }
}
