//! Compute-once gate.
//!
//! Every expensive deterministic call goes through [`DedupGate::run_once`] (or
//! the lower-level [`DedupGate::acquire`] / [`DedupGate::release`] pair) with
//! its [`CacheKey`]. The gate guarantees that at most one computation per key
//! is in flight across every worker sharing a [`LeaseStore`]:
//!
//! ```text
//! caller A ─┐                        ┌─ entry fresh ──────────► Hit
//!           │                        │
//! caller B ─┼──► in-flight map ──────┼─ lease taken ──────────► Miss(ticket)
//!           │    (one leader per     │
//! caller C ─┘     key and process)   └─ held elsewhere ──► poll store
//! ```
//!
//! Callers in the same process wait on a broadcast channel owned by the
//! leader. The leader is the only one talking to the store; it either takes
//! the lease and computes, or polls the store with backoff until the worker
//! holding the lease publishes (or its lease lapses).

use crate::backoff::Backoff;
use crate::cache::LeaseStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use terraplan_core::{CacheEntry, CacheKey, PlanError};
pub use terraplan_core::Staleness;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Lease lifetime without renewal; the holder renews every `lease_ttl / 3`
    pub lease_ttl: Duration,
    /// Longest a caller waits for another holder's result
    pub wait_timeout: Duration,
    pub poll_base: Duration,
    pub poll_max: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(3600),
            poll_base: Duration::from_millis(50),
            poll_max: Duration::from_secs(2),
        }
    }
}

/// Result of a finished computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Storage location of the result
    Success(String),
    Failure,
}

#[derive(Debug, Clone)]
enum Signal {
    Published(CacheEntry),
    Abandoned,
}

type InFlight = DashMap<CacheKey, broadcast::Sender<Signal>>;

/// Leadership of one key inside this process.
///
/// Dropping a slot that was never completed tells local waiters to retry.
struct InFlightSlot {
    in_flight: Arc<InFlight>,
    key: CacheKey,
    sender: broadcast::Sender<Signal>,
    finished: bool,
}

impl InFlightSlot {
    fn finish(mut self, signal: Signal) {
        self.finished = true;
        self.in_flight.remove(&self.key);
        let waiters = self.sender.receiver_count();
        let _ = self.sender.send(signal);
        if waiters > 0 {
            debug!(key = %self.key.short(), waiters, "Woke coalesced waiters");
        }
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        if !self.finished {
            self.in_flight.remove(&self.key);
            let _ = self.sender.send(Signal::Abandoned);
        }
    }
}

/// Exclusive right to compute one key.
///
/// Hand it back through [`DedupGate::release`]. Dropping it instead (e.g. on
/// cancellation) stops the heartbeat and releases the lease in the
/// background.
pub struct ExecutionTicket {
    key: CacheKey,
    holder: String,
    store: Arc<dyn LeaseStore>,
    slot: Option<InFlightSlot>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ExecutionTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ExecutionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTicket")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .finish()
    }
}

impl Drop for ExecutionTicket {
    fn drop(&mut self) {
        self.stop_heartbeat();
        let Some(slot) = self.slot.take() else {
            return;
        };
        warn!(key = %self.key.short(), "Execution ticket dropped without release");
        let store = self.store.clone();
        let key = self.key.clone();
        let holder = self.holder.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.release(&key, &holder).await {
                        warn!(key = %key.short(), "Failed to release abandoned lease: {}", err);
                    }
                    drop(slot);
                });
            }
            // No runtime left; the lease expires on its own
            Err(_) => drop(slot),
        }
    }
}

enum Role {
    Lead(InFlightSlot),
    Follow(broadcast::Receiver<Signal>),
}

#[derive(Debug)]
pub enum Acquired {
    Hit(CacheEntry),
    Miss(ExecutionTicket),
}

/// Single-flight gate in front of a [`LeaseStore`].
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn LeaseStore>,
    config: GateConfig,
    /// Identifies this gate as a lease holder
    holder: String,
    in_flight: Arc<InFlight>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn LeaseStore>, config: GateConfig) -> Self {
        Self {
            store,
            config,
            holder: format!("gate-{}", uuid::Uuid::new_v4()),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Look up `key`, or obtain the exclusive right to compute it.
    ///
    /// Waits while another caller (here or on another worker) computes the
    /// same key, up to [`GateConfig::wait_timeout`] or until `cancel` fires.
    pub async fn acquire(
        &self,
        key: &CacheKey,
        staleness: Staleness,
        cancel: &CancellationToken,
    ) -> Result<Acquired, PlanError> {
        let deadline = Instant::now() + self.config.wait_timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(PlanError::Cancelled);
            }
            if let Some(entry) = self.store.get_entry(key).await? {
                if staleness.accepts(&entry) {
                    debug!(key = %key.short(), "Cache hit");
                    return Ok(Acquired::Hit(entry));
                }
            }

            let role = match self.in_flight.entry(key.clone()) {
                Entry::Occupied(leader) => Role::Follow(leader.get().subscribe()),
                Entry::Vacant(vacant) => {
                    let (sender, _) = broadcast::channel(16);
                    vacant.insert(sender.clone());
                    Role::Lead(InFlightSlot {
                        in_flight: self.in_flight.clone(),
                        key: key.clone(),
                        sender,
                        finished: false,
                    })
                }
            };

            let mut receiver = match role {
                Role::Lead(slot) => {
                    return self.lead(key, staleness, slot, deadline, cancel).await
                }
                Role::Follow(receiver) => receiver,
            };
            debug!(key = %key.short(), "Coalescing with in-flight computation");
            let signal = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(key = %key.short(), "Stopped waiting, cancelled");
                    return Err(PlanError::Cancelled);
                }
                signal = tokio::time::timeout_at(deadline, receiver.recv()) => signal,
            };
            match signal {
                Ok(Ok(Signal::Published(entry))) => return Ok(Acquired::Hit(entry)),
                // Leader gave up or vanished; start over
                Ok(Ok(Signal::Abandoned)) | Ok(Err(_)) => continue,
                Err(_) => return Err(self.timeout_error(key)),
            }
        }
    }

    async fn lead(
        &self,
        key: &CacheKey,
        staleness: Staleness,
        slot: InFlightSlot,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Acquired, PlanError> {
        let mut backoff = Backoff::new(self.config.poll_base, self.config.poll_max);

        loop {
            if self
                .store
                .try_lease(key, &self.holder, self.config.lease_ttl)
                .await?
            {
                // A result may have landed between the lookup and the lease
                if let Some(entry) = self.store.get_entry(key).await? {
                    if staleness.accepts(&entry) {
                        self.store.release(key, &self.holder).await?;
                        slot.finish(Signal::Published(entry.clone()));
                        return Ok(Acquired::Hit(entry));
                    }
                }
                info!(key = %key.short(), "Cache miss, computing");
                return Ok(Acquired::Miss(self.ticket(key, slot)));
            }

            if Instant::now() >= deadline {
                return Err(self.timeout_error(key));
            }
            let delay = backoff.next_delay();
            if backoff.attempts() == 1 {
                debug!(key = %key.short(), "Lease held by another worker, polling");
            }
            // Dropping the slot on cancel sends local followers back to the store
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(key = %key.short(), "Stopped polling, cancelled");
                    return Err(PlanError::Cancelled);
                }
                _ = tokio::time::sleep_until((Instant::now() + delay).min(deadline)) => {}
            }

            if let Some(entry) = self.store.get_entry(key).await? {
                if staleness.accepts(&entry) {
                    slot.finish(Signal::Published(entry.clone()));
                    return Ok(Acquired::Hit(entry));
                }
            }
            if !self.store.lease_active(key).await? {
                warn!(key = %key.short(), "Lease lapsed without a result, retrying");
                backoff.reset();
            }
        }
    }

    fn ticket(&self, key: &CacheKey, slot: InFlightSlot) -> ExecutionTicket {
        let store = self.store.clone();
        let hb_key = key.clone();
        let holder = self.holder.clone();
        let ttl = self.config.lease_ttl;
        let period = (ttl / 3).max(Duration::from_millis(10));

        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match store.renew(&hb_key, &holder, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(key = %hb_key.short(), "Lease lost before computation finished");
                        break;
                    }
                    Err(err) => warn!(key = %hb_key.short(), "Lease renewal failed: {}", err),
                }
            }
        });

        ExecutionTicket {
            key: key.clone(),
            holder: self.holder.clone(),
            store: self.store.clone(),
            slot: Some(slot),
            heartbeat: Some(heartbeat),
        }
    }

    /// Finish a computation started with [`Self::acquire`].
    ///
    /// On success the entry is published and the lease dropped in one store
    /// operation, and the published entry is returned. On failure the lease
    /// is dropped so the next caller retries.
    pub async fn release(
        &self,
        mut ticket: ExecutionTicket,
        outcome: Outcome,
    ) -> Result<Option<CacheEntry>, PlanError> {
        ticket.stop_heartbeat();
        let slot = ticket.slot.take();
        let key = ticket.key.clone();

        match outcome {
            Outcome::Success(location) => {
                let entry = CacheEntry::new(location);
                if let Err(err) = self.store.publish(&key, &ticket.holder, &entry).await {
                    warn!(key = %key.short(), "Publishing result failed: {}", err);
                    if let Err(release_err) = self.store.release(&key, &ticket.holder).await {
                        warn!(key = %key.short(), "Releasing unpublished lease failed: {}", release_err);
                    }
                    drop(slot);
                    return Err(PlanError::coordination(format!(
                        "publishing {} failed: {}",
                        key.short(),
                        err
                    )));
                }
                if let Some(slot) = slot {
                    slot.finish(Signal::Published(entry.clone()));
                }
                Ok(Some(entry))
            }
            Outcome::Failure => {
                let released = self.store.release(&key, &ticket.holder).await;
                drop(slot);
                released.map(|_| None)
            }
        }
    }

    /// Return the stored result for `key`, computing it at most once.
    pub async fn run_once<F, Fut>(
        &self,
        key: &CacheKey,
        staleness: Staleness,
        cancel: &CancellationToken,
        compute: F,
    ) -> Result<CacheEntry, PlanError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, PlanError>>,
    {
        match self.acquire(key, staleness, cancel).await? {
            Acquired::Hit(entry) => Ok(entry),
            Acquired::Miss(ticket) => match compute().await {
                Ok(location) => self
                    .release(ticket, Outcome::Success(location))
                    .await?
                    .ok_or_else(|| PlanError::coordination("published entry missing")),
                Err(err) => {
                    if let Err(release_err) = self.release(ticket, Outcome::Failure).await {
                        warn!(key = %key.short(), "Releasing failed computation: {}", release_err);
                    }
                    Err(err)
                }
            },
        }
    }

    fn timeout_error(&self, key: &CacheKey) -> PlanError {
        PlanError::coordination(format!(
            "timed out after {:?} waiting for {}",
            self.config.wait_timeout,
            key.short()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryLeaseStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use terraplan_core::{fingerprint, CallArgs};

    fn gate() -> DedupGate {
        DedupGate::new(Arc::new(MemoryLeaseStore::new()), GateConfig::default())
    }

    fn key(name: &str) -> CacheKey {
        fingerprint("test", &CallArgs::new().arg("name", name)).unwrap()
    }

    /// Memory store whose `publish` always fails.
    #[derive(Default)]
    struct UnwritableStore {
        inner: MemoryLeaseStore,
    }

    #[async_trait]
    impl LeaseStore for UnwritableStore {
        async fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, PlanError> {
            self.inner.get_entry(key).await
        }

        async fn try_lease(
            &self,
            key: &CacheKey,
            holder: &str,
            ttl: Duration,
        ) -> Result<bool, PlanError> {
            self.inner.try_lease(key, holder, ttl).await
        }

        async fn renew(&self, key: &CacheKey, holder: &str, ttl: Duration) -> Result<bool, PlanError> {
            self.inner.renew(key, holder, ttl).await
        }

        async fn publish(&self, _: &CacheKey, _: &str, _: &CacheEntry) -> Result<(), PlanError> {
            Err(PlanError::coordination("disk full"))
        }

        async fn release(&self, key: &CacheKey, holder: &str) -> Result<(), PlanError> {
            self.inner.release(key, holder).await
        }

        async fn lease_active(&self, key: &CacheKey) -> Result<bool, PlanError> {
            self.inner.lease_active(key).await
        }

        async fn prune(&self, max_entries: usize, max_age: Duration) -> Result<u64, PlanError> {
            self.inner.prune(max_entries, max_age).await
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let gate = gate();
        let k = key("a");
        let cancel = CancellationToken::new();

        let Acquired::Miss(ticket) = gate.acquire(&k, Staleness::Any, &cancel).await.unwrap() else {
            panic!("expected miss");
        };
        let entry = gate
            .release(ticket, Outcome::Success("out/a".into()))
            .await
            .unwrap()
            .unwrap();

        match gate.acquire(&k, Staleness::Any, &cancel).await.unwrap() {
            Acquired::Hit(hit) => assert_eq!(hit, entry),
            Acquired::Miss(_) => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn failure_lets_next_caller_retry() {
        let gate = gate();
        let k = key("a");
        let cancel = CancellationToken::new();

        let err = gate
            .run_once(&k, Staleness::Any, &cancel, || async {
                Err::<String, _>(PlanError::stage("sample", "boom"))
            })
            .await
            .unwrap_err();
        assert_eq!(err, PlanError::stage("sample", "boom"));

        let entry = gate
            .run_once(&k, Staleness::Any, &cancel, || async { Ok("out/a".to_string()) })
            .await
            .unwrap();
        assert_eq!(entry.location, "out/a");
    }

    #[tokio::test]
    async fn concurrent_callers_compute_once() {
        let gate = gate();
        let k = key("a");
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                let k = k.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    gate.run_once(&k, Staleness::Any, &CancellationToken::new(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("out/a".to_string())
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().location, "out/a");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_ticket_releases_lease() {
        let gate = gate();
        let k = key("a");
        let cancel = CancellationToken::new();

        let Acquired::Miss(ticket) = gate.acquire(&k, Staleness::Any, &cancel).await.unwrap() else {
            panic!("expected miss");
        };
        drop(ticket);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!gate.store().lease_active(&k).await.unwrap());
        assert!(matches!(
            gate.acquire(&k, Staleness::Any, &cancel).await.unwrap(),
            Acquired::Miss(_)
        ));
    }

    #[tokio::test]
    async fn cancelled_follower_stops_waiting_on_local_leader() {
        let gate = gate();
        let k = key("a");

        // Leader holds the key and never finishes
        let Acquired::Miss(_ticket) = gate
            .acquire(&k, Staleness::Any, &CancellationToken::new())
            .await
            .unwrap()
        else {
            panic!("expected miss");
        };

        let cancel = CancellationToken::new();
        let follower = {
            let gate = gate.clone();
            let k = k.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&k, Staleness::Any, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), follower)
            .await
            .expect("follower kept waiting after cancel")
            .unwrap();
        assert!(matches!(result, Err(PlanError::Cancelled)));
    }

    #[tokio::test]
    async fn failed_publish_frees_the_key() {
        let store = Arc::new(UnwritableStore::default());
        let gate = DedupGate::new(store.clone(), GateConfig::default());
        let k = key("a");
        let cancel = CancellationToken::new();

        let err = gate
            .run_once(&k, Staleness::Any, &cancel, || async { Ok("out/a".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::CacheCoordination(_)));

        assert_eq!(store.inner.entry_count(), 0);
        assert!(!store.lease_active(&k).await.unwrap());
        assert!(gate.in_flight.is_empty());

        // Retryable: the next caller gets the lease again
        assert!(matches!(
            gate.acquire(&k, Staleness::Any, &cancel).await.unwrap(),
            Acquired::Miss(_)
        ));
    }
}
