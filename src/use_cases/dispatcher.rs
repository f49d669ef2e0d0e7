// Correlated request/response dispatch to computation units.

use crate::domain::computation::control;
use crate::domain::ports::{Clock, ComputationUnit, IdGenerator};
use crate::domain::{
    ComputationOutcome, ComputationRequest, ComputationResult, CorrelationId, EngineError,
    UnitMessage, UnitReply, UnitRequest,
};
use crate::use_cases::types::EngineEvent;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Handle a unit uses to send messages back to the dispatcher.
#[derive(Clone, Debug)]
pub struct ReplySink {
    unit: Arc<str>,
    tx: mpsc::Sender<UnitReply>,
}

impl ReplySink {
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Returns false once the dispatcher has gone away.
    pub async fn send(&self, message: UnitMessage) -> bool {
        self.tx
            .send(UnitReply {
                unit: self.unit.to_string(),
                message,
            })
            .await
            .is_ok()
    }
}

/// Counts of how pending entries were issued and removed.
///
/// Every issued entry is removed by exactly one path, so once nothing is in
/// flight `issued == settled()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub issued: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub undeliverable: u64,
}

impl DispatchStats {
    pub fn settled(&self) -> u64 {
        self.resolved + self.timed_out + self.cancelled + self.undeliverable
    }
}

#[derive(Debug, Clone, Copy)]
enum Removal {
    Resolved,
    TimedOut,
    Cancelled,
    Undeliverable,
}

#[derive(Default)]
struct Counters {
    issued: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    undeliverable: AtomicU64,
}

type Resolver = oneshot::Sender<UnitMessage>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-unit sets of unresolved requests keyed by correlation id.
#[derive(Default)]
struct PendingTable {
    by_unit: Mutex<HashMap<String, HashMap<CorrelationId, Resolver>>>,
    counters: Counters,
}

impl PendingTable {
    fn insert(&self, unit: &str, id: CorrelationId, resolver: Resolver) {
        lock(&self.by_unit)
            .entry(unit.to_string())
            .or_default()
            .insert(id, resolver);
        self.counters.issued.fetch_add(1, Ordering::Relaxed);
    }

    fn take(&self, unit: &str, id: &CorrelationId, removal: Removal) -> Option<Resolver> {
        let resolver = {
            let mut by_unit = lock(&self.by_unit);
            let set = by_unit.get_mut(unit)?;
            let resolver = set.remove(id)?;
            if set.is_empty() {
                by_unit.remove(unit);
            }
            resolver
        };
        let counter = match removal {
            Removal::Resolved => &self.counters.resolved,
            Removal::TimedOut => &self.counters.timed_out,
            Removal::Cancelled => &self.counters.cancelled,
            Removal::Undeliverable => &self.counters.undeliverable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Some(resolver)
    }

    fn len(&self) -> usize {
        lock(&self.by_unit).values().map(HashMap::len).sum()
    }

    // Drops every resolver; waiting dispatches observe a closed channel.
    fn clear(&self) -> usize {
        let drained: usize = lock(&self.by_unit)
            .drain()
            .map(|(_, set)| set.len())
            .sum();
        self.counters
            .cancelled
            .fetch_add(drained as u64, Ordering::Relaxed);
        drained
    }

    fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            issued: c.issued.load(Ordering::Relaxed),
            resolved: c.resolved.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            undeliverable: c.undeliverable.load(Ordering::Relaxed),
        }
    }
}

/// Removes its entry when the owning dispatch future finishes or is dropped.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    unit: &'a str,
    id: CorrelationId,
    removal: Removal,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // No-op when the router already resolved the entry.
        let _ = self.table.take(self.unit, &self.id, self.removal);
    }
}

/// State shared with the reply router task.
struct Shared {
    pending: PendingTable,
    handshakes: Mutex<HashMap<String, oneshot::Sender<()>>>,
    // Uncorrelated critical error awaiting the next tick boundary.
    poisoned: Mutex<Option<EngineError>>,
    events: broadcast::Sender<EngineEvent>,
}

impl Shared {
    fn route(&self, reply: UnitReply) {
        let UnitReply { unit, message } = reply;

        if let Some(id) = message.resolves().cloned() {
            match self.pending.take(&unit, &id, Removal::Resolved) {
                Some(resolver) => {
                    let _ = resolver.send(message);
                }
                None => debug!(%unit, %id, "reply without pending request; dropping"),
            }
            return;
        }

        match message {
            UnitMessage::Ready => match lock(&self.handshakes).remove(&unit) {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => debug!(%unit, "unsolicited ready message"),
            },
            UnitMessage::Progress { progress, data, .. } => {
                let _ = self.events.send(EngineEvent::UnitProgress {
                    unit,
                    progress,
                    data,
                });
            }
            UnitMessage::Error {
                error, critical, ..
            } => {
                warn!(%unit, %error, critical, "unit reported an uncorrelated error");
                if critical {
                    lock(&self.poisoned).get_or_insert(EngineError::CriticalComputation {
                        unit: unit.clone(),
                        message: error.clone(),
                    });
                }
                let _ = self.events.send(EngineEvent::UnitError {
                    unit,
                    kind: None,
                    iteration: None,
                    error,
                });
            }
            // Results always carry an id and were routed above.
            UnitMessage::Result { .. } => {}
        }
    }
}

async fn route_replies(shared: Arc<Shared>, mut replies_rx: mpsc::Receiver<UnitReply>) {
    while let Some(reply) = replies_rx.recv().await {
        shared.route(reply);
    }
    debug!("reply channel closed; router exiting");
}

/// Issues correlated requests to attached units and resolves their replies.
pub struct Dispatcher {
    shared: Arc<Shared>,
    units: RwLock<BTreeMap<String, Arc<dyn ComputationUnit>>>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    replies_tx: mpsc::Sender<UnitReply>,
}

impl Dispatcher {
    /// Creates the dispatcher and spawns its reply router on the current runtime.
    pub fn new(
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<EngineEvent>,
        reply_capacity: usize,
    ) -> Self {
        let (replies_tx, replies_rx) = mpsc::channel::<UnitReply>(reply_capacity.max(1));
        let shared = Arc::new(Shared {
            pending: PendingTable::default(),
            handshakes: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(None),
            events,
        });
        tokio::spawn(route_replies(shared.clone(), replies_rx));

        Self {
            shared,
            units: RwLock::new(BTreeMap::new()),
            ids,
            clock,
            replies_tx,
        }
    }

    pub fn reply_sink(&self, unit: &str) -> ReplySink {
        ReplySink {
            unit: Arc::from(unit),
            tx: self.replies_tx.clone(),
        }
    }

    /// Performs the `init`/`ready` handshake and registers the unit.
    pub async fn attach(
        &self,
        unit: Arc<dyn ComputationUnit>,
        handshake_timeout: Duration,
    ) -> Result<(), EngineError> {
        let name = unit.name().to_string();
        let unavailable = |reason: String| EngineError::UnitUnavailable {
            unit: name.clone(),
            reason,
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        lock(&self.shared.handshakes).insert(name.clone(), ready_tx);

        let handshake = async {
            unit.post(UnitRequest::control(control::INIT))
                .await
                .map_err(|reason| unavailable(reason))?;
            match tokio::time::timeout(handshake_timeout, ready_rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(unavailable("handshake abandoned".to_string())),
                Err(_) => Err(unavailable(format!(
                    "no ready message within {}ms",
                    handshake_timeout.as_millis()
                ))),
            }
        }
        .await;
        lock(&self.shared.handshakes).remove(&name);
        handshake?;

        self.units
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), unit);
        info!(unit = %name, "computation unit attached");
        Ok(())
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn unit(&self, name: &str) -> Option<Arc<dyn ComputationUnit>> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn all_units(&self) -> Vec<Arc<dyn ComputationUnit>> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Sends a control message (`stop`, `terminate`) to every attached unit.
    pub async fn broadcast_control(&self, kind: &str) {
        for unit in self.all_units() {
            if let Err(reason) = unit.post(UnitRequest::control(kind)).await {
                warn!(unit = unit.name(), kind, %reason, "control message not delivered");
            }
        }
    }

    /// Sends `terminate` to every unit and forgets them.
    pub async fn detach_all(&self) {
        self.broadcast_control(control::TERMINATE).await;
        let detached = {
            let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *units)
        };
        info!(count = detached.len(), "computation units detached");
    }

    /// Issues one correlated request and waits for its resolution.
    ///
    /// Never fails: delivery problems, unit errors and watchdog expiry are
    /// all reported through the result's outcome.
    pub async fn dispatch(
        &self,
        unit: &str,
        kind: &str,
        payload: Value,
        deadline: Duration,
    ) -> ComputationResult {
        let request = ComputationRequest {
            id: self.ids.next_id(),
            unit: unit.to_string(),
            kind: kind.to_string(),
            payload,
            issued_at: self.clock.now_millis(),
        };
        let (outcome, critical) = self.resolve(&request, deadline).await;
        ComputationResult {
            id: request.id,
            unit: request.unit,
            kind: request.kind,
            outcome,
            critical,
            completed_at: self.clock.now_millis(),
        }
    }

    async fn resolve(
        &self,
        request: &ComputationRequest,
        deadline: Duration,
    ) -> (ComputationOutcome, bool) {
        let Some(unit) = self.unit(&request.unit) else {
            return (
                ComputationOutcome::Failed {
                    error: format!("unknown computation unit {}", request.unit),
                },
                false,
            );
        };

        let (resolver, resolved) = oneshot::channel();
        self.shared
            .pending
            .insert(&request.unit, request.id.clone(), resolver);
        let mut guard = PendingGuard {
            table: &self.shared.pending,
            unit: &request.unit,
            id: request.id.clone(),
            removal: Removal::Cancelled,
        };

        if let Err(reason) = unit.post(request.to_unit_request()).await {
            guard.removal = Removal::Undeliverable;
            return (
                ComputationOutcome::Failed {
                    error: format!("request could not be delivered: {reason}"),
                },
                false,
            );
        }

        match tokio::time::timeout(deadline, resolved).await {
            Ok(Ok(UnitMessage::Result { data, .. })) => (ComputationOutcome::Completed { data }, false),
            Ok(Ok(UnitMessage::Error {
                error, critical, ..
            })) => (ComputationOutcome::Failed { error }, critical),
            Ok(Ok(other)) => (
                ComputationOutcome::Failed {
                    error: format!("unexpected reply {other:?}"),
                },
                false,
            ),
            Ok(Err(_)) => (
                ComputationOutcome::Failed {
                    error: "pending request cancelled".to_string(),
                },
                false,
            ),
            Err(_) => {
                guard.removal = Removal::TimedOut;
                debug!(
                    unit = %request.unit,
                    kind = %request.kind,
                    id = %request.id,
                    "computation watchdog expired"
                );
                (
                    ComputationOutcome::TimedOut {
                        after_ms: deadline.as_millis() as u64,
                    },
                    false,
                )
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Cancels anything still pending; returns how many entries were dropped.
    pub fn cancel_all(&self) -> usize {
        self.shared.pending.clear()
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.pending.stats()
    }

    /// Takes the uncorrelated critical error reported since the last call.
    pub fn take_poison(&self) -> Option<EngineError> {
        lock(&self.shared.poisoned).take()
    }
}
