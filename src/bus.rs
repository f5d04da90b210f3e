//! Synchronous publish/subscribe signal bus.
//!
//! [`EventBus`] decouples plugins: a publisher does not know who listens and a
//! subscriber does not know who publishes.
//!
//! ## Rules
//! - **Synchronous delivery**: `publish()` runs every matching handler on the
//!   calling thread before returning. A handler that blocks blocks its publisher,
//!   so handlers hand long work off to their own threads.
//! - **Snapshot semantics**: bindings are copied when `publish()` starts; a
//!   handler that (un)subscribes mid-delivery only affects later publishes.
//! - **Isolation**: a handler returning `Err` or panicking is logged and counted;
//!   the remaining handlers still run and the publisher never sees the failure.
//! - **No ordering**: nothing is promised about the order handlers of one signal
//!   run in, nor about ordering across signals published from different threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::signal::{Payload, Signal};

/// Signal handler. Returning `Err` is reported by the bus, never propagated.
pub type Handler = Arc<dyn Fn(&Signal) -> Result<()> + Send + Sync>;

/// Identifies one handler binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

impl BindingId {
    /// Raw numeric id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Restricts a binding to signals from a given sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SenderFilter {
    /// Accept any sender, including anonymous publishes.
    #[default]
    Any,
    /// Accept only this sender.
    Named(String),
}

impl SenderFilter {
    /// Filter for a named sender.
    pub fn named(sender: impl Into<String>) -> Self {
        Self::Named(sender.into())
    }

    /// Check whether a publish from `sender` passes this filter.
    pub fn matches(&self, sender: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Named(expected) => sender == Some(expected.as_str()),
        }
    }
}

#[derive(Clone)]
struct Binding {
    id: BindingId,
    handler: Handler,
    filter: SenderFilter,
}

/// Counters describing bus activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Publish calls accepted.
    pub published: u64,
    /// Handler invocations that returned `Ok`.
    pub delivered: u64,
    /// Handler invocations that returned `Err` or panicked.
    pub failed: u64,
}

/// Outcome of a single publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Handlers invoked.
    pub invoked: usize,
    /// Of those, handlers that failed.
    pub failed: usize,
}

struct BusInner {
    bindings: DashMap<String, Vec<Binding>>,
    index: DashMap<BindingId, String>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    #[cfg(feature = "metrics-prometheus")]
    metrics: parking_lot::RwLock<Option<Arc<crate::metrics::HostMetrics>>>,
}

/// Process-wide signal registry, explicitly constructed and shared by cloning.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                bindings: DashMap::new(),
                index: DashMap::new(),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                #[cfg(feature = "metrics-prometheus")]
                metrics: parking_lot::RwLock::new(None),
            }),
        }
    }

    /// Report publishes and handler failures to Prometheus.
    #[cfg(feature = "metrics-prometheus")]
    pub fn set_metrics(&self, metrics: Arc<crate::metrics::HostMetrics>) {
        *self.inner.metrics.write() = Some(metrics);
    }

    /// Bind `handler` to `signal` for senders matching `filter`.
    ///
    /// Binding the same handler (same `Arc`) to the same signal again replaces
    /// the earlier binding, so a callable is bound at most once per signal.
    pub fn subscribe(&self, signal: &str, handler: Handler, filter: SenderFilter) -> Result<BindingId> {
        validate_name(signal)?;

        let id = BindingId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entry = self.inner.bindings.entry(signal.to_string()).or_default();

        entry.retain(|b| {
            let same = Arc::ptr_eq(&b.handler, &handler);
            if same {
                self.inner.index.remove(&b.id);
                tracing::debug!(signal, binding = %b.id, "replacing existing binding");
            }
            !same
        });
        entry.push(Binding {
            id,
            handler,
            filter,
        });
        self.inner.index.insert(id, signal.to_string());
        drop(entry);

        tracing::trace!(signal, binding = %id, "handler bound");
        Ok(id)
    }

    /// Bind a closure to `signal` for any sender.
    pub fn subscribe_fn<F>(&self, signal: &str, f: F) -> Result<BindingId>
    where
        F: Fn(&Signal) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(signal, Arc::new(f), SenderFilter::Any)
    }

    /// Remove a binding. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: BindingId) -> bool {
        let Some((_, signal)) = self.inner.index.remove(&id) else {
            return false;
        };

        let mut removed = false;
        if let Some(mut list) = self.inner.bindings.get_mut(&signal) {
            let before = list.len();
            list.retain(|b| b.id != id);
            removed = list.len() != before;
        }
        self.inner.bindings.remove_if(&signal, |_, list| list.is_empty());

        tracing::trace!(signal = %signal, binding = %id, "handler unbound");
        removed
    }

    /// Deliver `signal` to every handler bound at the time of the call.
    ///
    /// Only a malformed signal name is reported as an error; handler failures
    /// are logged and counted in the returned report.
    pub fn publish(&self, signal: &str, sender: Option<&str>, payload: Payload) -> Result<DeliveryReport> {
        validate_name(signal)?;

        let snapshot: Vec<Binding> = self
            .inner
            .bindings
            .get(signal)
            .map(|list| list.value().clone())
            .unwrap_or_default();

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            signal,
            sender = sender.unwrap_or("-"),
            payload = %payload.to_json(),
            handlers = snapshot.len(),
            "publishing"
        );

        let event = Signal::new(signal, sender.map(str::to_string), payload);
        let mut report = DeliveryReport::default();

        for binding in snapshot.iter().filter(|b| b.filter.matches(sender)) {
            report.invoked += 1;
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (binding.handler)(&event)
            }));

            match outcome {
                Ok(Ok(())) => {
                    self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::error!(signal, binding = %binding.id, error = %e, "signal handler failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    tracing::error!(
                        signal,
                        binding = %binding.id,
                        panic = %panic_message(panic.as_ref()),
                        "signal handler panicked"
                    );
                }
            }
        }

        if report.failed > 0 {
            self.inner
                .failed
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = self.inner.metrics.read().as_ref() {
            metrics.record_publish(report.failed);
        }

        Ok(report)
    }

    /// Anonymous publish that logs, rather than returns, a malformed name.
    pub fn emit(&self, signal: &str, payload: Payload) {
        if let Err(e) = self.publish(signal, None, payload) {
            tracing::error!(error = %e, "publish rejected");
        }
    }

    /// Number of live bindings for `signal`.
    pub fn binding_count(&self, signal: &str) -> usize {
        self.inner.bindings.get(signal).map(|l| l.len()).unwrap_or(0)
    }

    /// Total number of live bindings.
    pub fn total_bindings(&self) -> usize {
        self.inner.index.len()
    }

    /// Activity counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("signals", &self.inner.bindings.len())
            .field("bindings", &self.inner.index.len())
            .finish()
    }
}

fn validate_name(signal: &str) -> Result<()> {
    if signal.trim().is_empty() {
        return Err(Error::InvalidSignalName(signal.to_string()));
    }
    Ok(())
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
