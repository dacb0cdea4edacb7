use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};

use crate::fingerprint::Fingerprint;
use crate::util::lock_unpoisoned;

pub(crate) type SharedOutcome<T> = Shared<BoxFuture<'static, T>>;

/// Result of [`InFlightRegistry::reserve_or_join`].
pub(crate) enum Reservation<T: Clone> {
    /// The caller's producer now backs the entry.
    Leader(SharedOutcome<T>),
    /// Another caller's outcome was already pending for this fingerprint.
    Joined(SharedOutcome<T>),
}

impl<T: Clone> Reservation<T> {
    pub(crate) fn is_joined(&self) -> bool {
        matches!(self, Self::Joined(_))
    }

    pub(crate) fn into_outcome(self) -> SharedOutcome<T> {
        match self {
            Self::Leader(outcome) | Self::Joined(outcome) => outcome,
        }
    }
}

struct Slot<T: Clone> {
    id: u64,
    outcome: WeakShared<BoxFuture<'static, T>>,
}

struct RegistryInner<T: Clone> {
    next_id: AtomicU64,
    entries: Mutex<HashMap<String, Slot<T>>>,
}

/// At most one pending outcome per fingerprint.
///
/// The registry only holds weak handles, so an entry never outlives the
/// callers awaiting it. The entry is removed by a guard owned by the pending
/// future itself: completion, failure, panic and abandonment all drop it.
pub(crate) struct InFlightRegistry<T: Clone> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> InFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(0),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn reserve_or_join<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        producer: F,
    ) -> Reservation<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut entries = lock_unpoisoned(&self.inner.entries);
        if let Some(existing) = entries
            .get(fingerprint.as_str())
            .and_then(|slot| slot.outcome.upgrade())
        {
            return Reservation::Joined(existing);
        }

        // Invoked before the guard exists: a producer that panics while
        // constructing its future leaves no entry behind.
        let pending = producer();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = RemovalGuard {
            registry: Arc::downgrade(&self.inner),
            key: fingerprint.as_str().to_owned(),
            id,
        };
        let outcome = async move {
            let _guard = guard;
            pending.await
        }
        .boxed()
        .shared();
        if let Some(weak) = outcome.downgrade() {
            entries.insert(
                fingerprint.as_str().to_owned(),
                Slot { id, outcome: weak },
            );
        }
        Reservation::Leader(outcome)
    }

    pub(crate) fn len(&self) -> usize {
        lock_unpoisoned(&self.inner.entries).len()
    }

    pub(crate) fn clear(&self) {
        lock_unpoisoned(&self.inner.entries).clear();
    }
}

struct RemovalGuard<T: Clone> {
    registry: Weak<RegistryInner<T>>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for RemovalGuard<T> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut entries = lock_unpoisoned(&registry.entries);
        if entries.get(&self.key).is_some_and(|slot| slot.id == self.id) {
            entries.remove(&self.key);
        }
    }
}
