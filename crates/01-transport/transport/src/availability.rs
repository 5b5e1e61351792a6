use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{RpcError, RpcResult};

const OFFLINE: u8 = 0;
const ONLINE: u8 = 1;
const FAULTED: u8 = 2;

/// Observable state of the native module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AvailabilityState {
    /// The module has not finished initializing.
    Offline,
    Online,
    /// A fatal fault was observed; sticky until [`Availability::clear_fault`].
    Faulted(String),
}

/// Notified once each time the module transitions into the faulted state.
pub trait FaultWatcher: Send + Sync {
    fn on_unavailable(&self, reason: &str);
}

/// Shared "native module online" flag.
///
/// Every context that talks to the module holds a clone. Issuers check it
/// before sending a call so a faulted module fails fast instead of hanging.
#[derive(Clone, Default)]
pub struct Availability {
    inner: Arc<AvailabilityInner>,
}

#[derive(Default)]
struct AvailabilityInner {
    state: AtomicU8,
    reason: Mutex<Option<String>>,
    watchers: Mutex<Vec<Weak<dyn FaultWatcher>>>,
}

impl Availability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AvailabilityState {
        match self.inner.state.load(Ordering::Acquire) {
            ONLINE => AvailabilityState::Online,
            FAULTED => AvailabilityState::Faulted(self.reason()),
            _ => AvailabilityState::Offline,
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == ONLINE
    }

    pub fn is_faulted(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FAULTED
    }

    /// Offline → Online. A faulted module stays faulted; returns whether the flag is now online.
    pub fn mark_online(&self) -> bool {
        match self.inner.state.compare_exchange(
            OFFLINE,
            ONLINE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == ONLINE,
        }
    }

    /// Moves to the faulted state and fails every watcher's outstanding work.
    ///
    /// Only the first transition notifies; later calls keep the original reason.
    pub fn mark_unavailable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.inner.reason.lock();
            if self.inner.state.load(Ordering::Acquire) == FAULTED {
                return;
            }
            *slot = Some(reason.clone());
            self.inner.state.store(FAULTED, Ordering::Release);
        }
        tracing::warn!("native module marked unavailable: {reason}");

        let watchers: Vec<Arc<dyn FaultWatcher>> = {
            let mut watchers = self.inner.watchers.lock();
            watchers.retain(|w| w.strong_count() > 0);
            watchers.iter().filter_map(Weak::upgrade).collect()
        };
        for watcher in watchers {
            watcher.on_unavailable(&reason);
        }
    }

    /// Faulted → Online, for hosts that reload the module.
    pub fn clear_fault(&self) {
        let mut slot = self.inner.reason.lock();
        if self
            .inner
            .state
            .compare_exchange(FAULTED, ONLINE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *slot = None;
            tracing::info!("native module fault cleared");
        }
    }

    /// Fails with [`RpcError::Unavailable`] unless the module is online.
    pub fn check(&self) -> RpcResult<()> {
        match self.state() {
            AvailabilityState::Online => Ok(()),
            AvailabilityState::Offline => Err(RpcError::Unavailable(
                "native module is not initialized".to_owned(),
            )),
            AvailabilityState::Faulted(reason) => Err(RpcError::Unavailable(reason)),
        }
    }

    pub fn watch(&self, watcher: Weak<dyn FaultWatcher>) {
        self.inner.watchers.lock().push(watcher);
    }

    fn reason(&self) -> String {
        self.inner
            .reason
            .lock()
            .clone()
            .unwrap_or_else(|| "native module faulted".to_owned())
    }
}

impl fmt::Debug for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Availability").field(&self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingWatcher {
        hits: AtomicUsize,
    }

    impl FaultWatcher for CountingWatcher {
        fn on_unavailable(&self, _reason: &str) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn starts_offline_and_rejects_checks() {
        let availability = Availability::new();
        assert_eq!(availability.state(), AvailabilityState::Offline);
        assert!(matches!(availability.check(), Err(RpcError::Unavailable(_))));
        assert!(availability.mark_online());
        assert!(availability.check().is_ok());
    }

    #[test]
    fn fault_is_sticky_until_cleared() {
        let availability = Availability::new();
        availability.mark_online();
        availability.mark_unavailable("module panicked");
        availability.mark_unavailable("second reason is ignored");

        assert_eq!(
            availability.state(),
            AvailabilityState::Faulted("module panicked".into())
        );
        assert!(!availability.mark_online());
        assert_eq!(
            availability.check(),
            Err(RpcError::Unavailable("module panicked".into()))
        );

        availability.clear_fault();
        assert!(availability.is_online());
    }

    #[test]
    fn watchers_are_notified_once_per_fault() {
        let availability = Availability::new();
        let watcher = Arc::new(CountingWatcher::default());
        let weak: Weak<dyn FaultWatcher> = Arc::downgrade(&watcher) as Weak<dyn FaultWatcher>;
        availability.watch(weak);

        availability.mark_online();
        availability.mark_unavailable("boom");
        availability.mark_unavailable("boom again");
        assert_eq!(watcher.hits.load(Ordering::SeqCst), 1);

        availability.clear_fault();
        availability.mark_unavailable("boom later");
        assert_eq!(watcher.hits.load(Ordering::SeqCst), 2);
    }
}
